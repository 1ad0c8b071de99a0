//! Multipart-compatible integrity tags
//!
//! Object stores report an ETag for every object. For single-part uploads it
//! is the MD5 of the content; for multipart uploads it is the MD5 of the
//! concatenated per-part MD5 digests followed by `-<parts>`. Computing the same
//! tag locally over the exact bytes sent (ciphertext when encrypting) lets a
//! backup be verified against a destination listing without downloading it.
//!
//! ```rust
//! use fileson::integrity::IntegrityTag;
//!
//! let tag = IntegrityTag::new(4).compute(&b"abcdefghij"[..]).unwrap();
//! assert!(tag.ends_with("-3"));
//! ```

use std::io::{self, Read, Write};

/// Part size used by common S3 clients
pub const DEFAULT_PART_SIZE: u64 = 8 * 1024 * 1024;

const MIB: u64 = 1024 * 1024;

/// Integrity tag calculator with a fixed part size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegrityTag {
    part_size: u64,
}

impl Default for IntegrityTag {
    fn default() -> Self {
        Self::new(DEFAULT_PART_SIZE)
    }
}

impl IntegrityTag {
    /// Calculator splitting streams into `part_size`-byte parts
    pub fn new(part_size: u64) -> Self {
        Self {
            part_size: part_size.max(1),
        }
    }

    /// Interpret a command-line part size: values below 65536 are MiB
    pub fn from_arg(part_size: u64) -> Self {
        if part_size < 1 << 16 {
            Self::new(part_size * MIB)
        } else {
            Self::new(part_size)
        }
    }

    /// Configured part size in bytes
    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    /// Streaming calculator
    pub fn writer(&self) -> EtagWriter {
        EtagWriter::new(self.part_size)
    }

    /// Tag of everything `reader` yields
    pub fn compute<R: Read>(&self, mut reader: R) -> io::Result<String> {
        let mut writer = self.writer();
        io::copy(&mut reader, &mut writer)?;
        Ok(writer.finish())
    }
}

/// Compare a locally computed tag with one reported by a store
///
/// Stores commonly wrap ETags in double quotes.
pub fn tags_match(local: &str, reported: &str) -> bool {
    local.trim_matches('"').eq_ignore_ascii_case(reported.trim_matches('"'))
}

/// `Write` sink accumulating an integrity tag
pub struct EtagWriter {
    part_size: u64,
    current: md5::Context,
    in_part: u64,
    digests: Vec<[u8; 16]>,
    total: u64,
}

impl EtagWriter {
    fn new(part_size: u64) -> Self {
        Self {
            part_size,
            current: md5::Context::new(),
            in_part: 0,
            digests: Vec::new(),
            total: 0,
        }
    }

    /// Bytes consumed so far
    pub fn total(&self) -> u64 {
        self.total
    }

    fn close_part(&mut self) {
        let part = std::mem::replace(&mut self.current, md5::Context::new());
        self.digests.push(part.compute().0);
        self.in_part = 0;
    }

    /// Finish and return the tag
    ///
    /// An empty stream is one empty part, whose tag is the MD5 of nothing.
    pub fn finish(mut self) -> String {
        if self.in_part > 0 || self.digests.is_empty() {
            self.close_part();
        }

        if self.digests.len() == 1 {
            return hex::encode(self.digests[0]);
        }

        let concatenated: Vec<u8> = self.digests.concat();
        format!("{:x}-{}", md5::compute(concatenated), self.digests.len())
    }
}

impl Write for EtagWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rest = buf;
        while !rest.is_empty() {
            let room = (self.part_size - self.in_part) as usize;
            let take = room.min(rest.len());
            self.current.consume(&rest[..take]);
            self.in_part += take as u64;
            rest = &rest[take..];
            if self.in_part == self.part_size {
                self.close_part();
            }
        }
        self.total += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_part_is_plain_md5() {
        let data = b"The quick brown fox jumps over the lazy dog";
        let tag = IntegrityTag::default().compute(&data[..]).unwrap();
        assert_eq!(tag, "9e107d9d372bb6826bd81d3542a419d6");
    }

    #[test]
    fn test_empty_stream() {
        let tag = IntegrityTag::default().compute(&b""[..]).unwrap();
        assert_eq!(tag, "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn test_exact_part_size_is_single_part() {
        let data = vec![5u8; 1024];
        let tag = IntegrityTag::new(1024).compute(&data[..]).unwrap();
        assert_eq!(tag, format!("{:x}", md5::compute(&data)));
    }

    #[test]
    fn test_multipart_tag() {
        let data: Vec<u8> = (0..2500u32).map(|i| i as u8).collect();
        let tagger = IntegrityTag::new(1000);

        let tag = tagger.compute(&data[..]).unwrap();
        let mut expected = Vec::new();
        for part in data.chunks(1000) {
            expected.extend_from_slice(&md5::compute(part).0);
        }
        assert_eq!(tag, format!("{:x}-3", md5::compute(expected)));
        assert_ne!(tag, format!("{:x}", md5::compute(&data)));
        assert_eq!(tagger.compute(&data[..]).unwrap(), tag);
    }

    #[test]
    fn test_write_boundaries_do_not_matter() {
        let data = vec![9u8; 5000];
        let tagger = IntegrityTag::new(777);

        let mut writer = tagger.writer();
        for chunk in data.chunks(13) {
            writer.write_all(chunk).unwrap();
        }
        assert_eq!(writer.total(), 5000);
        assert_eq!(writer.finish(), tagger.compute(&data[..]).unwrap());
    }

    #[test]
    fn test_from_arg_and_matching() {
        assert_eq!(IntegrityTag::from_arg(8).part_size(), DEFAULT_PART_SIZE);
        assert_eq!(IntegrityTag::from_arg(100_000).part_size(), 100_000);
        assert!(tags_match("abc-2", "\"ABC-2\""));
        assert!(!tags_match("abc-2", "abc-3"));
    }
}
