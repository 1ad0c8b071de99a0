//! Streaming AES-256-CTR encryption
//!
//! Blobs are stored as `IV (16 bytes) || ciphertext`, where the ciphertext is
//! AES-256 in counter mode with the counter initialized from the IV as a
//! 128-bit big-endian integer. There is no authentication tag; integrity is
//! checked out of band through the integrity tag recorded at backup time.
//!
//! - [`EncryptReader`] wraps a plaintext source and reads out the IV followed
//!   by ciphertext. It supports exactly the two seeks chunked upload clients
//!   need: rewind to 0, and seek to the end to learn the total length.
//! - [`DecryptWriter`] accepts `IV || ciphertext` in writes of any size and
//!   forwards plaintext to the wrapped sink.
//!
//! Keys are 32 bytes, given as 64 hex characters or as a file holding them,
//! and can be derived from a password with PBKDF2-HMAC-SHA256.

use crate::checksum::sha1_hex;
use crate::error::{FilesonError, Result};
use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use sha2::Sha256;
use std::fmt;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Key length in bytes
pub const KEY_LEN: usize = 32;

/// IV length in bytes
pub const IV_LEN: usize = 16;

/// Default PBKDF2 iteration count for [`CryptoKey::derive`]
pub const DEFAULT_ITERATIONS: u32 = 1_000_000;

/// A 256-bit encryption key
#[derive(Clone, PartialEq, Eq)]
pub struct CryptoKey([u8; KEY_LEN]);

impl fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CryptoKey({})", self.hash())
    }
}

impl CryptoKey {
    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse 64 hex characters
    ///
    /// # Errors
    ///
    /// - [`FilesonError::InvalidKey`] if the input is not 32 hex-encoded bytes
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| FilesonError::InvalidKey(format!("not hex: {}", e)))?;
        let bytes: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| FilesonError::InvalidKey(format!("expected {} bytes, got {}", KEY_LEN, v.len())))?;
        Ok(Self(bytes))
    }

    /// Parse a key given either as hex or as the path of a key file
    ///
    /// Whitespace in a key file is ignored.
    pub fn from_hex_or_file(value: &str) -> Result<Self> {
        let path = Path::new(value);
        if path.is_file() {
            let contents = fs::read_to_string(path)?;
            let compact: String = contents.chars().filter(|c| !c.is_whitespace()).collect();
            Self::from_hex(&compact)
        } else {
            Self::from_hex(value)
        }
    }

    /// Random key
    pub fn generate() -> Self {
        Self(rand::random())
    }

    /// PBKDF2-HMAC-SHA256 key derivation
    pub fn derive(password: &str, salt: &str, iterations: u32) -> Self {
        let mut key = [0u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt.as_bytes(), iterations, &mut key);
        Self(key)
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Hex form of the key
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// SHA-1 of the key bytes, recorded in backup logs to catch wrong keys
    pub fn hash(&self) -> String {
        sha1_hex(self.0)
    }

    fn cipher(&self, iv: &[u8; IV_LEN]) -> Aes256Ctr {
        Aes256Ctr::new(&self.0.into(), &(*iv).into())
    }
}

/// Parse a 32-character hex IV
pub fn parse_iv(hex_iv: &str) -> Result<[u8; IV_LEN]> {
    let bytes = hex::decode(hex_iv)?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| FilesonError::InvalidKey(format!("IV must be {} bytes, got {}", IV_LEN, v.len())))
}

/// Random IV
pub fn random_iv() -> [u8; IV_LEN] {
    rand::random()
}

fn unsupported_seek(pos: SeekFrom, current: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        FilesonError::UnsupportedSeek(format!("{:?} at position {}", pos, current)),
    )
}

/// Plaintext source read out as `IV || ciphertext`
pub struct EncryptReader<R> {
    inner: R,
    key: CryptoKey,
    iv: [u8; IV_LEN],
    cipher: Aes256Ctr,
    pos: u64,
}

impl<R: Read> EncryptReader<R> {
    /// Wrap `inner`, generating a random IV when none is given
    pub fn new(inner: R, key: &CryptoKey, iv: Option<[u8; IV_LEN]>) -> Self {
        let iv = iv.unwrap_or_else(random_iv);
        Self {
            inner,
            key: key.clone(),
            iv,
            cipher: key.cipher(&iv),
            pos: 0,
        }
    }

    /// IV written at the head of the stream
    pub fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }

    /// Logical position in the `IV || ciphertext` stream
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Unwrap the plaintext source
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for EncryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut served = 0;
        if self.pos < IV_LEN as u64 {
            let start = self.pos as usize;
            let take = (IV_LEN - start).min(buf.len());
            buf[..take].copy_from_slice(&self.iv[start..start + take]);
            self.pos += take as u64;
            served = take;
            if served == buf.len() {
                return Ok(served);
            }
        }

        let n = self.inner.read(&mut buf[served..])?;
        self.cipher.apply_keystream(&mut buf[served..served + n]);
        self.pos += n as u64;
        Ok(served + n)
    }
}

impl<R: Read + Seek> Seek for EncryptReader<R> {
    /// Supports `Start(0)`, `End(0)`, and the no-op `Start(current)` / `Current(0)`
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match pos {
            SeekFrom::Start(0) => {
                self.inner.seek(SeekFrom::Start(0))?;
                self.cipher = self.key.cipher(&self.iv);
                self.pos = 0;
                Ok(0)
            }
            SeekFrom::Start(p) if p == self.pos => Ok(self.pos),
            SeekFrom::Current(0) => Ok(self.pos),
            SeekFrom::End(0) => {
                let len = self.inner.seek(SeekFrom::End(0))?;
                self.pos = IV_LEN as u64 + len;
                Ok(self.pos)
            }
            other => Err(unsupported_seek(other, self.pos)),
        }
    }
}

/// Sink that accepts `IV || ciphertext` and writes plaintext
pub struct DecryptWriter<W> {
    inner: W,
    key: CryptoKey,
    iv: [u8; IV_LEN],
    cipher: Option<Aes256Ctr>,
    pos: u64,
    scratch: Vec<u8>,
}

impl<W: Write> DecryptWriter<W> {
    /// Wrap a plaintext sink
    pub fn new(inner: W, key: &CryptoKey) -> Self {
        Self {
            inner,
            key: key.clone(),
            iv: [0u8; IV_LEN],
            cipher: None,
            pos: 0,
            scratch: Vec::new(),
        }
    }

    /// Bytes of `IV || ciphertext` accepted so far
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Flush and return the plaintext sink
    ///
    /// # Errors
    ///
    /// - [`FilesonError::Io`] (`UnexpectedEof`) if the stream ended inside the IV
    pub fn finish(mut self) -> Result<W> {
        if self.cipher.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("encrypted stream ended after {} bytes, inside the IV", self.pos),
            )
            .into());
        }
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for DecryptWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let total = data.len();
        let mut data = data;

        if self.cipher.is_none() {
            let start = self.pos as usize;
            let take = (IV_LEN - start).min(data.len());
            self.iv[start..start + take].copy_from_slice(&data[..take]);
            self.pos += take as u64;
            data = &data[take..];
            if self.pos == IV_LEN as u64 {
                self.cipher = Some(self.key.cipher(&self.iv));
            }
        }

        if let Some(cipher) = self.cipher.as_mut() {
            if !data.is_empty() {
                self.scratch.clear();
                self.scratch.extend_from_slice(data);
                cipher.apply_keystream(&mut self.scratch);
                self.inner.write_all(&self.scratch)?;
                self.pos += data.len() as u64;
            }
        }

        Ok(total)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Encrypt a whole source into a sink, returning the ciphertext length including the IV
pub fn encrypt_stream<R: Read, W: Write>(
    source: R,
    sink: &mut W,
    key: &CryptoKey,
    iv: Option<[u8; IV_LEN]>,
) -> Result<u64> {
    let mut reader = EncryptReader::new(source, key, iv);
    Ok(io::copy(&mut reader, sink)?)
}

/// Decrypt an `IV || ciphertext` source into a sink, returning the sink
pub fn decrypt_stream<R: Read, W: Write>(mut source: R, sink: W, key: &CryptoKey) -> Result<W> {
    let mut writer = DecryptWriter::new(sink, key);
    io::copy(&mut source, &mut writer)?;
    writer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn key() -> CryptoKey {
        CryptoKey::from_bytes([7u8; KEY_LEN])
    }

    #[test]
    fn test_known_ciphertext() {
        // AES-256-CTR with an all-zero key and IV; first keystream block of NIST AES-256(0)
        let zero = CryptoKey::from_bytes([0u8; KEY_LEN]);
        let mut out = Vec::new();
        encrypt_stream(&[0u8; 16][..], &mut out, &zero, Some([0u8; IV_LEN])).unwrap();

        assert_eq!(&out[..IV_LEN], &[0u8; IV_LEN]);
        assert_eq!(hex::encode(&out[IV_LEN..]), "dc95c078a2408989ad48a21492842087");
    }

    #[test]
    fn test_round_trip_with_odd_chunks() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i * 31 % 251) as u8).collect();
        let mut reader = EncryptReader::new(Cursor::new(data.clone()), &key(), None);
        let mut writer = DecryptWriter::new(Vec::new(), &key());

        let mut buf = [0u8; 7];
        loop {
            let n = reader.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            // Feed the writer in pieces that straddle the IV boundary
            for piece in buf[..n].chunks(3) {
                writer.write_all(piece).unwrap();
            }
        }

        assert_eq!(writer.finish().unwrap(), data);
    }

    #[test]
    fn test_seek_patterns() {
        let data = vec![1u8; 1000];
        let mut reader = EncryptReader::new(Cursor::new(data), &key(), Some([3u8; IV_LEN]));

        let mut first = Vec::new();
        reader.read_to_end(&mut first).unwrap();
        assert_eq!(first.len(), 1016);

        assert_eq!(reader.seek(SeekFrom::Start(0)).unwrap(), 0);
        let mut second = Vec::new();
        reader.read_to_end(&mut second).unwrap();
        assert_eq!(first, second);

        assert_eq!(reader.seek(SeekFrom::Start(0)).unwrap(), 0);
        assert_eq!(reader.seek(SeekFrom::End(0)).unwrap(), 1016);
        assert_eq!(reader.stream_position().unwrap(), 1016);

        let err = reader.seek(SeekFrom::Start(5)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
        assert!(reader.seek(SeekFrom::End(-4)).is_err());
    }

    #[test]
    fn test_truncated_stream_is_an_error() {
        let mut writer = DecryptWriter::new(Vec::new(), &key());
        writer.write_all(&[0u8; 10]).unwrap();
        assert!(writer.finish().is_err());
    }

    #[test]
    fn test_key_parsing() {
        let hex_key = "00".repeat(31) + "ff";
        let parsed = CryptoKey::from_hex(&hex_key).unwrap();
        assert_eq!(parsed.as_bytes()[31], 0xff);
        assert_eq!(parsed.to_hex(), hex_key);
        assert!(CryptoKey::from_hex("abcd").is_err());
        assert!(CryptoKey::from_hex("zz").is_err());

        let temp_dir = tempfile::TempDir::new().unwrap();
        let key_file = temp_dir.path().join("backup.key");
        fs::write(&key_file, format!("{}\n{}\n", &hex_key[..32], &hex_key[32..])).unwrap();
        assert_eq!(CryptoKey::from_hex_or_file(&key_file.display().to_string()).unwrap(), parsed);
    }

    #[test]
    fn test_derive_is_deterministic() {
        let a = CryptoKey::derive("password", "salt", 1000);
        let b = CryptoKey::derive("password", "salt", 1000);
        let c = CryptoKey::derive("password", "pepper", 1000);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.hash().len(), 40);
    }

    #[test]
    fn test_parse_iv() {
        assert_eq!(parse_iv(&"ab".repeat(16)).unwrap(), [0xab; IV_LEN]);
        assert!(parse_iv("abab").is_err());
    }
}
