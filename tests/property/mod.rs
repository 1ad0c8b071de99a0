//! Property-based tests
//!
//! Uses proptest to check the log replay laws and the crypto stream against
//! randomly generated inputs.

use ::fileson::crypto::{decrypt_stream, encrypt_stream, IV_LEN};
use ::fileson::*;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::io::Cursor;

/// A log operation over a small key space
#[derive(Debug, Clone)]
pub enum LogOperation {
    Set(String, u32),
    Delete(String),
}

fn key_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-d]",
        "[a-d]/[a-d]",
        Just(":scan:".to_string()),
    ]
}

fn operation_strategy() -> impl Strategy<Value = LogOperation> {
    prop_oneof![
        3 => (key_strategy(), 0u32..4).prop_map(|(k, v)| LogOperation::Set(k, v)),
        1 => key_strategy().prop_map(LogOperation::Delete),
    ]
}

fn apply(log: &mut VersionedLog<u32>, model: &mut BTreeMap<String, u32>, op: &LogOperation) -> bool {
    match op {
        LogOperation::Set(key, value) => {
            model.insert(key.clone(), *value);
            log.set(key.clone(), *value).unwrap()
        }
        LogOperation::Delete(key) => {
            model.remove(key);
            log.delete(key).unwrap()
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_log_matches_map_model(ops in prop::collection::vec(operation_strategy(), 0..60)) {
        let mut log = VersionedLog::new();
        let mut model = BTreeMap::new();
        for op in &ops {
            apply(&mut log, &mut model, op);
        }

        let state: BTreeMap<String, u32> = log.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        prop_assert_eq!(&state, &model);

        // Replaying the recorded sequence gives the same mapping
        let replayed = VersionedLog::from_records(log.records().iter().cloned());
        prop_assert_eq!(replayed.records(), log.records());
        let replayed_state: BTreeMap<String, u32> = replayed.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        prop_assert_eq!(replayed_state, model);
    }

    #[test]
    fn prop_redundant_mutations_append_nothing(ops in prop::collection::vec(operation_strategy(), 1..40)) {
        let mut log = VersionedLog::new();
        let mut model = BTreeMap::new();
        for op in &ops {
            let before = log.records().len();
            let appended = apply(&mut log, &mut model, op);
            prop_assert_eq!(log.records().len(), before + usize::from(appended));
        }

        // Repeating the final state is a no-op
        let snapshot: Vec<(String, u32)> = log.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        let len = log.records().len();
        for (key, value) in snapshot {
            prop_assert!(!log.set(key, value).unwrap());
        }
        prop_assert!(!log.delete("zz-never-set").unwrap());
        prop_assert_eq!(log.records().len(), len);
    }

    #[test]
    fn prop_text_round_trip(ops in prop::collection::vec(operation_strategy(), 0..40)) {
        let mut log = VersionedLog::new();
        let mut model = BTreeMap::new();
        for op in &ops {
            apply(&mut log, &mut model, op);
        }

        let bytes = log.to_bytes().unwrap();
        prop_assert_eq!(bytes.iter().filter(|&&b| b == b'\n').count(), log.records().len());
        let parsed: VersionedLog<u32> =
            VersionedLog::read_from(Cursor::new(bytes), std::path::Path::new("memory")).unwrap();
        prop_assert_eq!(parsed.records(), log.records());
    }

    #[test]
    fn prop_slice_replays_prefix(
        before in prop::collection::vec(operation_strategy(), 0..20),
        after in prop::collection::vec(operation_strategy(), 0..20),
    ) {
        let mut log = VersionedLog::new();
        let mut model = BTreeMap::new();
        for op in &before {
            apply(&mut log, &mut model, op);
        }
        let prefix = log.records().len();
        let marker = Record::set("~marker~", 7);
        log.set("~marker~", 7).unwrap();
        for op in &after {
            apply(&mut log, &mut model, op);
        }

        let head = log.slice(None, Some(&marker)).unwrap();
        prop_assert_eq!(head.records(), &log.records()[..prefix]);

        let tail = log.slice(Some(&marker), None).unwrap();
        prop_assert_eq!(tail.records(), &log.records()[prefix..]);
        prop_assert_eq!(tail.get("~marker~"), Some(&7));
    }

    #[test]
    fn prop_crypto_round_trip(data in prop::collection::vec(any::<u8>(), 0..9000), seed in any::<[u8; 32]>()) {
        let key = CryptoKey::from_bytes(seed);
        let mut sealed = Vec::new();
        let written = encrypt_stream(Cursor::new(&data), &mut sealed, &key, None).unwrap();
        prop_assert_eq!(written as usize, data.len() + IV_LEN);
        prop_assert_eq!(sealed.len(), data.len() + IV_LEN);

        let opened = decrypt_stream(Cursor::new(&sealed), Vec::new(), &key).unwrap();
        prop_assert_eq!(opened, data);
    }

    #[test]
    fn prop_etag_is_chunking_independent(
        data in prop::collection::vec(any::<u8>(), 0..5000),
        split in 1usize..700,
    ) {
        let tagger = IntegrityTag::new(1024);
        let whole = tagger.compute(Cursor::new(&data)).unwrap();

        let mut writer = tagger.writer();
        for chunk in data.chunks(split) {
            std::io::Write::write_all(&mut writer, chunk).unwrap();
        }
        prop_assert_eq!(writer.finish(), whole);
    }
}

/// Boundary lengths around the AES block and the streaming buffer
#[test]
fn test_crypto_boundary_lengths() {
    let key = CryptoKey::generate();
    for len in [0usize, 1, 15, 16, 17, 4095, 4096, 4097, 10_000_000] {
        let data: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
        let mut sealed = Vec::new();
        encrypt_stream(Cursor::new(&data), &mut sealed, &key, None).unwrap();
        assert_eq!(sealed.len(), len + IV_LEN);

        let opened = decrypt_stream(Cursor::new(&sealed), Vec::new(), &key).unwrap();
        assert!(opened == data, "round trip failed for length {}", len);
    }
}
