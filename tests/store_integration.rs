//! Integration tests for the persistent log
//!
//! Random put/delete sequences are checked against an in-memory model, both
//! while the log is open and after reopening it from disk.

use proptest::prelude::*;
use slyshare::store::{PersistentLog, VacuumPolicy};
use std::collections::HashMap;
use tempfile::TempDir;

#[derive(Debug, Clone)]
enum Op {
    Put(u8, String),
    Delete(u8),
    Resave(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u8..8, "[a-z]{0,12}").prop_map(|(k, v)| Op::Put(k, v)),
        1 => (0u8..8).prop_map(Op::Delete),
        1 => (0u8..8).prop_map(Op::Resave),
    ]
}

fn small_policy() -> VacuumPolicy {
    VacuumPolicy {
        min_entries: 6,
        bloat_ratio: 2,
        sync_writes: false,
    }
}

fn snapshot(log: &PersistentLog<u8, String>) -> HashMap<u8, String> {
    log.iter().map(|(k, v)| (*k, v.clone())).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn reopened_log_matches_model(ops in prop::collection::vec(op_strategy(), 0..60)) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("prop.log");
        let mut model: HashMap<u8, String> = HashMap::new();

        {
            let mut log: PersistentLog<u8, String> = PersistentLog::open_with(&path, small_policy()).unwrap();
            for op in &ops {
                match op {
                    Op::Put(k, v) => {
                        log.put(*k, v.clone()).unwrap();
                        model.insert(*k, v.clone());
                    }
                    Op::Delete(k) => {
                        let removed = log.delete(k).unwrap();
                        prop_assert_eq!(removed, model.remove(k));
                    }
                    Op::Resave(k) => {
                        let saved = log.resave(k).unwrap();
                        prop_assert_eq!(saved, model.contains_key(k));
                    }
                }
                prop_assert_eq!(log.len(), model.len());
            }
            prop_assert_eq!(snapshot(&log), model.clone());
            log.close().unwrap();
        }

        let reopened: PersistentLog<u8, String> = PersistentLog::open_with(&path, small_policy()).unwrap();
        prop_assert_eq!(snapshot(&reopened), model);
    }
}

#[test]
fn test_vacuum_then_reopen_preserves_contents() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("vacuum.log");

    let mut log: PersistentLog<String, u64> = PersistentLog::open(&path).unwrap();
    for round in 0..50u64 {
        for key in ["a", "b", "c"] {
            log.put(key.to_string(), round).unwrap();
        }
    }
    log.delete("b").unwrap();
    let before = std::fs::metadata(&path).unwrap().len();

    log.vacuum().unwrap();
    assert_eq!(log.entry_count(), 2);
    assert!(std::fs::metadata(&path).unwrap().len() < before);

    // Writes after the swap land in the compacted file.
    log.put("d".to_string(), 7).unwrap();
    drop(log);

    let reopened: PersistentLog<String, u64> = PersistentLog::open(&path).unwrap();
    assert_eq!(reopened.get("a"), Some(&49));
    assert_eq!(reopened.get("c"), Some(&49));
    assert_eq!(reopened.get("d"), Some(&7));
    assert!(!reopened.contains_key("b"));
    assert!(!temp_dir.path().join("vacuum.log.vacuum").exists());
}
