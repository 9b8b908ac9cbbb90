//! Shutdown journal round-trip and rejection tests.

use crate::harness::*;
use pathdb::{Config, Layer, PathDbError};
use pathdb_storage::{schema, ColumnFamily, KeyValueStore};
use tempfile::TempDir;

// ============================================================================
// Round-trips
// ============================================================================

/// Journal and reopen: the rehydrated tree matches the journaled one
/// layer for layer, and rollback keeps working against it.
#[test]
fn test_journal_roundtrip() {
    let mut env = TestEnv::new(4, 0);
    env.apply_transitions(12);
    let disk = env.disk_index();
    assert_eq!(disk, 8);

    env.db.journal(env.head_root()).unwrap();

    // The database is read-only once journaled.
    assert!(matches!(
        env.db.commit(env.head_root(), false),
        Err(PathDbError::ReadOnly)
    ));

    env.reopen();
    assert_eq!(env.db.tree().len(), 5);
    let bottom = env.db.tree().bottom();
    assert_eq!(bottom.root(), env.roots[8]);
    assert_eq!(bottom.state_id(), 8);
    assert_eq!(bottom.buffer_layers(), 8);

    for i in 8..=12 {
        let layer = env.db.tree().get(env.roots[i]).expect("layer missing");
        assert_eq!(layer.state_id(), i as u64);
        if let Layer::Diff(layer) = &layer {
            assert_eq!(layer.block(), i as u64);
        }
        env.check_state(i);
    }
    for i in 0..8 {
        assert!(matches!(
            env.db.reader(env.roots[i]),
            Err(PathDbError::UnknownRoot(_))
        ));
    }

    // The journal is consumed: a second reopen starts from the bare
    // persistent state.
    env.reopen();
    assert_eq!(env.db.tree().len(), 1);
}

/// The diff chain above the disk layer keeps working after reopen,
/// including rollback through the rehydrated buffer.
#[test]
fn test_journal_roundtrip_then_recover() {
    let mut env = TestEnv::new(4, 0);
    env.apply_transitions(12);

    env.db.journal(env.head_root()).unwrap();
    env.reopen();

    env.db.recover(env.roots[7]).unwrap();
    assert_eq!(env.db.tree().bottom().root(), env.roots[7]);
    env.check_state(7);
    assert_eq!(env.db.history_range(), Some((1, 7)));
}

/// Journaling into an external directory writes the journal file
/// atomically and loads it back on reopen.
#[test]
fn test_journal_file_roundtrip() {
    let journal_dir = TempDir::new().unwrap();
    let mut env = TestEnv::with_config(Config {
        max_diff_layers: 4,
        state_history: 0,
        journal_directory: Some(journal_dir.path().to_path_buf()),
        ..Config::default()
    });
    env.apply_transitions(6);

    env.db.journal(env.head_root()).unwrap();
    assert!(journal_dir.path().join("state.journal").exists());
    // Nothing leaked into the key-value store.
    assert_eq!(
        env.store
            .get(ColumnFamily::Metadata, schema::TRIE_JOURNAL_KEY)
            .unwrap(),
        None
    );

    env.reopen();
    assert_eq!(env.db.tree().len(), 5);
    assert_eq!(env.db.tree().bottom().state_id(), 2);
    env.check_state(6);
    // Consumed on load.
    assert!(!journal_dir.path().join("state.journal").exists());
}

// ============================================================================
// Rejection paths
// ============================================================================

/// A corrupted journal is detected and discarded; the reopened
/// database exposes only the persisted disk layer.
#[test]
fn test_corrupted_journal_discarded() {
    let mut env = TestEnv::new(128, 0);
    env.apply_transitions(6);
    env.db.commit(env.roots[6], false).unwrap();
    env.db.tree().bottom().wait_flush().unwrap();
    env.apply_transitions(2);

    env.db.journal(env.head_root()).unwrap();

    // Chop the tail off the journal blob.
    let mut blob = env
        .store
        .get(ColumnFamily::Metadata, schema::TRIE_JOURNAL_KEY)
        .unwrap()
        .expect("journal missing");
    blob.truncate(blob.len() - 10);
    env.store
        .put(ColumnFamily::Metadata, schema::TRIE_JOURNAL_KEY, &blob)
        .unwrap();

    env.reopen();
    assert_eq!(env.db.tree().len(), 1);
    let bottom = env.db.tree().bottom();
    assert_eq!(bottom.root(), env.roots[6]);
    assert_eq!(bottom.state_id(), 6);
    env.check_state(6);

    // Histories above the persisted state were repaired away.
    assert_eq!(env.db.history_range(), Some((1, 6)));
}

/// A journal taken against different persistent state is rejected.
#[test]
fn test_unmatched_journal_discarded() {
    let mut env = TestEnv::new(4, 0);
    env.apply_transitions(12);
    env.db.journal(env.head_root()).unwrap();

    // Move the persistent trie root from underneath the journal.
    env.store
        .put(ColumnFamily::AccountTrie, &[], b"tampered root node")
        .unwrap();

    env.reopen();
    assert_eq!(env.db.tree().len(), 1);
    assert_eq!(
        env.db.tree().bottom().root(),
        pathdb::Hash::keccak256(b"tampered root node")
    );
}

/// Without any journal the database starts from the persistent state.
#[test]
fn test_missing_journal_fresh_start() {
    let mut env = TestEnv::new(4, 0);
    assert_eq!(env.db.tree().len(), 1);
    assert_eq!(env.db.tree().bottom().root(), pathdb::EMPTY_ROOT);

    env.reopen();
    assert_eq!(env.db.tree().len(), 1);
}
