//! Layer tree growth, flattening, flushing and lifecycle tests.

use crate::harness::*;
use pathdb::{Config, Hash, Layer, PathDbError, EMPTY_ROOT};
use pathdb_storage::{schema, ColumnFamily, KeyValueStore};

// ============================================================================
// Update and cap behavior
// ============================================================================

/// With a deep allowance, updates accumulate purely in memory.
#[test]
fn test_updates_stay_in_memory_without_cap() {
    let mut env = TestEnv::new(128, 0);
    env.apply_transitions(32);

    assert_eq!(env.db.tree().len(), 33);
    assert_eq!(env.db.tree().bottom().state_id(), 0);
    assert_eq!(env.db.tree().bottom().root(), EMPTY_ROOT);
    assert_eq!(env.head_root(), env.roots[32]);
    assert_eq!(env.db.history_range(), None);
}

/// Exceeding the depth allowance flattens bottom diffs into disk and
/// records one history entry per flattened transition.
#[test]
fn test_cap_flattens_to_depth() {
    let mut env = TestEnv::new(4, 0);
    env.apply_transitions(32);

    assert_eq!(env.db.tree().bottom().state_id(), 28);
    assert_eq!(env.db.tree().bottom().root(), env.roots[28]);
    assert_eq!(env.db.tree().len(), 5);
    assert_eq!(env.db.history_range(), Some((1, 28)));

    // Exactly the four newest diffs survive.
    for i in 29..=32 {
        assert!(env.db.tree().get(env.roots[i]).is_some(), "diff {i} missing");
    }
    for i in 1..28 {
        assert!(env.db.tree().get(env.roots[i]).is_none(), "diff {i} kept");
    }
}

/// A new diff is linked under its parent with a consecutive state id.
#[test]
fn test_update_links_parent() {
    let mut env = TestEnv::new(128, 0);
    env.apply_transitions(3);

    let layer = env.db.tree().get(env.roots[3]).expect("head missing");
    assert_eq!(layer.state_id(), 3);
    match &layer {
        Layer::Diff(diff) => assert_eq!(diff.parent().root(), env.roots[2]),
        Layer::Disk(_) => panic!("head should be a diff layer"),
    }
}

/// Reads through any reachable root reflect the layer stack at that
/// version, newest layer winning.
#[test]
fn test_reads_through_stack() {
    let mut env = TestEnv::new(4, 0);
    env.apply_transitions(12);

    let disk = env.disk_index();
    for i in disk..=12 {
        env.check_state(i);
    }
}

#[test]
fn test_update_rejects_unknown_parent_and_cycle() {
    let env = TestEnv::new(128, 0);

    let orphan = Hash([0xaa; 32]);
    let missing = Hash([0xbb; 32]);
    let result = env.db.update(
        orphan,
        missing,
        1,
        pathdb::NodeSet::new(),
        pathdb::StateSetWithOrigin::default(),
    );
    assert!(matches!(result, Err(PathDbError::UnknownRoot(root)) if root == missing));

    let result = env.db.update(
        EMPTY_ROOT,
        EMPTY_ROOT,
        1,
        pathdb::NodeSet::new(),
        pathdb::StateSetWithOrigin::default(),
    );
    assert!(matches!(result, Err(PathDbError::Cycle(_))));
}

// ============================================================================
// Commit
// ============================================================================

/// Commit flattens the whole chain, leaving a single disk layer whose
/// flush settles with matching persistent metadata.
#[test]
fn test_commit_flattens_all() {
    let mut env = TestEnv::new(128, 0);
    env.apply_transitions(8);
    let head = env.head_root();

    env.db.commit(head, true).unwrap();
    assert_eq!(env.db.tree().len(), 1);
    assert_eq!(env.db.tree().bottom().root(), head);
    assert_eq!(env.db.tree().bottom().state_id(), 8);
    assert_eq!(env.db.history_range(), Some((1, 8)));

    env.db.tree().bottom().wait_flush().unwrap();
    let store = env.store.as_ref();
    assert_eq!(schema::read_persistent_state_id(store).unwrap(), 8);
    assert_eq!(
        schema::read_snapshot_root(store).unwrap(),
        Some(*head.as_bytes())
    );
    env.check_state(8);
}

/// Committing the disk root again is a harmless no-op.
#[test]
fn test_commit_is_idempotent_on_disk_root() {
    let mut env = TestEnv::new(128, 0);
    env.apply_transitions(4);
    let head = env.head_root();

    env.db.commit(head, false).unwrap();
    env.db.commit(head, false).unwrap();
    assert_eq!(env.db.tree().bottom().root(), head);
}

// ============================================================================
// Disable / enable
// ============================================================================

/// The full state sync cycle: disable rejects mutations and wipes the
/// auxiliary stores, enable re-anchors on the synced persistent root.
#[test]
fn test_disable_enable_cycle() {
    let mut env = TestEnv::new(4, 0);
    env.apply_transitions(8);
    let head = env.head_root();

    // Flush everything so the persistent trie root is the head root.
    env.db.commit(head, false).unwrap();
    env.db.tree().bottom().wait_flush().unwrap();

    env.db.disable().unwrap();
    assert!(matches!(
        env.db.update(
            Hash([1u8; 32]),
            head,
            9,
            pathdb::NodeSet::new(),
            pathdb::StateSetWithOrigin::default()
        ),
        Err(PathDbError::WaitSync)
    ));
    assert!(matches!(env.db.reader(head), Err(PathDbError::WaitSync)));

    // A second disable is rejected without effect.
    env.db.disable().unwrap();

    // The synced root must match the persistent state.
    assert!(matches!(
        env.db.enable(EMPTY_ROOT),
        Err(PathDbError::RootMismatch { .. })
    ));
    env.db.enable(head).unwrap();

    assert_eq!(env.db.tree().len(), 1);
    assert_eq!(env.db.tree().bottom().root(), head);
    assert_eq!(env.db.tree().bottom().state_id(), 0);
    assert_eq!(env.db.history_range(), None);
    assert_eq!(
        env.store
            .get(ColumnFamily::Metadata, schema::TRIE_JOURNAL_KEY)
            .unwrap(),
        None
    );

    // Mutations are accepted again on the fresh anchor.
    env.apply_transitions(1);
    assert_eq!(env.db.tree().len(), 2);
}

// ============================================================================
// Generator interaction
// ============================================================================

/// Reads beyond the generation marker are refused; commits pause the
/// generator around the flush and resume it on the new root.
#[test]
fn test_generator_gating_and_lifecycle() {
    let mut env = TestEnv::with_config(Config {
        max_diff_layers: 2,
        state_history: 0,
        no_async_flush: true,
        // Every commit overflows the buffer and flushes through.
        write_buffer_size: 1,
        ..Config::default()
    });
    let generator = MockGenerator::with_marker(vec![0x80; 32]);
    env.db.attach_generator(generator.clone());

    // Uncovered flat state falls back to the caller.
    let reader = env.db.reader(EMPTY_ROOT).unwrap();
    assert!(matches!(
        reader.account(Hash([0xff; 32])),
        Err(PathDbError::NotCovered)
    ));
    assert_eq!(reader.account(Hash([0x01; 32])).unwrap(), Vec::<u8>::new());
    assert!(matches!(
        reader.storage(Hash([0xff; 32]), Hash([0xff; 32])),
        Err(PathDbError::NotCovered)
    ));

    // Trigger commits with flushes; the generator is paused for the
    // flush and resumed against the flushed root.
    env.apply_transitions(4);
    assert!(generator.stops() >= 1, "generator was never paused");
    assert!(generator.runs() >= 1, "generator was never resumed");
    let disk_root = env.db.tree().bottom().root();
    assert_eq!(generator.last_root(), Some(disk_root));

    // Marker still set: the gate remains on the new disk layer.
    let reader = env.db.reader(disk_root).unwrap();
    assert!(matches!(
        reader.account(Hash([0xff; 32])),
        Err(PathDbError::NotCovered)
    ));

    // Completed generation lifts the gate at the next commit.
    generator.set_marker(None);
    env.apply_transitions(2);
    let reader = env.db.reader(env.db.tree().bottom().root()).unwrap();
    assert!(reader.account(Hash([0xff; 32])).is_ok());
}

// ============================================================================
// Concurrency smoke test
// ============================================================================

/// Readers racing the writer observe either consistent state or the
/// expected staleness outcomes, never panics or bogus values.
#[test]
fn test_concurrent_reads_during_updates() {
    let mut env = TestEnv::new(4, 0);
    env.apply_transitions(4);

    let pending = env.prepare_transitions(12);
    let db = &env.db;
    let catalog = env.snapshots[4].clone();
    let early_root = env.roots[4];

    std::thread::scope(|scope| {
        scope.spawn(move || {
            for transition in pending {
                db.update(
                    transition.root,
                    transition.parent,
                    transition.block,
                    transition.nodes,
                    transition.states,
                )
                .unwrap();
            }
        });
        for _ in 0..3 {
            let catalog = catalog.clone();
            scope.spawn(move || {
                for _ in 0..50 {
                    let reader = match db.reader(early_root) {
                        Ok(reader) => reader,
                        // Flattened away by the writer.
                        Err(PathDbError::UnknownRoot(_)) => return,
                        Err(err) => panic!("unexpected reader error: {err}"),
                    };
                    for hash in catalog.accounts.keys() {
                        match reader.account(*hash) {
                            Ok(blob) => {
                                assert_eq!(blob, catalog.accounts[hash], "torn account read")
                            }
                            // The backing disk layer moved on.
                            Err(PathDbError::Stale) => return,
                            Err(err) => panic!("unexpected read error: {err}"),
                        }
                    }
                }
            });
        }
    });
}
