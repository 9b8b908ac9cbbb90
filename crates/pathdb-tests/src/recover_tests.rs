//! State history rollback and recoverability tests.

use crate::harness::*;
use pathdb::{Hash, PathDbError, EMPTY_ROOT};
use pathdb_storage::schema;

// ============================================================================
// Stepwise rollback
// ============================================================================

/// Reverting one transition at a time through the write buffer: each
/// step re-anchors the disk layer one state back, restores the saved
/// snapshot and shrinks the history head.
#[test]
fn test_recover_stepwise_through_buffer() {
    let mut env = TestEnv::new(4, 0);
    env.apply_transitions(32);
    assert_eq!(env.disk_index(), 28);

    for target in (24..28).rev() {
        env.db.recover(env.roots[target]).unwrap();

        let disk = env.db.tree().bottom();
        assert_eq!(disk.root(), env.roots[target]);
        assert_eq!(disk.state_id(), target as u64);
        assert_eq!(env.db.history_range(), Some((1, target as u64)));
        env.check_state(target);
    }
}

/// Reverting a fully flushed transition goes through the persistent
/// store instead of the buffer, rolling the metadata back with it.
#[test]
fn test_recover_after_flush() {
    let mut env = TestEnv::new(128, 0);
    env.apply_transitions(8);
    let head = env.head_root();

    env.db.commit(head, false).unwrap();
    env.db.tree().bottom().wait_flush().unwrap();

    env.db.recover(env.roots[7]).unwrap();

    let disk = env.db.tree().bottom();
    assert_eq!(disk.root(), env.roots[7]);
    assert_eq!(disk.state_id(), 7);
    env.check_state(7);

    let store = env.store.as_ref();
    assert_eq!(schema::read_persistent_state_id(store).unwrap(), 7);
    assert_eq!(
        schema::read_snapshot_root(store).unwrap(),
        Some(*env.roots[7].as_bytes())
    );

    // Further rollback keeps working from the reverted anchor.
    env.db.recover(env.roots[5]).unwrap();
    assert_eq!(env.db.tree().bottom().root(), env.roots[5]);
    env.check_state(5);
    assert_eq!(env.db.history_range(), Some((1, 5)));
}

/// A transition can be reverted and the identical diff re-applied,
/// reproducing the exact same state (round-trip).
#[test]
fn test_revert_then_reapply() {
    let mut env = TestEnv::new(128, 0);
    env.apply_transitions(5);
    let head = env.head_root();

    env.db.commit(head, false).unwrap();
    env.db.tree().bottom().wait_flush().unwrap();
    env.db.recover(env.roots[4]).unwrap();
    assert_eq!(env.db.tree().bottom().state_id(), 4);

    let replay = env.transitions[4].clone();
    env.db
        .update(
            replay.root,
            replay.parent,
            replay.block,
            replay.nodes,
            replay.states,
        )
        .unwrap();

    let layer = env.db.tree().get(env.roots[5]).expect("replayed head missing");
    assert_eq!(layer.state_id(), 5);
    env.check_state(5);
}

// ============================================================================
// Recoverability
// ============================================================================

/// The recoverable set is exactly the known roots strictly below the
/// disk layer with an unbroken history chain.
#[test]
fn test_recoverable_table() {
    let mut env = TestEnv::new(4, 0);
    env.apply_transitions(12);
    let disk = env.disk_index();
    assert_eq!(disk, 8);

    assert!(!env.db.recoverable(Hash([0xcd; 32])));
    assert!(env.db.recoverable(EMPTY_ROOT));
    assert!(!env.db.recoverable(Hash::ZERO));
    assert!(env.db.recoverable(env.roots[disk - 1]));
    assert!(!env.db.recoverable(env.roots[disk]));
    assert!(!env.db.recoverable(env.roots[disk + 1]));
}

#[test]
fn test_recover_rejects_unreachable_targets() {
    let mut env = TestEnv::new(4, 0);
    env.apply_transitions(6);

    assert!(matches!(
        env.db.recover(Hash([0xee; 32])),
        Err(PathDbError::StateUnrecoverable(_))
    ));
    // States at or above the disk layer are not rollback targets.
    assert!(matches!(
        env.db.recover(env.head_root()),
        Err(PathDbError::StateUnrecoverable(_))
    ));
    assert!(matches!(
        env.db.recover(env.roots[env.disk_index()]),
        Err(PathDbError::StateUnrecoverable(_))
    ));
}

// ============================================================================
// History retention limit
// ============================================================================

/// With a bounded history, tail truncation never overtakes the
/// persisted state id: when it would, a flush is forced first and the
/// truncation happens on a later commit.
#[test]
fn test_history_limit_forces_flush() {
    let mut env = TestEnv::new(2, 4);

    for _ in 0..16 {
        env.apply_transitions(1);
        env.db.tree().bottom().wait_flush().unwrap();

        if let Some((tail_id, head_id)) = env.db.history_range() {
            let persisted = schema::read_persistent_state_id(env.store.as_ref()).unwrap();
            assert!(
                tail_id.saturating_sub(1) <= persisted,
                "tail {tail_id} overtook persisted id {persisted}"
            );
            assert!(persisted <= head_id, "persisted id {persisted} above head {head_id}");
        }
    }
    // The limit did engage.
    let (tail_id, head_id) = env.db.history_range().expect("history must exist");
    assert!(tail_id > 1, "tail was never truncated");
    assert_eq!(head_id, 14); // 16 transitions, 2 still in diff layers

    // The persisted id advanced through forced flushes.
    let persisted = schema::read_persistent_state_id(env.store.as_ref()).unwrap();
    assert!(persisted > 0, "no flush was ever forced");
}
