//! Test harness for integration tests.
//!
//! Provides the miniature trie opener backing reverse replays, a mock
//! snapshot generator and the [`TestEnv`] fixture bundling a database
//! over an in-memory store with generated state transitions.

use crate::generators::{make_transition, trie_root_blob, Transition, TrieState};
use parking_lot::Mutex;
use pathdb::{
    Config, Database, Hash, Node, NodeSet, PathDbResult, RevertTrie, SnapshotGenerator,
    TrieOpener, EMPTY_ROOT,
};
use pathdb_storage::MemoryStore;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Trie opener over registered full-state snapshots, mirroring the
/// miniature trie scheme of the generators: one leaf per entry plus a
/// root node carrying the canonical content blob.
#[derive(Default)]
pub struct ToyOpener {
    snapshots: Mutex<HashMap<Hash, TrieState>>,
}

impl ToyOpener {
    /// Create an opener with no registered states.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the full state image reachable at the given root.
    pub fn register(&self, root: Hash, state: TrieState) {
        self.snapshots.lock().insert(root, state);
    }
}

impl TrieOpener for ToyOpener {
    fn open_account_trie(&self, post_root: Hash) -> PathDbResult<Box<dyn RevertTrie>> {
        let snapshots = self.snapshots.lock();
        let state = snapshots
            .get(&post_root)
            .ok_or(pathdb::PathDbError::UnknownRoot(post_root))?;
        Ok(Box::new(ToyTrie {
            owner: Hash::ZERO,
            map: state.accounts.clone(),
            touched: HashSet::new(),
        }))
    }

    fn open_storage_trie(
        &self,
        post_root: Hash,
        account_hash: Hash,
        _storage_root: Hash,
    ) -> PathDbResult<Box<dyn RevertTrie>> {
        let snapshots = self.snapshots.lock();
        let state = snapshots
            .get(&post_root)
            .ok_or(pathdb::PathDbError::UnknownRoot(post_root))?;
        Ok(Box::new(ToyTrie {
            owner: account_hash,
            map: state.storages.get(&account_hash).cloned().unwrap_or_default(),
            touched: HashSet::new(),
        }))
    }
}

/// One miniature trie: a flat map plus the set of keys mutated since
/// opening, turned into leaf nodes on commit.
struct ToyTrie {
    owner: Hash,
    map: HashMap<Hash, Vec<u8>>,
    touched: HashSet<Hash>,
}

impl RevertTrie for ToyTrie {
    fn get(&self, key: &[u8]) -> PathDbResult<Option<Vec<u8>>> {
        let key = Hash::from_slice(key)
            .ok_or_else(|| pathdb::PathDbError::Decode("trie key is not 32 bytes".into()))?;
        Ok(self.map.get(&key).cloned())
    }

    fn update(&mut self, key: &[u8], value: Vec<u8>) -> PathDbResult<()> {
        let key = Hash::from_slice(key)
            .ok_or_else(|| pathdb::PathDbError::Decode("trie key is not 32 bytes".into()))?;
        self.map.insert(key, value);
        self.touched.insert(key);
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> PathDbResult<()> {
        let key = Hash::from_slice(key)
            .ok_or_else(|| pathdb::PathDbError::Decode("trie key is not 32 bytes".into()))?;
        self.map.remove(&key);
        self.touched.insert(key);
        Ok(())
    }

    fn commit(self: Box<Self>) -> PathDbResult<(Hash, NodeSet)> {
        let mut nodes = NodeSet::new();
        for key in &self.touched {
            let blob = self.map.get(key).cloned().unwrap_or_default();
            nodes.insert(self.owner, key.as_bytes().to_vec(), Node::new(blob));
        }
        let root_blob = if self.map.is_empty() {
            Vec::new()
        } else {
            trie_root_blob(&self.map)
        };
        let root = Hash::of_node(&root_blob);
        nodes.insert(self.owner, Vec::new(), Node::new(root_blob));
        Ok((root, nodes))
    }
}

/// A controllable stand-in for the background snapshot generator.
#[derive(Default)]
pub struct MockGenerator {
    marker: Mutex<Option<Vec<u8>>>,
    running: AtomicBool,
    runs: AtomicUsize,
    stops: AtomicUsize,
    last_root: Mutex<Option<Hash>>,
}

impl MockGenerator {
    /// A generator paused at the given progress marker.
    pub fn with_marker(marker: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            marker: Mutex::new(Some(marker)),
            ..Self::default()
        })
    }

    /// Move the progress marker; `None` marks generation complete.
    pub fn set_marker(&self, marker: Option<Vec<u8>>) {
        *self.marker.lock() = marker;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn last_root(&self) -> Option<Hash> {
        *self.last_root.lock()
    }
}

impl SnapshotGenerator for MockGenerator {
    fn run(&self, root: Hash) {
        self.running.store(true, Ordering::SeqCst);
        self.runs.fetch_add(1, Ordering::SeqCst);
        *self.last_root.lock() = Some(root);
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn progress_marker(&self) -> Option<Vec<u8>> {
        self.marker.lock().clone()
    }

    fn completed(&self) -> bool {
        self.marker.lock().is_none()
    }
}

/// Database fixture over an in-memory store with a temp-dir history
/// table and a chain of generated transitions.
///
/// `roots[0]` is the empty genesis state; `roots[i]` is the state
/// produced by transition `i` and carries state id `i`. `snapshots`
/// holds the full flat image of every version for read assertions.
pub struct TestEnv {
    pub store: Arc<MemoryStore>,
    pub opener: Arc<ToyOpener>,
    pub db: Database,
    pub roots: Vec<Hash>,
    pub snapshots: Vec<TrieState>,
    pub transitions: Vec<Transition>,
    config: Config,
    rng: StdRng,
    _history_dir: TempDir,
}

impl TestEnv {
    /// Environment with the given flattening depth and history limit.
    pub fn new(max_diff_layers: usize, state_history: u64) -> Self {
        Self::with_config(Config {
            max_diff_layers,
            state_history,
            ..Config::default()
        })
    }

    /// Environment with full control over the configuration. The
    /// history directory is always redirected into a fresh temp dir.
    pub fn with_config(mut config: Config) -> Self {
        let history_dir = TempDir::new().expect("Failed to create history directory");
        config.history_directory = Some(history_dir.path().to_path_buf());

        let store = Arc::new(MemoryStore::new());
        let opener = Arc::new(ToyOpener::new());
        opener.register(EMPTY_ROOT, TrieState::default());

        let db = Database::open(
            Arc::clone(&store) as Arc<dyn pathdb_storage::KeyValueStore>,
            Arc::clone(&opener) as Arc<dyn TrieOpener>,
            config.clone(),
        )
        .expect("Failed to open database");

        Self {
            store,
            opener,
            db,
            roots: vec![EMPTY_ROOT],
            snapshots: vec![TrieState::default()],
            transitions: Vec::new(),
            config,
            rng: StdRng::seed_from_u64(0x70617468),
            _history_dir: history_dir,
        }
    }

    /// Generate and apply `n` chained transitions on the current head.
    pub fn apply_transitions(&mut self, n: usize) {
        for _ in 0..n {
            let parent_root = *self.roots.last().expect("genesis always present");
            let parent = self.snapshots.last().expect("genesis always present");
            let block = self.roots.len() as u64;
            let transition = make_transition(&mut self.rng, parent_root, parent, block);

            self.opener.register(transition.root, transition.post.clone());
            self.db
                .update(
                    transition.root,
                    transition.parent,
                    transition.block,
                    transition.nodes.clone(),
                    transition.states.clone(),
                )
                .expect("Failed to apply transition");

            self.roots.push(transition.root);
            self.snapshots.push(transition.post.clone());
            self.transitions.push(transition);
        }
    }

    /// Generate and record `n` chained transitions without applying
    /// them, for callers that drive the database themselves.
    pub fn prepare_transitions(&mut self, n: usize) -> Vec<Transition> {
        let mut prepared = Vec::with_capacity(n);
        for _ in 0..n {
            let parent_root = *self.roots.last().expect("genesis always present");
            let parent = self.snapshots.last().expect("genesis always present");
            let block = self.roots.len() as u64;
            let transition = make_transition(&mut self.rng, parent_root, parent, block);

            self.opener.register(transition.root, transition.post.clone());
            self.roots.push(transition.root);
            self.snapshots.push(transition.post.clone());
            self.transitions.push(transition.clone());
            prepared.push(transition);
        }
        prepared
    }

    /// The current chain head root.
    pub fn head_root(&self) -> Hash {
        *self.roots.last().expect("genesis always present")
    }

    /// Index into `roots` of the current disk layer; state ids equal
    /// root indexes by construction.
    pub fn disk_index(&self) -> usize {
        self.db.tree().bottom().state_id() as usize
    }

    /// Reopen the database over the same store, opener and config.
    pub fn reopen(&mut self) {
        self.db = Database::open(
            Arc::clone(&self.store) as Arc<dyn pathdb_storage::KeyValueStore>,
            Arc::clone(&self.opener) as Arc<dyn TrieOpener>,
            self.config.clone(),
        )
        .expect("Failed to reopen database");
    }

    /// Assert that reads through `roots[i]` reproduce the snapshot of
    /// version `i`, for every account and storage slot ever touched.
    pub fn check_state(&self, i: usize) {
        let reader = self
            .db
            .reader(self.roots[i])
            .expect("state should be readable");
        let snapshot = &self.snapshots[i];

        let catalog = self.snapshots.last().expect("genesis always present");
        for hash in catalog.addresses.keys() {
            let expected = snapshot.accounts.get(hash).cloned().unwrap_or_default();
            let actual = reader.account(*hash).expect("account read failed");
            assert_eq!(actual, expected, "account mismatch at state {i}");
        }
        let mut pairs: HashSet<(Hash, Hash)> = HashSet::new();
        for version in &self.snapshots {
            for (account, slots) in &version.storages {
                for slot in slots.keys() {
                    pairs.insert((*account, *slot));
                }
            }
        }
        for (account, slot) in pairs {
            let expected = snapshot
                .storages
                .get(&account)
                .and_then(|slots| slots.get(&slot))
                .cloned()
                .unwrap_or_default();
            let actual = reader.storage(account, slot).expect("storage read failed");
            assert_eq!(actual, expected, "storage mismatch at state {i}");
        }
        // The root node resolves to the layer's own root hash.
        let (_, hash, _) = reader.node(Hash::ZERO, &[]).expect("root node read failed");
        assert_eq!(hash, self.roots[i], "root node mismatch at state {i}");
    }
}
