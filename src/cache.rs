//! Content-addressed reuse of task outputs.
//!
//! Every task whose inputs are fully resolved gets a [`Fingerprint`]: a BLAKE3
//! digest of its action descriptor followed by its ordered `(slot, value)`
//! pairs. The fingerprint keys a [`CacheEntry`] in a [`CacheStore`].
//!
//! ## Single flight
//!
//! [`Cache::get_or_run`] guarantees that concurrent callers presenting the
//! same fingerprint collapse into at most one execution. The first caller
//! installs a [`OnceLock`] for the fingerprint and runs the action inside it,
//! everyone else blocks on the same cell and receives the identical result.

use std::collections::HashMap;
use std::fs::{self, File};
use std::hash::Hash;
use std::io::{BufReader, BufWriter};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::core::{Blake3Hasher, Hash32, Outputs, Value};
use crate::error::{ActionError, CacheError};

/// Digest of a task's action and fully resolved inputs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(Hash32);

impl Fingerprint {
    /// Computes the fingerprint of an action applied to resolved inputs.
    ///
    /// Pure: equal actions with equal inputs in equal order always produce
    /// equal fingerprints, and any change of value or order changes it.
    pub fn of(action: &Action, inputs: &[(String, Value)]) -> Self {
        let mut hasher = Blake3Hasher::default();
        action.hash(&mut hasher);
        inputs.hash(&mut hasher);
        Fingerprint(hasher.into())
    }

    /// Binds the fingerprint to the directory the action runs in.
    pub fn within(self, workspace: &Utf8Path) -> Self {
        let mut hasher = Blake3Hasher::default();
        self.hash(&mut hasher);
        workspace.hash(&mut hasher);
        Fingerprint(hasher.into())
    }

    pub fn to_hex(self) -> String {
        self.0.to_hex()
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex()[..12])
    }
}

/// Outputs of one successful execution, never mutated once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub outputs: Outputs,
    pub completed_at: SystemTime,
}

impl CacheEntry {
    pub fn new(fingerprint: Fingerprint, outputs: Outputs) -> Self {
        Self {
            fingerprint,
            outputs,
            completed_at: SystemTime::now(),
        }
    }

    /// Whether the entry still carries exactly the declared output names.
    pub fn is_compatible(&self, declared: &[String]) -> bool {
        self.outputs.len() == declared.len()
            && declared.iter().all(|name| self.outputs.contains_key(name))
    }
}

/// Storage for cache entries, shared across runs.
pub trait CacheStore: Send + Sync {
    fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, CacheError>;

    fn store(&self, entry: &CacheEntry) -> Result<(), CacheError>;

    /// Drops an entry which turned out to be stale.
    fn discard(&self, fingerprint: &Fingerprint) -> Result<(), CacheError>;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<Fingerprint, CacheEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheStore for MemoryStore {
    fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(fingerprint).cloned())
    }

    fn store(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(entry.fingerprint, entry.clone());
        Ok(())
    }

    fn discard(&self, fingerprint: &Fingerprint) -> Result<(), CacheError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(fingerprint);
        Ok(())
    }
}

/// Store persisting each entry as `<hex>.entry.cbor` inside a directory.
#[derive(Debug, Clone)]
pub struct DiskStore {
    dir: Utf8PathBuf,
}

impl DiskStore {
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    fn path(&self, fingerprint: &Fingerprint) -> Utf8PathBuf {
        self.dir.join(format!("{}.entry.cbor", fingerprint.to_hex()))
    }
}

impl CacheStore for DiskStore {
    fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.path(fingerprint);

        if !path.exists() {
            return Ok(None);
        }

        let file = BufReader::new(File::open(&path)?);
        let entry = ciborium::from_reader::<CacheEntry, _>(file)?;

        Ok(Some(entry))
    }

    fn store(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let path = self.path(&entry.fingerprint);
        let temp = path.with_extension("cbor.tmp");

        {
            let mut file = BufWriter::new(File::create(&temp)?);
            ciborium::into_writer(entry, &mut file)?;
            std::io::Write::flush(&mut file)?;
        }

        fs::rename(&temp, &path)?;
        Ok(())
    }

    fn discard(&self, fingerprint: &Fingerprint) -> Result<(), CacheError> {
        match fs::remove_file(self.path(fingerprint)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

type Flight = Arc<OnceLock<Result<CacheEntry, ActionError>>>;

/// How a cache-mediated execution was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// This caller ran the action.
    Executed,
    /// Served from the store or from another caller's concurrent execution.
    Reused,
}

/// Single-flight front for a [`CacheStore`].
pub struct Cache {
    store: Arc<dyn CacheStore>,
    flights: Mutex<HashMap<Fingerprint, Flight>>,
}

impl Cache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            flights: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Looks up an entry usable for a task declaring `declared` outputs.
    ///
    /// Entries with a different set of output names are stale, they get
    /// discarded and reported as a miss. Store failures also count as a miss.
    pub fn lookup(&self, fingerprint: &Fingerprint, declared: &[String]) -> Option<CacheEntry> {
        let entry = match self.store.lookup(fingerprint) {
            Ok(entry) => entry?,
            Err(err) => {
                tracing::warn!(%fingerprint, "cache entry unreadable, discarding: {err}");
                self.discard(fingerprint);
                return None;
            }
        };

        if entry.is_compatible(declared) {
            return Some(entry);
        }

        tracing::warn!(%fingerprint, "cache entry has stale outputs, discarding");
        self.discard(fingerprint);
        None
    }

    fn discard(&self, fingerprint: &Fingerprint) {
        if let Err(err) = self.store.discard(fingerprint) {
            tracing::warn!(%fingerprint, "failed to discard cache entry: {err}");
        }
    }

    /// Returns a cached entry for `fingerprint`, or runs `run` to create one.
    ///
    /// At most one `run` executes per fingerprint at any time; concurrent
    /// callers wait for it and share its result, errors included. Failed
    /// executions aren't stored.
    pub fn get_or_run<F>(
        &self,
        fingerprint: Fingerprint,
        declared: &[String],
        run: F,
    ) -> Result<(CacheEntry, Provenance), ActionError>
    where
        F: FnOnce() -> Result<Outputs, ActionError>,
    {
        if let Some(entry) = self.lookup(&fingerprint, declared) {
            return Ok((entry, Provenance::Reused));
        }

        let flight = self
            .flights
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(fingerprint)
            .or_default()
            .clone();

        let mut provenance = Provenance::Reused;
        let mut initialized = false;

        let result = flight
            .get_or_init(|| {
                initialized = true;

                // A flight for this fingerprint may have landed between the
                // lookup above and the registration of this one.
                if let Some(entry) = self.lookup(&fingerprint, declared) {
                    return Ok(entry);
                }

                provenance = Provenance::Executed;
                let entry = CacheEntry::new(fingerprint, run()?);

                if let Err(err) = self.store.store(&entry) {
                    tracing::warn!(%fingerprint, "failed to persist cache entry: {err}");
                }

                Ok(entry)
            })
            .clone();

        // Whoever filled the cell retires it, waiters only read it.
        if initialized {
            let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
            if flights
                .get(&fingerprint)
                .is_some_and(|current| Arc::ptr_eq(current, &flight))
            {
                flights.remove(&fingerprint);
            }
        }

        result.map(|entry| (entry, provenance))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use rand::Rng;
    use rand::seq::SliceRandom;

    use super::*;

    fn action(key: &str) -> Action {
        Action::function(key, |_| Ok(Outputs::new()))
    }

    fn outputs(pairs: &[(&str, &str)]) -> Outputs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::text(*v)))
            .collect()
    }

    fn random_inputs(rng: &mut impl Rng) -> Vec<(String, Value)> {
        let len = rng.gen_range(1..8);
        (0..len)
            .map(|i| {
                let value = if rng.gen_bool(0.2) {
                    Value::list((0..rng.gen_range(0..4)).map(|_| {
                        Value::text(format!("/data/{}", rng.gen_range(0..1000)))
                    }))
                } else {
                    Value::text(format!("/data/{}", rng.gen_range(0..1000)))
                };
                (format!("in{i}"), value)
            })
            .collect()
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let mut rng = rand::thread_rng();

        for _ in 0..200 {
            let inputs = random_inputs(&mut rng);
            let copy = inputs.clone();

            assert_eq!(
                Fingerprint::of(&action("a"), &inputs),
                Fingerprint::of(&action("a"), &copy)
            );
        }
    }

    #[test]
    fn test_fingerprint_sensitive_to_order_and_values() {
        let mut rng = rand::thread_rng();

        for _ in 0..200 {
            let inputs = random_inputs(&mut rng);
            let base = Fingerprint::of(&action("a"), &inputs);

            let mut permuted = inputs.clone();
            permuted.shuffle(&mut rng);
            if permuted != inputs {
                assert_ne!(base, Fingerprint::of(&action("a"), &permuted));
            }

            let mut changed = inputs.clone();
            let i = rng.gen_range(0..changed.len());
            changed[i].1 = Value::text("/data/changed");
            if changed != inputs {
                assert_ne!(base, Fingerprint::of(&action("a"), &changed));
            }
        }
    }

    #[test]
    fn test_fingerprint_includes_action() {
        let inputs = vec![("x".to_string(), Value::text("1"))];
        assert_ne!(
            Fingerprint::of(&action("a"), &inputs),
            Fingerprint::of(&action("b"), &inputs)
        );
    }

    #[test]
    fn test_fingerprint_within_workspace() {
        let base = Fingerprint::of(&action("a"), &[]);

        assert_eq!(base.within(Utf8Path::new("/run1/a")), base.within(Utf8Path::new("/run1/a")));
        assert_ne!(base.within(Utf8Path::new("/run1/a")), base.within(Utf8Path::new("/run2/a")));
        assert_ne!(base.within(Utf8Path::new("/run1/a")), base);
    }

    #[test]
    fn test_memory_store_roundtrip_and_stale_discard() {
        let store = Arc::new(MemoryStore::new());
        let cache = Cache::new(store.clone());
        let fp = Fingerprint::of(&action("a"), &[]);

        store
            .store(&CacheEntry::new(fp, outputs(&[("x", "1")])))
            .unwrap();

        let declared = vec!["x".to_string()];
        assert!(cache.lookup(&fp, &declared).is_some());

        let declared = vec!["y".to_string()];
        assert!(cache.lookup(&fp, &declared).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_get_or_run_reuses_entry() {
        let cache = Cache::new(Arc::new(MemoryStore::new()));
        let fp = Fingerprint::of(&action("a"), &[]);
        let declared = vec!["x".to_string()];

        let (first, how) = cache
            .get_or_run(fp, &declared, || Ok(outputs(&[("x", "1")])))
            .unwrap();
        assert_eq!(how, Provenance::Executed);

        let (second, how) = cache
            .get_or_run(fp, &declared, || panic!("must not run"))
            .unwrap();
        assert_eq!(how, Provenance::Reused);
        assert_eq!(first, second);
    }

    #[test]
    fn test_get_or_run_does_not_store_failures() {
        let store = Arc::new(MemoryStore::new());
        let cache = Cache::new(store.clone());
        let fp = Fingerprint::of(&action("a"), &[]);

        let err = cache
            .get_or_run(fp, &[], || Err(ActionError::new(Some(1), "nope")))
            .unwrap_err();
        assert_eq!(err.exit_code, Some(1));
        assert!(store.is_empty());

        let (_, how) = cache.get_or_run(fp, &[], || Ok(Outputs::new())).unwrap();
        assert_eq!(how, Provenance::Executed);
    }

    #[test]
    fn test_concurrent_callers_collapse_into_one_execution() {
        const N: usize = 8;

        let cache = Cache::new(Arc::new(MemoryStore::new()));
        let fp = Fingerprint::of(&action("slow"), &[]);
        let declared = vec!["x".to_string()];
        let calls = AtomicUsize::new(0);
        let barrier = Barrier::new(N);

        let results: Vec<_> = thread::scope(|s| {
            let handles: Vec<_> = (0..N)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        cache
                            .get_or_run(fp, &declared, || {
                                calls.fetch_add(1, Ordering::SeqCst);
                                thread::sleep(Duration::from_millis(50));
                                Ok(outputs(&[("x", "shared")]))
                            })
                            .unwrap()
                    })
                })
                .collect();

            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            results
                .iter()
                .filter(|(_, how)| *how == Provenance::Executed)
                .count(),
            1
        );
        assert!(results.iter().all(|(entry, _)| *entry == results[0].0));
        assert!(cache.flights.lock().unwrap().is_empty());
    }

    /// Misses on the first lookup only, as if the entry landed right after.
    #[derive(Default)]
    struct LateStore {
        inner: MemoryStore,
        lookups: AtomicUsize,
    }

    impl CacheStore for LateStore {
        fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
            match self.lookups.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(None),
                _ => self.inner.lookup(fingerprint),
            }
        }

        fn store(&self, entry: &CacheEntry) -> Result<(), CacheError> {
            self.inner.store(entry)
        }

        fn discard(&self, fingerprint: &Fingerprint) -> Result<(), CacheError> {
            self.inner.discard(fingerprint)
        }
    }

    #[test]
    fn test_flight_retired_when_store_answers_inside_it() {
        let store = Arc::new(LateStore::default());
        let fp = Fingerprint::of(&action("a"), &[]);
        store
            .inner
            .store(&CacheEntry::new(fp, outputs(&[("x", "1")])))
            .unwrap();

        let cache = Cache::new(store.clone());
        let (_, how) = cache
            .get_or_run(fp, &["x".to_string()], || panic!("must not run"))
            .unwrap();

        assert_eq!(how, Provenance::Reused);
        assert_eq!(store.lookups.load(Ordering::SeqCst), 2);
        assert!(cache.flights.lock().unwrap().is_empty());
    }

    #[test]
    fn test_disk_store_persists_entries() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(dir.path()).unwrap().join("cache");
        let fp = Fingerprint::of(&action("a"), &[("x".into(), Value::text("1"))]);
        let entry = CacheEntry::new(fp, outputs(&[("y", "/work/a/y")]));

        DiskStore::new(&dir).unwrap().store(&entry).unwrap();

        let reopened = DiskStore::new(&dir).unwrap();
        assert_eq!(reopened.lookup(&fp).unwrap(), Some(entry));
        assert!(dir.join(format!("{}.entry.cbor", fp.to_hex())).exists());

        reopened.discard(&fp).unwrap();
        assert_eq!(reopened.lookup(&fp).unwrap(), None);
        reopened.discard(&fp).unwrap();
    }

    #[test]
    fn test_disk_store_corrupt_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(dir.path()).unwrap();
        let store = Arc::new(DiskStore::new(dir).unwrap());
        let fp = Fingerprint::of(&action("a"), &[]);

        fs::write(dir.join(format!("{}.entry.cbor", fp.to_hex())), b"garbage").unwrap();

        let cache = Cache::new(store.clone());
        assert!(cache.lookup(&fp, &[]).is_none());
        assert_eq!(store.lookup(&fp).unwrap(), None);
    }
}
