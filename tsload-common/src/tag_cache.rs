use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

/// Source of tag ids for a whole run. Every `TagCache` of the run draws from the same
/// sequence, so worker-local caches never hand out the same id for different tag sets.
#[derive(Debug)]
pub struct TagIdSequence {
    next: AtomicI64,
}

impl TagIdSequence {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: i64) -> Self {
        Self {
            next: AtomicI64::new(first),
        }
    }

    fn next_id(&self) -> i64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Make sure ids handed out from now on are strictly greater than `id`.
    fn advance_past(&self, id: i64) {
        self.next.fetch_max(id + 1, Ordering::Relaxed);
    }
}

impl Default for TagIdSequence {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory mapping from tag fingerprints to their assigned ids.
///
/// A single instance may be shared by every worker of a run (when records are not routed
/// to workers by entity) or one instance may be owned by each worker. Lookups take a read
/// lock; assignment takes the write lock for the whole check-then-insert, so two workers
/// racing on the same fingerprint always observe the same id.
#[derive(Debug)]
pub struct TagCache {
    ids: RwLock<HashMap<String, i64>>,
    sequence: Arc<TagIdSequence>,
}

impl TagCache {
    pub fn new(sequence: Arc<TagIdSequence>) -> Self {
        Self {
            ids: RwLock::new(HashMap::new()),
            sequence,
        }
    }

    /// Look up the id of a fingerprint without assigning one.
    pub fn resolve(&self, fingerprint: &str) -> Option<i64> {
        self.ids
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(fingerprint)
            .copied()
    }

    /// Assign an id to a fingerprint that `resolve` missed.
    /// Returns the id and whether it was created by this call. If another caller assigned
    /// the fingerprint in the meantime, its id is returned instead.
    pub fn assign(&self, fingerprint: &str) -> (i64, bool) {
        let mut ids = self
            .ids
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(id) = ids.get(fingerprint) {
            return (*id, false);
        }

        let id = self.sequence.next_id();
        ids.insert(fingerprint.to_owned(), id);
        (id, true)
    }

    pub fn resolve_or_assign(&self, fingerprint: &str) -> (i64, bool) {
        match self.resolve(fingerprint) {
            Some(id) => (id, false),
            None => self.assign(fingerprint),
        }
    }

    /// Load identities already persisted in a store.
    pub fn seed<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (String, i64)>,
    {
        let mut ids = self
            .ids
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        for (fingerprint, id) in entries {
            self.sequence.advance_past(id);
            ids.entry(fingerprint).or_insert(id);
        }
    }

    pub fn len(&self) -> usize {
        self.ids
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Every tag cache of one run: the shared instance plus what is needed to hand each
/// worker a private one drawing from the same id sequence.
#[derive(Debug)]
pub struct TagCaches {
    sequence: Arc<TagIdSequence>,
    shared: Arc<TagCache>,
    seeded: RwLock<Vec<(String, i64)>>,
}

impl TagCaches {
    pub fn new() -> Self {
        let sequence = Arc::new(TagIdSequence::new());
        Self {
            shared: Arc::new(TagCache::new(sequence.clone())),
            sequence,
            seeded: RwLock::new(Vec::new()),
        }
    }

    /// Record identities already persisted. They are loaded into the shared cache now
    /// and into every worker-local cache created afterwards.
    pub fn seed(&self, entries: Vec<(String, i64)>) {
        self.shared.seed(entries.iter().cloned());
        self.seeded
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(entries);
    }

    pub fn shared(&self) -> Arc<TagCache> {
        self.shared.clone()
    }

    /// Cache for one worker: a private one when records are routed by entity, the shared
    /// one otherwise.
    pub fn for_worker(&self, hashed_workers: bool) -> Arc<TagCache> {
        if !hashed_workers {
            return self.shared();
        }

        let local = TagCache::new(self.sequence.clone());
        local.seed(
            self.seeded
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .iter()
                .cloned(),
        );
        Arc::new(local)
    }
}

impl Default for TagCaches {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_assign_then_resolve() {
        let cache = TagCache::new(Arc::new(TagIdSequence::new()));

        assert_eq!(cache.resolve("truck1,bob"), None);
        let (id, created) = cache.assign("truck1,bob");
        assert!(created);
        assert_eq!(cache.resolve("truck1,bob"), Some(id));

        let (again, created) = cache.resolve_or_assign("truck1,bob");
        assert_eq!(again, id);
        assert!(!created);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_assign_is_idempotent_for_same_fingerprint() {
        let cache = TagCache::new(Arc::new(TagIdSequence::new()));

        let (first, _) = cache.assign("truck1,bob");
        let (second, created) = cache.assign("truck1,bob");

        assert_eq!(first, second);
        assert!(!created);
    }

    #[test]
    fn test_local_caches_share_the_id_sequence() {
        let sequence = Arc::new(TagIdSequence::new());
        let left = TagCache::new(sequence.clone());
        let right = TagCache::new(sequence);

        let (a, _) = left.assign("truck1,bob");
        let (b, _) = right.assign("truck2,alice");

        assert_ne!(a, b);
    }

    #[test]
    fn test_seed_advances_sequence() {
        let cache = TagCache::new(Arc::new(TagIdSequence::new()));
        cache.seed(vec![("truck1,bob".to_owned(), 41), ("truck2,alice".to_owned(), 7)]);

        assert_eq!(cache.resolve("truck1,bob"), Some(41));
        let (id, created) = cache.assign("truck3,carol");
        assert!(created);
        assert_eq!(id, 42);
    }

    #[test]
    fn test_concurrent_assignment_is_unique_per_fingerprint() {
        let cache = Arc::new(TagCache::new(Arc::new(TagIdSequence::new())));
        let fingerprints: Vec<String> = (0..64).map(|i| format!("truck{},driver{}", i, i % 5)).collect();

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let cache = cache.clone();
                let fingerprints = fingerprints.clone();
                thread::spawn(move || {
                    // Each thread walks the fingerprints from a different offset so they overlap.
                    let mut seen = Vec::with_capacity(fingerprints.len());
                    for i in 0..fingerprints.len() {
                        let fp = &fingerprints[(i + worker * 7) % fingerprints.len()];
                        let (id, _) = cache.resolve_or_assign(fp);
                        seen.push((fp.clone(), id));
                    }
                    seen
                })
            })
            .collect();

        let mut by_fingerprint: HashMap<String, HashSet<i64>> = HashMap::new();
        for handle in handles {
            for (fp, id) in handle.join().unwrap() {
                by_fingerprint.entry(fp).or_default().insert(id);
            }
        }

        assert_eq!(by_fingerprint.len(), fingerprints.len());
        assert!(by_fingerprint.values().all(|ids| ids.len() == 1));

        let distinct_ids: HashSet<i64> = by_fingerprint
            .values()
            .flat_map(|ids| ids.iter().copied())
            .collect();
        assert_eq!(distinct_ids.len(), fingerprints.len());
        assert_eq!(cache.len(), fingerprints.len());
    }

    #[test]
    fn test_worker_caches_follow_topology() {
        let caches = TagCaches::new();
        caches.seed(vec![("truck1,bob".to_owned(), 3)]);

        let shared = caches.for_worker(false);
        assert!(Arc::ptr_eq(&shared, &caches.shared()));

        let local = caches.for_worker(true);
        assert!(!Arc::ptr_eq(&local, &caches.shared()));
        assert_eq!(local.resolve("truck1,bob"), Some(3));

        let (id, created) = local.assign("truck2,alice");
        assert!(created);
        assert_eq!(id, 4);
        assert_eq!(caches.shared().resolve("truck2,alice"), None);
    }
}
