//! Seed identity and the process-wide seed registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sha1::{Digest, Sha1};

#[derive(Debug, Default, Clone)]
pub struct ParseCache {
    pub parsed_text: Option<String>,
    pub is_parsed: bool,
    pub mask_count: u32,
}

#[derive(Debug)]
pub struct Seed {
    pub bytes: Vec<u8>,
    pub text: String,
    pub digest: [u8; 20],
    pub seed_id: u32,
    pub selected_count: AtomicU64,
    pub mutated_count: AtomicU64,
    pub parse_cache: Mutex<ParseCache>,
    /// Per-seed mutator-id allocator; a lock distinct from the pool lock
    /// so mutator-id assignment never contends with pool publication.
    next_mutator_id: Mutex<u32>,
}

impl Seed {
    fn new(bytes: Vec<u8>, seed_id: u32) -> Self {
        let digest = digest_of(&bytes);
        let text = String::from_utf8_lossy(&bytes).into_owned();
        Self {
            bytes,
            text,
            digest,
            seed_id,
            selected_count: AtomicU64::new(0),
            mutated_count: AtomicU64::new(0),
            parse_cache: Mutex::new(ParseCache::default()),
            next_mutator_id: Mutex::new(0),
        }
    }

    pub fn bump_selected(&self) -> u64 {
        self.selected_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn bump_mutated(&self) -> u64 {
        self.mutated_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn next_mutator_id(&self) -> u32 {
        let mut guard = self.next_mutator_id.lock();
        let id = *guard;
        *guard += 1;
        id
    }
}

fn digest_of(bytes: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Digest-to-id map and the dense `Vec<Arc<Seed>>`, one lock covering both.
/// Insertion is O(1) expected; id assignment is serialized by the lock.
#[derive(Default)]
pub struct SeedRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    by_digest: std::collections::HashMap<[u8; 20], u32>,
    seeds: Vec<Arc<Seed>>,
}

impl SeedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `insert(bytes) -> (already_present, seed_id)`.
    pub fn insert(&self, bytes: Vec<u8>) -> (bool, Arc<Seed>) {
        let digest = digest_of(&bytes);
        let mut inner = self.inner.lock();
        if let Some(&id) = inner.by_digest.get(&digest) {
            let seed = Arc::clone(&inner.seeds[id as usize]);
            return (true, seed);
        }
        let id = inner.seeds.len() as u32;
        let seed = Arc::new(Seed::new(bytes, id));
        inner.by_digest.insert(digest, id);
        inner.seeds.push(Arc::clone(&seed));
        (false, seed)
    }

    pub fn index_of(&self, bytes: &[u8]) -> Option<u32> {
        let digest = digest_of(bytes);
        self.inner.lock().by_digest.get(&digest).copied()
    }

    pub fn get(&self, id: u32) -> Option<Arc<Seed>> {
        self.inner.lock().seeds.get(id as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_is_idempotent_by_digest() {
        let registry = SeedRegistry::new();
        let (existed1, seed1) = registry.insert(b"SELECT 1;".to_vec());
        let (existed2, seed2) = registry.insert(b"SELECT 1;".to_vec());
        assert!(!existed1);
        assert!(existed2);
        assert_eq!(seed1.seed_id, seed2.seed_id);
    }

    #[test]
    fn seed_ids_are_dense_insertion_order() {
        let registry = SeedRegistry::new();
        let (_, a) = registry.insert(b"A".to_vec());
        let (_, b) = registry.insert(b"B".to_vec());
        let (_, c) = registry.insert(b"A".to_vec());
        assert_eq!(a.seed_id, 0);
        assert_eq!(b.seed_id, 1);
        assert_eq!(c.seed_id, 0);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn lookup_by_id_and_bytes() {
        let registry = SeedRegistry::new();
        let (_, seed) = registry.insert(b"payload".to_vec());
        assert_eq!(registry.index_of(b"payload"), Some(seed.seed_id));
        assert!(registry.get(seed.seed_id).is_some());
        assert!(registry.get(999).is_none());
    }

    #[test]
    fn per_seed_mutator_id_allocator_is_independent() {
        let registry = SeedRegistry::new();
        let (_, seed) = registry.insert(b"payload".to_vec());
        assert_eq!(seed.next_mutator_id(), 0);
        assert_eq!(seed.next_mutator_id(), 1);
    }
}
