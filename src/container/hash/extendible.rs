use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;

/// Concurrent extendible hash table.
///
/// The directory holds 2^global_depth slots; several slots may share one
/// bucket. Buckets never merge, so the table only grows. All public
/// operations serialize on the table-wide mutex; the per-bucket mutexes
/// exist so that slots can share a bucket, not for extra concurrency.
pub struct ExtendibleHashTable<K, V> {
    bucket_size: usize,
    dir: Mutex<Directory<K, V>>,
}

struct Directory<K, V> {
    global_depth: usize,
    num_buckets: usize,
    slots: Vec<Arc<Mutex<Bucket<K, V>>>>,
}

struct Bucket<K, V> {
    depth: usize,
    capacity: usize,
    items: Vec<(K, V)>,
}

impl<K: PartialEq + Clone, V: Clone> Bucket<K, V> {
    fn new(capacity: usize, depth: usize) -> Self {
        Self {
            depth,
            capacity,
            items: Vec::with_capacity(capacity),
        }
    }

    fn find(&self, key: &K) -> Option<V> {
        self.items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    fn remove(&mut self, key: &K) -> bool {
        match self.items.iter().position(|(k, _)| k == key) {
            Some(pos) => {
                self.items.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Insert or overwrite. Returns false when the bucket is full and the
    /// key is not already present.
    fn insert(&mut self, key: K, value: V) -> bool {
        for item in self.items.iter_mut() {
            if item.0 == key {
                item.1 = value;
                return true;
            }
        }
        if self.items.len() >= self.capacity {
            return false;
        }
        self.items.push((key, value));
        true
    }
}

impl<K, V> ExtendibleHashTable<K, V>
where
    K: Hash + PartialEq + Clone,
    V: Clone,
{
    pub fn new(bucket_size: usize) -> Self {
        // Depth 0: a single slot covering the whole key space.
        let slots = vec![Arc::new(Mutex::new(Bucket::new(bucket_size, 0)))];
        Self {
            bucket_size,
            dir: Mutex::new(Directory {
                global_depth: 0,
                num_buckets: 1,
                slots,
            }),
        }
    }

    fn hash(key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish() as usize
    }

    fn index_of(global_depth: usize, key: &K) -> usize {
        let mask = (1usize << global_depth) - 1;
        Self::hash(key) & mask
    }

    pub fn find(&self, key: &K) -> Option<V> {
        let dir = self.dir.lock();
        let idx = Self::index_of(dir.global_depth, key);
        let bucket = dir.slots[idx].lock();
        bucket.find(key)
    }

    pub fn remove(&self, key: &K) -> bool {
        let dir = self.dir.lock();
        let idx = Self::index_of(dir.global_depth, key);
        let mut bucket = dir.slots[idx].lock();
        bucket.remove(key)
    }

    pub fn insert(&self, key: K, value: V) {
        let mut dir = self.dir.lock();
        loop {
            let idx = Self::index_of(dir.global_depth, &key);
            if dir.slots[idx].lock().insert(key.clone(), value.clone()) {
                return;
            }

            // Bucket full: split it, doubling the directory first when the
            // bucket is already at global depth.
            let target = dir.slots[idx].clone();
            let target_depth = target.lock().depth;
            if target_depth == dir.global_depth {
                dir.global_depth += 1;
                let old_len = dir.slots.len();
                for i in 0..old_len {
                    let alias = dir.slots[i].clone();
                    dir.slots.push(alias);
                }
            }

            let split_bit = 1usize << target_depth;
            let zero = Arc::new(Mutex::new(Bucket::new(self.bucket_size, target_depth + 1)));
            let one = Arc::new(Mutex::new(Bucket::new(self.bucket_size, target_depth + 1)));
            for (k, v) in target.lock().items.drain(..) {
                if Self::hash(&k) & split_bit != 0 {
                    one.lock().items.push((k, v));
                } else {
                    zero.lock().items.push((k, v));
                }
            }
            dir.num_buckets += 1;

            // Redirect every slot that aliased the old bucket, split on the
            // slot index's new bit.
            let len = dir.slots.len();
            for i in 0..len {
                if Arc::ptr_eq(&dir.slots[i], &target) {
                    dir.slots[i] = if i & split_bit != 0 {
                        one.clone()
                    } else {
                        zero.clone()
                    };
                }
            }
        }
    }

    pub fn global_depth(&self) -> usize {
        self.dir.lock().global_depth
    }

    pub fn local_depth(&self, dir_index: usize) -> usize {
        self.dir.lock().slots[dir_index].lock().depth
    }

    pub fn num_buckets(&self) -> usize {
        self.dir.lock().num_buckets
    }

    pub fn dir_size(&self) -> usize {
        self.dir.lock().slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_insert_and_find() {
        let table = ExtendibleHashTable::<i32, String>::new(4);
        table.insert(1, "a".to_string());
        table.insert(2, "b".to_string());
        table.insert(3, "c".to_string());

        assert_eq!(table.find(&1), Some("a".to_string()));
        assert_eq!(table.find(&2), Some("b".to_string()));
        assert_eq!(table.find(&3), Some("c".to_string()));
        assert_eq!(table.find(&4), None);
    }

    #[test]
    fn test_overwrite_on_duplicate() {
        let table = ExtendibleHashTable::<i32, i32>::new(4);
        table.insert(7, 100);
        table.insert(7, 200);
        assert_eq!(table.find(&7), Some(200));
    }

    #[test]
    fn test_remove() {
        let table = ExtendibleHashTable::<i32, i32>::new(4);
        table.insert(1, 10);
        assert!(table.remove(&1));
        assert_eq!(table.find(&1), None);
        assert!(!table.remove(&1));
    }

    #[test]
    fn test_directory_growth() {
        let table = ExtendibleHashTable::<u32, u32>::new(2);
        for i in 0..64 {
            table.insert(i, i * 10);
        }
        for i in 0..64 {
            assert_eq!(table.find(&i), Some(i * 10));
        }
        // Buckets of two cannot hold 64 entries behind one slot.
        assert!(table.global_depth() >= 1);
        assert!(table.num_buckets() > 1);
        assert_eq!(table.dir_size(), 1 << table.global_depth());
    }

    #[test]
    fn test_local_depth_bounded_by_global() {
        let table = ExtendibleHashTable::<u32, u32>::new(2);
        for i in 0..128 {
            table.insert(i, i);
        }
        let gd = table.global_depth();
        for i in 0..table.dir_size() {
            assert!(table.local_depth(i) <= gd);
        }
    }

    #[test]
    fn test_concurrent_inserts() {
        let table = Arc::new(ExtendibleHashTable::<u32, u32>::new(4));
        let mut handles = Vec::new();
        for t in 0..4u32 {
            let table = table.clone();
            handles.push(thread::spawn(move || {
                for i in 0..256 {
                    let key = t * 1000 + i;
                    table.insert(key, key + 1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        for t in 0..4u32 {
            for i in 0..256 {
                let key = t * 1000 + i;
                assert_eq!(table.find(&key), Some(key + 1));
            }
        }
    }
}
