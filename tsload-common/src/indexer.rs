use std::hash::Hasher;

use siphasher::sip::SipHasher13;

use crate::record::Record;

/// Maps a record to the worker partition that must process it.
pub trait PointIndexer: Send + Sync {
    fn index_of(&self, record: &Record) -> usize;
}

/// Sends every record to partition 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConstantIndexer;

impl PointIndexer for ConstantIndexer {
    fn index_of(&self, _record: &Record) -> usize {
        0
    }
}

/// Routes records by a stable hash of their primary tag, so every record of an entity
/// lands on the same worker.
#[derive(Debug, Clone, Copy)]
pub struct PrimaryTagIndexer {
    partitions: usize,
}

impl PrimaryTagIndexer {
    pub fn new(partitions: usize) -> Self {
        assert!(partitions > 0, "partitions must be > 0");
        Self { partitions }
    }

    pub fn partition_of(&self, key: &str) -> usize {
        // Fixed keys: the partition of a key must not change between runs.
        let mut hasher = SipHasher13::new_with_keys(0, 0);
        hasher.write(key.as_bytes());
        let hash = hasher.finish();

        (hash % self.partitions as u64) as usize
    }
}

impl PointIndexer for PrimaryTagIndexer {
    fn index_of(&self, record: &Record) -> usize {
        self.partition_of(record.primary_tag())
    }
}

/// Pick the indexer for a number of worker partitions.
pub fn point_indexer(partitions: usize) -> Box<dyn PointIndexer> {
    if partitions > 1 {
        Box::new(PrimaryTagIndexer::new(partitions))
    } else {
        Box::new(ConstantIndexer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(name: &str, driver: &str) -> Record {
        Record::new(
            "readings",
            vec![name.to_owned(), driver.to_owned()],
            vec!["1".to_owned()],
            Utc::now(),
        )
    }

    #[test]
    fn test_constant_indexer() {
        let indexer = point_indexer(1);
        assert_eq!(indexer.index_of(&record("truck1", "bob")), 0);
        assert_eq!(indexer.index_of(&record("truck2", "alice")), 0);
    }

    #[test]
    fn test_same_entity_routes_to_same_partition() {
        let indexer = point_indexer(8);

        for i in 0..100 {
            let name = format!("truck_{}", i);
            let first = indexer.index_of(&record(&name, "bob"));
            // Other tags do not influence routing.
            let second = indexer.index_of(&record(&name, "alice"));
            assert_eq!(first, second);
            assert!(first < 8);
        }
    }

    #[test]
    fn test_partition_is_stable_across_instances() {
        let a = PrimaryTagIndexer::new(16);
        let b = PrimaryTagIndexer::new(16);

        for i in 0..100 {
            let key = format!("host_{}", i);
            assert_eq!(a.partition_of(&key), b.partition_of(&key));
        }
    }

    #[test]
    fn test_keys_spread_over_partitions() {
        let indexer = PrimaryTagIndexer::new(4);
        let used: std::collections::HashSet<usize> = (0..200)
            .map(|i| indexer.partition_of(&format!("truck_{}", i)))
            .collect();

        assert_eq!(used.len(), 4);
    }
}
