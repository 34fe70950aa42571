use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

/// Process identifier, stable for the process lifetime.
pub type ProcessId = String;

/// Durable intended mapping of buckets to owning processes.
///
/// The map is the cluster-wide "intent": it covers every bucket in
/// `[0, bucket_count)` exactly once across all entries whenever at least one
/// process is live. It is replaced wholesale on each rebalance, never
/// partially updated. Enacted ownership (markers) may transiently lag it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentMap {
    entries: HashMap<ProcessId, BTreeSet<u32>>,
}

impl AssignmentMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Processes with at least one entry, including processes that may no
    /// longer be live.
    pub fn processes(&self) -> impl Iterator<Item = &ProcessId> {
        self.entries.keys()
    }

    /// Buckets assigned to `process`, empty if the process has no entry.
    pub fn buckets_for(&self, process: &str) -> BTreeSet<u32> {
        self.entries.get(process).cloned().unwrap_or_default()
    }

    /// The process a bucket is assigned to, if any.
    pub fn owner_of(&self, bucket: u32) -> Option<&ProcessId> {
        self.entries
            .iter()
            .find(|(_, buckets)| buckets.contains(&bucket))
            .map(|(process, _)| process)
    }

    pub fn insert(&mut self, process: ProcessId, buckets: BTreeSet<u32>) {
        self.entries.insert(process, buckets);
    }

    /// Every bucket in `[0, bucket_count)` appears in exactly one entry.
    pub fn is_complete(&self, bucket_count: u32) -> bool {
        let mut seen = BTreeSet::new();
        for buckets in self.entries.values() {
            for &b in buckets {
                if b >= bucket_count || !seen.insert(b) {
                    return false;
                }
            }
        }
        seen.len() as u32 == bucket_count
    }

    /// Total number of assigned buckets across all entries.
    pub fn assigned_count(&self) -> usize {
        self.entries.values().map(|b| b.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buckets(ids: &[u32]) -> BTreeSet<u32> {
        ids.iter().copied().collect()
    }

    #[test]
    fn empty_map_is_complete_only_for_zero_buckets() {
        let map = AssignmentMap::new();
        assert!(map.is_complete(0));
        assert!(!map.is_complete(1));
    }

    #[test]
    fn owner_lookup() {
        let mut map = AssignmentMap::new();
        map.insert("p1".to_string(), buckets(&[0, 2]));
        map.insert("p2".to_string(), buckets(&[1]));

        assert_eq!(map.owner_of(0).map(String::as_str), Some("p1"));
        assert_eq!(map.owner_of(1).map(String::as_str), Some("p2"));
        assert_eq!(map.owner_of(3), None);
        assert_eq!(map.buckets_for("p1"), buckets(&[0, 2]));
        assert!(map.buckets_for("p3").is_empty());
    }

    #[test]
    fn completeness_rejects_gaps_and_duplicates() {
        let mut map = AssignmentMap::new();
        map.insert("p1".to_string(), buckets(&[0, 1]));
        map.insert("p2".to_string(), buckets(&[2]));
        assert!(map.is_complete(3));
        assert!(!map.is_complete(4)); // gap

        let mut dup = AssignmentMap::new();
        dup.insert("p1".to_string(), buckets(&[0, 1]));
        dup.insert("p2".to_string(), buckets(&[1, 2]));
        assert!(!dup.is_complete(3)); // bucket 1 double-assigned
    }

    #[test]
    fn out_of_range_bucket_is_incomplete() {
        let mut map = AssignmentMap::new();
        map.insert("p1".to_string(), buckets(&[0, 5]));
        assert!(!map.is_complete(2));
    }

    #[test]
    fn serde_round_trip() {
        let mut map = AssignmentMap::new();
        map.insert("p1".to_string(), buckets(&[0, 1, 2]));
        let encoded = serde_json::to_string(&map).unwrap();
        let decoded: AssignmentMap = serde_json::from_str(&encoded).unwrap();
        assert_eq!(map, decoded);
    }
}
