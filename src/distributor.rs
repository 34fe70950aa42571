use std::collections::{BTreeMap, BTreeSet};

use crate::assignment::{AssignmentMap, ProcessId};

/// Pluggable algorithm computing a new assignment from the old one, the live
/// process set and the bucket count.
///
/// Implementations must be deterministic for identical inputs and must
/// return a map covering every bucket in `[0, bucket_count)` with entries
/// only for live processes. An empty live set yields an empty map; that is a
/// valid degenerate outcome, not an error. Exact placement is not part of
/// the contract, only completeness and liveness.
pub trait BucketDistributor: Send + Sync {
    fn distribute(
        &self,
        old: &AssignmentMap,
        live: &BTreeSet<ProcessId>,
        bucket_count: u32,
    ) -> AssignmentMap;
}

/// Distributor that keeps buckets on their still-live owners where possible
/// and evens the remainder out so per-process counts differ by at most one.
#[derive(Debug, Default)]
pub struct UniformDistributor;

impl BucketDistributor for UniformDistributor {
    fn distribute(
        &self,
        old: &AssignmentMap,
        live: &BTreeSet<ProcessId>,
        bucket_count: u32,
    ) -> AssignmentMap {
        let mut result = AssignmentMap::new();
        if live.is_empty() {
            return result;
        }

        // Buckets stay with their old owner if that owner is still live.
        // BTreeMap keeps iteration order stable so the output is
        // deterministic for identical inputs.
        let mut entries: BTreeMap<&str, BTreeSet<u32>> =
            live.iter().map(|p| (p.as_str(), BTreeSet::new())).collect();
        let mut orphaned: BTreeSet<u32> = (0..bucket_count).collect();
        for process in live {
            for bucket in old.buckets_for(process) {
                if bucket < bucket_count && orphaned.remove(&bucket) {
                    entries
                        .get_mut(process.as_str())
                        .expect("live process has an entry")
                        .insert(bucket);
                }
            }
        }

        // Orphans (previously owned by a departed process, or never
        // assigned) go to the least-loaded process, smallest id on ties.
        for bucket in orphaned {
            let target = entries
                .iter()
                .min_by_key(|(id, buckets)| (buckets.len(), *id))
                .map(|(id, _)| *id)
                .expect("live set is non-empty");
            entries
                .get_mut(target)
                .expect("target taken from entries")
                .insert(bucket);
        }

        // Even out retained load: shift the highest bucket from the most
        // loaded process to the least loaded until counts differ by at most
        // one. Moves only what imbalance requires.
        loop {
            let (max_id, max_len) = entries
                .iter()
                .max_by_key(|(id, buckets)| (buckets.len(), std::cmp::Reverse(*id)))
                .map(|(id, buckets)| (*id, buckets.len()))
                .expect("live set is non-empty");
            let (min_id, min_len) = entries
                .iter()
                .min_by_key(|(id, buckets)| (buckets.len(), *id))
                .map(|(id, buckets)| (*id, buckets.len()))
                .expect("live set is non-empty");
            if max_len <= min_len + 1 {
                break;
            }
            let moved = *entries[max_id]
                .iter()
                .next_back()
                .expect("most loaded entry is non-empty");
            entries
                .get_mut(max_id)
                .expect("max taken from entries")
                .remove(&moved);
            entries
                .get_mut(min_id)
                .expect("min taken from entries")
                .insert(moved);
        }

        for (process, buckets) in entries {
            result.insert(process.to_string(), buckets);
        }
        result
    }
}
