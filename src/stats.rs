use crate::checkpoint::{CheckpointCounters, EntityCounters, FailedCounters, SkippedCounters};
use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative counters for a load, carried across resumes via the checkpoint
#[derive(Default, Debug)]
pub struct LoadStats {
    pub publications_created: AtomicU64,
    pub persons_created: AtomicU64,
    pub organizations_created: AtomicU64,
    pub relationships_created: AtomicU64,
    pub publications_merged: AtomicU64,
    pub persons_merged: AtomicU64,
    pub organizations_merged: AtomicU64,
    pub relationships_merged: AtomicU64,
    pub records_invalid: AtomicU64,
    pub records_corrupt: AtomicU64,
    pub authors_skipped: AtomicU64,
    pub affiliations_excluded: AtomicU64,
    pub hierarchy_cycles: AtomicU64,
    pub merge_candidates: AtomicU64,
    pub records_failed: AtomicU64,
    pub batches_failed: AtomicU64,
    pub batches_committed: AtomicU64,
}

fn add(counter: &AtomicU64, count: u64) {
    counter.fetch_add(count, Ordering::Relaxed);
}

fn get(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

impl LoadStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the counts of a batch that committed
    pub fn add_batch(&self, created: &EntityCounters, merged: &EntityCounters) {
        add(&self.publications_created, created.publications);
        add(&self.persons_created, created.persons);
        add(&self.organizations_created, created.organizations);
        add(&self.relationships_created, created.relationships);
        add(&self.publications_merged, merged.publications);
        add(&self.persons_merged, merged.persons);
        add(&self.organizations_merged, merged.organizations);
        add(&self.relationships_merged, merged.relationships);
        add(&self.batches_committed, 1);
    }

    pub fn add_failed_batch(&self, records: u64) {
        add(&self.records_failed, records);
        add(&self.batches_failed, 1);
    }

    pub fn add_invalid(&self, count: u64) {
        add(&self.records_invalid, count);
    }

    pub fn add_corrupt(&self, count: u64) {
        add(&self.records_corrupt, count);
    }

    pub fn add_authors_skipped(&self, count: u64) {
        add(&self.authors_skipped, count);
    }

    pub fn add_affiliations_excluded(&self, count: u64) {
        add(&self.affiliations_excluded, count);
    }

    pub fn add_hierarchy_cycles(&self, count: u64) {
        add(&self.hierarchy_cycles, count);
    }

    pub fn add_merge_candidates(&self, count: u64) {
        add(&self.merge_candidates, count);
    }

    pub fn created(&self) -> EntityCounters {
        EntityCounters {
            publications: get(&self.publications_created),
            persons: get(&self.persons_created),
            organizations: get(&self.organizations_created),
            relationships: get(&self.relationships_created),
        }
    }

    pub fn merged(&self) -> EntityCounters {
        EntityCounters {
            publications: get(&self.publications_merged),
            persons: get(&self.persons_merged),
            organizations: get(&self.organizations_merged),
            relationships: get(&self.relationships_merged),
        }
    }

    pub fn skipped(&self) -> SkippedCounters {
        SkippedCounters {
            invalid_records: get(&self.records_invalid),
            corrupt_records: get(&self.records_corrupt),
            authors: get(&self.authors_skipped),
            affiliations: get(&self.affiliations_excluded),
            hierarchy_cycles: get(&self.hierarchy_cycles),
            merge_candidates: get(&self.merge_candidates),
        }
    }

    pub fn failed(&self) -> FailedCounters {
        FailedCounters {
            records: get(&self.records_failed),
            batches: get(&self.batches_failed),
        }
    }

    pub fn batches(&self) -> u64 {
        get(&self.batches_committed)
    }

    /// Create stats initialized from a checkpoint
    pub fn from_checkpoint(cp: &CheckpointCounters, batches_completed: u64) -> Self {
        Self {
            publications_created: AtomicU64::new(cp.created.publications),
            persons_created: AtomicU64::new(cp.created.persons),
            organizations_created: AtomicU64::new(cp.created.organizations),
            relationships_created: AtomicU64::new(cp.created.relationships),
            publications_merged: AtomicU64::new(cp.merged.publications),
            persons_merged: AtomicU64::new(cp.merged.persons),
            organizations_merged: AtomicU64::new(cp.merged.organizations),
            relationships_merged: AtomicU64::new(cp.merged.relationships),
            records_invalid: AtomicU64::new(cp.skipped.invalid_records),
            records_corrupt: AtomicU64::new(cp.skipped.corrupt_records),
            authors_skipped: AtomicU64::new(cp.skipped.authors),
            affiliations_excluded: AtomicU64::new(cp.skipped.affiliations),
            hierarchy_cycles: AtomicU64::new(cp.skipped.hierarchy_cycles),
            merge_candidates: AtomicU64::new(cp.skipped.merge_candidates),
            records_failed: AtomicU64::new(cp.failed.records),
            batches_failed: AtomicU64::new(cp.failed.batches),
            batches_committed: AtomicU64::new(batches_completed),
        }
    }

    /// Convert to checkpoint counters for persistence
    pub fn to_checkpoint(&self) -> CheckpointCounters {
        CheckpointCounters {
            created: self.created(),
            merged: self.merged(),
            skipped: self.skipped(),
            failed: self.failed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(p: u64, pe: u64, o: u64, r: u64) -> EntityCounters {
        EntityCounters {
            publications: p,
            persons: pe,
            organizations: o,
            relationships: r,
        }
    }

    #[test]
    fn default_values_are_zero() {
        let stats = LoadStats::new();
        assert_eq!(stats.to_checkpoint(), CheckpointCounters::default());
        assert_eq!(stats.batches(), 0);
    }

    #[test]
    fn add_batch_accumulates() {
        let stats = LoadStats::new();
        stats.add_batch(&counters(2, 3, 1, 6), &counters(0, 1, 0, 0));
        stats.add_batch(&counters(1, 0, 0, 2), &counters(0, 2, 1, 0));
        assert_eq!(stats.created(), counters(3, 3, 1, 8));
        assert_eq!(stats.merged(), counters(0, 3, 1, 0));
        assert_eq!(stats.batches(), 2);
    }

    #[test]
    fn skipped_and_failed_counters() {
        let stats = LoadStats::new();
        stats.add_invalid(1);
        stats.add_corrupt(2);
        stats.add_authors_skipped(4);
        stats.add_affiliations_excluded(2);
        stats.add_hierarchy_cycles(1);
        stats.add_merge_candidates(3);
        stats.add_failed_batch(50);

        let skipped = stats.skipped();
        assert_eq!(skipped.invalid_records, 1);
        assert_eq!(skipped.corrupt_records, 2);
        assert_eq!(skipped.authors, 4);
        assert_eq!(skipped.affiliations, 2);
        assert_eq!(skipped.hierarchy_cycles, 1);
        assert_eq!(skipped.merge_candidates, 3);
        assert_eq!(stats.failed(), FailedCounters { records: 50, batches: 1 });
    }

    #[test]
    fn checkpoint_roundtrip() {
        let original = LoadStats::new();
        original.add_batch(&counters(5, 7, 2, 20), &counters(1, 1, 1, 1));
        original.add_invalid(1);
        original.add_failed_batch(3);

        let cp = original.to_checkpoint();
        let restored = LoadStats::from_checkpoint(&cp, original.batches());
        assert_eq!(restored.to_checkpoint(), cp);
        assert_eq!(restored.batches(), 1);
    }
}
