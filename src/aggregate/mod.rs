//! Per-geography aggregation of provider and sample data.
//!
//! Both aggregators stream one record per geography into a single JSON
//! array through [`crate::output::spawn_writer`]. Element order follows
//! completion order and carries no meaning.

pub mod provider;
pub mod sample;
pub mod utility;

pub use provider::{ProviderAggregate, ProviderAggregator};
pub use sample::{SampleAggregate, SampleAggregator, SampleRecord};

/// Outcome counters for one aggregation run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AggregateSummary {
    /// Geographies whose record was written.
    pub geographies: usize,
    /// Geographies skipped because their input could not be read.
    pub failed: usize,
    /// Geographies never started because the run was cancelled.
    pub cancelled: usize,
}

impl AggregateSummary {
    fn merge(&mut self, other: AggregateSummary) {
        self.geographies += other.geographies;
        self.failed += other.failed;
        self.cancelled += other.cancelled;
    }
}
