//! GPU utilization capture and per-job analytics.

pub mod aggregator;
pub mod capture;
pub mod lookup;
pub mod queries;
pub mod sample;

pub use aggregator::{JobAggregate, aggregate_samples};
pub use capture::{CaptureError, CaptureOutcome, CaptureReport, CaptureService};
pub use lookup::{GpuLookupService, JobGpuSummary, LookupError, LookupSource};
pub use sample::{GpuKey, GpuSample, parse_sample_value, round1};

use std::str::FromStr;

/// What a GPU with a utilization sample but no memory sample contributes
/// to its job's memory average.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingMemoryPolicy {
    /// Counts as 0% memory use. Biases the job average downward.
    #[default]
    Zero,
    /// Left out of the memory average entirely.
    Exclude,
}

impl FromStr for MissingMemoryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zero" => Ok(MissingMemoryPolicy::Zero),
            "exclude" => Ok(MissingMemoryPolicy::Exclude),
            other => Err(format!(
                "unknown missing_memory_policy '{other}', expected 'zero' or 'exclude'"
            )),
        }
    }
}
