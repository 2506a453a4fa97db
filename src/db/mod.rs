pub mod entities;
pub mod services;
pub mod store;

#[cfg(test)]
pub mod memory_store;

pub use store::{ClusterOverview, JobMetricStore, merge_record};
