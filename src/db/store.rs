use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::DbErr;

use crate::db::entities::job_gpu_metric;
use crate::gpu::JobAggregate;

/// Cluster-wide GPU statistics over the jobs active in a time window.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClusterOverview {
    pub avg_utilization: f64,
    pub avg_memory_pct: f64,
    pub total_gpus: i64,
    pub total_jobs: i64,
    pub underutilized_jobs: i64,
}

/// Durable per-job GPU records.
#[async_trait]
pub trait JobMetricStore: Send + Sync {
    /// Most recent `last_seen` among records that are not yet complete.
    async fn latest_active_seen(&self) -> Result<Option<DateTime<Utc>>, DbErr>;

    /// Inserts the job or folds `cycle` into its stored record, see [`merge_record`].
    async fn upsert_job(
        &self,
        job_id: &str,
        cycle: &JobAggregate,
        now: DateTime<Utc>,
    ) -> Result<(), DbErr>;

    /// Marks complete every incomplete record last seen before `stale_before`
    /// whose job is not in `active_job_ids`. Returns the number of rows changed.
    async fn mark_stale_complete(
        &self,
        active_job_ids: &[String],
        stale_before: DateTime<Utc>,
    ) -> Result<u64, DbErr>;

    async fn find_job(&self, job_id: &str) -> Result<Option<job_gpu_metric::Model>, DbErr>;

    /// Statistics over records whose `[first_seen, last_seen]` overlaps `[from, to]`.
    async fn overview(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        underutilized_threshold: f64,
    ) -> Result<ClusterOverview, DbErr>;
}

/// The merge law applied by every store on upsert.
///
/// A new record starts at `sample_count = 1`. An existing one gets its
/// averages folded as `(stored * count + new) / (count + 1)`, its extremes
/// widened, its GPU count never shrunk, and is reopened if it was complete.
pub fn merge_record(
    existing: Option<&job_gpu_metric::Model>,
    job_id: &str,
    cycle: &JobAggregate,
    now: DateTime<Utc>,
) -> job_gpu_metric::Model {
    match existing {
        None => job_gpu_metric::Model {
            job_id: job_id.to_string(),
            avg_utilization: cycle.avg_utilization,
            max_utilization: cycle.max_utilization,
            min_utilization: cycle.min_utilization,
            avg_memory_pct: cycle.avg_memory_pct,
            max_memory_pct: cycle.max_memory_pct,
            gpu_count: cycle.gpu_count,
            sample_count: 1,
            first_seen: now,
            last_seen: now,
            is_complete: false,
        },
        Some(stored) => {
            let n = f64::from(stored.sample_count);
            job_gpu_metric::Model {
                job_id: stored.job_id.clone(),
                avg_utilization: (stored.avg_utilization * n + cycle.avg_utilization) / (n + 1.0),
                max_utilization: stored.max_utilization.max(cycle.max_utilization),
                min_utilization: stored.min_utilization.min(cycle.min_utilization),
                avg_memory_pct: (stored.avg_memory_pct * n + cycle.avg_memory_pct) / (n + 1.0),
                max_memory_pct: stored.max_memory_pct.max(cycle.max_memory_pct),
                gpu_count: stored.gpu_count.max(cycle.gpu_count),
                sample_count: stored.sample_count + 1,
                first_seen: stored.first_seen,
                last_seen: now,
                is_complete: false,
            }
        }
    }
}
