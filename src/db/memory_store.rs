//! In-process `JobMetricStore` used by the capture and route tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::DbErr;
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use crate::db::entities::job_gpu_metric;
use crate::db::store::{ClusterOverview, JobMetricStore, merge_record};
use crate::gpu::JobAggregate;

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, job_gpu_metric::Model>>,
    failing_jobs: Mutex<HashSet<String>>,
    fail_rate_check: Mutex<bool>,
    fail_completion: Mutex<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: job_gpu_metric::Model) {
        self.records
            .lock()
            .unwrap()
            .insert(record.job_id.clone(), record);
    }

    pub fn get(&self, job_id: &str) -> Option<job_gpu_metric::Model> {
        self.records.lock().unwrap().get(job_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// Makes every upsert of `job_id` fail.
    pub fn fail_upserts_for(&self, job_id: &str) {
        self.failing_jobs.lock().unwrap().insert(job_id.to_string());
    }

    pub fn fail_rate_check(&self) {
        *self.fail_rate_check.lock().unwrap() = true;
    }

    pub fn fail_completion(&self) {
        *self.fail_completion.lock().unwrap() = true;
    }
}

fn injected(what: &str) -> DbErr {
    DbErr::Custom(format!("injected failure: {what}"))
}

#[async_trait]
impl JobMetricStore for MemoryStore {
    async fn latest_active_seen(&self) -> Result<Option<DateTime<Utc>>, DbErr> {
        if *self.fail_rate_check.lock().unwrap() {
            return Err(injected("latest_active_seen"));
        }
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| !r.is_complete)
            .map(|r| r.last_seen)
            .max())
    }

    async fn upsert_job(
        &self,
        job_id: &str,
        cycle: &JobAggregate,
        now: DateTime<Utc>,
    ) -> Result<(), DbErr> {
        if self.failing_jobs.lock().unwrap().contains(job_id) {
            return Err(injected(job_id));
        }
        let mut records = self.records.lock().unwrap();
        let merged = merge_record(records.get(job_id), job_id, cycle, now);
        records.insert(job_id.to_string(), merged);
        Ok(())
    }

    async fn mark_stale_complete(
        &self,
        active_job_ids: &[String],
        stale_before: DateTime<Utc>,
    ) -> Result<u64, DbErr> {
        if *self.fail_completion.lock().unwrap() {
            return Err(injected("mark_stale_complete"));
        }
        let mut changed = 0;
        for record in self.records.lock().unwrap().values_mut() {
            if !record.is_complete
                && record.last_seen < stale_before
                && !active_job_ids.contains(&record.job_id)
            {
                record.is_complete = true;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn find_job(&self, job_id: &str) -> Result<Option<job_gpu_metric::Model>, DbErr> {
        Ok(self.get(job_id))
    }

    async fn overview(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        underutilized_threshold: f64,
    ) -> Result<ClusterOverview, DbErr> {
        let records = self.records.lock().unwrap();
        let in_window: Vec<&job_gpu_metric::Model> = records
            .values()
            .filter(|r| r.first_seen <= to && r.last_seen >= from)
            .collect();
        if in_window.is_empty() {
            return Ok(ClusterOverview::default());
        }

        let n = in_window.len() as f64;
        Ok(ClusterOverview {
            avg_utilization: in_window.iter().map(|r| r.avg_utilization).sum::<f64>() / n,
            avg_memory_pct: in_window.iter().map(|r| r.avg_memory_pct).sum::<f64>() / n,
            total_gpus: in_window.iter().map(|r| i64::from(r.gpu_count)).sum(),
            total_jobs: in_window.len() as i64,
            underutilized_jobs: in_window
                .iter()
                .filter(|r| r.avg_utilization < underutilized_threshold)
                .count() as i64,
        })
    }
}
