//! Read side: a job's current GPU usage and the cluster overview.
//!
//! Per-job answers come from the first tier that has data:
//! recording rules, then raw DCGM series averaged here, then the stored record.

use chrono::{DateTime, Utc};
use sea_orm::DbErr;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::aggregator::{JobAggregate, aggregate_samples};
use super::queries;
use super::sample::{convert_all, is_idle_job, parse_sample_value, round1};
use crate::db::{ClusterOverview, JobMetricStore};
use crate::prometheus::{InstantSample, MetricsSource, PrometheusError};
use crate::server::config::{CaptureSettings, Integrations, MetricNames};

#[derive(Error, Debug)]
pub enum LookupError {
    #[error("GPU utilization integration is not enabled")]
    GpuUtilizationDisabled,
    #[error("Job metrics integration is not enabled")]
    JobMetricsDisabled,
    #[error("Database connection not configured")]
    DatabaseNotConfigured,
    #[error("Database error: {0}")]
    Database(#[from] DbErr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupSource {
    RecordingRules,
    Dcgm,
    Database,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobGpuSummary {
    pub job_id: String,
    pub avg_utilization: f64,
    pub memory_pct: f64,
    pub gpu_count: i32,
    pub is_underutilized: bool,
    pub source: LookupSource,
    /// Only known when the answer came from the stored record.
    pub is_complete: Option<bool>,
}

#[derive(Clone)]
pub struct GpuLookupService {
    source: Option<Arc<dyn MetricsSource>>,
    store: Option<Arc<dyn JobMetricStore>>,
    integrations: Integrations,
    settings: CaptureSettings,
    names: MetricNames,
}

impl GpuLookupService {
    pub fn new(
        source: Option<Arc<dyn MetricsSource>>,
        store: Option<Arc<dyn JobMetricStore>>,
        integrations: Integrations,
        settings: CaptureSettings,
        names: MetricNames,
    ) -> Self {
        Self {
            source,
            store,
            integrations,
            settings,
            names,
        }
    }

    fn summary(
        &self,
        job_id: &str,
        avg_utilization: f64,
        memory_pct: f64,
        gpu_count: i32,
        source: LookupSource,
        is_complete: Option<bool>,
    ) -> JobGpuSummary {
        JobGpuSummary {
            job_id: job_id.to_string(),
            avg_utilization: round1(avg_utilization),
            memory_pct: round1(memory_pct),
            gpu_count,
            is_underutilized: avg_utilization < self.settings.underutilized_threshold,
            source,
            is_complete,
        }
    }

    /// `Ok(None)` means no tier knows the job.
    pub async fn job_summary(
        &self,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<JobGpuSummary>, LookupError> {
        if is_idle_job(job_id) {
            return Ok(None);
        }

        let live_source = self
            .source
            .as_deref()
            .filter(|_| self.integrations.gpu_utilization);
        let store = self
            .store
            .as_deref()
            .filter(|_| self.integrations.job_metrics);

        if live_source.is_none() && store.is_none() {
            return Err(if !self.integrations.gpu_utilization {
                LookupError::GpuUtilizationDisabled
            } else if !self.integrations.job_metrics {
                LookupError::JobMetricsDisabled
            } else {
                LookupError::DatabaseNotConfigured
            });
        }

        if let Some(source) = live_source {
            match self.from_recording_rules(source, job_id, now).await {
                Ok(Some(summary)) => return Ok(Some(summary)),
                Ok(None) => debug!(job_id = %job_id, "No recording rule data for job."),
                Err(e) => warn!(job_id = %job_id, error = %e, "Recording rule query failed."),
            }
            match self.from_dcgm(source, job_id, now).await {
                Ok(Some(summary)) => return Ok(Some(summary)),
                Ok(None) => debug!(job_id = %job_id, "No DCGM data for job."),
                Err(e) => warn!(job_id = %job_id, error = %e, "DCGM query failed."),
            }
        }

        let Some(store) = store else {
            return Ok(None);
        };
        Ok(store.find_job(job_id).await?.map(|record| {
            self.summary(
                &record.job_id,
                record.avg_utilization,
                record.avg_memory_pct,
                record.gpu_count,
                LookupSource::Database,
                Some(record.is_complete),
            )
        }))
    }

    async fn from_recording_rules(
        &self,
        source: &dyn MetricsSource,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<JobGpuSummary>, PrometheusError> {
        let util_query = queries::job_utilization_rule(&self.names, job_id);
        let mem_query = queries::job_memory_rule(&self.names, job_id);
        let count_query = queries::job_gpu_count_rule(&self.names, job_id);
        let (util, mem, count) = tokio::join!(
            source.instant_query(&util_query, Some(now)),
            source.instant_query(&mem_query, Some(now)),
            source.instant_query(&count_query, Some(now)),
        );

        let Some(avg_utilization) = first_value(&util?) else {
            return Ok(None);
        };
        let memory_pct = mem.ok().as_deref().and_then(first_value).unwrap_or(0.0);
        let gpu_count = count
            .ok()
            .as_deref()
            .and_then(first_value)
            .map(|v| v.round() as i32)
            .unwrap_or(0);

        Ok(Some(self.summary(
            job_id,
            avg_utilization,
            memory_pct,
            gpu_count,
            LookupSource::RecordingRules,
            None,
        )))
    }

    async fn from_dcgm(
        &self,
        source: &dyn MetricsSource,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<JobGpuSummary>, PrometheusError> {
        let util_query = queries::job_utilization(&self.names, job_id);
        let used_query = queries::job_memory_used(&self.names, job_id);
        let free_query = queries::job_memory_free(&self.names, job_id);
        let (util, used, free) = tokio::join!(
            source.instant_query(&util_query, Some(now)),
            source.instant_query(&used_query, Some(now)),
            source.instant_query(&free_query, Some(now)),
        );

        let util = util?;
        let used = used.unwrap_or_default();
        let free = free.unwrap_or_default();
        let jobs = aggregate_samples(
            &convert_all(&util, &self.names),
            &convert_all(&used, &self.names),
            &convert_all(&free, &self.names),
            self.settings.missing_memory,
        );

        Ok(jobs.get(job_id).map(|aggregate: &JobAggregate| {
            self.summary(
                job_id,
                aggregate.avg_utilization,
                aggregate.avg_memory_pct,
                aggregate.gpu_count,
                LookupSource::Dcgm,
                None,
            )
        }))
    }

    /// Cluster statistics over jobs active within `[from, to]`, rounded for display.
    pub async fn overview(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<ClusterOverview, LookupError> {
        if !self.integrations.job_metrics {
            return Err(LookupError::JobMetricsDisabled);
        }
        let store = self
            .store
            .as_deref()
            .ok_or(LookupError::DatabaseNotConfigured)?;

        let overview = store
            .overview(from, to, self.settings.underutilized_threshold)
            .await?;
        Ok(ClusterOverview {
            avg_utilization: round1(overview.avg_utilization),
            avg_memory_pct: round1(overview.avg_memory_pct),
            ..overview
        })
    }
}

fn first_value(samples: &[InstantSample]) -> Option<f64> {
    samples.iter().find_map(|s| parse_sample_value(&s.value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::entities::job_gpu_metric;
    use crate::db::memory_store::MemoryStore;
    use crate::prometheus::fake::{FakeSource, dcgm};
    use chrono::{Duration, TimeZone};
    use std::collections::HashMap;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap()
    }

    fn scalar(job: &str, value: &str) -> InstantSample {
        let mut metric = HashMap::new();
        metric.insert("hpc_job".to_string(), job.to_string());
        InstantSample {
            metric,
            value: value.to_string(),
        }
    }

    fn stored(job_id: &str, util: f64, gpus: i32, complete: bool) -> job_gpu_metric::Model {
        job_gpu_metric::Model {
            job_id: job_id.to_string(),
            avg_utilization: util,
            max_utilization: util,
            min_utilization: util,
            avg_memory_pct: 33.333,
            max_memory_pct: 40.0,
            gpu_count: gpus,
            sample_count: 5,
            first_seen: t0() - Duration::hours(2),
            last_seen: t0() - Duration::hours(1),
            is_complete: complete,
        }
    }

    fn service(source: &Arc<FakeSource>, store: &Arc<MemoryStore>) -> GpuLookupService {
        GpuLookupService::new(
            Some(source.clone() as Arc<dyn MetricsSource>),
            Some(store.clone() as Arc<dyn JobMetricStore>),
            Integrations::default(),
            CaptureSettings::default(),
            MetricNames::default(),
        )
    }

    #[tokio::test]
    async fn test_recording_rules_win_when_present() {
        let names = MetricNames::default();
        let source = Arc::new(FakeSource::new());
        let store = Arc::new(MemoryStore::new());
        source.respond(
            &queries::job_utilization_rule(&names, "42"),
            vec![scalar("42", "12.345")],
        );
        source.respond(&queries::job_memory_rule(&names, "42"), vec![scalar("42", "55.56")]);
        source.respond(&queries::job_gpu_count_rule(&names, "42"), vec![scalar("42", "4")]);
        store.insert(stored("42", 90.0, 4, false));

        let summary = service(&source, &store)
            .job_summary("42", t0())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(summary.source, LookupSource::RecordingRules);
        assert_eq!(summary.avg_utilization, 12.3);
        assert_eq!(summary.memory_pct, 55.6);
        assert_eq!(summary.gpu_count, 4);
        assert!(summary.is_underutilized);
        assert_eq!(summary.is_complete, None);
    }

    #[tokio::test]
    async fn test_falls_back_to_dcgm_average() {
        let names = MetricNames::default();
        let source = Arc::new(FakeSource::new());
        let store = Arc::new(MemoryStore::new());
        source.fail(&queries::job_utilization_rule(&names, "42"), "no such rule");
        source.respond(
            &queries::job_utilization(&names, "42"),
            vec![dcgm("n1", "0", "42", "70"), dcgm("n1", "1", "42", "35")],
        );
        source.respond(
            &queries::job_memory_used(&names, "42"),
            vec![dcgm("n1", "0", "42", "1"), dcgm("n1", "1", "42", "1")],
        );
        source.respond(
            &queries::job_memory_free(&names, "42"),
            vec![dcgm("n1", "0", "42", "2"), dcgm("n1", "1", "42", "2")],
        );

        let summary = service(&source, &store)
            .job_summary("42", t0())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(summary.source, LookupSource::Dcgm);
        assert_eq!(summary.avg_utilization, 52.5);
        assert_eq!(summary.memory_pct, 33.3);
        assert_eq!(summary.gpu_count, 2);
        assert!(!summary.is_underutilized);
    }

    #[tokio::test]
    async fn test_falls_back_to_database_record() {
        let source = Arc::new(FakeSource::new());
        let store = Arc::new(MemoryStore::new());
        store.insert(stored("7", 25.04, 2, true));

        let summary = service(&source, &store)
            .job_summary("7", t0())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(summary.source, LookupSource::Database);
        assert_eq!(summary.avg_utilization, 25.0);
        assert_eq!(summary.memory_pct, 33.3);
        assert_eq!(summary.is_complete, Some(true));
        assert!(summary.is_underutilized);
    }

    #[tokio::test]
    async fn test_unknown_job_is_none() {
        let source = Arc::new(FakeSource::new());
        let store = Arc::new(MemoryStore::new());
        assert!(service(&source, &store)
            .job_summary("nope", t0())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_idle_job_id_is_never_queried() {
        let source = Arc::new(FakeSource::new());
        let store = Arc::new(MemoryStore::new());
        store.insert(stored("0", 80.0, 1, false));
        let lookup = service(&source, &store);

        assert!(lookup.job_summary("0", t0()).await.unwrap().is_none());
        assert!(lookup.job_summary("", t0()).await.unwrap().is_none());
        assert!(source.issued().is_empty());
    }

    #[tokio::test]
    async fn test_underutilized_uses_unrounded_average() {
        let source = Arc::new(FakeSource::new());
        let store = Arc::new(MemoryStore::new());
        store.insert(stored("7", 29.96, 1, false));

        let summary = service(&source, &store)
            .job_summary("7", t0())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(summary.avg_utilization, 30.0);
        assert!(summary.is_underutilized);
    }

    #[tokio::test]
    async fn test_database_only_when_gpu_integration_disabled() {
        let source = Arc::new(FakeSource::new());
        let store = Arc::new(MemoryStore::new());
        store.insert(stored("7", 80.0, 1, false));
        let lookup = GpuLookupService::new(
            Some(source.clone() as Arc<dyn MetricsSource>),
            Some(store.clone() as Arc<dyn JobMetricStore>),
            Integrations {
                job_metrics: true,
                gpu_utilization: false,
            },
            CaptureSettings::default(),
            MetricNames::default(),
        );

        let summary = lookup.job_summary("7", t0()).await.unwrap().unwrap();
        assert_eq!(summary.source, LookupSource::Database);
        assert!(source.issued().is_empty());
    }

    #[tokio::test]
    async fn test_nothing_available_is_an_error() {
        let lookup = GpuLookupService::new(
            None,
            None,
            Integrations::default(),
            CaptureSettings::default(),
            MetricNames::default(),
        );
        assert!(matches!(
            lookup.job_summary("7", t0()).await,
            Err(LookupError::DatabaseNotConfigured)
        ));
        assert!(matches!(
            lookup.overview(t0() - Duration::days(1), t0()).await,
            Err(LookupError::DatabaseNotConfigured)
        ));
    }

    #[tokio::test]
    async fn test_overview_rounds_and_counts() {
        let source = Arc::new(FakeSource::new());
        let store = Arc::new(MemoryStore::new());
        store.insert(stored("1", 10.0, 2, true));
        store.insert(stored("2", 55.6, 4, false));
        let mut old = stored("3", 99.0, 8, true);
        old.first_seen = t0() - Duration::days(10);
        old.last_seen = t0() - Duration::days(9);
        store.insert(old);

        let overview = service(&source, &store)
            .overview(t0() - Duration::days(1), t0())
            .await
            .unwrap();

        assert_eq!(overview.total_jobs, 2);
        assert_eq!(overview.total_gpus, 6);
        assert_eq!(overview.underutilized_jobs, 1);
        assert_eq!(overview.avg_utilization, 32.8);
        assert_eq!(overview.avg_memory_pct, 33.3);
    }
}
