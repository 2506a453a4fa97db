//! One capture cycle: rate limit check, DCGM sampling, per-job aggregation,
//! upserts and completion marking.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::aggregator::aggregate_samples;
use super::queries;
use super::sample::convert_all;
use crate::db::JobMetricStore;
use crate::prometheus::MetricsSource;
use crate::server::config::{CaptureSettings, Integrations, MetricNames};

#[derive(Error, Debug, PartialEq)]
pub enum CaptureError {
    #[error("Job metrics integration is not enabled")]
    JobMetricsDisabled,
    #[error("GPU utilization integration is not enabled")]
    GpuUtilizationDisabled,
    #[error("Database connection not configured")]
    DatabaseNotConfigured,
    #[error("Prometheus connection not configured")]
    PrometheusNotConfigured,
    /// Without utilization samples no job can be attributed.
    #[error("Failed to query GPU utilization")]
    UtilizationUnavailable { errors: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CaptureReport {
    /// Jobs seen in this cycle.
    pub captured: usize,
    /// Jobs whose record was written successfully.
    pub updated: usize,
    pub marked_complete: u64,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    Completed(CaptureReport),
    RateLimited { next_capture_in: u64 },
}

/// Runs capture cycles against a metrics source and a job store.
#[derive(Clone)]
pub struct CaptureService {
    source: Option<Arc<dyn MetricsSource>>,
    store: Option<Arc<dyn JobMetricStore>>,
    integrations: Integrations,
    settings: CaptureSettings,
    names: MetricNames,
}

impl CaptureService {
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

    pub async fn run(&self, now: DateTime<Utc>) -> Result<CaptureOutcome, CaptureError> {
        if !self.integrations.job_metrics {
            return Err(CaptureError::JobMetricsDisabled);
        }
        if !self.integrations.gpu_utilization {
            return Err(CaptureError::GpuUtilizationDisabled);
        }
        let store = self
            .store
            .as_deref()
            .ok_or(CaptureError::DatabaseNotConfigured)?;
        let source = self
            .source
            .as_deref()
            .ok_or(CaptureError::PrometheusNotConfigured)?;

        if let Some(next_capture_in) = self.check_rate_limit(store, now).await {
            debug!(next_capture_in, "GPU capture rate limited.");
            return Ok(CaptureOutcome::RateLimited { next_capture_in });
        }

        let mut errors = Vec::new();

        // --- Sample Collector ---
        let util_query = queries::active_utilization(&self.names);
        let used_query = queries::active_memory_used(&self.names);
        let free_query = queries::active_memory_free(&self.names);
        let (util, used, free) = tokio::join!(
            source.instant_query(&util_query, Some(now)),
            source.instant_query(&used_query, Some(now)),
            source.instant_query(&free_query, Some(now)),
        );

        let used = used.unwrap_or_else(|e| {
            errors.push(format!("Memory used query failed: {e}"));
            Vec::new()
        });
        let free = free.unwrap_or_else(|e| {
            errors.push(format!("Memory free query failed: {e}"));
            Vec::new()
        });
        let util = match util {
            Ok(samples) => samples,
            Err(e) => {
                errors.insert(0, format!("GPU utilization query failed: {e}"));
                error!(error = %e, "GPU utilization query failed. Aborting capture.");
                return Err(CaptureError::UtilizationUnavailable { errors });
            }
        };

        // --- Job Aggregator ---
        let jobs = aggregate_samples(
            &convert_all(&util, &self.names),
            &convert_all(&used, &self.names),
            &convert_all(&free, &self.names),
            self.settings.missing_memory,
        );

        // --- Upsert Writer ---
        let mut updated = 0;
        for (job_id, aggregate) in &jobs {
            match store.upsert_job(job_id, aggregate, now).await {
                Ok(()) => updated += 1,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Failed to upsert job GPU metrics.");
                    errors.push(format!("Failed to update job {job_id}: {e}"));
                }
            }
        }

        // --- Completion Marker ---
        let active_job_ids: Vec<String> = jobs.keys().cloned().collect();
        let stale_before = chrono::Duration::from_std(self.settings.completion_grace)
            .ok()
            .and_then(|grace| now.checked_sub_signed(grace))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let marked_complete = match store.mark_stale_complete(&active_job_ids, stale_before).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Failed to mark stale jobs complete.");
                errors.push(format!("Failed to mark completed jobs: {e}"));
                0
            }
        };

        info!(
            captured = jobs.len(),
            updated,
            marked_complete,
            errors = errors.len(),
            "GPU capture cycle finished."
        );

        Ok(CaptureOutcome::Completed(CaptureReport {
            captured: jobs.len(),
            updated,
            marked_complete,
            errors,
        }))
    }

    /// Returns the seconds left to wait when the last capture is too recent.
    /// A failing check lets the capture proceed.
    async fn check_rate_limit(&self, store: &dyn JobMetricStore, now: DateTime<Utc>) -> Option<u64> {
        let last_seen = match store.latest_active_seen().await {
            Ok(Some(last_seen)) => last_seen,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Rate limit check failed. Proceeding with capture.");
                return None;
            }
        };

        let elapsed = ((now - last_seen).num_milliseconds().max(0) as f64) / 1000.0;
        let min_interval = self.settings.min_interval.as_secs_f64();
        if elapsed < min_interval {
            Some((min_interval - elapsed).ceil() as u64)
        } else {
            None
        }
    }

    /// Triggers a capture every `period` until the process exits.
    pub async fn run_periodic(self: Arc<Self>, period: Duration) {
        info!(interval_seconds = period.as_secs(), "Periodic GPU capture task started.");
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            match self.run(Utc::now()).await {
                Ok(CaptureOutcome::Completed(_)) => {}
                Ok(CaptureOutcome::RateLimited { next_capture_in }) => {
                    debug!(next_capture_in, "Skipping periodic capture, rate limited.");
                }
                Err(e) => {
                    error!(error = %e, "Periodic GPU capture failed.");
                }
            }
        }
    }
}
