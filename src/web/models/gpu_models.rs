use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::ClusterOverview;
use crate::gpu::{CaptureReport, JobGpuSummary, LookupSource};

#[derive(Debug, Deserialize)]
pub struct GpuQuery {
    pub job_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobGpuData {
    pub job_id: String,
    pub avg_utilization: f64,
    pub memory_pct: f64,
    pub gpu_count: i32,
    pub is_underutilized: bool,
    pub source: LookupSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_complete: Option<bool>,
}

impl From<JobGpuSummary> for JobGpuData {
    fn from(summary: JobGpuSummary) -> Self {
        Self {
            job_id: summary.job_id,
            avg_utilization: summary.avg_utilization,
            memory_pct: summary.memory_pct,
            gpu_count: summary.gpu_count,
            is_underutilized: summary.is_underutilized,
            source: summary.source,
            is_complete: summary.is_complete,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobGpuResponse {
    pub status: u16,
    pub data: JobGpuData,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverviewData {
    pub avg_utilization: f64,
    pub memory_utilization: f64,
    #[serde(rename = "totalGPUs")]
    pub total_gpus: i64,
    pub total_jobs: i64,
    pub underutilized_jobs: i64,
}

impl From<ClusterOverview> for OverviewData {
    fn from(overview: ClusterOverview) -> Self {
        Self {
            avg_utilization: overview.avg_utilization,
            memory_utilization: overview.avg_memory_pct,
            total_gpus: overview.total_gpus,
            total_jobs: overview.total_jobs,
            underutilized_jobs: overview.underutilized_jobs,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct OverviewResponse {
    pub status: u16,
    pub data: OverviewData,
    pub source: LookupSource,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureResponse {
    pub status: u16,
    pub message: String,
    pub captured: usize,
    pub updated: usize,
    pub marked_complete: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limited: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_capture_in: Option<u64>,
}

impl CaptureResponse {
    pub fn completed(report: CaptureReport) -> Self {
        Self {
            status: 200,
            message: format!("Captured GPU metrics for {} jobs", report.captured),
            captured: report.captured,
            updated: report.updated,
            marked_complete: report.marked_complete,
            errors: report.errors,
            rate_limited: None,
            next_capture_in: None,
        }
    }

    pub fn rate_limited(next_capture_in: u64) -> Self {
        Self {
            status: 429,
            message: format!("Rate limited. Next capture allowed in {next_capture_in}s"),
            captured: 0,
            updated: 0,
            marked_complete: 0,
            errors: Vec::new(),
            rate_limited: Some(true),
            next_capture_in: Some(next_capture_in),
        }
    }
}
