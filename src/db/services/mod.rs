pub mod job_gpu_metric_service;

pub use job_gpu_metric_service::{PgJobMetricStore, ensure_schema};
