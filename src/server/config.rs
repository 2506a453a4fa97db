use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::gpu::MissingMemoryPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML from config file at {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("Failed to load config from environment: {0}")]
    Env(#[from] envy::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Which external integrations are switched on for this deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Integrations {
    pub job_metrics: bool,
    pub gpu_utilization: bool,
}

impl Default for Integrations {
    fn default() -> Self {
        Self {
            job_metrics: true,
            gpu_utilization: true,
        }
    }
}

/// Names of the DCGM series, their labels and the recording rules derived from them.
#[derive(Debug, Clone)]
pub struct MetricNames {
    pub util_metric: String,
    pub mem_used_metric: String,
    pub mem_free_metric: String,
    pub job_label: String,
    pub host_label: String,
    pub gpu_label: String,
    pub util_rule: String,
    pub mem_rule: String,
    pub gpu_count_rule: String,
}

impl Default for MetricNames {
    fn default() -> Self {
        Self {
            util_metric: "DCGM_FI_DEV_GPU_UTIL".to_string(),
            mem_used_metric: "DCGM_FI_DEV_FB_USED".to_string(),
            mem_free_metric: "DCGM_FI_DEV_FB_FREE".to_string(),
            job_label: "hpc_job".to_string(),
            host_label: "Hostname".to_string(),
            gpu_label: "gpu".to_string(),
            util_rule: "job:gpu_utilization:avg".to_string(),
            mem_rule: "job:gpu_memory_pct:avg".to_string(),
            gpu_count_rule: "job:gpu_count:sum".to_string(),
        }
    }
}

/// Tunables of the capture cycle and the read path.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub min_interval: Duration,
    pub completion_grace: Duration,
    pub underutilized_threshold: f64,
    pub missing_memory: MissingMemoryPolicy,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(60),
            completion_grace: Duration::from_secs(10 * 60),
            underutilized_threshold: 30.0,
            missing_memory: MissingMemoryPolicy::Zero,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub database_url: Option<String>,
    pub prometheus_url: Option<String>,
    pub prometheus_timeout: Duration,
    pub log_dir: String,
    pub integrations: Integrations,
    pub capture: CaptureSettings,
    /// When set, the server triggers a capture cycle on this period by itself.
    pub capture_interval: Option<Duration>,
    pub metrics: MetricNames,
}

// Partial config for layering
#[derive(Deserialize, Default, Debug)]
struct PartialServerConfig {
    bind_addr: Option<String>,
    database_url: Option<String>,
    prometheus_url: Option<String>,
    prometheus_timeout_secs: Option<u64>,
    log_dir: Option<String>,
    job_metrics_enabled: Option<bool>,
    gpu_utilization_enabled: Option<bool>,
    capture_min_interval_secs: Option<u64>,
    completion_grace_secs: Option<u64>,
    underutilized_threshold: Option<f64>,
    missing_memory_policy: Option<String>,
    capture_interval_secs: Option<u64>,
    util_metric: Option<String>,
    mem_used_metric: Option<String>,
    mem_free_metric: Option<String>,
    job_label: Option<String>,
    host_label: Option<String>,
    gpu_label: Option<String>,
    util_rule: Option<String>,
    mem_rule: Option<String>,
    gpu_count_rule: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

impl ServerConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        // 1. Load from file (optional)
        let file_config: PartialServerConfig = match config_path.map(Path::new) {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                    path: path.display().to_string(),
                    source,
                })?
            }
            _ => PartialServerConfig::default(),
        };

        // 2. Load from environment variables
        let env_config: PartialServerConfig = envy::from_env::<PartialServerConfig>()?;

        // 3. Merge: environment overrides file
        Self::merge(env_config, file_config)
    }

    fn merge(env: PartialServerConfig, file: PartialServerConfig) -> Result<Self, ConfigError> {
        let capture_defaults = CaptureSettings::default();
        let names = MetricNames::default();

        let missing_memory = match env.missing_memory_policy.or(file.missing_memory_policy) {
            Some(raw) => raw.parse().map_err(ConfigError::Invalid)?,
            None => capture_defaults.missing_memory,
        };

        let underutilized_threshold = env
            .underutilized_threshold
            .or(file.underutilized_threshold)
            .unwrap_or(capture_defaults.underutilized_threshold);
        if !underutilized_threshold.is_finite() || underutilized_threshold < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "underutilized_threshold must be a non-negative number, got {underutilized_threshold}"
            )));
        }

        let capture_interval = match env.capture_interval_secs.or(file.capture_interval_secs) {
            Some(0) => {
                return Err(ConfigError::Invalid(
                    "capture_interval_secs must be greater than zero".to_string(),
                ));
            }
            other => other.map(Duration::from_secs),
        };

        Ok(ServerConfig {
            bind_addr: env.bind_addr.or(file.bind_addr).unwrap_or_else(default_bind_addr),
            database_url: env.database_url.or(file.database_url).filter(|s| !s.trim().is_empty()),
            prometheus_url: env
                .prometheus_url
                .or(file.prometheus_url)
                .filter(|s| !s.trim().is_empty()),
            prometheus_timeout: Duration::from_secs(
                env.prometheus_timeout_secs.or(file.prometheus_timeout_secs).unwrap_or(10),
            ),
            log_dir: env.log_dir.or(file.log_dir).unwrap_or_else(default_log_dir),
            integrations: Integrations {
                job_metrics: env.job_metrics_enabled.or(file.job_metrics_enabled).unwrap_or(true),
                gpu_utilization: env
                    .gpu_utilization_enabled
                    .or(file.gpu_utilization_enabled)
                    .unwrap_or(true),
            },
            capture: CaptureSettings {
                min_interval: env
                    .capture_min_interval_secs
                    .or(file.capture_min_interval_secs)
                    .map(Duration::from_secs)
                    .unwrap_or(capture_defaults.min_interval),
                completion_grace: env
                    .completion_grace_secs
                    .or(file.completion_grace_secs)
                    .map(Duration::from_secs)
                    .unwrap_or(capture_defaults.completion_grace),
                underutilized_threshold,
                missing_memory,
            },
            capture_interval,
            metrics: MetricNames {
                util_metric: env.util_metric.or(file.util_metric).unwrap_or(names.util_metric),
                mem_used_metric: env
                    .mem_used_metric
                    .or(file.mem_used_metric)
                    .unwrap_or(names.mem_used_metric),
                mem_free_metric: env
                    .mem_free_metric
                    .or(file.mem_free_metric)
                    .unwrap_or(names.mem_free_metric),
                job_label: env.job_label.or(file.job_label).unwrap_or(names.job_label),
                host_label: env.host_label.or(file.host_label).unwrap_or(names.host_label),
                gpu_label: env.gpu_label.or(file.gpu_label).unwrap_or(names.gpu_label),
                util_rule: env.util_rule.or(file.util_rule).unwrap_or(names.util_rule),
                mem_rule: env.mem_rule.or(file.mem_rule).unwrap_or(names.mem_rule),
                gpu_count_rule: env
                    .gpu_count_rule
                    .or(file.gpu_count_rule)
                    .unwrap_or(names.gpu_count_rule),
            },
        })
    }
}
