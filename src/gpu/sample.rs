use crate::prometheus::InstantSample;
use crate::server::config::MetricNames;

/// Identifies one physical GPU: the reporting host plus the device index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuKey {
    pub host: String,
    pub gpu: String,
}

impl GpuKey {
    pub fn new(host: impl Into<String>, gpu: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            gpu: gpu.into(),
        }
    }
}

/// A single DCGM data point attributed to a GPU and (possibly) a job.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuSample {
    pub key: GpuKey,
    /// Empty when the exporter did not attach a job label.
    pub job_id: String,
    pub value: f64,
}

impl GpuSample {
    pub fn new(host: &str, gpu: &str, job_id: &str, value: f64) -> Self {
        Self {
            key: GpuKey::new(host, gpu),
            job_id: job_id.to_string(),
            value,
        }
    }

    /// Converts a raw Prometheus series. Returns `None` when the value is not
    /// a finite number.
    pub fn from_instant(sample: &InstantSample, names: &MetricNames) -> Option<Self> {
        let value = parse_sample_value(&sample.value)?;
        Some(Self {
            key: GpuKey::new(
                sample.label(&names.host_label).unwrap_or_default(),
                sample.label(&names.gpu_label).unwrap_or_default(),
            ),
            job_id: sample
                .label(&names.job_label)
                .unwrap_or_default()
                .trim()
                .to_string(),
            value,
        })
    }

    /// `true` when the sample belongs to no job: no label, or the idle sentinel `"0"`.
    pub fn is_idle(&self) -> bool {
        is_idle_job(&self.job_id)
    }
}

pub fn is_idle_job(job_id: &str) -> bool {
    job_id.is_empty() || job_id == "0"
}

/// Parses a Prometheus sample value. Anything that is not a finite number
/// (garbage, `NaN`, `+Inf`) yields `None` and the sample is excluded.
pub fn parse_sample_value(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Rounds to one decimal place.
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Converts raw series, dropping the ones whose value does not parse.
pub fn convert_all(samples: &[InstantSample], names: &MetricNames) -> Vec<GpuSample> {
    samples
        .iter()
        .filter_map(|s| GpuSample::from_instant(s, names))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn instant(labels: &[(&str, &str)], value: &str) -> InstantSample {
        InstantSample {
            metric: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_parse_sample_value_policy() {
        assert_eq!(parse_sample_value("80"), Some(80.0));
        assert_eq!(parse_sample_value(" 12.5 "), Some(12.5));
        assert_eq!(parse_sample_value("NaN"), None);
        assert_eq!(parse_sample_value("+Inf"), None);
        assert_eq!(parse_sample_value(""), None);
        assert_eq!(parse_sample_value("abc"), None);
    }

    #[test]
    fn test_round1() {
        assert_eq!(round1(66.66), 66.7);
        assert_eq!(round1(12.34), 12.3);
        assert_eq!(round1(0.0), 0.0);
    }

    #[test]
    fn test_from_instant_reads_configured_labels() {
        let names = MetricNames::default();
        let raw = instant(&[("Hostname", "n1"), ("gpu", "3"), ("hpc_job", " 42 ")], "55");
        let sample = GpuSample::from_instant(&raw, &names).unwrap();
        assert_eq!(sample.key, GpuKey::new("n1", "3"));
        assert_eq!(sample.job_id, "42");
        assert_eq!(sample.value, 55.0);
        assert!(!sample.is_idle());

        let unparsable = instant(&[("Hostname", "n1"), ("gpu", "3")], "NaN");
        assert!(GpuSample::from_instant(&unparsable, &names).is_none());
    }

    #[test]
    fn test_idle_sentinels() {
        assert!(is_idle_job(""));
        assert!(is_idle_job("0"));
        assert!(!is_idle_job("00"));
        assert!(!is_idle_job("7"));
    }

    #[test]
    fn test_gpu_key_does_not_collide_on_separator() {
        // "a-b" + "1" and "a" + "b-1" would collide as "host-gpu" strings.
        assert_ne!(GpuKey::new("a-b", "1"), GpuKey::new("a", "b-1"));
    }
}
