//! PromQL expressions for DCGM series and the job-level recording rules.

use crate::server::config::MetricNames;

/// Escapes a value for use inside a double-quoted PromQL label matcher.
pub fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Selector matching every GPU that is currently allocated to a job.
fn active_job_selector(metric: &str, names: &MetricNames) -> String {
    format!(
        "{metric}{{{label}!=\"\",{label}!=\"0\"}}",
        label = names.job_label
    )
}

fn job_selector(metric: &str, names: &MetricNames, job_id: &str) -> String {
    format!(
        "{metric}{{{label}=\"{value}\"}}",
        label = names.job_label,
        value = escape_label_value(job_id)
    )
}

pub fn active_utilization(names: &MetricNames) -> String {
    active_job_selector(&names.util_metric, names)
}

pub fn active_memory_used(names: &MetricNames) -> String {
    active_job_selector(&names.mem_used_metric, names)
}

pub fn active_memory_free(names: &MetricNames) -> String {
    active_job_selector(&names.mem_free_metric, names)
}

pub fn job_utilization(names: &MetricNames, job_id: &str) -> String {
    job_selector(&names.util_metric, names, job_id)
}

pub fn job_memory_used(names: &MetricNames, job_id: &str) -> String {
    job_selector(&names.mem_used_metric, names, job_id)
}

pub fn job_memory_free(names: &MetricNames, job_id: &str) -> String {
    job_selector(&names.mem_free_metric, names, job_id)
}

pub fn job_utilization_rule(names: &MetricNames, job_id: &str) -> String {
    job_selector(&names.util_rule, names, job_id)
}

pub fn job_memory_rule(names: &MetricNames, job_id: &str) -> String {
    job_selector(&names.mem_rule, names, job_id)
}

pub fn job_gpu_count_rule(names: &MetricNames, job_id: &str) -> String {
    job_selector(&names.gpu_count_rule, names, job_id)
}
