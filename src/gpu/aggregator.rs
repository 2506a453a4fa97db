use std::collections::{BTreeMap, HashMap};

use super::MissingMemoryPolicy;
use super::sample::{GpuKey, GpuSample};

/// Per-job GPU statistics for one capture cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct JobAggregate {
    pub avg_utilization: f64,
    pub max_utilization: f64,
    pub min_utilization: f64,
    pub avg_memory_pct: f64,
    pub max_memory_pct: f64,
    pub gpu_count: i32,
    memory_samples: u32,
}

impl JobAggregate {
    fn first(utilization: f64, memory_pct: Option<f64>) -> Self {
        Self {
            avg_utilization: utilization,
            max_utilization: utilization,
            min_utilization: utilization,
            avg_memory_pct: memory_pct.unwrap_or(0.0),
            max_memory_pct: memory_pct.unwrap_or(0.0),
            gpu_count: 1,
            memory_samples: u32::from(memory_pct.is_some()),
        }
    }

    /// Folds one more GPU into the aggregate with an incremental mean.
    /// `memory_pct` of `None` leaves the memory statistics untouched.
    pub fn fold(&mut self, utilization: f64, memory_pct: Option<f64>) {
        let n = f64::from(self.gpu_count);
        self.avg_utilization = (self.avg_utilization * n + utilization) / (n + 1.0);
        self.max_utilization = self.max_utilization.max(utilization);
        self.min_utilization = self.min_utilization.min(utilization);
        self.gpu_count += 1;

        if let Some(pct) = memory_pct {
            let m = f64::from(self.memory_samples);
            self.avg_memory_pct = (self.avg_memory_pct * m + pct) / (m + 1.0);
            self.max_memory_pct = if self.memory_samples == 0 {
                pct
            } else {
                self.max_memory_pct.max(pct)
            };
            self.memory_samples += 1;
        }
    }

    /// Builds a cycle aggregate directly from its statistics.
    #[cfg(test)]
    pub fn from_parts(
        avg_utilization: f64,
        max_utilization: f64,
        min_utilization: f64,
        avg_memory_pct: f64,
        max_memory_pct: f64,
        gpu_count: i32,
    ) -> Self {
        Self {
            avg_utilization,
            max_utilization,
            min_utilization,
            avg_memory_pct,
            max_memory_pct,
            gpu_count,
            memory_samples: gpu_count.max(0) as u32,
        }
    }
}

/// Groups one cycle's DCGM samples by job.
///
/// Memory samples are matched to utilization samples through the GPU they
/// were reported for. Samples without a job (empty or `"0"`) are skipped.
pub fn aggregate_samples(
    utilization: &[GpuSample],
    memory_used: &[GpuSample],
    memory_free: &[GpuSample],
    policy: MissingMemoryPolicy,
) -> BTreeMap<String, JobAggregate> {
    let mem_used_by_gpu: HashMap<&GpuKey, f64> =
        memory_used.iter().map(|s| (&s.key, s.value)).collect();
    let mem_free_by_gpu: HashMap<&GpuKey, f64> =
        memory_free.iter().map(|s| (&s.key, s.value)).collect();

    let mut jobs: BTreeMap<String, JobAggregate> = BTreeMap::new();

    for sample in utilization {
        if sample.is_idle() {
            continue;
        }

        let memory_pct = match mem_used_by_gpu.get(&sample.key) {
            Some(&used) => {
                let free = mem_free_by_gpu.get(&sample.key).copied().unwrap_or(0.0);
                let total = used + free;
                Some(if total > 0.0 { used / total * 100.0 } else { 0.0 })
            }
            None => match policy {
                MissingMemoryPolicy::Zero => Some(0.0),
                MissingMemoryPolicy::Exclude => None,
            },
        };

        match jobs.get_mut(&sample.job_id) {
            Some(aggregate) => aggregate.fold(sample.value, memory_pct),
            None => {
                jobs.insert(
                    sample.job_id.clone(),
                    JobAggregate::first(sample.value, memory_pct),
                );
            }
        }
    }

    jobs
}
