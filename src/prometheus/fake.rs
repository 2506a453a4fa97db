//! Scripted `MetricsSource` for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use super::{InstantSample, MetricsSource, PrometheusError};

/// Answers queries from a table; unknown queries return an empty vector.
#[derive(Default)]
pub struct FakeSource {
    answers: Mutex<HashMap<String, Result<Vec<InstantSample>, String>>>,
    issued: Mutex<Vec<String>>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, query: &str, samples: Vec<InstantSample>) {
        self.answers
            .lock()
            .unwrap()
            .insert(query.to_string(), Ok(samples));
    }

    pub fn fail(&self, query: &str, message: &str) {
        self.answers
            .lock()
            .unwrap()
            .insert(query.to_string(), Err(message.to_string()));
    }

    pub fn issued(&self) -> Vec<String> {
        self.issued.lock().unwrap().clone()
    }
}

/// Builds a DCGM-style series with the default label names.
pub fn dcgm(host: &str, gpu: &str, job: &str, value: &str) -> InstantSample {
    let mut metric = HashMap::new();
    metric.insert("Hostname".to_string(), host.to_string());
    metric.insert("gpu".to_string(), gpu.to_string());
    if !job.is_empty() {
        metric.insert("hpc_job".to_string(), job.to_string());
    }
    InstantSample {
        metric,
        value: value.to_string(),
    }
}

#[async_trait]
impl MetricsSource for FakeSource {
    async fn instant_query(
        &self,
        query: &str,
        _at: Option<DateTime<Utc>>,
    ) -> Result<Vec<InstantSample>, PrometheusError> {
        self.issued.lock().unwrap().push(query.to_string());
        match self.answers.lock().unwrap().get(query) {
            Some(Ok(samples)) => Ok(samples.clone()),
            Some(Err(message)) => Err(PrometheusError::Query(message.clone())),
            None => Ok(Vec::new()),
        }
    }
}
