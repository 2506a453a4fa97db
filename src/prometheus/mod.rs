//! Minimal async client for the Prometheus HTTP query API.
//!
//! Only instant queries are needed: the capture cycle and the per-job
//! lookup both ask "what is the value right now".

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[cfg(test)]
pub mod fake;

#[derive(Error, Debug)]
pub enum PrometheusError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Failed to decode Prometheus response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Prometheus query was not successful: {0}")]
    Query(String),
}

/// One series of an instant vector: its label set and the raw string value.
#[derive(Debug, Clone, PartialEq)]
pub struct InstantSample {
    pub metric: HashMap<String, String>,
    pub value: String,
}

impl InstantSample {
    pub fn label(&self, name: &str) -> Option<&str> {
        self.metric.get(name).map(String::as_str)
    }
}

/// Anything that can answer a PromQL instant query.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn instant_query(
        &self,
        query: &str,
        at: Option<DateTime<Utc>>,
    ) -> Result<Vec<InstantSample>, PrometheusError>;
}

// Structs for Deserializing Prometheus JSON Response

#[derive(Deserialize, Debug)]
struct PrometheusResponse {
    status: String,
    #[serde(default)]
    data: Option<PrometheusData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize, Debug)]
struct PrometheusData {
    #[serde(rename = "resultType")]
    result_type: String,
    #[serde(default)]
    result: Vec<PrometheusResult>,
}

#[derive(Deserialize, Debug)]
struct PrometheusResult {
    #[serde(default)]
    metric: HashMap<String, String>,
    value: Option<(f64, String)>,
}

/// Decodes the body of an `/api/v1/query` response into instant samples.
/// Series without a value are dropped.
pub fn parse_instant_response(body: &str) -> Result<Vec<InstantSample>, PrometheusError> {
    let response: PrometheusResponse = serde_json::from_str(body)?;
    if response.status != "success" {
        return Err(PrometheusError::Query(
            response.error.unwrap_or(response.status),
        ));
    }
    let Some(data) = response.data else {
        return Ok(Vec::new());
    };
    if data.result_type != "vector" {
        return Err(PrometheusError::Query(format!(
            "expected an instant vector, got {}",
            data.result_type
        )));
    }

    Ok(data
        .result
        .into_iter()
        .filter_map(|series| {
            series.value.map(|(_, value)| InstantSample {
                metric: series.metric,
                value,
            })
        })
        .collect())
}

#[derive(Clone, Debug)]
pub struct PrometheusClient {
    base_url: String,
    client: Client,
}

impl PrometheusClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, PrometheusError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(crate::version::user_agent())
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl MetricsSource for PrometheusClient {
    async fn instant_query(
        &self,
        query: &str,
        at: Option<DateTime<Utc>>,
    ) -> Result<Vec<InstantSample>, PrometheusError> {
        let url = format!("{}/api/v1/query", self.base_url);
        let mut params = vec![("query", query.to_string())];
        if let Some(at) = at {
            params.push(("time", at.timestamp().to_string()));
        }

        let response = self.client.get(&url).query(&params).send().await?;
        // Prometheus reports bad queries with a 4xx and a JSON error body, so
        // decode before checking the status.
        let status = response.status();
        let body = response.text().await?;
        match parse_instant_response(&body) {
            Err(PrometheusError::Decode(_)) if !status.is_success() => Err(
                PrometheusError::Query(format!("HTTP {status} from {url}")),
            ),
            other => other,
        }
    }
}
