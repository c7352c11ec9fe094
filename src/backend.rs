//! Backend connection module
//!
//! The orchestrator reaches the test backend through the `TestBackend` trait.
//! `HttpBackend` is the production implementation: a thin reqwest client that
//! unwraps the backend's `{code, message, data}` envelope.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::BackendConfig;
use crate::error::{BackendError, BackendResult};
use crate::models::{
    CollectResult, ConfigEntry, PrecheckPayload, ProbeSnapshot, RawReport, RunOutcome,
    TestConfig, ValidationReport,
};

/// Remote operations the workflow depends on.
///
/// Every call receives the run's cancellation token; implementations must
/// resolve to `BackendError::Cancelled` once it fires.
#[async_trait]
pub trait TestBackend: Send + Sync {
    async fn list_configs(&self, cancel: &CancellationToken) -> BackendResult<Vec<ConfigEntry>>;

    async fn get_config(&self, name: &str, cancel: &CancellationToken) -> BackendResult<TestConfig>;

    async fn validate_config(&self, name: &str, cancel: &CancellationToken) -> BackendResult<ValidationReport>;

    async fn precheck(&self, name: &str, cancel: &CancellationToken) -> BackendResult<PrecheckPayload>;

    async fn run(&self, name: &str, cancel: &CancellationToken) -> BackendResult<RunOutcome>;

    async fn probe(&self, name: &str, cancel: &CancellationToken) -> BackendResult<ProbeSnapshot>;

    async fn collect(&self, name: &str, cancel: &CancellationToken) -> BackendResult<CollectResult>;

    async fn report(&self, name: &str, cancel: &CancellationToken) -> BackendResult<RawReport>;
}

// ============ Envelope ============

#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    errors: Vec<String>,
}

/// Decode a raw response body into the payload type.
///
/// Non-2xx answers are still decoded as application errors when the body is
/// a proper envelope with `code != 0`.
pub fn decode_envelope<T: DeserializeOwned>(http_status: u16, body: &str) -> BackendResult<T> {
    let http_ok = (200..300).contains(&http_status);

    if body.trim().is_empty() {
        return Err(BackendError::transport(format!("empty response body (HTTP {})", http_status)));
    }

    let envelope: Envelope = match serde_json::from_str(body) {
        Ok(env) => env,
        Err(e) if http_ok => {
            return Err(BackendError::transport(format!("malformed response: {}", e)));
        }
        Err(_) => {
            return Err(BackendError::transport(format!("HTTP error {}", http_status)));
        }
    };

    if envelope.code != 0 {
        let data_errors = envelope.data
            .as_ref()
            .and_then(|d| d.get("errors"))
            .and_then(|e| e.as_array())
            .map(|arr| arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect::<Vec<_>>())
            .unwrap_or_default();

        let errors = merge_errors(envelope.errors, data_errors);
        let message = if envelope.message.is_empty() {
            "unknown error".to_string()
        } else {
            envelope.message
        };

        return Err(if errors.is_empty() {
            BackendError::Application { code: envelope.code, message }
        } else {
            BackendError::ValidationFailure { message, errors }
        });
    }

    if !http_ok {
        return Err(BackendError::transport(format!("HTTP error {}", http_status)));
    }

    let data = envelope.data
        .ok_or_else(|| BackendError::transport("response envelope carries no data"))?;
    serde_json::from_value(data)
        .map_err(|e| BackendError::transport(format!("malformed response data: {}", e)))
}

/// Concatenate both error lists, dropping repeats
fn merge_errors(top_level: Vec<String>, nested: Vec<String>) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(top_level.len() + nested.len());
    for err in top_level.into_iter().chain(nested) {
        if !merged.contains(&err) {
            merged.push(err);
        }
    }
    merged
}

// ============ HTTP Backend ============

pub struct HttpBackend {
    client: reqwest::Client,
    base: String,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> BackendResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        let base = format!(
            "{}{}",
            config.base_url.trim_end_matches('/'),
            config.api_prefix.trim_end_matches('/')
        );

        Ok(Self { client, base })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        cancel: &CancellationToken,
    ) -> BackendResult<T> {
        let exchange = async move {
            let response = request.send().await?;
            let status = response.status().as_u16();
            let body = response.text().await?;
            Ok::<_, BackendError>((status, body))
        };

        let (status, body) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            result = exchange => result?,
        };

        debug!("Backend answered HTTP {} ({} bytes)", status, body.len());
        decode_envelope(status, &body)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, cancel: &CancellationToken) -> BackendResult<T> {
        let url = self.url(path);
        debug!("GET {}", url);
        self.send(self.client.get(url), cancel).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, cancel: &CancellationToken) -> BackendResult<T> {
        let url = self.url(path);
        debug!("POST {}", url);
        self.send(self.client.post(url), cancel).await
    }
}

fn config_path(name: &str, action: &str) -> String {
    format!("/configs/{}/{}", encode_segment(name), action)
}

/// Percent-encode a config name for use as one path segment
fn encode_segment(name: &str) -> String {
    urlencoding::encode(name).into_owned()
}

#[async_trait]
impl TestBackend for HttpBackend {
    async fn list_configs(&self, cancel: &CancellationToken) -> BackendResult<Vec<ConfigEntry>> {
        self.get("/configs", cancel).await
    }

    async fn get_config(&self, name: &str, cancel: &CancellationToken) -> BackendResult<TestConfig> {
        self.get(&format!("/configs/{}", encode_segment(name)), cancel).await
    }

    async fn validate_config(&self, name: &str, cancel: &CancellationToken) -> BackendResult<ValidationReport> {
        let report: ValidationReport = self.post(&config_path(name, "validate"), cancel).await?;
        if !report.valid {
            return Err(BackendError::ValidationFailure {
                message: "config validation failed".to_string(),
                errors: report.errors,
            });
        }
        Ok(report)
    }

    async fn precheck(&self, name: &str, cancel: &CancellationToken) -> BackendResult<PrecheckPayload> {
        self.post(&config_path(name, "precheck"), cancel).await
    }

    async fn run(&self, name: &str, cancel: &CancellationToken) -> BackendResult<RunOutcome> {
        self.post(&config_path(name, "run"), cancel).await
    }

    async fn probe(&self, name: &str, cancel: &CancellationToken) -> BackendResult<ProbeSnapshot> {
        self.post(&config_path(name, "probe"), cancel).await
    }

    async fn collect(&self, name: &str, cancel: &CancellationToken) -> BackendResult<CollectResult> {
        self.post(&config_path(name, "collect"), cancel).await
    }

    async fn report(&self, name: &str, cancel: &CancellationToken) -> BackendResult<RawReport> {
        self.get(&config_path(name, "report"), cancel).await
    }
}
