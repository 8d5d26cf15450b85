//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps the ComfyUI HTTP API (workflow submission, queue deletion,
//! history retrieval, output download, system stats) using [`reqwest`].

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use relay_core::error::NodeErrorDetail;
use serde::Deserialize;

use crate::history::{HistoryEntry, ImageRef};
use crate::template::Workflow;

/// Upper bound for the liveness check.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Server-assigned identifier of a queued prompt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PromptId(String);

impl PromptId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PromptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// HTTP client for a single ComfyUI instance.
#[derive(Debug, Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Response returned by the ComfyUI `/prompt` endpoint.
///
/// On rejection the server fills `error` and/or `node_errors` instead of
/// `prompt_id`.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    #[serde(default)]
    pub prompt_id: Option<String>,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: Option<i64>,
    /// Per-node validation errors. Either `{node: [error]}` or the
    /// server's `{node: {"errors": [error], ...}}` shape.
    #[serde(default)]
    pub node_errors: Option<serde_json::Value>,
    /// A plain string or an object with a `message` field.
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

impl SubmitResponse {
    fn error_message(&self) -> Option<String> {
        match self.error.as_ref()? {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) if s.is_empty() => None,
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(
                other
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_owned)
                    .unwrap_or_else(|| other.to_string()),
            ),
        }
    }

    fn node_error_details(&self) -> BTreeMap<String, Vec<NodeErrorDetail>> {
        let Some(serde_json::Value::Object(nodes)) = self.node_errors.as_ref() else {
            return BTreeMap::new();
        };

        nodes
            .iter()
            .filter_map(|(node_id, value)| {
                let list = value.get("errors").unwrap_or(value).as_array()?;
                let details: Vec<_> = list.iter().map(parse_node_error).collect();
                (!details.is_empty()).then(|| (node_id.clone(), details))
            })
            .collect()
    }
}

fn parse_node_error(value: &serde_json::Value) -> NodeErrorDetail {
    let field = |name: &str| {
        value
            .get(name)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_owned()
    };
    NodeErrorDetail {
        error_type: field("type"),
        message: field("message"),
        details: field("details"),
    }
}

/// Subset of `GET /system_stats`.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemStats {
    pub system: SystemInfo,
    #[serde(default)]
    pub devices: Vec<DeviceInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemInfo {
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub python_version: String,
}

/// A compute device reported by the server.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    #[serde(rename = "type", default)]
    pub device_type: String,
    #[serde(default)]
    pub vram_total: i64,
    #[serde(default)]
    pub vram_free: i64,
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout, body decode).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// `/prompt` refused the workflow.
    #[error("Prompt rejected: {message}")]
    Rejected {
        message: String,
        node_errors: BTreeMap<String, Vec<NodeErrorDetail>>,
    },

    /// A success response whose body did not have the expected shape.
    #[error("Unexpected response from ComfyUI: {0}")]
    InvalidResponse(String),

    /// The history has no entry for the prompt.
    #[error("Prompt {0} not found in history")]
    HistoryNotFound(PromptId),

    /// The history entry exists but no node produced an image.
    #[error("Prompt {0} produced no output image")]
    NoOutput(PromptId),

    /// The configured base URL cannot carry an HTTP path.
    #[error("Invalid ComfyUI base URL: {0}")]
    InvalidUrl(String),

    /// `/view` answered successfully with an empty body.
    #[error("Output file {0} is empty")]
    EmptyOutput(String),
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    pub fn new(api_url: String) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Create an API client reusing an existing [`reqwest::Client`]
    /// (useful for sharing a connection pool and timeout settings).
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_owned(),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Submit a workflow for execution.
    ///
    /// Sends `POST /prompt` with the workflow and the push-channel client
    /// ID. A non-success status or an `error` field yields
    /// [`ComfyUIApiError::Rejected`] with any per-node details. Never
    /// retries.
    pub async fn submit_workflow(
        &self,
        workflow: &Workflow,
        client_id: &str,
    ) -> Result<PromptId, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(self.endpoint(&["prompt"])?)
            .json(&body)
            .send()
            .await
            .inspect_err(|e| tracing::warn!(error = %e, "Workflow submission request failed"))?;

        let status = response.status();
        let text = response.text().await?;
        let parsed = serde_json::from_str::<SubmitResponse>(&text);

        if !status.is_success() {
            let (message, node_errors) = match &parsed {
                Ok(resp) => (
                    resp.error_message()
                        .unwrap_or_else(|| format!("server returned {}", status.as_u16())),
                    resp.node_error_details(),
                ),
                Err(_) => (
                    format!("server returned {}: {}", status.as_u16(), text),
                    BTreeMap::new(),
                ),
            };
            tracing::warn!(
                status = status.as_u16(),
                error = %message,
                node_error_count = node_errors.len(),
                "ComfyUI rejected workflow",
            );
            return Err(ComfyUIApiError::Rejected {
                message,
                node_errors,
            });
        }

        let resp = parsed.map_err(|e| ComfyUIApiError::InvalidResponse(e.to_string()))?;

        if let Some(message) = resp.error_message() {
            let node_errors = resp.node_error_details();
            tracing::warn!(error = %message, "ComfyUI reported a submission error");
            return Err(ComfyUIApiError::Rejected {
                message,
                node_errors,
            });
        }

        match resp.prompt_id {
            Some(id) if !id.is_empty() => {
                tracing::debug!(prompt_id = %id, number = ?resp.number, "Workflow queued");
                Ok(PromptId(id))
            }
            _ => Err(ComfyUIApiError::InvalidResponse(
                "submission response has no prompt_id".into(),
            )),
        }
    }

    /// Remove a queued prompt.
    ///
    /// Sends `POST /queue` with `{"delete": [prompt_id]}`. Has no effect on
    /// a prompt that is already executing or finished.
    pub async fn cancel_execution(&self, prompt_id: &PromptId) -> Result<(), ComfyUIApiError> {
        let body = serde_json::json!({
            "delete": [prompt_id.as_str()],
        });

        let response = self
            .client
            .post(self.endpoint(&["queue"])?)
            .json(&body)
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Retrieve the history entry for a specific prompt.
    ///
    /// Sends `GET /history/{prompt_id}`. A response without an entry for
    /// the prompt is [`ComfyUIApiError::HistoryNotFound`].
    pub async fn get_history(&self, prompt_id: &PromptId) -> Result<HistoryEntry, ComfyUIApiError> {
        let response = self
            .client
            .get(self.endpoint(&["history", prompt_id.as_str()])?)
            .send()
            .await?;

        let body: serde_json::Value = Self::parse_response(response).await?;

        HistoryEntry::from_response(&body, prompt_id.as_str())
            .map_err(|e| ComfyUIApiError::InvalidResponse(e.to_string()))?
            .ok_or_else(|| ComfyUIApiError::HistoryNotFound(prompt_id.clone()))
    }

    /// Find the output image of a completed prompt.
    pub async fn resolve_output(&self, prompt_id: &PromptId) -> Result<ImageRef, ComfyUIApiError> {
        let entry = self.get_history(prompt_id).await?;
        entry
            .first_image()
            .cloned()
            .ok_or_else(|| ComfyUIApiError::NoOutput(prompt_id.clone()))
    }

    /// Download the raw bytes of an output file via `GET /view`.
    pub async fn download_image(&self, image: &ImageRef) -> Result<Vec<u8>, ComfyUIApiError> {
        let mut query = vec![("filename", image.filename.as_str())];
        if !image.subfolder.is_empty() {
            query.push(("subfolder", image.subfolder.as_str()));
        }
        if !image.category.is_empty() {
            query.push(("type", image.category.as_str()));
        }

        let response = self
            .client
            .get(self.endpoint(&["view"])?)
            .query(&query)
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(ComfyUIApiError::EmptyOutput(image.filename.clone()));
        }
        Ok(bytes.to_vec())
    }

    /// Liveness check: any 2xx from `GET /system_stats` is healthy.
    pub async fn check_health(&self) -> Result<(), ComfyUIApiError> {
        let response = self
            .client
            .get(self.endpoint(&["system_stats"])?)
            .timeout(HEALTH_CHECK_TIMEOUT)
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Fetch and parse `GET /system_stats`.
    pub async fn system_stats(&self) -> Result<SystemStats, ComfyUIApiError> {
        let response = self
            .client
            .get(self.endpoint(&["system_stats"])?)
            .timeout(HEALTH_CHECK_TIMEOUT)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    // ---- private helpers ----

    /// Build `<api_url>/<segments...>`, percent-encoding each segment.
    fn endpoint(&self, segments: &[&str]) -> Result<reqwest::Url, ComfyUIApiError> {
        let invalid = || ComfyUIApiError::InvalidUrl(self.api_url.clone());
        let mut url = reqwest::Url::parse(&self.api_url).map_err(|_| invalid())?;
        url.path_segments_mut()
            .map_err(|_| invalid())?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    /// Assert the response has a success status code, discarding the body.
    async fn check_status(response: reqwest::Response) -> Result<(), ComfyUIApiError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}
