use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

/// Boxed technical cause carried inside a [`GenerationError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Closed taxonomy of generation failures.
///
/// Every error that leaves the generation core carries exactly one of
/// these kinds, so the boundary layer can pick user-facing text purely
/// from the kind without inspecting the technical cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connectivity or transport failure towards the HTTP or push endpoint.
    BackendUnavailable,
    /// The idle deadline or the request deadline expired.
    Timeout,
    /// The workflow template is broken, or substitution produced invalid JSON.
    InvalidJob,
    /// The backend refused the submitted workflow.
    Rejected,
    /// The actor already holds an admission slot. No backend call was made.
    ConcurrencyConflict,
    /// Execution completed but the backend has no output for it.
    NoOutput,
    /// The caller cancelled the request. Not a failure.
    Cancelled,
}

impl ErrorKind {
    /// Text suitable for showing to the requesting user.
    pub fn user_message(self) -> &'static str {
        match self {
            ErrorKind::BackendUnavailable => {
                "The image generation service is currently unavailable. Please try again later."
            }
            ErrorKind::Timeout => {
                "Image generation took too long and was cancelled. Try a simpler prompt."
            }
            ErrorKind::InvalidJob => {
                "There's a problem with the image generation configuration. Please contact the administrator."
            }
            ErrorKind::Rejected => {
                "The prompt could not be processed. Please try rewording your request."
            }
            ErrorKind::ConcurrencyConflict => {
                "You already have a generation in progress. Please wait for it to complete."
            }
            ErrorKind::NoOutput => {
                "The generation finished but produced no image. Please try again later."
            }
            ErrorKind::Cancelled => "The generation was cancelled.",
        }
    }

    /// Whether the same request may succeed if submitted again.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::BackendUnavailable | ErrorKind::Timeout | ErrorKind::Rejected
        )
    }

    /// `false` only for [`ErrorKind::Cancelled`], which must not be
    /// reported to the user as an error.
    pub fn is_failure(self) -> bool {
        self != ErrorKind::Cancelled
    }

    /// Stable snake_case name used in logs and events.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::BackendUnavailable => "backend_unavailable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InvalidJob => "invalid_job",
            ErrorKind::Rejected => "rejected",
            ErrorKind::ConcurrencyConflict => "concurrency_conflict",
            ErrorKind::NoOutput => "no_output",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single node-level validation error reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeErrorDetail {
    pub error_type: String,
    pub message: String,
    pub details: String,
}

/// A classified failure from the generation core.
///
/// Wraps the underlying technical cause (available through
/// [`std::error::Error::source`]) together with its [`ErrorKind`].
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct GenerationError {
    kind: ErrorKind,
    message: String,
    /// Per-node validation errors, keyed by node id. Only populated for
    /// [`ErrorKind::Rejected`] submissions.
    node_errors: BTreeMap<String, Vec<NodeErrorDetail>>,
    #[source]
    source: Option<BoxError>,
}

impl GenerationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            node_errors: BTreeMap::new(),
            source: None,
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "request cancelled by caller")
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn concurrency_conflict(actor_id: crate::types::ActorId) -> Self {
        Self::new(
            ErrorKind::ConcurrencyConflict,
            format!("actor {actor_id} already has a generation in progress"),
        )
    }

    /// Attach the technical cause.
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_node_errors(mut self, node_errors: BTreeMap<String, Vec<NodeErrorDetail>>) -> Self {
        self.node_errors = node_errors;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn node_errors(&self) -> &BTreeMap<String, Vec<NodeErrorDetail>> {
        &self.node_errors
    }

    pub fn user_message(&self) -> &'static str {
        self.kind.user_message()
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}
