//! Mapping of stage errors onto the [`ErrorKind`] taxonomy.
//!
//! Each stage error converts into a [`GenerationError`] that keeps the
//! original error as its source, so callers can use `?` and the boundary
//! only ever sees classified errors.

use relay_core::error::{ErrorKind, GenerationError};

use crate::api::ComfyUIApiError;
use crate::client::ComfyUIClientError;
use crate::monitor::MonitorError;
use crate::template::TemplateError;

impl From<ComfyUIApiError> for GenerationError {
    fn from(err: ComfyUIApiError) -> Self {
        match err {
            ComfyUIApiError::Rejected {
                message,
                node_errors,
            } => GenerationError::new(ErrorKind::Rejected, message).with_node_errors(node_errors),
            ComfyUIApiError::Request(ref e) if e.is_timeout() => {
                GenerationError::new(ErrorKind::Timeout, err.to_string()).with_source(err)
            }
            ComfyUIApiError::HistoryNotFound(_)
            | ComfyUIApiError::NoOutput(_)
            | ComfyUIApiError::EmptyOutput(_) => {
                GenerationError::new(ErrorKind::NoOutput, err.to_string()).with_source(err)
            }
            ComfyUIApiError::ApiError { status: 404, .. } => {
                GenerationError::new(ErrorKind::NoOutput, err.to_string()).with_source(err)
            }
            ComfyUIApiError::Request(_)
            | ComfyUIApiError::ApiError { .. }
            | ComfyUIApiError::InvalidResponse(_)
            | ComfyUIApiError::InvalidUrl(_) => {
                GenerationError::new(ErrorKind::BackendUnavailable, err.to_string()).with_source(err)
            }
        }
    }
}

impl From<ComfyUIClientError> for GenerationError {
    fn from(err: ComfyUIClientError) -> Self {
        GenerationError::new(ErrorKind::BackendUnavailable, err.to_string()).with_source(err)
    }
}

impl From<TemplateError> for GenerationError {
    fn from(err: TemplateError) -> Self {
        GenerationError::new(ErrorKind::InvalidJob, err.to_string()).with_source(err)
    }
}

impl From<MonitorError> for GenerationError {
    fn from(err: MonitorError) -> Self {
        let kind = match &err {
            MonitorError::Channel(_) | MonitorError::ChannelClosed(_) => {
                ErrorKind::BackendUnavailable
            }
            MonitorError::ExecutionFailed(_) => ErrorKind::Rejected,
            MonitorError::IdleTimeout(_) | MonitorError::DeadlineExceeded => ErrorKind::Timeout,
            MonitorError::Cancelled => ErrorKind::Cancelled,
        };
        GenerationError::new(kind, err.to_string()).with_source(err)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use relay_core::error::NodeErrorDetail;

    use super::*;
    use crate::api::PromptId;

    fn kind_of(err: impl Into<GenerationError>) -> ErrorKind {
        err.into().kind()
    }

    #[test]
    fn api_errors() {
        let mut node_errors = BTreeMap::new();
        node_errors.insert(
            "4".to_string(),
            vec![NodeErrorDetail {
                error_type: "value_not_in_list".into(),
                message: "Value not in list".into(),
                details: "ckpt_name".into(),
            }],
        );
        let rejected: GenerationError = ComfyUIApiError::Rejected {
            message: "Prompt outputs failed validation".into(),
            node_errors,
        }
        .into();
        assert_eq!(rejected.kind(), ErrorKind::Rejected);
        assert_eq!(rejected.node_errors()["4"][0].details, "ckpt_name");

        assert_eq!(
            kind_of(ComfyUIApiError::ApiError {
                status: 500,
                body: "oops".into()
            }),
            ErrorKind::BackendUnavailable
        );
        assert_eq!(
            kind_of(ComfyUIApiError::ApiError {
                status: 404,
                body: String::new()
            }),
            ErrorKind::NoOutput
        );
        assert_eq!(
            kind_of(ComfyUIApiError::InvalidResponse("x".into())),
            ErrorKind::BackendUnavailable
        );
        assert_eq!(
            kind_of(ComfyUIApiError::HistoryNotFound(PromptId::new("1"))),
            ErrorKind::NoOutput
        );
        assert_eq!(
            kind_of(ComfyUIApiError::NoOutput(PromptId::new("1"))),
            ErrorKind::NoOutput
        );
        assert_eq!(
            kind_of(ComfyUIApiError::EmptyOutput("out.png".into())),
            ErrorKind::NoOutput
        );
    }

    #[test]
    fn client_and_template_errors() {
        assert_eq!(
            kind_of(ComfyUIClientError::Connection("refused".into())),
            ErrorKind::BackendUnavailable
        );
        assert_eq!(kind_of(TemplateError::MissingPlaceholder), ErrorKind::InvalidJob);
    }

    #[test]
    fn monitor_errors() {
        assert_eq!(kind_of(MonitorError::Cancelled), ErrorKind::Cancelled);
        assert_eq!(
            kind_of(MonitorError::IdleTimeout(Duration::from_secs(30))),
            ErrorKind::Timeout
        );
        assert_eq!(kind_of(MonitorError::DeadlineExceeded), ErrorKind::Timeout);
        assert_eq!(
            kind_of(MonitorError::ChannelClosed("1000".into())),
            ErrorKind::BackendUnavailable
        );
        assert_eq!(
            kind_of(MonitorError::ExecutionFailed(serde_json::json!({"exception_message": "OOM"}))),
            ErrorKind::Rejected
        );
    }

    #[test]
    fn execution_error_payload_is_in_message() {
        let err: GenerationError =
            MonitorError::ExecutionFailed(serde_json::json!({"exception_message": "OOM"})).into();
        assert!(err.message().contains("OOM"));
    }
}
