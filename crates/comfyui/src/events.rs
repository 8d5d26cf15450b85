//! Events emitted by [`ImageGenerator`](crate::generator::ImageGenerator).
//!
//! The boundary layer can subscribe to these to show progress or keep
//! statistics without being on the request path.

use relay_core::error::ErrorKind;
use relay_core::types::ActorId;
use serde::Serialize;

/// A state change of one generation request.
#[derive(Debug, Clone, Serialize)]
pub enum GenerationEvent {
    /// The workflow was queued by ComfyUI.
    Submitted { actor_id: ActorId, prompt_id: String },

    /// A generation job made progress (step N of M).
    Progress {
        actor_id: ActorId,
        prompt_id: String,
        value: i32,
        max: i32,
        /// Completion percentage (0-100).
        percent: i16,
        /// The node currently executing, if known.
        current_node: Option<String>,
    },

    /// The output image was downloaded.
    Completed {
        actor_id: ActorId,
        prompt_id: String,
        /// Size of the downloaded image in bytes.
        bytes: usize,
    },

    /// The request ended with a classified failure.
    Failed {
        actor_id: ActorId,
        /// Absent when the request failed before submission.
        prompt_id: Option<String>,
        kind: ErrorKind,
        error: String,
    },

    /// The caller cancelled the request.
    Cancelled {
        actor_id: ActorId,
        prompt_id: Option<String>,
    },
}
