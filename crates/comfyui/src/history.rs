//! Execution history (ledger) types returned by `GET /history/{prompt_id}`.
//!
//! Node outputs are kept in the order the server returned them, which
//! drives the first-image selection in [`HistoryEntry::first_image`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reference to a file produced by a node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// Storage category (`output`, `temp`, `input`).
    #[serde(rename = "type", default)]
    pub category: String,
}

/// Outputs produced by one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutput {
    pub node_id: String,
    pub images: Vec<ImageRef>,
}

/// Server-side completion status of a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExecutionStatus {
    #[serde(default)]
    pub status_str: String,
    #[serde(default)]
    pub completed: bool,
}

/// Ledger entry for one prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    /// Node outputs in server order.
    pub outputs: Vec<NodeOutput>,
    pub status: Option<ExecutionStatus>,
}

#[derive(Deserialize)]
struct RawEntry {
    #[serde(default)]
    outputs: Map<String, Value>,
    #[serde(default)]
    status: Option<ExecutionStatus>,
}

#[derive(Deserialize)]
struct RawNodeOutput {
    #[serde(default)]
    images: Vec<ImageRef>,
}

impl HistoryEntry {
    /// Extract the entry for `prompt_id` from a full `/history` response
    /// body. Returns `Ok(None)` when the prompt is absent.
    pub fn from_response(body: &Value, prompt_id: &str) -> Result<Option<Self>, serde_json::Error> {
        match body.get(prompt_id) {
            Some(entry) => Self::from_value(entry.clone()).map(Some),
            None => Ok(None),
        }
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let raw: RawEntry = serde_json::from_value(value)?;

        let outputs = raw
            .outputs
            .into_iter()
            .map(|(node_id, output)| {
                // Nodes may emit non-image outputs (text, latents, gifs).
                let images = match serde_json::from_value::<RawNodeOutput>(output) {
                    Ok(parsed) => parsed.images,
                    Err(e) => {
                        tracing::debug!(node_id = %node_id, error = %e, "Skipping non-image node output");
                        Vec::new()
                    }
                };
                NodeOutput { node_id, images }
            })
            .collect();

        Ok(Self {
            outputs,
            status: raw.status,
        })
    }

    /// First image of the first node (in server order) that produced any.
    ///
    /// Workflows are expected to produce a single image; any further
    /// images are ignored.
    pub fn first_image(&self) -> Option<&ImageRef> {
        self.outputs.iter().find_map(|node| node.images.first())
    }
}
