//! Workflow template loading and prompt substitution.
//!
//! A workflow template is a ComfyUI API-format workflow (JSON object)
//! containing the [`PROMPT_PLACEHOLDER`] token inside a string literal.
//! [`WorkflowTemplate::prepare`] splices JSON-escaped user text into the
//! raw template bytes and re-parses the result into a [`Workflow`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use serde_json::{Map, Value};

/// Token replaced by the user's prompt text.
pub const PROMPT_PLACEHOLDER: &str = "{{PROMPT}}";

/// A submittable workflow document.
///
/// Field order is preserved from the template.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Workflow(Map<String, Value>);

impl Workflow {
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Look up a value by JSON pointer (e.g. `/6/inputs/text`).
    pub fn pointer(&self, pointer: &str) -> Option<&Value> {
        let mut parts = pointer.strip_prefix('/')?.splitn(2, '/');
        let root = self.0.get(parts.next()?)?;
        match parts.next() {
            Some(rest) => root.pointer(&format!("/{rest}")),
            None => Some(root),
        }
    }
}

/// Errors from loading or filling a workflow template.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    /// The template file could not be read.
    #[error("Failed to read workflow template {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The template is not a JSON object.
    #[error("Invalid workflow JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    /// The raw template text lacks the placeholder token.
    #[error("Workflow must contain the {PROMPT_PLACEHOLDER} placeholder")]
    MissingPlaceholder,

    /// Substituting the prompt produced an unparsable document.
    #[error("Invalid workflow after prompt substitution: {0}")]
    InvalidAfterSubstitution(#[source] serde_json::Error),
}

/// Workflow template shared by all requests.
///
/// The raw text is swapped as a unit on reload, so concurrent
/// [`prepare`](Self::prepare) calls see either the old or the new
/// template, never a mix.
#[derive(Debug)]
pub struct WorkflowTemplate {
    path: Option<PathBuf>,
    raw: RwLock<Arc<str>>,
}

impl WorkflowTemplate {
    /// Load and validate the template at `path`.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, TemplateError> {
        let path = path.into();
        let raw = read_validated(&path)?;
        tracing::info!(path = %path.display(), bytes = raw.len(), "Loaded workflow template");
        Ok(Self {
            path: Some(path),
            raw: RwLock::new(raw),
        })
    }

    /// Build a template from in-memory text. Such a template cannot be
    /// reloaded.
    pub fn from_text(text: &str) -> Result<Self, TemplateError> {
        validate(text)?;
        Ok(Self {
            path: None,
            raw: RwLock::new(Arc::from(text)),
        })
    }

    /// Re-read the template from disk.
    ///
    /// On failure the previously loaded template stays in place and the
    /// error is returned.
    pub fn reload(&self) -> Result<(), TemplateError> {
        let Some(path) = self.path.as_deref() else {
            tracing::debug!("Workflow template has no backing file, nothing to reload");
            return Ok(());
        };

        let raw = read_validated(path).inspect_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Workflow template reload failed");
        })?;

        *self.raw.write().unwrap_or_else(PoisonError::into_inner) = raw;
        tracing::info!(path = %path.display(), "Reloaded workflow template");
        Ok(())
    }

    /// Fill the placeholder with `user_prompt` and parse the result.
    pub fn prepare(&self, user_prompt: &str) -> Result<Workflow, TemplateError> {
        let raw = Arc::clone(&self.raw.read().unwrap_or_else(PoisonError::into_inner));

        let escaped = escape_json_string(user_prompt);
        let filled = raw.replace(PROMPT_PLACEHOLDER, &escaped);

        let workflow = serde_json::from_str::<Map<String, Value>>(&filled)
            .map_err(TemplateError::InvalidAfterSubstitution)?;
        Ok(Workflow(workflow))
    }

    /// Current raw template text.
    pub fn raw(&self) -> Arc<str> {
        Arc::clone(&self.raw.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn read_validated(path: &Path) -> Result<Arc<str>, TemplateError> {
    let text = std::fs::read_to_string(path).map_err(|source| TemplateError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    validate(&text)?;
    Ok(Arc::from(text))
}

/// The template must parse as a JSON object and contain the placeholder in
/// its raw text, since substitution happens on the raw text.
fn validate(text: &str) -> Result<(), TemplateError> {
    serde_json::from_str::<Map<String, Value>>(text).map_err(TemplateError::InvalidJson)?;
    if !text.contains(PROMPT_PLACEHOLDER) {
        return Err(TemplateError::MissingPlaceholder);
    }
    Ok(())
}

/// JSON-string-encode `text` without the surrounding quotes.
fn escape_json_string(text: &str) -> String {
    let quoted = Value::String(text.to_owned()).to_string();
    quoted[1..quoted.len() - 1].to_owned()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;

    use super::*;

    const SIMPLE: &str = r#"{"clip_text":"{{PROMPT}}"}"#;

    fn write_template(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn prepare_escapes_quotes() {
        let template = WorkflowTemplate::from_text(SIMPLE).unwrap();
        let workflow = template.prepare(r#"A cat's "hat""#).unwrap();

        assert_eq!(workflow.as_map()["clip_text"], r#"A cat's "hat""#);
        assert_eq!(
            serde_json::to_string(&workflow).unwrap(),
            r#"{"clip_text":"A cat's \"hat\""}"#
        );
    }

    #[test]
    fn prepare_round_trips_hostile_text() {
        let template = WorkflowTemplate::from_text(SIMPLE).unwrap();
        let input = "back\\slash \"quoted\"\nnew line\ttab \u{0001} {{PROMPT}} end";
        let workflow = template.prepare(input).unwrap();
        assert_eq!(workflow.as_map()["clip_text"], input);
    }

    #[test]
    fn prepare_replaces_every_occurrence() {
        let template = WorkflowTemplate::from_text(
            r#"{"6":{"inputs":{"text":"{{PROMPT}}"}},"7":{"inputs":{"text":"no {{PROMPT}}, blurry"}}}"#,
        )
        .unwrap();
        let workflow = template.prepare("a fox").unwrap();

        assert_eq!(workflow.pointer("/6/inputs/text").unwrap(), "a fox");
        assert_eq!(workflow.pointer("/7/inputs/text").unwrap(), "no a fox, blurry");
    }

    #[test]
    fn prepare_preserves_key_order() {
        let template =
            WorkflowTemplate::from_text(r#"{"z":1,"a":"{{PROMPT}}","m":{"y":2,"b":3}}"#).unwrap();
        let workflow = template.prepare("x").unwrap();
        let keys: Vec<_> = workflow.as_map().keys().cloned().collect();
        assert_eq!(keys, ["z", "a", "m"]);
    }

    #[test]
    fn prompt_cannot_break_out_of_string_literal() {
        let template = WorkflowTemplate::from_text(r#"{"a":"{{PROMPT}}"}"#).unwrap();
        let input = r#""}, "b": {"#;
        let workflow = template.prepare(input).unwrap();

        assert_eq!(workflow.as_map().len(), 1);
        assert_eq!(workflow.as_map()["a"], input);
    }

    #[test]
    fn placeholder_in_key_is_substituted() {
        let template = WorkflowTemplate::from_text(r#"{"{{PROMPT}}":0}"#).unwrap();
        let workflow = template.prepare("k").unwrap();
        assert_eq!(workflow.as_map()["k"], 0);
    }

    #[test]
    fn rejects_missing_placeholder() {
        assert_matches!(
            WorkflowTemplate::from_text(r#"{"clip_text":"static"}"#),
            Err(TemplateError::MissingPlaceholder)
        );
    }

    #[test]
    fn rejects_invalid_json() {
        assert_matches!(
            WorkflowTemplate::from_text("{{PROMPT}}"),
            Err(TemplateError::InvalidJson(_))
        );
        assert_matches!(
            WorkflowTemplate::from_text(r#"["{{PROMPT}}"]"#),
            Err(TemplateError::InvalidJson(_))
        );
    }

    #[test]
    fn load_reads_file() {
        let file = write_template(SIMPLE);
        let template = WorkflowTemplate::load(file.path()).unwrap();
        assert_eq!(&*template.raw(), SIMPLE);
        assert_eq!(template.path(), Some(file.path()));
    }

    #[test]
    fn load_missing_file_fails() {
        assert_matches!(
            WorkflowTemplate::load("/definitely/not/here.json"),
            Err(TemplateError::Read { .. })
        );
    }

    #[test]
    fn reload_picks_up_new_content() {
        let file = write_template(SIMPLE);
        let template = WorkflowTemplate::load(file.path()).unwrap();

        let updated = r#"{"text":"{{PROMPT}}","steps":20}"#;
        std::fs::write(file.path(), updated).unwrap();
        template.reload().unwrap();

        assert_eq!(&*template.raw(), updated);
        assert_eq!(template.prepare("x").unwrap().as_map()["steps"], 20);
    }

    #[test]
    fn failed_reload_keeps_previous_template() {
        let file = write_template(SIMPLE);
        let template = WorkflowTemplate::load(file.path()).unwrap();

        std::fs::write(file.path(), r#"{"clip_text":"no token"}"#).unwrap();
        assert_matches!(template.reload(), Err(TemplateError::MissingPlaceholder));
        assert_eq!(&*template.raw(), SIMPLE);

        std::fs::write(file.path(), "not json").unwrap();
        assert_matches!(template.reload(), Err(TemplateError::InvalidJson(_)));
        assert_eq!(template.prepare("still works").unwrap().as_map()["clip_text"], "still works");
    }
}
