//! Parsing of operator input lines.

use relay_core::types::ActorId;

/// Prompts shorter than this (in characters, after trimming) are refused
/// before reaching the generator.
pub const MIN_PROMPT_CHARS: usize = 3;

/// One parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/status`: backend health and in-flight count.
    Status,
    /// `/reload`: re-read the workflow template.
    Reload,
    /// `<actor_id> <prompt>`
    Generate { actor_id: ActorId, prompt: String },
    /// Blank line.
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid actor ID: {0:?}")]
    InvalidActor(String),

    #[error("Usage: <actor_id> <prompt>")]
    MissingPrompt,

    #[error("Prompt must be at least {MIN_PROMPT_CHARS} characters")]
    PromptTooShort,
}

pub fn parse_line(line: &str) -> Result<Command, CommandError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Command::Empty);
    }

    if let Some(name) = line.strip_prefix('/') {
        return match name {
            "status" => Ok(Command::Status),
            "reload" => Ok(Command::Reload),
            _ => Err(CommandError::UnknownCommand(line.to_string())),
        };
    }

    let (actor, prompt) = line
        .split_once(char::is_whitespace)
        .ok_or(CommandError::MissingPrompt)?;

    let actor_id: ActorId = actor
        .parse()
        .map_err(|_| CommandError::InvalidActor(actor.to_string()))?;

    let prompt = prompt.trim();
    if prompt.chars().count() < MIN_PROMPT_CHARS {
        return Err(CommandError::PromptTooShort);
    }

    Ok(Command::Generate {
        actor_id,
        prompt: prompt.to_string(),
    })
}
