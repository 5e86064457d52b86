//! Slash commands understood by the interactive prompt.

use duet_rs_protocol::DispatchMode;
use std::path::PathBuf;
use uuid::Uuid;

/// Session reference given on the command line: a list position or an id.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionRef {
    /// 1-based position in `/sessions` output.
    Index(usize),
    Id(Uuid),
}

/// Input line classified by the prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// Plain text sent as a user turn.
    Message(String),
    Command(SlashCommand),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SlashCommand {
    Help,
    Quit,
    New,
    Sessions,
    Switch(SessionRef),
    Delete(SessionRef),
    Rename(String),
    Retry,
    /// Rewrite the n-th user message (1-based) of the active session.
    Edit { index: usize, text: String },
    Mode(DispatchMode),
    /// Send `text` with an attached image.
    Image { path: PathBuf, text: String },
    History,
    ClearError,
}

pub const HELP: &str = "\
commands:
  /new                      start a new chat
  /sessions                 list chats
  /switch <n|id>            switch to a chat
  /delete <n|id>            delete a chat
  /rename <title>           rename the active chat
  /retry                    retry the last failed reply
  /edit <n> <text>          rewrite your n-th message and ask again
  /mode <auto|adapter>      pick the dispatch mode
  /image <path> [text]      send an image with optional text
  /history                  show the active chat
  /clear                    dismiss the error banner
  /quit                     exit";

/// Classify one line of input. Blank lines yield `None`.
pub fn parse_input(line: &str) -> Result<Option<Input>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let Some(command) = trimmed.strip_prefix('/') else {
        return Ok(Some(Input::Message(trimmed.to_string())));
    };
    let (name, rest) = match command.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (command, ""),
    };
    let parsed = match name {
        "help" | "?" => SlashCommand::Help,
        "quit" | "exit" => SlashCommand::Quit,
        "new" => SlashCommand::New,
        "sessions" | "list" => SlashCommand::Sessions,
        "switch" => SlashCommand::Switch(session_ref(rest, "usage: /switch <n|id>")?),
        "delete" => SlashCommand::Delete(session_ref(rest, "usage: /delete <n|id>")?),
        "rename" => {
            if rest.is_empty() {
                return Err("usage: /rename <title>".to_string());
            }
            SlashCommand::Rename(rest.to_string())
        }
        "retry" => SlashCommand::Retry,
        "edit" => {
            let (index, text) = rest
                .split_once(char::is_whitespace)
                .ok_or_else(|| "usage: /edit <n> <text>".to_string())?;
            let index = parse_index(index)?;
            SlashCommand::Edit {
                index,
                text: text.trim().to_string(),
            }
        }
        "mode" => {
            if rest.is_empty() {
                return Err("usage: /mode <auto|adapter>".to_string());
            }
            SlashCommand::Mode(DispatchMode::parse(rest))
        }
        "image" => {
            if rest.is_empty() {
                return Err("usage: /image <path> [text]".to_string());
            }
            let (path, text) = match rest.split_once(char::is_whitespace) {
                Some((path, text)) => (path, text.trim()),
                None => (rest, ""),
            };
            SlashCommand::Image {
                path: PathBuf::from(path),
                text: text.to_string(),
            }
        }
        "history" => SlashCommand::History,
        "clear" => SlashCommand::ClearError,
        other => return Err(format!("unknown command: /{other} (try /help)")),
    };
    Ok(Some(Input::Command(parsed)))
}

fn session_ref(value: &str, usage: &str) -> Result<SessionRef, String> {
    if value.is_empty() {
        return Err(usage.to_string());
    }
    if let Ok(id) = Uuid::parse_str(value) {
        return Ok(SessionRef::Id(id));
    }
    parse_index(value).map(SessionRef::Index)
}

fn parse_index(value: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(index) if index > 0 => Ok(index),
        _ => Err(format!("expected a position starting at 1, got `{value}`")),
    }
}
