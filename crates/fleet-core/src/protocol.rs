use crate::{FleetMember, MemberStats};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const MAX_MEMBER_NAME_LEN: usize = 64;

/// Hub -> viewer. Every subscriber receives the same sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    List(Vec<FleetMember>),
    Stats(MemberStats),
    PsLog(String),
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::List(_) => "list",
            ServerEvent::Stats(_) => "stats",
            ServerEvent::PsLog(_) => "ps-log",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Create,
    Start,
    Daemon,
    Terminate,
    Delete,
    Persist,
    Unpersist,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Create => "create",
            CommandKind::Start => "start",
            CommandKind::Daemon => "daemon",
            CommandKind::Terminate => "terminate",
            CommandKind::Delete => "delete",
            CommandKind::Persist => "persist",
            CommandKind::Unpersist => "unpersist",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "create" | "new" => Ok(CommandKind::Create),
            "start" => Ok(CommandKind::Start),
            "daemon" => Ok(CommandKind::Daemon),
            "terminate" | "stop" => Ok(CommandKind::Terminate),
            "delete" => Ok(CommandKind::Delete),
            "persist" => Ok(CommandKind::Persist),
            "unpersist" => Ok(CommandKind::Unpersist),
            other => Err(format!("Unknown command: {other}")),
        }
    }
}

/// Viewer -> hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientCommand {
    #[serde(rename = "type")]
    pub kind: CommandKind,
    pub name: String,
}

impl ClientCommand {
    pub fn new(kind: CommandKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("invalid member name: {0}")]
    InvalidName(&'static str),
}

pub fn encode_event(event: &ServerEvent) -> Result<String, ProtocolError> {
    encode_text(event)
}

pub fn decode_event(text: &str) -> Result<ServerEvent, ProtocolError> {
    decode_text(text)
}

pub fn encode_command(command: &ClientCommand) -> Result<String, ProtocolError> {
    encode_text(command)
}

/// Decodes a viewer frame and rejects names the control plane must never see.
pub fn decode_command(text: &str) -> Result<ClientCommand, ProtocolError> {
    let mut command: ClientCommand = decode_text(text)?;
    command.name = validate_member_name(&command.name)?.to_string();
    Ok(command)
}

/// Returns the trimmed name. Names go straight into a child's argv, so a
/// leading `-` would be read as a flag.
pub fn validate_member_name(raw: &str) -> Result<&str, ProtocolError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(ProtocolError::InvalidName("empty"));
    }
    if name.chars().count() > MAX_MEMBER_NAME_LEN {
        return Err(ProtocolError::InvalidName("too_long"));
    }
    if name.chars().any(char::is_control) {
        return Err(ProtocolError::InvalidName("control_characters"));
    }
    if name.starts_with('-') {
        return Err(ProtocolError::InvalidName("leading_dash"));
    }
    Ok(name)
}

fn encode_text<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    let encoded =
        serde_json::to_string(value).map_err(|err| ProtocolError::Encode(err.to_string()))?;
    if encoded.len() > DEFAULT_MAX_FRAME_BYTES {
        return Err(ProtocolError::OversizedFrame {
            size: encoded.len(),
            max: DEFAULT_MAX_FRAME_BYTES,
        });
    }
    Ok(encoded)
}

fn decode_text<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    if text.len() > DEFAULT_MAX_FRAME_BYTES {
        return Err(ProtocolError::OversizedFrame {
            size: text.len(),
            max: DEFAULT_MAX_FRAME_BYTES,
        });
    }
    serde_json::from_str(text).map_err(|err| ProtocolError::Decode(err.to_string()))
}
