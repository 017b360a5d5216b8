//! JSON text frames exchanged with the notification endpoint.
//!
//! Server frames are classified by which key they carry (`messages`, `reset`,
//! `dismiss`, checked in that order) and decoded into an [`Envelope`] before
//! any state is touched. Client frames are the three [`Command`] verbs.

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::error::ProtocolError;
use crate::message::{Message, WireMessage};

#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// A batch of pushed messages plus the server's unread count.
    Messages { messages: Vec<Message>, unread: u64 },
    /// The server asks for a full resynchronization.
    Reset,
    /// One message was dismissed elsewhere.
    Dismiss { uuid: String, unread: u64 },
}

#[derive(Debug, Deserialize)]
struct MessagesFrame {
    messages: Vec<WireMessage>,
    unread: u64,
}

#[derive(Debug, Deserialize)]
struct DismissFrame {
    dismiss: String,
    unread: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Messages,
    Reset,
    Dismiss,
}

fn classify(map: &Map<String, Value>) -> Option<FrameKind> {
    if map.contains_key("messages") {
        Some(FrameKind::Messages)
    } else if map.contains_key("reset") {
        Some(FrameKind::Reset)
    } else if map.contains_key("dismiss") {
        Some(FrameKind::Dismiss)
    } else {
        None
    }
}

impl Envelope {
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(frame)?;
        let kind = match &value {
            Value::Object(map) => classify(map).ok_or(ProtocolError::UnknownShape)?,
            _ => return Err(ProtocolError::NotAnObject),
        };

        match kind {
            FrameKind::Messages => {
                let batch: MessagesFrame = serde_json::from_value(value)?;
                let messages = batch
                    .messages
                    .into_iter()
                    .map(Message::try_from)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Envelope::Messages {
                    messages,
                    unread: batch.unread,
                })
            }
            FrameKind::Reset => Ok(Envelope::Reset),
            FrameKind::Dismiss => {
                let frame: DismissFrame = serde_json::from_value(value)?;
                Ok(Envelope::Dismiss {
                    uuid: frame.dismiss,
                    unread: frame.unread,
                })
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Messages { .. } => "messages",
            Envelope::Reset => "reset",
            Envelope::Dismiss { .. } => "dismiss",
        }
    }
}

/// Client-to-server verbs. All are fire-and-forget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Mark everything read and clear the server-side list.
    Reset,
    /// Dismiss a single message.
    Dismiss(String),
    /// Ask for the current message list.
    Fetch,
}

impl Command {
    pub fn encode(&self) -> String {
        let value = match self {
            Command::Reset => json!({ "reset": true }),
            Command::Dismiss(uuid) => json!({ "dismiss": uuid }),
            Command::Fetch => json!({ "fetch": true }),
        };
        value.to_string()
    }
}
