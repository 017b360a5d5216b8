use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use serde_json::Value;

use crate::error::ProtocolError;

/// One notification as held by the store and handed to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub uuid: String,
    /// Body text; may carry markup which is passed through untouched.
    pub text: String,
    pub tags: Vec<String>,
    pub payload: Value,
    pub time: SystemTime,
}

/// Positional wire form: `[text, tags, payload, epochSeconds, uuid]`.
#[derive(Debug, Deserialize)]
pub(crate) struct WireMessage(String, Vec<String>, Value, f64, String);

impl TryFrom<WireMessage> for Message {
    type Error = ProtocolError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        let WireMessage(text, tags, payload, seconds, uuid) = wire;
        Ok(Message {
            uuid,
            text,
            tags,
            payload,
            time: time_from_epoch_seconds(seconds)?,
        })
    }
}

/// Server clocks report seconds; keep millisecond resolution locally.
/// Pre-epoch times are valid.
fn time_from_epoch_seconds(seconds: f64) -> Result<SystemTime, ProtocolError> {
    let millis = seconds * 1000.0;
    if !millis.is_finite() {
        return Err(ProtocolError::InvalidTimestamp(seconds));
    }
    let offset = Duration::from_millis(millis.abs() as u64);
    let time = if millis < 0.0 {
        UNIX_EPOCH.checked_sub(offset)
    } else {
        UNIX_EPOCH.checked_add(offset)
    };
    time.ok_or(ProtocolError::InvalidTimestamp(seconds))
}
