use thiserror::Error;

/// Reasons an inbound frame could not be turned into an envelope.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a json object")]
    NotAnObject,
    #[error("frame carries none of messages/reset/dismiss")]
    UnknownShape,
    #[error("invalid message timestamp {0}")]
    InvalidTimestamp(f64),
}

impl ProtocolError {
    /// Unknown shapes are ignored quietly; everything else is a malformed frame.
    pub fn is_unknown_shape(&self) -> bool {
        matches!(self, ProtocolError::UnknownShape)
    }
}

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("invalid origin {origin}: {source}")]
    Origin {
        origin: String,
        #[source]
        source: url::ParseError,
    },
    #[error("origin {0} has no host to connect to")]
    Opaque(String),
    #[error("invalid endpoint path {path}: {source}")]
    Path {
        path: String,
        #[source]
        source: url::ParseError,
    },
    #[error("cannot switch endpoint to {0} scheme")]
    Scheme(&'static str),
}
