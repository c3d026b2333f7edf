use thiserror::Error;

/// Errors produced by the realtime client.
///
/// Variants carry rendered strings rather than source errors so a single
/// fault can be cloned out to every subscriber callback.
#[derive(Error, Debug, Clone)]
pub enum RealtimeError {
    #[error("subscribe requires at least one non-empty topic")]
    EmptyTopics,

    #[error("invalid base URL: {0}")]
    InvalidUrl(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("server returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("event decode error: {0}")]
    Decode(String),

    #[error("subscriber callback panicked: {0}")]
    Callback(String),

    #[error("client is closed")]
    Closed,
}

impl From<reqwest::Error> for RealtimeError {
    fn from(err: reqwest::Error) -> Self {
        RealtimeError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for RealtimeError {
    fn from(err: serde_json::Error) -> Self {
        RealtimeError::Decode(err.to_string())
    }
}

impl From<url::ParseError> for RealtimeError {
    fn from(err: url::ParseError) -> Self {
        RealtimeError::InvalidUrl(err.to_string())
    }
}
