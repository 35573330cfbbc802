use tokio_tungstenite::tungstenite;

/// Failures of the underlying socket or HTTP stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("connection closed (code {code:?}): {reason}")]
    Closed { code: Option<u16>, reason: String },

    #[error("server responded with HTTP {0}")]
    Http(u16),

    #[error("invalid endpoint: {0}")]
    Url(String),

    #[error("stream error: {0}")]
    Stream(String),
}

impl TransportError {
    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) => Self::Http(response.status().as_u16()),
            tungstenite::Error::Url(e) => Self::Url(e.to_string()),
            other => Self::Connect(other.to_string()),
        }
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            Self::Http(status.as_u16())
        } else if err.is_connect() || err.is_timeout() || err.is_request() {
            Self::Connect(err.to_string())
        } else {
            Self::Stream(err.to_string())
        }
    }
}

/// A frame that could not be understood. Never fatal: callers log it and,
/// where the raw text is useful, surface it instead of discarding it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {reason}")]
    Malformed { reason: String, raw: String },

    #[error("unknown frame type: {0}")]
    UnknownType(String),
}

impl ProtocolError {
    pub(crate) fn malformed(reason: impl ToString, raw: &str) -> Self {
        Self::Malformed {
            reason: reason.to_string(),
            raw: raw.to_string(),
        }
    }
}

/// The remote side reported a failure of the work itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplicationError {
    #[error("remote process exited with code {0}")]
    NonZeroExit(i32),

    #[error("remote error: {0}")]
    Remote(String),
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Application(#[from] ApplicationError),

    /// The user stopped or closed the component.
    #[error("cancelled")]
    Cancelled,

    /// The component's task has already shut down.
    #[error("component is no longer running")]
    ActorGone,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = LinkError> = std::result::Result<T, E>;
