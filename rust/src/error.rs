use thiserror::Error;

/// Failures talking to the remote chat service.
///
/// Carries only strings so results can be cloned into actor messages and
/// shown inline on the surface that issued the call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(String),
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("{0}")]
    Unavailable(String),
}

impl ApiError {
    /// Short text for inline banners.
    pub fn user_visible_message(&self) -> String {
        match self {
            Self::Network(_) => "Network error, check your connection".to_string(),
            Self::Status { status, .. } if *status == 401 || *status == 403 => {
                "Not authorized".to_string()
            }
            Self::Status { status, .. } => format!("Server error ({status})"),
            Self::Decode(_) => "Unexpected server response".to_string(),
            Self::Unavailable(msg) => msg.clone(),
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<WireError> for ApiError {
    fn from(err: WireError) -> Self {
        Self::Decode(err.to_string())
    }
}

/// A payload that could not be normalized into a canonical record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("expected a JSON object")]
    NotAnObject,
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("unknown event `{0}`")]
    UnknownEvent(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid websocket url: {0}")]
    InvalidUrl(String),
    #[error("invalid auth header")]
    InvalidHeader,
    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
