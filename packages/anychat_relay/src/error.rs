use tokio_tungstenite::tungstenite;

/// Errors surfaced by the session store, the REST fetchers and the relay.
///
/// Every variant renders to a string a user can read; nothing here separates
/// retryable from fatal failures except [`RelayError::requires_login`].
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("No authentication token found. Please log in again.")]
    MissingToken,

    #[error("not connected to the chat server")]
    NotConnected,

    #[error("no conversation is open")]
    NoCurrentThread,

    #[error("message is empty")]
    EmptyMessage,

    #[error("{0}")]
    Validation(String),

    #[error("session expired, please log in again")]
    Unauthorized,

    #[error("chat service is unavailable")]
    Unavailable,

    #[error("{message}")]
    Http { status: u16, message: String },

    #[error("malformed payload: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("session storage failed: {0}")]
    Storage(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RelayError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_connect() {
            Self::Unavailable
        } else if err.is_decode() {
            Self::Other(anyhow::anyhow!("invalid response from server: {err}"))
        } else {
            Self::Other(err.into())
        }
    }

    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        let is_connect = match &err {
            tungstenite::Error::Io(io_err) => matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        };
        if is_connect {
            Self::Unavailable
        } else {
            Self::Other(err.into())
        }
    }

    /// True when the only way forward is sending the user back to login.
    pub fn requires_login(&self) -> bool {
        matches!(self, Self::MissingToken | Self::Unauthorized)
    }

    /// Wording shown to the user for a failure during the external login step.
    pub fn login_message(&self) -> String {
        match self {
            Self::Http { status: 401, .. } | Self::Unauthorized => {
                "Invalid email or password for chatbot service".to_string()
            }
            Self::Unavailable => {
                "Cannot connect to chatbot service. Please check your internet connection."
                    .to_string()
            }
            other => other.to_string(),
        }
    }
}

pub type Result<T, E = RelayError> = std::result::Result<T, E>;
