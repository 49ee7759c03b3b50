/// Failure talking to a third-party gateway.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("gateway transport error: {0}")]
    Transport(String),

    #[error("failed to decode gateway response: {0}")]
    Decode(String),
}

impl GatewayError {
    /// HTTP status carried by the error, if the gateway answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            GatewayError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            GatewayError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            GatewayError::Http {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            GatewayError::Transport(err.to_string())
        }
    }
}
