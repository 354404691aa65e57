//! Error taxonomy for the session and realtime layers
//!
//! Every failure surfaces as a single [`Error`]. Steps wrap the failure
//! with [`ResultExt::context`] so the message names the step that broke,
//! while [`Error::root`] still reaches the original sentinel.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error code the device reports for a missing resource
const NOT_FOUND_CODES: &[&str] = &["noent", "not_found", "nodev"];

#[derive(Debug, Error)]
pub enum Error {
    #[error("app id is not set")]
    AppIdNotSet,

    #[error("private token is not set")]
    PrivateTokenNotSet,

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned HTTP {0}")]
    ServerStatus(u16),

    #[error("request failed with error code {error_code}: {msg}")]
    Api { error_code: String, msg: String },

    #[error("failed to decode payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("successful envelope carried no result")]
    MissingResult,

    #[error("invalid HMAC key: {0}")]
    InvalidKey(#[from] hmac::digest::InvalidLength),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid session header: {0}")]
    InvalidHeader(#[from] tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("peer closed the connection with code {code}: {reason}")]
    AbnormalClose { code: u16, reason: String },

    #[error("no close acknowledgement within {0:?}")]
    CloseTimeout(Duration),

    #[error("unexpected authorization status: {0}")]
    UnexpectedAuthorizationStatus(String),

    #[error("authorization timed out after {0:?}")]
    AuthorizationTimeout(Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("short write: sent {expected} bytes, server confirmed {written}")]
    ShortWrite { expected: usize, written: usize },

    #[error("upload cancelled by server after {written} bytes")]
    UploadCancelled { written: usize },

    #[error("failed to read upload source: {0}")]
    Io(#[from] std::io::Error),

    #[error("{op}: {source}")]
    Context {
        op: &'static str,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Peel every context layer and return the underlying failure
    pub fn root(&self) -> &Error {
        let mut current = self;
        while let Error::Context { source, .. } = current {
            current = source;
        }
        current
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Error::Cancelled)
    }

    /// True for both the pairing deadline and a cancelled wait
    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), Error::AuthorizationTimeout(_) | Error::Cancelled)
    }

    pub fn is_not_found(&self) -> bool {
        match self.root() {
            Error::Api { error_code, .. } => NOT_FOUND_CODES.contains(&error_code.as_str()),
            Error::ServerStatus(404) => true,
            _ => false,
        }
    }
}

/// Attach the name of the failing step to an error
pub trait ResultExt<T> {
    fn context(self, op: &'static str) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    fn context(self, op: &'static str) -> Result<T> {
        self.map_err(|e| Error::Context {
            op,
            source: Box::new(e.into()),
        })
    }
}
