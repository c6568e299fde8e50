use thiserror::Error;

use micbridge_sdp::SdpError;

use crate::session::SessionId;

/// Well-known result codes carried by [`TransportError`] and [`SessionError`]
pub mod codes {
    /// The device rejected the credential; callers usually re-prompt for it
    pub const UNAUTHORIZED: i32 = 401;

    /// Generic local failure (client creation, unusable description, no substreams)
    pub const LOCAL_FAILURE: i32 = 500;
}

/// Errors returned by the listener API on the owner thread
#[derive(Error, Debug)]
pub enum ListenerError {
    /// The process-wide runtime has not been installed yet
    #[error("Session runtime is not initialized")]
    RuntimeNotInitialized,

    /// The process-wide runtime was already installed
    #[error("Session runtime is already initialized")]
    RuntimeAlreadyInitialized,

    /// Shutdown has begun; no new sessions are accepted
    #[error("Session runtime is shutting down")]
    ShuttingDown,

    /// The background thread could not be started
    #[error("Failed to start session runtime: {0}")]
    RuntimeStart(#[source] std::io::Error),

    /// A session with this identity is already waiting for activation
    #[error("Session {0} is already pending activation")]
    DuplicateSession(SessionId),

    /// The target cannot be expressed as a stream URL
    #[error("Invalid target {address}:{port}: {source}")]
    InvalidTarget {
        address: String,
        port: u16,
        #[source]
        source: url::ParseError,
    },

    /// Invalid configuration provided
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Result type for listener operations
pub type Result<T> = std::result::Result<T, ListenerError>;

/// A failed request as reported by the transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (code {code})")]
pub struct TransportError {
    /// Protocol status code, or a negative value for socket-level failures
    pub code: i32,
    /// Result string returned with the failure
    pub message: String,
}

impl TransportError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.code == codes::UNAUTHORIZED
    }
}

/// Why a session attempt failed; delivered once through the error observer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// The transport client could not be created for the target
    #[error("Failed to create a client for \"{url}\": {source}")]
    Connect {
        url: String,
        #[source]
        source: TransportError,
    },

    /// The describe request failed
    #[error("Failed to get a session description: {0}")]
    Describe(#[source] TransportError),

    /// The description could not be parsed
    #[error("Failed to parse the session description: {0}")]
    Description(#[from] SdpError),

    /// The description lists no media substreams
    #[error("This session has no media substreams (i.e., no \"m=\" lines)")]
    NoSubstreams,

    /// Every substream was skipped during setup
    #[error("None of the {attempted} media substreams could be set up")]
    NoActiveSubstreams { attempted: usize },

    /// Every substream that was set up ended before play was requested
    #[error("Every media substream that was set up ({ended}) ended before playing started")]
    EndedBeforePlay { ended: usize },

    /// The play request failed
    #[error("Failed to start playing session: {0}")]
    Play(#[source] TransportError),
}

impl SessionError {
    /// The result code passed to the error observer
    pub fn code(&self) -> i32 {
        match self {
            SessionError::Connect { source, .. } => source.code,
            SessionError::Describe(e) | SessionError::Play(e) => e.code,
            SessionError::Description(_)
            | SessionError::NoSubstreams
            | SessionError::NoActiveSubstreams { .. }
            | SessionError::EndedBeforePlay { .. } => codes::LOCAL_FAILURE,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.code() == codes::UNAUTHORIZED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_codes() {
        let describe = SessionError::Describe(TransportError::new(404, "Not Found"));
        assert_eq!(describe.code(), 404);
        assert!(!describe.is_unauthorized());

        let play = SessionError::Play(TransportError::new(codes::UNAUTHORIZED, "Unauthorized"));
        assert!(play.is_unauthorized());

        assert_eq!(SessionError::NoSubstreams.code(), codes::LOCAL_FAILURE);
        assert_eq!(
            SessionError::NoActiveSubstreams { attempted: 2 }.code(),
            codes::LOCAL_FAILURE
        );
    }

    #[test]
    fn test_session_error_messages() {
        let err = SessionError::Describe(TransportError::new(500, "Internal Server Error"));
        assert_eq!(
            err.to_string(),
            "Failed to get a session description: Internal Server Error (code 500)"
        );

        let err = SessionError::NoActiveSubstreams { attempted: 3 };
        assert_eq!(err.to_string(), "None of the 3 media substreams could be set up");

        let err = SessionError::EndedBeforePlay { ended: 1 };
        assert_eq!(err.code(), codes::LOCAL_FAILURE);
        assert_eq!(
            err.to_string(),
            "Every media substream that was set up (1) ended before playing started"
        );
    }
}
