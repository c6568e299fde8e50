//! Error types for session description parsing

use thiserror::Error;

/// Errors that can occur while parsing a session description
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SdpError {
    /// The description is empty or does not start with a `v=` line
    #[error("Missing protocol version line")]
    MissingVersion,

    /// Unsupported protocol version
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    /// A line is not of the form `<type>=<value>`
    #[error("Malformed line {line}: {content:?}")]
    MalformedLine { line: usize, content: String },

    /// A media (`m=`) line could not be parsed
    #[error("Invalid media line {line}: {reason}")]
    InvalidMedia { line: usize, reason: String },

    /// An `a=rtpmap` attribute could not be parsed
    #[error("Invalid rtpmap attribute on line {line}: {reason}")]
    InvalidRtpMap { line: usize, reason: String },

    /// An `a=range` attribute could not be parsed
    #[error("Invalid range attribute on line {line}: {reason}")]
    InvalidRange { line: usize, reason: String },
}

/// Result type alias for parsing operations
pub type SdpResult<T> = Result<T, SdpError>;
