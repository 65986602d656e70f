//! Error types for sdrlib.
//!
//! All fallible operations across the library return [`Result<T>`], which
//! uses [`Error`] as the error type. Process, channel, protocol, and
//! lifecycle errors are all captured here.

use crate::state::SessionState;
use crate::transport::ChannelKind;

/// The error type for all sdrlib operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A channel-level error (unix socket connect, write, or read).
    #[error("transport error: {0}")]
    Transport(String),

    /// A protocol-level error (malformed record, unexpected reply shape).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Timed out waiting for a connection or a reply.
    #[error("timeout waiting for response")]
    Timeout,

    /// The parameter name is not in the driver's command table.
    ///
    /// Rejected before anything reaches the wire.
    #[error("unknown parameter: {0}")]
    UnknownParameter(String),

    /// A reply-expecting command was submitted on a channel that does not
    /// carry replies.
    #[error("command submitted on the {0} channel")]
    WrongChannel(ChannelKind),

    /// A parameter value cannot be encoded for the wire.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// No connection to the driven process exists.
    #[error("not connected")]
    NotConnected,

    /// The connection was lost while a reply was outstanding.
    #[error("connection lost")]
    ConnectionLost,

    /// The driven process could not be launched.
    #[error("spawn failed: {0}")]
    Spawn(String),

    /// A process is already live for this session.
    #[error("process already running")]
    AlreadyRunning,

    /// The session has been torn down and accepts no more requests.
    #[error("session terminated")]
    Terminated,

    /// A lifecycle transition that the state table does not allow.
    #[error("invalid session transition from {from} to {to}")]
    InvalidTransition {
        /// State the session was in.
        from: SessionState,
        /// State that was requested.
        to: SessionState,
    },

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A structured-text record that is not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_unknown_parameter() {
        let e = Error::UnknownParameter("if_gain7".into());
        assert_eq!(e.to_string(), "unknown parameter: if_gain7");
    }

    #[test]
    fn error_display_wrong_channel() {
        let e = Error::WrongChannel(ChannelKind::Data);
        assert_eq!(e.to_string(), "command submitted on the data channel");
    }

    #[test]
    fn error_display_spawn() {
        let e = Error::Spawn("No such file or directory".into());
        assert_eq!(e.to_string(), "spawn failed: No such file or directory");
    }

    #[test]
    fn error_display_invalid_transition() {
        let e = Error::InvalidTransition {
            from: SessionState::Terminated,
            to: SessionState::Spawning,
        };
        assert_eq!(
            e.to_string(),
            "invalid session transition from terminated to spawning"
        );
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let e: Error = io_err.into();
        assert!(matches!(e, Error::Io(_)));
        assert!(e.to_string().contains("refused"));
    }

    #[test]
    fn error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        let e: Error = json_err.into();
        assert!(matches!(e, Error::Json(_)));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
