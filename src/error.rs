// Error types shared by the probe, store and Last.fm client

use thiserror::Error;

/// Errors produced while tracking playback and submitting scrobbles.
#[derive(Error, Debug)]
pub enum ScrobblerError {
    /// The player could not be queried (script failure, unparsable output).
    #[error("player probe failed: {0}")]
    Probe(String),

    /// The user declined automation access to the player.
    #[error("automation permission for {0} was denied")]
    PermissionDenied(String),

    /// Automation access to the player has not been decided yet.
    #[error("automation permission for {0} requires user action")]
    UserActionRequired(String),

    /// Network failure or timeout, no response was received.
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-success status or a body that could not be understood.
    #[error("Last.fm rejected the request (HTTP {status}): {body}")]
    RemoteRejected { status: u16, body: String },

    /// Last.fm answered with an `error` object.
    #[error("Last.fm API error {code}: {message}")]
    Api { code: i64, message: String },

    /// The auth handshake could not be completed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Local persistence failure.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid scrobble batch: {0}")]
    InvalidBatch(String),

    #[error("track cannot be scrobbled: {0}")]
    NotScrobbleable(String),

    #[error("parse error: {0}")]
    Parse(String),
}

impl From<attohttpc::Error> for ScrobblerError {
    fn from(err: attohttpc::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for ScrobblerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

// Last.fm API error codes that need the user rather than a retry
const API_AUTHENTICATION_FAILED: i64 = 4;
const API_INVALID_SESSION_KEY: i64 = 9;
const API_INVALID_API_KEY: i64 = 10;
const API_INVALID_SIGNATURE: i64 = 13;
const API_SUSPENDED_API_KEY: i64 = 26;

impl ScrobblerError {
    /// True for failures that may go away on their own (network, server side).
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::RemoteRejected { .. } => true,
            Self::Api { code, .. } => !matches!(
                *code,
                API_AUTHENTICATION_FAILED
                    | API_INVALID_SESSION_KEY
                    | API_INVALID_API_KEY
                    | API_INVALID_SIGNATURE
                    | API_SUSPENDED_API_KEY
            ),
            _ => false,
        }
    }

    /// The stored session is no longer accepted; the user has to log in again.
    pub fn is_session_invalid(&self) -> bool {
        matches!(
            self,
            Self::Api {
                code: API_INVALID_SESSION_KEY,
                ..
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, ScrobblerError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn api(code: i64) -> ScrobblerError {
        ScrobblerError::Api {
            code,
            message: String::new(),
        }
    }

    #[test]
    fn test_server_side_failures_are_transient() {
        assert!(ScrobblerError::Transport("timed out".into()).is_transient());
        assert!(ScrobblerError::RemoteRejected {
            status: 503,
            body: String::new()
        }
        .is_transient());
        // Service offline, temporarily unavailable, rate limit
        assert!(api(11).is_transient());
        assert!(api(16).is_transient());
        assert!(api(29).is_transient());
    }

    #[test]
    fn test_credential_failures_are_not_transient() {
        for code in [4, 9, 10, 13, 26] {
            assert!(!api(code).is_transient(), "code {} should not be retried", code);
        }
        assert!(api(9).is_session_invalid());
        assert!(!api(10).is_session_invalid());
        assert!(!ScrobblerError::Parse("bad".into()).is_transient());
    }
}
