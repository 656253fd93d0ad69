// Player probe boundary
// What the playback state machine needs to know about the media player

pub mod osascript;

use crate::error::Result;
use crate::metadata::TrackMetadata;

pub use osascript::OsascriptProbe;

/// Playback state as reported by the player itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Stopped,
    Paused,
    Playing,
}

impl PlayerState {
    /// Parse the `Player State` value of a player notification.
    /// Anything unknown or missing counts as stopped.
    pub fn from_notification(value: &str) -> Self {
        match value {
            "Playing" => Self::Playing,
            "Paused" => Self::Paused,
            _ => Self::Stopped,
        }
    }

    /// Parse the `player state` property returned by a script.
    /// Fast forwarding and rewinding are reported as paused.
    pub fn from_script(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "playing" => Self::Playing,
            "stopped" => Self::Stopped,
            _ => Self::Paused,
        }
    }
}

/// Result of the automation permission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
    UserActionRequired,
    AppNotRunning,
}

/// Source of player state and track metadata.
///
/// Calls are synchronous and expected to return quickly; implementations must
/// bound their own run time.
pub trait PlayerProbe {
    /// Human readable player name, used in logs and errors
    fn name(&self) -> &str;

    fn is_running(&self) -> bool;

    fn check_permission(&self) -> PermissionStatus;

    fn player_state(&self) -> Result<PlayerState>;

    fn current_track(&self) -> Result<TrackMetadata>;

    fn position_seconds(&self) -> Result<f64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_states() {
        assert_eq!(PlayerState::from_notification("Playing"), PlayerState::Playing);
        assert_eq!(PlayerState::from_notification("Paused"), PlayerState::Paused);
        assert_eq!(PlayerState::from_notification("Stopped"), PlayerState::Stopped);
        assert_eq!(PlayerState::from_notification(""), PlayerState::Stopped);
    }

    #[test]
    fn test_script_states() {
        assert_eq!(PlayerState::from_script("playing"), PlayerState::Playing);
        assert_eq!(PlayerState::from_script("stopped\n"), PlayerState::Stopped);
        assert_eq!(PlayerState::from_script("fast forwarding"), PlayerState::Paused);
    }
}
