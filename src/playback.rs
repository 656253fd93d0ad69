// Playback state machine
// Follows the player through notifications and polling, decides when a track
// becomes "now playing" and when it has been listened to long enough to scrobble

use crate::error::ScrobblerError;
use crate::metadata::TrackMetadata;
use crate::probe::{PermissionStatus, PlayerProbe, PlayerState};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// State of playback as seen by the scrobbler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Inactive,
    Playing,
    Paused,
}

/// Events emitted by the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    /// The state changed. Metadata is `None` when inactive.
    StateChanged {
        state: PlaybackState,
        metadata: Option<TrackMetadata>,
        scrobbled: bool,
    },
    SongChanged(TrackMetadata),
    /// The track crossed its scrobble threshold. `started_at` is when it began playing.
    ScrobbleTimeReached {
        metadata: TrackMetadata,
        started_at: DateTime<Utc>,
    },
    /// The player cannot be automated; the user has to act.
    PermissionCheckFailed(PermissionStatus),
}

/// A deferred threshold check.
///
/// Only the most recently issued ticket is honoured; older ones are ignored
/// when they come back, so nothing ever has to be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThresholdTicket {
    generation: u64,
    identity: u64,
    /// How long to wait before handing the ticket back
    pub delay: Duration,
}

/// Output of one input step
#[derive(Debug, Default)]
pub struct Transition {
    pub events: Vec<PlaybackEvent>,
    /// Threshold check the caller should schedule
    pub check: Option<ThresholdTicket>,
}

/// The track currently being followed
#[derive(Debug, Clone)]
struct PlaySession {
    track: TrackMetadata,
    started_at: DateTime<Utc>,
    scrobbled: bool,
}

impl PlaySession {
    fn new(track: TrackMetadata, started_at: DateTime<Utc>) -> Self {
        Self {
            track,
            started_at,
            scrobbled: false,
        }
    }

    /// Wall clock seconds since the track started
    fn elapsed_seconds(&self, now: DateTime<Utc>) -> f64 {
        let elapsed = now.signed_duration_since(self.started_at);
        (elapsed.num_milliseconds().max(0) as f64) / 1000.0
    }
}

enum Access {
    Granted,
    Blocked,
    NotRunning,
}

pub struct PlaybackStateMachine<P> {
    probe: P,
    state: PlaybackState,
    session: Option<PlaySession>,
    pending_check: Option<ThresholdTicket>,
    generation: u64,
}

impl<P: PlayerProbe> PlaybackStateMachine<P> {
    pub fn new(probe: P) -> Self {
        Self {
            probe,
            state: PlaybackState::Inactive,
            session: None,
            pending_check: None,
            generation: 0,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn current_track(&self) -> Option<&TrackMetadata> {
        self.session.as_ref().map(|s| &s.track)
    }

    pub fn is_scrobbled(&self) -> bool {
        self.session.as_ref().map(|s| s.scrobbled).unwrap_or(false)
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }

    /// Periodic reconciliation with the player.
    pub fn poll(&mut self, now: DateTime<Utc>) -> Transition {
        let mut out = Transition::default();

        let reported = match self.access(&mut out) {
            Access::Blocked => return out,
            Access::NotRunning => PlayerState::Stopped,
            Access::Granted => match self.probe.player_state() {
                Ok(state) => state,
                Err(e) => {
                    self.probe_failed(e, &mut out);
                    return out;
                }
            },
        };

        self.apply(reported, now, &mut out);
        out
    }

    /// Push notification from the player carrying its `Player State` value.
    pub fn handle_notification(&mut self, player_state: &str, now: DateTime<Utc>) -> Transition {
        let mut out = Transition::default();
        let mut reported = PlayerState::from_notification(player_state);
        log::debug!("{} status changed received: {}", self.probe.name(), player_state);

        if reported != PlayerState::Stopped {
            match self.access(&mut out) {
                Access::Blocked => return out,
                Access::NotRunning => reported = PlayerState::Stopped,
                Access::Granted => {}
            }
        }

        self.apply(reported, now, &mut out);
        out
    }

    /// A previously issued ticket came due.
    pub fn on_threshold_check(
        &mut self,
        ticket: ThresholdTicket,
        now: DateTime<Utc>,
    ) -> Transition {
        let mut out = Transition::default();

        if self.pending_check != Some(ticket) {
            log::debug!("Ignoring stale scrobble check");
            return out;
        }
        self.pending_check = None;

        match self.access(&mut out) {
            Access::Blocked => return out,
            Access::NotRunning => {
                self.set_state(PlaybackState::Inactive, &mut out);
                return out;
            }
            Access::Granted => {}
        }

        // The track may have changed without us hearing about it
        if !self.check_song_changes(now, &mut out) {
            return out;
        }
        if let Some(session) = &self.session {
            if session.track.identity_hash() != ticket.identity {
                log::debug!(
                    "Scrobble check fired for a previous track, rechecking {}",
                    session.track
                );
            }
        }
        self.check_for_scrobbling(now, &mut out);
        out
    }

    fn access(&self, out: &mut Transition) -> Access {
        if !self.probe.is_running() {
            return Access::NotRunning;
        }
        match self.probe.check_permission() {
            PermissionStatus::Granted => Access::Granted,
            PermissionStatus::AppNotRunning => {
                out.events
                    .push(PlaybackEvent::PermissionCheckFailed(PermissionStatus::AppNotRunning));
                Access::NotRunning
            }
            status => {
                log::warn!("No automation access to {}: {:?}", self.probe.name(), status);
                out.events.push(PlaybackEvent::PermissionCheckFailed(status));
                Access::Blocked
            }
        }
    }

    fn probe_failed(&self, err: ScrobblerError, out: &mut Transition) {
        match err {
            ScrobblerError::PermissionDenied(_) => out
                .events
                .push(PlaybackEvent::PermissionCheckFailed(PermissionStatus::Denied)),
            ScrobblerError::UserActionRequired(_) => out.events.push(
                PlaybackEvent::PermissionCheckFailed(PermissionStatus::UserActionRequired),
            ),
            e => log::error!("Querying {} failed: {}", self.probe.name(), e),
        }
    }

    fn apply(&mut self, reported: PlayerState, now: DateTime<Utc>, out: &mut Transition) {
        match reported {
            PlayerState::Stopped => self.set_state(PlaybackState::Inactive, out),
            PlayerState::Paused => {
                if self.check_song_changes(now, out) {
                    self.set_state(PlaybackState::Paused, out);
                }
            }
            PlayerState::Playing => {
                let was_playing = self.state == PlaybackState::Playing;
                let previous = self.session.as_ref().map(|s| s.track.identity_hash());
                if !self.check_song_changes(now, out) {
                    return;
                }
                self.set_state(PlaybackState::Playing, out);

                let current = self.session.as_ref().map(|s| s.track.identity_hash());
                let song_changed = previous != current;
                if !was_playing || song_changed || self.pending_check.is_none() {
                    self.check_for_scrobbling(now, out);
                }
            }
        }
    }

    /// Reads the current track and starts a new session if it changed.
    /// Returns false if the player could not be queried.
    fn check_song_changes(&mut self, now: DateTime<Utc>, out: &mut Transition) -> bool {
        let track = match self.probe.current_track() {
            Ok(track) => track,
            Err(e) => {
                self.probe_failed(e, out);
                return false;
            }
        };

        let changed = match &self.session {
            None => true,
            Some(session) => session.track != track,
        };

        if changed {
            log::info!(
                "New track: {} ({}s)",
                track,
                track
                    .duration_seconds
                    .map(|d| format!("{:.0}", d))
                    .unwrap_or_else(|| "?".to_string())
            );
            self.session = Some(PlaySession::new(track.clone(), now));
            self.pending_check = None;
            out.events.push(PlaybackEvent::SongChanged(track));
        }
        true
    }

    fn set_state(&mut self, state: PlaybackState, out: &mut Transition) {
        if self.state == state {
            return;
        }
        log::debug!("Player state is now: {:?}", state);
        self.state = state;
        if state != PlaybackState::Playing {
            self.pending_check = None;
        }

        let metadata = match state {
            PlaybackState::Inactive => None,
            _ => self.current_track().cloned(),
        };
        out.events.push(PlaybackEvent::StateChanged {
            state,
            metadata,
            scrobbled: self.is_scrobbled(),
        });
    }

    fn check_for_scrobbling(&mut self, now: DateTime<Utc>, out: &mut Transition) {
        if self.state != PlaybackState::Playing {
            return;
        }
        let (identity, threshold, elapsed) = match &self.session {
            Some(session) if !session.scrobbled && session.track.can_be_scrobbled() => {
                match session.track.scrobble_threshold() {
                    Some(threshold) => (
                        session.track.identity_hash(),
                        threshold,
                        session.elapsed_seconds(now),
                    ),
                    None => return,
                }
            }
            _ => return,
        };

        let position = match self.probe.position_seconds() {
            Ok(position) => position,
            Err(e) => {
                log::error!("Could not get player position: {}", e);
                elapsed
            }
        };

        if position < threshold {
            self.generation += 1;
            let ticket = ThresholdTicket {
                generation: self.generation,
                identity,
                delay: Duration::from_secs_f64(threshold - position),
            };
            log::debug!("Next scrobbling check in {}ms", ticket.delay.as_millis());
            self.pending_check = Some(ticket);
            out.check = Some(ticket);
        } else if let Some(session) = self.session.as_mut() {
            log::info!(
                "Scrobble time reached: {} (position {:.0}s / threshold {:.0}s)",
                session.track,
                position,
                threshold
            );
            session.scrobbled = true;
            self.pending_check = None;
            out.events.push(PlaybackEvent::ScrobbleTimeReached {
                metadata: session.track.clone(),
                started_at: session.started_at,
            });
        }
    }
}
