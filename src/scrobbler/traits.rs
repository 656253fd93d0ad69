// Common traits for scrobbling services

use super::lastfm_auth::Session;
use crate::error::Result;
use crate::metadata::TrackMetadata;
use crate::store::PendingScrobble;

/// A service that accepts now-playing updates and scrobbles.
///
/// Calls block until the service answered or the request timed out.
pub trait ScrobbleService: Send + Sync {
    /// Use (or forget) the session the calls are made with
    fn set_session_key(&self, session_key: Option<String>);

    /// Tell the service which track is playing right now
    fn update_now_playing(&self, track: &TrackMetadata) -> Result<()>;

    /// Submit a batch and return the scrobbles the service accepted
    fn scrobble(&self, batch: &[PendingScrobble]) -> Result<Vec<PendingScrobble>>;
}

/// The browser based login handshake
pub trait Authenticator: Send + Sync {
    /// Start a login; returns the page the user has to approve it on
    fn begin_authentication(&self) -> Result<String>;

    /// Finish the login started last
    fn complete_authentication(&self) -> Result<Session>;

    fn cancel_authentication(&self);
}
