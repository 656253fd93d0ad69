// Scrobbler module
// Last.fm client, request signing and the auth handshake

pub mod lastfm;
pub mod lastfm_auth;
pub mod signature;
pub mod traits;

pub use lastfm::{LastFmClient, MAX_BATCH_SIZE};
pub use lastfm_auth::Session;
pub use traits::{Authenticator, ScrobbleService};
