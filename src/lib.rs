//! Follows Music.app (or iTunes) playback and scrobbles what was listened to
//! to Last.fm. Scrobbles are queued in SQLite first, so nothing is lost while
//! offline or logged out.

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod metadata;
pub mod playback;
pub mod probe;
pub mod scrobbler;
pub mod store;

pub use error::{Result, ScrobblerError};
