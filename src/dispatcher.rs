// Scrobble dispatcher
// Moves queued scrobbles to Last.fm, one batch in flight at a time

use crate::error::{Result, ScrobblerError};
use crate::scrobbler::{ScrobbleService, MAX_BATCH_SIZE};
use crate::store::{PendingScrobble, ScrobbleStore};

/// What to do once a batch has been answered
#[derive(Debug)]
pub enum FlushStep {
    /// Nothing more to send for now
    Finished { accepted: usize },
    /// Start another flush right away
    Again { accepted: usize, force: bool },
    /// The batch failed, nothing was removed; retry later with `force`
    Failed { error: ScrobblerError, force: bool },
}

/// Totals of a synchronous flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub batches: usize,
    pub submitted: usize,
    pub accepted: usize,
}

/// Sends the queue in batches of at most [`MAX_BATCH_SIZE`].
///
/// A flush is split into [`begin`](Self::begin), which picks the batch, and
/// [`complete`](Self::complete), which applies the answer, so the network call
/// can happen elsewhere. Only one batch is ever in flight; flushes requested
/// meanwhile collapse into a single follow-up.
#[derive(Debug, Default)]
pub struct ScrobbleDispatcher {
    /// Force flag of the flush in flight
    in_flight: Option<bool>,
    /// Force flag of the coalesced follow-up
    follow_up: Option<bool>,
}

impl ScrobbleDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Pick the next batch, oldest first. `None` when there is nothing to
    /// send, sending is off, nobody is logged in, or a batch is already out.
    pub fn begin(
        &mut self,
        store: &ScrobbleStore,
        force: bool,
    ) -> Result<Option<Vec<PendingScrobble>>> {
        if self.in_flight.is_some() {
            let pending = self.follow_up.unwrap_or(false);
            self.follow_up = Some(pending || force);
            log::debug!("Flush already in flight, queued a follow-up");
            return Ok(None);
        }
        if store.account()?.is_none() {
            log::debug!("Not logged in, keeping scrobbles queued");
            return Ok(None);
        }
        if !force && !store.send_scrobbles()? {
            log::debug!("Sending scrobbles is off, keeping scrobbles queued");
            return Ok(None);
        }

        let batch = store.get_scrobbles(Some(MAX_BATCH_SIZE), true)?;
        if batch.is_empty() {
            return Ok(None);
        }
        log::info!("Sending {} scrobbles", batch.len());
        self.in_flight = Some(force);
        Ok(Some(batch))
    }

    /// Apply the answer for `batch`: remove what was accepted and decide
    /// whether another flush should follow.
    pub fn complete(
        &mut self,
        store: &mut ScrobbleStore,
        batch: &[PendingScrobble],
        result: Result<Vec<PendingScrobble>>,
    ) -> Result<FlushStep> {
        let force = self.in_flight.take().unwrap_or(false);
        let follow_up = self.follow_up.take();

        let accepted = match result {
            Ok(accepted) => accepted,
            Err(error) => {
                log::warn!("Sending {} scrobbles failed: {}", batch.len(), error);
                return Ok(FlushStep::Failed {
                    error,
                    force: force || follow_up.unwrap_or(false),
                });
            }
        };

        let removed = store.remove_scrobbles(&accepted)?;
        if accepted.len() < batch.len() {
            log::warn!(
                "{} of {} scrobbles were ignored and stay queued",
                batch.len() - accepted.len(),
                batch.len()
            );
        }

        // A full batch means more may be waiting, but only keep going while
        // batches make progress or the same batch would be sent forever.
        let more = batch.len() == MAX_BATCH_SIZE && removed > 0;
        Ok(match (more, follow_up) {
            (true, _) | (false, Some(_)) => FlushStep::Again {
                accepted: removed,
                force: force || follow_up.unwrap_or(false),
            },
            (false, None) => FlushStep::Finished { accepted: removed },
        })
    }

    /// Run a whole flush on the calling thread.
    pub fn flush_blocking(
        &mut self,
        store: &mut ScrobbleStore,
        service: &dyn ScrobbleService,
        force: bool,
    ) -> Result<FlushReport> {
        let mut report = FlushReport::default();
        let mut force = force;

        while let Some(batch) = self.begin(store, force)? {
            report.batches += 1;
            report.submitted += batch.len();
            let result = service.scrobble(&batch);
            match self.complete(store, &batch, result)? {
                FlushStep::Finished { accepted } => {
                    report.accepted += accepted;
                    break;
                }
                FlushStep::Again { accepted, force: next } => {
                    report.accepted += accepted;
                    force = next;
                }
                FlushStep::Failed { error, .. } => return Err(error),
            }
        }
        Ok(report)
    }
}
