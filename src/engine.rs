// Scrobbling engine
// Single event loop that owns the playback state machine, the store and the
// dispatcher. Timers and network calls post their results back onto the queue.

use crate::dispatcher::{FlushStep, ScrobbleDispatcher};
use crate::error::{Result, ScrobblerError};
use crate::metadata::TrackMetadata;
use crate::playback::{
    PlaybackEvent, PlaybackState, PlaybackStateMachine, ThresholdTicket, Transition,
};
use crate::probe::{PermissionStatus, PlayerProbe};
use crate::scrobbler::{Authenticator, ScrobbleService, Session};
use crate::store::{Account, PendingScrobble, SaveOutcome, ScrobbleStore};
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// User requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Send the queue now, even when sending is switched off
    ScrobbleNow,
    Login,
    CompleteLogin,
    CancelLogin,
    Logout,
    SetSendScrobbles(bool),
}

/// Everything the loop reacts to
#[derive(Debug)]
pub enum Event {
    Poll,
    /// Player push notification carrying its `Player State`
    PlayerNotification(String),
    ThresholdCheck(ThresholdTicket),
    /// Flush requested by the retry timer
    Flush { force: bool },
    BatchSent {
        batch: Vec<PendingScrobble>,
        result: Result<Vec<PendingScrobble>>,
    },
    LoginStarted(Result<String>),
    LoginFinished(Result<Session>),
    Command(Command),
    Shutdown,
}

/// Receives what the engine observes. Every method defaults to doing nothing.
pub trait StatusListener: Send {
    fn on_state_changed(
        &mut self,
        _state: PlaybackState,
        _track: Option<&TrackMetadata>,
        _scrobbled: bool,
    ) {
    }
    fn on_song_changed(&mut self, _track: &TrackMetadata) {}
    fn on_scrobble_cache_count_changed(&mut self, _count: usize) {}
    fn on_permission_problem(&mut self, _status: PermissionStatus) {}
    /// The approval page of a login that was just started
    fn on_login_started(&mut self, _url: &str) {}
    fn on_logged_in(&mut self, _username: &str) {}
    fn on_logged_out(&mut self) {}
    fn on_login_failed(&mut self, _error: &ScrobblerError) {}
    fn on_error(&mut self, _error: &ScrobblerError) {}
}

/// Timing knobs of the engine
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub poll_interval: Duration,
    pub retry_initial_interval: Duration,
    pub retry_max_interval: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            retry_initial_interval: Duration::from_secs(30),
            retry_max_interval: Duration::from_secs(30 * 60),
        }
    }
}

/// Cloneable sender for the engine's queue
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl EngineHandle {
    pub fn send(&self, command: Command) {
        let _ = self.tx.send(Event::Command(command));
    }

    /// Forward a player notification
    pub fn notify(&self, player_state: impl Into<String>) {
        let _ = self.tx.send(Event::PlayerNotification(player_state.into()));
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Event::Shutdown);
    }
}

pub struct Engine<P, S> {
    machine: PlaybackStateMachine<P>,
    store: ScrobbleStore,
    dispatcher: ScrobbleDispatcher,
    service: Arc<S>,
    listener: Box<dyn StatusListener>,
    /// Session key last handed to the service
    session_key: Option<String>,
    tx: mpsc::UnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<Event>,
    poll_interval: Duration,
    retry: ExponentialBackoff,
    retry_scheduled: bool,
}

impl<P, S> Engine<P, S>
where
    P: PlayerProbe + Send + 'static,
    S: ScrobbleService + Authenticator + 'static,
{
    pub fn new(
        probe: P,
        store: ScrobbleStore,
        service: Arc<S>,
        listener: Box<dyn StatusListener>,
        options: EngineOptions,
    ) -> (Self, EngineHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let retry = ExponentialBackoffBuilder::new()
            .with_initial_interval(options.retry_initial_interval)
            .with_max_interval(options.retry_max_interval)
            .with_max_elapsed_time(None)
            .build();

        let engine = Self {
            machine: PlaybackStateMachine::new(probe),
            store,
            dispatcher: ScrobbleDispatcher::new(),
            service,
            listener,
            session_key: None,
            tx: tx.clone(),
            rx,
            poll_interval: options.poll_interval,
            retry,
            retry_scheduled: false,
        };
        (engine, EngineHandle { tx })
    }

    /// Run until [`EngineHandle::shutdown`] is called. Returns the store so
    /// callers can inspect what is left in the queue.
    pub async fn run(mut self) -> Result<ScrobbleStore> {
        if let Some(account) = self.sync_session()? {
            log::info!("Logged in to Last.fm as {}", account.username);
        }
        let count = self.store.count()?;
        self.listener.on_scrobble_cache_count_changed(count);
        log::info!("Watching {} ({} scrobbles queued)", self.machine.probe().name(), count);

        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                _ = poll.tick() => Event::Poll,
                event = self.rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if let Event::Shutdown = event {
                log::info!("Shutting down");
                break;
            }
            self.handle(event);
        }
        Ok(self.store)
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Poll => {
                let transition = self.machine.poll(Utc::now());
                self.apply(transition);
            }
            Event::PlayerNotification(player_state) => {
                let transition = self.machine.handle_notification(&player_state, Utc::now());
                self.apply(transition);
            }
            Event::ThresholdCheck(ticket) => {
                let transition = self.machine.on_threshold_check(ticket, Utc::now());
                self.apply(transition);
            }
            Event::Flush { force } => {
                self.retry_scheduled = false;
                self.flush(force);
            }
            Event::BatchSent { batch, result } => self.batch_sent(&batch, result),
            Event::LoginStarted(Ok(url)) => self.listener.on_login_started(&url),
            Event::LoginStarted(Err(e)) => self.listener.on_login_failed(&e),
            Event::LoginFinished(result) => self.login_finished(result),
            Event::Command(command) => self.command(command),
            Event::Shutdown => {}
        }
    }

    fn apply(&mut self, transition: Transition) {
        for event in transition.events {
            match event {
                PlaybackEvent::StateChanged { state, metadata, scrobbled } => {
                    self.listener.on_state_changed(state, metadata.as_ref(), scrobbled);
                    if state == PlaybackState::Inactive {
                        self.flush(false);
                    }
                }
                PlaybackEvent::SongChanged(track) => {
                    self.listener.on_song_changed(&track);
                    self.update_now_playing(track);
                    self.flush(false);
                }
                PlaybackEvent::ScrobbleTimeReached { metadata, started_at } => {
                    match self.store.record_scrobble(&metadata, started_at) {
                        Ok(SaveOutcome::Saved) => {
                            self.report_count();
                            self.flush(false);
                        }
                        Ok(outcome) => log::debug!("Not queued ({:?}): {}", outcome, metadata),
                        Err(e) => {
                            log::error!("Failed to save scrobble for {}: {}", metadata, e);
                            self.listener.on_error(&e);
                        }
                    }
                }
                PlaybackEvent::PermissionCheckFailed(status) => {
                    self.listener.on_permission_problem(status);
                }
            }
        }

        if let Some(ticket) = transition.check {
            let tx = self.tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(ticket.delay).await;
                let _ = tx.send(Event::ThresholdCheck(ticket));
            });
        }
    }

    /// Hand the stored account's session key to the service. Other processes
    /// (`login`, `logout`) share the database, so the row is the source of truth.
    fn sync_session(&mut self) -> Result<Option<Account>> {
        let account = self.store.account()?;
        let session_key = account.as_ref().map(|a| a.session_key.clone());
        if session_key != self.session_key {
            log::debug!(
                "Session {}",
                if session_key.is_some() { "changed" } else { "removed" }
            );
            self.service.set_session_key(session_key.clone());
            self.session_key = session_key;
        }
        Ok(account)
    }

    fn update_now_playing(&mut self, track: TrackMetadata) {
        let enabled = match self.sync_session() {
            Ok(Some(_)) => self.store.send_scrobbles(),
            Ok(None) => Ok(false),
            Err(e) => Err(e),
        };
        match enabled {
            Ok(true) => {
                let service = Arc::clone(&self.service);
                tokio::task::spawn_blocking(move || {
                    if let Err(e) = service.update_now_playing(&track) {
                        log::warn!("Now playing update failed: {}", e);
                    }
                });
            }
            Ok(false) => {}
            Err(e) => self.listener.on_error(&e),
        }
    }

    fn flush(&mut self, force: bool) {
        if let Err(e) = self.sync_session() {
            log::error!("Could not read the account: {}", e);
            self.listener.on_error(&e);
            return;
        }
        let batch = match self.dispatcher.begin(&self.store, force) {
            Ok(Some(batch)) => batch,
            Ok(None) => return,
            Err(e) => {
                log::error!("Could not read the scrobble queue: {}", e);
                self.listener.on_error(&e);
                return;
            }
        };

        let service = Arc::clone(&self.service);
        let tx = self.tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = service.scrobble(&batch);
            let _ = tx.send(Event::BatchSent { batch, result });
        });
    }

    fn batch_sent(&mut self, batch: &[PendingScrobble], result: Result<Vec<PendingScrobble>>) {
        match self.dispatcher.complete(&mut self.store, batch, result) {
            Ok(FlushStep::Finished { accepted }) => {
                self.retry.reset();
                if accepted > 0 {
                    self.report_count();
                }
            }
            Ok(FlushStep::Again { accepted, force }) => {
                self.retry.reset();
                if accepted > 0 {
                    self.report_count();
                }
                self.flush(force);
            }
            Ok(FlushStep::Failed { error, force }) => {
                if error.is_session_invalid() {
                    log::warn!("Last.fm no longer accepts the session, log in again");
                    self.listener.on_login_failed(&error);
                } else if error.is_transient() {
                    self.schedule_retry(force);
                } else {
                    self.listener.on_error(&error);
                }
            }
            Err(e) => {
                log::error!("Could not update the scrobble queue: {}", e);
                self.listener.on_error(&e);
            }
        }
    }

    fn schedule_retry(&mut self, force: bool) {
        if self.retry_scheduled {
            return;
        }
        let delay = self
            .retry
            .next_backoff()
            .unwrap_or(self.retry.max_interval);
        log::info!("Retrying scrobble submission in {}s", delay.as_secs());
        self.retry_scheduled = true;

        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Event::Flush { force });
        });
    }

    fn report_count(&mut self) {
        match self.store.count() {
            Ok(count) => self.listener.on_scrobble_cache_count_changed(count),
            Err(e) => self.listener.on_error(&e),
        }
    }

    fn command(&mut self, command: Command) {
        log::debug!("Command: {:?}", command);
        match command {
            Command::ScrobbleNow => self.flush(true),
            Command::Login => {
                let service = Arc::clone(&self.service);
                let tx = self.tx.clone();
                tokio::task::spawn_blocking(move || {
                    let _ = tx.send(Event::LoginStarted(service.begin_authentication()));
                });
            }
            Command::CompleteLogin => {
                let service = Arc::clone(&self.service);
                let tx = self.tx.clone();
                tokio::task::spawn_blocking(move || {
                    let _ = tx.send(Event::LoginFinished(service.complete_authentication()));
                });
            }
            Command::CancelLogin => self.service.cancel_authentication(),
            Command::Logout => {
                if let Err(e) = self.store.delete_account() {
                    self.listener.on_error(&e);
                    return;
                }
                self.service.set_session_key(None);
                self.session_key = None;
                log::info!("Logged out, queued scrobbles are kept");
                self.listener.on_logged_out();
            }
            Command::SetSendScrobbles(send) => match self.store.set_send_scrobbles(send) {
                Ok(()) => {
                    log::info!("Sending scrobbles {}", if send { "enabled" } else { "disabled" });
                    if send {
                        self.flush(false);
                    }
                }
                Err(e) => self.listener.on_error(&e),
            },
        }
    }

    fn login_finished(&mut self, result: Result<Session>) {
        let session = match result {
            Ok(session) => session,
            Err(e) => {
                log::warn!("Last.fm login failed: {}", e);
                self.listener.on_login_failed(&e);
                return;
            }
        };
        if let Err(e) = self.store.add_account(&session.name, &session.key) {
            self.listener.on_error(&e);
            return;
        }
        self.service.set_session_key(Some(session.key.clone()));
        self.session_key = Some(session.key);
        self.listener.on_logged_in(&session.name);
        self.flush(false);
    }
}
