//! The channel state machine.
//!
//! ```text
//!   socket clients ──► Command ─┐
//!   player sessions ─► Player ──┼──► mpsc ──► TvCore::run ──► broadcasts
//!   scheduler ticks ─► *Tick ───┘            (single event loop)
//! ```
//!
//! All mutable state lives here and is touched only from the event loop, one
//! event at a time.  Every player event and scheduler tick carries the
//! sequence number of the session that produced it; anything tagged with a
//! session that is no longer live is dropped on arrival.  That check, plus
//! the scheduler cancelling a session's tasks before the next session
//! schedules its own, is what keeps a stale progress tick from writing an
//! offset under the wrong media and a stale near-end tick from issuing a
//! phantom channel change.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tv_proto::channels::ChannelRegistry;
use tv_proto::progress::ProgressStore;
use tv_proto::protocol::{Broadcast, Command, TvState};

use crate::player::{MediaPlayer, PlayerEvent, PlayerSession};
use crate::scheduler::{PollingScheduler, TaskKey, TaskKind};

/// Remaining time at which the near-end detector pre-empts natural end of
/// content and surfs onward.
const NEAR_END_SECS: f64 = 5.0;
/// Samples with less remaining than this are sampling jitter around the true
/// end; the `Ended` event path is authoritative there.
const NEAR_END_FLOOR_SECS: f64 = 0.1;
/// Persisted offsets at or below this are treated as noise — the channel
/// restarts from the top.
const RESUME_MIN_SECS: f64 = 1.0;

const PROGRESS_POLL: Duration = Duration::from_millis(2000);
const NEAR_END_POLL: Duration = Duration::from_millis(1000);

/// Static-burst durations the presentation layer is asked to show.
const STATIC_POWER_MS: u64 = 800;
const STATIC_SURF_MS: u64 = 600;

/// Everything that can happen to the TV funnels through this one type.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    Command(Command),
    Player { session: u64, event: PlayerEvent },
    ProgressTick { session: u64 },
    NearEndTick { session: u64 },
}

/// The live binding between the current channel and its player handle.
/// Exactly one exists while the TV is on; it is torn down — tasks first —
/// before its replacement is created.
struct ActiveSession<S> {
    id: u64,
    media: String,
    handle: S,
    /// SkipGuard: both end-of-content detectors check and set this, so
    /// auto-advance fires at most once per session.
    auto_advanced: bool,
    forwarder: JoinHandle<()>,
}

pub struct TvCore<P: MediaPlayer> {
    registry: ChannelRegistry,
    store: ProgressStore,
    scheduler: PollingScheduler,
    player: P,
    event_tx: mpsc::Sender<CoreEvent>,
    broadcast_tx: broadcast::Sender<Broadcast>,
    state: Arc<RwLock<TvState>>,
    rev: u64,
    powered: bool,
    current: usize,
    session_seq: u64,
    session: Option<ActiveSession<P::Session>>,
}

impl<P: MediaPlayer> TvCore<P> {
    pub fn new(
        registry: ChannelRegistry,
        store: ProgressStore,
        player: P,
        event_tx: mpsc::Sender<CoreEvent>,
        broadcast_tx: broadcast::Sender<Broadcast>,
    ) -> Self {
        // The selected channel survives restarts; power state never does.
        let current = registry.clamp_index(store.last_channel_index());
        let state = Arc::new(RwLock::new(TvState {
            rev: 0,
            powered: false,
            current_index: current,
            channels: registry.channels().to_vec(),
        }));
        Self {
            registry,
            store,
            scheduler: PollingScheduler::new(),
            player,
            event_tx,
            broadcast_tx,
            state,
            rev: 0,
            powered: false,
            current,
            session_seq: 0,
            session: None,
        }
    }

    /// Shared snapshot for the socket server (`Hello` / resync frames).
    pub fn state_handle(&self) -> Arc<RwLock<TvState>> {
        Arc::clone(&self.state)
    }

    pub async fn run(mut self, mut event_rx: mpsc::Receiver<CoreEvent>) -> anyhow::Result<()> {
        while let Some(event) = event_rx.recv().await {
            self.handle_event(event).await;
        }
        Ok(())
    }

    pub async fn handle_event(&mut self, event: CoreEvent) {
        match event {
            CoreEvent::Command(cmd) => self.handle_command(cmd).await,
            CoreEvent::Player { session, event } => {
                if !self.is_live(session) {
                    debug!("dropping player event {:?} from stale session {}", event, session);
                    return;
                }
                self.handle_player_event(event).await;
            }
            CoreEvent::ProgressTick { session } => {
                if self.is_live(session) {
                    self.persist_progress().await;
                }
            }
            CoreEvent::NearEndTick { session } => {
                if self.is_live(session) {
                    self.check_near_end().await;
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::PowerToggle => {
                if self.powered {
                    self.power_off().await;
                } else {
                    self.power_on().await;
                }
            }
            Command::Next => self.next(false).await,
            Command::Prev => self.previous().await,
            Command::Unmute => self.unmute_current().await,
            // Answered by the socket server from the shared snapshot.
            Command::GetState => {}
        }
    }

    // ── power ─────────────────────────────────────────────────────────────────

    async fn power_on(&mut self) {
        if self.powered {
            return;
        }
        info!("power on");
        self.powered = true;
        self.notify(Broadcast::Power { on: true });
        self.render().await;
        self.notify(Broadcast::Static {
            duration_ms: STATIC_POWER_MS,
        });
        self.sync_state().await;
    }

    async fn power_off(&mut self) {
        if !self.powered {
            return;
        }
        info!("power off");
        self.teardown_session().await;
        self.powered = false;
        self.notify(Broadcast::Power { on: false });
        self.sync_state().await;
    }

    // ── surfing ───────────────────────────────────────────────────────────────

    async fn next(&mut self, silent: bool) {
        if !self.powered {
            return;
        }
        self.current = self.registry.next_index(self.current);
        self.render().await;
        if !silent {
            self.notify(Broadcast::Static {
                duration_ms: STATIC_SURF_MS,
            });
        }
        self.sync_state().await;
    }

    async fn previous(&mut self) {
        if !self.powered {
            return;
        }
        self.current = self.registry.previous_index(self.current);
        self.render().await;
        self.notify(Broadcast::Static {
            duration_ms: STATIC_SURF_MS,
        });
        self.sync_state().await;
    }

    async fn unmute_current(&mut self) {
        if let Some(session) = &self.session {
            if let Err(e) = session.handle.set_mute(false).await {
                warn!("unmute failed: {}", e);
            }
        }
    }

    /// Tunes the player to the current channel: the old session is fully torn
    /// down (tasks cancelled first) before the new one exists, so there is no
    /// overlap window.
    async fn render(&mut self) {
        self.teardown_session().await;

        self.session_seq += 1;
        let id = self.session_seq;
        let channel = self.registry.get(self.current).clone();
        let resume = self.store.offset(&channel.media);
        let hint = (resume > RESUME_MIN_SECS).then_some(resume);

        match self.player.create_session(&channel.media, hint).await {
            Ok((handle, mut events)) => {
                let tx = self.event_tx.clone();
                let forwarder = tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        if tx.send(CoreEvent::Player { session: id, event }).await.is_err() {
                            break;
                        }
                    }
                });
                self.session = Some(ActiveSession {
                    id,
                    media: channel.media.clone(),
                    handle,
                    auto_advanced: false,
                    forwarder,
                });
                self.store.set_last_channel_index(self.current);
                info!("now tuned to '{}' (channel {})", channel.name, self.current);
                self.notify(Broadcast::ChannelChanged {
                    name: channel.name,
                    index: self.current,
                });
            }
            Err(e) => {
                // Screen stays dark on this channel; the viewer can keep
                // surfing and the selection is not persisted.
                warn!("channel '{}' failed to open: {}", channel.name, e);
            }
        }
    }

    async fn teardown_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            self.scheduler.cancel_all(session.id);
            session.forwarder.abort();
            session.handle.shutdown().await;
            debug!("session {} torn down", session.id);
        }
    }

    // ── player events ─────────────────────────────────────────────────────────

    async fn handle_player_event(&mut self, event: PlayerEvent) {
        match event {
            PlayerEvent::Ready => self.on_ready().await,
            PlayerEvent::Playing => {
                if let Some(id) = self.session.as_ref().map(|s| s.id) {
                    // A paused→playing resume may have no active trackers.
                    self.start_tracking(id);
                }
            }
            PlayerEvent::Paused => {
                if let Some(id) = self.session.as_ref().map(|s| s.id) {
                    // Near-end detection keeps running: it is a no-op until
                    // the content actually approaches its end.
                    self.scheduler.cancel(TaskKey {
                        session: id,
                        kind: TaskKind::PersistProgress,
                    });
                }
            }
            PlayerEvent::Ended => self.on_ended().await,
            PlayerEvent::Error(reason) => {
                // Unplayable content — skip past it without a static burst,
                // keeping the channel-surfing illusion intact.
                warn!("channel unplayable ({}), skipping", reason);
                self.next(true).await;
            }
        }
    }

    /// The session is controllable: apply the resume policy, start playback,
    /// and begin polling.
    async fn on_ready(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let id = session.id;
        let saved = self.store.offset(&session.media);
        // Sub-second carry-over is noise; restart cleanly from the top.
        let target = if saved > RESUME_MIN_SECS { saved } else { 0.0 };
        if let Err(e) = session.handle.seek_to(target).await {
            warn!("seek to {:.1}s failed: {}", target, e);
        }
        if let Err(e) = session.handle.play().await {
            warn!("play failed: {}", e);
        }
        self.start_tracking(id);
    }

    /// End-of-content push event.  Normally the near-end poll has already
    /// advanced and this arrives tagged with a dead session; it is the
    /// authoritative fallback when polling missed the window.
    async fn on_ended(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.auto_advanced {
            return;
        }
        session.auto_advanced = true;
        let media = session.media.clone();
        // Offset 0 = play from the start next time this channel comes up.
        self.store.set_offset(&media, 0.0);
        self.next(true).await;
        self.notify(Broadcast::Static {
            duration_ms: STATIC_SURF_MS,
        });
    }

    fn start_tracking(&mut self, session: u64) {
        let persist = TaskKey {
            session,
            kind: TaskKind::PersistProgress,
        };
        if !self.scheduler.is_scheduled(persist) {
            self.scheduler.schedule(
                persist,
                PROGRESS_POLL,
                self.event_tx.clone(),
                CoreEvent::ProgressTick { session },
            );
        }
        let near_end = TaskKey {
            session,
            kind: TaskKind::NearEndCheck,
        };
        if !self.scheduler.is_scheduled(near_end) {
            self.scheduler.schedule(
                near_end,
                NEAR_END_POLL,
                self.event_tx.clone(),
                CoreEvent::NearEndTick { session },
            );
        }
    }

    // ── polling actions ───────────────────────────────────────────────────────

    async fn persist_progress(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let media = session.media.clone();
        let Some(pos) = session.handle.position().await else {
            return;
        };
        if !pos.is_finite() {
            return;
        }
        self.store.set_offset(&media, pos);
    }

    async fn check_near_end(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.auto_advanced {
            return;
        }
        let (Some(pos), Some(dur)) = (
            session.handle.position().await,
            session.handle.duration().await,
        ) else {
            return; // still loading — try again next tick
        };
        if !pos.is_finite() || !dur.is_finite() || dur <= 0.0 {
            return;
        }
        let remaining = dur - pos;
        if remaining > NEAR_END_SECS || remaining <= NEAR_END_FLOOR_SECS {
            return;
        }
        session.auto_advanced = true;
        let media = session.media.clone();
        self.store.set_offset(&media, 0.0);
        debug!("near end ({:.2}s remaining), surfing on", remaining);
        self.next(true).await;
        self.notify(Broadcast::Static {
            duration_ms: STATIC_SURF_MS,
        });
    }

    // ── bookkeeping ───────────────────────────────────────────────────────────

    fn is_live(&self, session: u64) -> bool {
        self.session.as_ref().map(|s| s.id) == Some(session)
    }

    fn notify(&self, broadcast: Broadcast) {
        // No receivers is fine — nobody is watching the watchers.
        let _ = self.broadcast_tx.send(broadcast);
    }

    async fn sync_state(&mut self) {
        self.rev += 1;
        let mut state = self.state.write().await;
        state.rev = self.rev;
        state.powered = self.powered;
        state.current_index = self.current;
    }

    #[cfg(test)]
    fn active_session_id(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.id)
    }

    #[cfg(test)]
    fn task_scheduled(&self, session: u64, kind: TaskKind) -> bool {
        self.scheduler.is_scheduled(TaskKey { session, kind })
    }

    #[cfg(test)]
    fn current_index(&self) -> usize {
        self.current
    }

    #[cfg(test)]
    fn is_powered(&self) -> bool {
        self.powered
    }
}
