//! Media player capability contract.
//!
//! The state machine in `core` only ever talks to the backend through these
//! traits; the production implementation lives in `mpv`, and tests drive the
//! machine with a scripted fake.

use tokio::sync::mpsc;

/// Asynchronous events a session delivers to the core.  Exactly one `Ready`
/// fires once the backend is controllable; after that the core may seek and
/// start playback.  Delivery order is not guaranteed — the core treats
/// duplicates and strays defensively.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    Ready,
    Playing,
    Paused,
    Ended,
    /// Content is unplayable.  The core surfs past it; never fatal.
    Error(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    #[error("player binary not found")]
    BinaryNotFound,
    #[error("failed to spawn player: {0}")]
    Spawn(String),
    #[error("player IPC failed: {0}")]
    Ipc(String),
    #[error("player IPC timed out")]
    Timeout,
}

/// Session factory.  `resume_hint` lets the backend start loading near the
/// resume point; the core still issues the authoritative seek on `Ready`.
#[allow(async_fn_in_trait)]
pub trait MediaPlayer {
    type Session: PlayerSession;

    async fn create_session(
        &mut self,
        media: &str,
        resume_hint: Option<f64>,
    ) -> Result<(Self::Session, mpsc::Receiver<PlayerEvent>), PlayerError>;
}

/// Handle for one live playback session.
///
/// `position` and `duration` may be transiently unknown during load — that is
/// "sample skipped, try again next poll", never an error.
#[allow(async_fn_in_trait)]
pub trait PlayerSession {
    async fn play(&self) -> Result<(), PlayerError>;
    async fn seek_to(&self, secs: f64) -> Result<(), PlayerError>;
    async fn position(&self) -> Option<f64>;
    async fn duration(&self) -> Option<f64>;
    async fn set_mute(&self, muted: bool) -> Result<(), PlayerError>;
    /// Tear the session down.  Idempotent; never fails.
    async fn shutdown(&mut self);
}
