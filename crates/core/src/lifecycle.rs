/// Connection lifecycle state machine
///
/// `Connecting -> Ready -> Closing -> Closed`, with `Failed` reachable from
/// `Connecting` and `Ready`.
///
/// Two further edges exist on purpose. `Connecting -> Closed` covers a close
/// requested before the handshake finished, which has no in-flight streams
/// to drain. `Closing -> Failed` covers a transport that breaks while the
/// close grace is still running.
/// Mutated only on the loop thread; the current state is mirrored into a
/// `StateWatch` that other threads may read.
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Handshake in progress, no streams may be opened
    Connecting,

    /// Handshake completed, streams may be opened
    Ready,

    /// Close initiated, no new streams, in-flight streams may complete
    Closing,

    /// Orderly terminal state
    Closed,

    /// Terminal state after an unrecoverable transport error
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }

    /// Whether the lifecycle allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Connecting, Ready)
                | (Connecting, Closed)
                | (Connecting, Failed)
                | (Ready, Closing)
                | (Ready, Failed)
                | (Closing, Closed)
                | (Closing, Failed)
        )
    }

    fn to_u8(self) -> u8 {
        match self {
            ConnectionState::Connecting => 0,
            ConnectionState::Ready => 1,
            ConnectionState::Closing => 2,
            ConnectionState::Closed => 3,
            ConnectionState::Failed => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Ready,
            2 => ConnectionState::Closing,
            3 => ConnectionState::Closed,
            _ => ConnectionState::Failed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Read-only view of a connection's state from any thread
#[derive(Debug, Clone)]
pub struct StateWatch(Arc<AtomicU8>);

impl StateWatch {
    fn new(state: ConnectionState) -> Self {
        Self(Arc::new(AtomicU8::new(state.to_u8())))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: ConnectionState) {
        self.0.store(state.to_u8(), Ordering::Release);
    }
}

/// A transition the lifecycle refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Invalid connection transition: {from} -> {to}")]
pub struct TransitionError {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// The connection state machine
#[derive(Debug)]
pub struct Lifecycle {
    state: ConnectionState,
    watch: StateWatch,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Connecting,
            watch: StateWatch::new(ConnectionState::Connecting),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn watch(&self) -> StateWatch {
        self.watch.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    fn transition(&mut self, next: ConnectionState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }

        debug!("Connection {} -> {}", self.state, next);
        self.state = next;
        self.watch.set(next);
        Ok(())
    }

    /// Handshake-completed event; `Ready` is entered exactly once
    pub fn on_handshake_completed(&mut self) -> Result<(), TransitionError> {
        self.transition(ConnectionState::Ready)?;
        info!("Connection ready");
        Ok(())
    }

    /// Local close request. Returns false when there is nothing to close.
    pub fn begin_close(&mut self) -> bool {
        match self.state {
            ConnectionState::Ready => self.transition(ConnectionState::Closing).is_ok(),
            ConnectionState::Connecting => self.transition(ConnectionState::Closed).is_ok(),
            ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Failed => false,
        }
    }

    /// Transport-level close, local or remote. Walks through `Closing` when needed.
    pub fn on_closed(&mut self) {
        if self.state == ConnectionState::Ready {
            let _ = self.transition(ConnectionState::Closing);
        }
        if self.transition(ConnectionState::Closed).is_ok() {
            info!("Connection closed");
        }
    }

    /// Unrecoverable transport error
    pub fn fail(&mut self, reason: &str) {
        if self.transition(ConnectionState::Failed).is_ok() {
            warn!("Connection failed: {}", reason);
        }
    }
}
