//! Per-peripheral connection state machine.
//!
//! ```text
//! Disconnected --connect()--> Connecting --native success--> Connected
//! Connecting --native failure/timeout--> Disconnected
//! Connected --disconnect()/link loss--> Disconnecting --ack/timeout--> Disconnected
//! ```
//!
//! The machine only validates and records transitions. The session performs
//! the native calls and emits events for each transition it reports.

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Error, Result};

/// Connection state for a peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// Not connected to the peripheral.
    #[default]
    Disconnected,
    /// Currently attempting to connect.
    Connecting,
    /// Connected to the peripheral.
    Connected,
    /// Currently disconnecting.
    Disconnecting,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Why a peripheral left the connected state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DisconnectReason {
    /// The consumer asked for it.
    Requested,
    /// The link dropped (peripheral gone, radio off, ...).
    LinkLost,
    /// The central is shutting down.
    Shutdown,
}

type Reply = oneshot::Sender<Result<()>>;

/// Outcome of a disconnect request.
#[derive(Debug)]
pub(crate) enum DisconnectStep {
    /// Nothing to do; the peripheral is not connected.
    AlreadyDisconnected(Reply),
    /// A disconnect is already running; the reply joins it.
    Joined,
    /// A native disconnect must be issued for this generation.
    Started(u64),
}

/// Connection bookkeeping for one peripheral.
#[derive(Debug, Default)]
pub(crate) struct ConnectionMachine {
    state: ConnectionState,
    /// Bumped on every connect attempt; completions carry it to detect staleness.
    generation: u64,
    connect_reply: Option<Reply>,
    disconnect_replies: Vec<Reply>,
    reason: Option<DisconnectReason>,
}

impl ConnectionMachine {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// `Disconnected -> Connecting`.
    ///
    /// On rejection the reply is handed back so the caller can resolve it.
    pub fn begin_connect(&mut self, reply: Reply) -> std::result::Result<u64, (Reply, Error)> {
        if self.state != ConnectionState::Disconnected {
            let err = Error::invalid_state(format!("cannot connect while {}", self.state));
            return Err((reply, err));
        }

        self.generation += 1;
        self.connect_reply = Some(reply);
        self.reason = None;
        self.transition(ConnectionState::Connecting);
        Ok(self.generation)
    }

    /// Whether `generation` is the connect attempt still in progress.
    pub fn is_attempt(&self, generation: u64) -> bool {
        generation == self.generation && self.state == ConnectionState::Connecting
    }

    /// Resolve a native connect completion.
    ///
    /// Returns `None` when the completion is stale (a newer attempt exists or
    /// the attempt was abandoned), otherwise the reply of the attempt.
    pub fn finish_connect(&mut self, generation: u64, success: bool) -> Option<Option<Reply>> {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            debug!(
                "Ignoring stale connect completion (generation {}, current {}, state {})",
                generation, self.generation, self.state
            );
            return None;
        }

        self.transition(if success {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        });
        Some(self.connect_reply.take())
    }

    /// `Connected -> Disconnecting` on a consumer request.
    pub fn begin_disconnect(&mut self, reply: Reply) -> std::result::Result<DisconnectStep, (Reply, Error)> {
        match self.state {
            ConnectionState::Disconnected => Ok(DisconnectStep::AlreadyDisconnected(reply)),
            ConnectionState::Disconnecting => {
                self.disconnect_replies.push(reply);
                Ok(DisconnectStep::Joined)
            }
            ConnectionState::Connecting => Err((
                reply,
                Error::invalid_state("cannot disconnect while a connect is in progress"),
            )),
            ConnectionState::Connected => {
                self.disconnect_replies.push(reply);
                self.reason = Some(DisconnectReason::Requested);
                self.transition(ConnectionState::Disconnecting);
                Ok(DisconnectStep::Started(self.generation))
            }
        }
    }

    /// The link dropped (or the central is tearing down).
    ///
    /// Returns `true` if the peripheral was connected or disconnecting and
    /// must now be finished with [`finish_disconnect`](Self::finish_disconnect).
    pub fn link_lost(&mut self, reason: DisconnectReason) -> bool {
        match self.state {
            ConnectionState::Connected => {
                self.reason = Some(reason);
                self.transition(ConnectionState::Disconnecting);
                true
            }
            ConnectionState::Disconnecting => true,
            ConnectionState::Connecting | ConnectionState::Disconnected => false,
        }
    }

    /// Abandon an in-flight connect attempt (radio lost, shutdown).
    pub fn abort_connect(&mut self) -> Option<Reply> {
        if self.state != ConnectionState::Connecting {
            return None;
        }
        self.transition(ConnectionState::Disconnected);
        self.connect_reply.take()
    }

    /// `Disconnecting -> Disconnected`.
    ///
    /// Returns the waiting replies and the reason, or `None` if the
    /// peripheral was not disconnecting (completion already handled).
    pub fn finish_disconnect(&mut self) -> Option<(Vec<Reply>, DisconnectReason)> {
        if self.state != ConnectionState::Disconnecting {
            return None;
        }
        self.transition(ConnectionState::Disconnected);
        let reason = self.reason.take().unwrap_or(DisconnectReason::Requested);
        Some((std::mem::take(&mut self.disconnect_replies), reason))
    }

    fn transition(&mut self, new_state: ConnectionState) {
        if self.state != new_state {
            debug!("Connection state changed: {} -> {}", self.state, new_state);
            self.state = new_state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply() -> Reply {
        oneshot::channel().0
    }

    #[test]
    fn test_connection_state() {
        assert!(!ConnectionState::Disconnected.is_connected());
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());

        assert!(ConnectionState::Connecting.is_transitioning());
        assert!(ConnectionState::Disconnecting.is_transitioning());
        assert!(!ConnectionState::Connected.is_transitioning());
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(format!("{}", ConnectionState::Connected), "Connected");
        assert_eq!(format!("{}", ConnectionState::Disconnected), "Disconnected");
    }

    #[test]
    fn test_connect_success_path() {
        let mut machine = ConnectionMachine::default();
        let generation = machine.begin_connect(reply()).unwrap();
        assert_eq!(machine.state(), ConnectionState::Connecting);

        let resolved = machine.finish_connect(generation, true);
        assert!(matches!(resolved, Some(Some(_))));
        assert_eq!(machine.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_connect_rejected_while_busy() {
        let mut machine = ConnectionMachine::default();
        let generation = machine.begin_connect(reply()).unwrap();

        match machine.begin_connect(reply()) {
            Err((_, Error::InvalidState { .. })) => {}
            other => panic!("expected InvalidState, got {:?}", other.map(|_| ())),
        }

        machine.finish_connect(generation, true);
        assert!(machine.begin_connect(reply()).is_err());
        assert_eq!(machine.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_connect_failure_returns_to_disconnected() {
        let mut machine = ConnectionMachine::default();
        let generation = machine.begin_connect(reply()).unwrap();
        machine.finish_connect(generation, false);
        assert_eq!(machine.state(), ConnectionState::Disconnected);

        // A fresh attempt gets a new generation; the old completion is stale.
        let next = machine.begin_connect(reply()).unwrap();
        assert_ne!(next, generation);
        assert!(machine.finish_connect(generation, true).is_none());
        assert_eq!(machine.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_disconnect_flow() {
        let mut machine = ConnectionMachine::default();
        let generation = machine.begin_connect(reply()).unwrap();
        machine.finish_connect(generation, true);

        assert!(matches!(
            machine.begin_disconnect(reply()),
            Ok(DisconnectStep::Started(g)) if g == generation
        ));
        assert!(matches!(machine.begin_disconnect(reply()), Ok(DisconnectStep::Joined)));

        let (replies, reason) = machine.finish_disconnect().unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(reason, DisconnectReason::Requested);
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert!(machine.finish_disconnect().is_none());
    }

    #[test]
    fn test_disconnect_when_idle() {
        let mut machine = ConnectionMachine::default();
        assert!(matches!(
            machine.begin_disconnect(reply()),
            Ok(DisconnectStep::AlreadyDisconnected(_))
        ));
    }

    #[test]
    fn test_link_loss() {
        let mut machine = ConnectionMachine::default();
        assert!(!machine.link_lost(DisconnectReason::LinkLost));

        let generation = machine.begin_connect(reply()).unwrap();
        assert!(!machine.link_lost(DisconnectReason::LinkLost));
        machine.finish_connect(generation, true);

        assert!(machine.link_lost(DisconnectReason::LinkLost));
        assert_eq!(machine.state(), ConnectionState::Disconnecting);
        let (replies, reason) = machine.finish_disconnect().unwrap();
        assert!(replies.is_empty());
        assert_eq!(reason, DisconnectReason::LinkLost);
    }

    #[test]
    fn test_abort_connect() {
        let mut machine = ConnectionMachine::default();
        let generation = machine.begin_connect(reply()).unwrap();
        assert!(machine.is_attempt(generation));
        assert!(machine.abort_connect().is_some());
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert!(!machine.is_attempt(generation));
        assert_eq!(machine.generation(), generation);
        assert!(machine.finish_connect(generation, true).is_none());
    }
}
