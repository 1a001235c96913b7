//! Mirror Module
//!
//! Per-volume replication: commit tracking, bootstrap, the replay loop and
//! the controller state machine that owns them.

pub mod bootstrap;
pub mod commit;
mod controller;
mod registry;
pub mod replay;
mod retry;


pub use bootstrap::{BootstrapCoordinator, Bootstrapped, RegistrationAction};
pub use commit::{CommitLag, CommitTracker};
pub use controller::ReplicationController;
pub use registry::MirrorRegistry;
pub use replay::{ReplayEngine, ReplayExit};
pub use retry::RetryBudget;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::error::Error;
use crate::journal::CommitPosition;
use crate::volume::RemoteImage;

/// Capacity of the per-controller event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Controller lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControllerState {
    Stopped,
    Starting,
    Bootstrapping,
    Replaying,
    /// Replaying with applied entries waiting out the mirroring delay
    ReplayFlushing,
    Stopping,
}

impl ControllerState {
    /// True while the replay engine is consuming the journal
    pub fn is_replaying(&self) -> bool {
        matches!(self, ControllerState::Replaying | ControllerState::ReplayFlushing)
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerState::Stopped => "STOPPED",
            ControllerState::Starting => "STARTING",
            ControllerState::Bootstrapping => "BOOTSTRAPPING",
            ControllerState::Replaying => "REPLAYING",
            ControllerState::ReplayFlushing => "REPLAY_FLUSHING",
            ControllerState::Stopping => "STOPPING",
        };
        write!(f, "{}", name)
    }
}

/// The remote side a controller replicates from
#[derive(Clone)]
pub struct Peer {
    /// Name of the remote cluster, for logs and status
    pub cluster_name: String,
    /// Remote source volume
    pub remote: Arc<dyn RemoteImage>,
    /// Local mirror identity, used as this replica's journal client id
    pub local_mirror_uuid: String,
    /// Mirror identity of the remote cluster
    pub remote_mirror_uuid: String,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("cluster_name", &self.cluster_name)
            .field("volume", &self.remote.name())
            .field("local_mirror_uuid", &self.local_mirror_uuid)
            .field("remote_mirror_uuid", &self.remote_mirror_uuid)
            .finish()
    }
}

/// Events emitted for external status reporting
#[derive(Debug, Clone)]
pub enum MirrorEvent {
    StateChanged {
        from: ControllerState,
        to: ControllerState,
    },
    Fault {
        error: Error,
        /// True when the controller is about to re-bootstrap
        recovering: bool,
    },
    CommitLag(CommitLag),
    Resynced {
        global_id: String,
    },
}

/// Point-in-time controller status
#[derive(Debug, Clone, Serialize)]
pub struct MirrorStatus {
    pub volume: String,
    pub peer: String,
    pub global_id: Option<String>,
    pub state: ControllerState,
    pub last_error: Option<String>,
    pub last_error_kind: Option<&'static str>,
    pub replica_position: Option<CommitPosition>,
    pub primary_position: Option<CommitPosition>,
    pub entries_behind: Option<u64>,
}

/// Controller state shared with the replay task
pub(crate) struct StateCell {
    volume: String,
    state_tx: watch::Sender<ControllerState>,
    events_tx: broadcast::Sender<MirrorEvent>,
}

impl StateCell {
    pub(crate) fn new(volume: impl Into<String>) -> Self {
        let (state_tx, _) = watch::channel(ControllerState::Stopped);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            volume: volume.into(),
            state_tx,
            events_tx,
        }
    }

    pub(crate) fn get(&self) -> ControllerState {
        *self.state_tx.borrow()
    }

    pub(crate) fn set(&self, to: ControllerState) {
        let from = self.state_tx.send_replace(to);
        self.transitioned(from, to);
    }

    /// Switch between the replaying states without overriding a stop
    pub(crate) fn set_while_replaying(&self, to: ControllerState) {
        let mut from = to;
        let changed = self.state_tx.send_if_modified(|state| {
            if state.is_replaying() && *state != to {
                from = *state;
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            self.transitioned(from, to);
        }
    }

    /// Set a state unless a stop is underway or complete
    pub(crate) fn set_unless_stopping(&self, to: ControllerState) -> bool {
        let mut from = to;
        let changed = self.state_tx.send_if_modified(|state| {
            if matches!(*state, ControllerState::Stopping | ControllerState::Stopped) {
                false
            } else {
                from = *state;
                *state = to;
                true
            }
        });
        if changed {
            self.transitioned(from, to);
        }
        changed
    }

    fn transitioned(&self, from: ControllerState, to: ControllerState) {
        if from == to {
            return;
        }
        tracing::info!("Volume '{}': {} -> {}", self.volume, from, to);
        self.emit(MirrorEvent::StateChanged { from, to });
    }

    pub(crate) fn emit(&self, event: MirrorEvent) {
        // no subscribers is fine
        let _ = self.events_tx.send(event);
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<ControllerState> {
        self.state_tx.subscribe()
    }

    pub(crate) fn subscribe_events(&self) -> broadcast::Receiver<MirrorEvent> {
        self.events_tx.subscribe()
    }
}

#[cfg(test)]
mod state_tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(ControllerState::ReplayFlushing.to_string(), "REPLAY_FLUSHING");
        assert!(ControllerState::ReplayFlushing.is_replaying());
        assert!(!ControllerState::Bootstrapping.is_replaying());
        assert_eq!(
            serde_json::to_string(&ControllerState::Stopped).unwrap(),
            "\"STOPPED\""
        );
    }

    #[test]
    fn test_replaying_switch_does_not_override_stop() {
        let cell = StateCell::new("image");
        let mut events = cell.subscribe_events();

        cell.set(ControllerState::Replaying);
        cell.set_while_replaying(ControllerState::ReplayFlushing);
        assert_eq!(cell.get(), ControllerState::ReplayFlushing);

        cell.set(ControllerState::Stopping);
        cell.set_while_replaying(ControllerState::Replaying);
        assert_eq!(cell.get(), ControllerState::Stopping);

        let mut transitions = Vec::new();
        while let Ok(MirrorEvent::StateChanged { to, .. }) = events.try_recv() {
            transitions.push(to);
        }
        assert_eq!(
            transitions,
            vec![
                ControllerState::Replaying,
                ControllerState::ReplayFlushing,
                ControllerState::Stopping
            ]
        );
    }

    #[test]
    fn test_recovery_states_do_not_override_stop() {
        let cell = StateCell::new("image");
        assert!(!cell.set_unless_stopping(ControllerState::Bootstrapping));
        assert_eq!(cell.get(), ControllerState::Stopped);

        cell.set(ControllerState::ReplayFlushing);
        assert!(cell.set_unless_stopping(ControllerState::Bootstrapping));
        assert_eq!(cell.get(), ControllerState::Bootstrapping);

        cell.set(ControllerState::Stopping);
        assert!(!cell.set_unless_stopping(ControllerState::Replaying));
        assert_eq!(cell.get(), ControllerState::Stopping);
    }
}
