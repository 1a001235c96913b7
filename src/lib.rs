//! WolfMirror - Asynchronous Block Volume Mirroring
//!
//! Continuously replicates a block volume from a remote cluster by replaying
//! the ordered event journal written on the remote primary against a local
//! replica.
//!
//! # Architecture
//!
//! Each mirrored volume is driven by one [`ReplicationController`]. The
//! controller bootstraps the replica, then runs a replay engine that reads
//! the journal in order, applies every event under exclusive ownership of
//! the replica and advances this replica's commit position on the journal.
//!
//! # Features
//!
//! - Idempotent bootstrap with full image sync for new or resynced replicas
//! - Ordered replay with tag (writer epoch) boundary handling
//! - Optional mirroring delay between apply and commit
//! - Automatic recovery from replay faults within a retry budget
//! - Disconnect detection with manual or automatic resync
//! - In-memory journal and volumes for simulation and testing

pub mod config;
pub mod error;
pub mod journal;
pub mod mirror;
pub mod volume;

pub use config::MirrorConfig;
pub use error::{Error, Result};
pub use mirror::{MirrorRegistry, ReplicationController};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{MirrorConfig, ReplayerSettings};
    pub use crate::error::{Error, Result};
    pub use crate::journal::{CommitPosition, JournalEvent, RemoteJournal};
    pub use crate::mirror::{ControllerState, MirrorRegistry, Peer, ReplicationController};
    pub use crate::volume::{LocalPool, LocalVolume, RemoteImage};
}
