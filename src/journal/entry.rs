//! Journal Entry Types
//!
//! Defines the events a primary writer appends to the journal and the
//! stored entry that wraps them.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::CommitPosition;
use crate::error::{Error, Result};

/// Events replayed against a replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalEvent {
    /// Write bytes at an offset
    AioWrite { offset: u64, data: Vec<u8> },

    /// Zero a byte range
    AioDiscard { offset: u64, length: u64 },

    /// Flush outstanding writes
    AioFlush,

    // Snapshot ids are assigned by the primary and survive renames

    /// Create a snapshot
    SnapCreate { snap_id: u64, name: String },

    /// Remove a snapshot
    SnapRemove { snap_id: u64, name: String },

    /// Rename a snapshot
    SnapRename { snap_id: u64, src: String, dst: String },

    /// Protect a snapshot against removal
    SnapProtect { snap_id: u64, name: String },

    /// Drop snapshot protection
    SnapUnprotect { snap_id: u64, name: String },

    /// Set an image metadata key
    MetadataSet { key: String, value: String },

    /// Remove an image metadata key
    MetadataRemove { key: String },

    /// Enable or disable feature bits
    UpdateFeatures { features: u64, enabled: bool },

    /// Marker with no effect on the replica
    Noop,
}

/// Broad category of a journal event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Io,
    Metadata,
    Noop,
}

impl JournalEvent {
    /// Category of this event
    pub fn kind(&self) -> EventKind {
        match self {
            JournalEvent::AioWrite { .. }
            | JournalEvent::AioDiscard { .. }
            | JournalEvent::AioFlush => EventKind::Io,
            JournalEvent::Noop => EventKind::Noop,
            _ => EventKind::Metadata,
        }
    }

    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            JournalEvent::AioWrite { .. } => "aio_write",
            JournalEvent::AioDiscard { .. } => "aio_discard",
            JournalEvent::AioFlush => "aio_flush",
            JournalEvent::SnapCreate { .. } => "snap_create",
            JournalEvent::SnapRemove { .. } => "snap_remove",
            JournalEvent::SnapRename { .. } => "snap_rename",
            JournalEvent::SnapProtect { .. } => "snap_protect",
            JournalEvent::SnapUnprotect { .. } => "snap_unprotect",
            JournalEvent::MetadataSet { .. } => "metadata_set",
            JournalEvent::MetadataRemove { .. } => "metadata_remove",
            JournalEvent::UpdateFeatures { .. } => "update_features",
            JournalEvent::Noop => "noop",
        }
    }

    /// Serialize event to bytes
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize event from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Stored journal entry
#[derive(Debug, Clone)]
pub struct JournalEntry {
    /// Position of this entry
    pub position: CommitPosition,
    /// Time the primary appended the entry
    pub write_time: DateTime<Utc>,
    /// CRC32 checksum of the stored payload
    pub checksum: u32,
    /// Whether the payload is LZ4 compressed
    pub compressed: bool,
    /// Encoded event
    pub payload: Bytes,
}

impl JournalEntry {
    /// Encode an event into an entry, compressing payloads above `compress_threshold`
    pub fn new(
        position: CommitPosition,
        write_time: DateTime<Utc>,
        event: &JournalEvent,
        compress_threshold: usize,
    ) -> Result<Self> {
        let serialized = event.serialize()?;
        let compressed = serialized.len() > compress_threshold;
        let data = if compressed {
            lz4_flex::compress_prepend_size(&serialized)
        } else {
            serialized
        };

        Ok(Self {
            position,
            write_time,
            checksum: crc32fast::hash(&data),
            compressed,
            payload: Bytes::from(data),
        })
    }

    /// Writer epoch of this entry
    pub fn tag_tid(&self) -> u64 {
        self.position.tag_tid
    }

    /// Verify checksum
    pub fn verify_checksum(&self) -> bool {
        crc32fast::hash(&self.payload) == self.checksum
    }

    /// Decode the event carried by this entry
    pub fn decode(&self) -> Result<JournalEvent> {
        if !self.verify_checksum() {
            return Err(Error::JournalCorrupted {
                position: self.position,
                reason: format!(
                    "checksum mismatch: expected {:08x}, computed {:08x}",
                    self.checksum,
                    crc32fast::hash(&self.payload)
                ),
            });
        }

        let decompressed;
        let data: &[u8] = if self.compressed {
            decompressed = lz4_flex::decompress_size_prepended(&self.payload).map_err(|e| {
                Error::JournalCorrupted {
                    position: self.position,
                    reason: format!("decompression failed: {}", e),
                }
            })?;
            &decompressed[..]
        } else {
            &self.payload[..]
        };

        JournalEvent::deserialize(data).map_err(|e| Error::JournalCorrupted {
            position: self.position,
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kinds() {
        assert_eq!(JournalEvent::AioFlush.kind(), EventKind::Io);
        assert_eq!(
            JournalEvent::SnapCreate {
                snap_id: 1,
                name: "foo".into()
            }
            .kind(),
            EventKind::Metadata
        );
        assert_eq!(JournalEvent::Noop.kind(), EventKind::Noop);
        assert_eq!(JournalEvent::Noop.name(), "noop");
    }

    #[test]
    fn test_large_payload_is_compressed() {
        let event = JournalEvent::AioWrite {
            offset: 4096,
            data: vec![0x5a; 16 * 1024],
        };
        let entry = JournalEntry::new(CommitPosition::new(0, 1, 0), Utc::now(), &event, 4096)
            .unwrap();

        assert!(entry.compressed);
        assert!(entry.payload.len() < 16 * 1024);
        assert_eq!(entry.decode().unwrap(), event);
    }

    #[test]
    fn test_corrupted_payload_is_rejected() {
        let event = JournalEvent::MetadataSet {
            key: "test_key".into(),
            value: "test_value".into(),
        };
        let mut entry =
            JournalEntry::new(CommitPosition::new(0, 1, 7), Utc::now(), &event, 4096).unwrap();

        let mut tampered = entry.payload.to_vec();
        tampered[0] ^= 0xff;
        entry.payload = Bytes::from(tampered);

        match entry.decode() {
            Err(Error::JournalCorrupted { position, .. }) => {
                assert_eq!(position, CommitPosition::new(0, 1, 7));
            }
            other => panic!("expected corruption error, got {:?}", other),
        }
    }
}
