//! # Snapshot Format
//!
//! Binary serialization for session snapshots.
//!
//! Format: Header (5 bytes) + postcard-serialized [`SessionSnapshot`].
//! - 4 bytes: Magic ("SWLK")
//! - 1 byte: Version
//!
//! File and database I/O live elsewhere; this module only turns snapshots
//! into bytes and back.
//!
//! ## Limits
//!
//! The payload size and the header are checked before anything is
//! deserialized, so corrupted or hostile input fails fast.

use crate::lifecycle::SessionSnapshot;
use crate::{SequencerError, primitives};

/// Maximum accepted size of an encoded snapshot (16 MB).
pub const MAX_SNAPSHOT_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 5;

// =============================================================================
// HEADER
// =============================================================================

/// The header that precedes every snapshot payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub magic: [u8; 4],
    pub version: u8,
}

impl SnapshotHeader {
    /// A header with the current format version.
    #[must_use]
    pub fn new() -> Self {
        Self {
            magic: *primitives::MAGIC_BYTES,
            version: primitives::FORMAT_VERSION,
        }
    }

    pub fn validate(&self) -> Result<(), SequencerError> {
        if &self.magic != primitives::MAGIC_BYTES {
            return Err(SequencerError::Serialization(
                "Invalid magic bytes".to_string(),
            ));
        }
        if self.version != primitives::FORMAT_VERSION {
            return Err(SequencerError::Serialization(format!(
                "Unsupported version: {} (expected {})",
                self.version,
                primitives::FORMAT_VERSION
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4] = self.version;
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SequencerError> {
        let (Some(magic), Some(&version)) = (bytes.get(0..4), bytes.get(4)) else {
            return Err(SequencerError::Serialization(
                "Header too short".to_string(),
            ));
        };
        let mut header = Self::new();
        header.magic.copy_from_slice(magic);
        header.version = version;
        Ok(header)
    }
}

impl Default for SnapshotHeader {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// SERIALIZATION FUNCTIONS
// =============================================================================

/// Encode a snapshot (header + payload).
pub fn snapshot_to_bytes(snapshot: &SessionSnapshot) -> Result<Vec<u8>, SequencerError> {
    let payload = postcard::to_stdvec(snapshot)
        .map_err(|e| SequencerError::Serialization(e.to_string()))?;
    if payload.len() > MAX_SNAPSHOT_SIZE {
        return Err(SequencerError::LimitExceeded(format!(
            "snapshot of session {} is {} bytes (maximum {})",
            snapshot.session,
            payload.len(),
            MAX_SNAPSHOT_SIZE
        )));
    }

    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(&SnapshotHeader::new().to_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Decode a snapshot.
///
/// Size and header are validated before the payload is touched.
pub fn snapshot_from_bytes(bytes: &[u8]) -> Result<SessionSnapshot, SequencerError> {
    if bytes.len() < HEADER_LEN {
        return Err(SequencerError::Serialization(format!(
            "Data too short: minimum {} bytes required",
            HEADER_LEN
        )));
    }
    if bytes.len() > MAX_SNAPSHOT_SIZE {
        return Err(SequencerError::Serialization(format!(
            "Data size {} bytes exceeds maximum allowed {} bytes",
            bytes.len(),
            MAX_SNAPSHOT_SIZE
        )));
    }

    SnapshotHeader::from_bytes(bytes)?.validate()?;

    let payload = bytes.get(HEADER_LEN..).unwrap_or_default();
    postcard::from_bytes(payload).map_err(|e| {
        SequencerError::Serialization(format!("Failed to deserialize snapshot: {}", e))
    })
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SequenceBuilder, Sequencer, StepDescriptor, StepStore};

    fn snapshot() -> SessionSnapshot {
        let mut store = StepStore::new();
        store.register(StepDescriptor::new("consent")).expect("register");
        store.register(StepDescriptor::new("end").terminal()).expect("register");
        let definition = SequenceBuilder::new()
            .stage("consent")
            .stage("end")
            .build(&store, "A")
            .expect("build");
        let mut seq = Sequencer::passive("s-1", definition).expect("sequencer");
        seq.start().expect("start");
        seq.snapshot()
    }

    #[test]
    fn header_roundtrip() {
        let bytes = SnapshotHeader::new().to_bytes();
        let header = SnapshotHeader::from_bytes(&bytes).expect("parse header");
        assert_eq!(header.magic, *primitives::MAGIC_BYTES);
        assert_eq!(header.version, primitives::FORMAT_VERSION);
    }

    #[test]
    fn encoding_is_stable() {
        let snap = snapshot();
        let first = snapshot_to_bytes(&snap).expect("encode");
        let decoded = snapshot_from_bytes(&first).expect("decode");
        assert_eq!(decoded, snap);
        assert_eq!(snapshot_to_bytes(&decoded).expect("re-encode"), first);
    }

    #[test]
    fn invalid_magic_rejected() {
        let mut bytes = vec![0u8; 10];
        bytes[0..4].copy_from_slice(b"XXXX");
        assert!(snapshot_from_bytes(&bytes).is_err());
    }

    #[test]
    fn wrong_version_rejected() {
        let mut bytes = snapshot_to_bytes(&snapshot()).expect("encode");
        bytes[4] = primitives::FORMAT_VERSION.wrapping_add(1);
        assert!(matches!(
            snapshot_from_bytes(&bytes),
            Err(SequencerError::Serialization(_))
        ));
    }

    #[test]
    fn short_input_rejected() {
        assert!(snapshot_from_bytes(b"SWL").is_err());
    }
}
