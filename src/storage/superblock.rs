//! The fixed 256-byte on-disk superblock (§3, §6).
use std::convert::TryInto;

use crate::consts::{BITMAP_MAGIC, SB_BYTES};
use crate::error::BitmapError;

pub const VERSION_LO: u32 = 3;
pub const VERSION_HOSTENDIAN: u32 = 3;
pub const VERSION_HI: u32 = 4;

bitflags::bitflags! {
    pub struct SbState: u32 {
        const STALE       = 0b001;
        const WRITE_ERROR = 0b010;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSlot {
    pub events: u64,
    pub events_cleared: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub magic: u32,
    pub version: u32,
    pub uuid: [u8; 16],
    pub events: u64,
    pub events_cleared: u64,
    pub state: SbState,
    pub chunksize: u32,
    pub daemon_sleep_secs: u32,
    pub write_behind: u32,
    pub sync_size: u64,
    pub nodes: u32,
    pub sectors_reserved: u32,
    /// Per-node events mirrors, populated only when `nodes > 1` (§3.1).
    /// Stored separately from the 256-byte header image; not part of
    /// `SB_BYTES`.
    pub node_slots: Vec<NodeSlot>,
}

impl Superblock {
    pub fn new(uuid: [u8; 16], chunksize: u32, daemon_sleep_secs: u32, write_behind: u32, sync_size: u64) -> Self {
        Self {
            magic: BITMAP_MAGIC,
            version: VERSION_HI,
            uuid,
            events: 0,
            events_cleared: 0,
            state: SbState::empty(),
            chunksize,
            daemon_sleep_secs,
            write_behind,
            sync_size,
            nodes: 1,
            sectors_reserved: 0,
            node_slots: Vec::new(),
        }
    }

    pub fn is_hostendian(&self) -> bool {
        self.version == VERSION_HOSTENDIAN
    }

    pub fn encode(&self) -> [u8; SB_BYTES] {
        let mut buf = [0u8; SB_BYTES];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..24].copy_from_slice(&self.uuid);
        buf[24..32].copy_from_slice(&self.events.to_le_bytes());
        buf[32..40].copy_from_slice(&self.events_cleared.to_le_bytes());
        buf[40..44].copy_from_slice(&self.state.bits().to_le_bytes());
        buf[44..48].copy_from_slice(&self.chunksize.to_le_bytes());
        buf[48..52].copy_from_slice(&self.daemon_sleep_secs.to_le_bytes());
        buf[52..56].copy_from_slice(&self.write_behind.to_le_bytes());
        buf[56..64].copy_from_slice(&self.sync_size.to_le_bytes());
        buf[64..68].copy_from_slice(&self.nodes.to_le_bytes());
        buf[68..72].copy_from_slice(&self.sectors_reserved.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; SB_BYTES]) -> Self {
        let u32_at = |range: std::ops::Range<usize>| u32::from_le_bytes(buf[range].try_into().unwrap());
        let u64_at = |range: std::ops::Range<usize>| u64::from_le_bytes(buf[range].try_into().unwrap());
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&buf[8..24]);
        Self {
            magic: u32_at(0..4),
            version: u32_at(4..8),
            uuid,
            events: u64_at(24..32),
            events_cleared: u64_at(32..40),
            state: SbState::from_bits_truncate(u32_at(40..44)),
            chunksize: u32_at(44..48),
            daemon_sleep_secs: u32_at(48..52),
            write_behind: u32_at(52..56),
            sync_size: u64_at(56..64),
            nodes: u32_at(64..68),
            sectors_reserved: u32_at(68..72),
            node_slots: Vec::new(),
        }
    }

    /// §4.3 `read_sb` validation: bad magic, out-of-range version,
    /// `chunksize < 512` or not a power of two, `daemon_sleep` out of
    /// `[1, MAX_SCHED]`, `write_behind > COUNTER_MAX`.
    pub fn validate(&self, expected_uuid: Option<[u8; 16]>) -> Result<(), BitmapError> {
        if self.magic != BITMAP_MAGIC {
            return Err(BitmapError::InvalidImage {
                reason: "bad magic".into(),
            });
        }
        if self.version < VERSION_LO || self.version > VERSION_HI {
            return Err(BitmapError::InvalidImage {
                reason: "unrecognized superblock version".into(),
            });
        }
        if self.chunksize < 512 {
            return Err(BitmapError::InvalidImage {
                reason: "chunksize too small".into(),
            });
        }
        if !self.chunksize.is_power_of_two() {
            return Err(BitmapError::InvalidImage {
                reason: "chunksize not a power of 2".into(),
            });
        }
        if self.daemon_sleep_secs < 1 || self.daemon_sleep_secs > crate::consts::MAX_SCHED_SECONDS {
            return Err(BitmapError::InvalidImage {
                reason: "daemon sleep period out of range".into(),
            });
        }
        if self.write_behind as u16 > crate::consts::COUNTER_MAX {
            return Err(BitmapError::InvalidImage {
                reason: "write-behind limit out of range".into(),
            });
        }
        if let Some(expected) = expected_uuid {
            if expected != self.uuid {
                return Err(BitmapError::InvalidImage {
                    reason: "UUID mismatch".into(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips() {
        let sb = Superblock::new([7u8; 16], 4096, 5, 0, 2048);
        let bytes = sb.encode();
        let decoded = Superblock::decode(&bytes);
        assert_eq!(sb.magic, decoded.magic);
        assert_eq!(sb.uuid, decoded.uuid);
        assert_eq!(sb.chunksize, decoded.chunksize);
        assert_eq!(sb.daemon_sleep_secs, decoded.daemon_sleep_secs);
        assert_eq!(sb.sync_size, decoded.sync_size);
    }

    #[test]
    fn validate_rejects_bad_magic() {
        let mut sb = Superblock::new([0u8; 16], 4096, 5, 0, 0);
        sb.magic = 0xDEAD;
        assert!(sb.validate(None).is_err());
    }

    #[test]
    fn validate_rejects_non_power_of_two_chunksize() {
        let sb = Superblock::new([0u8; 16], 4097, 5, 0, 0);
        assert!(sb.validate(None).is_err());
    }

    #[test]
    fn validate_rejects_chunksize_below_512() {
        let sb = Superblock::new([0u8; 16], 256, 5, 0, 0);
        assert!(sb.validate(None).is_err());
    }

    #[test]
    fn validate_rejects_daemon_sleep_out_of_range() {
        let mut sb = Superblock::new([0u8; 16], 4096, 0, 0, 0);
        assert!(sb.validate(None).is_err());
        sb.daemon_sleep_secs = crate::consts::MAX_SCHED_SECONDS + 1;
        assert!(sb.validate(None).is_err());
    }

    #[test]
    fn validate_rejects_uuid_mismatch_for_persistent_arrays() {
        let sb = Superblock::new([1u8; 16], 4096, 5, 0, 0);
        assert!(sb.validate(Some([2u8; 16])).is_err());
        assert!(sb.validate(Some([1u8; 16])).is_ok());
    }
}
