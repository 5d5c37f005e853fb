//! Collaborators the bitmap engine consumes but does not implement (§1 of
//! the spec): the array metadata layer, the block I/O transport, the
//! cluster lock manager, and the wall-clock the daemon schedules against.
//! Each is a trait here; `host::reference` supplies a file/thread-based
//! implementation the CLI and the test suite use so the engine can be
//! exercised end to end without a real RAID array underneath it.
use std::sync::Arc;
use std::time::Instant;

use crate::error::BitmapError;

/// One member device of the array, as far as the bitmap engine is
/// concerned: an opaque handle the `BlockTransport` knows how to address.
/// The engine never interprets the id itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemberId(pub u32);

/// The array metadata layer: member list, event counter, UUID, resync
/// bounds. Out of scope per §1; modeled here as the minimal surface the
/// engine's superblock and write paths read from it.
pub trait ArrayMeta: Send + Sync {
    fn uuid(&self) -> [u8; 16];
    fn events(&self) -> u64;
    fn is_degraded(&self) -> bool;
    /// Active, non-faulty members, refcounted so that adding/removing a
    /// member mid-traversal is safe for the caller (spec §4.3).
    fn active_members(&self) -> Vec<MemberId>;
    fn logical_block_size(&self, member: MemberId) -> u32;
    /// Sector range occupied by array data; used to reject an overlapping
    /// bitmap placement.
    fn data_region(&self) -> (u64, u64);
    /// Sector range occupied by metadata external to the bitmap, if any.
    fn external_metadata_region(&self) -> Option<(u64, u64)>;
    /// Pause/resume the data path around a resize.
    fn quiesce(&self);
    fn resume(&self);
}

/// A block I/O transport that can read/write a fixed-size page either to a
/// member device at a metadata-relative sector offset, or (see
/// `FileBackend`) directly to a regular file's resolved blocks.
pub trait BlockTransport: Send + Sync {
    fn write_at(&self, member: MemberId, sector: u64, buf: &[u8]) -> Result<(), BitmapError>;
    fn read_at(&self, member: MemberId, sector: u64, buf: &mut [u8]) -> Result<(), BitmapError>;
}

/// Lock modes used by the engine against the cluster lock manager (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Per-node availability tracking.
    Concurrent,
    /// Interior bitmap-page ownership transitions.
    ProtectedWrite,
    /// Superblock/page writes.
    Exclusive,
}

/// Delivered to a waiter when a lock request completes (`ast`) or when the
/// lock manager wants the resource back (`bast`).
pub trait LockCallbacks: Send + Sync {
    fn granted(&self, mode: LockMode);
    fn blocking(&self, demanded: LockMode);
}

/// A handle to an outstanding or held lock request. Dropping it does not
/// release the lock; callers must explicitly `unlock`.
pub struct LockHandle(pub u64);

/// The cluster lock manager surface the engine consumes. Real
/// implementations dispatch asynchronously and deliver completion via
/// `LockCallbacks::granted`; the engine only calls this from `update_sb`
/// and device-embedded page writes, never from the data path, so a
/// synchronous `lock` that blocks until granted is an acceptable
/// implementation of the contract from the engine's point of view.
pub trait ClusterLock: Send + Sync {
    fn lock(
        &self,
        mode: LockMode,
        resource: &str,
        callbacks: Arc<dyn LockCallbacks>,
    ) -> Result<LockHandle, BitmapError>;
    fn unlock(&self, handle: LockHandle) -> Result<(), BitmapError>;
}

/// The wall clock the daemon schedules against. A trait so tests can
/// advance time deterministically instead of sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Non-sleeping, I/O-safe page allocation (§4.1, §5). Returns `None` on
/// simulated or real exhaustion; the caller hijacks the slot.
pub trait PageAllocator: Send + Sync {
    fn alloc_zeroed_page(&self) -> Option<Vec<u8>>;
}

pub mod reference {
    //! Minimal, correctness-focused reference implementations of the
    //! `host` traits, used by the CLI binary and by the integration tests.
    //! None of this is meant to be a real cluster lock manager or array
    //! metadata layer -- it exists so the engine can be driven end to end.
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::{Mutex, RwLock};
    use std::time::Instant as StdInstant;

    pub struct SingleNodeArrayMeta {
        uuid: [u8; 16],
        events: AtomicU64,
        degraded: std::sync::atomic::AtomicBool,
        members: Vec<MemberId>,
        block_sizes: HashMap<MemberId, u32>,
        data_region: (u64, u64),
        external_metadata: Option<(u64, u64)>,
    }

    impl SingleNodeArrayMeta {
        pub fn new(uuid: [u8; 16], members: Vec<MemberId>, data_region: (u64, u64)) -> Self {
            let block_sizes = members.iter().map(|m| (*m, 512u32)).collect();
            Self {
                uuid,
                events: AtomicU64::new(0),
                degraded: std::sync::atomic::AtomicBool::new(false),
                members,
                block_sizes,
                data_region,
                external_metadata: None,
            }
        }

        pub fn bump_events(&self) -> u64 {
            self.events.fetch_add(1, Ordering::SeqCst) + 1
        }

        pub fn set_degraded(&self, degraded: bool) {
            self.degraded.store(degraded, Ordering::SeqCst);
        }
    }

    impl ArrayMeta for SingleNodeArrayMeta {
        fn uuid(&self) -> [u8; 16] {
            self.uuid
        }

        fn events(&self) -> u64 {
            self.events.load(Ordering::SeqCst)
        }

        fn is_degraded(&self) -> bool {
            self.degraded.load(Ordering::SeqCst)
        }

        fn active_members(&self) -> Vec<MemberId> {
            self.members.clone()
        }

        fn logical_block_size(&self, member: MemberId) -> u32 {
            *self.block_sizes.get(&member).unwrap_or(&512)
        }

        fn data_region(&self) -> (u64, u64) {
            self.data_region
        }

        fn external_metadata_region(&self) -> Option<(u64, u64)> {
            self.external_metadata
        }

        fn quiesce(&self) {}
        fn resume(&self) {}
    }

    /// A `BlockTransport` that keeps one in-memory buffer per member,
    /// standing in for "write the page to every active member at a fixed
    /// offset".
    pub struct MemoryTransport {
        members: Mutex<HashMap<MemberId, Vec<u8>>>,
    }

    impl MemoryTransport {
        pub fn new(members: &[MemberId], capacity_sectors: u64) -> Self {
            let mut map = HashMap::new();
            for m in members {
                map.insert(*m, vec![0u8; (capacity_sectors * 512) as usize]);
            }
            Self {
                members: Mutex::new(map),
            }
        }
    }

    impl BlockTransport for MemoryTransport {
        fn write_at(&self, member: MemberId, sector: u64, buf: &[u8]) -> Result<(), BitmapError> {
            let mut members = self.members.lock().unwrap();
            let target = members
                .get_mut(&member)
                .ok_or_else(|| BitmapError::Busy {
                    reason: format!("unknown member {:?}", member),
                })?;
            let offset = (sector * 512) as usize;
            if offset + buf.len() > target.len() {
                target.resize(offset + buf.len(), 0);
            }
            target[offset..offset + buf.len()].copy_from_slice(buf);
            Ok(())
        }

        fn read_at(&self, member: MemberId, sector: u64, buf: &mut [u8]) -> Result<(), BitmapError> {
            let members = self.members.lock().unwrap();
            let source = members
                .get(&member)
                .ok_or_else(|| BitmapError::Busy {
                    reason: format!("unknown member {:?}", member),
                })?;
            let offset = (sector * 512) as usize;
            if offset + buf.len() > source.len() {
                return Err(BitmapError::Io {
                    source: std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "read past end"),
                });
            }
            buf.copy_from_slice(&source[offset..offset + buf.len()]);
            Ok(())
        }
    }

    /// An in-process stand-in for the cluster lock manager: `Exclusive`
    /// excludes everyone, `Concurrent` and `ProtectedWrite` are mutually
    /// shared among themselves. Grants are delivered synchronously and
    /// immediately, matching the "engine only calls this off the data path"
    /// contract from `host::ClusterLock`.
    pub struct LocalClusterLock {
        state: RwLock<()>,
        next_handle: AtomicU64,
    }

    impl LocalClusterLock {
        pub fn new() -> Self {
            Self {
                state: RwLock::new(()),
                next_handle: AtomicU64::new(1),
            }
        }
    }

    impl Default for LocalClusterLock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ClusterLock for LocalClusterLock {
        fn lock(
            &self,
            mode: LockMode,
            _resource: &str,
            callbacks: Arc<dyn LockCallbacks>,
        ) -> Result<LockHandle, BitmapError> {
            // A real manager would hold the guard until `unlock`; this
            // reference implementation grants immediately since it never
            // contends across processes.
            match mode {
                LockMode::Exclusive => {
                    let _guard = self.state.write().unwrap();
                }
                LockMode::Concurrent | LockMode::ProtectedWrite => {
                    let _guard = self.state.read().unwrap();
                }
            }
            callbacks.granted(mode);
            Ok(LockHandle(self.next_handle.fetch_add(1, Ordering::SeqCst)))
        }

        fn unlock(&self, _handle: LockHandle) -> Result<(), BitmapError> {
            Ok(())
        }
    }

    pub struct NoopLockCallbacks;
    impl LockCallbacks for NoopLockCallbacks {
        fn granted(&self, _mode: LockMode) {}
        fn blocking(&self, _demanded: LockMode) {}
    }

    pub struct SystemClock;
    impl Clock for SystemClock {
        fn now(&self) -> StdInstant {
            StdInstant::now()
        }
    }

    pub struct SystemAllocator;
    impl PageAllocator for SystemAllocator {
        fn alloc_zeroed_page(&self) -> Option<Vec<u8>> {
            Some(vec![0u8; crate::consts::PAGE_SIZE])
        }
    }

    /// A `PageAllocator` that fails the next `n` allocations, used to drive
    /// Scenario F (hijacked pages) deterministically from tests.
    pub struct FailingAllocator {
        remaining_failures: AtomicUsize,
    }

    impl FailingAllocator {
        pub fn new(failures: usize) -> Self {
            Self {
                remaining_failures: AtomicUsize::new(failures),
            }
        }
    }

    impl PageAllocator for FailingAllocator {
        fn alloc_zeroed_page(&self) -> Option<Vec<u8>> {
            let prev = self.remaining_failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n == 0 {
                    None
                } else {
                    Some(n - 1)
                }
            });
            match prev {
                Ok(_) => None,
                Err(_) => Some(vec![0u8; crate::consts::PAGE_SIZE]),
            }
        }
    }
}
