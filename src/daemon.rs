//! Daemon (§4.5): a dedicated thread that calls `Bitmap::daemon_tick` on a
//! schedule, backing off to an effectively unbounded sleep while the image
//! is clean and waking promptly when asked to.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::bitmap::Bitmap;
use crate::deps::log::debug;
use crate::wait::WaitQueue;

/// `mddev->thread->timeout`'s stand-in: an effectively unbounded sleep used
/// once the bitmap has gone `allclean`, so the thread still wakes if
/// `kick` is called.
const IDLE_TIMEOUT: Duration = Duration::from_secs(3600);

pub struct Daemon {
    shutdown: Arc<AtomicBool>,
    kick: Arc<WaitQueue>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Daemon {
    /// Spawns the daemon thread against `bitmap`. `bitmap` must outlive the
    /// daemon; callers typically hold both behind the same `Arc`.
    pub fn spawn(bitmap: Arc<Bitmap>) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let kick = Arc::new(WaitQueue::new());

        let thread_shutdown = shutdown.clone();
        let thread_kick = kick.clone();
        let handle = std::thread::Builder::new()
            .name("wibitmap-daemon".into())
            .spawn(move || {
                Self::run(bitmap, thread_shutdown, thread_kick);
            })
            .expect("failed to spawn bitmap daemon thread");

        Self {
            shutdown,
            kick,
            handle: Mutex::new(Some(handle)),
        }
    }

    fn run(bitmap: Arc<Bitmap>, shutdown: Arc<AtomicBool>, kick: Arc<WaitQueue>) {
        while !shutdown.load(Ordering::SeqCst) {
            bitmap.daemon_tick();
            let sleep = if bitmap.is_allclean() {
                IDLE_TIMEOUT
            } else {
                bitmap.daemon_sleep()
            };
            debug!("daemon sleeping for {:?} (allclean={})", sleep, bitmap.is_allclean());
            kick.wait_while_timeout(sleep, || !shutdown.load(Ordering::SeqCst));
        }
    }

    /// Wakes the daemon immediately instead of waiting out its current
    /// sleep; used after an operation that needs prompt daemon attention
    /// (e.g. a resize finishing, or a forced `unplug`).
    pub fn wake(&self) {
        self.kick.wake_all();
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.kick.wake_all();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::BitmapConfig;
    use crate::host::reference::{MemoryTransport, SingleNodeArrayMeta, SystemAllocator, SystemClock};
    use crate::host::reference::LocalClusterLock;
    use crate::host::MemberId;
    use crate::storage::Backend;

    fn make_bitmap() -> Arc<Bitmap> {
        let members = vec![MemberId(0)];
        let array = Arc::new(SingleNodeArrayMeta::new([1u8; 16], members.clone(), (0, 1_000_000)));
        let transport = Arc::new(MemoryTransport::new(&members, 4096));
        let config = BitmapConfig {
            chunksize: 4096,
            daemon_sleep: Duration::from_millis(20),
            max_write_behind: 0,
            external: false,
            nodes: 1,
            sectors_reserved: 0,
        };
        Arc::new(
            Bitmap::create(
                Backend::DeviceEmbedded {
                    transport,
                    offset_sectors: 8,
                },
                65536,
                config,
                array,
                Arc::new(SystemClock),
                Arc::new(LocalClusterLock::new()),
                Arc::new(SystemAllocator),
            )
            .unwrap(),
        )
    }

    #[test]
    fn daemon_spawns_and_shuts_down_cleanly() {
        let bitmap = make_bitmap();
        let daemon = Daemon::spawn(bitmap);
        std::thread::sleep(Duration::from_millis(50));
        daemon.wake();
        daemon.shutdown();
    }
}
