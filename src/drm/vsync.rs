//! Vblank event delivery
//!
//! One worker thread per physical display, parked in the kernel's vblank
//! wait between events. Dispatch is gated by the enable flag so clients can
//! stop callbacks without tearing the thread down; power-off suspends the
//! worker entirely.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, warn};
use parking_lot::Mutex;

use crate::display::VsyncCallback;
use crate::drm::device::KmsDevice;
use crate::worker::Worker;

struct VsyncShared {
    enabled: AtomicBool,
    callback: Mutex<Option<(VsyncCallback, u32)>>,
}

pub struct VsyncWorker {
    kms: Arc<dyn KmsDevice>,
    pipe: u32,
    shared: Arc<VsyncShared>,
    worker: Mutex<Option<Worker>>,
}

impl VsyncWorker {
    pub fn new(kms: Arc<dyn KmsDevice>, pipe: u32) -> Self {
        Self {
            kms,
            pipe,
            shared: Arc::new(VsyncShared {
                enabled: AtomicBool::new(false),
                callback: Mutex::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn register_callback(&self, callback: VsyncCallback, display_id: u32) {
        *self.shared.callback.lock() = Some((callback, display_id));
    }

    /// Gates event delivery without touching the thread.
    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    /// Ensures the wait thread exists and is running.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if let Some(existing) = worker.as_ref() {
            existing.resume();
            return;
        }

        let kms = self.kms.clone();
        let pipe = self.pipe;
        let shared = self.shared.clone();
        let spawned = Worker::spawn(&format!("vblank-{}", pipe), move || {
            match kms.wait_vblank(pipe) {
                Ok(timestamp) => {
                    if !shared.enabled.load(Ordering::SeqCst) {
                        return;
                    }
                    let callback = shared.callback.lock().clone();
                    if let Some((callback, display_id)) = callback {
                        callback(display_id, timestamp);
                    }
                }
                Err(err) => {
                    // Vblank waits have no software timeout; an error here
                    // means the driver is unhappy. Back off instead of
                    // spinning the CPU.
                    error!("vblank wait failed on pipe {}: {}", pipe, err);
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        });

        match spawned {
            Ok(handle) => *worker = Some(handle),
            Err(err) => warn!("could not start vblank worker: {}", err),
        }
    }

    /// Parks the thread after the current wait returns.
    pub fn suspend(&self) {
        if let Some(worker) = self.worker.lock().as_ref() {
            worker.suspend();
        }
    }

    pub fn stop(&self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.exit();
        }
    }
}

impl Drop for VsyncWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drm::device::{
        AtomicRequest, CommitFlags, FramebufferRequest, KmsConnector, KmsCrtc, KmsError,
        KmsPlane, ObjectId, ObjectKind, PropertyId,
    };
    use crate::sync::Fence;
    use std::sync::atomic::AtomicU64;

    struct TickingKms {
        ticks: AtomicU64,
    }

    impl KmsDevice for TickingKms {
        fn crtcs(&self) -> Vec<KmsCrtc> {
            Vec::new()
        }
        fn connectors(&self) -> Vec<KmsConnector> {
            Vec::new()
        }
        fn planes(&self) -> Vec<KmsPlane> {
            Vec::new()
        }
        fn find_property(
            &self,
            _kind: ObjectKind,
            _object: ObjectId,
            _name: &str,
        ) -> Option<(PropertyId, u64)> {
            None
        }
        fn create_property_blob(&self, _data: &[u8]) -> u32 {
            0
        }
        fn create_mode_blob(&self, _mode: &crate::display::DisplayMode) -> u32 {
            0
        }
        fn destroy_property_blob(&self, _blob: u32) {}
        fn set_object_property(
            &self,
            _kind: ObjectKind,
            _object: ObjectId,
            _property: PropertyId,
            _value: u64,
        ) -> Result<(), KmsError> {
            Ok(())
        }
        fn atomic_commit(
            &self,
            _request: &AtomicRequest,
            _flags: CommitFlags,
        ) -> Result<Option<Fence>, KmsError> {
            Ok(None)
        }
        fn wait_vblank(&self, _pipe: u32) -> Result<i64, KmsError> {
            std::thread::sleep(Duration::from_millis(1));
            Ok(self.ticks.fetch_add(1, Ordering::SeqCst) as i64)
        }
        fn create_framebuffer(&self, _request: &FramebufferRequest) -> Result<u32, KmsError> {
            Ok(0)
        }
        fn release_framebuffer(&self, _fb_id: u32) {}
    }

    #[test]
    fn test_dispatch_gated_by_enable() {
        let kms = Arc::new(TickingKms {
            ticks: AtomicU64::new(1),
        });
        let vsync = VsyncWorker::new(kms, 0);
        let seen = Arc::new(AtomicU64::new(0));
        let s = seen.clone();
        vsync.register_callback(
            Arc::new(move |_display, timestamp| {
                assert!(timestamp > 0);
                s.fetch_add(1, Ordering::SeqCst);
            }),
            0,
        );

        vsync.start();
        // Disabled: the thread waits but must not dispatch.
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        vsync.set_enabled(true);
        while seen.load(Ordering::SeqCst) < 3 {
            std::thread::yield_now();
        }

        vsync.set_enabled(false);
        std::thread::sleep(Duration::from_millis(10));
        let frozen = seen.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(seen.load(Ordering::SeqCst), frozen);
        vsync.stop();
    }
}
