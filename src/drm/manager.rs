//! Display enumeration and hotplug tracking
//!
//! Owns one `DrmDisplay` per CRTC, keeps the set consistent as connectors
//! come and go, and runs the hotplug-monitor worker. Hotplug processing and
//! present-triggered queries interleave from different threads, so every
//! read-modify-write of the display list happens under the manager lock.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::display::vdisplay::{Compositor, VirtualDisplay};
use crate::display::NativeDisplay;
use crate::drm::device::KmsDevice;
use crate::drm::display::DrmDisplay;
use crate::error::{HwcError, HwcResult};
use crate::resources::BufferImporter;
use crate::worker::Worker;

/// Source of display-related uevents.
///
/// `wait_event` blocks until something display-related happens; `Ok(true)`
/// means a hotplug that warrants a connector rescan. The udev-backed
/// implementation lives behind the `hw-drm` feature.
pub trait HotplugSource: Send {
    fn wait_event(&mut self) -> std::io::Result<bool>;
}

/// Invoked with the currently connected display list after each rescan.
pub type HotplugEventCallback = Arc<dyn Fn(&[Arc<DrmDisplay>]) + Send + Sync>;

struct ManagerInner {
    kms: Arc<dyn KmsDevice>,
    displays: Mutex<Vec<Arc<DrmDisplay>>>,
    virtual_displays: Mutex<Vec<Option<Arc<VirtualDisplay>>>>,
    callback: Mutex<Option<HotplugEventCallback>>,
    ignore_updates: Mutex<bool>,
}

pub struct DrmDisplayManager {
    inner: Arc<ManagerInner>,
    monitor: Mutex<Option<Worker>>,
}

impl DrmDisplayManager {
    pub fn new(kms: Arc<dyn KmsDevice>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                kms,
                displays: Mutex::new(Vec::new()),
                virtual_displays: Mutex::new(Vec::new()),
                callback: Mutex::new(None),
                ignore_updates: Mutex::new(false),
            }),
            monitor: Mutex::new(None),
        }
    }

    /// Creates one display per CRTC. Called once; identities are stable
    /// from here on.
    pub fn initialize(&self) -> HwcResult<()> {
        let crtcs = self.inner.kms.crtcs();
        if crtcs.is_empty() {
            error!("kernel device exposes no CRTCs");
            return Err(HwcError::NotInitialized);
        }

        let mut displays = self.inner.displays.lock();
        for crtc in crtcs {
            displays.push(Arc::new(DrmDisplay::new(
                self.inner.kms.clone(),
                crtc.pipe,
                crtc.id,
            )));
        }
        info!("display manager initialized with {} pipes", displays.len());
        Ok(())
    }

    /// Wires the buffer importer into every display's pipeline.
    pub fn initialize_display_resources(&self, importer: Arc<dyn BufferImporter>) {
        let displays = self.inner.displays.lock().clone();
        for display in displays {
            if let Err(err) = display.initialize(importer.clone()) {
                error!(
                    "failed to initialize display on crtc {}: {}",
                    display.crtc_id(),
                    err
                );
            }
        }
    }

    /// Performs the initial connector scan and starts the monitor worker.
    pub fn start_hotplug_monitor(&self, mut source: Box<dyn HotplugSource>) {
        self.update_display_state();

        let inner = self.inner.clone();
        let spawned = Worker::spawn("hotplug-monitor", move || match source.wait_event() {
            Ok(true) => {
                debug!("hotplug uevent received; rescanning connectors");
                ManagerInner::update_display_state(&inner);
            }
            Ok(false) => {}
            Err(err) => {
                error!("hotplug monitor wait failed: {}", err);
                std::thread::sleep(Duration::from_millis(100));
            }
        });
        match spawned {
            Ok(worker) => *self.monitor.lock() = Some(worker),
            Err(err) => error!("failed to start hotplug monitor thread: {}", err),
        }
    }

    pub fn stop_hotplug_monitor(&self) {
        if let Some(worker) = self.monitor.lock().take() {
            worker.exit();
        }
    }

    /// Re-derives which display is bound to which connector.
    pub fn update_display_state(&self) {
        ManagerInner::update_display_state(&self.inner);
    }

    pub fn get_all_displays(&self) -> Vec<Arc<DrmDisplay>> {
        self.inner.displays.lock().clone()
    }

    pub fn connected_display_count(&self) -> usize {
        self.inner
            .displays
            .lock()
            .iter()
            .filter(|display| display.is_connected())
            .count()
    }

    pub fn create_virtual_display(
        &self,
        width: u32,
        height: u32,
        compositor: Arc<dyn Compositor>,
    ) -> Arc<VirtualDisplay> {
        let display = Arc::new(VirtualDisplay::new(width, height, compositor));
        self.inner.virtual_displays.lock().push(Some(display.clone()));
        display
    }

    pub fn destroy_virtual_display(&self, index: usize) {
        let mut virtual_displays = self.inner.virtual_displays.lock();
        if let Some(slot) = virtual_displays.get_mut(index) {
            *slot = None;
        }
    }

    pub fn register_hotplug_event_callback(&self, callback: HotplugEventCallback) {
        *self.inner.callback.lock() = Some(callback);
    }

    /// Masks rescans during suspend; `resume_updates` forces a refresh.
    pub fn ignore_updates(&self) {
        *self.inner.ignore_updates.lock() = true;
    }

    pub fn resume_updates(&self) {
        *self.inner.ignore_updates.lock() = false;
        let displays = self.inner.displays.lock().clone();
        for display in displays {
            display.force_refresh();
        }
    }
}

impl Drop for DrmDisplayManager {
    fn drop(&mut self) {
        self.stop_hotplug_monitor();
    }
}

impl ManagerInner {
    fn update_display_state(inner: &Arc<ManagerInner>) {
        let displays = inner.displays.lock().clone();

        // Start by assuming nothing is connected; connectors claim displays
        // back below.
        for display in &displays {
            display.mark_for_disconnect();
        }

        let connectors = inner.kms.connectors();
        let mut deferred = Vec::new();
        for connector in &connectors {
            if !connector.connected || connector.modes.is_empty() {
                continue;
            }

            match connector.encoder_crtc {
                Some(crtc) => {
                    for display in &displays {
                        if !display.is_connected() && display.crtc_id() == crtc {
                            debug!(
                                "connector {} claims crtc {} (active encoder)",
                                connector.id, crtc
                            );
                            display.connect_display(connector, connector.preferred_mode as u32);
                            break;
                        }
                    }
                }
                // Encoderless connectors match against possible-CRTC masks
                // once every wired connector has claimed its display.
                None => deferred.push(connector),
            }
        }

        for connector in deferred {
            for display in &displays {
                if !display.is_connected()
                    && connector.possible_crtcs & (1 << display.pipe()) != 0
                {
                    debug!(
                        "connector {} claims pipe {} (possible-crtc match)",
                        connector.id,
                        display.pipe()
                    );
                    display.connect_display(connector, connector.preferred_mode as u32);
                    break;
                }
            }
        }

        let mut connected = Vec::new();
        for display in &displays {
            if display.is_connected() {
                connected.push(display.clone());
            } else {
                display.disconnect();
            }
        }

        if let Some(callback) = inner.callback.lock().clone() {
            callback(&connected);
        }

        if connected.is_empty() {
            warn!("no connected displays after rescan");
        }

        let ignore = *inner.ignore_updates.lock();
        for display in &displays {
            display.notify_client_of_connection_state();
            if !ignore && display.is_connected() {
                display.force_refresh();
            }
        }
    }
}
