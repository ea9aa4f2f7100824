//! Logical display subdivision
//!
//! Splits one physical display into N side-by-side logical displays so the
//! upstream compositor can drive each zone independently. The manager is the
//! barrier between those worlds: it buffers each logical display's present
//! until every powered-on zone has submitted, then forwards one merged layer
//! list to the physical display, and it re-broadcasts the physical display's
//! vsync/refresh/hotplug events to every zone.
//!
//! All logical presents for one physical frame are expected to arrive from
//! the same caller thread; the embedding framework serializes composition
//! per display. The barrier state is still lock-guarded so event threads can
//! observe power/vsync state safely.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::display::{
    ContentProtection, DisplayAttribute, DisplayType, HotplugCallback, NativeDisplay, PowerMode,
    PresentStatus, RefreshCallback, VsyncCallback,
};
use crate::error::HwcResult;
use crate::layer::{Layer, PixelFormat};

struct Barrier {
    layers: Vec<Layer>,
    cursor_layers: Vec<Layer>,
    queued_displays: u32,
    /// Set after a hotplug: the next present completes alone instead of
    /// waiting for zones that may never speak again.
    handle_hotplug_notifications: bool,
    started_at: Option<Instant>,
}

struct ManagerShared {
    physical: Arc<dyn NativeDisplay>,
    displays: Mutex<Vec<Arc<LogicalDisplay>>>,
    barrier: Mutex<Barrier>,
    hotplug_registered: Mutex<bool>,
    /// Stale partial frames older than this are force-flushed; None keeps
    /// the historical unbounded wait.
    barrier_flush: Option<Duration>,
}

/// Fan-out/fan-in coordinator for one physical display.
pub struct LogicalDisplayManager {
    shared: Arc<ManagerShared>,
}

impl LogicalDisplayManager {
    pub fn new(physical: Arc<dyn NativeDisplay>, barrier_flush: Option<Duration>) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                physical,
                displays: Mutex::new(Vec::new()),
                barrier: Mutex::new(Barrier {
                    layers: Vec::new(),
                    cursor_layers: Vec::new(),
                    queued_displays: 0,
                    handle_hotplug_notifications: false,
                    started_at: None,
                }),
                hotplug_registered: Mutex::new(false),
                barrier_flush,
            }),
        }
    }

    /// Creates `total` logical displays over the physical one and hooks the
    /// single vsync/refresh registration that feeds the re-broadcast.
    pub fn initialize_logical_displays(&self, total: u32) {
        {
            let mut displays = self.shared.displays.lock();
            for index in 0..total {
                displays.push(Arc::new(LogicalDisplay::new(
                    Arc::downgrade(&self.shared),
                    total,
                    index,
                )));
            }
        }

        let weak = Arc::downgrade(&self.shared);
        self.shared.physical.register_vsync_callback(
            Arc::new(move |_display, timestamp| {
                if let Some(shared) = weak.upgrade() {
                    for display in shared.displays.lock().iter() {
                        display.vsync_update(timestamp);
                    }
                }
            }),
            0,
        );

        let weak = Arc::downgrade(&self.shared);
        self.shared.physical.register_refresh_callback(
            Arc::new(move |_display| {
                if let Some(shared) = weak.upgrade() {
                    for display in shared.displays.lock().iter() {
                        display.refresh_update();
                    }
                }
            }),
            0,
        );
    }

    pub fn displays(&self) -> Vec<Arc<LogicalDisplay>> {
        self.shared.displays.lock().clone()
    }

    pub fn physical_display(&self) -> Arc<dyn NativeDisplay> {
        self.shared.physical.clone()
    }

    pub fn set_hdcp_state(&self, state: ContentProtection) {
        self.shared.physical.set_hdcp_state(state);
    }

    pub fn contains_connector(&self, connector_id: u32) -> bool {
        self.shared.physical.contains_connector(connector_id)
    }
}

impl ManagerShared {
    /// The only path that registers a hotplug callback with the physical
    /// display; idempotent.
    fn register_hotplug_notification(self: &Arc<Self>) {
        let mut registered = self.hotplug_registered.lock();
        if *registered {
            return;
        }
        *registered = true;
        self.barrier.lock().handle_hotplug_notifications = true;

        let weak = Arc::downgrade(self);
        self.physical.register_hotplug_callback(
            Arc::new(move |_display, connected| {
                if let Some(shared) = weak.upgrade() {
                    shared.hotplug_event(connected);
                }
            }),
            0,
        );
    }

    fn hotplug_event(&self, connected: bool) {
        if connected {
            self.barrier.lock().handle_hotplug_notifications = true;
        }
        for display in self.displays.lock().iter() {
            display.hotplug_update(connected);
        }
    }

    /// Barrier-synchronized present; called by each logical display.
    fn present(&self, source_layers: Vec<Layer>, constrained: bool) -> HwcResult<PresentStatus> {
        let displays = self.displays.lock().clone();
        let merged = {
            let mut barrier = self.barrier.lock();

            let mut total_size = displays.len() as u32;
            if barrier.handle_hotplug_notifications {
                // Fresh reconnect: re-deliver connection state to the
                // secondary zones and complete this frame alone unless the
                // submission is part of a pre-split mosaic round.
                for display in displays.iter().skip(1) {
                    display.hotplug_update(true);
                }
                barrier.handle_hotplug_notifications = false;
                if !constrained {
                    total_size = 1;
                }
            } else {
                for display in &displays {
                    if display.power_mode() == PowerMode::Off {
                        total_size -= 1;
                    }
                }
            }

            if total_size == 0 {
                error!("logical present with every zone powered off; dropping frame");
                barrier.layers.clear();
                barrier.cursor_layers.clear();
                barrier.queued_displays = 0;
                barrier.started_at = None;
                return Ok(PresentStatus::Presented { retire_fence: None });
            }

            if barrier.queued_displays != total_size {
                if let (Some(window), Some(started)) = (self.barrier_flush, barrier.started_at) {
                    if barrier.queued_displays > 0 && started.elapsed() > window {
                        error!(
                            "force-flushing stale partial frame ({} of {} zones after {:?})",
                            barrier.queued_displays, total_size, window
                        );
                        barrier.layers.clear();
                        barrier.cursor_layers.clear();
                        barrier.queued_displays = 0;
                    }
                }

                if barrier.queued_displays == 0 {
                    barrier.started_at = Some(Instant::now());
                }
                for layer in source_layers {
                    if layer.is_cursor() {
                        barrier.cursor_layers.push(layer);
                    } else {
                        barrier.layers.push(layer);
                    }
                }
                barrier.queued_displays += 1;
                if barrier.queued_displays < total_size {
                    debug!(
                        "logical frame accumulating: {}/{} zones submitted",
                        barrier.queued_displays, total_size
                    );
                    return Ok(PresentStatus::Queued);
                }
            }

            // Nth submission: merge with cursor content topmost and reset
            // the barrier before touching hardware.
            let mut merged = std::mem::take(&mut barrier.layers);
            merged.append(&mut barrier.cursor_layers);
            barrier.queued_displays = 0;
            barrier.started_at = None;
            merged
        };

        self.physical.present(merged, constrained)
    }

    fn update_power_mode(&self) {
        let displays = self.displays.lock().clone();
        let any_on = displays
            .iter()
            .any(|display| display.power_mode() != PowerMode::Off);
        self.physical
            .set_power_mode(if any_on { PowerMode::On } else { PowerMode::Off });
    }

    fn update_vsync_control(&self) {
        let displays = self.displays.lock().clone();
        let any_enabled = displays.iter().any(|display| display.vsync_enabled());
        self.physical.vsync_control(any_enabled);
    }
}

struct LogicalState {
    power_mode: PowerMode,
    enable_vsync: bool,
    display_id: u32,
    vsync_callback: Option<VsyncCallback>,
    refresh_callback: Option<RefreshCallback>,
    hotplug_callback: Option<HotplugCallback>,
}

/// One zone of a subdivided physical display.
///
/// Forwards almost everything to the backing display; owns only its power
/// mode, vsync gate and horizontal offset.
pub struct LogicalDisplay {
    manager: Weak<ManagerShared>,
    total_divisions: u32,
    index: u32,
    state: Mutex<LogicalState>,
}

impl LogicalDisplay {
    fn new(manager: Weak<ManagerShared>, total_divisions: u32, index: u32) -> Self {
        Self {
            manager,
            total_divisions,
            index,
            state: Mutex::new(LogicalState {
                power_mode: PowerMode::Off,
                enable_vsync: false,
                display_id: 0,
                vsync_callback: None,
                refresh_callback: None,
                hotplug_callback: None,
            }),
        }
    }

    fn physical(&self) -> Option<Arc<dyn NativeDisplay>> {
        self.manager.upgrade().map(|shared| shared.physical.clone())
    }

    pub fn vsync_enabled(&self) -> bool {
        self.state.lock().enable_vsync
    }

    pub(crate) fn vsync_update(&self, timestamp: i64) {
        let state = self.state.lock();
        if !state.enable_vsync {
            return;
        }
        if let Some(callback) = state.vsync_callback.clone() {
            let display_id = state.display_id;
            drop(state);
            callback(display_id, timestamp);
        }
    }

    pub(crate) fn refresh_update(&self) {
        let state = self.state.lock();
        if state.power_mode != PowerMode::On {
            return;
        }
        if let Some(callback) = state.refresh_callback.clone() {
            let display_id = state.display_id;
            drop(state);
            callback(display_id);
        }
    }
}

impl NativeDisplay for LogicalDisplay {
    fn display_type(&self) -> DisplayType {
        DisplayType::Logical
    }

    fn width(&self) -> u32 {
        self.physical()
            .map(|physical| physical.width() / self.total_divisions)
            .unwrap_or(0)
    }

    fn height(&self) -> u32 {
        self.physical().map(|physical| physical.height()).unwrap_or(0)
    }

    fn display_name(&self) -> String {
        format!("Logical-{}", self.index)
    }

    fn display_configs(&self) -> Vec<u32> {
        self.physical()
            .map(|physical| physical.display_configs())
            .unwrap_or_default()
    }

    fn display_attribute(&self, config: u32, attribute: DisplayAttribute) -> Option<i32> {
        let physical = self.physical()?;
        let value = physical.display_attribute(config, attribute)?;
        match attribute {
            DisplayAttribute::Width => Some(value / self.total_divisions as i32),
            _ => Some(value),
        }
    }

    fn active_config(&self) -> u32 {
        self.physical()
            .map(|physical| physical.active_config())
            .unwrap_or(0)
    }

    fn set_active_config(&self, config: u32) -> bool {
        self.physical()
            .map(|physical| physical.set_active_config(config))
            .unwrap_or(false)
    }

    fn power_mode(&self) -> PowerMode {
        self.state.lock().power_mode
    }

    fn set_power_mode(&self, mode: PowerMode) -> bool {
        self.state.lock().power_mode = mode;
        if let Some(shared) = self.manager.upgrade() {
            shared.update_power_mode();
        }
        true
    }

    fn is_connected(&self) -> bool {
        self.physical()
            .map(|physical| physical.is_connected())
            .unwrap_or(false)
    }

    fn present(&self, layers: Vec<Layer>, constrained: bool) -> HwcResult<PresentStatus> {
        if self.state.lock().power_mode != PowerMode::On {
            // A powered-off zone's submission is accepted and dropped; the
            // barrier math already excludes it.
            return Ok(PresentStatus::Presented { retire_fence: None });
        }
        match self.manager.upgrade() {
            Some(shared) => shared.present(layers, constrained),
            None => {
                warn!("logical display outlived its manager; dropping frame");
                Ok(PresentStatus::Presented { retire_fence: None })
            }
        }
    }

    fn register_vsync_callback(&self, callback: VsyncCallback, display_id: u32) {
        let mut state = self.state.lock();
        state.display_id = display_id;
        state.vsync_callback = Some(callback);
    }

    fn register_refresh_callback(&self, callback: RefreshCallback, display_id: u32) {
        let mut state = self.state.lock();
        state.display_id = display_id;
        state.refresh_callback = Some(callback);
    }

    fn register_hotplug_callback(&self, callback: HotplugCallback, display_id: u32) {
        {
            let mut state = self.state.lock();
            state.display_id = display_id;
            state.hotplug_callback = Some(callback);
        }
        if let Some(shared) = self.manager.upgrade() {
            shared.register_hotplug_notification();
        }
    }

    fn vsync_control(&self, enabled: bool) {
        self.state.lock().enable_vsync = enabled;
        if let Some(shared) = self.manager.upgrade() {
            shared.update_vsync_control();
        }
    }

    fn check_plane_format(&self, format: PixelFormat) -> bool {
        self.physical()
            .map(|physical| physical.check_plane_format(format))
            .unwrap_or(false)
    }

    fn hotplug_update(&self, connected: bool) {
        let state = self.state.lock();
        if let Some(callback) = state.hotplug_callback.clone() {
            let display_id = state.display_id;
            drop(state);
            callback(display_id, connected);
        }
    }

    fn logical_index(&self) -> u32 {
        self.index
    }

    fn x_translation(&self) -> u32 {
        self.physical()
            .map(|physical| (physical.width() / self.total_divisions) * self.index)
            .unwrap_or(0)
    }

    fn contains_connector(&self, connector_id: u32) -> bool {
        self.manager
            .upgrade()
            .map(|shared| shared.physical.contains_connector(connector_id))
            .unwrap_or(false)
    }

    fn set_gamma(&self, red: f32, green: f32, blue: f32) {
        if let Some(physical) = self.physical() {
            physical.set_gamma(red, green, blue);
        }
    }

    fn set_contrast(&self, red: u32, green: u32, blue: u32) {
        if let Some(physical) = self.physical() {
            physical.set_contrast(red, green, blue);
        }
    }

    fn set_brightness(&self, red: u32, green: u32, blue: u32) {
        if let Some(physical) = self.physical() {
            physical.set_brightness(red, green, blue);
        }
    }

    fn set_explicit_sync(&self, enabled: bool) {
        if let Some(physical) = self.physical() {
            physical.set_explicit_sync(enabled);
        }
    }

    fn set_hdcp_state(&self, state: ContentProtection) {
        if let Some(shared) = self.manager.upgrade() {
            shared.physical.set_hdcp_state(state);
        }
    }

    fn set_video_color(&self, control: crate::display::VideoColorControl, value: f32) {
        if let Some(physical) = self.physical() {
            physical.set_video_color(control, value);
        }
    }
}
