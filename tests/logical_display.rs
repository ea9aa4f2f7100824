// Logical display fan-in/fan-out integration tests
//
// The scenarios here drive the barrier through a recording physical display:
// merged layer ordering, cursor-last placement, power-mode OR-reduction,
// the hotplug barrier override, and mosaic layer splitting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use planar::display::logical::LogicalDisplayManager;
use planar::display::mosaic::MosaicDisplay;
use planar::display::{
    DisplayAttribute, DisplayType, HotplugCallback, NativeDisplay, PowerMode, PresentStatus,
    RefreshCallback, VsyncCallback,
};
use planar::error::HwcResult;
use planar::layer::{BufferKey, Layer, NativeBufferDesc, PixelFormat, Rect};

/// Physical-display stand-in that records what reaches the hardware side.
#[derive(Default)]
struct RecordingDisplay {
    frames: Mutex<Vec<Vec<u64>>>,
    frame_rects: Mutex<Vec<Vec<Rect<i32>>>>,
    power_modes: Mutex<Vec<PowerMode>>,
    vsync_controls: Mutex<Vec<bool>>,
    vsync_callback: Mutex<Option<(VsyncCallback, u32)>>,
    refresh_callback: Mutex<Option<(RefreshCallback, u32)>>,
    hotplug_callback: Mutex<Option<(HotplugCallback, u32)>>,
    connected: AtomicBool,
}

impl RecordingDisplay {
    fn new() -> Arc<RecordingDisplay> {
        let display = RecordingDisplay::default();
        display.connected.store(true, Ordering::SeqCst);
        Arc::new(display)
    }

    fn presented_keys(&self) -> Vec<Vec<u64>> {
        self.frames.lock().clone()
    }

    fn fire_vsync(&self, timestamp: i64) {
        if let Some((callback, display_id)) = self.vsync_callback.lock().clone() {
            callback(display_id, timestamp);
        }
    }

    fn fire_hotplug(&self, connected: bool) {
        if let Some((callback, display_id)) = self.hotplug_callback.lock().clone() {
            callback(display_id, connected);
        }
    }
}

impl NativeDisplay for RecordingDisplay {
    fn display_type(&self) -> DisplayType {
        DisplayType::Physical
    }
    fn width(&self) -> u32 {
        1920
    }
    fn height(&self) -> u32 {
        1080
    }
    fn display_name(&self) -> String {
        "Recording".to_string()
    }
    fn display_configs(&self) -> Vec<u32> {
        vec![0]
    }
    fn display_attribute(&self, _config: u32, attribute: DisplayAttribute) -> Option<i32> {
        match attribute {
            DisplayAttribute::Width => Some(1920),
            DisplayAttribute::Height => Some(1080),
            DisplayAttribute::RefreshRate => Some(16_666_666),
            _ => Some(-1),
        }
    }
    fn active_config(&self) -> u32 {
        0
    }
    fn set_active_config(&self, _config: u32) -> bool {
        true
    }
    fn power_mode(&self) -> PowerMode {
        self.power_modes
            .lock()
            .last()
            .copied()
            .unwrap_or(PowerMode::Off)
    }
    fn set_power_mode(&self, mode: PowerMode) -> bool {
        self.power_modes.lock().push(mode);
        true
    }
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
    fn present(&self, layers: Vec<Layer>, _constrained: bool) -> HwcResult<PresentStatus> {
        self.frames
            .lock()
            .push(layers.iter().map(|layer| layer.buffer.key.0).collect());
        self.frame_rects
            .lock()
            .push(layers.iter().map(|layer| layer.display_frame).collect());
        Ok(PresentStatus::Presented { retire_fence: None })
    }
    fn register_vsync_callback(&self, callback: VsyncCallback, display_id: u32) {
        *self.vsync_callback.lock() = Some((callback, display_id));
    }
    fn register_refresh_callback(&self, callback: RefreshCallback, display_id: u32) {
        *self.refresh_callback.lock() = Some((callback, display_id));
    }
    fn register_hotplug_callback(&self, callback: HotplugCallback, display_id: u32) {
        *self.hotplug_callback.lock() = Some((callback, display_id));
    }
    fn vsync_control(&self, enabled: bool) {
        self.vsync_controls.lock().push(enabled);
    }
    fn check_plane_format(&self, _format: PixelFormat) -> bool {
        true
    }
}

fn layer(key: u64) -> Layer {
    Layer::new(
        NativeBufferDesc::linear(BufferKey(key), 64, 64, PixelFormat::XRGB8888),
        Rect::new(0, 0, 64, 64),
    )
}

fn cursor_layer(key: u64) -> Layer {
    let mut l = layer(key);
    l.cursor = true;
    l
}

fn mosaic_layer(key: u64, frame: Rect<i32>) -> Layer {
    let mut l = layer(key);
    l.display_frame = frame;
    l
}

fn split_three() -> (Arc<RecordingDisplay>, LogicalDisplayManager) {
    let physical = RecordingDisplay::new();
    let manager = LogicalDisplayManager::new(physical.clone(), None);
    manager.initialize_logical_displays(3);
    for display in manager.displays() {
        display.set_power_mode(PowerMode::On);
    }
    (physical, manager)
}

#[test]
fn test_fan_in_merges_once_per_round() {
    let (physical, manager) = split_three();
    let zones = manager.displays();

    // Zones 0..2 submit two layers each; zone 1 adds a cursor layer. The
    // physical display sees exactly one merged frame with the cursor last.
    let status = zones[0].present(vec![layer(0), layer(1)], false).unwrap();
    assert!(status.is_queued());
    let status = zones[1]
        .present(vec![layer(2), layer(3), cursor_layer(6)], false)
        .unwrap();
    assert!(status.is_queued());
    let status = zones[2].present(vec![layer(4), layer(5)], false).unwrap();
    assert!(!status.is_queued());

    assert_eq!(physical.presented_keys(), vec![vec![0, 1, 2, 3, 4, 5, 6]]);

    // The barrier reset: the next round accumulates from zero again.
    assert!(zones[0].present(vec![layer(10)], false).unwrap().is_queued());
}

#[test]
fn test_powered_off_zone_shrinks_barrier() {
    let (physical, manager) = split_three();
    let zones = manager.displays();

    zones[2].set_power_mode(PowerMode::Off);

    assert!(zones[0].present(vec![layer(0)], false).unwrap().is_queued());
    // Two powered-on zones now complete the round.
    assert!(!zones[1].present(vec![layer(1)], false).unwrap().is_queued());
    assert_eq!(physical.presented_keys(), vec![vec![0, 1]]);

    // A powered-off zone's own present is absorbed without forwarding.
    let status = zones[2].present(vec![layer(9)], false).unwrap();
    assert!(!status.is_queued());
    assert_eq!(physical.presented_keys().len(), 1);
}

#[test]
fn test_all_zones_off_drops_frames() {
    let (physical, manager) = split_three();
    let zones = manager.displays();
    for zone in &zones {
        zone.set_power_mode(PowerMode::Off);
    }
    // Physical display was driven off by the OR-reduction.
    assert_eq!(physical.power_mode(), PowerMode::Off);
    let status = zones[0].present(vec![layer(1)], false).unwrap();
    assert!(!status.is_queued());
    assert!(physical.presented_keys().is_empty());
}

#[test]
fn test_power_mode_or_reduction() {
    let (physical, manager) = split_three();
    let zones = manager.displays();
    assert_eq!(physical.power_mode(), PowerMode::On);

    zones[0].set_power_mode(PowerMode::Off);
    zones[1].set_power_mode(PowerMode::Off);
    // One zone still on keeps the panel on.
    assert_eq!(physical.power_mode(), PowerMode::On);

    zones[2].set_power_mode(PowerMode::Off);
    assert_eq!(physical.power_mode(), PowerMode::Off);

    zones[1].set_power_mode(PowerMode::On);
    assert_eq!(physical.power_mode(), PowerMode::On);
}

#[test]
fn test_vsync_enable_or_reduction_and_fan_out() {
    let (physical, manager) = split_three();
    let zones = manager.displays();

    let hits = Arc::new(Mutex::new(Vec::new()));
    for (index, zone) in zones.iter().enumerate() {
        let sink = hits.clone();
        zone.register_vsync_callback(
            Arc::new(move |display_id, timestamp| {
                sink.lock().push((display_id, timestamp));
            }),
            index as u32,
        );
    }

    // Only zone 1 enables vsync; the physical control OR-reduces to true.
    zones[1].vsync_control(true);
    assert_eq!(physical.vsync_controls.lock().last(), Some(&true));

    physical.fire_vsync(777);
    assert_eq!(hits.lock().as_slice(), &[(1, 777)]);

    zones[1].vsync_control(false);
    assert_eq!(physical.vsync_controls.lock().last(), Some(&false));
    physical.fire_vsync(888);
    assert_eq!(hits.lock().len(), 1);
}

#[test]
fn test_hotplug_forces_single_zone_round() {
    let (physical, manager) = split_three();
    let zones = manager.displays();

    let plugs = Arc::new(Mutex::new(0usize));
    let sink = plugs.clone();
    zones[0].register_hotplug_callback(
        Arc::new(move |_display, _connected| {
            *sink.lock() += 1;
        }),
        0,
    );

    // Reconnect: the manager must not wait for zones that may stay silent.
    physical.fire_hotplug(true);
    let status = zones[0].present(vec![layer(1)], false).unwrap();
    assert!(!status.is_queued());
    assert_eq!(physical.presented_keys(), vec![vec![1]]);

    // The override is consumed; the next round needs all three again.
    assert!(zones[0].present(vec![layer(2)], false).unwrap().is_queued());
    assert!(zones[1].present(vec![layer(3)], false).unwrap().is_queued());
    assert!(!zones[2].present(vec![layer(4)], false).unwrap().is_queued());
    assert!(*plugs.lock() >= 1);
}

#[test]
fn test_stale_partial_frame_is_force_flushed() {
    let physical = RecordingDisplay::new();
    let manager = LogicalDisplayManager::new(physical.clone(), Some(Duration::from_millis(10)));
    manager.initialize_logical_displays(2);
    let zones = manager.displays();
    for zone in &zones {
        zone.set_power_mode(PowerMode::On);
    }

    assert!(zones[0].present(vec![layer(1)], false).unwrap().is_queued());
    std::thread::sleep(Duration::from_millis(30));

    // Zone 0's stale half-frame is dropped; this submission starts a new
    // round instead of completing the old one.
    assert!(zones[1].present(vec![layer(2)], false).unwrap().is_queued());
    assert!(!zones[0].present(vec![layer(3)], false).unwrap().is_queued());
    assert_eq!(physical.presented_keys(), vec![vec![2, 3]]);
}

#[test]
fn test_logical_geometry_and_attributes() {
    let (_physical, manager) = split_three();
    let zones = manager.displays();

    for (index, zone) in zones.iter().enumerate() {
        assert_eq!(zone.width(), 1920 / 3);
        assert_eq!(zone.height(), 1080);
        assert_eq!(zone.logical_index(), index as u32);
        assert_eq!(zone.x_translation(), (1920 / 3) * index as u32);
        assert_eq!(
            zone.display_attribute(0, DisplayAttribute::Width),
            Some(1920 / 3)
        );
        // Non-width attributes pass through untouched.
        assert_eq!(
            zone.display_attribute(0, DisplayAttribute::Height),
            Some(1080)
        );
    }
}

#[test]
fn test_mosaic_splits_layers_by_span() {
    let left = RecordingDisplay::new();
    let right = RecordingDisplay::new();
    let mosaic = MosaicDisplay::new(vec![left.clone(), right.clone()]);
    mosaic.set_power_mode(PowerMode::On);

    assert_eq!(mosaic.width(), 3840);
    assert_eq!(mosaic.height(), 1080);

    let status = mosaic
        .present(
            vec![
                // Left panel only.
                mosaic_layer(1, Rect::new(0, 0, 800, 600)),
                // Spans the seam: duplicated into both panels.
                mosaic_layer(2, Rect::new(1800, 0, 2100, 300)),
                // Right panel only.
                mosaic_layer(3, Rect::new(3000, 500, 3100, 600)),
            ],
            false,
        )
        .unwrap();
    assert!(!status.is_queued());

    assert_eq!(left.presented_keys(), vec![vec![1, 2]]);
    assert_eq!(right.presented_keys(), vec![vec![2, 3]]);

    // Right panel frames are translated into panel-local coordinates.
    let right_rects = right.frame_rects.lock().clone();
    assert_eq!(right_rects[0][0], Rect::new(1800 - 1920, 0, 2100 - 1920, 300));
    assert_eq!(right_rects[0][1], Rect::new(3000 - 1920, 500, 3100 - 1920, 600));
}

#[test]
fn test_mosaic_skips_powered_off_and_disconnected() {
    let left = RecordingDisplay::new();
    let right = RecordingDisplay::new();
    right.connected.store(false, Ordering::SeqCst);

    let mosaic = MosaicDisplay::new(vec![left.clone(), right.clone()]);
    mosaic.set_power_mode(PowerMode::On);
    mosaic.refresh_connected();

    mosaic
        .present(vec![mosaic_layer(1, Rect::new(0, 0, 3840, 1080))], false)
        .unwrap();

    assert_eq!(left.presented_keys().len(), 1);
    assert!(right.presented_keys().is_empty());
}
