//! Virtual (off-screen) display
//!
//! A composition target without a CRTC behind it: the consumer supplies an
//! output buffer per frame through `set_output_buffer` and presents composite
//! into that buffer via the shared [`Compositor`] collaborator. Hotplug is
//! synthesized as always-connected once a geometry is configured.

use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::display::{
    DisplayAttribute, DisplayType, HotplugCallback, NativeDisplay, PowerMode, PresentStatus,
    RefreshCallback, VsyncCallback,
};
use crate::error::{HwcError, HwcResult};
use crate::layer::{Layer, NativeBufferDesc, PixelFormat};
use crate::sync::Fence;

/// Off-screen blending collaborator.
///
/// The real implementation drives the GPU; the contract here is only that
/// the returned fence signals when `target` holds the composited frame.
pub trait Compositor: Send + Sync {
    fn compose(&self, layers: &[Layer], target: &NativeBufferDesc) -> HwcResult<Option<Fence>>;
}

/// Compositor that discards the frame; keeps buffer-only pipelines running.
pub struct NullCompositor;

impl Compositor for NullCompositor {
    fn compose(&self, layers: &[Layer], target: &NativeBufferDesc) -> HwcResult<Option<Fence>> {
        debug!(
            "null compositor dropped {} layers aimed at {:?}",
            layers.len(),
            target.key
        );
        Ok(None)
    }
}

struct State {
    width: u32,
    height: u32,
    output: Option<(NativeBufferDesc, Option<Fence>)>,
    power_mode: PowerMode,
    enable_vsync: bool,
    vsync_callback: Option<(VsyncCallback, u32)>,
    refresh_callback: Option<(RefreshCallback, u32)>,
    hotplug_callback: Option<(HotplugCallback, u32)>,
    frames: u64,
}

pub struct VirtualDisplay {
    compositor: Arc<dyn Compositor>,
    state: Mutex<State>,
}

impl VirtualDisplay {
    pub fn new(width: u32, height: u32, compositor: Arc<dyn Compositor>) -> Self {
        Self {
            compositor,
            state: Mutex::new(State {
                width,
                height,
                output: None,
                power_mode: PowerMode::On,
                enable_vsync: false,
                vsync_callback: None,
                refresh_callback: None,
                hotplug_callback: None,
                frames: 0,
            }),
        }
    }

    pub fn resize(&self, width: u32, height: u32) {
        let hotplug = {
            let mut state = self.state.lock();
            state.width = width;
            state.height = height;
            state.hotplug_callback.clone()
        };
        // A geometry change surfaces to clients as a replug.
        if let Some((callback, display_id)) = hotplug {
            callback(display_id, true);
        }
    }

    pub fn frames_presented(&self) -> u64 {
        self.state.lock().frames
    }

    /// Delivers a synthesized vsync tick; embedders pump this from their
    /// own frame clock since no hardware vblank exists here.
    pub fn vsync_tick(&self, timestamp_ns: i64) {
        let state = self.state.lock();
        if !state.enable_vsync {
            return;
        }
        if let Some((callback, display_id)) = state.vsync_callback.clone() {
            drop(state);
            callback(display_id, timestamp_ns);
        }
    }

    /// Asks the client to recomposite, e.g. after a resize.
    pub fn refresh(&self) {
        let state = self.state.lock();
        if state.power_mode != PowerMode::On {
            return;
        }
        if let Some((callback, display_id)) = state.refresh_callback.clone() {
            drop(state);
            callback(display_id);
        }
    }
}

impl NativeDisplay for VirtualDisplay {
    fn display_type(&self) -> DisplayType {
        DisplayType::Virtual
    }

    fn width(&self) -> u32 {
        self.state.lock().width
    }

    fn height(&self) -> u32 {
        self.state.lock().height
    }

    fn display_name(&self) -> String {
        "Virtual".to_string()
    }

    fn display_configs(&self) -> Vec<u32> {
        vec![0]
    }

    fn display_attribute(&self, _config: u32, attribute: DisplayAttribute) -> Option<i32> {
        let state = self.state.lock();
        match attribute {
            DisplayAttribute::Width => Some(state.width as i32),
            DisplayAttribute::Height => Some(state.height as i32),
            DisplayAttribute::RefreshRate => Some(16_666_666),
            DisplayAttribute::DpiX | DisplayAttribute::DpiY => Some(-1),
        }
    }

    fn active_config(&self) -> u32 {
        0
    }

    fn set_active_config(&self, _config: u32) -> bool {
        false
    }

    fn power_mode(&self) -> PowerMode {
        self.state.lock().power_mode
    }

    fn set_power_mode(&self, mode: PowerMode) -> bool {
        self.state.lock().power_mode = mode;
        true
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn present(&self, mut layers: Vec<Layer>, _constrained: bool) -> HwcResult<PresentStatus> {
        let (target, consumer_fence) = {
            let mut state = self.state.lock();
            match state.output.take() {
                Some(output) => output,
                None => {
                    warn!("virtual display present without an output buffer");
                    return Err(HwcError::NoOutputBuffer);
                }
            }
        };

        // The consumer's fence gates writes into the target buffer.
        if let Some(fence) = consumer_fence {
            fence.wait(-1)?;
        }

        let retire_fence = self.compositor.compose(&layers, &target)?;
        // Acquire fences were consumed by the compositor contract; drop the
        // layer list (and with it the fds) before reporting completion.
        layers.clear();

        let mut state = self.state.lock();
        state.frames += 1;
        Ok(PresentStatus::Presented { retire_fence })
    }

    fn register_vsync_callback(&self, callback: VsyncCallback, display_id: u32) {
        self.state.lock().vsync_callback = Some((callback, display_id));
    }

    fn register_refresh_callback(&self, callback: RefreshCallback, display_id: u32) {
        self.state.lock().refresh_callback = Some((callback, display_id));
    }

    fn register_hotplug_callback(&self, callback: HotplugCallback, display_id: u32) {
        // Synthesized connection: the target is "plugged" as soon as anyone
        // listens.
        callback(display_id, true);
        self.state.lock().hotplug_callback = Some((callback, display_id));
    }

    fn vsync_control(&self, enabled: bool) {
        self.state.lock().enable_vsync = enabled;
    }

    fn check_plane_format(&self, _format: PixelFormat) -> bool {
        true
    }

    fn set_output_buffer(
        &self,
        buffer: NativeBufferDesc,
        acquire_fence: Option<Fence>,
    ) -> HwcResult<()> {
        self.state.lock().output = Some((buffer, acquire_fence));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{BufferKey, Rect};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCompositor(AtomicUsize);

    impl Compositor for CountingCompositor {
        fn compose(
            &self,
            layers: &[Layer],
            _target: &NativeBufferDesc,
        ) -> HwcResult<Option<Fence>> {
            self.0.fetch_add(layers.len(), Ordering::SeqCst);
            Ok(None)
        }
    }

    fn layer(key: u64) -> Layer {
        Layer::new(
            NativeBufferDesc::linear(BufferKey(key), 32, 32, PixelFormat::XRGB8888),
            Rect::new(0, 0, 32, 32),
        )
    }

    #[test]
    fn test_present_requires_output_buffer() {
        let display = VirtualDisplay::new(640, 480, Arc::new(NullCompositor));
        assert!(matches!(
            display.present(vec![layer(1)], false),
            Err(HwcError::NoOutputBuffer)
        ));
    }

    #[test]
    fn test_present_composites_into_output() {
        let counter = Arc::new(CountingCompositor(AtomicUsize::new(0)));
        let display = VirtualDisplay::new(640, 480, counter.clone());
        let output = NativeBufferDesc::linear(BufferKey(99), 640, 480, PixelFormat::XRGB8888);
        display.set_output_buffer(output.clone(), None).unwrap();

        let status = display
            .present(vec![layer(1), layer(2)], false)
            .unwrap();
        assert!(!status.is_queued());
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
        assert_eq!(display.frames_presented(), 1);

        // Output buffer is consumed per frame.
        assert!(display.present(vec![layer(3)], false).is_err());
    }

    #[test]
    fn test_hotplug_synthesized_on_registration() {
        let display = VirtualDisplay::new(640, 480, Arc::new(NullCompositor));
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        display.register_hotplug_callback(
            Arc::new(move |id, connected| {
                assert_eq!(id, 7);
                assert!(connected);
                h.fetch_add(1, Ordering::SeqCst);
            }),
            7,
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(display.is_connected());
    }
}
