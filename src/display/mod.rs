//! Display endpoint abstraction
//!
//! Everything that can be presented to (real connectors, logical
//! subdivisions, mosaic groups, off-screen targets, the headless stub)
//! implements [`NativeDisplay`]. Upstream code addresses displays purely
//! through this trait plus opaque config handles, so topology changes never
//! leak into the HAL-facing surface.
//!
//! Display identity is stable: a physical display object lives for the whole
//! service lifetime and is connected/disconnected as monitors come and go.

pub mod headless;
pub mod logical;
pub mod mosaic;
pub mod vdisplay;

use std::sync::Arc;

use crate::error::HwcResult;
use crate::layer::{Layer, NativeBufferDesc, PixelFormat};
use crate::sync::Fence;

/// Power state requested by the embedding framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerMode {
    #[default]
    Off,
    Doze,
    On,
    DozeSuspend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayType {
    Physical,
    Logical,
    Mosaic,
    Virtual,
    Headless,
}

/// Attribute queries go through opaque config handles, never raw modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayAttribute {
    Width,
    Height,
    /// Frame period in nanoseconds.
    RefreshRate,
    /// Dots per 1000 inches.
    DpiX,
    DpiY,
}

/// One display timing, kept internal to the config-handle mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayMode {
    pub hdisplay: u32,
    pub vdisplay: u32,
    pub clock_khz: u32,
    pub htotal: u32,
    pub vtotal: u32,
    pub preferred: bool,
    pub interlace: bool,
}

impl DisplayMode {
    pub fn new(hdisplay: u32, vdisplay: u32, refresh_hz: u32) -> Self {
        // Synthesize plausible totals so the period math stays uniform.
        let htotal = hdisplay + hdisplay / 10;
        let vtotal = vdisplay + vdisplay / 20;
        Self {
            hdisplay,
            vdisplay,
            clock_khz: htotal * vtotal * refresh_hz / 1000,
            htotal,
            vtotal,
            preferred: false,
            interlace: false,
        }
    }

    /// Vertical refresh in Hz derived from the pixel clock.
    pub fn refresh_hz(&self) -> f32 {
        if self.htotal == 0 || self.vtotal == 0 {
            return 0.0;
        }
        let mut refresh = (self.clock_khz as f32 * 1000.0) / (self.htotal * self.vtotal) as f32;
        if self.interlace {
            refresh *= 2.0;
        }
        refresh
    }

    /// Frame period in nanoseconds, the unit attribute queries report.
    pub fn refresh_period_ns(&self) -> i32 {
        let hz = self.refresh_hz();
        if hz <= 0.0 {
            return -1;
        }
        (1e9 / hz) as i32
    }
}

/// HDCP request state for protected content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentProtection {
    #[default]
    Unsupported,
    Undesired,
    Desired,
}

/// Video-plane color adjustment knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoColorControl {
    Brightness,
    Contrast,
    Saturation,
    Hue,
}

/// Delivered from the vsync thread: (display id, timestamp ns).
pub type VsyncCallback = Arc<dyn Fn(u32, i64) + Send + Sync>;
/// Asks the client to recomposite the named display.
pub type RefreshCallback = Arc<dyn Fn(u32) + Send + Sync>;
/// Delivered from the hotplug thread: (display id, connected).
pub type HotplugCallback = Arc<dyn Fn(u32, bool) + Send + Sync>;

/// Outcome of a present call.
#[derive(Debug)]
pub enum PresentStatus {
    /// Layers were accepted and buffered; the frame is not on hardware yet.
    /// Only logical displays answer this while their barrier accumulates.
    Queued,
    /// The frame was committed (or absorbed by a stub display).
    Presented { retire_fence: Option<Fence> },
}

impl PresentStatus {
    pub fn is_queued(&self) -> bool {
        matches!(self, PresentStatus::Queued)
    }

    pub fn into_retire_fence(self) -> Option<Fence> {
        match self {
            PresentStatus::Queued => None,
            PresentStatus::Presented { retire_fence } => retire_fence,
        }
    }
}

/// Capability set shared by every display endpoint.
///
/// Methods take `&self`; implementations guard their state internally since
/// callbacks arrive from the vsync and hotplug threads while the present
/// thread is active.
pub trait NativeDisplay: Send + Sync {
    fn display_type(&self) -> DisplayType;

    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn display_name(&self) -> String;

    /// Opaque config handles; index them back through `display_attribute`.
    fn display_configs(&self) -> Vec<u32>;
    fn display_attribute(&self, config: u32, attribute: DisplayAttribute) -> Option<i32>;
    fn active_config(&self) -> u32;
    fn set_active_config(&self, config: u32) -> bool;

    fn power_mode(&self) -> PowerMode;
    fn set_power_mode(&self, mode: PowerMode) -> bool;

    fn is_connected(&self) -> bool;

    /// Submits a frame. Ownership of the layers transfers to the display;
    /// nothing submitted survives the call.
    ///
    /// `constrained` marks submissions pre-split by a mosaic wrapper.
    fn present(&self, layers: Vec<Layer>, constrained: bool) -> HwcResult<PresentStatus>;

    fn register_vsync_callback(&self, callback: VsyncCallback, display_id: u32);
    fn register_refresh_callback(&self, callback: RefreshCallback, display_id: u32);
    fn register_hotplug_callback(&self, callback: HotplugCallback, display_id: u32);
    fn vsync_control(&self, enabled: bool);

    fn check_plane_format(&self, format: PixelFormat) -> bool;

    /// Re-delivers connection state to the registered hotplug callback.
    fn hotplug_update(&self, _connected: bool) {}

    /// Index of a logical subdivision within its physical display.
    fn logical_index(&self) -> u32 {
        0
    }

    /// X offset of this endpoint inside its physical scanout region.
    fn x_translation(&self) -> u32 {
        0
    }

    fn contains_connector(&self, _connector_id: u32) -> bool {
        false
    }

    fn set_display_order(&self, _order: u32) {}

    // Optional capabilities; endpoints without the hardware ignore them.

    fn set_gamma(&self, _red: f32, _green: f32, _blue: f32) {}
    fn set_contrast(&self, _red: u32, _green: u32, _blue: u32) {}
    fn set_brightness(&self, _red: u32, _green: u32, _blue: u32) {}
    fn set_explicit_sync(&self, _enabled: bool) {}
    fn set_hdcp_state(&self, _state: ContentProtection) {}
    fn set_video_color(&self, _control: VideoColorControl, _value: f32) {}

    /// Assigns the target buffer for off-screen endpoints.
    fn set_output_buffer(
        &self,
        _buffer: NativeBufferDesc,
        _acquire_fence: Option<Fence>,
    ) -> HwcResult<()> {
        Err(crate::error::HwcError::NoOutputBuffer)
    }

    /// Marks this display as a clone of `source` (None reverts to extended).
    fn clone_display(&self, _source: Option<Arc<dyn NativeDisplay>>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_refresh_math() {
        let mode = DisplayMode {
            hdisplay: 1920,
            vdisplay: 1080,
            clock_khz: 148_500,
            htotal: 2200,
            vtotal: 1125,
            preferred: true,
            interlace: false,
        };
        let hz = mode.refresh_hz();
        assert!((hz - 60.0).abs() < 0.1, "got {hz}");
        let period = mode.refresh_period_ns();
        assert!((16_600_000..16_700_000).contains(&period), "got {period}");
    }

    #[test]
    fn test_synthesized_mode_round_trips_refresh() {
        let mode = DisplayMode::new(1280, 720, 60);
        let hz = mode.refresh_hz();
        assert!((hz - 60.0).abs() < 1.0, "got {hz}");
    }

    #[test]
    fn test_degenerate_mode_reports_failure() {
        let mode = DisplayMode {
            hdisplay: 0,
            vdisplay: 0,
            clock_khz: 0,
            htotal: 0,
            vtotal: 0,
            preferred: false,
            interlace: false,
        };
        assert_eq!(mode.refresh_period_ns(), -1);
    }
}
