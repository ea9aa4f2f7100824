//! Headless display stub
//!
//! Stands in when no physical output exists but the API contract still
//! requires a non-null display: every query answers with a degenerate
//! 1x1@60 mode and presents succeed without touching hardware. The stub
//! reports disconnected at the protection boundary so clients never treat
//! it as a real sink.

use log::debug;

use crate::display::{
    DisplayAttribute, DisplayType, HotplugCallback, NativeDisplay, PowerMode, PresentStatus,
    RefreshCallback, VsyncCallback,
};
use crate::error::HwcResult;
use crate::layer::{Layer, PixelFormat};

pub struct HeadlessDisplay;

impl HeadlessDisplay {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HeadlessDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeDisplay for HeadlessDisplay {
    fn display_type(&self) -> DisplayType {
        DisplayType::Headless
    }

    fn width(&self) -> u32 {
        1
    }

    fn height(&self) -> u32 {
        1
    }

    fn display_name(&self) -> String {
        "Headless".to_string()
    }

    fn display_configs(&self) -> Vec<u32> {
        vec![0]
    }

    fn display_attribute(&self, _config: u32, attribute: DisplayAttribute) -> Option<i32> {
        match attribute {
            DisplayAttribute::Width | DisplayAttribute::Height => Some(1),
            // Nominal 60Hz period in nanoseconds.
            DisplayAttribute::RefreshRate => Some(16_666_666),
            DisplayAttribute::DpiX | DisplayAttribute::DpiY => Some(1),
        }
    }

    fn active_config(&self) -> u32 {
        0
    }

    fn set_active_config(&self, _config: u32) -> bool {
        false
    }

    fn power_mode(&self) -> PowerMode {
        PowerMode::On
    }

    fn set_power_mode(&self, _mode: PowerMode) -> bool {
        true
    }

    fn is_connected(&self) -> bool {
        false
    }

    fn present(&self, layers: Vec<Layer>, _constrained: bool) -> HwcResult<PresentStatus> {
        debug!("headless present absorbed {} layers", layers.len());
        Ok(PresentStatus::Presented { retire_fence: None })
    }

    fn register_vsync_callback(&self, _callback: VsyncCallback, _display_id: u32) {}

    fn register_refresh_callback(&self, _callback: RefreshCallback, _display_id: u32) {}

    fn register_hotplug_callback(&self, _callback: HotplugCallback, _display_id: u32) {}

    fn vsync_control(&self, _enabled: bool) {}

    fn check_plane_format(&self, _format: PixelFormat) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{BufferKey, NativeBufferDesc, Rect};

    #[test]
    fn test_degenerate_mode() {
        let display = HeadlessDisplay::new();
        assert_eq!(display.width(), 1);
        assert_eq!(display.height(), 1);
        assert_eq!(display.display_configs(), vec![0]);
        assert_eq!(
            display.display_attribute(0, DisplayAttribute::RefreshRate),
            Some(16_666_666)
        );
        assert!(!display.is_connected());
    }

    #[test]
    fn test_present_always_succeeds() {
        let display = HeadlessDisplay::new();
        let layer = Layer::new(
            NativeBufferDesc::linear(BufferKey(1), 1, 1, PixelFormat::XRGB8888),
            Rect::new(0, 0, 1, 1),
        );
        let status = display.present(vec![layer], false).unwrap();
        assert!(status.into_retire_fence().is_none());
    }
}
