//! Mosaic display grouping
//!
//! Presents one composed image across several independently addressed
//! displays as if they formed a single wide panel. Each member display owns
//! an x-range of the combined space; a submitted frame is split by
//! display-frame overlap, translated into each member's coordinate space and
//! forwarded, with the members' retire fences merged into one.

use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::display::{
    DisplayAttribute, DisplayType, HotplugCallback, NativeDisplay, PowerMode, PresentStatus,
    RefreshCallback, VsyncCallback,
};
use crate::error::HwcResult;
use crate::layer::{Layer, PixelFormat, Rect};
use crate::sync::Fence;

struct MosaicState {
    power_mode: PowerMode,
    connected: Vec<Arc<dyn NativeDisplay>>,
    update_connected: bool,
}

pub struct MosaicDisplay {
    members: Vec<Arc<dyn NativeDisplay>>,
    state: Mutex<MosaicState>,
}

impl MosaicDisplay {
    pub fn new(members: Vec<Arc<dyn NativeDisplay>>) -> Self {
        let connected = members.clone();
        Self {
            members,
            state: Mutex::new(MosaicState {
                power_mode: PowerMode::Off,
                connected,
                update_connected: true,
            }),
        }
    }

    /// Re-derives the connected member list on the next present.
    pub fn refresh_connected(&self) {
        self.state.lock().update_connected = true;
    }

    fn connected_members(&self) -> Vec<Arc<dyn NativeDisplay>> {
        let mut state = self.state.lock();
        if state.update_connected {
            state.connected = self
                .members
                .iter()
                .filter(|display| display.is_connected())
                .cloned()
                .collect();
            state.update_connected = false;
        }
        state.connected.clone()
    }
}

impl NativeDisplay for MosaicDisplay {
    fn display_type(&self) -> DisplayType {
        DisplayType::Mosaic
    }

    fn width(&self) -> u32 {
        self.members.iter().map(|display| display.width()).sum()
    }

    fn height(&self) -> u32 {
        self.members
            .iter()
            .map(|display| display.height())
            .max()
            .unwrap_or(0)
    }

    fn display_name(&self) -> String {
        format!("Mosaic[{}]", self.members.len())
    }

    fn display_configs(&self) -> Vec<u32> {
        vec![0]
    }

    fn display_attribute(&self, config: u32, attribute: DisplayAttribute) -> Option<i32> {
        match attribute {
            DisplayAttribute::Width => Some(self.width() as i32),
            DisplayAttribute::Height => Some(self.height() as i32),
            _ => self
                .members
                .first()
                .and_then(|display| display.display_attribute(config, attribute)),
        }
    }

    fn active_config(&self) -> u32 {
        0
    }

    fn set_active_config(&self, config: u32) -> bool {
        self.members
            .iter()
            .all(|display| display.set_active_config(config))
    }

    fn power_mode(&self) -> PowerMode {
        self.state.lock().power_mode
    }

    fn set_power_mode(&self, mode: PowerMode) -> bool {
        self.state.lock().power_mode = mode;
        self.members
            .iter()
            .all(|display| display.set_power_mode(mode))
    }

    fn is_connected(&self) -> bool {
        self.members.iter().any(|display| display.is_connected())
    }

    fn present(&self, layers: Vec<Layer>, _constrained: bool) -> HwcResult<PresentStatus> {
        if self.state.lock().power_mode != PowerMode::On {
            return Ok(PresentStatus::Presented { retire_fence: None });
        }

        let connected = self.connected_members();
        let mut retire_fence: Option<Fence> = None;
        let mut left_constraint: i32 = 0;

        for display in &connected {
            let width = display.width() as i32;
            let right_constraint = left_constraint + width;
            let span = Rect::new(left_constraint, 0, right_constraint, display.height() as i32);

            // Layers are duplicated per member: one submission may span the
            // seam between two displays.
            let dx = display.x_translation() as i32 - left_constraint;
            let mut member_layers = Vec::new();
            for layer in &layers {
                if !layer.display_frame.overlaps(&span) {
                    continue;
                }
                let mut copy = layer.duplicate();
                copy.display_frame = copy.display_frame.translated(dx, 0);
                member_layers.push(copy);
            }
            left_constraint = right_constraint;

            if member_layers.is_empty() {
                continue;
            }

            debug!(
                "mosaic span [{}..{}) forwarding {} layers to {}",
                span.left,
                span.right,
                member_layers.len(),
                display.display_name()
            );
            let status = display.present(member_layers, true)?;
            if let Some(fence) = status.into_retire_fence() {
                retire_fence = match retire_fence {
                    None => Some(fence),
                    Some(previous) => match Fence::merge("mosaic-retire", previous, fence) {
                        Ok(merged) => Some(merged),
                        Err(err) => {
                            warn!("mosaic retire fence merge failed: {}", err);
                            None
                        }
                    },
                };
            }
        }

        Ok(PresentStatus::Presented { retire_fence })
    }

    fn register_vsync_callback(&self, callback: VsyncCallback, display_id: u32) {
        // One timing source for the whole group: the leftmost member paces
        // the composed frame.
        if let Some(primary) = self.members.first() {
            primary.register_vsync_callback(callback, display_id);
        }
    }

    fn register_refresh_callback(&self, callback: RefreshCallback, display_id: u32) {
        if let Some(primary) = self.members.first() {
            primary.register_refresh_callback(callback, display_id);
        }
    }

    fn register_hotplug_callback(&self, callback: HotplugCallback, display_id: u32) {
        if let Some(primary) = self.members.first() {
            primary.register_hotplug_callback(callback, display_id);
        }
    }

    fn vsync_control(&self, enabled: bool) {
        for display in &self.members {
            display.vsync_control(enabled);
        }
    }

    fn check_plane_format(&self, format: PixelFormat) -> bool {
        self.members
            .iter()
            .all(|display| display.check_plane_format(format))
    }

    fn hotplug_update(&self, connected: bool) {
        self.refresh_connected();
        for display in &self.members {
            display.hotplug_update(connected);
        }
    }

    fn contains_connector(&self, connector_id: u32) -> bool {
        self.members
            .iter()
            .any(|display| display.contains_connector(connector_id))
    }
}
