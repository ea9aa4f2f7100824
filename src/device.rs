//! Top-level device assembly
//!
//! `GpuDevice` owns the display manager and turns the flat CRTC enumeration
//! into the configured presentation topology: ordered physical displays,
//! logical splits, mosaic groups and clone sets. The embedding HAL only ever
//! sees the resulting `NativeDisplay` list.

use std::sync::Arc;

use anyhow::Result;
use log::{info, warn};

use crate::config::PlanarConfig;
use crate::display::headless::HeadlessDisplay;
use crate::display::logical::LogicalDisplayManager;
use crate::display::mosaic::MosaicDisplay;
use crate::display::vdisplay::{Compositor, VirtualDisplay};
use crate::display::NativeDisplay;
use crate::drm::manager::{DrmDisplayManager, HotplugEventCallback, HotplugSource};
use crate::drm::device::KmsDevice;
use crate::multi::MultiDisplayManager;
use crate::resources::BufferImporter;

pub struct GpuDevice {
    config: PlanarConfig,
    display_manager: Option<DrmDisplayManager>,
    logical_managers: Vec<LogicalDisplayManager>,
    multi: MultiDisplayManager,
    total_displays: Vec<Arc<dyn NativeDisplay>>,
    initialized: bool,
}

impl GpuDevice {
    pub fn new(config: PlanarConfig) -> Self {
        Self {
            config,
            display_manager: None,
            logical_managers: Vec::new(),
            multi: MultiDisplayManager::new(),
            total_displays: Vec::new(),
            initialized: false,
        }
    }

    /// Brings the device up against a kernel backend.
    pub fn initialize(
        &mut self,
        kms: Arc<dyn KmsDevice>,
        importer: Arc<dyn BufferImporter>,
        hotplug: Box<dyn HotplugSource>,
    ) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        self.initialized = true;

        let manager = DrmDisplayManager::new(kms);
        manager.initialize()?;
        manager.initialize_display_resources(importer);
        manager.start_hotplug_monitor(hotplug);

        let unordered = manager.get_all_displays();
        self.display_manager = Some(manager);

        // Apply the configured physical ordering; unlisted displays keep
        // their enumeration order at the tail.
        let mut ordered: Vec<Arc<dyn NativeDisplay>> = Vec::new();
        let mut placed = vec![false; unordered.len()];
        for &index in &self.config.topology.physical_order {
            match unordered.get(index as usize) {
                Some(display) => {
                    placed[index as usize] = true;
                    ordered.push(display.clone());
                }
                None => warn!("physical_order references unknown display {}", index),
            }
        }
        for (index, display) in unordered.iter().enumerate() {
            if !placed[index] {
                ordered.push(display.clone());
            }
        }

        // Logical splits replace their physical display in the list.
        let use_logical = !self.config.topology.logical.is_empty();
        let barrier_flush = self.config.barrier_flush();
        let mut zoned: Vec<Arc<dyn NativeDisplay>> = Vec::new();
        for (index, display) in ordered.iter().enumerate() {
            let divisions = self.config.divisions_for(index as u32);
            if divisions > 1 {
                let manager = LogicalDisplayManager::new(display.clone(), barrier_flush);
                manager.initialize_logical_displays(divisions);
                for logical in manager.displays() {
                    zoned.push(logical);
                }
                self.logical_managers.push(manager);
            } else {
                zoned.push(display.clone());
            }
        }

        // Mosaic groups collapse member displays into one combined panel.
        let use_mosaic = !self.config.topology.mosaic.is_empty();
        let mut total: Vec<Arc<dyn NativeDisplay>> = Vec::new();
        if use_mosaic {
            let mut consumed = vec![false; zoned.len()];
            for index in 0..zoned.len() {
                if consumed[index] {
                    continue;
                }
                let group = self
                    .config
                    .topology
                    .mosaic
                    .iter()
                    .find(|group| group.displays.contains(&(index as u32)));
                match group {
                    Some(group) => {
                        let mut members = Vec::new();
                        for &member in &group.displays {
                            match zoned.get(member as usize) {
                                Some(display) => {
                                    consumed[member as usize] = true;
                                    members.push(display.clone());
                                }
                                None => {
                                    warn!("mosaic group references unknown display {}", member)
                                }
                            }
                        }
                        if !members.is_empty() {
                            total.push(Arc::new(MosaicDisplay::new(members)));
                        }
                    }
                    None => total.push(zoned[index].clone()),
                }
            }
        } else {
            total = zoned;
        }

        // Clone sets only apply to a plain topology; a cloned display is
        // not advertised as an independent output.
        if !self.config.topology.clones.is_empty() && !use_mosaic && !use_logical {
            let mut hidden = std::collections::HashSet::new();
            for group in &self.config.topology.clones {
                let Some(&source_index) = group.displays.first() else {
                    continue;
                };
                let Some(source) = total.get(source_index as usize).cloned() else {
                    warn!("clone group references unknown display {}", source_index);
                    continue;
                };
                for &mirror in &group.displays[1..] {
                    match total.get(mirror as usize) {
                        Some(display) => {
                            display.clone_display(Some(source.clone()));
                            hidden.insert(mirror as usize);
                        }
                        None => warn!("clone group references unknown display {}", mirror),
                    }
                }
            }
            total = total
                .into_iter()
                .enumerate()
                .filter(|(index, _)| !hidden.contains(index))
                .map(|(_, display)| display)
                .collect();
        }

        if let Some(primary) = total.first() {
            self.multi.set_primary_display(primary.clone());
        }

        info!(
            "gpu device initialized: {} presentation endpoints",
            total.len()
        );
        self.total_displays = total;
        Ok(())
    }

    /// Degenerate bring-up for machines with no display hardware: the API
    /// contract still requires a non-null display.
    pub fn initialize_headless(&mut self) {
        if self.initialized {
            return;
        }
        self.initialized = true;
        info!("no display hardware; exposing a headless endpoint");
        self.total_displays = vec![Arc::new(HeadlessDisplay::new())];
    }

    pub fn get_display(&self, display_id: u32) -> Option<Arc<dyn NativeDisplay>> {
        self.total_displays.get(display_id as usize).cloned()
    }

    pub fn get_all_displays(&self) -> Vec<Arc<dyn NativeDisplay>> {
        self.total_displays.clone()
    }

    pub fn get_connected_physical_displays(&self) -> Vec<Arc<dyn NativeDisplay>> {
        self.total_displays
            .iter()
            .filter(|display| display.is_connected())
            .cloned()
            .collect()
    }

    pub fn create_virtual_display(
        &self,
        width: u32,
        height: u32,
        compositor: Arc<dyn Compositor>,
    ) -> Option<Arc<VirtualDisplay>> {
        self.display_manager
            .as_ref()
            .map(|manager| manager.create_virtual_display(width, height, compositor))
    }

    pub fn register_hotplug_event_callback(&self, callback: HotplugEventCallback) {
        if let Some(manager) = &self.display_manager {
            manager.register_hotplug_event_callback(callback);
        }
    }

    pub fn multi_display_manager(&self) -> &MultiDisplayManager {
        &self.multi
    }

    /// Managers for the configured logical splits; their lifetime keeps the
    /// zones' shared barrier state alive.
    pub fn logical_managers(&self) -> &[LogicalDisplayManager] {
        &self.logical_managers
    }

    pub fn display_manager(&self) -> Option<&DrmDisplayManager> {
        self.display_manager.as_ref()
    }

    pub fn config(&self) -> &PlanarConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_fallback() {
        let mut device = GpuDevice::new(PlanarConfig::default());
        device.initialize_headless();
        assert_eq!(device.get_all_displays().len(), 1);
        let display = device.get_display(0).unwrap();
        assert_eq!(display.width(), 1);
        assert!(device.get_display(1).is_none());
        // Headless reports disconnected at the protection boundary.
        assert!(device.get_connected_physical_displays().is_empty());
    }

    #[test]
    fn test_initialize_headless_is_idempotent() {
        let mut device = GpuDevice::new(PlanarConfig::default());
        device.initialize_headless();
        device.initialize_headless();
        assert_eq!(device.get_all_displays().len(), 1);
    }
}
