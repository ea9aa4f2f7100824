//! Multi-monitor presentation policy
//!
//! Tracks which attached displays receive their own content (extend) versus
//! mirroring the primary (clone). A secondary display that submits frames is
//! extended; one that goes silent for a full primary frame window falls back
//! to cloning the primary so it never scans out stale content.

use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::display::NativeDisplay;

struct ExtendedDisplayState {
    display: Arc<dyn NativeDisplay>,
    last_frame_updated: bool,
}

#[derive(Default)]
pub struct MultiDisplayManager {
    primary: Mutex<Option<Arc<dyn NativeDisplay>>>,
    state: Mutex<Vec<ExtendedDisplayState>>,
}

impl MultiDisplayManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_primary_display(&self, primary: Arc<dyn NativeDisplay>) {
        *self.primary.lock() = Some(primary);
    }

    /// Number of displays currently running extended.
    pub fn extended_count(&self) -> usize {
        self.state.lock().len()
    }

    /// Records a present on `display`.
    ///
    /// Primary presents close a frame window: extended displays that stayed
    /// silent through the window are re-cloned from primary. Secondary
    /// presents mark the display extended.
    pub fn updated_display(&self, display: &Arc<dyn NativeDisplay>, primary: bool) {
        let mut state = self.state.lock();
        if primary {
            if state.is_empty() {
                return;
            }
            let primary_display = self.primary.lock().clone();
            let mut survivors = Vec::with_capacity(state.len());
            for entry in state.drain(..) {
                if entry.last_frame_updated {
                    survivors.push(ExtendedDisplayState {
                        display: entry.display,
                        last_frame_updated: false,
                    });
                } else {
                    debug!(
                        "display {} went silent; cloning primary",
                        entry.display.display_name()
                    );
                    entry.display.clone_display(primary_display.clone());
                }
            }
            *state = survivors;
        } else {
            let known = state
                .iter_mut()
                .find(|entry| Arc::ptr_eq(&entry.display, display));
            match known {
                Some(entry) => entry.last_frame_updated = true,
                None => {
                    debug!("display {} now extended", display.display_name());
                    display.clone_display(None);
                    state.push(ExtendedDisplayState {
                        display: display.clone(),
                        last_frame_updated: true,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::{
        DisplayAttribute, DisplayType, HotplugCallback, PowerMode, PresentStatus,
        RefreshCallback, VsyncCallback,
    };
    use crate::error::HwcResult;
    use crate::layer::{Layer, PixelFormat};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct StubDisplay {
        clone_calls: AtomicUsize,
        extend_calls: AtomicUsize,
    }

    impl NativeDisplay for StubDisplay {
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
            "Stub".to_string()
        }
        fn display_configs(&self) -> Vec<u32> {
            vec![0]
        }
        fn display_attribute(&self, _config: u32, _attribute: DisplayAttribute) -> Option<i32> {
            None
        }
        fn active_config(&self) -> u32 {
            0
        }
        fn set_active_config(&self, _config: u32) -> bool {
            true
        }
        fn power_mode(&self) -> PowerMode {
            PowerMode::On
        }
        fn set_power_mode(&self, _mode: PowerMode) -> bool {
            true
        }
        fn is_connected(&self) -> bool {
            true
        }
        fn present(&self, _layers: Vec<Layer>, _constrained: bool) -> HwcResult<PresentStatus> {
            Ok(PresentStatus::Presented { retire_fence: None })
        }
        fn register_vsync_callback(&self, _callback: VsyncCallback, _display_id: u32) {}
        fn register_refresh_callback(&self, _callback: RefreshCallback, _display_id: u32) {}
        fn register_hotplug_callback(&self, _callback: HotplugCallback, _display_id: u32) {}
        fn vsync_control(&self, _enabled: bool) {}
        fn check_plane_format(&self, _format: PixelFormat) -> bool {
            true
        }
        fn clone_display(&self, source: Option<Arc<dyn NativeDisplay>>) {
            if source.is_some() {
                self.clone_calls.fetch_add(1, Ordering::SeqCst);
            } else {
                self.extend_calls.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn stub() -> Arc<StubDisplay> {
        Arc::new(StubDisplay::default())
    }

    #[test]
    fn test_secondary_present_extends() {
        let manager = MultiDisplayManager::new();
        let primary = stub();
        let secondary = stub();
        manager.set_primary_display(primary.clone());

        let secondary_dyn: Arc<dyn NativeDisplay> = secondary.clone();
        manager.updated_display(&secondary_dyn, false);
        assert_eq!(manager.extended_count(), 1);
        assert_eq!(secondary.extend_calls.load(Ordering::SeqCst), 1);

        // A second present while extended does not re-arm clone mode.
        manager.updated_display(&secondary_dyn, false);
        assert_eq!(secondary.extend_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_silent_secondary_recloned_after_window() {
        let manager = MultiDisplayManager::new();
        let primary = stub();
        let secondary = stub();
        manager.set_primary_display(primary.clone());

        let primary_dyn: Arc<dyn NativeDisplay> = primary.clone();
        let secondary_dyn: Arc<dyn NativeDisplay> = secondary.clone();

        manager.updated_display(&secondary_dyn, false);
        // First primary frame closes the window; the secondary updated
        // within it and stays extended.
        manager.updated_display(&primary_dyn, true);
        assert_eq!(manager.extended_count(), 1);
        assert_eq!(secondary.clone_calls.load(Ordering::SeqCst), 0);

        // Second window passes with no secondary update: re-cloned.
        manager.updated_display(&primary_dyn, true);
        assert_eq!(manager.extended_count(), 0);
        assert_eq!(secondary.clone_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_primary_update_with_no_secondaries_is_noop() {
        let manager = MultiDisplayManager::new();
        let primary = stub();
        manager.set_primary_display(primary.clone());
        let primary_dyn: Arc<dyn NativeDisplay> = primary.clone();
        manager.updated_display(&primary_dyn, true);
        assert_eq!(manager.extended_count(), 0);
    }
}
