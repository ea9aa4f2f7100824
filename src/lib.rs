//! # Planar Hardware Composer Library
//!
//! Planar arbitrates which graphics layers are presented on one or more
//! displays each frame using the display controller's plane-scanout
//! hardware instead of (or in addition to) GPU compositing.
//!
//! ## Architecture
//!
//! Planar is built on a modular architecture:
//! - `device`: top-level owner assembling the configured display topology
//! - `display`: the `NativeDisplay` endpoint abstraction and its variants
//!   (headless, virtual, logical zones, mosaic groups)
//! - `drm`: the physical display path: plane state, atomic commit
//!   sequencing, connector hotplug, vblank delivery
//! - `resources`: per-display buffer/GPU-resource cache with deferred
//!   destruction
//! - `layer`: per-frame layer descriptors
//! - `sync`: sync-file fence plumbing
//! - `config`: TOML configuration (device node, topology, present policy)
//!
//! ## Usage
//!
//! ```rust,no_run
//! use planar::{GpuDevice, PlanarConfig};
//!
//! let config = PlanarConfig::load_or_default("/etc/planar.toml");
//! let mut device = GpuDevice::new(config);
//! // With no kernel backend wired in, fall back to the headless endpoint.
//! device.initialize_headless();
//! let display = device.get_display(0).expect("headless display");
//! assert_eq!(display.display_name(), "Headless");
//! ```

pub mod config;
pub mod device;
pub mod display;
pub mod drm;
pub mod error;
pub mod layer;
pub mod logging;
pub mod multi;
pub mod resources;
pub mod sync;
pub mod worker;

// Re-export main types for easy access
pub use config::PlanarConfig;
pub use device::GpuDevice;
pub use display::{NativeDisplay, PowerMode, PresentStatus};
pub use error::{HwcError, HwcResult};
pub use layer::{Layer, Rect};
pub use multi::MultiDisplayManager;
pub use resources::ResourceManager;
pub use sync::Fence;

/// Version information for Planar
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
