//! Physical display path
//!
//! Everything that talks (directly or by contract) to the kernel modesetting
//! interface: the [`device::KmsDevice`] collaborator trait, plane state,
//! the per-display commit protocol, CRTC/connector enumeration with hotplug
//! tracking, and the vblank worker. The real `/dev/dri` backend lives in
//! [`card`] behind the `hw-drm` feature; all other code is written against
//! the contracts so it runs identically over a mock device in tests.

pub mod device;
pub mod display;
pub mod manager;
pub mod plane;
pub mod vsync;

#[cfg(feature = "hw-drm")]
pub mod card;

pub use device::{AtomicRequest, CommitFlags, KmsDevice};
pub use display::DrmDisplay;
pub use manager::{DrmDisplayManager, HotplugSource};
