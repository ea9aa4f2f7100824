//! Error taxonomy for the present pipeline
//!
//! Only one tier is ever visible to the compositor's client: a rejected
//! atomic commit. Everything below that degrades in place (dropped layer,
//! missing optional property, ignored duplicate hotplug) and is reported
//! through the log.

use thiserror::Error;

use crate::layer::BufferKey;

pub type HwcResult<T> = Result<T, HwcError>;

#[derive(Debug, Error)]
pub enum HwcError {
    /// The kernel rejected the atomic commit; the previous frame stays on
    /// screen. Fatal for this frame only.
    #[error("atomic commit rejected by kernel (errno {errno})")]
    CommitFailed { errno: i32 },

    /// Creating a kernel property blob returned id 0.
    #[error("property blob allocation failed")]
    BlobAllocation,

    /// A property the commit path cannot work without was not exposed.
    #[error("required KMS property '{name}' not found")]
    PropertyMissing { name: &'static str },

    /// Importing a native buffer failed; the owning layer is dropped from
    /// the frame.
    #[error("buffer import failed for {key:?}")]
    ImportFailed { key: BufferKey },

    /// Framebuffer creation failed; logged with the decoded format code.
    #[error("framebuffer creation failed for format {fourcc} (errno {errno})")]
    FramebufferFailed { fourcc: String, errno: i32 },

    /// Present was routed to a display that is not connected.
    #[error("display is disconnected")]
    Disconnected,

    /// Operation requires an initialized display pipeline.
    #[error("display not initialized")]
    NotInitialized,

    /// The composition cannot be expressed with the available planes.
    #[error("no usable scanout plane for composition")]
    NoPlanes,

    #[error("virtual display has no output buffer assigned")]
    NoOutputBuffer,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
