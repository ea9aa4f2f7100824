//! Kernel display interface contract
//!
//! The narrow surface the commit path needs from the modesetting kernel API.
//! Return conventions follow the ioctl layer: property blob id 0 means the
//! allocation failed, commit errors carry the negative errno. The contract
//! is object-safe so tests can substitute a scripted device.

use thiserror::Error;

use crate::display::DisplayMode;
use crate::layer::PixelFormat;
use crate::sync::Fence;

pub type ObjectId = u32;
pub type PropertyId = u32;
pub type BlobId = u32;

#[derive(Debug, Error)]
#[error("kms operation failed (errno {errno})")]
pub struct KmsError {
    pub errno: i32,
}

impl KmsError {
    pub fn new(errno: i32) -> Self {
        Self { errno }
    }
}

/// Object class a property lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Crtc,
    Connector,
    Plane,
}

/// Atomic commit behavior flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommitFlags(u32);

impl CommitFlags {
    pub const NONE: CommitFlags = CommitFlags(0);
    /// Permit the commit to perform a full modeset.
    pub const ALLOW_MODESET: CommitFlags = CommitFlags(1 << 0);
    /// Return without waiting for the flip to complete.
    pub const NONBLOCK: CommitFlags = CommitFlags(1 << 1);
    /// Validate only; no hardware state changes.
    pub const TEST_ONLY: CommitFlags = CommitFlags(1 << 2);

    pub fn contains(&self, other: CommitFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for CommitFlags {
    type Output = CommitFlags;

    fn bitor(self, rhs: CommitFlags) -> CommitFlags {
        CommitFlags(self.0 | rhs.0)
    }
}

/// Accumulates property writes for one indivisible commit.
#[derive(Debug, Default)]
pub struct AtomicRequest {
    props: Vec<(ObjectKind, ObjectId, PropertyId, u64)>,
    out_fence_crtc: Option<(ObjectId, PropertyId)>,
}

impl AtomicRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_property(
        &mut self,
        kind: ObjectKind,
        object: ObjectId,
        property: PropertyId,
        value: u64,
    ) {
        self.props.push((kind, object, property, value));
    }

    /// Asks the kernel to hand back a retire fence for this commit through
    /// the CRTC's out-fence property.
    pub fn request_out_fence(&mut self, crtc: ObjectId, property: PropertyId) {
        self.out_fence_crtc = Some((crtc, property));
    }

    pub fn wants_out_fence(&self) -> bool {
        self.out_fence_crtc.is_some()
    }

    pub fn out_fence_target(&self) -> Option<(ObjectId, PropertyId)> {
        self.out_fence_crtc
    }

    pub fn props(&self) -> &[(ObjectKind, ObjectId, PropertyId, u64)] {
        &self.props
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty() && self.out_fence_crtc.is_none()
    }
}

/// CRTC as enumerated at startup.
#[derive(Debug, Clone, Copy)]
pub struct KmsCrtc {
    pub id: ObjectId,
    pub pipe: u32,
}

/// Connector snapshot taken during hotplug processing.
#[derive(Debug, Clone)]
pub struct KmsConnector {
    pub id: ObjectId,
    pub connected: bool,
    pub modes: Vec<DisplayMode>,
    /// Index into `modes`; exactly one preferred mode per connector.
    pub preferred_mode: usize,
    /// CRTC the active encoder is wired to, if any.
    pub encoder_crtc: Option<ObjectId>,
    /// Pipe bitmask of CRTCs an idle encoder could drive.
    pub possible_crtcs: u32,
    pub mm_width: u32,
    pub mm_height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PlaneKind {
    Primary,
    Overlay,
    Cursor,
}

/// Scanout plane as enumerated at startup.
#[derive(Debug, Clone)]
pub struct KmsPlane {
    pub id: ObjectId,
    pub kind: PlaneKind,
    pub possible_crtcs: u32,
    pub formats: Vec<PixelFormat>,
}

/// Inputs for framebuffer-object creation from imported gem handles.
#[derive(Debug, Clone)]
pub struct FramebufferRequest {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub modifier: u64,
    pub gem_handles: [u32; 4],
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
}

/// The kernel display device, at the granularity the commit path consumes.
pub trait KmsDevice: Send + Sync {
    fn crtcs(&self) -> Vec<KmsCrtc>;
    fn connectors(&self) -> Vec<KmsConnector>;
    fn planes(&self) -> Vec<KmsPlane>;

    /// Property id and current value, or None when the object lacks it.
    fn find_property(
        &self,
        kind: ObjectKind,
        object: ObjectId,
        name: &str,
    ) -> Option<(PropertyId, u64)>;

    /// Returns 0 when the allocation fails.
    fn create_property_blob(&self, data: &[u8]) -> BlobId;
    /// Mode blobs carry a kernel-defined struct; backends own the encoding.
    fn create_mode_blob(&self, mode: &DisplayMode) -> BlobId;
    fn destroy_property_blob(&self, blob: BlobId);

    /// Non-atomic property write (DPMS, HDCP, broadcast range).
    fn set_object_property(
        &self,
        kind: ObjectKind,
        object: ObjectId,
        property: PropertyId,
        value: u64,
    ) -> Result<(), KmsError>;

    /// One indivisible commit. Returns the retire fence when the request
    /// asked for one and the commit was not TEST_ONLY.
    fn atomic_commit(
        &self,
        request: &AtomicRequest,
        flags: CommitFlags,
    ) -> Result<Option<Fence>, KmsError>;

    /// Blocks until the next vblank on `pipe`; returns the timestamp in ns.
    fn wait_vblank(&self, pipe: u32) -> Result<i64, KmsError>;

    fn create_framebuffer(&self, request: &FramebufferRequest) -> Result<u32, KmsError>;
    fn release_framebuffer(&self, fb_id: u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_flags_compose() {
        let flags = CommitFlags::ALLOW_MODESET | CommitFlags::NONBLOCK;
        assert!(flags.contains(CommitFlags::ALLOW_MODESET));
        assert!(flags.contains(CommitFlags::NONBLOCK));
        assert!(!flags.contains(CommitFlags::TEST_ONLY));
        assert!(CommitFlags::NONE.contains(CommitFlags::NONE));
    }

    #[test]
    fn test_request_accumulates_in_order() {
        let mut request = AtomicRequest::new();
        assert!(request.is_empty());
        request.add_property(ObjectKind::Plane, 31, 7, 100);
        request.add_property(ObjectKind::Crtc, 40, 2, 1);
        request.request_out_fence(40, 9);
        assert!(!request.is_empty());
        assert!(request.wants_out_fence());
        assert_eq!(request.props().len(), 2);
        assert_eq!(request.props()[0], (ObjectKind::Plane, 31, 7, 100));
        assert_eq!(request.out_fence_target(), Some((40, 9)));
    }
}
