//! Display plane state
//!
//! One hardware scanout unit: its property ids, supported formats, and the
//! in-use flag the commit path uses to decide which planes need an explicit
//! disable. Plane state is mutated under the owning display's lock.

use log::debug;

use crate::drm::device::{
    AtomicRequest, KmsDevice, KmsPlane, ObjectId, ObjectKind, PlaneKind, PropertyId,
};
use crate::error::{HwcError, HwcResult};
use crate::layer::{Layer, PixelFormat};
use crate::sync::Fence;

struct PlaneProps {
    fb_id: PropertyId,
    crtc_id: PropertyId,
    src_x: PropertyId,
    src_y: PropertyId,
    src_w: PropertyId,
    src_h: PropertyId,
    crtc_x: PropertyId,
    crtc_y: PropertyId,
    crtc_w: PropertyId,
    crtc_h: PropertyId,
    in_fence_fd: Option<PropertyId>,
    alpha: Option<PropertyId>,
}

pub struct DrmPlane {
    id: ObjectId,
    kind: PlaneKind,
    possible_crtcs: u32,
    formats: Vec<PixelFormat>,
    props: PlaneProps,
    in_use: bool,
    /// Keeps the duplicated acquire fence fd alive across the commit call.
    native_fence: Option<Fence>,
}

impl DrmPlane {
    /// Builds plane state from an enumerated plane; fails when a property
    /// the commit path cannot work without is missing.
    pub fn from_kms(kms: &dyn KmsDevice, info: &KmsPlane) -> HwcResult<DrmPlane> {
        let required = |name: &'static str| -> HwcResult<PropertyId> {
            kms.find_property(ObjectKind::Plane, info.id, name)
                .map(|(id, _)| id)
                .ok_or(HwcError::PropertyMissing { name })
        };
        let optional = |name: &str| {
            kms.find_property(ObjectKind::Plane, info.id, name)
                .map(|(id, _)| id)
        };

        let props = PlaneProps {
            fb_id: required("FB_ID")?,
            crtc_id: required("CRTC_ID")?,
            src_x: required("SRC_X")?,
            src_y: required("SRC_Y")?,
            src_w: required("SRC_W")?,
            src_h: required("SRC_H")?,
            crtc_x: required("CRTC_X")?,
            crtc_y: required("CRTC_Y")?,
            crtc_w: required("CRTC_W")?,
            crtc_h: required("CRTC_H")?,
            in_fence_fd: optional("IN_FENCE_FD"),
            alpha: optional("alpha"),
        };

        Ok(DrmPlane {
            id: info.id,
            kind: info.kind,
            possible_crtcs: info.possible_crtcs,
            formats: info.formats.clone(),
            props,
            in_use: false,
            native_fence: None,
        })
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn kind(&self) -> PlaneKind {
        self.kind
    }

    pub fn drives_pipe(&self, pipe: u32) -> bool {
        self.possible_crtcs & (1 << pipe) != 0
    }

    pub fn supports_format(&self, format: PixelFormat) -> bool {
        self.formats.contains(&format)
    }

    pub fn in_use(&self) -> bool {
        self.in_use
    }

    pub fn set_native_fence(&mut self, fence: Option<Fence>) {
        self.native_fence = fence;
    }

    /// Writes the full property set for scanning `layer` out of `fb_id`.
    pub fn write_properties(
        &mut self,
        request: &mut AtomicRequest,
        crtc_id: ObjectId,
        layer: &Layer,
        fb_id: u32,
    ) {
        let props = &self.props;
        let id = self.id;
        let add = move |request: &mut AtomicRequest, prop: PropertyId, value: u64| {
            request.add_property(ObjectKind::Plane, id, prop, value);
        };

        add(request, props.fb_id, fb_id as u64);
        add(request, props.crtc_id, crtc_id as u64);

        // Source coordinates are 16.16 fixed point.
        let fixed = |v: f32| (v.max(0.0) * 65536.0) as u64;
        add(request, props.src_x, fixed(layer.source_crop.left));
        add(request, props.src_y, fixed(layer.source_crop.top));
        add(request, props.src_w, fixed(layer.source_crop.width()));
        add(request, props.src_h, fixed(layer.source_crop.height()));

        let frame = layer.display_frame;
        add(request, props.crtc_x, frame.left as u64);
        add(request, props.crtc_y, frame.top as u64);
        add(request, props.crtc_w, frame.width() as u64);
        add(request, props.crtc_h, frame.height() as u64);

        if let (Some(prop), Some(fence)) = (props.in_fence_fd, self.native_fence.as_ref()) {
            use std::os::fd::AsRawFd;
            add(request, prop, fence.as_raw_fd() as u64);
        }
        if let Some(prop) = props.alpha {
            add(request, prop, (layer.alpha.clamp(0.0, 1.0) * 65535.0) as u64);
        }

        self.in_use = true;
    }

    /// Detaches the plane from its CRTC.
    pub fn disable(&mut self, request: &mut AtomicRequest) {
        debug!("disabling plane {}", self.id);
        request.add_property(ObjectKind::Plane, self.id, self.props.fb_id, 0);
        request.add_property(ObjectKind::Plane, self.id, self.props.crtc_id, 0);
        self.in_use = false;
        self.native_fence = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{BufferKey, NativeBufferDesc, Rect};
    use std::collections::HashMap;

    struct PropTable {
        props: HashMap<&'static str, PropertyId>,
    }

    impl KmsDevice for PropTable {
        fn crtcs(&self) -> Vec<crate::drm::device::KmsCrtc> {
            Vec::new()
        }
        fn connectors(&self) -> Vec<crate::drm::device::KmsConnector> {
            Vec::new()
        }
        fn planes(&self) -> Vec<KmsPlane> {
            Vec::new()
        }
        fn find_property(
            &self,
            _kind: ObjectKind,
            _object: ObjectId,
            name: &str,
        ) -> Option<(PropertyId, u64)> {
            self.props.get(name).map(|&id| (id, 0))
        }
        fn create_property_blob(&self, _data: &[u8]) -> u32 {
            0
        }
        fn create_mode_blob(&self, _mode: &crate::display::DisplayMode) -> u32 {
            0
        }
        fn destroy_property_blob(&self, _blob: u32) {}
        fn set_object_property(
            &self,
            _kind: ObjectKind,
            _object: ObjectId,
            _property: PropertyId,
            _value: u64,
        ) -> Result<(), crate::drm::device::KmsError> {
            Ok(())
        }
        fn atomic_commit(
            &self,
            _request: &AtomicRequest,
            _flags: crate::drm::device::CommitFlags,
        ) -> Result<Option<Fence>, crate::drm::device::KmsError> {
            Ok(None)
        }
        fn wait_vblank(&self, _pipe: u32) -> Result<i64, crate::drm::device::KmsError> {
            Ok(0)
        }
        fn create_framebuffer(
            &self,
            _request: &crate::drm::device::FramebufferRequest,
        ) -> Result<u32, crate::drm::device::KmsError> {
            Ok(1)
        }
        fn release_framebuffer(&self, _fb_id: u32) {}
    }

    fn full_table() -> PropTable {
        let names = [
            "FB_ID", "CRTC_ID", "SRC_X", "SRC_Y", "SRC_W", "SRC_H", "CRTC_X", "CRTC_Y",
            "CRTC_W", "CRTC_H", "IN_FENCE_FD", "alpha",
        ];
        PropTable {
            props: names
                .iter()
                .enumerate()
                .map(|(i, &n)| (n, i as PropertyId + 1))
                .collect(),
        }
    }

    fn plane_info() -> KmsPlane {
        KmsPlane {
            id: 31,
            kind: PlaneKind::Primary,
            possible_crtcs: 0b01,
            formats: vec![PixelFormat::XRGB8888],
        }
    }

    #[test]
    fn test_missing_required_property_fails() {
        let mut table = full_table();
        table.props.remove("SRC_W");
        assert!(matches!(
            DrmPlane::from_kms(&table, &plane_info()),
            Err(HwcError::PropertyMissing { name: "SRC_W" })
        ));
    }

    #[test]
    fn test_property_write_set() {
        let table = full_table();
        let mut plane = DrmPlane::from_kms(&table, &plane_info()).unwrap();
        assert!(!plane.in_use());
        assert!(plane.drives_pipe(0));
        assert!(!plane.drives_pipe(1));

        let layer = Layer::new(
            NativeBufferDesc::linear(BufferKey(1), 256, 128, PixelFormat::XRGB8888),
            Rect::new(10, 20, 266, 148),
        );
        let mut request = AtomicRequest::new();
        plane.write_properties(&mut request, 99, &layer, 42);
        assert!(plane.in_use());

        let props = request.props();
        // FB_ID + CRTC_ID + 4 src + 4 crtc + alpha (no fence attached)
        assert_eq!(props.len(), 11);
        assert_eq!(props[0].3, 42);
        assert_eq!(props[1].3, 99);
        // SRC_W is 16.16 fixed point.
        assert_eq!(props[4].3, 256 << 16);
        // CRTC_X is a plain pixel coordinate.
        assert_eq!(props[6].3, 10);
    }

    #[test]
    fn test_disable_clears_state() {
        let table = full_table();
        let mut plane = DrmPlane::from_kms(&table, &plane_info()).unwrap();
        let layer = Layer::new(
            NativeBufferDesc::linear(BufferKey(1), 64, 64, PixelFormat::XRGB8888),
            Rect::new(0, 0, 64, 64),
        );
        let mut request = AtomicRequest::new();
        plane.write_properties(&mut request, 99, &layer, 7);
        assert!(plane.in_use());

        let mut request = AtomicRequest::new();
        plane.disable(&mut request);
        assert!(!plane.in_use());
        assert_eq!(request.props().len(), 2);
        assert_eq!(request.props()[0].3, 0);
    }
}
