//! Real kernel backend over /dev/dri
//!
//! Implements [`KmsDevice`] on top of the `drm` crate and a udev-based
//! [`HotplugSource`]. Object and property ids cross the contract boundary as
//! raw u32s; the card keeps the id-to-handle mapping it built during
//! enumeration. Framebuffer creation and vblank waits go through the stable
//! ioctl ABI directly.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::Path;

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use drm::control::{
    atomic::AtomicModeReq, connector, property, AtomicCommitFlags, Device as ControlDevice,
    PlaneType,
};
use drm::ClientCapability;
use drm::Device;

use crate::display::DisplayMode;
use crate::drm::device::{
    AtomicRequest, BlobId, CommitFlags, FramebufferRequest, KmsConnector, KmsCrtc, KmsDevice,
    KmsError, KmsPlane, ObjectId, ObjectKind, PlaneKind, PropertyId,
};
use crate::drm::manager::HotplugSource;
use crate::layer::PixelFormat;
use crate::sync::Fence;

struct Card(File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl Device for Card {}
impl ControlDevice for Card {}

/// Property handles keyed by (object class, object id, property name).
type PropIndex = HashMap<(ObjectKind, ObjectId, String), (property::Handle, u64)>;

pub struct DrmCard {
    card: Card,
    props: Mutex<PropIndex>,
    /// Kernel modes seen during connector scans, for mode-blob creation.
    modes: Mutex<Vec<drm::control::Mode>>,
    connectors: Mutex<HashMap<ObjectId, connector::Handle>>,
}

impl DrmCard {
    /// Opens the device node and claims atomic + universal-plane caps.
    pub fn open(path: &Path) -> io::Result<DrmCard> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let card = Card(file);
        for capability in [ClientCapability::UniversalPlanes, ClientCapability::Atomic] {
            card.set_client_capability(capability, true)?;
        }
        info!("opened kms device {}", path.display());
        Ok(DrmCard {
            card,
            props: Mutex::new(HashMap::new()),
            modes: Mutex::new(Vec::new()),
            connectors: Mutex::new(HashMap::new()),
        })
    }

    fn index_properties(&self, kind: ObjectKind, object: ObjectId, raw: u32) {
        let handle_props = match kind {
            ObjectKind::Crtc => {
                let handles = match self.card.resource_handles() {
                    Ok(handles) => handles,
                    Err(_) => return,
                };
                handles
                    .crtcs()
                    .iter()
                    .find(|h| u32::from(**h) == raw)
                    .and_then(|h| self.card.get_properties(*h).ok())
            }
            ObjectKind::Connector => {
                let connectors = self.connectors.lock();
                connectors
                    .get(&object)
                    .and_then(|h| self.card.get_properties(*h).ok())
            }
            ObjectKind::Plane => {
                let planes = match self.card.plane_handles() {
                    Ok(planes) => planes,
                    Err(_) => return,
                };
                planes
                    .iter()
                    .find(|h| u32::from(**h) == raw)
                    .and_then(|h| self.card.get_properties(*h).ok())
            }
        };

        let Some(prop_set) = handle_props else { return };
        let mut index = self.props.lock();
        for (&prop_id, &value) in prop_set.iter() {
            if let Ok(info) = self.card.get_property(prop_id) {
                if let Ok(name) = info.name().to_str() {
                    index.insert((kind, object, name.to_string()), (prop_id, value));
                }
            }
        }
    }

    fn mode_to_display_mode(mode: &drm::control::Mode) -> DisplayMode {
        let (width, height) = mode.size();
        // Totals are synthesized so the derived refresh matches vrefresh;
        // the kernel mode itself is kept for blob creation.
        DisplayMode {
            hdisplay: width as u32,
            vdisplay: height as u32,
            clock_khz: (width as u32) * (height as u32) * mode.vrefresh() / 1000,
            htotal: width as u32,
            vtotal: height as u32,
            preferred: mode
                .mode_type()
                .contains(drm::control::ModeTypeFlags::PREFERRED),
            interlace: false,
        }
    }
}

impl KmsDevice for DrmCard {
    fn crtcs(&self) -> Vec<KmsCrtc> {
        let Ok(handles) = self.card.resource_handles() else {
            return Vec::new();
        };
        handles
            .crtcs()
            .iter()
            .enumerate()
            .map(|(pipe, handle)| {
                let id = u32::from(*handle);
                self.index_properties(ObjectKind::Crtc, id, id);
                KmsCrtc {
                    id,
                    pipe: pipe as u32,
                }
            })
            .collect()
    }

    fn connectors(&self) -> Vec<KmsConnector> {
        let Ok(handles) = self.card.resource_handles() else {
            return Vec::new();
        };
        let mut snapshots = Vec::new();
        for handle in handles.connectors() {
            let Ok(info) = self.card.get_connector(*handle, true) else {
                warn!("failed to probe connector {:?}", handle);
                continue;
            };
            let id = u32::from(*handle);
            self.connectors.lock().insert(id, *handle);
            self.index_properties(ObjectKind::Connector, id, id);

            let mut modes = Vec::new();
            let mut preferred = 0usize;
            {
                let mut known = self.modes.lock();
                for (index, mode) in info.modes().iter().enumerate() {
                    let display_mode = Self::mode_to_display_mode(mode);
                    if display_mode.preferred {
                        preferred = index;
                    }
                    let seen = known.iter().any(|m| {
                        m.size() == mode.size()
                            && m.clock() == mode.clock()
                            && m.vrefresh() == mode.vrefresh()
                    });
                    if !seen {
                        known.push(*mode);
                    }
                    modes.push(display_mode);
                }
            }

            let encoder_crtc = info
                .current_encoder()
                .and_then(|encoder| self.card.get_encoder(encoder).ok())
                .and_then(|encoder| encoder.crtc())
                .map(u32::from);
            let mut possible_crtcs = 0u32;
            for encoder in info.encoders() {
                let Ok(encoder) = self.card.get_encoder(*encoder) else {
                    continue;
                };
                let compatible = handles.filter_crtcs(encoder.possible_crtcs());
                for (pipe, crtc) in handles.crtcs().iter().enumerate() {
                    if compatible.contains(crtc) {
                        possible_crtcs |= 1 << pipe;
                    }
                }
            }

            let (mm_width, mm_height) = info.size().unwrap_or((0, 0));
            snapshots.push(KmsConnector {
                id,
                connected: info.state() == connector::State::Connected,
                modes,
                preferred_mode: preferred,
                encoder_crtc,
                possible_crtcs,
                mm_width,
                mm_height,
            });
        }
        snapshots
    }

    fn planes(&self) -> Vec<KmsPlane> {
        let Ok(handles) = self.card.plane_handles() else {
            return Vec::new();
        };
        let Ok(resources) = self.card.resource_handles() else {
            return Vec::new();
        };
        let mut planes = Vec::new();
        for handle in handles {
            let Ok(info) = self.card.get_plane(handle) else {
                continue;
            };
            let id = u32::from(handle);
            self.index_properties(ObjectKind::Plane, id, id);

            let kind = {
                let index = self.props.lock();
                match index.get(&(ObjectKind::Plane, id, "type".to_string())) {
                    Some(&(_, value)) if value == PlaneType::Primary as u64 => PlaneKind::Primary,
                    Some(&(_, value)) if value == PlaneType::Cursor as u64 => PlaneKind::Cursor,
                    _ => PlaneKind::Overlay,
                }
            };

            // possible_crtcs is a pipe bitmask; re-derive it from the
            // filtered crtc list to stay index-stable.
            let compatible = resources.filter_crtcs(info.possible_crtcs());
            let mut mask = 0u32;
            for (pipe, crtc) in resources.crtcs().iter().enumerate() {
                if compatible.contains(crtc) {
                    mask |= 1 << pipe;
                }
            }

            planes.push(KmsPlane {
                id,
                kind,
                possible_crtcs: mask,
                formats: info
                    .formats()
                    .iter()
                    .map(|&format| PixelFormat(format))
                    .collect(),
            });
        }
        planes
    }

    fn find_property(
        &self,
        kind: ObjectKind,
        object: ObjectId,
        name: &str,
    ) -> Option<(PropertyId, u64)> {
        let index = self.props.lock();
        index
            .get(&(kind, object, name.to_string()))
            .map(|&(handle, value)| (u32::from(handle), value))
    }

    fn create_property_blob(&self, data: &[u8]) -> BlobId {
        // The ioctl ABI: blob id 0 never names a valid blob.
        let mut blob = drm_mode_create_blob {
            data: data.as_ptr() as u64,
            length: data.len() as u32,
            blob_id: 0,
        };
        let ret = unsafe {
            libc::ioctl(
                self.card.as_fd().as_raw_fd(),
                DRM_IOCTL_MODE_CREATEPROPBLOB,
                &mut blob,
            )
        };
        if ret != 0 {
            error!("property blob creation failed: {}", io::Error::last_os_error());
            return 0;
        }
        blob.blob_id
    }

    fn create_mode_blob(&self, mode: &DisplayMode) -> BlobId {
        let known = self.modes.lock();
        let Some(kernel_mode) = known.iter().find(|m| {
            let (width, height) = m.size();
            width as u32 == mode.hdisplay && height as u32 == mode.vdisplay
        }) else {
            error!(
                "no kernel mode matching {}x{}",
                mode.hdisplay, mode.vdisplay
            );
            return 0;
        };
        match self.card.create_property_blob(kernel_mode) {
            Ok(property::Value::Blob(id)) => id as BlobId,
            Ok(_) => 0,
            Err(err) => {
                error!("mode blob creation failed: {}", err);
                0
            }
        }
    }

    fn destroy_property_blob(&self, blob: BlobId) {
        if blob == 0 {
            return;
        }
        if let Err(err) = self.card.destroy_property_blob(blob as u64) {
            warn!("destroying property blob {} failed: {}", blob, err);
        }
    }

    fn set_object_property(
        &self,
        kind: ObjectKind,
        object: ObjectId,
        prop: PropertyId,
        value: u64,
    ) -> Result<(), KmsError> {
        let object_type = match kind {
            ObjectKind::Crtc => DRM_MODE_OBJECT_CRTC,
            ObjectKind::Connector => DRM_MODE_OBJECT_CONNECTOR,
            ObjectKind::Plane => DRM_MODE_OBJECT_PLANE,
        };
        let mut request = drm_mode_obj_set_property {
            value,
            prop_id: prop,
            obj_id: object,
            obj_type: object_type,
        };
        let ret = unsafe {
            libc::ioctl(
                self.card.as_fd().as_raw_fd(),
                DRM_IOCTL_MODE_OBJ_SETPROPERTY,
                &mut request,
            )
        };
        if ret != 0 {
            return Err(KmsError::new(
                io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO),
            ));
        }
        Ok(())
    }

    fn atomic_commit(
        &self,
        request: &AtomicRequest,
        flags: CommitFlags,
    ) -> Result<Option<Fence>, KmsError> {
        let mut req = AtomicModeReq::new();
        let index = self.props.lock();
        for &(kind, object, prop, value) in request.props().iter() {
            // Recover the typed handle pair recorded at enumeration time.
            let handle = index
                .iter()
                .find(|((k, o, _), (p, _))| *k == kind && *o == object && u32::from(*p) == prop)
                .map(|(_, (p, _))| *p);
            let Some(prop_handle) = handle else {
                warn!("dropping property write for unknown id {}", prop);
                continue;
            };
            let raw: drm::control::RawResourceHandle = match object.try_into() {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            req.add_raw_property(raw, prop_handle.into(), value);
        }
        drop(index);

        // Out-fence delivery goes through a pointer property the kernel
        // writes into during the commit.
        let mut out_fence_fd: i32 = -1;
        if let Some((crtc, prop)) = request.out_fence_target() {
            let handle = {
                let idx = self.props.lock();
                idx.iter()
                    .find(|((k, o, _), (p, _))| {
                        *k == ObjectKind::Crtc && *o == crtc && u32::from(*p) == prop
                    })
                    .map(|(_, (p, _))| *p)
            };
            if let (Some(prop_handle), Ok(raw)) = (handle, crtc.try_into()) {
                let raw: drm::control::RawResourceHandle = raw;
                req.add_raw_property(
                    raw,
                    prop_handle.into(),
                    &mut out_fence_fd as *mut i32 as u64,
                );
            }
        }

        let mut commit_flags = AtomicCommitFlags::empty();
        if flags.contains(CommitFlags::ALLOW_MODESET) {
            commit_flags |= AtomicCommitFlags::ALLOW_MODESET;
        }
        if flags.contains(CommitFlags::NONBLOCK) {
            commit_flags |= AtomicCommitFlags::NONBLOCK;
        }
        if flags.contains(CommitFlags::TEST_ONLY) {
            commit_flags |= AtomicCommitFlags::TEST_ONLY;
        }

        self.card
            .atomic_commit(commit_flags, req)
            .map_err(|err| KmsError::new(err.raw_os_error().unwrap_or(libc::EIO)))?;

        if out_fence_fd >= 0 {
            return Ok(Some(unsafe { Fence::from_raw_fd(out_fence_fd) }));
        }
        Ok(None)
    }

    fn wait_vblank(&self, pipe: u32) -> Result<i64, KmsError> {
        let high_crtc = (pipe << DRM_VBLANK_HIGH_CRTC_SHIFT) & DRM_VBLANK_HIGH_CRTC_MASK;
        let mut wait = drm_wait_vblank_request {
            kind: DRM_VBLANK_RELATIVE | high_crtc,
            sequence: 1,
            tval_sec: 0,
            tval_usec: 0,
        };
        let ret = unsafe {
            libc::ioctl(
                self.card.as_fd().as_raw_fd(),
                DRM_IOCTL_WAIT_VBLANK,
                &mut wait,
            )
        };
        if ret != 0 {
            return Err(KmsError::new(
                io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO),
            ));
        }
        Ok(wait.tval_sec as i64 * 1_000_000_000 + wait.tval_usec as i64 * 1_000)
    }

    fn create_framebuffer(&self, request: &FramebufferRequest) -> Result<u32, KmsError> {
        let mut cmd = drm_mode_fb_cmd2 {
            fb_id: 0,
            width: request.width,
            height: request.height,
            pixel_format: request.format.0,
            flags: if request.modifier != 0 {
                DRM_MODE_FB_MODIFIERS
            } else {
                0
            },
            handles: request.gem_handles,
            pitches: request.pitches,
            offsets: request.offsets,
            modifier: [request.modifier; 4],
        };
        let ret = unsafe {
            libc::ioctl(self.card.as_fd().as_raw_fd(), DRM_IOCTL_MODE_ADDFB2, &mut cmd)
        };
        if ret != 0 {
            let errno = io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
            error!(
                "ADDFB2 failed for {} ({}x{}): errno {}",
                request.format.fourcc(),
                request.width,
                request.height,
                errno
            );
            return Err(KmsError::new(errno));
        }
        Ok(cmd.fb_id)
    }

    fn release_framebuffer(&self, fb_id: u32) {
        let mut id = fb_id;
        let ret =
            unsafe { libc::ioctl(self.card.as_fd().as_raw_fd(), DRM_IOCTL_MODE_RMFB, &mut id) };
        if ret != 0 {
            warn!(
                "RMFB for {} failed: {}",
                fb_id,
                io::Error::last_os_error()
            );
        }
    }
}

/// Udev monitor delivering drm-subsystem hotplug events.
pub struct UdevHotplugSource {
    socket: udev::MonitorSocket,
}

impl UdevHotplugSource {
    pub fn new() -> io::Result<UdevHotplugSource> {
        let socket = udev::MonitorBuilder::new()?
            .match_subsystem_devtype("drm", "drm_minor")?
            .listen()?;
        Ok(UdevHotplugSource { socket })
    }
}

impl HotplugSource for UdevHotplugSource {
    fn wait_event(&mut self) -> io::Result<bool> {
        // The monitor socket is non-blocking; park in poll between events.
        let mut pfd = libc::pollfd {
            fd: self.socket.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        loop {
            let ret = unsafe { libc::poll(&mut pfd, 1, -1) };
            if ret > 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }

        let mut hotplug = false;
        for event in self.socket.iter() {
            let is_hotplug = event
                .property_value("HOTPLUG")
                .map(|value| value == "1")
                .unwrap_or(false);
            if is_hotplug {
                debug!("drm hotplug uevent from {:?}", event.sysname());
                hotplug = true;
            }
        }
        Ok(hotplug)
    }
}

// Stable kernel ABI below: struct layouts and ioctl numbers from
// <drm/drm_mode.h> and <drm/drm.h>.

const DRM_MODE_OBJECT_CRTC: u32 = 0xcccc_cccc;
const DRM_MODE_OBJECT_CONNECTOR: u32 = 0xc0c0_c0c0;
const DRM_MODE_OBJECT_PLANE: u32 = 0xeeee_eeee;

const DRM_MODE_FB_MODIFIERS: u32 = 1 << 1;

const DRM_VBLANK_RELATIVE: u32 = 0x1;
const DRM_VBLANK_HIGH_CRTC_SHIFT: u32 = 1;
const DRM_VBLANK_HIGH_CRTC_MASK: u32 = 0x0000_003e;

#[repr(C)]
struct drm_mode_create_blob {
    data: u64,
    length: u32,
    blob_id: u32,
}

#[repr(C)]
struct drm_mode_obj_set_property {
    value: u64,
    prop_id: u32,
    obj_id: u32,
    obj_type: u32,
}

// Overlay of the request/reply union; `signal` (request) aliases
// `tval_sec` (reply) and is unused here.
#[repr(C)]
struct drm_wait_vblank_request {
    kind: u32,
    sequence: u32,
    tval_sec: libc::c_long,
    tval_usec: libc::c_long,
}

#[repr(C)]
struct drm_mode_fb_cmd2 {
    fb_id: u32,
    width: u32,
    height: u32,
    pixel_format: u32,
    flags: u32,
    handles: [u32; 4],
    pitches: [u32; 4],
    offsets: [u32; 4],
    modifier: [u64; 4],
}

// _IOWR('d', nr, size)
const DRM_IOCTL_MODE_CREATEPROPBLOB: libc::c_ulong = 0xc010_64bd;
const DRM_IOCTL_MODE_OBJ_SETPROPERTY: libc::c_ulong = 0xc014_64ba;
const DRM_IOCTL_WAIT_VBLANK: libc::c_ulong = 0xc018_643a;
const DRM_IOCTL_MODE_ADDFB2: libc::c_ulong = 0xc064_64b8;
const DRM_IOCTL_MODE_RMFB: libc::c_ulong = 0xc004_64af;
