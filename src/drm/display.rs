//! Physical display over the kernel modesetting interface
//!
//! A `DrmDisplay` is one CRTC plus whatever connector is currently wired to
//! it. Identity is stable for the service lifetime; hotplug flips the
//! connection state without destroying the object. The per-frame commit
//! sequencing lives here and its order is a correctness requirement, not
//! style: reclaim released planes, then modeset state (mode blob + HDR
//! metadata), or an out-fence request, then plane property writes, then one
//! atomic commit.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::display::{
    ContentProtection, DisplayAttribute, DisplayType, HotplugCallback, NativeDisplay, PowerMode,
    PresentStatus, RefreshCallback, VsyncCallback,
};
use crate::drm::device::{
    AtomicRequest, BlobId, CommitFlags, FramebufferRequest, KmsConnector, KmsDevice, ObjectId,
    ObjectKind, PlaneKind, PropertyId,
};
use crate::drm::plane::DrmPlane;
use crate::drm::vsync::VsyncWorker;
use crate::error::{HwcError, HwcResult};
use crate::layer::{HdrMetadata, Layer, PixelFormat, Transform};
use crate::resources::{BufferImporter, OverlayBuffer, ResourceManager};
use crate::sync::Fence;

const UM_PER_INCH: i64 = 25400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Disconnected,
    Connected,
    DisconnectionInProgress,
}

#[derive(Default)]
struct ConnectorProps {
    crtc_id: PropertyId,
    dpms: PropertyId,
    hdcp: PropertyId,
    broadcast_rgb: PropertyId,
    hdr_metadata: PropertyId,
    broadcast_full: u64,
    broadcast_automatic: u64,
}

#[derive(Default)]
struct CrtcProps {
    active: PropertyId,
    mode_id: PropertyId,
    out_fence_ptr: PropertyId,
}

struct DrmState {
    connector: ObjectId,
    connection: ConnectionState,
    power_mode: PowerMode,
    modes: Vec<crate::display::DisplayMode>,
    config: u32,
    width: u32,
    height: u32,
    mm_width: u32,
    mm_height: u32,
    needs_modeset: bool,
    commit_flags: CommitFlags,
    mode_blob: BlobId,
    old_mode_blob: BlobId,
    hdr_blob: BlobId,
    pending_rotation: Transform,
    explicit_sync: bool,
    planes: Vec<DrmPlane>,
    /// Plane-id/format signature of the last TEST_ONLY-validated frame.
    validated_signature: Vec<(ObjectId, u32)>,
    previous_retire_fence: Option<Fence>,
    importer: Option<Arc<dyn BufferImporter>>,
    connector_props: ConnectorProps,
    crtc_props: CrtcProps,
    hotplug_callback: Option<(HotplugCallback, u32)>,
    refresh_callback: Option<(RefreshCallback, u32)>,
    desired_protection: ContentProtection,
    current_protection: ContentProtection,
    frames: u64,
}

struct Assignment {
    plane_index: usize,
    layer: Layer,
    fb_id: u32,
    // Held so the imported state outlives the commit even if the cache
    // evicts the entry mid-frame.
    _buffer: Arc<OverlayBuffer>,
}

pub struct DrmDisplay {
    kms: Arc<dyn KmsDevice>,
    pipe: u32,
    crtc_id: ObjectId,
    resources: ResourceManager,
    vsync: VsyncWorker,
    state: Mutex<DrmState>,
}

impl DrmDisplay {
    pub fn new(kms: Arc<dyn KmsDevice>, pipe: u32, crtc_id: ObjectId) -> Self {
        let crtc_prop = |name: &'static str| -> PropertyId {
            match kms.find_property(ObjectKind::Crtc, crtc_id, name) {
                Some((id, _)) => id,
                None => {
                    error!("could not find crtc property {}", name);
                    0
                }
            }
        };
        let crtc_props = CrtcProps {
            active: crtc_prop("ACTIVE"),
            mode_id: crtc_prop("MODE_ID"),
            out_fence_ptr: crtc_prop("OUT_FENCE_PTR"),
        };

        Self {
            vsync: VsyncWorker::new(kms.clone(), pipe),
            kms,
            pipe,
            crtc_id,
            resources: ResourceManager::new(),
            state: Mutex::new(DrmState {
                connector: 0,
                connection: ConnectionState::Disconnected,
                power_mode: PowerMode::On,
                modes: Vec::new(),
                config: 0,
                width: 0,
                height: 0,
                mm_width: 0,
                mm_height: 0,
                needs_modeset: false,
                commit_flags: CommitFlags::ALLOW_MODESET,
                mode_blob: 0,
                old_mode_blob: 0,
                hdr_blob: 0,
                pending_rotation: Transform::Identity,
                explicit_sync: true,
                planes: Vec::new(),
                validated_signature: Vec::new(),
                previous_retire_fence: None,
                importer: None,
                connector_props: ConnectorProps::default(),
                crtc_props,
                hotplug_callback: None,
                refresh_callback: None,
                desired_protection: ContentProtection::Unsupported,
                current_protection: ContentProtection::Unsupported,
                frames: 0,
            }),
        }
    }

    /// Frames committed since startup.
    pub fn frames_presented(&self) -> u64 {
        self.state.lock().frames
    }

    /// Queues a whole-display rotation; resolved against the logical
    /// width/height at the next commit.
    pub fn rotate_display(&self, rotation: Transform) {
        self.state.lock().pending_rotation = rotation;
    }

    pub fn pipe(&self) -> u32 {
        self.pipe
    }

    pub fn crtc_id(&self) -> ObjectId {
        self.crtc_id
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    /// Populates the plane set and wires the buffer importer.
    pub fn initialize(&self, importer: Arc<dyn BufferImporter>) -> HwcResult<()> {
        let mut planes = Vec::new();
        let mut cursor_planes = Vec::new();
        for info in self.kms.planes() {
            if info.possible_crtcs & (1 << self.pipe) == 0 {
                continue;
            }
            match DrmPlane::from_kms(self.kms.as_ref(), &info) {
                Ok(plane) => {
                    if plane.kind() == PlaneKind::Cursor {
                        cursor_planes.push(plane);
                    } else {
                        planes.push(plane);
                    }
                }
                Err(err) => warn!("skipping plane {}: {}", info.id, err),
            }
        }
        if planes.is_empty() {
            error!("no usable primary plane for crtc {}", self.crtc_id);
            return Err(HwcError::NoPlanes);
        }
        planes.sort_by_key(|plane| plane.id());
        // Cursor content composites last, so its plane goes last too.
        planes.extend(cursor_planes);

        let mut state = self.state.lock();
        state.planes = planes;
        state.importer = Some(importer);
        Ok(())
    }

    /// Connects this display to `connector`, idempotently.
    ///
    /// Reasserting an already-connected connector is a hotplug race, not an
    /// error: attributes are left untouched.
    pub fn connect_display(&self, connector: &KmsConnector, config: u32) -> bool {
        let mut state = self.state.lock();
        if state.connector == connector.id && state.connector != 0 {
            debug!(
                "display {} already bound to connector {}; reasserting",
                self.crtc_id, connector.id
            );
            state.connection = ConnectionState::Connected;
            return true;
        }

        info!(
            "connecting crtc {} to connector {} ({} modes)",
            self.crtc_id,
            connector.id,
            connector.modes.len()
        );
        state.connector = connector.id;
        state.mm_width = connector.mm_width;
        state.mm_height = connector.mm_height;
        state.modes = connector.modes.clone();
        state.config = config;
        if let Some(mode) = state.modes.get(config as usize) {
            let (hdisplay, vdisplay) = (mode.hdisplay, mode.vdisplay);
            state.width = hdisplay;
            state.height = vdisplay;
        }

        let connector_prop = |name: &'static str| -> PropertyId {
            match self
                .kms
                .find_property(ObjectKind::Connector, connector.id, name)
            {
                Some((id, _)) => id,
                None => {
                    // Absent optional properties degrade the related
                    // feature, never the display.
                    warn!("connector {} lacks property '{}'", connector.id, name);
                    0
                }
            }
        };
        state.connector_props = ConnectorProps {
            crtc_id: connector_prop("CRTC_ID"),
            dpms: connector_prop("DPMS"),
            hdcp: connector_prop("Content Protection"),
            broadcast_rgb: connector_prop("Broadcast RGB"),
            hdr_metadata: connector_prop("HDR_OUTPUT_METADATA"),
            broadcast_full: 0,
            broadcast_automatic: 0,
        };

        state.connection = ConnectionState::Connected;
        state.needs_modeset = true;
        state.commit_flags = CommitFlags::ALLOW_MODESET;

        let desired = state.desired_protection;
        let power = state.power_mode;
        drop(state);

        if desired != ContentProtection::Unsupported {
            self.set_hdcp_state(desired);
        }
        if power == PowerMode::On {
            self.power_on();
        }
        true
    }

    /// Hotplug processing starts by assuming every display will vanish.
    pub fn mark_for_disconnect(&self) {
        let mut state = self.state.lock();
        if state.connection == ConnectionState::Connected {
            state.connection = ConnectionState::DisconnectionInProgress;
        }
    }

    /// Finalizes a disconnect left pending by `mark_for_disconnect`.
    pub fn disconnect(&self) {
        let mut state = self.state.lock();
        if state.connection != ConnectionState::DisconnectionInProgress {
            return;
        }
        info!("disconnecting crtc {}", self.crtc_id);
        state.connection = ConnectionState::Disconnected;
        let mut request = AtomicRequest::new();
        for plane in state.planes.iter_mut() {
            if plane.in_use() {
                plane.disable(&mut request);
            }
        }
        drop(state);
        if !request.is_empty() {
            if let Err(err) = self.kms.atomic_commit(&request, CommitFlags::NONE) {
                warn!("plane teardown on disconnect failed: {}", err);
            }
        }
        self.vsync.suspend();
    }

    pub fn notify_client_of_connection_state(&self) {
        let (callback, connected) = {
            let state = self.state.lock();
            (
                state.hotplug_callback.clone(),
                state.connection == ConnectionState::Connected,
            )
        };
        if let Some((callback, display_id)) = callback {
            callback(display_id, connected);
        }
    }

    /// Asks the client to submit a fresh frame, e.g. after reconnect.
    pub fn force_refresh(&self) {
        let callback = self.state.lock().refresh_callback.clone();
        if let Some((callback, display_id)) = callback {
            callback(display_id);
        }
    }

    fn power_on(&self) {
        let mut state = self.state.lock();
        state.commit_flags = CommitFlags::ALLOW_MODESET;
        let (dpms, connector) = (state.connector_props.dpms, state.connector);
        drop(state);
        if dpms != 0 {
            // DRM_MODE_DPMS_ON
            let _ = self
                .kms
                .set_object_property(ObjectKind::Connector, connector, dpms, 0);
        }
        self.vsync.start();
    }

    fn power_off(&self) {
        let state = self.state.lock();
        let (dpms, connector) = (state.connector_props.dpms, state.connector);
        drop(state);
        if dpms != 0 {
            // DRM_MODE_DPMS_OFF
            let _ = self
                .kms
                .set_object_property(ObjectKind::Connector, connector, dpms, 3);
        }
        self.vsync.suspend();
    }

    pub fn set_broadcast_rgb(&self, range: &str) -> bool {
        let state = self.state.lock();
        let props = &state.connector_props;
        let value = match range {
            "Full" => props.broadcast_full,
            "Automatic" => props.broadcast_automatic,
            other => {
                error!("unknown broadcast RGB range '{}'", other);
                return false;
            }
        };
        if props.broadcast_rgb == 0 {
            return false;
        }
        self.kms
            .set_object_property(
                ObjectKind::Connector,
                state.connector,
                props.broadcast_rgb,
                value,
            )
            .is_ok()
    }

    /// Releases every cached buffer, e.g. on DRM-master loss.
    pub fn release_all_resources(&self) {
        self.resources.purge_all();
        self.flush_purged_resources();
    }

    /// Drains the ready-to-destroy queues on this thread.
    ///
    /// The present thread owns the GPU context in this service, so the
    /// post-commit flush happens right here.
    fn flush_purged_resources(&self) {
        let importer = self.state.lock().importer.clone();
        let Some(importer) = importer else { return };
        let (gl, media, _has_gpu) = self.resources.get_purged_resources();
        for handle in &gl {
            if handle.fb_id != 0 {
                self.kms.release_framebuffer(handle.fb_id);
            }
            importer.release(handle);
        }
        for handle in &media {
            importer.release_media(handle);
        }
    }

    /// Resolves a layer's buffer through the cache, importing on miss.
    fn resolve_buffer(
        &self,
        importer: &Arc<dyn BufferImporter>,
        layer: &Layer,
    ) -> Option<(Arc<OverlayBuffer>, u32)> {
        let key = layer.buffer.key;
        let buffer = match self.resources.find_cached_buffer(key) {
            Some(buffer) => buffer,
            None => match importer.import(&layer.buffer, self.resources.reaper()) {
                Ok(buffer) => {
                    self.resources.register_buffer(key, buffer.clone());
                    buffer
                }
                Err(err) => {
                    // Best-effort degrade: scanning out without this layer
                    // beats blocking video output.
                    warn!("dropping layer, buffer import failed: {}", err);
                    return None;
                }
            },
        };

        let desc = buffer.desc().clone();
        let fb = buffer.ensure_fb(|| {
            self.kms
                .create_framebuffer(&FramebufferRequest {
                    width: desc.width,
                    height: desc.height,
                    format: desc.format,
                    modifier: desc.modifier,
                    gem_handles: desc.gem_handles,
                    pitches: desc.pitches,
                    offsets: desc.offsets,
                })
                .map_err(|err| {
                    error!(
                        "framebuffer creation failed for format {}: {}",
                        desc.format.fourcc(),
                        err
                    );
                    HwcError::FramebufferFailed {
                        fourcc: desc.format.fourcc(),
                        errno: err.errno,
                    }
                })
        });
        match fb {
            Ok(fb_id) => Some((buffer, fb_id)),
            Err(_) => None,
        }
    }

    /// Greedy layer-to-plane assignment in z-order; cursor content goes to
    /// the cursor plane. Layers that fit no plane are dropped for the frame.
    fn allocate_planes(&self, state: &DrmState, layers: Vec<Layer>) -> Vec<(usize, Layer)> {
        let cursor_index = state
            .planes
            .iter()
            .position(|plane| plane.kind() == PlaneKind::Cursor);
        let mut next_overlay = 0usize;
        let mut cursor_taken = false;
        let mut dropped = 0usize;
        let mut assigned = Vec::new();

        for layer in layers {
            let slot = if layer.is_cursor() && cursor_index.is_some() && !cursor_taken {
                cursor_taken = true;
                cursor_index
            } else {
                let mut found = None;
                while next_overlay < state.planes.len() {
                    let idx = next_overlay;
                    next_overlay += 1;
                    if Some(idx) == cursor_index {
                        continue;
                    }
                    if state.planes[idx].supports_format(layer.buffer.format) {
                        found = Some(idx);
                        break;
                    }
                }
                found
            };

            match slot {
                Some(index) => assigned.push((index, layer)),
                None => dropped += 1,
            }
        }

        if dropped > 0 {
            warn!(
                "composition exceeded plane capacity; dropped {} layers",
                dropped
            );
        }
        assigned
    }

    /// Validates a new plane/format combination with a TEST_ONLY commit.
    fn validate_assignment(&self, state: &mut DrmState, assignments: &[Assignment]) -> bool {
        let signature: Vec<(ObjectId, u32)> = assignments
            .iter()
            .map(|a| (state.planes[a.plane_index].id(), a.layer.buffer.format.0))
            .collect();
        if signature == state.validated_signature {
            return true;
        }

        let mut request = AtomicRequest::new();
        for assignment in assignments {
            state.planes[assignment.plane_index].write_properties(
                &mut request,
                self.crtc_id,
                &assignment.layer,
                assignment.fb_id,
            );
        }
        match self
            .kms
            .atomic_commit(&request, CommitFlags::TEST_ONLY)
        {
            Ok(_) => {
                state.validated_signature = signature;
                true
            }
            Err(err) => {
                debug!("test commit rejected composition: {}", err);
                false
            }
        }
    }

    /// Writes the modeset group: mode blob, connector routing, active flag,
    /// and the frame's accumulated HDR metadata.
    fn apply_pending_modeset(
        &self,
        state: &mut DrmState,
        request: &mut AtomicRequest,
        hdr: Option<HdrMetadata>,
    ) -> HwcResult<()> {
        if state.old_mode_blob != 0 {
            self.kms.destroy_property_blob(state.old_mode_blob);
            state.old_mode_blob = 0;
        }

        let mode = state
            .modes
            .get(state.config as usize)
            .copied()
            .ok_or(HwcError::NotInitialized)?;
        let blob = self.kms.create_mode_blob(&mode);
        if blob == 0 {
            error!("mode blob allocation failed");
            return Err(HwcError::BlobAllocation);
        }

        request.add_property(
            ObjectKind::Crtc,
            self.crtc_id,
            state.crtc_props.mode_id,
            blob as u64,
        );
        request.add_property(
            ObjectKind::Connector,
            state.connector,
            state.connector_props.crtc_id,
            self.crtc_id as u64,
        );
        request.add_property(ObjectKind::Crtc, self.crtc_id, state.crtc_props.active, 1);

        // HDR metadata rides the modeset group: the kernel rejects blob
        // property changes that are inconsistent with the routing above.
        if let Some(metadata) = hdr {
            if state.connector_props.hdr_metadata != 0 {
                let hdr_blob = self.kms.create_property_blob(&metadata.to_blob_bytes());
                if hdr_blob == 0 {
                    // Degraded tone mapping, not a lost frame.
                    error!("HDR metadata blob allocation failed");
                } else {
                    if state.hdr_blob != 0 {
                        self.kms.destroy_property_blob(state.hdr_blob);
                    }
                    state.hdr_blob = hdr_blob;
                    request.add_property(
                        ObjectKind::Connector,
                        state.connector,
                        state.connector_props.hdr_metadata,
                        hdr_blob as u64,
                    );
                }
            }
        }

        state.old_mode_blob = state.mode_blob;
        state.mode_blob = blob;
        Ok(())
    }
}

impl NativeDisplay for DrmDisplay {
    fn display_type(&self) -> DisplayType {
        DisplayType::Physical
    }

    fn width(&self) -> u32 {
        self.state.lock().width
    }

    fn height(&self) -> u32 {
        self.state.lock().height
    }

    fn display_name(&self) -> String {
        let state = self.state.lock();
        if state.connector == 0 {
            format!("Pipe-{}", self.pipe)
        } else {
            format!("Display-{}", state.connector)
        }
    }

    fn display_configs(&self) -> Vec<u32> {
        let state = self.state.lock();
        if state.modes.is_empty() {
            vec![0]
        } else {
            (0..state.modes.len() as u32).collect()
        }
    }

    fn display_attribute(&self, config: u32, attribute: DisplayAttribute) -> Option<i32> {
        let state = self.state.lock();
        let mode = state.modes.get(config as usize)?;
        match attribute {
            DisplayAttribute::Width => Some(mode.hdisplay as i32),
            DisplayAttribute::Height => Some(mode.vdisplay as i32),
            DisplayAttribute::RefreshRate => Some(mode.refresh_period_ns()),
            DisplayAttribute::DpiX => Some(if state.mm_width != 0 {
                ((mode.hdisplay as i64 * UM_PER_INCH) / state.mm_width as i64) as i32
            } else {
                -1
            }),
            DisplayAttribute::DpiY => Some(if state.mm_height != 0 {
                ((mode.vdisplay as i64 * UM_PER_INCH) / state.mm_height as i64) as i32
            } else {
                -1
            }),
        }
    }

    fn active_config(&self) -> u32 {
        self.state.lock().config
    }

    fn set_active_config(&self, config: u32) -> bool {
        let mut state = self.state.lock();
        if config as usize >= state.modes.len() {
            return false;
        }
        state.config = config;
        let mode = state.modes[config as usize];
        state.width = mode.hdisplay;
        state.height = mode.vdisplay;
        state.needs_modeset = true;
        state.commit_flags = CommitFlags::ALLOW_MODESET;
        true
    }

    fn power_mode(&self) -> PowerMode {
        self.state.lock().power_mode
    }

    fn set_power_mode(&self, mode: PowerMode) -> bool {
        {
            let mut state = self.state.lock();
            if state.power_mode == mode {
                return true;
            }
            state.power_mode = mode;
            if state.connection != ConnectionState::Connected {
                // Applied when the connector comes back.
                return true;
            }
        }
        match mode {
            PowerMode::On => self.power_on(),
            _ => self.power_off(),
        }
        true
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connection == ConnectionState::Connected
    }

    fn present(&self, layers: Vec<Layer>, _constrained: bool) -> HwcResult<PresentStatus> {
        let mut state = self.state.lock();
        if state.connection != ConnectionState::Connected {
            warn!("present on disconnected display {}; frame dropped", self.crtc_id);
            return Ok(PresentStatus::Presented { retire_fence: None });
        }
        if state.power_mode != PowerMode::On {
            return Ok(PresentStatus::Presented { retire_fence: None });
        }
        let importer = state.importer.clone().ok_or(HwcError::NotInitialized)?;

        // Assign layers to planes, resolving buffers as we go.
        let raw_assignments = self.allocate_planes(&state, layers);
        let mut assignments = Vec::with_capacity(raw_assignments.len());
        let mut hdr: Option<HdrMetadata> = None;
        for (plane_index, mut layer) in raw_assignments {
            let Some((buffer, fb_id)) = self.resolve_buffer(&importer, &layer) else {
                continue;
            };
            if let Some(metadata) = layer.hdr_metadata {
                // Conservative merge: the per-component minimum is always
                // hardware-safe.
                hdr = Some(match hdr {
                    Some(acc) => acc.min_merge(&metadata),
                    None => metadata,
                });
            }
            if state.pending_rotation != Transform::Identity {
                layer.display_frame = state.pending_rotation.apply_to_frame(
                    layer.display_frame,
                    state.width as i32,
                    state.height as i32,
                );
            }
            assignments.push(Assignment {
                plane_index,
                layer,
                fb_id,
                _buffer: buffer,
            });
        }

        if !self.validate_assignment(&mut state, &assignments) {
            if assignments.len() > 1 {
                warn!("multi-plane composition rejected; falling back to bottom layer");
                assignments.truncate(1);
                if !self.validate_assignment(&mut state, &assignments) {
                    return Err(HwcError::CommitFailed { errno: libc::EINVAL });
                }
            } else {
                return Err(HwcError::CommitFailed { errno: libc::EINVAL });
            }
        }

        let mut request = AtomicRequest::new();

        // 1. Reclaim planes released since the last commit before anything
        //    reassigns them; transient double-scanout is not recoverable.
        let used: HashSet<usize> = assignments.iter().map(|a| a.plane_index).collect();
        for index in 0..state.planes.len() {
            if state.planes[index].in_use() && !used.contains(&index) {
                state.planes[index].disable(&mut request);
            }
        }

        // 2/3. Modeset group, or an out-fence request on steady-state frames.
        if state.needs_modeset {
            self.apply_pending_modeset(&mut state, &mut request, hdr)?;
        } else if state.explicit_sync && state.crtc_props.out_fence_ptr != 0 {
            request.request_out_fence(self.crtc_id, state.crtc_props.out_fence_ptr);
        }

        // 4. Full property writes for every plane in the new composition.
        for assignment in &assignments {
            let fence = assignment
                .layer
                .acquire_fence
                .as_ref()
                .and_then(|fence| fence.dup().ok());
            let plane = &mut state.planes[assignment.plane_index];
            plane.set_native_fence(fence);
            plane.write_properties(
                &mut request,
                self.crtc_id,
                &assignment.layer,
                assignment.fb_id,
            );
        }

        // Retire handshake: the previous frame must be off the hardware
        // before its buffers can be reused.
        if let Some(previous) = state.previous_retire_fence.take() {
            if let Err(err) = previous.wait(-1) {
                warn!("previous retire fence wait failed: {}", err);
            }
        }

        let flags = state.commit_flags;
        let commit = self.kms.atomic_commit(&request, flags);
        let retire_fence = match commit {
            Ok(fence) => fence,
            Err(err) => {
                // All-or-nothing by kernel contract: the previous scanout
                // configuration is still live. The caller decides whether
                // to retry with a reduced composition.
                error!("atomic commit failed on crtc {}: {}", self.crtc_id, err);
                return Err(HwcError::CommitFailed { errno: err.errno });
            }
        };

        if state.needs_modeset {
            state.needs_modeset = false;
            if state.explicit_sync {
                state.commit_flags = CommitFlags::NONBLOCK;
            }
        }
        state.pending_rotation = Transform::Identity;
        state.frames += 1;
        state.previous_retire_fence = retire_fence.as_ref().and_then(|fence| fence.dup().ok());
        drop(state);

        // Flush destruction work accumulated during composition.
        if self.resources.prepare_purged_resources() {
            self.flush_purged_resources();
        }

        Ok(PresentStatus::Presented { retire_fence })
    }

    fn register_vsync_callback(&self, callback: VsyncCallback, display_id: u32) {
        self.vsync.register_callback(callback, display_id);
    }

    fn register_refresh_callback(&self, callback: RefreshCallback, display_id: u32) {
        self.state.lock().refresh_callback = Some((callback, display_id));
    }

    fn register_hotplug_callback(&self, callback: HotplugCallback, display_id: u32) {
        let connected = {
            let mut state = self.state.lock();
            state.hotplug_callback = Some((callback.clone(), display_id));
            state.connection == ConnectionState::Connected
        };
        if connected {
            callback(display_id, true);
        }
    }

    fn vsync_control(&self, enabled: bool) {
        self.vsync.set_enabled(enabled);
    }

    fn check_plane_format(&self, format: PixelFormat) -> bool {
        self.state
            .lock()
            .planes
            .iter()
            .any(|plane| plane.supports_format(format))
    }

    fn hotplug_update(&self, _connected: bool) {
        self.notify_client_of_connection_state();
    }

    fn contains_connector(&self, connector_id: u32) -> bool {
        self.state.lock().connector == connector_id
    }

    fn set_explicit_sync(&self, enabled: bool) {
        self.state.lock().explicit_sync = enabled;
    }

    fn set_hdcp_state(&self, protection: ContentProtection) {
        let mut state = self.state.lock();
        state.desired_protection = protection;
        if state.current_protection == protection {
            return;
        }
        if state.connector_props.hdcp == 0 {
            error!("cannot set HDCP state; connector property not supported");
            return;
        }
        if state.connection != ConnectionState::Connected {
            return;
        }
        state.current_protection = protection;
        let value = u64::from(protection == ContentProtection::Desired);
        let (connector, prop) = (state.connector, state.connector_props.hdcp);
        drop(state);
        let _ = self
            .kms
            .set_object_property(ObjectKind::Connector, connector, prop, value);
    }

    fn set_gamma(&self, red: f32, green: f32, blue: f32) {
        debug!(
            "gamma request ({:.2},{:.2},{:.2}) recorded; LUT programming is a color-pipeline concern",
            red, green, blue
        );
    }
}

impl Drop for DrmDisplay {
    fn drop(&mut self) {
        let state = self.state.lock();
        if state.mode_blob != 0 {
            self.kms.destroy_property_blob(state.mode_blob);
        }
        if state.old_mode_blob != 0 {
            self.kms.destroy_property_blob(state.old_mode_blob);
        }
        if state.hdr_blob != 0 {
            self.kms.destroy_property_blob(state.hdr_blob);
        }
    }
}
