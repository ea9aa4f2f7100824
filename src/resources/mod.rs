//! Buffer and GPU-resource lifetime cache
//!
//! Importing a native buffer and deriving its GPU-side state (image, texture,
//! framebuffer id) is expensive, so every display keeps a [`ResourceManager`]
//! that amortizes the cost across frames. The cache is a short history window:
//! buffers referenced this frame sit in the front slot, untouched buffers age
//! toward the back and fall out after [`BUFFER_AGE_LIMIT`] frames.
//!
//! Destruction is never immediate. The hardware may still be scanning out of
//! last frame's buffer, and GPU objects must die on the thread owning their
//! context. Handles therefore travel a two-phase route: a same-direction
//! pending queue filled while compositing, flipped under a lock into "ready"
//! queues once per frame by [`ResourceManager::prepare_purged_resources`],
//! and drained by whichever thread owns the GPU context via
//! [`ResourceManager::get_purged_resources`].

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc;
use std::sync::Arc;

use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::error::{HwcError, HwcResult};
use crate::layer::{BufferKey, NativeBufferDesc};

/// Frames a cache entry may go unreferenced before eviction.
pub const BUFFER_AGE_LIMIT: usize = 4;

/// GPU-side state derived from an imported buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GpuResources {
    /// EGL/VK image handle.
    pub image: u64,
    /// GL texture id.
    pub texture: u32,
    /// GL framebuffer id.
    pub framebuffer: u32,
}

impl GpuResources {
    pub fn is_empty(&self) -> bool {
        self.image == 0 && self.texture == 0 && self.framebuffer == 0
    }
}

/// Plain descriptor queued for deferred destruction of GL-style resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceHandle {
    pub key: BufferKey,
    /// KMS framebuffer object id, 0 if none was created.
    pub fb_id: u32,
    pub gpu: GpuResources,
}

/// Parallel descriptor for media-decoder resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaResourceHandle {
    pub key: BufferKey,
    pub surface: u64,
    pub context: u64,
}

enum PurgeItem {
    Gl(ResourceHandle, bool),
    Media(MediaResourceHandle),
}

/// Cloneable handle for routing resource handles into the pending queue.
///
/// Held by every [`OverlayBuffer`] so a buffer released from *any* owner
/// still funnels its GPU state through the deferred-destruction protocol.
#[derive(Clone)]
pub struct PurgeSender {
    tx: mpsc::Sender<PurgeItem>,
}

impl PurgeSender {
    fn send(&self, item: PurgeItem) {
        // The manager outliving its buffers is the normal case; the inverse
        // happens only during teardown, where the loss is logged by the
        // manager's destructor instead.
        let _ = self.tx.send(item);
    }
}

/// An imported buffer together with the GPU state derived from it.
///
/// Shared by the cache and any in-flight composition that still references
/// the previous frame. Dropping the last reference routes the handles into
/// the owning manager's pending purge queue.
pub struct OverlayBuffer {
    desc: NativeBufferDesc,
    /// KMS framebuffer object id; created lazily on first scanout use.
    fb_id: Mutex<u32>,
    gpu: GpuResources,
    media: Mutex<Option<MediaResourceHandle>>,
    reaper: PurgeSender,
}

impl OverlayBuffer {
    pub fn new(
        desc: NativeBufferDesc,
        fb_id: u32,
        gpu: GpuResources,
        reaper: PurgeSender,
    ) -> Self {
        Self {
            desc,
            fb_id: Mutex::new(fb_id),
            gpu,
            media: Mutex::new(None),
            reaper,
        }
    }

    pub fn with_media(self, media: MediaResourceHandle) -> Self {
        *self.media.lock() = Some(media);
        self
    }

    pub fn desc(&self) -> &NativeBufferDesc {
        &self.desc
    }

    pub fn key(&self) -> BufferKey {
        self.desc.key
    }

    pub fn fb_id(&self) -> u32 {
        *self.fb_id.lock()
    }

    /// Returns the framebuffer id, creating it through `create` on first use.
    pub fn ensure_fb(
        &self,
        create: impl FnOnce() -> crate::error::HwcResult<u32>,
    ) -> crate::error::HwcResult<u32> {
        let mut fb = self.fb_id.lock();
        if *fb == 0 {
            *fb = create()?;
        }
        Ok(*fb)
    }

    pub fn gpu(&self) -> &GpuResources {
        &self.gpu
    }

    fn handle(&self) -> ResourceHandle {
        ResourceHandle {
            key: self.desc.key,
            fb_id: *self.fb_id.lock(),
            gpu: self.gpu,
        }
    }
}

impl Drop for OverlayBuffer {
    fn drop(&mut self) {
        self.reaper
            .send(PurgeItem::Gl(self.handle(), !self.gpu.is_empty()));
        if let Some(media) = self.media.lock().take() {
            self.reaper.send(PurgeItem::Media(media));
        }
    }
}

impl std::fmt::Debug for OverlayBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayBuffer")
            .field("key", &self.desc.key)
            .field("fb_id", &self.fb_id)
            .field("gpu", &self.gpu)
            .finish()
    }
}

/// Import contract supplied by the embedder.
///
/// Must be callable from the present thread. A failed import is not an
/// error for the frame; the caller drops the layer and scans out without it.
pub trait BufferImporter: Send + Sync {
    /// Imports a native buffer and derives its GPU-side state.
    fn import(
        &self,
        desc: &NativeBufferDesc,
        reaper: PurgeSender,
    ) -> HwcResult<Arc<OverlayBuffer>>;

    /// Destroys GL-style resources; called from the GPU-context thread.
    fn release(&self, handle: &ResourceHandle);

    /// Destroys media-decoder resources.
    fn release_media(&self, handle: &MediaResourceHandle);
}

/// Cache hit/miss accounting, mostly for the debug log.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evicted: u64,
}

type BufferMap = HashMap<BufferKey, Arc<OverlayBuffer>>;

struct ReadyQueues {
    gl: Vec<ResourceHandle>,
    media: Vec<MediaResourceHandle>,
    destroy_gpu_resources: bool,
}

/// Per-display buffer cache with deferred destruction.
pub struct ResourceManager {
    /// History window; front map holds buffers referenced this frame.
    cached_buffers: Mutex<VecDeque<BufferMap>>,
    pending_tx: mpsc::Sender<PurgeItem>,
    /// Drained only by the thread that calls `prepare_purged_resources`.
    pending_rx: Mutex<mpsc::Receiver<PurgeItem>>,
    ready: Mutex<ReadyQueues>,
    stats: Mutex<CacheStats>,
}

impl ResourceManager {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        let mut maps = VecDeque::with_capacity(BUFFER_AGE_LIMIT + 1);
        for _ in 0..BUFFER_AGE_LIMIT {
            maps.push_back(BufferMap::new());
        }
        Self {
            cached_buffers: Mutex::new(maps),
            pending_tx: tx,
            pending_rx: Mutex::new(rx),
            ready: Mutex::new(ReadyQueues {
                gl: Vec::new(),
                media: Vec::new(),
                destroy_gpu_resources: false,
            }),
            stats: Mutex::new(CacheStats::default()),
        }
    }

    /// Sender handed to buffers created for this manager.
    pub fn reaper(&self) -> PurgeSender {
        PurgeSender {
            tx: self.pending_tx.clone(),
        }
    }

    /// O(1)-ish lookup across the history window.
    ///
    /// A hit found in an aged slot is re-registered in the front slot, which
    /// is what resets its age.
    pub fn find_cached_buffer(&self, key: BufferKey) -> Option<Arc<OverlayBuffer>> {
        let mut maps = self.cached_buffers.lock();
        let mut found: Option<(usize, Arc<OverlayBuffer>)> = None;
        for (idx, map) in maps.iter().enumerate() {
            if let Some(buffer) = map.get(&key) {
                found = Some((idx, buffer.clone()));
                break;
            }
        }

        let mut stats = self.stats.lock();
        match found {
            Some((idx, buffer)) => {
                stats.hits += 1;
                if idx != 0 {
                    maps[0].insert(key, buffer.clone());
                }
                Some(buffer)
            }
            None => {
                stats.misses += 1;
                None
            }
        }
    }

    /// Inserts a freshly imported buffer into the current frame slot.
    ///
    /// First registration wins for a given key within the live window; a
    /// conflicting re-registration is a caller bug and is only logged.
    pub fn register_buffer(&self, key: BufferKey, buffer: Arc<OverlayBuffer>) {
        let mut maps = self.cached_buffers.lock();
        let front = &mut maps[0];
        match front.entry(key) {
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(buffer);
            }
            std::collections::hash_map::Entry::Occupied(existing) => {
                if !Arc::ptr_eq(existing.get(), &buffer) {
                    warn!(
                        "ignoring re-registration of {:?} with a different buffer object",
                        key
                    );
                }
            }
        }
    }

    /// Queues a GL-style resource for destruction after the next prepare.
    pub fn mark_resource_for_deletion(&self, handle: ResourceHandle, has_gpu_resources: bool) {
        let _ = self
            .pending_tx
            .send(PurgeItem::Gl(handle, has_gpu_resources));
    }

    /// Queues a media resource for destruction after the next prepare.
    pub fn mark_media_resource_for_deletion(&self, handle: MediaResourceHandle) {
        let _ = self.pending_tx.send(PurgeItem::Media(handle));
    }

    /// Ages the cache and flips pending handles into the ready queues.
    ///
    /// Must be called once per frame by the thread that owns composition.
    /// Returns `false` when there was nothing to hand off, letting callers
    /// skip the downstream drain entirely.
    pub fn prepare_purged_resources(&self) -> bool {
        // (a) age the window: new empty slot in front, overflow drops out
        // the back. Dropping an evicted map releases cache references;
        // buffers with no other owner feed the pending queue right here.
        {
            let mut maps = self.cached_buffers.lock();
            maps.push_front(BufferMap::new());
            while maps.len() > BUFFER_AGE_LIMIT {
                if let Some(evicted) = maps.pop_back() {
                    if !evicted.is_empty() {
                        let mut stats = self.stats.lock();
                        stats.evicted += evicted.len() as u64;
                        debug!("aged out {} cache entries", evicted.len());
                    }
                }
            }
        }

        // (b) move everything pending into the cross-thread queues.
        let rx = self.pending_rx.lock();
        let mut drained_any = false;
        let mut ready = self.ready.lock();
        while let Ok(item) = rx.try_recv() {
            drained_any = true;
            match item {
                PurgeItem::Gl(handle, has_gpu) => {
                    ready.gl.push(handle);
                    if has_gpu {
                        ready.destroy_gpu_resources = true;
                    }
                }
                PurgeItem::Media(handle) => ready.media.push(handle),
            }
        }
        drained_any
    }

    /// Hands ownership of the ready-to-destroy handles to the caller.
    ///
    /// Called by the GPU-context-owning thread, which may differ from the
    /// present thread. Resets the gpu-resources flag across the drain.
    pub fn get_purged_resources(
        &self,
    ) -> (Vec<ResourceHandle>, Vec<MediaResourceHandle>, bool) {
        let mut ready = self.ready.lock();
        let gl = std::mem::take(&mut ready.gl);
        let media = std::mem::take(&mut ready.media);
        let has_gpu = ready.destroy_gpu_resources;
        ready.destroy_gpu_resources = false;
        (gl, media, has_gpu)
    }

    /// Hard flush: empties the live cache immediately.
    ///
    /// Used at shutdown and on DRM-master loss. Everything still flows
    /// through the normal pending/ready handoff so context-affinity rules
    /// hold even for the flush.
    pub fn purge_all(&self) {
        {
            let mut maps = self.cached_buffers.lock();
            for map in maps.iter_mut() {
                map.clear();
            }
        }
        self.prepare_purged_resources();
    }

    pub fn stats(&self) -> CacheStats {
        *self.stats.lock()
    }

    /// Number of live cached buffers across the whole window.
    pub fn cached_count(&self) -> usize {
        let maps = self.cached_buffers.lock();
        let mut seen = std::collections::HashSet::new();
        for map in maps.iter() {
            for key in map.keys() {
                seen.insert(*key);
            }
        }
        seen.len()
    }

    /// Destroys GL and media handles through the importer.
    ///
    /// Convenience for embedders whose GPU context lives on the present
    /// thread; drains the ready queues and releases each handle.
    pub fn destroy_purged_resources(&self, importer: &dyn BufferImporter) {
        let (gl, media, _has_gpu) = self.get_purged_resources();
        for handle in &gl {
            importer.release(handle);
        }
        for handle in &media {
            importer.release_media(handle);
        }
        if !gl.is_empty() || !media.is_empty() {
            debug!(
                "destroyed {} gl / {} media purged resources",
                gl.len(),
                media.len()
            );
        }
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        // A populated cache at teardown is a leak indicator, not a reason
        // to take the display pipeline down mid-scanout.
        let live = self.cached_count();
        if live != 0 {
            error!("resource manager destroyed with {} live native buffers", live);
        }
        let ready = self.ready.lock();
        if !ready.gl.is_empty() || !ready.media.is_empty() {
            error!(
                "resource manager destroyed with {} gl / {} media undrained purge handles",
                ready.gl.len(),
                ready.media.len()
            );
        }
    }
}

/// Dummy importer for pipelines that never touch real GPU state.
pub struct NullImporter;

impl BufferImporter for NullImporter {
    fn import(
        &self,
        desc: &NativeBufferDesc,
        reaper: PurgeSender,
    ) -> HwcResult<Arc<OverlayBuffer>> {
        if desc.width == 0 || desc.height == 0 {
            return Err(HwcError::ImportFailed { key: desc.key });
        }
        Ok(Arc::new(OverlayBuffer::new(
            desc.clone(),
            0,
            GpuResources::default(),
            reaper,
        )))
    }

    fn release(&self, _handle: &ResourceHandle) {}

    fn release_media(&self, _handle: &MediaResourceHandle) {}
}
