//! Per-frame layer descriptors
//!
//! A [`Layer`] describes one rectangle of pixels the caller wants on screen
//! this frame: which buffer to scan out, where it sits on the display, how to
//! blend it and which fence gates the read. Layers are transient; the caller
//! rebuilds and resubmits the full list on every present.

use crate::sync::Fence;

/// Pixel format as a DRM fourcc code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelFormat(pub u32);

impl PixelFormat {
    pub const XRGB8888: PixelFormat = PixelFormat::from_chars(b"XR24");
    pub const ARGB8888: PixelFormat = PixelFormat::from_chars(b"AR24");
    pub const XBGR8888: PixelFormat = PixelFormat::from_chars(b"XB24");
    pub const NV12: PixelFormat = PixelFormat::from_chars(b"NV12");

    const fn from_chars(c: &[u8; 4]) -> PixelFormat {
        PixelFormat(
            c[0] as u32 | (c[1] as u32) << 8 | (c[2] as u32) << 16 | (c[3] as u32) << 24,
        )
    }

    /// Decodes the fourcc into its four-character form for log output.
    pub fn fourcc(&self) -> String {
        let b = self.0.to_le_bytes();
        b.iter()
            .map(|&c| {
                if c.is_ascii_graphic() || c == b' ' {
                    c as char
                } else {
                    '?'
                }
            })
            .collect()
    }
}

/// Stable identity of an external buffer across frames.
///
/// Two submissions naming the same key are promises that the underlying
/// native buffer is the same allocation, which is what lets the resource
/// cache reuse the imported GPU state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferKey(pub u64);

/// Everything the import path needs to know about a native buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeBufferDesc {
    pub key: BufferKey,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub modifier: u64,
    pub gem_handles: [u32; 4],
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
}

impl NativeBufferDesc {
    /// Minimal descriptor for a linear single-plane buffer.
    pub fn linear(key: BufferKey, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            key,
            width,
            height,
            format,
            modifier: 0,
            gem_handles: [0; 4],
            pitches: [width * 4, 0, 0, 0],
            offsets: [0; 4],
        }
    }
}

/// Axis-aligned rectangle, edges in the coordinate space of its user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect<T> {
    pub left: T,
    pub top: T,
    pub right: T,
    pub bottom: T,
}

impl<T: Copy + core::ops::Sub<Output = T> + core::ops::Add<Output = T> + PartialOrd> Rect<T> {
    pub fn new(left: T, top: T, right: T, bottom: T) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> T {
        self.right - self.left
    }

    pub fn height(&self) -> T {
        self.bottom - self.top
    }

    /// Shifts the rectangle by (dx, dy).
    pub fn translated(&self, dx: T, dy: T) -> Self {
        Self {
            left: self.left + dx,
            top: self.top + dy,
            right: self.right + dx,
            bottom: self.bottom + dy,
        }
    }

    /// True when the rectangles share any area.
    pub fn overlaps(&self, other: &Rect<T>) -> bool {
        !(self.right <= other.left
            || other.right <= self.left
            || self.bottom <= other.top
            || other.bottom <= self.top)
    }
}

/// Display-space transform applied by the scanout hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transform {
    #[default]
    Identity,
    Rotate90,
    Rotate180,
    Rotate270,
    FlipHorizontal,
    FlipVertical,
}

impl Transform {
    /// Recomputes a display frame for a rotated output of `width`x`height`.
    ///
    /// Used right before property writes when a whole-display rotation is
    /// pending: the layer's frame was produced in the unrotated space.
    pub fn apply_to_frame(&self, rect: Rect<i32>, width: i32, height: i32) -> Rect<i32> {
        match self {
            Transform::Identity | Transform::FlipHorizontal | Transform::FlipVertical => rect,
            Transform::Rotate90 => Rect::new(
                rect.top,
                width - rect.right,
                rect.bottom,
                width - rect.left,
            ),
            Transform::Rotate180 => Rect::new(
                width - rect.right,
                height - rect.bottom,
                width - rect.left,
                height - rect.top,
            ),
            Transform::Rotate270 => Rect::new(
                height - rect.bottom,
                rect.left,
                height - rect.top,
                rect.right,
            ),
        }
    }
}

/// Per-layer alpha blending mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Blending {
    /// Source pixels replace destination.
    #[default]
    None,
    /// Source color channels are already multiplied by alpha.
    Premultiplied,
    /// Blend with straight alpha.
    Coverage,
}

/// CTA-861-G static HDR metadata carried by a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HdrMetadata {
    pub eotf: u8,
    pub primaries: [(u16, u16); 3],
    pub white_point: (u16, u16),
    pub max_luminance: u16,
    pub min_luminance: u16,
    pub max_cll: u16,
    pub max_fall: u16,
}

impl HdrMetadata {
    /// Per-component minimum of two metadata blocks.
    ///
    /// The merged block is what gets committed for the whole frame: the
    /// lowest common luminance envelope is always safe for the panel's tone
    /// mapping, whichever layer ends up dominating the scene.
    pub fn min_merge(&self, other: &HdrMetadata) -> HdrMetadata {
        let min_pair = |a: (u16, u16), b: (u16, u16)| (a.0.min(b.0), a.1.min(b.1));
        HdrMetadata {
            eotf: self.eotf.min(other.eotf),
            primaries: [
                min_pair(self.primaries[0], other.primaries[0]),
                min_pair(self.primaries[1], other.primaries[1]),
                min_pair(self.primaries[2], other.primaries[2]),
            ],
            white_point: min_pair(self.white_point, other.white_point),
            max_luminance: self.max_luminance.min(other.max_luminance),
            min_luminance: self.min_luminance.min(other.min_luminance),
            max_cll: self.max_cll.min(other.max_cll),
            max_fall: self.max_fall.min(other.max_fall),
        }
    }

    /// Serializes into the kernel's `hdr_output_metadata` blob layout.
    pub fn to_blob_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        // metadata_type 1 (static), then the infoframe payload
        out.extend_from_slice(&1u32.to_le_bytes());
        out.push(self.eotf);
        out.push(1); // static metadata descriptor id
        for &(x, y) in &self.primaries {
            out.extend_from_slice(&x.to_le_bytes());
            out.extend_from_slice(&y.to_le_bytes());
        }
        out.extend_from_slice(&self.white_point.0.to_le_bytes());
        out.extend_from_slice(&self.white_point.1.to_le_bytes());
        out.extend_from_slice(&self.max_luminance.to_le_bytes());
        out.extend_from_slice(&self.min_luminance.to_le_bytes());
        out.extend_from_slice(&self.max_cll.to_le_bytes());
        out.extend_from_slice(&self.max_fall.to_le_bytes());
        out
    }
}

/// One presentable rectangle, valid for a single present call.
#[derive(Debug)]
pub struct Layer {
    /// The native buffer to scan out.
    pub buffer: NativeBufferDesc,
    /// Signaled when the producer is done writing `buffer`.
    pub acquire_fence: Option<Fence>,
    /// Plane-wide alpha, 0.0..=1.0.
    pub alpha: f32,
    pub blending: Blending,
    pub transform: Transform,
    /// Region of the buffer to sample, in buffer pixels.
    pub source_crop: Rect<f32>,
    /// Where the crop lands on the display.
    pub display_frame: Rect<i32>,
    /// Cursor layers composite above everything else.
    pub cursor: bool,
    pub hdr_metadata: Option<HdrMetadata>,
}

impl Layer {
    /// A full-buffer, opaque layer at `frame`.
    pub fn new(buffer: NativeBufferDesc, frame: Rect<i32>) -> Self {
        let crop = Rect::new(0.0, 0.0, buffer.width as f32, buffer.height as f32);
        Self {
            buffer,
            acquire_fence: None,
            alpha: 1.0,
            blending: Blending::None,
            transform: Transform::Identity,
            source_crop: crop,
            display_frame: frame,
            cursor: false,
            hdr_metadata: None,
        }
    }

    pub fn is_cursor(&self) -> bool {
        self.cursor
    }

    /// Copy of the layer with its own duplicated acquire fence.
    ///
    /// Needed when one submitted layer fans out to several displays; each
    /// sink consumes a fence of its own. A failed dup degrades to an
    /// unfenced copy.
    pub fn duplicate(&self) -> Layer {
        Layer {
            buffer: self.buffer.clone(),
            acquire_fence: self
                .acquire_fence
                .as_ref()
                .and_then(|fence| fence.dup().ok()),
            alpha: self.alpha,
            blending: self.blending,
            transform: self.transform,
            source_crop: self.source_crop,
            display_frame: self.display_frame,
            cursor: self.cursor,
            hdr_metadata: self.hdr_metadata,
        }
    }
}
