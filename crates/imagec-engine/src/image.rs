//! Image planes: 2D pixel matrices with a typed depth.
//!
//! [`ImagePlane`] owns its pixels behind an [`Arc`], so cloning a plane is
//! cheap and several cache slots can share one buffer. Writers call
//! [`ImagePlane::make_mut`], which copies the buffer first when it is
//! shared.
//!
//! Rows are stored contiguously without padding, so the stride is always
//! `width * channels` elements.

use std::sync::Arc;

use image::{GrayImage, ImageBuffer, Luma};

use crate::types::{Dimensions, Rect};

/// Channel depth of a plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Depth {
    U8,
    U16,
    F32,
}

impl Depth {
    /// Size of one element in bytes.
    #[must_use]
    pub const fn element_size(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::F32 => 4,
        }
    }

    /// Largest representable value (`1.0` for float planes).
    #[must_use]
    pub const fn max_value(self) -> f64 {
        match self {
            Self::U8 => 255.0,
            Self::U16 => 65535.0,
            Self::F32 => 1.0,
        }
    }
}

/// Number of interleaved channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channels {
    Gray = 1,
    /// Three interleaved channels in BGR order.
    Bgr = 3,
}

impl Channels {
    #[must_use]
    pub const fn count(self) -> usize {
        self as usize
    }
}

/// Typed pixel storage.
#[derive(Debug, Clone, PartialEq)]
pub enum PixelData {
    U8(Vec<u8>),
    U16(Vec<u16>),
    F32(Vec<f32>),
}

impl PixelData {
    fn zeros(depth: Depth, len: usize) -> Self {
        match depth {
            Depth::U8 => Self::U8(vec![0; len]),
            Depth::U16 => Self::U16(vec![0; len]),
            Depth::F32 => Self::F32(vec![0.0; len]),
        }
    }

    #[must_use]
    pub const fn depth(&self) -> Depth {
        match self {
            Self::U8(_) => Depth::U8,
            Self::U16(_) => Depth::U16,
            Self::F32(_) => Depth::F32,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        match self {
            Self::U8(v) => v.len(),
            Self::U16(v) => v.len(),
            Self::F32(v) => v.len(),
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> f64 {
        match self {
            Self::U8(v) => f64::from(v[index]),
            Self::U16(v) => f64::from(v[index]),
            Self::F32(v) => f64::from(v[index]),
        }
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn set(&mut self, index: usize, value: f64) {
        match self {
            Self::U8(v) => v[index] = value.round().clamp(0.0, 255.0) as u8,
            Self::U16(v) => v[index] = value.round().clamp(0.0, 65535.0) as u16,
            Self::F32(v) => v[index] = value as f32,
        }
    }
}

/// Element types that can back a plane.
pub trait Sample: Copy + Send + Sync + 'static {
    const DEPTH: Depth;
    fn wrap(data: Vec<Self>) -> PixelData;
    fn slice(data: &PixelData) -> Option<&[Self]>;
}

impl Sample for u8 {
    const DEPTH: Depth = Depth::U8;
    fn wrap(data: Vec<Self>) -> PixelData {
        PixelData::U8(data)
    }
    fn slice(data: &PixelData) -> Option<&[Self]> {
        match data {
            PixelData::U8(v) => Some(v),
            _ => None,
        }
    }
}

impl Sample for u16 {
    const DEPTH: Depth = Depth::U16;
    fn wrap(data: Vec<Self>) -> PixelData {
        PixelData::U16(data)
    }
    fn slice(data: &PixelData) -> Option<&[Self]> {
        match data {
            PixelData::U16(v) => Some(v),
            _ => None,
        }
    }
}

impl Sample for f32 {
    const DEPTH: Depth = Depth::F32;
    fn wrap(data: Vec<Self>) -> PixelData {
        PixelData::F32(data)
    }
    fn slice(data: &PixelData) -> Option<&[Self]> {
        match data {
            PixelData::F32(v) => Some(v),
            _ => None,
        }
    }
}

/// Entries in a pseudo-color lookup table, one per 16-bit gray value.
pub const LUT_SIZE: usize = 1 << 16;

/// Lookup table mapping 16-bit gray values to one 8-bit color channel.
///
/// Values at or below `lower` map to 0, values at or above `upper` map to
/// `255 * weight`, and the window in between is scaled linearly. A window
/// with `lower == upper` is a step at that value. `weight` is clamped to
/// `[0, 1]` and the bounds are swapped when given in the wrong order.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
pub fn pseudo_color_lut(weight: f32, lower: u16, upper: u16) -> Vec<u8> {
    let (lower, upper) = if lower <= upper { (lower, upper) } else { (upper, lower) };
    let top = 255.0 * f64::from(weight.clamp(0.0, 1.0));
    let span = f64::from(upper - lower);
    (0..LUT_SIZE)
        .map(|v| {
            let level = match v {
                v if v <= usize::from(lower) && v < usize::from(upper) => 0.0,
                v if v >= usize::from(upper) => 1.0,
                v => (v as f64 - f64::from(lower)) / span,
            };
            (level * top).round() as u8
        })
        .collect()
}

/// Errors from plane construction and conversion.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlaneError {
    #[error("pixel buffer holds {found} elements, expected {expected}")]
    LengthMismatch { expected: usize, found: usize },

    #[error("channel count mismatch: expected {expected}, found {found}")]
    ChannelMismatch { expected: usize, found: usize },

    #[error("dimension mismatch: expected {expected:?}, found {found:?}")]
    DimensionMismatch {
        expected: Dimensions,
        found: Dimensions,
    },
}

/// A 2D pixel matrix with a fixed depth and channel count.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePlane {
    width: u32,
    height: u32,
    channels: Channels,
    data: Arc<PixelData>,
}

/// Borrowed, ephemeral view over foreign pixel storage.
#[derive(Debug, Clone, Copy)]
pub struct PlaneView<'a, T: Sample> {
    width: u32,
    height: u32,
    channels: Channels,
    data: &'a [T],
}

impl<'a, T: Sample> PlaneView<'a, T> {
    /// Wrap a borrowed slice.
    ///
    /// # Errors
    ///
    /// Returns [`PlaneError::LengthMismatch`] if `data` is shorter or
    /// longer than `width * height * channels`.
    pub const fn new(
        width: u32,
        height: u32,
        channels: Channels,
        data: &'a [T],
    ) -> Result<Self, PlaneError> {
        let expected = width as usize * height as usize * channels.count();
        if data.len() != expected {
            return Err(PlaneError::LengthMismatch {
                expected,
                found: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    /// Copy the viewed pixels into an owned plane.
    #[must_use]
    pub fn to_plane(&self) -> ImagePlane {
        ImagePlane {
            width: self.width,
            height: self.height,
            channels: self.channels,
            data: Arc::new(T::wrap(self.data.to_vec())),
        }
    }
}

impl ImagePlane {
    /// Zero-initialized plane.
    #[must_use]
    pub fn zeros(width: u32, height: u32, depth: Depth, channels: Channels) -> Self {
        let len = width as usize * height as usize * channels.count();
        Self {
            width,
            height,
            channels,
            data: Arc::new(PixelData::zeros(depth, len)),
        }
    }

    /// Take ownership of a pixel vector.
    ///
    /// # Errors
    ///
    /// Returns [`PlaneError::LengthMismatch`] if the vector length does not
    /// match the dimensions.
    pub fn from_vec<T: Sample>(
        width: u32,
        height: u32,
        channels: Channels,
        data: Vec<T>,
    ) -> Result<Self, PlaneError> {
        let expected = width as usize * height as usize * channels.count();
        if data.len() != expected {
            return Err(PlaneError::LengthMismatch {
                expected,
                found: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            channels,
            data: Arc::new(T::wrap(data)),
        })
    }

    /// Single-channel plane computed per pixel.
    #[must_use]
    pub fn from_fn_u16(width: u32, height: u32, f: impl Fn(u32, u32) -> u16) -> Self {
        let mut data = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            channels: Channels::Gray,
            data: Arc::new(PixelData::U16(data)),
        }
    }

    /// Wrap an 8-bit grayscale image.
    #[must_use]
    pub fn from_gray8(image: GrayImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            channels: Channels::Gray,
            data: Arc::new(PixelData::U8(image.into_raw())),
        }
    }

    /// Wrap a 16-bit grayscale image.
    #[must_use]
    pub fn from_gray16(image: ImageBuffer<Luma<u16>, Vec<u16>>) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            channels: Channels::Gray,
            data: Arc::new(PixelData::U16(image.into_raw())),
        }
    }

    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub const fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.width, self.height)
    }

    #[must_use]
    pub const fn channels(&self) -> Channels {
        self.channels
    }

    #[must_use]
    pub fn depth(&self) -> Depth {
        self.data.depth()
    }

    /// Elements per row.
    #[must_use]
    pub const fn stride(&self) -> usize {
        self.width as usize * self.channels.count()
    }

    #[must_use]
    pub fn data(&self) -> &PixelData {
        &self.data
    }

    /// Typed slice of the pixels, `None` when `T` does not match the depth.
    #[must_use]
    pub fn as_slice<T: Sample>(&self) -> Option<&[T]> {
        T::slice(&self.data)
    }

    /// Mutable access to the pixels, copying them first if shared.
    pub fn make_mut(&mut self) -> &mut PixelData {
        Arc::make_mut(&mut self.data)
    }

    /// `true` when another plane shares this buffer.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.data) > 1
    }

    /// Value of channel `c` at `(x, y)` as `f64`.
    ///
    /// Callers are responsible for staying in bounds.
    #[must_use]
    pub fn get(&self, x: u32, y: u32, c: usize) -> f64 {
        self.data.get(self.index(x, y, c))
    }

    /// Set channel `c` at `(x, y)`, saturating to the plane's range.
    pub fn set(&mut self, x: u32, y: u32, c: usize, value: f64) {
        let index = self.index(x, y, c);
        self.make_mut().set(index, value);
    }

    const fn index(&self, x: u32, y: u32, c: usize) -> usize {
        y as usize * self.stride() + x as usize * self.channels.count() + c
    }

    /// Gray values as `f32`, unscaled (a U16 pixel of 1000 becomes `1000.0`).
    ///
    /// Three-channel planes are reduced to their mean.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_f32_gray(&self) -> Vec<f32> {
        let ch = self.channels.count();
        let n = self.width as usize * self.height as usize;
        if ch == 1 {
            return match &*self.data {
                PixelData::U8(v) => v.iter().map(|&p| f32::from(p)).collect(),
                PixelData::U16(v) => v.iter().map(|&p| f32::from(p)).collect(),
                PixelData::F32(v) => v.clone(),
            };
        }
        (0..n)
            .map(|i| {
                let sum: f64 = (0..ch).map(|c| self.data.get(i * ch + c)).sum();
                (sum / 3.0) as f32
            })
            .collect()
    }

    /// Single-channel plane of the same depth as `self` built from unscaled
    /// `f32` values. Integer depths saturate.
    ///
    /// # Errors
    ///
    /// Returns [`PlaneError::LengthMismatch`] if `values` does not cover the
    /// plane.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn with_gray_values(&self, values: Vec<f32>) -> Result<Self, PlaneError> {
        let (w, h) = (self.width, self.height);
        match self.depth() {
            Depth::U8 => Self::from_vec(
                w,
                h,
                Channels::Gray,
                values
                    .iter()
                    .map(|v| v.round().clamp(0.0, 255.0) as u8)
                    .collect(),
            ),
            Depth::U16 => Self::from_vec(
                w,
                h,
                Channels::Gray,
                values
                    .iter()
                    .map(|v| v.round().clamp(0.0, 65535.0) as u16)
                    .collect(),
            ),
            Depth::F32 => Self::from_vec(w, h, Channels::Gray, values),
        }
    }

    /// Minimum and maximum over all elements. `(0, 0)` for an empty plane.
    #[must_use]
    pub fn min_max(&self) -> (f64, f64) {
        let n = self.data.len();
        if n == 0 {
            return (0.0, 0.0);
        }
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for i in 0..n {
            let v = self.data.get(i);
            lo = lo.min(v);
            hi = hi.max(v);
        }
        (lo, hi)
    }

    /// Convert to another depth.
    ///
    /// - U8/U16 to F32 divide by 255/65535.
    /// - F32 to U8/U16 clamp to `[0, max observed]` and rescale that range
    ///   to the full integer range.
    /// - U8 to U16 multiplies by 257, U16 to U8 divides by 257.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn convert_depth(&self, depth: Depth) -> Self {
        if depth == self.depth() {
            return self.clone();
        }
        let data = match (&*self.data, depth) {
            (PixelData::U8(v), Depth::F32) => {
                PixelData::F32(v.iter().map(|&p| f32::from(p) / 255.0).collect())
            }
            (PixelData::U16(v), Depth::F32) => {
                PixelData::F32(v.iter().map(|&p| f32::from(p) / 65535.0).collect())
            }
            (PixelData::U8(v), Depth::U16) => {
                PixelData::U16(v.iter().map(|&p| u16::from(p) * 257).collect())
            }
            (PixelData::U16(v), Depth::U8) => {
                PixelData::U8(v.iter().map(|&p| (p / 257) as u8).collect())
            }
            (PixelData::F32(v), target) => {
                let max = v.iter().copied().fold(0.0_f32, f32::max);
                let full = target.max_value() as f32;
                let scale = if max > 0.0 { full / max } else { 0.0 };
                let scaled = v.iter().map(|&p| (p.clamp(0.0, max) * scale).round());
                match target {
                    Depth::U8 => PixelData::U8(scaled.map(|p| p as u8).collect()),
                    Depth::U16 => PixelData::U16(scaled.map(|p| p as u16).collect()),
                    Depth::F32 => PixelData::F32(v.clone()),
                }
            }
            (data, _) => data.clone(),
        };
        Self {
            width: self.width,
            height: self.height,
            channels: self.channels,
            data: Arc::new(data),
        }
    }

    /// Convert into a preallocated plane of matching size and channel count,
    /// taking the target's depth.
    ///
    /// # Errors
    ///
    /// Returns [`PlaneError::ChannelMismatch`] or
    /// [`PlaneError::DimensionMismatch`] when the target differs.
    pub fn convert_into(&self, target: &mut Self) -> Result<(), PlaneError> {
        if target.channels != self.channels {
            return Err(PlaneError::ChannelMismatch {
                expected: target.channels.count(),
                found: self.channels.count(),
            });
        }
        if target.dimensions() != self.dimensions() {
            return Err(PlaneError::DimensionMismatch {
                expected: target.dimensions(),
                found: self.dimensions(),
            });
        }
        *target = self.convert_depth(target.depth());
        Ok(())
    }

    /// Copy of the region `rect`. Pixels outside the plane are zero.
    #[must_use]
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]
    pub fn crop(&self, rect: Rect) -> Self {
        let mut out = Self::zeros(rect.width, rect.height, self.depth(), self.channels);
        let bounds = Rect::from_dimensions(self.dimensions());
        let Some(valid) = rect.intersection(bounds) else {
            return out;
        };
        let ch = self.channels.count();
        let src_stride = self.stride();
        let dst_stride = out.stride();
        let row_len = valid.width as usize * ch;
        let dst_x = (valid.x - rect.x) as usize * ch;
        let src_x = valid.x as usize * ch;
        macro_rules! copy_rows {
            ($src:expr, $dst:expr) => {
                for row in 0..valid.height as usize {
                    let sy = valid.y as usize + row;
                    let dy = (valid.y - rect.y) as usize + row;
                    let s = sy * src_stride + src_x;
                    let d = dy * dst_stride + dst_x;
                    $dst[d..d + row_len].copy_from_slice(&$src[s..s + row_len]);
                }
            };
        }
        match (&*self.data, out.make_mut()) {
            (PixelData::U8(src), PixelData::U8(dst)) => copy_rows!(src, dst),
            (PixelData::U16(src), PixelData::U16(dst)) => copy_rows!(src, dst),
            (PixelData::F32(src), PixelData::F32(dst)) => copy_rows!(src, dst),
            _ => {}
        }
        out
    }

    /// Copy `src` into `self` with its top-left corner at `(x, y)`.
    ///
    /// Parts of `src` that fall outside `self` are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`PlaneError::ChannelMismatch`] when the channel counts differ.
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]
    pub fn paste(&mut self, src: &Self, x: i32, y: i32) -> Result<(), PlaneError> {
        if src.channels != self.channels {
            return Err(PlaneError::ChannelMismatch {
                expected: self.channels.count(),
                found: src.channels.count(),
            });
        }
        let src = src.convert_depth(self.depth());
        let target = Rect::new(x, y, src.width, src.height);
        let Some(valid) = target.intersection(Rect::from_dimensions(self.dimensions())) else {
            return Ok(());
        };
        let ch = self.channels.count();
        for row in 0..valid.height {
            let sy = (valid.y - y) as u32 + row;
            let dy = valid.y as u32 + row;
            for col in 0..valid.width {
                let sx = (valid.x - x) as u32 + col;
                let dx = valid.x as u32 + col;
                for c in 0..ch {
                    let v = src.get(sx, sy, c);
                    self.set(dx, dy, c, v);
                }
            }
        }
        Ok(())
    }

    /// 24-bit BGR rendering of a gray plane.
    ///
    /// `weights` are the red, green and blue shares in `[0, 1]`; the
    /// contrast window `(lower, upper)` is in 16-bit units. U8 and F32
    /// planes are converted to U16 first.
    ///
    /// # Errors
    ///
    /// Returns [`PlaneError::ChannelMismatch`] for a three-channel plane.
    pub fn to_pseudo_color(
        &self,
        weights: [f32; 3],
        lower: u16,
        upper: u16,
    ) -> Result<Self, PlaneError> {
        if self.channels != Channels::Gray {
            return Err(PlaneError::ChannelMismatch {
                expected: Channels::Gray.count(),
                found: self.channels.count(),
            });
        }
        let gray = self.convert_depth(Depth::U16);
        let Some(values) = gray.as_slice::<u16>() else {
            return Err(PlaneError::LengthMismatch {
                expected: self.data.len(),
                found: 0,
            });
        };
        let [r, g, b] = weights.map(|w| pseudo_color_lut(w, lower, upper));
        let mut bgr = Vec::with_capacity(values.len() * 3);
        for &v in values {
            let v = usize::from(v);
            bgr.extend_from_slice(&[b[v], g[v], r[v]]);
        }
        Self::from_vec(self.width, self.height, Channels::Bgr, bgr)
    }

    /// 8-bit copy stretched so the plane's maximum maps to 255.
    ///
    /// Used for algorithms that only accept [`GrayImage`] (Canny, contour
    /// tracing) and for control images.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn to_gray8_normalized(&self) -> GrayImage {
        let values = self.to_f32_gray();
        let max = values.iter().copied().fold(0.0_f32, f32::max);
        let scale = if max > 0.0 { 255.0 / max } else { 0.0 };
        let raw = values
            .iter()
            .map(|v| (v.max(0.0) * scale).round().min(255.0) as u8)
            .collect();
        GrayImage::from_raw(self.width, self.height, raw)
            .unwrap_or_else(|| GrayImage::new(self.width, self.height))
    }

    /// Binary view: 255 where channel 0 is non-zero.
    #[must_use]
    pub fn to_binary_mask(&self) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| {
            if self.get(x, y, 0) > 0.0 {
                Luma([255])
            } else {
                Luma([0])
            }
        })
    }

    /// Gray values as an `imageproc`-compatible float image.
    #[must_use]
    pub fn to_luma32f(&self) -> ImageBuffer<Luma<f32>, Vec<f32>> {
        ImageBuffer::from_raw(self.width, self.height, self.to_f32_gray())
            .unwrap_or_else(|| ImageBuffer::new(self.width, self.height))
    }
}
