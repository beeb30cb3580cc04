use image::RgbImage;

use crate::BackendError;
use crate::contract::chroma_row_bytes;
use crate::surface::FrameSurface;

/// Borrowed NV12 planes of one frame; both planes step `pitch` bytes per row.
#[derive(Debug, Clone, Copy)]
pub struct Nv12Planes<'a> {
    pub width: usize,
    pub height: usize,
    pub pitch: usize,
    pub luma: &'a [u8],
    pub chroma: &'a [u8],
}

impl<'a> Nv12Planes<'a> {
    fn check(&self) -> Result<(), BackendError> {
        let invalid = |detail: String| Err(BackendError::InvalidInput(detail));
        if self.width == 0 || self.height == 0 {
            return invalid(format!("empty nv12 frame {}x{}", self.width, self.height));
        }
        let uv_bytes = chroma_row_bytes(self.width);
        if uv_bytes > self.pitch {
            return invalid(format!("pitch {} is narrower than chroma row {uv_bytes}", self.pitch));
        }
        let luma_needed = (self.height - 1) * self.pitch + self.width;
        let chroma_needed = (self.height.div_ceil(2) - 1) * self.pitch + uv_bytes;
        if self.luma.len() < luma_needed || self.chroma.len() < chroma_needed {
            return invalid(format!(
                "nv12 planes too small for {}x{}: luma {}/{luma_needed}, chroma {}/{chroma_needed}",
                self.width,
                self.height,
                self.luma.len(),
                self.chroma.len()
            ));
        }
        Ok(())
    }

    fn luma_row(&self, y: usize) -> &'a [u8] {
        &self.luma[y * self.pitch..][..self.width]
    }

    fn chroma_row(&self, y: usize) -> &'a [u8] {
        &self.chroma[(y / 2) * self.pitch..][..chroma_row_bytes(self.width)]
    }

    /// Copies the visible rows into an owned frame with no row padding.
    #[must_use]
    pub fn to_frame(&self) -> Nv12Frame {
        let pitch = chroma_row_bytes(self.width);
        let chroma_rows = self.height.div_ceil(2);
        let mut data = vec![0_u8; pitch * (self.height + chroma_rows)];
        let (luma, chroma) = data.split_at_mut(pitch * self.height);
        for (y, dst) in luma.chunks_exact_mut(pitch).enumerate() {
            dst[..self.width].copy_from_slice(self.luma_row(y));
        }
        for (row, dst) in chroma.chunks_exact_mut(pitch).enumerate() {
            dst.copy_from_slice(self.chroma_row(row * 2));
        }
        Nv12Frame {
            width: self.width,
            height: self.height,
            pitch,
            data,
        }
    }
}

/// Owned NV12 frame: `height` luma rows then `ceil(height / 2)` chroma rows,
/// all `pitch` bytes apart.
#[derive(Debug, Clone)]
pub struct Nv12Frame {
    pub width: usize,
    pub height: usize,
    pub pitch: usize,
    pub data: Vec<u8>,
}

impl Nv12Frame {
    #[must_use]
    pub fn from_surface(surface: &FrameSurface<'_>) -> Self {
        surface.planes().to_frame()
    }

    #[must_use]
    pub fn planes(&self) -> Nv12Planes<'_> {
        let split = (self.pitch * self.height).min(self.data.len());
        let (luma, chroma) = self.data.split_at(split);
        Nv12Planes {
            width: self.width,
            height: self.height,
            pitch: self.pitch,
            luma,
            chroma,
        }
    }
}

/// Converts BT.601 limited-range NV12 into an RGB image.
pub fn nv12_to_rgb_image(planes: Nv12Planes<'_>) -> Result<RgbImage, BackendError> {
    planes.check()?;
    let dimension = |value: usize| {
        u32::try_from(value)
            .map_err(|_| BackendError::InvalidInput(format!("frame dimension {value} overflows")))
    };
    let mut image = RgbImage::new(dimension(planes.width)?, dimension(planes.height)?);
    for (y, row) in image.rows_mut().enumerate() {
        let chroma = planes.chroma_row(y);
        for ((x, pixel), &luma) in row.enumerate().zip(planes.luma_row(y)) {
            let pair = x & !1;
            pixel.0 = bt601_to_rgb(luma, chroma[pair], chroma[pair + 1]);
        }
    }
    Ok(image)
}

/// Fixed-point (8 fractional bits) BT.601 studio swing to full-range RGB.
fn bt601_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let luma = 298 * (i32::from(y) - 16).max(0) + 128;
    let cb = i32::from(u) - 128;
    let cr = i32::from(v) - 128;
    let channel = |scaled: i32| (scaled >> 8).clamp(0, 255) as u8;
    [
        channel(luma + 409 * cr),
        channel(luma - 100 * cb - 208 * cr),
        channel(luma + 516 * cb),
    ]
}

/// Tightly packed NV12 frame with a diagonal luma ramp and neutral chroma,
/// laid out the way raw input files store it.
#[must_use]
pub fn nv12_test_pattern(width: usize, height: usize, seed: u8) -> Vec<u8> {
    let uv_bytes = chroma_row_bytes(width);
    let mut data = Vec::with_capacity(width * height + uv_bytes * height.div_ceil(2));
    for y in 0..height {
        for x in 0..width {
            data.push(((x + y + usize::from(seed)) % 220 + 16) as u8);
        }
    }
    data.resize(data.len() + uv_bytes * height.div_ceil(2), 128);
    data
}
