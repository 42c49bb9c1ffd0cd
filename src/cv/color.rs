// src/cv/color.rs
//
// Normalisation of captured camera buffers into the interleaved layouts the
// detector accepts. Everything here is integer arithmetic so the output is
// bit-identical across runs and platforms.

use serde::{Deserialize, Serialize};

use crate::cv::scalar::luma;
use crate::error::ConversionError;
use crate::frame::{Frame, PixelFormat, Plane};
use crate::ImageBuffer;

/// Layout handed to the detection stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalFormat {
    Gray8,
    Rgb8,
    #[default]
    Rgba8,
}

impl CanonicalFormat {
    pub fn channels(self) -> u8 {
        match self {
            CanonicalFormat::Gray8 => 1,
            CanonicalFormat::Rgb8 => 3,
            CanonicalFormat::Rgba8 => 4,
        }
    }
}

/// Owned, tightly packed image in a canonical layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: CanonicalFormat,
}

impl CanonicalImage {
    pub fn as_buffer(&self) -> ImageBuffer<'_> {
        ImageBuffer {
            data: &self.data,
            width: self.width,
            height: self.height,
            channels: self.format.channels(),
        }
    }
}

// BT.601 full-range YCbCr -> RGB, 10 fractional bits.
const FIX_SHIFT: i32 = 10;
const FIX_HALF: i32 = 1 << (FIX_SHIFT - 1);
const CR_TO_R: i32 = 1436; // 1.402
const CB_TO_G: i32 = 352; // 0.344136
const CR_TO_G: i32 = 731; // 0.714136
const CB_TO_B: i32 = 1815; // 1.772

#[inline]
fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

#[inline]
fn yuv_to_rgb(y: u8, cb: u8, cr: u8) -> [u8; 3] {
    let y = (y as i32) << FIX_SHIFT;
    let cb = cb as i32 - 128;
    let cr = cr as i32 - 128;
    [
        clamp_u8((y + CR_TO_R * cr + FIX_HALF) >> FIX_SHIFT),
        clamp_u8((y - CB_TO_G * cb - CR_TO_G * cr + FIX_HALF) >> FIX_SHIFT),
        clamp_u8((y + CB_TO_B * cb + FIX_HALF) >> FIX_SHIFT),
    ]
}

/// Byte positions of R, G, B and A inside one packed pixel.
fn packed_order(format: PixelFormat) -> Option<[usize; 4]> {
    match format {
        PixelFormat::Rgba8888 => Some([0, 1, 2, 3]),
        PixelFormat::Bgra8888 => Some([2, 1, 0, 3]),
        PixelFormat::Argb8888 => Some([1, 2, 3, 0]),
        PixelFormat::Yuv420 | PixelFormat::Other(_) => None,
    }
}

/// Bytes a plane must hold to address a `cols` x `rows` sample grid, or
/// `None` when the strides overflow the address space.
fn required_len(plane: &Plane, cols: usize, rows: usize, sample_bytes: usize) -> Option<usize> {
    (rows - 1)
        .checked_mul(plane.row_stride)?
        .checked_add((cols - 1).checked_mul(plane.pixel_stride)?)?
        .checked_add(sample_bytes)
}

fn check_plane(
    planes: &[Plane],
    index: usize,
    cols: usize,
    rows: usize,
    sample_bytes: usize,
) -> Result<(), ConversionError> {
    let plane = &planes[index];
    let required = required_len(plane, cols, rows, sample_bytes).ok_or(
        ConversionError::StrideOverflow {
            plane: index,
            row_stride: plane.row_stride,
            pixel_stride: plane.pixel_stride,
        },
    )?;
    if plane.bytes.len() < required {
        return Err(ConversionError::PlaneTooShort {
            plane: index,
            required,
            actual: plane.bytes.len(),
        });
    }
    Ok(())
}

/// Stateless converter into one canonical layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct ColorConverter {
    target: CanonicalFormat,
}

impl ColorConverter {
    pub fn new(target: CanonicalFormat) -> Self {
        Self { target }
    }

    pub fn target(&self) -> CanonicalFormat {
        self.target
    }

    pub fn convert_frame(&self, frame: &Frame) -> Result<CanonicalImage, ConversionError> {
        self.convert(&frame.planes, frame.width, frame.height, frame.format)
    }

    /// Converts raw planes in `format` into the target layout.
    pub fn convert(
        &self,
        planes: &[Plane],
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<CanonicalImage, ConversionError> {
        if width == 0 || height == 0 {
            return Err(ConversionError::InvalidDimensions { width, height });
        }
        let data = match format {
            PixelFormat::Yuv420 => self.from_yuv420(planes, width as usize, height as usize)?,
            PixelFormat::Other(_) => return Err(ConversionError::UnsupportedFormat(format)),
            packed => {
                let order = packed_order(packed).ok_or(ConversionError::UnsupportedFormat(packed))?;
                self.from_packed(planes, width as usize, height as usize, format, order)?
            }
        };
        Ok(CanonicalImage {
            data,
            width,
            height,
            format: self.target,
        })
    }

    fn from_yuv420(
        &self,
        planes: &[Plane],
        width: usize,
        height: usize,
    ) -> Result<Vec<u8>, ConversionError> {
        let needed = if self.target == CanonicalFormat::Gray8 { 1 } else { 3 };
        if planes.len() < needed {
            return Err(ConversionError::MissingPlane {
                format: PixelFormat::Yuv420,
                expected: 3,
                actual: planes.len(),
            });
        }
        check_plane(planes, 0, width, height, 1)?;
        let luma_plane = &planes[0];

        if self.target == CanonicalFormat::Gray8 {
            let mut out = Vec::with_capacity(width * height);
            for row in 0..height {
                let base = row * luma_plane.row_stride;
                out.extend(
                    (0..width).map(|col| luma_plane.bytes[base + col * luma_plane.pixel_stride]),
                );
            }
            return Ok(out);
        }

        let chroma_w = width.div_ceil(2);
        let chroma_h = height.div_ceil(2);
        check_plane(planes, 1, chroma_w, chroma_h, 1)?;
        check_plane(planes, 2, chroma_w, chroma_h, 1)?;
        let (u_plane, v_plane) = (&planes[1], &planes[2]);

        let channels = self.target.channels() as usize;
        let mut out = vec![0u8; width * height * channels];
        for row in 0..height {
            let y_base = row * luma_plane.row_stride;
            let u_base = (row / 2) * u_plane.row_stride;
            let v_base = (row / 2) * v_plane.row_stride;
            for col in 0..width {
                let y = luma_plane.bytes[y_base + col * luma_plane.pixel_stride];
                let cb = u_plane.bytes[u_base + (col / 2) * u_plane.pixel_stride];
                let cr = v_plane.bytes[v_base + (col / 2) * v_plane.pixel_stride];
                let px = (row * width + col) * channels;
                out[px..px + 3].copy_from_slice(&yuv_to_rgb(y, cb, cr));
                if channels == 4 {
                    out[px + 3] = 255;
                }
            }
        }
        Ok(out)
    }

    fn from_packed(
        &self,
        planes: &[Plane],
        width: usize,
        height: usize,
        format: PixelFormat,
        [r, g, b, a]: [usize; 4],
    ) -> Result<Vec<u8>, ConversionError> {
        if planes.is_empty() {
            return Err(ConversionError::MissingPlane {
                format,
                expected: 1,
                actual: 0,
            });
        }
        check_plane(planes, 0, width, height, 4)?;
        let plane = &planes[0];
        let channels = self.target.channels() as usize;
        let mut out = Vec::with_capacity(width * height * channels);
        for row in 0..height {
            let base = row * plane.row_stride;
            for col in 0..width {
                let at = base + col * plane.pixel_stride;
                let px = &plane.bytes[at..at + 4];
                match self.target {
                    CanonicalFormat::Gray8 => out.push(luma(px[r], px[g], px[b])),
                    CanonicalFormat::Rgb8 => out.extend_from_slice(&[px[r], px[g], px[b]]),
                    CanonicalFormat::Rgba8 => {
                        out.extend_from_slice(&[px[r], px[g], px[b], px[a]])
                    }
                }
            }
        }
        Ok(out)
    }
}
