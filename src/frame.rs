// src/frame.rs
//
// Captured camera frames as handed over by the producer.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Pixel layout of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Planar luma + 2x2 subsampled chroma. Three planes (Y, U, V); the
    /// chroma planes may be interleaved through their pixel stride.
    Yuv420,
    /// Packed B, G, R, A.
    Bgra8888,
    /// Packed R, G, B, A.
    Rgba8888,
    /// Packed A, R, G, B (alpha first).
    Argb8888,
    /// Platform format code the pipeline does not understand.
    Other(u32),
}

/// One image plane of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plane {
    pub bytes: Vec<u8>,
    /// Bytes between the starts of two consecutive rows.
    pub row_stride: usize,
    /// Bytes between two horizontally adjacent samples.
    pub pixel_stride: usize,
}

impl Plane {
    pub fn new(bytes: Vec<u8>, row_stride: usize, pixel_stride: usize) -> Self {
        Self {
            bytes,
            row_stride,
            pixel_stride,
        }
    }
}

/// A captured frame. Owned by the producer until it is submitted; the
/// pipeline drops it once the worker has converted it (or immediately when
/// it is skipped).
#[derive(Debug, Clone)]
pub struct Frame {
    pub planes: Vec<Plane>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Capture time on the producer's clock.
    pub timestamp: Duration,
    /// Caller-assigned, expected to increase with capture order.
    pub sequence: u64,
}

impl Frame {
    /// Frame with a single tightly packed 4-byte-per-pixel plane.
    pub fn packed(
        bytes: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
        timestamp: Duration,
        sequence: u64,
    ) -> Self {
        let row_stride = width as usize * 4;
        Self {
            planes: vec![Plane::new(bytes, row_stride, 4)],
            width,
            height,
            format,
            timestamp,
            sequence,
        }
    }

    /// Tightly packed I420 frame (separate U and V planes).
    pub fn yuv420(
        y: Vec<u8>,
        u: Vec<u8>,
        v: Vec<u8>,
        width: u32,
        height: u32,
        timestamp: Duration,
        sequence: u64,
    ) -> Self {
        let chroma_stride = (width as usize).div_ceil(2);
        Self {
            planes: vec![
                Plane::new(y, width as usize, 1),
                Plane::new(u, chroma_stride, 1),
                Plane::new(v, chroma_stride, 1),
            ],
            width,
            height,
            format: PixelFormat::Yuv420,
            timestamp,
            sequence,
        }
    }

    /// Total bytes held by the frame's planes.
    pub fn byte_len(&self) -> usize {
        self.planes.iter().map(|p| p.bytes.len()).sum()
    }
}
