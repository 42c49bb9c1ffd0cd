// tests/common/mod.rs
#![allow(dead_code)]

use std::thread;
use std::time::Duration;

use aruco_pipeline::core::detector::{MarkerDetector, RawMarker};
use aruco_pipeline::core::dictionary::Dictionary;
use aruco_pipeline::{DetectionError, DetectorInitError, Frame, ImageBuffer, MarkerId, PixelFormat};

/// Gray image with marker `id` drawn at `(x0, y0)`, `cell` pixels per bit,
/// on a white background.
pub fn render_marker(
    id: MarkerId,
    width: u32,
    height: u32,
    x0: usize,
    y0: usize,
    cell: usize,
) -> Vec<u8> {
    let bits = Dictionary::aruco().bits(id).expect("id in dictionary");
    let mut data = vec![255u8; (width * height) as usize];
    for row in 0..7 {
        for col in 0..7 {
            let inner = (1..6).contains(&row) && (1..6).contains(&col);
            let white = inner && bits[(row - 1) * 5 + col - 1] == 1;
            let value = if white { 255 } else { 0 };
            for y in 0..cell {
                let start = (y0 + row * cell + y) * width as usize + x0 + col * cell;
                data[start..start + cell].fill(value);
            }
        }
    }
    data
}

pub fn gray_to_rgba(gray: &[u8]) -> Vec<u8> {
    gray.iter().flat_map(|&v| [v, v, v, 255]).collect()
}

/// 200x200 RGBA frame with marker 5 whose outer corners are at
/// (40, 40) and (151, 151).
pub fn marker_frame(sequence: u64) -> Frame {
    let gray = render_marker(5, 200, 200, 40, 40, 16);
    Frame::packed(
        gray_to_rgba(&gray),
        200,
        200,
        PixelFormat::Rgba8888,
        Duration::from_millis(sequence * 33),
        sequence,
    )
}

pub fn blank_frame(sequence: u64, size: u32) -> Frame {
    Frame::packed(
        vec![200; (size * size * 4) as usize],
        size,
        size,
        PixelFormat::Rgba8888,
        Duration::from_millis(sequence * 33),
        sequence,
    )
}

/// Detection primitive that takes `delay` per frame and never finds
/// anything.
pub struct SlowDetector {
    pub delay: Duration,
}

impl MarkerDetector for SlowDetector {
    fn detect(&mut self, _image: &ImageBuffer) -> Result<Vec<RawMarker>, DetectionError> {
        thread::sleep(self.delay);
        Ok(Vec::new())
    }
}

pub fn slow_factory(
    delay: Duration,
) -> impl FnMut() -> Result<Box<dyn MarkerDetector>, DetectorInitError> + Send + 'static {
    move || Ok(Box::new(SlowDetector { delay }) as Box<dyn MarkerDetector>)
}
