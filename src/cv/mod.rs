// src/cv/mod.rs

use crate::ImageBuffer;

/// Pixel-level operations used by the marker detector.
///
/// Implementations are stateless; the detector is generic over this trait
/// so a vectorised backend can replace [`scalar::ScalarCV`] without touching
/// the detection logic.
pub trait ComputerVision {
    /// Reduces an interleaved image to one luma byte per pixel.
    ///
    /// # Arguments
    /// * `src` - Gray, RGB or RGBA `ImageBuffer`.
    /// * `dst` - Pre-allocated output, `width * height` bytes.
    fn grayscale(src: &ImageBuffer, dst: &mut [u8]);

    /// Binary threshold: values `<= threshold` become 0, others 255.
    fn threshold(src: &[u8], dst: &mut [u8], threshold: u8);

    /// Otsu's threshold for a grayscale sample set.
    fn otsu(src: &[u8]) -> u8;

    /// Box blur with a `2 * kernel_size + 1` wide stack window.
    fn stack_box_blur(src: &ImageBuffer, dst: &mut [u8], kernel_size: usize);

    /// Marks pixels darker than their blurred neighbourhood by more than
    /// `threshold` with 255, everything else with 0.
    fn adaptive_threshold(src: &ImageBuffer, dst: &mut [u8], kernel_size: usize, threshold: u8);

    /// Samples the quadrilateral `contour` into a `warp_size` square patch
    /// with bilinear interpolation. `contour[0]` maps to the patch origin.
    fn warp(src: &ImageBuffer, dst: &mut [u8], contour: &[crate::Point2f; 4], warp_size: usize);

    /// Counts non-zero pixels inside `square`.
    fn count_non_zero(src: &ImageBuffer, square: &Square) -> usize;
}

/// Defines a rectangular region of interest
#[derive(Debug, Clone, Copy)]
pub struct Square {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

pub mod color;
pub mod contours;
pub mod geometry;
pub mod scalar;
