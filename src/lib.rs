// Copyright (c) 2026 kalwalt and AR.js-org contributors
//
// This software is released under the MIT License.
// https://opensource.org/licenses/MIT
// See https://github.com/AR-js-org/aruco-rs/blob/main/LICENSE
//! Real-time ArUco marker pipeline.
//!
//! Frames enter through a [`pipeline::FrameThrottler`], are converted and
//! analysed on a single worker thread, and come out as per-frame pose maps
//! that an [`anchor::AnchorLifecycleManager`] reconciles into host anchors.
use nalgebra::Vector2;

/// 2D image-plane point in pixels.
pub type Point2f = Vector2<f32>;

/// 2D Point in pixel coordinates
pub type Point2i = Vector2<i32>;

/// The four corners of a detected marker, clockwise starting at the marker's
/// top-left corner.
pub type MarkerCorners = [Point2f; 4];

/// Dictionary id of a marker.
pub type MarkerId = u32;

/// Borrowed interleaved 8-bit image.
///
/// # Fields
/// * `data` - Row-major pixel bytes, `width * height * channels` long.
/// * `width` - The logical width of the frame in pixels.
/// * `height` - The logical height of the frame in pixels.
/// * `channels` - Bytes per pixel: 1 (gray), 3 (RGB) or 4 (RGBA).
#[derive(Debug, Clone, Copy)]
pub struct ImageBuffer<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub channels: u8,
}

impl<'a> ImageBuffer<'a> {
    /// Single channel view over `data`.
    pub fn gray(data: &'a [u8], width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            channels: 1,
        }
    }

    /// Number of pixels in the image.
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Whether the buffer length matches the declared geometry.
    pub fn is_consistent(&self) -> bool {
        self.width > 0
            && self.height > 0
            && matches!(self.channels, 1 | 3 | 4)
            && self.data.len() == self.pixel_count() * self.channels as usize
    }
}

pub mod anchor;
pub mod calibration;
pub mod config;
pub mod core;
pub mod cv;
pub mod detection;
pub mod error;
pub mod frame;
#[cfg(feature = "logging")]
pub mod logging;
pub mod pipeline;
pub mod pose;

pub use anchor::{
    AnchorHandle, AnchorHost, AnchorLifecycleManager, AnchorRecord, ContentSpec, PrunePolicy,
    ReconcileReport,
};
pub use calibration::CalibrationProfile;
pub use config::PipelineConfig;
pub use detection::{DetectionResult, MarkerDetectionAdapter};
pub use error::{
    AnchorError, AnchorHostError, CalibrationError, ConversionError, DetectionError,
    DetectorInitError, PipelineError, PoseEstimationError, ProcessingError,
};
pub use frame::{Frame, PixelFormat, Plane};
pub use pipeline::{
    Admission, FrameOutcome, PerformanceSample, Pipeline, PipelineHealth, PipelineState, SkipReason,
};
pub use pose::{Pose, PoseEstimator, PoseMap};
