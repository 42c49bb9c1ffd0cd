// src/detection.rs
//
// Validation layer between the detection primitive and the rest of the
// pipeline.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::core::detector::{MarkerDetector, RawMarker};
use crate::cv::geometry::{min_corner_separation, signed_area};
use crate::error::DetectionError;
use crate::{ImageBuffer, MarkerCorners, MarkerId};

/// Geometric plausibility thresholds for detected markers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationParams {
    /// Smallest accepted quad area, in square pixels.
    pub min_area: f32,
    /// Largest accepted quad area as a fraction of the image area.
    pub max_area_fraction: f32,
    /// Smallest accepted distance between any two corners, in pixels.
    pub min_corner_distance: f32,
}

impl Default for ValidationParams {
    fn default() -> Self {
        Self {
            min_area: 100.0,
            max_area_fraction: 0.9,
            min_corner_distance: 8.0,
        }
    }
}

/// A marker that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedMarker {
    pub id: MarkerId,
    pub corners: MarkerCorners,
    pub hamming: u32,
    /// Quad area in square pixels.
    pub area: f32,
}

/// Validated markers of one frame, ids unique, in primitive order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionResult {
    pub markers: Vec<DetectedMarker>,
    /// Markers reported by the primitive but rejected.
    pub dropped: usize,
}

impl DetectionResult {
    pub fn ids(&self) -> impl Iterator<Item = MarkerId> + '_ {
        self.markers.iter().map(|m| m.id)
    }

    pub fn get(&self, id: MarkerId) -> Option<&DetectedMarker> {
        self.markers.iter().find(|m| m.id == id)
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}

/// Wraps a [`MarkerDetector`] and filters its output.
pub struct MarkerDetectionAdapter {
    detector: Box<dyn MarkerDetector>,
    params: ValidationParams,
}

impl MarkerDetectionAdapter {
    pub fn new(detector: Box<dyn MarkerDetector>, params: ValidationParams) -> Self {
        Self { detector, params }
    }

    pub fn params(&self) -> &ValidationParams {
        &self.params
    }

    /// Runs the primitive on a canonical image. Empty or malformed images
    /// are an error, distinct from a frame without markers.
    pub fn detect(&mut self, image: &ImageBuffer) -> Result<DetectionResult, DetectionError> {
        if image.data.is_empty() || image.width == 0 || image.height == 0 {
            return Err(DetectionError::InvalidInput("empty image".into()));
        }
        if !image.is_consistent() {
            return Err(DetectionError::InvalidInput(format!(
                "{} bytes do not form a {}x{} image with {} channel(s)",
                image.data.len(),
                image.width,
                image.height,
                image.channels
            )));
        }

        let raw = self.detector.detect(image)?;
        let image_area = image.pixel_count() as f32;

        let mut result = DetectionResult::default();
        for marker in raw {
            let Some(candidate) = self.validate(marker, image_area) else {
                result.dropped += 1;
                continue;
            };
            match result.markers.iter_mut().find(|m| m.id == candidate.id) {
                Some(existing) => {
                    result.dropped += 1;
                    if preferred(&candidate, existing) {
                        *existing = candidate;
                    }
                }
                None => result.markers.push(candidate),
            }
        }
        Ok(result)
    }

    fn validate(&self, marker: RawMarker, image_area: f32) -> Option<DetectedMarker> {
        let corners = marker.corners;
        if corners
            .iter()
            .any(|c| !(c.x.is_finite() && c.y.is_finite()) || c.x < 0.0 || c.y < 0.0)
        {
            trace!(id = marker.id, "dropping marker with invalid corners");
            return None;
        }
        let area = signed_area(&corners).abs();
        if area < self.params.min_area || area > image_area * self.params.max_area_fraction {
            trace!(id = marker.id, area, "dropping marker with implausible area");
            return None;
        }
        if min_corner_separation(&corners) < self.params.min_corner_distance {
            trace!(id = marker.id, "dropping marker with collapsed corners");
            return None;
        }
        Some(DetectedMarker {
            id: marker.id,
            corners,
            hamming: marker.hamming,
            area,
        })
    }
}

/// Lower Hamming distance wins, then the larger quad.
fn preferred(candidate: &DetectedMarker, existing: &DetectedMarker) -> bool {
    candidate.hamming < existing.hamming
        || (candidate.hamming == existing.hamming && candidate.area > existing.area)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Point2f;

    struct Canned(Vec<RawMarker>);

    impl MarkerDetector for Canned {
        fn detect(&mut self, _image: &ImageBuffer) -> Result<Vec<RawMarker>, DetectionError> {
            Ok(self.0.clone())
        }
    }

    fn raw(id: MarkerId, x: f32, y: f32, side: f32, hamming: u32) -> RawMarker {
        RawMarker {
            id,
            corners: [
                Point2f::new(x, y),
                Point2f::new(x + side, y),
                Point2f::new(x + side, y + side),
                Point2f::new(x, y + side),
            ],
            hamming,
        }
    }

    fn adapter(markers: Vec<RawMarker>) -> MarkerDetectionAdapter {
        MarkerDetectionAdapter::new(Box::new(Canned(markers)), ValidationParams::default())
    }

    #[test]
    fn empty_and_inconsistent_images_are_errors() {
        let mut adapter = adapter(Vec::new());
        assert!(matches!(
            adapter.detect(&ImageBuffer::gray(&[], 0, 0)),
            Err(DetectionError::InvalidInput(_))
        ));
        let data = vec![0u8; 10];
        assert!(matches!(
            adapter.detect(&ImageBuffer::gray(&data, 4, 4)),
            Err(DetectionError::InvalidInput(_))
        ));
        let data = vec![0u8; 16];
        let result = adapter.detect(&ImageBuffer::gray(&data, 4, 4)).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn implausible_geometry_is_dropped() {
        let mut collapsed = raw(4, 10.0, 10.0, 40.0, 0);
        collapsed.corners[2] = collapsed.corners[1] + Point2f::new(1.0, 1.0);
        let mut adapter = adapter(vec![
            raw(1, 10.0, 10.0, 40.0, 0),
            raw(2, 10.0, 10.0, 3.0, 0),
            raw(3, -5.0, 10.0, 40.0, 0),
            collapsed,
            raw(5, 0.0, 0.0, 99.0, 0),
            RawMarker {
                corners: [Point2f::new(f32::NAN, 0.0); 4],
                ..raw(6, 0.0, 0.0, 1.0, 0)
            },
        ]);
        let data = vec![0u8; 100 * 100];
        let result = adapter.detect(&ImageBuffer::gray(&data, 100, 100)).unwrap();
        assert_eq!(result.ids().collect::<Vec<_>>(), vec![1]);
        assert_eq!(result.dropped, 5);
        assert_eq!(result.get(1).unwrap().area, 1600.0);
    }

    #[test]
    fn duplicate_ids_collapse_to_the_best_match() {
        let mut adapter = adapter(vec![
            raw(7, 0.0, 0.0, 30.0, 1),
            raw(8, 50.0, 50.0, 30.0, 0),
            raw(7, 10.0, 10.0, 20.0, 0),
            raw(7, 10.0, 10.0, 40.0, 0),
        ]);
        let data = vec![0u8; 100 * 100];
        let result = adapter.detect(&ImageBuffer::gray(&data, 100, 100)).unwrap();
        assert_eq!(result.ids().collect::<Vec<_>>(), vec![7, 8]);
        assert_eq!(result.get(7).unwrap().area, 1600.0);
        assert_eq!(result.dropped, 2);
    }
}
