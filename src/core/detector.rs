// src/core/detector.rs
#![allow(clippy::needless_range_loop)]

use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

use crate::core::dictionary::{Dictionary, DictionaryMatch};
use crate::cv::contours::{Contour, ContourTracer};
use crate::cv::geometry::{approx_poly_dp, is_contour_convex, min_edge_length, perimeter_f};
use crate::cv::scalar::ScalarCV;
use crate::cv::{ComputerVision, Square};
use crate::error::{DetectionError, DetectorInitError};
use crate::{ImageBuffer, MarkerCorners, MarkerId, Point2f};

/// A marker as reported by a detection primitive, before validation.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMarker {
    pub id: MarkerId,
    /// Clockwise, starting at the marker's own top-left corner.
    pub corners: MarkerCorners,
    /// Bits that differed from the dictionary entry.
    pub hamming: u32,
}

/// A marker detection primitive.
///
/// Implementations may keep scratch state between calls; they are owned by a
/// single thread and never called concurrently.
pub trait MarkerDetector: Send {
    fn detect(&mut self, image: &ImageBuffer) -> Result<Vec<RawMarker>, DetectionError>;
}

/// Constructs detection primitives on the worker thread.
pub trait DetectorFactory: Send {
    fn create(&mut self) -> Result<Box<dyn MarkerDetector>, DetectorInitError>;
}

impl<F> DetectorFactory for F
where
    F: FnMut() -> Result<Box<dyn MarkerDetector>, DetectorInitError> + Send,
{
    fn create(&mut self) -> Result<Box<dyn MarkerDetector>, DetectorInitError> {
        self()
    }
}

/// Tuning of [`ArucoDetector`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorParams {
    /// Half width of the adaptive threshold window.
    pub adaptive_kernel: usize,
    /// How much darker than its neighbourhood a pixel must be.
    pub adaptive_constant: u8,
    /// Polygon approximation tolerance relative to the contour length.
    pub poly_epsilon: f64,
    /// Minimum contour length relative to the image width.
    pub min_length_ratio: f32,
    /// Minimum candidate edge, in pixels.
    pub min_edge_length: f64,
    /// Side of the rectified patch; a multiple of the marker cell count.
    pub warp_size: usize,
    /// Accepted bit errors when matching the dictionary.
    pub max_hamming: u32,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            adaptive_kernel: 2,
            adaptive_constant: 7,
            poly_epsilon: 0.05,
            min_length_ratio: 0.01,
            min_edge_length: 10.0,
            warp_size: 49,
            max_hamming: 0,
        }
    }
}

/// Built-in ArUco detector.
pub struct ArucoDetector<CV: ComputerVision = ScalarCV> {
    dictionary: Dictionary,
    params: DetectorParams,
    tracer: ContourTracer,
    gray: Vec<u8>,
    thresholded: Vec<u8>,
    _cv: PhantomData<fn() -> CV>,
}

impl ArucoDetector<ScalarCV> {
    /// Detector over the classic ArUco dictionary with the scalar backend.
    pub fn aruco(params: DetectorParams) -> Result<Self, DetectorInitError> {
        Self::new(Dictionary::aruco(), params)
    }
}

impl<CV: ComputerVision> ArucoDetector<CV> {
    pub fn new(dictionary: Dictionary, params: DetectorParams) -> Result<Self, DetectorInitError> {
        if dictionary.is_empty() {
            return Err(DetectorInitError::new("dictionary has no entries"));
        }
        let mark_size = dictionary.mark_size;
        if params.warp_size < mark_size || params.warp_size % mark_size != 0 {
            return Err(DetectorInitError::new(format!(
                "warp size {} is not a multiple of the {} cell marker grid",
                params.warp_size, mark_size
            )));
        }
        if !(params.poly_epsilon.is_finite() && params.poly_epsilon > 0.0) {
            return Err(DetectorInitError::new("polygon epsilon must be positive"));
        }
        Ok(Self {
            dictionary,
            params,
            tracer: ContourTracer::new(),
            gray: Vec::new(),
            thresholded: Vec::new(),
            _cv: PhantomData,
        })
    }

    pub fn params(&self) -> &DetectorParams {
        &self.params
    }

    pub fn dictionary(&self) -> &Dictionary {
        &self.dictionary
    }

    /// Primary pipeline: Grayscale -> Adaptive Threshold -> Find Contours -> Filter Candidates -> Find Markers
    pub fn find(&mut self, image: &ImageBuffer) -> Vec<RawMarker> {
        let width = image.width;
        let height = image.height;
        let len = image.pixel_count();

        self.gray.resize(len, 0);
        CV::grayscale(image, &mut self.gray);

        self.thresholded.resize(len, 0);
        let gray = ImageBuffer::gray(&self.gray, width, height);
        CV::adaptive_threshold(
            &gray,
            &mut self.thresholded,
            self.params.adaptive_kernel,
            self.params.adaptive_constant,
        );

        let contours = self
            .tracer
            .trace(&ImageBuffer::gray(&self.thresholded, width, height));

        let mut candidates = self.find_candidates(&contours, width);
        clockwise_corners(&mut candidates);

        let min_dist = f32::max(30.0, width as f32 * 0.05);
        let candidates = not_too_near(candidates, min_dist);

        self.find_markers(&gray, candidates)
    }

    /// Filters raw contours into 4-vertex quadrilateral candidates.
    fn find_candidates(&self, contours: &[Contour], image_width: u32) -> Vec<MarkerCorners> {
        let min_size = (image_width as f32 * self.params.min_length_ratio) as usize;
        contours
            .iter()
            .filter(|contour| contour.points.len() >= min_size)
            .filter_map(|contour| {
                let epsilon = contour.points.len() as f64 * self.params.poly_epsilon;
                let poly = approx_poly_dp(&contour.points, epsilon);
                let keep = poly.len() == 4
                    && is_contour_convex(&poly)
                    && min_edge_length(&poly) >= self.params.min_edge_length;
                keep.then(|| {
                    [0, 1, 2, 3].map(|i| Point2f::new(poly[i].x as f32, poly[i].y as f32))
                })
            })
            .collect()
    }

    /// Warps candidates to square patches and decodes the bits using the Dictionary.
    fn find_markers(&self, image: &ImageBuffer, candidates: Vec<MarkerCorners>) -> Vec<RawMarker> {
        let warp_size = self.params.warp_size;
        let mut warped = vec![0u8; warp_size * warp_size];
        let mut binary = vec![0u8; warp_size * warp_size];

        let mut markers = Vec::new();
        for candidate in candidates {
            CV::warp(image, &mut warped, &candidate, warp_size);
            let level = CV::otsu(&warped);
            CV::threshold(&warped, &mut binary, level);

            let patch = ImageBuffer::gray(&binary, warp_size as u32, warp_size as u32);
            if let Some((found, corners)) = self.decode(&patch, candidate) {
                markers.push(RawMarker {
                    id: found.id,
                    corners,
                    hamming: found.distance,
                });
            }
        }
        markers
    }

    /// Samples grid cells of a binarised patch and matches them against the
    /// dictionary in all four orientations.
    fn decode(
        &self,
        patch: &ImageBuffer,
        mut candidate: MarkerCorners,
    ) -> Option<(DictionaryMatch, MarkerCorners)> {
        let mark_size = self.dictionary.mark_size;
        let cell = patch.width as usize / mark_size;
        let min_zero = (cell * cell) / 2;
        let cell_square = |row: usize, col: usize| Square {
            x: (col * cell) as u32,
            y: (row * cell) as u32,
            width: cell as u32,
            height: cell as u32,
        };

        // The outer ring of cells must be black.
        for i in 0..mark_size {
            let step = if i == 0 || i == mark_size - 1 {
                1
            } else {
                mark_size - 1
            };
            for j in (0..mark_size).step_by(step) {
                if CV::count_non_zero(patch, &cell_square(i, j)) > min_zero {
                    return None;
                }
            }
        }

        let inner = mark_size - 2;
        let mut bits = vec![0u8; inner * inner];
        for i in 0..inner {
            for j in 0..inner {
                let white = CV::count_non_zero(patch, &cell_square(i + 1, j + 1)) > min_zero;
                bits[i * inner + j] = u8::from(white);
            }
        }

        let mut best: Option<(DictionaryMatch, MarkerCorners)> = None;
        for _ in 0..4 {
            if let Some(m) = self.dictionary.find(&bits, self.params.max_hamming) {
                if best.map_or(true, |(b, _)| m.distance < b.distance) {
                    best = Some((m, candidate));
                }
                if m.distance == 0 {
                    break;
                }
            }
            // A counter-clockwise turn of the grid moves the marker's origin
            // one corner further along the clockwise candidate.
            bits = rotate_ccw(&bits, inner);
            candidate = [candidate[1], candidate[2], candidate[3], candidate[0]];
        }
        best
    }
}

impl<CV: ComputerVision> MarkerDetector for ArucoDetector<CV> {
    fn detect(&mut self, image: &ImageBuffer) -> Result<Vec<RawMarker>, DetectionError> {
        if !image.is_consistent() {
            return Err(DetectionError::InvalidInput(format!(
                "{}x{} image with {} channel(s) cannot hold {} bytes",
                image.width,
                image.height,
                image.channels,
                image.data.len()
            )));
        }
        Ok(self.find(image))
    }
}

/// Reorders each candidate so its corners run clockwise on screen.
fn clockwise_corners(candidates: &mut [MarkerCorners]) {
    for candidate in candidates.iter_mut() {
        let d1 = candidate[1] - candidate[0];
        let d2 = candidate[2] - candidate[0];
        if d1.x * d2.y - d1.y * d2.x < 0.0 {
            candidate.swap(1, 3);
        }
    }
}

/// Drops candidates whose corners lie close to a larger candidate's, such as
/// the inner and outer borders of the same marker.
fn not_too_near(candidates: Vec<MarkerCorners>, min_dist: f32) -> Vec<MarkerCorners> {
    let len = candidates.len();
    let mut too_near = vec![false; len];

    for i in 0..len {
        for j in (i + 1)..len {
            let dist: f32 = (0..4)
                .map(|k| (candidates[i][k] - candidates[j][k]).norm_squared())
                .sum();
            if dist / 4.0 < min_dist * min_dist {
                if perimeter_f(&candidates[i]) < perimeter_f(&candidates[j]) {
                    too_near[i] = true;
                } else {
                    too_near[j] = true;
                }
            }
        }
    }

    candidates
        .into_iter()
        .zip(too_near)
        .filter_map(|(c, near)| (!near).then_some(c))
        .collect()
}

/// Rotates a row-major square grid a quarter turn counter-clockwise.
fn rotate_ccw(src: &[u8], dim: usize) -> Vec<u8> {
    let mut dst = vec![0u8; dim * dim];
    for i in 0..dim {
        for j in 0..dim {
            dst[i * dim + j] = src[j * dim + (dim - 1 - i)];
        }
    }
    dst
}
