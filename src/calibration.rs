// src/calibration.rs
//
// Camera calibration profiles.
//
// A profile is immutable: resolution changes produce a scaled copy. Scaling
// uses one factor (target width / reference width) for fx, fy, cx and cy and
// keeps the distortion coefficients, which is only an approximation of a
// real recalibration.

use std::{fs, path::Path};

use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};

use crate::error::CalibrationError;

/// Iteration settings for the fixed-point undistortion.
const UNDISTORT_MAX_ITERS: usize = 15;
const UNDISTORT_EPS: f64 = 1e-12;

/// Pinhole intrinsics plus Brown-Conrady distortion `(k1, k2, p1, p2, k3)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawProfile", into = "RawProfile")]
pub struct CalibrationProfile {
    fx: f64,
    fy: f64,
    cx: f64,
    cy: f64,
    distortion: [f64; 5],
    resolution: Option<(u32, u32)>,
}

/// Wire format: 9-element row-major intrinsic array and 5 distortion values.
#[derive(Serialize, Deserialize)]
struct RawProfile {
    intrinsic: [f64; 9],
    distortion: [f64; 5],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resolution: Option<(u32, u32)>,
}

impl TryFrom<RawProfile> for CalibrationProfile {
    type Error = CalibrationError;

    fn try_from(raw: RawProfile) -> Result<Self, Self::Error> {
        let profile = Self::from_arrays(&raw.intrinsic, &raw.distortion)?;
        match raw.resolution {
            Some((w, h)) => profile.with_resolution(w, h),
            None => Ok(profile),
        }
    }
}

impl From<CalibrationProfile> for RawProfile {
    fn from(p: CalibrationProfile) -> Self {
        Self {
            intrinsic: p.intrinsic_array(),
            distortion: p.distortion,
            resolution: p.resolution,
        }
    }
}

fn check(name: &'static str, value: f64, positive: bool) -> Result<(), CalibrationError> {
    if !value.is_finite() || (positive && value <= 0.0) {
        return Err(CalibrationError::InvalidParameter { name, value });
    }
    Ok(())
}

impl CalibrationProfile {
    pub fn new(
        fx: f64,
        fy: f64,
        cx: f64,
        cy: f64,
        distortion: [f64; 5],
    ) -> Result<Self, CalibrationError> {
        check("fx", fx, true)?;
        check("fy", fy, true)?;
        check("cx", cx, false)?;
        check("cy", cy, false)?;
        const NAMES: [&str; 5] = ["k1", "k2", "p1", "p2", "k3"];
        for (name, &k) in NAMES.iter().zip(distortion.iter()) {
            check(name, k, false)?;
        }
        Ok(Self {
            fx,
            fy,
            cx,
            cy,
            distortion,
            resolution: None,
        })
    }

    /// Parse the row-major intrinsic array and distortion vector.
    pub fn from_arrays(
        intrinsic: &[f64; 9],
        distortion: &[f64; 5],
    ) -> Result<Self, CalibrationError> {
        for (idx, expected) in [(1, 0.0), (3, 0.0), (6, 0.0), (7, 0.0), (8, 1.0)] {
            if intrinsic[idx] != expected {
                return Err(CalibrationError::Structure(format!(
                    "element {idx} is {}, expected {expected}",
                    intrinsic[idx]
                )));
            }
        }
        Self::new(
            intrinsic[0],
            intrinsic[4],
            intrinsic[2],
            intrinsic[5],
            *distortion,
        )
    }

    /// Distortion-free profile for an uncalibrated camera: focal length
    /// `max(width, height)`, principal point at the image centre.
    pub fn nominal(width: u32, height: u32) -> Result<Self, CalibrationError> {
        if width == 0 || height == 0 {
            return Err(CalibrationError::InvalidResolution { width, height });
        }
        let f = width.max(height) as f64;
        Self::new(f, f, width as f64 / 2.0, height as f64 / 2.0, [0.0; 5])?
            .with_resolution(width, height)
    }

    /// Record the image resolution the profile was calibrated at.
    pub fn with_resolution(mut self, width: u32, height: u32) -> Result<Self, CalibrationError> {
        if width == 0 || height == 0 {
            return Err(CalibrationError::InvalidResolution { width, height });
        }
        self.resolution = Some((width, height));
        Ok(self)
    }

    pub fn fx(&self) -> f64 {
        self.fx
    }

    pub fn fy(&self) -> f64 {
        self.fy
    }

    pub fn cx(&self) -> f64 {
        self.cx
    }

    pub fn cy(&self) -> f64 {
        self.cy
    }

    pub fn distortion(&self) -> [f64; 5] {
        self.distortion
    }

    pub fn resolution(&self) -> Option<(u32, u32)> {
        self.resolution
    }

    /// Row-major `[fx,0,cx, 0,fy,cy, 0,0,1]`.
    pub fn intrinsic_array(&self) -> [f64; 9] {
        [
            self.fx, 0.0, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        ]
    }

    pub fn intrinsic_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }

    /// Copy scaled from `from_width` pixels wide to `to_width` pixels wide.
    pub fn scaled(&self, from_width: u32, to_width: u32) -> Result<Self, CalibrationError> {
        if from_width == 0 || to_width == 0 {
            return Err(CalibrationError::InvalidResolution {
                width: to_width,
                height: 0,
            });
        }
        let s = to_width as f64 / from_width as f64;
        let resolution = self
            .resolution
            .map(|(_, h)| (to_width, ((h as f64 * s).round() as u32).max(1)));
        Ok(Self {
            fx: self.fx * s,
            fy: self.fy * s,
            cx: self.cx * s,
            cy: self.cy * s,
            distortion: self.distortion,
            resolution,
        })
    }

    /// Copy matching a `width`x`height` image. Profiles without a reference
    /// resolution are returned unchanged.
    pub fn scaled_to_resolution(&self, width: u32, height: u32) -> Result<Self, CalibrationError> {
        if width == 0 || height == 0 {
            return Err(CalibrationError::InvalidResolution { width, height });
        }
        match self.resolution {
            Some((w, h)) if (w, h) == (width, height) => Ok(*self),
            Some((w, _)) => {
                let mut scaled = self.scaled(w, width)?;
                scaled.resolution = Some((width, height));
                Ok(scaled)
            }
            None => Ok(*self),
        }
    }

    /// Map a pixel to normalized pinhole coordinates (no distortion applied).
    pub fn pixel_to_normalized(&self, pixel: [f64; 2]) -> [f64; 2] {
        [(pixel[0] - self.cx) / self.fx, (pixel[1] - self.cy) / self.fy]
    }

    pub fn normalized_to_pixel(&self, normalized: [f64; 2]) -> [f64; 2] {
        [
            self.fx * normalized[0] + self.cx,
            self.fy * normalized[1] + self.cy,
        ]
    }

    /// Apply lens distortion to normalized coordinates.
    pub fn distort_normalized(&self, normalized: [f64; 2]) -> [f64; 2] {
        let [k1, k2, p1, p2, k3] = self.distortion;
        let [x, y] = normalized;
        let r2 = x * x + y * y;
        let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
        let x_tan = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
        let y_tan = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
        [x * radial + x_tan, y * radial + y_tan]
    }

    /// Remove lens distortion from an image pixel, returning normalized
    /// coordinates. `None` when the iteration leaves the valid domain.
    pub fn undistort_to_normalized(&self, pixel: [f64; 2]) -> Option<[f64; 2]> {
        let xd = self.pixel_to_normalized(pixel);
        if !self.has_distortion() {
            return Some(xd);
        }
        let [k1, k2, p1, p2, k3] = self.distortion;
        let (mut x, mut y) = (xd[0], xd[1]);
        for _ in 0..UNDISTORT_MAX_ITERS {
            let r2 = x * x + y * y;
            let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
            if !radial.is_finite() || radial.abs() < 1e-12 {
                return None;
            }
            let dx_tan = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
            let dy_tan = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
            let x_next = (xd[0] - dx_tan) / radial;
            let y_next = (xd[1] - dy_tan) / radial;
            if !x_next.is_finite() || !y_next.is_finite() {
                return None;
            }
            let step = (x_next - x).hypot(y_next - y);
            x = x_next;
            y = y_next;
            if step <= UNDISTORT_EPS {
                break;
            }
        }
        Some([x, y])
    }

    pub fn has_distortion(&self) -> bool {
        self.distortion.iter().any(|&k| k != 0.0)
    }

    /// Load a profile from a JSON file holding `intrinsic` and `distortion`.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, CalibrationError> {
        let raw = fs::read_to_string(path)?;
        let raw: RawProfile = serde_json::from_str(&raw)?;
        Self::try_from(raw)
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), CalibrationError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}
