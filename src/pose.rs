// src/pose.rs
//
// Marker poses and the estimator that turns validated corners into them.

use std::collections::BTreeMap;
use std::sync::Arc;

use nalgebra::{Matrix3, Rotation3, Unit, UnitQuaternion, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::calibration::CalibrationProfile;
use crate::core::posit::Posit;
use crate::detection::DetectionResult;
use crate::error::PoseEstimationError;
use crate::{MarkerCorners, MarkerId};

/// Rotation (Rodrigues vector) and translation of a marker in camera
/// coordinates: x right, y down, z forward. Translation is in the unit of
/// the marker size given to the estimator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub rvec: Vector3<f64>,
    pub tvec: Vector3<f64>,
}

impl Pose {
    pub fn new(rvec: Vector3<f64>, tvec: Vector3<f64>) -> Self {
        Self { rvec, tvec }
    }

    /// Rotation angle in radians.
    pub fn angle(&self) -> f64 {
        self.rvec.norm()
    }

    /// Orientation as a unit quaternion; identity for a zero rotation.
    pub fn quaternion(&self) -> UnitQuaternion<f64> {
        let angle = self.angle();
        if angle == 0.0 || !angle.is_finite() {
            return UnitQuaternion::identity();
        }
        UnitQuaternion::from_axis_angle(&Unit::new_normalize(self.rvec), angle)
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.quaternion().to_rotation_matrix().into_inner()
    }

    /// Roll, pitch and yaw in radians.
    pub fn euler_angles(&self) -> (f64, f64, f64) {
        self.quaternion().euler_angles()
    }

    /// Row-major rigid transform, marker to camera.
    pub fn transform(&self) -> [[f32; 4]; 4] {
        let r = self.rotation_matrix();
        let t = self.tvec;
        let mut m = [[0.0f32; 4]; 4];
        for (i, row) in m.iter_mut().take(3).enumerate() {
            for (j, cell) in row.iter_mut().take(3).enumerate() {
                *cell = r[(i, j)] as f32;
            }
            row[3] = t[i] as f32;
        }
        m[3][3] = 1.0;
        m
    }
}

/// Poses of one frame keyed by marker id.
pub type PoseMap = BTreeMap<MarkerId, Pose>;

/// Camera model derived once from a calibration profile.
#[derive(Debug, Clone)]
pub struct CameraModel {
    profile: CalibrationProfile,
    intrinsic: Matrix3<f64>,
}

impl CameraModel {
    pub fn new(profile: &CalibrationProfile) -> Self {
        Self {
            profile: *profile,
            intrinsic: profile.intrinsic_matrix(),
        }
    }

    pub fn profile(&self) -> &CalibrationProfile {
        &self.profile
    }

    pub fn intrinsic(&self) -> &Matrix3<f64> {
        &self.intrinsic
    }
}

/// A pose estimation primitive for one square marker.
pub trait PoseSolver: Send {
    fn solve(
        &mut self,
        id: MarkerId,
        corners: &MarkerCorners,
        marker_size: f64,
        camera: &CameraModel,
    ) -> Result<Pose, PoseEstimationError>;
}

/// Built-in solver: undistorts the corners, then runs coplanar POSIT.
#[derive(Debug, Default)]
pub struct PositSolver {
    // Keyed by (marker size, focal length).
    cached: Option<((f64, f64), Posit)>,
}

impl PositSolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn posit(&mut self, marker_size: f64, focal: f64) -> Result<&Posit, PoseEstimationError> {
        let key = (marker_size, focal);
        let stale = self.cached.as_ref().map_or(true, |(k, _)| *k != key);
        if stale {
            let posit = Posit::new(marker_size, focal)
                .ok_or(PoseEstimationError::InvalidMarkerSize(marker_size))?;
            self.cached = Some((key, posit));
        }
        self.cached
            .as_ref()
            .map(|(_, posit)| posit)
            .ok_or(PoseEstimationError::InvalidMarkerSize(marker_size))
    }
}

impl PoseSolver for PositSolver {
    fn solve(
        &mut self,
        id: MarkerId,
        corners: &MarkerCorners,
        marker_size: f64,
        camera: &CameraModel,
    ) -> Result<Pose, PoseEstimationError> {
        let profile = camera.profile();
        let focal = profile.fx();

        let mut points = [Vector2::zeros(); 4];
        for (corner, (pixel, point)) in corners.iter().zip(points.iter_mut()).enumerate() {
            let [x, y] = profile
                .undistort_to_normalized([pixel.x as f64, pixel.y as f64])
                .ok_or(PoseEstimationError::Undistortion { id, corner })?;
            *point = Vector2::new(x * focal, y * focal);
        }

        let solution = self.posit(marker_size, focal)?.pose(&points);
        let rotation = solution.best_rotation;
        let tvec = solution.best_translation;
        if !(rotation.iter().all(|v| v.is_finite()) && tvec.iter().all(|v| v.is_finite()))
            || tvec.z <= 0.0
        {
            return Err(PoseEstimationError::Degenerate { id });
        }

        let rotation = nearest_rotation(&rotation).ok_or(PoseEstimationError::Degenerate { id })?;
        let rvec = UnitQuaternion::from_rotation_matrix(&rotation).scaled_axis();
        Ok(Pose::new(rvec, tvec))
    }
}

/// Closest proper rotation to `m` in the Frobenius sense.
fn nearest_rotation(m: &Matrix3<f64>) -> Option<Rotation3<f64>> {
    let svd = m.svd(true, true);
    let mut u = svd.u?;
    let v_t = svd.v_t?;
    if (u * v_t).determinant() < 0.0 {
        let weakest = svd.singular_values.imin();
        u.column_mut(weakest).neg_mut();
    }
    Some(Rotation3::from_matrix_unchecked(u * v_t))
}

/// Adapter owning the pose primitive and the camera model derived from the
/// current calibration snapshot.
pub struct PoseEstimator {
    solver: Box<dyn PoseSolver>,
    snapshot: Option<(Arc<CalibrationProfile>, CameraModel)>,
    recalibrations: u64,
}

impl PoseEstimator {
    pub fn new(solver: Box<dyn PoseSolver>) -> Self {
        Self {
            solver,
            snapshot: None,
            recalibrations: 0,
        }
    }

    /// Estimator using [`PositSolver`].
    pub fn posit() -> Self {
        Self::new(Box::new(PositSolver::new()))
    }

    /// How many times the camera model has been (re)built.
    pub fn recalibrations(&self) -> u64 {
        self.recalibrations
    }

    /// Camera model for `calibration`, rebuilt only when a different
    /// snapshot is handed in.
    fn camera(&mut self, calibration: &Arc<CalibrationProfile>) -> CameraModel {
        if let Some((snapshot, camera)) = &self.snapshot {
            if Arc::ptr_eq(snapshot, calibration) {
                return camera.clone();
            }
        }
        self.recalibrations += 1;
        debug!(
            fx = calibration.fx(),
            fy = calibration.fy(),
            rebuilds = self.recalibrations,
            "camera model rebuilt"
        );
        let camera = CameraModel::new(calibration);
        self.snapshot = Some((Arc::clone(calibration), camera.clone()));
        camera
    }

    /// Pose of every marker in `detection`. Fails as a whole when any marker
    /// cannot be solved.
    pub fn estimate(
        &mut self,
        detection: &DetectionResult,
        marker_size: f64,
        calibration: &Arc<CalibrationProfile>,
    ) -> Result<PoseMap, PoseEstimationError> {
        if !(marker_size.is_finite() && marker_size > 0.0) {
            return Err(PoseEstimationError::InvalidMarkerSize(marker_size));
        }
        let camera = self.camera(calibration);
        let mut poses = PoseMap::new();
        for marker in &detection.markers {
            let pose = self
                .solver
                .solve(marker.id, &marker.corners, marker_size, &camera)?;
            poses.insert(marker.id, pose);
        }
        Ok(poses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::DetectedMarker;
    use crate::Point2f;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn zero_rotation_is_identity() {
        let pose = Pose::new(Vector3::zeros(), Vector3::new(0.0, 0.0, 1.0));
        assert_eq!(pose.quaternion(), UnitQuaternion::identity());
        assert_eq!(pose.angle(), 0.0);
        assert_eq!(pose.transform()[2][3], 1.0);
    }

    #[test]
    fn rotation_about_x_is_recovered() {
        let theta = 0.7;
        let pose = Pose::new(Vector3::new(theta, 0.0, 0.0), Vector3::zeros());
        let q = pose.quaternion();
        assert_relative_eq!(q.angle(), theta, epsilon = 1e-12);
        let axis = q.axis().unwrap();
        assert_relative_eq!(axis.into_inner(), Vector3::x(), epsilon = 1e-12);
        let (roll, pitch, yaw) = pose.euler_angles();
        assert_relative_eq!(roll, theta, epsilon = 1e-12);
        assert!(pitch.abs() < 1e-12 && yaw.abs() < 1e-12);
    }

    #[test]
    fn half_turn_keeps_its_axis() {
        let flipped = Matrix3::new(1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, -1.0);
        let rotation = nearest_rotation(&flipped).unwrap();
        let rvec = UnitQuaternion::from_rotation_matrix(&rotation).scaled_axis();
        assert_relative_eq!(rvec.norm(), std::f64::consts::PI, epsilon = 1e-9);
        assert_relative_eq!(rvec.x.abs(), std::f64::consts::PI, epsilon = 1e-9);
    }

    #[test]
    fn transform_is_row_major() {
        let pose = Pose::new(Vector3::new(0.0, 0.0, FRAC_PI_2), Vector3::new(1.0, 2.0, 3.0));
        let m = pose.transform();
        // z quarter turn: x axis maps onto y
        assert_relative_eq!(m[1][0], 1.0, epsilon = 1e-6);
        assert_relative_eq!(m[0][1], -1.0, epsilon = 1e-6);
        assert_eq!([m[0][3], m[1][3], m[2][3]], [1.0, 2.0, 3.0]);
        assert_eq!(m[3], [0.0, 0.0, 0.0, 1.0]);
    }

    fn square(center: (f32, f32), half: f32) -> DetectionResult {
        let (cx, cy) = center;
        DetectionResult {
            markers: vec![DetectedMarker {
                id: 3,
                corners: [
                    Point2f::new(cx - half, cy - half),
                    Point2f::new(cx + half, cy - half),
                    Point2f::new(cx + half, cy + half),
                    Point2f::new(cx - half, cy + half),
                ],
                hamming: 0,
                area: 4.0 * half * half,
            }],
            dropped: 0,
        }
    }

    #[test]
    fn frontal_marker_sits_in_front_of_the_camera() {
        let calibration = Arc::new(CalibrationProfile::nominal(640, 480).unwrap());
        let mut estimator = PoseEstimator::posit();
        let poses = estimator
            .estimate(&square((320.0, 240.0), 32.0), 0.05, &calibration)
            .unwrap();
        let pose = poses[&3];
        // focal 640, 64 px wide, 5 cm marker
        assert_relative_eq!(pose.tvec.z, 0.5, max_relative = 1e-6);
        assert!(pose.tvec.x.abs() < 1e-9 && pose.tvec.y.abs() < 1e-9);
        // marker faces the camera: half turn about x
        assert_relative_eq!(pose.angle(), std::f64::consts::PI, epsilon = 1e-6);
    }

    #[test]
    fn camera_model_is_rebuilt_only_for_new_snapshots() {
        let first = Arc::new(CalibrationProfile::nominal(640, 480).unwrap());
        let mut estimator = PoseEstimator::posit();
        let detection = square((300.0, 200.0), 20.0);
        for _ in 0..3 {
            estimator.estimate(&detection, 0.05, &first).unwrap();
        }
        assert_eq!(estimator.recalibrations(), 1);

        // equal contents, but an explicit new snapshot
        let second = Arc::new(*first);
        estimator.estimate(&detection, 0.05, &second).unwrap();
        assert_eq!(estimator.recalibrations(), 2);
    }

    #[test]
    fn invalid_marker_size_is_rejected() {
        let calibration = Arc::new(CalibrationProfile::nominal(640, 480).unwrap());
        let mut estimator = PoseEstimator::posit();
        assert_eq!(
            estimator.estimate(&square((320.0, 240.0), 20.0), -1.0, &calibration),
            Err(PoseEstimationError::InvalidMarkerSize(-1.0))
        );
        assert!(estimator
            .estimate(&DetectionResult::default(), 0.05, &calibration)
            .unwrap()
            .is_empty());
    }
}
