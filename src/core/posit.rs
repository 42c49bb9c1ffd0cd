// src/core/posit.rs

use nalgebra::{Matrix3, Vector2, Vector3};

/// Iteration stops once the mean corner angle error drops to this many
/// degrees.
const ANGLE_TOLERANCE_DEG: f64 = 2.0;
const MAX_ITERATIONS: usize = 100;

/// Both orthography hypotheses after refinement, best first.
#[derive(Debug, Clone, PartialEq)]
pub struct PositSolution {
    pub best_error: f64,
    pub best_rotation: Matrix3<f64>,
    pub best_translation: Vector3<f64>,
    pub alternative_error: f64,
    pub alternative_rotation: Matrix3<f64>,
    pub alternative_translation: Vector3<f64>,
}

/// Coplanar POSIT (Pose from Orthography and Scaling with Iterations) for a
/// square of known side.
///
/// Image points are relative to the principal point, in pixels of focal
/// length `focal_length`, with y pointing down. Model corners are
/// `(-h, h)`, `(h, h)`, `(h, -h)` and `(-h, -h)` in the marker plane, so the
/// returned rotation maps marker coordinates into a camera frame with x
/// right, y down and z forward.
#[derive(Debug, Clone)]
pub struct Posit {
    model: [Vector3<f64>; 4],
    focal_length: f64,
    model_vectors: Matrix3<f64>,
    model_normal: Vector3<f64>,
    model_pseudo_inverse: Matrix3<f64>,
}

impl Posit {
    /// Returns `None` when the model degenerates (non-positive size).
    pub fn new(model_size: f64, focal_length: f64) -> Option<Self> {
        if !(model_size.is_finite() && model_size > 0.0) {
            return None;
        }
        let half = model_size / 2.0;
        let model = [
            Vector3::new(-half, half, 0.0),
            Vector3::new(half, half, 0.0),
            Vector3::new(half, -half, 0.0),
            Vector3::new(-half, -half, 0.0),
        ];

        let model_vectors = Matrix3::from_rows(&[
            (model[1] - model[0]).transpose(),
            (model[2] - model[0]).transpose(),
            (model[3] - model[0]).transpose(),
        ]);

        let svd = model_vectors.svd(true, true);
        let u = svd.u?;
        let v = svd.v_t?.transpose();
        let d = svd.singular_values;

        // The model is planar, so one singular value is (numerically) zero and
        // its right singular vector is the plane normal.
        let tolerance = d.max() * 1e-9;
        let d_inv = d.map(|s| if s > tolerance { 1.0 / s } else { 0.0 });
        let model_pseudo_inverse = v * Matrix3::from_diagonal(&d_inv) * u.transpose();
        let model_normal = v.column(d.imin()).into_owned();

        Some(Self {
            model,
            focal_length,
            model_vectors,
            model_normal,
            model_pseudo_inverse,
        })
    }

    pub fn focal_length(&self) -> f64 {
        self.focal_length
    }

    /// Computes the Pose iterating over orthography hypotheses.
    pub fn pose(&self, points: &[Vector2<f64>; 4]) -> PositSolution {
        let ((r1, t1), (r2, t2)) = self.pos(points, &Vector3::new(1.0, 1.0, 1.0));

        let (rot1, trans1, error1) = self.iterate(points, r1, t1);
        let (rot2, trans2, error2) = self.iterate(points, r2, t2);

        if error1 < error2 {
            PositSolution {
                best_error: error1,
                best_rotation: rot1,
                best_translation: trans1,
                alternative_error: error2,
                alternative_rotation: rot2,
                alternative_translation: trans2,
            }
        } else {
            PositSolution {
                best_error: error2,
                best_rotation: rot2,
                best_translation: trans2,
                alternative_error: error1,
                alternative_rotation: rot1,
                alternative_translation: trans1,
            }
        }
    }

    /// One scaled-orthographic step. Returns both solutions of the planar
    /// ambiguity.
    #[allow(clippy::type_complexity)]
    fn pos(
        &self,
        points: &[Vector2<f64>; 4],
        eps: &Vector3<f64>,
    ) -> ((Matrix3<f64>, Vector3<f64>), (Matrix3<f64>, Vector3<f64>)) {
        let xi = Vector3::new(points[1].x, points[2].x, points[3].x);
        let yi = Vector3::new(points[1].y, points[2].y, points[3].y);

        let xs = xi.component_mul(eps).add_scalar(-points[0].x);
        let ys = yi.component_mul(eps).add_scalar(-points[0].y);

        let i0 = self.model_pseudo_inverse * xs;
        let j0 = self.model_pseudo_inverse * ys;

        let s = j0.norm_squared() - i0.norm_squared();
        let ij = i0.dot(&j0);

        let (r, theta) = if s == 0.0 {
            let r = (2.0 * ij).abs().sqrt();
            (r, -std::f64::consts::FRAC_PI_2 * ij.signum() * f64::from(ij != 0.0))
        } else {
            let r = (s * s + 4.0 * ij * ij).sqrt().sqrt();
            let mut theta = (-2.0 * ij / s).atan();
            if s < 0.0 {
                theta += std::f64::consts::PI;
            }
            (r, theta / 2.0)
        };

        let lambda = r * theta.cos();
        let mu = r * theta.sin();

        let first = self.solution(
            points,
            i0 + self.model_normal * lambda,
            j0 + self.model_normal * mu,
        );
        let second = self.solution(
            points,
            i0 - self.model_normal * lambda,
            j0 - self.model_normal * mu,
        );
        (first, second)
    }

    fn solution(
        &self,
        points: &[Vector2<f64>; 4],
        mut i: Vector3<f64>,
        mut j: Vector3<f64>,
    ) -> (Matrix3<f64>, Vector3<f64>) {
        let inorm = i.normalize_mut();
        let jnorm = j.normalize_mut();
        let k = i.cross(&j);
        // Rows are the camera axes expressed in marker coordinates.
        let rotation = Matrix3::from_rows(&[i.transpose(), j.transpose(), k.transpose()]);

        let scale = (inorm + jnorm) / 2.0;
        let temp = rotation * self.model[0];
        let translation = Vector3::new(
            points[0].x / scale - temp.x,
            points[0].y / scale - temp.y,
            self.focal_length / scale - temp.z,
        );
        (rotation, translation)
    }

    fn iterate(
        &self,
        points: &[Vector2<f64>; 4],
        mut rotation: Matrix3<f64>,
        mut translation: Vector3<f64>,
    ) -> (Matrix3<f64>, Vector3<f64>, f64) {
        let mut prev_error = f64::INFINITY;
        let mut error = f64::INFINITY;

        for _ in 0..MAX_ITERATIONS {
            let row2 = rotation.row(2).transpose();
            let eps = ((self.model_vectors * row2) / translation.z).add_scalar(1.0);

            let ((r1, t1), (r2, t2)) = self.pos(points, &eps);
            let error1 = self.get_error(points, &r1, &t1);
            let error2 = self.get_error(points, &r2, &t2);

            (rotation, translation, error) = if error1 < error2 {
                (r1, t1, error1)
            } else {
                (r2, t2, error2)
            };

            if error <= ANGLE_TOLERANCE_DEG || error > prev_error {
                break;
            }
            prev_error = error;
        }

        (rotation, translation, error)
    }

    /// Mean difference, in degrees, between the corner angles of the observed
    /// quad and of the model projected with the candidate pose.
    fn get_error(
        &self,
        points: &[Vector2<f64>; 4],
        rotation: &Matrix3<f64>,
        translation: &Vector3<f64>,
    ) -> f64 {
        let modeled = self.model.map(|m| {
            let v = rotation * m + translation;
            Vector2::new(v.x * self.focal_length / v.z, v.y * self.focal_length / v.z)
        });

        let corner_angles = |p: &[Vector2<f64>; 4]| {
            [
                Self::angle(&p[0], &p[1], &p[3]),
                Self::angle(&p[1], &p[2], &p[0]),
                Self::angle(&p[2], &p[3], &p[1]),
                Self::angle(&p[3], &p[0], &p[2]),
            ]
        };
        let observed = corner_angles(points);
        let projected = corner_angles(&modeled);
        observed
            .iter()
            .zip(projected.iter())
            .map(|(a, b)| (a - b).abs())
            .sum::<f64>()
            / 4.0
    }

    fn angle(a: &Vector2<f64>, b: &Vector2<f64>, c: &Vector2<f64>) -> f64 {
        let u = b - a;
        let v = c - a;
        // Clamp domain to avoid NaN from float imprecision
        let cos_val = (u.dot(&v) / (u.norm() * v.norm())).clamp(-1.0, 1.0);
        cos_val.acos().to_degrees()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Rotation3;

    fn project(
        posit: &Posit,
        rotation: &Matrix3<f64>,
        translation: &Vector3<f64>,
    ) -> [Vector2<f64>; 4] {
        posit.model.map(|m| {
            let v = rotation * m + translation;
            Vector2::new(posit.focal_length * v.x / v.z, posit.focal_length * v.y / v.z)
        })
    }

    #[test]
    fn frontal_marker_depth_from_apparent_size() {
        let posit = Posit::new(35.0, 500.0).unwrap();
        // 100 px wide, centred, image y pointing down
        let points = [
            Vector2::new(-50.0, -50.0),
            Vector2::new(50.0, -50.0),
            Vector2::new(50.0, 50.0),
            Vector2::new(-50.0, 50.0),
        ];
        let pose = posit.pose(&points);
        let t = pose.best_translation;
        // 500 * 35 / 100
        assert_relative_eq!(t.z, 175.0, epsilon = 1e-6);
        assert!(t.x.abs() < 1e-6 && t.y.abs() < 1e-6);
        // marker y axis points up, camera y points down
        let flipped = Matrix3::new(1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, -1.0);
        assert_relative_eq!(pose.best_rotation, flipped, epsilon = 1e-6);
    }

    #[test]
    fn tilted_marker_is_recovered() {
        let posit = Posit::new(0.05, 500.0).unwrap();
        let truth = Rotation3::from_euler_angles(std::f64::consts::PI + 0.3, 0.2, 0.0);
        let translation = Vector3::new(0.02, -0.01, 0.4);
        let points = project(&posit, truth.matrix(), &translation);

        let pose = posit.pose(&points);
        assert!(pose.best_error < ANGLE_TOLERANCE_DEG);
        assert_relative_eq!(pose.best_translation, translation, max_relative = 0.02);
        assert_relative_eq!(pose.best_rotation, *truth.matrix(), epsilon = 0.03);
    }

    #[test]
    fn rejects_degenerate_model() {
        assert!(Posit::new(0.0, 500.0).is_none());
        assert!(Posit::new(f64::NAN, 500.0).is_none());
    }
}
