//! Planar geometry shared by the estimators and the undistorter.
//!
//! Contains the normalized DLT homography, the decomposition of a
//! plane-induced homography into a board pose, axis-angle rotations that
//! work on both plain floats and the solver's dual numbers, and image grid
//! sampling.

use crate::camera::CameraModelError;
use nalgebra::{DMatrix, Matrix3, RealField, Rotation3, Vector2, Vector3};

/// Rigid transform from the board frame into the camera frame, stored as
/// an axis-angle rotation and a translation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoardPose {
    pub rotation: Vector3<f64>,
    pub translation: Vector3<f64>,
}

impl BoardPose {
    pub fn identity() -> Self {
        BoardPose {
            rotation: Vector3::zeros(),
            translation: Vector3::zeros(),
        }
    }

    /// Packs the pose as `[rx, ry, rz, tx, ty, tz]`.
    pub fn to_vec(&self) -> Vec<f64> {
        vec![
            self.rotation.x,
            self.rotation.y,
            self.rotation.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
        ]
    }

    pub fn from_slice(params: &[f64]) -> Result<Self, CameraModelError> {
        if params.len() != 6 {
            return Err(CameraModelError::InvalidParams(format!(
                "Expected 6 pose parameters, found {}",
                params.len()
            )));
        }
        Ok(BoardPose {
            rotation: Vector3::new(params[0], params[1], params[2]),
            translation: Vector3::new(params[3], params[4], params[5]),
        })
    }

    /// Maps a board point into camera coordinates.
    pub fn transform(&self, point: &Vector3<f64>) -> Vector3<f64> {
        rotate_axis_angle(&self.rotation, point) + self.translation
    }
}

/// Rotates `point` by the axis-angle vector `rvec` (Rodrigues' formula).
pub fn rotate_axis_angle<T: RealField>(rvec: &Vector3<T>, point: &Vector3<T>) -> Vector3<T> {
    let theta2 = rvec.dot(rvec);
    if theta2 > nalgebra::convert::<f64, T>(f64::EPSILON) {
        let theta = theta2.sqrt();
        let sin_theta = theta.clone().sin();
        let cos_theta = theta.clone().cos();
        let axis = rvec / theta;
        let axis_dot = axis.dot(point);
        point * cos_theta.clone()
            + axis.cross(point) * sin_theta
            + axis * (axis_dot * (T::one() - cos_theta))
    } else {
        // First-order expansion keeps derivatives finite at the identity.
        point + rvec.cross(point)
    }
}

/// Hartley normalization: zero mean, mean distance `sqrt(2)`.
fn normalize_points(points: &[Vector2<f64>]) -> Option<(Vec<Vector2<f64>>, Matrix3<f64>)> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let centroid = points.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;
    let mean_distance = points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n;
    if mean_distance <= f64::EPSILON {
        return None;
    }

    let scale = std::f64::consts::SQRT_2 / mean_distance;
    let transform = Matrix3::new(
        scale,
        0.0,
        -scale * centroid.x,
        0.0,
        scale,
        -scale * centroid.y,
        0.0,
        0.0,
        1.0,
    );
    let normalized = points.iter().map(|p| (p - centroid) * scale).collect();
    Some((normalized, transform))
}

/// Estimates `H` such that `image ~ H * [plane.x, plane.y, 1]` with the
/// normalized Direct Linear Transform.
///
/// # Errors
///
/// * [`CameraModelError::InvalidParams`]: fewer than 4 correspondences or mismatched lengths.
/// * [`CameraModelError::NumericalError`]: degenerate (e.g. collinear) configuration.
pub fn estimate_homography(
    plane: &[Vector2<f64>],
    image: &[Vector2<f64>],
) -> Result<Matrix3<f64>, CameraModelError> {
    let n = plane.len();
    if n < 4 || image.len() != n {
        return Err(CameraModelError::InvalidParams(format!(
            "Homography needs at least 4 matching points, got {} and {}",
            n,
            image.len()
        )));
    }

    let degenerate =
        || CameraModelError::NumericalError("Degenerate point configuration".to_string());
    let (plane_n, t_plane) = normalize_points(plane).ok_or_else(degenerate)?;
    let (image_n, t_image) = normalize_points(image).ok_or_else(degenerate)?;

    // At least 9 rows so the SVD exposes the full null space.
    let rows = (2 * n).max(9);
    let mut a = DMatrix::<f64>::zeros(rows, 9);
    for (i, (p, q)) in plane_n.iter().zip(image_n.iter()).enumerate() {
        let (x, y, u, v) = (p.x, p.y, q.x, q.y);
        let r0 = 2 * i;
        let r1 = 2 * i + 1;

        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    let svd = a.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| CameraModelError::NumericalError("SVD failed".to_string()))?;
    let smallest = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .map(|(idx, _)| idx)
        .ok_or_else(degenerate)?;
    let h = v_t.row(smallest);

    let h_norm = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);
    let t_image_inv = t_image.try_inverse().ok_or_else(degenerate)?;
    let mut homography = t_image_inv * h_norm * t_plane;

    let scale = homography[(2, 2)];
    if scale.abs() > f64::EPSILON {
        homography /= scale;
    }
    if homography.iter().any(|v| !v.is_finite()) {
        return Err(degenerate());
    }
    Ok(homography)
}

/// Decomposes a plane-induced homography into the pose of the `Z = 0`
/// board relative to the camera, given the camera matrix `K`.
///
/// The rotation is projected onto SO(3); the board is kept in front of the camera.
pub fn pose_from_homography(
    k: &Matrix3<f64>,
    homography: &Matrix3<f64>,
) -> Result<BoardPose, CameraModelError> {
    let degenerate = || {
        CameraModelError::NumericalError("Degenerate homography for pose extraction".to_string())
    };
    let k_inv = k.try_inverse().ok_or_else(|| {
        CameraModelError::InvalidCalibration("camera matrix is not invertible".to_string())
    })?;

    let h1 = k_inv * homography.column(0);
    let h2 = k_inv * homography.column(1);
    let h3 = k_inv * homography.column(2);

    let denom = 0.5 * (h1.norm() + h2.norm());
    if denom <= 1e-12 {
        return Err(degenerate());
    }
    let lambda = 1.0 / denom;

    let mut r1 = h1 * lambda;
    let mut r2 = h2 * lambda;
    let mut t = h3 * lambda;
    if t.z < 0.0 {
        r1 = -r1;
        r2 = -r2;
        t = -t;
    }
    let r3 = r1.cross(&r2);
    if r3.norm() <= 1e-12 {
        return Err(degenerate());
    }

    let r = Matrix3::from_columns(&[r1, r2, r3]);
    let svd = r.svd(true, true);
    let u = svd.u.ok_or_else(degenerate)?;
    let v_t = svd.v_t.ok_or_else(degenerate)?;
    let mut rotation = u * v_t;
    if rotation.determinant() < 0.0 {
        let mut u_fixed = u;
        u_fixed.column_mut(2).neg_mut();
        rotation = u_fixed * v_t;
    }

    let rotation = Rotation3::from_matrix_unchecked(rotation);
    Ok(BoardPose {
        rotation: rotation.scaled_axis(),
        translation: t,
    })
}

/// Generates an `nx` x `ny` grid of pixel positions spanning
/// `[0, width - 1] x [0, height - 1]`, row by row.
pub fn grid_points(width: f64, height: f64, nx: usize, ny: usize) -> Vec<Vector2<f64>> {
    let step_x = if nx > 1 { (width - 1.0) / (nx - 1) as f64 } else { 0.0 };
    let step_y = if ny > 1 { (height - 1.0) / (ny - 1) as f64 } else { 0.0 };

    let mut points = Vec::with_capacity(nx * ny);
    for i in 0..ny {
        for j in 0..nx {
            points.push(Vector2::new(j as f64 * step_x, i as f64 * step_y));
        }
    }
    points
}
