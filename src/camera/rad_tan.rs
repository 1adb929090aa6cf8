//! Implements the pinhole camera with Radial-Tangential (RadTan) distortion.
//!
//! The distortion follows the OpenCV rational polynomial layout
//! `[k1, k2, p1, p2, k3, k4, k5, k6]`. With `k4..k6` at zero this is the
//! classic 5-coefficient Brown-Conrady model that the calibration estimates.

use crate::camera::{validation, CameraModel, CameraModelError, Intrinsics};
use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of coefficients in the flat distortion vector.
pub const RAD_TAN_COEFFICIENTS: usize = 8;

/// Pinhole camera with radial and tangential lens distortion.
///
/// # Examples
///
/// ```rust
/// use camcal::camera::rad_tan::RadTanModel;
/// use camcal::camera::{CameraModel, Intrinsics};
/// use nalgebra::Vector3;
///
/// let intrinsics = Intrinsics { fx: 500.0, fy: 500.0, cx: 320.0, cy: 240.0 };
/// let model = RadTanModel::new(intrinsics, 0.0, [0.0; 8]).unwrap();
///
/// let pixel = model.project(&Vector3::new(0.1, 0.2, 1.0)).unwrap();
/// assert!((pixel.x - 370.0).abs() < 1e-9);
/// assert!((pixel.y - 340.0).abs() < 1e-9);
/// ```
#[derive(Clone, Serialize, Deserialize)]
pub struct RadTanModel {
    /// Focal length and principal point in pixels.
    pub intrinsics: Intrinsics,
    /// Off-diagonal camera-matrix term.
    pub skew: f64,
    /// `[k1, k2, p1, p2, k3, k4, k5, k6]`.
    pub distortions: [f64; RAD_TAN_COEFFICIENTS],
}

impl RadTanModel {
    /// Creates a new [`RadTanModel`] and validates its intrinsics.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::FocalLengthMustBePositive`]
    /// * [`CameraModelError::PrincipalPointMustBeFinite`]
    pub fn new(
        intrinsics: Intrinsics,
        skew: f64,
        distortions: [f64; RAD_TAN_COEFFICIENTS],
    ) -> Result<Self, CameraModelError> {
        let model = RadTanModel {
            intrinsics,
            skew,
            distortions,
        };
        model.validate_params()?;
        Ok(model)
    }

    /// Converts a pixel into normalized (distorted) image-plane coordinates.
    pub fn pixel_to_normalized(&self, pixel: &Vector2<f64>) -> Vector2<f64> {
        let y = (pixel.y - self.intrinsics.cy) / self.intrinsics.fy;
        let x = (pixel.x - self.intrinsics.cx - self.skew * y) / self.intrinsics.fx;
        Vector2::new(x, y)
    }

    /// Converts normalized (distorted) image-plane coordinates into a pixel.
    pub fn normalized_to_pixel(&self, point: &Vector2<f64>) -> Vector2<f64> {
        Vector2::new(
            self.intrinsics.fx * point.x + self.skew * point.y + self.intrinsics.cx,
            self.intrinsics.fy * point.y + self.intrinsics.cy,
        )
    }
}

/// Provides a debug string representation for [`RadTanModel`].
impl fmt::Debug for RadTanModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RadTanModel [fx: {} fy: {} cx: {} cy: {} skew: {} distortions: {:?}]",
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
            self.skew,
            self.distortions,
        )
    }
}

impl CameraModel for RadTanModel {
    /// Projects a 3D point from camera coordinates to pixel coordinates,
    /// applying distortion.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::PointAtCameraCenter`]: If the 3D point's Z-coordinate is too close to zero.
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        // If z is very small, the point is at the camera center
        if point_3d.z < f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointAtCameraCenter);
        }

        let normalized = Vector2::new(point_3d.x / point_3d.z, point_3d.y / point_3d.z);
        let distorted = self.distort(&normalized);
        Ok(self.normalized_to_pixel(&distorted))
    }

    /// Unprojects a distorted pixel to a unit ray in camera coordinates.
    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        let distorted = self.pixel_to_normalized(point_2d);
        let point = self.undistort(&distorted)?;
        Ok(Vector3::new(point.x, point.y, 1.0).normalize())
    }

    fn distort(&self, point: &Vector2<f64>) -> Vector2<f64> {
        let [k1, k2, p1, p2, k3, k4, k5, k6] = self.distortions;
        let x = point.x;
        let y = point.y;

        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;

        let radial = (1.0 + k1 * r2 + k2 * r4 + k3 * r6) / (1.0 + k4 * r2 + k5 * r4 + k6 * r6);

        Vector2::new(
            x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
            y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
        )
    }

    /// Removes distortion from a normalized point by fixed-point iteration.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::NumericalError`]: If the iteration produces a non-finite value.
    fn undistort(&self, point: &Vector2<f64>) -> Result<Vector2<f64>, CameraModelError> {
        const EPS: f64 = 1e-12;
        const MAX_ITERATIONS: u32 = 50;

        let [k1, k2, p1, p2, k3, k4, k5, k6] = self.distortions;
        let target = *point;
        let mut x = target.x;
        let mut y = target.y;

        for _ in 0..MAX_ITERATIONS {
            let r2 = x * x + y * y;
            let r4 = r2 * r2;
            let r6 = r4 * r2;

            let inv_radial =
                (1.0 + k4 * r2 + k5 * r4 + k6 * r6) / (1.0 + k1 * r2 + k2 * r4 + k3 * r6);
            let delta_x = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
            let delta_y = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;

            let next_x = (target.x - delta_x) * inv_radial;
            let next_y = (target.y - delta_y) * inv_radial;

            if !next_x.is_finite() || !next_y.is_finite() {
                return Err(CameraModelError::NumericalError(
                    "Undistortion diverged".to_string(),
                ));
            }

            let step = (next_x - x).hypot(next_y - y);
            x = next_x;
            y = next_y;
            if step < EPS {
                break;
            }
        }

        Ok(Vector2::new(x, y))
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        if !self.skew.is_finite() || self.distortions.iter().any(|d| !d.is_finite()) {
            return Err(CameraModelError::InvalidParams(
                "Distortion coefficients and skew must be finite".to_string(),
            ));
        }
        Ok(())
    }

    fn get_intrinsics(&self) -> Intrinsics {
        self.intrinsics
    }

    fn camera_matrix(&self) -> Matrix3<f64> {
        crate::camera::camera_matrix(&self.intrinsics, self.skew)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_model() -> RadTanModel {
        RadTanModel::new(
            Intrinsics {
                fx: 461.629,
                fy: 460.152,
                cx: 362.680,
                cy: 246.049,
            },
            0.0,
            [-0.28340811, 0.07395907, 0.00019359, 1.76187114e-05, 0.0, 0.0, 0.0, 0.0],
        )
        .unwrap()
    }

    #[test]
    fn test_radtan_project_unproject() {
        let model = sample_model();

        let point_3d = Vector3::new(0.5, -0.3, 2.0);
        let norm_3d = point_3d.normalize();

        let point_2d = model.project(&point_3d).unwrap();
        let point_3d_unprojected = model.unproject(&point_2d).unwrap();

        assert_relative_eq!(norm_3d.x, point_3d_unprojected.x, epsilon = 1e-6);
        assert_relative_eq!(norm_3d.y, point_3d_unprojected.y, epsilon = 1e-6);
        assert_relative_eq!(norm_3d.z, point_3d_unprojected.z, epsilon = 1e-6);
    }

    #[test]
    fn test_radtan_multiple_points() {
        let model = sample_model();

        let test_points = vec![
            Vector3::new(0.0, 0.0, 1.0),   // Center
            Vector3::new(0.5, 0.0, 1.0),   // Right
            Vector3::new(-0.5, 0.0, 1.0),  // Left
            Vector3::new(0.0, 0.5, 1.0),   // Top
            Vector3::new(0.0, -0.5, 1.0),  // Bottom
            Vector3::new(0.3, 0.4, 1.0),   // Top-right
            Vector3::new(-0.3, -0.4, 1.0), // Bottom-left
            Vector3::new(0.1, 0.1, 2.0),   // Further away
        ];

        for (i, original_point) in test_points.iter().enumerate() {
            let pixel_point = model.project(original_point).unwrap();
            let ray_direction = model.unproject(&pixel_point).unwrap();

            let original_direction = original_point.normalize();
            let dot_product = original_direction.dot(&ray_direction);
            assert!(
                dot_product > 0.999999,
                "Test point {}: direction mismatch, dot product {}",
                i,
                dot_product
            );
        }
    }

    #[test]
    fn test_radtan_rational_terms_round_trip() {
        let model = RadTanModel::new(
            Intrinsics {
                fx: 800.0,
                fy: 790.0,
                cx: 640.0,
                cy: 360.0,
            },
            1.5,
            [0.12, -0.05, 0.001, -0.0005, 0.01, 0.02, -0.01, 0.003],
        )
        .unwrap();

        let point = Vector2::new(0.25, -0.15);
        let distorted = model.distort(&point);
        let recovered = model.undistort(&distorted).unwrap();
        assert_relative_eq!(point.x, recovered.x, epsilon = 1e-9);
        assert_relative_eq!(point.y, recovered.y, epsilon = 1e-9);

        let pixel = model.normalized_to_pixel(&distorted);
        let back = model.pixel_to_normalized(&pixel);
        assert_relative_eq!(back.x, distorted.x, epsilon = 1e-12);
        assert_relative_eq!(back.y, distorted.y, epsilon = 1e-12);
    }

    #[test]
    fn test_radtan_point_behind_camera() {
        let model = sample_model();
        assert!(matches!(
            model.project(&Vector3::new(0.0, 0.0, 0.0)),
            Err(CameraModelError::PointAtCameraCenter)
        ));
    }

    #[test]
    fn test_radtan_rejects_negative_focal() {
        let result = RadTanModel::new(
            Intrinsics {
                fx: -1.0,
                fy: 500.0,
                cx: 320.0,
                cy: 240.0,
            },
            0.0,
            [0.0; 8],
        );
        assert!(matches!(
            result,
            Err(CameraModelError::FocalLengthMustBePositive)
        ));
    }
}
