//! Implements the Kannala-Brandt equidistant fisheye camera model.
//!
//! The incidence angle `theta` of a ray maps to a distorted angle
//! `theta_d = theta * (1 + k1*theta^2 + k2*theta^4 + k3*theta^6 + k4*theta^8)`,
//! which is then scaled linearly into the image. Skew is always zero.

use crate::camera::{validation, CameraModel, CameraModelError, Intrinsics};
use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::f64::consts::FRAC_PI_2;
use std::fmt;

/// Equidistant fisheye camera with four distortion coefficients.
#[derive(Clone, Serialize, Deserialize)]
pub struct KannalaBrandtModel {
    /// Focal length and principal point in pixels.
    pub intrinsics: Intrinsics,
    /// `[k1, k2, k3, k4]`.
    pub distortions: [f64; 4],
}

impl KannalaBrandtModel {
    pub fn new(intrinsics: Intrinsics, distortions: [f64; 4]) -> Result<Self, CameraModelError> {
        let model = KannalaBrandtModel {
            intrinsics,
            distortions,
        };
        model.validate_params()?;
        Ok(model)
    }

    /// Evaluates `theta_d(theta)`.
    pub fn distort_angle(&self, theta: f64) -> f64 {
        let [k1, k2, k3, k4] = self.distortions;
        let theta2 = theta * theta;
        let theta4 = theta2 * theta2;
        let theta6 = theta4 * theta2;
        let theta8 = theta4 * theta4;
        theta * (1.0 + k1 * theta2 + k2 * theta4 + k3 * theta6 + k4 * theta8)
    }

    /// Inverts [`KannalaBrandtModel::distort_angle`] with Newton's method.
    pub fn undistort_angle(&self, theta_d: f64) -> Result<f64, CameraModelError> {
        const EPS: f64 = 1e-12;
        const MAX_ITERATIONS: u32 = 20;

        let [k1, k2, k3, k4] = self.distortions;
        let theta_d = theta_d.clamp(-FRAC_PI_2, FRAC_PI_2);
        let mut theta = theta_d;

        for _ in 0..MAX_ITERATIONS {
            let theta2 = theta * theta;
            let theta4 = theta2 * theta2;
            let theta6 = theta4 * theta2;
            let theta8 = theta6 * theta2;

            let k1_theta2 = k1 * theta2;
            let k2_theta4 = k2 * theta4;
            let k3_theta6 = k3 * theta6;
            let k4_theta8 = k4 * theta8;

            let residual =
                theta * (1.0 + k1_theta2 + k2_theta4 + k3_theta6 + k4_theta8) - theta_d;
            let derivative =
                1.0 + 3.0 * k1_theta2 + 5.0 * k2_theta4 + 7.0 * k3_theta6 + 9.0 * k4_theta8;

            if derivative.abs() < f64::EPSILON {
                return Err(CameraModelError::NumericalError(
                    "Fisheye angle derivative vanished".to_string(),
                ));
            }

            let step = residual / derivative;
            theta -= step;
            if step.abs() < EPS {
                break;
            }
        }

        if !theta.is_finite() {
            return Err(CameraModelError::NumericalError(
                "Fisheye angle inversion diverged".to_string(),
            ));
        }
        Ok(theta)
    }
}

impl fmt::Debug for KannalaBrandtModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "KannalaBrandtModel [fx: {} fy: {} cx: {} cy: {} distortions: {:?}]",
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
            self.distortions,
        )
    }
}

impl CameraModel for KannalaBrandtModel {
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        if point_3d.z < f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointAtCameraCenter);
        }

        let r = point_3d.x.hypot(point_3d.y);
        let theta = r.atan2(point_3d.z);
        let theta_d = self.distort_angle(theta);

        let (x_r, y_r) = if r < f64::EPSILON {
            (0.0, 0.0)
        } else {
            (point_3d.x / r, point_3d.y / r)
        };

        Ok(Vector2::new(
            self.intrinsics.fx * theta_d * x_r + self.intrinsics.cx,
            self.intrinsics.fy * theta_d * y_r + self.intrinsics.cy,
        ))
    }

    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        let mx = (point_2d.x - self.intrinsics.cx) / self.intrinsics.fx;
        let my = (point_2d.y - self.intrinsics.cy) / self.intrinsics.fy;

        let theta_d = mx.hypot(my);
        if theta_d < f64::EPSILON {
            return Ok(Vector3::new(0.0, 0.0, 1.0));
        }

        let theta = self.undistort_angle(theta_d)?;
        let (sin_theta, cos_theta) = theta.sin_cos();
        Ok(Vector3::new(
            sin_theta * mx / theta_d,
            sin_theta * my / theta_d,
            cos_theta,
        ))
    }

    fn distort(&self, point: &Vector2<f64>) -> Vector2<f64> {
        let r = point.norm();
        if r < f64::EPSILON {
            return *point;
        }
        let theta_d = self.distort_angle(r.atan());
        point * (theta_d / r)
    }

    fn undistort(&self, point: &Vector2<f64>) -> Result<Vector2<f64>, CameraModelError> {
        let theta_d = point.norm();
        if theta_d < f64::EPSILON {
            return Ok(*point);
        }
        let theta = self.undistort_angle(theta_d)?;
        Ok(point * (theta.tan() / theta_d))
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        if self.distortions.iter().any(|d| !d.is_finite()) {
            return Err(CameraModelError::InvalidParams(
                "Fisheye distortion coefficients must be finite".to_string(),
            ));
        }
        Ok(())
    }

    fn get_intrinsics(&self) -> Intrinsics {
        self.intrinsics
    }

    fn camera_matrix(&self) -> Matrix3<f64> {
        crate::camera::camera_matrix(&self.intrinsics, 0.0)
    }
}
