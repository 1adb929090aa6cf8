//! Shared camera types, the crate error and the lens models.
//!
//! Two lens models are supported: the pinhole model with radial/tangential
//! distortion ([`RadTanModel`]) and the equidistant fisheye model
//! ([`KannalaBrandtModel`]). Callers pick one of them once per operation
//! through the [`ModelKind`] selector.

use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod kannala_brandt;
pub mod rad_tan;

pub use kannala_brandt::KannalaBrandtModel;
pub use rad_tan::RadTanModel;

/// Focal length and principal point, in whatever unit the owner stores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

/// Image size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Physical sensor size in millimeters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSize {
    pub width: f64,
    pub height: f64,
}

/// Lens model selector, dispatched once per estimation or undistortion call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Pinhole,
    Fisheye,
}

impl ModelKind {
    pub fn from_fisheye_flag(fisheye: bool) -> Self {
        if fisheye {
            ModelKind::Fisheye
        } else {
            ModelKind::Pinhole
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::Pinhole => write!(f, "pinhole"),
            ModelKind::Fisheye => write!(f, "fisheye"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CameraModelError {
    #[error("Malformed calibration: missing or invalid field `{0}`")]
    MalformedCalibration(String),
    #[error("Insufficient calibration data: {0}")]
    InsufficientData(String),
    #[error("Invalid calibration: {0}")]
    InvalidCalibration(String),
    #[error("Invalid camera pose: {0}")]
    InvalidPose(String),
    #[error("Backprojected ray is parallel to the ground plane")]
    DegenerateRay,
    #[error("No qualifying detection found")]
    NoDetection,
    #[error("z is close to zero, point is at camera center")]
    PointAtCameraCenter,
    #[error("Focal length must be positive")]
    FocalLengthMustBePositive,
    #[error("Principal point must be finite")]
    PrincipalPointMustBeFinite,
    #[error("Invalid camera parameters: {0}")]
    InvalidParams(String),
    #[error("Numerical error in computation: {0}")]
    NumericalError(String),
    #[error("Failed to process YAML: {0}")]
    YamlError(String),
    #[error("Failed to process JSON: {0}")]
    JsonError(String),
    #[error("Image error: {0}")]
    ImageError(String),
    #[error("IO Error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for CameraModelError {
    fn from(err: std::io::Error) -> Self {
        CameraModelError::IOError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CameraModelError {
    fn from(err: serde_yaml::Error) -> Self {
        CameraModelError::YamlError(err.to_string())
    }
}

impl From<serde_json::Error> for CameraModelError {
    fn from(err: serde_json::Error) -> Self {
        CameraModelError::JsonError(err.to_string())
    }
}

impl From<image::ImageError> for CameraModelError {
    fn from(err: image::ImageError) -> Self {
        CameraModelError::ImageError(err.to_string())
    }
}

/// Trait defining the core functionality for camera models
pub trait CameraModel {
    /// Project a 3D point in camera coordinates to distorted pixel coordinates.
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError>;

    /// Unproject distorted pixel coordinates to a unit ray in camera coordinates.
    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError>;

    /// Map a point on the normalized image plane (z = 1) to its distorted
    /// normalized position.
    fn distort(&self, point: &Vector2<f64>) -> Vector2<f64>;

    /// Inverse of [`CameraModel::distort`].
    fn undistort(&self, point: &Vector2<f64>) -> Result<Vector2<f64>, CameraModelError>;

    /// Validate camera parameters
    fn validate_params(&self) -> Result<(), CameraModelError>;

    fn get_intrinsics(&self) -> Intrinsics;

    /// The 3x3 camera matrix `[[fx, skew, cx], [0, fy, cy], [0, 0, 1]]`.
    fn camera_matrix(&self) -> Matrix3<f64>;
}

/// Common validation functions for camera parameters
pub mod validation {
    use super::*;

    pub fn validate_intrinsics(intrinsics: &Intrinsics) -> Result<(), CameraModelError> {
        if !(intrinsics.fx > 0.0) || !(intrinsics.fy > 0.0) {
            return Err(CameraModelError::FocalLengthMustBePositive);
        }
        if !intrinsics.cx.is_finite() || !intrinsics.cy.is_finite() {
            return Err(CameraModelError::PrincipalPointMustBeFinite);
        }
        Ok(())
    }
}

/// Builds `[[fx, skew, cx], [0, fy, cy], [0, 0, 1]]`.
pub fn camera_matrix(intrinsics: &Intrinsics, skew: f64) -> Matrix3<f64> {
    Matrix3::new(
        intrinsics.fx,
        skew,
        intrinsics.cx,
        0.0,
        intrinsics.fy,
        intrinsics.cy,
        0.0,
        0.0,
        1.0,
    )
}
