//! Camera Calibration Library
//!
//! Single-camera calibration and measurement toolkit:
//! - Intrinsic calibration from chessboard correspondences, for pinhole
//!   (radial-tangential) and fisheye (Kannala-Brandt) lenses
//! - YAML persistence of the calibration in pixel and millimeter units
//! - Image undistortion through dense remap tables
//! - Ground-plane backprojection and person height estimation
//!
//! Nonlinear refinement uses the tiny-solver Levenberg-Marquardt optimizer.

pub mod calibration;
pub mod camera;
pub mod geometry;
pub mod height;
pub mod optimization;
pub mod undistort;
pub mod util;

// Re-export commonly used types
pub use calibration::{CalibrationModel, Distortion};
pub use camera::{
    CameraModel, CameraModelError, Intrinsics, KannalaBrandtModel, ModelKind, RadTanModel,
    Resolution, SensorSize,
};
pub use height::{backproject, estimate_height, BoundingBox, ExtrinsicPose, PoseParams};
pub use optimization::{
    calibrate, BoardGeometry, CalibrationResult, CorrespondenceSet, KannalaBrandtOptimizationCost,
    Optimizer, RadTanOptimizationCost,
};
pub use undistort::{undistort_image, RemapTable, Undistorter};
