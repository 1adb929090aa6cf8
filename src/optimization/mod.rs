//! The `optimization` module estimates camera intrinsics from planar
//! chessboard observations.
//!
//! This module defines the correspondence types handed over by an external
//! corner detector, the [`Optimizer`] trait shared by the two lens-model
//! estimators, and the [`calibrate`] entry point that dispatches on
//! [`ModelKind`] once per run.
//!
//! Each estimator follows the same two steps:
//! 1. A closed-form linear estimation seeded by per-view planar homographies.
//! 2. A Levenberg-Marquardt refinement (via `tiny_solver`) of the intrinsics,
//!    distortion and every per-view board pose jointly.

use crate::camera::{CameraModelError, Intrinsics, ModelKind, Resolution};
use crate::geometry::BoardPose;
use log::{info, warn};
use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

pub mod kannala_brandt;
pub mod rad_tan;

pub use crate::util::ProjectionError;
pub use kannala_brandt::KannalaBrandtOptimizationCost;
pub use rad_tan::RadTanOptimizationCost;

/// Regular chessboard corner grid on the `Z = 0` board plane.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoardGeometry {
    /// Inner corners per row.
    pub width: usize,
    /// Inner corners per column.
    pub height: usize,
    /// Side of one square, in the unit the poses should come out in.
    pub square_size: f64,
}

impl BoardGeometry {
    pub fn new(width: usize, height: usize, square_size: f64) -> Result<Self, CameraModelError> {
        if width < 2 || height < 2 {
            return Err(CameraModelError::InvalidParams(format!(
                "Board needs at least 2x2 inner corners, got {width}x{height}"
            )));
        }
        if !(square_size > 0.0) || !square_size.is_finite() {
            return Err(CameraModelError::InvalidParams(
                "Square size must be positive".to_string(),
            ));
        }
        Ok(BoardGeometry {
            width,
            height,
            square_size,
        })
    }

    pub fn corner_count(&self) -> usize {
        self.width * self.height
    }

    /// Object points in row-major order (x fastest), `Z = 0`.
    pub fn object_points(&self) -> Vec<Vector3<f64>> {
        (0..self.height)
            .flat_map(|row| {
                (0..self.width).map(move |col| {
                    Vector3::new(
                        col as f64 * self.square_size,
                        row as f64 * self.square_size,
                        0.0,
                    )
                })
            })
            .collect()
    }
}

/// Board points and their detected pixel positions for one image.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewCorrespondences {
    pub object_points: Vec<Vector3<f64>>,
    pub image_points: Vec<Vector2<f64>>,
}

impl ViewCorrespondences {
    pub fn new(
        object_points: Vec<Vector3<f64>>,
        image_points: Vec<Vector2<f64>>,
    ) -> Result<Self, CameraModelError> {
        if object_points.len() != image_points.len() {
            return Err(CameraModelError::InvalidParams(
                "Number of 2D and 3D points must match".to_string(),
            ));
        }
        if object_points.is_empty() {
            return Err(CameraModelError::InvalidParams(
                "Points arrays cannot be empty".to_string(),
            ));
        }
        Ok(ViewCorrespondences {
            object_points,
            image_points,
        })
    }

    pub fn len(&self) -> usize {
        self.image_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_points.is_empty()
    }

    /// Board coordinates dropped onto the plane, for homography estimation.
    pub fn plane_points(&self) -> Vec<Vector2<f64>> {
        self.object_points
            .iter()
            .map(|p| Vector2::new(p.x, p.y))
            .collect()
    }
}

/// All accepted views of one calibration run.
///
/// The estimators treat the views as an unordered collection; `source_indices`
/// only records which detector entries were accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrespondenceSet {
    pub image_size: Resolution,
    pub views: Vec<ViewCorrespondences>,
    pub source_indices: Vec<usize>,
}

impl CorrespondenceSet {
    pub fn new(image_size: Resolution) -> Self {
        CorrespondenceSet {
            image_size,
            views: Vec::new(),
            source_indices: Vec::new(),
        }
    }

    pub fn push(&mut self, source_index: usize, view: ViewCorrespondences) {
        self.views.push(view);
        self.source_indices.push(source_index);
    }

    /// Builds the set from corner-detector output, one entry per image.
    ///
    /// Images without a detected board (`None`) are skipped silently; images
    /// whose corner count does not match the board are skipped with a warning.
    pub fn from_detections(
        board: &BoardGeometry,
        image_size: Resolution,
        detections: &[Option<Vec<Vector2<f64>>>],
    ) -> Self {
        let object_points = board.object_points();
        let mut set = CorrespondenceSet::new(image_size);

        for (index, corners) in detections.iter().enumerate() {
            let Some(corners) = corners else {
                continue;
            };
            if corners.len() != board.corner_count() {
                warn!(
                    "View {}: expected {} corners, found {}; skipping",
                    index,
                    board.corner_count(),
                    corners.len()
                );
                continue;
            }
            match ViewCorrespondences::new(object_points.clone(), corners.clone()) {
                Ok(view) => set.push(index, view),
                Err(e) => warn!("View {}: {}; skipping", index, e),
            }
        }

        info!(
            "Accepted {} of {} views for calibration",
            set.len(),
            detections.len()
        );
        set
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn total_points(&self) -> usize {
        self.views.iter().map(ViewCorrespondences::len).sum()
    }
}

/// Outcome of an intrinsic calibration run.
#[derive(Debug, Clone)]
pub struct CalibrationResult {
    pub kind: ModelKind,
    pub intrinsics: Intrinsics,
    pub skew: f64,
    /// `[k1, k2, p1, p2, k3]` for pinhole, `[k1, k2, k3, k4]` for fisheye.
    pub distortions: Vec<f64>,
    pub image_size: Resolution,
    /// Root mean square reprojection error over all points, in pixels.
    pub rms: f64,
    pub projection_error: ProjectionError,
    /// Refined board pose of each used view.
    pub poses: Vec<BoardPose>,
    /// Indices into the correspondence set of the views that contributed.
    pub used_views: Vec<usize>,
}

/// A trait for camera model calibration tasks.
///
/// Implementors own the correspondences and the current parameter estimate
/// of one lens model.
pub trait Optimizer {
    /// Computes a closed-form initial estimate of intrinsics and board poses.
    fn linear_estimation(&mut self) -> Result<(), CameraModelError>;

    /// Refines the current estimate with Levenberg-Marquardt.
    fn optimize(&mut self) -> Result<(), CameraModelError>;

    /// Packs the current estimate together with its reprojection statistics.
    fn result(&self) -> Result<CalibrationResult, CameraModelError>;
}

/// Estimates intrinsics and distortion for the selected lens model.
///
/// # Errors
///
/// * [`CameraModelError::InsufficientData`]: no accepted views, a view with
///   fewer than 4 points, or (fisheye) every view rejected as ill-conditioned.
/// * [`CameraModelError::NumericalError`]: the solver failed.
pub fn calibrate(
    correspondences: &CorrespondenceSet,
    kind: ModelKind,
) -> Result<CalibrationResult, CameraModelError> {
    if correspondences.is_empty() {
        return Err(CameraModelError::InsufficientData(
            "no image yielded chessboard correspondences".to_string(),
        ));
    }
    if let Some(index) = correspondences.views.iter().position(|v| v.len() < 4) {
        return Err(CameraModelError::InsufficientData(format!(
            "view {index} has fewer than 4 correspondences"
        )));
    }
    if correspondences.image_size.width == 0 || correspondences.image_size.height == 0 {
        return Err(CameraModelError::InvalidParams(
            "Image size must be non-zero".to_string(),
        ));
    }

    info!(
        "Calibrating {} model from {} views ({} points)",
        kind,
        correspondences.len(),
        correspondences.total_points()
    );

    let result = match kind {
        ModelKind::Pinhole => run(RadTanOptimizationCost::new(correspondences.clone()))?,
        ModelKind::Fisheye => run(KannalaBrandtOptimizationCost::new(correspondences.clone()))?,
    };

    info!("Calibration RMS reprojection error: {:.6} px", result.rms);
    Ok(result)
}

fn run<O: Optimizer>(mut optimizer: O) -> Result<CalibrationResult, CameraModelError> {
    optimizer.linear_estimation()?;
    optimizer.optimize()?;
    optimizer.result()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_board_object_points_row_major() {
        let board = BoardGeometry::new(9, 6, 0.025).unwrap();
        let points = board.object_points();
        assert_eq!(points.len(), 54);
        assert_eq!(points[1], Vector3::new(0.025, 0.0, 0.0));
        assert_eq!(points[9], Vector3::new(0.0, 0.025, 0.0));
        assert!(points.iter().all(|p| p.z == 0.0));

        assert!(BoardGeometry::new(1, 6, 0.025).is_err());
        assert!(BoardGeometry::new(9, 6, 0.0).is_err());
    }

    #[test]
    fn test_from_detections_skips_missing_and_mismatched_views() {
        let board = BoardGeometry::new(3, 2, 1.0).unwrap();
        let good: Vec<_> = (0..6).map(|i| Vector2::new(i as f64, 0.0)).collect();
        let short = good[..4].to_vec();
        let detections = vec![None, Some(good.clone()), Some(short), Some(good)];

        let set = CorrespondenceSet::from_detections(
            &board,
            Resolution {
                width: 640,
                height: 480,
            },
            &detections,
        );
        assert_eq!(set.len(), 2);
        assert_eq!(set.source_indices, vec![1, 3]);
        assert_eq!(set.total_points(), 12);
    }

    #[test]
    fn test_calibrate_without_views_is_insufficient() {
        let set = CorrespondenceSet::new(Resolution {
            width: 640,
            height: 480,
        });
        for kind in [ModelKind::Pinhole, ModelKind::Fisheye] {
            assert!(matches!(
                calibrate(&set, kind),
                Err(CameraModelError::InsufficientData(_))
            ));
        }
    }

    #[test]
    fn test_view_correspondences_validate_lengths() {
        assert!(ViewCorrespondences::new(vec![Vector3::zeros()], vec![]).is_err());
        assert!(ViewCorrespondences::new(vec![], vec![]).is_err());
    }
}
