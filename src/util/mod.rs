use crate::camera::{CameraModel, CameraModelError};
use crate::geometry::BoardPose;
use crate::optimization::ViewCorrespondences;
use image::DynamicImage;
use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

/// Ensure the parent directory of `path` exists
pub fn ensure_output_dir(path: &Path) -> Result<(), CameraModelError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| {
                CameraModelError::IOError(format!("Failed to create output directory: {e}"))
            })?;
        }
    }
    Ok(())
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionError {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
}

impl fmt::Debug for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Projection Error [ rmse: {}, min: {}, max: {}, mean: {}, stddev: {}, median: {} ]",
            self.rmse, self.min, self.max, self.mean, self.stddev, self.median
        )
    }
}

impl ProjectionError {
    /// Summarises a list of per-point reprojection distances in pixels.
    ///
    /// # Errors
    ///
    /// [`CameraModelError::InsufficientData`] when `errors` is empty.
    pub fn from_errors(errors: &[f64]) -> Result<Self, CameraModelError> {
        if errors.is_empty() {
            return Err(CameraModelError::InsufficientData(
                "no projected points to evaluate".to_string(),
            ));
        }

        let n = errors.len() as f64;
        let mean = errors.iter().sum::<f64>() / n;

        let variance: f64 = errors.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let stddev = variance.sqrt();

        let sum_squared: f64 = errors.iter().map(|x| x.powi(2)).sum::<f64>();
        let rmse = (sum_squared / n).sqrt();

        let min = errors.iter().fold(f64::INFINITY, |a, &b| a.min(b));
        let max = errors.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));

        let mut sorted_errors = errors.to_vec();
        sorted_errors.sort_by(|a, b| a.total_cmp(b));
        let median = if sorted_errors.len() % 2 == 0 {
            let mid = sorted_errors.len() / 2;
            (sorted_errors[mid - 1] + sorted_errors[mid]) / 2.0
        } else {
            sorted_errors[sorted_errors.len() / 2]
        };

        Ok(ProjectionError {
            rmse,
            min,
            max,
            mean,
            stddev,
            median,
        })
    }
}

/// Per-point pixel distances between the observed corners and the board
/// points projected through `camera_model` at the given poses.
///
/// A point that fails to project (behind the camera) is an error.
pub fn reprojection_distances<T>(
    camera_model: &T,
    views: &[ViewCorrespondences],
    poses: &[BoardPose],
) -> Result<Vec<f64>, CameraModelError>
where
    T: ?Sized + CameraModel,
{
    if views.len() != poses.len() {
        return Err(CameraModelError::InvalidParams(format!(
            "{} views but {} poses",
            views.len(),
            poses.len()
        )));
    }

    let mut errors = Vec::new();
    for (view, pose) in views.iter().zip(poses.iter()) {
        for (object, observed) in view.object_points.iter().zip(view.image_points.iter()) {
            let point_camera = pose.transform(object);
            let projected = camera_model.project(&point_camera)?;
            errors.push((projected - observed).norm());
        }
    }
    Ok(errors)
}

pub fn compute_reprojection_error<T>(
    camera_model: &T,
    views: &[ViewCorrespondences],
    poses: &[BoardPose],
) -> Result<ProjectionError, CameraModelError>
where
    T: ?Sized + CameraModel,
{
    let errors = reprojection_distances(camera_model, views, poses)?;
    ProjectionError::from_errors(&errors)
}

/// Loads an image, keeping its native pixel type.
pub fn load_image<P: AsRef<Path>>(image_path: P) -> Result<DynamicImage, CameraModelError> {
    let image_path = image_path.as_ref();
    image::open(image_path).map_err(|e| {
        CameraModelError::ImageError(format!(
            "Failed to load image {}: {e}",
            image_path.display()
        ))
    })
}

/// Saves an image, creating the output directory when needed.
pub fn save_image<P: AsRef<Path>>(image: &DynamicImage, path: P) -> Result<(), CameraModelError> {
    let path = path.as_ref();
    ensure_output_dir(path)?;
    image.save(path)?;
    info!("Saved image: {}", path.display());
    Ok(())
}
