//! Monocular height estimation on a flat ground plane.
//!
//! The camera pose comes from three scalars (height above ground, downward
//! pitch, distance to the subject). Image points are backprojected onto the
//! `Z = 0` ground plane and a person's height is the distance between the
//! backprojected foot and head points of their bounding box.

use crate::camera::CameraModelError;
use log::{debug, info};
use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Detector class id of a person.
pub const PERSON_CLASS_ID: u32 = 0;

/// User-facing pose description, as stored in the extrinsics YAML file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoseParams {
    /// Meters above the ground.
    pub camera_height: f64,
    /// Degrees, positive tilts the camera downwards.
    pub camera_pitch: f64,
    /// Meters from the camera to the subject along the optical axis.
    pub distance_to_object: f64,
}

impl PoseParams {
    pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, CameraModelError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Ok(serde_yaml::from_str(&contents)?)
    }
}

/// Camera pose relative to the ground frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtrinsicPose {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl ExtrinsicPose {
    /// Builds `R = R_x(pitch)` and `t = [0, -height, -distance]`.
    ///
    /// # Errors
    ///
    /// [`CameraModelError::InvalidPose`] if the height is not positive, the
    /// distance is negative or any input is not finite.
    pub fn from_params(params: &PoseParams) -> Result<Self, CameraModelError> {
        let PoseParams {
            camera_height,
            camera_pitch,
            distance_to_object,
        } = *params;

        if !camera_height.is_finite()
            || !camera_pitch.is_finite()
            || !distance_to_object.is_finite()
        {
            return Err(CameraModelError::InvalidPose(
                "pose parameters must be finite".to_string(),
            ));
        }
        if camera_height <= 0.0 {
            return Err(CameraModelError::InvalidPose(format!(
                "camera height must be positive, got {camera_height}"
            )));
        }
        if distance_to_object < 0.0 {
            return Err(CameraModelError::InvalidPose(format!(
                "distance to object must not be negative, got {distance_to_object}"
            )));
        }

        let (sin, cos) = camera_pitch.to_radians().sin_cos();
        Ok(ExtrinsicPose {
            rotation: Matrix3::new(1.0, 0.0, 0.0, 0.0, cos, -sin, 0.0, sin, cos),
            translation: Vector3::new(0.0, -camera_height, -distance_to_object),
        })
    }

    /// Camera centre in world coordinates, `-R * t`.
    pub fn camera_center(&self) -> Vector3<f64> {
        -(self.rotation * self.translation)
    }
}

/// Intersects the viewing ray of `pixel` with the `Z = 0` ground plane.
///
/// # Errors
///
/// * [`CameraModelError::InvalidCalibration`]: `camera_matrix` is singular.
/// * [`CameraModelError::DegenerateRay`]: the ray is parallel to the ground.
pub fn backproject(
    pixel: &Vector2<f64>,
    camera_matrix: &Matrix3<f64>,
    pose: &ExtrinsicPose,
) -> Result<Vector3<f64>, CameraModelError> {
    let k_inv = camera_matrix.try_inverse().ok_or_else(|| {
        CameraModelError::InvalidCalibration("camera matrix is not invertible".to_string())
    })?;

    let ray_cam = k_inv * Vector3::new(pixel.x, pixel.y, 1.0);
    let ray_world = pose.rotation * ray_cam;
    let camera_center = pose.camera_center();

    // Machine epsilon relative to the ray length.
    if ray_world.z.abs() <= f64::EPSILON * ray_world.norm() {
        return Err(CameraModelError::DegenerateRay);
    }
    let scale = -camera_center.z / ray_world.z;
    Ok(camera_center + ray_world * scale)
}

/// Axis-aligned box in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

impl BoundingBox {
    pub fn new(x_min: f64, y_min: f64, x_max: f64, y_max: f64) -> Self {
        BoundingBox {
            x_min,
            y_min,
            x_max,
            y_max,
        }
    }

    pub fn pixel_height(&self) -> f64 {
        self.y_max - self.y_min
    }

    /// Bottom-centre point, assumed to touch the ground.
    pub fn foot(&self) -> Vector2<f64> {
        Vector2::new((self.x_min + self.x_max) / 2.0, self.y_max)
    }

    /// Top-centre point.
    pub fn head(&self) -> Vector2<f64> {
        Vector2::new((self.x_min + self.x_max) / 2.0, self.y_min)
    }
}

/// Distance between the backprojected foot and head points of `bbox`.
///
/// This assumes an upright subject; no correction is made when the head is
/// not directly above the foot.
pub fn estimate_height(
    bbox: &BoundingBox,
    camera_matrix: &Matrix3<f64>,
    pose: &ExtrinsicPose,
) -> Result<f64, CameraModelError> {
    let foot = backproject(&bbox.foot(), camera_matrix, pose)?;
    let head = backproject(&bbox.head(), camera_matrix, pose)?;
    debug!("Foot at {:?}, head at {:?}", foot.as_slice(), head.as_slice());
    Ok((foot - head).norm())
}

/// One entry of the external detector output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// `[x_min, y_min, x_max, y_max]` in pixels.
    pub bbox: [f64; 4],
    pub class_id: u32,
    pub confidence: f32,
}

impl Detection {
    pub fn bounding_box(&self) -> BoundingBox {
        let [x_min, y_min, x_max, y_max] = self.bbox;
        BoundingBox::new(x_min, y_min, x_max, y_max)
    }
}

/// Reads the detector output (a JSON list of [`Detection`]).
pub fn load_detections<P: AsRef<Path>>(path: P) -> Result<Vec<Detection>, CameraModelError> {
    let contents = fs::read_to_string(path.as_ref())?;
    Ok(serde_json::from_str(&contents)?)
}

/// The box with the largest pixel height; the first one wins ties.
pub fn tallest_box(boxes: &[BoundingBox]) -> Option<BoundingBox> {
    boxes.iter().copied().fold(None, |best, candidate| match best {
        Some(b) if b.pixel_height() >= candidate.pixel_height() => Some(b),
        _ => Some(candidate),
    })
}

/// The tallest person box among `detections`.
///
/// # Errors
///
/// [`CameraModelError::NoDetection`] when no detection has the person class.
pub fn select_tallest(detections: &[Detection]) -> Result<BoundingBox, CameraModelError> {
    let people: Vec<BoundingBox> = detections
        .iter()
        .filter(|d| d.class_id == PERSON_CLASS_ID)
        .map(Detection::bounding_box)
        .collect();
    info!(
        "{} person detection(s) out of {}",
        people.len(),
        detections.len()
    );
    tallest_box(&people).ok_or(CameraModelError::NoDetection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn camera_matrix() -> Matrix3<f64> {
        Matrix3::new(1000.0, 0.0, 960.0, 0.0, 1000.0, 540.0, 0.0, 0.0, 1.0)
    }

    fn pose(pitch: f64) -> ExtrinsicPose {
        ExtrinsicPose::from_params(&PoseParams {
            camera_height: 2.0,
            camera_pitch: pitch,
            distance_to_object: 5.0,
        })
        .unwrap()
    }

    #[test]
    fn test_extrinsics_from_params() {
        let p = pose(30.0);
        let (s, c) = 30.0_f64.to_radians().sin_cos();
        let expected = Matrix3::new(1.0, 0.0, 0.0, 0.0, c, -s, 0.0, s, c);
        assert_relative_eq!(p.rotation, expected, epsilon = 1e-12);
        assert_eq!(p.translation, Vector3::new(0.0, -2.0, -5.0));
        assert_relative_eq!(p.rotation.determinant(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_invalid_pose_parameters() {
        let params = PoseParams {
            camera_height: 0.0,
            camera_pitch: 10.0,
            distance_to_object: 5.0,
        };
        assert!(matches!(
            ExtrinsicPose::from_params(&params),
            Err(CameraModelError::InvalidPose(_))
        ));
        let negative_distance = PoseParams {
            camera_height: 1.5,
            distance_to_object: -1.0,
            ..params
        };
        assert!(ExtrinsicPose::from_params(&negative_distance).is_err());
        let nan_pitch = PoseParams {
            camera_height: 1.5,
            camera_pitch: f64::NAN,
            ..params
        };
        assert!(ExtrinsicPose::from_params(&nan_pitch).is_err());
    }

    #[test]
    fn test_backproject_principal_point_without_pitch() {
        // Camera centre sits at -R t = (0, 2, 5); the optical axis meets the
        // plane where the scale cancels the centre's z.
        let point = backproject(&Vector2::new(960.0, 540.0), &camera_matrix(), &pose(0.0)).unwrap();
        assert_relative_eq!(point, Vector3::new(0.0, 2.0, 0.0), epsilon = 1e-12);
        assert_eq!(point.z, 0.0);
    }

    #[test]
    fn test_backprojected_points_lie_on_ground() {
        let p = pose(20.0);
        for pixel in [
            Vector2::new(100.0, 900.0),
            Vector2::new(960.0, 1000.0),
            Vector2::new(1800.0, 700.0),
        ] {
            let point = backproject(&pixel, &camera_matrix(), &p).unwrap();
            assert_relative_eq!(point.z, 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_ray_parallel_to_ground_is_degenerate() {
        // Pitched straight down, the optical axis has no world z component.
        let result = backproject(&Vector2::new(960.0, 540.0), &camera_matrix(), &pose(90.0));
        assert!(matches!(result, Err(CameraModelError::DegenerateRay)));

        // At 45 degrees the row one focal length above the centre is parallel.
        let result = backproject(&Vector2::new(960.0, -460.0), &camera_matrix(), &pose(45.0));
        assert!(matches!(result, Err(CameraModelError::DegenerateRay)));
    }

    #[test]
    fn test_estimate_height_of_centered_box() {
        let bbox = BoundingBox::new(910.0, 340.0, 1010.0, 740.0);
        let height = estimate_height(&bbox, &camera_matrix(), &pose(0.0)).unwrap();
        assert_relative_eq!(height, 2.0, epsilon = 1e-12);

        let again = estimate_height(&bbox, &camera_matrix(), &pose(0.0)).unwrap();
        assert_eq!(height.to_bits(), again.to_bits());
    }

    #[test]
    fn test_select_tallest_person() {
        let detections = vec![
            Detection {
                bbox: [0.0, 0.0, 50.0, 500.0],
                class_id: 2,
                confidence: 0.9,
            },
            Detection {
                bbox: [10.0, 100.0, 60.0, 300.0],
                class_id: 0,
                confidence: 0.8,
            },
            Detection {
                bbox: [200.0, 50.0, 260.0, 250.0],
                class_id: 0,
                confidence: 0.95,
            },
            Detection {
                bbox: [300.0, 0.0, 340.0, 150.0],
                class_id: 0,
                confidence: 0.99,
            },
        ];
        // Both person boxes are 200 px tall; the first one wins.
        let tallest = select_tallest(&detections).unwrap();
        assert_eq!(tallest, BoundingBox::new(10.0, 100.0, 60.0, 300.0));

        assert!(matches!(
            select_tallest(&detections[..1]),
            Err(CameraModelError::NoDetection)
        ));
        assert!(matches!(select_tallest(&[]), Err(CameraModelError::NoDetection)));
    }

    #[test]
    fn test_load_pose_and_detections() {
        let dir = std::env::temp_dir().join("camcal_height_test");
        fs::create_dir_all(&dir).unwrap();

        let pose_path = dir.join("cam1.yaml");
        fs::write(
            &pose_path,
            "camera_height: 1.6\ncamera_pitch: 12.5\ndistance_to_object: 4\n",
        )
        .unwrap();
        let params = PoseParams::load_from_yaml(&pose_path).unwrap();
        assert_eq!(params.camera_height, 1.6);
        assert_eq!(params.distance_to_object, 4.0);

        let detections_path = dir.join("detections.json");
        fs::write(
            &detections_path,
            r#"[{"bbox": [1, 2, 3, 4], "class_id": 0, "confidence": 0.5}]"#,
        )
        .unwrap();
        let detections = load_detections(&detections_path).unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].bounding_box(), BoundingBox::new(1.0, 2.0, 3.0, 4.0));

        fs::remove_dir_all(&dir).unwrap();
    }
}
