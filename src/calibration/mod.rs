//! The persisted calibration artifact.
//!
//! A [`CalibrationModel`] holds the camera intrinsics in pixels, the same
//! quantities converted to millimeters, the skew term and the lens
//! distortion. It is written once per calibration run and read back by the
//! undistortion and height-estimation steps. The on-disk layout is:
//!
//! ```yaml
//! distortion_coefficients:
//!   radial: {k1, k2, k3, k4, k5, k6}
//!   tangential: {p1, p2}
//! focal_length_mm: {fx, fy}
//! focal_length_pixels: {fx, fy}
//! principal_point_mm: {cx, cy}
//! principal_point_pixels: {cx, cy}
//! skew: 0.0
//! ```

use crate::camera::{
    camera_matrix, CameraModelError, Intrinsics, KannalaBrandtModel, ModelKind, RadTanModel,
    Resolution, SensorSize,
};
use crate::optimization::CalibrationResult;
use log::info;
use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::Path;

/// Lens distortion split into its radial and tangential terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Distortion {
    /// `[k1, k2, k3, k4, k5, k6]`.
    pub radial: [f64; 6],
    /// `[p1, p2]`.
    pub tangential: [f64; 2],
}

impl Distortion {
    pub fn zero() -> Self {
        Distortion {
            radial: [0.0; 6],
            tangential: [0.0; 2],
        }
    }

    /// Builds the distortion from slices, zero-padding whatever is missing.
    pub fn from_slices(radial: &[f64], tangential: &[f64]) -> Self {
        let mut distortion = Distortion::zero();
        for (slot, value) in distortion.radial.iter_mut().zip(radial) {
            *slot = *value;
        }
        for (slot, value) in distortion.tangential.iter_mut().zip(tangential) {
            *slot = *value;
        }
        distortion
    }

    /// Builds the distortion from an OpenCV-ordered pinhole vector
    /// `[k1, k2, p1, p2, k3, k4, k5, k6]`; shorter vectors are zero-padded.
    pub fn from_opencv_vec(coefficients: &[f64]) -> Self {
        let mut flat = [0.0; 8];
        for (slot, value) in flat.iter_mut().zip(coefficients) {
            *slot = *value;
        }
        Distortion {
            radial: [flat[0], flat[1], flat[4], flat[5], flat[6], flat[7]],
            tangential: [flat[2], flat[3]],
        }
    }

    /// The flat 8-element vector in fixed order `[k1, k2, p1, p2, k3, k4, k5, k6]`.
    pub fn opencv_vec(&self) -> [f64; 8] {
        let [k1, k2, k3, k4, k5, k6] = self.radial;
        let [p1, p2] = self.tangential;
        [k1, k2, p1, p2, k3, k4, k5, k6]
    }

    /// The equidistant fisheye coefficients, stored in `k1..k4`.
    pub fn fisheye_vec(&self) -> [f64; 4] {
        [self.radial[0], self.radial[1], self.radial[2], self.radial[3]]
    }
}

/// Intrinsics, distortion and their physical-unit counterparts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationModel {
    /// Focal length and principal point in pixels.
    pub pixels: Intrinsics,
    /// Focal length and principal point in millimeters, when the sensor size was known.
    pub millimeters: Option<Intrinsics>,
    pub skew: f64,
    pub distortion: Distortion,
}

impl CalibrationModel {
    /// Creates a model from pixel quantities, deriving the millimeter values
    /// via `value_mm = value_px * (sensor_mm / image_px)`.
    pub fn new(
        pixels: Intrinsics,
        skew: f64,
        distortion: Distortion,
        sensor_size: &SensorSize,
        image_size: &Resolution,
    ) -> Result<Self, CameraModelError> {
        Ok(CalibrationModel {
            pixels,
            millimeters: Some(pixels_to_millimeters(&pixels, sensor_size, image_size)?),
            skew,
            distortion,
        })
    }

    /// Converts an estimator result into the persisted model.
    pub fn from_estimate(
        result: &CalibrationResult,
        sensor_size: &SensorSize,
    ) -> Result<Self, CameraModelError> {
        let distortion = match result.kind {
            ModelKind::Pinhole => Distortion::from_opencv_vec(&result.distortions),
            ModelKind::Fisheye => Distortion::from_slices(&result.distortions, &[]),
        };
        CalibrationModel::new(
            result.intrinsics,
            result.skew,
            distortion,
            sensor_size,
            &result.image_size,
        )
    }

    /// The 3x3 camera matrix `[[fx, skew, cx], [0, fy, cy], [0, 0, 1]]`.
    pub fn camera_matrix(&self) -> Matrix3<f64> {
        camera_matrix(&self.pixels, self.skew)
    }

    /// The flat 8-element distortion vector `[k1, k2, p1, p2, k3, k4, k5, k6]`.
    pub fn distortion_vector(&self) -> [f64; 8] {
        self.distortion.opencv_vec()
    }

    /// Rejects non-physical camera matrices.
    pub fn validate(&self) -> Result<(), CameraModelError> {
        if !(self.pixels.fx > 0.0) || !(self.pixels.fy > 0.0) {
            return Err(CameraModelError::InvalidCalibration(format!(
                "camera matrix diagonal must be positive (fx = {}, fy = {})",
                self.pixels.fx, self.pixels.fy
            )));
        }
        if !self.pixels.cx.is_finite() || !self.pixels.cy.is_finite() || !self.skew.is_finite() {
            return Err(CameraModelError::InvalidCalibration(
                "principal point and skew must be finite".to_string(),
            ));
        }
        Ok(())
    }

    /// The pinhole lens model described by this calibration.
    pub fn rad_tan_model(&self) -> Result<RadTanModel, CameraModelError> {
        self.validate()?;
        RadTanModel::new(self.pixels, self.skew, self.distortion_vector())
    }

    /// The fisheye lens model described by this calibration.
    pub fn kannala_brandt_model(&self) -> Result<KannalaBrandtModel, CameraModelError> {
        self.validate()?;
        KannalaBrandtModel::new(self.pixels, self.distortion.fisheye_vec())
    }

    /// Emits the nested persisted record.
    pub fn to_record(&self) -> Value {
        let [k1, k2, k3, k4, k5, k6] = self.distortion.radial;
        let [p1, p2] = self.distortion.tangential;

        let mut root = Mapping::new();
        root.insert(
            key("distortion_coefficients"),
            mapping(vec![
                (
                    "radial",
                    mapping(vec![
                        ("k1", number(k1)),
                        ("k2", number(k2)),
                        ("k3", number(k3)),
                        ("k4", number(k4)),
                        ("k5", number(k5)),
                        ("k6", number(k6)),
                    ]),
                ),
                (
                    "tangential",
                    mapping(vec![("p1", number(p1)), ("p2", number(p2))]),
                ),
            ]),
        );
        if let Some(mm) = &self.millimeters {
            root.insert(key("focal_length_mm"), focal_length(mm));
        }
        root.insert(key("focal_length_pixels"), focal_length(&self.pixels));
        if let Some(mm) = &self.millimeters {
            root.insert(key("principal_point_mm"), principal_point(mm));
        }
        root.insert(key("principal_point_pixels"), principal_point(&self.pixels));
        root.insert(key("skew"), number(self.skew));

        Value::Mapping(root)
    }

    /// Rebuilds a model from its persisted record.
    ///
    /// # Errors
    ///
    /// [`CameraModelError::MalformedCalibration`] naming the first required
    /// key that is absent or not a number. Optional keys (`skew`, `k4..k6`)
    /// default to `0.0`.
    pub fn from_record(record: &Value) -> Result<Self, CameraModelError> {
        let pixels = Intrinsics {
            fx: required(record, &["focal_length_pixels", "fx"])?,
            fy: required(record, &["focal_length_pixels", "fy"])?,
            cx: required(record, &["principal_point_pixels", "cx"])?,
            cy: required(record, &["principal_point_pixels", "cy"])?,
        };

        let radial = ["distortion_coefficients", "radial"];
        let tangential = ["distortion_coefficients", "tangential"];
        let distortion = Distortion {
            radial: [
                required(record, &[radial[0], radial[1], "k1"])?,
                required(record, &[radial[0], radial[1], "k2"])?,
                required(record, &[radial[0], radial[1], "k3"])?,
                optional(record, &[radial[0], radial[1], "k4"])?,
                optional(record, &[radial[0], radial[1], "k5"])?,
                optional(record, &[radial[0], radial[1], "k6"])?,
            ],
            tangential: [
                required(record, &[tangential[0], tangential[1], "p1"])?,
                required(record, &[tangential[0], tangential[1], "p2"])?,
            ],
        };

        let millimeters = match (
            lookup(record, &["focal_length_mm"]),
            lookup(record, &["principal_point_mm"]),
        ) {
            (None, None) => None,
            _ => Some(Intrinsics {
                fx: required(record, &["focal_length_mm", "fx"])?,
                fy: required(record, &["focal_length_mm", "fy"])?,
                cx: required(record, &["principal_point_mm", "cx"])?,
                cy: required(record, &["principal_point_mm", "cy"])?,
            }),
        };

        Ok(CalibrationModel {
            pixels,
            millimeters,
            skew: optional(record, &["skew"])?,
            distortion,
        })
    }

    /// Parses a model from YAML text.
    pub fn from_yaml_str(contents: &str) -> Result<Self, CameraModelError> {
        let record: Value = serde_yaml::from_str(contents)?;
        CalibrationModel::from_record(&record)
    }

    /// Serializes the model to YAML text.
    pub fn to_yaml_string(&self) -> Result<String, CameraModelError> {
        Ok(serde_yaml::to_string(&self.to_record())?)
    }

    /// Loads a calibration file.
    pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, CameraModelError> {
        let contents = fs::read_to_string(path.as_ref())?;
        CalibrationModel::from_yaml_str(&contents)
    }

    /// Writes a calibration file, creating missing parent directories.
    pub fn save_to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), CameraModelError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, self.to_yaml_string()?)?;
        info!("Camera calibration saved to: {}", path.display());
        Ok(())
    }
}

/// Converts pixel intrinsics to millimeters using the sensor size.
pub fn pixels_to_millimeters(
    pixels: &Intrinsics,
    sensor_size: &SensorSize,
    image_size: &Resolution,
) -> Result<Intrinsics, CameraModelError> {
    if image_size.width == 0 || image_size.height == 0 {
        return Err(CameraModelError::InvalidParams(
            "Image size must be non-zero to convert to millimeters".to_string(),
        ));
    }
    if !(sensor_size.width > 0.0) || !(sensor_size.height > 0.0) {
        return Err(CameraModelError::InvalidParams(
            "Sensor size must be positive".to_string(),
        ));
    }

    let mm_per_px_x = sensor_size.width / image_size.width as f64;
    let mm_per_px_y = sensor_size.height / image_size.height as f64;
    Ok(Intrinsics {
        fx: pixels.fx * mm_per_px_x,
        fy: pixels.fy * mm_per_px_y,
        cx: pixels.cx * mm_per_px_x,
        cy: pixels.cy * mm_per_px_y,
    })
}

fn key(name: &str) -> Value {
    Value::String(name.to_string())
}

fn number(value: f64) -> Value {
    Value::Number(value.into())
}

fn mapping(entries: Vec<(&str, Value)>) -> Value {
    Value::Mapping(
        entries
            .into_iter()
            .map(|(name, value)| (key(name), value))
            .collect(),
    )
}

fn focal_length(intrinsics: &Intrinsics) -> Value {
    mapping(vec![("fx", number(intrinsics.fx)), ("fy", number(intrinsics.fy))])
}

fn principal_point(intrinsics: &Intrinsics) -> Value {
    mapping(vec![("cx", number(intrinsics.cx)), ("cy", number(intrinsics.cy))])
}

fn lookup<'a>(record: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter()
        .try_fold(record, |node, name| node.get(*name))
        .filter(|value| !value.is_null())
}

fn required(record: &Value, path: &[&str]) -> Result<f64, CameraModelError> {
    lookup(record, path)
        .and_then(Value::as_f64)
        .ok_or_else(|| CameraModelError::MalformedCalibration(path.join(".")))
}

fn optional(record: &Value, path: &[&str]) -> Result<f64, CameraModelError> {
    match lookup(record, path) {
        None => Ok(0.0),
        Some(value) => value
            .as_f64()
            .ok_or_else(|| CameraModelError::MalformedCalibration(path.join("."))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_model() -> CalibrationModel {
        CalibrationModel::new(
            Intrinsics {
                fx: 1000.0,
                fy: 1002.5,
                cx: 958.3,
                cy: 541.7,
            },
            0.25,
            Distortion {
                radial: [-0.281, 0.0739, 0.0012, 0.0003, -0.0002, 0.0001],
                tangential: [0.00019, -1.7e-5],
            },
            &SensorSize {
                width: 5.7,
                height: 3.0,
            },
            &Resolution {
                width: 1920,
                height: 1080,
            },
        )
        .unwrap()
    }

    fn assert_models_close(a: &CalibrationModel, b: &CalibrationModel) {
        assert_relative_eq!(a.pixels.fx, b.pixels.fx, epsilon = 1e-9);
        assert_relative_eq!(a.pixels.fy, b.pixels.fy, epsilon = 1e-9);
        assert_relative_eq!(a.pixels.cx, b.pixels.cx, epsilon = 1e-9);
        assert_relative_eq!(a.pixels.cy, b.pixels.cy, epsilon = 1e-9);
        assert_relative_eq!(a.skew, b.skew, epsilon = 1e-9);
        let (a_mm, b_mm) = (a.millimeters.unwrap(), b.millimeters.unwrap());
        assert_relative_eq!(a_mm.fx, b_mm.fx, epsilon = 1e-9);
        assert_relative_eq!(a_mm.fy, b_mm.fy, epsilon = 1e-9);
        assert_relative_eq!(a_mm.cx, b_mm.cx, epsilon = 1e-9);
        assert_relative_eq!(a_mm.cy, b_mm.cy, epsilon = 1e-9);
        for (x, y) in a.distortion_vector().iter().zip(b.distortion_vector().iter()) {
            assert_relative_eq!(*x, *y, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_record_round_trip() {
        let model = sample_model();
        let restored = CalibrationModel::from_record(&model.to_record()).unwrap();
        assert_models_close(&model, &restored);
    }

    #[test]
    fn test_yaml_text_round_trip() {
        let model = sample_model();
        let text = model.to_yaml_string().unwrap();
        assert!(text.contains("focal_length_pixels"));
        assert!(text.contains("distortion_coefficients"));
        let restored = CalibrationModel::from_yaml_str(&text).unwrap();
        assert_models_close(&model, &restored);
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = std::env::temp_dir().join("camcal_calibration_test");
        let path = dir.join("nested").join("cam1.yaml");
        let model = sample_model();
        model.save_to_yaml(&path).unwrap();
        let loaded = CalibrationModel::load_from_yaml(&path).unwrap();
        assert_models_close(&model, &loaded);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_millimeter_conversion() {
        let model = sample_model();
        let mm = model.millimeters.unwrap();
        assert_relative_eq!(mm.fx, 1000.0 * 5.7 / 1920.0, epsilon = 1e-12);
        assert_relative_eq!(mm.fx, 2.96875, epsilon = 1e-4);
        assert_relative_eq!(mm.fy, 1002.5 * 3.0 / 1080.0, epsilon = 1e-12);
        assert_relative_eq!(mm.cx, 958.3 * 5.7 / 1920.0, epsilon = 1e-12);
        assert_relative_eq!(mm.cy, 541.7 * 3.0 / 1080.0, epsilon = 1e-12);
    }

    #[test]
    fn test_missing_high_order_terms_default_to_zero() {
        let text = "
distortion_coefficients:
  radial: {k1: -0.2, k2: 0.05, k3: 0.001}
  tangential: {p1: 0.0001, p2: -0.0002}
focal_length_pixels: {fx: 800, fy: 810}
principal_point_pixels: {cx: 640, cy: 360}
";
        let model = CalibrationModel::from_yaml_str(text).unwrap();
        assert_eq!(model.distortion.radial[3], 0.0);
        assert_eq!(model.distortion.radial[4], 0.0);
        assert_eq!(model.distortion.radial[5], 0.0);
        assert_eq!(model.skew, 0.0);
        assert!(model.millimeters.is_none());

        let flat = model.distortion_vector();
        assert_eq!(flat.len(), 8);
        assert_eq!(flat, [-0.2, 0.05, 0.0001, -0.0002, 0.001, 0.0, 0.0, 0.0]);

        // Integers in the file are read as floats.
        assert_eq!(model.pixels.fx, 800.0);
    }

    #[test]
    fn test_missing_required_key_is_malformed() {
        let text = "
distortion_coefficients:
  radial: {k1: -0.2, k2: 0.05, k3: 0.001}
  tangential: {p1: 0.0001, p2: -0.0002}
focal_length_pixels: {fx: 800}
principal_point_pixels: {cx: 640, cy: 360}
";
        match CalibrationModel::from_yaml_str(text) {
            Err(CameraModelError::MalformedCalibration(field)) => {
                assert_eq!(field, "focal_length_pixels.fy")
            }
            other => panic!("expected malformed calibration, got {:?}", other),
        }

        let no_tangential = "
distortion_coefficients:
  radial: {k1: -0.2, k2: 0.05, k3: 0.001}
focal_length_pixels: {fx: 800, fy: 800}
principal_point_pixels: {cx: 640, cy: 360}
";
        match CalibrationModel::from_yaml_str(no_tangential) {
            Err(CameraModelError::MalformedCalibration(field)) => {
                assert_eq!(field, "distortion_coefficients.tangential.p1")
            }
            other => panic!("expected malformed calibration, got {:?}", other),
        }
    }

    #[test]
    fn test_short_coefficient_arrays_are_padded() {
        let distortion = Distortion::from_opencv_vec(&[0.1, -0.02, 0.001, 0.002, 0.003]);
        assert_eq!(distortion.radial, [0.1, -0.02, 0.003, 0.0, 0.0, 0.0]);
        assert_eq!(distortion.tangential, [0.001, 0.002]);

        let fisheye = Distortion::from_slices(&[0.1, 0.2], &[]);
        assert_eq!(fisheye.fisheye_vec(), [0.1, 0.2, 0.0, 0.0]);
        assert_eq!(fisheye.tangential, [0.0, 0.0]);
    }

    #[test]
    fn test_validate_rejects_non_positive_diagonal() {
        let mut model = sample_model();
        model.pixels.fy = 0.0;
        assert!(matches!(
            model.validate(),
            Err(CameraModelError::InvalidCalibration(_))
        ));
        assert!(model.rad_tan_model().is_err());
    }
}
