//! This module provides the cost functions and the calibration routine
//! for the Kannala-Brandt (equidistant fisheye) camera model.
//!
//! Calibration alternates between recomputing every board pose with the
//! intrinsics held fixed and refining the intrinsics with the poses held
//! fixed. Views whose pose sub-problem is ill-conditioned are excluded for
//! the rest of the run. A final joint Levenberg-Marquardt pass over
//! intrinsics and all remaining poses polishes the result. Skew is always zero.

use crate::camera::{CameraModel, CameraModelError, Intrinsics, KannalaBrandtModel, ModelKind};
use crate::geometry::{estimate_homography, pose_from_homography, rotate_axis_angle, BoardPose};
use crate::optimization::rad_tan::pose_key;
use crate::optimization::{
    CalibrationResult, CorrespondenceSet, Optimizer, ViewCorrespondences,
};
use crate::util::compute_reprojection_error;

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector, Matrix3, RealField, Vector2, Vector3};
use std::collections::HashMap;
use std::f64::consts::PI;
use tiny_solver::factors::Factor;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

const MAX_ITERATIONS: usize = 20;
const CONVERGENCE_EPS: f64 = 1e-6;
/// Views whose pose Jacobian condition number exceeds this are excluded.
pub const CONDITION_THRESHOLD: f64 = 1e6;

/// Projects a camera-frame point with `[fx, fy, cx, cy, k1, k2, k3, k4]`.
fn project_kb<T: RealField>(cam: &[T], point: &Vector3<T>) -> (T, T) {
    let x = point.x.clone();
    let y = point.y.clone();
    let z = point.z.clone();

    let r_squared = x.clone() * x.clone() + y.clone() * y.clone();
    let r = r_squared.sqrt();
    let theta = r.clone().atan2(z.clone());

    let theta2 = theta.clone() * theta.clone();
    let theta3 = theta2.clone() * theta.clone();
    let theta5 = theta3.clone() * theta2.clone();
    let theta7 = theta5.clone() * theta2.clone();
    let theta9 = theta7.clone() * theta2;

    let theta_d = theta
        + cam[4].clone() * theta3
        + cam[5].clone() * theta5
        + cam[6].clone() * theta7
        + cam[7].clone() * theta9;

    // On the optical axis theta_d / r tends to 1 / z.
    let scale = if r > nalgebra::convert::<f64, T>(f64::EPSILON) {
        theta_d / r
    } else {
        T::one() / z
    };

    (
        cam[0].clone() * x * scale.clone() + cam[2].clone(),
        cam[1].clone() * y * scale + cam[3].clone(),
    )
}

/// Intrinsics-only cost: the board points are already in the camera frame.
#[derive(Debug, Clone)]
struct KBCost {
    points3d: Vec<Vector3<f64>>,
    points2d: Vec<Vector2<f64>>,
}

impl KBCost {
    fn new(view: &ViewCorrespondences, pose: &BoardPose) -> Self {
        Self {
            points3d: view.object_points.iter().map(|p| pose.transform(p)).collect(),
            points2d: view.image_points.clone(),
        }
    }
}

impl<T: RealField> Factor<T> for KBCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let cam = params[0].as_slice();
        let mut residuals = DVector::zeros(self.points2d.len() * 2);

        for (i, (p3d, p2d)) in self.points3d.iter().zip(self.points2d.iter()).enumerate() {
            let point = p3d.map(nalgebra::convert::<f64, T>);
            let (u, v) = project_kb(cam, &point);
            residuals[i * 2] = u - nalgebra::convert::<f64, T>(p2d.x);
            residuals[i * 2 + 1] = v - nalgebra::convert::<f64, T>(p2d.y);
        }
        residuals
    }
}

/// Reprojection cost of one board view.
///
/// With `fixed_intrinsics` the only parameter block is the pose; otherwise
/// the blocks are the intrinsics followed by the pose.
#[derive(Debug, Clone)]
struct KBViewCost {
    object_points: Vec<Vector3<f64>>,
    image_points: Vec<Vector2<f64>>,
    fixed_intrinsics: Option<[f64; 8]>,
}

impl<T: RealField> Factor<T> for KBViewCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let fixed: Option<Vec<T>> = self
            .fixed_intrinsics
            .map(|cam| cam.iter().map(|v| nalgebra::convert::<f64, T>(*v)).collect());
        let (cam, pose) = match &fixed {
            Some(cam) => (cam.as_slice(), &params[0]),
            None => (params[0].as_slice(), &params[1]),
        };

        let rvec = Vector3::new(pose[0].clone(), pose[1].clone(), pose[2].clone());
        let tvec = Vector3::new(pose[3].clone(), pose[4].clone(), pose[5].clone());

        let mut residuals = DVector::zeros(self.image_points.len() * 2);
        for (i, (object, observed)) in self
            .object_points
            .iter()
            .zip(self.image_points.iter())
            .enumerate()
        {
            let p = object.map(nalgebra::convert::<f64, T>);
            let pc = rotate_axis_angle(&rvec, &p) + tvec.clone();
            let (u, v) = project_kb(cam, &pc);
            residuals[i * 2] = u - nalgebra::convert::<f64, T>(observed.x);
            residuals[i * 2 + 1] = v - nalgebra::convert::<f64, T>(observed.y);
        }
        residuals
    }
}

/// Fisheye calibration state.
#[derive(Debug, Clone)]
pub struct KannalaBrandtOptimizationCost {
    correspondences: CorrespondenceSet,
    intrinsics: Intrinsics,
    /// `[k1, k2, k3, k4]`.
    distortions: [f64; 4],
    /// Pose per view; `None` once a view has been excluded.
    poses: Vec<Option<BoardPose>>,
}

impl KannalaBrandtOptimizationCost {
    pub fn new(correspondences: CorrespondenceSet) -> Self {
        let width = correspondences.image_size.width as f64;
        let height = correspondences.image_size.height as f64;
        let f = width.max(height) / PI;
        let views = correspondences.len();
        KannalaBrandtOptimizationCost {
            correspondences,
            intrinsics: Intrinsics {
                fx: f,
                fy: f,
                cx: (width - 1.0) * 0.5,
                cy: (height - 1.0) * 0.5,
            },
            distortions: [0.0; 4],
            poses: vec![None; views],
        }
    }

    pub fn intrinsics(&self) -> Intrinsics {
        self.intrinsics
    }

    pub fn distortions(&self) -> [f64; 4] {
        self.distortions
    }

    /// Indices of the views still taking part in the calibration.
    pub fn active_views(&self) -> Vec<usize> {
        self.poses
            .iter()
            .enumerate()
            .filter_map(|(index, pose)| pose.map(|_| index))
            .collect()
    }

    pub fn model(&self) -> Result<KannalaBrandtModel, CameraModelError> {
        KannalaBrandtModel::new(self.intrinsics, self.distortions)
    }

    fn packed_intrinsics(&self) -> [f64; 8] {
        let i = &self.intrinsics;
        let [k1, k2, k3, k4] = self.distortions;
        [i.fx, i.fy, i.cx, i.cy, k1, k2, k3, k4]
    }

    fn unpack_intrinsics(&mut self, cam: &DVector<f64>) {
        self.intrinsics = Intrinsics {
            fx: cam[0],
            fy: cam[1],
            cx: cam[2],
            cy: cam[3],
        };
        self.distortions = [cam[4], cam[5], cam[6], cam[7]];
    }

    /// Initial pose of one view from the homography between the board and
    /// the undistorted normalized image points.
    fn initial_pose(&self, view: &ViewCorrespondences) -> Result<BoardPose, CameraModelError> {
        let model = self.model()?;
        let normalized = view
            .image_points
            .iter()
            .map(|p| {
                let distorted = Vector2::new(
                    (p.x - self.intrinsics.cx) / self.intrinsics.fx,
                    (p.y - self.intrinsics.cy) / self.intrinsics.fy,
                );
                model.undistort(&distorted)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let homography = estimate_homography(&view.plane_points(), &normalized)?;
        pose_from_homography(&Matrix3::identity(), &homography)
    }

    /// Refines one board pose with the intrinsics held fixed.
    fn refine_pose(
        &self,
        view: &ViewCorrespondences,
        initial: &BoardPose,
    ) -> Result<BoardPose, CameraModelError> {
        let cost = KBViewCost {
            object_points: view.object_points.clone(),
            image_points: view.image_points.clone(),
            fixed_intrinsics: Some(self.packed_intrinsics()),
        };
        let mut problem = tiny_solver::Problem::new();
        problem.add_residual_block(view.len() * 2, &["pose"], Box::new(cost), None);

        let mut initial_values = HashMap::new();
        initial_values.insert("pose".to_string(), DVector::from_vec(initial.to_vec()));

        let result = LevenbergMarquardtOptimizer::default()
            .optimize(&problem, &initial_values, None)
            .ok_or_else(|| {
                CameraModelError::NumericalError("Pose refinement failed".to_string())
            })?;
        let params = result
            .get("pose")
            .ok_or_else(|| CameraModelError::NumericalError("missing pose".to_string()))?;
        BoardPose::from_slice(params.as_slice())
    }

    /// Condition number of the pose Jacobian `J` of one view (ratio of its
    /// largest to smallest singular value), with central differences.
    pub fn pose_condition_number(&self, view: &ViewCorrespondences, pose: &BoardPose) -> f64 {
        const STEP: f64 = 1e-6;
        let cost = KBViewCost {
            object_points: view.object_points.clone(),
            image_points: view.image_points.clone(),
            fixed_intrinsics: Some(self.packed_intrinsics()),
        };

        let base = DVector::from_vec(pose.to_vec());
        let mut jacobian = DMatrix::<f64>::zeros(view.len() * 2, 6);
        for col in 0..6 {
            let mut plus = base.clone();
            let mut minus = base.clone();
            plus[col] += STEP;
            minus[col] -= STEP;
            let diff = cost.residual_func(&[plus]) - cost.residual_func(&[minus]);
            jacobian.set_column(col, &(diff / (2.0 * STEP)));
        }

        let singular_values = jacobian.singular_values();
        let max = singular_values.max();
        let min = singular_values.min();
        if !(min > 0.0) || !max.is_finite() {
            return f64::INFINITY;
        }
        max / min
    }

    /// Recomputes the pose of every active view and excludes the ones that
    /// cannot be solved or are ill-conditioned.
    fn recompute_extrinsics(&mut self) -> Result<(), CameraModelError> {
        for index in self.active_views() {
            let view = &self.correspondences.views[index];
            let pose = self
                .initial_pose(view)
                .and_then(|initial| self.refine_pose(view, &initial));

            self.poses[index] = match pose {
                Ok(pose) => {
                    let condition = self.pose_condition_number(view, &pose);
                    if condition > CONDITION_THRESHOLD {
                        warn!(
                            "View {} is ill-conditioned (condition number {:.3e}); excluding it",
                            index, condition
                        );
                        None
                    } else {
                        Some(pose)
                    }
                }
                Err(e) => {
                    warn!("View {}: pose estimation failed ({}); excluding it", index, e);
                    None
                }
            };
        }

        if self.active_views().is_empty() {
            return Err(CameraModelError::InsufficientData(
                "every view was excluded as ill-conditioned".to_string(),
            ));
        }
        Ok(())
    }

    /// Refines the intrinsics with every active pose held fixed.
    fn refine_intrinsics(&mut self) -> Result<(), CameraModelError> {
        let mut problem = tiny_solver::Problem::new();
        for index in self.active_views() {
            if let Some(pose) = &self.poses[index] {
                let view = &self.correspondences.views[index];
                let cost = KBCost::new(view, pose);
                problem.add_residual_block(view.len() * 2, &["intrinsics"], Box::new(cost), None);
            }
        }

        let mut initial_values = HashMap::new();
        initial_values.insert(
            "intrinsics".to_string(),
            DVector::from_row_slice(&self.packed_intrinsics()),
        );

        let result = LevenbergMarquardtOptimizer::default()
            .optimize(&problem, &initial_values, None)
            .ok_or_else(|| CameraModelError::NumericalError("Optimization failed".to_string()))?;
        let cam = result
            .get("intrinsics")
            .ok_or_else(|| CameraModelError::NumericalError("missing intrinsics".to_string()))?;
        self.unpack_intrinsics(cam);
        self.model()?;
        Ok(())
    }

    /// Joint refinement of the intrinsics and all active poses.
    fn refine_jointly(&mut self) -> Result<(), CameraModelError> {
        let active = self.active_views();
        let mut problem = tiny_solver::Problem::new();
        let mut initial_values = HashMap::new();
        initial_values.insert(
            "intrinsics".to_string(),
            DVector::from_row_slice(&self.packed_intrinsics()),
        );

        for &index in &active {
            if let Some(pose) = &self.poses[index] {
                let view = &self.correspondences.views[index];
                let cost = KBViewCost {
                    object_points: view.object_points.clone(),
                    image_points: view.image_points.clone(),
                    fixed_intrinsics: None,
                };
                let key = pose_key(index);
                problem.add_residual_block(
                    view.len() * 2,
                    &["intrinsics", key.as_str()],
                    Box::new(cost),
                    None,
                );
                initial_values.insert(key, DVector::from_vec(pose.to_vec()));
            }
        }

        let result = LevenbergMarquardtOptimizer::default()
            .optimize(&problem, &initial_values, None)
            .ok_or_else(|| CameraModelError::NumericalError("Optimization failed".to_string()))?;

        let cam = result
            .get("intrinsics")
            .ok_or_else(|| CameraModelError::NumericalError("missing intrinsics".to_string()))?;
        self.unpack_intrinsics(cam);
        for index in active {
            let params = result.get(&pose_key(index)).ok_or_else(|| {
                CameraModelError::NumericalError(format!("missing pose {index}"))
            })?;
            self.poses[index] = Some(BoardPose::from_slice(params.as_slice())?);
        }
        Ok(())
    }

    fn used_poses(&self) -> (Vec<ViewCorrespondences>, Vec<BoardPose>) {
        self.poses
            .iter()
            .zip(self.correspondences.views.iter())
            .filter_map(|(pose, view)| pose.map(|pose| (view.clone(), pose)))
            .unzip()
    }
}

impl Optimizer for KannalaBrandtOptimizationCost {
    /// Starts from `f = max(w, h) / pi`, the image centre and zero
    /// distortion, and computes the first set of board poses.
    fn linear_estimation(&mut self) -> Result<(), CameraModelError> {
        let width = self.correspondences.image_size.width as f64;
        let height = self.correspondences.image_size.height as f64;
        let f = width.max(height) / PI;
        self.intrinsics = Intrinsics {
            fx: f,
            fy: f,
            cx: (width - 1.0) * 0.5,
            cy: (height - 1.0) * 0.5,
        };
        self.distortions = [0.0; 4];
        self.poses = vec![Some(BoardPose::identity()); self.correspondences.len()];
        self.recompute_extrinsics()
    }

    fn optimize(&mut self) -> Result<(), CameraModelError> {
        if self.active_views().is_empty() {
            return Err(CameraModelError::InsufficientData(
                "no view with a valid pose; run linear estimation first".to_string(),
            ));
        }

        info!("Starting fisheye optimization with tiny-solver Levenberg-Marquardt...");
        for iteration in 0..MAX_ITERATIONS {
            let previous = self.packed_intrinsics();
            self.refine_intrinsics()?;
            self.recompute_extrinsics()?;

            let current = self.packed_intrinsics();
            let change = current
                .iter()
                .zip(previous.iter())
                .map(|(a, b)| (a - b).powi(2))
                .sum::<f64>()
                .sqrt();
            let norm = current.iter().map(|a| a * a).sum::<f64>().sqrt();
            debug!(
                "Fisheye iteration {}: relative parameter change {:.3e}",
                iteration,
                change / norm
            );
            if change / norm < CONVERGENCE_EPS {
                break;
            }
        }

        self.refine_jointly()?;
        info!("Optimization finished");

        self.model().map_err(|e| {
            CameraModelError::NumericalError(format!("optimized intrinsics are invalid: {e}"))
        })?;
        Ok(())
    }

    fn result(&self) -> Result<CalibrationResult, CameraModelError> {
        let model = self.model()?;
        let (views, poses) = self.used_poses();
        let projection_error = compute_reprojection_error(&model, &views, &poses)?;
        Ok(CalibrationResult {
            kind: ModelKind::Fisheye,
            intrinsics: self.intrinsics,
            skew: 0.0,
            distortions: self.distortions.to_vec(),
            image_size: self.correspondences.image_size,
            rms: projection_error.rmse,
            projection_error,
            poses,
            used_views: self.active_views(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Resolution;
    use crate::optimization::calibrate;
    use crate::optimization::test_support::{sample_poses, synthetic_set};
    use approx::assert_relative_eq;

    fn reference_model() -> KannalaBrandtModel {
        KannalaBrandtModel::new(
            Intrinsics {
                fx: 400.0,
                fy: 402.0,
                cx: 642.0,
                cy: 358.0,
            },
            [-0.02, 0.01, -0.004, 0.001],
        )
        .unwrap()
    }

    fn image_size() -> Resolution {
        Resolution {
            width: 1280,
            height: 720,
        }
    }

    #[test]
    fn test_fisheye_calibration_recovers_intrinsics() {
        let reference = reference_model();
        let set = synthetic_set(&reference, image_size(), &sample_poses());
        assert_eq!(set.len(), 6);

        let result = calibrate(&set, ModelKind::Fisheye).unwrap();
        assert_eq!(result.kind, ModelKind::Fisheye);
        assert_eq!(result.distortions.len(), 4);
        assert_eq!(result.skew, 0.0);
        assert_relative_eq!(result.intrinsics.fx, 400.0, epsilon = 4.0);
        assert_relative_eq!(result.intrinsics.fy, 402.0, epsilon = 4.0);
        assert_relative_eq!(result.intrinsics.cx, 642.0, epsilon = 4.0);
        assert_relative_eq!(result.intrinsics.cy, 358.0, epsilon = 4.0);
        assert!(result.rms < 0.05, "rms = {}", result.rms);
        assert_eq!(result.poses.len(), result.used_views.len());
    }

    #[test]
    fn test_fisheye_initial_guess() {
        let set = synthetic_set(&reference_model(), image_size(), &sample_poses());
        let mut cost = KannalaBrandtOptimizationCost::new(set);
        cost.linear_estimation().unwrap();

        let initial = cost.intrinsics();
        assert_relative_eq!(initial.fx, 1280.0 / PI, epsilon = 1e-9);
        assert_relative_eq!(initial.cx, 639.5, epsilon = 1e-9);
        assert_eq!(cost.distortions(), [0.0; 4]);
        assert_eq!(cost.active_views().len(), 6);
    }

    fn frontal_pose(distance: f64) -> BoardPose {
        BoardPose {
            rotation: Vector3::zeros(),
            translation: Vector3::new(-0.1, -0.0625, distance),
        }
    }

    #[test]
    fn test_far_frontal_board_is_well_conditioned() {
        let reference = reference_model();
        let far = frontal_pose(3.5);
        let set = synthetic_set(&reference, image_size(), &[far]);
        let mut cost = KannalaBrandtOptimizationCost::new(set);
        cost.intrinsics = reference.intrinsics;
        cost.distortions = reference.distortions;

        let condition = cost.pose_condition_number(&cost.correspondences.views[0], &far);
        assert!(condition < CONDITION_THRESHOLD, "{condition}");

        // A board a few meters away still takes part in the calibration.
        let mut poses = sample_poses();
        poses[0] = far;
        let set = synthetic_set(&reference, image_size(), &poses);
        let result = calibrate(&set, ModelKind::Fisheye).unwrap();
        assert_eq!(result.used_views, (0..6).collect::<Vec<_>>());
        assert!(result.rms < 0.05, "rms = {}", result.rms);
    }

    #[test]
    fn test_collinear_view_is_ill_conditioned() {
        let reference = reference_model();
        let pose = frontal_pose(0.5);
        let set = synthetic_set(&reference, image_size(), &[pose]);
        let view = &set.views[0];

        // Only the first board row: rotating about that row is unobservable.
        let row = ViewCorrespondences::new(
            view.object_points[..9].to_vec(),
            view.image_points[..9].to_vec(),
        )
        .unwrap();

        let mut cost = KannalaBrandtOptimizationCost::new(set);
        cost.intrinsics = reference.intrinsics;
        cost.distortions = reference.distortions;
        let condition = cost.pose_condition_number(&row, &pose);
        assert!(condition > CONDITION_THRESHOLD, "{condition}");
    }

    #[test]
    fn test_single_fisheye_view_gives_finite_error() {
        let reference = reference_model();
        let set = synthetic_set(&reference, image_size(), &[sample_poses()[1]]);
        assert_eq!(set.len(), 1);

        let result = calibrate(&set, ModelKind::Fisheye).unwrap();
        assert!(result.rms.is_finite());
        assert!(result.rms < 0.05, "rms = {}", result.rms);
        assert_relative_eq!(result.rms, result.projection_error.rmse);
        assert!(result.intrinsics.fx > 0.0 && result.intrinsics.fy > 0.0);
        assert_eq!(result.used_views, vec![0]);
    }

    #[test]
    fn test_pose_cost_is_zero_at_truth() {
        let reference = reference_model();
        let pose = sample_poses()[3];
        let set = synthetic_set(&reference, image_size(), &[pose]);
        let mut cost = KannalaBrandtOptimizationCost::new(set);
        cost.intrinsics = reference.intrinsics;
        cost.distortions = reference.distortions;

        let view = &cost.correspondences.views[0];
        let factor = KBViewCost {
            object_points: view.object_points.clone(),
            image_points: view.image_points.clone(),
            fixed_intrinsics: Some(cost.packed_intrinsics()),
        };
        let residuals = factor.residual_func(&[DVector::from_vec(pose.to_vec())]);
        assert!(residuals.amax() < 1e-9);

        let refined = cost.refine_pose(view, &pose).unwrap();
        assert_relative_eq!(refined.translation, pose.translation, epsilon = 1e-6);
    }
}
