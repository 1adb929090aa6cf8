//! Pinhole calibration with radial-tangential distortion.
//!
//! The initial estimate follows the planar calibration recipe: one
//! homography per view constrains the focal lengths in closed form (principal
//! point at the image centre, no distortion), and each homography then yields
//! the board pose. `tiny_solver` refines `[fx, fy, cx, cy, k1, k2, p1, p2, k3]`
//! together with all board poses. Skew stays at zero.

use crate::camera::{CameraModelError, Intrinsics, ModelKind, RadTanModel};
use crate::geometry::{estimate_homography, pose_from_homography, rotate_axis_angle, BoardPose};
use crate::optimization::{CalibrationResult, CorrespondenceSet, Optimizer};
use crate::util::compute_reprojection_error;

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector, Matrix3, RealField, Vector2, Vector3};
use std::collections::HashMap;
use tiny_solver::factors::Factor;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

/// Fewer views than this leave the principal point unobservable, so it is
/// held at the image centre.
const MIN_VIEWS_FOR_PRINCIPAL_POINT: usize = 3;

/// Reprojection cost of one view for `tiny_solver`.
///
/// Parameter blocks: the intrinsics (`[fx, fy, cx, cy, k1, k2, p1, p2, k3]`,
/// or `[fx, fy, k1, k2, p1, p2, k3]` when `principal_point` is fixed) and the
/// board pose `[rx, ry, rz, tx, ty, tz]`.
#[derive(Debug, Clone)]
struct RadTanViewCost {
    object_points: Vec<Vector3<f64>>,
    image_points: Vec<Vector2<f64>>,
    principal_point: Option<Vector2<f64>>,
}

impl<T: RealField> Factor<T> for RadTanViewCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let cam = &params[0];
        let pose = &params[1];

        let fx = cam[0].clone();
        let fy = cam[1].clone();
        let (cx, cy, offset) = match &self.principal_point {
            Some(c) => (
                nalgebra::convert::<f64, T>(c.x),
                nalgebra::convert::<f64, T>(c.y),
                2,
            ),
            None => (cam[2].clone(), cam[3].clone(), 4),
        };
        let k1 = cam[offset].clone();
        let k2 = cam[offset + 1].clone();
        let p1 = cam[offset + 2].clone();
        let p2 = cam[offset + 3].clone();
        let k3 = cam[offset + 4].clone();

        let rvec = Vector3::new(pose[0].clone(), pose[1].clone(), pose[2].clone());
        let tvec = Vector3::new(pose[3].clone(), pose[4].clone(), pose[5].clone());

        let two = nalgebra::convert::<f64, T>(2.0);
        let mut residuals = DVector::zeros(self.image_points.len() * 2);

        for (i, (object, observed)) in self
            .object_points
            .iter()
            .zip(self.image_points.iter())
            .enumerate()
        {
            let p = object.map(nalgebra::convert::<f64, T>);
            let pc = rotate_axis_angle(&rvec, &p) + tvec.clone();

            let x = pc.x.clone() / pc.z.clone();
            let y = pc.y.clone() / pc.z.clone();

            let r2 = x.clone() * x.clone() + y.clone() * y.clone();
            let r4 = r2.clone() * r2.clone();
            let r6 = r4.clone() * r2.clone();
            let radial = T::one() + k1.clone() * r2.clone() + k2.clone() * r4 + k3.clone() * r6;

            let xy = x.clone() * y.clone();
            let xd = x.clone() * radial.clone()
                + two.clone() * p1.clone() * xy.clone()
                + p2.clone() * (r2.clone() + two.clone() * x.clone() * x);
            let yd = y.clone() * radial
                + p1.clone() * (r2 + two.clone() * y.clone() * y)
                + two.clone() * p2.clone() * xy;

            let u = fx.clone() * xd + cx.clone();
            let v = fy.clone() * yd + cy.clone();

            residuals[i * 2] = u - nalgebra::convert::<f64, T>(observed.x);
            residuals[i * 2 + 1] = v - nalgebra::convert::<f64, T>(observed.y);
        }
        residuals
    }
}

/// Pinhole calibration state: the correspondences and the current estimate.
#[derive(Debug, Clone)]
pub struct RadTanOptimizationCost {
    correspondences: CorrespondenceSet,
    intrinsics: Intrinsics,
    /// `[k1, k2, p1, p2, k3]`.
    distortions: [f64; 5],
    poses: Vec<BoardPose>,
}

impl RadTanOptimizationCost {
    pub fn new(correspondences: CorrespondenceSet) -> Self {
        let width = correspondences.image_size.width as f64;
        let height = correspondences.image_size.height as f64;
        let f = width.max(height);
        RadTanOptimizationCost {
            correspondences,
            intrinsics: Intrinsics {
                fx: f,
                fy: f,
                cx: (width - 1.0) * 0.5,
                cy: (height - 1.0) * 0.5,
            },
            distortions: [0.0; 5],
            poses: Vec::new(),
        }
    }

    pub fn intrinsics(&self) -> Intrinsics {
        self.intrinsics
    }

    pub fn distortions(&self) -> [f64; 5] {
        self.distortions
    }

    pub fn poses(&self) -> &[BoardPose] {
        &self.poses
    }

    fn fixed_principal_point(&self) -> bool {
        self.correspondences.len() < MIN_VIEWS_FOR_PRINCIPAL_POINT
    }

    pub fn model(&self) -> Result<RadTanModel, CameraModelError> {
        let [k1, k2, p1, p2, k3] = self.distortions;
        RadTanModel::new(self.intrinsics, 0.0, [k1, k2, p1, p2, k3, 0.0, 0.0, 0.0])
    }

    /// Closed-form focal lengths from the orthogonality of the homography
    /// columns, with the principal point at the image centre.
    fn focal_lengths_from_homographies(
        &self,
        homographies: &[Matrix3<f64>],
    ) -> Result<(f64, f64), CameraModelError> {
        let (cx, cy) = (self.intrinsics.cx, self.intrinsics.cy);
        let mut a = DMatrix::<f64>::zeros(homographies.len() * 2, 2);
        let mut b = DVector::<f64>::zeros(homographies.len() * 2);

        for (i, homography) in homographies.iter().enumerate() {
            let mut h = *homography;
            for col in 0..3 {
                h[(0, col)] -= h[(2, col)] * cx;
                h[(1, col)] -= h[(2, col)] * cy;
            }

            let c0 = h.column(0).into_owned();
            let c1 = h.column(1).into_owned();
            let d1 = (c0 + c1) * 0.5;
            let d2 = (c0 - c1) * 0.5;
            let (c0, c1, d1, d2) = (
                c0.normalize(),
                c1.normalize(),
                d1.normalize(),
                d2.normalize(),
            );

            a[(i * 2, 0)] = c0.x * c1.x;
            a[(i * 2, 1)] = c0.y * c1.y;
            b[i * 2] = -c0.z * c1.z;
            a[(i * 2 + 1, 0)] = d1.x * d2.x;
            a[(i * 2 + 1, 1)] = d1.y * d2.y;
            b[i * 2 + 1] = -d1.z * d2.z;
        }

        let f = a
            .svd(true, true)
            .solve(&b, 1e-12)
            .map_err(|e| CameraModelError::NumericalError(e.to_string()))?;
        let fx = (1.0 / f[0]).abs().sqrt();
        let fy = (1.0 / f[1]).abs().sqrt();
        if !fx.is_finite() || !fy.is_finite() || fx <= 0.0 || fy <= 0.0 {
            return Err(CameraModelError::NumericalError(
                "focal length initialisation is degenerate".to_string(),
            ));
        }
        Ok((fx, fy))
    }

    fn initial_values(&self) -> HashMap<String, DVector<f64>> {
        let i = &self.intrinsics;
        let [k1, k2, p1, p2, k3] = self.distortions;
        let intrinsics = if self.fixed_principal_point() {
            vec![i.fx, i.fy, k1, k2, p1, p2, k3]
        } else {
            vec![i.fx, i.fy, i.cx, i.cy, k1, k2, p1, p2, k3]
        };

        let mut values = HashMap::new();
        values.insert("intrinsics".to_string(), DVector::from_vec(intrinsics));
        for (index, pose) in self.poses.iter().enumerate() {
            values.insert(pose_key(index), DVector::from_vec(pose.to_vec()));
        }
        values
    }
}

pub(crate) fn pose_key(index: usize) -> String {
    format!("pose/{index}")
}

impl Optimizer for RadTanOptimizationCost {
    fn linear_estimation(&mut self) -> Result<(), CameraModelError> {
        let homographies = self
            .correspondences
            .views
            .iter()
            .map(|view| estimate_homography(&view.plane_points(), &view.image_points))
            .collect::<Result<Vec<_>, _>>()?;

        match self.focal_lengths_from_homographies(&homographies) {
            Ok((fx, fy)) => {
                self.intrinsics.fx = fx;
                self.intrinsics.fy = fy;
            }
            Err(e) => warn!(
                "Closed-form focal length failed ({}); starting from f = {}",
                e, self.intrinsics.fx
            ),
        }
        self.distortions = [0.0; 5];

        let k = crate::camera::camera_matrix(&self.intrinsics, 0.0);
        self.poses = homographies
            .iter()
            .map(|h| pose_from_homography(&k, h))
            .collect::<Result<Vec<_>, _>>()?;

        debug!("Initial pinhole intrinsics: {:?}", self.intrinsics);
        Ok(())
    }

    fn optimize(&mut self) -> Result<(), CameraModelError> {
        if self.poses.len() != self.correspondences.len() {
            return Err(CameraModelError::InvalidParams(
                "linear estimation must run before optimization".to_string(),
            ));
        }

        let fixed = self.fixed_principal_point();
        if fixed {
            info!(
                "Only {} view(s): holding the principal point at the image centre",
                self.correspondences.len()
            );
        }
        let principal_point =
            fixed.then(|| Vector2::new(self.intrinsics.cx, self.intrinsics.cy));

        let mut problem = tiny_solver::Problem::new();
        for (index, view) in self.correspondences.views.iter().enumerate() {
            let cost = RadTanViewCost {
                object_points: view.object_points.clone(),
                image_points: view.image_points.clone(),
                principal_point,
            };
            let key = pose_key(index);
            problem.add_residual_block(
                view.len() * 2,
                &["intrinsics", key.as_str()],
                Box::new(cost),
                None,
            );
        }

        info!("Starting pinhole optimization with tiny-solver Levenberg-Marquardt...");
        let optimizer = LevenbergMarquardtOptimizer::default();
        let result = optimizer
            .optimize(&problem, &self.initial_values(), None)
            .ok_or_else(|| CameraModelError::NumericalError("Optimization failed".to_string()))?;
        info!("Optimization finished");

        let cam = result
            .get("intrinsics")
            .ok_or_else(|| CameraModelError::NumericalError("missing intrinsics".to_string()))?;
        self.intrinsics.fx = cam[0];
        self.intrinsics.fy = cam[1];
        let offset = if fixed {
            2
        } else {
            self.intrinsics.cx = cam[2];
            self.intrinsics.cy = cam[3];
            4
        };
        for (slot, value) in self.distortions.iter_mut().zip(cam.iter().skip(offset)) {
            *slot = *value;
        }

        for (index, pose) in self.poses.iter_mut().enumerate() {
            let params = result.get(&pose_key(index)).ok_or_else(|| {
                CameraModelError::NumericalError(format!("missing pose {index}"))
            })?;
            *pose = BoardPose::from_slice(params.as_slice())?;
        }

        // Reject a non-physical solution instead of returning it.
        self.model().map_err(|e| {
            CameraModelError::NumericalError(format!("optimized intrinsics are invalid: {e}"))
        })?;
        Ok(())
    }

    fn result(&self) -> Result<CalibrationResult, CameraModelError> {
        let model = self.model()?;
        let projection_error =
            compute_reprojection_error(&model, &self.correspondences.views, &self.poses)?;
        Ok(CalibrationResult {
            kind: ModelKind::Pinhole,
            intrinsics: self.intrinsics,
            skew: 0.0,
            distortions: self.distortions.to_vec(),
            image_size: self.correspondences.image_size,
            rms: projection_error.rmse,
            projection_error,
            poses: self.poses.clone(),
            used_views: (0..self.correspondences.len()).collect(),
        })
    }
}
