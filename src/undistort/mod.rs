//! Removes lens distortion from images.
//!
//! An [`Undistorter`] is built once from a [`CalibrationModel`] and a
//! [`ModelKind`]. It computes a new camera matrix for the requested free
//! scaling, builds a dense [`RemapTable`] from destination pixels to source
//! pixels and resamples the image bilinearly. Destination pixels whose source
//! position falls outside the input are black.

use crate::calibration::CalibrationModel;
use crate::camera::{
    CameraModel, CameraModelError, KannalaBrandtModel, ModelKind, RadTanModel, Resolution,
};
use crate::geometry::grid_points;
use image::{DynamicImage, ImageBuffer, Pixel, Primitive};
use log::{debug, info};
use nalgebra::{Matrix3, Vector2};
use num_traits::{NumCast, ToPrimitive, Zero};

/// Grid resolution used to find the valid region of the undistorted image.
const RECTANGLE_GRID: usize = 9;

#[derive(Debug, Clone)]
enum LensModel {
    Pinhole(RadTanModel),
    Fisheye(KannalaBrandtModel),
}

impl LensModel {
    /// Distorted pixel -> undistorted normalized image-plane point.
    fn pixel_to_undistorted(&self, pixel: &Vector2<f64>) -> Result<Vector2<f64>, CameraModelError> {
        match self {
            LensModel::Pinhole(model) => model.undistort(&model.pixel_to_normalized(pixel)),
            LensModel::Fisheye(model) => {
                let i = model.get_intrinsics();
                model.undistort(&Vector2::new(
                    (pixel.x - i.cx) / i.fx,
                    (pixel.y - i.cy) / i.fy,
                ))
            }
        }
    }

    /// Undistorted normalized image-plane point -> distorted pixel.
    fn undistorted_to_pixel(&self, point: &Vector2<f64>) -> Vector2<f64> {
        match self {
            LensModel::Pinhole(model) => model.normalized_to_pixel(&model.distort(point)),
            LensModel::Fisheye(model) => {
                let i = model.get_intrinsics();
                let distorted = model.distort(point);
                Vector2::new(i.fx * distorted.x + i.cx, i.fy * distorted.y + i.cy)
            }
        }
    }

    fn intrinsics_ratio(&self) -> f64 {
        let i = match self {
            LensModel::Pinhole(model) => model.get_intrinsics(),
            LensModel::Fisheye(model) => model.get_intrinsics(),
        };
        i.fx / i.fy
    }
}

/// Per-pixel source coordinates for every destination pixel, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct RemapTable {
    pub width: u32,
    pub height: u32,
    pub map_x: Vec<f32>,
    pub map_y: Vec<f32>,
}

impl RemapTable {
    fn index(&self, x: u32, y: u32) -> usize {
        (y as usize) * (self.width as usize) + x as usize
    }

    /// Source position sampled for destination pixel `(x, y)`.
    pub fn source(&self, x: u32, y: u32) -> (f32, f32) {
        let index = self.index(x, y);
        (self.map_x[index], self.map_y[index])
    }
}

/// Maps distorted images to undistorted ones for one calibration.
#[derive(Debug, Clone)]
pub struct Undistorter {
    lens: LensModel,
}

impl Undistorter {
    /// # Errors
    ///
    /// [`CameraModelError::InvalidCalibration`] if `fx` or `fy` is not positive.
    pub fn new(calibration: &CalibrationModel, kind: ModelKind) -> Result<Self, CameraModelError> {
        calibration.validate()?;
        let lens = match kind {
            ModelKind::Pinhole => LensModel::Pinhole(calibration.rad_tan_model()?),
            ModelKind::Fisheye => LensModel::Fisheye(calibration.kannala_brandt_model()?),
        };
        Ok(Undistorter { lens })
    }

    pub fn kind(&self) -> ModelKind {
        match self.lens {
            LensModel::Pinhole(_) => ModelKind::Pinhole,
            LensModel::Fisheye(_) => ModelKind::Fisheye,
        }
    }

    /// Camera matrix of the undistorted image.
    ///
    /// For the pinhole model `alpha = 0` keeps only valid pixels and
    /// `alpha = 1` keeps every source pixel. For the fisheye model `alpha` is
    /// the rectification balance between the tightest (`0`) and the widest
    /// (`1`) field of view.
    pub fn new_camera_matrix(
        &self,
        size: Resolution,
        alpha: f64,
    ) -> Result<Matrix3<f64>, CameraModelError> {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(CameraModelError::InvalidParams(format!(
                "alpha must lie in [0, 1], got {alpha}"
            )));
        }
        if size.width < 2 || size.height < 2 {
            return Err(CameraModelError::InvalidParams(
                "image must be at least 2x2 pixels".to_string(),
            ));
        }

        let k = match &self.lens {
            LensModel::Pinhole(_) => self.optimal_pinhole_matrix(size, alpha)?,
            LensModel::Fisheye(_) => self.fisheye_rectification_matrix(size, alpha)?,
        };
        if k.iter().any(|v| !v.is_finite()) || !(k[(0, 0)] > 0.0) || !(k[(1, 1)] > 0.0) {
            return Err(CameraModelError::NumericalError(
                "new camera matrix is degenerate".to_string(),
            ));
        }
        debug!("New camera matrix: {}", k);
        Ok(k)
    }

    /// Scales the camera so the inner (`alpha = 0`) or outer (`alpha = 1`)
    /// rectangle of the undistorted image border fills the output.
    fn optimal_pinhole_matrix(
        &self,
        size: Resolution,
        alpha: f64,
    ) -> Result<Matrix3<f64>, CameraModelError> {
        let (w, h) = (size.width as f64, size.height as f64);
        let points = grid_points(w, h, RECTANGLE_GRID, RECTANGLE_GRID)
            .iter()
            .map(|p| self.lens.pixel_to_undistorted(p))
            .collect::<Result<Vec<_>, _>>()?;

        let (mut ix0, mut ix1, mut iy0, mut iy1) =
            (f64::MIN, f64::MAX, f64::MIN, f64::MAX);
        let (mut ox0, mut ox1, mut oy0, mut oy1) =
            (f64::MAX, f64::MIN, f64::MAX, f64::MIN);
        let last = RECTANGLE_GRID - 1;
        for (index, p) in points.iter().enumerate() {
            let (row, col) = (index / RECTANGLE_GRID, index % RECTANGLE_GRID);
            ox0 = ox0.min(p.x);
            ox1 = ox1.max(p.x);
            oy0 = oy0.min(p.y);
            oy1 = oy1.max(p.y);
            if col == 0 {
                ix0 = ix0.max(p.x);
            }
            if col == last {
                ix1 = ix1.min(p.x);
            }
            if row == 0 {
                iy0 = iy0.max(p.y);
            }
            if row == last {
                iy1 = iy1.min(p.y);
            }
        }

        let fx0 = (w - 1.0) / (ix1 - ix0);
        let fy0 = (h - 1.0) / (iy1 - iy0);
        let cx0 = -fx0 * ix0;
        let cy0 = -fy0 * iy0;

        let fx1 = (w - 1.0) / (ox1 - ox0);
        let fy1 = (h - 1.0) / (oy1 - oy0);
        let cx1 = -fx1 * ox0;
        let cy1 = -fy1 * oy0;

        let blend = |a: f64, b: f64| a * (1.0 - alpha) + b * alpha;
        Ok(Matrix3::new(
            blend(fx0, fx1),
            0.0,
            blend(cx0, cx1),
            0.0,
            blend(fy0, fy1),
            blend(cy0, cy1),
            0.0,
            0.0,
            1.0,
        ))
    }

    /// Picks a focal length between the tightest and widest fit of the
    /// undistorted edge midpoints, weighted by `balance`.
    fn fisheye_rectification_matrix(
        &self,
        size: Resolution,
        balance: f64,
    ) -> Result<Matrix3<f64>, CameraModelError> {
        let (w, h) = (size.width as f64, size.height as f64);
        let edges = [
            Vector2::new(w / 2.0, 0.0),
            Vector2::new(w, h / 2.0),
            Vector2::new(w / 2.0, h),
            Vector2::new(0.0, h / 2.0),
        ];
        let aspect = self.lens.intrinsics_ratio();
        let points = edges
            .iter()
            .map(|p| {
                self.lens
                    .pixel_to_undistorted(p)
                    .map(|u| Vector2::new(u.x, u.y * aspect))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let centre = points.iter().fold(Vector2::zeros(), |acc, p| acc + p) / points.len() as f64;
        let min_x = points.iter().map(|p| p.x).fold(f64::MAX, f64::min);
        let max_x = points.iter().map(|p| p.x).fold(f64::MIN, f64::max);
        let min_y = points.iter().map(|p| p.y).fold(f64::MAX, f64::min);
        let max_y = points.iter().map(|p| p.y).fold(f64::MIN, f64::max);

        let candidates = [
            w * 0.5 / (centre.x - min_x),
            w * 0.5 / (max_x - centre.x),
            h * 0.5 * aspect / (centre.y - min_y),
            h * 0.5 * aspect / (max_y - centre.y),
        ];
        let f_min = candidates.iter().copied().fold(f64::MAX, f64::min);
        let f_max = candidates.iter().copied().fold(f64::MIN, f64::max);
        let f = balance * f_min + (1.0 - balance) * f_max;

        let cx = -centre.x * f + w * 0.5;
        let cy = (-centre.y * f + h * aspect * 0.5) / aspect;
        Ok(Matrix3::new(f, 0.0, cx, 0.0, f / aspect, cy, 0.0, 0.0, 1.0))
    }

    /// For every destination pixel, the source pixel it samples.
    pub fn remap_table(
        &self,
        size: Resolution,
        new_camera_matrix: &Matrix3<f64>,
    ) -> Result<RemapTable, CameraModelError> {
        let k_inv = new_camera_matrix.try_inverse().ok_or_else(|| {
            CameraModelError::InvalidCalibration("new camera matrix is singular".to_string())
        })?;

        let count = size.width as usize * size.height as usize;
        let mut map_x = Vec::with_capacity(count);
        let mut map_y = Vec::with_capacity(count);
        for v in 0..size.height {
            for u in 0..size.width {
                let ray = k_inv * nalgebra::Vector3::new(u as f64, v as f64, 1.0);
                let source = self
                    .lens
                    .undistorted_to_pixel(&Vector2::new(ray.x / ray.z, ray.y / ray.z));
                map_x.push(source.x as f32);
                map_y.push(source.y as f32);
            }
        }

        Ok(RemapTable {
            width: size.width,
            height: size.height,
            map_x,
            map_y,
        })
    }

    /// Undistorts one image buffer, keeping its pixel type.
    pub fn undistort<P>(
        &self,
        image: &ImageBuffer<P, Vec<P::Subpixel>>,
        alpha: f64,
    ) -> Result<ImageBuffer<P, Vec<P::Subpixel>>, CameraModelError>
    where
        P: Pixel,
    {
        let size = Resolution {
            width: image.width(),
            height: image.height(),
        };
        let new_k = self.new_camera_matrix(size, alpha)?;
        let table = self.remap_table(size, &new_k)?;
        Ok(remap(image, &table))
    }

    /// Undistorts a decoded image of any supported pixel type.
    pub fn undistort_dynamic(
        &self,
        image: &DynamicImage,
        alpha: f64,
    ) -> Result<DynamicImage, CameraModelError> {
        let size = Resolution {
            width: image.width(),
            height: image.height(),
        };
        let new_k = self.new_camera_matrix(size, alpha)?;
        info!("Undistorting {}x{} image ({} model)", size.width, size.height, self.kind());
        let table = self.remap_table(size, &new_k)?;

        Ok(match image {
            DynamicImage::ImageLuma8(img) => DynamicImage::ImageLuma8(remap(img, &table)),
            DynamicImage::ImageLumaA8(img) => DynamicImage::ImageLumaA8(remap(img, &table)),
            DynamicImage::ImageRgb8(img) => DynamicImage::ImageRgb8(remap(img, &table)),
            DynamicImage::ImageRgba8(img) => DynamicImage::ImageRgba8(remap(img, &table)),
            DynamicImage::ImageLuma16(img) => DynamicImage::ImageLuma16(remap(img, &table)),
            DynamicImage::ImageLumaA16(img) => DynamicImage::ImageLumaA16(remap(img, &table)),
            DynamicImage::ImageRgb16(img) => DynamicImage::ImageRgb16(remap(img, &table)),
            DynamicImage::ImageRgba16(img) => DynamicImage::ImageRgba16(remap(img, &table)),
            DynamicImage::ImageRgb32F(img) => DynamicImage::ImageRgb32F(remap(img, &table)),
            DynamicImage::ImageRgba32F(img) => DynamicImage::ImageRgba32F(remap(img, &table)),
            other => DynamicImage::ImageRgba8(remap(&other.to_rgba8(), &table)),
        })
    }
}

/// Undistorts `image` with the given calibration and lens model.
pub fn undistort_image(
    image: &DynamicImage,
    calibration: &CalibrationModel,
    kind: ModelKind,
    alpha: f64,
) -> Result<DynamicImage, CameraModelError> {
    Undistorter::new(calibration, kind)?.undistort_dynamic(image, alpha)
}

/// Resamples `src` at the table positions with bilinear interpolation.
///
/// Neighbours outside the source contribute black.
pub fn remap<P>(
    src: &ImageBuffer<P, Vec<P::Subpixel>>,
    table: &RemapTable,
) -> ImageBuffer<P, Vec<P::Subpixel>>
where
    P: Pixel,
{
    let channels = P::CHANNEL_COUNT as usize;
    let min = <P::Subpixel as Primitive>::DEFAULT_MIN_VALUE
        .to_f64()
        .unwrap_or(f64::MIN);
    let max = <P::Subpixel as Primitive>::DEFAULT_MAX_VALUE
        .to_f64()
        .unwrap_or(f64::MAX);
    // Integer subpixels round, float subpixels keep the fraction.
    let integral = max > 1.0;

    let mut dst = ImageBuffer::<P, Vec<P::Subpixel>>::new(table.width, table.height);
    for (x, y, pixel) in dst.enumerate_pixels_mut() {
        let (sx, sy) = table.source(x, y);
        let out = pixel.channels_mut();
        for (c, slot) in out.iter_mut().enumerate().take(channels) {
            let mut value = bilinear_sample(src, sx as f64, sy as f64, c);
            if integral {
                value = value.round();
            }
            *slot = NumCast::from(value.clamp(min, max))
                .unwrap_or_else(<P::Subpixel as Zero>::zero);
        }
    }
    dst
}

/// Bilinear sample of one channel with a constant black border.
fn bilinear_sample<P>(src: &ImageBuffer<P, Vec<P::Subpixel>>, x: f64, y: f64, channel: usize) -> f64
where
    P: Pixel,
{
    if !x.is_finite() || !y.is_finite() {
        return 0.0;
    }
    let (width, height) = (src.width() as i64, src.height() as i64);
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let (x0, y0) = (x0 as i64, y0 as i64);
    if x0 < -1 || y0 < -1 || x0 >= width || y0 >= height {
        return 0.0;
    }

    let value = |xi: i64, yi: i64| -> f64 {
        if xi < 0 || yi < 0 || xi >= width || yi >= height {
            return 0.0;
        }
        src.get_pixel(xi as u32, yi as u32).channels()[channel]
            .to_f64()
            .unwrap_or(0.0)
    };

    value(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + value(x0 + 1, y0) * fx * (1.0 - fy)
        + value(x0, y0 + 1) * (1.0 - fx) * fy
        + value(x0 + 1, y0 + 1) * fx * fy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::Distortion;
    use crate::camera::{Intrinsics, SensorSize};
    use approx::assert_relative_eq;
    use image::{GrayImage, Luma, Rgb, RgbImage};

    fn calibration(fx: f64, fy: f64, distortion: Distortion) -> CalibrationModel {
        CalibrationModel::new(
            Intrinsics {
                fx,
                fy,
                cx: 31.5,
                cy: 23.5,
            },
            0.0,
            distortion,
            &SensorSize {
                width: 4.8,
                height: 3.6,
            },
            &Resolution {
                width: 64,
                height: 48,
            },
        )
        .unwrap()
    }

    fn gradient_image() -> RgbImage {
        RgbImage::from_fn(64, 48, |x, y| Rgb([(x * 3) as u8, (y * 5) as u8, ((x + y) % 256) as u8]))
    }

    #[test]
    fn test_zero_distortion_is_identity() {
        let calib = calibration(50.0, 50.0, Distortion::zero());
        let undistorter = Undistorter::new(&calib, ModelKind::Pinhole).unwrap();

        let size = Resolution {
            width: 64,
            height: 48,
        };
        let k = undistorter.new_camera_matrix(size, 1.0).unwrap();
        assert_relative_eq!(k, calib.camera_matrix(), epsilon = 1e-6);

        let image = gradient_image();
        let output = undistorter.undistort(&image, 1.0).unwrap();
        assert_eq!(output.dimensions(), image.dimensions());
        assert_eq!(output, image);
    }

    #[test]
    fn test_barrel_distortion_leaves_black_border() {
        let calib = calibration(40.0, 40.0, Distortion::from_opencv_vec(&[-0.1]));
        let undistorter = Undistorter::new(&calib, ModelKind::Pinhole).unwrap();
        let image = GrayImage::from_pixel(64, 48, Luma([255u8]));

        // With alpha = 1 the stretched corners fill the frame, so the edge
        // midpoints sample outside the source.
        let output = undistorter.undistort(&image, 1.0).unwrap();
        assert_eq!(output.dimensions(), (64, 48));
        assert_eq!(output.get_pixel(32, 0)[0], 0);
        assert_eq!(output.get_pixel(0, 24)[0], 0);
        assert_eq!(output.get_pixel(32, 24)[0], 255);
    }

    #[test]
    fn test_alpha_zero_crops_tighter_than_alpha_one() {
        let calib = calibration(40.0, 40.0, Distortion::from_opencv_vec(&[-0.1]));
        let undistorter = Undistorter::new(&calib, ModelKind::Pinhole).unwrap();
        let size = Resolution {
            width: 64,
            height: 48,
        };
        let cropped = undistorter.new_camera_matrix(size, 0.0).unwrap();
        let full = undistorter.new_camera_matrix(size, 1.0).unwrap();
        assert!(cropped[(0, 0)] > full[(0, 0)]);
        assert!(undistorter.new_camera_matrix(size, 1.5).is_err());
    }

    #[test]
    fn test_preserves_pixel_type_and_channels() {
        let calib = calibration(45.0, 45.0, Distortion::from_opencv_vec(&[-0.1]));
        let rgba = DynamicImage::ImageRgba16(image::ImageBuffer::from_pixel(
            64,
            48,
            image::Rgba([1000u16, 2000, 3000, 65535]),
        ));
        let output = undistort_image(&rgba, &calib, ModelKind::Pinhole, 1.0).unwrap();
        assert!(matches!(output, DynamicImage::ImageRgba16(_)));
        assert_eq!((output.width(), output.height()), (64, 48));
        assert_eq!(output.color().channel_count(), 4);
    }

    #[test]
    fn test_fisheye_new_camera_matrix() {
        let calib = calibration(30.0, 30.0, Distortion::from_slices(&[0.01, -0.002], &[]));
        let undistorter = Undistorter::new(&calib, ModelKind::Fisheye).unwrap();
        let size = Resolution {
            width: 64,
            height: 48,
        };
        let tight = undistorter.new_camera_matrix(size, 0.0).unwrap();
        let wide = undistorter.new_camera_matrix(size, 1.0).unwrap();
        assert!(tight[(0, 0)] >= wide[(0, 0)]);
        assert_relative_eq!(tight[(0, 2)], 31.5, epsilon = 1.0);
        assert_relative_eq!(tight[(1, 2)], 23.5, epsilon = 1.0);

        let image = gradient_image();
        let output = undistorter.undistort(&image, 0.0).unwrap();
        assert_eq!(output.dimensions(), image.dimensions());
    }

    #[test]
    fn test_rejects_non_positive_focal_length() {
        let mut calib = calibration(50.0, 50.0, Distortion::zero());
        calib.pixels.fx = 0.0;
        assert!(matches!(
            Undistorter::new(&calib, ModelKind::Pinhole),
            Err(CameraModelError::InvalidCalibration(_))
        ));
        calib.pixels.fx = 50.0;
        calib.pixels.fy = -1.0;
        assert!(matches!(
            Undistorter::new(&calib, ModelKind::Fisheye),
            Err(CameraModelError::InvalidCalibration(_))
        ));
    }

    #[test]
    fn test_bilinear_sample_blends_neighbours() {
        let image = GrayImage::from_raw(2, 1, vec![0u8, 100]).unwrap();
        assert_relative_eq!(bilinear_sample(&image, 0.25, 0.0, 0), 25.0);
        // Half of the weight falls outside the image.
        assert_relative_eq!(bilinear_sample(&image, 1.5, 0.0, 0), 50.0);
        assert_eq!(bilinear_sample(&image, -5.0, 0.0, 0), 0.0);
        assert_eq!(bilinear_sample(&image, f64::NAN, 0.0, 0), 0.0);
    }
}
