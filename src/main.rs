//! `camcal` command line tool.
//!
//! ```bash
//! camcal calibrate-camera --input corners.json --sensor-width 6.17 --sensor-height 4.55
//! camcal undistort-image --image in.png --intrinsics data/intrinsics/cam1.yaml --output out.png
//! camcal estimate-height --detections detections.json --config configs/height.yaml
//! ```
//!
//! Verbosity is controlled through `RUST_LOG`.

use camcal::calibration::CalibrationModel;
use camcal::camera::{CameraModelError, ModelKind, Resolution, SensorSize};
use camcal::height::{self, ExtrinsicPose, PoseParams};
use camcal::optimization::{self, BoardGeometry, CorrespondenceSet};
use camcal::undistort::undistort_image;
use camcal::util;
use clap::{Args, Parser, Subcommand};
use log::{debug, info};
use nalgebra::Vector2;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_INTRINSICS: &str = "data/intrinsics/cam1.yaml";
const DEFAULT_EXTRINSICS: &str = "data/extrinsics/cam1.yaml";

/// Camera calibration and measurement tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Calibrate a camera from detected chessboard corners
    CalibrateCamera(CalibrateArgs),
    /// Undistort a photo using the camera intrinsics
    UndistortImage(UndistortArgs),
    /// Estimate the height of the tallest detected person
    EstimateHeight(HeightArgs),
}

#[derive(Args, Debug)]
struct CalibrateArgs {
    /// JSON file with the corner detector output
    #[arg(short, long)]
    input: PathBuf,

    /// Number of inner corners per chessboard row
    #[arg(long, default_value_t = 9)]
    board_width: usize,

    /// Number of inner corners per chessboard column
    #[arg(long, default_value_t = 6)]
    board_height: usize,

    /// Size of the chessboard squares in meters
    #[arg(long, default_value_t = 0.025)]
    square_size: f64,

    /// Sensor width in millimeters
    #[arg(long)]
    sensor_width: f64,

    /// Sensor height in millimeters
    #[arg(long)]
    sensor_height: f64,

    /// Use the fisheye (Kannala-Brandt) lens model
    #[arg(long)]
    fisheye: bool,

    /// Where the calibration YAML is written
    #[arg(short, long, default_value = DEFAULT_INTRINSICS)]
    output: PathBuf,
}

#[derive(Args, Debug)]
struct UndistortArgs {
    /// Distorted input image
    #[arg(long)]
    image: PathBuf,

    /// Calibration YAML file
    #[arg(long)]
    intrinsics: PathBuf,

    /// Use the fisheye (Kannala-Brandt) lens model
    #[arg(long)]
    fisheye: bool,

    /// Free scaling in [0, 1]; the balance for fisheye lenses.
    /// Defaults to 1 for pinhole and 0 for fisheye.
    #[arg(long)]
    alpha: Option<f64>,

    /// Where the undistorted image is written
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Args, Debug, Default)]
struct HeightArgs {
    /// YAML file providing defaults for the other flags
    #[arg(long)]
    config: Option<PathBuf>,

    /// Calibration YAML file
    #[arg(long)]
    intrinsics: Option<PathBuf>,

    /// Pose YAML file (camera_height, camera_pitch, distance_to_object)
    #[arg(long)]
    extrinsics: Option<PathBuf>,

    /// JSON file with the person detector output
    #[arg(long)]
    detections: Option<PathBuf>,
}

/// Keys of an `estimate-height` config file; unknown keys are ignored.
#[derive(Deserialize, Debug, Default)]
struct HeightConfig {
    intrinsics: Option<PathBuf>,
    extrinsics: Option<PathBuf>,
    detections: Option<PathBuf>,
}

/// Input paths after merging flags, config and built-in defaults.
#[derive(Debug, PartialEq)]
struct HeightInputs {
    intrinsics: PathBuf,
    extrinsics: PathBuf,
    detections: PathBuf,
}

/// Corner detector output for a set of chessboard images.
#[derive(Deserialize, Debug)]
struct CornerFile {
    image_width: u32,
    image_height: u32,
    views: Vec<CornerView>,
}

#[derive(Deserialize, Debug)]
struct CornerView {
    image: String,
    /// `None` when the board was not found.
    corners: Option<Vec<[f64; 2]>>,
}

fn load_corner_file(path: &Path) -> Result<CornerFile, CameraModelError> {
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

fn calibrate_camera(args: &CalibrateArgs) -> Result<(), CameraModelError> {
    let board = BoardGeometry::new(args.board_width, args.board_height, args.square_size)?;
    let corner_file = load_corner_file(&args.input)?;
    info!(
        "Loaded {} views from {}",
        corner_file.views.len(),
        args.input.display()
    );

    let detections: Vec<Option<Vec<Vector2<f64>>>> = corner_file
        .views
        .iter()
        .map(|view| {
            if view.corners.is_none() {
                debug!("No chessboard found in {}", view.image);
            }
            view.corners.as_ref().map(|corners| {
                corners
                    .iter()
                    .map(|&[x, y]| Vector2::new(x, y))
                    .collect()
            })
        })
        .collect();

    let image_size = Resolution {
        width: corner_file.image_width,
        height: corner_file.image_height,
    };
    let correspondences = CorrespondenceSet::from_detections(&board, image_size, &detections);
    let kind = ModelKind::from_fisheye_flag(args.fisheye);
    let result = optimization::calibrate(&correspondences, kind)?;
    info!("Reprojection error: {:?}", result.projection_error);

    let sensor_size = SensorSize {
        width: args.sensor_width,
        height: args.sensor_height,
    };
    let calibration = CalibrationModel::from_estimate(&result, &sensor_size)?;
    calibration.save_to_yaml(&args.output)?;

    println!("RMS reprojection error: {:.4} px", result.rms);
    println!("Camera calibration saved to: {}", args.output.display());
    Ok(())
}

fn undistort(args: &UndistortArgs) -> Result<(), CameraModelError> {
    let kind = ModelKind::from_fisheye_flag(args.fisheye);
    let alpha = args.alpha.unwrap_or(match kind {
        ModelKind::Pinhole => 1.0,
        ModelKind::Fisheye => 0.0,
    });

    let image = util::load_image(&args.image)?;
    let calibration = CalibrationModel::load_from_yaml(&args.intrinsics)?;
    let undistorted = undistort_image(&image, &calibration, kind, alpha)?;
    util::save_image(&undistorted, &args.output)?;

    println!("Undistorted image saved to: {}", args.output.display());
    Ok(())
}

fn resolve_height_inputs(
    args: &HeightArgs,
    config: HeightConfig,
) -> Result<HeightInputs, CameraModelError> {
    let intrinsics = args
        .intrinsics
        .clone()
        .or(config.intrinsics)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_INTRINSICS));
    let extrinsics = args
        .extrinsics
        .clone()
        .or(config.extrinsics)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_EXTRINSICS));
    let detections = args
        .detections
        .clone()
        .or(config.detections)
        .ok_or_else(|| {
            CameraModelError::InvalidParams(
                "no detections file given on the command line or in the config".to_string(),
            )
        })?;

    Ok(HeightInputs {
        intrinsics,
        extrinsics,
        detections,
    })
}

fn load_height_config(path: Option<&Path>) -> Result<HeightConfig, CameraModelError> {
    match path {
        Some(path) => {
            info!("Reading defaults from {}", path.display());
            let contents = fs::read_to_string(path)?;
            Ok(serde_yaml::from_str(&contents)?)
        }
        None => Ok(HeightConfig::default()),
    }
}

fn estimate_height(args: &HeightArgs) -> Result<(), CameraModelError> {
    let config = load_height_config(args.config.as_deref())?;
    let inputs = resolve_height_inputs(args, config)?;

    let calibration = CalibrationModel::load_from_yaml(&inputs.intrinsics)?;
    calibration.validate()?;
    let params = PoseParams::load_from_yaml(&inputs.extrinsics)?;
    let pose = ExtrinsicPose::from_params(&params)?;

    let detections = height::load_detections(&inputs.detections)?;
    let bbox = height::select_tallest(&detections)?;
    info!("Tallest person box: {:?}", bbox);

    let height = height::estimate_height(&bbox, &calibration.camera_matrix(), &pose)?;
    println!("Estimated height: {height:.2} meters");
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    match &cli.command {
        Command::CalibrateCamera(args) => calibrate_camera(args)?,
        Command::UndistortImage(args) => undistort(args)?,
        Command::EstimateHeight(args) => estimate_height(args)?,
    }
    Ok(())
}
