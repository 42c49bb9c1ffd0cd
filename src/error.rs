// src/error.rs
//
// Error types for every stage of the pipeline.
//
// Per-frame failures are values: the worker wraps them in
// `ProcessingError` and delivers them with the frame's outcome, so no
// single frame can take the pipeline down.

use crate::frame::PixelFormat;
use crate::MarkerId;

/// Raised by the color converter when a frame cannot be normalised.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConversionError {
    #[error("unsupported pixel format {0:?}")]
    UnsupportedFormat(PixelFormat),
    #[error("invalid frame dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("{format:?} frame needs {expected} plane(s), got {actual}")]
    MissingPlane {
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },
    #[error("plane {plane} holds {actual} bytes, geometry needs {required}")]
    PlaneTooShort {
        plane: usize,
        required: usize,
        actual: usize,
    },
    #[error("plane {plane} strides overflow the frame geometry (row {row_stride}, sample {pixel_stride})")]
    StrideOverflow {
        plane: usize,
        row_stride: usize,
        pixel_stride: usize,
    },
}

/// The detection primitive could not be constructed.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("detector initialisation failed: {reason}")]
pub struct DetectorInitError {
    pub reason: String,
}

impl DetectorInitError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Per-frame detection failure.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DetectionError {
    /// The image handed to the detector is empty or not canonical.
    #[error("invalid detector input: {0}")]
    InvalidInput(String),
    /// The primitive itself reported a failure.
    #[error("marker detection failed: {0}")]
    Primitive(String),
}

/// Per-frame pose estimation failure.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PoseEstimationError {
    #[error("marker size must be finite and positive, got {0}")]
    InvalidMarkerSize(f64),
    #[error("marker {id}: corner {corner} cannot be undistorted")]
    Undistortion { id: MarkerId, corner: usize },
    #[error("marker {id}: pose solver diverged")]
    Degenerate { id: MarkerId },
    #[error("calibration cannot be matched to the frame: {0}")]
    Calibration(String),
}

/// Anything that can go wrong while processing one admitted frame.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ProcessingError {
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error(transparent)]
    DetectorInit(#[from] DetectorInitError),
    #[error(transparent)]
    Detection(#[from] DetectionError),
    #[error(transparent)]
    PoseEstimation(#[from] PoseEstimationError),
    /// A detection or pose primitive panicked while handling the frame.
    #[error("primitive panicked: {0}")]
    Primitive(String),
    /// The worker gave up constructing the detector; the pipeline must be
    /// re-initialised before frames are processed again.
    #[error("pipeline failed: {0}")]
    PipelineFailed(String),
}

impl ProcessingError {
    /// Short classification tag for logs and consumer UIs.
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessingError::Conversion(_) => "frame_conversion",
            ProcessingError::DetectorInit(_) => "detector_init",
            ProcessingError::Detection(_) => "detection",
            ProcessingError::PoseEstimation(_) => "pose_estimation",
            ProcessingError::Primitive(_) => "primitive_panic",
            ProcessingError::PipelineFailed(_) => "pipeline_failed",
        }
    }
}

/// Failure reported by the external anchor host.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("anchor host error: {0}")]
pub struct AnchorHostError(pub String);

/// Anchor lifecycle misuse detected before the host is called.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AnchorError {
    #[error("marker {0} already has an active anchor")]
    AlreadyActive(MarkerId),
    #[error("outcome for frame {sequence} is older than reconciled frame {last}")]
    OutOfOrder { sequence: u64, last: u64 },
    #[error(transparent)]
    Host(#[from] AnchorHostError),
}

/// Invalid calibration input.
#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    #[error("intrinsic matrix must be [[fx,0,cx],[0,fy,cy],[0,0,1]]: {0}")]
    Structure(String),
    #[error("calibration parameter {name} is invalid: {value}")]
    InvalidParameter { name: &'static str, value: f64 },
    #[error("target resolution {width}x{height} is invalid")]
    InvalidResolution { width: u32, height: u32 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Pipeline construction and configuration errors.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
    /// The worker thread panicked; its primitives are gone.
    #[error("worker thread terminated abnormally")]
    WorkerLost,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
