// src/config.rs
//
// Pipeline configuration.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::detector::DetectorParams;
use crate::cv::color::CanonicalFormat;
use crate::detection::ValidationParams;
use crate::error::PipelineError;

/// Everything the pipeline needs besides the calibration and primitives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Admit one of every `sample_every` submitted frames.
    pub sample_every: u64,
    /// Which residue of the submission counter is admitted.
    pub sample_phase: u64,
    /// Frames admitted but not yet resulted, at most.
    pub max_in_flight: usize,
    /// Physical side of the markers; poses use the same unit.
    pub marker_size: f64,
    /// Layout the converter produces for the detector.
    pub canonical_format: CanonicalFormat,
    /// Consecutive detector construction failures before the pipeline gives up.
    pub max_init_attempts: u32,
    /// Weight of the newest sample in the processing time average.
    pub ema_alpha: f64,
    /// A request running longer than this is reported as stalled.
    pub stall_threshold_ms: u64,
    pub detector: DetectorParams,
    pub validation: ValidationParams,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_every: 3,
            sample_phase: 0,
            max_in_flight: 3,
            marker_size: 0.05,
            canonical_format: CanonicalFormat::Rgba8,
            max_init_attempts: 5,
            ema_alpha: 0.1,
            stall_threshold_ms: 1_500,
            detector: DetectorParams::default(),
            validation: ValidationParams::default(),
        }
    }
}

impl PipelineConfig {
    /// Load a JSON config from disk; missing fields take their defaults.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let raw = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Write this config to disk as pretty JSON.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), PipelineError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let fail = |msg: String| Err(PipelineError::Config(msg));
        if self.sample_every == 0 {
            return fail("sample_every must be at least 1".into());
        }
        if self.sample_phase >= self.sample_every {
            return fail(format!(
                "sample_phase {} must be below sample_every {}",
                self.sample_phase, self.sample_every
            ));
        }
        if self.max_in_flight == 0 {
            return fail("max_in_flight must be at least 1".into());
        }
        if !(self.marker_size.is_finite() && self.marker_size > 0.0) {
            return fail(format!("marker_size {} must be positive", self.marker_size));
        }
        if self.max_init_attempts == 0 {
            return fail("max_init_attempts must be at least 1".into());
        }
        if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
            return fail(format!("ema_alpha {} must be in (0, 1]", self.ema_alpha));
        }
        Ok(())
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_millis(self.stall_threshold_ms)
    }
}
