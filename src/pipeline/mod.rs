// Copyright (c) 2026 kalwalt and AR.js-org contributors
//
// This software is released under the MIT License.
// https://opensource.org/licenses/MIT
// See https://github.com/AR-js-org/aruco-rs/blob/main/LICENSE
// src/pipeline/mod.rs
//
// Frame admission, the worker thread and the `Pipeline` that wires them.
//
// ```text
// submit ──► FrameThrottler ──(bounded)──► marker-worker ──► results()
//                                                │
//                                                └────────► performance()
// ```

pub mod monitor;
pub mod throttle;
mod worker;

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use tracing::{info, warn};

use crate::calibration::CalibrationProfile;
use crate::config::PipelineConfig;
use crate::core::detector::{ArucoDetector, DetectorFactory, MarkerDetector};
use crate::error::{PipelineError, ProcessingError};
use crate::frame::Frame;
use crate::pose::{PoseEstimator, PoseMap, PoseSolver, PositSolver};
use crate::MarkerId;

pub use monitor::{PerformanceMonitor, PerformanceSample, PipelineHealth};
pub use throttle::{Admission, FrameThrottler, SkipReason};
use worker::{Worker, WorkerMessage, WorkerParts};

/// Performance samples buffered for a slow consumer before new ones are
/// dropped.
const SAMPLE_BUFFER: usize = 64;

/// Result of one admitted frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameOutcome {
    /// Sequence number of the originating frame.
    pub sequence: u64,
    /// Capture timestamp of the originating frame.
    pub timestamp: Duration,
    /// Time the worker spent on the frame.
    pub processing_time: Duration,
    /// Poses by marker id; empty when the frame holds no marker.
    pub result: Result<PoseMap, ProcessingError>,
}

impl FrameOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn poses(&self) -> Option<&PoseMap> {
        self.result.as_ref().ok()
    }

    /// Ids of the markers seen, empty for failed frames.
    pub fn marker_ids(&self) -> impl Iterator<Item = MarkerId> + '_ {
        self.poses().into_iter().flat_map(|p| p.keys().copied())
    }
}

/// Lifecycle of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineState {
    Running = 0,
    /// The detector could not be built, or the worker is gone; call
    /// [`Pipeline::reinitialize`].
    Failed = 1,
    ShutDown = 2,
}

impl PipelineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PipelineState::Running,
            1 => PipelineState::Failed,
            _ => PipelineState::ShutDown,
        }
    }

    pub fn accepts_frames(self) -> bool {
        self == PipelineState::Running
    }
}

/// State visible to the producer side and the worker alike.
pub(crate) struct Shared {
    state: AtomicU8,
    in_flight: AtomicUsize,
    calibration: RwLock<Arc<CalibrationProfile>>,
    pub(crate) monitor: Arc<PerformanceMonitor>,
    pub(crate) heartbeat: monitor::Heartbeat,
}

impl Shared {
    pub(crate) fn new(calibration: CalibrationProfile, ema_alpha: f64) -> Self {
        Self {
            state: AtomicU8::new(PipelineState::Running as u8),
            in_flight: AtomicUsize::new(0),
            calibration: RwLock::new(Arc::new(calibration)),
            monitor: Arc::new(PerformanceMonitor::new(ema_alpha)),
            heartbeat: monitor::Heartbeat::default(),
        }
    }

    pub(crate) fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: PipelineState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Snapshot handed to the next admitted frame.
    pub(crate) fn calibration(&self) -> Arc<CalibrationProfile> {
        let guard = self.calibration.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    pub(crate) fn set_calibration(&self, profile: CalibrationProfile) {
        let mut guard = self.calibration.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(profile);
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Take an admission slot unless `max` are already taken.
    pub(crate) fn try_reserve(&self, max: usize) -> bool {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_ok()
    }

    /// Give a slot back; returns the slots still taken.
    pub(crate) fn release_slot(&self) -> usize {
        match self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(previous) => previous - 1,
            Err(_) => 0,
        }
    }
}

/// A running marker pipeline.
///
/// Owns the throttler on the producer side and the `marker-worker` thread
/// holding the detection and pose primitives. Outcomes arrive on
/// [`Pipeline::results`] in admission order.
pub struct Pipeline {
    config: PipelineConfig,
    shared: Arc<Shared>,
    throttler: FrameThrottler,
    results: Receiver<FrameOutcome>,
    results_tx: Sender<FrameOutcome>,
    samples: Receiver<PerformanceSample>,
    samples_tx: Sender<PerformanceSample>,
    worker: Option<JoinHandle<WorkerParts>>,
    parked: Option<WorkerParts>,
}

fn request_channel(config: &PipelineConfig) -> (Sender<WorkerMessage>, Receiver<WorkerMessage>) {
    // One extra slot for the shutdown sentinel.
    bounded(config.max_in_flight + 1)
}

impl Pipeline {
    /// Validate `config` and start the worker. The detector is constructed
    /// lazily by the worker through `factory`.
    pub fn start(
        config: PipelineConfig,
        calibration: CalibrationProfile,
        factory: impl DetectorFactory + 'static,
        solver: Box<dyn PoseSolver>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let shared = Arc::new(Shared::new(calibration, config.ema_alpha));
        let (results_tx, results) = unbounded();
        let (samples_tx, samples) = bounded(SAMPLE_BUFFER);
        let (requests_tx, requests_rx) = request_channel(&config);
        let throttler = FrameThrottler::new(&config, Arc::clone(&shared), requests_tx);

        let mut pipeline = Self {
            config,
            shared,
            throttler,
            results,
            results_tx,
            samples,
            samples_tx,
            worker: None,
            parked: Some(WorkerParts {
                factory: Box::new(factory),
                estimator: PoseEstimator::new(solver),
            }),
        };
        pipeline.spawn(requests_rx)?;
        info!(
            sample_every = pipeline.config.sample_every,
            max_in_flight = pipeline.config.max_in_flight,
            "pipeline started"
        );
        Ok(pipeline)
    }

    /// Pipeline with the built-in ArUco detector and POSIT solver.
    pub fn with_aruco(
        config: PipelineConfig,
        calibration: CalibrationProfile,
    ) -> Result<Self, PipelineError> {
        let params = config.detector.clone();
        let factory = move || {
            ArucoDetector::aruco(params.clone()).map(|d| Box::new(d) as Box<dyn MarkerDetector>)
        };
        Self::start(config, calibration, factory, Box::new(PositSolver::new()))
    }

    fn spawn(&mut self, requests: Receiver<WorkerMessage>) -> Result<(), PipelineError> {
        let parts = self.parked.take().ok_or(PipelineError::WorkerLost)?;
        let worker = Worker::new(
            parts,
            &self.config,
            Arc::clone(&self.shared),
            self.results_tx.clone(),
            self.samples_tx.clone(),
        );
        self.worker = Some(worker.spawn(requests).map_err(PipelineError::Spawn)?);
        self.shared.set_state(PipelineState::Running);
        Ok(())
    }

    /// Offer a frame; never blocks.
    pub fn submit(&self, frame: Frame) -> Admission {
        self.throttler.submit(frame)
    }

    pub fn throttler(&self) -> &FrameThrottler {
        &self.throttler
    }

    /// One outcome per admitted frame, in admission order.
    pub fn results(&self) -> &Receiver<FrameOutcome> {
        &self.results
    }

    /// A sample after every outcome; dropped while the consumer lags.
    pub fn performance(&self) -> &Receiver<PerformanceSample> {
        &self.samples
    }

    pub fn monitor(&self) -> Arc<PerformanceMonitor> {
        Arc::clone(&self.shared.monitor)
    }

    pub fn performance_snapshot(&self) -> PerformanceSample {
        self.shared.monitor.snapshot(self.shared.in_flight())
    }

    /// Frames admitted after this call use `profile`; frames already in
    /// flight keep their snapshot.
    pub fn set_calibration(&self, profile: CalibrationProfile) {
        info!(fx = profile.fx(), resolution = ?profile.resolution(), "calibration replaced");
        self.shared.set_calibration(profile);
    }

    pub fn calibration(&self) -> Arc<CalibrationProfile> {
        self.shared.calibration()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// A worker that ended without being asked to reads as `Failed`.
    pub fn state(&self) -> PipelineState {
        let state = self.shared.state();
        match &self.worker {
            Some(handle) if state.accepts_frames() && handle.is_finished() => {
                PipelineState::Failed
            }
            _ => state,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.shared.in_flight()
    }

    /// Whether the worker is idle, busy, or stuck on one frame.
    pub fn health(&self) -> PipelineHealth {
        let health = self.shared.heartbeat.health(self.config.stall_threshold());
        if let PipelineHealth::Stalled { elapsed } = health {
            warn!(?elapsed, "worker stalled on a single frame");
        }
        health
    }

    /// Stop the current worker (if any) and start a fresh one with the same
    /// primitives. Performance counters start over.
    pub fn reinitialize(&mut self) -> Result<(), PipelineError> {
        self.shared.set_state(PipelineState::ShutDown);
        self.stop_worker()?;
        self.shared.in_flight.store(0, Ordering::Release);
        self.shared.monitor.reset();

        let (requests_tx, requests_rx) = request_channel(&self.config);
        self.throttler.reconnect(requests_tx);
        self.spawn(requests_rx)?;
        info!("pipeline re-initialised");
        Ok(())
    }

    /// Stop admitting frames, let the worker finish what is queued, and
    /// join it. Idempotent.
    pub fn shutdown(&mut self) -> Result<(), PipelineError> {
        if self.worker.is_some() {
            info!("pipeline shutting down");
        }
        self.shared.set_state(PipelineState::ShutDown);
        self.stop_worker()
    }

    fn stop_worker(&mut self) -> Result<(), PipelineError> {
        let Some(handle) = self.worker.take() else {
            return Ok(());
        };
        self.throttler.signal_shutdown();
        let parts = handle.join().map_err(|_| PipelineError::WorkerLost)?;
        self.parked = Some(parts);
        Ok(())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "pipeline did not shut down cleanly");
        }
    }
}
