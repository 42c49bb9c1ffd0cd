// src/pipeline/worker.rs
//
// The single thread that owns the detection and pose primitives.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, debug_span, error, info, info_span, warn};

use super::monitor::PerformanceSample;
use super::{FrameOutcome, PipelineState, Shared};
use crate::calibration::CalibrationProfile;
use crate::config::PipelineConfig;
use crate::core::detector::DetectorFactory;
use crate::cv::color::ColorConverter;
use crate::detection::{MarkerDetectionAdapter, ValidationParams};
use crate::error::{DetectorInitError, PoseEstimationError, ProcessingError};
use crate::frame::Frame;
use crate::pose::{PoseEstimator, PoseMap};

pub(crate) const WORKER_THREAD_NAME: &str = "marker-worker";

/// An admitted frame plus everything captured at admission time.
pub(crate) struct FrameRequest {
    pub(crate) frame: Frame,
    pub(crate) calibration: Arc<CalibrationProfile>,
    pub(crate) marker_size: f64,
}

pub(crate) enum WorkerMessage {
    Process(FrameRequest),
    Shutdown,
}

/// Primitive owners handed back when the worker exits, so a
/// re-initialised pipeline can start a fresh worker with them.
pub(crate) struct WorkerParts {
    pub(crate) factory: Box<dyn DetectorFactory>,
    pub(crate) estimator: PoseEstimator,
}

struct ScaledCalibration {
    source: Arc<CalibrationProfile>,
    resolution: (u32, u32),
    profile: Arc<CalibrationProfile>,
}

pub(crate) struct Worker {
    factory: Box<dyn DetectorFactory>,
    estimator: PoseEstimator,
    adapter: Option<MarkerDetectionAdapter>,
    converter: ColorConverter,
    validation: ValidationParams,
    max_init_attempts: u32,
    init_failures: u32,
    scaled: Option<ScaledCalibration>,
    shared: Arc<Shared>,
    results: Sender<FrameOutcome>,
    samples: Sender<PerformanceSample>,
}

impl Worker {
    pub(crate) fn new(
        parts: WorkerParts,
        config: &PipelineConfig,
        shared: Arc<Shared>,
        results: Sender<FrameOutcome>,
        samples: Sender<PerformanceSample>,
    ) -> Self {
        Self {
            factory: parts.factory,
            estimator: parts.estimator,
            adapter: None,
            converter: ColorConverter::new(config.canonical_format),
            validation: config.validation.clone(),
            max_init_attempts: config.max_init_attempts,
            init_failures: 0,
            scaled: None,
            shared,
            results,
            samples,
        }
    }

    pub(crate) fn spawn(
        self,
        requests: Receiver<WorkerMessage>,
    ) -> io::Result<JoinHandle<WorkerParts>> {
        thread::Builder::new()
            .name(WORKER_THREAD_NAME.into())
            .spawn(move || self.run(requests))
    }

    /// Serves requests until the shutdown sentinel arrives. After giving up
    /// on the detector the loop keeps running and fails every request that
    /// was admitted before the state flip became visible to producers.
    fn run(mut self, requests: Receiver<WorkerMessage>) -> WorkerParts {
        let span = info_span!("marker_worker");
        let _guard = span.enter();
        debug!("worker started");

        while let Ok(message) = requests.recv() {
            let WorkerMessage::Process(request) = message else {
                debug!("shutdown requested");
                break;
            };
            if self.gave_up() {
                self.abandon(request);
                continue;
            }
            self.handle(request);
            if self.gave_up() {
                self.shared.set_state(PipelineState::Failed);
                error!(
                    attempts = self.init_failures,
                    "detector could not be constructed; pipeline needs re-initialisation"
                );
            }
        }

        for message in requests.try_iter() {
            if let WorkerMessage::Process(request) = message {
                self.abandon(request);
            }
        }
        // Release the primitive before handing the factory back.
        self.adapter = None;
        debug!("worker stopped");
        WorkerParts {
            factory: self.factory,
            estimator: self.estimator,
        }
    }

    fn handle(&mut self, request: FrameRequest) {
        let sequence = request.frame.sequence;
        let timestamp = request.frame.timestamp;
        let span = debug_span!("frame", sequence);
        let _guard = span.enter();

        let started = self.shared.heartbeat.begin();
        let result = match panic::catch_unwind(AssertUnwindSafe(|| self.process(request))) {
            Ok(result) => result,
            Err(payload) => {
                // The primitive may be left mid-frame; build a fresh one next time.
                self.adapter = None;
                self.scaled = None;
                Err(ProcessingError::Primitive(panic_message(payload.as_ref())))
            }
        };
        let processing_time = started.elapsed();
        self.shared.heartbeat.end();

        match &result {
            Ok(poses) => debug!(markers = poses.len(), ?processing_time, "frame processed"),
            Err(err) => warn!(sequence, kind = err.kind(), error = %err, "frame failed"),
        }
        self.shared.monitor.record_processed(processing_time);
        self.deliver(FrameOutcome {
            sequence,
            timestamp,
            processing_time,
            result,
        });
    }

    fn process(&mut self, request: FrameRequest) -> Result<PoseMap, ProcessingError> {
        let FrameRequest {
            frame,
            calibration,
            marker_size,
        } = request;

        let image = self.converter.convert_frame(&frame)?;
        drop(frame);

        let detection = self.detector()?.detect(&image.as_buffer())?;
        if detection.is_empty() {
            return Ok(PoseMap::new());
        }
        let calibration = self.calibration_for(&calibration, image.width, image.height)?;
        Ok(self.estimator.estimate(&detection, marker_size, &calibration)?)
    }

    /// The detection adapter, constructing the primitive on first use and
    /// after earlier failures.
    fn detector(&mut self) -> Result<&mut MarkerDetectionAdapter, DetectorInitError> {
        match self.adapter {
            Some(ref mut adapter) => Ok(adapter),
            None => match self.factory.create() {
                Ok(detector) => {
                    info!(failed_attempts = self.init_failures, "detector initialised");
                    self.init_failures = 0;
                    let adapter = MarkerDetectionAdapter::new(detector, self.validation.clone());
                    Ok(self.adapter.insert(adapter))
                }
                Err(err) => {
                    self.init_failures += 1;
                    Err(err)
                }
            },
        }
    }

    /// `snapshot` matched to the frame resolution. Scaled copies are cached
    /// per snapshot so the estimator keeps its camera model.
    fn calibration_for(
        &mut self,
        snapshot: &Arc<CalibrationProfile>,
        width: u32,
        height: u32,
    ) -> Result<Arc<CalibrationProfile>, PoseEstimationError> {
        match snapshot.resolution() {
            Some(resolution) if resolution != (width, height) => {}
            _ => return Ok(Arc::clone(snapshot)),
        }
        if let Some(cached) = &self.scaled {
            if Arc::ptr_eq(&cached.source, snapshot) && cached.resolution == (width, height) {
                return Ok(Arc::clone(&cached.profile));
            }
        }

        let profile = snapshot
            .scaled_to_resolution(width, height)
            .map_err(|e| PoseEstimationError::Calibration(e.to_string()))?;
        debug!(
            from = ?snapshot.resolution(),
            to = ?(width, height),
            "calibration scaled to frame"
        );
        let profile = Arc::new(profile);
        self.scaled = Some(ScaledCalibration {
            source: Arc::clone(snapshot),
            resolution: (width, height),
            profile: Arc::clone(&profile),
        });
        Ok(profile)
    }

    /// Send the outcome, then free its admission slot.
    fn deliver(&self, outcome: FrameOutcome) {
        // A consumer that dropped its receiver simply stops seeing outcomes.
        let _ = self.results.send(outcome);
        let depth = self.shared.release_slot();
        let _ = self.samples.try_send(self.shared.monitor.snapshot(depth));
    }

    fn gave_up(&self) -> bool {
        self.init_failures >= self.max_init_attempts
    }

    /// Answer a request without processing it.
    fn abandon(&self, request: FrameRequest) {
        let reason = if self.gave_up() {
            format!(
                "detector construction failed {} times in a row",
                self.init_failures
            )
        } else {
            "pipeline shut down".to_string()
        };
        warn!(sequence = request.frame.sequence, %reason, "frame abandoned");
        self.deliver(FrameOutcome {
            sequence: request.frame.sequence,
            timestamp: request.frame.timestamp,
            processing_time: Duration::ZERO,
            result: Err(ProcessingError::PipelineFailed(reason)),
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::detector::{MarkerDetector, RawMarker};
    use crate::error::DetectionError;
    use crate::frame::PixelFormat;
    use crate::pose::PositSolver;
    use crate::{ImageBuffer, Point2f};
    use crossbeam_channel::{bounded, unbounded};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Reports one centred marker; panics on 13 pixel wide images.
    struct Centered;

    impl MarkerDetector for Centered {
        fn detect(&mut self, image: &ImageBuffer) -> Result<Vec<RawMarker>, DetectionError> {
            if image.width == 13 {
                panic!("detector state corrupted");
            }
            let (w, h) = (image.width as f32, image.height as f32);
            Ok(vec![RawMarker {
                id: 3,
                corners: [
                    Point2f::new(w * 0.25, h * 0.25),
                    Point2f::new(w * 0.75, h * 0.25),
                    Point2f::new(w * 0.75, h * 0.75),
                    Point2f::new(w * 0.25, h * 0.75),
                ],
                hamming: 0,
            }])
        }
    }

    struct Harness {
        shared: Arc<Shared>,
        requests: Sender<WorkerMessage>,
        results: Receiver<FrameOutcome>,
        handle: JoinHandle<WorkerParts>,
    }

    impl Harness {
        fn start(factory: impl DetectorFactory + 'static, max_init_attempts: u32) -> Self {
            let config = PipelineConfig {
                max_init_attempts,
                ..Default::default()
            };
            let calibration = CalibrationProfile::nominal(64, 64).unwrap();
            let shared = Arc::new(Shared::new(calibration, config.ema_alpha));
            let (requests, requests_rx) = unbounded();
            let (results_tx, results) = unbounded();
            let (samples_tx, _) = bounded(1);
            let parts = WorkerParts {
                factory: Box::new(factory),
                estimator: PoseEstimator::new(Box::new(PositSolver::new())),
            };
            let handle = Worker::new(parts, &config, Arc::clone(&shared), results_tx, samples_tx)
                .spawn(requests_rx)
                .unwrap();
            Self {
                shared,
                requests,
                results,
                handle,
            }
        }

        /// Queue a request the way the throttler does, slot included.
        fn send(&self, sequence: u64, size: u32) {
            assert!(self.shared.try_reserve(usize::MAX));
            let frame = Frame::packed(
                vec![128; (size * size * 4) as usize],
                size,
                size,
                PixelFormat::Rgba8888,
                Duration::ZERO,
                sequence,
            );
            let request = FrameRequest {
                frame,
                calibration: self.shared.calibration(),
                marker_size: 0.05,
            };
            self.requests.send(WorkerMessage::Process(request)).unwrap();
        }

        fn finish(self) -> (Vec<FrameOutcome>, Arc<Shared>) {
            self.requests.send(WorkerMessage::Shutdown).unwrap();
            self.handle.join().unwrap();
            (self.results.try_iter().collect(), self.shared)
        }
    }

    #[test]
    fn panicking_detector_fails_only_its_frame() {
        let created = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&created);
        let factory = move || -> Result<Box<dyn MarkerDetector>, DetectorInitError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Centered))
        };
        let worker = Harness::start(factory, 3);
        worker.send(0, 64);
        worker.send(1, 13);
        worker.send(2, 64);
        let (outcomes, shared) = worker.finish();

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].is_success());
        match &outcomes[1].result {
            Err(ProcessingError::Primitive(message)) => {
                assert!(message.contains("detector state corrupted"))
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(outcomes[2].marker_ids().collect::<Vec<_>>(), vec![3]);
        // the detector is rebuilt after the panic
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(shared.state(), PipelineState::Running);
        assert_eq!(shared.in_flight(), 0);
    }

    #[test]
    fn requests_behind_a_given_up_detector_are_answered() {
        let factory = || -> Result<Box<dyn MarkerDetector>, DetectorInitError> {
            Err(DetectorInitError::new("no device"))
        };
        let worker = Harness::start(factory, 1);
        worker.send(0, 32);
        // admitted before the producer could observe the failure
        worker.send(1, 32);
        let (outcomes, shared) = worker.finish();

        assert_eq!(
            outcomes.iter().map(|o| o.sequence).collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert_eq!(outcomes[0].result.as_ref().unwrap_err().kind(), "detector_init");
        assert_eq!(outcomes[1].result.as_ref().unwrap_err().kind(), "pipeline_failed");
        assert_eq!(shared.state(), PipelineState::Failed);
        assert_eq!(shared.in_flight(), 0);
    }
}
