// src/pipeline/throttle.rs

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Sender, TrySendError};
use tracing::trace;

use super::worker::{FrameRequest, WorkerMessage};
use super::Shared;
use crate::config::PipelineConfig;
use crate::frame::Frame;

/// Why a frame did not enter the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Not this frame's turn under the 1-in-K rule.
    Sampling,
    /// `max_in_flight` frames are already being processed.
    QueueFull,
    /// The worker is not running.
    PipelineDown,
}

/// Outcome of [`FrameThrottler::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted { sequence: u64 },
    Skipped(SkipReason),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }
}

/// Producer-side admission control. Never blocks: a frame is either handed
/// to the worker or dropped on the spot.
pub struct FrameThrottler {
    sample_every: u64,
    sample_phase: u64,
    max_in_flight: usize,
    marker_size: f64,
    submitted: AtomicU64,
    shared: Arc<Shared>,
    requests: Sender<WorkerMessage>,
}

impl FrameThrottler {
    pub(crate) fn new(
        config: &PipelineConfig,
        shared: Arc<Shared>,
        requests: Sender<WorkerMessage>,
    ) -> Self {
        Self {
            sample_every: config.sample_every.max(1),
            sample_phase: config.sample_phase,
            max_in_flight: config.max_in_flight,
            marker_size: config.marker_size,
            submitted: AtomicU64::new(0),
            shared,
            requests,
        }
    }

    /// Offer a frame. Skipped frames are dropped and counted.
    pub fn submit(&self, frame: Frame) -> Admission {
        let index = self.submitted.fetch_add(1, Ordering::Relaxed);
        let sequence = frame.sequence;
        let admission = self.admit(index, frame);
        match admission {
            Admission::Admitted { .. } => trace!(sequence, "frame admitted"),
            Admission::Skipped(reason) => {
                self.shared.monitor.record_skipped();
                trace!(sequence, ?reason, "frame skipped");
            }
        }
        admission
    }

    fn admit(&self, index: u64, frame: Frame) -> Admission {
        if !self.shared.state().accepts_frames() {
            return Admission::Skipped(SkipReason::PipelineDown);
        }
        if index % self.sample_every != self.sample_phase {
            return Admission::Skipped(SkipReason::Sampling);
        }
        if !self.shared.try_reserve(self.max_in_flight) {
            return Admission::Skipped(SkipReason::QueueFull);
        }

        let sequence = frame.sequence;
        let request = FrameRequest {
            frame,
            calibration: self.shared.calibration(),
            marker_size: self.marker_size,
        };
        match self.requests.try_send(WorkerMessage::Process(request)) {
            Ok(()) => Admission::Admitted { sequence },
            Err(err) => {
                self.shared.release_slot();
                Admission::Skipped(match err {
                    TrySendError::Full(_) => SkipReason::QueueFull,
                    TrySendError::Disconnected(_) => SkipReason::PipelineDown,
                })
            }
        }
    }

    /// Frames admitted whose outcome has not been delivered yet.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight()
    }

    /// Frames offered so far, admitted or not.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Queue the shutdown sentinel behind any admitted frames.
    pub(crate) fn signal_shutdown(&self) {
        // Capacity is one above `max_in_flight`, so the sentinel always fits;
        // a disconnected channel means the worker already left.
        let _ = self.requests.try_send(WorkerMessage::Shutdown);
    }

    pub(crate) fn reconnect(&mut self, requests: Sender<WorkerMessage>) {
        self.requests = requests;
    }
}
