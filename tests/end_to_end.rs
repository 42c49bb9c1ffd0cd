// tests/end_to_end.rs
mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use approx::assert_relative_eq;
use aruco_pipeline::anchor::{AnchorHandle, ContentHandle, Transform};
use aruco_pipeline::core::detector::{ArucoDetector, DetectorParams};
use aruco_pipeline::cv::color::{CanonicalFormat, ColorConverter};
use aruco_pipeline::detection::ValidationParams;
use aruco_pipeline::{
    AnchorHost, AnchorHostError, AnchorLifecycleManager, CalibrationProfile, ContentSpec, Frame,
    ImageBuffer, MarkerDetectionAdapter, Pipeline, PipelineConfig, Point2f, Pose, PoseEstimator,
};
use common::{marker_frame, render_marker};
use nalgebra::{UnitQuaternion, Vector3};

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

#[test]
fn synthetic_marker_is_detected_and_placed_in_front_of_the_camera() {
    let gray = render_marker(5, 200, 200, 40, 40, 16);
    let detector = ArucoDetector::aruco(DetectorParams::default()).unwrap();
    let mut adapter = MarkerDetectionAdapter::new(Box::new(detector), ValidationParams::default());
    let detection = adapter.detect(&ImageBuffer::gray(&gray, 200, 200)).unwrap();

    assert_eq!(detection.len(), 1);
    let marker = detection.get(5).unwrap();
    let expected = [
        Point2f::new(40.0, 40.0),
        Point2f::new(151.0, 40.0),
        Point2f::new(151.0, 151.0),
        Point2f::new(40.0, 151.0),
    ];
    for (found, known) in marker.corners.iter().zip(expected.iter()) {
        assert!((found - known).norm() <= 1.0, "{found:?} vs {known:?}");
    }

    let calibration = Arc::new(CalibrationProfile::nominal(200, 200).unwrap());
    let poses = PoseEstimator::posit()
        .estimate(&detection, 0.05, &calibration)
        .unwrap();
    assert_eq!(poses.len(), 1);
    assert!(poses[&5].tvec.z > 0.0);
}

#[test]
fn yuv_frames_reach_the_detector() {
    let y = render_marker(5, 200, 200, 40, 40, 16);
    let chroma = vec![128u8; 100 * 100];
    let frame = Frame::yuv420(y, chroma.clone(), chroma, 200, 200, Duration::ZERO, 7);

    let config = PipelineConfig {
        sample_every: 1,
        canonical_format: CanonicalFormat::Gray8,
        ..Default::default()
    };
    let pipeline =
        Pipeline::with_aruco(config, CalibrationProfile::nominal(200, 200).unwrap()).unwrap();
    assert!(pipeline.submit(frame).is_admitted());
    let outcome = pipeline.results().recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(outcome.sequence, 7);
    let poses = outcome.poses().unwrap();
    assert!(poses[&5].tvec.z > 0.0);
}

#[test]
fn conversion_is_deterministic() {
    let frame = marker_frame(0);
    for format in [CanonicalFormat::Gray8, CanonicalFormat::Rgb8, CanonicalFormat::Rgba8] {
        let converter = ColorConverter::new(format);
        let first = converter.convert_frame(&frame).unwrap();
        let second = converter.convert_frame(&frame).unwrap();
        assert_eq!(first.data, second.data);
        assert_eq!(first.data.len(), 200 * 200 * format.channels() as usize);
    }
}

#[test]
fn calibration_scales_with_resolution() {
    let distortion = [0.1, -0.05, 0.001, 0.002, 0.01];
    let profile = CalibrationProfile::new(500.0, 510.0, 320.0, 240.0, distortion)
        .unwrap()
        .with_resolution(640, 480)
        .unwrap();
    let scaled = profile.scaled_to_resolution(1920, 1080).unwrap();
    assert_relative_eq!(scaled.fx(), 1500.0);
    assert_relative_eq!(scaled.fy(), 1530.0);
    assert_relative_eq!(scaled.cx(), 960.0);
    assert_relative_eq!(scaled.cy(), 720.0);
    assert_eq!(scaled.distortion(), profile.distortion());
    assert_eq!(scaled.resolution(), Some((1920, 1080)));
}

#[test]
fn quaternion_from_rotation_vector() {
    let identity = Pose::new(Vector3::zeros(), Vector3::z());
    assert_eq!(identity.quaternion(), UnitQuaternion::identity());

    for theta in [0.1, 1.0, 2.5, -0.8] {
        let q = Pose::new(Vector3::new(theta, 0.0, 0.0), Vector3::z()).quaternion();
        assert_relative_eq!(q.angle(), theta.abs(), epsilon = 1e-12);
        let axis = q.axis().unwrap().into_inner() * theta.signum();
        assert_relative_eq!(axis, Vector3::x(), epsilon = 1e-12);
    }
}

/// Host that just tracks which handles are live.
#[derive(Default)]
struct SceneHost {
    next: u64,
    live: BTreeSet<AnchorHandle>,
}

impl AnchorHost for SceneHost {
    fn create_anchor(&mut self, _transform: &Transform) -> Result<AnchorHandle, AnchorHostError> {
        self.next += 1;
        self.live.insert(AnchorHandle(self.next));
        Ok(AnchorHandle(self.next))
    }

    fn update_anchor(
        &mut self,
        handle: AnchorHandle,
        _transform: &Transform,
    ) -> Result<(), AnchorHostError> {
        if self.live.contains(&handle) {
            Ok(())
        } else {
            Err(AnchorHostError(format!("{handle:?} is gone")))
        }
    }

    fn remove_anchor(&mut self, handle: AnchorHandle) -> Result<(), AnchorHostError> {
        self.live.remove(&handle);
        Ok(())
    }

    fn attach_content(
        &mut self,
        handle: AnchorHandle,
        _content: &ContentSpec,
    ) -> Result<ContentHandle, AnchorHostError> {
        Ok(ContentHandle(handle.0))
    }
}

#[test]
fn pipeline_outcomes_drive_anchors() {
    let config = PipelineConfig {
        sample_every: 1,
        ..Default::default()
    };
    let pipeline =
        Pipeline::with_aruco(config, CalibrationProfile::nominal(200, 200).unwrap()).unwrap();
    let mut anchors = AnchorLifecycleManager::new(SceneHost::default());
    anchors.set_default_content(Some(ContentSpec::new("cube")));

    pipeline.submit(marker_frame(0));
    pipeline.submit(common::blank_frame(1, 200));

    let seen = pipeline.results().recv_timeout(RECV_TIMEOUT).unwrap();
    anchors.apply(&seen).unwrap();
    assert_eq!(anchors.active_ids().collect::<Vec<_>>(), vec![5]);
    assert!(anchors.get(5).unwrap().content.is_some());
    assert_eq!(anchors.host().live.len(), 1);

    let gone = pipeline.results().recv_timeout(RECV_TIMEOUT).unwrap();
    assert!(gone.poses().unwrap().is_empty());
    let report = anchors.apply(&gone).unwrap();
    assert_eq!(report.removed, vec![5]);
    assert!(anchors.is_empty());
    assert!(anchors.host().live.is_empty());
}
