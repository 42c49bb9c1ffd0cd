// benches/cv_benchmarks.rs
#![allow(clippy::needless_range_loop)]
use std::sync::Arc;
use std::time::Duration;

use aruco_pipeline::core::detector::{ArucoDetector, DetectorParams};
use aruco_pipeline::core::dictionary::Dictionary;
use aruco_pipeline::cv::color::{CanonicalFormat, ColorConverter};
use aruco_pipeline::cv::scalar::ScalarCV;
use aruco_pipeline::cv::ComputerVision;
use aruco_pipeline::detection::ValidationParams;
use aruco_pipeline::{
    CalibrationProfile, Frame, ImageBuffer, MarkerDetectionAdapter, PixelFormat, Point2f,
    PoseEstimator,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

const SIZES: [(usize, usize); 3] = [(320, 240), (640, 480), (1280, 720)];

fn ramp(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

/// Gray frame with marker 5 drawn in the centre, `cell` pixels per bit.
fn marker_scene(width: usize, height: usize, cell: usize) -> Vec<u8> {
    let bits = Dictionary::aruco().bits(5).unwrap();
    let mut data = vec![255u8; width * height];
    let x0 = width / 2 - 7 * cell / 2;
    let y0 = height / 2 - 7 * cell / 2;
    for row in 0..7 {
        for col in 0..7 {
            let inner = (1..6).contains(&row) && (1..6).contains(&col);
            let value = if inner && bits[(row - 1) * 5 + col - 1] == 1 { 255 } else { 0 };
            for y in 0..cell {
                let start = (y0 + row * cell + y) * width + x0 + col * cell;
                data[start..start + cell].fill(value);
            }
        }
    }
    data
}

fn bench_grayscale(c: &mut Criterion) {
    let mut group = c.benchmark_group("Grayscale");
    for &(width, height) in SIZES.iter() {
        let num_pixels = width * height;
        let data = ramp(num_pixels * 4);
        let buffer = ImageBuffer {
            data: &data,
            width: width as u32,
            height: height as u32,
            channels: 4,
        };
        let mut out = vec![0u8; num_pixels];
        let size_str = format!("{}x{}", width, height);

        group.bench_with_input(BenchmarkId::new("scalar", &size_str), &size_str, |b, _| {
            b.iter(|| ScalarCV::grayscale(black_box(&buffer), black_box(&mut out)))
        });
    }
    group.finish();
}

fn bench_otsu(c: &mut Criterion) {
    let mut group = c.benchmark_group("Otsu");
    for &(width, height) in SIZES.iter() {
        let data = ramp(width * height);
        let size_str = format!("{}x{}", width, height);

        group.bench_with_input(BenchmarkId::new("scalar", &size_str), &size_str, |b, _| {
            b.iter(|| ScalarCV::otsu(black_box(&data)))
        });
    }
    group.finish();
}

fn bench_adaptive_threshold(c: &mut Criterion) {
    let mut group = c.benchmark_group("AdaptiveThreshold");
    for &(width, height) in SIZES.iter() {
        let num_pixels = width * height;
        let data = ramp(num_pixels);
        let buffer = ImageBuffer::gray(&data, width as u32, height as u32);
        let mut out = vec![0u8; num_pixels];
        let size_str = format!("{}x{}", width, height);

        group.bench_with_input(BenchmarkId::new("scalar", &size_str), &size_str, |b, _| {
            b.iter(|| {
                ScalarCV::adaptive_threshold(
                    black_box(&buffer),
                    black_box(&mut out),
                    black_box(2),
                    black_box(7),
                )
            })
        });
    }
    group.finish();
}

fn bench_find_contours(c: &mut Criterion) {
    let mut group = c.benchmark_group("FindContours");
    for &(width, height) in SIZES.iter() {
        // 10x10 blobs on a sparse grid, many contours to trace
        let mut data = vec![0u8; width * height];
        for y in 0..height {
            for x in 0..width {
                if (x / 10) % 2 == 0 && (y / 10) % 2 == 0 {
                    data[y * width + x] = 255;
                }
            }
        }
        let buffer = ImageBuffer::gray(&data, width as u32, height as u32);
        let size_str = format!("{}x{}", width, height);

        group.bench_with_input(BenchmarkId::new("scalar", &size_str), &size_str, |b, _| {
            b.iter(|| aruco_pipeline::cv::contours::find_contours(black_box(&buffer)))
        });
    }
    group.finish();
}

fn bench_warp(c: &mut Criterion) {
    let mut group = c.benchmark_group("PerspectiveWarp");
    for &(width, height) in SIZES.iter() {
        let data = ramp(width * height);
        let buffer = ImageBuffer::gray(&data, width as u32, height as u32);

        let w = width as f32;
        let h = height as f32;
        let contour = [
            Point2f::new(w * 0.25, h * 0.25),
            Point2f::new(w * 0.75, h * 0.25),
            Point2f::new(w * 0.75, h * 0.75),
            Point2f::new(w * 0.25, h * 0.75),
        ];
        let mut out = vec![0u8; 49 * 49];
        let size_str = format!("{}x{}", width, height);

        group.bench_with_input(BenchmarkId::new("scalar", &size_str), &size_str, |b, _| {
            b.iter(|| {
                ScalarCV::warp(
                    black_box(&buffer),
                    black_box(&mut out),
                    black_box(&contour),
                    black_box(49),
                )
            })
        });
    }
    group.finish();
}

fn bench_color_conversion(c: &mut Criterion) {
    let mut group = c.benchmark_group("ColorConversion");
    for &(width, height) in SIZES.iter() {
        let (w, h) = (width as u32, height as u32);
        let chroma = (width / 2) * (height / 2);
        let yuv = Frame::yuv420(
            ramp(width * height),
            vec![90; chroma],
            vec![160; chroma],
            w,
            h,
            Duration::ZERO,
            0,
        );
        let bgra = Frame::packed(
            ramp(width * height * 4),
            w,
            h,
            PixelFormat::Bgra8888,
            Duration::ZERO,
            0,
        );
        let converter = ColorConverter::new(CanonicalFormat::Rgba8);
        let size_str = format!("{}x{}", width, height);

        group.bench_with_input(BenchmarkId::new("yuv420", &size_str), &size_str, |b, _| {
            b.iter(|| converter.convert_frame(black_box(&yuv)))
        });
        group.bench_with_input(BenchmarkId::new("bgra", &size_str), &size_str, |b, _| {
            b.iter(|| converter.convert_frame(black_box(&bgra)))
        });
    }
    group.finish();
}

fn bench_detector(c: &mut Criterion) {
    let mut group = c.benchmark_group("Detector_Detect");
    for &(width, height) in SIZES.iter() {
        let data = marker_scene(width, height, height / 12);
        let buffer = ImageBuffer::gray(&data, width as u32, height as u32);
        let mut detector = ArucoDetector::aruco(DetectorParams::default()).unwrap();
        let size_str = format!("{}x{}", width, height);

        group.bench_with_input(BenchmarkId::new("scalar", &size_str), &size_str, |b, _| {
            b.iter(|| detector.find(black_box(&buffer)))
        });
    }
    group.finish();
}

fn bench_detect_and_estimate(c: &mut Criterion) {
    let mut group = c.benchmark_group("DetectAndEstimate");
    let (width, height) = (640, 480);
    let data = marker_scene(width, height, 40);
    let buffer = ImageBuffer::gray(&data, width as u32, height as u32);
    let detector = ArucoDetector::aruco(DetectorParams::default()).unwrap();
    let mut adapter = MarkerDetectionAdapter::new(Box::new(detector), ValidationParams::default());
    let mut estimator = PoseEstimator::posit();
    let calibration = Arc::new(CalibrationProfile::nominal(640, 480).unwrap());

    group.bench_function("640x480", |b| {
        b.iter(|| {
            let detection = adapter.detect(black_box(&buffer)).unwrap();
            estimator.estimate(&detection, 0.05, &calibration).unwrap()
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_grayscale,
    bench_otsu,
    bench_adaptive_threshold,
    bench_find_contours,
    bench_warp,
    bench_color_conversion,
    bench_detector,
    bench_detect_and_estimate,
);
criterion_main!(benches);
