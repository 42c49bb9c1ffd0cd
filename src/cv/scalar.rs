// src/cv/scalar.rs

use crate::cv::{geometry, ComputerVision, Square};
use crate::{ImageBuffer, Point2f};

/// Luma weights used for every color to gray reduction in the crate.
pub(crate) fn luma(r: u8, g: u8, b: u8) -> u8 {
    let y = r as f32 * 0.299 + g as f32 * 0.587 + b as f32 * 0.114 + 0.5;
    y.min(255.0) as u8
}

/// Portable implementation of [`ComputerVision`].
pub struct ScalarCV;

impl ComputerVision for ScalarCV {
    fn grayscale(src: &ImageBuffer, dst: &mut [u8]) {
        let channels = src.channels.max(1) as usize;
        if channels == 1 {
            let n = dst.len().min(src.data.len());
            dst[..n].copy_from_slice(&src.data[..n]);
            return;
        }
        for (px, out) in src.data.chunks_exact(channels).zip(dst.iter_mut()) {
            *out = luma(px[0], px[1], px[2]);
        }
    }

    fn threshold(src: &[u8], dst: &mut [u8], threshold: u8) {
        let mut lut = [0u8; 256];
        for (value, slot) in lut.iter_mut().enumerate() {
            *slot = if value as u8 <= threshold { 0 } else { 255 };
        }
        for (out, &v) in dst.iter_mut().zip(src.iter()) {
            *out = lut[v as usize];
        }
    }

    fn otsu(src: &[u8]) -> u8 {
        let mut hist = [0u32; 256];
        for &v in src {
            hist[v as usize] += 1;
        }

        let total = src.len() as f64;
        let sum: f64 = hist
            .iter()
            .enumerate()
            .map(|(i, &h)| i as f64 * h as f64)
            .sum();

        let mut best = 0u8;
        let mut best_between = 0.0;
        let mut weight_bg = 0.0;
        let mut sum_bg = 0.0;
        for (level, &count) in hist.iter().enumerate() {
            weight_bg += count as f64;
            if weight_bg == 0.0 {
                continue;
            }
            let weight_fg = total - weight_bg;
            if weight_fg == 0.0 {
                break;
            }
            sum_bg += level as f64 * count as f64;
            let mean_diff = sum_bg / weight_bg - (sum - sum_bg) / weight_fg;
            let between = weight_bg * weight_fg * mean_diff * mean_diff;
            if between > best_between {
                best_between = between;
                best = level as u8;
            }
        }
        best
    }

    fn stack_box_blur(src: &ImageBuffer, dst: &mut [u8], kernel_size: usize) {
        let width = src.width as usize;
        let height = src.height as usize;
        if width == 0 || height == 0 {
            return;
        }
        let window = (2 * kernel_size + 1) as u32;
        let k = kernel_size as isize;

        // Horizontal sums first, then a vertical pass straight into dst.
        let mut horizontal = vec![0u32; width * height];
        for y in 0..height {
            let row = &src.data[y * width..(y + 1) * width];
            let at = |x: isize| row[x.clamp(0, width as isize - 1) as usize] as u32;
            let mut acc: u32 = (-k..=k).map(at).sum();
            for x in 0..width {
                horizontal[y * width + x] = acc;
                let xi = x as isize;
                acc = acc + at(xi + k + 1) - at(xi - k);
            }
        }

        let area = window * window;
        for x in 0..width {
            let at = |y: isize| horizontal[y.clamp(0, height as isize - 1) as usize * width + x];
            let mut acc: u32 = (-k..=k).map(at).sum();
            for y in 0..height {
                dst[y * width + x] = ((acc + area / 2) / area) as u8;
                let yi = y as isize;
                acc = acc + at(yi + k + 1) - at(yi - k);
            }
        }
    }

    fn adaptive_threshold(src: &ImageBuffer, dst: &mut [u8], kernel_size: usize, threshold: u8) {
        Self::stack_box_blur(src, dst, kernel_size);
        let threshold = threshold as i16;
        for (out, &v) in dst.iter_mut().zip(src.data.iter()) {
            let diff = v as i16 - *out as i16;
            *out = if diff <= -threshold { 255 } else { 0 };
        }
    }

    fn warp(src: &ImageBuffer, dst: &mut [u8], contour: &[Point2f; 4], warp_size: usize) {
        let width = src.width as usize;
        let height = src.height as usize;
        if width == 0 || height == 0 || warp_size < 2 {
            return;
        }
        let h = geometry::square_to_quad(contour);
        let scale = (warp_size - 1) as f64;
        let max_x = (width - 1) as f64;
        let max_y = (height - 1) as f64;

        for row in 0..warp_size {
            let v = row as f64 / scale;
            for col in 0..warp_size {
                let u = col as f64 / scale;
                let w = h[6] * u + h[7] * v + h[8];
                let x = ((h[0] * u + h[1] * v + h[2]) / w).clamp(0.0, max_x);
                let y = ((h[3] * u + h[4] * v + h[5]) / w).clamp(0.0, max_y);

                let x0 = x as usize;
                let y0 = y as usize;
                let x1 = (x0 + 1).min(width - 1);
                let y1 = (y0 + 1).min(height - 1);
                let fx = x - x0 as f64;
                let fy = y - y0 as f64;

                let p = |px: usize, py: usize| src.data[py * width + px] as f64;
                let top = p(x0, y0) * (1.0 - fx) + p(x1, y0) * fx;
                let bottom = p(x0, y1) * (1.0 - fx) + p(x1, y1) * fx;
                dst[row * warp_size + col] = (top * (1.0 - fy) + bottom * fy).round() as u8;
            }
        }
    }

    fn count_non_zero(src: &ImageBuffer, square: &Square) -> usize {
        let width = src.width as usize;
        let x0 = square.x as usize;
        let x1 = (x0 + square.width as usize).min(width);
        let y0 = square.y as usize;
        let y1 = (y0 + square.height as usize).min(src.height as usize);
        if x0 >= x1 || y0 >= y1 {
            return 0;
        }
        (y0..y1)
            .map(|y| {
                src.data[y * width + x0..y * width + x1]
                    .iter()
                    .filter(|&&v| v != 0)
                    .count()
            })
            .sum()
    }
}
