// src/cv/contours.rs
//
// Suzuki-Abe border following over a zero-padded label image.

use crate::{ImageBuffer, Point2i};

/// 8-neighbourhood offsets, counter-clockwise on screen starting east.
const NEIGHBORS: [(i32, i32); 8] = [
    (1, 0),
    (1, -1),
    (0, -1),
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

/// A traced border.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contour {
    /// Border pixels in tracing order.
    pub points: Vec<Point2i>,
    /// Whether this is the inner border of a hole.
    pub hole: bool,
}

/// Label image with a one pixel zero frame, reused across frames.
#[derive(Debug, Default)]
pub struct ContourTracer {
    labels: Vec<i32>,
    stride: usize,
    /// Flat offsets for the neighbourhood, repeated twice so a scan can run
    /// past index 7 without wrapping.
    deltas: [isize; 16],
}

impl ContourTracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Traces every outer border and hole border of the non-zero pixels of a
    /// single channel image.
    pub fn trace(&mut self, image: &ImageBuffer) -> Vec<Contour> {
        let width = image.width as usize;
        let height = image.height as usize;
        if width == 0 || height == 0 {
            return Vec::new();
        }
        self.load(image);

        let mut contours = Vec::new();
        let mut nbd = 1;
        for y in 0..height {
            let mut pos = (y + 1) * self.stride + 1;
            for x in 0..width {
                let pix = self.labels[pos];
                if pix != 0 {
                    let outer = pix == 1 && self.labels[pos - 1] == 0;
                    let hole = !outer && pix >= 1 && self.labels[pos + 1] == 0;
                    if outer || hole {
                        nbd += 1;
                        let start = Point2i::new(x as i32, y as i32);
                        contours.push(self.follow(pos, nbd, start, hole));
                    }
                }
                pos += 1;
            }
        }
        contours
    }

    fn load(&mut self, image: &ImageBuffer) {
        let width = image.width as usize;
        let height = image.height as usize;
        self.stride = width + 2;
        self.labels.clear();
        self.labels.resize(self.stride * (height + 2), 0);
        for (y, row) in image.data.chunks_exact(width).take(height).enumerate() {
            let base = (y + 1) * self.stride + 1;
            for (x, &v) in row.iter().enumerate() {
                self.labels[base + x] = i32::from(v != 0);
            }
        }
        let stride = self.stride as isize;
        for (i, &(dx, dy)) in NEIGHBORS.iter().enumerate() {
            let delta = dx as isize + dy as isize * stride;
            self.deltas[i] = delta;
            self.deltas[i + 8] = delta;
        }
    }

    fn offset(&self, pos: usize, dir: usize) -> usize {
        (pos as isize + self.deltas[dir]) as usize
    }

    /// Follows one border starting at `pos`, relabelling it with `nbd`.
    fn follow(&mut self, pos: usize, nbd: i32, mut point: Point2i, hole: bool) -> Contour {
        let mut points = Vec::new();

        // Look clockwise from the pixel we entered from for any neighbour.
        let entry = if hole { 0 } else { 4 };
        let mut dir = entry;
        let first = loop {
            dir = (dir + 7) & 7;
            let candidate = self.offset(pos, dir);
            if self.labels[candidate] != 0 {
                break Some(candidate);
            }
            if dir == entry {
                break None;
            }
        };

        let Some(first) = first else {
            self.labels[pos] = -nbd;
            points.push(point);
            return Contour { points, hole };
        };

        let mut current = pos;
        loop {
            let from = dir;
            // Counter-clockwise scan starting just after the previous pixel.
            let next = loop {
                dir = (dir + 1) & 15;
                let candidate = self.offset(current, dir);
                if self.labels[candidate] != 0 {
                    break candidate;
                }
            };
            dir &= 7;

            // The east neighbour was examined and is background exactly when
            // the scan wrapped past direction 0.
            if dir.wrapping_sub(1) < from {
                self.labels[current] = -nbd;
            } else if self.labels[current] == 1 {
                self.labels[current] = nbd;
            }

            points.push(point);
            point.x += NEIGHBORS[dir].0;
            point.y += NEIGHBORS[dir].1;

            if next == pos && current == first {
                break;
            }
            current = next;
            dir = (dir + 4) & 7;
        }

        Contour { points, hole }
    }
}

/// Convenience wrapper around a one-shot [`ContourTracer`].
pub fn find_contours(image: &ImageBuffer) -> Vec<Contour> {
    ContourTracer::new().trace(image)
}
