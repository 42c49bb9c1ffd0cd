// src/cv/geometry.rs

use crate::{Point2f, Point2i};

fn dist_sq(a: Point2i, b: Point2i) -> i64 {
    let dx = (a.x - b.x) as i64;
    let dy = (a.y - b.y) as i64;
    dx * dx + dy * dy
}

fn farthest_from(contour: &[Point2i], origin: Point2i) -> (usize, i64) {
    contour
        .iter()
        .enumerate()
        .map(|(i, &p)| (i, dist_sq(p, origin)))
        .fold((0, -1), |best, cur| if cur.1 > best.1 { cur } else { best })
}

/// Douglas-Peucker simplification of a closed contour.
///
/// The curve is cut at two mutually distant points and each half is
/// simplified independently, so the result keeps the contour's winding.
///
/// # Arguments
/// * `contour` - The closed boundary, in tracing order.
/// * `epsilon` - Maximum allowed distance between the curve and its
///   approximation, in pixels.
pub fn approx_poly_dp(contour: &[Point2i], epsilon: f64) -> Vec<Point2i> {
    let n = contour.len();
    if n == 0 {
        return Vec::new();
    }
    let (a, _) = farthest_from(contour, contour[0]);
    let (b, d) = farthest_from(contour, contour[a]);
    if (d as f64) <= epsilon * epsilon {
        return vec![contour[a]];
    }

    let mut poly = Vec::new();
    simplify_chain(contour, a, b, epsilon, &mut poly);
    simplify_chain(contour, b, a, epsilon, &mut poly);
    poly
}

/// Emits the kept vertices of the open chain `from..to` (wrapping), `from`
/// included and `to` excluded.
fn simplify_chain(
    contour: &[Point2i],
    from: usize,
    to: usize,
    epsilon: f64,
    out: &mut Vec<Point2i>,
) {
    let n = contour.len();
    let span = (to + n - from) % n;
    let at = |offset: usize| contour[(from + offset) % n];

    // (start, end) offsets, processed depth first so output stays ordered.
    let mut stack = vec![(0usize, span)];
    while let Some((start, end)) = stack.pop() {
        let p0 = at(start);
        let p1 = at(end);
        let dx = (p1.x - p0.x) as f64;
        let dy = (p1.y - p0.y) as f64;
        let seg_len_sq = dx * dx + dy * dy;

        let mut split = None;
        let mut max_dist_sq = epsilon * epsilon;
        for k in (start + 1)..end {
            let p = at(k);
            let px = (p.x - p0.x) as f64;
            let py = (p.y - p0.y) as f64;
            let d_sq = if seg_len_sq == 0.0 {
                px * px + py * py
            } else {
                let cross = px * dy - py * dx;
                cross * cross / seg_len_sq
            };
            if d_sq > max_dist_sq {
                max_dist_sq = d_sq;
                split = Some(k);
            }
        }

        match split {
            Some(k) => {
                stack.push((k, end));
                stack.push((start, k));
            }
            None => out.push(p0),
        }
    }
}

/// Length of the closed polygon with sub-pixel vertices.
pub fn perimeter_f(poly: &[Point2f]) -> f32 {
    let n = poly.len();
    (0..n).map(|i| (poly[(i + 1) % n] - poly[i]).norm()).sum()
}

/// Shortest edge of the closed polygon.
pub fn min_edge_length(poly: &[Point2i]) -> f64 {
    let n = poly.len();
    if n <= 1 {
        return 0.0;
    }
    (0..n)
        .map(|i| dist_sq(poly[i], poly[(i + 1) % n]))
        .min()
        .map_or(0.0, |d| (d as f64).sqrt())
}

/// True when every turn of the closed polygon has the same direction.
/// Collinear turns are ignored.
pub fn is_contour_convex(contour: &[Point2i]) -> bool {
    let n = contour.len();
    if n < 3 {
        return false;
    }
    let mut sign = 0i64;
    for i in 0..n {
        let a = contour[i];
        let b = contour[(i + 1) % n];
        let c = contour[(i + 2) % n];
        let cross =
            (b.x - a.x) as i64 * (c.y - b.y) as i64 - (b.y - a.y) as i64 * (c.x - b.x) as i64;
        if cross == 0 {
            continue;
        }
        if sign == 0 {
            sign = cross.signum();
        } else if cross.signum() != sign {
            return false;
        }
    }
    sign != 0
}

/// Signed shoelace area; positive for clockwise quads in image coordinates
/// (y pointing down).
pub fn signed_area(quad: &[Point2f; 4]) -> f32 {
    let mut twice = 0.0;
    for i in 0..4 {
        let p = quad[i];
        let q = quad[(i + 1) % 4];
        twice += p.x * q.y - q.x * p.y;
    }
    twice / 2.0
}

/// Smallest distance between any two of the four corners.
pub fn min_corner_separation(quad: &[Point2f; 4]) -> f32 {
    let mut min = f32::INFINITY;
    for i in 0..4 {
        for j in (i + 1)..4 {
            min = min.min((quad[i] - quad[j]).norm());
        }
    }
    min
}

/// Projective map from the unit square onto `quad`, row-major 3x3.
///
/// `(0,0)`, `(1,0)`, `(1,1)` and `(0,1)` land on `quad[0]..quad[3]`; a point
/// `(u, v)` maps to `((h0 u + h1 v + h2) / w, (h3 u + h4 v + h5) / w)` with
/// `w = h6 u + h7 v + h8`.
pub fn square_to_quad(quad: &[Point2f; 4]) -> [f64; 9] {
    let [x0, x1, x2, x3] = quad.map(|p| p.x as f64);
    let [y0, y1, y2, y3] = quad.map(|p| p.y as f64);
    let px = x0 - x1 + x2 - x3;
    let py = y0 - y1 + y2 - y3;

    if px == 0.0 && py == 0.0 {
        return [x1 - x0, x2 - x1, x0, y1 - y0, y2 - y1, y0, 0.0, 0.0, 1.0];
    }

    let dx1 = x1 - x2;
    let dx2 = x3 - x2;
    let dy1 = y1 - y2;
    let dy2 = y3 - y2;
    let den = dx1 * dy2 - dx2 * dy1;
    let g = (px * dy2 - dx2 * py) / den;
    let h = (dx1 * py - px * dy1) / den;
    [
        x1 - x0 + g * x1,
        x3 - x0 + h * x3,
        x0,
        y1 - y0 + g * y1,
        y3 - y0 + h * y3,
        y0,
        g,
        h,
        1.0,
    ]
}
