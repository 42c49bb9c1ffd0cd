// src/core/dictionary.rs

use crate::MarkerId;

/// Row codewords of the classic ArUco marker. Each inner row encodes two id
/// bits, read from positions 1 and 3 of the row.
const ARUCO_ROWS: [u8; 4] = [0b10000, 0b10111, 0b01001, 0b01110];

/// Side of the inner bit grid of a classic ArUco marker.
const ARUCO_BITS: usize = 5;

/// A match between a sampled bit grid and a dictionary entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DictionaryMatch {
    pub id: MarkerId,
    /// Number of differing bits.
    pub distance: u32,
}

/// Set of marker codes, stored as packed row-major bit grids.
#[derive(Debug, Clone)]
pub struct Dictionary {
    name: &'static str,
    /// Inner grid side plus the one-cell black border on each side.
    pub mark_size: usize,
    codes: Vec<u64>,
}

impl Dictionary {
    /// Builds a dictionary from packed codes of `bit_size * bit_size` bits,
    /// most significant bit first.
    pub fn new(name: &'static str, bit_size: usize, codes: Vec<u64>) -> Self {
        Self {
            name,
            mark_size: bit_size + 2,
            codes,
        }
    }

    /// The 1024 entry 5x5 ArUco dictionary.
    pub fn aruco() -> Self {
        let codes = (0..1024u64)
            .map(|id| {
                (0..ARUCO_BITS).fold(0u64, |code, row| {
                    let digit = (id >> (2 * (ARUCO_BITS - 1 - row))) & 0b11;
                    (code << ARUCO_BITS) | ARUCO_ROWS[digit as usize] as u64
                })
            })
            .collect();
        Self::new("ARUCO", ARUCO_BITS, codes)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Side of the inner bit grid.
    pub fn bit_size(&self) -> usize {
        self.mark_size - 2
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Row-major inner bit grid of `id`, one byte (0 or 1) per cell.
    pub fn bits(&self, id: MarkerId) -> Option<Vec<u8>> {
        let code = *self.codes.get(id as usize)?;
        let n = self.bit_size() * self.bit_size();
        Some((0..n).map(|i| ((code >> (n - 1 - i)) & 1) as u8).collect())
    }

    /// Closest entry to `bits` with at most `max_distance` differing bits.
    /// Ties go to the lower id.
    pub fn find(&self, bits: &[u8], max_distance: u32) -> Option<DictionaryMatch> {
        let n = self.bit_size() * self.bit_size();
        if bits.len() != n {
            return None;
        }
        let code = bits
            .iter()
            .fold(0u64, |acc, &b| (acc << 1) | u64::from(b != 0));

        let mut best: Option<DictionaryMatch> = None;
        for (id, &candidate) in self.codes.iter().enumerate() {
            let distance = (candidate ^ code).count_ones();
            if distance > max_distance {
                continue;
            }
            if best.map_or(true, |b| distance < b.distance) {
                best = Some(DictionaryMatch {
                    id: id as MarkerId,
                    distance,
                });
                if distance == 0 {
                    break;
                }
            }
        }
        best
    }
}

impl Default for Dictionary {
    fn default() -> Self {
        Self::aruco()
    }
}
