//! 8x8 mean perceptual hash and the recent-hash ring.

use image::imageops::{self, FilterType};
use image::GrayImage;
use std::collections::VecDeque;

pub const DEFAULT_RING_SIZE: usize = 50;
pub const DEFAULT_HAMMING_THRESHOLD: u32 = 5;

/// 64-bit mean hash. Bit `i` (row-major over the 8x8 thumbnail) is set when that
/// cell is brighter than the thumbnail mean.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PerceptualHash(pub u64);

impl PerceptualHash {
    pub fn of_gray(gray: &GrayImage) -> Self {
        let thumb = imageops::resize(gray, 8, 8, FilterType::Triangle);
        let cells = thumb.as_raw();
        let mean = cells.iter().map(|&v| v as u32).sum::<u32>() / cells.len().max(1) as u32;
        let mut bits = 0u64;
        for (i, &v) in cells.iter().enumerate() {
            if v as u32 > mean {
                bits |= 1u64 << i;
            }
        }
        PerceptualHash(bits)
    }

    pub fn hamming(self, other: PerceptualHash) -> u32 {
        (self.0 ^ other.0).count_ones()
    }
}

impl std::fmt::Display for PerceptualHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Bounded FIFO of recently accepted hashes.
pub struct RecentHashes {
    capacity: usize,
    threshold: u32,
    ring: VecDeque<PerceptualHash>,
}

impl RecentHashes {
    pub fn new(capacity: usize, threshold: u32) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            threshold,
            ring: VecDeque::with_capacity(capacity),
        }
    }

    /// Closest match within the threshold, if any.
    pub fn find_near(&self, hash: PerceptualHash) -> Option<u32> {
        self.ring
            .iter()
            .map(|h| h.hamming(hash))
            .filter(|&d| d <= self.threshold)
            .min()
    }

    /// Returns `true` if `hash` duplicates a recent entry. Non-duplicates are
    /// remembered, evicting the oldest entry when full.
    pub fn check_and_insert(&mut self, hash: PerceptualHash) -> bool {
        if self.find_near(hash).is_some() {
            return true;
        }
        if self.ring.len() >= self.capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(hash);
        false
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn clear(&mut self) {
        self.ring.clear();
    }
}

impl Default for RecentHashes {
    fn default() -> Self {
        Self::new(DEFAULT_RING_SIZE, DEFAULT_HAMMING_THRESHOLD)
    }
}
