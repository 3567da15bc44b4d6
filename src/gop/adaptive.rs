// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Adaptive mini-GOP size.
//!
//! Statistics of every picture of a mini-GOP are accumulated, and at its end the size of the next
//! mini-GOP is derived from the intra and skip ratios of the P and B pictures and from how much
//! more a P picture costs than a B picture. The decision moves by one step of
//! [`ADAPTIVE_GOP_SIZES`] at a time, except for the shortcuts of the decision table.

use crate::encoder::CodingType;
use crate::Resolution;

/// Largest size the controller may choose.
pub const MAX_ADAPTIVE_GOP_SIZE: usize = 8;

/// Sizes the controller steps through. 5 and 7 have no hierarchical structure.
pub const ADAPTIVE_GOP_SIZES: [usize; 6] = [1, 2, 3, 4, 6, 8];

/// Size used when the resolution is too small for the adaptation to pay off.
const LOW_RESOLUTION_GOP_SIZE: usize = 3;

const HD_AREA: usize = 1280 * 720;
const WQVGA_AREA: usize = 416 * 240;

/// Thresholds of the decision table.
#[derive(Clone, Debug, PartialEq)]
pub struct AdaptiveGopThresholds {
    /// A P/B cost ratio below this, with a skip ratio of at least `static_skip_ratio`, is a
    /// near-static scene: size 1.
    pub static_cost_ratio: f64,
    pub static_skip_ratio: f64,
    /// A P/B cost ratio above this keeps the previous size.
    pub keep_cost_ratio: f64,
    /// P intra ratio band in which a low B intra ratio grows the mini-GOP.
    pub grow_p_intra_min: f64,
    pub grow_p_intra_max: f64,
    pub grow_b_intra_max: f64,
    /// P intra ratio from which no B picture is used.
    pub no_b_intra: f64,
    /// P intra ratio from which one B picture is used.
    pub one_b_intra: f64,
    /// P intra ratio from which the mini-GOP shrinks by one step.
    pub shrink_intra: f64,
    /// Shrinking stops at this size.
    pub shrink_floor: usize,
}

impl Default for AdaptiveGopThresholds {
    fn default() -> Self {
        Self {
            static_cost_ratio: 1.1,
            static_skip_ratio: 0.95,
            keep_cost_ratio: 5.0,
            grow_p_intra_min: 0.40,
            grow_p_intra_max: 0.70,
            grow_b_intra_max: 0.10,
            no_b_intra: 0.30,
            one_b_intra: 0.20,
            shrink_intra: 0.10,
            shrink_floor: 3,
        }
    }
}

/// Statistics of one coded or analysed picture.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct GopFrameStats {
    pub coding_type: CodingType,
    /// Share of the 8x8 blocks coded as intra.
    pub intra_ratio: f64,
    /// Share of the 8x8 blocks coded as skip.
    pub skip_ratio: f64,
    /// Cost of the picture, bits or an estimate of them.
    pub cost: f64,
}

#[derive(Clone, Debug, Default)]
struct Sums {
    intra_p: f64,
    intra_b: f64,
    skip: f64,
    cost_p: f64,
    cost_b: f64,
    p_frames: u32,
    b_frames: u32,
}

#[derive(Clone, Debug)]
pub struct AdaptiveGop {
    thresholds: AdaptiveGopThresholds,
    enabled: bool,
    max_size: usize,
    current: usize,
    sums: Sums,
}

fn step_index(size: usize) -> usize {
    ADAPTIVE_GOP_SIZES
        .iter()
        .rposition(|s| *s <= size)
        .unwrap_or_default()
}

impl AdaptiveGop {
    /// Creates a controller for pictures of `resolution` with mini-GOPs of at most `max_size`
    /// pictures, starting at `initial_size`.
    pub fn new(
        thresholds: AdaptiveGopThresholds,
        resolution: Resolution,
        max_size: usize,
        initial_size: usize,
    ) -> Self {
        let max_size = max_size.clamp(1, MAX_ADAPTIVE_GOP_SIZE);
        let area = resolution.get_area();
        let enabled = area >= HD_AREA || (max_size > 3 && area >= WQVGA_AREA);

        let current = if enabled {
            ADAPTIVE_GOP_SIZES[step_index(initial_size.min(max_size))]
        } else {
            LOW_RESOLUTION_GOP_SIZE.min(max_size)
        };

        log::debug!(
            "adaptive GOP {} for {:?}, starting at {}",
            if enabled { "enabled" } else { "disabled" },
            resolution,
            current
        );

        Self {
            thresholds,
            enabled,
            max_size,
            current,
            sums: Default::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Size of the mini-GOP being coded.
    pub fn current(&self) -> usize {
        self.current
    }

    /// Adds the statistics of one picture of the current mini-GOP. Intra pictures are ignored.
    pub fn accumulate(&mut self, stats: &GopFrameStats) {
        let sums = &mut self.sums;
        match stats.coding_type {
            CodingType::Intra => return,
            CodingType::Predicted => {
                sums.intra_p += stats.intra_ratio;
                sums.cost_p += stats.cost;
                sums.p_frames += 1;
            }
            CodingType::Bipredicted => {
                sums.intra_b += stats.intra_ratio;
                sums.cost_b += stats.cost;
                sums.b_frames += 1;
            }
        }
        sums.skip += stats.skip_ratio;
    }

    fn step_up(&self, size: usize) -> usize {
        let next = ADAPTIVE_GOP_SIZES[(step_index(size) + 1).min(ADAPTIVE_GOP_SIZES.len() - 1)];
        next.min(self.max_size)
    }

    fn step_down(&self, size: usize) -> usize {
        ADAPTIVE_GOP_SIZES[step_index(size).saturating_sub(1)]
    }

    /// Decides the size of the next mini-GOP from the statistics accumulated since the last call.
    pub fn decide_next_gop_size(&mut self) -> usize {
        let sums = std::mem::take(&mut self.sums);
        if !self.enabled || sums.p_frames == 0 {
            return self.current;
        }

        let t = &self.thresholds;
        let p_frames = f64::from(sums.p_frames);
        let cost_p = sums.cost_p / p_frames;
        let intra_p = sums.intra_p / p_frames;
        let skip = sums.skip / f64::from(sums.p_frames + sums.b_frames);

        // Without B pictures the ratio is taken against an infinite B cost.
        let (cost_b, intra_b) = if sums.b_frames > 0 {
            let b_frames = f64::from(sums.b_frames);
            (sums.cost_b / b_frames, sums.intra_b / b_frames)
        } else {
            (f64::MAX, f64::MAX)
        };
        let cost_ratio = match (cost_p, cost_b) {
            (p, b) if b > 0.0 => p / b,
            (p, _) if p > 0.0 => f64::INFINITY,
            _ => 1.0,
        };

        let next = if cost_ratio < t.static_cost_ratio && skip >= t.static_skip_ratio {
            1
        } else if cost_ratio > t.keep_cost_ratio {
            self.current
        } else if intra_p > t.grow_p_intra_min
            && intra_p < t.grow_p_intra_max
            && intra_b < t.grow_b_intra_max
        {
            self.step_up(self.current)
        } else if intra_p >= t.no_b_intra {
            1
        } else if intra_p >= t.one_b_intra {
            2
        } else if intra_p >= t.shrink_intra {
            if self.current > t.shrink_floor {
                self.step_down(self.current).max(t.shrink_floor)
            } else {
                self.current
            }
        } else {
            self.step_up(self.current)
        };
        let next = next.min(self.max_size);

        log::debug!(
            "next mini-GOP size {} (was {}): cost ratio {:.2}, P intra {:.2}, B intra {:.2}, skip {:.2}",
            next,
            self.current,
            cost_ratio,
            intra_p,
            intra_b,
            skip
        );

        self.current = next;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hd() -> Resolution {
        Resolution::from((1920, 1080))
    }

    fn feed(gop: &mut AdaptiveGop, p: (f64, f64, f64), b: Option<(f64, f64, f64)>) -> usize {
        let size = gop.current();
        gop.accumulate(&GopFrameStats {
            coding_type: CodingType::Predicted,
            intra_ratio: p.0,
            skip_ratio: p.1,
            cost: p.2,
        });
        if let Some(b) = b {
            for _ in 1..size {
                gop.accumulate(&GopFrameStats {
                    coding_type: CodingType::Bipredicted,
                    intra_ratio: b.0,
                    skip_ratio: b.1,
                    cost: b.2,
                });
            }
        }
        gop.decide_next_gop_size()
    }

    fn steps(a: usize, b: usize) -> usize {
        step_index(a).abs_diff(step_index(b))
    }

    #[test]
    fn low_resolution_uses_fixed_size() {
        let mut gop = AdaptiveGop::new(Default::default(), Resolution::from((320, 240)), 8, 4);
        assert!(!gop.is_enabled());
        assert_eq!(gop.current(), 3);
        assert_eq!(feed(&mut gop, (0.5, 0.0, 100.0), Some((0.0, 0.0, 10.0))), 3);

        // A larger maximum lowers the resolution threshold.
        let gop = AdaptiveGop::new(Default::default(), Resolution::from((416, 240)), 8, 4);
        assert!(gop.is_enabled());
        let gop = AdaptiveGop::new(Default::default(), Resolution::from((416, 240)), 3, 3);
        assert!(!gop.is_enabled());
    }

    #[test]
    fn decision_table() {
        let mut gop = AdaptiveGop::new(Default::default(), hd(), 8, 4);

        // Near-static.
        assert_eq!(feed(&mut gop, (0.0, 0.99, 10.0), Some((0.0, 0.99, 10.0))), 1);

        // Low intra ratio grows the mini-GOP one step at a time, skipping 5 and 7.
        let mut sizes = Vec::new();
        for _ in 0..6 {
            sizes.push(feed(&mut gop, (0.05, 0.3, 300.0), Some((0.01, 0.5, 100.0))));
        }
        assert_eq!(sizes, vec![2, 3, 4, 6, 8, 8]);

        // Extreme cost ratio keeps the size.
        assert_eq!(feed(&mut gop, (0.35, 0.1, 1000.0), Some((0.0, 0.5, 100.0))), 8);

        // Intra bands.
        assert_eq!(feed(&mut gop, (0.15, 0.1, 200.0), Some((0.05, 0.3, 100.0))), 6);
        assert_eq!(feed(&mut gop, (0.15, 0.1, 200.0), Some((0.05, 0.3, 100.0))), 4);
        assert_eq!(feed(&mut gop, (0.15, 0.1, 200.0), Some((0.05, 0.3, 100.0))), 3);
        assert_eq!(feed(&mut gop, (0.15, 0.1, 200.0), Some((0.05, 0.3, 100.0))), 3);
        assert_eq!(feed(&mut gop, (0.25, 0.1, 200.0), Some((0.05, 0.3, 100.0))), 2);
        assert_eq!(feed(&mut gop, (0.35, 0.1, 200.0), Some((0.15, 0.3, 100.0))), 1);

        // Without B pictures an intra heavy P keeps the mini-GOP at 1.
        assert_eq!(feed(&mut gop, (0.5, 0.1, 200.0), None), 1);
        assert_eq!(feed(&mut gop, (0.05, 0.1, 200.0), None), 2);
        // Intra heavy P with clean B pictures grows.
        assert_eq!(feed(&mut gop, (0.5, 0.1, 200.0), Some((0.05, 0.3, 100.0))), 3);
    }

    #[test]
    fn maximum_size_is_respected() {
        let mut gop = AdaptiveGop::new(Default::default(), hd(), 4, 4);
        for _ in 0..4 {
            let size = feed(&mut gop, (0.05, 0.3, 300.0), Some((0.01, 0.5, 100.0)));
            assert!(size <= 4);
        }
        assert_eq!(gop.current(), 4);
    }

    #[test]
    fn hysteresis() {
        let stats = [
            ((0.05, 0.3, 300.0), (0.01, 0.5, 100.0)),
            ((0.15, 0.2, 250.0), (0.05, 0.4, 100.0)),
            ((0.25, 0.1, 250.0), (0.08, 0.2, 100.0)),
            ((0.45, 0.1, 250.0), (0.02, 0.2, 100.0)),
            ((0.45, 0.1, 250.0), (0.20, 0.2, 100.0)),
            ((0.80, 0.0, 400.0), (0.50, 0.0, 200.0)),
        ];

        for (p, b) in stats {
            for initial in ADAPTIVE_GOP_SIZES {
                let mut gop = AdaptiveGop::new(Default::default(), hd(), 8, initial);
                let first = feed(&mut gop, p, Some(b));
                // Near-identical statistics for the next mini-GOP.
                let second = feed(&mut gop, (p.0 * 1.01, p.1, p.2), Some(b));
                assert!(
                    steps(first, second) <= 1,
                    "{:?}/{:?} from {}: {} then {}",
                    p,
                    b,
                    initial,
                    first,
                    second
                );
            }
        }
    }
}
