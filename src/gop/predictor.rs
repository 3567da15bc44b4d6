// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::encoder::CodingType;
use crate::gop::adaptive::AdaptiveGop;
use crate::gop::adaptive::GopFrameStats;
use crate::gop::adaptive::MAX_ADAPTIVE_GOP_SIZE;
use crate::gop::GopConfig;
use crate::gop::GopSize;
use crate::gop::GopStructure;
use crate::gop::RefPic;
use crate::gop::SliceType;
use crate::gop::MAX_GOP_SIZE;
use crate::Resolution;

/// Size the adaptive controller starts from.
const ADAPTIVE_INITIAL_GOP_SIZE: usize = 4;

/// How one picture of a mini-GOP is coded.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameDecision {
    pub coding_type: CodingType,
    pub slice_type: SliceType,
    pub gop_size: u32,
    /// Position in coding order within the mini-GOP.
    pub gop_pic_idx: u32,
    /// Position in display order within the mini-GOP, from 1 to `gop_size`.
    pub poc_offset: u32,
    pub temporal_id: u32,
    pub is_reference: bool,
    pub qp_offset: i32,
    pub qp_factor: f32,
    /// Share of the mini-GOP budget, averaging to 1 over the mini-GOP.
    pub bit_weight: f64,
    pub refs: Vec<RefPic>,
    pub use_long_term_ref: bool,
}

impl FrameDecision {
    /// Whether this is the last picture of its mini-GOP in coding order.
    pub fn is_last_in_gop(&self) -> bool {
        self.gop_pic_idx + 1 == self.gop_size
    }
}

/// Decisions for the pictures of one mini-GOP, in display order.
#[derive(Clone, Debug, PartialEq)]
pub struct MiniGop {
    decisions: Vec<FrameDecision>,
}

impl MiniGop {
    pub fn size(&self) -> usize {
        self.decisions.len()
    }

    /// Decisions in display order.
    pub fn decisions(&self) -> &[FrameDecision] {
        &self.decisions
    }

    pub fn into_decisions(self) -> Vec<FrameDecision> {
        self.decisions
    }

    /// Display order indices of the pictures, in coding order.
    pub fn coding_order(&self) -> Vec<usize> {
        let mut order = (0..self.decisions.len()).collect::<Vec<_>>();
        order.sort_by_key(|i| self.decisions[*i].gop_pic_idx);
        order
    }
}

/// Cuts the incoming pictures into mini-GOPs and decides how each of their pictures is coded.
///
/// The first picture and every `intra_period`-th picture after an intra picture are coded as
/// intra, as are pictures the caller forces to be keyframes. A mini-GOP is cut short so that an
/// intra picture is always its anchor.
pub struct MiniGopPredictor {
    size: GopSize,
    adaptive: Option<AdaptiveGop>,
    intra_period: u32,
    ltr_interval: u32,
    /// Pictures since the last intra picture.
    since_intra: u32,
    /// P pictures since the last intra picture.
    p_count: u32,
    num_decided: u64,
}

impl MiniGopPredictor {
    pub fn new(config: &GopConfig, resolution: Resolution) -> Self {
        let adaptive = match config.size {
            GopSize::Adaptive => Some(AdaptiveGop::new(
                config.thresholds.clone(),
                resolution,
                MAX_ADAPTIVE_GOP_SIZE,
                ADAPTIVE_INITIAL_GOP_SIZE,
            )),
            _ => None,
        };

        Self {
            size: config.size.clone(),
            adaptive,
            intra_period: config.intra_period,
            ltr_interval: config.ltr_interval,
            since_intra: 0,
            p_count: 0,
            num_decided: 0,
        }
    }

    /// Size the next mini-GOP is going to have, barring intra pictures and the end of the stream.
    pub fn target_size(&self) -> usize {
        match (&self.size, &self.adaptive) {
            (_, Some(adaptive)) => adaptive.current(),
            (GopSize::Custom(structure), _) => structure.size(),
            (GopSize::Fixed(size), _) => (*size).clamp(1, MAX_GOP_SIZE),
            (GopSize::Adaptive, None) => ADAPTIVE_INITIAL_GOP_SIZE,
        }
    }

    /// Number of pictures decided so far.
    pub fn num_decided(&self) -> u64 {
        self.num_decided
    }

    /// Makes the next picture an intra picture, as if the stream started over.
    pub fn restart(&mut self) {
        self.num_decided = 0;
        self.since_intra = 0;
        self.p_count = 0;
    }

    fn structure_for(&self, size: usize) -> GopStructure {
        if let GopSize::Custom(structure) = &self.size {
            if structure.size() == size {
                return structure.clone();
            }
        }

        GopStructure::builtin_at_most(size)
    }

    /// Decides the next mini-GOP from `available` buffered pictures. `keyframe_at` is the
    /// position among them of the first picture that must be coded as intra.
    ///
    /// Returns `None` when more pictures are needed, unless `flushing` is set, in which case the
    /// mini-GOP is shortened to what is available.
    pub fn decide(
        &mut self,
        available: usize,
        keyframe_at: Option<usize>,
        flushing: bool,
    ) -> Option<MiniGop> {
        if available == 0 {
            return None;
        }

        if self.num_decided == 0 || keyframe_at == Some(0) {
            let structure = self.structure_for(1).with_intra_anchor();
            return Some(self.build(&structure));
        }

        let mut size = self.target_size();
        let mut intra_anchor = false;

        if self.intra_period > 0 {
            let to_intra = self.intra_period.saturating_sub(self.since_intra).max(1) as usize;
            if to_intra <= size {
                size = to_intra;
                intra_anchor = true;
            }
        }
        if let Some(keyframe) = keyframe_at {
            if keyframe < size {
                size = keyframe + 1;
                intra_anchor = true;
            }
        }

        let mut structure = self.structure_for(size);
        if structure.size() != size {
            // The intra picture, if any, moves to the next mini-GOP.
            log::trace!("no structure for {} pictures, using {}", size, structure.size());
            size = structure.size();
            intra_anchor = false;
        }

        if available < size {
            if !flushing {
                return None;
            }
            structure = self.structure_for(available);
            intra_anchor = false;
        }
        if intra_anchor {
            structure = structure.with_intra_anchor();
        }

        Some(self.build(&structure))
    }

    fn build(&mut self, structure: &GopStructure) -> MiniGop {
        let size = structure.size();
        let weights = structure.bit_weights();

        let mut decisions = Vec::with_capacity(size);
        for (idx, pic) in structure.pics().iter().enumerate() {
            let use_long_term_ref = match pic.coding_type {
                CodingType::Intra => {
                    self.p_count = 0;
                    false
                }
                CodingType::Predicted => {
                    self.p_count += 1;
                    self.ltr_interval > 0 && self.p_count % self.ltr_interval == 0
                }
                CodingType::Bipredicted => false,
            };

            decisions.push(FrameDecision {
                coding_type: pic.coding_type,
                slice_type: structure.slice_type(idx),
                gop_size: size as u32,
                gop_pic_idx: idx as u32,
                poc_offset: pic.poc,
                temporal_id: pic.temporal_id,
                is_reference: structure.is_reference(idx),
                qp_offset: pic.qp_offset,
                qp_factor: pic.qp_factor,
                bit_weight: weights[idx],
                refs: pic.refs.clone(),
                use_long_term_ref,
            });
        }
        decisions.sort_by_key(|d| d.poc_offset);

        let anchor_intra = decisions
            .last()
            .is_some_and(|d| d.coding_type == CodingType::Intra);
        if anchor_intra {
            self.since_intra = 0;
        } else {
            self.since_intra += size as u32;
        }
        self.num_decided += size as u64;

        log::debug!(
            "mini-GOP of {} pictures{}",
            size,
            if anchor_intra { ", intra anchor" } else { "" }
        );

        MiniGop { decisions }
    }

    /// Feeds the statistics of a coded or analysed picture to the adaptive controller. The size of
    /// the next mini-GOP is decided once the last picture of a mini-GOP, in coding order, is in.
    /// Pictures that could not be analysed pass no statistics but still close their mini-GOP.
    pub fn accumulate(&mut self, stats: Option<&GopFrameStats>, decision: &FrameDecision) {
        let Some(adaptive) = self.adaptive.as_mut() else {
            return;
        };

        if let Some(stats) = stats {
            adaptive.accumulate(stats);
        }
        if decision.is_last_in_gop() {
            adaptive.decide_next_gop_size();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_predictor(size: GopSize, intra_period: u32) -> MiniGopPredictor {
        MiniGopPredictor::new(
            &GopConfig {
                size,
                intra_period,
                ..Default::default()
            },
            Resolution::from((1920, 1080)),
        )
    }

    fn types(gop: &MiniGop) -> Vec<CodingType> {
        gop.decisions().iter().map(|d| d.coding_type).collect()
    }

    #[test]
    fn first_picture_is_intra() {
        let mut predictor = new_predictor(GopSize::Fixed(4), 0);
        assert_eq!(predictor.decide(0, None, false), None);

        let gop = predictor.decide(8, None, false).unwrap();
        assert_eq!(types(&gop), vec![CodingType::Intra]);
        assert!(gop.decisions()[0].is_reference);

        let gop = predictor.decide(7, None, false).unwrap();
        assert_eq!(gop.size(), 4);
        assert_eq!(
            types(&gop),
            vec![
                CodingType::Bipredicted,
                CodingType::Bipredicted,
                CodingType::Bipredicted,
                CodingType::Predicted
            ]
        );
        // Anchor first, then the middle B, then the outer ones.
        assert_eq!(gop.coding_order(), vec![3, 1, 0, 2]);
        assert_eq!(predictor.num_decided(), 5);
    }

    #[test]
    fn waits_for_a_full_mini_gop_unless_flushing() {
        let mut predictor = new_predictor(GopSize::Fixed(4), 0);
        predictor.decide(1, None, false).unwrap();

        assert_eq!(predictor.decide(3, None, false), None);
        let gop = predictor.decide(3, None, true).unwrap();
        assert_eq!(gop.size(), 3);
        assert_eq!(gop.decisions()[2].coding_type, CodingType::Predicted);
    }

    #[test]
    fn intra_period_cuts_mini_gops() {
        let mut predictor = new_predictor(GopSize::Fixed(4), 6);
        let mut sizes = Vec::new();
        let mut intra = Vec::new();
        while predictor.num_decided() < 14 {
            let gop = predictor.decide(8, None, false).unwrap();
            sizes.push(gop.size());
            intra.push(gop.decisions().last().unwrap().coding_type == CodingType::Intra);
        }

        // Intra pictures at 0, 6 and 12.
        assert_eq!(sizes, vec![1, 4, 2, 4, 2, 4]);
        assert_eq!(intra, vec![true, false, true, false, true, false]);
    }

    #[test]
    fn forced_keyframe() {
        let mut predictor = new_predictor(GopSize::Fixed(4), 0);
        predictor.decide(8, None, false).unwrap();

        let gop = predictor.decide(8, Some(1), false).unwrap();
        assert_eq!(types(&gop), vec![CodingType::Bipredicted, CodingType::Intra]);

        let gop = predictor.decide(8, Some(0), false).unwrap();
        assert_eq!(types(&gop), vec![CodingType::Intra]);
    }

    #[test]
    fn unsupported_size_falls_back() {
        let mut predictor = new_predictor(GopSize::Fixed(5), 0);
        predictor.decide(8, None, false).unwrap();
        assert_eq!(predictor.decide(8, None, false).unwrap().size(), 4);

        // A forced keyframe at the fifth picture is left for the next mini-GOP.
        let mut predictor = new_predictor(GopSize::Fixed(8), 0);
        predictor.decide(8, None, false).unwrap();
        let gop = predictor.decide(8, Some(4), false).unwrap();
        assert_eq!(gop.size(), 4);
        assert!(!types(&gop).contains(&CodingType::Intra));
        let gop = predictor.decide(8, Some(0), false).unwrap();
        assert_eq!(types(&gop), vec![CodingType::Intra]);
    }

    #[test]
    fn custom_structure() {
        let structure = "Frame1: P 2 0 0.5 0 1 -2 1\nFrame2: B 1 3 0.5 1 2 -1 1 1 1"
            .parse::<GopStructure>()
            .unwrap();
        let mut predictor = new_predictor(GopSize::Custom(structure), 0);
        predictor.decide(4, None, false).unwrap();

        let gop = predictor.decide(4, None, false).unwrap();
        assert_eq!(gop.size(), 2);
        assert_eq!(gop.decisions()[0].qp_offset, 3);
        assert_eq!(gop.decisions()[0].slice_type, SliceType::B);

        // Flushing a single picture uses the built-in size 1.
        let gop = predictor.decide(1, None, true).unwrap();
        assert_eq!(types(&gop), vec![CodingType::Predicted]);
    }

    #[test]
    fn long_term_reference_refresh() {
        let mut predictor = MiniGopPredictor::new(
            &GopConfig {
                size: GopSize::Fixed(1),
                ltr_interval: 3,
                ..Default::default()
            },
            Resolution::from((640, 480)),
        );

        let ltr = (0..8)
            .map(|_| predictor.decide(1, None, false).unwrap().decisions()[0].use_long_term_ref)
            .collect::<Vec<_>>();
        assert_eq!(
            ltr,
            vec![false, false, false, true, false, false, true, false]
        );
    }

    #[test]
    fn adaptive_size_follows_statistics() {
        let mut predictor = new_predictor(GopSize::Adaptive, 0);
        let gop = predictor.decide(8, None, false).unwrap();
        assert_eq!(gop.size(), 1);
        assert_eq!(predictor.target_size(), 4);

        // Very intra heavy P pictures bring the size down to 1.
        let gop = predictor.decide(8, None, false).unwrap();
        assert_eq!(gop.size(), 4);
        for idx in gop.coding_order() {
            let decision = &gop.decisions()[idx];
            let stats = GopFrameStats {
                coding_type: decision.coding_type,
                intra_ratio: 0.6,
                skip_ratio: 0.0,
                cost: 1000.0,
            };
            predictor.accumulate(Some(&stats), decision);
        }
        assert_eq!(predictor.target_size(), 1);
        assert_eq!(predictor.decide(8, None, false).unwrap().size(), 1);
    }
}
