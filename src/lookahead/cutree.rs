// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! CU-tree: QP offsets from the propagation of the inter prediction costs.
//!
//! Walking the frames of the window in reverse coding order, every block hands the share of its
//! information that is predicted from its references (its own intra cost plus what it received,
//! scaled by how much cheaper inter prediction is) to the blocks it predicts from. A single pass
//! is enough as references always come earlier in coding order. Blocks that received a lot get a
//! lower QP: `-strength * log2((intra + propagated) / intra)`.

use std::cmp::Reverse;
use std::collections::HashMap;

use crate::lookahead::arena::FrameArena;
use crate::lookahead::arena::FrameRef;
use crate::lookahead::cost::BlockGrid;
use crate::lookahead::cost::BlockMode;
use crate::lookahead::cost::LowresFrame;
use crate::lookahead::cost::MotionVector;
use crate::lookahead::cost::LOWRES_BLOCK_SIZE;
use crate::lookahead::LookaheadError;
use crate::Resolution;

/// Largest per-CTB delta written to the QP-delta map.
pub const MAX_CTB_QP_DELTA: i8 = 15;

/// Full resolution pixels covered by one lowres block.
const LOWRES_BLOCK_SPAN: u32 = 2 * LOWRES_BLOCK_SIZE as u32;

/// Result of the CU-tree for one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct CuTreeOutput {
    pub frame: FrameRef,
    /// Average offset over the frame.
    pub qp_offset: f32,
    /// Per-CTB offsets relative to `qp_offset`.
    pub ctb_deltas: Vec<i8>,
}

pub struct CuTree {
    strength: f32,
    grid: BlockGrid,
    ctb_cols: usize,
    ctb_rows: usize,
    /// Lowres blocks along one side of a CTB.
    ctb_span: usize,
}

impl CuTree {
    pub fn new(strength: f32, resolution: Resolution, ctb_size: u32) -> Self {
        let (ctb_cols, ctb_rows) = resolution.blocks(ctb_size);
        Self {
            strength,
            grid: BlockGrid::for_resolution(resolution),
            ctb_cols: ctb_cols as usize,
            ctb_rows: ctb_rows as usize,
            ctb_span: (ctb_size / LOWRES_BLOCK_SPAN).max(1) as usize,
        }
    }

    pub fn num_ctbs(&self) -> usize {
        self.ctb_cols * self.ctb_rows
    }

    /// Checks that every frame of `window` is resident, and that its references are resident and
    /// coded before it.
    pub fn validate(&self, arena: &FrameArena, window: &[FrameRef]) -> Result<(), LookaheadError> {
        for r in window {
            let frame = arena.get(*r).ok_or(LookaheadError::MissingFrame)?;
            let info = frame.info();
            if frame.grid() != self.grid {
                return Err(LookaheadError::InvalidReference {
                    frame_num: info.frame_num,
                });
            }

            for reference in [frame.p0(), frame.p1()].into_iter().flatten() {
                let valid = arena.get(reference.frame).is_some_and(|parent| {
                    parent.info().coding_idx < info.coding_idx && parent.grid() == self.grid
                });
                if !valid {
                    return Err(LookaheadError::InvalidReference {
                        frame_num: info.frame_num,
                    });
                }
            }
        }

        Ok(())
    }

    /// Spreads `amount` over the up to four blocks covered by block `(bx, by)` moved by `mv`.
    fn distribute(&self, target: &mut [f32], bx: usize, by: usize, mv: MotionVector, amount: f32) {
        let size = LOWRES_BLOCK_SIZE as i32;
        let x = (bx as i32) * size + i32::from(mv.x);
        let y = (by as i32) * size + i32::from(mv.y);
        let (cx, fx) = (x.div_euclid(size), x.rem_euclid(size));
        let (cy, fy) = (y.div_euclid(size), y.rem_euclid(size));

        let area = (size * size) as f32;
        for (dx, dy, weight) in [
            (0, 0, (size - fx) * (size - fy)),
            (1, 0, fx * (size - fy)),
            (0, 1, (size - fx) * fy),
            (1, 1, fx * fy),
        ] {
            let (tx, ty) = (cx + dx, cy + dy);
            if weight == 0
                || tx < 0
                || ty < 0
                || tx as usize >= self.grid.cols
                || ty as usize >= self.grid.rows
            {
                continue;
            }
            target[ty as usize * self.grid.cols + tx as usize] += amount * weight as f32 / area;
        }
    }

    fn propagate_frame(&self, frame: &LowresFrame, received: &[f32]) -> Vec<(FrameRef, Vec<f32>)> {
        let (Some(p0), p1) = (frame.p0(), frame.p1()) else {
            return Vec::new();
        };

        let n = self.grid.len();
        let mut to_p0 = vec![0f32; n];
        let mut to_p1 = vec![0f32; n];
        // Bi-predicted blocks are split by distance, the closer reference taking more.
        let w0 = match p1 {
            Some(p1) => p1.distance as f32 / (p0.distance + p1.distance).max(1) as f32,
            None => 1.0,
        };

        for by in 0..self.grid.rows {
            for bx in 0..self.grid.cols {
                let b = by * self.grid.cols + bx;
                let intra = frame.intra_cost()[b].max(1) as f32;
                let inter = (frame.best_cost()[b] as f32).min(intra);
                let amount = (intra + received[b]) * (1.0 - inter / intra);
                if amount <= 0.0 {
                    continue;
                }

                let (mv0, mv1) = (frame.mvs(0)[b], frame.mvs(1)[b]);
                match frame.modes()[b] {
                    BlockMode::Intra => (),
                    BlockMode::List0 => self.distribute(&mut to_p0, bx, by, mv0, amount),
                    BlockMode::List1 => self.distribute(&mut to_p1, bx, by, mv1, amount),
                    BlockMode::Bi => {
                        self.distribute(&mut to_p0, bx, by, mv0, amount * w0);
                        self.distribute(&mut to_p1, bx, by, mv1, amount * (1.0 - w0));
                    }
                }
            }
        }

        let mut out = vec![(p0.frame, to_p0)];
        if let Some(p1) = p1 {
            out.push((p1.frame, to_p1));
        }
        out
    }

    /// Propagated cost of every block of the frames of `window` and of their references.
    pub fn propagate(
        &self,
        arena: &FrameArena,
        window: &[FrameRef],
    ) -> Result<HashMap<FrameRef, Vec<f32>>, LookaheadError> {
        self.validate(arena, window)?;

        let n = self.grid.len();
        let mut order = window
            .iter()
            .filter_map(|r| arena.get(*r).map(|f| (*r, f)))
            .collect::<Vec<_>>();
        order.sort_by_key(|(_, f)| Reverse(f.info().coding_idx));

        let mut propagated: HashMap<FrameRef, Vec<f32>> = HashMap::new();
        for (r, frame) in order {
            let received = propagated.entry(r).or_insert_with(|| vec![0.0; n]).clone();
            for (target, amounts) in self.propagate_frame(frame, &received) {
                let acc = propagated.entry(target).or_insert_with(|| vec![0.0; n]);
                for (a, v) in acc.iter_mut().zip(amounts) {
                    *a += v;
                }
            }
        }

        Ok(propagated)
    }

    /// Average of `offsets` over every CTB, relative to `frame_offset`.
    fn ctb_deltas(&self, offsets: &[f32], frame_offset: f32) -> Vec<i8> {
        let mut deltas = Vec::with_capacity(self.num_ctbs());
        for ctb_y in 0..self.ctb_rows {
            for ctb_x in 0..self.ctb_cols {
                let rows = ctb_y * self.ctb_span..((ctb_y + 1) * self.ctb_span).min(self.grid.rows);
                let cols = ctb_x * self.ctb_span..((ctb_x + 1) * self.ctb_span).min(self.grid.cols);

                let mut sum = 0f32;
                let mut count = 0usize;
                for by in rows {
                    for bx in cols.clone() {
                        sum += offsets[by * self.grid.cols + bx];
                        count += 1;
                    }
                }

                let delta = if count == 0 {
                    0.0
                } else {
                    sum / count as f32 - frame_offset
                };
                let limit = f32::from(MAX_CTB_QP_DELTA);
                deltas.push(delta.round().clamp(-limit, limit) as i8);
            }
        }
        deltas
    }

    /// Runs the propagation over `window` and computes the offsets of the `targets`.
    pub fn run(
        &self,
        arena: &FrameArena,
        window: &[FrameRef],
        targets: &[FrameRef],
    ) -> Result<Vec<CuTreeOutput>, LookaheadError> {
        let propagated = self.propagate(arena, window)?;

        let mut outputs = Vec::with_capacity(targets.len());
        for target in targets {
            let frame = arena.get(*target).ok_or(LookaheadError::MissingFrame)?;
            let received = propagated.get(target);

            let offsets = frame
                .intra_cost()
                .iter()
                .enumerate()
                .map(|(b, intra)| {
                    let intra = (*intra).max(1) as f32;
                    let received = received.map_or(0.0, |r| r[b]);
                    -self.strength * ((intra + received) / intra).log2()
                })
                .collect::<Vec<_>>();
            let qp_offset = if offsets.is_empty() {
                0.0
            } else {
                offsets.iter().sum::<f32>() / offsets.len() as f32
            };

            log::trace!(
                "CU-tree offset of frame {}: {:.2}",
                frame.info().frame_num,
                qp_offset
            );

            outputs.push(CuTreeOutput {
                frame: *target,
                qp_offset,
                ctb_deltas: self.ctb_deltas(&offsets, qp_offset),
            });
        }

        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::encoder::Picture;
    use crate::gop::SliceType;
    use crate::lookahead::cost::CostReference;
    use crate::lookahead::cost::FrameInfo;
    use crate::lookahead::cost::LowresPlane;

    const RESOLUTION: Resolution = Resolution {
        width: 64,
        height: 64,
    };

    fn texture(seed: u32) -> Arc<LowresPlane> {
        let luma = (0..RESOLUTION.get_area() as u32)
            .map(|i| ((i + seed * 100_000).wrapping_mul(2_654_435_761) >> 24) as u8)
            .collect::<Vec<_>>();
        Arc::new(LowresPlane::from_picture(&Picture::new(RESOLUTION, luma), RESOLUTION).unwrap())
    }

    fn insert(
        arena: &mut FrameArena,
        frame_num: u64,
        coding_idx: u64,
        slice_type: SliceType,
        plane: &Arc<LowresPlane>,
        refs: &[(FrameRef, u32)],
    ) -> FrameRef {
        let reference = |(frame, distance): (FrameRef, u32)| CostReference {
            frame,
            distance,
            plane: Arc::clone(arena.get(frame).unwrap().plane()),
        };
        let p0 = refs.first().copied().map(reference);
        let p1 = refs.get(1).copied().map(reference);
        let info = FrameInfo {
            frame_num,
            poc: frame_num,
            coding_idx,
            slice_type,
            gop_size: 2,
            temporal_id: 0,
        };
        let frame = LowresFrame::analyse(info, Arc::clone(plane), p0, p1, 2);
        arena.insert(frame).unwrap()
    }

    #[test]
    fn referenced_frames_get_lower_qp() {
        let mut arena = FrameArena::new(8);
        let (a, b) = (texture(1), texture(2));

        let i0 = insert(&mut arena, 0, 0, SliceType::I, &a, &[]);
        let p2 = insert(&mut arena, 2, 1, SliceType::P, &b, &[(i0, 2)]);
        // The B picture is a copy of the P picture: everything is predicted from it.
        let b1 = insert(&mut arena, 1, 2, SliceType::B, &b, &[(i0, 1), (p2, 1)]);

        let cutree = CuTree::new(2.0, RESOLUTION, 64);
        let outputs = cutree.run(&arena, &[i0, p2, b1], &[p2, b1]).unwrap();

        assert_eq!(outputs[0].frame, p2);
        assert_eq!(outputs[0].qp_offset, -2.0);
        assert_eq!(outputs[0].ctb_deltas, vec![0]);
        assert_eq!(outputs[1].qp_offset, 0.0);
    }

    #[test]
    fn missing_reference_is_rejected() {
        let mut arena = FrameArena::new(8);
        let plane = texture(1);
        let i0 = insert(&mut arena, 0, 0, SliceType::I, &plane, &[]);
        let p1 = insert(&mut arena, 1, 1, SliceType::P, &plane, &[(i0, 1)]);

        let cutree = CuTree::new(2.0, RESOLUTION, 64);
        assert!(cutree.run(&arena, &[i0, p1], &[p1]).is_ok());

        arena.remove(i0);
        assert_eq!(
            cutree.run(&arena, &[p1], &[p1]),
            Err(LookaheadError::InvalidReference { frame_num: 1 })
        );
        assert_eq!(
            cutree.run(&arena, &[i0, p1], &[p1]),
            Err(LookaheadError::MissingFrame)
        );
    }

    #[test]
    fn ctb_averages() {
        // 8x2 lowres blocks, two CTBs of 4x2 blocks.
        let cutree = CuTree::new(2.0, Resolution::from((128, 32)), 64);
        assert_eq!(cutree.num_ctbs(), 2);

        let mut offsets = vec![-1.0f32; 16];
        for row in offsets.chunks_mut(8) {
            row[4..].fill(-5.0);
        }
        assert_eq!(cutree.ctb_deltas(&offsets, -3.0), vec![2, -2]);
        assert_eq!(cutree.ctb_deltas(&[-40.0; 16], 0.0), vec![-15, -15]);
    }

    #[test]
    fn motion_spreads_over_four_blocks() {
        let cutree = CuTree::new(2.0, Resolution::from((64, 64)), 64);
        let mut target = vec![0f32; 16];
        cutree.distribute(&mut target, 1, 1, MotionVector { x: 4, y: 4 }, 64.0);

        assert_eq!(target[5], 16.0);
        assert_eq!(target[6], 16.0);
        assert_eq!(target[9], 16.0);
        assert_eq!(target[10], 16.0);
        assert_eq!(target.iter().sum::<f32>(), 64.0);
    }
}
