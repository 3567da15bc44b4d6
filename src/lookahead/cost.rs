// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Cost model of the look-ahead.
//!
//! Pictures are analysed at half resolution in blocks of [`LOWRES_BLOCK_SIZE`] pixels, each
//! covering a 16x16 area of the full resolution picture. For every block the cheapest of three
//! intra predictions (DC, horizontal, vertical) is compared to a full-pel motion search against
//! the references of the picture, and the sum of absolute differences of the best mode is the
//! block cost.

use std::collections::HashMap;
use std::sync::Arc;

use crate::encoder::Picture;
use crate::gop::FrameDecision;
use crate::gop::SliceType;
use crate::lookahead::arena::FrameRef;
use crate::lookahead::LookaheadError;
use crate::Resolution;

/// Size of a block of the lowres picture.
pub const LOWRES_BLOCK_SIZE: usize = 8;

/// Blocks predicted with a SAD below this are counted as skipped.
pub const SKIP_SAD_THRESHOLD: u32 = 64;

/// Cost of one pixel of motion vector length.
const MV_COST: u32 = 2;

/// Luma of a picture downscaled by two in both directions.
#[derive(Clone, Debug)]
pub struct LowresPlane {
    width: usize,
    height: usize,
    data: Vec<u8>,
}

impl LowresPlane {
    /// Downscales `picture`, which must be a complete picture of `resolution`.
    pub fn from_picture(picture: &Picture, resolution: Resolution) -> Result<Self, LookaheadError> {
        if picture.resolution() != resolution || !picture.is_complete() {
            return Err(LookaheadError::InvalidPicture {
                expected: resolution,
                actual: picture.resolution(),
            });
        }

        let (full_width, full_height) = (resolution.width as usize, resolution.height as usize);
        let width = full_width.div_ceil(2);
        let height = full_height.div_ceil(2);
        let luma = picture.luma();
        let stride = picture.stride();

        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            let y0 = 2 * y;
            let y1 = (y0 + 1).min(full_height - 1);
            for x in 0..width {
                let x0 = 2 * x;
                let x1 = (x0 + 1).min(full_width - 1);
                let sum = u32::from(luma[y0 * stride + x0])
                    + u32::from(luma[y0 * stride + x1])
                    + u32::from(luma[y1 * stride + x0])
                    + u32::from(luma[y1 * stride + x1]);
                data.push(((sum + 2) / 4) as u8);
            }
        }

        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn grid(&self) -> BlockGrid {
        BlockGrid::for_lowres(self.width, self.height)
    }

    /// Pixel at `(x, y)`, with the edges of the plane repeated outside of it.
    fn at(&self, x: i32, y: i32) -> u8 {
        let x = x.clamp(0, self.width as i32 - 1) as usize;
        let y = y.clamp(0, self.height as i32 - 1) as usize;
        self.data[y * self.width + x]
    }
}

/// Block layout of a lowres plane.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockGrid {
    pub cols: usize,
    pub rows: usize,
}

impl BlockGrid {
    fn for_lowres(width: usize, height: usize) -> Self {
        Self {
            cols: width.div_ceil(LOWRES_BLOCK_SIZE),
            rows: height.div_ceil(LOWRES_BLOCK_SIZE),
        }
    }

    /// Grid of the lowres plane of a picture of `resolution`.
    pub fn for_resolution(resolution: Resolution) -> Self {
        Self::for_lowres(
            (resolution.width as usize).div_ceil(2),
            (resolution.height as usize).div_ceil(2),
        )
    }

    pub fn len(&self) -> usize {
        self.cols * self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Full-pel motion vector in lowres pixels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MotionVector {
    pub x: i16,
    pub y: i16,
}

impl MotionVector {
    pub const ZERO: Self = Self { x: 0, y: 0 };

    fn cost(self) -> u32 {
        MV_COST * (u32::from(self.x.unsigned_abs()) + u32::from(self.y.unsigned_abs()))
    }
}

/// Prediction chosen for a block.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BlockMode {
    #[default]
    Intra,
    List0,
    List1,
    Bi,
}

/// A reference used by the analysis of a frame.
#[derive(Clone, Debug)]
pub struct CostReference {
    pub frame: FrameRef,
    /// Distance in pictures.
    pub distance: u32,
    pub plane: Arc<LowresPlane>,
}

/// Position of a frame in the stream and how it is going to be coded.
#[derive(Clone, Debug)]
pub struct FrameInfo {
    pub frame_num: u64,
    pub poc: u64,
    pub coding_idx: u64,
    pub slice_type: SliceType,
    pub gop_size: u32,
    pub temporal_id: u32,
}

impl FrameInfo {
    pub fn new(frame_num: u64, coding_idx: u64, decision: &FrameDecision) -> Self {
        Self {
            frame_num,
            poc: frame_num,
            coding_idx,
            slice_type: decision.slice_type,
            gop_size: decision.gop_size,
            temporal_id: decision.temporal_id,
        }
    }
}

/// Cost summary of an analysed frame.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct FrameCosts {
    /// Sum of the intra costs of all blocks.
    pub intra: u64,
    /// Sum of the costs of the chosen modes.
    pub best: u64,
    pub intra_blocks: u32,
    pub skip_blocks: u32,
    pub num_blocks: u32,
}

impl FrameCosts {
    pub fn intra_ratio(&self) -> f64 {
        if self.num_blocks == 0 {
            return 0.0;
        }
        f64::from(self.intra_blocks) / f64::from(self.num_blocks)
    }

    pub fn skip_ratio(&self) -> f64 {
        if self.num_blocks == 0 {
            return 0.0;
        }
        f64::from(self.skip_blocks) / f64::from(self.num_blocks)
    }
}

/// An analysed lowres frame, as stored in the arena.
#[derive(Debug)]
pub struct LowresFrame {
    info: FrameInfo,
    plane: Arc<LowresPlane>,
    grid: BlockGrid,
    intra_cost: Vec<u32>,
    /// Inter costs per pair of reference distances, 0 standing for an unused list.
    inter_cost: HashMap<(u32, u32), Vec<u32>>,
    best_cost: Vec<u32>,
    mvs: [Vec<MotionVector>; 2],
    modes: Vec<BlockMode>,
    p0: Option<CostReference>,
    p1: Option<CostReference>,
    costs: FrameCosts,
}

fn block_sad<F>(plane: &LowresPlane, x0: i32, y0: i32, mut pred: F) -> u32
where
    F: FnMut(i32, i32) -> u8,
{
    let mut sad = 0;
    for j in 0..LOWRES_BLOCK_SIZE as i32 {
        for i in 0..LOWRES_BLOCK_SIZE as i32 {
            sad += u32::from(plane.at(x0 + i, y0 + j).abs_diff(pred(i, j)));
        }
    }
    sad
}

fn intra_cost(plane: &LowresPlane, x0: i32, y0: i32) -> u32 {
    let n = LOWRES_BLOCK_SIZE as i32;
    let top = (y0 > 0).then(|| (0..n).map(|i| plane.at(x0 + i, y0 - 1)).collect::<Vec<_>>());
    let left = (x0 > 0).then(|| (0..n).map(|j| plane.at(x0 - 1, y0 + j)).collect::<Vec<_>>());

    let neighbours = top.iter().chain(left.iter()).flatten().collect::<Vec<_>>();
    let dc = if neighbours.is_empty() {
        128
    } else {
        let sum = neighbours.iter().map(|p| u32::from(**p)).sum::<u32>();
        ((sum + neighbours.len() as u32 / 2) / neighbours.len() as u32) as u8
    };

    let mut best = block_sad(plane, x0, y0, |_, _| dc);
    if let Some(top) = &top {
        best = best.min(block_sad(plane, x0, y0, |i, _| top[i as usize]));
    }
    if let Some(left) = &left {
        best = best.min(block_sad(plane, x0, y0, |_, j| left[j as usize]));
    }
    best
}

fn inter_sad(
    cur: &LowresPlane,
    reference: &LowresPlane,
    x0: i32,
    y0: i32,
    mv: MotionVector,
) -> u32 {
    let (dx, dy) = (i32::from(mv.x), i32::from(mv.y));
    block_sad(cur, x0, y0, |i, j| reference.at(x0 + i + dx, y0 + j + dy))
}

fn bi_sad(
    cur: &LowresPlane,
    refs: (&LowresPlane, &LowresPlane),
    x0: i32,
    y0: i32,
    mvs: (MotionVector, MotionVector),
) -> u32 {
    let (mv0, mv1) = mvs;
    block_sad(cur, x0, y0, |i, j| {
        let a = u32::from(refs.0.at(x0 + i + i32::from(mv0.x), y0 + j + i32::from(mv0.y)));
        let b = u32::from(refs.1.at(x0 + i + i32::from(mv1.x), y0 + j + i32::from(mv1.y)));
        ((a + b + 1) / 2) as u8
    })
}

/// Best motion vector and its cost: the candidates are tried first, then every position within
/// `range` of the best of them.
fn search(
    cur: &LowresPlane,
    reference: &LowresPlane,
    x0: i32,
    y0: i32,
    candidates: &[MotionVector],
    range: i16,
) -> (MotionVector, u32) {
    let cost = |mv: MotionVector| inter_sad(cur, reference, x0, y0, mv) + mv.cost();

    let mut best = (MotionVector::ZERO, cost(MotionVector::ZERO));
    for candidate in candidates {
        let c = cost(*candidate);
        if c < best.1 {
            best = (*candidate, c);
        }
    }

    let center = best.0;
    for dy in -range..=range {
        for dx in -range..=range {
            let mv = MotionVector {
                x: center.x.saturating_add(dx),
                y: center.y.saturating_add(dy),
            };
            let c = cost(mv);
            if c < best.1 {
                best = (mv, c);
            }
        }
    }

    best
}

impl LowresFrame {
    /// Analyses `plane` against its references. `p1` is only used together with `p0`.
    pub fn analyse(
        info: FrameInfo,
        plane: Arc<LowresPlane>,
        p0: Option<CostReference>,
        p1: Option<CostReference>,
        me_range: u32,
    ) -> Self {
        let grid = plane.grid();
        let n = grid.len();
        let range = me_range.min(i16::MAX as u32) as i16;
        let p1 = p1.filter(|_| p0.is_some());

        let mut intra = vec![0u32; n];
        let mut best_cost = vec![0u32; n];
        let mut modes = vec![BlockMode::Intra; n];
        let mut mvs = [vec![MotionVector::ZERO; n], vec![MotionVector::ZERO; n]];
        let mut l0_cost = p0.as_ref().map(|_| vec![0u32; n]);
        let mut l1_cost = p1.as_ref().map(|_| vec![0u32; n]);
        let mut bi_cost = p1.as_ref().map(|_| vec![0u32; n]);
        let mut costs = FrameCosts {
            num_blocks: n as u32,
            ..Default::default()
        };

        for by in 0..grid.rows {
            for bx in 0..grid.cols {
                let b = by * grid.cols + bx;
                let x0 = (bx * LOWRES_BLOCK_SIZE) as i32;
                let y0 = (by * LOWRES_BLOCK_SIZE) as i32;

                intra[b] = intra_cost(&plane, x0, y0);
                let mut best = (intra[b], BlockMode::Intra);

                for (list, reference) in [&p0, &p1].into_iter().enumerate() {
                    let Some(reference) = reference else {
                        continue;
                    };
                    let mut candidates = Vec::with_capacity(2);
                    if bx > 0 {
                        candidates.push(mvs[list][b - 1]);
                    }
                    if by > 0 {
                        candidates.push(mvs[list][b - grid.cols]);
                    }

                    let (mv, cost) = search(&plane, &reference.plane, x0, y0, &candidates, range);
                    mvs[list][b] = mv;
                    let (table, mode) = if list == 0 {
                        (&mut l0_cost, BlockMode::List0)
                    } else {
                        (&mut l1_cost, BlockMode::List1)
                    };
                    if let Some(table) = table {
                        table[b] = cost;
                    }
                    if cost < best.0 {
                        best = (cost, mode);
                    }
                }

                if let (Some(r0), Some(r1), Some(bi_cost)) = (&p0, &p1, &mut bi_cost) {
                    let cost = bi_sad(
                        &plane,
                        (&r0.plane, &r1.plane),
                        x0,
                        y0,
                        (mvs[0][b], mvs[1][b]),
                    ) + mvs[0][b].cost()
                        + mvs[1][b].cost();
                    bi_cost[b] = cost;
                    if cost < best.0 {
                        best = (cost, BlockMode::Bi);
                    }
                }

                best_cost[b] = best.0;
                modes[b] = best.1;
                costs.intra += u64::from(intra[b]);
                costs.best += u64::from(best.0);
                if best.1 == BlockMode::Intra {
                    costs.intra_blocks += 1;
                } else if best.0 < SKIP_SAD_THRESHOLD {
                    costs.skip_blocks += 1;
                }
            }
        }

        let d0 = p0.as_ref().map_or(0, |r| r.distance);
        let d1 = p1.as_ref().map_or(0, |r| r.distance);
        let mut inter_cost = HashMap::new();
        if let Some(table) = l0_cost {
            inter_cost.insert((d0, 0), table);
        }
        if let Some(table) = l1_cost {
            inter_cost.insert((0, d1), table);
        }
        if let Some(table) = bi_cost {
            inter_cost.insert((d0, d1), table);
        }

        log::trace!(
            "analysed frame {} ({:?}): intra {} best {} intra blocks {}/{}",
            info.frame_num,
            info.slice_type,
            costs.intra,
            costs.best,
            costs.intra_blocks,
            n
        );

        Self {
            info,
            plane,
            grid,
            intra_cost: intra,
            inter_cost,
            best_cost,
            mvs,
            modes,
            p0,
            p1,
            costs,
        }
    }

    pub fn info(&self) -> &FrameInfo {
        &self.info
    }

    pub fn plane(&self) -> &Arc<LowresPlane> {
        &self.plane
    }

    pub fn grid(&self) -> BlockGrid {
        self.grid
    }

    pub fn intra_cost(&self) -> &[u32] {
        &self.intra_cost
    }

    /// Inter costs against the references at distances `d0` and `d1`, 0 standing for an unused
    /// list.
    pub fn inter_cost(&self, d0: u32, d1: u32) -> Option<&[u32]> {
        self.inter_cost.get(&(d0, d1)).map(Vec::as_slice)
    }

    /// Cost of the chosen mode of every block.
    pub fn best_cost(&self) -> &[u32] {
        &self.best_cost
    }

    pub fn mvs(&self, list: usize) -> &[MotionVector] {
        &self.mvs[list]
    }

    pub fn modes(&self) -> &[BlockMode] {
        &self.modes
    }

    pub fn p0(&self) -> Option<&CostReference> {
        self.p0.as_ref()
    }

    pub fn p1(&self) -> Option<&CostReference> {
        self.p1.as_ref()
    }

    pub fn costs(&self) -> FrameCosts {
        self.costs
    }

    pub fn rd_cost(&self) -> f64 {
        self.costs.best as f64
    }
}
