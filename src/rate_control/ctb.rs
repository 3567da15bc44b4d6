// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! CTB-level QP adjustment.
//!
//! Produces one fixed-point QP delta per CTB, relative to the picture QP, with `qp_frac_bits`
//! fractional bits. Two contributions can be enabled: a subjective one (look-ahead CU-tree deltas,
//! or activity masking without look-ahead) and a rate-accuracy one that follows the row
//! complexity, smoothed from one row to the next by `row_factor`.

use crate::encoder::Picture;
use crate::Resolution;

/// Fixed-point precision of `row_factor`.
pub const QPFACTOR_FIX_POINT: u32 = 14;

/// QP change for a row twice as complex as the picture average.
const CTB_RATE_STRENGTH: f64 = 3.0;
/// QP change for a CTB twice as active as the picture average, when no look-ahead map exists.
const CTB_MASKING_STRENGTH: f64 = 1.0;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CtbRcMode {
    #[default]
    Disabled,
    /// Look-ahead or activity based deltas.
    Subjective,
    /// Row complexity based deltas.
    RateAccuracy,
    Both,
}

impl CtbRcMode {
    pub fn is_enabled(self) -> bool {
        self != CtbRcMode::Disabled
    }

    fn subjective(self) -> bool {
        matches!(self, CtbRcMode::Subjective | CtbRcMode::Both)
    }

    fn rate_accuracy(self) -> bool {
        matches!(self, CtbRcMode::RateAccuracy | CtbRcMode::Both)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CtbRcConfig {
    pub mode: CtbRcMode,
    /// Fractional bits of the deltas handed to the hardware.
    pub qp_frac_bits: u32,
    /// Weight of the previous row in the row smoothing, Q14.
    pub row_factor: u32,
    /// Largest absolute delta, in QP.
    pub max_delta: u32,
}

impl Default for CtbRcConfig {
    fn default() -> Self {
        Self {
            mode: CtbRcMode::Disabled,
            qp_frac_bits: 4,
            row_factor: 1 << (QPFACTOR_FIX_POINT - 1),
            max_delta: 8,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CtbRateControl {
    config: CtbRcConfig,
    cols: usize,
    rows: usize,
}

impl CtbRateControl {
    pub fn new(config: CtbRcConfig, resolution: Resolution, ctb_size: u32) -> Self {
        let (cols, rows) = resolution.blocks(ctb_size);
        Self {
            config,
            cols: cols as usize,
            rows: rows as usize,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.mode.is_enabled()
    }

    pub fn num_ctbs(&self) -> usize {
        self.cols * self.rows
    }

    pub fn config(&self) -> &CtbRcConfig {
        &self.config
    }

    /// Fills `out` with the per-CTB deltas for a picture coded at `qp_hdr`. Deltas never move a
    /// CTB outside `[qp_min, qp_max]`.
    pub fn fill(
        &self,
        qp_hdr: u32,
        qp_min: u32,
        qp_max: u32,
        lookahead: Option<&[i8]>,
        complexity: Option<&[u32]>,
        out: &mut [i16],
    ) {
        out.fill(0);
        if !self.is_enabled() {
            return;
        }

        let n = self.num_ctbs();
        let mut deltas = vec![0f64; n];

        if self.config.mode.subjective() {
            if let Some(lookahead) = lookahead {
                for (delta, la) in deltas.iter_mut().zip(lookahead) {
                    *delta += f64::from(*la);
                }
            } else if let Some(complexity) = complexity {
                let mean = mean(&complexity[..n.min(complexity.len())]);
                for (delta, c) in deltas.iter_mut().zip(complexity) {
                    *delta += CTB_MASKING_STRENGTH * ((f64::from(*c) + 1.0) / (mean + 1.0)).log2();
                }
            }
        }

        if self.config.mode.rate_accuracy() {
            if let Some(complexity) = complexity.filter(|c| c.len() >= n) {
                self.add_row_deltas(&complexity[..n], &mut deltas);
            }
        }

        let max_delta = f64::from(self.config.max_delta);
        let lo = (f64::from(qp_min) - f64::from(qp_hdr)).max(-max_delta);
        let hi = (f64::from(qp_max) - f64::from(qp_hdr)).min(max_delta);
        let one = f64::from(1u32 << self.config.qp_frac_bits);

        for (dst, delta) in out.iter_mut().zip(&deltas) {
            *dst = (delta.clamp(lo, hi.max(lo)) * one).round() as i16;
        }
    }

    fn add_row_deltas(&self, complexity: &[u32], deltas: &mut [f64]) {
        let frame_mean = mean(complexity);
        let fix_one = 1u32 << QPFACTOR_FIX_POINT;
        let row_factor = f64::from(self.config.row_factor.min(fix_one)) / f64::from(fix_one);

        let mut smoothed: Option<f64> = None;
        for (row, row_deltas) in complexity
            .chunks(self.cols)
            .zip(deltas.chunks_mut(self.cols))
        {
            let raw = CTB_RATE_STRENGTH * ((mean(row) + 1.0) / (frame_mean + 1.0)).log2();
            let value = match smoothed {
                None => raw,
                Some(prev) => row_factor * prev + (1.0 - row_factor) * raw,
            };
            smoothed = Some(value);

            for delta in row_deltas {
                *delta += value;
            }
        }
    }
}

fn mean(values: &[u32]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().map(|v| f64::from(*v)).sum::<f64>() / values.len() as f64
}

/// Mean absolute deviation of the luma of every CTB, sampled on every other pixel.
pub fn ctb_activity(picture: &Picture, ctb_size: u32) -> Vec<u32> {
    let resolution = picture.resolution();
    let (cols, rows) = resolution.blocks(ctb_size);
    let (width, height) = (resolution.width as usize, resolution.height as usize);
    let ctb = ctb_size as usize;
    let luma = picture.luma();
    let stride = picture.stride();

    let mut activity = Vec::with_capacity((cols * rows) as usize);
    for ctb_row in 0..rows as usize {
        for ctb_col in 0..cols as usize {
            let xs = (ctb_col * ctb..((ctb_col + 1) * ctb).min(width)).step_by(2);
            let ys = (ctb_row * ctb..((ctb_row + 1) * ctb).min(height)).step_by(2);

            let samples = ys
                .flat_map(|y| xs.clone().map(move |x| y * stride + x))
                .filter_map(|offset| luma.get(offset).copied())
                .collect::<Vec<_>>();
            if samples.is_empty() {
                activity.push(0);
                continue;
            }

            let sum = samples.iter().map(|s| u32::from(*s)).sum::<u32>();
            let avg = sum / samples.len() as u32;
            let mad = samples.iter().map(|s| u32::from(*s).abs_diff(avg)).sum::<u32>()
                / samples.len() as u32;
            activity.push(mad);
        }
    }

    activity
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctb_rc(mode: CtbRcMode, resolution: (u32, u32)) -> CtbRateControl {
        CtbRateControl::new(
            CtbRcConfig {
                mode,
                ..Default::default()
            },
            resolution.into(),
            16,
        )
    }

    #[test]
    fn disabled_writes_zeros() {
        let rc = ctb_rc(CtbRcMode::Disabled, (64, 32));
        let mut out = vec![5i16; rc.num_ctbs()];
        rc.fill(30, 0, 51, Some(&[3; 8]), None, &mut out);
        assert!(out.iter().all(|d| *d == 0));
    }

    #[test]
    fn lookahead_deltas_are_fixed_point() {
        let rc = ctb_rc(CtbRcMode::Subjective, (64, 16));
        assert_eq!(rc.num_ctbs(), 4);

        let mut out = vec![0i16; 4];
        rc.fill(30, 0, 51, Some(&[-2, 0, 1, 12]), None, &mut out);
        // 4 fractional bits, and 12 is beyond the default limit of 8.
        assert_eq!(out, vec![-32, 0, 16, 128]);
    }

    #[test]
    fn deltas_respect_qp_bounds() {
        let rc = ctb_rc(CtbRcMode::Subjective, (32, 16));
        let mut out = vec![0i16; 2];
        rc.fill(50, 20, 51, Some(&[-6, 6]), None, &mut out);
        assert_eq!(out, vec![-96, 16]);
    }

    #[test]
    fn complex_rows_get_coarser() {
        let rc = ctb_rc(CtbRcMode::RateAccuracy, (32, 64));
        // Two CTBs per row, complexity growing downwards.
        let complexity = [10, 10, 10, 10, 40, 40, 160, 160];
        let mut out = vec![0i16; 8];
        rc.fill(30, 0, 51, None, Some(&complexity), &mut out);

        for row in out.chunks(2) {
            assert_eq!(row[0], row[1]);
        }
        assert!(out[0] < 0);
        assert!(out[0] <= out[2] && out[2] < out[4] && out[4] < out[6]);
        assert!(out[6] > 0);
    }

    #[test]
    fn activity_of_flat_and_textured_ctbs() {
        let resolution = Resolution::from((32, 16));
        let row = (0..32)
            .map(|x| match x {
                0..=15 => 100u8,
                _ if x % 4 < 2 => 0,
                _ => 200,
            })
            .collect::<Vec<_>>();
        let luma = row.repeat(16);
        let picture = Picture::new(resolution, luma);

        let activity = ctb_activity(&picture, 16);
        assert_eq!(activity.len(), 2);
        assert_eq!(activity[0], 0);
        assert_eq!(activity[1], 100);
    }
}
