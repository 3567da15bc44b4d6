// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Two-parameter linear rate/quantizer model `bits = a1 / qstep + a2`.
//!
//! The model keeps the last [`RC_TABLE_LENGTH`] `(qstep, bits)` samples in a ring and maintains the
//! least-squares sums incrementally, so inserting a sample and evicting the oldest one are both
//! constant time.

use std::collections::VecDeque;

/// Number of samples remembered by a [`LinearModel`].
pub const RC_TABLE_LENGTH: usize = 10;

/// QP at which the quantizer step is 1. The step doubles every 6 QP.
pub const QSTEP_QP_OFFSET: f64 = 4.0;

/// Relative threshold under which the least-squares determinant is considered zero.
const MIN_RELATIVE_DET: f64 = 1e-9;

/// Quantizer step size of `qp`.
pub fn qp_to_qstep(qp: f64) -> f64 {
    2f64.powf((qp - QSTEP_QP_OFFSET) / 6.0)
}

/// Inverse of [`qp_to_qstep`].
pub fn qstep_to_qp(qstep: f64) -> f64 {
    6.0 * qstep.log2() + QSTEP_QP_OFFSET
}

#[derive(Copy, Clone, Debug, PartialEq)]
struct Sample {
    /// 1 / qstep
    x: f64,
    /// bits
    y: f64,
}

#[derive(Clone, Debug)]
pub struct LinearModel {
    samples: VecDeque<Sample>,
    sum_x: f64,
    sum_y: f64,
    sum_xx: f64,
    sum_xy: f64,
    a1: f64,
    a2: f64,
    /// Set while the fit is degenerate or non-physical and must not be used for prediction.
    zero_div: bool,
}

impl Default for LinearModel {
    fn default() -> Self {
        Self::new()
    }
}

impl LinearModel {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(RC_TABLE_LENGTH),
            sum_x: 0.0,
            sum_y: 0.0,
            sum_xx: 0.0,
            sum_xy: 0.0,
            a1: 0.0,
            a2: 0.0,
            zero_div: true,
        }
    }

    /// Adds the observation that a picture coded with `qstep` produced `bits`, evicting the oldest
    /// sample once the ring is full.
    pub fn update(&mut self, qstep: f64, bits: f64) {
        if !(qstep > 0.0 && qstep.is_finite() && bits.is_finite() && bits >= 0.0) {
            log::debug!("ignoring invalid model sample qstep={} bits={}", qstep, bits);
            return;
        }

        if self.samples.len() == RC_TABLE_LENGTH {
            if let Some(old) = self.samples.pop_front() {
                self.sum_x -= old.x;
                self.sum_y -= old.y;
                self.sum_xx -= old.x * old.x;
                self.sum_xy -= old.x * old.y;
            }
        }

        let sample = Sample {
            x: 1.0 / qstep,
            y: bits,
        };
        self.sum_x += sample.x;
        self.sum_y += sample.y;
        self.sum_xx += sample.x * sample.x;
        self.sum_xy += sample.x * sample.y;
        self.samples.push_back(sample);

        self.refit();
    }

    fn refit(&mut self) {
        let n = self.samples.len() as f64;
        let det = n * self.sum_xx - self.sum_x * self.sum_x;

        if self.samples.len() < 2 || det.abs() <= MIN_RELATIVE_DET * n * self.sum_xx {
            self.zero_div = true;
            return;
        }

        self.a1 = (n * self.sum_xy - self.sum_x * self.sum_y) / det;
        self.a2 = (self.sum_y - self.a1 * self.sum_x) / n;

        // More bits for a coarser quantizer is not something a model can steer with.
        self.zero_div = !(self.a1.is_finite() && self.a2.is_finite() && self.a1 > 0.0);
    }

    pub fn is_valid(&self) -> bool {
        !self.zero_div
    }

    /// Fitted `(a1, a2)`, if the model is usable.
    pub fn coefficients(&self) -> Option<(f64, f64)> {
        self.is_valid().then_some((self.a1, self.a2))
    }

    pub fn predict_bits(&self, qstep: f64) -> Option<f64> {
        let (a1, a2) = self.coefficients()?;
        Some((a1 / qstep + a2).max(0.0))
    }

    /// Quantizer step expected to produce `bits`. A target at or below the fitted offset `a2`
    /// cannot be reached by any step and yields infinity, meaning "as coarse as allowed".
    pub fn qstep_for_bits(&self, bits: f64) -> Option<f64> {
        let (a1, a2) = self.coefficients()?;
        let headroom = bits - a2;
        if headroom <= 0.0 {
            return Some(f64::INFINITY);
        }
        Some(a1 / headroom)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() <= 1e-6 * b.abs().max(1.0), "{} != {}", a, b);
    }

    #[test]
    fn qstep_conversion() {
        assert_close(qp_to_qstep(4.0), 1.0);
        assert_close(qp_to_qstep(10.0), 2.0);
        assert_close(qp_to_qstep(28.0), 16.0);
        assert_close(qstep_to_qp(qp_to_qstep(33.5)), 33.5);
    }

    #[test]
    fn exact_fit() {
        let mut model = LinearModel::new();
        for qp in [24.0, 27.0, 30.0, 33.0] {
            let qstep = qp_to_qstep(qp);
            model.update(qstep, 120_000.0 / qstep + 500.0);
        }

        let (a1, a2) = model.coefficients().unwrap();
        assert_close(a1, 120_000.0);
        assert_close(a2, 500.0);

        let qstep = model.qstep_for_bits(8_000.0).unwrap();
        assert_close(model.predict_bits(qstep).unwrap(), 8_000.0);
    }

    #[test]
    fn single_quantizer_is_degenerate() {
        let mut model = LinearModel::new();
        assert!(model.qstep_for_bits(1000.0).is_none());

        for bits in [1000.0, 1200.0, 900.0] {
            model.update(16.0, bits);
        }
        assert!(!model.is_valid());
        assert!(model.predict_bits(16.0).is_none());
    }

    #[test]
    fn non_physical_slope_is_rejected() {
        let mut model = LinearModel::new();
        // Coarser quantizer, more bits.
        model.update(8.0, 1000.0);
        model.update(16.0, 2000.0);
        assert!(!model.is_valid());
    }

    #[test]
    fn oldest_samples_are_forgotten() {
        let mut model = LinearModel::new();
        for i in 0..RC_TABLE_LENGTH {
            let qstep = 8.0 + i as f64;
            model.update(qstep, 10_000.0 / qstep);
        }
        for i in 0..RC_TABLE_LENGTH {
            let qstep = 8.0 + i as f64;
            model.update(qstep, 40_000.0 / qstep);
        }

        assert_eq!(model.len(), RC_TABLE_LENGTH);
        let (a1, a2) = model.coefficients().unwrap();
        assert_close(a1, 40_000.0);
        assert!(a2.abs() < 1e-3);
    }

    #[test]
    fn unreachable_target() {
        let mut model = LinearModel::new();
        model.update(8.0, 1000.0 / 8.0 + 400.0);
        model.update(16.0, 1000.0 / 16.0 + 400.0);

        assert_eq!(model.qstep_for_bits(300.0), Some(f64::INFINITY));
    }
}
