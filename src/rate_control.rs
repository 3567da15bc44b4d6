// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Picture-level rate control.
//!
//! [`RateController`] is called twice per picture: [`RateController::before_picture`] decides the
//! picture QP (and the per-CTB deltas) from the bit target, and [`RateController::after_picture`]
//! feeds the realized size back. Bits are predicted per picture class with a [`LinearModel`], the
//! channel is modelled by a [`VirtualBuffer`], and mini-GOPs are kept consistent through a
//! GOP-level model.

pub mod ctb;
pub mod model;
pub mod virtual_buffer;

use std::collections::VecDeque;

use thiserror::Error;

use crate::encoder::CodingType;
use crate::encoder::EncoderConfig;
use crate::encoder::RateControl;
use crate::encoder::Tunings;
use crate::gop::FrameDecision;
use crate::rate_control::ctb::CtbRateControl;
use crate::rate_control::ctb::CtbRcConfig;
use crate::rate_control::model::qp_to_qstep;
use crate::rate_control::model::qstep_to_qp;
use crate::rate_control::model::LinearModel;
use crate::rate_control::virtual_buffer::VirtualBuffer;

/// Fractional bits of the internal QP representation.
pub const QP_FRACTIONAL_BITS: u32 = 8;
const QP_ONE: i32 = 1 << QP_FRACTIONAL_BITS;

pub const MAX_QP: u32 = 51;

/// Length of the moving window used to check the average bitrate.
pub const RC_MOVING_AVERAGE_FRAMES: usize = 30;
/// Miss ratio tolerated before the fallback rule moves the QP.
pub const RC_TOLERANCE: f64 = 0.10;
/// QP step of the fallback rule used while a model is not usable.
pub const RC_FALLBACK_QP_STEP: i32 = 1;
/// Largest QP change between two pictures of the same class.
pub const RC_MAX_QP_CHANGE: i32 = 4;
/// Largest distance between a picture QP and the QP of its mini-GOP.
pub const RC_GOP_QP_RANGE: i32 = 6;
/// Largest frame-level QP offset taken from the look-ahead.
pub const RC_LOOKAHEAD_QP_RANGE: f32 = 6.0;

/// The initial QP estimate gives `QP_AT_REF_BPP` at `REF_BPP` bits per pixel, and moves by 6 for
/// every factor of two away from it.
const REF_BPP: f64 = 0.1;
const QP_AT_REF_BPP: f64 = 31.0;

/// Bounds of a picture target relative to its nominal share.
const RC_MIN_TARGET_RATIO: f64 = 0.125;
const RC_MAX_TARGET_RATIO: f64 = 4.0;
/// Without HRD, intra pictures may not be predicted to exceed this many average pictures.
const RC_INTRA_MAX_PIC_RATIO: f64 = 8.0;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RateControlError {
    #[error("before_picture called while the previous picture is still pending")]
    BeforePictureOutOfOrder,
    #[error("after_picture called without a pending picture")]
    AfterPictureOutOfOrder,
    #[error("changing the rate control mode is not supported")]
    UnsupportedTuning,
    #[error("invalid rate control configuration: {0}")]
    InvalidConfig(&'static str),
}

pub type RcResult<T> = Result<T, RateControlError>;

#[derive(Clone, Debug, PartialEq)]
pub struct RcConfig {
    pub qp_min: u32,
    pub qp_max: u32,
    /// Bounds for intra pictures, defaulting to the global ones.
    pub qp_min_i: Option<u32>,
    pub qp_max_i: Option<u32>,
    /// QP of intra pictures relative to the inter baseline.
    pub intra_qp_delta: i32,
    /// Forces the QP of intra pictures.
    pub fixed_intra_qp: Option<u32>,
    /// QP of P pictures that refresh the long-term reference, relative to regular P pictures.
    pub long_term_qp_delta: i32,
    /// Rejects pictures that would overflow the buffer and skips pictures to recover.
    pub hrd: bool,
    /// Buffer size in bits, one second of bitrate by default.
    pub cpb_size: Option<u64>,
    /// Skips the picture following an overflow when HRD is off.
    pub pic_skip: bool,
    /// Tolerated deviation of the moving average bitrate, in percent. 0 disables the check.
    pub tol_moving_bitrate: u32,
    pub ctb: CtbRcConfig,
}

impl Default for RcConfig {
    fn default() -> Self {
        Self {
            qp_min: 0,
            qp_max: MAX_QP,
            qp_min_i: None,
            qp_max_i: None,
            intra_qp_delta: -3,
            fixed_intra_qp: None,
            long_term_qp_delta: 0,
            hrd: false,
            cpb_size: None,
            pic_skip: false,
            tol_moving_bitrate: 15,
            ctb: CtbRcConfig::default(),
        }
    }
}

impl RcConfig {
    fn validate(&self) -> RcResult<()> {
        let bounds = [
            (self.qp_min, self.qp_max),
            (
                self.qp_min_i.unwrap_or(self.qp_min),
                self.qp_max_i.unwrap_or(self.qp_max),
            ),
        ];
        for (min, max) in bounds {
            if min > max || max > MAX_QP {
                return Err(RateControlError::InvalidConfig("QP bounds"));
            }
        }
        if self.fixed_intra_qp.is_some_and(|qp| qp > MAX_QP) {
            return Err(RateControlError::InvalidConfig("fixed intra QP"));
        }
        if self.ctb.qp_frac_bits > 8 {
            return Err(RateControlError::InvalidConfig("CTB QP fractional bits"));
        }

        Ok(())
    }
}

/// Rate control classes. Each class has its own model and QP history.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum RcClass {
    Intra,
    P,
    PLongTerm,
    BRef,
    BNonRef,
}

const RC_CLASS_COUNT: usize = 5;

impl RcClass {
    fn new(picture: &RcPicture<'_>) -> Self {
        match picture.coding_type {
            CodingType::Intra => RcClass::Intra,
            CodingType::Predicted if picture.use_long_term_ref => RcClass::PLongTerm,
            CodingType::Predicted => RcClass::P,
            CodingType::Bipredicted if picture.is_reference => RcClass::BRef,
            CodingType::Bipredicted => RcClass::BNonRef,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// What the rate control needs to know about the next picture.
#[derive(Clone, Debug)]
pub struct RcPicture<'a> {
    pub coding_type: CodingType,
    /// Whether the picture is referenced by later pictures.
    pub is_reference: bool,
    pub use_long_term_ref: bool,
    /// QP offset of the position in the mini-GOP.
    pub qp_offset: i32,
    /// Share of the average picture budget, 1.0 on average over a mini-GOP.
    pub bit_weight: f64,
    /// Last picture of its mini-GOP in coding order.
    pub last_in_gop: bool,
    /// Frame-level QP offset from the look-ahead.
    pub lookahead_qp_offset: f32,
    /// Per-CTB integer deltas from the look-ahead.
    pub lookahead_deltas: Option<&'a [i8]>,
    /// Per-CTB complexity estimate.
    pub ctb_complexity: Option<&'a [u32]>,
}

impl<'a> RcPicture<'a> {
    pub fn new(coding_type: CodingType) -> Self {
        Self {
            coding_type,
            is_reference: coding_type != CodingType::Bipredicted,
            use_long_term_ref: false,
            qp_offset: 0,
            bit_weight: 1.0,
            last_in_gop: true,
            lookahead_qp_offset: 0.0,
            lookahead_deltas: None,
            ctb_complexity: None,
        }
    }

    pub fn from_decision(decision: &FrameDecision) -> Self {
        Self {
            coding_type: decision.coding_type,
            is_reference: decision.is_reference,
            use_long_term_ref: decision.use_long_term_ref,
            qp_offset: decision.qp_offset,
            bit_weight: decision.bit_weight,
            last_in_gop: decision.gop_pic_idx + 1 == decision.gop_size,
            ..Self::new(decision.coding_type)
        }
    }
}

/// Outcome of [`RateController::before_picture`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PictureDecision {
    pub qp_hdr: u32,
    /// Code the picture as a skipped picture.
    pub skip: bool,
    /// Bit budget of the picture, 0 in constant quality mode.
    pub target_bits: u64,
}

/// Hardware statistics of a coded picture.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PictureStats {
    pub byte_count: usize,
    /// Number of non-zero coefficients. Pictures without any are not used to refit the models.
    pub non_zero_count: u32,
    pub qp_sum: u64,
    pub qp_count: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RcStatus {
    Ok,
    /// The picture overflowed the buffer. `skip_frames` upcoming pictures will be skipped, and
    /// `dropped` tells whether the picture itself must be replaced by a skipped picture.
    Overflow { skip_frames: u32, dropped: bool },
}

#[derive(Copy, Clone, Debug)]
struct PendingPicture {
    class: RcClass,
    qp_hdr: u32,
    skip: bool,
    target_bits: f64,
    last_in_gop: bool,
}

#[derive(Copy, Clone, Debug, Default)]
struct GopAccumulator {
    bits: f64,
    qstep: f64,
    pictures: u32,
}

pub struct RateController {
    config: RcConfig,
    mode: RateControl,
    frame_duration: u32,
    frame_rate: f64,
    area: usize,
    qp_min: u32,
    qp_max: u32,
    initial_qp: i32,
    /// QP of the P pictures with the mini-GOP offset removed.
    baseline: Option<i32>,
    last_qp: Option<i32>,
    class_qp: [Option<i32>; RC_CLASS_COUNT],
    /// (bits, target) of the last picture of each class.
    class_last: [Option<(f64, f64)>; RC_CLASS_COUNT],
    models: [LinearModel; RC_CLASS_COUNT],
    gop_model: LinearModel,
    gop_acc: GopAccumulator,
    gop_qp: Option<i32>,
    vb: VirtualBuffer,
    window: VecDeque<u64>,
    pending: Option<PendingPicture>,
    pictures: u64,
    skip_frame_target: u32,
    skip_frame_count: u32,
    ctb: CtbRateControl,
}

fn qstep_to_qp_fixed(qstep: f64) -> i32 {
    let qp = qstep_to_qp(qstep).clamp(0.0, f64::from(MAX_QP));
    (qp * f64::from(QP_ONE)).round() as i32
}

fn qp_fixed_to_qstep(qp: i32) -> f64 {
    qp_to_qstep(f64::from(qp) / f64::from(QP_ONE))
}

fn initial_qp(bit_rate: u64, frame_rate: f64, area: usize) -> i32 {
    if bit_rate == 0 || area == 0 {
        return (QP_AT_REF_BPP as i32) * QP_ONE;
    }
    let bpp = bit_rate as f64 / frame_rate / area as f64;
    let qp = QP_AT_REF_BPP - 6.0 * (bpp / REF_BPP).log2();
    (qp.clamp(0.0, f64::from(MAX_QP)) * f64::from(QP_ONE)).round() as i32
}

impl RateController {
    pub fn new(config: &EncoderConfig) -> RcResult<Self> {
        config.rc.validate()?;
        if config.frame_rate.num == 0 || config.frame_rate.denom == 0 {
            return Err(RateControlError::InvalidConfig("frame rate"));
        }

        let bit_rate = config.rate_control.bitrate_target().unwrap_or(0);
        let area = config.resolution.get_area();
        let frame_rate = f64::from(config.frame_rate.num) / f64::from(config.frame_rate.denom);

        Ok(Self {
            mode: config.rate_control.clone(),
            frame_duration: config.frame_rate.denom,
            frame_rate,
            area,
            qp_min: config.rc.qp_min,
            qp_max: config.rc.qp_max,
            initial_qp: initial_qp(bit_rate, frame_rate, area),
            baseline: None,
            last_qp: None,
            class_qp: [None; RC_CLASS_COUNT],
            class_last: [None; RC_CLASS_COUNT],
            models: std::array::from_fn(|_| LinearModel::new()),
            gop_model: LinearModel::new(),
            gop_acc: Default::default(),
            gop_qp: None,
            vb: VirtualBuffer::new(
                bit_rate,
                config.frame_rate.num,
                config.frame_rate.denom,
                config.rc.cpb_size.unwrap_or(bit_rate),
            ),
            window: VecDeque::with_capacity(RC_MOVING_AVERAGE_FRAMES),
            pending: None,
            pictures: 0,
            skip_frame_target: 0,
            skip_frame_count: 0,
            ctb: CtbRateControl::new(config.rc.ctb.clone(), config.resolution, config.ctb_size()),
            config: config.rc.clone(),
        })
    }

    fn is_cbr(&self) -> bool {
        matches!(self.mode, RateControl::ConstantBitrate(_))
    }

    fn qp_bounds(&self, class: RcClass) -> (u32, u32) {
        match class {
            RcClass::Intra => (
                self.config.qp_min_i.unwrap_or(self.qp_min),
                self.config.qp_max_i.unwrap_or(self.qp_max),
            ),
            _ => (self.qp_min, self.qp_max),
        }
    }

    fn position_offset(&self, class: RcClass, picture: &RcPicture<'_>) -> i32 {
        let ltr = match class {
            RcClass::PLongTerm => self.config.long_term_qp_delta,
            _ => 0,
        };
        (picture.qp_offset + ltr) * QP_ONE
    }

    /// Decides the QP of the next picture. When `ctb_map` is given and CTB rate control is
    /// enabled, it is filled with the per-CTB deltas in the hardware fixed-point format.
    ///
    /// `time_inc` is the time elapsed since the previous picture, see
    /// [`crate::encoder::FrameMetadata::time_increment`].
    pub fn before_picture(
        &mut self,
        time_inc: u32,
        picture: &RcPicture<'_>,
        ctb_map: Option<&mut [i16]>,
    ) -> RcResult<PictureDecision> {
        if self.pending.is_some() {
            return Err(RateControlError::BeforePictureOutOfOrder);
        }

        self.vb.advance(time_inc);

        let class = RcClass::new(picture);
        let (qp_min, qp_max) = self.qp_bounds(class);
        let skip = self.skip_frame_count < self.skip_frame_target;
        let target_bits = if self.is_cbr() && !skip {
            self.target_bits(picture.bit_weight)
        } else {
            0.0
        };

        let mut qp = match self.mode {
            RateControl::ConstantQuality(qp) => self.constant_quality_qp(qp, class, picture),
            RateControl::ConstantBitrate(_) if skip => self.last_qp.unwrap_or(self.initial_qp),
            RateControl::ConstantBitrate(_) => match (self.baseline, class) {
                (None, _) => self.initial_qp,
                (Some(baseline), RcClass::Intra) => self.intra_qp(baseline),
                (Some(baseline), _) => self.inter_qp(class, picture, target_bits, baseline),
            },
        };

        if !skip && picture.lookahead_qp_offset != 0.0 {
            let offset = picture
                .lookahead_qp_offset
                .clamp(-RC_LOOKAHEAD_QP_RANGE, RC_LOOKAHEAD_QP_RANGE);
            qp += (offset * QP_ONE as f32).round() as i32;
        }

        qp = qp.clamp(qp_min as i32 * QP_ONE, qp_max as i32 * QP_ONE);
        let qp_hdr = ((qp + QP_ONE / 2) >> QP_FRACTIONAL_BITS).clamp(qp_min as i32, qp_max as i32)
            as u32;

        if let Some(map) = ctb_map {
            if skip {
                map.fill(0);
            } else {
                self.ctb.fill(
                    qp_hdr,
                    qp_min,
                    qp_max,
                    picture.lookahead_deltas,
                    picture.ctb_complexity,
                    map,
                );
            }
        }

        if !skip {
            self.class_qp[class.index()] = Some(qp);
            if self.baseline.is_none() || matches!(class, RcClass::P | RcClass::PLongTerm) {
                self.baseline = Some(qp - self.position_offset(class, picture));
            }
        }
        self.last_qp = Some(qp);

        log::debug!(
            "picture {}: {:?} qp={} target={:.0} skip={} occupancy={}/{}",
            self.pictures,
            class,
            qp_hdr,
            target_bits,
            skip,
            self.vb.occupancy(),
            self.vb.buffer_size(),
        );

        self.pending = Some(PendingPicture {
            class,
            qp_hdr,
            skip,
            target_bits,
            last_in_gop: picture.last_in_gop,
        });

        Ok(PictureDecision {
            qp_hdr,
            skip,
            target_bits: target_bits.round() as u64,
        })
    }

    fn constant_quality_qp(&self, qp: u32, class: RcClass, picture: &RcPicture<'_>) -> i32 {
        let qp = qp.min(MAX_QP) as i32 * QP_ONE;
        match class {
            RcClass::Intra => match self.config.fixed_intra_qp {
                Some(fixed) => fixed as i32 * QP_ONE,
                None => qp + self.config.intra_qp_delta * QP_ONE,
            },
            _ => qp + self.position_offset(class, picture),
        }
    }

    fn target_bits(&self, weight: f64) -> f64 {
        let nominal = self.vb.bits_per_pic() * weight.max(0.0);
        // Spread the accumulated deviation over the next pictures.
        let correction = self.vb.deviation() as f64 * weight / RC_MOVING_AVERAGE_FRAMES as f64;
        let mut target = (nominal - correction)
            .clamp(nominal * RC_MIN_TARGET_RATIO, nominal * RC_MAX_TARGET_RATIO);
        if self.config.hrd {
            target = target.min(self.vb.headroom() as f64);
        }
        target.max(0.0)
    }

    fn intra_qp(&self, baseline: i32) -> i32 {
        if let Some(fixed) = self.config.fixed_intra_qp {
            return fixed as i32 * QP_ONE;
        }

        let mut qp = baseline + self.config.intra_qp_delta * QP_ONE;
        let limit = if self.config.hrd {
            self.vb.headroom() as f64
        } else {
            self.vb.bits_per_pic() * RC_INTRA_MAX_PIC_RATIO
        };
        if let Some(qstep) = self.models[RcClass::Intra.index()].qstep_for_bits(limit) {
            qp = qp.max(qstep_to_qp_fixed(qstep));
        }
        qp
    }

    fn inter_qp(
        &self,
        class: RcClass,
        picture: &RcPicture<'_>,
        target_bits: f64,
        baseline: i32,
    ) -> i32 {
        let offset = self.position_offset(class, picture);
        let prev = self.class_qp[class.index()].unwrap_or(baseline + offset);

        let mut qp = match self.models[class.index()].qstep_for_bits(target_bits) {
            Some(qstep) => qstep_to_qp_fixed(qstep),
            None => self.fallback_qp(class, prev),
        };
        qp = qp.clamp(
            prev - RC_MAX_QP_CHANGE * QP_ONE,
            prev + RC_MAX_QP_CHANGE * QP_ONE,
        );

        if let Some(gop_qp) = self.gop_qp {
            let center = gop_qp + offset;
            qp = qp.clamp(
                center - RC_GOP_QP_RANGE * QP_ONE,
                center + RC_GOP_QP_RANGE * QP_ONE,
            );
        }

        qp + self.moving_window_correction()
    }

    /// Step rule used while the model of `class` is degenerate.
    fn fallback_qp(&self, class: RcClass, prev: i32) -> i32 {
        match self.class_last[class.index()] {
            Some((bits, target)) if target > 0.0 && bits > target * (1.0 + RC_TOLERANCE) => {
                prev + RC_FALLBACK_QP_STEP * QP_ONE
            }
            Some((bits, target)) if target > 0.0 && bits < target * (1.0 - RC_TOLERANCE) => {
                prev - RC_FALLBACK_QP_STEP * QP_ONE
            }
            _ => prev,
        }
    }

    fn moving_window_correction(&self) -> i32 {
        let tolerance = f64::from(self.config.tol_moving_bitrate);
        if tolerance == 0.0 || self.window.len() < RC_MOVING_AVERAGE_FRAMES {
            return 0;
        }

        let expected = self.vb.bits_per_pic();
        if expected <= 0.0 {
            return 0;
        }
        let average = self.window.iter().sum::<u64>() as f64 / self.window.len() as f64;
        let deviation = (average - expected) / expected * 100.0;

        if deviation > tolerance {
            QP_ONE
        } else if deviation < -tolerance {
            -QP_ONE
        } else {
            0
        }
    }

    /// Feeds back the statistics of the picture decided by the last
    /// [`RateController::before_picture`] call.
    pub fn after_picture(&mut self, stats: &PictureStats) -> RcResult<RcStatus> {
        let pending = self
            .pending
            .take()
            .ok_or(RateControlError::AfterPictureOutOfOrder)?;

        let bits = stats.byte_count as u64 * 8;
        self.pictures += 1;

        if pending.skip {
            self.skip_frame_count += 1;
            if self.skip_frame_count >= self.skip_frame_target {
                self.skip_frame_count = 0;
                self.skip_frame_target = 0;
            }
            self.account_bits(bits);
            return Ok(RcStatus::Ok);
        }

        let mut status = RcStatus::Ok;
        if let Some(excess) = self.vb.excess(bits).filter(|_| self.is_cbr()) {
            if self.config.hrd {
                let drain = self.vb.min_drain_per_pic().max(1);
                let skip_frames = excess.div_ceil(drain) as u32;

                log::debug!(
                    "picture of {} bits overflows the buffer by {}, skipping {} pictures",
                    bits,
                    excess,
                    skip_frames
                );

                self.skip_frame_target = skip_frames;
                self.skip_frame_count = 0;
                // The picture is replaced by a skipped one, whose size is negligible.
                self.account_bits(0);
                return Ok(RcStatus::Overflow {
                    skip_frames,
                    dropped: true,
                });
            }

            let skip_frames = u32::from(self.config.pic_skip);
            if skip_frames > 0 {
                self.skip_frame_target = skip_frames;
                self.skip_frame_count = 0;
            }
            status = RcStatus::Overflow {
                skip_frames,
                dropped: false,
            };
        }

        self.account_bits(bits);

        let average_qp = if stats.qp_count > 0 {
            stats.qp_sum as f64 / f64::from(stats.qp_count)
        } else {
            f64::from(pending.qp_hdr)
        };
        let qstep = qp_to_qstep(average_qp);

        if stats.non_zero_count > 0 && bits > 0 {
            self.models[pending.class.index()].update(qstep, bits as f64);
        }
        self.class_last[pending.class.index()] = Some((bits as f64, pending.target_bits));

        self.gop_acc.bits += bits as f64;
        self.gop_acc.qstep += qstep;
        self.gop_acc.pictures += 1;
        if pending.last_in_gop {
            self.close_gop();
        }

        Ok(status)
    }

    /// Forgets the picture decided by the last [`RateController::before_picture`] call, for
    /// pictures that never reached the hardware.
    pub fn abandon_picture(&mut self) {
        if let Some(pending) = self.pending.take() {
            if pending.last_in_gop {
                self.close_gop();
            }
        }
    }

    fn account_bits(&mut self, bits: u64) {
        self.vb.add_bits(bits);
        if self.window.len() == RC_MOVING_AVERAGE_FRAMES {
            self.window.pop_front();
        }
        self.window.push_back(bits);
    }

    fn close_gop(&mut self) {
        let acc = std::mem::take(&mut self.gop_acc);
        if acc.pictures == 0 || !self.is_cbr() {
            return;
        }

        let pictures = f64::from(acc.pictures);
        self.gop_model.update(acc.qstep / pictures, acc.bits / pictures);

        let target = self.target_bits(1.0);
        self.gop_qp = self
            .gop_model
            .qstep_for_bits(target)
            .map(qstep_to_qp_fixed);

        log::trace!(
            "mini-GOP closed: {} pictures, {:.0} bits/picture, next GOP qstep {:?}",
            acc.pictures,
            acc.bits / pictures,
            self.gop_qp.map(qp_fixed_to_qstep),
        );
    }

    /// Applies new [`Tunings`]. Switching between constant bitrate and constant quality is not
    /// supported.
    pub fn tune(&mut self, tunings: &Tunings) -> RcResult<()> {
        if !RateControl::is_same_variant(&self.mode, &tunings.rate_control) {
            return Err(RateControlError::UnsupportedTuning);
        }
        if tunings.framerate == 0 {
            return Err(RateControlError::InvalidConfig("frame rate"));
        }

        let qp_max = tunings.max_quality.min(MAX_QP);
        let qp_min = tunings.min_quality.min(qp_max);

        let bit_rate = tunings.rate_control.bitrate_target().unwrap_or(0);
        let buffer_size = self.config.cpb_size.unwrap_or(bit_rate);
        // Tunings carry an integer frame rate.
        let time_scale = tunings
            .framerate
            .checked_mul(self.frame_duration)
            .ok_or(RateControlError::InvalidConfig("frame rate"))?;
        self.vb
            .set_rate(bit_rate, time_scale, self.frame_duration, buffer_size);
        self.frame_rate = f64::from(tunings.framerate);

        log::debug!(
            "tuned: {:?} at {} fps, QP in [{}, {}]",
            tunings.rate_control,
            tunings.framerate,
            qp_min,
            qp_max
        );

        self.mode = tunings.rate_control.clone();
        self.qp_min = qp_min;
        self.qp_max = qp_max;
        self.window.clear();

        Ok(())
    }

    /// Restarts the rate control as for a new stream.
    pub fn reset(&mut self) {
        self.baseline = None;
        self.last_qp = None;
        self.class_qp = [None; RC_CLASS_COUNT];
        self.class_last = [None; RC_CLASS_COUNT];
        self.models.iter_mut().for_each(LinearModel::reset);
        self.gop_model.reset();
        self.gop_acc = Default::default();
        self.gop_qp = None;
        self.vb.reset();
        self.window.clear();
        self.pending = None;
        self.pictures = 0;
        self.skip_frame_target = 0;
        self.skip_frame_count = 0;

        self.initial_qp = initial_qp(self.vb.bit_rate(), self.frame_rate, self.area);
    }

    pub fn ctb(&self) -> &CtbRateControl {
        &self.ctb
    }

    pub fn occupancy(&self) -> u64 {
        self.vb.occupancy()
    }

    pub fn buffer_size(&self) -> u64 {
        self.vb.buffer_size()
    }

    pub fn bits_per_pic(&self) -> f64 {
        self.vb.bits_per_pic()
    }

    /// Number of pictures fed back so far.
    pub fn num_pictures(&self) -> u64 {
        self.pictures
    }

    pub fn qp_bounds_for(&self, coding_type: CodingType) -> (u32, u32) {
        self.qp_bounds(RcClass::new(&RcPicture::new(coding_type)))
    }
}
