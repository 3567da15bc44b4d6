// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a synthetic backend whose only purpose is to let the encoder run without
//! hardware, so we can test it in isolation.
//!
//! Picture sizes follow `bits = area * complexity * factor / qstep`, with a factor depending on
//! the coding type, at the average QP of the CTBs.

use byteorder::LittleEndian;
use byteorder::WriteBytesExt;

use crate::encoder::stateless::BackendError;
use crate::encoder::stateless::BackendResult;
use crate::encoder::stateless::EncodeBackend;
use crate::encoder::stateless::EncodeRequest;
use crate::encoder::stateless::EncodeStats;
use crate::encoder::stateless::ReadyPromise;
use crate::encoder::CodingType;
use crate::encoder::EncoderConfig;
use crate::rate_control::model::qp_to_qstep;
use crate::Resolution;

/// Size of the header written at the start of every synthetic bitstream.
const HEADER_SIZE: usize = 8;

/// Bits of a skipped picture.
const SKIP_PICTURE_BITS: usize = HEADER_SIZE * 8;

/// What the backend was asked to encode.
#[derive(Clone, Debug, PartialEq)]
pub struct SubmittedPicture {
    pub timestamp: u64,
    pub coding_type: CodingType,
    pub qp: u32,
    pub skip: bool,
    /// Per-CTB deltas found in the QP-delta buffer, if one was attached.
    pub ctb_deltas: Option<Vec<i16>>,
    pub bytes: usize,
}

pub struct SyntheticBackend {
    resolution: Resolution,
    num_ctbs: usize,
    /// Bits per pixel of a P picture at a quantizer step of 1.
    complexity: f64,
    num_submitted: u64,
    fail_at: Option<u64>,
    submitted: Vec<SubmittedPicture>,
}

impl SyntheticBackend {
    pub fn new(config: &EncoderConfig) -> Self {
        Self {
            resolution: config.resolution,
            num_ctbs: config.num_ctbs(),
            complexity: 4.0,
            num_submitted: 0,
            fail_at: None,
            submitted: Vec::new(),
        }
    }

    pub fn with_complexity(mut self, complexity: f64) -> Self {
        self.complexity = complexity;
        self
    }

    /// Makes the `n`-th submission, counting from 0, fail.
    pub fn fail_at(mut self, n: u64) -> Self {
        self.fail_at = Some(n);
        self
    }

    pub fn set_complexity(&mut self, complexity: f64) {
        self.complexity = complexity;
    }

    pub fn submitted(&self) -> &[SubmittedPicture] {
        &self.submitted
    }
}

impl EncodeBackend for SyntheticBackend {
    type Promise = ReadyPromise<EncodeStats>;

    fn encode(&mut self, request: EncodeRequest) -> BackendResult<Self::Promise> {
        let n = self.num_submitted;
        self.num_submitted += 1;

        if self.fail_at == Some(n) {
            return Err(BackendError::Other(anyhow::anyhow!(
                "injected failure on submission {}",
                n
            )));
        }
        if request.picture.resolution() != self.resolution || !request.picture.is_complete() {
            return Err(BackendError::UnsupportedFormat);
        }

        let ctb_deltas = request
            .qp_map
            .as_ref()
            .map(|buffer| request.layout.read_hw(&buffer.map()));
        let one = f64::from(1u32 << request.qp_frac_bits);
        let mean_delta = ctb_deltas.as_ref().map_or(0.0, |deltas| {
            deltas.iter().map(|d| f64::from(*d)).sum::<f64>() / (deltas.len().max(1) as f64) / one
        });
        let qp = f64::from(request.qp) + mean_delta;

        let (cols, rows) = self.resolution.blocks(8);
        let num_cu8 = cols * rows;
        let (bits, intra_ratio, skip_ratio) = if request.skip {
            (SKIP_PICTURE_BITS, 0.0, 1.0)
        } else {
            let (factor, intra_ratio, skip_ratio) = match request.decision.coding_type {
                CodingType::Intra => (4.0, 1.0, 0.0),
                CodingType::Predicted => (1.0, 0.05, 0.3),
                CodingType::Bipredicted => (0.5, 0.02, 0.6),
            };
            let bits =
                self.resolution.get_area() as f64 * self.complexity * factor / qp_to_qstep(qp);
            (bits.round().max(SKIP_PICTURE_BITS as f64) as usize, intra_ratio, skip_ratio)
        };

        let mut bitstream = Vec::with_capacity(bits.div_ceil(8));
        bitstream
            .write_u32::<LittleEndian>(n as u32)
            .map_err(anyhow::Error::from)?;
        bitstream
            .write_u32::<LittleEndian>(request.qp)
            .map_err(anyhow::Error::from)?;
        bitstream.resize(bits.div_ceil(8).max(HEADER_SIZE), 0);

        log::trace!(
            "synthetic encode #{}: {:?} qp={:.2} {} bytes",
            n,
            request.decision.coding_type,
            qp,
            bitstream.len()
        );

        self.submitted.push(SubmittedPicture {
            timestamp: request.metadata.timestamp,
            coding_type: request.decision.coding_type,
            qp: request.qp,
            skip: request.skip,
            ctb_deltas,
            bytes: bitstream.len(),
        });

        let num_ctbs = self.num_ctbs.max(1) as u32;
        Ok(ReadyPromise::from(EncodeStats {
            non_zero_count: if request.skip { 0 } else { num_cu8 * 16 },
            qp_sum: (qp.max(0.0) * f64::from(num_ctbs)).round() as u64,
            qp_count: num_ctbs,
            intra_cu8_count: (f64::from(num_cu8) * intra_ratio).round() as u32,
            skip_cu8_count: (f64::from(num_cu8) * skip_ratio).round() as u32,
            rd_cost: bits as f64,
            bitstream,
        }))
    }
}
