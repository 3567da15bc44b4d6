// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::VecDeque;

use thiserror::Error;

use crate::buffer_pool::BufferPool;
use crate::buffer_pool::PoolError;
use crate::buffer_pool::PooledBuffer;
use crate::buffer_pool::QpDeltaLayout;
use crate::encoder::CodedPicture;
use crate::encoder::EncoderConfig;
use crate::encoder::FrameMetadata;
use crate::encoder::Picture;
use crate::encoder::Tunings;
use crate::gop::adaptive::GopFrameStats;
use crate::gop::FrameDecision;
use crate::gop::MiniGopPredictor;
use crate::lookahead::Lookahead;
use crate::lookahead::LookaheadError;
use crate::lookahead::LookaheadJob;
use crate::lookahead::LookaheadState;
use crate::rate_control::ctb::ctb_activity;
use crate::rate_control::PictureStats;
use crate::rate_control::RateControlError;
use crate::rate_control::RateController;
use crate::rate_control::RcPicture;
use crate::rate_control::RcStatus;
use crate::BlockingMode;
use crate::Resolution;

/// Number of QP-delta buffers owned by the encoder for pictures without a look-ahead buffer.
const ENCODER_POOL_SIZE: usize = 2;
const ENCODER_POOL_BUS_BASE: u64 = 0x2000_0000;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("unsupported format")]
    UnsupportedFormat,
    #[error("not enough resources to proceed with the operation now")]
    OutOfResources,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("unsupported")]
    Unsupported,
    #[error("invalid internal state. This is likely a bug.")]
    InvalidInternalState,
    #[error("picture of {actual:?} does not match the stream resolution {expected:?}")]
    InvalidPicture {
        expected: Resolution,
        actual: Resolution,
    },
    #[error(transparent)]
    BackendError(#[from] BackendError),
    #[error(transparent)]
    RateControl(#[from] RateControlError),
    #[error(transparent)]
    Lookahead(#[from] LookaheadError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

pub type EncodeResult<T> = Result<T, EncodeError>;

/// Trait for representing pending encoder output.
pub trait BackendPromise {
    type Output;

    /// Return coded result of the processing. Blocks if processing is not finished yet.
    fn sync(self) -> BackendResult<Self::Output>;

    /// Return true whenever the underlaying processing is done
    fn is_ready(&self) -> bool;
}

pub struct ReadyPromise<T>(T);

impl<T> From<T> for ReadyPromise<T> {
    fn from(value: T) -> Self {
        ReadyPromise(value)
    }
}

impl<T> BackendPromise for ReadyPromise<T> {
    type Output = T;

    fn sync(self) -> BackendResult<Self::Output> {
        Ok(self.0)
    }

    fn is_ready(&self) -> bool {
        true
    }
}

/// Bitstream and statistics of a picture, as reported by the hardware.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EncodeStats {
    pub bitstream: Vec<u8>,
    pub non_zero_count: u32,
    pub qp_sum: u64,
    pub qp_count: u32,
    /// Number of 8x8 blocks coded as intra.
    pub intra_cu8_count: u32,
    /// Number of 8x8 blocks coded as skip.
    pub skip_cu8_count: u32,
    pub rd_cost: f64,
}

impl EncodeStats {
    fn picture_stats(&self) -> PictureStats {
        PictureStats {
            byte_count: self.bitstream.len(),
            non_zero_count: self.non_zero_count,
            qp_sum: self.qp_sum,
            qp_count: self.qp_count,
        }
    }
}

/// A picture ready for the hardware.
pub struct EncodeRequest {
    pub metadata: FrameMetadata,
    pub picture: Picture,
    pub decision: FrameDecision,
    pub qp: u32,
    /// Code the picture as a skipped picture.
    pub skip: bool,
    /// Per-CTB QP deltas, in the hardware part of the buffer.
    pub qp_map: Option<PooledBuffer>,
    pub layout: QpDeltaLayout,
    /// Fractional bits of the deltas in `qp_map`.
    pub qp_frac_bits: u32,
}

/// Hardware encode call.
pub trait EncodeBackend {
    type Promise: BackendPromise<Output = EncodeStats>;

    /// Submits `request` to the hardware. The backend keeps the references it holds on the
    /// request's buffers until the returned promise is synced.
    fn encode(&mut self, request: EncodeRequest) -> BackendResult<Self::Promise>;
}

/// Stateless video encoder interface.
pub trait StatelessVideoEncoder<Handle> {
    /// Changes dynamic parameters (aka [`Tunings`]) of the encoded stream. The change applies
    /// from the next encoded picture.
    ///
    /// Note: Currently changing the variant of [`crate::encoder::RateControl`] is not supported.
    fn tune(&mut self, tunings: Tunings) -> EncodeResult<()>;

    /// Enqueues the frame for encoding. The encoder is not required to immediately start
    /// processing the frame and yield output bitstream. It holds frames until a whole mini-GOP
    /// can be coded, and the look-ahead holds frames until it has analysed far enough.
    fn encode(&mut self, meta: FrameMetadata, handle: Handle) -> EncodeResult<()>;

    /// Drains the encoder. This means that encoder is required to finish processing of all the
    /// frames in the internal queue and yield output bitstream by the end of the call. The output
    /// bitstream then can be polled using [`poll`] function.
    ///
    /// [`poll`]: StatelessVideoEncoder::poll
    fn drain(&mut self) -> EncodeResult<()>;

    /// Polls on the encoder for the available output bitstream with compressed frames that where
    /// submitted with [`encode`].
    ///
    /// The call may also trigger a further processing aside of returning output. Therefore it
    /// *recommended* that this function is called frequently.
    ///
    /// [`encode`]: StatelessVideoEncoder::encode
    fn poll(&mut self) -> EncodeResult<Option<CodedPicture>>;
}

pub fn simple_encode_loop<E, H, P>(
    encoder: &mut E,
    frame_producer: &mut P,
    mut coded_consumer: impl FnMut(CodedPicture),
) -> EncodeResult<()>
where
    E: StatelessVideoEncoder<H>,
    P: Iterator<Item = (FrameMetadata, H)>,
{
    for (meta, handle) in frame_producer.by_ref() {
        encoder.encode(meta, handle)?;
        while let Some(coded) = encoder.poll()? {
            coded_consumer(coded);
        }
    }

    encoder.drain()?;
    while let Some(coded) = encoder.poll()? {
        coded_consumer(coded);
    }

    Ok(())
}

/// Mini-GOP decisions taken in the encode thread, without look-ahead.
struct DirectFrontend {
    predictor: MiniGopPredictor,
    queue: VecDeque<(FrameMetadata, Picture)>,
}

/// Where the pictures get their [`FrameDecision`] from.
enum Frontend {
    Lookahead(Lookahead),
    Direct(DirectFrontend),
}

impl Frontend {
    fn direct(config: &EncoderConfig) -> Self {
        Frontend::Direct(DirectFrontend {
            predictor: MiniGopPredictor::new(&config.gop, config.resolution),
            queue: VecDeque::new(),
        })
    }

    fn new(config: &EncoderConfig) -> EncodeResult<Self> {
        match config.lookahead {
            Some(_) => Ok(Frontend::Lookahead(Lookahead::new(config)?)),
            None => Ok(Self::direct(config)),
        }
    }
}

/// Look-ahead results attached to a picture.
struct LookaheadData<'a> {
    qp_offset: f32,
    qp_delta: Option<&'a PooledBuffer>,
}

/// Encodes pictures through an [`EncodeBackend`], deciding their coding type and QP.
///
/// Pictures are grouped into mini-GOPs, by the look-ahead when enabled, and every mini-GOP is
/// submitted in coding order. The rate control is called before and after every picture, so a
/// picture is synced before the next one is submitted.
pub struct StatelessEncoder<B: EncodeBackend> {
    config: EncoderConfig,
    backend: B,
    rc: RateController,
    frontend: Frontend,
    /// Look-ahead jobs of the mini-GOP being collected, in display order.
    gop_jobs: Vec<LookaheadJob>,
    coded_queue: VecDeque<CodedPicture>,
    layout: QpDeltaLayout,
    /// QP-delta buffers for pictures that come without one.
    pool: BufferPool,
    /// Errors of pictures that could not be coded, reported one per call.
    failures: VecDeque<EncodeError>,
}

impl<B: EncodeBackend> StatelessEncoder<B> {
    pub fn new(config: EncoderConfig, backend: B) -> EncodeResult<Self> {
        let rc = RateController::new(&config)?;
        let frontend = Frontend::new(&config)?;
        let layout = QpDeltaLayout::new(config.num_ctbs());

        log::debug!(
            "encoder for {}x{} {:?}, look-ahead {}",
            config.resolution.width,
            config.resolution.height,
            config.codec,
            if config.lookahead.is_some() { "on" } else { "off" }
        );

        Ok(Self {
            pool: BufferPool::new(ENCODER_POOL_SIZE, layout.block_size(), ENCODER_POOL_BUS_BASE),
            config,
            backend,
            rc,
            frontend,
            gop_jobs: Vec::new(),
            coded_queue: VecDeque::new(),
            layout,
            failures: VecDeque::new(),
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn rate_controller(&self) -> &RateController {
        &self.rc
    }

    /// Whether pictures currently go through the look-ahead.
    pub fn uses_lookahead(&self) -> bool {
        matches!(self.frontend, Frontend::Lookahead(_))
    }

    /// Decides the QP of one picture, has the backend encode it and feeds the result back.
    fn encode_picture(
        &mut self,
        metadata: FrameMetadata,
        picture: Picture,
        decision: &FrameDecision,
        lookahead: Option<LookaheadData<'_>>,
    ) -> EncodeResult<()> {
        let lookahead_deltas = lookahead
            .as_ref()
            .and_then(|la| la.qp_delta)
            .map(|buffer| self.layout.read_lookahead(&buffer.map()));
        let ctb_enabled = self.rc.ctb().is_enabled();
        let complexity = ctb_enabled.then(|| ctb_activity(&picture, self.config.ctb_size()));

        let rc_picture = RcPicture {
            lookahead_qp_offset: lookahead.as_ref().map_or(0.0, |la| la.qp_offset),
            lookahead_deltas: lookahead_deltas.as_deref(),
            ctb_complexity: complexity.as_deref(),
            ..RcPicture::from_decision(decision)
        };

        let mut ctb_map = vec![0i16; self.layout.num_ctbs];
        let rc_decision = self.rc.before_picture(
            metadata.time_increment,
            &rc_picture,
            ctb_enabled.then_some(ctb_map.as_mut_slice()),
        )?;

        let qp_map = if ctb_enabled {
            let buffer = match lookahead.as_ref().and_then(|la| la.qp_delta) {
                Some(buffer) => buffer.clone(),
                None => match self.pool.acquire() {
                    Ok(buffer) => buffer,
                    Err(e) => {
                        self.rc.abandon_picture();
                        return Err(e.into());
                    }
                },
            };
            self.layout.write_hw(&mut buffer.map_mut(), &ctb_map);
            Some(buffer)
        } else {
            None
        };

        let request = EncodeRequest {
            metadata: metadata.clone(),
            picture,
            decision: decision.clone(),
            qp: rc_decision.qp_hdr,
            skip: rc_decision.skip,
            qp_map,
            layout: self.layout,
            qp_frac_bits: self.rc.ctb().config().qp_frac_bits,
        };

        let stats = match self.backend.encode(request).and_then(BackendPromise::sync) {
            Ok(stats) => stats,
            Err(e) => {
                log::error!("backend failed on picture {}: {}", metadata.timestamp, e);
                self.rc.abandon_picture();
                return Err(e.into());
            }
        };

        let status = self.rc.after_picture(&stats.picture_stats())?;
        let dropped = matches!(status, RcStatus::Overflow { dropped: true, .. });
        if dropped {
            log::debug!("picture {} dropped after overflowing the buffer", metadata.timestamp);
        }

        if let Frontend::Direct(direct) = &mut self.frontend {
            let (cols, rows) = self.config.resolution.blocks(8);
            let num_cu8 = f64::from((cols * rows).max(1));
            let gop_stats = GopFrameStats {
                coding_type: decision.coding_type,
                intra_ratio: f64::from(stats.intra_cu8_count) / num_cu8,
                skip_ratio: f64::from(stats.skip_cu8_count) / num_cu8,
                cost: (stats.bitstream.len() * 8) as f64,
            };
            direct.predictor.accumulate(Some(&gop_stats), decision);
        }

        log::trace!(
            "coded picture {}: {:?} qp={} {} bytes",
            metadata.timestamp,
            decision.coding_type,
            rc_decision.qp_hdr,
            stats.bitstream.len()
        );

        self.coded_queue.push_back(CodedPicture {
            metadata,
            coding_type: decision.coding_type,
            temporal_id: decision.temporal_id,
            qp: rc_decision.qp_hdr,
            skipped: rc_decision.skip || dropped,
            bitstream: if dropped { Vec::new() } else { stats.bitstream },
        });

        Ok(())
    }

    /// Encodes the mini-GOPs the direct frontend can decide.
    fn process_direct(&mut self, flushing: bool) -> EncodeResult<()> {
        loop {
            let Frontend::Direct(direct) = &mut self.frontend else {
                return Ok(());
            };

            let keyframe_at = direct.queue.iter().position(|(meta, _)| meta.force_keyframe);
            let Some(gop) = direct
                .predictor
                .decide(direct.queue.len(), keyframe_at, flushing)
            else {
                return Ok(());
            };

            let order = gop.coding_order();
            let decisions = gop.into_decisions();
            let mut pictures = direct
                .queue
                .drain(..decisions.len())
                .map(Some)
                .collect::<Vec<_>>();

            for idx in order {
                let (meta, picture) = pictures[idx]
                    .take()
                    .ok_or(EncodeError::InvalidInternalState)?;
                let timestamp = meta.timestamp;
                if let Err(e) = self.encode_picture(meta, picture, &decisions[idx], None) {
                    self.picture_failed(timestamp, &decisions[idx], e);
                }
            }
        }
    }

    /// Records a picture lost in the backend. The rest of its mini-GOP is still coded.
    fn picture_failed(&mut self, timestamp: u64, decision: &FrameDecision, error: EncodeError) {
        log::error!("picture {} lost: {}", timestamp, error);
        if let Frontend::Direct(direct) = &mut self.frontend {
            direct.predictor.accumulate(None, decision);
        }
        self.failures.push_back(error);
    }

    fn take_failure(&mut self) -> EncodeResult<()> {
        match self.failures.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Encodes the collected look-ahead mini-GOP.
    fn encode_lookahead_gop(&mut self) -> EncodeResult<()> {
        let jobs = std::mem::take(&mut self.gop_jobs);
        let mut order = (0..jobs.len()).collect::<Vec<_>>();
        order.sort_by_key(|i| jobs[*i].decision.as_ref().map_or(0, |d| d.gop_pic_idx));

        let mut result = Ok(());
        for idx in order {
            let job = &jobs[idx];
            let Some(decision) = job.decision.as_ref() else {
                result = Err(EncodeError::InvalidInternalState);
                break;
            };
            if let Err(e) = &job.status {
                log::warn!("frame {} was not analysed: {}", job.frame_num, e);
            }
            let lookahead = LookaheadData {
                qp_offset: job.qp_offset,
                qp_delta: job.qp_delta.as_ref(),
            };
            if let Err(e) = self.encode_picture(
                job.meta.clone(),
                job.picture.clone(),
                decision,
                Some(lookahead),
            ) {
                self.picture_failed(job.meta.timestamp, decision, e);
            }
        }

        for job in jobs {
            match &self.frontend {
                Frontend::Lookahead(lookahead) => lookahead.release(job),
                Frontend::Direct(_) => drop(job),
            }
        }

        result
    }

    /// Drops the look-ahead after it failed and hands every picture it still holds to the direct
    /// frontend.
    fn fall_back(
        &mut self,
        failed: Option<LookaheadJob>,
        error: LookaheadError,
    ) -> EncodeResult<()> {
        log::warn!("look-ahead failed, continuing without it: {}", error);

        let mut jobs = std::mem::take(&mut self.gop_jobs);
        jobs.extend(failed);

        let previous = std::mem::replace(&mut self.frontend, Frontend::direct(&self.config));
        if let Frontend::Lookahead(lookahead) = previous {
            lookahead.terminate(Some(error));
            while let Some(job) = lookahead.get_output(false) {
                jobs.push(job);
            }
        }

        if let Frontend::Direct(direct) = &mut self.frontend {
            direct
                .queue
                .extend(jobs.into_iter().map(|job| (job.meta, job.picture)));
        }

        self.process_direct(false)
    }

    /// Takes one job out of the look-ahead, encoding its mini-GOP once complete. Returns `false`
    /// if no job was available.
    fn pump_lookahead(&mut self, mode: BlockingMode, flush: bool) -> EncodeResult<bool> {
        let Frontend::Lookahead(lookahead) = &self.frontend else {
            return Ok(false);
        };

        let job = match (flush, mode) {
            (true, _) => lookahead.get_output(true),
            (false, BlockingMode::Blocking) => lookahead.get_output(false),
            (false, BlockingMode::NonBlocking) => lookahead.try_get_output(),
        };
        let Some(job) = job else {
            return Ok(false);
        };

        let failed = job.decision.is_none()
            || (job.status.is_err() && lookahead.state() == LookaheadState::Error);
        if failed {
            let error = lookahead
                .error()
                .or_else(|| job.status.clone().err())
                .unwrap_or(LookaheadError::Terminated);
            self.fall_back(Some(job), error)?;
            return Ok(true);
        }

        self.gop_jobs.push(job);
        let gop_size = self.gop_jobs[0]
            .decision
            .as_ref()
            .map_or(1, |d| d.gop_size as usize);
        if self.gop_jobs.len() >= gop_size {
            self.encode_lookahead_gop()?;
        }

        Ok(true)
    }

    fn check_picture(&self, picture: &Picture) -> EncodeResult<()> {
        if picture.resolution() != self.config.resolution || !picture.is_complete() {
            return Err(EncodeError::InvalidPicture {
                expected: self.config.resolution,
                actual: picture.resolution(),
            });
        }
        Ok(())
    }
}

impl<B: EncodeBackend> StatelessVideoEncoder<Picture> for StatelessEncoder<B> {
    fn tune(&mut self, tunings: Tunings) -> EncodeResult<()> {
        self.rc.tune(&tunings)?;
        Ok(())
    }

    fn encode(&mut self, meta: FrameMetadata, picture: Picture) -> EncodeResult<()> {
        log::trace!(
            "encode: timestamp={} keyframe={}",
            meta.timestamp,
            meta.force_keyframe
        );
        self.check_picture(&picture)?;

        loop {
            let submitted = match &self.frontend {
                Frontend::Lookahead(lookahead) => {
                    lookahead.try_add_picture(meta.clone(), picture.clone())
                }
                Frontend::Direct(_) => break,
            };

            match submitted {
                Ok(()) => {
                    // Take whatever the look-ahead has ready.
                    while self.pump_lookahead(BlockingMode::NonBlocking, false)? {}
                    return self.take_failure();
                }
                Err(LookaheadError::QueueFull) => {
                    self.pump_lookahead(BlockingMode::Blocking, false)?;
                }
                Err(e) => {
                    // Jobs emitted before the failure are still good, encode them first.
                    log::warn!("look-ahead refused picture {}: {}", meta.timestamp, e);
                    while self.uses_lookahead() {
                        if !self.pump_lookahead(BlockingMode::Blocking, false)? {
                            self.fall_back(None, e.clone())?;
                        }
                    }
                }
            }
        }

        if let Frontend::Direct(direct) = &mut self.frontend {
            direct.queue.push_back((meta, picture));
        }
        self.process_direct(false)?;
        self.take_failure()
    }

    fn drain(&mut self) -> EncodeResult<()> {
        log::trace!("draining the encoder");

        while self.pump_lookahead(BlockingMode::Blocking, true)? {}
        if !self.gop_jobs.is_empty() {
            log::error!("{} look-ahead jobs left after the flush", self.gop_jobs.len());
            return Err(EncodeError::InvalidInternalState);
        }
        if self.uses_lookahead() {
            // A flushed look-ahead does not accept pictures anymore.
            self.frontend = Frontend::new(&self.config)?;
        }

        self.process_direct(true)?;
        self.take_failure()
    }

    fn poll(&mut self) -> EncodeResult<Option<CodedPicture>> {
        while self.pump_lookahead(BlockingMode::NonBlocking, false)? {}
        self.take_failure()?;
        Ok(self.coded_queue.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::SyntheticBackend;
    use crate::encoder::tests::gen_test_sequence;
    use crate::encoder::CodingType;
    use crate::encoder::RateControl;
    use crate::gop::GopConfig;
    use crate::gop::GopSize;
    use crate::lookahead::LookaheadConfig;
    use crate::rate_control::ctb::CtbRcMode;

    const RESOLUTION: Resolution = Resolution {
        width: 320,
        height: 240,
    };

    fn config(gop_size: usize, lookahead: Option<LookaheadConfig>) -> EncoderConfig {
        EncoderConfig {
            resolution: RESOLUTION,
            rate_control: RateControl::ConstantBitrate(1_000_000),
            gop: GopConfig {
                size: GopSize::Fixed(gop_size),
                ..Default::default()
            },
            lookahead,
            ..Default::default()
        }
    }

    fn lookahead_config(depth: usize) -> Option<LookaheadConfig> {
        Some(LookaheadConfig {
            depth,
            me_range: 2,
            ..Default::default()
        })
    }

    fn encode_all(
        encoder: &mut StatelessEncoder<SyntheticBackend>,
        count: u64,
    ) -> Vec<CodedPicture> {
        let mut coded = Vec::new();
        let mut producer = gen_test_sequence(RESOLUTION, count);
        simple_encode_loop(encoder, &mut producer, |c| coded.push(c)).unwrap();
        coded
    }

    fn timestamps(coded: &[CodedPicture]) -> Vec<u64> {
        let mut timestamps = coded.iter().map(|c| c.metadata.timestamp).collect::<Vec<_>>();
        timestamps.sort_unstable();
        timestamps
    }

    #[test]
    fn direct_mode_codes_mini_gops_in_coding_order() {
        let config = config(4, None);
        let backend = SyntheticBackend::new(&config);
        let mut encoder = StatelessEncoder::new(config, backend).unwrap();

        let coded = encode_all(&mut encoder, 9);
        assert_eq!(timestamps(&coded), (0..9).collect::<Vec<_>>());

        assert_eq!(coded[0].coding_type, CodingType::Intra);
        // The anchor of the first mini-GOP comes right after the intra picture.
        assert_eq!(coded[1].metadata.timestamp, 4);
        assert_eq!(coded[1].coding_type, CodingType::Predicted);
        assert!(coded[2..5]
            .iter()
            .all(|c| c.coding_type == CodingType::Bipredicted));
        assert_eq!(encoder.rate_controller().num_pictures(), 9);
    }

    #[test]
    fn lookahead_mode_codes_every_picture() {
        let config = config(4, lookahead_config(4));
        let backend = SyntheticBackend::new(&config);
        let mut encoder = StatelessEncoder::new(config, backend).unwrap();
        assert!(encoder.uses_lookahead());

        let coded = encode_all(&mut encoder, 12);
        assert_eq!(timestamps(&coded), (0..12).collect::<Vec<_>>());
        assert_eq!(coded[0].coding_type, CodingType::Intra);
        assert!(encoder.uses_lookahead());

        // The encoder keeps working after a drain.
        let more = encode_all(&mut encoder, 3);
        assert_eq!(more.len(), 3);
    }

    #[test]
    fn forced_keyframe() {
        let config = config(4, None);
        let backend = SyntheticBackend::new(&config);
        let mut encoder = StatelessEncoder::new(config, backend).unwrap();

        let mut producer = gen_test_sequence(RESOLUTION, 10).map(|(mut meta, picture)| {
            meta.force_keyframe = meta.timestamp == 6;
            (meta, picture)
        });
        let mut coded = Vec::new();
        simple_encode_loop(&mut encoder, &mut producer, |c| coded.push(c)).unwrap();

        let keyframe = coded.iter().find(|c| c.metadata.timestamp == 6).unwrap();
        assert_eq!(keyframe.coding_type, CodingType::Intra);
    }

    #[test]
    fn bitrate_converges() {
        let mut config = config(1, None);
        config.frame_rate.num = 30;
        config.frame_rate.denom = 1;
        config.gop.intra_period = 0;
        let backend = SyntheticBackend::new(&config);
        let mut encoder = StatelessEncoder::new(config, backend).unwrap();

        let coded = encode_all(&mut encoder, 120);
        let target = 1_000_000.0 / 30.0;
        let tail = &coded[90..];
        let average =
            tail.iter().map(|c| (c.bitstream.len() * 8) as f64).sum::<f64>() / tail.len() as f64;
        assert!(
            (average - target).abs() < 0.25 * target,
            "average {} target {}",
            average,
            target
        );
    }

    #[test]
    fn backend_failure_abandons_the_picture() {
        let config = config(1, None);
        let backend = SyntheticBackend::new(&config).fail_at(2);
        let mut encoder = StatelessEncoder::new(config, backend).unwrap();

        let mut sequence = gen_test_sequence(RESOLUTION, 5);
        for _ in 0..2 {
            let (meta, picture) = sequence.next().unwrap();
            encoder.encode(meta, picture).unwrap();
        }
        let (meta, picture) = sequence.next().unwrap();
        assert!(matches!(
            encoder.encode(meta, picture),
            Err(EncodeError::BackendError(_))
        ));

        for (meta, picture) in sequence {
            encoder.encode(meta, picture).unwrap();
        }
        assert_eq!(encoder.rate_controller().num_pictures(), 4);
    }

    /// Polls every coded picture, counting the lost ones.
    fn poll_all(
        encoder: &mut StatelessEncoder<SyntheticBackend>,
        coded: &mut Vec<CodedPicture>,
        lost: &mut usize,
    ) {
        loop {
            match encoder.poll() {
                Ok(Some(c)) => coded.push(c),
                Ok(None) => break,
                Err(EncodeError::BackendError(_)) => *lost += 1,
                Err(e) => panic!("unexpected error {:?}", e),
            }
        }
    }

    #[test]
    fn failed_anchor_keeps_the_rest_of_the_mini_gop() {
        for lookahead in [None, lookahead_config(4)] {
            let config = config(4, lookahead);
            // Submission 1 is the P anchor of the first mini-GOP, timestamp 4.
            let backend = SyntheticBackend::new(&config).fail_at(1);
            let mut encoder = StatelessEncoder::new(config, backend).unwrap();

            let mut coded = Vec::new();
            let mut lost = 0;
            for (meta, picture) in gen_test_sequence(RESOLUTION, 9) {
                match encoder.encode(meta, picture) {
                    Ok(()) => (),
                    Err(EncodeError::BackendError(_)) => lost += 1,
                    Err(e) => panic!("unexpected error {:?}", e),
                }
                poll_all(&mut encoder, &mut coded, &mut lost);
            }
            match encoder.drain() {
                Ok(()) => (),
                Err(EncodeError::BackendError(_)) => lost += 1,
                Err(e) => panic!("unexpected error {:?}", e),
            }
            poll_all(&mut encoder, &mut coded, &mut lost);

            assert_eq!(lost, 1);
            assert_eq!(timestamps(&coded), vec![0, 1, 2, 3, 5, 6, 7, 8]);
            assert_eq!(encoder.rate_controller().num_pictures(), 8);
        }
    }

    #[test]
    fn mismatched_picture_is_rejected() {
        let config = config(1, None);
        let backend = SyntheticBackend::new(&config);
        let mut encoder = StatelessEncoder::new(config, backend).unwrap();

        let picture = Picture::new(Resolution::from((16, 16)), vec![0u8; 256]);
        assert!(matches!(
            encoder.encode(FrameMetadata::default(), picture),
            Err(EncodeError::InvalidPicture { .. })
        ));
    }

    #[test]
    fn lookahead_failure_falls_back() {
        let config = config(4, lookahead_config(4));
        let backend = SyntheticBackend::new(&config);
        let mut encoder = StatelessEncoder::new(config, backend).unwrap();

        let mut coded = Vec::new();
        for (meta, picture) in gen_test_sequence(RESOLUTION, 16) {
            if meta.timestamp == 8 {
                if let Frontend::Lookahead(lookahead) = &encoder.frontend {
                    lookahead.terminate(Some(LookaheadError::Aborted("test".into())));
                }
            }
            encoder.encode(meta, picture).unwrap();
            while let Some(c) = encoder.poll().unwrap() {
                coded.push(c);
            }
        }
        encoder.drain().unwrap();
        while let Some(c) = encoder.poll().unwrap() {
            coded.push(c);
        }

        assert!(!encoder.uses_lookahead());
        assert_eq!(timestamps(&coded), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn ctb_maps_reach_the_backend() {
        let mut config = config(4, lookahead_config(4));
        config.rc.ctb.mode = CtbRcMode::Subjective;
        let backend = SyntheticBackend::new(&config);
        let mut encoder = StatelessEncoder::new(config, backend).unwrap();

        encode_all(&mut encoder, 9);
        let submitted = encoder.backend().submitted();
        assert_eq!(submitted.len(), 9);
        assert!(submitted.iter().all(|s| s.ctb_deltas.is_some()));
    }

    #[test]
    fn tuning_cannot_switch_modes() {
        let config = config(1, None);
        let backend = SyntheticBackend::new(&config);
        let mut encoder = StatelessEncoder::new(config, backend).unwrap();

        let tunings = Tunings {
            rate_control: RateControl::ConstantQuality(30),
            ..Default::default()
        };
        assert!(matches!(
            encoder.tune(tunings),
            Err(EncodeError::RateControl(RateControlError::UnsupportedTuning))
        ));
    }
}
