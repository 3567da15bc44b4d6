// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Look-ahead analysis of the upcoming pictures.
//!
//! Pictures submitted with [`Lookahead::add_picture`] are analysed by a worker thread: it cuts
//! them into mini-GOPs, estimates their coding cost on a half resolution copy and, once
//! `depth` pictures are analysed, runs the CU-tree over the window to derive QP offsets for the
//! oldest mini-GOP. Results come out of [`Lookahead::get_output`] in submission order, each with
//! the per-CTB QP deltas written into a buffer of the shared pool.

pub mod arena;
pub mod cost;
pub mod cutree;
mod worker;

use std::sync::Arc;
use std::sync::Mutex;
use std::thread::JoinHandle;

use thiserror::Error;

use crate::buffer_pool::BufferPool;
use crate::buffer_pool::PooledBuffer;
use crate::buffer_pool::QpDeltaLayout;
use crate::encoder::EncoderConfig;
use crate::encoder::FrameMetadata;
use crate::encoder::Picture;
use crate::gop::FrameDecision;
use crate::gop::MiniGopPredictor;
use crate::gop::MAX_GOP_SIZE;
use crate::lookahead::arena::FrameArena;
use crate::lookahead::cost::FrameCosts;
use crate::lookahead::cutree::CuTree;
use crate::lookahead::worker::run_cutree_thread;
use crate::lookahead::worker::AnalysisWorker;
use crate::lookahead::worker::Emitter;
use crate::lookahead::worker::Sink;
use crate::utils::lock;
use crate::utils::BoundedQueue;
use crate::BlockingMode;
use crate::Resolution;

/// Bus address reported for the first block of the look-ahead pool.
const LOOKAHEAD_POOL_BUS_BASE: u64 = 0x1000_0000;

#[derive(Clone, Debug, PartialEq)]
pub struct LookaheadConfig {
    /// Number of analysed pictures kept ahead of the oldest undelivered one.
    pub depth: usize,
    /// Motion search range in lowres pixels.
    pub me_range: u32,
    /// Strength of the CU-tree QP offsets. 0 disables the CU-tree.
    pub cutree_strength: f32,
    /// Runs the CU-tree in its own thread.
    pub cutree_worker: bool,
}

impl Default for LookaheadConfig {
    fn default() -> Self {
        Self {
            depth: 16,
            me_range: 4,
            cutree_strength: 2.0,
            cutree_worker: false,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LookaheadError {
    #[error("picture of {actual:?} does not match the stream resolution {expected:?}")]
    InvalidPicture {
        expected: Resolution,
        actual: Resolution,
    },
    #[error("frame {frame_num} refers to a frame that is not resident or not coded before it")]
    InvalidReference { frame_num: u64 },
    #[error("the look-ahead window refers to an evicted frame")]
    MissingFrame,
    #[error("all {0} slots of the frame arena are in use")]
    ArenaFull(usize),
    #[error("the QP-delta buffer pool has been closed")]
    PoolClosed,
    #[error("the job queue is full")]
    QueueFull,
    #[error("the look-ahead is not accepting pictures anymore")]
    NotAccepting,
    #[error("the look-ahead has been terminated")]
    Terminated,
    #[error("failed to spawn the look-ahead thread: {0}")]
    ThreadSpawn(String),
    #[error("invalid look-ahead configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("look-ahead aborted: {0}")]
    Aborted(String),
}

pub type LookaheadResult<T> = Result<T, LookaheadError>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LookaheadState {
    /// No picture submitted yet.
    Idle,
    Running,
    /// Pictures are not accepted anymore, the buffered ones are being analysed.
    Flushing,
    /// A fault stopped the analysis. Buffered jobs come out with an error status.
    Error,
    Terminated,
}

/// A picture going through the look-ahead.
#[derive(Debug)]
pub struct LookaheadJob {
    /// Submission index.
    pub frame_num: u64,
    pub meta: FrameMetadata,
    pub picture: Picture,
    /// How the picture is to be coded. Only missing if the look-ahead aborted before deciding.
    pub decision: Option<FrameDecision>,
    pub costs: Option<FrameCosts>,
    /// Frame-level QP offset from the CU-tree.
    pub qp_offset: f32,
    /// QP-delta map, laid out as described by [`QpDeltaLayout`].
    pub qp_delta: Option<PooledBuffer>,
    pub status: Result<(), LookaheadError>,
}

impl LookaheadJob {
    fn new(frame_num: u64, meta: FrameMetadata, picture: Picture) -> Self {
        Self {
            frame_num,
            meta,
            picture,
            decision: None,
            costs: None,
            qp_offset: 0.0,
            qp_delta: None,
            status: Ok(()),
        }
    }
}

struct Control {
    state: LookaheadState,
    error: Option<LookaheadError>,
    next_frame_num: u64,
}

/// State shared between the caller and the worker threads.
pub(crate) struct Shared {
    control: Mutex<Control>,
    jobs: BoundedQueue<LookaheadJob>,
    output: BoundedQueue<LookaheadJob>,
    pool: BufferPool,
}

impl Shared {
    pub(crate) fn new(depth: usize, pool: BufferPool) -> Self {
        Self {
            control: Mutex::new(Control {
                state: LookaheadState::Idle,
                error: None,
                next_frame_num: 0,
            }),
            jobs: BoundedQueue::new(depth),
            output: BoundedQueue::new(depth),
            pool,
        }
    }

    /// Why the buffered jobs must be given up, if they must.
    pub(crate) fn abort_reason(&self) -> Option<LookaheadError> {
        let control = lock(&self.control);
        match control.state {
            LookaheadState::Error => Some(
                control
                    .error
                    .clone()
                    .unwrap_or(LookaheadError::Terminated),
            ),
            LookaheadState::Terminated => Some(LookaheadError::Terminated),
            _ => None,
        }
    }

    /// Puts the look-ahead in error. The first error is the one reported.
    pub(crate) fn fail(&self, error: LookaheadError) {
        let mut control = lock(&self.control);
        if control.state == LookaheadState::Error {
            return;
        }
        log::error!("look-ahead failed: {}", error);
        control.state = LookaheadState::Error;
        control.error = Some(error);
        drop(control);
        self.jobs.close();
    }

    /// Called by the last thread to exit, once every job has been emitted.
    pub(crate) fn finish(&self) {
        {
            let mut control = lock(&self.control);
            if control.state != LookaheadState::Error {
                control.state = LookaheadState::Terminated;
            }
            log::debug!("look-ahead finished in state {:?}", control.state);
        }
        self.output.close();
    }

    pub(crate) fn jobs(&self) -> &BoundedQueue<LookaheadJob> {
        &self.jobs
    }

    pub(crate) fn output(&self) -> &BoundedQueue<LookaheadJob> {
        &self.output
    }

    pub(crate) fn pool(&self) -> &BufferPool {
        &self.pool
    }
}

/// Number of QP-delta buffers needed for a look-ahead of `depth` pictures: the output queue plus a
/// whole mini-GOP held by the encoder.
pub fn pool_capacity(depth: usize) -> usize {
    depth + MAX_GOP_SIZE
}

/// Frames resident at once: the analysed window, the mini-GOPs waiting for or in the CU-tree and
/// the anchor kept as a reference.
fn arena_capacity(depth: usize) -> usize {
    2 * depth + 3 * MAX_GOP_SIZE + 1
}

pub struct Lookahead {
    shared: Arc<Shared>,
    layout: QpDeltaLayout,
    depth: usize,
    workers: Vec<JoinHandle<()>>,
}

impl Lookahead {
    /// Starts the look-ahead threads for a stream configured by `config`, which must enable the
    /// look-ahead.
    pub fn new(config: &EncoderConfig) -> LookaheadResult<Self> {
        let la = config
            .lookahead
            .as_ref()
            .ok_or(LookaheadError::InvalidConfig("look-ahead not enabled"))?;
        if la.depth == 0 {
            return Err(LookaheadError::InvalidConfig("depth must be at least 1"));
        }
        if !la.cutree_strength.is_finite() || la.cutree_strength < 0.0 {
            return Err(LookaheadError::InvalidConfig("invalid CU-tree strength"));
        }

        let layout = QpDeltaLayout::new(config.num_ctbs());
        let capacity = config
            .buffer_pool_size
            .unwrap_or_else(|| pool_capacity(la.depth));
        // The encoder holds a mini-GOP of buffers while the output fills up.
        if capacity < pool_capacity(la.depth) {
            return Err(LookaheadError::InvalidConfig(
                "buffer pool smaller than the depth plus a mini-GOP",
            ));
        }
        let pool = BufferPool::new(capacity, layout.block_size(), LOOKAHEAD_POOL_BUS_BASE);

        let shared = Arc::new(Shared::new(la.depth, pool));

        let arena = Arc::new(Mutex::new(FrameArena::new(arena_capacity(la.depth))));
        let cutree = (la.cutree_strength > 0.0).then(|| {
            CuTree::new(la.cutree_strength, config.resolution, config.ctb_size())
        });
        let emitter = Emitter::new(Arc::clone(&shared), Arc::clone(&arena), cutree, layout);

        let mut workers = Vec::new();
        let sink = if la.cutree_worker {
            let batches = Arc::new(BoundedQueue::new(1));
            let handle = {
                let batches = Arc::clone(&batches);
                spawn("lookahead-cutree", move || run_cutree_thread(batches, emitter))
            };
            match handle {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    shared.fail(e.clone());
                    return Err(e);
                }
            }
            Sink::Thread(batches)
        } else {
            Sink::Inline(emitter)
        };

        let worker = AnalysisWorker::new(
            Arc::clone(&shared),
            arena,
            MiniGopPredictor::new(&config.gop, config.resolution),
            config.resolution,
            la,
            sink,
        );
        match spawn("lookahead", move || worker.run()) {
            Ok(handle) => workers.push(handle),
            Err(e) => {
                shared.fail(e.clone());
                shared.output.close();
                return Err(e);
            }
        }

        log::debug!(
            "look-ahead started: depth {}, {} QP-delta buffers, CU-tree strength {}",
            la.depth,
            capacity,
            la.cutree_strength
        );

        Ok(Self {
            shared,
            layout,
            depth: la.depth,
            workers,
        })
    }

    pub fn state(&self) -> LookaheadState {
        lock(&self.shared.control).state
    }

    /// The error that stopped the look-ahead, if any.
    pub fn error(&self) -> Option<LookaheadError> {
        lock(&self.shared.control).error.clone()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn layout(&self) -> QpDeltaLayout {
        self.layout
    }

    pub fn pool(&self) -> &BufferPool {
        &self.shared.pool
    }

    fn submit(
        &self,
        meta: FrameMetadata,
        picture: Picture,
        mode: BlockingMode,
    ) -> LookaheadResult<()> {
        let frame_num = {
            let mut control = lock(&self.shared.control);
            match control.state {
                LookaheadState::Idle | LookaheadState::Running => (),
                LookaheadState::Error => {
                    return Err(control.error.clone().unwrap_or(LookaheadError::Terminated))
                }
                LookaheadState::Flushing => return Err(LookaheadError::NotAccepting),
                LookaheadState::Terminated => return Err(LookaheadError::Terminated),
            }
            control.state = LookaheadState::Running;
            control.next_frame_num
        };

        log::trace!("submitting frame {} (timestamp {})", frame_num, meta.timestamp);

        let job = LookaheadJob::new(frame_num, meta, picture);
        match self.shared.jobs.push(job, mode) {
            Ok(()) => {
                lock(&self.shared.control).next_frame_num += 1;
                Ok(())
            }
            Err(_) if self.shared.jobs.is_closed() => {
                Err(self.shared.abort_reason().unwrap_or(LookaheadError::NotAccepting))
            }
            Err(_) => Err(LookaheadError::QueueFull),
        }
    }

    /// Queues a picture for analysis, waiting while the job queue is full.
    pub fn add_picture(&self, meta: FrameMetadata, picture: Picture) -> LookaheadResult<()> {
        self.submit(meta, picture, BlockingMode::Blocking)
    }

    /// Queues a picture for analysis, failing with [`LookaheadError::QueueFull`] instead of
    /// waiting.
    pub fn try_add_picture(&self, meta: FrameMetadata, picture: Picture) -> LookaheadResult<()> {
        self.submit(meta, picture, BlockingMode::NonBlocking)
    }

    /// Stops accepting pictures and has the worker analyse everything buffered.
    fn request_flush(&self) {
        let mut control = lock(&self.shared.control);
        if matches!(
            control.state,
            LookaheadState::Idle | LookaheadState::Running
        ) {
            log::debug!("flushing the look-ahead");
            control.state = LookaheadState::Flushing;
        }
        drop(control);
        self.shared.jobs.close();
    }

    /// Gets the oldest completed job, waiting for it. With `flush`, the pictures buffered so far
    /// are analysed without waiting for more input, and `None` is returned once they have all been
    /// delivered.
    pub fn get_output(&self, flush: bool) -> Option<LookaheadJob> {
        if flush {
            self.request_flush();
        }
        self.shared.output.pop(BlockingMode::Blocking)
    }

    /// Gets the oldest completed job if there is one.
    pub fn try_get_output(&self) -> Option<LookaheadJob> {
        self.shared.output.pop(BlockingMode::NonBlocking)
    }

    /// Gives the resources of a consumed job back.
    pub fn release(&self, mut job: LookaheadJob) {
        if let Some(buffer) = job.qp_delta.take() {
            self.shared.pool.release(buffer);
        }
    }

    /// Stops the look-ahead. Jobs still buffered are delivered with an error status. With an
    /// error, the look-ahead goes in error and the buffer pool is closed.
    pub fn terminate(&self, error: Option<LookaheadError>) {
        {
            let mut control = lock(&self.shared.control);
            match error {
                Some(error) if control.state != LookaheadState::Error => {
                    log::warn!("terminating the look-ahead: {}", error);
                    control.state = LookaheadState::Error;
                    control.error = Some(error);
                }
                Some(_) => (),
                None => {
                    if control.state != LookaheadState::Error {
                        control.state = LookaheadState::Terminated;
                    }
                }
            }
        }

        self.shared.jobs.close();
        if self.state() == LookaheadState::Error {
            self.shared.pool.close();
        }
    }
}

impl Drop for Lookahead {
    fn drop(&mut self) {
        if !self.shared.output.is_closed() {
            self.terminate(None);
        }
        // Nobody is going to read the remaining jobs.
        self.shared.output.close();
        self.shared.output.drain();
        self.shared.pool.close();

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("a look-ahead thread panicked");
            }
        }
    }
}

fn spawn<F>(name: &str, f: F) -> LookaheadResult<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|e| LookaheadError::ThreadSpawn(e.to_string()))
}
