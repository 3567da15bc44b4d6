// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use crate::buffer_pool::QpDeltaLayout;
use crate::encoder::CodingType;
use crate::gop::adaptive::GopFrameStats;
use crate::gop::FrameDecision;
use crate::gop::MiniGopPredictor;
use crate::gop::RefPic;
use crate::lookahead::arena::FrameArena;
use crate::lookahead::arena::FrameRef;
use crate::lookahead::cost::CostReference;
use crate::lookahead::cost::FrameCosts;
use crate::lookahead::cost::FrameInfo;
use crate::lookahead::cost::LowresFrame;
use crate::lookahead::cost::LowresPlane;
use crate::lookahead::cutree::CuTree;
use crate::lookahead::cutree::CuTreeOutput;
use crate::lookahead::LookaheadConfig;
use crate::lookahead::LookaheadError;
use crate::lookahead::LookaheadJob;
use crate::lookahead::Shared;
use crate::utils::lock;
use crate::utils::BoundedQueue;
use crate::BlockingMode;
use crate::Resolution;

/// Analysed mini-GOP handed over for the CU-tree and delivery.
pub(crate) struct Batch {
    /// Jobs in display order.
    jobs: Vec<LookaheadJob>,
    /// Arena entries of the jobs, `None` for the ones that could not be analysed.
    frames: Vec<Option<FrameRef>>,
    /// Every analysed frame at the time the batch was cut, starting with the batch itself.
    window: Vec<FrameRef>,
}

/// Where the analysis worker sends its batches.
pub(crate) enum Sink {
    Inline(Emitter),
    /// Batches go to the CU-tree thread.
    Thread(Arc<BoundedQueue<Batch>>),
}

impl Sink {
    /// Hands `batch` over. If the CU-tree thread is gone, the batches it left behind are given
    /// back in order, followed by `batch`.
    fn send(&mut self, batch: Batch) -> Result<(), Vec<Batch>> {
        match self {
            Sink::Inline(emitter) => {
                emitter.emit(batch);
                Ok(())
            }
            Sink::Thread(queue) => queue.push(batch, BlockingMode::Blocking).map_err(|batch| {
                let mut left = queue.drain();
                left.push(batch);
                left
            }),
        }
    }

    /// Ends the stream of batches. Returns the batches left behind by a CU-tree thread that exited
    /// early, in which case the output is still to be closed.
    fn finish(&mut self) -> Option<Vec<Batch>> {
        match self {
            Sink::Inline(emitter) => {
                emitter.finish();
                None
            }
            Sink::Thread(queue) => {
                let gone = queue.is_closed();
                queue.close();
                gone.then(|| queue.drain())
            }
        }
    }
}

/// Closes the batch queue when the CU-tree thread exits, panics included, so the analysis worker
/// does not wait on it.
struct BatchQueueGuard {
    batches: Arc<BoundedQueue<Batch>>,
    shared: Arc<Shared>,
}

impl Drop for BatchQueueGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.shared
                .fail(LookaheadError::Aborted("CU-tree thread panicked".to_string()));
        }
        self.batches.close();
    }
}

/// Body of the CU-tree thread.
pub(crate) fn run_cutree_thread(batches: Arc<BoundedQueue<Batch>>, mut emitter: Emitter) {
    let _guard = BatchQueueGuard {
        batches: Arc::clone(&batches),
        shared: Arc::clone(&emitter.shared),
    };

    while let Some(batch) = batches.pop(BlockingMode::Blocking) {
        emitter.emit(batch);
    }
    emitter.finish();
}

/// Runs the CU-tree over a batch and delivers its jobs.
pub(crate) struct Emitter {
    shared: Arc<Shared>,
    arena: Arc<Mutex<FrameArena>>,
    cutree: Option<CuTree>,
    layout: QpDeltaLayout,
    /// Anchor of the last delivered mini-GOP, still referenced by the next one.
    kept_anchor: Option<FrameRef>,
}

impl Emitter {
    pub(crate) fn new(
        shared: Arc<Shared>,
        arena: Arc<Mutex<FrameArena>>,
        cutree: Option<CuTree>,
        layout: QpDeltaLayout,
    ) -> Self {
        Self {
            shared,
            arena,
            cutree,
            layout,
            kept_anchor: None,
        }
    }

    /// Runs the CU-tree for the frames of `batch` and drops the frames nothing refers to anymore.
    fn run_cutree(&mut self, batch: &Batch) -> Vec<Option<CuTreeOutput>> {
        let mut outputs = vec![None; batch.jobs.len()];
        let mut arena = lock(&self.arena);

        if let (Some(cutree), None) = (&self.cutree, self.shared.abort_reason()) {
            let targets = batch.frames.iter().flatten().copied().collect::<Vec<_>>();
            match cutree.run(&arena, &batch.window, &targets) {
                Ok(results) => {
                    for result in results {
                        let idx = batch.frames.iter().position(|f| *f == Some(result.frame));
                        if let Some(idx) = idx {
                            outputs[idx] = Some(result);
                        }
                    }
                }
                Err(e) => self.shared.fail(e),
            }
        }

        let anchor = batch.frames.last().copied().flatten();
        for frame in batch.frames.iter().flatten() {
            if Some(*frame) != anchor {
                arena.remove(*frame);
            }
        }
        if let Some(previous) = self.kept_anchor.take() {
            arena.remove(previous);
        }
        self.kept_anchor = anchor;

        outputs
    }

    pub(crate) fn emit(&mut self, batch: Batch) {
        let outputs = self.run_cutree(&batch);

        for (mut job, output) in batch.jobs.into_iter().zip(outputs) {
            if !self.shared.output().wait_for_room() {
                log::debug!("output closed, dropping frame {}", job.frame_num);
                continue;
            }

            if job.status.is_ok() {
                if let Some(reason) = self.shared.abort_reason() {
                    job.status = Err(reason);
                }
            }

            if let Some(output) = output.filter(|_| job.status.is_ok()) {
                match self.shared.pool().acquire() {
                    Ok(buffer) => {
                        self.layout
                            .write_lookahead(&mut buffer.map_mut(), &output.ctb_deltas);
                        job.qp_offset = output.qp_offset;
                        job.qp_delta = Some(buffer);
                    }
                    Err(_) => {
                        self.shared.fail(LookaheadError::PoolClosed);
                        job.status = Err(self
                            .shared
                            .abort_reason()
                            .unwrap_or(LookaheadError::PoolClosed));
                    }
                }
            }

            log::trace!(
                "frame {} done, QP offset {:.2}, {}",
                job.frame_num,
                job.qp_offset,
                if job.status.is_ok() { "ok" } else { "failed" }
            );
            if let Err(job) = self.shared.output().push(job, BlockingMode::Blocking) {
                log::debug!("output closed, dropping frame {}", job.frame_num);
            }
        }
    }

    pub(crate) fn finish(&mut self) {
        lock(&self.arena).clear();
        self.kept_anchor = None;
        self.shared.finish();
    }
}

struct PendingFrame {
    job: LookaheadJob,
    plane: Option<Arc<LowresPlane>>,
}

struct AnalysedGop {
    jobs: Vec<LookaheadJob>,
    frames: Vec<Option<FrameRef>>,
}

/// Closest resident reference among the used `refs` on one side of `frame_num`.
fn find_reference(
    arena: &FrameArena,
    frame_num: u64,
    refs: &[RefPic],
    past: bool,
) -> Option<CostReference> {
    let mut deltas = refs
        .iter()
        .filter(|r| r.used_by_cur && r.delta_poc != 0 && (r.delta_poc < 0) == past)
        .map(|r| r.delta_poc)
        .collect::<Vec<_>>();
    deltas.sort_by_key(|d| d.unsigned_abs());

    deltas.into_iter().find_map(|delta| {
        let frame = arena.find(frame_num.checked_add_signed(i64::from(delta))?)?;
        let plane = Arc::clone(arena.get(frame)?.plane());
        Some(CostReference {
            frame,
            distance: delta.unsigned_abs(),
            plane,
        })
    })
}

/// Decides the mini-GOPs and estimates the cost of their frames.
pub(crate) struct AnalysisWorker {
    shared: Arc<Shared>,
    arena: Arc<Mutex<FrameArena>>,
    predictor: MiniGopPredictor,
    resolution: Resolution,
    me_range: u32,
    depth: usize,
    sink: Sink,
    undecided: VecDeque<PendingFrame>,
    analysed: VecDeque<AnalysedGop>,
    analysed_count: usize,
    coding_idx: u64,
    input_ended: bool,
}

impl AnalysisWorker {
    pub(crate) fn new(
        shared: Arc<Shared>,
        arena: Arc<Mutex<FrameArena>>,
        predictor: MiniGopPredictor,
        resolution: Resolution,
        config: &LookaheadConfig,
        sink: Sink,
    ) -> Self {
        Self {
            shared,
            arena,
            predictor,
            resolution,
            me_range: config.me_range,
            depth: config.depth,
            sink,
            undecided: VecDeque::new(),
            analysed: VecDeque::new(),
            analysed_count: 0,
            coding_idx: 0,
            input_ended: false,
        }
    }

    pub(crate) fn run(mut self) {
        loop {
            if let Some(reason) = self.shared.abort_reason() {
                self.abort(reason);
                break;
            }

            let drained = self.input_ended && self.undecided.is_empty();
            if self.analysed_count >= self.depth || (drained && !self.analysed.is_empty()) {
                self.send_head();
                continue;
            }
            if self.analyse_next_gop() {
                continue;
            }
            if drained {
                break;
            }

            match self.shared.jobs().pop(BlockingMode::Blocking) {
                Some(job) => self.accept(job),
                None => {
                    log::debug!("end of the look-ahead input");
                    self.input_ended = true;
                }
            }
        }
    }

    fn accept(&mut self, mut job: LookaheadJob) {
        let plane = match LowresPlane::from_picture(&job.picture, self.resolution) {
            Ok(plane) => Some(Arc::new(plane)),
            Err(e) => {
                log::warn!("frame {} cannot be analysed: {}", job.frame_num, e);
                job.status = Err(e);
                None
            }
        };
        self.undecided.push_back(PendingFrame { job, plane });
    }

    fn analyse_frame(
        &mut self,
        frame_num: u64,
        decision: &FrameDecision,
        plane: Arc<LowresPlane>,
    ) -> Result<(FrameRef, FrameCosts), LookaheadError> {
        let info = FrameInfo::new(frame_num, self.coding_idx, decision);

        let (p0, p1) = {
            let arena = lock(&self.arena);
            match decision.coding_type {
                CodingType::Intra => (None, None),
                CodingType::Predicted => (
                    find_reference(&arena, frame_num, &decision.refs, true),
                    None,
                ),
                CodingType::Bipredicted => {
                    let past = find_reference(&arena, frame_num, &decision.refs, true);
                    let future = find_reference(&arena, frame_num, &decision.refs, false);
                    match past {
                        Some(past) => (Some(past), future),
                        None => (future, None),
                    }
                }
            }
        };

        let frame = LowresFrame::analyse(info, plane, p0, p1, self.me_range);
        let costs = frame.costs();
        let frame = lock(&self.arena).insert(frame)?;

        Ok((frame, costs))
    }

    /// Decides and analyses the next mini-GOP. Returns `false` if more pictures are needed.
    fn analyse_next_gop(&mut self) -> bool {
        let keyframe_at = self
            .undecided
            .iter()
            .position(|p| p.job.meta.force_keyframe);
        let Some(gop) = self
            .predictor
            .decide(self.undecided.len(), keyframe_at, self.input_ended)
        else {
            return false;
        };

        let size = gop.size();
        let order = gop.coding_order();
        let decisions = gop.into_decisions();
        let mut pending = self.undecided.drain(..size).collect::<Vec<_>>();
        let mut frames = vec![None; size];

        for idx in order {
            let decision = &decisions[idx];
            let frame_num = pending[idx].job.frame_num;

            if let Some(plane) = pending[idx].plane.take() {
                match self.analyse_frame(frame_num, decision, plane) {
                    Ok((frame, costs)) => {
                        frames[idx] = Some(frame);
                        pending[idx].job.costs = Some(costs);
                    }
                    Err(e) => {
                        log::warn!("analysis of frame {} failed: {}", frame_num, e);
                        pending[idx].job.status = Err(e);
                    }
                }
            }
            self.coding_idx += 1;

            let stats = pending[idx].job.costs.map(|costs| GopFrameStats {
                coding_type: decision.coding_type,
                intra_ratio: costs.intra_ratio(),
                skip_ratio: costs.skip_ratio(),
                cost: costs.best as f64,
            });
            self.predictor.accumulate(stats.as_ref(), decision);
        }

        let jobs = pending
            .into_iter()
            .zip(decisions)
            .map(|(p, decision)| {
                let mut job = p.job;
                job.decision = Some(decision);
                job
            })
            .collect();

        self.analysed_count += size;
        self.analysed.push_back(AnalysedGop { jobs, frames });
        true
    }

    fn send_head(&mut self) {
        let Some(head) = self.analysed.pop_front() else {
            return;
        };
        self.analysed_count -= head.jobs.len();

        let window = head
            .frames
            .iter()
            .chain(self.analysed.iter().flat_map(|g| g.frames.iter()))
            .flatten()
            .copied()
            .collect();

        self.deliver(Batch {
            jobs: head.jobs,
            frames: head.frames,
            window,
        });
    }

    fn deliver(&mut self, batch: Batch) {
        if let Err(left) = self.sink.send(batch) {
            self.deliver_unprocessed(left);
        }
    }

    /// Puts the jobs of batches the CU-tree thread never took straight in the output, with an
    /// error status.
    fn deliver_unprocessed(&self, batches: Vec<Batch>) {
        self.shared
            .fail(LookaheadError::Aborted("CU-tree thread exited".to_string()));
        let reason = self
            .shared
            .abort_reason()
            .unwrap_or(LookaheadError::Terminated);

        for mut job in batches.into_iter().flat_map(|b| b.jobs) {
            if job.status.is_ok() {
                job.status = Err(reason.clone());
            }
            if let Err(job) = self.shared.output().push(job, BlockingMode::Blocking) {
                log::debug!("output closed, dropping frame {}", job.frame_num);
            }
        }
    }

    /// Delivers everything buffered, including what is left in the job queue, with `reason` as
    /// their status.
    fn abort(&mut self, reason: LookaheadError) {
        let mut jobs = self
            .analysed
            .drain(..)
            .flat_map(|g| g.jobs)
            .chain(self.undecided.drain(..).map(|p| p.job))
            .collect::<Vec<_>>();
        // Aborting closes the job queue, so this only waits for a push racing with the abort.
        while let Some(job) = self.shared.jobs().pop(BlockingMode::Blocking) {
            jobs.push(job);
        }
        self.analysed_count = 0;

        log::debug!("aborting {} look-ahead jobs: {}", jobs.len(), reason);

        for job in &mut jobs {
            if job.status.is_ok() {
                job.status = Err(reason.clone());
            }
        }
        if !jobs.is_empty() {
            let frames = vec![None; jobs.len()];
            self.deliver(Batch {
                jobs,
                frames,
                window: Vec::new(),
            });
        }
    }
}

impl Drop for AnalysisWorker {
    // Also reached when the worker panics, so that readers are not left waiting.
    fn drop(&mut self) {
        if let Some(left) = self.sink.finish() {
            self.deliver_unprocessed(left);
            self.shared.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::BufferPool;
    use crate::encoder::tests::gen_test_sequence;
    use crate::gop::GopConfig;
    use crate::gop::GopSize;

    #[test]
    fn jobs_reach_the_output_when_the_cutree_thread_is_gone() {
        let resolution = Resolution::from((128, 64));
        let shared = Arc::new(Shared::new(8, BufferPool::new(16, 64, 0)));
        let arena = Arc::new(Mutex::new(FrameArena::new(64)));
        let gop = GopConfig {
            size: GopSize::Fixed(4),
            ..Default::default()
        };
        let batches = Arc::new(BoundedQueue::new(1));
        batches.close();

        for (n, (meta, picture)) in gen_test_sequence(resolution, 4).enumerate() {
            let job = LookaheadJob::new(n as u64, meta, picture);
            assert!(shared.jobs().push(job, BlockingMode::NonBlocking).is_ok());
        }
        shared.jobs().close();

        let config = LookaheadConfig {
            depth: 8,
            me_range: 2,
            ..Default::default()
        };
        AnalysisWorker::new(
            Arc::clone(&shared),
            arena,
            MiniGopPredictor::new(&gop, resolution),
            resolution,
            &config,
            Sink::Thread(batches),
        )
        .run();

        let mut frames = Vec::new();
        while let Some(job) = shared.output().pop(BlockingMode::NonBlocking) {
            assert!(job.status.is_err());
            frames.push(job.frame_num);
        }
        assert_eq!(frames, vec![0, 1, 2, 3]);
        assert!(shared.output().is_closed());
        assert!(shared.abort_reason().is_some());
    }
}
