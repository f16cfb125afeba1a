// Accelerator-aware unit scheduler
//
// A single coordinator (the thread calling `run`) owns the per-accelerator
// queues, admission gates and per-video progress. Each accelerator has its own
// job channel and its own worker threads, so a thread only ever loads models on
// one device. Workers report back over an event channel that only the
// coordinator reads, so no scheduler state is shared with workers.
//
// A unit's deadline starts when a worker picks it up. An overdue unit is
// cancelled and failed at once, but its slot stays taken until the worker
// actually returns.

use crate::config::{AcceleratorId, RunConfig};
use crate::error::{failure_kind, ExtractError};
use crate::ledger::ProcessingLedger;
use crate::pipeline::types::{
    ExtractedFrameSet, ProcessingUnit, RunProgress, UnitId, VideoKey, VideoState,
};
use crate::pipeline::worker::{CancelToken, UnitExecutor};
use anyhow::{anyhow, bail, Result};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Capacity-N counter bounding how many units of one accelerator run at once.
#[derive(Debug)]
pub struct AdmissionGate {
    capacity: usize,
    in_flight: usize,
    peak: usize,
}

impl AdmissionGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            in_flight: 0,
            peak: 0,
        }
    }

    pub fn try_acquire(&mut self) -> bool {
        if self.in_flight >= self.capacity {
            return false;
        }
        self.in_flight += 1;
        self.peak = self.peak.max(self.in_flight);
        true
    }

    pub fn release(&mut self) {
        debug_assert!(self.in_flight > 0, "release without acquire");
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn peak(&self) -> usize {
        self.peak
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub accelerators: Vec<AcceleratorId>,
    pub workers_per_accelerator: usize,
    /// Worker threads per accelerator. Normally `workers_per_accelerator`.
    pub threads_per_accelerator: usize,
    pub unit_timeout: Option<Duration>,
}

impl From<&RunConfig> for SchedulerOptions {
    fn from(config: &RunConfig) -> Self {
        Self {
            accelerators: config.accelerators.clone(),
            workers_per_accelerator: config.workers_per_accelerator,
            threads_per_accelerator: config.workers_per_accelerator,
            unit_timeout: config.unit_timeout,
        }
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct UnitFailure {
    pub unit: UnitId,
    pub video: VideoKey,
    pub segment: usize,
    pub accelerator: AcceleratorId,
    pub kind: String,
    pub error: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct VideoOutcome {
    pub video: VideoKey,
    pub state: VideoState,
    pub expected_units: usize,
    pub completed_units: usize,
    pub failed_units: usize,
    pub frames_written: usize,
    pub ledgered: bool,
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct RunOutcome {
    pub videos: Vec<VideoOutcome>,
    pub failures: Vec<UnitFailure>,
    /// Highest concurrent admission seen per accelerator.
    pub peak_in_flight: BTreeMap<String, usize>,
}

impl RunOutcome {
    pub fn done(&self) -> impl Iterator<Item = &VideoOutcome> {
        self.videos.iter().filter(|v| v.state == VideoState::Done)
    }
}

struct VideoProgress {
    expected: usize,
    completed: usize,
    failed: usize,
    frames: usize,
    state: VideoState,
    ledgered: bool,
}

struct Job {
    unit: ProcessingUnit,
    cancel: CancelToken,
}

enum WorkerEvent {
    Started(UnitId),
    Finished {
        unit: UnitId,
        result: Result<ExtractedFrameSet>,
    },
}

struct InFlight {
    unit: ProcessingUnit,
    cancel: CancelToken,
    /// Unset until a worker picks the unit up.
    deadline: Option<Instant>,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn spawn_workers(
    accelerator: AcceleratorId,
    count: usize,
    executor: &Arc<dyn UnitExecutor>,
    jobs: &Receiver<Job>,
    events: &Sender<WorkerEvent>,
) -> Result<Vec<JoinHandle<()>>> {
    (0..count)
        .map(|i| {
            let executor = executor.clone();
            let jobs = jobs.clone();
            let events = events.clone();
            thread::Builder::new()
                .name(format!("unit-worker-{}-{}", accelerator, i))
                .spawn(move || {
                    for job in jobs.iter() {
                        if events.send(WorkerEvent::Started(job.unit.id)).is_err() {
                            break;
                        }
                        let result = panic::catch_unwind(AssertUnwindSafe(|| {
                            executor.execute(&job.unit, &job.cancel)
                        }))
                        .unwrap_or_else(|payload| {
                            Err(ExtractError::Panicked(panic_message(payload.as_ref())).into())
                        });
                        let finished = WorkerEvent::Finished {
                            unit: job.unit.id,
                            result,
                        };
                        if events.send(finished).is_err() {
                            break;
                        }
                    }
                })
                .map_err(|e| anyhow!("Failed to spawn worker {} for {}: {}", i, accelerator, e))
        })
        .collect()
}

pub struct AcceleratorScheduler {
    options: SchedulerOptions,
    executor: Arc<dyn UnitExecutor>,
    progress: Arc<RunProgress>,
}

impl AcceleratorScheduler {
    pub fn new(
        options: SchedulerOptions,
        executor: Arc<dyn UnitExecutor>,
        progress: Arc<RunProgress>,
    ) -> Self {
        Self {
            options,
            executor,
            progress,
        }
    }

    /// Runs every unit to completion or failure and ledgers each video whose
    /// units all succeeded. Returns once no unit is queued or in flight.
    pub fn run(&self, units: Vec<ProcessingUnit>, ledger: &mut ProcessingLedger) -> Result<RunOutcome> {
        let mut coordinator = Coordinator::new(&self.options, &self.progress, units)?;
        if coordinator.remaining == 0 {
            coordinator.bar.finish_and_clear();
            self.progress.is_active.store(false, Ordering::Relaxed);
            return Ok(coordinator.into_outcome());
        }

        let (event_tx, event_rx) = channel::unbounded::<WorkerEvent>();
        let threads = self.options.threads_per_accelerator.max(1);
        let mut jobs = BTreeMap::new();
        let mut workers = Vec::new();
        for &accelerator in &self.options.accelerators {
            let (job_tx, job_rx) = channel::unbounded::<Job>();
            workers.extend(spawn_workers(
                accelerator,
                threads,
                &self.executor,
                &job_rx,
                &event_tx,
            )?);
            jobs.insert(accelerator, job_tx);
        }
        drop(event_tx);
        tracing::info!(
            "Scheduling {} units on {} accelerator(s), {} thread(s) each ({} admitted at once)",
            coordinator.remaining,
            self.options.accelerators.len(),
            threads,
            self.options.workers_per_accelerator
        );

        let result = coordinator
            .drive(&jobs, &event_rx, ledger)
            .and_then(|()| coordinator.drain_abandoned(&event_rx));

        drop(jobs);
        if coordinator.abandoned.is_empty() {
            for handle in workers {
                if handle.join().is_err() {
                    tracing::error!("Unit worker exited with a panic");
                }
            }
        } else {
            tracing::warn!(
                "Leaving {} timed-out unit(s) running on detached worker threads",
                coordinator.abandoned.len()
            );
        }

        coordinator.bar.finish_and_clear();
        self.progress.is_active.store(false, Ordering::Relaxed);
        result?;
        Ok(coordinator.into_outcome())
    }
}

struct Coordinator<'a> {
    unit_timeout: Option<Duration>,
    progress: &'a RunProgress,
    queues: BTreeMap<AcceleratorId, VecDeque<ProcessingUnit>>,
    gates: BTreeMap<AcceleratorId, AdmissionGate>,
    videos: BTreeMap<VideoKey, VideoProgress>,
    in_flight: HashMap<UnitId, InFlight>,
    /// Timed-out units whose worker has not returned yet. Each holds its slot.
    abandoned: HashMap<UnitId, AcceleratorId>,
    failures: Vec<UnitFailure>,
    remaining: usize,
    bar: ProgressBar,
}

impl<'a> Coordinator<'a> {
    fn new(
        options: &SchedulerOptions,
        progress: &'a RunProgress,
        units: Vec<ProcessingUnit>,
    ) -> Result<Self> {
        let mut queues: BTreeMap<AcceleratorId, VecDeque<ProcessingUnit>> = options
            .accelerators
            .iter()
            .map(|&id| (id, VecDeque::new()))
            .collect();
        let gates = options
            .accelerators
            .iter()
            .map(|&id| (id, AdmissionGate::new(options.workers_per_accelerator)))
            .collect();

        let mut videos: BTreeMap<VideoKey, VideoProgress> = BTreeMap::new();
        let remaining = units.len();
        for unit in units {
            let queue = match queues.get_mut(&unit.accelerator) {
                Some(queue) => queue,
                None => bail!(
                    "Unit {} of {} is pinned to unknown accelerator {}",
                    unit.id,
                    unit.video,
                    unit.accelerator
                ),
            };
            videos
                .entry(unit.video.clone())
                .or_insert(VideoProgress {
                    expected: 0,
                    completed: 0,
                    failed: 0,
                    frames: 0,
                    state: VideoState::Pending,
                    ledgered: false,
                })
                .expected += 1;
            queue.push_back(unit);
        }

        progress.total_units.store(remaining, Ordering::Relaxed);
        progress.videos_total.store(videos.len(), Ordering::Relaxed);
        for (&id, queue) in &queues {
            progress.update_accelerator(id, |a| a.queued = queue.len());
        }

        let bar = ProgressBar::new(remaining as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} units ({eta}) {msg}")?
                .progress_chars("#>-"),
        );

        Ok(Self {
            unit_timeout: options.unit_timeout,
            progress,
            queues,
            gates,
            videos,
            in_flight: HashMap::new(),
            abandoned: HashMap::new(),
            failures: Vec::new(),
            remaining,
            bar,
        })
    }

    fn drive(
        &mut self,
        jobs: &BTreeMap<AcceleratorId, Sender<Job>>,
        events: &Receiver<WorkerEvent>,
        ledger: &mut ProcessingLedger,
    ) -> Result<()> {
        while self.remaining > 0 {
            self.schedule_more(jobs)?;
            if self.in_flight.is_empty() && self.abandoned.is_empty() {
                bail!("{} units left but none can be admitted", self.remaining);
            }

            let next_deadline = self.in_flight.values().filter_map(|f| f.deadline).min();
            let event = match next_deadline {
                None => events.recv().map_err(|_| ExtractError::WorkerGone)?,
                Some(deadline) => {
                    let wait = deadline.saturating_duration_since(Instant::now());
                    match events.recv_timeout(wait) {
                        Ok(event) => event,
                        Err(RecvTimeoutError::Timeout) => {
                            self.expire_overdue(ledger);
                            continue;
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            return Err(ExtractError::WorkerGone.into())
                        }
                    }
                }
            };
            self.handle(event, ledger);
        }
        Ok(())
    }

    fn handle(&mut self, event: WorkerEvent, ledger: &mut ProcessingLedger) {
        match event {
            WorkerEvent::Started(id) => {
                if let Some(entry) = self.in_flight.get_mut(&id) {
                    entry.deadline = self.unit_timeout.map(|t| Instant::now() + t);
                }
            }
            WorkerEvent::Finished { unit, result } => {
                if let Some(entry) = self.in_flight.remove(&unit) {
                    self.release_slot(entry.unit.accelerator);
                    self.finish(entry.unit, result, ledger);
                } else if let Some(accelerator) = self.abandoned.remove(&unit) {
                    tracing::debug!(unit, "Timed-out unit returned; releasing its slot on {}", accelerator);
                    self.release_slot(accelerator);
                }
            }
        }
    }

    /// Waits up to one unit timeout for abandoned units so their slots and
    /// threads are reclaimed before the run returns.
    fn drain_abandoned(&mut self, events: &Receiver<WorkerEvent>) -> Result<()> {
        let grace = self.unit_timeout.unwrap_or_default();
        let until = Instant::now() + grace;
        while !self.abandoned.is_empty() {
            let wait = until.saturating_duration_since(Instant::now());
            match events.recv_timeout(wait) {
                Ok(WorkerEvent::Finished { unit, .. }) => {
                    if let Some(accelerator) = self.abandoned.remove(&unit) {
                        self.release_slot(accelerator);
                    }
                }
                Ok(WorkerEvent::Started(_)) => {}
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => return Err(ExtractError::WorkerGone.into()),
            }
        }
        Ok(())
    }

    /// Admits queued units while their accelerator has a free slot.
    fn schedule_more(&mut self, jobs: &BTreeMap<AcceleratorId, Sender<Job>>) -> Result<()> {
        for (&accelerator, queue) in self.queues.iter_mut() {
            let (Some(gate), Some(sender)) = (self.gates.get_mut(&accelerator), jobs.get(&accelerator))
            else {
                continue;
            };
            while !queue.is_empty() && gate.try_acquire() {
                let Some(unit) = queue.pop_front() else {
                    break;
                };
                if let Some(video) = self.videos.get_mut(&unit.video) {
                    if video.state == VideoState::Pending {
                        video.state = VideoState::InProgress;
                    }
                }
                tracing::debug!(
                    video = %unit.video,
                    unit = unit.id,
                    "Admitted segment {} on {} ({} in flight)",
                    unit.segment,
                    accelerator,
                    gate.in_flight()
                );

                let cancel = CancelToken::new();
                self.in_flight.insert(
                    unit.id,
                    InFlight {
                        unit: unit.clone(),
                        cancel: cancel.clone(),
                        deadline: None,
                    },
                );
                sender
                    .send(Job { unit, cancel })
                    .map_err(|_| ExtractError::WorkerGone)?;

                let (queued, in_flight, peak) = (queue.len(), gate.in_flight(), gate.peak());
                self.progress.update_accelerator(accelerator, |a| {
                    a.queued = queued;
                    a.in_flight = in_flight;
                    a.peak_in_flight = peak;
                });
            }
        }
        Ok(())
    }

    fn expire_overdue(&mut self, ledger: &mut ProcessingLedger) {
        let now = Instant::now();
        let overdue: Vec<UnitId> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline.is_some_and(|d| d <= now))
            .map(|(&id, _)| id)
            .collect();

        for id in overdue {
            if let Some(entry) = self.in_flight.remove(&id) {
                entry.cancel.cancel();
                self.abandoned.insert(id, entry.unit.accelerator);
                let timeout = self.unit_timeout.unwrap_or_default();
                self.finish(entry.unit, Err(ExtractError::Timeout(timeout).into()), ledger);
            }
        }
    }

    fn release_slot(&mut self, accelerator: AcceleratorId) {
        if let Some(gate) = self.gates.get_mut(&accelerator) {
            gate.release();
            let in_flight = gate.in_flight();
            self.progress
                .update_accelerator(accelerator, |a| a.in_flight = in_flight);
        }
    }

    /// Single place where video counters move, so the ledger write sees the
    /// final count. Slots are released separately by the caller.
    fn finish(
        &mut self,
        unit: ProcessingUnit,
        result: Result<ExtractedFrameSet>,
        ledger: &mut ProcessingLedger,
    ) {
        self.remaining -= 1;
        self.bar.inc(1);

        let Some(video) = self.videos.get_mut(&unit.video) else {
            return;
        };

        match result {
            Ok(frames) => {
                video.completed += 1;
                video.frames += frames.len();
                self.progress.completed_units.fetch_add(1, Ordering::Relaxed);
                self.progress
                    .frames_written
                    .fetch_add(frames.len(), Ordering::Relaxed);
                self.progress.update_accelerator(unit.accelerator, |a| a.completed += 1);
                tracing::info!(
                    video = %unit.video,
                    unit = unit.id,
                    "Segment {} done: {} frames to {:?} ({}/{} units)",
                    unit.segment,
                    frames.len(),
                    frames.output_dir,
                    video.completed,
                    video.expected
                );
            }
            Err(err) => {
                video.failed += 1;
                self.progress.failed_units.fetch_add(1, Ordering::Relaxed);
                self.progress.update_accelerator(unit.accelerator, |a| a.failed += 1);
                tracing::error!(
                    video = %unit.video,
                    unit = unit.id,
                    "Segment {} on {} failed: {:#}",
                    unit.segment,
                    unit.accelerator,
                    err
                );
                self.failures.push(UnitFailure {
                    unit: unit.id,
                    video: unit.video.clone(),
                    segment: unit.segment,
                    accelerator: unit.accelerator,
                    kind: failure_kind(&err).to_string(),
                    error: format!("{:#}", err),
                });
                if video.state != VideoState::PartiallyFailed {
                    video.state = VideoState::PartiallyFailed;
                    self.progress
                        .videos_partially_failed
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if video.completed == video.expected {
            match ledger.append(&unit.video) {
                Ok(()) => {
                    video.state = VideoState::Done;
                    video.ledgered = true;
                    self.progress.videos_done.fetch_add(1, Ordering::Relaxed);
                    self.bar.set_message(format!("{} done", unit.video));
                    tracing::info!(
                        video = %unit.video,
                        "All {} unit(s) done, {} frames; ledgered",
                        video.expected,
                        video.frames
                    );
                }
                Err(err) => {
                    video.state = VideoState::PartiallyFailed;
                    self.progress
                        .videos_partially_failed
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::error!(video = %unit.video, "Ledger append failed: {:#}", err);
                    self.failures.push(UnitFailure {
                        unit: unit.id,
                        video: unit.video.clone(),
                        segment: unit.segment,
                        accelerator: unit.accelerator,
                        kind: "ledger".to_string(),
                        error: format!("{:#}", err),
                    });
                }
            }
        } else if video.completed + video.failed == video.expected {
            tracing::warn!(
                video = %unit.video,
                "{} of {} unit(s) failed; not ledgered, will be retried next run",
                video.failed,
                video.expected
            );
        }
    }

    fn into_outcome(self) -> RunOutcome {
        RunOutcome {
            videos: self
                .videos
                .into_iter()
                .map(|(video, p)| VideoOutcome {
                    video,
                    state: p.state,
                    expected_units: p.expected,
                    completed_units: p.completed,
                    failed_units: p.failed,
                    frames_written: p.frames,
                    ledgered: p.ledgered,
                })
                .collect(),
            failures: self.failures,
            peak_in_flight: self
                .gates
                .iter()
                .map(|(id, gate)| (id.to_string(), gate.peak()))
                .collect(),
        }
    }
}
