//! Job scheduler.
//!
//! Jobs wrap validated command payloads with priority, dependency, timeout
//! and completion metadata. Each hardware queue keeps four FIFO priority
//! buckets; a dedicated worker selects the highest-priority ready job for
//! every queue with admission capacity and hands it to the command ring.
//! Dependency edges live in an id-keyed side table, so the job graph carries
//! no pointer cycles.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::cmd::{CmdHeader, Opcode};
use crate::device::DeviceCore;
use crate::error::{GpuError, Result};
use crate::regs::status;

pub const NUM_PRIORITIES: usize = 4;

/// Completed jobs retained for queries before reclamation.
const COMPLETED_KEEP: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Realtime = 3,
}

impl Priority {
    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::Low),
            1 => Some(Self::Normal),
            2 => Some(Self::High),
            3 => Some(Self::Realtime),
            _ => None,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobType {
    Draw,
    Compute,
    Dma,
    Fence,
}

impl JobType {
    /// Derives the job type from the first record of a validated payload.
    pub fn classify(payload: &[u32]) -> Self {
        let Some(&first) = payload.first() else {
            return Self::Draw;
        };
        match Opcode::from_u8(CmdHeader::unpack(first).opcode) {
            Some(Opcode::Compute) => Self::Compute,
            Some(Opcode::Dma) => Self::Dma,
            Some(Opcode::Fence) => Self::Fence,
            _ => Self::Draw,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum JobState {
    Pending = 0,
    Queued = 1,
    Running = 2,
    Completed = 3,
    Aborted = 4,
    TimedOut = 5,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::TimedOut)
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Pending,
            1 => Self::Queued,
            2 => Self::Running,
            3 => Self::Completed,
            4 => Self::Aborted,
            _ => Self::TimedOut,
        }
    }
}

type Outcome = std::result::Result<(), GpuError>;

pub struct Job {
    id: u64,
    ty: JobType,
    priority: Priority,
    queue_id: u32,
    timeout: Duration,
    payload: Vec<u32>,
    fence: Option<(u64, u32)>,
    state: AtomicU8,
    dep_count: AtomicU32,
    submitted_at: Instant,
    started_at: Mutex<Option<Instant>>,
    ended_at: Mutex<Option<Instant>>,
    /// Completion latch; written exactly once, on the terminal transition.
    outcome: Mutex<Option<Outcome>>,
    outcome_cv: Condvar,
}

impl Job {
    #[allow(clippy::too_many_arguments)]
    fn new(
        id: u64,
        ty: JobType,
        priority: Priority,
        queue_id: u32,
        timeout: Duration,
        payload: Vec<u32>,
        fence: Option<(u64, u32)>,
    ) -> Self {
        Self {
            id,
            ty,
            priority,
            queue_id,
            timeout,
            payload,
            fence,
            state: AtomicU8::new(JobState::Pending as u8),
            dep_count: AtomicU32::new(0),
            submitted_at: Instant::now(),
            started_at: Mutex::new(None),
            ended_at: Mutex::new(None),
            outcome: Mutex::new(None),
            outcome_cv: Condvar::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn job_type(&self) -> JobType {
        self.ty
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn queue_id(&self) -> u32 {
        self.queue_id
    }

    pub fn fence(&self) -> Option<(u64, u32)> {
        self.fence
    }

    pub fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn dep_count(&self) -> u32 {
        self.dep_count.load(Ordering::Acquire)
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    fn is_ready(&self) -> bool {
        self.state() == JobState::Queued && self.dep_count() == 0
    }

    fn cas_state(&self, from: JobState, to: JobState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn set_state(&self, to: JobState) {
        debug_assert!(!to.is_terminal(), "terminal transitions go through try_finish");
        self.state.store(to as u8, Ordering::Release);
    }

    /// Terminal transition. The first writer wins and signals the latch
    /// exactly once; later attempts are no-ops.
    fn try_finish(&self, terminal: JobState, outcome: Outcome) -> bool {
        debug_assert!(terminal.is_terminal());
        loop {
            let current = self.state.load(Ordering::Acquire);
            if JobState::from_u8(current).is_terminal() {
                return false;
            }
            if self
                .state
                .compare_exchange(current, terminal as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                *self.ended_at.lock().unwrap() = Some(Instant::now());
                let mut latch = self.outcome.lock().unwrap();
                debug_assert!(latch.is_none());
                *latch = Some(outcome);
                self.outcome_cv.notify_all();
                return true;
            }
        }
    }

    /// Blocks on the completion latch. `deadline == None` waits forever.
    /// Timing out here leaves the job untouched; its own timeout sweep is
    /// independent.
    pub fn wait(&self, deadline: Option<Instant>) -> Result<()> {
        let mut latch = self.outcome.lock().unwrap();
        loop {
            if let Some(outcome) = latch.as_ref() {
                return outcome.clone();
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(GpuError::Timeout);
                    }
                    let (guard, _timed_out) = self
                        .outcome_cv
                        .wait_timeout(latch, deadline - now)
                        .unwrap();
                    latch = guard;
                }
                None => {
                    latch = self.outcome_cv.wait(latch).unwrap();
                }
            }
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("type", &self.ty)
            .field("priority", &self.priority)
            .field("queue", &self.queue_id)
            .field("state", &self.state())
            .field("dep_count", &self.dep_count())
            .finish_non_exhaustive()
    }
}

/// Everything the submission path needs to build a job.
pub(crate) struct JobParams {
    pub payload: Vec<u32>,
    pub ty: JobType,
    pub priority: Priority,
    pub queue_id: u32,
    pub fence: Option<(u64, u32)>,
    pub timeout: Duration,
    pub deps: Vec<u64>,
}

struct QueueInner {
    buckets: [VecDeque<Arc<Job>>; NUM_PRIORITIES],
    /// Most recently started job, cleared on completion. At most one per
    /// queue; the hardware pipelines further starts up to `depth`.
    current_job: Option<Arc<Job>>,
    /// Set once the current job's payload has actually been kicked to the
    /// ring. Completion must not fire for a reserved-but-unwritten slot.
    current_on_hw: bool,
    in_flight: u32,
    jobs_started: u64,
    jobs_completed: u64,
}

struct HwQueue {
    queue_id: u32,
    depth: u32,
    inner: Mutex<QueueInner>,
}

impl HwQueue {
    fn new(queue_id: u32, depth: u32) -> Self {
        Self {
            queue_id,
            depth,
            inner: Mutex::new(QueueInner {
                buckets: std::array::from_fn(|_| VecDeque::new()),
                current_job: None,
                current_on_hw: false,
                in_flight: 0,
                jobs_started: 0,
                jobs_completed: 0,
            }),
        }
    }
}

struct JobTable {
    all: HashMap<u64, Arc<Job>>,
    completed: VecDeque<u64>,
    /// predecessor id -> jobs whose `dep_count` drops when it finishes.
    dependents: HashMap<u64, Vec<u64>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queue_id: u32,
    pub depth: u32,
    pub in_flight: u32,
    pub queued: usize,
    pub jobs_started: u64,
    pub jobs_completed: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchedStats {
    pub total_jobs: u64,
    pub active_jobs: usize,
    pub queues: Vec<QueueStats>,
}

pub(crate) struct Scheduler {
    core: Arc<DeviceCore>,
    queues: Vec<HwQueue>,
    table: Mutex<JobTable>,
    next_job_id: AtomicU64,
    wake_flag: Mutex<bool>,
    wake_cv: Condvar,
    stop: AtomicBool,
    rr_cursor: AtomicUsize,
    total_jobs: AtomicU64,
}

impl Scheduler {
    pub(crate) fn new(core: Arc<DeviceCore>) -> Arc<Self> {
        let depth = core.config.queue_depth;
        let queues = (0..core.num_queues)
            .map(|q| HwQueue::new(q, depth))
            .collect();
        Arc::new(Self {
            core,
            queues,
            table: Mutex::new(JobTable {
                all: HashMap::new(),
                completed: VecDeque::new(),
                dependents: HashMap::new(),
            }),
            next_job_id: AtomicU64::new(0),
            wake_flag: Mutex::new(false),
            wake_cv: Condvar::new(),
            stop: AtomicBool::new(false),
            rr_cursor: AtomicUsize::new(0),
            total_jobs: AtomicU64::new(0),
        })
    }

    pub(crate) fn wake(&self) {
        let mut flag = self.wake_flag.lock().unwrap();
        *flag = true;
        self.wake_cv.notify_all();
    }

    fn wait_wake(&self, park: Duration) {
        let mut flag = self.wake_flag.lock().unwrap();
        if !*flag {
            let (guard, _timed_out) = self.wake_cv.wait_timeout(flag, park).unwrap();
            flag = guard;
        }
        *flag = false;
    }

    pub(crate) fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.wake();
    }

    /// Picks the queue for a job when the caller did not name one: DMA work
    /// prefers queue 2 and compute queue 1, each falling back to queue 0
    /// (graphics) on smaller devices.
    pub(crate) fn auto_queue(&self, ty: JobType) -> u32 {
        let n = self.queues.len() as u32;
        match ty {
            JobType::Dma if n > 2 => 2,
            JobType::Compute if n > 1 => 1,
            _ => 0,
        }
    }

    pub(crate) fn num_queues(&self) -> u32 {
        self.queues.len() as u32
    }

    /// Creates the job, resolves its dependencies and places it into its
    /// priority bucket.
    pub(crate) fn submit(&self, params: JobParams) -> Result<Arc<Job>> {
        if params.queue_id as usize >= self.queues.len() {
            return Err(GpuError::InvalidArgument(format!(
                "queue {} does not exist",
                params.queue_id
            )));
        }

        let id = self.next_job_id.fetch_add(1, Ordering::Relaxed) + 1;
        let job = Arc::new(Job::new(
            id,
            params.ty,
            params.priority,
            params.queue_id,
            params.timeout,
            params.payload,
            params.fence,
        ));

        {
            let mut table = self.table.lock().unwrap();
            for &dep in &params.deps {
                if dep == id {
                    return Err(GpuError::InvalidArgument("self-dependency".into()));
                }
                if !table.all.contains_key(&dep) {
                    return Err(GpuError::NotFound);
                }
            }
            for &dep in &params.deps {
                let satisfied = table.all[&dep].state().is_terminal();
                if !satisfied {
                    job.dep_count.fetch_add(1, Ordering::AcqRel);
                    table.dependents.entry(dep).or_default().push(id);
                }
            }
            table.all.insert(id, Arc::clone(&job));
        }

        let queue = &self.queues[params.queue_id as usize];
        {
            let mut inner = queue.inner.lock().unwrap();
            job.set_state(JobState::Queued);
            inner.buckets[job.priority as usize].push_back(Arc::clone(&job));
        }
        self.total_jobs.fetch_add(1, Ordering::Relaxed);

        debug!(
            job = id,
            queue = params.queue_id,
            priority = ?job.priority,
            deps = job.dep_count(),
            "job queued"
        );
        self.wake();
        Ok(job)
    }

    pub(crate) fn job(&self, id: u64) -> Option<Arc<Job>> {
        self.table.lock().unwrap().all.get(&id).cloned()
    }

    /// Adds the edge "`dependent` waits for `predecessor`". Rejects
    /// self-dependencies and edges that would close a cycle; an edge to an
    /// already-finished predecessor is a no-op.
    pub(crate) fn add_dependency(&self, dependent: u64, predecessor: u64) -> Result<()> {
        if dependent == predecessor {
            return Err(GpuError::InvalidArgument("self-dependency".into()));
        }
        let mut table = self.table.lock().unwrap();
        let dep_job = table.all.get(&dependent).ok_or(GpuError::NotFound)?.clone();
        let pred_job = table
            .all
            .get(&predecessor)
            .ok_or(GpuError::NotFound)?
            .clone();

        match dep_job.state() {
            JobState::Pending | JobState::Queued => {}
            _ => return Err(GpuError::AlreadyInProgress),
        }
        if pred_job.state().is_terminal() {
            return Ok(());
        }
        if reaches(&table.dependents, dependent, predecessor) {
            return Err(GpuError::InvalidArgument("dependency cycle".into()));
        }

        dep_job.dep_count.fetch_add(1, Ordering::AcqRel);
        table.dependents.entry(predecessor).or_default().push(dependent);
        Ok(())
    }

    /// Cancels a job that has not started. Running and finished jobs are
    /// refused; cancelling running work requires a reset cycle.
    pub(crate) fn cancel(&self, id: u64) -> Result<()> {
        let job = self.job(id).ok_or(GpuError::NotFound)?;
        {
            let queue = &self.queues[job.queue_id as usize];
            let mut inner = queue.inner.lock().unwrap();
            match job.state() {
                JobState::Pending | JobState::Queued => {
                    for bucket in inner.buckets.iter_mut() {
                        if let Some(pos) = bucket.iter().position(|j| j.id == id) {
                            bucket.remove(pos);
                            break;
                        }
                    }
                }
                _ => return Err(GpuError::AlreadyInProgress),
            }
        }
        if self.finish_job(&job, Err(GpuError::Cancelled)) {
            debug!(job = id, "job cancelled");
            Ok(())
        } else {
            Err(GpuError::AlreadyInProgress)
        }
    }

    pub(crate) fn wait_job(&self, id: u64, deadline: Option<Instant>) -> Result<()> {
        let job = self.job(id).ok_or(GpuError::NotFound)?;
        job.wait(deadline)
    }

    /// One worker pass: round-robin over the queues, starting at most one
    /// job on each queue with a free slot.
    fn dispatch_all(&self) {
        let n = self.queues.len();
        let start = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % n;
        for i in 0..n {
            let qi = (start + i) % n;
            // Re-run selection if a picked job was cancelled under us.
            while self.try_dispatch_queue(qi) {}
        }
    }

    /// Attempts to start one job on queue `qi`. Returns `true` only when
    /// selection should immediately be retried (the picked job vanished).
    fn try_dispatch_queue(&self, qi: usize) -> bool {
        let queue = &self.queues[qi];
        let job = {
            let mut inner = queue.inner.lock().unwrap();
            if inner.current_job.is_some() || inner.in_flight >= queue.depth {
                return false;
            }
            let mut picked = None;
            for priority in (0..NUM_PRIORITIES).rev() {
                let bucket = &mut inner.buckets[priority];
                // First ready job in FIFO order within the bucket.
                if let Some(pos) = bucket.iter().position(|candidate| candidate.is_ready()) {
                    picked = bucket.remove(pos);
                    break;
                }
            }
            let Some(job) = picked else {
                return false;
            };
            inner.current_job = Some(Arc::clone(&job));
            inner.in_flight += 1;
            job
        };

        if !job.cas_state(JobState::Queued, JobState::Running) {
            // Cancelled between selection and start; free the slot and look
            // for another candidate.
            let mut inner = queue.inner.lock().unwrap();
            inner.current_job = None;
            inner.in_flight -= 1;
            return true;
        }
        *job.started_at.lock().unwrap() = Some(Instant::now());

        match self
            .core
            .submit_payload(job.queue_id, &job.payload, job.fence)
        {
            Ok(()) => {
                {
                    let mut inner = queue.inner.lock().unwrap();
                    inner.jobs_started += 1;
                    // The slot may have been torn down by the timeout sweep
                    // while we waited for ring space.
                    if inner
                        .current_job
                        .as_ref()
                        .is_some_and(|current| current.id == job.id)
                    {
                        inner.current_on_hw = true;
                    }
                }
                trace!(job = job.id, queue = job.queue_id, "job started");
                // A fast device may have finished before the completion IRQ
                // was armed for this job; poll once. Both paths are
                // idempotent.
                self.handle_cmd_complete();
                false
            }
            Err(GpuError::Timeout) | Err(GpuError::Busy) => {
                // Transient ring pressure: put the job back at the head of
                // its bucket and yield until space opens up.
                warn!(job = job.id, queue = job.queue_id, "ring full, requeueing job");
                let requeued = job.cas_state(JobState::Running, JobState::Queued);
                let mut inner = queue.inner.lock().unwrap();
                inner.current_job = None;
                inner.in_flight -= 1;
                if requeued {
                    inner.buckets[job.priority as usize].push_front(job);
                }
                false
            }
            Err(err) => {
                warn!(job = job.id, queue = job.queue_id, %err, "job submission failed");
                {
                    let mut inner = queue.inner.lock().unwrap();
                    inner.current_job = None;
                    inner.in_flight -= 1;
                }
                self.finish_job(&job, Err(GpuError::Hardware));
                self.core.request_reset();
                false
            }
        }
    }

    /// CMD_COMPLETE deferred handler: scan for completions, then wake the
    /// worker so freed capacity is refilled.
    pub(crate) fn handle_cmd_complete(&self) {
        self.poll_completions();
        self.wake();
    }

    /// Re-reads every queue's head and completes the tracked job of each
    /// drained queue. Idempotent; the IRQ path, the worker's poll and
    /// replays after reset all hit the same terminal CAS. Returns whether
    /// anything finished.
    pub(crate) fn poll_completions(&self) -> bool {
        let mut any = false;
        let hw_status = self.core.regs.status();
        for queue in &self.queues {
            let Some(ring) = self.core.ring(queue.queue_id) else {
                continue;
            };
            let finished = {
                let mut inner = queue.inner.lock().unwrap();
                if inner.current_job.is_none() || !inner.current_on_hw {
                    continue;
                }
                if !ring.is_empty(&self.core.regs) {
                    continue;
                }
                inner.current_on_hw = false;
                inner.in_flight = inner.in_flight.saturating_sub(1);
                inner.jobs_completed += 1;
                inner.current_job.take()
            };
            if let Some(job) = finished {
                ring.note_completed();
                let outcome = if hw_status & status::ERROR != 0 {
                    Err(GpuError::Hardware)
                } else {
                    Ok(())
                };
                trace!(job = job.id, queue = queue.queue_id, ok = outcome.is_ok(), "job complete");
                self.finish_job(&job, outcome);
                any = true;
            }
        }
        any
    }

    /// Drives the terminal transition and, when this call wins, the table
    /// bookkeeping: move to the completed list, decrement dependents, wake
    /// the worker for newly-ready work.
    pub(crate) fn finish_job(&self, job: &Arc<Job>, outcome: Outcome) -> bool {
        let terminal = match &outcome {
            Ok(()) => JobState::Completed,
            Err(GpuError::Timeout) => JobState::TimedOut,
            Err(_) => JobState::Aborted,
        };
        if !job.try_finish(terminal, outcome) {
            return false;
        }

        let mut newly_ready = false;
        {
            let mut table = self.table.lock().unwrap();
            table.completed.push_back(job.id);
            while table.completed.len() > COMPLETED_KEEP {
                if let Some(old) = table.completed.pop_front() {
                    table.all.remove(&old);
                    table.dependents.remove(&old);
                }
            }
            if let Some(dependents) = table.dependents.remove(&job.id) {
                for dep_id in dependents {
                    if let Some(dependent) = table.all.get(&dep_id) {
                        if dependent.dep_count.fetch_sub(1, Ordering::AcqRel) == 1 {
                            newly_ready = true;
                        }
                    }
                }
            }
        }
        if newly_ready {
            trace!(job = job.id, "dependents became ready");
        }
        self.wake();
        true
    }

    /// Periodic sweep: any running job past its own timeout is marked
    /// `TimedOut`, its queue slot freed, and a reset scheduled.
    pub(crate) fn sweep_timeouts(&self) {
        let running: Vec<Arc<Job>> = {
            let table = self.table.lock().unwrap();
            table
                .all
                .values()
                .filter(|j| j.state() == JobState::Running)
                .cloned()
                .collect()
        };
        let now = Instant::now();
        for job in running {
            let started = *job.started_at.lock().unwrap();
            let Some(started) = started else { continue };
            if now.duration_since(started) <= job.timeout {
                continue;
            }
            warn!(
                job = job.id,
                queue = job.queue_id,
                timeout_ms = job.timeout.as_millis() as u64,
                "job timeout"
            );
            if self.finish_job(&job, Err(GpuError::Timeout)) {
                self.release_slot_of(&job);
                self.core.request_reset();
            }
        }
    }

    fn release_slot_of(&self, job: &Arc<Job>) {
        let queue = &self.queues[job.queue_id as usize];
        let mut inner = queue.inner.lock().unwrap();
        let held = inner
            .current_job
            .as_ref()
            .is_some_and(|current| current.id == job.id);
        if held {
            inner.current_job = None;
            inner.current_on_hw = false;
            inner.in_flight = inner.in_flight.saturating_sub(1);
        }
    }

    /// Fails whatever is on the hardware right now; used by the reset worker
    /// after quiescing the rings.
    pub(crate) fn abort_running(&self, error: GpuError) {
        for queue in &self.queues {
            let job = {
                let mut inner = queue.inner.lock().unwrap();
                inner.in_flight = 0;
                inner.current_on_hw = false;
                inner.current_job.take()
            };
            if let Some(job) = job {
                self.finish_job(&job, Err(error.clone()));
            }
        }
    }

    /// Fails every non-terminal job; used at shutdown and when the device
    /// dies.
    pub(crate) fn fail_all(&self, error: GpuError) {
        for queue in &self.queues {
            let mut inner = queue.inner.lock().unwrap();
            for bucket in inner.buckets.iter_mut() {
                bucket.clear();
            }
            inner.current_job = None;
            inner.current_on_hw = false;
            inner.in_flight = 0;
        }
        let jobs: Vec<Arc<Job>> = {
            let table = self.table.lock().unwrap();
            table
                .all
                .values()
                .filter(|j| !j.state().is_terminal())
                .cloned()
                .collect()
        };
        for job in jobs {
            self.finish_job(&job, Err(error.clone()));
        }
    }

    pub(crate) fn stats(&self) -> SchedStats {
        let queues = self
            .queues
            .iter()
            .map(|queue| {
                let inner = queue.inner.lock().unwrap();
                QueueStats {
                    queue_id: queue.queue_id,
                    depth: queue.depth,
                    in_flight: inner.in_flight,
                    queued: inner.buckets.iter().map(|b| b.len()).sum(),
                    jobs_started: inner.jobs_started,
                    jobs_completed: inner.jobs_completed,
                }
            })
            .collect();
        SchedStats {
            total_jobs: self.total_jobs.load(Ordering::Relaxed),
            active_jobs: self.table.lock().unwrap().all.len(),
            queues,
        }
    }

    /// Scheduler worker: dispatch, then sweep, then park until woken by a
    /// submission, a completion, or the park quantum.
    pub(crate) fn worker_loop(self: &Arc<Self>) {
        debug!("scheduler worker started");
        let sweep_every = self.core.config.timeout_sweep_interval;
        let mut last_sweep = Instant::now();
        while !self.stop.load(Ordering::Acquire) {
            if self.core.accepting_dispatch() {
                self.dispatch_all();
                // Completions normally arrive via CMD_COMPLETE, but the
                // polling path keeps jobs moving if an edge was masked.
                self.poll_completions();
            }
            if last_sweep.elapsed() >= sweep_every {
                self.sweep_timeouts();
                last_sweep = Instant::now();
            }
            self.wait_wake(Duration::from_millis(100));
        }
        debug!("scheduler worker stopped");
    }
}

/// Whether `to` is reachable from `from` along dependents edges. Used to
/// refuse dependency edges that would close a cycle.
fn reaches(dependents: &HashMap<u64, Vec<u64>>, from: u64, to: u64) -> bool {
    let mut stack = vec![from];
    let mut seen = HashSet::new();
    while let Some(node) = stack.pop() {
        if node == to {
            return true;
        }
        if !seen.insert(node) {
            continue;
        }
        if let Some(next) = dependents.get(&node) {
            stack.extend(next.iter().copied());
        }
    }
    false
}
