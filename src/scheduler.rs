//! Periodic task scheduler.
//!
//! Each [`LoopTask`] runs its routine on a dedicated OS thread against an
//! absolute deadline grid (`start + k * period`), so jitter does not
//! accumulate. Invocations of one task never overlap; different tasks are
//! fully independent.
//!
//! A routine reports each tick as `Ok`, [`TickError::Retry`] (logged, counted,
//! the task keeps running) or [`TickError::Fatal`] (the task stops). A panic in
//! a routine is caught and handled like a fatal error, so it only ever stops
//! its own task.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use rlsar::scheduler::{LoopTask, OverrunPolicy};
//!
//! let task = LoopTask::new("heartbeat", Duration::from_millis(10), OverrunPolicy::Skip, || {
//!     tracing::debug!("tick");
//!     Ok(())
//! });
//! task.start()?;
//! // ...
//! task.shutdown();
//! # Ok::<(), rlsar::scheduler::SchedulerError>(())
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender, TryRecvError};

/// A single tick's failure.
#[derive(Debug)]
pub enum TickError {
    /// Skip this tick and try again on the next one.
    Retry(anyhow::Error),
    /// Stop this task.
    Fatal(anyhow::Error),
}

impl TickError {
    pub fn retry(err: impl Into<anyhow::Error>) -> Self {
        TickError::Retry(err.into())
    }

    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        TickError::Fatal(err.into())
    }
}

pub type TickResult = Result<(), TickError>;

/// Routine invoked once per tick.
pub type Routine = Box<dyn FnMut() -> TickResult + Send + 'static>;

/// What to do with deadlines that passed while a tick was still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrunPolicy {
    /// Drop every missed deadline and resume on the next future one.
    Skip,
    /// Run up to `max_backlog` missed ticks back-to-back, drop the rest.
    CatchUp { max_backlog: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("task `{0}` is already running")]
    AlreadyRunning(String),

    #[error("task `{0}` has been shut down")]
    Closed(String),

    #[error("failed to spawn thread for task `{name}`: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Lifecycle of a [`LoopTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Registered, not started.
    Idle = 0,
    Running = 1,
    /// Stopped by a fatal tick error or panic.
    Faulted = 2,
    /// Shut down; cannot be restarted.
    Closed = 3,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TaskState::Idle,
            1 => TaskState::Running,
            2 => TaskState::Faulted,
            _ => TaskState::Closed,
        }
    }
}

/// Counters updated by the task thread.
#[derive(Debug, Default)]
pub struct LoopStats {
    invocations: AtomicU64,
    overruns: AtomicU64,
    skipped: AtomicU64,
    retries: AtomicU64,
    max_lateness_us: AtomicU64,
}

/// Point-in-time copy of [`LoopStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStatsSnapshot {
    /// Routine invocations.
    pub invocations: u64,
    /// Invocations that finished after the next deadline.
    pub overruns: u64,
    /// Deadlines dropped without an invocation.
    pub skipped: u64,
    /// Ticks that returned [`TickError::Retry`].
    pub retries: u64,
    /// Worst completion lateness past the next deadline.
    pub max_lateness_us: u64,
}

impl LoopStats {
    pub fn snapshot(&self) -> LoopStatsSnapshot {
        LoopStatsSnapshot {
            invocations: self.invocations.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            max_lateness_us: self.max_lateness_us.load(Ordering::Relaxed),
        }
    }
}

struct Worker {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// A named periodic task.
pub struct LoopTask {
    name: String,
    period: Duration,
    overrun: OverrunPolicy,
    routine: Mutex<Option<Routine>>,
    worker: Mutex<Option<Worker>>,
    state: Arc<AtomicU8>,
    stats: Arc<LoopStats>,
}

impl LoopTask {
    /// Register a task. Nothing runs until [`LoopTask::start`].
    pub fn new(
        name: impl Into<String>,
        period: Duration,
        overrun: OverrunPolicy,
        routine: impl FnMut() -> TickResult + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            period,
            overrun,
            routine: Mutex::new(Some(Box::new(routine))),
            worker: Mutex::new(None),
            state: Arc::new(AtomicU8::new(TaskState::Idle as u8)),
            stats: Arc::new(LoopStats::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == TaskState::Running
    }

    pub fn stats(&self) -> LoopStatsSnapshot {
        self.stats.snapshot()
    }

    /// Begin periodic dispatch on a new thread. The first tick runs immediately.
    ///
    /// A task starts at most once.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        match self.state() {
            TaskState::Idle => {}
            TaskState::Closed => return Err(SchedulerError::Closed(self.name.clone())),
            TaskState::Running | TaskState::Faulted => {
                return Err(SchedulerError::AlreadyRunning(self.name.clone()))
            }
        }
        let routine = self
            .routine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| SchedulerError::AlreadyRunning(self.name.clone()))?;

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let ctx = LoopContext {
            name: self.name.clone(),
            period: self.period,
            overrun: self.overrun,
            state: Arc::clone(&self.state),
            stats: Arc::clone(&self.stats),
        };

        self.state.store(TaskState::Running as u8, Ordering::Release);
        let handle = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || ctx.run(routine, stop_rx))
            .map_err(|source| {
                self.state.store(TaskState::Closed as u8, Ordering::Release);
                SchedulerError::Spawn {
                    name: self.name.clone(),
                    source,
                }
            })?;

        tracing::info!(
            "Task {} started ({:.1} Hz)",
            self.name,
            1.0 / self.period.as_secs_f64()
        );
        *worker = Some(Worker { stop_tx, handle });
        Ok(())
    }

    /// Stop dispatch and wait for an in-flight invocation to finish.
    ///
    /// Idempotent. The task cannot be started again afterwards.
    pub fn shutdown(&self) {
        let worker = {
            let mut guard = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
            // Under the lock, so a concurrent `start` sees Closed.
            self.state.store(TaskState::Closed as u8, Ordering::Release);
            guard.take()
        };
        if let Some(worker) = worker {
            let _ = worker.stop_tx.try_send(());
            drop(worker.stop_tx);
            if worker.handle.join().is_err() {
                tracing::error!("Task {} thread panicked outside its routine", self.name);
            }
            tracing::info!("Task {} stopped", self.name);
        }
    }
}

impl Drop for LoopTask {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for LoopTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopTask")
            .field("name", &self.name)
            .field("period", &self.period)
            .field("overrun", &self.overrun)
            .field("state", &self.state())
            .finish()
    }
}

/// Everything the task thread needs.
struct LoopContext {
    name: String,
    period: Duration,
    overrun: OverrunPolicy,
    state: Arc<AtomicU8>,
    stats: Arc<LoopStats>,
}

impl LoopContext {
    fn run(self, mut routine: Routine, stop_rx: crossbeam_channel::Receiver<()>) {
        let mut deadline = Instant::now();
        loop {
            let now = Instant::now();
            if deadline > now {
                match stop_rx.recv_timeout(deadline - now) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            } else {
                match stop_rx.try_recv() {
                    Err(TryRecvError::Empty) => {}
                    Ok(()) | Err(TryRecvError::Disconnected) => break,
                }
            }

            self.stats.invocations.fetch_add(1, Ordering::Relaxed);
            let outcome = catch_unwind(AssertUnwindSafe(&mut routine));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(TickError::Retry(e))) => {
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("Task {} tick failed, retrying: {:#}", self.name, e);
                }
                Ok(Err(TickError::Fatal(e))) => {
                    tracing::error!("Task {} stopped on fatal error: {:#}", self.name, e);
                    self.fault();
                    return;
                }
                Err(panic) => {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::error!("Task {} stopped on panic: {}", self.name, msg);
                    self.fault();
                    return;
                }
            }

            deadline += self.period;
            deadline = self.account_overrun(deadline, Instant::now());
        }
    }

    fn fault(&self) {
        // A concurrent shutdown wins; it already marked the task closed.
        let _ = self.state.compare_exchange(
            TaskState::Running as u8,
            TaskState::Faulted as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Apply the overrun policy when `now` is past `deadline`; returns the
    /// deadline of the next invocation.
    fn account_overrun(&self, deadline: Instant, now: Instant) -> Instant {
        if now <= deadline {
            return deadline;
        }
        let late = now - deadline;
        let period_ns = self.period.as_nanos().max(1);
        // Deadlines at or before `now`, including `deadline` itself.
        let missed = (late.as_nanos() / period_ns) as u64 + 1;

        let overruns = self.stats.overruns.fetch_add(1, Ordering::Relaxed) + 1;
        self.stats
            .max_lateness_us
            .fetch_max(late.as_micros() as u64, Ordering::Relaxed);

        let dropped = match self.overrun {
            OverrunPolicy::Skip => missed,
            OverrunPolicy::CatchUp { max_backlog } => missed.saturating_sub(max_backlog as u64),
        };
        if dropped > 0 {
            self.stats.skipped.fetch_add(dropped, Ordering::Relaxed);
        }

        // First overrun, then every 1000th.
        if overruns == 1 || overruns % 1000 == 0 {
            tracing::warn!(
                "Task {} overran its {:.1}ms period by {:.2}ms ({} overruns, {} ticks skipped so far)",
                self.name,
                self.period.as_secs_f64() * 1000.0,
                late.as_secs_f64() * 1000.0,
                overruns,
                self.stats.skipped.load(Ordering::Relaxed),
            );
        }

        deadline + self.period * dropped as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting(period_ms: u64) -> (LoopTask, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let task = LoopTask::new(
            "count",
            Duration::from_millis(period_ms),
            OverrunPolicy::Skip,
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );
        (task, count)
    }

    #[test]
    fn test_runs_periodically_until_shutdown() {
        let (task, count) = counting(2);
        assert_eq!(task.state(), TaskState::Idle);
        task.start().unwrap();
        std::thread::sleep(Duration::from_millis(60));
        task.shutdown();
        let after = count.load(Ordering::SeqCst);
        assert!(after >= 5, "only {} ticks", after);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), after);
        assert_eq!(task.state(), TaskState::Closed);
        assert_eq!(task.stats().invocations as usize, after);
    }

    #[test]
    fn test_not_started_does_not_run() {
        let (task, count) = counting(1);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        task.shutdown();
    }

    #[test]
    fn test_cannot_restart_after_shutdown() {
        let (task, _) = counting(1);
        task.start().unwrap();
        assert!(matches!(task.start(), Err(SchedulerError::AlreadyRunning(_))));
        task.shutdown();
        task.shutdown();
        assert!(matches!(task.start(), Err(SchedulerError::Closed(_))));
    }

    #[test]
    fn test_shutdown_waits_for_in_flight_tick() {
        let inside = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let (i, d) = (Arc::clone(&inside), Arc::clone(&done));
        let task = LoopTask::new("slow", Duration::from_millis(1), OverrunPolicy::Skip, move || {
            i.store(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(40));
            d.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        task.start().unwrap();
        while inside.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }
        task.shutdown();
        assert!(done.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_fatal_error_stops_only_that_task() {
        let (healthy, count) = counting(1);
        let faulty = LoopTask::new("faulty", Duration::from_millis(1), OverrunPolicy::Skip, || {
            Err(TickError::fatal(anyhow::anyhow!("bus gone")))
        });
        healthy.start().unwrap();
        faulty.start().unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(faulty.state(), TaskState::Faulted);
        assert_eq!(faulty.stats().invocations, 1);
        assert!(healthy.is_running());
        let before = count.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        assert!(count.load(Ordering::SeqCst) > before);
        healthy.shutdown();
        faulty.shutdown();
    }

    #[test]
    fn test_panic_is_contained() {
        let panicking = LoopTask::new("panics", Duration::from_millis(1), OverrunPolicy::Skip, || {
            panic!("index out of bounds");
        });
        panicking.start().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(panicking.state(), TaskState::Faulted);
        panicking.shutdown();
        assert_eq!(panicking.state(), TaskState::Closed);
    }

    #[test]
    fn test_retry_keeps_running() {
        let n = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&n);
        let task = LoopTask::new("flaky", Duration::from_millis(1), OverrunPolicy::Skip, move || {
            if c.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                Err(TickError::retry(anyhow::anyhow!("timeout")))
            } else {
                Ok(())
            }
        });
        task.start().unwrap();
        std::thread::sleep(Duration::from_millis(30));
        task.shutdown();
        let stats = task.stats();
        assert!(stats.invocations >= 4);
        assert!(stats.retries >= 2);
    }

    #[test]
    fn test_overrun_is_counted() {
        let task = LoopTask::new("overrun", Duration::from_millis(2), OverrunPolicy::Skip, || {
            std::thread::sleep(Duration::from_millis(7));
            Ok(())
        });
        task.start().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        task.shutdown();
        let stats = task.stats();
        assert!(stats.overruns >= 1);
        assert!(stats.skipped >= stats.overruns);
        assert!(stats.max_lateness_us > 0);
    }

    fn context(overrun: OverrunPolicy) -> LoopContext {
        LoopContext {
            name: "unit".to_string(),
            period: Duration::from_millis(10),
            overrun,
            state: Arc::new(AtomicU8::new(TaskState::Running as u8)),
            stats: Arc::new(LoopStats::default()),
        }
    }

    #[test]
    fn test_skip_policy_moves_to_next_future_deadline() {
        let ctx = context(OverrunPolicy::Skip);
        let base = Instant::now();
        let deadline = base + Duration::from_millis(10);
        // Finished 25ms late: deadlines at +10, +20, +30 all passed.
        let next = ctx.account_overrun(deadline, base + Duration::from_millis(35));
        assert_eq!(next, base + Duration::from_millis(40));
        assert_eq!(ctx.stats.snapshot().skipped, 3);
        assert_eq!(ctx.stats.snapshot().overruns, 1);
    }

    #[test]
    fn test_catch_up_policy_keeps_backlog() {
        let ctx = context(OverrunPolicy::CatchUp { max_backlog: 3 });
        let base = Instant::now();
        let deadline = base + Duration::from_millis(10);
        // Two missed deadlines fit in the backlog: run them immediately.
        let next = ctx.account_overrun(deadline, base + Duration::from_millis(25));
        assert_eq!(next, deadline);
        assert_eq!(ctx.stats.snapshot().skipped, 0);

        // Five missed: two are dropped.
        let next = ctx.account_overrun(deadline, base + Duration::from_millis(55));
        assert_eq!(next, deadline + Duration::from_millis(20));
        assert_eq!(ctx.stats.snapshot().skipped, 2);
    }

    #[test]
    fn test_on_time_is_untouched() {
        let ctx = context(OverrunPolicy::Skip);
        let base = Instant::now();
        let deadline = base + Duration::from_millis(10);
        assert_eq!(ctx.account_overrun(deadline, base), deadline);
        assert_eq!(ctx.stats.snapshot(), LoopStatsSnapshot::default());
    }
}
