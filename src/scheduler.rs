//! Fixed worker pool with a ready/wait split.
//!
//! A pool struct holds the shared ready queue plus `Mutex<Vec<JoinHandle>>`
//! for its worker threads, with a free `worker_loop` function and
//! `start`/`join`/`run` as three ways to drive it. The ready queue itself is
//! deliberately simpler than a work-stealing injector/stealer rig: one
//! shared ready queue a parked worker blocks on, not per-worker deques with
//! stealing, so this module reaches for one `Mutex<VecDeque<_>>` plus a
//! `Condvar` instead -- see `DESIGN.md` for the tradeoff.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::process::{PiThread, StepOutcome};

/// The polling interval a worker waits on its condvar before re-checking
/// for quiescence. Not a busy-spin: the condvar wakes immediately on any
/// `spawn`/`wake`, this bound only covers the "is the whole pool stuck"
/// check.
const QUIESCENCE_POLL: Duration = Duration::from_millis(20);

/// A fixed pool of OS worker threads draining one shared ready queue.
pub struct SchedPool {
    nb_workers: usize,
    ready: Mutex<VecDeque<Arc<PiThread>>>,
    cond: Condvar,
    /// Threads spawned but not yet ENDED (includes both ready and parked).
    active: AtomicUsize,
    /// Threads currently parked (WAIT), tracked for introspection and for
    /// the quiescent-deadlock signal, not consulted by the scheduling logic
    /// itself (each `PiThread`'s own status is authoritative there).
    parked_threads: AtomicUsize,
    /// Workers currently blocked on the condvar with nothing to do.
    idle_workers: AtomicUsize,
    shutdown: AtomicBool,
    /// Set if shutdown was triggered by every worker going idle with
    /// threads still active (no commit anywhere can make progress), as
    /// opposed to ordinary completion (`active == 0`).
    quiescent: AtomicBool,
    worker_handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl SchedPool {
    /// Build a pool with `nb_workers` workers. `0` defaults to the number
    /// of available CPU cores, matching `snow-rt`'s convention.
    pub fn new(nb_workers: u32) -> Arc<SchedPool> {
        let nb_workers = if nb_workers == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            nb_workers as usize
        };

        Arc::new(SchedPool {
            nb_workers,
            ready: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            active: AtomicUsize::new(0),
            parked_threads: AtomicUsize::new(0),
            idle_workers: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            quiescent: AtomicBool::new(false),
            worker_handles: Mutex::new(Vec::new()),
        })
    }

    pub fn nb_workers(&self) -> usize {
        self.nb_workers
    }

    /// Number of threads spawned but not yet ENDED.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Whether the pool shut down because it was provably stuck (every
    /// worker idle, no ready thread, but active threads remain parked
    /// forever) rather than because every thread reached ENDED.
    pub fn is_quiescent_deadlock(&self) -> bool {
        self.quiescent.load(Ordering::Acquire)
    }

    /// Enqueue a freshly created thread as ready and count it active.
    pub fn spawn(&self, thread: Arc<PiThread>) {
        self.active.fetch_add(1, Ordering::AcqRel);
        self.ready.lock().push_back(thread);
        self.cond.notify_one();
    }

    /// Move a thread from parked back to ready (called from
    /// [`crate::process::PiThread::deposit_and_wake`]/`resume_at`).
    pub(crate) fn wake(&self, thread: Arc<PiThread>) {
        self.parked_threads.fetch_sub(1, Ordering::AcqRel);
        self.ready.lock().push_back(thread);
        self.cond.notify_one();
    }

    /// Record a thread as parked (called from [`PiThread::park`] after it
    /// has set its own status to WAIT).
    pub(crate) fn park(&self, _thread: Arc<PiThread>) {
        self.parked_threads.fetch_add(1, Ordering::AcqRel);
    }

    /// Start `nb_workers` OS threads in the background and return
    /// immediately. Pair with [`SchedPool::join`].
    pub fn start(self: &Arc<Self>) {
        let mut handles = self.worker_handles.lock();
        for _ in 0..self.nb_workers {
            let pool = Arc::clone(self);
            handles.push(std::thread::spawn(move || worker_loop(pool)));
        }
    }

    /// Block until every background worker started by [`SchedPool::start`]
    /// has exited.
    pub fn join(&self) {
        let handles: Vec<_> = self.worker_handles.lock().drain(..).collect();
        for h in handles {
            let _ = h.join();
        }
    }

    /// Run `nb_workers` workers to completion on this call stack, blocking
    /// until the pool reaches ENDED-quiescence or deadlock-quiescence.
    pub fn run(self: &Arc<Self>) {
        crossbeam_utils::thread::scope(|scope| {
            for _ in 0..self.nb_workers {
                let pool = Arc::clone(self);
                scope.spawn(move |_| worker_loop(pool));
            }
        })
        .expect("scheduler worker panicked");
    }
}

impl std::fmt::Debug for SchedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedPool")
            .field("nb_workers", &self.nb_workers)
            .field("active", &self.active_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// One worker's run loop: pop ready, run to suspension, repeat. Exits when
/// every thread has ENDED, or when every worker is simultaneously idle with
/// active threads remaining (quiescent deadlock: nothing left can make
/// progress, so the pool shuts itself down rather than spin forever).
fn worker_loop(pool: Arc<SchedPool>) {
    loop {
        let thread = {
            let mut ready = pool.ready.lock();
            loop {
                if let Some(t) = ready.pop_front() {
                    break Some(t);
                }
                if pool.active.load(Ordering::Acquire) == 0 {
                    break None;
                }
                if pool.shutdown.load(Ordering::Acquire) {
                    break None;
                }

                let idle_now = pool.idle_workers.fetch_add(1, Ordering::AcqRel) + 1;
                if idle_now == pool.nb_workers && ready.is_empty() {
                    pool.quiescent.store(true, Ordering::Release);
                    pool.shutdown.store(true, Ordering::Release);
                    pool.cond.notify_all();
                    pool.idle_workers.fetch_sub(1, Ordering::AcqRel);
                    break None;
                }

                pool.cond.wait_for(&mut ready, QUIESCENCE_POLL);
                pool.idle_workers.fetch_sub(1, Ordering::AcqRel);
            }
        };

        let Some(thread) = thread else { break };

        match thread.proc().run(&thread, &pool) {
            StepOutcome::Yielded => {
                pool.ready.lock().push_back(thread);
                pool.cond.notify_one();
            }
            StepOutcome::Waiting => {
                // PiThread::park already moved it to parked bookkeeping.
            }
            StepOutcome::Ended => {
                PiThread::finish(&thread);
                pool.active.fetch_sub(1, Ordering::AcqRel);
                pool.cond.notify_all();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{Branch, ChoiceOutcome, Guard, Proc};
    use std::sync::atomic::AtomicU64;

    struct CountToOne {
        counter: Arc<AtomicU64>,
    }

    impl Proc for CountToOne {
        fn run(&self, _thread: &Arc<PiThread>, _pool: &SchedPool) -> StepOutcome {
            self.counter.fetch_add(1, Ordering::SeqCst);
            StepOutcome::Ended
        }
    }

    #[test]
    fn pool_drains_single_thread_to_ended() {
        let counter = Arc::new(AtomicU64::new(0));
        let pool = SchedPool::new(2);
        let proc = Arc::new(CountToOne { counter: Arc::clone(&counter) });
        let thread = PiThread::new(proc, 0, 0);
        pool.spawn(thread);
        pool.run();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(pool.active_count(), 0);
        assert!(!pool.is_quiescent_deadlock());
    }

    struct ForeverWaiting;
    impl Proc for ForeverWaiting {
        fn run(&self, thread: &Arc<PiThread>, pool: &SchedPool) -> StepOutcome {
            let channel = crate::channel::Channel::create(1);
            let branches = [Branch {
                guard: Guard::Input { channel, refvar: 0 },
                enabled: true,
                cont_pc: crate::process::Label::from("never"),
            }];
            match crate::process::perform_choice(thread, pool, &branches) {
                ChoiceOutcome::Waiting => StepOutcome::Waiting,
                _ => unreachable!("no counterpart exists to commit"),
            }
        }
    }

    #[test]
    fn pool_detects_quiescent_deadlock() {
        let pool = SchedPool::new(2);
        let thread = PiThread::new(Arc::new(ForeverWaiting), 1, 1);
        pool.spawn(thread);
        pool.run();
        assert!(pool.is_quiescent_deadlock());
        assert_eq!(pool.active_count(), 1, "thread never reaches ENDED");
    }
}
