//! PiThread: the scheduled unit, and the try/commit step that drives a
//! choice to completion or parks the thread.
//!
//! Grounded on `snow-rt`'s `actor/process.rs` (the process control block:
//! id, status, mailbox/env, links become `commits`/`knowns`) generalized
//! from an actor's single mailbox to a pi-thread's environment, enable
//! vector, and pending-commit set. The fuel counter mirrors
//! `DEFAULT_REDUCTIONS`/`snow_reduction_check` in `snow-rt`'s
//! `actor/mod.rs`, renamed to this runtime's own vocabulary.
//!
//! A pi-thread's "procedure" is a compiler-generated *labeled state
//! machine*, not arbitrary recursive code, so there is no need for
//! `snow-rt`'s stackful `corosensei` coroutines here. A [`Proc`]
//! implementation simply runs a `match` on `pc` in a loop, checking
//! [`PiThread::tick_fuel`] at each back-edge, and returns to the scheduler
//! at one of three suspension points (parked waiting on a channel, fuel
//! exhausted, or reached its final label) -- plain control flow is enough.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::atomics::Clock;
use crate::channel::{Channel, ChannelId};
use crate::commit::{try_input, try_output, Commit, EvalFn, TryOutcome};
use crate::knowns::KnownSet;
use crate::scheduler::SchedPool;
use crate::value::Value;

/// A program-counter label. Compiler-generated in a real upstream
/// compiler; an opaque, cheaply-cloned string here.
pub type Label = Arc<str>;

/// Number of fuel units a freshly (re)scheduled thread gets before it must
/// voluntarily yield. Matches `snow-rt`'s `DEFAULT_REDUCTIONS`.
pub const DEFAULT_FUEL: u32 = 4000;

/// Process-wide unique thread identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(u64);

impl ThreadId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        ThreadId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl ThreadId {
    /// Raw numeric form, used by the `extern "C"` ABI to hand out opaque
    /// thread handles.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ThreadId({})", self.0)
    }
}

/// Execution state of a [`PiThread`]. `Call` is reserved for a sub-procedure
/// call frame a real compiled program would push; our Proc implementations
/// never produce it, but the runtime carries the state so it isn't silently
/// narrowed away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Run,
    Call,
    Wait,
    Ended,
}

/// One channel a thread has registered (but not yet resolved) a commit on.
struct PendingCommit {
    seq: u64,
    channel: Arc<Channel>,
}

struct Inner {
    status: Status,
    env: Vec<Value>,
    knowns: KnownSet,
    enable: Vec<bool>,
    commits: Vec<PendingCommit>,
    pc: Label,
    fuel: u32,
}

/// The scheduled unit: a program counter, an environment, an enable vector
/// recording which choice branches were live on the last attempt, the set of
/// commits it currently has registered, and the clock that invalidates them.
pub struct PiThread {
    id: ThreadId,
    clock: Clock,
    proc: Arc<dyn Proc>,
    inner: Mutex<Inner>,
}

impl PiThread {
    pub fn new(proc: Arc<dyn Proc>, env_size: usize, enable_size: usize) -> Arc<PiThread> {
        Arc::new(PiThread {
            id: ThreadId::next(),
            clock: Clock::new(),
            proc,
            inner: Mutex::new(Inner {
                status: Status::Run,
                env: vec![Value::NoValue; env_size],
                knowns: KnownSet::new(),
                enable: vec![false; enable_size],
                commits: Vec::new(),
                pc: Label::from("start"),
                fuel: DEFAULT_FUEL,
            }),
        })
    }

    /// Construct a thread with a placeholder procedure, for unit tests that
    /// only need a `PiThread` to back a `Commit` and never actually run it.
    pub fn new_for_test(env_size: usize, enable_size: usize) -> Arc<PiThread> {
        struct NoopProc;
        impl Proc for NoopProc {
            fn run(&self, _thread: &Arc<PiThread>, _pool: &SchedPool) -> StepOutcome {
                panic!("NoopProc must never be scheduled")
            }
        }
        PiThread::new(Arc::new(NoopProc), env_size, enable_size)
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn proc(&self) -> &Arc<dyn Proc> {
        &self.proc
    }

    pub fn status(&self) -> Status {
        self.inner.lock().status
    }

    pub fn pc(&self) -> Label {
        self.inner.lock().pc.clone()
    }

    pub fn set_pc(&self, pc: Label) {
        self.inner.lock().pc = pc;
    }

    pub fn env_get(&self, idx: usize) -> Value {
        self.inner.lock().env[idx].clone()
    }

    pub fn env_set(&self, idx: usize, value: Value) {
        self.inner.lock().env[idx] = value;
    }

    pub fn env_snapshot(&self) -> Vec<Value> {
        self.inner.lock().env.clone()
    }

    pub fn env_len(&self) -> usize {
        self.inner.lock().env.len()
    }

    pub fn pending_commit_count(&self) -> usize {
        self.inner.lock().commits.len()
    }

    fn push_pending(&self, seq: u64, channel: Arc<Channel>) {
        self.inner.lock().commits.push(PendingCommit { seq, channel });
    }

    fn clear_pending(&self) {
        self.inner.lock().commits.clear();
    }

    fn set_enable(&self, enable: Vec<bool>) {
        self.inner.lock().enable = enable;
    }

    pub fn enable_vec(&self) -> Vec<bool> {
        self.inner.lock().enable.clone()
    }

    /// ABI: `knowns_add` -- the thread just acquired a new channel name this
    /// step; its `global_rc` bump is deferred to [`PiThread::knowns_commit`].
    pub fn knowns_add(&self, channel: Arc<Channel>) {
        self.inner.lock().knowns.add(channel);
    }

    /// ABI: `knowns_forget` -- the thread is dropping a channel name this
    /// step (its env slot was overwritten with something else).
    pub fn knowns_forget(&self, channel_id: ChannelId) {
        self.inner.lock().knowns.forget(channel_id);
    }

    /// ABI: `knowns_commit` -- walk the KnownSet once, applying every
    /// pending `incr_ref`/`decr_ref` accumulated since the last commit.
    pub fn knowns_commit(&self) {
        self.inner.lock().knowns.commit();
    }

    /// Decrement fuel; when it reaches zero, refill it and signal that the
    /// caller must return control to the scheduler.
    pub fn tick_fuel(&self) -> FuelOutcome {
        let mut inner = self.inner.lock();
        if inner.fuel == 0 {
            inner.fuel = DEFAULT_FUEL;
            FuelOutcome::Yield
        } else {
            inner.fuel -= 1;
            FuelOutcome::Continue
        }
    }

    /// Thread transitions to WAIT and publishes itself to the scheduler's
    /// wait set.
    fn park(self: &Arc<Self>, pool: &SchedPool) {
        self.inner.lock().status = Status::Wait;
        pool.park(Arc::clone(self));
    }

    /// Deposit `value` at `refvar`, advance `pc`, and -- if the thread was
    /// actually parked -- move it from wait to ready and wake a worker. If
    /// the owner had not yet parked (it is still inside its own register/try
    /// phase on another branch, racing a counterpart that claimed it first),
    /// leave its status alone: the owner will observe its own clock has
    /// advanced and pick up the new `pc` itself rather than be rescheduled
    /// out from under its own worker.
    pub(crate) fn deposit_and_wake(
        thread: &Arc<PiThread>,
        refvar: usize,
        value: Value,
        cont_pc: Label,
        pool: &SchedPool,
    ) {
        let mut old_named = Vec::new();
        let mut new_named = Vec::new();
        let was_waiting;
        {
            let mut inner = thread.inner.lock();
            inner.env[refvar].channels_named(&mut old_named);
            let old_ids: Vec<ChannelId> = old_named.iter().map(|c| c.id()).collect();
            value.channels_named(&mut new_named);
            let new_channels: Vec<Arc<Channel>> = new_named.iter().map(|c| Arc::clone(c)).collect();
            inner.env[refvar] = value;
            for id in old_ids {
                inner.knowns.forget(id);
            }
            for ch in new_channels {
                inner.knowns.mark_known(ch);
            }
            inner.pc = cont_pc;
            was_waiting = matches!(inner.status, Status::Wait);
            if was_waiting {
                inner.status = Status::Run;
            }
        }
        if was_waiting {
            pool.wake(Arc::clone(thread));
        }
    }

    /// Symmetric to [`PiThread::deposit_and_wake`] with no env write: used
    /// to resume the *other* side of a rendezvous whose output guard has no
    /// refvar of its own.
    pub(crate) fn resume_at(thread: &Arc<PiThread>, cont_pc: Label, pool: &SchedPool) {
        let was_waiting;
        {
            let mut inner = thread.inner.lock();
            inner.pc = cont_pc;
            was_waiting = matches!(inner.status, Status::Wait);
            if was_waiting {
                inner.status = Status::Run;
            }
        }
        if was_waiting {
            pool.wake(Arc::clone(thread));
        }
    }

    /// Finish resolving a choice this thread itself won synchronously:
    /// drop every other registered commit from bookkeeping, bump the clock
    /// (invalidating those commits for anyone still holding a reference to
    /// them), and advance `pc` to the winning branch's continuation. Shared
    /// by [`perform_choice`] and the ABI's raw `pirt_try_input`/
    /// `pirt_try_output` wrappers, which must perform the same bookkeeping a
    /// hand-rolled choice loop would.
    pub fn commit_won(self: &Arc<Self>, cont_pc: Label) {
        self.clear_pending();
        self.clock.bump();
        self.set_pc(cont_pc);
    }

    /// Thread transitions to ENDED: decrement every channel name it still
    /// holds and clear its pending commits, so a thread at ENDED never
    /// holds a live commit or a counted channel name.
    pub fn finish(thread: &Arc<PiThread>) {
        let mut inner = thread.inner.lock();
        debug_assert!(
            inner.commits.is_empty(),
            "thread {:?} ended with pending commits",
            thread.id
        );
        inner.knowns.forget_all();
        inner.status = Status::Ended;
    }
}

impl std::fmt::Debug for PiThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PiThread")
            .field("id", &self.id)
            .field("status", &inner.status)
            .field("pc", &inner.pc)
            .field("fuel", &inner.fuel)
            .finish()
    }
}

/// Remaining fuel outcome for one back-edge check.
pub enum FuelOutcome {
    Continue,
    Yield,
}

/// What a `Proc::run` call (one invocation from the scheduler) reports.
pub enum StepOutcome {
    /// Fuel exhausted; re-enqueue ready with fuel refilled.
    Yielded,
    /// Thread parked itself on one or more channels.
    Waiting,
    /// Thread reached its final label; `PiThread::finish` was called.
    Ended,
}

/// The compiler-generated procedure a [`PiThread`] executes. Concrete
/// bytecode or generated code is an external collaborator's job -- this
/// trait is the seam a real upstream compiler's codegen would implement;
/// the runtime only calls it.
pub trait Proc: Send + Sync {
    /// Run from the thread's current `pc` until it suspends: parked waiting
    /// on a channel, fuel exhausted, or reached its final label.
    fn run(&self, thread: &Arc<PiThread>, pool: &SchedPool) -> StepOutcome;
}

/// One guarded action of a choice.
pub enum Guard {
    Input { channel: Arc<Channel>, refvar: usize },
    Output { channel: Arc<Channel>, eval: EvalFn },
    /// A silent (tau) guard: always ready when enabled, degenerate case of
    /// the protocol with no counterpart to rendezvous with.
    Silent,
}

/// One branch of a pending choice.
pub struct Branch {
    pub guard: Guard,
    pub enabled: bool,
    pub cont_pc: Label,
}

/// Outcome of [`perform_choice`].
pub enum ChoiceOutcome {
    /// One of `branches` committed synchronously, identified by index.
    Committed(usize),
    /// A branch committed, but the claim arrived from a counterpart while
    /// this thread was still in its own register/try phase (concurrent
    /// contention before this thread ever reached WAIT). `pc` and the
    /// relevant env slot were already written by the claimant; follow
    /// [`PiThread::pc`] to find where to resume.
    CommittedExternally,
    /// Every branch's immediate try failed; the thread is now parked.
    Waiting,
}

/// The canonical try/commit step for a thread at a choice.
///
/// Silent guards are tried first as a degenerate case (always commit when
/// enabled, no registration needed). Otherwise: register a commit for
/// every enabled communication branch, then attempt each immediately in
/// registration order; on the first success, bump the thread's own clock
/// (invalidating every sibling commit) and return. If every attempt fails,
/// park the thread.
pub fn perform_choice(thread: &Arc<PiThread>, pool: &SchedPool, branches: &[Branch]) -> ChoiceOutcome {
    for (i, b) in branches.iter().enumerate() {
        if b.enabled && matches!(b.guard, Guard::Silent) {
            thread.set_pc(b.cont_pc.clone());
            thread.clock().bump();
            return ChoiceOutcome::Committed(i);
        }
    }

    let start_clock = thread.clock().load();
    thread.set_enable(branches.iter().map(|b| b.enabled).collect());

    struct Registered<'a> {
        idx: usize,
        channel: &'a Arc<Channel>,
        seq: u64,
        is_in: bool,
    }
    let mut registered: Vec<Registered> = Vec::new();

    for (i, b) in branches.iter().enumerate() {
        if !b.enabled {
            continue;
        }
        match &b.guard {
            Guard::Input { channel, refvar } => {
                let commit = Commit::make_in(thread, channel, *refvar, b.cont_pc.clone());
                let seq = commit.seq();
                channel.register_in(commit);
                thread.push_pending(seq, Arc::clone(channel));
                registered.push(Registered { idx: i, channel, seq, is_in: true });
            }
            Guard::Output { channel, eval } => {
                let commit = Commit::make_out(thread, channel, Arc::clone(eval), b.cont_pc.clone());
                let seq = commit.seq();
                channel.register_out(commit);
                thread.push_pending(seq, Arc::clone(channel));
                registered.push(Registered { idx: i, channel, seq, is_in: false });
            }
            Guard::Silent => {}
        }
    }

    for r in &registered {
        let outcome = if r.is_in {
            try_input(r.channel, r.seq, pool)
        } else {
            try_output(r.channel, r.seq, pool)
        };
        if matches!(outcome, TryOutcome::Committed) {
            // `try_input`'s own success path already writes our pc via
            // `wake_with_value`; `try_output`'s does not, since it only
            // touches the counterpart's thread. `commit_won` sets it
            // unconditionally so callers can rely on `thread.pc()` after any
            // `Committed` result without caring which guard direction fired.
            thread.commit_won(branches[r.idx].cont_pc.clone());
            return ChoiceOutcome::Committed(r.idx);
        }
        if thread.clock().load() != start_clock {
            thread.clear_pending();
            return ChoiceOutcome::CommittedExternally;
        }
    }

    if thread.clock().load() != start_clock {
        thread.clear_pending();
        return ChoiceOutcome::CommittedExternally;
    }

    thread.park(pool);
    ChoiceOutcome::Waiting
}
