//! The six end-to-end scenarios: single rendezvous, choice with one enabled
//! branch, contended receive, fuel yield, reclamation under transfer, and
//! quiescent deadlock detection.
//!
//! Each test builds a fresh `SchedPool` and drives it with `Proc`
//! implementations written the way generated code would be: a `match` on
//! `pc` in a loop, registering commits via `perform_choice` and returning to
//! the scheduler at a suspension point. No `tokio-test`/`proptest` --
//! `std::sync::atomic` types are enough to observe outcomes from outside.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use pi_rt::{
    perform_choice, Branch, Channel, ChoiceOutcome, EvalFn, FuelOutcome, Guard, Label, PiThread,
    Proc, SchedPool, Status, StepOutcome, Value, DEFAULT_FUEL,
};

/// `out(channel, value); end` -- a one-shot sender of a constant `Value::Int`.
struct SendIntProc {
    channel: Arc<Channel>,
    value: i64,
}

impl Proc for SendIntProc {
    fn run(&self, thread: &Arc<PiThread>, pool: &SchedPool) -> StepOutcome {
        loop {
            match &*thread.pc() {
                "start" => {
                    let channel = Arc::clone(&self.channel);
                    let value = self.value;
                    let eval: EvalFn = Arc::new(move |_: &[Value]| Value::Int(value));
                    let branches = [Branch {
                        guard: Guard::Output { channel, eval },
                        enabled: true,
                        cont_pc: Label::from("sent"),
                    }];
                    match perform_choice(thread, pool, &branches) {
                        ChoiceOutcome::Waiting => return StepOutcome::Waiting,
                        ChoiceOutcome::Committed(_) | ChoiceOutcome::CommittedExternally => continue,
                    }
                }
                "sent" => {
                    self.channel.decr_ref();
                    return StepOutcome::Ended;
                }
                other => unreachable!("sender reached unknown pc {other}"),
            }
        }
    }
}

// ── Scenario 1: single rendezvous ──────────────────────────────────────

struct RecvIntProc {
    channel: Arc<Channel>,
    received: Arc<AtomicI64>,
}

impl Proc for RecvIntProc {
    fn run(&self, thread: &Arc<PiThread>, pool: &SchedPool) -> StepOutcome {
        loop {
            match &*thread.pc() {
                "start" => {
                    let channel = Arc::clone(&self.channel);
                    let branches = [Branch {
                        guard: Guard::Input { channel, refvar: 0 },
                        enabled: true,
                        cont_pc: Label::from("received"),
                    }];
                    match perform_choice(thread, pool, &branches) {
                        ChoiceOutcome::Waiting => return StepOutcome::Waiting,
                        ChoiceOutcome::Committed(_) | ChoiceOutcome::CommittedExternally => continue,
                    }
                }
                "received" => {
                    if let Value::Int(n) = thread.env_get(0) {
                        self.received.store(n, Ordering::SeqCst);
                    }
                    self.channel.decr_ref();
                    return StepOutcome::Ended;
                }
                other => unreachable!("receiver reached unknown pc {other}"),
            }
        }
    }
}

#[test]
fn single_rendezvous() {
    let pool = SchedPool::new(1);
    let channel = Channel::create(2);
    let received = Arc::new(AtomicI64::new(i64::MIN));

    let sender = PiThread::new(Arc::new(SendIntProc { channel: Arc::clone(&channel), value: 7 }), 0, 1);
    let receiver = PiThread::new(
        Arc::new(RecvIntProc { channel: Arc::clone(&channel), received: Arc::clone(&received) }),
        1,
        1,
    );

    pool.spawn(sender);
    pool.spawn(receiver);
    pool.run();

    assert_eq!(received.load(Ordering::SeqCst), 7);
    assert_eq!(pool.active_count(), 0);
    assert!(!pool.is_quiescent_deadlock());
    assert_eq!(channel.global_rc(), 0);
    assert!(channel.is_reclaimed());
}

// ── Scenario 2: choice with one enabled branch ─────────────────────────

struct TwoWayChoiceProc {
    c1: Arc<Channel>,
    c2: Arc<Channel>,
    branch_taken: Arc<AtomicUsize>,
    bound: Arc<AtomicI64>,
}

impl Proc for TwoWayChoiceProc {
    fn run(&self, thread: &Arc<PiThread>, pool: &SchedPool) -> StepOutcome {
        loop {
            match &*thread.pc() {
                "start" => {
                    let branches = [
                        Branch {
                            guard: Guard::Input { channel: Arc::clone(&self.c1), refvar: 0 },
                            enabled: true,
                            cont_pc: Label::from("from_c1"),
                        },
                        Branch {
                            guard: Guard::Input { channel: Arc::clone(&self.c2), refvar: 0 },
                            enabled: true,
                            cont_pc: Label::from("from_c2"),
                        },
                    ];
                    match perform_choice(thread, pool, &branches) {
                        ChoiceOutcome::Waiting => return StepOutcome::Waiting,
                        ChoiceOutcome::Committed(_) | ChoiceOutcome::CommittedExternally => continue,
                    }
                }
                "from_c1" => {
                    self.branch_taken.store(1, Ordering::SeqCst);
                    if let Value::Int(n) = thread.env_get(0) {
                        self.bound.store(n, Ordering::SeqCst);
                    }
                    return StepOutcome::Ended;
                }
                "from_c2" => {
                    self.branch_taken.store(2, Ordering::SeqCst);
                    if let Value::Int(n) = thread.env_get(0) {
                        self.bound.store(n, Ordering::SeqCst);
                    }
                    return StepOutcome::Ended;
                }
                other => unreachable!("chooser reached unknown pc {other}"),
            }
        }
    }
}

#[test]
fn choice_with_one_enabled_branch() {
    let pool = SchedPool::new(2);
    let c1 = Channel::create(1);
    let c2 = Channel::create(2);
    let branch_taken = Arc::new(AtomicUsize::new(0));
    let bound = Arc::new(AtomicI64::new(i64::MIN));

    let chooser = PiThread::new(
        Arc::new(TwoWayChoiceProc {
            c1: Arc::clone(&c1),
            c2: Arc::clone(&c2),
            branch_taken: Arc::clone(&branch_taken),
            bound: Arc::clone(&bound),
        }),
        1,
        2,
    );
    let sender = PiThread::new(Arc::new(SendIntProc { channel: Arc::clone(&c2), value: 99 }), 0, 1);

    pool.spawn(chooser);
    pool.spawn(sender);
    pool.run();

    assert_eq!(branch_taken.load(Ordering::SeqCst), 2);
    assert_eq!(bound.load(Ordering::SeqCst), 99);

    // The chooser's stale commit on c1 is still physically queued until the
    // next scan sweeps it -- it was never delivered to, and never removed
    // from c1's side.
    assert_eq!(c1.incommits_len(), 1);
    assert!(c1.dequeue_valid_in().is_none(), "stale commit must be swept, not returned");
    assert_eq!(c1.incommits_len(), 0);
}

// ── Scenario 3: contended receive ──────────────────────────────────────

struct ContendedRecvProc {
    channel: Arc<Channel>,
    won_count: Arc<AtomicUsize>,
    got: Arc<AtomicI64>,
}

impl Proc for ContendedRecvProc {
    fn run(&self, thread: &Arc<PiThread>, pool: &SchedPool) -> StepOutcome {
        loop {
            match &*thread.pc() {
                "start" => {
                    let channel = Arc::clone(&self.channel);
                    let branches = [Branch {
                        guard: Guard::Input { channel, refvar: 0 },
                        enabled: true,
                        cont_pc: Label::from("received"),
                    }];
                    match perform_choice(thread, pool, &branches) {
                        ChoiceOutcome::Waiting => return StepOutcome::Waiting,
                        ChoiceOutcome::Committed(_) | ChoiceOutcome::CommittedExternally => continue,
                    }
                }
                "received" => {
                    self.won_count.fetch_add(1, Ordering::SeqCst);
                    if let Value::Int(n) = thread.env_get(0) {
                        self.got.store(n, Ordering::SeqCst);
                    }
                    return StepOutcome::Ended;
                }
                other => unreachable!("receiver reached unknown pc {other}"),
            }
        }
    }
}

#[test]
fn contended_receive() {
    let pool = SchedPool::new(2);
    let channel = Channel::create(3);
    let won_count = Arc::new(AtomicUsize::new(0));
    let got = Arc::new(AtomicI64::new(i64::MIN));

    let r1 = PiThread::new(
        Arc::new(ContendedRecvProc { channel: Arc::clone(&channel), won_count: Arc::clone(&won_count), got: Arc::clone(&got) }),
        1,
        1,
    );
    let r2 = PiThread::new(
        Arc::new(ContendedRecvProc { channel: Arc::clone(&channel), won_count: Arc::clone(&won_count), got: Arc::clone(&got) }),
        1,
        1,
    );
    let s = PiThread::new(Arc::new(SendIntProc { channel: Arc::clone(&channel), value: 1 }), 0, 1);

    let r1_handle = Arc::clone(&r1);
    let r2_handle = Arc::clone(&r2);

    pool.spawn(r1);
    pool.spawn(r2);
    pool.spawn(s);
    pool.run();

    assert_eq!(won_count.load(Ordering::SeqCst), 1, "exactly one receiver must win the race");
    assert_eq!(got.load(Ordering::SeqCst), 1);
    assert!(pool.is_quiescent_deadlock());
    assert_eq!(pool.active_count(), 1, "the losing receiver is parked forever");

    let (winner, loser) = if r1_handle.status() == Status::Wait {
        (&r2_handle, &r1_handle)
    } else {
        (&r1_handle, &r2_handle)
    };
    assert_eq!(loser.status(), Status::Wait);
    assert_eq!(loser.clock().load(), 0, "the loser's clock was never claimed");
    assert_eq!(winner.clock().load(), 1, "the winner's clock was claimed exactly once");
    assert_eq!(channel.incommits_len(), 1, "the loser's still-valid commit remains queued");
}

// ── Scenario 4: fuel yield ──────────────────────────────────────────────

struct TightLoopProc {
    total_iters: u64,
    progress: Arc<AtomicU64>,
    yields: Arc<AtomicU64>,
}

impl Proc for TightLoopProc {
    fn run(&self, thread: &Arc<PiThread>, _pool: &SchedPool) -> StepOutcome {
        loop {
            if self.progress.load(Ordering::SeqCst) >= self.total_iters {
                return StepOutcome::Ended;
            }
            self.progress.fetch_add(1, Ordering::SeqCst);
            if matches!(thread.tick_fuel(), FuelOutcome::Yield) {
                self.yields.fetch_add(1, Ordering::SeqCst);
                return StepOutcome::Yielded;
            }
        }
    }
}

struct MarkDoneProc {
    done: Arc<AtomicBool>,
}

impl Proc for MarkDoneProc {
    fn run(&self, _thread: &Arc<PiThread>, _pool: &SchedPool) -> StepOutcome {
        self.done.store(true, Ordering::SeqCst);
        StepOutcome::Ended
    }
}

#[test]
fn fuel_yield_reenqueues_and_lets_other_thread_run() {
    let pool = SchedPool::new(2);
    let progress = Arc::new(AtomicU64::new(0));
    let yields = Arc::new(AtomicU64::new(0));
    let total_iters = u64::from(DEFAULT_FUEL) * 2 + 10;

    let looper = PiThread::new(
        Arc::new(TightLoopProc { total_iters, progress: Arc::clone(&progress), yields: Arc::clone(&yields) }),
        0,
        0,
    );
    let done = Arc::new(AtomicBool::new(false));
    let other = PiThread::new(Arc::new(MarkDoneProc { done: Arc::clone(&done) }), 0, 0);

    pool.spawn(looper);
    pool.spawn(other);
    pool.run();

    assert_eq!(progress.load(Ordering::SeqCst), total_iters);
    assert!(yields.load(Ordering::SeqCst) >= 2, "the loop must cross the fuel budget more than once");
    assert!(done.load(Ordering::SeqCst), "the second thread must run to completion");
    assert_eq!(pool.active_count(), 0);
}

// ── Scenario 5: reclamation under transfer ─────────────────────────────

struct SendChannelProc {
    ch: Arc<Channel>,
    payload: Arc<Channel>,
}

impl Proc for SendChannelProc {
    fn run(&self, thread: &Arc<PiThread>, pool: &SchedPool) -> StepOutcome {
        loop {
            match &*thread.pc() {
                "start" => {
                    let channel = Arc::clone(&self.ch);
                    let payload = Arc::clone(&self.payload);
                    let eval: EvalFn = Arc::new(move |_: &[Value]| Value::Channel(Arc::clone(&payload)));
                    let branches = [Branch {
                        guard: Guard::Output { channel, eval },
                        enabled: true,
                        cont_pc: Label::from("sent"),
                    }];
                    match perform_choice(thread, pool, &branches) {
                        ChoiceOutcome::Waiting => return StepOutcome::Waiting,
                        ChoiceOutcome::Committed(_) | ChoiceOutcome::CommittedExternally => continue,
                    }
                }
                "sent" => {
                    // This thread's names to both the transfer channel and
                    // the transferred payload end with it.
                    self.ch.decr_ref();
                    self.payload.decr_ref();
                    return StepOutcome::Ended;
                }
                other => unreachable!("sender reached unknown pc {other}"),
            }
        }
    }
}

struct ReceiveChannelProc {
    ch: Arc<Channel>,
    hold: Arc<Channel>,
    received: Arc<Mutex<Option<Arc<Channel>>>>,
}

impl Proc for ReceiveChannelProc {
    fn run(&self, thread: &Arc<PiThread>, pool: &SchedPool) -> StepOutcome {
        loop {
            match &*thread.pc() {
                "start" => {
                    let channel = Arc::clone(&self.ch);
                    let branches = [Branch {
                        guard: Guard::Input { channel, refvar: 0 },
                        enabled: true,
                        cont_pc: Label::from("received"),
                    }];
                    match perform_choice(thread, pool, &branches) {
                        ChoiceOutcome::Waiting => return StepOutcome::Waiting,
                        ChoiceOutcome::Committed(_) | ChoiceOutcome::CommittedExternally => continue,
                    }
                }
                "received" => {
                    if let Value::Channel(c) = thread.env_get(0) {
                        *self.received.lock().unwrap() = Some(c);
                    }
                    self.ch.decr_ref();
                    thread.set_pc(Label::from("hold_forever"));
                    continue;
                }
                "hold_forever" => {
                    // Keeps the payload's name alive past the end of the
                    // transfer step instead of ending the thread, so the
                    // test can observe the post-transfer refcount.
                    let channel = Arc::clone(&self.hold);
                    let branches = [Branch {
                        guard: Guard::Input { channel, refvar: 1 },
                        enabled: true,
                        cont_pc: Label::from("unreachable"),
                    }];
                    match perform_choice(thread, pool, &branches) {
                        ChoiceOutcome::Waiting => return StepOutcome::Waiting,
                        _ => unreachable!("the hold channel has no counterpart"),
                    }
                }
                other => unreachable!("receiver reached unknown pc {other}"),
            }
        }
    }
}

#[test]
fn reclamation_under_transfer() {
    let pool = SchedPool::new(2);
    let ch = Channel::create(2);
    let payload = Channel::create(1);
    let hold = Channel::create(1);
    let received = Arc::new(Mutex::new(None));

    let a = PiThread::new(Arc::new(SendChannelProc { ch: Arc::clone(&ch), payload: Arc::clone(&payload) }), 0, 1);
    let b = PiThread::new(
        Arc::new(ReceiveChannelProc { ch: Arc::clone(&ch), hold: Arc::clone(&hold), received: Arc::clone(&received) }),
        2,
        2,
    );

    pool.spawn(a);
    pool.spawn(b);
    pool.run();

    assert!(pool.is_quiescent_deadlock());
    assert_eq!(pool.active_count(), 1, "B holds the payload's name forever");

    // 1 (A's initial hold) -> 2 (B acquires on delivery) -> 1 (A ends).
    assert_eq!(payload.global_rc(), 1);
    assert!(!payload.is_reclaimed(), "B's name keeps the payload live");

    let got = received.lock().unwrap();
    assert!(got.as_ref().is_some_and(|c| Arc::ptr_eq(c, &payload)));
}

// ── Scenario 6: quiescent deadlock detection ───────────────────────────

struct WaitForeverProc {
    channel: Arc<Channel>,
}

impl Proc for WaitForeverProc {
    fn run(&self, thread: &Arc<PiThread>, pool: &SchedPool) -> StepOutcome {
        let channel = Arc::clone(&self.channel);
        let branches = [Branch {
            guard: Guard::Input { channel, refvar: 0 },
            enabled: true,
            cont_pc: Label::from("never"),
        }];
        match perform_choice(thread, pool, &branches) {
            ChoiceOutcome::Waiting => StepOutcome::Waiting,
            _ => unreachable!("no counterpart exists to commit"),
        }
    }
}

#[test]
fn quiescent_deadlock_detection() {
    let pool = SchedPool::new(2);
    let c1 = Channel::create(1);
    let c2 = Channel::create(1);

    let t1 = PiThread::new(Arc::new(WaitForeverProc { channel: Arc::clone(&c1) }), 1, 1);
    let t2 = PiThread::new(Arc::new(WaitForeverProc { channel: Arc::clone(&c2) }), 1, 1);

    pool.spawn(t1);
    pool.spawn(t2);
    pool.run();

    assert!(pool.is_quiescent_deadlock());
    assert_eq!(pool.active_count(), 2, "neither thread ever reaches ENDED");
}
