//! Pi-calculus runtime engine.
//!
//! This crate provides the scheduler, channel rendezvous, and commitment
//! protocol a compiled pi-calculus program's generated code calls at
//! runtime. It is compiled as both:
//!
//! - A static library (`libpi_rt.a`) for linking into a compiled program
//! - A Rust library (`lib`) for unit and integration testing
//!
//! ## Modules
//!
//! - [`atomics`]: compare-and-swap primitives and the per-thread [`Clock`]
//! - [`value`]: the dynamically typed value carried across a rendezvous
//! - [`channel`]: the rendezvous point (two commit queues, a refcount)
//! - [`commit`]: registered communication intents and the try/claim protocol
//! - [`knowns`]: per-thread channel-name bookkeeping for the refcount walk
//! - [`process`]: the scheduled unit (`PiThread`) and the choice algorithm
//! - [`scheduler`]: the fixed worker pool
//!
//! ## ABI Contract
//!
//! All public `extern "C"` functions in this crate form the runtime ABI.
//! A compiled program calls these functions directly via its own codegen.
//! The function signatures must remain stable across compiler versions (or
//! at least across a single phase).

pub mod atomics;
pub mod channel;
pub mod commit;
pub mod error;
pub mod knowns;
pub mod process;
pub mod scheduler;
pub mod value;

pub use atomics::Clock;
pub use channel::{Channel, ChannelId};
pub use commit::{try_input, try_output, Commit, EvalFn, TryOutcome};
pub use error::PiRtError;
pub use process::{
    perform_choice, Branch, ChoiceOutcome, FuelOutcome, Guard, Label, PiThread, Proc, Status,
    StepOutcome, DEFAULT_FUEL,
};
pub use scheduler::SchedPool;
pub use value::Value;

use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

// ---------------------------------------------------------------------------
// Global runtime state
// ---------------------------------------------------------------------------

/// The global worker pool, initialized by `pirt_init()`.
static GLOBAL_POOL: OnceLock<Arc<SchedPool>> = OnceLock::new();

/// Opaque-handle registries: the ABI hands out `u64`s rather than raw
/// pointers so a caller on the other side of the boundary never has to
/// know `Arc<Channel>`/`Arc<PiThread>` exist.
static CHANNEL_TABLE: OnceLock<Mutex<FxHashMap<u64, Arc<Channel>>>> = OnceLock::new();
static THREAD_TABLE: OnceLock<Mutex<FxHashMap<u64, Arc<PiThread>>>> = OnceLock::new();

fn channel_table() -> &'static Mutex<FxHashMap<u64, Arc<Channel>>> {
    CHANNEL_TABLE.get_or_init(|| Mutex::new(FxHashMap::default()))
}

fn thread_table() -> &'static Mutex<FxHashMap<u64, Arc<PiThread>>> {
    THREAD_TABLE.get_or_init(|| Mutex::new(FxHashMap::default()))
}

/// Returns the global pool, or `Err` if `pirt_init` has not run yet.
///
/// The `extern "C"` wrappers below `.expect()` this (FFI has no `Result`
/// to hand back), but it is `pub` so in-process Rust callers -- tests, or
/// a future safe wrapper crate -- can handle `PiRtError::NotInitialized`
/// without a panic.
pub fn global_pool() -> Result<&'static Arc<SchedPool>, PiRtError> {
    GLOBAL_POOL.get().ok_or(PiRtError::NotInitialized)
}

fn lookup_channel(handle: u64) -> Arc<Channel> {
    channel_table()
        .lock()
        .get(&handle)
        .cloned()
        .unwrap_or_else(|| panic!("pi-rt: unknown channel handle {handle}"))
}

fn lookup_thread(handle: u64) -> Arc<PiThread> {
    thread_table()
        .lock()
        .get(&handle)
        .cloned()
        .unwrap_or_else(|| panic!("pi-rt: unknown thread handle {handle}"))
}

// ---------------------------------------------------------------------------
// C-compatible value encoding
// ---------------------------------------------------------------------------

/// Tag discriminant for [`CValue`]. `Str`/`Tuple` do not cross the ABI
/// boundary -- in-process Rust callers use [`Value`] directly, and a
/// compiled program's generated code is expected to box composite payloads
/// behind a channel the way the reference semantics already require for
/// anything beyond a scalar; this is the minimal scalar slice the ABI
/// commits to.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum CValueTag {
    NoValue = 0,
    Bool = 1,
    Int = 2,
    Float = 3,
    Channel = 4,
}

/// A C-compatible, fixed-layout stand-in for [`Value`], used only at the
/// `extern "C"` boundary (`pirt_register_output_commit`'s eval callback and
/// the `env` slice it is given).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CValue {
    pub tag: CValueTag,
    pub int_val: i64,
    pub float_val: f64,
    pub bool_val: bool,
    pub channel_handle: u64,
}

impl CValue {
    pub const fn novalue() -> CValue {
        CValue {
            tag: CValueTag::NoValue,
            int_val: 0,
            float_val: 0.0,
            bool_val: false,
            channel_handle: 0,
        }
    }

    fn from_value(v: &Value) -> CValue {
        match v {
            Value::NoValue => CValue::novalue(),
            Value::Bool(b) => CValue { tag: CValueTag::Bool, bool_val: *b, ..CValue::novalue() },
            Value::Int(i) => CValue { tag: CValueTag::Int, int_val: *i, ..CValue::novalue() },
            Value::Float(f) => CValue { tag: CValueTag::Float, float_val: *f, ..CValue::novalue() },
            Value::Channel(c) => {
                let handle = c.id().as_u64();
                channel_table().lock().entry(handle).or_insert_with(|| Arc::clone(c));
                CValue { tag: CValueTag::Channel, channel_handle: handle, ..CValue::novalue() }
            }
            Value::Str(_) | Value::Tuple(_) => CValue::novalue(),
        }
    }

    fn into_value(self) -> Value {
        match self.tag {
            CValueTag::NoValue => Value::NoValue,
            CValueTag::Bool => Value::Bool(self.bool_val),
            CValueTag::Int => Value::Int(self.int_val),
            CValueTag::Float => Value::Float(self.float_val),
            CValueTag::Channel => Value::Channel(lookup_channel(self.channel_handle)),
        }
    }
}

/// Build a `cont_pc` [`Label`] from a raw UTF-8 byte span.
///
/// # Safety
///
/// `ptr` must point to `len` valid UTF-8 bytes that outlive this call (the
/// label is copied, so the caller's buffer need not outlive the return).
unsafe fn label_from_raw(ptr: *const u8, len: u64) -> Label {
    let bytes = std::slice::from_raw_parts(ptr, len as usize);
    let s = std::str::from_utf8(bytes).expect("pi-rt: cont_pc must be valid UTF-8");
    Label::from(s)
}

/// A compiled procedure's entry point. Called with the spawning thread's
/// opaque handle; returns a [`StepOutcome`] tag (0 = Yielded, 1 = Waiting,
/// 2 = Ended). The implementation is expected to `match` on
/// `pirt_thread_pc`-style state internally and call back into
/// `pirt_try_input`/`pirt_try_output`/`pirt_thread_yield` as needed --
/// generated code is an external collaborator.
pub type PiProcFn = extern "C" fn(thread_handle: u64) -> u8;

/// Adapts a raw [`PiProcFn`] to the [`Proc`] trait. `extern "C" fn` values
/// are always `Send + Sync`, so no unsafe impl is needed here (contrast
/// `snow-rt`'s `SpawnRequest`, which wraps a raw data pointer and does need
/// one).
struct CProc {
    entry: PiProcFn,
}

impl Proc for CProc {
    fn run(&self, thread: &Arc<PiThread>, _pool: &SchedPool) -> StepOutcome {
        match (self.entry)(thread.id().as_u64()) {
            0 => StepOutcome::Yielded,
            1 => StepOutcome::Waiting,
            2 => StepOutcome::Ended,
            other => panic!("pi-rt: proc entry returned invalid step outcome tag {other}"),
        }
    }
}

fn make_eval_fn(eval: PiEvalFn) -> EvalFn {
    Arc::new(move |env: &[Value]| -> Value {
        let c_env: Vec<CValue> = env.iter().map(CValue::from_value).collect();
        let mut out = CValue::novalue();
        eval(c_env.as_ptr(), c_env.len() as u64, &mut out as *mut CValue);
        out.into_value()
    })
}

/// An output guard's value-producing callback: given the sending thread's
/// environment (as [`CValue`]s), writes the value to send into `out`.
pub type PiEvalFn = extern "C" fn(env: *const CValue, env_len: u64, out: *mut CValue);

// ---------------------------------------------------------------------------
// extern "C" ABI functions
// ---------------------------------------------------------------------------

/// Initialize the global worker pool.
///
/// Must be called before any other `pirt_*` function. Idempotent --
/// subsequent calls are no-ops, matching `snow-rt`'s `snow_rt_init_actor`.
///
/// If `nb_workers` is 0, defaults to the number of available CPU cores.
#[no_mangle]
pub extern "C" fn pirt_init(nb_workers: u32) {
    GLOBAL_POOL.get_or_init(|| SchedPool::new(nb_workers));
}

/// Run every spawned thread to completion.
///
/// Blocks until every thread reaches ENDED, or until the pool detects
/// quiescent deadlock (every worker idle, no ready thread, but some thread
/// remains parked forever). Returns `0` for the former, `1` for the latter.
///
/// # Panics
///
/// Panics if `pirt_init` has not been called.
#[no_mangle]
pub extern "C" fn pirt_run() -> u8 {
    let pool = global_pool().expect("pi-rt: runtime not initialized -- call pirt_init() first");
    pool.run();
    if pool.is_quiescent_deadlock() {
        1
    } else {
        0
    }
}

/// Tear down the global pool's worker threads started via `start()`-style
/// use (no-op after `pirt_run`, which already blocks to completion).
#[no_mangle]
pub extern "C" fn pirt_shutdown() {
    if let Some(pool) = GLOBAL_POOL.get() {
        pool.join();
    }
}

/// Create a new channel with one outstanding name (the handle returned to
/// the caller) and return its opaque handle.
#[no_mangle]
pub extern "C" fn pirt_channel_create() -> u64 {
    let channel = Channel::create(1);
    let handle = channel.id().as_u64();
    channel_table().lock().insert(handle, channel);
    handle
}

#[no_mangle]
pub extern "C" fn pirt_channel_incr_ref(channel_handle: u64) {
    lookup_channel(channel_handle).incr_ref();
}

#[no_mangle]
pub extern "C" fn pirt_channel_decr_ref(channel_handle: u64) {
    let channel = lookup_channel(channel_handle);
    channel.decr_ref();
    if channel.is_reclaimed() {
        channel_table().lock().remove(&channel_handle);
    }
}

/// Spawn a new pi-thread running `proc_fn`, with `env_size` environment
/// slots and room for `enable_size` choice branches. Returns its opaque
/// handle.
#[no_mangle]
pub extern "C" fn pirt_thread_spawn(proc_fn: PiProcFn, env_size: u64, enable_size: u64) -> u64 {
    let pool = global_pool().expect("pi-rt: runtime not initialized -- call pirt_init() first");
    let proc = Arc::new(CProc { entry: proc_fn });
    let thread = PiThread::new(proc, env_size as usize, enable_size as usize);
    let handle = thread.id().as_u64();
    thread_table().lock().insert(handle, Arc::clone(&thread));
    pool.spawn(thread);
    handle
}

/// Decrement the calling thread's fuel; returns `1` if the caller must
/// return `StepOutcome::Yielded` (tag `0`) immediately, `0` to keep going.
/// Inserted by a compiler at loop back-edges, mirroring `snow-rt`'s
/// `snow_reduction_check` -- without stackful coroutines, the generated
/// code itself must be the one to return control to the scheduler.
#[no_mangle]
pub extern "C" fn pirt_thread_yield(thread_handle: u64) -> u8 {
    match lookup_thread(thread_handle).tick_fuel() {
        FuelOutcome::Continue => 0,
        FuelOutcome::Yield => 1,
    }
}

/// Register an input commit (`in(channel, refvar)`) and return its opaque
/// sequence number, to be passed to a subsequent `pirt_try_input`.
///
/// # Safety
///
/// `cont_pc`/`cont_pc_len` must describe a valid UTF-8 byte span.
#[no_mangle]
pub unsafe extern "C" fn pirt_register_input_commit(
    thread_handle: u64,
    channel_handle: u64,
    refvar: u64,
    cont_pc: *const u8,
    cont_pc_len: u64,
) -> u64 {
    let thread = lookup_thread(thread_handle);
    let channel = lookup_channel(channel_handle);
    let cont_pc = label_from_raw(cont_pc, cont_pc_len);
    let commit = Commit::make_in(&thread, &channel, refvar as usize, cont_pc);
    let seq = commit.seq();
    channel.register_in(commit);
    seq
}

/// Register an output commit (`out(channel, eval)`) and return its opaque
/// sequence number, to be passed to a subsequent `pirt_try_output`.
///
/// # Safety
///
/// `cont_pc`/`cont_pc_len` must describe a valid UTF-8 byte span.
#[no_mangle]
pub unsafe extern "C" fn pirt_register_output_commit(
    thread_handle: u64,
    channel_handle: u64,
    eval: PiEvalFn,
    cont_pc: *const u8,
    cont_pc_len: u64,
) -> u64 {
    let thread = lookup_thread(thread_handle);
    let channel = lookup_channel(channel_handle);
    let cont_pc = label_from_raw(cont_pc, cont_pc_len);
    let commit = Commit::make_out(&thread, &channel, make_eval_fn(eval), cont_pc);
    let seq = commit.seq();
    channel.register_out(commit);
    seq
}

/// Attempt to complete a previously registered input commit immediately.
///
/// Returns `1` on success, `0` on `NoMatch`. On success, the calling thread's
/// other pending commits for this choice are invalidated and its `pc` is set
/// to `cont_pc` -- the same bookkeeping [`perform_choice`] performs, exposed
/// here for generated code driving its own choice loop directly against the
/// register/try primitives.
///
/// # Safety
///
/// `cont_pc`/`cont_pc_len` must describe a valid UTF-8 byte span.
#[no_mangle]
pub unsafe extern "C" fn pirt_try_input(
    thread_handle: u64,
    channel_handle: u64,
    seq: u64,
    cont_pc: *const u8,
    cont_pc_len: u64,
) -> u8 {
    let channel = lookup_channel(channel_handle);
    let pool = global_pool().expect("pi-rt: runtime not initialized -- call pirt_init() first");
    match try_input(&channel, seq, pool) {
        TryOutcome::Committed => {
            lookup_thread(thread_handle).commit_won(label_from_raw(cont_pc, cont_pc_len));
            1
        }
        TryOutcome::NoMatch => 0,
    }
}

/// Attempt to complete a previously registered output commit immediately.
/// Returns `1` on success, `0` on `NoMatch`. See [`pirt_try_input`] for the
/// on-success bookkeeping this performs.
///
/// # Safety
///
/// `cont_pc`/`cont_pc_len` must describe a valid UTF-8 byte span.
#[no_mangle]
pub unsafe extern "C" fn pirt_try_output(
    thread_handle: u64,
    channel_handle: u64,
    seq: u64,
    cont_pc: *const u8,
    cont_pc_len: u64,
) -> u8 {
    let channel = lookup_channel(channel_handle);
    let pool = global_pool().expect("pi-rt: runtime not initialized -- call pirt_init() first");
    match try_output(&channel, seq, pool) {
        TryOutcome::Committed => {
            lookup_thread(thread_handle).commit_won(label_from_raw(cont_pc, cont_pc_len));
            1
        }
        TryOutcome::NoMatch => 0,
    }
}

#[no_mangle]
pub extern "C" fn pirt_knowns_add(thread_handle: u64, channel_handle: u64) {
    lookup_thread(thread_handle).knowns_add(lookup_channel(channel_handle));
}

#[no_mangle]
pub extern "C" fn pirt_knowns_forget(thread_handle: u64, channel_handle: u64) {
    lookup_thread(thread_handle).knowns_forget(lookup_channel(channel_handle).id());
}

#[no_mangle]
pub extern "C" fn pirt_knowns_commit(thread_handle: u64) {
    lookup_thread(thread_handle).knowns_commit();
}
