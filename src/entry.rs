//! Native entry points
//!
//! Every compilable sequence owns an [`EntrySlot`]. Workers publish a loaded
//! function into it; the interpreter reads it without taking the engine
//! lock. A stale "not ready" read only costs one more interpreted call.

use std::ffi::c_void;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Signature of every generated function: execution context and interpreter
/// frame in, tagged outcome out.
pub type NativeFn = unsafe extern "C" fn(ctx: *mut c_void, frame: *mut c_void) -> RawOutcome;

/// Outcome status: the function ran to completion
pub const OUTCOME_DONE: u32 = 0;
/// Outcome status: cancelled at a safepoint, interpret from the frame state
pub const OUTCOME_CANCEL: u32 = 1;
/// Outcome status: an instruction fast path failed at `failed_pc`
pub const OUTCOME_STOP_SPEC: u32 = 2;
/// Outcome status: the instance variable layout guard failed
pub const OUTCOME_IVAR_SPEC: u32 = 3;
/// Outcome status: the frame/base pointer equality guard failed
pub const OUTCOME_FRAME_SPEC: u32 = 4;

/// What a generated function returns across the C ABI
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawOutcome {
    pub value: u64,
    pub status: u32,
    pub failed_pc: u32,
}

impl RawOutcome {
    pub fn done(value: u64) -> Self {
        Self { value, status: OUTCOME_DONE, failed_pc: 0 }
    }

    pub fn with_status(status: u32, failed_pc: u32) -> Self {
        Self { value: 0, status, failed_pc }
    }

    /// Decode into the engine-facing result
    pub fn into_result(self) -> Result<u64, NeedsFallback> {
        match self.status {
            OUTCOME_DONE => Ok(self.value),
            OUTCOME_STOP_SPEC => Err(NeedsFallback::Speculation(SpeculationFailure::Instruction {
                pc: self.failed_pc as usize,
            })),
            OUTCOME_IVAR_SPEC => Err(NeedsFallback::Speculation(SpeculationFailure::IvarLayout)),
            OUTCOME_FRAME_SPEC => Err(NeedsFallback::Speculation(SpeculationFailure::FramePointer)),
            _ => Err(NeedsFallback::Cancelled),
        }
    }
}

/// A speculative precondition that turned out false at run time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpeculationFailure {
    /// The fast shape of the instruction at relative `pc` failed
    Instruction { pc: usize },
    /// `self` no longer has the speculated instance variable layout
    IvarLayout,
    /// The frame's environment and base pointers differ
    FramePointer,
}

/// Why native code handed control back to the interpreter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeedsFallback {
    /// Cooperative cancellation observed at a safepoint
    Cancelled,
    /// A speculative fast path failed; report it to the engine
    Speculation(SpeculationFailure),
}

impl fmt::Display for NeedsFallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NeedsFallback::Cancelled => write!(f, "cancelled"),
            NeedsFallback::Speculation(failure) => write!(f, "speculation failed: {:?}", failure),
        }
    }
}

/// A resolved native function
#[derive(Clone, Copy)]
pub struct EntryPoint(NativeFn);

impl EntryPoint {
    pub fn new(fun: NativeFn) -> Self {
        EntryPoint(fun)
    }

    pub fn as_fn(&self) -> NativeFn {
        self.0
    }

    /// Run the native function
    ///
    /// # Safety
    /// `ctx` and `frame` must be what the generated code expects, and the
    /// artifact holding the function must still be mapped.
    pub unsafe fn call(&self, ctx: *mut c_void, frame: *mut c_void) -> Result<u64, NeedsFallback> {
        (self.0)(ctx, frame).into_result()
    }
}

impl fmt::Debug for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryPoint({:#x})", self.0 as usize)
    }
}

impl PartialEq for EntryPoint {
    fn eq(&self, other: &Self) -> bool {
        self.0 as usize == other.0 as usize
    }
}

/// Frame fields the runtime header reads in speculation guards
///
/// Mirrors `hotcc_frame` in `include/hotcc.h`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NativeFrame {
    pub ep: *mut c_void,
    pub bp: *mut c_void,
    pub self_serial: u64,
    pub self_ivar_count: u64,
    pub self_embedded: i32,
}

impl NativeFrame {
    /// A frame whose environment and base pointers agree
    pub fn new(base: *mut c_void) -> Self {
        Self { ep: base, bp: base, self_serial: 0, self_ivar_count: 0, self_embedded: 1 }
    }
}

/// Interpreter-visible compilation state of one sequence
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EntryState {
    /// Never submitted
    NotAdded,
    /// Submitted; interpret until a worker publishes code
    NotReady,
    /// Compilation or symbol resolution failed; interpret from now on
    Unavailable,
    /// Native code is loaded
    Ready(EntryPoint),
}

const NOT_ADDED: usize = 0;
const NOT_READY: usize = 1;
const UNAVAILABLE: usize = 2;

/// Call counters kept for the statistics report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub calls: u64,
    pub jit_calls: u64,
    pub failed_jit_calls: u64,
}

/// Lock-free entry point cell shared by the interpreter and workers
#[derive(Debug, Default)]
pub struct EntrySlot {
    state: AtomicUsize,
    calls: AtomicU64,
    jit_calls: AtomicU64,
    failed_jit_calls: AtomicU64,
}

impl EntrySlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self) -> EntryState {
        match self.state.load(Ordering::Acquire) {
            NOT_ADDED => EntryState::NotAdded,
            NOT_READY => EntryState::NotReady,
            UNAVAILABLE => EntryState::Unavailable,
            // SAFETY: values above the sentinels are only ever stored by
            // `publish`, which writes a `NativeFn`.
            raw => EntryState::Ready(EntryPoint(unsafe { std::mem::transmute::<usize, NativeFn>(raw) })),
        }
    }

    pub fn store(&self, state: EntryState) {
        let raw = match state {
            EntryState::NotAdded => NOT_ADDED,
            EntryState::NotReady => NOT_READY,
            EntryState::Unavailable => UNAVAILABLE,
            EntryState::Ready(entry) => entry.0 as usize,
        };
        self.state.store(raw, Ordering::Release);
    }

    pub fn publish(&self, entry: EntryPoint) {
        self.store(EntryState::Ready(entry));
    }

    /// The loaded function, if any
    pub fn entry(&self) -> Option<EntryPoint> {
        match self.load() {
            EntryState::Ready(entry) => Some(entry),
            _ => None,
        }
    }

    /// Count one call of the sequence
    pub fn record_call(&self, jit: bool, failed: bool) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if jit {
            self.jit_calls.fetch_add(1, Ordering::Relaxed);
            if failed {
                self.failed_jit_calls.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn counts(&self) -> CallCounts {
        CallCounts {
            calls: self.calls.load(Ordering::Relaxed),
            jit_calls: self.jit_calls.load(Ordering::Relaxed),
            failed_jit_calls: self.failed_jit_calls.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn answer(_ctx: *mut c_void, _frame: *mut c_void) -> RawOutcome {
        RawOutcome::done(42)
    }

    unsafe extern "C" fn bail(_ctx: *mut c_void, _frame: *mut c_void) -> RawOutcome {
        RawOutcome::with_status(OUTCOME_STOP_SPEC, 12)
    }

    #[test]
    fn test_slot_sentinels() {
        let slot = EntrySlot::new();
        assert_eq!(slot.load(), EntryState::NotAdded);
        slot.store(EntryState::NotReady);
        assert_eq!(slot.load(), EntryState::NotReady);
        slot.store(EntryState::Unavailable);
        assert_eq!(slot.load(), EntryState::Unavailable);
        assert!(slot.entry().is_none());
    }

    #[test]
    fn test_publish_and_call() {
        let slot = EntrySlot::new();
        slot.publish(EntryPoint::new(answer));
        let entry = slot.entry().unwrap();
        let result = unsafe { entry.call(std::ptr::null_mut(), std::ptr::null_mut()) };
        assert_eq!(result, Ok(42));
    }

    #[test]
    fn test_outcome_decoding() {
        let entry = EntryPoint::new(bail);
        let result = unsafe { entry.call(std::ptr::null_mut(), std::ptr::null_mut()) };
        assert_eq!(
            result,
            Err(NeedsFallback::Speculation(SpeculationFailure::Instruction { pc: 12 }))
        );
        assert_eq!(
            RawOutcome::with_status(OUTCOME_CANCEL, 0).into_result(),
            Err(NeedsFallback::Cancelled)
        );
        assert_eq!(
            RawOutcome::with_status(OUTCOME_FRAME_SPEC, 0).into_result(),
            Err(NeedsFallback::Speculation(SpeculationFailure::FramePointer))
        );
    }

    #[test]
    fn test_call_counts() {
        let slot = EntrySlot::new();
        slot.record_call(false, false);
        slot.record_call(true, false);
        slot.record_call(true, true);
        assert_eq!(
            slot.counts(),
            CallCounts { calls: 3, jit_calls: 2, failed_jit_calls: 1 }
        );
    }
}
