//! hotcc: a background JIT engine for bytecode interpreters
//!
//! The interpreter submits hot instruction sequences; worker threads batch
//! them into compilation units, translate each unit to C, run gcc or clang
//! out of process and load the result back as a shared object. Generated
//! code speculates on object layout, frame shape and process-wide state, and
//! reports back when a speculation fails so the item is recompiled with
//! fewer assumptions.
//!
//! # Module Overview
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Façade** | [`scheduler`] |
//! | **State** | [`arena`], [`item`], [`unit`], [`spec_state`], [`entry`], [`stats`] |
//! | **Pipeline** | [`translate`], [`toolchain`], [`loader`], [`scratch`] |
//! | **Ambient** | [`config`], [`error`](Error), [`host`] |
//!
//! The C side of the calling convention lives in [`RUNTIME_HEADER`]; hosts
//! usually write it out and point [`JitOptions::header_path`] at it.

pub mod arena;
pub mod config;
pub mod entry;
pub mod error;
pub mod host;
pub mod item;
pub mod loader;
pub mod scheduler;
pub mod scratch;
pub mod spec_state;
pub mod stats;
pub mod toolchain;
pub mod translate;
pub mod unit;

mod engine;
mod header;
mod worker;

pub use arena::{ItemId, UnitId};
pub use config::{BatchingPolicy, JitOptions, ToolchainFlavor};
pub use entry::{
    CallCounts, EntryPoint, EntrySlot, EntryState, NativeFn, NativeFrame, NeedsFallback, RawOutcome,
    SpeculationFailure,
};
pub use error::{Error, Result};
pub use host::{CompilableSequence, Host, InsnKind, Instruction, SequenceShape};
pub use item::{InsnShape, IvarSpec, MutationRecord};
pub use loader::{DynamicLoader, LoadedModule, NativeLoader};
pub use scheduler::{Jit, JitBuilder};
pub use spec_state::SpecState;
pub use stats::{EngineCounters, ItemStats, JitStatistics};
pub use toolchain::{CcToolchain, Toolchain, ToolchainJob};
pub use translate::{CodeGenerator, FunctionWriter, TranslationControl};
pub use unit::UnitStatus;

/// Version of hotcc
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Declarations every generated unit is compiled against
pub const RUNTIME_HEADER: &str = include_str!("../include/hotcc.h");
