//! Interfaces the interpreter implements for the engine
//!
//! The engine never looks inside bytecode on its own. It asks the host for
//! the facts it schedules and speculates on.

use crate::entry::EntrySlot;
use crate::spec_state::SpecState;

/// What static analysis needs to know about one instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsnKind {
    /// Nothing the scheduler cares about
    Plain,
    /// Needs its temporaries to live at addressable frame slots
    NeedsFrameTemps,
    /// Reads or writes an instance variable through an inline cache
    IvarAccess { serial: u64, index: usize },
}

/// One decoded instruction of a sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    /// Relative program offset
    pub pc: usize,
    /// Host opcode number
    pub opcode: u16,
    pub kind: InsnKind,
}

impl Instruction {
    pub fn plain(pc: usize, opcode: u16) -> Self {
        Self { pc, opcode, kind: InsnKind::Plain }
    }
}

/// Layout facts about a sequence that shape the generated function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SequenceShape {
    pub local_count: usize,
    pub temp_count: usize,
    /// Runs with an object `self`, so ivar layout speculation applies
    pub in_object_context: bool,
    pub has_exception_handlers: bool,
    /// Nested in a parent scope that may capture its locals
    pub nested: bool,
}

/// An interpreter instruction sequence the engine can compile
pub trait CompilableSequence: Send + Sync {
    /// Human-readable name for logs and statistics
    fn label(&self) -> &str;

    /// Code size in abstract units (used for batching)
    fn size(&self) -> usize;

    fn shape(&self) -> SequenceShape;

    /// Decoded instruction stream in program order
    fn instructions(&self) -> Vec<Instruction>;

    /// Slot the interpreter reads the native entry point from
    fn entry_slot(&self) -> &EntrySlot;

    /// Opcode at a relative program offset
    fn opcode_at(&self, pc: usize) -> Option<u16> {
        self.instructions()
            .into_iter()
            .find(|insn| insn.pc == pc)
            .map(|insn| insn.opcode)
    }
}

/// Process-wide interpreter services the engine depends on
pub trait Host: Send + Sync {
    /// Conditions currently present in the interpreter
    fn speculation_state(&self) -> SpecState;

    /// Flag every live frame running native code for cancellation at its
    /// next safepoint
    fn cancel_speculative_frames(&self);

    /// Display name of an opcode in the statistics report
    fn opcode_name(&self, opcode: u16) -> String {
        format!("op{opcode}")
    }
}
