//! Global speculation state
//!
//! Generated code may assume that process-wide conditions (tracing, builtin
//! redefinition) are absent. A set bit means the condition is present, so
//! code generated under a snapshot stays valid while every condition present
//! now was already present when the snapshot was taken.

use bitflags::bitflags;

bitflags! {
    /// Process-wide conditions generated code can speculate on
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SpecState: u8 {
        /// Execution tracing hooks are active
        const TRACING = 1 << 0;
        /// Some redefinable builtin operation has been overridden
        const BUILTIN_REDEFINED = 1 << 1;
    }
}

impl SpecState {
    /// State that assumes nothing; valid under any live state
    pub fn conservative() -> Self {
        SpecState::all()
    }

    /// Whether code generated under `self` is still valid under `current`
    pub fn dominates(self, current: SpecState) -> bool {
        self.contains(current)
    }

    /// Whether generated code may use builtin fast paths
    pub fn assumes_builtins_intact(self) -> bool {
        !self.contains(SpecState::BUILTIN_REDEFINED)
    }

    /// Whether generated code may skip tracing hooks
    pub fn assumes_no_tracing(self) -> bool {
        !self.contains(SpecState::TRACING)
    }
}

impl Default for SpecState {
    fn default() -> Self {
        SpecState::conservative()
    }
}
