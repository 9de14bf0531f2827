//! Work items
//!
//! A work item is the engine's record of one instruction sequence under JIT
//! consideration: its identity, size, speculative state and mutation log.

use crate::arena::{ItemId, UnitId};
use crate::entry::CallCounts;
use crate::host::{CompilableSequence, InsnKind, Instruction, SequenceShape};
use std::fmt;
use std::sync::Arc;

/// Instance variables stored inline in an object before it spills to a
/// separate table
pub const EMBEDDED_IVAR_SLOTS: usize = 3;

/// Ivar accesses a sequence needs before layout speculation pays off
const MIN_IVAR_ACCESSES: usize = 3;

/// Speculation about the layout of `self`'s instance variables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IvarSpec {
    /// No speculation; every access goes through its inline cache
    #[default]
    Off,
    /// All accessed ivars are in the embedded slots
    Embedded,
    /// `self` has an ivar table holding at least `max_index + 1` entries
    BoundedIndex(usize),
}

impl IvarSpec {
    pub fn is_on(&self) -> bool {
        !matches!(self, IvarSpec::Off)
    }
}

/// Which encoding the generator uses for one instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsnShape {
    /// Never leaves through the speculation failure tail
    Safe,
    /// May use a speculative fast path
    Fast,
}

/// An instruction whose fast path failed and forced recompilation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationRecord {
    pub pc: usize,
    pub opcode: u16,
}

/// Bounded log of mutations; `None` entries are mutations not tied to a
/// single instruction (layout or frame guards)
#[derive(Debug, Clone, Default)]
pub struct MutationLog {
    records: Vec<Option<MutationRecord>>,
    max: u32,
}

impl MutationLog {
    pub fn new(max: u32) -> Self {
        Self { records: Vec::with_capacity(max as usize), max }
    }

    pub fn count(&self) -> u32 {
        self.records.len() as u32
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// Whether the item has used up its speculation budget
    pub fn is_exhausted(&self) -> bool {
        self.count() >= self.max
    }

    /// Append a mutation; returns false once the log is full
    pub fn push(&mut self, record: Option<MutationRecord>) -> bool {
        if self.is_exhausted() {
            return false;
        }
        self.records.push(record);
        true
    }

    /// Number of mutations the instruction at `pc` caused
    pub fn count_at(&self, pc: usize) -> usize {
        self.records.iter().flatten().filter(|r| r.pc == pc).count()
    }

    pub fn records(&self) -> &[Option<MutationRecord>] {
        &self.records
    }
}

/// The engine's record of one instruction sequence
pub struct WorkItem {
    /// Process-unique sequence number; also names the generated symbol
    pub num: u32,
    /// Cleared when the interpreter frees the sequence
    pub sequence: Option<Arc<dyn CompilableSequence>>,
    pub label: String,
    pub size: usize,
    pub shape: SequenceShape,
    pub ivar_spec: IvarSpec,
    /// Layout serial the ivar speculation is tied to
    pub ivar_serial: u64,
    /// Last compiled without assuming frame/base pointer equality
    pub frame_unequal: bool,
    /// Temporaries may live in C locals instead of frame slots
    pub fast_temps: bool,
    pub mutations: MutationLog,
    /// Counters captured when the sequence was released
    pub retired_counts: CallCounts,
    pub(crate) unit: Option<UnitId>,
    pub(crate) prev: Option<ItemId>,
    pub(crate) next: Option<ItemId>,
}

impl WorkItem {
    /// Create an item for `sequence` and run the static speculation analysis
    pub fn new(num: u32, sequence: Arc<dyn CompilableSequence>, max_mutations: u32) -> Self {
        let shape = sequence.shape();
        let mut item = Self {
            num,
            label: sequence.label().to_string(),
            size: sequence.size(),
            shape,
            sequence: None,
            ivar_spec: IvarSpec::Off,
            ivar_serial: 0,
            frame_unequal: false,
            fast_temps: true,
            mutations: MutationLog::new(max_mutations),
            retired_counts: CallCounts::default(),
            unit: None,
            prev: None,
            next: None,
        };
        item.analyze(&sequence.instructions());
        item.sequence = Some(sequence);
        item
    }

    /// Derive initial speculation from the instruction stream
    fn analyze(&mut self, insns: &[Instruction]) {
        let mut serial = None;
        let mut consistent = true;
        let mut accesses = 0;
        let mut max_index = 0;

        for insn in insns {
            match insn.kind {
                InsnKind::NeedsFrameTemps => self.fast_temps = false,
                InsnKind::IvarAccess { serial: s, index } => {
                    match serial {
                        None => serial = Some(s),
                        Some(first) if first != s => consistent = false,
                        Some(_) => {}
                    }
                    max_index = max_index.max(index);
                    accesses += 1;
                }
                InsnKind::Plain => {}
            }
        }

        if consistent && accesses >= MIN_IVAR_ACCESSES && self.shape.in_object_context {
            self.ivar_spec = if max_index >= EMBEDDED_IVAR_SLOTS {
                IvarSpec::BoundedIndex(max_index)
            } else {
                IvarSpec::Embedded
            };
            self.ivar_serial = serial.unwrap_or(0);
        }
        if self.shape.has_exception_handlers {
            self.fast_temps = false;
        }
    }

    /// Whether the next compilation must avoid all speculation
    pub fn is_safe(&self) -> bool {
        self.mutations.is_exhausted()
    }

    /// Encoding for the instruction at `pc`
    pub fn shape_at(&self, pc: usize) -> InsnShape {
        if self.is_safe() || self.mutations.count_at(pc) > 0 {
            InsnShape::Safe
        } else {
            InsnShape::Fast
        }
    }

    /// Owning unit, if attached
    pub fn unit(&self) -> Option<UnitId> {
        self.unit
    }

    /// Whether the interpreter still holds the sequence
    pub fn is_live(&self) -> bool {
        self.sequence.is_some()
    }

    /// Current call counters, live or retired
    pub fn call_counts(&self) -> CallCounts {
        match &self.sequence {
            Some(seq) => seq.entry_slot().counts(),
            None => self.retired_counts,
        }
    }

    /// Drop the back-reference, keeping the counters for statistics
    pub fn release_sequence(&mut self) {
        if let Some(seq) = self.sequence.take() {
            self.retired_counts = seq.entry_slot().counts();
        }
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("num", &self.num)
            .field("label", &self.label)
            .field("size", &self.size)
            .field("ivar_spec", &self.ivar_spec)
            .field("frame_unequal", &self.frame_unequal)
            .field("fast_temps", &self.fast_temps)
            .field("mutations", &self.mutations.count())
            .field("unit", &self.unit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntrySlot;

    struct Seq {
        shape: SequenceShape,
        insns: Vec<Instruction>,
        slot: EntrySlot,
    }

    impl CompilableSequence for Seq {
        fn label(&self) -> &str {
            "Point#norm"
        }
        fn size(&self) -> usize {
            self.insns.len() * 2
        }
        fn shape(&self) -> SequenceShape {
            self.shape
        }
        fn instructions(&self) -> Vec<Instruction> {
            self.insns.clone()
        }
        fn entry_slot(&self) -> &EntrySlot {
            &self.slot
        }
    }

    fn ivar(pc: usize, serial: u64, index: usize) -> Instruction {
        Instruction { pc, opcode: 40, kind: InsnKind::IvarAccess { serial, index } }
    }

    fn item_for(shape: SequenceShape, insns: Vec<Instruction>) -> WorkItem {
        let seq = Arc::new(Seq { shape, insns, slot: EntrySlot::new() });
        WorkItem::new(0, seq, 2)
    }

    fn object_shape() -> SequenceShape {
        SequenceShape { in_object_context: true, ..Default::default() }
    }

    #[test]
    fn test_ivar_speculation_embedded() {
        let item = item_for(object_shape(), vec![ivar(0, 9, 0), ivar(3, 9, 1), ivar(6, 9, 2)]);
        assert_eq!(item.ivar_spec, IvarSpec::Embedded);
        assert_eq!(item.ivar_serial, 9);
    }

    #[test]
    fn test_ivar_speculation_bounded() {
        let item = item_for(object_shape(), vec![ivar(0, 5, 1), ivar(3, 5, 7), ivar(6, 5, 4)]);
        assert_eq!(item.ivar_spec, IvarSpec::BoundedIndex(7));
    }

    #[test]
    fn test_ivar_speculation_needs_agreement() {
        let mixed = item_for(object_shape(), vec![ivar(0, 5, 1), ivar(3, 6, 1), ivar(6, 5, 1)]);
        assert_eq!(mixed.ivar_spec, IvarSpec::Off);

        let too_few = item_for(object_shape(), vec![ivar(0, 5, 1), ivar(3, 5, 1)]);
        assert_eq!(too_few.ivar_spec, IvarSpec::Off);

        let no_object = item_for(
            SequenceShape::default(),
            vec![ivar(0, 5, 1), ivar(3, 5, 1), ivar(6, 5, 1)],
        );
        assert_eq!(no_object.ivar_spec, IvarSpec::Off);
    }

    #[test]
    fn test_fast_temps_analysis() {
        let item = item_for(SequenceShape::default(), vec![Instruction::plain(0, 1)]);
        assert!(item.fast_temps);

        let needs_temps = item_for(
            SequenceShape::default(),
            vec![Instruction { pc: 0, opcode: 3, kind: InsnKind::NeedsFrameTemps }],
        );
        assert!(!needs_temps.fast_temps);

        let handlers = item_for(
            SequenceShape { has_exception_handlers: true, ..Default::default() },
            vec![Instruction::plain(0, 1)],
        );
        assert!(!handlers.fast_temps);
    }

    #[test]
    fn test_mutation_log_is_bounded() {
        let mut log = MutationLog::new(2);
        assert!(log.push(Some(MutationRecord { pc: 4, opcode: 11 })));
        assert!(log.push(None));
        assert!(!log.push(Some(MutationRecord { pc: 8, opcode: 11 })));
        assert_eq!(log.count(), 2);
        assert!(log.is_exhausted());
        assert_eq!(log.count_at(4), 1);
        assert_eq!(log.count_at(8), 0);
    }

    #[test]
    fn test_shape_at_follows_mutations() {
        let mut item = item_for(SequenceShape::default(), vec![Instruction::plain(0, 1)]);
        assert_eq!(item.shape_at(4), InsnShape::Fast);
        item.mutations.push(Some(MutationRecord { pc: 4, opcode: 11 }));
        assert_eq!(item.shape_at(4), InsnShape::Safe);
        assert_eq!(item.shape_at(6), InsnShape::Fast);
        item.mutations.push(None);
        assert!(item.is_safe());
        assert_eq!(item.shape_at(6), InsnShape::Safe);
    }

    #[test]
    fn test_release_keeps_counts() {
        let seq = Arc::new(Seq {
            shape: SequenceShape::default(),
            insns: vec![],
            slot: EntrySlot::new(),
        });
        seq.slot.record_call(true, false);
        let mut item = WorkItem::new(3, seq.clone(), 2);
        item.release_sequence();
        assert!(!item.is_live());
        assert_eq!(item.call_counts().jit_calls, 1);
    }
}
