//! Unit source generation
//!
//! The engine owns the shape of every generated function: the speculation
//! guards, the local storage mode and the single failure tail. What each
//! instruction turns into is delegated to a [`CodeGenerator`].
//!
//! ```text
//! hotcc_outcome _hotcc_N(void *ctx, void *frame) {
//!   <guards: frame pointers, ivar layout>   -> HOTCC_FRAME_SPEC / HOTCC_IVAR_SPEC
//!   <prologue, instructions>
//! stop_spec:                                 -> HOTCC_STOP_SPEC (speculative code only)
//! cancel:                                    -> HOTCC_CANCEL
//! }
//! ```

use crate::error::{Error, Result};
use crate::host::{CompilableSequence, Instruction};
use crate::item::{InsnShape, IvarSpec, MutationLog, WorkItem};
use crate::spec_state::SpecState;
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;

/// Name of the generated function for item `num`
pub fn symbol_name(num: u32) -> String {
    format!("_hotcc_{num}")
}

/// Parameters fixed for one compilation of one item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationControl {
    /// No speculative instruction shapes and no speculation guards
    pub safe: bool,
    /// Interpreter locals live in C locals
    pub fast_locals: bool,
    /// Interpreter temporaries live in C locals
    pub fast_temps: bool,
}

/// Everything a worker needs to translate one item outside the lock
#[derive(Clone)]
pub struct TranslationJob {
    pub num: u32,
    pub symbol: String,
    pub sequence: Arc<dyn CompilableSequence>,
    pub control: TranslationControl,
    pub mutations: MutationLog,
    pub ivar_spec: IvarSpec,
    pub ivar_serial: u64,
}

impl TranslationJob {
    /// Capture `item` for translation in a unit whose members may not
    /// assume frame pointer equality when `unit_frame_unequal` is set
    pub fn capture(item: &WorkItem, unit_frame_unequal: bool) -> Option<Self> {
        let sequence = item.sequence.clone()?;
        let safe = item.is_safe();
        let fast_temps = item.fast_temps;
        Some(Self {
            num: item.num,
            symbol: symbol_name(item.num),
            sequence,
            control: TranslationControl {
                safe,
                fast_temps,
                fast_locals: fast_temps && !item.shape.nested && !unit_frame_unequal,
            },
            mutations: item.mutations.clone(),
            ivar_spec: item.ivar_spec,
            ivar_serial: item.ivar_serial,
        })
    }

    /// Encoding for the instruction at `pc`
    pub fn shape_at(&self, pc: usize) -> InsnShape {
        if self.control.safe || self.mutations.count_at(pc) > 0 {
            InsnShape::Safe
        } else {
            InsnShape::Fast
        }
    }
}

/// Unit-wide facts baked into the generated file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitPreamble {
    pub snapshot: SpecState,
    pub frame_unequal: bool,
    pub profile: bool,
}

/// Emission target handed to the code generator for one function
pub struct FunctionWriter<'a> {
    out: &'a mut String,
    job: &'a TranslationJob,
}

impl<'a> FunctionWriter<'a> {
    fn new(out: &'a mut String, job: &'a TranslationJob) -> Self {
        Self { out, job }
    }

    /// Append one line of C, indented into the function body
    pub fn line(&mut self, code: impl AsRef<str>) {
        self.out.push_str("  ");
        self.out.push_str(code.as_ref());
        self.out.push('\n');
    }

    /// Append a label for the instruction at `pc`
    pub fn label(&mut self, pc: usize) {
        let _ = writeln!(self.out, "l{pc}:");
    }

    pub fn control(&self) -> TranslationControl {
        self.job.control
    }

    pub fn sequence(&self) -> &dyn CompilableSequence {
        self.job.sequence.as_ref()
    }

    /// Statement leaving through the speculation failure tail; `None` when
    /// the function is compiled without speculation
    pub fn stop_spec(&self, pc: usize) -> Option<String> {
        if self.job.control.safe {
            None
        } else {
            Some(format!("{{ failed_pc = {pc}; goto stop_spec; }}"))
        }
    }

    /// Statement leaving through the cancellation tail
    pub fn cancel(&self) -> &'static str {
        "goto cancel;"
    }
}

/// Translates single instructions into C
///
/// Implementations must only use [`FunctionWriter::stop_spec`] for
/// instructions emitted with [`InsnShape::Fast`].
pub trait CodeGenerator: Send + Sync {
    /// File-level declarations emitted once per unit
    fn emit_preamble(&self, _out: &mut String) -> Result<()> {
        Ok(())
    }

    /// Declarations of C locals for fast local and temporary storage
    fn emit_locals(&self, _w: &mut FunctionWriter<'_>) -> Result<()> {
        Ok(())
    }

    /// Code run after the guards pass, before the first instruction
    fn emit_prologue(&self, _w: &mut FunctionWriter<'_>) -> Result<()> {
        Ok(())
    }

    /// Code for one instruction
    fn emit_instruction(&self, w: &mut FunctionWriter<'_>, insn: &Instruction, shape: InsnShape) -> Result<()>;

    /// Code writing fast storage back to the interpreter frame
    fn emit_spill(&self, _w: &mut FunctionWriter<'_>) -> Result<()> {
        Ok(())
    }
}

/// Render the complete source of a unit
pub fn render_unit(
    generator: &dyn CodeGenerator,
    include: Option<&Path>,
    preamble: &UnitPreamble,
    jobs: &[TranslationJob],
) -> Result<String> {
    let mut out = String::new();
    if let Some(include) = include {
        let _ = writeln!(out, "#include \"{}\"", include.display());
    }
    let flag = |b: bool| u8::from(b);
    let _ = writeln!(out, "static const char hotcc_profile_p = {};", flag(preamble.profile));
    let _ = writeln!(
        out,
        "static const char hotcc_trace_p = {};",
        flag(!preamble.snapshot.assumes_no_tracing())
    );
    let _ = writeln!(
        out,
        "static const char hotcc_builtin_redefined_p = {};",
        flag(!preamble.snapshot.assumes_builtins_intact())
    );
    let _ = writeln!(
        out,
        "static const char hotcc_frame_unequal_p = {};",
        flag(preamble.frame_unequal)
    );
    generator.emit_preamble(&mut out)?;

    for job in jobs {
        render_function(generator, &mut out, job, preamble.frame_unequal)?;
    }
    Ok(out)
}

fn render_function(
    generator: &dyn CodeGenerator,
    out: &mut String,
    job: &TranslationJob,
    frame_unequal: bool,
) -> Result<()> {
    tracing::trace!(target: "hotcc::worker", item = job.num, symbol = %job.symbol, "Translating item");
    let _ = writeln!(out, "\nhotcc_outcome {}(void *ctx, void *frame) {{", job.symbol);
    let _ = writeln!(out, "  static const unsigned mutation_num = {};", job.mutations.count());
    let _ = writeln!(out, "  unsigned failed_pc = 0;");

    let mut w = FunctionWriter::new(out, job);
    generator.emit_locals(&mut w)?;

    if !job.control.safe {
        if !frame_unequal {
            w.line("if (!hotcc_frame_ep_eq_bp(frame)) return hotcc_fail(HOTCC_FRAME_SPEC, 0);");
        }
        let spec = match job.ivar_spec {
            IvarSpec::Off => None,
            IvarSpec::Embedded => Some("HOTCC_IVAR_EMBEDDED".to_string()),
            IvarSpec::BoundedIndex(max) => Some(format!("{max}ULL")),
        };
        if let Some(spec) = spec {
            w.line(format!(
                "if (hotcc_check_self(frame, {}ULL, {spec})) return hotcc_fail(HOTCC_IVAR_SPEC, 0);",
                job.ivar_serial
            ));
        }
    }
    generator.emit_prologue(&mut w)?;

    let insns = job.sequence.instructions();
    if insns.is_empty() {
        return Err(Error::codegen(format!("item {} has no instructions", job.num)));
    }
    for insn in &insns {
        w.label(insn.pc);
        generator.emit_instruction(&mut w, insn, job.shape_at(insn.pc))?;
    }

    if !job.control.safe {
        let _ = writeln!(w.out, "stop_spec:");
        generator.emit_spill(&mut w)?;
        w.line("return hotcc_fail(HOTCC_STOP_SPEC, failed_pc);");
    }
    let _ = writeln!(w.out, "cancel:");
    generator.emit_spill(&mut w)?;
    w.line("return hotcc_fail(HOTCC_CANCEL, 0);");
    let _ = writeln!(w.out, "}}");
    Ok(())
}

/// Write a rendered unit and flush it to storage
pub fn write_source(path: &Path, source: &str) -> Result<()> {
    let mut file = std::fs::File::create(path)?;
    file.write_all(source.as_bytes())?;
    file.sync_all()?;
    Ok(())
}
