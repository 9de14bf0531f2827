//! Shared test helpers for integration tests
//!
//! The engine runs against a scripted toolchain that never invokes a real
//! compiler and an in-memory loader that hands out Rust functions for the
//! symbols a unit's source declares.
#![allow(dead_code)]

use hotcc::{
    CodeGenerator, CompilableSequence, DynamicLoader, EntryPoint, EntrySlot, FunctionWriter, Host, InsnKind,
    InsnShape, Instruction, Jit, JitOptions, LoadedModule, NativeFn, RawOutcome, SequenceShape, SpecState,
    Toolchain, ToolchainJob, RUNTIME_HEADER,
};
use std::collections::{HashMap, HashSet};
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub unsafe extern "C" fn answer(_ctx: *mut c_void, _frame: *mut c_void) -> RawOutcome {
    RawOutcome::done(42)
}

pub unsafe extern "C" fn stop_spec_at_3(_ctx: *mut c_void, _frame: *mut c_void) -> RawOutcome {
    RawOutcome::with_status(hotcc::entry::OUTCOME_STOP_SPEC, 3)
}

// ==================== Sequences ====================

pub struct TestSequence {
    pub label: String,
    pub size: usize,
    pub shape: SequenceShape,
    pub insns: Vec<Instruction>,
    pub slot: EntrySlot,
}

impl TestSequence {
    pub fn plain(label: &str, size: usize) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            size,
            shape: SequenceShape::default(),
            insns: (0..4).map(|i| Instruction::plain(i * 3, 10 + i as u16)).collect(),
            slot: EntrySlot::new(),
        })
    }

    /// Sequence reading three embedded instance variables of one layout
    pub fn with_ivars(label: &str) -> Arc<Self> {
        let ivar = |pc, index| Instruction { pc, opcode: 40, kind: InsnKind::IvarAccess { serial: 9, index } };
        Arc::new(Self {
            label: label.to_string(),
            size: 10,
            shape: SequenceShape { in_object_context: true, ..Default::default() },
            insns: vec![ivar(0, 0), ivar(3, 1), ivar(6, 2), Instruction::plain(9, 1)],
            slot: EntrySlot::new(),
        })
    }
}

impl CompilableSequence for TestSequence {
    fn label(&self) -> &str {
        &self.label
    }
    fn size(&self) -> usize {
        self.size
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

// ==================== Code generation ====================

/// Fast instructions leave through the speculation tail; safe ones call
/// a slow helper
pub struct TestGenerator;

impl CodeGenerator for TestGenerator {
    fn emit_instruction(&self, w: &mut FunctionWriter<'_>, insn: &Instruction, shape: InsnShape) -> hotcc::Result<()> {
        match shape {
            InsnShape::Fast => {
                let exit = w
                    .stop_spec(insn.pc)
                    .ok_or_else(|| hotcc::Error::codegen("fast shape without speculation"))?;
                w.line(format!("if (!fast_{}(frame)) {exit}", insn.opcode));
            }
            InsnShape::Safe => w.line(format!("slow_{}(frame);", insn.opcode)),
        }
        Ok(())
    }
}

// ==================== Host ====================

#[derive(Default)]
pub struct FakeHost {
    pub state: AtomicU8,
    pub cancelled: AtomicUsize,
}

impl FakeHost {
    pub fn set_state(&self, state: SpecState) {
        self.state.store(state.bits(), Ordering::SeqCst);
    }
}

impl Host for FakeHost {
    fn speculation_state(&self) -> SpecState {
        SpecState::from_bits_truncate(self.state.load(Ordering::SeqCst))
    }

    fn cancel_speculative_frames(&self) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
    }
}

// ==================== Toolchain ====================

type CompileHook = Box<dyn FnMut(u32) + Send>;

/// Toolchain that copies sources to artifacts instead of compiling
#[derive(Default)]
pub struct ScriptedToolchain {
    header_open: Mutex<bool>,
    header_cv: Condvar,
    pub header_exit: AtomicUsize,
    pub fail_units: Mutex<HashSet<u32>>,
    pub sources: Mutex<Vec<(u32, String)>>,
    pub compiles: AtomicUsize,
    on_compile: Mutex<Option<CompileHook>>,
}

impl ScriptedToolchain {
    /// Open header gate: header builds immediately
    pub fn new() -> Arc<Self> {
        let tc = Self::default();
        *tc.header_open.lock().unwrap() = true;
        Arc::new(tc)
    }

    /// Header build blocks until [`open_header`](Self::open_header)
    pub fn gated() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open_header(&self) {
        *self.header_open.lock().unwrap() = true;
        self.header_cv.notify_all();
    }

    pub fn fail_unit(&self, unit: u32) {
        self.fail_units.lock().unwrap().insert(unit);
    }

    pub fn on_compile(&self, hook: impl FnMut(u32) + Send + 'static) {
        *self.on_compile.lock().unwrap() = Some(Box::new(hook));
    }

    /// Most recent source that defines the function of item `num`
    pub fn latest_source_for(&self, num: u32) -> Option<String> {
        let needle = format!("_hotcc_{num}(");
        let sources = self.sources.lock().unwrap();
        sources.iter().rev().find(|(_, src)| src.contains(&needle)).map(|(_, src)| src.clone())
    }
}

impl Toolchain for ScriptedToolchain {
    fn run(&self, job: &ToolchainJob<'_>) -> hotcc::Result<i32> {
        match job {
            ToolchainJob::PrecompileHeader { output, .. } => {
                let mut open = self.header_open.lock().unwrap();
                while !*open {
                    let (guard, timeout) = self.header_cv.wait_timeout(open, Duration::from_secs(10)).unwrap();
                    open = guard;
                    if timeout.timed_out() {
                        break;
                    }
                }
                std::fs::write(output, b"pch")?;
                Ok(self.header_exit.load(Ordering::SeqCst) as i32)
            }
            ToolchainJob::CompileUnit { unit, source, output } => {
                self.compiles.fetch_add(1, Ordering::SeqCst);
                if let Some(hook) = self.on_compile.lock().unwrap().as_mut() {
                    hook(*unit);
                }
                let text = std::fs::read_to_string(source)?;
                self.sources.lock().unwrap().push((*unit, text.clone()));
                if self.fail_units.lock().unwrap().contains(unit) {
                    return Ok(1);
                }
                std::fs::write(output, text)?;
                Ok(0)
            }
        }
    }
}

// ==================== Loader ====================

/// Resolves every function a unit's source defines to a Rust function
///
/// Like `dlopen`, opening a path that is already mapped hands back the
/// first mapping instead of reading the file again.
#[derive(Default)]
pub struct MemoryLoader {
    pub missing: Mutex<HashSet<String>>,
    pub functions: Mutex<HashMap<String, NativeFn>>,
    pub mapped: Mutex<HashMap<PathBuf, HashMap<String, NativeFn>>>,
    pub paths: Mutex<Vec<PathBuf>>,
    pub loads: AtomicUsize,
}

impl MemoryLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn hide_symbol(&self, name: &str) {
        self.missing.lock().unwrap().insert(name.to_string());
    }

    pub fn set_function(&self, name: &str, fun: NativeFn) {
        self.functions.lock().unwrap().insert(name.to_string(), fun);
    }
}

struct MemoryModule {
    symbols: HashMap<String, NativeFn>,
}

impl DynamicLoader for MemoryLoader {
    fn load(&self, artifact: &Path) -> hotcc::Result<Box<dyn LoadedModule>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.paths.lock().unwrap().push(artifact.to_path_buf());
        let mut mapped = self.mapped.lock().unwrap();
        if let Some(symbols) = mapped.get(artifact) {
            return Ok(Box::new(MemoryModule { symbols: symbols.clone() }));
        }
        let text = std::fs::read_to_string(artifact).map_err(|e| hotcc::Error::load(artifact, e.to_string()))?;
        let missing = self.missing.lock().unwrap();
        let functions = self.functions.lock().unwrap();
        let symbols: HashMap<String, NativeFn> = text
            .lines()
            .filter_map(|line| line.strip_prefix("hotcc_outcome "))
            .filter_map(|rest| rest.split('(').next())
            .filter(|name| !missing.contains(*name))
            .map(|name| (name.to_string(), functions.get(name).copied().unwrap_or(answer as NativeFn)))
            .collect();
        mapped.insert(artifact.to_path_buf(), symbols.clone());
        Ok(Box::new(MemoryModule { symbols }))
    }
}

impl LoadedModule for MemoryModule {
    fn symbol(&self, name: &str) -> hotcc::Result<EntryPoint> {
        self.symbols
            .get(name)
            .map(|f| EntryPoint::new(*f))
            .ok_or_else(|| hotcc::Error::symbol(name, "undefined symbol"))
    }
}

// ==================== Harness ====================

pub struct Harness {
    pub jit: Jit,
    pub toolchain: Arc<ScriptedToolchain>,
    pub loader: Arc<MemoryLoader>,
    pub host: Arc<FakeHost>,
    pub dir: TempDir,
}

impl Harness {
    pub fn start(toolchain: Arc<ScriptedToolchain>, configure: impl FnOnce(&mut JitOptions)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let header = dir.path().join("hotcc.h");
        std::fs::write(&header, RUNTIME_HEADER).unwrap();
        let mut options = JitOptions {
            header_path: Some(header),
            scratch_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        configure(&mut options);

        let host = Arc::new(FakeHost::default());
        let loader = MemoryLoader::new();
        let jit = Jit::builder(options, host.clone(), Arc::new(TestGenerator))
            .toolchain(toolchain.clone())
            .loader(loader.clone())
            .build()
            .unwrap();
        Self { jit, toolchain, loader, host, dir }
    }

    pub fn quick() -> Self {
        Self::start(ScriptedToolchain::new(), |_| {})
    }

    /// Files with `ext` left in the scratch directory
    pub fn scratch_files(&self, ext: &str) -> Vec<String> {
        std::fs::read_dir(self.dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("_hotcc") && name.ends_with(ext))
            .collect()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.toolchain.open_header();
        self.jit.shutdown();
    }
}
