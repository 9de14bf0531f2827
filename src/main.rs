//! hotcc CLI
//!
//! Drives the JIT engine against the system C compiler with a handful of
//! synthetic sequences, so a toolchain setup can be checked end to end.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use hotcc::{
    CodeGenerator, CompilableSequence, EntrySlot, FunctionWriter, Host, InsnShape, Instruction, Jit,
    JitOptions, NativeFrame, SequenceShape, SpecState, ToolchainFlavor, RUNTIME_HEADER, VERSION,
};
use rustc_hash::FxHashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hotcc")]
#[command(author, version, about = "Background JIT engine driving an external C compiler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and call synthetic sequences
    Demo {
        /// Options file (JSON)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Number of sequences to compile
        #[arg(short = 'n', long, default_value_t = 4)]
        count: u64,

        /// Worker threads
        #[arg(short, long)]
        workers: Option<usize>,

        /// Use clang instead of gcc
        #[arg(long)]
        clang: bool,

        /// Explicit compiler executable
        #[arg(long, value_name = "PATH")]
        cc: Option<PathBuf>,

        /// Batch sequences into shared units instead of one unit each
        #[arg(long)]
        batch: bool,

        /// Keep generated sources and artifacts
        #[arg(long)]
        keep_temps: bool,

        /// Emit profiling flags and log statistics at shutdown
        #[arg(short, long)]
        profile: bool,
    },

    /// Print the runtime header generated code is compiled against
    Header,

    /// Print the default options as JSON
    Config,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Demo { config, count, workers, clang, cc, batch, keep_temps, profile } => {
            let mut options = match config {
                Some(path) => JitOptions::from_file(&path)
                    .with_context(|| format!("reading options from {}", path.display()))?,
                None => JitOptions::default(),
            };
            if let Some(workers) = workers {
                options.workers = workers;
            }
            if clang {
                options.toolchain = ToolchainFlavor::Clang;
            }
            if cc.is_some() {
                options.compiler_path = cc;
            }
            options.batching.quick_response &= !batch;
            options.keep_temps |= keep_temps;
            options.profile |= profile;
            options.verbose |= cli.verbose > 0;
            run_demo(options, count)
        }
        Commands::Header => {
            print!("{}", RUNTIME_HEADER);
            Ok(())
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&JitOptions::default())?);
            Ok(())
        }
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

const OP_NOP: u16 = 0;
const OP_LEAVE: u16 = 1;

/// A sequence that returns a constant
struct ConstSequence {
    label: String,
    slot: EntrySlot,
}

impl CompilableSequence for ConstSequence {
    fn label(&self) -> &str {
        &self.label
    }

    fn size(&self) -> usize {
        2
    }

    fn shape(&self) -> SequenceShape {
        SequenceShape::default()
    }

    fn instructions(&self) -> Vec<Instruction> {
        vec![Instruction::plain(0, OP_NOP), Instruction::plain(1, OP_LEAVE)]
    }

    fn entry_slot(&self) -> &EntrySlot {
        &self.slot
    }
}

/// Emits `return <constant>` for the leave instruction of each sequence
struct ConstGenerator {
    values: FxHashMap<String, u64>,
}

impl CodeGenerator for ConstGenerator {
    fn emit_instruction(&self, w: &mut FunctionWriter<'_>, insn: &Instruction, _shape: InsnShape) -> hotcc::Result<()> {
        match insn.opcode {
            OP_NOP => w.line("/* nop */"),
            OP_LEAVE => {
                let label = w.sequence().label().to_string();
                let value = self
                    .values
                    .get(&label)
                    .ok_or_else(|| hotcc::Error::codegen(format!("no value for {label}")))?;
                w.line(format!("return hotcc_done({value}ULL);"));
            }
            other => return Err(hotcc::Error::codegen(format!("unknown opcode {other}"))),
        }
        Ok(())
    }
}

/// Host whose speculation state can be flipped from the demo
#[derive(Default)]
struct DemoHost {
    state: AtomicU8,
}

impl Host for DemoHost {
    fn speculation_state(&self) -> SpecState {
        SpecState::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    fn cancel_speculative_frames(&self) {
        tracing::debug!("No native frames live in the demo");
    }

    fn opcode_name(&self, opcode: u16) -> String {
        match opcode {
            OP_NOP => "nop".to_string(),
            OP_LEAVE => "leave".to_string(),
            other => format!("op{other}"),
        }
    }
}

fn run_demo(mut options: JitOptions, count: u64) -> anyhow::Result<()> {
    let header = std::env::temp_dir().join(format!("hotcc-{}.h", std::process::id()));
    std::fs::write(&header, RUNTIME_HEADER).with_context(|| format!("writing {}", header.display()))?;
    options.header_path = Some(header.clone());

    let sequences: Vec<Arc<ConstSequence>> = (0..count)
        .map(|i| Arc::new(ConstSequence { label: format!("const_{i}"), slot: EntrySlot::new() }))
        .collect();
    let values = sequences
        .iter()
        .enumerate()
        .map(|(i, seq)| (seq.label.clone(), (i as u64 + 1) * 7))
        .collect();

    let host = Arc::new(DemoHost::default());
    let generator = Arc::new(ConstGenerator { values });
    let result = (|| {
        let mut jit = Jit::builder(options, host.clone(), generator).build()?;
        println!("hotcc {} ({} workers)", VERSION, jit.options().workers);

        let start = Instant::now();
        let items: Vec<_> = sequences
            .iter()
            .filter_map(|seq| jit.submit(seq.clone() as Arc<dyn CompilableSequence>))
            .collect();
        call_all(&jit, &sequences, &items)?;
        println!("compiled {} sequences in {:?}", items.len(), start.elapsed());

        // Turning tracing on invalidates every unit built without it
        host.state.store(SpecState::TRACING.bits(), Ordering::Release);
        jit.cancel_all();
        let start = Instant::now();
        call_all(&jit, &sequences, &items)?;
        println!("recompiled after cancel_all in {:?}", start.elapsed());

        print!("{}", jit.statistics().report(&|op| host.opcode_name(op)));
        jit.shutdown();
        anyhow::Ok(())
    })();
    let _ = std::fs::remove_file(&header);
    result
}

fn call_all(jit: &Jit, sequences: &[Arc<ConstSequence>], items: &[hotcc::ItemId]) -> anyhow::Result<()> {
    let mut base = 0u64;
    let mut frame = NativeFrame::new(std::ptr::addr_of_mut!(base).cast());
    for (seq, &item) in sequences.iter().zip(items) {
        let Some(entry) = jit.fetch_entry_point(item) else {
            bail!("{} did not compile; rerun with -v for the compiler report", seq.label);
        };
        // SAFETY: the generated function only reads the frame header fields
        let outcome = unsafe { entry.call(std::ptr::null_mut(), std::ptr::addr_of_mut!(frame).cast()) };
        seq.slot.record_call(true, outcome.is_err());
        match outcome {
            Ok(value) => println!("  {} -> {}", seq.label, value),
            Err(fallback) => println!("  {} -> interpreter ({})", seq.label, fallback),
        }
    }
    Ok(())
}
