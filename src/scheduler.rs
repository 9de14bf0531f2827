//! Interpreter-facing JIT engine
//!
//! [`Jit`] owns the worker pool and the header task and exposes the
//! operations an interpreter calls: submitting sequences, asking for their
//! native code, and reporting when speculation went wrong.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use hotcc::{Jit, JitOptions, Host, CodeGenerator, CompilableSequence};
//! # fn demo(host: Arc<dyn Host>, gen: Arc<dyn CodeGenerator>, seq: Arc<dyn CompilableSequence>) -> hotcc::Result<()> {
//! let mut jit = Jit::builder(JitOptions::default(), host, gen).build()?;
//! if let Some(item) = jit.submit(seq.clone()) {
//!     let entry = jit.fetch_entry_point(item);
//!     println!("native code: {:?}", entry);
//! }
//! jit.shutdown();
//! # Ok(())
//! # }
//! ```

use crate::arena::{ItemId, UnitId};
use crate::config::JitOptions;
use crate::engine::Shared;
use crate::entry::{EntryPoint, SpeculationFailure};
use crate::error::{Error, Result};
use crate::header;
use crate::host::{CompilableSequence, Host};
use crate::loader::{DynamicLoader, NativeLoader};
use crate::scratch::Scratch;
use crate::stats::JitStatistics;
use crate::toolchain::{CcToolchain, Toolchain};
use crate::translate::CodeGenerator;
use crate::unit::UnitStatus;
use crate::worker;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Collaborators and options for a [`Jit`]
pub struct JitBuilder {
    options: JitOptions,
    host: Arc<dyn Host>,
    generator: Arc<dyn CodeGenerator>,
    toolchain: Option<Arc<dyn Toolchain>>,
    loader: Option<Arc<dyn DynamicLoader>>,
}

impl JitBuilder {
    /// Replace the gcc/clang toolchain
    pub fn toolchain(mut self, toolchain: Arc<dyn Toolchain>) -> Self {
        self.toolchain = Some(toolchain);
        self
    }

    /// Replace the platform dynamic loader
    pub fn loader(mut self, loader: Arc<dyn DynamicLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Validate the setup and start the header task and workers
    pub fn build(self) -> Result<Jit> {
        let options = self.options.normalized();
        let header_path = options.resolve_header()?;
        if let Some(cc) = &options.compiler_path {
            if !cc.is_file() {
                return Err(Error::setup(format!("compiler {} not found", cc.display())));
            }
        }
        let scratch = Scratch::new(options.resolve_scratch_dir(), options.keep_temps)?;
        let toolchain = match self.toolchain {
            Some(toolchain) => toolchain,
            None => Arc::new(CcToolchain::from_options(
                &options,
                scratch.dir(),
                &scratch.precompiled_header(),
            )),
        };
        let loader = self.loader.unwrap_or_else(|| Arc::new(NativeLoader::new()));
        let workers = options.workers;
        tracing::info!(
            target: "hotcc::scheduler",
            workers,
            scratch = %scratch.dir().display(),
            toolchain = ?options.toolchain,
            "Starting JIT"
        );

        let shared = Arc::new(Shared::new(
            options,
            scratch,
            self.host,
            self.generator,
            toolchain,
            loader,
        ));
        let mut jit = Jit {
            shared: Arc::clone(&shared),
            header: None,
            workers: Vec::with_capacity(workers),
            stopped: false,
            forked: false,
        };

        let task = Arc::clone(&shared);
        jit.header = Some(
            thread::Builder::new()
                .name("hotcc-header".to_string())
                .spawn(move || header::run(task, &header_path))?,
        );
        for id in 0..workers {
            let task = Arc::clone(&shared);
            // A spawn failure drops `jit`, which joins what already started
            let handle = thread::Builder::new()
                .name(format!("hotcc-worker-{}", id))
                .spawn(move || worker::run(task, id))?;
            jit.workers.push(handle);
        }
        Ok(jit)
    }
}

/// A running JIT engine
pub struct Jit {
    shared: Arc<Shared>,
    header: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    stopped: bool,
    forked: bool,
}

impl Jit {
    pub fn builder(options: JitOptions, host: Arc<dyn Host>, generator: Arc<dyn CodeGenerator>) -> JitBuilder {
        JitBuilder {
            options,
            host,
            generator,
            toolchain: None,
            loader: None,
        }
    }

    /// Whether the engine still accepts work
    pub fn is_enabled(&self) -> bool {
        self.shared.is_enabled() && !self.stopped
    }

    pub fn options(&self) -> &JitOptions {
        &self.shared.options
    }

    /// Register `sequence` and attach it to the forming unit
    ///
    /// Returns `None` when the engine is disabled; the interpreter then just
    /// keeps interpreting.
    pub fn submit(&self, sequence: Arc<dyn CompilableSequence>) -> Option<ItemId> {
        if !self.is_enabled() {
            return None;
        }
        let mut st = self.shared.lock();
        if st.shutdown {
            return None;
        }
        let item = st.create_item(sequence);
        let queued = st.submit(item);
        drop(st);
        if queued {
            self.shared.work_available.notify_one();
        }
        Some(item)
    }

    /// Move `item` to the unit that is compiled next
    pub fn raise_priority(&self, item: ItemId) {
        if !self.is_enabled() {
            return;
        }
        let mut st = self.shared.lock();
        st.raise_priority(item);
        drop(st);
        self.shared.work_available.notify_all();
    }

    /// Block until `item` has been compiled or given up on
    ///
    /// Returns the native entry, or `None` when the item must stay
    /// interpreted (compile failure, missing symbol, disabled engine).
    pub fn fetch_entry_point(&self, item: ItemId) -> Option<EntryPoint> {
        if !self.is_enabled() {
            return None;
        }
        let mut st = self.shared.lock();
        st.raise_priority(item);
        self.shared.work_available.notify_all();
        loop {
            let it = st.item(item)?;
            let settled = match it.unit() {
                None => true,
                Some(unit) => st.unit(unit).map_or(true, |u| u.status().is_terminal()),
            };
            if settled || st.shutdown || !self.shared.is_enabled() {
                break;
            }
            st = self.shared.wait(&self.shared.status_changed, st);
        }
        let entry = st.item(item)?.sequence.as_ref()?.entry_slot().entry();
        if entry.is_none() {
            tracing::debug!(target: "hotcc::scheduler", ?item, "No native code for item");
        }
        entry
    }

    /// Drop `item`'s code and compile it again
    pub fn invalidate(&self, item: ItemId) {
        if !self.is_enabled() {
            return;
        }
        let mut st = self.shared.lock();
        let queued = st.invalidate(item, None);
        drop(st);
        if queued {
            self.shared.work_available.notify_one();
        }
    }

    /// Report that native code of `item` hit a failed speculation
    pub fn speculation_failed(&self, item: ItemId, failure: SpeculationFailure) {
        if !self.is_enabled() {
            return;
        }
        let mut st = self.shared.lock();
        let recompiling = st.speculation_failed(item, failure);
        drop(st);
        if recompiling {
            self.shared.work_available.notify_all();
        }
    }

    /// Cancel speculative frames and recompile every unit whose assumptions
    /// no longer hold
    pub fn cancel_all(&self) {
        if !self.is_enabled() {
            return;
        }
        self.shared.host.cancel_speculative_frames();
        let mut st = self.shared.lock();
        let current = self.shared.host.speculation_state();
        let requeued = st.requeue_stale(current);
        drop(st);
        tracing::info!(target: "hotcc::speculation", requeued, ?current, "Cancelled speculative code");
        if requeued > 0 {
            self.shared.work_available.notify_all();
        }
    }

    /// The interpreter collected the sequence behind `item`
    pub fn release_sequence(&self, item: ItemId) {
        self.shared.lock().release_sequence(item);
    }

    /// Disable the engine in a forked child
    ///
    /// Workers exist only in the parent, so the child must neither join
    /// them nor remove the parent's transient files.
    pub fn after_fork_in_child(&mut self) {
        self.shared.disable();
        self.forked = true;
        tracing::debug!(target: "hotcc::scheduler", "JIT disabled in forked child");
    }

    pub fn statistics(&self) -> JitStatistics {
        self.shared.lock().statistics()
    }

    /// Status of the unit `item` belongs to, if any
    pub fn unit_status(&self, item: ItemId) -> Option<UnitStatus> {
        self.shared.lock().item_unit_status(item)
    }

    /// Sequence number of `item`; names its generated function
    pub fn item_number(&self, item: ItemId) -> Option<u32> {
        self.shared.lock().item(item).map(|it| it.num)
    }

    pub fn unit_of(&self, item: ItemId) -> Option<UnitId> {
        self.shared.lock().item(item)?.unit()
    }

    /// Queued units, next to be compiled first
    pub fn queue_order(&self) -> Vec<UnitId> {
        self.shared.lock().queue_order()
    }

    /// Items of `unit`, most recently attached first
    pub fn unit_items(&self, unit: UnitId) -> Vec<ItemId> {
        self.shared.lock().unit_items(unit)
    }

    /// Stop the workers after their current unit and free the engine
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        self.shared.lock().shutdown = true;
        self.shared.header_ready.notify_all();
        self.shared.work_available.notify_all();
        self.shared.status_changed.notify_all();

        if self.forked {
            // Not our threads to join
            for handle in self.header.take().into_iter().chain(self.workers.drain(..)) {
                std::mem::forget(handle);
            }
            self.shared.lock().teardown();
            return;
        }

        if let Some(handle) = self.header.take() {
            if handle.join().is_err() {
                tracing::warn!(target: "hotcc::header", "Header task panicked");
            }
        }
        for (id, handle) in self.workers.drain(..).enumerate() {
            if handle.join().is_err() {
                tracing::warn!(target: "hotcc::worker", worker = id, "Worker panicked");
            }
        }

        let scratch = &self.shared.scratch;
        scratch.discard(&scratch.precompiled_header());

        let mut st = self.shared.lock();
        if self.shared.options.profile {
            let host = &self.shared.host;
            let report = st.statistics().report(&|op| host.opcode_name(op));
            tracing::info!(target: "hotcc::scheduler", "JIT statistics\n{}", report);
        }
        st.teardown();
        tracing::info!(target: "hotcc::scheduler", "Successful JIT shutdown");
    }
}

impl Drop for Jit {
    fn drop(&mut self) {
        self.shutdown();
    }
}
