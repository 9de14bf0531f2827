//! Worker threads
//!
//! Each worker waits for the precompiled header, then repeatedly takes the
//! head unit off the queue, translates it, runs the toolchain and loads the
//! artifact. Only queue manipulation and status transitions hold the engine
//! lock; translation, compilation and loading run without it.

use crate::engine::{CompiledDisposition, Shared, UnitBatch};
use crate::entry::EntryPoint;
use crate::error::{Error, Result};
use crate::header;
use crate::loader::LoadedModule;
use crate::toolchain::ToolchainJob;
use crate::translate::{render_unit, write_source};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Worker thread body
pub(crate) fn run(shared: Arc<Shared>, id: usize) {
    if !header::wait_ready(&shared) {
        tracing::debug!(target: "hotcc::worker", worker = id, "No precompiled header -- worker exiting");
        return;
    }
    tracing::debug!(target: "hotcc::worker", worker = id, "Worker started");

    loop {
        let batch = {
            let mut st = shared.lock();
            loop {
                if st.shutdown {
                    tracing::debug!(target: "hotcc::worker", worker = id, "Worker stopping");
                    return;
                }
                if !st.queue.is_empty() {
                    break;
                }
                st = shared.wait(&shared.work_available, st);
            }
            let current = shared.host.speculation_state();
            st.take_next_unit(id, current, &shared.scratch, shared.options.profile)
        };
        if let Some(batch) = batch {
            process(&shared, id, batch);
        }
    }
}

fn process(shared: &Shared, id: usize, batch: UnitBatch) {
    let artifact = match build(shared, &batch) {
        Ok(()) => batch.artifact.clone(),
        Err(err) => {
            report(shared, batch.num, &err);
            shared.scratch.discard(&batch.artifact);
            finish_failed(shared, &batch);
            return;
        }
    };

    {
        let mut st = shared.lock();
        let current = shared.host.speculation_state();
        if st.unit_compiled(batch.unit, current) == CompiledDisposition::Requeued {
            drop(st);
            shared.scratch.discard(&artifact);
            shared.work_available.notify_all();
            shared.status_changed.notify_all();
            return;
        }
    }

    let module = match shared.loader.load(&artifact) {
        Ok(module) => module,
        Err(err) => {
            report(shared, batch.num, &err);
            shared.scratch.discard(&artifact);
            finish_failed(shared, &batch);
            return;
        }
    };
    let resolved = resolve(module.as_ref(), &batch);
    // The mapping stays valid after the file is gone
    shared.scratch.discard(&artifact);

    let mut st = shared.lock();
    let current = shared.host.speculation_state();
    if st.unit_loaded(batch.unit, module, &resolved, current) {
        tracing::info!(target: "hotcc::worker", worker = id, unit = batch.num, "Unit loaded");
    } else {
        shared.work_available.notify_all();
    }
    drop(st);
    shared.status_changed.notify_all();
}

/// Render, write and compile the unit's source
fn build(shared: &Shared, batch: &UnitBatch) -> Result<()> {
    let include = shared
        .toolchain
        .includes_header()
        .then(|| shared.scratch.header_include());
    let source = render_unit(
        shared.generator.as_ref(),
        include.as_deref(),
        &batch.preamble,
        &batch.jobs,
    )?;
    write_source(&batch.source, &source)?;

    let job = ToolchainJob::CompileUnit {
        unit: batch.num,
        source: &batch.source,
        output: &batch.artifact,
    };
    let result = shared.toolchain.run(&job);
    shared.scratch.discard(&batch.source);
    match result? {
        0 => Ok(()),
        code => Err(Error::Toolchain { unit: batch.num, code }),
    }
}

/// Look up every captured item's function in `module`
fn resolve(module: &dyn LoadedModule, batch: &UnitBatch) -> FxHashMap<u32, Option<EntryPoint>> {
    batch
        .jobs
        .iter()
        .map(|job| {
            let entry = match module.symbol(&job.symbol) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    tracing::warn!(target: "hotcc::loader", unit = batch.num, item = job.num, %err, "Cannot find symbol");
                    None
                }
            };
            (job.num, entry)
        })
        .collect()
}

fn finish_failed(shared: &Shared, batch: &UnitBatch) {
    let mut st = shared.lock();
    st.fail_unit(batch.unit);
    drop(st);
    shared.status_changed.notify_all();
}

fn report(shared: &Shared, unit: u32, err: &Error) {
    if shared.options.report_failures() {
        tracing::warn!(target: "hotcc::worker", unit, %err, "Unit failed");
    } else {
        tracing::debug!(target: "hotcc::worker", unit, %err, "Unit failed");
    }
}
