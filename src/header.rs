//! Precompiled header task
//!
//! Runs once per engine on its own thread. Workers block until it reports
//! either way; a failure disables the engine for the rest of the process.

use crate::engine::{HeaderStatus, Shared};
use crate::error::Error;
use crate::toolchain::ToolchainJob;
use std::path::Path;
use std::sync::Arc;

/// Build the precompiled header and publish the outcome
pub(crate) fn run(shared: Arc<Shared>, header: &Path) {
    let output = shared.scratch.precompiled_header();
    tracing::debug!(
        target: "hotcc::header",
        header = %header.display(),
        output = %output.display(),
        "Starting header precompilation"
    );
    let job = ToolchainJob::PrecompileHeader { header, output: &output };
    let result = shared.toolchain.run(&job);

    let failure = match result {
        Ok(0) => None,
        Ok(code) => Some(format!("exit status {code}")),
        Err(err) => Some(err.to_string()),
    };
    let status = match failure {
        None => HeaderStatus::Ready,
        Some(reason) => {
            let err = Error::HeaderPreparation { path: output.clone(), reason };
            tracing::warn!(target: "hotcc::header", %err, "Disabling JIT");
            HeaderStatus::Failed
        }
    };

    let mut st = shared.lock();
    st.header = status;
    if status == HeaderStatus::Failed {
        shared.disable();
        shared.scratch.discard(&output);
    } else {
        tracing::info!(target: "hotcc::header", output = %output.display(), "Precompiled header ready");
    }
    drop(st);
    shared.header_ready.notify_all();
    shared.status_changed.notify_all();
}

/// Block until the header task has reported; returns whether it succeeded
pub(crate) fn wait_ready(shared: &Shared) -> bool {
    let mut st = shared.lock();
    while st.header == HeaderStatus::Pending && !st.shutdown {
        st = shared.wait(&shared.header_ready, st);
    }
    st.header == HeaderStatus::Ready && !st.shutdown
}
