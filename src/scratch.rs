//! Transient file naming
//!
//! Generated sources, artifacts and the precompiled header are named from
//! the process id, the unit number and the compile number. A loaded library
//! stays mapped under its path, so every compile needs a path of its own.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

const PREFIX: &str = "_hotcc";

/// Location and naming scheme for transient files
#[derive(Debug, Clone)]
pub struct Scratch {
    dir: PathBuf,
    pid: u32,
    keep: bool,
}

impl Scratch {
    pub fn new(dir: impl Into<PathBuf>, keep: bool) -> Result<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(Error::setup(format!(
                "scratch directory {} does not exist",
                dir.display()
            )));
        }
        Ok(Self { dir, pid: std::process::id(), keep })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn keeps_files(&self) -> bool {
        self.keep
    }

    /// Generated C source of compile `compile` of unit `num`
    pub fn unit_source(&self, num: u32, compile: u32) -> PathBuf {
        self.dir.join(format!("{PREFIX}_p{}u{num}c{compile}.c", self.pid))
    }

    /// Shared artifact of compile `compile` of unit `num`
    pub fn unit_artifact(&self, num: u32, compile: u32) -> PathBuf {
        self.dir.join(format!("{PREFIX}_p{}u{num}c{compile}.so", self.pid))
    }

    /// Precompiled header output
    pub fn precompiled_header(&self) -> PathBuf {
        self.dir.join(format!("{PREFIX}_hp{}.h.gch", self.pid))
    }

    /// Path generated sources include to pick up the precompiled header
    pub fn header_include(&self) -> PathBuf {
        self.precompiled_header().with_extension("")
    }

    /// Remove a transient file unless temporaries are kept
    pub fn discard(&self, path: &Path) {
        if self.keep {
            return;
        }
        if let Err(err) = std::fs::remove_file(path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(target: "hotcc::worker", path = %path.display(), %err, "Could not remove transient file");
            }
        }
    }
}
