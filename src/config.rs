//! Engine options
//!
//! Options are plain data with serde support so a host can keep them in a
//! JSON file next to its own configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Upper bound on worker threads (and so on concurrent toolchain processes)
pub const MAX_WORKERS: usize = 100;
/// Default number of worker threads
pub const DEFAULT_WORKERS: usize = 1;
/// Default number of permitted code mutations per work item
pub const DEFAULT_MAX_MUTATIONS: u32 = 2;
/// Aggregate item size that closes a forming unit when quick response is off
pub const DEFAULT_MAX_UNIT_SIZE: usize = 1000;

/// Which external compiler family drives compilation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolchainFlavor {
    #[default]
    Gcc,
    Clang,
}

impl ToolchainFlavor {
    /// Executable looked up on `PATH` when no explicit path is configured
    pub fn default_program(&self) -> &'static str {
        match self {
            ToolchainFlavor::Gcc => "gcc",
            ToolchainFlavor::Clang => "clang",
        }
    }
}

/// How submitted items are grouped into compilation units
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingPolicy {
    /// Close every unit right after its first item is attached
    pub quick_response: bool,
    /// Close the forming unit once its aggregate size exceeds this
    pub max_unit_size: usize,
}

impl Default for BatchingPolicy {
    fn default() -> Self {
        Self {
            quick_response: true,
            max_unit_size: DEFAULT_MAX_UNIT_SIZE,
        }
    }
}

impl BatchingPolicy {
    /// Whether a forming unit of `unit_size` should be closed and queued
    pub fn should_close(&self, unit_size: usize) -> bool {
        self.quick_response || unit_size > self.max_unit_size
    }
}

/// JIT engine options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitOptions {
    /// Number of worker threads
    pub workers: usize,
    /// Mutations allowed per item before it is compiled without speculation
    pub max_mutations: u32,
    /// Keep generated sources, artifacts and the precompiled header
    pub keep_temps: bool,
    /// Log engine progress at info level
    pub verbose: bool,
    /// Log compile and load failures as warnings
    pub warnings: bool,
    /// Compile without optimization and with debug info
    pub debug: bool,
    /// Emit call-count profiling and print statistics at shutdown
    pub profile: bool,
    /// Compiler family
    pub toolchain: ToolchainFlavor,
    /// Explicit compiler executable
    pub compiler_path: Option<PathBuf>,
    /// Header with the declarations every generated source needs
    pub header_path: Option<PathBuf>,
    /// Where transient files live
    pub scratch_dir: Option<PathBuf>,
    /// Unit formation policy
    pub batching: BatchingPolicy,
}

impl Default for JitOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            max_mutations: DEFAULT_MAX_MUTATIONS,
            keep_temps: false,
            verbose: false,
            warnings: false,
            debug: false,
            profile: false,
            toolchain: ToolchainFlavor::default(),
            compiler_path: None,
            header_path: None,
            scratch_dir: None,
            batching: BatchingPolicy::default(),
        }
    }
}

impl JitOptions {
    /// Parse options from a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let opts: JitOptions = serde_json::from_str(json)?;
        Ok(opts.normalized())
    }

    /// Load options from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Apply defaults and bounds to out-of-range values
    pub fn normalized(mut self) -> Self {
        if self.workers == 0 {
            self.workers = DEFAULT_WORKERS;
        }
        self.workers = self.workers.min(MAX_WORKERS);
        if self.max_mutations == 0 {
            self.max_mutations = DEFAULT_MAX_MUTATIONS;
        }
        self
    }

    /// Whether compile and load failures should be reported
    pub fn report_failures(&self) -> bool {
        self.warnings || self.verbose
    }

    /// The compiler executable to run
    pub fn compiler_program(&self) -> PathBuf {
        self.compiler_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(self.toolchain.default_program()))
    }

    /// Resolve the header to precompile, failing setup if it does not exist
    pub fn resolve_header(&self) -> Result<PathBuf> {
        let path = self
            .header_path
            .as_ref()
            .ok_or_else(|| Error::setup("no header configured"))?;
        if !path.is_file() {
            return Err(Error::setup(format!("header {} not found", path.display())));
        }
        Ok(path.clone())
    }

    /// Directory for transient files, preferring memory-backed storage
    pub fn resolve_scratch_dir(&self) -> PathBuf {
        if let Some(dir) = &self.scratch_dir {
            return dir.clone();
        }
        let shm = Path::new("/dev/shm");
        if shm.is_dir() {
            shm.to_path_buf()
        } else {
            std::env::temp_dir()
        }
    }
}
