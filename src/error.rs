//! Error types for the hotcc JIT engine

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for hotcc
///
/// Only engine setup reports these to the host. Once workers run, every
/// failure is folded into a unit status or an entry-point sentinel.
#[derive(Error, Debug)]
pub enum Error {
    /// Header, toolchain or scratch directory unusable at startup
    #[error("SetupError: {0}")]
    Setup(String),

    /// The precompiled header could not be built
    #[error("HeaderError: building precompiled header {} failed: {reason}", path.display())]
    HeaderPreparation { path: PathBuf, reason: String },

    /// The external toolchain exited with a non-zero status
    #[error("ToolchainError: unit {unit} exited with status {code}")]
    Toolchain { unit: u32, code: i32 },

    /// The external toolchain could not be started
    #[error("SpawnError: {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A compiled artifact could not be loaded
    #[error("LoadError: {}: {message}", path.display())]
    Load { path: PathBuf, message: String },

    /// A symbol was missing from a loaded artifact
    #[error("SymbolError: {name}: {message}")]
    Symbol { name: String, message: String },

    /// The code generator could not translate an item
    #[error("CodegenError: {0}")]
    Codegen(String),

    /// IO error
    #[error("IOError: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Invalid options
    #[error("ConfigError: {0}")]
    Config(String),
}

impl Error {
    /// Create a setup error
    pub fn setup(message: impl Into<String>) -> Self {
        Error::Setup(message.into())
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// Create a code generation error
    pub fn codegen(message: impl Into<String>) -> Self {
        Error::Codegen(message.into())
    }

    /// Create a load error
    pub fn load(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Error::Load {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a symbol resolution error
    pub fn symbol(name: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Symbol {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(err.to_string())
    }
}

/// Result type alias for hotcc operations
pub type Result<T> = std::result::Result<T, Error>;
