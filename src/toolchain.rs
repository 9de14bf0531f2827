//! External compiler invocation
//!
//! The engine drives a C compiler out of process with a fixed argument
//! template per compiler family. Invocations block the calling worker until
//! the compiler exits.

use crate::config::{JitOptions, ToolchainFlavor};
use crate::error::{Error, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

const GCC_COMMON_ARGS: &[&str] = &[
    "-O2",
    "-Wfatal-errors",
    "-fPIC",
    "-shared",
    "-w",
    "-pipe",
    "-nostartfiles",
    "-nodefaultlibs",
    "-nostdlib",
];
const GCC_COMMON_ARGS_DEBUG: &[&str] = &[
    "-O0",
    "-g",
    "-Wfatal-errors",
    "-fPIC",
    "-shared",
    "-w",
    "-pipe",
    "-nostartfiles",
    "-nodefaultlibs",
    "-nostdlib",
];

#[cfg(target_os = "macos")]
const CLANG_COMMON_ARGS: &[&str] = &["-O2", "-dynamic", "-w", "-bundle"];
#[cfg(target_os = "macos")]
const CLANG_COMMON_ARGS_DEBUG: &[&str] = &["-O0", "-g", "-dynamic", "-w", "-bundle"];
#[cfg(not(target_os = "macos"))]
const CLANG_COMMON_ARGS: &[&str] = &["-O2", "-fPIC", "-shared", "-w"];
#[cfg(not(target_os = "macos"))]
const CLANG_COMMON_ARGS_DEBUG: &[&str] = &["-O0", "-g", "-fPIC", "-shared", "-w"];

#[cfg(target_os = "macos")]
const CLANG_LINK_ARGS: &[&str] = &["-Wl,-undefined", "-Wl,dynamic_lookup"];
#[cfg(not(target_os = "macos"))]
const CLANG_LINK_ARGS: &[&str] = &[];

/// One toolchain invocation
#[derive(Debug, Clone, Copy)]
pub enum ToolchainJob<'a> {
    /// Build the precompiled header shared by every unit
    PrecompileHeader { header: &'a Path, output: &'a Path },
    /// Build the shared artifact of one unit
    CompileUnit { unit: u32, source: &'a Path, output: &'a Path },
}

impl ToolchainJob<'_> {
    pub fn output(&self) -> &Path {
        match self {
            ToolchainJob::PrecompileHeader { output, .. } => output,
            ToolchainJob::CompileUnit { output, .. } => output,
        }
    }
}

/// Runs the external compiler
pub trait Toolchain: Send + Sync {
    /// Run `job` to completion and return the exit code (-1 when killed by
    /// a signal)
    fn run(&self, job: &ToolchainJob<'_>) -> Result<i32>;

    /// Whether generated sources must `#include` the header stem to pick up
    /// the precompiled header
    fn includes_header(&self) -> bool {
        true
    }
}

/// gcc or clang found on the system
#[derive(Debug, Clone)]
pub struct CcToolchain {
    program: PathBuf,
    flavor: ToolchainFlavor,
    debug: bool,
    scratch_dir: PathBuf,
    precompiled_header: PathBuf,
}

impl CcToolchain {
    pub fn new(
        program: impl Into<PathBuf>,
        flavor: ToolchainFlavor,
        debug: bool,
        scratch_dir: impl Into<PathBuf>,
        precompiled_header: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            flavor,
            debug,
            scratch_dir: scratch_dir.into(),
            precompiled_header: precompiled_header.into(),
        }
    }

    /// Build from engine options
    pub fn from_options(opts: &JitOptions, scratch_dir: &Path, precompiled_header: &Path) -> Self {
        Self::new(
            opts.compiler_program(),
            opts.toolchain,
            opts.debug,
            scratch_dir,
            precompiled_header,
        )
    }

    fn common_args(&self) -> &'static [&'static str] {
        match (self.flavor, self.debug) {
            (ToolchainFlavor::Gcc, false) => GCC_COMMON_ARGS,
            (ToolchainFlavor::Gcc, true) => GCC_COMMON_ARGS_DEBUG,
            (ToolchainFlavor::Clang, false) => CLANG_COMMON_ARGS,
            (ToolchainFlavor::Clang, true) => CLANG_COMMON_ARGS_DEBUG,
        }
    }

    /// Full argument list for `job`
    pub fn args(&self, job: &ToolchainJob<'_>) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.common_args().iter().map(OsString::from).collect();
        let input = match job {
            ToolchainJob::PrecompileHeader { header, .. } => {
                if self.flavor == ToolchainFlavor::Clang {
                    args.push("-emit-pch".into());
                }
                *header
            }
            ToolchainJob::CompileUnit { source, .. } => {
                match self.flavor {
                    ToolchainFlavor::Gcc => {
                        let mut include = OsString::from("-I");
                        include.push(&self.scratch_dir);
                        args.push(include);
                    }
                    ToolchainFlavor::Clang => {
                        args.push("-include-pch".into());
                        args.push(self.precompiled_header.clone().into_os_string());
                        args.extend(CLANG_LINK_ARGS.iter().map(OsString::from));
                    }
                }
                *source
            }
        };
        args.push(input.as_os_str().to_owned());
        args.push("-o".into());
        args.push(job.output().as_os_str().to_owned());
        args
    }
}

impl Toolchain for CcToolchain {
    fn run(&self, job: &ToolchainJob<'_>) -> Result<i32> {
        let args = self.args(job);
        tracing::debug!(
            target: "hotcc::worker",
            program = %self.program.display(),
            args = ?args,
            "Starting process"
        );
        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| Error::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;
        let code = output.status.code().unwrap_or(-1);
        if code != 0 {
            tracing::debug!(
                target: "hotcc::worker",
                code,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "Compiler reported errors"
            );
        }
        Ok(code)
    }

    fn includes_header(&self) -> bool {
        self.flavor == ToolchainFlavor::Gcc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn test_gcc_unit_args() {
        let cc = CcToolchain::new("gcc", ToolchainFlavor::Gcc, false, "/dev/shm", "/dev/shm/h.h.gch");
        let args = strings(cc.args(&ToolchainJob::CompileUnit {
            unit: 3,
            source: Path::new("/dev/shm/u3.c"),
            output: Path::new("/dev/shm/u3.so"),
        }));
        assert_eq!(args[0], "-O2");
        assert!(args.contains(&"-I/dev/shm".to_string()));
        assert_eq!(&args[args.len() - 3..], &["/dev/shm/u3.c", "-o", "/dev/shm/u3.so"]);
        assert!(cc.includes_header());
    }

    #[test]
    fn test_gcc_debug_template() {
        let cc = CcToolchain::new("gcc", ToolchainFlavor::Gcc, true, "/tmp", "/tmp/h.h.gch");
        let args = strings(cc.args(&ToolchainJob::PrecompileHeader {
            header: Path::new("/usr/include/hotcc.h"),
            output: Path::new("/tmp/h.h.gch"),
        }));
        assert_eq!(&args[..2], &["-O0", "-g"]);
        assert!(!args.contains(&"-emit-pch".to_string()));
        assert_eq!(&args[args.len() - 3..], &["/usr/include/hotcc.h", "-o", "/tmp/h.h.gch"]);
    }

    #[test]
    fn test_clang_uses_pch_flags() {
        let cc = CcToolchain::new("clang", ToolchainFlavor::Clang, false, "/tmp", "/tmp/h.h.gch");
        let header = strings(cc.args(&ToolchainJob::PrecompileHeader {
            header: Path::new("/inc/hotcc.h"),
            output: Path::new("/tmp/h.h.gch"),
        }));
        assert!(header.contains(&"-emit-pch".to_string()));

        let unit = strings(cc.args(&ToolchainJob::CompileUnit {
            unit: 1,
            source: Path::new("/tmp/u1.c"),
            output: Path::new("/tmp/u1.so"),
        }));
        let pos = unit.iter().position(|a| a == "-include-pch").unwrap();
        assert_eq!(unit[pos + 1], "/tmp/h.h.gch");
        assert!(!cc.includes_header());
    }

    #[test]
    fn test_missing_program_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let cc = CcToolchain::new(
            dir.path().join("no-such-cc"),
            ToolchainFlavor::Gcc,
            false,
            dir.path(),
            dir.path().join("h.h.gch"),
        );
        let source = dir.path().join("u.c");
        let output = dir.path().join("u.so");
        let result = cc.run(&ToolchainJob::CompileUnit { unit: 0, source: &source, output: &output });
        assert!(matches!(result, Err(Error::Spawn { .. })));
    }
}
