//! Loading compiled artifacts
//!
//! Loaded modules are never unloaded: a frame may still be executing their
//! code after every entry point into them has been withdrawn.

use crate::entry::{EntryPoint, NativeFn};
use crate::error::{Error, Result};
use libloading::Library;
use std::path::Path;

/// A shared artifact mapped into the process
pub trait LoadedModule: Send + Sync {
    /// Resolve a generated function by name
    fn symbol(&self, name: &str) -> Result<EntryPoint>;
}

/// Maps built artifacts into the process
pub trait DynamicLoader: Send + Sync {
    fn load(&self, artifact: &Path) -> Result<Box<dyn LoadedModule>>;
}

/// Loader backed by the platform dynamic linker
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeLoader;

impl NativeLoader {
    pub fn new() -> Self {
        NativeLoader
    }
}

struct NativeModule {
    library: Library,
}

impl DynamicLoader for NativeLoader {
    fn load(&self, artifact: &Path) -> Result<Box<dyn LoadedModule>> {
        // Resolve everything now and make symbols visible to later units
        #[cfg(unix)]
        let library = unsafe {
            let flags = libloading::os::unix::RTLD_NOW | libloading::os::unix::RTLD_GLOBAL;
            libloading::os::unix::Library::open(Some(artifact), flags)
                .map(Library::from)
                .map_err(|e| Error::load(artifact, e.to_string()))?
        };
        #[cfg(not(unix))]
        let library = unsafe { Library::new(artifact).map_err(|e| Error::load(artifact, e.to_string()))? };

        tracing::debug!(target: "hotcc::loader", artifact = %artifact.display(), "Loaded artifact");
        Ok(Box::new(NativeModule { library }))
    }
}

impl LoadedModule for NativeModule {
    fn symbol(&self, name: &str) -> Result<EntryPoint> {
        // SAFETY: every exported generated function has the `NativeFn` signature
        let fun: NativeFn = unsafe {
            let symbol: libloading::Symbol<NativeFn> = self
                .library
                .get(name.as_bytes())
                .map_err(|e| Error::symbol(name, e.to_string()))?;
            *symbol
        };
        Ok(EntryPoint::new(fun))
    }
}
