//! The dynamic-link step of plugin loading, behind a seam so the rest of
//! the lifecycle can be exercised without real shared libraries.

use std::path::Path;

use libloading::Library;

use crate::plugin::record::PluginEntryPoint;

/// Result of linking a runtime file: the resolved entrypoint plus the
/// library handle keeping its code mapped.  Test linkers have no library.
pub struct LinkedModule {
    pub entry: PluginEntryPoint,
    pub library: Option<Library>,
}

/// Why a link attempt failed.  Both variants are permanent for the current
/// image bytes.
#[derive(Debug)]
pub enum LinkFailure {
    /// The file could not be linked at all.
    Link(String),
    /// The file linked but exports no `LoadPlugin` symbol.
    MissingEntryPoint(String),
}

pub trait ModuleLinker: Send + Sync {
    fn link(&self, runtime_path: &Path) -> Result<LinkedModule, LinkFailure>;
}

/// Production linker: `dlopen` the runtime file and resolve `LoadPlugin`.
pub struct DynamicLinker;

impl ModuleLinker for DynamicLinker {
    fn link(&self, runtime_path: &Path) -> Result<LinkedModule, LinkFailure> {
        // Safety: the runtime file is a copy the supervisor just made of a
        // configured plugin image; executing its initializers is the point.
        let library = unsafe { Library::new(runtime_path) }
            .map_err(|e| LinkFailure::Link(e.to_string()))?;
        let entry = unsafe { library.get::<PluginEntryPoint>(b"LoadPlugin") }
            .map(|symbol| *symbol)
            .map_err(|e| LinkFailure::MissingEntryPoint(e.to_string()))?;
        Ok(LinkedModule {
            entry,
            library: Some(library),
        })
    }
}
