//! Per-extension bookkeeping and the load/unload protocol.
//!
//! A record tracks one configured plugin: where its authoritative image
//! lives, where the runtime copy goes, what configuration subtree it gets,
//! and whether it is currently linked.  `load` and `unload` are the only
//! state transitions; the supervisor decides when to call them.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use serde_json::Value;

use crate::diagnostics::levels;
use crate::error::PluginError;
use crate::plugin::linker::{LinkFailure, ModuleLinker};
use crate::server::DynServer;

/// Callback a plugin hands back from its entrypoint; invoking it stops and
/// cleans up the plugin just before its library is unlinked.
pub type UnloadDelegate = Box<dyn FnOnce() + Send>;

/// `(sender_name, level, message)` sink for diagnostics crossing the
/// extension boundary.
pub type DiagnosticDelegate = Arc<dyn Fn(&str, usize, &str) + Send + Sync>;

/// The entrypoint every plugin exports as `LoadPlugin`.
///
/// A return of `None` means the plugin failed to load; the host unlinks
/// the library and pins the record until the image changes.
pub type PluginEntryPoint = unsafe extern "C" fn(
    server: &DynServer,
    configuration: &Value,
    diagnostics: &DiagnosticDelegate,
) -> Option<UnloadDelegate>;

struct LoadedPlugin {
    // Declared before the library: the delegate (and any state it
    // captured, which may contain function pointers into the library's
    // code region) must be gone before the library is unlinked.
    unload: Option<UnloadDelegate>,
    library: Option<libloading::Library>,
}

pub struct PluginRecord {
    name: String,
    module_name: String,
    image_path: PathBuf,
    runtime_path: PathBuf,
    configuration: Value,
    last_modified: Option<SystemTime>,
    loadable: bool,
    linker: Arc<dyn ModuleLinker>,
    loaded: Option<LoadedPlugin>,
}

impl PluginRecord {
    pub fn new(
        name: String,
        module_name: String,
        image_path: PathBuf,
        runtime_path: PathBuf,
        configuration: Value,
        linker: Arc<dyn ModuleLinker>,
    ) -> Self {
        let last_modified = std::fs::metadata(&image_path)
            .and_then(|metadata| metadata.modified())
            .ok();
        Self {
            name,
            module_name,
            image_path,
            runtime_path,
            configuration,
            last_modified,
            loadable: true,
            linker,
            loaded: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn image_path(&self) -> &Path {
        &self.image_path
    }

    pub fn runtime_path(&self) -> &Path {
        &self.runtime_path
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    pub fn loadable(&self) -> bool {
        self.loadable
    }

    pub fn last_modified(&self) -> Option<SystemTime> {
        self.last_modified
    }

    pub(crate) fn set_last_modified(&mut self, when: SystemTime) {
        self.last_modified = Some(when);
    }

    pub(crate) fn clear_pin(&mut self) {
        self.loadable = true;
    }

    /// Run the load protocol: copy the image to the runtime path, link the
    /// copy, resolve the entrypoint, and invoke it.
    ///
    /// `image_mtime` is the image's modification time sampled by the caller
    /// before the copy; it becomes the record's `last_modified` only on
    /// success, so a change racing the load is picked up by the next scan.
    pub async fn load(
        &mut self,
        server: &DynServer,
        diagnostics: &DiagnosticDelegate,
        image_mtime: SystemTime,
    ) -> Result<(), PluginError> {
        if self.loaded.is_some() {
            return Ok(());
        }

        diagnostics(
            "WebServer",
            levels::INFO,
            &format!("Copying plug-in '{}'", self.name),
        );
        if tokio::fs::copy(&self.image_path, &self.runtime_path)
            .await
            .is_err()
        {
            let error = PluginError::Copy(self.name.clone());
            diagnostics("WebServer", levels::WARNING, &error.to_string());
            return Err(error);
        }

        diagnostics(
            "WebServer",
            levels::INFO,
            &format!("Linking plug-in '{}'", self.name),
        );
        let linked = match self.linker.link(&self.runtime_path) {
            Ok(linked) => linked,
            Err(failure) => {
                let error = match failure {
                    LinkFailure::Link(_) => PluginError::Link(self.name.clone()),
                    LinkFailure::MissingEntryPoint(_) => {
                        PluginError::MissingEntryPoint(self.name.clone())
                    }
                };
                diagnostics("WebServer", levels::WARNING, &error.to_string());
                self.fail_permanently().await;
                return Err(error);
            }
        };

        diagnostics(
            "WebServer",
            levels::INFO,
            &format!("Loading plug-in '{}'", self.name),
        );
        let plugin_diagnostics = retag_for_plugin(&self.name, diagnostics);
        // Safety: the entrypoint came from the module the linker just
        // resolved; the library handle outlives every call we make into it.
        let unload = unsafe { (linked.entry)(server, &self.configuration, &plugin_diagnostics) };
        match unload {
            None => {
                let error = PluginError::DeclinedToLoad(self.name.clone());
                diagnostics("", levels::WARNING, &error.to_string());
                drop(linked.library);
                self.fail_permanently().await;
                Err(error)
            }
            Some(unload) => {
                self.loaded = Some(LoadedPlugin {
                    unload: Some(unload),
                    library: linked.library,
                });
                self.last_modified = Some(image_mtime);
                diagnostics(
                    "WebServer",
                    levels::IMPORTANT,
                    &format!("Plug-in '{}' loaded", self.name),
                );
                Ok(())
            }
        }
    }

    /// Invoke the plugin's unload delegate, release it, then unlink the
    /// library.  Idempotent.
    pub fn unload(&mut self, diagnostics: &DiagnosticDelegate) {
        let Some(mut loaded) = self.loaded.take() else {
            return;
        };
        diagnostics(
            "WebServer",
            levels::INFO,
            &format!("Unloading plug-in '{}'", self.name),
        );
        if let Some(unload) = loaded.unload.take() {
            unload();
        }
        // The delegate and everything it captured are gone; only now is it
        // safe to unmap the code.
        drop(loaded.library);
        diagnostics(
            "WebServer",
            levels::IMPORTANT,
            &format!("Plug-in '{}' unloaded", self.name),
        );
    }

    async fn fail_permanently(&mut self) {
        self.loadable = false;
        let _ = tokio::fs::remove_file(&self.runtime_path).await;
    }
}

/// Wrap the host delegate so messages from the plugin surface under the
/// plugin's name, or `<plugin>/<sender>` when the plugin named a sender.
fn retag_for_plugin(plugin_name: &str, diagnostics: &DiagnosticDelegate) -> DiagnosticDelegate {
    let plugin_name = plugin_name.to_string();
    let inner = Arc::clone(diagnostics);
    Arc::new(move |sender_name: &str, level: usize, message: &str| {
        if sender_name.is_empty() {
            inner(&plugin_name, level, message);
        } else {
            inner(&format!("{plugin_name}/{sender_name}"), level, message);
        }
    })
}
