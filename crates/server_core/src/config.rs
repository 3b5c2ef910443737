//! JSON configuration binder.
//!
//! The configuration is a single JSON object read from `config.json` (or a
//! path given on the command line).  The binder resolves the enabled plugin
//! list against the per-plugin entries, turns relative image/runtime
//! directories into paths beside the executable, and forwards the `server`
//! subtree to the host's configuration items.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::error::ServerError;
use crate::plugin::linker::ModuleLinker;
use crate::plugin::record::PluginRecord;

/// The recognized root keys of the configuration tree.  Unknown keys are
/// ignored.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct HostConfig {
    /// String-keyed items forwarded verbatim to the server handle.
    #[serde(default)]
    pub server: HashMap<String, Value>,

    /// All known plugins, keyed by plugin name.
    #[serde(default)]
    pub plugins: HashMap<String, PluginEntry>,

    /// Which plugins to actually run, in order.
    #[serde(default, rename = "plugins-enabled")]
    pub plugins_enabled: Vec<String>,

    /// Directory holding the authoritative plugin binaries.
    #[serde(default, rename = "plugins-image")]
    pub plugins_image: Option<PathBuf>,

    /// Directory the supervisor copies binaries into before linking.
    #[serde(default, rename = "plugins-runtime")]
    pub plugins_runtime: Option<PathBuf>,

    #[serde(default)]
    pub secure: bool,

    #[serde(default, rename = "sslCertificate")]
    pub ssl_certificate: Option<String>,

    #[serde(default, rename = "sslKey")]
    pub ssl_key: Option<String>,

    #[serde(default, rename = "sslKeyPassphrase")]
    pub ssl_key_passphrase: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PluginEntry {
    /// Module file name, without platform prefix or extension.
    pub module: String,

    /// Opaque subtree handed to the plugin at load time.
    #[serde(default)]
    pub configuration: Value,
}

impl HostConfig {
    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("unable to read {}: {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| ServerError::Config(format!("unable to parse {}: {e}", path.display())))
    }

    /// The `server` subtree with every value rendered as a string, the form
    /// the server handle's configuration items take.
    pub fn server_items(&self) -> Vec<(String, String)> {
        self.server
            .iter()
            .map(|(key, value)| {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (key.clone(), rendered)
            })
            .collect()
    }

    pub fn image_directory(&self) -> PathBuf {
        match &self.plugins_image {
            Some(path) => resolve_against_exe_parent(path),
            None => exe_parent(),
        }
    }

    pub fn runtime_directory(&self) -> PathBuf {
        match &self.plugins_runtime {
            Some(path) => resolve_against_exe_parent(path),
            None => exe_parent().join("runtime"),
        }
    }

    /// Build the plugin records for every enabled plugin that has an entry,
    /// in the enabled list's order.  Enabled names without an entry are
    /// skipped.
    pub fn plugin_records(
        &self,
        image_directory: &Path,
        runtime_directory: &Path,
        linker: Arc<dyn ModuleLinker>,
    ) -> Vec<PluginRecord> {
        let mut records = Vec::new();
        for name in &self.plugins_enabled {
            let Some(entry) = self.plugins.get(name) else {
                continue;
            };
            let file_name = module_file_name(&entry.module);
            records.push(PluginRecord::new(
                name.clone(),
                entry.module.clone(),
                image_directory.join(&file_name),
                runtime_directory.join(&file_name),
                entry.configuration.clone(),
                Arc::clone(&linker),
            ));
        }
        records
    }
}

/// Platform-conventional shared library file name for a module.
pub fn module_file_name(module: &str) -> String {
    format!("{}{module}{}", env::consts::DLL_PREFIX, env::consts::DLL_SUFFIX)
}

/// Resolve a possibly-relative path against the executable's parent
/// directory.
pub fn resolve_against_exe_parent(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        exe_parent().join(path)
    }
}

pub fn exe_parent() -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}
