//! Dynamic plugin lifecycle: per-extension records, the link seam, the
//! reconciling supervisor, and the image-directory watcher it listens to.

pub mod linker;
pub mod record;
pub mod supervisor;
pub mod watcher;

pub use linker::{DynamicLinker, LinkFailure, LinkedModule, ModuleLinker};
pub use record::{DiagnosticDelegate, PluginEntryPoint, PluginRecord, UnloadDelegate};
pub use supervisor::PluginSupervisor;
pub use watcher::{DirectoryWatcher, PollingWatcher};
