//! Pharos Host Library
//!
//! A pluggable web server core: extensions loaded from dynamic libraries
//! register handlers for URL resource subspaces, a background supervisor
//! hot-reloads them when their on-disk images change, and upgrade-capable
//! handlers can adopt the raw connection for protocols like WebSocket.

pub mod config;
pub mod connection;
pub mod diagnostics;
pub mod error;
pub mod http;
pub mod plugin;
pub mod router;
pub mod server;
pub mod timekeeper;
pub mod websocket;

// Re-export the types extensions and the host binary touch most.
pub use connection::Connection;
pub use diagnostics::{levels, DiagnosticSink, DiagnosticSubscription, DiagnosticsSender};
pub use error::{PluginError, ServerError, UpgradeError};
pub use http::{Headers, Request, Response};
pub use plugin::{
    DiagnosticDelegate, DirectoryWatcher, DynamicLinker, PluginEntryPoint, PluginRecord,
    PluginSupervisor, PollingWatcher, UnloadDelegate,
};
pub use router::{ResourceHandler, ResourceRegistration, ResourceRouter};
pub use server::{BanDelegate, DynServer, HostServer, Server};
pub use timekeeper::{MonotonicClock, TimeSource};
pub use websocket::WebSocket;
