//! Error types shared across the host library.

use thiserror::Error;

/// Errors produced by the host while configuring, binding, or serving.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A required configuration item was missing or unparseable.
    #[error("configuration error: {0}")]
    Config(String),

    /// The transport layer failed (bind, accept, or socket I/O).
    #[error("network error: {0}")]
    Network(String),

    /// Secure mode was requested but no TLS transport is linked into
    /// this build.
    #[error("secure mode requested but no TLS transport is available")]
    TlsUnavailable,

    /// A filesystem operation failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A plugin failed to load.
    #[error(transparent)]
    Plugin(#[from] PluginError),
}

/// Why a plugin load attempt failed.  The display strings double as the
/// warning diagnostics the host publishes for each failure.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The image could not be copied to the runtime path, typically
    /// because it is still being written.  The only transient failure.
    #[error("unable to copy plugin '{0}' library")]
    Copy(String),

    /// The runtime copy could not be dynamically linked.
    #[error("unable to link plugin '{0}' library")]
    Link(String),

    /// The runtime copy links but exports no `LoadPlugin` symbol.
    #[error("unable to find plugin '{0}' entrypoint")]
    MissingEntryPoint(String),

    /// The entrypoint ran but declined to hand back an unload delegate.
    #[error("plugin '{0}' failed to load")]
    DeclinedToLoad(String),
}

impl PluginError {
    /// Transient failures are retried by the supervisor; the rest pin the
    /// record until its image changes again.
    pub fn is_transient(&self) -> bool {
        matches!(self, PluginError::Copy(_))
    }
}

/// Why a WebSocket upgrade attempt was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UpgradeError {
    #[error("request method does not allow an upgrade")]
    Method,

    #[error("missing or mismatched upgrade headers")]
    Headers,

    #[error("unsupported WebSocket version")]
    Version,

    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,

    #[error("failed to complete the upgrade handshake")]
    Handshake,

    #[error("the underlying connection was already taken")]
    ConnectionGone,
}
