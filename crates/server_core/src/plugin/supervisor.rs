//! The reconciler that keeps loaded plugins in sync with the image
//! directory.
//!
//! One pass over the records (`scan_once`) loads whatever is eligible and
//! reloads whatever changed on disk.  The background reconciler runs a pass
//! whenever the directory watcher signals, debounced by 100 ms so a plugin
//! image still being written is not picked up mid-copy; a transient copy
//! failure re-queues another pass the same way.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::diagnostics::levels;
use crate::error::ServerError;
use crate::plugin::record::{DiagnosticDelegate, PluginRecord};
use crate::plugin::watcher::DirectoryWatcher;
use crate::server::DynServer;

/// How long the reconciler waits for the image directory to go quiet
/// before scanning.
const DEBOUNCE: Duration = Duration::from_millis(100);

enum ScanWake {
    Scan,
    Stop,
}

struct SupervisorInner {
    server: DynServer,
    diagnostics: DiagnosticDelegate,
    records: tokio::sync::Mutex<Vec<PluginRecord>>,
}

impl SupervisorInner {
    fn diag(&self, level: usize, message: &str) {
        (self.diagnostics)("PluginLoader", level, message);
    }

    /// One synchronous pass over all records, in stable insertion order.
    /// Returns true when some record wants another pass soon.
    async fn scan_once(&self) -> bool {
        let mut another_pass = false;
        let mut records = self.records.lock().await;
        for record in records.iter_mut() {
            if self.scan_record(record).await {
                another_pass = true;
            }
        }
        another_pass
    }

    async fn scan_record(&self, record: &mut PluginRecord) -> bool {
        let Ok(metadata) = std::fs::metadata(record.image_path()) else {
            return false;
        };
        let Ok(image_mtime) = metadata.modified() else {
            return false;
        };

        if record.is_loaded() && record.last_modified() != Some(image_mtime) {
            self.diag(
                levels::INFO,
                &format!("plugin '{}' appears to have changed", record.name()),
            );
            record.unload(&self.diagnostics);
            record.set_last_modified(image_mtime);
        }

        if record.is_loaded() {
            return false;
        }
        if !record.loadable() {
            // A pinned record becomes eligible again only when the image
            // changes relative to the pinning attempt.
            if record.last_modified() == Some(image_mtime) {
                return false;
            }
            record.clear_pin();
        }
        match record
            .load(&self.server, &self.diagnostics, image_mtime)
            .await
        {
            Ok(()) => false,
            Err(error) if error.is_transient() => {
                self.diag(
                    levels::WARNING,
                    &format!(
                        "plugin '{}' failed to copy...will attempt to copy and load again soon",
                        record.name()
                    ),
                );
                true
            }
            Err(_) => {
                record.set_last_modified(image_mtime);
                false
            }
        }
    }
}

pub struct PluginSupervisor {
    inner: Arc<SupervisorInner>,
    watcher: Option<Box<dyn DirectoryWatcher>>,
    wake: Option<mpsc::UnboundedSender<ScanWake>>,
    worker: Option<JoinHandle<()>>,
}

impl PluginSupervisor {
    pub fn new(
        server: DynServer,
        diagnostics: DiagnosticDelegate,
        records: Vec<PluginRecord>,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                server,
                diagnostics,
                records: tokio::sync::Mutex::new(records),
            }),
            watcher: None,
            wake: None,
            worker: None,
        }
    }

    /// Run a single reconciliation pass right now.
    pub async fn scan_once(&self) -> bool {
        self.inner.scan_once().await
    }

    /// Start the background reconciler, driven by `watcher`.
    pub fn start_background(
        &mut self,
        mut watcher: Box<dyn DirectoryWatcher>,
    ) -> Result<(), ServerError> {
        if self.worker.is_some() {
            return Ok(());
        }
        let (wake, rx) = mpsc::unbounded_channel();
        let watcher_wake = wake.clone();
        watcher.start(Box::new(move || {
            let _ = watcher_wake.send(ScanWake::Scan);
        }))?;
        self.watcher = Some(watcher);
        let inner = Arc::clone(&self.inner);
        let requeue = wake.clone();
        self.worker = Some(tokio::spawn(run_reconciler(inner, rx, requeue)));
        self.wake = Some(wake);
        Ok(())
    }

    /// Detach the watcher, stop the reconciler, and join it.
    pub async fn stop_background(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop();
        }
        if let Some(wake) = self.wake.take() {
            let _ = wake.send(ScanWake::Stop);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }

    /// Unload every live record, in insertion order.
    pub async fn unload_all(&self) {
        let mut records = self.inner.records.lock().await;
        for record in records.iter_mut() {
            record.unload(&self.inner.diagnostics);
        }
    }
}

async fn run_reconciler(
    inner: Arc<SupervisorInner>,
    mut rx: mpsc::UnboundedReceiver<ScanWake>,
    requeue: mpsc::UnboundedSender<ScanWake>,
) {
    inner.diag(levels::INFO, "starting");
    'outer: loop {
        inner.diag(levels::INFO, "sleeping");
        let Some(wake) = rx.recv().await else {
            break;
        };
        inner.diag(levels::INFO, "waking");
        match wake {
            ScanWake::Stop => break,
            ScanWake::Scan => loop {
                inner.diag(levels::INFO, "need scan...waiting");
                match tokio::time::timeout(DEBOUNCE, rx.recv()).await {
                    Ok(Some(ScanWake::Stop)) | Ok(None) => break 'outer,
                    Ok(Some(ScanWake::Scan)) => {
                        inner.diag(
                            levels::INFO,
                            "need scan, but updates still happening; backing off",
                        );
                    }
                    Err(_quiet) => {
                        inner.diag(levels::INFO, "scanning");
                        if inner.scan_once().await {
                            let _ = requeue.send(ScanWake::Scan);
                        }
                        break;
                    }
                }
            },
        }
    }
    inner.diag(levels::INFO, "stopping");
}
