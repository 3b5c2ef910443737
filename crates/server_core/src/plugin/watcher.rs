//! Filesystem-change signal for the plugin image directory.
//!
//! The supervisor only consumes the callback; how changes are detected is
//! behind this seam.  The production watcher polls the directory's entry
//! names and modification times, which is portable and plenty for binaries
//! that change at human speed.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::ServerError;

pub type ChangeCallback = Box<dyn Fn() + Send + Sync>;

pub trait DirectoryWatcher: Send {
    /// Begin watching; `on_change` fires on any change under the directory.
    fn start(&mut self, on_change: ChangeCallback) -> Result<(), ServerError>;

    /// Detach.  No further callbacks fire after this returns.
    fn stop(&mut self);
}

pub struct PollingWatcher {
    directory: PathBuf,
    period: Duration,
    stop: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl PollingWatcher {
    pub fn new(directory: PathBuf, period: Duration) -> Self {
        Self {
            directory,
            period,
            stop: None,
            task: None,
        }
    }
}

type DirectorySnapshot = BTreeMap<OsString, SystemTime>;

async fn snapshot(directory: &PathBuf) -> DirectorySnapshot {
    let mut entries = BTreeMap::new();
    let Ok(mut reader) = tokio::fs::read_dir(directory).await else {
        return entries;
    };
    while let Ok(Some(entry)) = reader.next_entry().await {
        if let Ok(metadata) = entry.metadata().await {
            if let Ok(modified) = metadata.modified() {
                entries.insert(entry.file_name(), modified);
            }
        }
    }
    entries
}

impl DirectoryWatcher for PollingWatcher {
    fn start(&mut self, on_change: ChangeCallback) -> Result<(), ServerError> {
        if self.task.is_some() {
            return Ok(());
        }
        if let Err(e) = std::fs::read_dir(&self.directory) {
            warn!(
                "unable to monitor plug-ins image directory {}: {e}",
                self.directory.display()
            );
        }
        let directory = self.directory.clone();
        let period = self.period;
        let (stop, mut stop_rx) = watch::channel(false);
        self.stop = Some(stop);
        self.task = Some(tokio::spawn(async move {
            let mut previous = snapshot(&directory).await;
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        let current = snapshot(&directory).await;
                        if current != previous {
                            previous = current;
                            on_change();
                        }
                    }
                }
            }
        }));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for PollingWatcher {
    fn drop(&mut self) {
        DirectoryWatcher::stop(self);
    }
}
