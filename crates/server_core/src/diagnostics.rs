//! Diagnostic message bus.
//!
//! Publishers are identified by a hierarchical sender name; subscribers
//! attach a sink together with a minimum level and receive every message at
//! or above that level.  Delivery is a direct call into each sink, so sinks
//! are expected to be cheap; a slow sink never back-pressures the publisher
//! beyond its own call time and deliveries are best-effort.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Conventional diagnostic levels.
pub mod levels {
    /// Routine information.
    pub const INFO: usize = 0;
    /// Information worth surfacing by default.
    pub const IMPORTANT: usize = 1;
    /// Something went wrong but was recovered or ignored.
    pub const WARNING: usize = 2;
    /// Something went wrong and could not be recovered.
    pub const ERROR: usize = 3;
}

/// A subscriber's receiving end: `(sender_name, level, message)`.
pub type DiagnosticSink = Arc<dyn Fn(&str, usize, &str) + Send + Sync>;

struct Subscriber {
    sink: DiagnosticSink,
    min_level: usize,
}

type SubscriberTable = Arc<Mutex<HashMap<u64, Subscriber>>>;

/// A source of diagnostic messages with its own sender name.
pub struct DiagnosticsSender {
    name: String,
    subscribers: SubscriberTable,
    next_id: AtomicU64,
}

impl DiagnosticsSender {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Attach a sink that receives messages at `min_level` or above.
    ///
    /// The returned subscription removes the sink when dropped or when
    /// [`DiagnosticSubscription::unsubscribe`] is called, whichever comes
    /// first.  After removal no further deliveries to the sink begin.
    pub fn subscribe(&self, sink: DiagnosticSink, min_level: usize) -> DiagnosticSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("diagnostics subscriber table poisoned")
            .insert(id, Subscriber { sink, min_level });
        DiagnosticSubscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    /// Publish a message under this sender's own name.
    pub fn publish(&self, level: usize, message: &str) {
        self.publish_from(&self.name, level, message);
    }

    /// Publish a message on behalf of a (possibly hierarchical) sender name.
    pub fn publish_from(&self, sender_name: &str, level: usize, message: &str) {
        let sinks: Vec<DiagnosticSink> = {
            let subscribers = self
                .subscribers
                .lock()
                .expect("diagnostics subscriber table poisoned");
            subscribers
                .values()
                .filter(|s| level >= s.min_level)
                .map(|s| Arc::clone(&s.sink))
                .collect()
        };
        for sink in sinks {
            sink(sender_name, level, message);
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Handle that keeps a diagnostic subscription alive.
pub struct DiagnosticSubscription {
    id: u64,
    subscribers: std::sync::Weak<Mutex<HashMap<u64, Subscriber>>>,
}

impl DiagnosticSubscription {
    /// Remove the subscriber.  Idempotent; dropping the handle has the
    /// same effect.
    pub fn unsubscribe(&self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers
                .lock()
                .expect("diagnostics subscriber table poisoned")
                .remove(&self.id);
        }
    }
}

impl Drop for DiagnosticSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_sink() -> (DiagnosticSink, Arc<Mutex<Vec<(String, usize, String)>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        let sink: DiagnosticSink = Arc::new(move |sender: &str, level: usize, message: &str| {
            log_clone
                .lock()
                .unwrap()
                .push((sender.to_string(), level, message.to_string()));
        });
        (sink, log)
    }

    #[test]
    fn delivers_at_or_above_min_level() {
        let sender = DiagnosticsSender::new("Test");
        let (sink, log) = recording_sink();
        let _subscription = sender.subscribe(sink, levels::WARNING);

        sender.publish(levels::INFO, "quiet");
        sender.publish(levels::WARNING, "loud");
        sender.publish(levels::ERROR, "louder");

        let log = log.lock().unwrap();
        assert_eq!(
            *log,
            vec![
                ("Test".to_string(), levels::WARNING, "loud".to_string()),
                ("Test".to_string(), levels::ERROR, "louder".to_string()),
            ]
        );
    }

    #[test]
    fn unsubscribe_stops_delivery_and_is_idempotent() {
        let sender = DiagnosticsSender::new("Test");
        let (sink, log) = recording_sink();
        let subscription = sender.subscribe(sink, 0);

        sender.publish(0, "first");
        subscription.unsubscribe();
        subscription.unsubscribe();
        sender.publish(0, "second");

        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn drop_unsubscribes() {
        let sender = DiagnosticsSender::new("Test");
        let (sink, log) = recording_sink();
        {
            let _subscription = sender.subscribe(sink, 0);
            sender.publish(0, "first");
        }
        sender.publish(0, "second");
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn publish_from_retags_sender() {
        let sender = DiagnosticsSender::new("Host");
        let (sink, log) = recording_sink();
        let _subscription = sender.subscribe(sink, 0);

        sender.publish_from("Host/Child", 1, "hello");

        let log = log.lock().unwrap();
        assert_eq!(log[0].0, "Host/Child");
    }
}
