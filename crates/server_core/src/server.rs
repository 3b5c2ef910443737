//! The server capability surface handed to extensions, and the host
//! implementation behind it.
//!
//! Extensions never see the listener or the transport; everything they may
//! do goes through the [`Server`] trait.  [`HostServer`] is the production
//! implementation: it owns the resource router, the accept loop, the
//! diagnostics hub, and the process-wide configuration items.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::connection::Connection;
use crate::diagnostics::{levels, DiagnosticSink, DiagnosticSubscription, DiagnosticsSender};
use crate::error::ServerError;
use crate::http::{self, Response};
use crate::router::{ResourceHandler, ResourceRegistration, ResourceRouter};
use crate::timekeeper::{MonotonicClock, TimeSource};

/// Notified with the peer name whenever a ban or unban takes effect; the
/// second argument is true for a ban.
pub type BanDelegate = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// The capability object passed to each extension at load time.
///
/// All operations are safe to invoke from any thread or task.
pub trait Server: Send + Sync {
    /// Install a handler for the resource subspace rooted at `segments`.
    fn register_resource(
        &self,
        segments: &[String],
        handler: ResourceHandler,
    ) -> ResourceRegistration;

    /// The host's monotonic time source.
    fn time_keeper(&self) -> Arc<dyn TimeSource>;

    /// Receive host and extension diagnostics at `min_level` or above.
    fn subscribe_diagnostics(
        &self,
        sink: DiagnosticSink,
        min_level: usize,
    ) -> DiagnosticSubscription;

    fn ban(&self, peer: &str);
    fn unban(&self, peer: &str);
    fn bans(&self) -> Vec<String>;
    fn whitelist_add(&self, peer: &str);
    fn whitelist_remove(&self, peer: &str);
    fn whitelist(&self) -> Vec<String>;
    fn register_ban_delegate(&self, delegate: BanDelegate);

    /// String-keyed, string-valued, process-wide configuration items.
    fn configuration_item(&self, key: &str) -> Option<String>;
    fn set_configuration_item(&self, key: &str, value: &str);
}

/// Convenience alias for the shared handle extensions receive.
pub type DynServer = Arc<dyn Server>;

struct ListenerState {
    local_address: SocketAddr,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct HostServer {
    router: Arc<ResourceRouter>,
    time_keeper: Arc<dyn TimeSource>,
    diagnostics: Arc<DiagnosticsSender>,
    bans: Mutex<BTreeSet<String>>,
    whitelist: Mutex<BTreeSet<String>>,
    ban_delegates: Mutex<Vec<BanDelegate>>,
    configuration: Mutex<HashMap<String, String>>,
    listener: Mutex<Option<ListenerState>>,
}

impl HostServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            router: Arc::new(ResourceRouter::new()),
            time_keeper: Arc::new(MonotonicClock::new()),
            diagnostics: Arc::new(DiagnosticsSender::new("WebServer")),
            bans: Mutex::new(BTreeSet::new()),
            whitelist: Mutex::new(BTreeSet::new()),
            ban_delegates: Mutex::new(Vec::new()),
            configuration: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
        })
    }

    /// Publish a diagnostic on behalf of `sender_name` through the host hub.
    pub fn publish_diagnostic(&self, sender_name: &str, level: usize, message: &str) {
        self.diagnostics.publish_from(sender_name, level, message);
    }

    /// Bind the listener and start accepting connections.
    ///
    /// The port comes from the `Port` configuration item.  `secure` is
    /// refused outright: the TLS transport is an external collaborator not
    /// linked into this build, and refusing at bind time keeps the
    /// nonzero-exit contract for misconfigured deployments.
    pub async fn mobilize(&self, secure: bool) -> Result<SocketAddr, ServerError> {
        if secure {
            return Err(ServerError::TlsUnavailable);
        }
        if self.listener.lock().expect("listener slot poisoned").is_some() {
            return Err(ServerError::Network("server already mobilized".into()));
        }
        let port: u16 = self
            .configuration_item("Port")
            .ok_or_else(|| ServerError::Config("no 'Port' configuration item".into()))?
            .parse()
            .map_err(|_| ServerError::Config("'Port' is not a valid port number".into()))?;

        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| ServerError::Network(format!("unable to bind port {port}: {e}")))?;
        let local_address = listener
            .local_addr()
            .map_err(|e| ServerError::Network(format!("unable to read bound address: {e}")))?;

        let (stop, mut stop_rx) = watch::channel(false);
        let router = Arc::clone(&self.router);
        let diagnostics = Arc::clone(&self.diagnostics);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            diagnostics.publish(
                                levels::INFO,
                                &format!("new connection from {peer}"),
                            );
                            let router = Arc::clone(&router);
                            let diagnostics = Arc::clone(&diagnostics);
                            tokio::spawn(serve_connection(router, diagnostics, stream, peer));
                        }
                        Err(e) => {
                            diagnostics
                                .publish(levels::WARNING, &format!("accept failed: {e}"));
                        }
                    },
                }
            }
        });

        *self.listener.lock().expect("listener slot poisoned") = Some(ListenerState {
            local_address,
            stop,
            task,
        });
        self.diagnostics.publish(
            levels::IMPORTANT,
            &format!("now listening on port {}", local_address.port()),
        );
        Ok(local_address)
    }

    /// Stop accepting connections.  Established sockets are torn down by
    /// their own tasks as peers disconnect.
    pub async fn demobilize(&self) {
        let state = self.listener.lock().expect("listener slot poisoned").take();
        if let Some(state) = state {
            let _ = state.stop.send(true);
            let _ = state.task.await;
            self.diagnostics
                .publish(levels::IMPORTANT, "no longer listening");
        }
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        self.listener
            .lock()
            .expect("listener slot poisoned")
            .as_ref()
            .map(|state| state.local_address)
    }
}

async fn serve_connection(
    router: Arc<ResourceRouter>,
    diagnostics: Arc<DiagnosticsSender>,
    mut stream: TcpStream,
    peer: SocketAddr,
) {
    match http::read_request(&mut stream).await {
        Ok((request, trailer)) => {
            let target = request.target.clone();
            let connection = Arc::new(Connection::new(stream, peer));
            let response = router.dispatch(request, Arc::clone(&connection), trailer).await;
            tracing::debug!("{peer} {target} -> {}", response.status_code);
            if response.upgraded {
                return;
            }
            if let Some(mut stream) = connection.take_stream() {
                if let Err(e) = http::write_response(&mut stream, &response).await {
                    diagnostics.publish(
                        levels::WARNING,
                        &format!("failed to respond to {peer}: {e}"),
                    );
                }
                let _ = stream.shutdown().await;
            }
        }
        Err(e) => {
            diagnostics.publish(levels::INFO, &format!("bad request from {peer}: {e}"));
            let _ = http::write_response(&mut stream, &Response::text(400, "Bad Request")).await;
            let _ = stream.shutdown().await;
        }
    }
}

impl Server for HostServer {
    fn register_resource(
        &self,
        segments: &[String],
        handler: ResourceHandler,
    ) -> ResourceRegistration {
        self.router.register(segments, handler)
    }

    fn time_keeper(&self) -> Arc<dyn TimeSource> {
        Arc::clone(&self.time_keeper)
    }

    fn subscribe_diagnostics(
        &self,
        sink: DiagnosticSink,
        min_level: usize,
    ) -> DiagnosticSubscription {
        self.diagnostics.subscribe(sink, min_level)
    }

    fn ban(&self, peer: &str) {
        self.bans
            .lock()
            .expect("ban set poisoned")
            .insert(peer.to_string());
        for delegate in self.ban_delegates.lock().expect("ban delegates poisoned").iter() {
            delegate(peer, true);
        }
    }

    fn unban(&self, peer: &str) {
        self.bans.lock().expect("ban set poisoned").remove(peer);
        for delegate in self.ban_delegates.lock().expect("ban delegates poisoned").iter() {
            delegate(peer, false);
        }
    }

    fn bans(&self) -> Vec<String> {
        self.bans
            .lock()
            .expect("ban set poisoned")
            .iter()
            .cloned()
            .collect()
    }

    fn whitelist_add(&self, peer: &str) {
        self.whitelist
            .lock()
            .expect("whitelist poisoned")
            .insert(peer.to_string());
    }

    fn whitelist_remove(&self, peer: &str) {
        self.whitelist.lock().expect("whitelist poisoned").remove(peer);
    }

    fn whitelist(&self) -> Vec<String> {
        self.whitelist
            .lock()
            .expect("whitelist poisoned")
            .iter()
            .cloned()
            .collect()
    }

    fn register_ban_delegate(&self, delegate: BanDelegate) {
        self.ban_delegates
            .lock()
            .expect("ban delegates poisoned")
            .push(delegate);
    }

    fn configuration_item(&self, key: &str) -> Option<String> {
        self.configuration
            .lock()
            .expect("configuration items poisoned")
            .get(key)
            .cloned()
    }

    fn set_configuration_item(&self, key: &str, value: &str) {
        self.configuration
            .lock()
            .expect("configuration items poisoned")
            .insert(key.to_string(), value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn secure_mode_is_refused() {
        let server = HostServer::new();
        server.set_configuration_item("Port", "0");
        let error = server.mobilize(true).await.unwrap_err();
        assert!(matches!(error, ServerError::TlsUnavailable));
    }

    #[tokio::test]
    async fn missing_port_is_a_config_error() {
        let server = HostServer::new();
        let error = server.mobilize(false).await.unwrap_err();
        assert!(matches!(error, ServerError::Config(_)));
    }

    #[tokio::test]
    async fn serves_registered_resource_and_404s_the_rest() {
        let server = HostServer::new();
        server.set_configuration_item("Port", "0");
        let address = server.mobilize(false).await.unwrap();

        let _registration = server.register_resource(
            &["hello".to_string()],
            Arc::new(|_request, _connection, _trailer| {
                Box::pin(async { Response::text(200, "hi there") })
            }),
        );

        let body = fetch(address, "/hello").await;
        assert!(body.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(body.ends_with("hi there"));

        let body = fetch(address, "/missing").await;
        assert!(body.starts_with("HTTP/1.1 404 Not Found\r\n"));

        server.demobilize().await;
    }

    #[tokio::test]
    async fn ban_list_stores_and_notifies() {
        let server = HostServer::new();
        let notifications = Arc::new(Mutex::new(Vec::new()));
        let notifications_clone = notifications.clone();
        server.register_ban_delegate(Arc::new(move |peer: &str, banned: bool| {
            notifications_clone
                .lock()
                .unwrap()
                .push((peer.to_string(), banned));
        }));

        server.ban("badguy");
        server.whitelist_add("goodguy");
        assert_eq!(server.bans(), vec!["badguy".to_string()]);
        assert_eq!(server.whitelist(), vec!["goodguy".to_string()]);

        server.unban("badguy");
        assert!(server.bans().is_empty());
        assert_eq!(
            *notifications.lock().unwrap(),
            vec![("badguy".to_string(), true), ("badguy".to_string(), false)]
        );
    }

    #[tokio::test]
    async fn configuration_items_round_trip() {
        let server = HostServer::new();
        assert_eq!(server.configuration_item("Port"), None);
        server.set_configuration_item("Port", "8080");
        assert_eq!(server.configuration_item("Port"), Some("8080".to_string()));
    }

    async fn fetch(address: SocketAddr, target: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", address.port()))
            .await
            .unwrap();
        stream
            .write_all(format!("GET {target} HTTP/1.1\r\nHost: test\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }
}
