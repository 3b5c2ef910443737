//! Server-side WebSocket endpoint.
//!
//! A handler that owns the connection upgrades it in place: the 101
//! response is written directly to the stream, any trailer bytes the
//! transport buffered past the HTTP request are replayed ahead of the
//! socket, and the frames are pumped by two background tasks.  Outbound
//! sends are non-blocking enqueues onto the writer task's queue, so a slow
//! peer never stalls the caller.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::connection::Connection;
use crate::diagnostics::{levels, DiagnosticSink, DiagnosticSubscription, DiagnosticsSender};
use crate::error::UpgradeError;
use crate::http::Request;

/// Close status reported when the peer sent a close frame with no code.
const NO_STATUS_CODE: u16 = 1005;
/// Close status reported when the connection dropped without a close frame.
const ABNORMAL_CLOSE_CODE: u16 = 1006;

type TextHandler = Arc<dyn Fn(String) + Send + Sync>;
type CloseHandler = Arc<dyn Fn(u16, String) + Send + Sync>;

type WsStream = WebSocketStream<PrefixedStream<TcpStream>>;

struct Inner {
    diagnostics: DiagnosticsSender,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    text_handler: Mutex<Option<TextHandler>>,
    close_handler: Mutex<Option<CloseHandler>>,
}

/// One WebSocket connection, usable from any thread.
///
/// Delegates are installed before [`WebSocket::open_as_server`]; frames that
/// arrive in the trailer are delivered through them as soon as the upgrade
/// completes.
pub struct WebSocket {
    inner: Arc<Inner>,
}

impl WebSocket {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                diagnostics: DiagnosticsSender::new("WebSocket"),
                outbound: Mutex::new(None),
                text_handler: Mutex::new(None),
                close_handler: Mutex::new(None),
            }),
        }
    }

    pub fn set_text_handler(&self, handler: impl Fn(String) + Send + Sync + 'static) {
        *self
            .inner
            .text_handler
            .lock()
            .expect("text handler slot poisoned") = Some(Arc::new(handler));
    }

    pub fn set_close_handler(&self, handler: impl Fn(u16, String) + Send + Sync + 'static) {
        *self
            .inner
            .close_handler
            .lock()
            .expect("close handler slot poisoned") = Some(Arc::new(handler));
    }

    pub fn subscribe_diagnostics(
        &self,
        sink: DiagnosticSink,
        min_level: usize,
    ) -> DiagnosticSubscription {
        self.inner.diagnostics.subscribe(sink, min_level)
    }

    /// Complete the server side of the upgrade handshake.
    ///
    /// On success the connection's stream has been taken over, the 101
    /// response has been written, and the pump tasks are running.  On
    /// failure the stream is left in place (unless the handshake write
    /// itself failed) so the caller can respond over plain HTTP.
    pub async fn open_as_server(
        &self,
        connection: &Connection,
        request: &Request,
        trailer: Vec<u8>,
    ) -> Result<(), UpgradeError> {
        let key = validate_upgrade(request)?;
        let accept = derive_accept_key(key.as_bytes());
        let mut stream = connection
            .take_stream()
            .ok_or(UpgradeError::ConnectionGone)?;

        let head = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Accept: {accept}\r\n\r\n"
        );
        stream
            .write_all(head.as_bytes())
            .await
            .map_err(|_| UpgradeError::Handshake)?;

        let ws_stream = WebSocketStream::from_raw_socket(
            PrefixedStream::new(trailer, stream),
            Role::Server,
            None,
        )
        .await;
        let (sink, source) = ws_stream.split();

        let (tx, rx) = mpsc::unbounded_channel();
        *self
            .inner
            .outbound
            .lock()
            .expect("outbound slot poisoned") = Some(tx);
        tokio::spawn(write_loop(sink, rx));
        tokio::spawn(read_loop(Arc::clone(&self.inner), source));

        self.inner.diagnostics.publish(levels::INFO, "opened as server");
        Ok(())
    }

    /// Queue a text frame.  Dropped silently if the socket never opened or
    /// the writer has already shut down.
    pub fn send_text(&self, text: String) {
        self.inner.send_message(Message::Text(text));
    }

    /// Queue a close frame; the writer shuts down after sending it.
    pub fn close(&self, code: u16, reason: &str) {
        self.inner.send_message(Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        })));
    }
}

impl Default for WebSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn send_message(&self, message: Message) {
        if let Some(tx) = &*self.outbound.lock().expect("outbound slot poisoned") {
            let _ = tx.send(message);
        }
    }

    fn deliver_text(&self, text: String) {
        let handler = self
            .text_handler
            .lock()
            .expect("text handler slot poisoned")
            .clone();
        if let Some(handler) = handler {
            handler(text);
        }
    }

    fn deliver_close(&self, code: u16, reason: String) {
        // Taken, not cloned: the close delegate fires at most once.
        let handler = self
            .close_handler
            .lock()
            .expect("close handler slot poisoned")
            .take();
        if let Some(handler) = handler {
            handler(code, reason);
        }
    }
}

async fn write_loop(mut sink: SplitSink<WsStream, Message>, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if sink.send(message).await.is_err() {
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(inner: Arc<Inner>, mut source: SplitStream<WsStream>) {
    while let Some(result) = source.next().await {
        match result {
            Ok(Message::Text(text)) => inner.deliver_text(text),
            Ok(Message::Ping(payload)) => inner.send_message(Message::Pong(payload)),
            Ok(Message::Close(frame)) => {
                let (code, reason) = match frame {
                    Some(frame) => (u16::from(frame.code), frame.reason.to_string()),
                    None => (NO_STATUS_CODE, String::new()),
                };
                inner
                    .diagnostics
                    .publish(levels::INFO, &format!("connection closed ({code})"));
                inner.deliver_close(code, reason);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                inner
                    .diagnostics
                    .publish(levels::WARNING, &format!("connection error: {e}"));
                inner.deliver_close(ABNORMAL_CLOSE_CODE, String::new());
                return;
            }
        }
    }
    inner.deliver_close(ABNORMAL_CLOSE_CODE, String::new());
}

/// Check the request head for a well-formed WebSocket upgrade and return
/// the value of `Sec-WebSocket-Key`.
pub fn validate_upgrade(request: &Request) -> Result<String, UpgradeError> {
    if !request.method.eq_ignore_ascii_case("GET") {
        return Err(UpgradeError::Method);
    }
    let upgrade_header = request
        .headers
        .value("Upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    if !upgrade_header || !request.headers.has_token("Connection", "upgrade") {
        return Err(UpgradeError::Headers);
    }
    match request.headers.value("Sec-WebSocket-Version") {
        Some("13") => {}
        _ => return Err(UpgradeError::Version),
    }
    request
        .headers
        .value("Sec-WebSocket-Key")
        .map(str::to_string)
        .ok_or(UpgradeError::MissingKey)
}

/// Stream adapter that replays already-buffered bytes before reading from
/// the underlying transport.
pub struct PrefixedStream<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.offset < this.prefix.len() {
            let remaining = &this.prefix[this.offset..];
            let take = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..take]);
            this.offset += take;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
