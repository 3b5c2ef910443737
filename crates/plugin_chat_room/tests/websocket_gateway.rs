//! End-to-end tests running the chat room inside a real host server, with
//! real sockets, including the upgrade-boundary case where the client's
//! first frames ride in on the same bytes as the HTTP upgrade request.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use plugin_chat_room::room::UPGRADE_REQUIRED_BODY;
use server_core::{DiagnosticDelegate, DynServer, HostServer, Server, UnloadDelegate};

async fn start_host() -> (DynServer, SocketAddr, UnloadDelegate) {
    let server = HostServer::new();
    server.set_configuration_item("Port", "0");
    let address = server.mobilize(false).await.expect("bind failed");

    let configuration = json!({
        "space": "/chat",
        "nicknames": ["Alice", "Bob", "PePe"],
        "tellTimeout": 0.0,
        "mathQuiz": {"minCoolDown": 10000.0, "maxCoolDown": 10000.0}
    });
    let diagnostics: DiagnosticDelegate = Arc::new(|_sender, _level, _message| {});
    let handle: DynServer = server.clone();
    let unload = plugin_chat_room::load(&handle, &configuration, &diagnostics)
        .expect("chat room failed to load");
    (handle, address, unload)
}

fn upgrade_request_bytes(host: SocketAddr) -> Vec<u8> {
    format!(
        "GET /chat HTTP/1.1\r\n\
         Host: {host}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n"
    )
    .into_bytes()
}

/// A single masked client text frame, built by hand so it can be glued
/// directly onto the upgrade request bytes.
fn masked_text_frame(payload: &str) -> Vec<u8> {
    let payload = payload.as_bytes();
    assert!(payload.len() < 126, "test frames stay under one length byte");
    let mask = [0x12u8, 0x34, 0x56, 0x78];
    let mut frame = vec![0x81, 0x80 | payload.len() as u8];
    frame.extend_from_slice(&mask);
    frame.extend(
        payload
            .iter()
            .enumerate()
            .map(|(index, byte)| byte ^ mask[index % 4]),
    );
    frame
}

/// Read the 101 response head byte-by-byte so nothing of the WebSocket
/// stream behind it is consumed.
async fn read_response_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.expect("head truncated");
        head.push(byte[0]);
    }
    String::from_utf8(head).expect("head is not UTF-8")
}

async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> Value {
    loop {
        match ws.next().await.expect("connection ended").expect("read failed") {
            Message::Text(text) => return serde_json::from_str(&text).expect("invalid JSON"),
            _ => continue,
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn set_nickname_in_the_upgrade_trailer_succeeds() {
    let (server, address, unload) = start_host().await;

    let mut stream = TcpStream::connect(("127.0.0.1", address.port()))
        .await
        .unwrap();
    let mut bytes = upgrade_request_bytes(address);
    bytes.extend(masked_text_frame(
        &json!({"Type": "SetNickName", "NickName": "Bob"}).to_string(),
    ));
    stream.write_all(&bytes).await.unwrap();

    let head = read_response_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 101 "), "unexpected head: {head}");

    let mut ws = WebSocketStream::from_raw_socket(stream, Role::Client, None).await;
    let join = next_text(&mut ws).await;
    assert_eq!(join["Type"], json!("Join"));
    assert_eq!(join["NickName"], json!("Bob"));
    let result = next_text(&mut ws).await;
    assert_eq!(result["Type"], json!("SetNickNameResult"));
    assert_eq!(result["Success"], json!(true));

    unload();
    drop(server);
}

#[tokio::test(flavor = "multi_thread")]
async fn tells_broadcast_between_real_sockets() {
    let (server, address, unload) = start_host().await;

    let mut first = open_client(address).await;
    let mut second = open_client(address).await;

    send_text(
        &mut first,
        json!({"Type": "SetNickName", "NickName": "Alice"}),
    )
    .await;
    let join = next_text(&mut first).await;
    assert_eq!(join["Type"], json!("Join"));
    assert_eq!(next_text(&mut second).await["Type"], json!("Join"));
    assert_eq!(next_text(&mut first).await["Type"], json!("SetNickNameResult"));

    send_text(&mut first, json!({"Type": "Tell", "Tell": "42"})).await;
    let tell = next_text(&mut second).await;
    assert_eq!(tell["Type"], json!("Tell"));
    assert_eq!(tell["Sender"], json!("Alice"));
    assert_eq!(tell["Tell"], json!("42"));
    assert!(tell["Time"].is_f64() || tell["Time"].is_u64());

    unload();
    drop(server);
}

#[tokio::test(flavor = "multi_thread")]
async fn non_websocket_request_gets_the_consolation_body() {
    let (server, address, unload) = start_host().await;

    let mut stream = TcpStream::connect(("127.0.0.1", address.port()))
        .await
        .unwrap();
    stream
        .write_all(format!("GET /chat HTTP/1.1\r\nHost: {address}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Content-Type: text/plain\r\n"));
    assert!(response.ends_with(UPGRADE_REQUIRED_BODY));

    unload();
    drop(server);
}

#[tokio::test(flavor = "multi_thread")]
async fn unload_revokes_the_resource() {
    let (server, address, unload) = start_host().await;
    unload();

    let mut stream = TcpStream::connect(("127.0.0.1", address.port()))
        .await
        .unwrap();
    stream
        .write_all(format!("GET /chat HTTP/1.1\r\nHost: {address}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 404 "));

    drop(server);
}

async fn open_client(address: SocketAddr) -> WebSocketStream<TcpStream> {
    let mut stream = TcpStream::connect(("127.0.0.1", address.port()))
        .await
        .unwrap();
    stream
        .write_all(&upgrade_request_bytes(address))
        .await
        .unwrap();
    let head = read_response_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 101 "), "unexpected head: {head}");
    WebSocketStream::from_raw_socket(stream, Role::Client, None).await
}

async fn send_text(ws: &mut WebSocketStream<TcpStream>, message: Value) {
    use futures_util::SinkExt;
    ws.send(Message::Text(message.to_string())).await.unwrap();
}
