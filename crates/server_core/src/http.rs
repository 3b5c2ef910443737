//! Minimal HTTP/1.1 front end.
//!
//! The host only needs enough HTTP to route a request to an extension's
//! handler and to hand upgrade-capable handlers the raw connection: the
//! request line, the headers, and any bytes the transport buffered past the
//! logical end of the request (the trailer).  Request bodies are not read;
//! a handler that wants the connection takes it over instead.

use std::collections::VecDeque;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ServerError;

/// Upper bound on the request line plus headers.
const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Case-insensitive header collection preserving insertion order.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for `name`, if any.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether any comma-separated value of `name` equals `token`
    /// (case-insensitively).  Used for `Connection: keep-alive, Upgrade`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// A parsed request head.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    /// The raw request target as it appeared on the request line.
    pub target: String,
    /// Decoded, non-empty path segments of the target.
    pub path: Vec<String>,
    pub headers: Headers,
}

/// A response to be written back to the client.
#[derive(Debug)]
pub struct Response {
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// True when a handler took over the underlying connection; nothing
    /// further is written by the host.
    pub upgraded: bool,
}

impl Response {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            reason_phrase: reason_phrase(status_code).to_string(),
            headers: Headers::new(),
            body: Vec::new(),
            upgraded: false,
        }
    }

    pub fn not_found() -> Self {
        let mut response = Self::new(404);
        response.headers.add("Content-Type", "text/plain");
        response.body = b"Not Found".to_vec();
        response
    }

    pub fn text(status_code: u16, body: impl Into<String>) -> Self {
        let mut response = Self::new(status_code);
        response.headers.add("Content-Type", "text/plain");
        response.body = body.into().into_bytes();
        response
    }

    /// Marker response for a handler that adopted the connection.
    pub fn upgraded() -> Self {
        let mut response = Self::new(101);
        response.upgraded = true;
        response
    }
}

fn reason_phrase(status_code: u16) -> &'static str {
    match status_code {
        101 => "Switching Protocols",
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "",
    }
}

/// Split a request target into decoded, non-empty path segments.
pub fn path_segments(target: &str) -> Vec<String> {
    let path = target.split(['?', '#']).next().unwrap_or("");
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

/// Read one request head from `stream`.
///
/// Returns the parsed request together with the trailer: every byte that
/// was already buffered past the final header CRLF.
pub async fn read_request<S>(stream: &mut S) -> Result<(Request, Vec<u8>), ServerError>
where
    S: AsyncRead + Unpin,
{
    let mut buffer: Vec<u8> = Vec::with_capacity(1024);
    let head_end = loop {
        if let Some(position) = find_head_end(&buffer) {
            break position;
        }
        if buffer.len() > MAX_HEADER_BYTES {
            return Err(ServerError::Network("request head too large".into()));
        }
        let mut chunk = [0u8; 4096];
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|e| ServerError::Network(format!("read failed: {e}")))?;
        if read == 0 {
            return Err(ServerError::Network("connection closed mid-request".into()));
        }
        buffer.extend_from_slice(&chunk[..read]);
    };

    let trailer = buffer.split_off(head_end);
    let head = String::from_utf8(buffer)
        .map_err(|_| ServerError::Network("request head is not valid UTF-8".into()))?;

    let mut lines: VecDeque<&str> = head.split("\r\n").collect();
    let request_line = lines
        .pop_front()
        .ok_or_else(|| ServerError::Network("empty request".into()))?;
    let mut parts = request_line.split(' ');
    let method = parts
        .next()
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ServerError::Network("malformed request line".into()))?;
    let target = parts
        .next()
        .ok_or_else(|| ServerError::Network("malformed request line".into()))?;
    let version = parts
        .next()
        .ok_or_else(|| ServerError::Network("malformed request line".into()))?;
    if !version.starts_with("HTTP/1.") {
        return Err(ServerError::Network(format!(
            "unsupported protocol version '{version}'"
        )));
    }

    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ServerError::Network("malformed header line".into()))?;
        headers.add(name.trim(), value.trim());
    }

    let request = Request {
        method: method.to_string(),
        path: path_segments(target),
        target: target.to_string(),
        headers,
    };
    Ok((request, trailer))
}

/// Offset one past the final CRLFCRLF of the head, if present.
fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|position| position + 4)
}

/// Serialize `response` onto `stream`.  A `Content-Length` header is added
/// unless the response already carries one.
pub async fn write_response<S>(stream: &mut S, response: &Response) -> Result<(), ServerError>
where
    S: AsyncWrite + Unpin,
{
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        response.status_code, response.reason_phrase
    );
    for (name, value) in response.headers.iter() {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    if response.headers.value("Content-Length").is_none() {
        head.push_str(&format!("Content-Length: {}\r\n", response.body.len()));
    }
    head.push_str("\r\n");

    stream
        .write_all(head.as_bytes())
        .await
        .map_err(|e| ServerError::Network(format!("write failed: {e}")))?;
    stream
        .write_all(&response.body)
        .await
        .map_err(|e| ServerError::Network(format!("write failed: {e}")))?;
    stream
        .flush()
        .await
        .map_err(|e| ServerError::Network(format!("write failed: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_request_and_captures_trailer() {
        let raw = b"GET /chat/room HTTP/1.1\r\nHost: example.com\r\nUpgrade: websocket\r\n\r\nEXTRA BYTES";
        let mut stream: &[u8] = raw;
        let (request, trailer) = read_request(&mut stream).await.unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, vec!["chat".to_string(), "room".to_string()]);
        assert_eq!(request.headers.value("host"), Some("example.com"));
        assert_eq!(trailer, b"EXTRA BYTES");
    }

    #[tokio::test]
    async fn empty_trailer_when_request_ends_at_head() {
        let raw = b"GET / HTTP/1.1\r\n\r\n";
        let mut stream: &[u8] = raw;
        let (request, trailer) = read_request(&mut stream).await.unwrap();
        assert!(request.path.is_empty());
        assert!(trailer.is_empty());
    }

    #[tokio::test]
    async fn rejects_malformed_request_line() {
        let raw = b"NONSENSE\r\n\r\n";
        let mut stream: &[u8] = raw;
        assert!(read_request(&mut stream).await.is_err());
    }

    #[tokio::test]
    async fn rejects_truncated_request() {
        let raw = b"GET / HTTP/1.1\r\nHost: exam";
        let mut stream: &[u8] = raw;
        assert!(read_request(&mut stream).await.is_err());
    }

    #[test]
    fn header_token_matching_is_case_insensitive() {
        let mut headers = Headers::new();
        headers.add("Connection", "keep-alive, Upgrade");
        assert!(headers.has_token("connection", "upgrade"));
        assert!(!headers.has_token("connection", "close"));
    }

    #[test]
    fn path_segments_strip_query() {
        assert_eq!(
            path_segments("/a/b?x=1"),
            vec!["a".to_string(), "b".to_string()]
        );
        assert_eq!(path_segments("/"), Vec::<String>::new());
    }

    #[tokio::test]
    async fn writes_response_with_content_length() {
        let response = Response::text(200, "hello");
        let mut out: Vec<u8> = Vec::new();
        write_response(&mut out, &response).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }
}
