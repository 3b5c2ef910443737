//! Ownership wrapper for an accepted transport connection.
//!
//! The request head has already been read off the stream by the time a
//! handler sees the connection; a handler that performs an in-band protocol
//! upgrade takes the stream out and owns it from then on.

use std::net::SocketAddr;
use std::sync::Mutex;

use tokio::net::TcpStream;

pub struct Connection {
    peer: SocketAddr,
    stream: Mutex<Option<TcpStream>>,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            peer,
            stream: Mutex::new(Some(stream)),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Take exclusive ownership of the underlying stream.  Returns `None`
    /// if another caller already did.
    pub fn take_stream(&self) -> Option<TcpStream> {
        self.stream
            .lock()
            .expect("connection stream slot poisoned")
            .take()
    }
}
