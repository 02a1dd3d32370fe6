//! Connection registry for accepted client sockets.
//!
//! The registry and the poller are mutated together: a connection is
//! registered for readiness if and only if it is present in the slab.
//! Only the event loop thread touches the registry.

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use slab::Slab;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{FromRawFd, IntoRawFd};
use tracing::debug;

/// Lifecycle of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted and waiting for request bytes.
    Accepted,
    /// Handed to a worker for its single request/response cycle.
    Dispatched,
    Closed,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    state: ConnState,
}

impl Connection {
    fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Accepted,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Move to `next`, returning the state left behind. Only `Accepted` has
    /// outgoing transitions.
    fn advance(&mut self, next: ConnState) -> ConnState {
        debug_assert_eq!(self.state, ConnState::Accepted, "connection already finished");
        std::mem::replace(&mut self.state, next)
    }

    /// Mark the connection as handed to a worker and transfer the socket out
    /// of the event loop's hands.
    ///
    /// The returned stream is still non-blocking; the worker decides its own
    /// blocking mode and timeouts.
    pub fn dispatch(mut self) -> (std::net::TcpStream, SocketAddr, ConnState) {
        let previous = self.advance(ConnState::Dispatched);
        // SAFETY: into_raw_fd releases ownership of a valid, open socket.
        let stream = unsafe { std::net::TcpStream::from_raw_fd(self.stream.into_raw_fd()) };
        (stream, self.peer, previous)
    }

    /// Close the socket in both directions and drop it.
    pub fn close(mut self) -> ConnState {
        let _ = self.stream.shutdown(Shutdown::Both);
        self.advance(ConnState::Closed)
    }
}

/// Registry of live connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations. The slab key is the
/// mio token the connection is registered under.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
}

impl ConnectionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            connections: Slab::with_capacity(capacity),
        }
    }

    /// Insert a freshly accepted connection and register it for readability.
    ///
    /// `reserved` is the listener's token, which must never be handed out.
    pub fn register(
        &mut self,
        registry: &Registry,
        stream: TcpStream,
        peer: SocketAddr,
        reserved: Token,
    ) -> io::Result<Token> {
        let entry = self.connections.vacant_entry();
        let token = Token(entry.key());
        if token == reserved {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "connection registry exhausted",
            ));
        }

        let conn = entry.insert(Connection::new(stream, peer));
        if let Err(e) = registry.register(&mut conn.stream, token, Interest::READABLE) {
            self.connections.remove(token.0);
            return Err(e);
        }

        debug!(conn_id = token.0, peer = %peer, "Accepted connection");
        Ok(token)
    }

    /// Deregister and remove a connection, handing ownership to the caller.
    pub fn take(&mut self, registry: &Registry, token: Token) -> Option<Connection> {
        let mut conn = self.connections.try_remove(token.0)?;
        let _ = registry.deregister(&mut conn.stream);
        Some(conn)
    }

    /// Deregister, remove and close a connection.
    pub fn close(&mut self, registry: &Registry, token: Token) {
        if let Some(conn) = self.take(registry, token) {
            let peer = conn.peer();
            let previous = conn.close();
            debug!(conn_id = token.0, peer = %peer, from = ?previous, "Connection closed");
        }
    }

    /// Deregister and close every remaining connection.
    pub fn close_all(&mut self, registry: &Registry) {
        for mut conn in self.connections.drain() {
            let _ = registry.deregister(&mut conn.stream);
            let peer = conn.peer();
            let previous = conn.close();
            debug!(peer = %peer, from = ?previous, "Connection closed");
        }
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpListener;
    use mio::Poll;
    use std::io::{Read, Write};
    use std::time::Duration;

    const RESERVED: Token = Token(usize::MAX);

    /// Accept one connection from a blocking client; returns both ends.
    fn pair(listener: &TcpListener) -> (TcpStream, SocketAddr, std::net::TcpStream) {
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        loop {
            match listener.accept() {
                Ok((stream, peer)) => return (stream, peer, client),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5))
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        }
    }

    #[test]
    fn test_register_take_close() {
        let poll = Poll::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut registry = ConnectionRegistry::new(4);

        let (s1, p1, _c1) = pair(&listener);
        let (s2, p2, _c2) = pair(&listener);

        let t1 = registry.register(poll.registry(), s1, p1, RESERVED).unwrap();
        let t2 = registry.register(poll.registry(), s2, p2, RESERVED).unwrap();
        assert_ne!(t1, t2);
        assert_eq!(registry.len(), 2);

        let conn = registry.take(poll.registry(), t1).unwrap();
        assert_eq!(conn.peer(), p1);
        assert_eq!(registry.len(), 1);
        assert!(registry.take(poll.registry(), t1).is_none());
        assert_eq!(conn.close(), ConnState::Accepted);

        registry.close(poll.registry(), t2);
        assert_eq!(registry.len(), 0);
        assert!(registry.take(poll.registry(), t2).is_none());
    }

    #[test]
    fn test_dispatched_stream_is_usable() {
        let poll = Poll::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut registry = ConnectionRegistry::new(1);

        let (stream, peer, mut client) = pair(&listener);
        let token = registry.register(poll.registry(), stream, peer, RESERVED).unwrap();
        let conn = registry.take(poll.registry(), token).unwrap();

        let (mut stream, dispatched_peer, previous) = conn.dispatch();
        assert_eq!(dispatched_peer, peer);
        assert_eq!(previous, ConnState::Accepted);
        stream.set_nonblocking(false).unwrap();

        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn test_close_all() {
        let poll = Poll::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut registry = ConnectionRegistry::new(4);

        let mut clients = Vec::new();
        for _ in 0..3 {
            let (stream, peer, client) = pair(&listener);
            registry.register(poll.registry(), stream, peer, RESERVED).unwrap();
            clients.push(client);
        }
        registry.close_all(poll.registry());
        assert_eq!(registry.len(), 0);

        for mut client in clients {
            let mut buf = [0u8; 1];
            client
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            assert_eq!(client.read(&mut buf).unwrap_or(0), 0);
        }
    }
}
