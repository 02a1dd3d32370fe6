//! Per-connection request handling on a pool thread.
//!
//! Each dispatched connection runs through exactly one cycle:
//!
//! ```text
//! AwaitingRequest -> Parsed -> Responding -> Done
//! ```
//!
//! The socket is switched to blocking mode with a read timeout so that a
//! half-open peer cannot pin a worker forever.

use crate::protocol::{self, Reply};
use crate::runtime::Shutdown;
use std::io::{self, Read, Write};
use std::net::{self, SocketAddr, TcpStream};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Maximum bytes read for one request.
pub const READ_CHUNK: usize = 2048;

/// Upper bound on how long the handshake path waits for the peer to read
/// the reply and close its side.
pub const HANDSHAKE_DRAIN: Duration = Duration::from_millis(100);

/// Shared, read-only context for every worker.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub shutdown: Shutdown,
    /// Zero disables the timeout.
    pub read_timeout: Duration,
}

/// Failure of a single connection. Never fatal to the server.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("timed out waiting for a request")]
    ReadTimeout,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Serve one connection and close it. Errors are logged, never propagated.
pub fn serve_connection(seq: u64, stream: TcpStream, peer: SocketAddr, ctx: &WorkerContext) {
    match handle(seq, &stream, peer, ctx) {
        Ok(()) => {}
        Err(WorkerError::ReadTimeout) => {
            warn!(seq, peer = %peer, "Timed out waiting for request, closing connection");
        }
        Err(e) => {
            error!(seq, peer = %peer, error = %e, "Connection failed");
        }
    }
}

fn handle(
    seq: u64,
    mut stream: &TcpStream,
    peer: SocketAddr,
    ctx: &WorkerContext,
) -> Result<(), WorkerError> {
    stream.set_nonblocking(false)?;
    let timeout = (!ctx.read_timeout.is_zero()).then_some(ctx.read_timeout);
    stream.set_read_timeout(timeout)?;

    // AwaitingRequest
    let mut buf = [0u8; READ_CHUNK];
    let Some(n) = read_request(stream, &mut buf)? else {
        debug!(seq, peer = %peer, "Peer closed before sending a request");
        return Ok(());
    };
    info!(seq, peer = %peer, "Got request");

    // Parsed
    let request = protocol::parse(&buf[..n]);
    info!(
        seq,
        request = %String::from_utf8_lossy(&buf[..n]).trim(),
        "Request"
    );

    // Responding
    let reply = protocol::execute(seq, request, &ctx.shutdown);

    // Done
    stream.write_all(reply.as_bytes())?;
    stream.flush()?;
    let _ = stream.shutdown(net::Shutdown::Write);

    if let Reply::Handshake(_) = reply {
        drain(stream, HANDSHAKE_DRAIN);
    }
    Ok(())
}

/// Read until at least one byte arrives. `None` means the peer closed first.
fn read_request(mut stream: &TcpStream, buf: &mut [u8]) -> Result<Option<usize>, WorkerError> {
    loop {
        match stream.read(buf) {
            Ok(0) => return Ok(None),
            Ok(n) => return Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                return Err(WorkerError::ReadTimeout)
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Discard whatever the peer still sends until it closes or `limit` elapses,
/// so the reply is read before the socket is torn down. `limit` bounds the
/// whole drain, not each read.
fn drain(mut stream: &TcpStream, limit: Duration) {
    let deadline = Instant::now() + limit;
    let mut scratch = [0u8; 256];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() || stream.set_read_timeout(Some(remaining)).is_err() {
            return;
        }
        match stream.read(&mut scratch) {
            Ok(0) => return,
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::handler::handshake_reply;
    use std::net::TcpListener;
    use std::thread;

    fn context(read_timeout: Duration) -> WorkerContext {
        WorkerContext {
            shutdown: Shutdown::new(),
            read_timeout,
        }
    }

    /// Run `serve_connection` against a client that sends `request`, returning
    /// everything the client reads back.
    fn exchange(request: &[u8], ctx: WorkerContext) -> Vec<u8> {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (stream, peer) = listener.accept().unwrap();
            serve_connection(1, stream, peer, &ctx);
        });

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(request).unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        server.join().unwrap();
        response
    }

    #[test]
    fn test_ping_round_trip() {
        let response = exchange(b"ping\n", context(Duration::from_secs(5)));
        assert_eq!(response, b"OK");
    }

    #[test]
    fn test_handshake_round_trip() {
        let response = exchange(b"<ucm>hello</ucm>\n", context(Duration::from_secs(5)));
        assert_eq!(response, handshake_reply().to_vec());
    }

    #[test]
    fn test_zero_read_timeout_means_no_timeout() {
        let response = exchange(b"ping\n", context(Duration::ZERO));
        assert_eq!(response, b"OK");
    }

    #[test]
    fn test_handshake_drain_is_bounded() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let ctx = context(Duration::from_secs(5));

        let server = thread::spawn(move || {
            let (stream, peer) = listener.accept().unwrap();
            let start = Instant::now();
            serve_connection(1, stream, peer, &ctx);
            start.elapsed()
        });

        // Keep the connection busy long after the reply went out.
        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"<ucm></ucm>\n").unwrap();
        let trickle = Instant::now();
        while trickle.elapsed() < Duration::from_millis(800) {
            if client.write_all(b"x").is_err() {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }

        let elapsed = server.join().unwrap();
        assert!(elapsed < Duration::from_millis(500), "worker held for {elapsed:?}");
    }

    #[test]
    fn test_shutdown_command_sets_flag() {
        let ctx = context(Duration::from_secs(5));
        let shutdown = ctx.shutdown.clone();
        let response = exchange(b"shutdown\n", ctx);
        assert_eq!(response, b"OK");
        assert!(shutdown.is_requested());
    }

    #[test]
    fn test_peer_closes_without_request() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let ctx = context(Duration::from_secs(5));

        let server = thread::spawn(move || {
            let (stream, peer) = listener.accept().unwrap();
            serve_connection(1, stream, peer, &ctx);
        });

        drop(TcpStream::connect(addr).unwrap());
        server.join().unwrap();
    }

    #[test]
    fn test_silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let ctx = context(Duration::from_millis(100));

        let server = thread::spawn(move || {
            let (stream, peer) = listener.accept().unwrap();
            let start = Instant::now();
            serve_connection(1, stream, peer, &ctx);
            start.elapsed()
        });

        let mut client = TcpStream::connect(addr).unwrap();
        let elapsed = server.join().unwrap();
        assert!(elapsed >= Duration::from_millis(100));

        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap_or(0);
        assert!(response.is_empty());
    }
}
