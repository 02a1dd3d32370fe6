//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when the listener or a client socket
//! is ready. The listener is drained with non-blocking accepts; a readable
//! client is removed from the poller and handed to the worker pool, which
//! does the blocking read/process/write for that one connection.
//!
//! The poll call is bounded so the shutdown flag is observed at least once
//! per `poll_timeout` even when no traffic arrives.

use crate::config::{Config, ListenerEndpoint};
use crate::exit::ExitStatus;
use crate::runtime::connection::{ConnState, ConnectionRegistry};
use crate::runtime::pool::WorkerPool;
use crate::runtime::worker::{serve_connection, WorkerContext};
use crate::runtime::Shutdown;
use mio::event::Event;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use socket2::SockRef;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

pub struct EventLoop {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    connections: ConnectionRegistry,
    pool: WorkerPool,
    ctx: Arc<WorkerContext>,
    shutdown: Shutdown,
    poll_timeout: Duration,
    /// Last request sequence number handed to the pool.
    seq: u64,
    status: ExitStatus,
}

impl EventLoop {
    /// Bind the listener and register it with a fresh poller.
    pub fn bind(config: &Config, shutdown: Shutdown) -> io::Result<Self> {
        let endpoint = config.listener_endpoint();

        info!("Creating client thread pool");
        let pool = WorkerPool::new(config.workers);

        info!(port = endpoint.addr.port(), "Creating listener socket");
        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(create_listener(endpoint, config.linger)?);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(config.events_capacity),
            listener,
            connections: ConnectionRegistry::new(endpoint.backlog as usize),
            pool,
            ctx: Arc::new(WorkerContext {
                shutdown: shutdown.clone(),
                read_timeout: config.read_timeout,
            }),
            shutdown,
            poll_timeout: config.poll_timeout,
            seq: 0,
            status: ExitStatus::Clean,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until shutdown is requested, then release every socket and wait
    /// for dispatched requests to finish.
    pub fn run(mut self) -> ExitStatus {
        info!("Ready for requests!");

        while !self.shutdown.is_requested() {
            if let Err(e) = self.turn() {
                error!(error = %e, "Poll failed");
                self.fault();
                break;
            }
        }

        if self.shutdown.interrupted() {
            info!("Shutting down due to interrupt");
        }
        info!("Goodbye!");
        self.close()
    }

    /// One poll iteration: wait up to `poll_timeout`, then handle every
    /// ready event. Only a failing poll is returned as an error.
    fn turn(&mut self) -> io::Result<()> {
        match self.poll.poll(&mut self.events, Some(self.poll_timeout)) {
            Ok(()) => {}
            // A signal landed; the loop condition picks it up.
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        let ready: Vec<Readiness> = self.events.iter().map(Readiness::from).collect();
        for event in ready {
            if event.token == LISTENER_TOKEN {
                self.on_listener(event);
            } else {
                self.on_client(event);
            }
        }
        Ok(())
    }

    fn on_listener(&mut self, event: Readiness) {
        if event.error || event.hangup {
            error!("Listener socket lost");
            self.fault();
            return;
        }
        if event.readable {
            if let Err(e) = self.accept_connections() {
                error!(error = %e, "Shutting down due to accept fault");
                self.fault();
            }
        }
    }

    fn on_client(&mut self, event: Readiness) {
        // Data that arrived together with a half-close is still served.
        if event.readable && !event.error {
            if let Err(e) = self.dispatch(event.token) {
                error!(error = %e, "Shutting down due to dispatch fault");
                self.fault();
            }
        } else if event.error || event.hangup {
            warn!(conn_id = event.token.0, "Client connection lost");
            self.connections.close(self.poll.registry(), event.token);
        }
    }

    /// Accept until the listener would block.
    fn accept_connections(&mut self) -> io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nodelay(true)?;
                    SockRef::from(&stream).set_keepalive(true)?;
                    self.connections
                        .register(self.poll.registry(), stream, peer, LISTENER_TOKEN)?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Move a readable connection from the registry into the worker pool.
    fn dispatch(&mut self, token: Token) -> io::Result<()> {
        let Some(conn) = self.connections.take(self.poll.registry(), token) else {
            return Ok(());
        };

        self.seq += 1;
        let seq = self.seq;
        let (stream, peer, previous) = conn.dispatch();
        debug!(
            conn_id = token.0,
            seq,
            from = ?previous,
            to = ?ConnState::Dispatched,
            "Connection dispatched"
        );
        let ctx = Arc::clone(&self.ctx);

        let stats = self
            .pool
            .submit(seq, move || serve_connection(seq, stream, peer, &ctx))?;

        info!(
            seq,
            max_workers = stats.capacity,
            running = stats.running,
            queued = stats.queued,
            "Pool statistics"
        );
        Ok(())
    }

    fn fault(&mut self) {
        self.status = ExitStatus::RuntimeFault;
        self.shutdown.request();
    }

    /// Stop accepting, close idle clients, then drain the pool.
    fn close(self) -> ExitStatus {
        let EventLoop {
            poll,
            mut listener,
            mut connections,
            mut pool,
            status,
            ..
        } = self;

        let _ = poll.registry().deregister(&mut listener);
        let _ = SockRef::from(&listener).shutdown(std::net::Shutdown::Read);
        drop(listener);

        debug!(open = connections.len(), "Closing idle connections");
        connections.close_all(poll.registry());

        pool.shutdown();
        status
    }
}

/// The parts of a readiness event the loop acts on.
#[derive(Debug, Clone, Copy)]
struct Readiness {
    token: Token,
    readable: bool,
    error: bool,
    hangup: bool,
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            token: event.token(),
            readable: event.is_readable(),
            error: event.is_error(),
            hangup: event.is_read_closed() && event.is_write_closed(),
        }
    }
}

/// Create the listening socket: address reuse, keep-alive, linger and
/// non-blocking mode are set before binding.
fn create_listener(endpoint: ListenerEndpoint, linger: Duration) -> io::Result<std::net::TcpListener> {
    let addr = endpoint.addr;
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_keepalive(true)?;
    socket.set_linger(Some(linger))?;
    socket.set_nonblocking(true)?;

    info!(port = addr.port(), "Binding to port");
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(endpoint.backlog).unwrap_or(i32::MAX))?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, TcpStream};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Instant;

    fn config() -> Config {
        Config {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            backlog: 16,
            workers: 2,
            poll_timeout: Duration::from_millis(20),
            linger: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            events_capacity: 64,
            log_level: "info".to_string(),
        }
    }

    /// Drive the loop one poll at a time until `done` holds or 5 s pass.
    fn turn_until(event_loop: &mut EventLoop, done: impl Fn(&EventLoop) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            event_loop.turn().unwrap();
            if done(event_loop) {
                return true;
            }
        }
        false
    }

    fn endpoint() -> ListenerEndpoint {
        ListenerEndpoint {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            backlog: 16,
        }
    }

    #[test]
    fn test_create_listener_options() {
        let listener = create_listener(endpoint(), Duration::from_secs(60)).unwrap();
        let sock = SockRef::from(&listener);
        assert!(sock.reuse_address().unwrap());
        assert!(sock.keepalive().unwrap());
        assert_eq!(sock.linger().unwrap(), Some(Duration::from_secs(60)));
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_listener_token_is_reserved() {
        assert_eq!(LISTENER_TOKEN, Token(usize::MAX));
    }

    #[test]
    fn test_reset_client_is_closed_and_removed() {
        let shutdown = Shutdown::new();
        let mut event_loop = EventLoop::bind(&config(), shutdown.clone()).unwrap();
        let client = TcpStream::connect(event_loop.local_addr().unwrap()).unwrap();
        assert!(turn_until(&mut event_loop, |l| l.connections.len() == 1));

        // Zero linger turns the close into a reset.
        SockRef::from(&client).set_linger(Some(Duration::ZERO)).unwrap();
        drop(client);
        assert!(turn_until(&mut event_loop, |l| l.connections.len() == 0));

        shutdown.request();
        assert_eq!(event_loop.run(), ExitStatus::Clean);
    }

    #[test]
    fn test_listener_failure_is_runtime_fault() {
        for (error, hangup) in [(true, false), (false, true)] {
            let shutdown = Shutdown::new();
            let mut event_loop = EventLoop::bind(&config(), shutdown.clone()).unwrap();
            let addr = event_loop.local_addr().unwrap();

            event_loop.on_listener(Readiness {
                token: LISTENER_TOKEN,
                readable: false,
                error,
                hangup,
            });
            assert!(shutdown.is_requested());
            assert_eq!(event_loop.run(), ExitStatus::RuntimeFault);
            assert!(TcpStream::connect(addr).is_err());
        }
    }

    #[test]
    fn test_interrupt_ends_run() {
        static INTERRUPT: AtomicBool = AtomicBool::new(false);
        let event_loop = EventLoop::bind(&config(), Shutdown::observing(&INTERRUPT)).unwrap();
        let handle = thread::spawn(move || event_loop.run());

        thread::sleep(Duration::from_millis(50));
        INTERRUPT.store(true, Ordering::SeqCst);
        assert_eq!(handle.join().unwrap(), ExitStatus::Clean);
    }
}
