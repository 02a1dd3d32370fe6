//! TCP server entry point.
//!
//! Binds the listener up front so the bound address is known (useful with
//! port 0), then hands control to the event loop until shutdown.

use crate::config::Config;
use crate::exit::ExitStatus;
use crate::runtime::{EventLoop, Shutdown};
use std::io;
use std::net::SocketAddr;

/// Server instance
pub struct Server {
    event_loop: EventLoop,
    shutdown: Shutdown,
}

impl Server {
    /// Bind the listening socket and prepare the worker pool.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let shutdown = Shutdown::new();
        let event_loop = EventLoop::bind(config, shutdown.clone())?;
        Ok(Server {
            event_loop,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.event_loop.local_addr()
    }

    /// Handle that stops the server when requested.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Serve until `SHUTDOWN`, an interrupt, or a runtime fault.
    pub fn run(self) -> ExitStatus {
        self.event_loop.run()
    }
}
