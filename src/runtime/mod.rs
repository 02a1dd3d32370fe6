//! Concurrency and dispatch runtime.
//!
//! Two tiers:
//! - `EventLoop`: one thread, non-blocking, multiplexes the listener and all
//!   idle client sockets with mio (epoll on Linux, kqueue on macOS).
//! - `WorkerPool`: a bounded set of threads, each running one blocking
//!   request/response cycle for one dispatched connection.
//!
//! `Shutdown` ties them together: workers and the interrupt handler set it,
//! the event loop observes it once per poll iteration.

mod connection;
mod event_loop;
mod pool;
mod shutdown;
mod worker;

pub use connection::{ConnState, Connection, ConnectionRegistry};
pub use event_loop::EventLoop;
pub use pool::{PoolStats, WorkerPool};
pub use shutdown::{install_interrupt_handler, Shutdown};
pub use worker::{serve_connection, WorkerContext, WorkerError, READ_CHUNK};
