//! serversim: a single-protocol TCP test server.
//!
//! Each connection carries exactly one line-based command:
//! - `ECHO`, `ERROR`, `PING`, `HELP`, `WAIT <ms>`, `SHUTDOWN`
//! - anything containing `<ucm>` gets a fixed binary handshake reply
//!
//! Features:
//! - Readiness-polled acceptor (mio) feeding a bounded worker pool
//! - Cooperative shutdown via the `SHUTDOWN` command or SIGINT/SIGTERM
//! - Distinct process exit codes for configuration and runtime faults
//! - Configuration via environment, CLI arguments or TOML file

pub mod config;
pub mod exit;
pub mod host;
pub mod protocol;
pub mod runtime;
pub mod server;

pub use config::{Config, ConfigError};
pub use exit::ExitStatus;
pub use server::Server;
