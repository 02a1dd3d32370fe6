//! The serversim line protocol.
//!
//! One request per connection:
//!
//! ```text
//! Request:  ECHO hello   world\n
//! Response: hello world
//!
//! Request:  WAIT 50\n
//! Response: OK            (after at least 50ms)
//!
//! Request:  <ucm>...</ucm>
//! Response: 00 00 00 10 00 00 00 02 "REST00010001OK"
//! ```
//!
//! Responses carry no trailing newline, except the fixed `HELP` block.

pub mod handler;
pub mod parser;

pub use handler::{execute, Reply, HELP_TEXT};
pub use parser::{parse, Command, Request, WaitArg};
