//! Command execution.
//!
//! Turns a parsed [`Request`] into the exact bytes to send back. Every
//! failure mode of the request is a reply value; nothing here returns an
//! error to the worker.

use super::parser::{Command, Request, WaitArg};
use crate::runtime::Shutdown;
use bytes::{BufMut, Bytes, BytesMut};
use std::thread;
use std::time::Duration;
use tracing::{error, info};

pub const OK: &[u8] = b"OK";
pub const ERR_INVALID_REQUEST: &[u8] = b"ERR_INVALID_REQUEST";
pub const ERR_INVALID_WAIT_TIME: &[u8] = b"ERR_INVALID_WAIT_TIME";
pub const ERR_MISSING_WAIT_TIME: &[u8] = b"ERR_MISSING_WAIT_TIME";

pub const HELP_TEXT: &str = concat!(
    "=-=-=-=-=-=-=-=-=-=-=\n",
    " Available Commands\n",
    "=-=-=-=-=-=-=-=-=-=-=\n",
    "<ucm>.*</ucm> ... Respond to ASv2 message\n",
    "HELP ............ Show help\n",
    "ECHO <str> ...... Where <str> is a string to echo back\n",
    "ERROR <str> ..... Print <str> as an ERROR message\n",
    "PING ............ Test connection\n",
    "SHUTDOWN ........ Stop the server\n",
    "WAIT <ms> ....... Wait for <ms> millseconds then return\n",
);

/// Handshake reply: two big-endian words followed by the status literal.
const HANDSHAKE_LENGTH: u32 = 16;
const HANDSHAKE_KIND: u32 = 2;
const HANDSHAKE_STATUS: &[u8] = b"REST00010001OK";

/// Bytes to write back for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Binary handshake acknowledgement. The connection is drained and
    /// closed after it is written.
    Handshake(Bytes),
    Text(Bytes),
}

impl Reply {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Reply::Handshake(bytes) | Reply::Text(bytes) => bytes,
        }
    }

    fn text(bytes: &[u8]) -> Self {
        Reply::Text(Bytes::copy_from_slice(bytes))
    }
}

/// Encode the handshake acknowledgement.
pub fn handshake_reply() -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + HANDSHAKE_STATUS.len());
    buf.put_u32(HANDSHAKE_LENGTH);
    buf.put_u32(HANDSHAKE_KIND);
    buf.put_slice(HANDSHAKE_STATUS);
    buf.freeze()
}

/// Execute one request for the task numbered `seq`.
///
/// `WAIT` blocks the calling worker thread; `SHUTDOWN` flips the server's
/// shutdown flag before the `OK` is returned.
pub fn execute(seq: u64, request: Request, shutdown: &Shutdown) -> Reply {
    let command = match request {
        Request::Handshake => {
            info!(seq, "ASV2 message received, replying");
            return Reply::Handshake(handshake_reply());
        }
        Request::Command(command) => command,
    };

    let reply = match command {
        Command::Echo(text) => Reply::Text(Bytes::from(text)),
        Command::Error(message) => {
            error!("{message}");
            Reply::text(OK)
        }
        Command::Ping => Reply::text(OK),
        Command::Shutdown => {
            info!(seq, "Shutting down per client request");
            shutdown.request();
            Reply::text(OK)
        }
        Command::Wait(WaitArg::Millis(ms)) => {
            info!(seq, ms, "Waiting");
            thread::sleep(Duration::from_millis(ms));
            Reply::text(OK)
        }
        Command::Wait(WaitArg::Invalid) => Reply::text(ERR_INVALID_WAIT_TIME),
        Command::Wait(WaitArg::Missing) => Reply::text(ERR_MISSING_WAIT_TIME),
        Command::Help => Reply::Text(Bytes::from_static(HELP_TEXT.as_bytes())),
        Command::Invalid => Reply::text(ERR_INVALID_REQUEST),
    };

    info!(
        seq,
        response = %String::from_utf8_lossy(reply.as_bytes()).replace('\n', "\\n"),
        "Response"
    );
    reply
}
