//! Request parser.
//!
//! A request is one chunk of text. It is either the embedded handshake
//! (anything containing `<ucm>`) or a whitespace-separated command line.

/// Marker that switches a request to the binary handshake reply.
pub const HANDSHAKE_MARKER: &str = "<ucm>";

/// Parsed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Embedded handshake; bypasses tokenization entirely.
    Handshake,
    Command(Command),
}

/// Parsed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Echo the arguments back, joined by single spaces.
    Echo(String),
    /// Log the arguments at error level.
    Error(String),
    Ping,
    Shutdown,
    Wait(WaitArg),
    Help,
    /// Unknown command or empty request.
    Invalid,
}

/// Argument of the `WAIT` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitArg {
    Millis(u64),
    Missing,
    Invalid,
}

/// Parse one request from the raw bytes read off a connection.
///
/// Invalid UTF-8 is replaced rather than rejected so that the command
/// dispatch still produces a textual error for the client.
pub fn parse(input: &[u8]) -> Request {
    let text = String::from_utf8_lossy(input);
    let text = text.trim();

    if text.contains(HANDSHAKE_MARKER) {
        return Request::Handshake;
    }

    let mut tokens = text.split_whitespace();
    let Some(command) = tokens.next() else {
        return Request::Command(Command::Invalid);
    };

    let command = match command.to_uppercase().as_str() {
        "ECHO" => Command::Echo(join(tokens)),
        "ERROR" => Command::Error(join(tokens)),
        "PING" => Command::Ping,
        "SHUTDOWN" => Command::Shutdown,
        "WAIT" => Command::Wait(parse_wait(tokens.next())),
        "HELP" => Command::Help,
        _ => Command::Invalid,
    };

    Request::Command(command)
}

fn join<'a>(tokens: impl Iterator<Item = &'a str>) -> String {
    tokens.collect::<Vec<_>>().join(" ")
}

fn parse_wait(arg: Option<&str>) -> WaitArg {
    match arg {
        None => WaitArg::Missing,
        Some(ms) => ms.parse::<u64>().map_or(WaitArg::Invalid, WaitArg::Millis),
    }
}
