//! One-shot client for the serversim server.
//!
//! Sends a single message terminated by a newline and prints the reply.

use clap::Parser;
use serversim::host::hostname;
use std::io::{Read, Write};
use std::net::TcpStream;

const MAX_REPLY_SIZE: usize = 2048;

/// Command-line arguments for the client
#[derive(Parser, Debug)]
#[command(name = "serversim-send")]
#[command(version = "0.1.0")]
#[command(about = "TCP Client", long_about = None)]
struct Args {
    /// The host to connect to (default: this host's name)
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// The port to connect to
    #[arg(short, long)]
    port: u16,

    /// The message to send
    #[arg(short, long)]
    msg: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let host = args.host.unwrap_or_else(hostname);

    let mut stream = TcpStream::connect((host.as_str(), args.port))?;
    println!("Connected to server");

    stream.write_all(format!("{}\n", args.msg).as_bytes())?;
    println!("Sent message: {}", args.msg);

    let mut reply = [0u8; MAX_REPLY_SIZE];
    let n = stream.read(&mut reply)?;
    drop(stream);

    println!(
        "Received response: {}",
        String::from_utf8_lossy(&reply[..n])
    );
    Ok(())
}
