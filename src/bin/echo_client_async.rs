//! Async echo client on tokio: sends one line from stdin, prints the reply.
//!
//! Exit codes: 0 success, 2 no input, 1 any other failure.

use clap::Parser;
use line_echo::client::{self, ClientError};
use std::process::ExitCode;
use tokio::io::BufReader;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the async client
#[derive(Parser, Debug)]
#[command(name = "echo-client-async")]
#[command(about = "Send one line to a line-echo server (tokio)", long_about = None)]
struct Args {
    /// Server host name or address
    #[arg(default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(default_value_t = 5555)]
    port: u16,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let stdin = BufReader::new(tokio::io::stdin());
    match client::request_from_async(&args.host, args.port, stdin).await {
        Ok(reply) => {
            println!("{reply}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(host = %args.host, port = args.port, error = %e, "Exchange failed");
            match e {
                ClientError::NoInput => ExitCode::from(2),
                _ => ExitCode::from(1),
            }
        }
    }
}
