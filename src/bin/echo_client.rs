//! Blocking echo client: sends one line from stdin, prints the reply.
//!
//! Exit codes: 0 success, 1 connect or other fatal error, 2 no input,
//! 3 send failure, 4 receive failure.

use clap::Parser;
use line_echo::client;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the blocking client
#[derive(Parser, Debug)]
#[command(name = "echo-client")]
#[command(about = "Send one line to a line-echo server", long_about = None)]
struct Args {
    /// Server host name or address
    #[arg(default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(default_value_t = 5555)]
    port: u16,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match client::request_from(&args.host, args.port, std::io::stdin().lock()) {
        Ok(reply) => {
            println!("{reply}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(host = %args.host, port = args.port, error = %e, "Exchange failed");
            ExitCode::from(e.exit_code())
        }
    }
}
