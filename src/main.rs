mod cli;
mod ramalama;
mod scheduler;
mod server;

use std::process::ExitCode;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::ramalama::Ramalama;
use crate::scheduler::FcfsScheduler;
use crate::server::AppState;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 4917;

// sysexits EX_USAGE for argument errors.
const EXIT_USAGE: u8 = 64;

#[tokio::main]
async fn main() -> ExitCode {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args = match cli::parse_args(&argv) {
        Ok(cli::Parsed::Help) => {
            println!("Usage: rama-swap [OPTION]...\n");
            println!("{}", cli::HELP);
            return ExitCode::SUCCESS;
        }
        Ok(cli::Parsed::Run(args)) => args,
        Err(e) => {
            eprintln!("rama-swap: {e}");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let host = args.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = args.port.unwrap_or(DEFAULT_PORT);
    let idle_timeout = args.idle_timeout.unwrap_or(Duration::ZERO);

    // The single backend slot gets the next port up.
    let Some(backend_port) = port.checked_add(1) else {
        eprintln!("rama-swap: -port {port} leaves no room for the backend port");
        return ExitCode::from(EXIT_USAGE);
    };

    let tool = Ramalama {
        command: cli::resolve_command(args.ramalama),
    };
    info!(command = ?tool.command, "using serving tool");

    let scheduler = FcfsScheduler::new(tool.clone(), backend_port, idle_timeout);
    let state = AppState::new(tool, scheduler);

    let listener = match tokio::net::TcpListener::bind((host.as_str(), port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(host = %host, port, error = %e, "failed to listen");
            return ExitCode::FAILURE;
        }
    };
    info!(host = %host, port, "listening");

    if let Err(e) = server::serve(listener, state).await {
        error!(error = %e, "failed to serve");
        return ExitCode::FAILURE;
    }

    info!("shutting down");
    ExitCode::SUCCESS
}
