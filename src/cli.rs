use std::time::Duration;

use thiserror::Error;

/// Parsed command-line flags. Every field is optional so the caller can
/// distinguish "not passed" from a default and apply env fallbacks.
#[derive(Debug, Default, PartialEq)]
pub struct Args {
    /// Serving-tool argv, from `-ramalama <tok>... ;`.
    pub ramalama: Option<Vec<String>>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub idle_timeout: Option<Duration>,
    /// Tokens after `--`, plus bare positionals. Accepted and ignored.
    pub rest: Vec<String>,
}

#[derive(Debug)]
pub enum Parsed {
    /// `-h` / `-help` / `--help` was passed; print help and exit 0.
    Help,
    Run(Args),
}

#[derive(Debug, Error, PartialEq)]
pub enum ArgsError {
    #[error("{0} may only be passed at most once")]
    Duplicate(&'static str),
    #[error("expected {what} after {flag}")]
    MissingValue { flag: &'static str, what: &'static str },
    #[error("invalid {what} after {flag}: {message}")]
    InvalidValue {
        flag: &'static str,
        what: &'static str,
        message: String,
    },
    #[error("expected terminating \";\" for -ramalama")]
    UnterminatedCommand,
    #[error("expected non-empty command after -ramalama")]
    EmptyCommand,
    #[error("unrecognized flag {0}. Use -help to list flags.")]
    UnknownFlag(String),
}

pub const HELP: &str = "\
Flags:
  -host ADDRESS         Address to listen on (default 127.0.0.1).
  -port PORT            Port to listen on (default 4917).
  -idle-timeout DUR     Stop the backend after DUR without requests,
                        e.g. 30s or 5m. 0 disables idle stopping (default).
  -ramalama TOKEN... ;  Command used to invoke ramalama, terminated by a
                        literal \";\". Overrides the RAMALAMA_COMMAND
                        environment variable.
  -h, -help, --help     Print this help and exit.
  --                    Stop flag parsing.
";

/// Scan argv (not including the program name). The flag grammar uses
/// single-dash long flags and a `;`-terminated token list, so this is a
/// hand-written scanner rather than a derive-based parser.
pub fn parse_args(argv: &[String]) -> Result<Parsed, ArgsError> {
    let mut args = Args::default();
    let mut cli = argv;

    while let Some((flag, tail)) = cli.split_first() {
        match flag.as_str() {
            "-h" | "-help" | "--help" => return Ok(Parsed::Help),

            "-ramalama" => {
                if args.ramalama.is_some() {
                    return Err(ArgsError::Duplicate("-ramalama"));
                }
                let end = tail
                    .iter()
                    .position(|t| t == ";")
                    .ok_or(ArgsError::UnterminatedCommand)?;
                if end == 0 {
                    return Err(ArgsError::EmptyCommand);
                }
                args.ramalama = Some(tail[..end].to_vec());
                cli = &tail[end + 1..];
            }

            "-port" => {
                if args.port.is_some() {
                    return Err(ArgsError::Duplicate("-port"));
                }
                let value = tail.first().ok_or(ArgsError::MissingValue {
                    flag: "-port",
                    what: "port number",
                })?;
                let port = value.parse::<u16>().map_err(|e| ArgsError::InvalidValue {
                    flag: "-port",
                    what: "port number",
                    message: e.to_string(),
                })?;
                args.port = Some(port);
                cli = &tail[1..];
            }

            "-host" => {
                if args.host.is_some() {
                    return Err(ArgsError::Duplicate("-host"));
                }
                let value = tail.first().ok_or(ArgsError::MissingValue {
                    flag: "-host",
                    what: "host",
                })?;
                args.host = Some(value.clone());
                cli = &tail[1..];
            }

            "-idle-timeout" => {
                if args.idle_timeout.is_some() {
                    return Err(ArgsError::Duplicate("-idle-timeout"));
                }
                let value = tail.first().ok_or(ArgsError::MissingValue {
                    flag: "-idle-timeout",
                    what: "duration",
                })?;
                args.idle_timeout = Some(parse_duration(value).map_err(|message| {
                    ArgsError::InvalidValue {
                        flag: "-idle-timeout",
                        what: "duration",
                        message,
                    }
                })?);
                cli = &tail[1..];
            }

            "--" => {
                args.rest.extend(tail.iter().cloned());
                return Ok(Parsed::Run(args));
            }

            other => {
                if other.starts_with('-') {
                    return Err(ArgsError::UnknownFlag(other.to_string()));
                }
                args.rest.push(other.to_string());
                cli = tail;
            }
        }
    }

    Ok(Parsed::Run(args))
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    // humantime rejects a bare zero, which is the documented way to
    // disable the idle timeout.
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Resolve the serving-tool argv: flag, then RAMALAMA_COMMAND
/// (whitespace-split), then the bare `ramalama` on PATH.
pub fn resolve_command(flag: Option<Vec<String>>) -> Vec<String> {
    if let Some(command) = flag {
        return command;
    }
    if let Ok(env) = std::env::var("RAMALAMA_COMMAND") {
        let tokens: Vec<String> = env.split_whitespace().map(str::to_string).collect();
        if !tokens.is_empty() {
            return tokens;
        }
    }
    vec!["ramalama".to_string()]
}
