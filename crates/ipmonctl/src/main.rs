// # ipmonctl - ipmond Control Client
//
// Sends one command to a running ipmond over its control socket.
//
// - `ipmonctl update`: refresh now using the configured apply path; no reply
// - `ipmonctl reload`: refresh with a full ruleset reload and wait for the
//   daemon's acknowledgement
//
// ## Configuration
//
// - `IPMON_CONTROL_SOCKET`: Control socket path (default /run/ipmon.sock)
// - `IPMONCTL_TIMEOUT_SECS`: How long `reload` waits for the acknowledgement (default 30)
// - `IPMON_LOG_LEVEL`: trace, debug, info, warn or error (default warn)

use anyhow::{Context, Result};
use ipmon_core::config::DEFAULT_CONTROL_SOCKET;
use ipmon_core::{ControlClient, ControlCommand};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{Level, debug, error};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

const USAGE: &str = "\
Usage: ipmonctl <update|reload>

  update   refresh the interface table now
  reload   refresh with a full ruleset reload and wait for completion
";

/// Exit codes
#[derive(Debug, Clone, Copy)]
enum CtlExitCode {
    Success = 0,
    Failed = 1,
    Usage = 64,
}

impl From<CtlExitCode> for ExitCode {
    fn from(code: CtlExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    let command = match args.as_slice() {
        [arg] if arg == "-h" || arg == "--help" => {
            print!("{}", USAGE);
            return CtlExitCode::Success.into();
        }
        [arg] => match arg.parse::<ControlCommand>() {
            Ok(command) => command,
            Err(e) => {
                eprintln!("ipmonctl: {}\n", e);
                eprint!("{}", USAGE);
                return CtlExitCode::Usage.into();
            }
        },
        _ => {
            eprint!("{}", USAGE);
            return CtlExitCode::Usage.into();
        }
    };

    let log_level = match env::var("IPMON_LOG_LEVEL")
        .unwrap_or_default()
        .to_lowercase()
        .as_str()
    {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return CtlExitCode::Failed.into();
        }
    };

    match rt.block_on(send(command)) {
        Ok(()) => CtlExitCode::Success.into(),
        Err(e) => {
            eprintln!("ipmonctl: {:#}", e);
            CtlExitCode::Failed.into()
        }
    }
}

async fn send(command: ControlCommand) -> Result<()> {
    let server = env::var("IPMON_CONTROL_SOCKET")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONTROL_SOCKET));
    let client = ControlClient::new(&server);
    debug!(%command, server = %server.display(), "Sending control command");

    match command {
        ControlCommand::Update => client.update().await?,
        ControlCommand::Reload => {
            let timeout = reload_timeout()?;
            client
                .reload(&reply_path(), timeout)
                .await
                .context("reload was not acknowledged")?;
        }
    }

    debug!(%command, "Done");
    Ok(())
}

fn reload_timeout() -> Result<Duration> {
    match env::var("IPMONCTL_TIMEOUT_SECS") {
        Ok(raw) if !raw.trim().is_empty() => {
            let secs: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("IPMONCTL_TIMEOUT_SECS '{}' is not a number", raw))?;
            Ok(Duration::from_secs(secs))
        }
        _ => Ok(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
    }
}

/// Per-process reply endpoint, distinct from the server socket
fn reply_path() -> PathBuf {
    env::temp_dir().join(format!("ipmonctl-{}.sock", std::process::id()))
}
