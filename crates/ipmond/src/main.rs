// # ipmond - Interface Address Monitor Daemon
//
// Thin integration layer. All monitoring, debounce and nftables logic lives
// in ipmon-core; this binary only:
// 1. Reads configuration from environment variables
// 2. Initializes logging and the runtime
// 3. Wires the netlink monitor, the `nft` engine and the control socket
// 4. Runs the refresh engine until SIGINT/SIGTERM
//
// ## Configuration
//
// ### Refresh
// - `IPMON_DELAY`: Debounce delay; 1-99 are seconds, 100-999999 microseconds (default 200000)
// - `IPMON_FLUSH`: Always reload the whole ruleset instead of a hitless update (default off)
// - `IPMON_MONITOR`: Log every address event and the interface table after each refresh (default off)
// - `IPMON_START`: Refresh once at startup (default off)
//
// ### nftables
// - `IPMON_NFT_OUTPUT`: Output base path; `.vars` and `.sets` are appended. Unset disables nftables
// - `IPMON_NFT_CONF`: Top-level ruleset reloaded in flush mode and on `reload` (default /etc/nftables.conf)
// - `IPMON_NFT_TABLES`: Comma-separated tables receiving the named sets (default "ip nat,inet filter")
// - `IPMON_NFT_TIMEOUT_SECS`: Upper bound for one `nft` invocation (default 10)
//
// ### Misc
// - `IPMON_CONTROL_SOCKET`: Control socket path (default /run/ipmon.sock)
// - `IPMON_LOG_LEVEL`: trace, debug, info, warn or error (default info)
//
// ## Example
//
// ```bash
// export IPMON_NFT_OUTPUT=/etc/nftables.d/ipmon
// export IPMON_START=1
//
// ipmond
// ```

use anyhow::{Context, Result};
use ipmon_core::config::{DEFAULT_CONTROL_SOCKET, parse_delay};
use ipmon_core::engine::EngineEvent;
use ipmon_core::ruleset::TableRef;
use ipmon_core::traits::AddressEventSource;
use ipmon_core::{AppContext, ControlServer, IpmonConfig, IpmonEngine, NftConfig};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

/// Pause between attempts to bind the control socket
const CONTROL_BIND_BACKOFF: Duration = Duration::from_secs(1);

/// Queue depth between the control socket and the engine
const CONTROL_QUEUE_CAPACITY: usize = 16;

const USAGE: &str = "\
Usage: ipmond [-h|--help]

Keeps nftables address sets in sync with interface addresses.
Configuration is read from the environment:

  IPMON_DELAY             debounce delay: 1-99 seconds or 100-999999 microseconds
  IPMON_FLUSH             reload the whole ruleset on every refresh (0/1)
  IPMON_MONITOR           log address events and refreshed interfaces (0/1)
  IPMON_START             refresh once at startup (0/1)
  IPMON_NFT_OUTPUT        output base path for the .vars and .sets files
  IPMON_NFT_CONF          top-level nftables ruleset
  IPMON_NFT_TABLES        tables for the named sets, e.g. \"ip nat,inet filter\"
  IPMON_NFT_TIMEOUT_SECS  timeout of one nft invocation
  IPMON_CONTROL_SOCKET    control socket path
  IPMON_LOG_LEVEL         trace, debug, info, warn or error
";

/// Exit codes
///
/// - 0: Clean shutdown, or help requested
/// - 2: Runtime error (unexpected)
/// - 64: Usage or configuration error (EX_USAGE)
#[derive(Debug, Clone, Copy)]
enum IpmonExitCode {
    CleanShutdown = 0,
    RuntimeError = 2,
    Usage = 64,
}

impl From<IpmonExitCode> for ExitCode {
    fn from(code: IpmonExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Daemon configuration as read from the environment
#[derive(Debug)]
struct Config {
    delay: Option<Duration>,
    flush: bool,
    monitor: bool,
    start: bool,
    nft_output: Option<PathBuf>,
    nft_conf: Option<PathBuf>,
    nft_tables: Option<Vec<TableRef>>,
    nft_timeout_secs: Option<u64>,
    control_socket: PathBuf,
    log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        let delay = match non_empty_var("IPMON_DELAY") {
            Some(raw) => {
                let raw: i64 = raw
                    .parse()
                    .with_context(|| format!("IPMON_DELAY '{}' is not a number", raw))?;
                Some(parse_delay(raw)?)
            }
            None => None,
        };

        let nft_tables = non_empty_var("IPMON_NFT_TABLES")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| {
                        s.parse::<TableRef>()
                            .with_context(|| format!("IPMON_NFT_TABLES entry '{}'", s))
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?;

        let nft_timeout_secs = non_empty_var("IPMON_NFT_TIMEOUT_SECS")
            .map(|raw| {
                raw.parse::<u64>()
                    .with_context(|| format!("IPMON_NFT_TIMEOUT_SECS '{}' is not a number", raw))
            })
            .transpose()?;

        Ok(Self {
            delay,
            flush: bool_var("IPMON_FLUSH")?,
            monitor: bool_var("IPMON_MONITOR")?,
            start: bool_var("IPMON_START")?,
            nft_output: non_empty_var("IPMON_NFT_OUTPUT").map(PathBuf::from),
            nft_conf: non_empty_var("IPMON_NFT_CONF").map(PathBuf::from),
            nft_tables,
            nft_timeout_secs,
            control_socket: non_empty_var("IPMON_CONTROL_SOCKET")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONTROL_SOCKET)),
            log_level: env::var("IPMON_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Validate what the core configuration does not cover
    fn validate(&self) -> Result<()> {
        if self.nft_output.is_none()
            && (self.nft_conf.is_some()
                || self.nft_tables.is_some()
                || self.nft_timeout_secs.is_some())
        {
            anyhow::bail!(
                "IPMON_NFT_CONF, IPMON_NFT_TABLES and IPMON_NFT_TIMEOUT_SECS require IPMON_NFT_OUTPUT. \
                Set it via: export IPMON_NFT_OUTPUT=/etc/nftables.d/ipmon"
            );
        }

        if self.flush && self.nft_output.is_none() {
            anyhow::bail!("IPMON_FLUSH requires IPMON_NFT_OUTPUT");
        }

        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "IPMON_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }

        self.to_ipmon_config().validate()?;
        Ok(())
    }

    fn to_ipmon_config(&self) -> IpmonConfig {
        let mut config = IpmonConfig::new();
        if let Some(delay) = self.delay {
            config = config.with_delay(delay);
        }
        config.flush = self.flush;
        config.monitor = self.monitor;
        config.start = self.start;
        config.control_socket = self.control_socket.clone();

        if let Some(output) = &self.nft_output {
            let mut nft = NftConfig::new(output);
            if let Some(conf) = &self.nft_conf {
                nft.conf_file = conf.clone();
            }
            if let Some(tables) = &self.nft_tables {
                nft.tables = tables.clone();
            }
            if let Some(secs) = self.nft_timeout_secs {
                nft.timeout_secs = secs;
            }
            config = config.with_nft(nft);
        }

        config
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn bool_var(name: &str) -> Result<bool> {
    let Some(raw) = non_empty_var(name) else {
        return Ok(false);
    };
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("{} '{}' is not a boolean. Use 1 or 0", name, raw),
    }
}

fn main() -> ExitCode {
    let mut args = env::args().skip(1);
    if let Some(arg) = args.next() {
        if arg == "-h" || arg == "--help" {
            print!("{}", USAGE);
            return IpmonExitCode::CleanShutdown.into();
        }
        eprintln!("ipmond: unexpected argument '{}'\n", arg);
        eprint!("{}", USAGE);
        return IpmonExitCode::Usage.into();
    }

    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return IpmonExitCode::Usage.into();
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {:#}", e);
        return IpmonExitCode::Usage.into();
    }

    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return IpmonExitCode::RuntimeError.into();
    }

    info!("Starting ipmond");

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return IpmonExitCode::RuntimeError.into();
        }
    };

    let result = rt.block_on(async {
        if let Err(e) = run_daemon(config.to_ipmon_config()).await {
            error!("Daemon error: {:#}", e);
            IpmonExitCode::RuntimeError
        } else {
            IpmonExitCode::CleanShutdown
        }
    });

    result.into()
}

/// Run the daemon until a shutdown signal arrives
async fn run_daemon(config: IpmonConfig) -> Result<()> {
    let control_path = config.control_socket.clone();

    match &config.nft {
        Some(nft) => info!(
            "nftables output {}, {} table(s), flush {}",
            nft.output_base.display(),
            nft.tables.len(),
            config.flush
        ),
        None => info!("nftables integration disabled, tracking addresses only"),
    }
    info!("Debounce delay {:?}", config.delay());

    let context = AppContext::new(config, Box::new(ipmon_core::collector::SystemInterfaces::new()))?;
    let context = attach_firewall(context);

    let (request_tx, request_rx) = mpsc::channel(CONTROL_QUEUE_CAPACITY);
    let (engine, mut events) = IpmonEngine::new(context, event_source(), request_rx)?;

    let control = tokio::spawn(async move {
        let server = ControlServer::bind_retrying(&control_path, CONTROL_BIND_BACKOFF).await;
        if let Err(e) = server.serve(request_tx).await {
            warn!("Control channel stopped: {}", e);
        }
    });

    let observer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let EngineEvent::Stopped { reason } = &event {
                info!("Engine stopped: {}", reason);
            } else {
                debug!(?event, "Engine event");
            }
        }
    });

    let result = engine.run().await;

    // dropping the server removes the socket file
    control.abort();
    let _ = control.await;
    let _ = observer.await;

    info!("ipmond stopped");
    result.map_err(Into::into)
}

#[cfg(feature = "nftables")]
fn attach_firewall(context: AppContext) -> AppContext {
    match context.config.nft.as_ref().map(NftConfig::timeout) {
        Some(timeout) => context.with_firewall(Box::new(ipmon_nft::NftCli::new(timeout))),
        None => context,
    }
}

#[cfg(not(feature = "nftables"))]
fn attach_firewall(context: AppContext) -> AppContext {
    if context.config.nft.is_some() {
        warn!("Built without nftables support; only writing the generated files");
    }
    context
}

#[cfg(all(feature = "netlink", target_os = "linux"))]
fn event_source() -> Box<dyn AddressEventSource> {
    Box::new(ipmon_netlink::NetlinkMonitor::new())
}

#[cfg(not(all(feature = "netlink", target_os = "linux")))]
fn event_source() -> Box<dyn AddressEventSource> {
    warn!("No address monitor available; refreshing on control commands only");
    Box::new(NoEvents)
}

/// Source that never yields; the daemon then refreshes only on request
#[cfg(not(all(feature = "netlink", target_os = "linux")))]
struct NoEvents;

#[cfg(not(all(feature = "netlink", target_os = "linux")))]
impl AddressEventSource for NoEvents {
    fn watch(
        &self,
    ) -> std::pin::Pin<
        Box<dyn tokio_stream::Stream<Item = ipmon_core::traits::MonitorEvent> + Send + 'static>,
    > {
        Box::pin(tokio_stream::pending())
    }
}
