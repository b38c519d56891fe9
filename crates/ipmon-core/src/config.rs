//! Configuration types for ipmon
//!
//! This module defines the configuration surface of the monitor. The daemon
//! fills it from the environment; library users can build it directly.

use crate::ruleset::{Family, TableRef};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default debounce delay in microseconds
pub const DEFAULT_DELAY_US: u64 = 200_000;

/// Largest raw value accepted by [`parse_delay`]
pub const MAX_RAW_DELAY: i64 = 999_999;

/// Raw delay values below this are seconds, the rest microseconds
const SECONDS_THRESHOLD: i64 = 100;

/// Well-known path of the control socket
pub const DEFAULT_CONTROL_SOCKET: &str = "/run/ipmon.sock";

/// Main ipmon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpmonConfig {
    /// Quiet period between the first event of a burst and the refresh
    #[serde(default = "default_delay_us")]
    pub delay_us: u64,

    /// Always reload the whole nftables ruleset instead of a hitless update
    #[serde(default)]
    pub flush: bool,

    /// Log decoded netlink events and the snapshot after each refresh
    #[serde(default)]
    pub monitor: bool,

    /// Refresh once at startup, before any event arrives
    #[serde(default)]
    pub start: bool,

    /// nftables integration; `None` disables every firewall side effect
    #[serde(default)]
    pub nft: Option<NftConfig>,

    /// Path of the control socket
    #[serde(default = "default_control_socket")]
    pub control_socket: PathBuf,

    /// Capacity of the worker's observation channel
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Pause before a refresh that failed transiently is run again
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl IpmonConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self {
            delay_us: default_delay_us(),
            flush: false,
            monitor: false,
            start: false,
            nft: None,
            control_socket: default_control_socket(),
            event_channel_capacity: default_event_channel_capacity(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }

    /// Debounce delay as a [`Duration`]
    pub fn delay(&self) -> Duration {
        Duration::from_micros(self.delay_us)
    }

    /// Retry backoff as a [`Duration`]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Enable nftables integration
    pub fn with_nft(mut self, nft: NftConfig) -> Self {
        self.nft = Some(nft);
        self
    }

    /// Set the debounce delay
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_us = u64::try_from(delay.as_micros()).unwrap_or(u64::MAX);
        self
    }

    /// Set how long a transiently failed refresh waits before it is re-run
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.delay_us == 0 {
            return Err(crate::Error::config("Delay must be greater than zero"));
        }

        if self.flush && self.nft.is_none() {
            return Err(crate::Error::config(
                "Flush mode requires nftables integration to be enabled",
            ));
        }

        if self.control_socket.as_os_str().is_empty() {
            return Err(crate::Error::config("Control socket path cannot be empty"));
        }

        if self.event_channel_capacity == 0 {
            return Err(crate::Error::config("Event channel capacity must be > 0"));
        }

        if self.retry_backoff_ms == 0 {
            return Err(crate::Error::config("Retry backoff must be > 0"));
        }

        if let Some(nft) = &self.nft {
            nft.validate()?;
        }

        Ok(())
    }
}

impl Default for IpmonConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// nftables integration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NftConfig {
    /// Base path of the generated files; `.vars` and `.sets` are appended
    pub output_base: PathBuf,

    /// Top-level ruleset that includes the generated files
    #[serde(default = "default_conf_file")]
    pub conf_file: PathBuf,

    /// Tables that receive the per-interface named sets
    #[serde(default = "default_tables")]
    pub tables: Vec<TableRef>,

    /// Upper bound for a single invocation of the firewall engine
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl NftConfig {
    /// Create settings for the given output base with defaults elsewhere
    pub fn new(output_base: impl Into<PathBuf>) -> Self {
        Self {
            output_base: output_base.into(),
            conf_file: default_conf_file(),
            tables: default_tables(),
            timeout_secs: default_timeout_secs(),
        }
    }

    /// Path of the variable-definition file
    pub fn vars_path(&self) -> PathBuf {
        with_suffix(&self.output_base, "vars")
    }

    /// Path of the named-set file
    pub fn sets_path(&self) -> PathBuf {
        with_suffix(&self.output_base, "sets")
    }

    /// Engine timeout as a [`Duration`]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Validate the nftables settings
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.output_base.as_os_str().is_empty() {
            return Err(crate::Error::config("nftables output path cannot be empty"));
        }
        if self.tables.is_empty() {
            return Err(crate::Error::config("At least one nftables table is required"));
        }
        if self.timeout_secs == 0 {
            return Err(crate::Error::config("nftables timeout must be > 0"));
        }
        Ok(())
    }
}

/// Append `.suffix` to a path without replacing an existing extension
fn with_suffix(base: &std::path::Path, suffix: &str) -> PathBuf {
    let mut s = base.as_os_str().to_owned();
    s.push(".");
    s.push(suffix);
    PathBuf::from(s)
}

/// Interpret a raw `--delay`-style value
///
/// 1–99 are seconds, 100–999 999 are microseconds. Everything else is
/// rejected.
pub fn parse_delay(raw: i64) -> Result<Duration, crate::Error> {
    if raw <= 0 || raw > MAX_RAW_DELAY {
        return Err(crate::Error::config(format!(
            "Invalid delay {}: expected 1-99 seconds or 100-999999 microseconds",
            raw
        )));
    }
    let micros = if raw < SECONDS_THRESHOLD {
        raw * 1_000_000
    } else {
        raw
    };
    Ok(Duration::from_micros(micros.unsigned_abs()))
}

fn default_delay_us() -> u64 {
    DEFAULT_DELAY_US
}

fn default_control_socket() -> PathBuf {
    PathBuf::from(DEFAULT_CONTROL_SOCKET)
}

fn default_event_channel_capacity() -> usize {
    256
}

fn default_retry_backoff_ms() -> u64 {
    1_000
}

fn default_conf_file() -> PathBuf {
    PathBuf::from("/etc/nftables.conf")
}

fn default_tables() -> Vec<TableRef> {
    vec![
        TableRef::new(Family::Ip, "nat"),
        TableRef::new(Family::Inet, "filter"),
    ]
}

fn default_timeout_secs() -> u64 {
    10
}
