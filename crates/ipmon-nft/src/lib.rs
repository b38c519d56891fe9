// # nftables Firewall Engine
//
// Drives the `nft` command line tool.
//
// ## Operations
//
// | Call          | Invocation             | stdin              |
// |---------------|------------------------|--------------------|
// | `check()`     | `nft --check -f -`     | one probe line     |
// | `apply()`     | `nft --json -f -`      | the JSON batch     |
// | `load_file()` | `nft -f <path>`        | -                  |
//
// `nft` applies a file or batch as one transaction, so a rejected batch
// leaves the live ruleset as it was.
//
// ## Timeouts
//
// Every invocation is bounded. A hung `nft` is killed and reported as
// `Error::Timeout`; the caller logs it and carries on.

use async_trait::async_trait;
use ipmon_core::error::{Error, Result};
use ipmon_core::traits::FirewallEngine;
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

/// Default program name, looked up in `PATH`
pub const NFT_PROGRAM: &str = "nft";

/// Firewall engine backed by the `nft` binary
#[derive(Debug, Clone)]
pub struct NftCli {
    program: OsString,
    /// Arguments placed before the operation's own arguments
    prefix_args: Vec<OsString>,
    timeout: Duration,
}

impl NftCli {
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: NFT_PROGRAM.into(),
            prefix_args: Vec::new(),
            timeout,
        }
    }

    /// Run a different program, e.g. a wrapper around `nft`
    pub fn with_command(
        mut self,
        program: impl Into<OsString>,
        prefix_args: impl IntoIterator<Item = impl Into<OsString>>,
    ) -> Self {
        self.program = program.into();
        self.prefix_args = prefix_args.into_iter().map(Into::into).collect();
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(&self, operation: &str, args: &[&OsStr], input: Option<&[u8]>) -> Result<()> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.prefix_args)
            .args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        trace!(operation, "Spawning {:?}", self.program);
        let mut child = command
            .spawn()
            .map_err(|e| Error::firewall(format!("{}: failed to spawn nft: {}", operation, e)))?;

        let exchange = async move {
            if let (Some(data), Some(mut stdin)) = (input, child.stdin.take()) {
                stdin.write_all(data).await?;
                stdin.shutdown().await?;
            }
            child.wait_with_output().await
        };

        let output = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(Error::firewall(format!("{}: nft I/O failed: {}", operation, e)));
            }
            // dropping the future kills the child
            Err(_) => return Err(Error::timeout(operation, self.timeout)),
        };

        if output.status.success() {
            debug!(operation, "nft succeeded");
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let errors = parse_nft_errors(&stderr);
        let detail = if errors.is_empty() {
            format!("exit status {}", output.status)
        } else {
            errors.join("; ")
        };

        Err(Error::Firewall {
            message: format!("{}: {}", operation, detail),
            stderr: Some(stderr),
            exit_code: output.status.code(),
        })
    }
}

#[async_trait]
impl FirewallEngine for NftCli {
    async fn check(&self, command: &str) -> Result<()> {
        let mut script = command.to_string();
        script.push('\n');
        let args = [OsStr::new("--check"), OsStr::new("-f"), OsStr::new("-")];
        self.run("nft --check", &args, Some(script.as_bytes())).await
    }

    async fn apply(&self, batch: &serde_json::Value) -> Result<()> {
        let json = serde_json::to_vec(batch)?;
        let args = [OsStr::new("--json"), OsStr::new("-f"), OsStr::new("-")];
        self.run("nft --json", &args, Some(json.as_slice())).await
    }

    async fn load_file(&self, path: &Path) -> Result<()> {
        self.run("nft -f", &[OsStr::new("-f"), path.as_os_str()], None).await
    }

    fn engine_name(&self) -> &'static str {
        "nftables"
    }
}

/// Extract error messages from `nft` stderr
///
/// Understands the JSON error format and falls back to plain lines with
/// the usual prefixes stripped.
pub fn parse_nft_errors(stderr: &str) -> Vec<String> {
    if let Ok(json_err) = serde_json::from_str::<serde_json::Value>(stderr)
        && let Some(errors) = json_err.get("errors").and_then(|e| e.as_array())
    {
        return errors
            .iter()
            .filter_map(|e| e.get("message").and_then(|m| m.as_str()))
            .map(String::from)
            .collect();
    }

    stderr
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("Error:") || line.starts_with("nft:"))
        .map(|line| {
            line.trim_start_matches("Error:")
                .trim_start_matches("nft:")
                .trim()
                .to_string()
        })
        .collect()
}
