// # Firewall Engine Trait
//
// Defines the interface to the firewall rule engine.
//
// ## Implementations
//
// - `nft` command line: `ipmon-nft` crate
//
// ## Contract
//
// - `check()` must never change live state
// - `apply()` submits one batch; the engine applies all of it or none of it
// - every call must return within the implementation's timeout, reporting a
//   hang as `Error::Timeout`

use async_trait::async_trait;
use std::path::Path;

/// Trait for firewall engine implementations
///
/// Implementations must be thread-safe and usable across async tasks.
#[async_trait]
pub trait FirewallEngine: Send + Sync {
    /// Validate a textual command in dry-run mode
    ///
    /// # Returns
    ///
    /// - `Ok(())`: The engine accepted the command
    /// - `Err(Error)`: The command was rejected or the engine failed
    async fn check(&self, command: &str) -> Result<(), crate::Error>;

    /// Apply a JSON command batch to the live ruleset
    async fn apply(&self, batch: &serde_json::Value) -> Result<(), crate::Error>;

    /// Flush and reload the ruleset from a file
    async fn load_file(&self, path: &Path) -> Result<(), crate::Error>;

    /// Engine name for logs
    fn engine_name(&self) -> &'static str;
}
