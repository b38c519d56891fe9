//! Hitless runtime update
//!
//! Validates a batch with dry-run probes and only then submits it. A single
//! rejected probe aborts the update before anything touches the live
//! ruleset.

use crate::error::{Error, Result};
use crate::ruleset::RuleSet;
use crate::traits::FirewallEngine;
use tracing::{debug, info, warn};

/// Result of a runtime update attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Every probe passed and the batch was applied
    Applied {
        /// Number of commands in the batch
        commands: usize,
    },
    /// At least one probe failed; nothing was submitted
    Aborted {
        /// Probe lines that the engine rejected, with the reason
        failed_probes: Vec<String>,
    },
}

/// Applies generated batches through a [`FirewallEngine`]
pub struct RuntimeApplier<'a> {
    engine: &'a dyn FirewallEngine,
}

impl<'a> RuntimeApplier<'a> {
    pub fn new(engine: &'a dyn FirewallEngine) -> Self {
        Self { engine }
    }

    /// Probe, then apply
    ///
    /// # Returns
    ///
    /// - `Ok(ApplyOutcome::Applied)`: The batch was applied
    /// - `Ok(ApplyOutcome::Aborted)`: A probe failed; live state untouched
    /// - `Err(Error)`: The real apply failed
    pub async fn apply(&self, ruleset: &RuleSet) -> Result<ApplyOutcome> {
        let probes = ruleset.probes();
        let mut failed_probes = Vec::new();

        // every probe runs so the log names all offending sets at once
        for probe in &probes {
            match self.engine.check(probe).await {
                Ok(()) => debug!(probe = %probe, "Dry-run probe passed"),
                Err(e) => {
                    warn!(probe = %probe, error = %e, "Dry-run probe failed");
                    failed_probes.push(format!("{}: {}", probe, e));
                }
            }
        }

        if !failed_probes.is_empty() {
            return Ok(ApplyOutcome::Aborted { failed_probes });
        }

        self.engine
            .apply(&ruleset.to_json())
            .await
            .map_err(|e| match e {
                Error::Firewall {
                    message,
                    stderr,
                    exit_code,
                } => Error::Firewall {
                    message: format!("Runtime update failed: {}", message),
                    stderr,
                    exit_code,
                },
                other => other,
            })?;

        info!(
            engine = self.engine.engine_name(),
            commands = ruleset.len(),
            probes = probes.len(),
            "Runtime update applied"
        );
        Ok(ApplyOutcome::Applied {
            commands: ruleset.len(),
        })
    }
}
