//! Shared application state
//!
//! Everything a refresh needs, assembled once at startup and owned by the
//! refresh worker.

use crate::config::IpmonConfig;
use crate::error::Result;
use crate::persist::PersistentConfigWriter;
use crate::ruleset::RuleSetGenerator;
use crate::snapshot::SnapshotStore;
use crate::traits::{FirewallEngine, InterfaceSource};

pub struct AppContext {
    pub config: IpmonConfig,
    pub snapshots: SnapshotStore,
    pub interfaces: Box<dyn InterfaceSource>,
    /// `None` runs the pipeline without touching the firewall
    pub firewall: Option<Box<dyn FirewallEngine>>,
    pub generator: RuleSetGenerator,
    /// Present when nftables output is configured
    pub writer: Option<PersistentConfigWriter>,
}

impl AppContext {
    /// Build the context for a validated configuration
    pub fn new(config: IpmonConfig, interfaces: Box<dyn InterfaceSource>) -> Result<Self> {
        config.validate()?;

        let (generator, writer) = match &config.nft {
            Some(nft) => (
                RuleSetGenerator::new(nft.tables.clone()),
                Some(PersistentConfigWriter::from_config(nft).with_verbose(config.monitor)),
            ),
            None => (RuleSetGenerator::new(Vec::new()), None),
        };

        Ok(Self {
            config,
            snapshots: SnapshotStore::new(),
            interfaces,
            firewall: None,
            generator,
            writer,
        })
    }

    /// Attach the firewall engine
    pub fn with_firewall(mut self, firewall: Box<dyn FirewallEngine>) -> Self {
        self.firewall = Some(firewall);
        self
    }
}
