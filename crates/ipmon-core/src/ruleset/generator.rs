//! Snapshot → command batch
//!
//! For every interface and every configured table the generator emits
//! create, flush and fill commands for the `<interface>_ipv4_address` set.

use super::{NftCommand, RuleSet, SetRef, SetType, TableRef};
use crate::snapshot::{IPV4_SENTINEL, InterfaceSnapshot};

/// Set name suffix for interface IPv4 addresses
pub const IPV4_ADDRESS_SUFFIX: &str = "_ipv4_address";

/// Builds command batches from snapshots
#[derive(Debug, Clone)]
pub struct RuleSetGenerator {
    tables: Vec<TableRef>,
}

impl RuleSetGenerator {
    pub fn new(tables: Vec<TableRef>) -> Self {
        Self { tables }
    }

    pub fn tables(&self) -> &[TableRef] {
        &self.tables
    }

    /// Generate the batch for a snapshot
    ///
    /// The output only depends on the snapshot contents, so generating twice
    /// from the same snapshot yields identical batches.
    pub fn generate(&self, snapshot: &InterfaceSnapshot) -> RuleSet {
        let mut ruleset = RuleSet::new();

        for (interface, addresses) in snapshot.iter() {
            let name = ipv4_address_set_name(interface);
            let elements = if addresses.ipv4().is_empty() {
                vec![IPV4_SENTINEL.to_string()]
            } else {
                addresses.ipv4().to_vec()
            };

            for table in &self.tables {
                let set = SetRef::new(table, name.clone());
                ruleset.push(NftCommand::AddSet {
                    set: set.clone(),
                    set_type: SetType::Ipv4Addr,
                });
                ruleset.push(NftCommand::FlushSet { set: set.clone() });
                ruleset.push(NftCommand::AddElement {
                    set,
                    elements: elements.clone(),
                });
            }
        }

        tracing::debug!(
            interfaces = snapshot.len(),
            commands = ruleset.len(),
            "Generated nftables batch"
        );
        ruleset
    }
}

/// Name of the IPv4 address set of an interface
pub fn ipv4_address_set_name(interface: &str) -> String {
    format!("{}{}", interface, IPV4_ADDRESS_SUFFIX)
}
