//! Firewall command model
//!
//! A closed set of nftables command kinds. Each command has exactly two
//! renderings: the JSON object submitted in the live batch, and the textual
//! script line used for dry-run probes. Both are derived from the same value,
//! so the probe always describes the command that is later applied.

pub mod generator;

pub use generator::RuleSetGenerator;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;

/// nftables address family of a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Ip,
    Ip6,
    Inet,
    Arp,
    Bridge,
    Netdev,
}

impl Family {
    pub const fn as_str(self) -> &'static str {
        match self {
            Family::Ip => "ip",
            Family::Ip6 => "ip6",
            Family::Inet => "inet",
            Family::Arp => "arp",
            Family::Bridge => "bridge",
            Family::Netdev => "netdev",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Family {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ip" => Ok(Family::Ip),
            "ip6" => Ok(Family::Ip6),
            "inet" => Ok(Family::Inet),
            "arp" => Ok(Family::Arp),
            "bridge" => Ok(Family::Bridge),
            "netdev" => Ok(Family::Netdev),
            other => Err(crate::Error::config(format!("Unknown nftables family '{}'", other))),
        }
    }
}

/// A table namespace that receives named sets
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub family: Family,
    pub name: String,
}

impl TableRef {
    pub fn new(family: Family, name: impl Into<String>) -> Self {
        Self {
            family,
            name: name.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.family, self.name)
    }
}

/// Parses `"family table"`, e.g. `"inet filter"`
impl std::str::FromStr for TableRef {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(family), Some(name), None) => Ok(Self::new(family.parse()?, name)),
            _ => Err(crate::Error::config(format!(
                "Invalid table '{}': expected '<family> <name>'",
                s
            ))),
        }
    }
}

/// Element type of a named set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetType {
    Ipv4Addr,
    Ipv6Addr,
}

impl SetType {
    pub const fn as_str(self) -> &'static str {
        match self {
            SetType::Ipv4Addr => "ipv4_addr",
            SetType::Ipv6Addr => "ipv6_addr",
        }
    }
}

/// Fully qualified name of a set
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SetRef {
    pub family: Family,
    pub table: String,
    pub name: String,
}

impl SetRef {
    pub fn new(table: &TableRef, name: impl Into<String>) -> Self {
        Self {
            family: table.family,
            table: table.name.clone(),
            name: name.into(),
        }
    }

    fn json_fields(&self) -> serde_json::Map<String, Value> {
        let mut fields = serde_json::Map::new();
        fields.insert("family".into(), json!(self.family.as_str()));
        fields.insert("table".into(), json!(self.table));
        fields.insert("name".into(), json!(self.name));
        fields
    }
}

impl fmt::Display for SetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.family, self.table, self.name)
    }
}

/// One firewall command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NftCommand {
    /// Create the set if it does not exist
    AddSet { set: SetRef, set_type: SetType },
    /// Remove every element of the set
    FlushSet { set: SetRef },
    /// Add elements to the set
    AddElement { set: SetRef, elements: Vec<String> },
}

impl NftCommand {
    /// The set this command operates on
    pub fn set(&self) -> &SetRef {
        match self {
            NftCommand::AddSet { set, .. }
            | NftCommand::FlushSet { set }
            | NftCommand::AddElement { set, .. } => set,
        }
    }

    /// JSON object for a live batch
    pub fn to_json(&self) -> Value {
        match self {
            NftCommand::AddSet { set, set_type } => add_set_json(set, *set_type),
            NftCommand::FlushSet { set } => flush_set_json(set),
            NftCommand::AddElement { set, elements } => add_element_json(set, elements),
        }
    }

    /// Script line understood by `nft -f`
    pub fn to_script(&self) -> String {
        match self {
            NftCommand::AddSet { set, set_type } => {
                format!("add set {} {{ type {} ; }}", set, set_type.as_str())
            }
            NftCommand::FlushSet { set } => format!("flush set {}", set),
            NftCommand::AddElement { set, elements } => {
                let mut line = format!("add element {} {{ ", set);
                for element in elements {
                    line.push_str(element);
                    line.push_str(", ");
                }
                line.push('}');
                line
            }
        }
    }

    /// Whether this command is validated by a dry-run probe
    ///
    /// Only set creation is probed: it exercises table existence and
    /// permissions without depending on the set's current contents.
    pub fn is_probe(&self) -> bool {
        matches!(self, NftCommand::AddSet { .. })
    }
}

fn add_set_json(set: &SetRef, set_type: SetType) -> Value {
    let mut fields = set.json_fields();
    fields.insert("type".into(), json!(set_type.as_str()));
    json!({ "add": { "set": fields } })
}

fn flush_set_json(set: &SetRef) -> Value {
    json!({ "flush": { "set": set.json_fields() } })
}

fn add_element_json(set: &SetRef, elements: &[String]) -> Value {
    let mut fields = set.json_fields();
    fields.insert("elem".into(), json!(elements));
    json!({ "add": { "element": fields } })
}

/// Ordered command batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    commands: Vec<NftCommand>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: NftCommand) {
        self.commands.push(command);
    }

    pub fn commands(&self) -> &[NftCommand] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// `{"nftables": [...]}` batch for the live apply
    pub fn to_json(&self) -> Value {
        let commands: Vec<Value> = self.commands.iter().map(NftCommand::to_json).collect();
        json!({ "nftables": commands })
    }

    /// Dry-run probe lines, one per set creation
    pub fn probes(&self) -> Vec<String> {
        self.commands
            .iter()
            .filter(|c| c.is_probe())
            .map(NftCommand::to_script)
            .collect()
    }
}
