// # ipmon-core
//
// Core library of the interface address monitor.
//
// ## Architecture Overview
//
// Keeps nftables named sets in step with the addresses of the host's
// network interfaces:
// - **AddressEventSource**: Trait for kernel address-change notifications
// - **InterfaceSource**: Trait for enumerating interface addresses
// - **FirewallEngine**: Trait for probing, applying and reloading rulesets
// - **IpmonEngine**: Refresh worker that debounces notifications and runs
//   the snapshot → generate → apply pipeline
// - **ControlServer**: Local socket accepting `update` and `reload`
//
// ## Design Principles
//
// 1. **Events are triggers**: a refresh always rescans every interface
// 2. **Single worker**: debounce state and the pipeline are owned by one task
// 3. **Fail closed**: a rejected dry-run probe aborts the whole runtime update
// 4. **Atomic files**: generated files are replaced by rename only

pub mod apply;
pub mod collector;
pub mod config;
pub mod context;
pub mod control;
pub mod debounce;
pub mod engine;
pub mod error;
pub mod persist;
pub mod ruleset;
pub mod snapshot;
pub mod traits;

// Re-export core types for convenience
pub use traits::{AddressEventSource, FirewallEngine, InterfaceSource};
pub use engine::{EngineEvent, IpmonEngine, RefreshTrigger};
pub use context::AppContext;
pub use config::{IpmonConfig, NftConfig};
pub use control::{ControlClient, ControlCommand, ControlRequest, ControlServer};
pub use error::{Error, Result};
pub use snapshot::{AddressSet, InterfaceSnapshot, SnapshotStore};
