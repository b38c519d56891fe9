// # Persistent Config Writer
//
// Writes the generated nftables include files used by cold reloads.
//
// ## Files
//
// ```text
// <base>.vars                                   <base>.sets
// #!/usr/sbin/nft -f                            #!/usr/sbin/nft -f
// redefine eth0_ipv4_address = { 10.0.0.1, }    set eth0_ipv4_address { type ipv4_addr; elements = { 10.0.0.1, } }
// redefine eth0_ipv4_network = { 10.0.0.0/24, } set eth0_ipv4_network { type ipv4_addr; flags interval; elements = { 10.0.0.0/24, } }
// redefine eth0_ipv6_address = { ::, }          set eth0_ipv6_address { type ipv6_addr; elements = { ::, } }
// ```
//
// ## Crash Safety
//
// Content goes to `<path>.tmp` first and is renamed over the target, so the
// target is always either the previous complete file or the new one.

use crate::error::{Error, Result};
use crate::snapshot::{AddressSet, IPV4_SENTINEL, IPV6_SENTINEL, InterfaceSnapshot};
use std::ffi::OsString;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, trace};

/// First line of every generated file
pub const NFT_SHEBANG: &str = "#!/usr/sbin/nft -f";

/// One definition block kind
struct Block {
    suffix: &'static str,
    set_decl: &'static str,
    sentinel: &'static str,
    elements: fn(&AddressSet) -> &[String],
}

const BLOCKS: [Block; 3] = [
    Block {
        suffix: "_ipv4_address",
        set_decl: "type ipv4_addr;",
        sentinel: IPV4_SENTINEL,
        elements: AddressSet::ipv4,
    },
    Block {
        suffix: "_ipv4_network",
        set_decl: "type ipv4_addr; flags interval;",
        sentinel: IPV4_SENTINEL,
        elements: AddressSet::ipv4_networks,
    },
    Block {
        suffix: "_ipv6_address",
        set_decl: "type ipv6_addr;",
        sentinel: IPV6_SENTINEL,
        elements: AddressSet::ipv6,
    },
];

/// `a, b, ` or the sentinel when the list is empty
fn element_list(elements: &[String], sentinel: &str) -> String {
    let mut out = String::new();
    if elements.is_empty() {
        out.push_str(sentinel);
        out.push_str(", ");
    }
    for element in elements {
        out.push_str(element);
        out.push_str(", ");
    }
    out
}

/// Render the variable-definition file
pub fn render_vars(snapshot: &InterfaceSnapshot) -> String {
    let mut out = format!("{}\n", NFT_SHEBANG);
    for (interface, set) in snapshot.iter() {
        for block in &BLOCKS {
            let _ = writeln!(
                out,
                "redefine {}{} = {{ {}}}",
                interface,
                block.suffix,
                element_list((block.elements)(set), block.sentinel)
            );
        }
    }
    out
}

/// Render the named-set file
pub fn render_sets(snapshot: &InterfaceSnapshot) -> String {
    let mut out = format!("{}\n", NFT_SHEBANG);
    for (interface, set) in snapshot.iter() {
        for block in &BLOCKS {
            let _ = writeln!(
                out,
                "set {}{} {{ {} elements = {{ {}}} }}",
                interface,
                block.suffix,
                block.set_decl,
                element_list((block.elements)(set), block.sentinel)
            );
        }
    }
    out
}

/// Writes `.vars` and `.sets` files atomically
#[derive(Debug, Clone)]
pub struct PersistentConfigWriter {
    vars_path: PathBuf,
    sets_path: PathBuf,
    verbose: bool,
}

impl PersistentConfigWriter {
    pub fn new(vars_path: impl Into<PathBuf>, sets_path: impl Into<PathBuf>) -> Self {
        Self {
            vars_path: vars_path.into(),
            sets_path: sets_path.into(),
            verbose: false,
        }
    }

    /// Writer for the paths of an [`NftConfig`](crate::config::NftConfig)
    pub fn from_config(config: &crate::config::NftConfig) -> Self {
        Self::new(config.vars_path(), config.sets_path())
    }

    /// Announce every written file at info level
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn vars_path(&self) -> &Path {
        &self.vars_path
    }

    pub fn sets_path(&self) -> &Path {
        &self.sets_path
    }

    /// Write both files
    ///
    /// Both writes are attempted even if the first fails. A failed file keeps
    /// its previous content.
    pub async fn write(&self, snapshot: &InterfaceSnapshot) -> Result<()> {
        let mut first_error = None;

        for (path, content) in [
            (&self.vars_path, render_vars(snapshot)),
            (&self.sets_path, render_sets(snapshot)),
        ] {
            match atomic_write(path, &content).await {
                Ok(()) => {
                    if self.verbose {
                        info!("Written file {}", path.display());
                    } else {
                        trace!("Written file {}", path.display());
                    }
                }
                Err(e) => {
                    error!("{}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Sibling temporary path: `<path>.tmp`
fn temp_path(path: &Path) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Write `content` to `path` via temp file and rename
pub async fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let persist_err = |what: &str, e: std::io::Error| {
        Error::persist(path.display().to_string(), format!("{}: {}", what, e))
    };

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| persist_err("Failed to create directory", e))?;
    }

    let temp = temp_path(path);
    {
        let mut file = fs::File::create(&temp)
            .await
            .map_err(|e| persist_err("Failed to create temp file", e))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| persist_err("Failed to write temp file", e))?;
        file.sync_all()
            .await
            .map_err(|e| persist_err("Failed to sync temp file", e))?;
    }

    fs::rename(&temp, path)
        .await
        .map_err(|e| persist_err("Failed to rename temp file", e))
}
