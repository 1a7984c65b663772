//! Standard paths used by Trustgate

use std::path::PathBuf;

/// Standard Trustgate paths
pub struct Paths {
    /// Data directory (~/.local/share/trustgate)
    pub data: PathBuf,
    /// Config directory (~/.config/trustgate)
    pub config: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

impl Paths {
    pub fn new() -> Self {
        let data = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("~/.local/share"))
            .join("trustgate");

        let config = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("trustgate");

        Self { data, config }
    }

    /// Root both directories under a single base (used by tests and `--home`)
    pub fn rooted(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            data: base.join("data"),
            config: base.join("config"),
        }
    }

    /// Engine configuration file
    pub fn engine_config(&self) -> PathBuf {
        self.config.join("engine.yaml")
    }

    /// Administrative policy rows
    pub fn policies(&self) -> PathBuf {
        self.config.join("policies.yaml")
    }

    /// Identity snapshot (base trust, bound devices)
    pub fn identities(&self) -> PathBuf {
        self.data.join("identities.json")
    }

    /// Append-only decision/audit/trust history
    pub fn history(&self) -> PathBuf {
        self.data.join("history.jsonl")
    }
}
