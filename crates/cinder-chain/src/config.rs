//! Node configuration.
//!
//! [`NodeConfig`] has defaults for every field. [`NodeConfig::load`] layers
//! an optional TOML file and `CINDER_*` environment variables on top of
//! them; the binary applies its command-line flags last.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use cinder_core::rules::Rules;
use cinder_core::types::Height;

use crate::error::ChainError;

/// Pruning depths, counted back from the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Horizon {
    /// Tips lower than `cursor - branching` are deleted.
    pub branching: Height,
    /// Bodies of active blocks at or below `cursor - fossil` are dropped.
    pub fossil: Height,
}

impl Default for Horizon {
    fn default() -> Self {
        Self {
            branching: 1440,
            fossil: 2880,
        }
    }
}

impl Horizon {
    /// Keep everything.
    pub fn unlimited() -> Self {
        Self {
            branching: Height::MAX,
            fossil: Height::MAX,
        }
    }
}

/// Configuration for a chain node instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    pub horizon: Horizon,
    /// Block verification threads; 0 uses the available parallelism.
    pub verifier_threads: usize,
    /// Pool size limit enforced after each new state.
    pub max_pool_txs: usize,
    /// Log level filter string (e.g. "info", "cinder_chain=debug").
    pub log_level: String,
    pub rules: Rules,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cinder");

        Self {
            data_dir,
            horizon: Horizon::default(),
            verifier_threads: 0,
            max_pool_txs: 10_000,
            log_level: "info".to_string(),
            rules: Rules::default(),
        }
    }
}

impl NodeConfig {
    /// Defaults, then `file` if given, then `CINDER_*` variables
    /// (`CINDER_HORIZON__FOSSIL=100`).
    pub fn load(file: Option<&Path>) -> Result<Self, ChainError> {
        let defaults = config::Config::try_from(&NodeConfig::default())
            .map_err(|e| ChainError::Config(e.to_string()))?;
        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let cfg: NodeConfig = builder
            .add_source(
                config::Environment::with_prefix("CINDER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ChainError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ChainError> {
        if self.horizon.fossil < self.horizon.branching {
            return Err(ChainError::Config(format!(
                "fossil horizon {} below branching horizon {}",
                self.horizon.fossil, self.horizon.branching
            )));
        }
        if self.rules.difficulty_review_cycle == 0 {
            return Err(ChainError::Config("difficulty review cycle must be positive".into()));
        }
        if self.rules.window_for_median == 0 {
            return Err(ChainError::Config("median window must be positive".into()));
        }
        Ok(())
    }

    /// Path to the RocksDB chain data directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("chaindata")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_data_dir_ends_with_cinder() {
        let cfg = NodeConfig::default();
        assert!(cfg.data_dir.ends_with("cinder"), "data_dir: {:?}", cfg.data_dir);
    }

    #[test]
    fn db_path_appends_chaindata() {
        let cfg = NodeConfig {
            data_dir: PathBuf::from("/tmp/cinder-test"),
            ..NodeConfig::default()
        };
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/cinder-test/chaindata"));
    }

    #[test]
    fn default_horizons_are_ordered() {
        let cfg = NodeConfig::default();
        assert!(cfg.horizon.fossil >= cfg.horizon.branching);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn inverted_horizons_rejected() {
        let cfg = NodeConfig {
            horizon: Horizon { branching: 10, fossil: 5 },
            ..NodeConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ChainError::Config(_))));
    }

    #[test]
    fn load_reads_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cinder.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "verifier_threads = 3").unwrap();
        writeln!(f, "[horizon]").unwrap();
        writeln!(f, "branching = 5").unwrap();
        writeln!(f, "fossil = 50").unwrap();
        writeln!(f, "[rules]").unwrap();
        writeln!(f, "fake_pow = true").unwrap();
        drop(f);

        let cfg = NodeConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.verifier_threads, 3);
        assert_eq!(cfg.horizon, Horizon { branching: 5, fossil: 50 });
        assert!(cfg.rules.fake_pow);
        assert_eq!(cfg.max_pool_txs, NodeConfig::default().max_pool_txs);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(matches!(NodeConfig::load(Some(&path)), Err(ChainError::Config(_))));
    }
}
