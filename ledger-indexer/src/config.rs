use ledger_util::{BTCConfig, LEDGER_CONFIG_FILE, LEDGER_DATA_DIR};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn default_batch_size() -> usize {
    16
}

fn default_store_raw_transactions() -> bool {
    true
}

fn default_catch_up_threshold() -> u32 {
    6
}

fn default_poll_interval_secs() -> u64 {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    // Blocks accumulated into one commit
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_store_raw_transactions")]
    pub store_raw_transactions: bool,

    // Flag coinstake outputs, only meaningful on proof-of-stake chains
    #[serde(default)]
    pub proof_of_stake: bool,

    // Blocks behind the tip above which the indexer counts as catching up
    #[serde(default = "default_catch_up_threshold")]
    pub catch_up_threshold: u32,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            batch_size: default_batch_size(),
            store_raw_transactions: default_store_raw_transactions(),
            proof_of_stake: false,
            catch_up_threshold: default_catch_up_threshold(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexerConfig {
    #[serde(default)]
    pub btc: BTCConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(skip)]
    root_dir: PathBuf,
}

impl IndexerConfig {
    pub fn load(root_dir: &Path) -> Result<Self, String> {
        let path = root_dir.join(LEDGER_CONFIG_FILE);
        let mut config = if !path.exists() {
            let default_config = IndexerConfig::default();
            info!(
                "Config file {} does not exist. Using default configuration.",
                path.display()
            );
            match toml::to_string_pretty(&default_config) {
                Ok(s) => info!("Default config: {}", s),
                Err(e) => warn!("Failed to render default config: {}", e),
            }
            default_config
        } else {
            info!("Loading config from {}", path.display());
            let config_data = std::fs::read_to_string(&path).map_err(|e| {
                let msg = format!("Failed to read config file {}: {}", path.display(), e);
                error!("{}", msg);
                msg
            })?;
            info!("Config data: {}", config_data);

            toml::from_str::<IndexerConfig>(&config_data).map_err(|e| {
                let msg = format!("Failed to parse config file {}: {}", path.display(), e);
                error!("{}", msg);
                msg
            })?
        };

        if config.sync.batch_size == 0 {
            warn!("sync.batch_size is 0, using 1");
            config.sync.batch_size = 1;
        }

        config.root_dir = root_dir.to_path_buf();
        Ok(config)
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn data_dir(&self) -> PathBuf {
        match &self.storage.data_dir {
            Some(dir) => dir.clone(),
            None => self.root_dir.join(LEDGER_DATA_DIR),
        }
    }
}

pub type IndexerConfigRef = Arc<IndexerConfig>;
