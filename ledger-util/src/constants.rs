// Service names
pub const LEDGER_INDEXER_SERVICE_NAME: &str = "ledger-indexer";

// Directory constants
pub const LEDGER_ROOT_DIR: &str = ".ledger";
pub const LEDGER_DATA_DIR: &str = "data";
pub const LEDGER_LOG_DIR: &str = "logs";

// File names
pub const LEDGER_DB_FILE: &str = "ledger.sqlite";
pub const LEDGER_CONFIG_FILE: &str = "config.toml";
