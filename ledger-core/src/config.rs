use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    pub environment: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    pub bind_addr: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainConfig {
    /// Chain id the legacy-signature recovery scheme is bound to.
    pub chain_id: u64,
    /// Block interval for the development chain source.
    #[serde(default)]
    pub dev_block_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    pub runtime: RuntimeConfig,
    pub api: ApiConfig,
    pub db: DbConfig,
    pub chain: ChainConfig,
}

impl LedgerConfig {
    pub fn from_env() -> Result<Self> {
        // Base config from `config/default.(toml|yaml|json)` relative to the
        // working directory, overridden by `LEDGER__...` environment
        // variables.
        let settings = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::Environment::with_prefix("LEDGER").separator("__"))
            .build()?;

        settings.try_deserialize().map_err(Into::into)
    }
}
