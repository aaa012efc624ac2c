mod devnode;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use ledger_core::{
    config::LedgerConfig,
    db::{create_pool, run_migrations, PgLedgerSink},
    pipeline::{EventPipeline, EVENT_QUEUE_DEPTH},
};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use crate::devnode::DevNode;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = LedgerConfig::from_env()?;
    tracing::info!("starting ledger indexer: {:?}", config.runtime);

    // Unavailable storage at startup is fatal to the whole service.
    let pool = create_pool(&config.db.url, config.db.max_connections).await?;
    run_migrations(&pool).await?;

    let sink = Arc::new(PgLedgerSink::new(pool));
    let node = Arc::new(DevNode::new());

    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let handle =
        EventPipeline::new(config.chain.chain_id, node.clone(), sink).start(event_rx);

    let interval = Duration::from_millis(config.chain.dev_block_interval_ms.unwrap_or(1_000));
    let producer = tokio::spawn(node.produce_blocks(event_tx, interval));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    producer.abort();
    handle.stop().await;
    Ok(())
}
