use alloy_primitives::Address;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::models::{LedgerEntry, LedgerRow, TokenTransferRow, TransferEvent};
use crate::pipeline::LedgerSink;

pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    // Embed migrations from the workspace `migrations/` directory.
    sqlx::migrate!("../migrations").run(pool).await?;
    Ok(())
}

/// Per-statement inserts; the natural key makes redelivery idempotent.
pub async fn insert_ledger_entries(pool: &PgPool, entries: &[LedgerEntry]) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }

    for entry in entries {
        let row = LedgerRow::from(entry);
        sqlx::query(
            r#"
            INSERT INTO ledger_entries (
                account_addr,
                block_num,
                tx_idx,
                itx_idx,
                direction,
                counterparty_addr,
                amount,
                balance,
                tx_hash,
                block_time
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
            ON CONFLICT (account_addr, block_num, tx_idx, itx_idx) DO NOTHING
            "#,
        )
        .bind(&row.account_addr)
        .bind(row.block_num)
        .bind(row.tx_idx)
        .bind(row.itx_idx)
        .bind(&row.direction)
        .bind(&row.counterparty_addr)
        .bind(&row.amount)
        .bind(&row.balance)
        .bind(&row.tx_hash)
        .bind(row.block_time)
        .execute(pool)
        .await?;
    }
    Ok(())
}

pub async fn insert_token_transfer(pool: &PgPool, row: &TokenTransferRow) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO token_transfers (
            block_num,
            tx_idx,
            log_idx,
            from_addr,
            to_addr,
            amount,
            tx_hash,
            token_addr
        ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
        ON CONFLICT (block_num, tx_idx, log_idx) DO NOTHING
        "#,
    )
    .bind(row.block_num)
    .bind(row.tx_idx)
    .bind(row.log_idx)
    .bind(&row.from_addr)
    .bind(&row.to_addr)
    .bind(&row.amount)
    .bind(&row.tx_hash)
    .bind(&row.token_addr)
    .execute(pool)
    .await?;
    Ok(())
}

const LEDGER_COLUMNS: &str = r#"
    account_addr,
    block_num,
    tx_idx,
    itx_idx,
    direction,
    counterparty_addr,
    amount,
    balance,
    tx_hash,
    block_time
"#;

pub async fn latest_ledger_entries(pool: &PgPool, limit: i64) -> Result<Vec<LedgerRow>> {
    let query = format!(
        r#"
        SELECT {LEDGER_COLUMNS}
        FROM ledger_entries
        ORDER BY block_num DESC, tx_idx DESC, itx_idx DESC
        LIMIT $1
        "#
    );
    let rows = sqlx::query_as::<_, LedgerRow>(&query)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

pub async fn account_ledger_entries_by_time(
    pool: &PgPool,
    account: Address,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<LedgerRow>> {
    let query = format!(
        r#"
        SELECT {LEDGER_COLUMNS}
        FROM ledger_entries
        WHERE account_addr = $1
          AND block_time BETWEEN $2 AND $3
        ORDER BY block_num DESC, tx_idx DESC, itx_idx DESC
        LIMIT $4
        "#
    );
    let rows = sqlx::query_as::<_, LedgerRow>(&query)
        .bind(format!("{account:#x}"))
        .bind(from)
        .bind(to)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

pub async fn account_ledger_entries_by_block(
    pool: &PgPool,
    account: Address,
    from_block: u64,
    to_block: u64,
    limit: i64,
) -> Result<Vec<LedgerRow>> {
    let query = format!(
        r#"
        SELECT {LEDGER_COLUMNS}
        FROM ledger_entries
        WHERE account_addr = $1
          AND block_num BETWEEN $2 AND $3
        ORDER BY block_num DESC, tx_idx DESC, itx_idx DESC
        LIMIT $4
        "#
    );
    let rows = sqlx::query_as::<_, LedgerRow>(&query)
        .bind(format!("{account:#x}"))
        .bind(from_block as i64)
        .bind(to_block as i64)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// `LedgerSink` over Postgres. One failed account insert does not abort
/// sibling accounts; the pipeline reports and moves on.
pub struct PgLedgerSink {
    pool: PgPool,
}

impl PgLedgerSink {
    pub fn new(pool: PgPool) -> Self {
        PgLedgerSink { pool }
    }
}

#[async_trait]
impl LedgerSink for PgLedgerSink {
    async fn persist_entries(
        &self,
        _account: Address,
        entries: &[LedgerEntry],
    ) -> anyhow::Result<()> {
        insert_ledger_entries(&self.pool, entries).await
    }

    async fn record_token_transfer(&self, event: &TransferEvent) -> anyhow::Result<()> {
        let Some(row) = TokenTransferRow::from_event(event) else {
            return Ok(());
        };
        insert_token_transfer(&self.pool, &row).await
    }
}
