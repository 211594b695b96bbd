//! Postgres-backed ledgers.
//!
//! Each statement runs on its own; the engine never wraps append + count in a
//! transaction. Two concurrent failures may both pass the allowance check before
//! either sees the other, which costs at most one extra attempt per race.

use super::{BlockEvent, BlockLedger, FailureEvent, FailureLedger};
use crate::guard::fingerprint::AddressFingerprint;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Postgres, postgres::PgArguments, query::QueryScalar};
use tracing::{Instrument, Span, info_span};

pub const SCHEMA_SQL: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/db/sql/01_authguard.sql"
));

#[derive(Debug, Clone)]
pub struct PgLedger {
    pool: PgPool,
}

fn db_span(operation: &'static str, statement: &'static str) -> Span {
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn to_count(count: i64) -> u64 {
    u64::try_from(count).unwrap_or(0)
}

impl PgLedger {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `fails` and `blocks` tables and their indexes if missing.
    ///
    /// # Errors
    /// Returns an error if the schema statements fail.
    pub async fn apply_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .instrument(info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "CREATE"
            ))
            .await
            .context("failed to apply ledger schema")?;
        Ok(())
    }

    async fn fetch_count(
        &self,
        query: QueryScalar<'_, Postgres, i64, PgArguments>,
        statement: &'static str,
        what: &'static str,
    ) -> Result<u64> {
        let count = query
            .fetch_one(&self.pool)
            .instrument(db_span("SELECT", statement))
            .await
            .with_context(|| format!("failed to count {what}"))?;
        Ok(to_count(count))
    }
}

#[async_trait]
impl FailureLedger for PgLedger {
    async fn count_excluding_action(
        &self,
        address_hash: &AddressFingerprint,
        ignored_action: &str,
        since: i64,
    ) -> Result<u64> {
        let query = r"
            SELECT COUNT(*) FROM fails
            WHERE address_hash = $1 AND action <> $2 AND time >= $3
        ";
        self.fetch_count(
            sqlx::query_scalar(query)
                .bind(address_hash.as_bytes().as_slice())
                .bind(ignored_action)
                .bind(since),
            query,
            "failures on other actions",
        )
        .await
    }

    async fn count_for_action_and_key(
        &self,
        address_hash: &AddressFingerprint,
        action: &str,
        key: Option<&str>,
        since: i64,
    ) -> Result<u64> {
        let query = r"
            SELECT COUNT(*) FROM fails
            WHERE address_hash = $1 AND action = $2 AND key IS NOT DISTINCT FROM $3 AND time >= $4
        ";
        self.fetch_count(
            sqlx::query_scalar(query)
                .bind(address_hash.as_bytes().as_slice())
                .bind(action)
                .bind(key)
                .bind(since),
            query,
            "failures for action and key",
        )
        .await
    }

    async fn count_for_action(
        &self,
        address_hash: &AddressFingerprint,
        action: &str,
        since: i64,
    ) -> Result<u64> {
        let query = r"
            SELECT COUNT(*) FROM fails
            WHERE address_hash = $1 AND action = $2 AND time >= $3
        ";
        self.fetch_count(
            sqlx::query_scalar(query)
                .bind(address_hash.as_bytes().as_slice())
                .bind(action)
                .bind(since),
            query,
            "failures for action",
        )
        .await
    }

    async fn count_for_action_and_key_across_addresses(
        &self,
        action: &str,
        key: Option<&str>,
        since: i64,
    ) -> Result<u64> {
        let query = r"
            SELECT COUNT(*) FROM fails
            WHERE action = $1 AND key IS NOT DISTINCT FROM $2 AND time >= $3
        ";
        self.fetch_count(
            sqlx::query_scalar(query).bind(action).bind(key).bind(since),
            query,
            "failures for action and key across addresses",
        )
        .await
    }

    async fn count_for_key_excluding_address(
        &self,
        key: &str,
        address_hash: &AddressFingerprint,
        since: i64,
    ) -> Result<u64> {
        let query = r"
            SELECT COUNT(*) FROM fails
            WHERE key = $1 AND address_hash <> $2 AND time >= $3
        ";
        self.fetch_count(
            sqlx::query_scalar(query)
                .bind(key)
                .bind(address_hash.as_bytes().as_slice())
                .bind(since),
            query,
            "failures for key from other addresses",
        )
        .await
    }

    async fn append_failure(&self, event: &FailureEvent) -> Result<()> {
        let query = "INSERT INTO fails (address_hash, action, key, time) VALUES ($1, $2, $3, $4)";
        sqlx::query(query)
            .bind(event.address_hash.as_bytes().as_slice())
            .bind(&event.action)
            .bind(event.key.as_deref())
            .bind(event.time)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await
            .context("failed to record failure")?;
        Ok(())
    }

    async fn purge_failures(&self, before: i64) -> Result<u64> {
        let query = "DELETE FROM fails WHERE time < $1";
        let result = sqlx::query(query)
            .bind(before)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await
            .context("failed to purge failures")?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl BlockLedger for PgLedger {
    async fn active_block(
        &self,
        address_hash: &AddressFingerprint,
        now: i64,
    ) -> Result<Option<BlockEvent>> {
        let query = r"
            SELECT block_until FROM blocks
            WHERE address_hash = $1 AND block_until > $2
            ORDER BY block_until DESC
            LIMIT 1
        ";
        let block_until = sqlx::query_scalar::<_, i64>(query)
            .bind(address_hash.as_bytes().as_slice())
            .bind(now)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to look up active block")?;

        Ok(block_until.map(|block_until| BlockEvent {
            address_hash: *address_hash,
            block_until,
        }))
    }

    async fn latest_block(&self, address_hash: &AddressFingerprint) -> Result<Option<BlockEvent>> {
        let query = "SELECT MAX(block_until) FROM blocks WHERE address_hash = $1";
        let block_until = sqlx::query_scalar::<_, Option<i64>>(query)
            .bind(address_hash.as_bytes().as_slice())
            .fetch_one(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to look up latest block")?;

        Ok(block_until.map(|block_until| BlockEvent {
            address_hash: *address_hash,
            block_until,
        }))
    }

    async fn block_count(&self, address_hash: &AddressFingerprint) -> Result<u64> {
        let query = "SELECT COUNT(*) FROM blocks WHERE address_hash = $1";
        self.fetch_count(
            sqlx::query_scalar(query).bind(address_hash.as_bytes().as_slice()),
            query,
            "blocks",
        )
        .await
    }

    async fn append_block(&self, event: &BlockEvent) -> Result<()> {
        let query = "INSERT INTO blocks (address_hash, block_until) VALUES ($1, $2)";
        sqlx::query(query)
            .bind(event.address_hash.as_bytes().as_slice())
            .bind(event.block_until)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await
            .context("failed to record block")?;
        Ok(())
    }

    async fn purge_blocks(&self, before: i64) -> Result<u64> {
        let query = "DELETE FROM blocks WHERE block_until < $1";
        let result = sqlx::query(query)
            .bind(before)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await
            .context("failed to purge blocks")?;
        Ok(result.rows_affected())
    }
}
