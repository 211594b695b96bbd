//! Append-only failure and block ledgers.
//!
//! Events are never updated. The only deletions come from the retention sweeper,
//! which removes rows by time range. Every count takes an explicit `since` cutoff
//! and only considers events stamped at or after it.

mod memory;
mod postgres;

pub use memory::MemoryLedger;
pub use postgres::{PgLedger, SCHEMA_SQL};

use super::fingerprint::AddressFingerprint;
use anyhow::Result;
use async_trait::async_trait;

/// One failed guarded attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureEvent {
    pub address_hash: AddressFingerprint,
    pub action: String,
    pub key: Option<String>,
    /// Epoch seconds.
    pub time: i64,
}

/// One lockout window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEvent {
    pub address_hash: AddressFingerprint,
    /// Epoch seconds.
    pub block_until: i64,
}

impl BlockEvent {
    #[must_use]
    pub fn is_active(&self, now: i64) -> bool {
        self.block_until > now
    }
}

#[async_trait]
pub trait FailureLedger: Send + Sync {
    /// Failures from this address on any action other than `ignored_action`.
    async fn count_excluding_action(
        &self,
        address_hash: &AddressFingerprint,
        ignored_action: &str,
        since: i64,
    ) -> Result<u64>;

    /// Failures matching address, action and key exactly (`None` matches keyless events).
    async fn count_for_action_and_key(
        &self,
        address_hash: &AddressFingerprint,
        action: &str,
        key: Option<&str>,
        since: i64,
    ) -> Result<u64>;

    /// Failures from this address on `action`, any key.
    async fn count_for_action(
        &self,
        address_hash: &AddressFingerprint,
        action: &str,
        since: i64,
    ) -> Result<u64>;

    /// Failures on `action` + `key` from every address.
    async fn count_for_action_and_key_across_addresses(
        &self,
        action: &str,
        key: Option<&str>,
        since: i64,
    ) -> Result<u64>;

    /// Failures against `key` from addresses other than `address_hash`.
    async fn count_for_key_excluding_address(
        &self,
        key: &str,
        address_hash: &AddressFingerprint,
        since: i64,
    ) -> Result<u64>;

    async fn append_failure(&self, event: &FailureEvent) -> Result<()>;

    /// Delete failures with `time < before`, returning how many went away.
    async fn purge_failures(&self, before: i64) -> Result<u64>;
}

#[async_trait]
pub trait BlockLedger: Send + Sync {
    /// The still-running block with the greatest `block_until`, if any.
    async fn active_block(
        &self,
        address_hash: &AddressFingerprint,
        now: i64,
    ) -> Result<Option<BlockEvent>>;

    /// The block with the greatest `block_until`, expired or not.
    async fn latest_block(&self, address_hash: &AddressFingerprint) -> Result<Option<BlockEvent>>;

    /// Every block still on record for this address, regardless of age.
    async fn block_count(&self, address_hash: &AddressFingerprint) -> Result<u64>;

    async fn append_block(&self, event: &BlockEvent) -> Result<()>;

    /// Delete blocks with `block_until < before`, returning how many went away.
    async fn purge_blocks(&self, before: i64) -> Result<u64>;
}

/// Both ledgers behind one handle, as consumed by the service and the sweeper.
pub trait Ledger: FailureLedger + BlockLedger {}

impl<T: FailureLedger + BlockLedger> Ledger for T {}
