//! In-process ledger with the same semantics as the Postgres one.

use super::{BlockEvent, BlockLedger, FailureEvent, FailureLedger};
use crate::guard::fingerprint::AddressFingerprint;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct MemoryLedger {
    failures: Mutex<Vec<FailureEvent>>,
    blocks: Mutex<Vec<BlockEvent>>,
}

impl MemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn failures(&self) -> Result<MutexGuard<'_, Vec<FailureEvent>>> {
        self.failures
            .lock()
            .map_err(|_| anyhow!("failure ledger lock poisoned"))
    }

    fn blocks(&self) -> Result<MutexGuard<'_, Vec<BlockEvent>>> {
        self.blocks
            .lock()
            .map_err(|_| anyhow!("block ledger lock poisoned"))
    }

    fn count_failures<F>(&self, since: i64, predicate: F) -> Result<u64>
    where
        F: Fn(&FailureEvent) -> bool,
    {
        let failures = self.failures()?;
        let count = failures
            .iter()
            .filter(|event| event.time >= since && predicate(event))
            .count();
        Ok(count as u64)
    }
}

#[async_trait]
impl FailureLedger for MemoryLedger {
    async fn count_excluding_action(
        &self,
        address_hash: &AddressFingerprint,
        ignored_action: &str,
        since: i64,
    ) -> Result<u64> {
        self.count_failures(since, |event| {
            event.address_hash == *address_hash && event.action != ignored_action
        })
    }

    async fn count_for_action_and_key(
        &self,
        address_hash: &AddressFingerprint,
        action: &str,
        key: Option<&str>,
        since: i64,
    ) -> Result<u64> {
        self.count_failures(since, |event| {
            event.address_hash == *address_hash
                && event.action == action
                && event.key.as_deref() == key
        })
    }

    async fn count_for_action(
        &self,
        address_hash: &AddressFingerprint,
        action: &str,
        since: i64,
    ) -> Result<u64> {
        self.count_failures(since, |event| {
            event.address_hash == *address_hash && event.action == action
        })
    }

    async fn count_for_action_and_key_across_addresses(
        &self,
        action: &str,
        key: Option<&str>,
        since: i64,
    ) -> Result<u64> {
        self.count_failures(since, |event| {
            event.action == action && event.key.as_deref() == key
        })
    }

    async fn count_for_key_excluding_address(
        &self,
        key: &str,
        address_hash: &AddressFingerprint,
        since: i64,
    ) -> Result<u64> {
        self.count_failures(since, |event| {
            event.key.as_deref() == Some(key) && event.address_hash != *address_hash
        })
    }

    async fn append_failure(&self, event: &FailureEvent) -> Result<()> {
        self.failures()?.push(event.clone());
        Ok(())
    }

    async fn purge_failures(&self, before: i64) -> Result<u64> {
        let mut failures = self.failures()?;
        let len = failures.len();
        failures.retain(|event| event.time >= before);
        Ok((len - failures.len()) as u64)
    }
}

#[async_trait]
impl BlockLedger for MemoryLedger {
    async fn active_block(
        &self,
        address_hash: &AddressFingerprint,
        now: i64,
    ) -> Result<Option<BlockEvent>> {
        let blocks = self.blocks()?;
        Ok(blocks
            .iter()
            .filter(|block| block.address_hash == *address_hash && block.is_active(now))
            .max_by_key(|block| block.block_until)
            .copied())
    }

    async fn latest_block(&self, address_hash: &AddressFingerprint) -> Result<Option<BlockEvent>> {
        let blocks = self.blocks()?;
        Ok(blocks
            .iter()
            .filter(|block| block.address_hash == *address_hash)
            .max_by_key(|block| block.block_until)
            .copied())
    }

    async fn block_count(&self, address_hash: &AddressFingerprint) -> Result<u64> {
        let blocks = self.blocks()?;
        Ok(blocks
            .iter()
            .filter(|block| block.address_hash == *address_hash)
            .count() as u64)
    }

    async fn append_block(&self, event: &BlockEvent) -> Result<()> {
        self.blocks()?.push(*event);
        Ok(())
    }

    async fn purge_blocks(&self, before: i64) -> Result<u64> {
        let mut blocks = self.blocks()?;
        let len = blocks.len();
        blocks.retain(|block| block.block_until >= before);
        Ok((len - blocks.len()) as u64)
    }
}
