//! The protection façade consumed by authentication handlers.
//!
//! Flow Overview:
//! 1) Caller fingerprints the client address and calls `check` before the guarded
//!    operation. A blocked verdict means the operation must not run.
//! 2) On a failed attempt the caller calls `register_failure`, which records the
//!    failure, recomputes risk from the ledgers and may issue a new block.
//!
//! Nothing is cached between calls: every verdict is derived from the ledgers,
//! so any number of instances can share one store. Storage errors propagate and
//! callers must treat them as "not permitted".

use super::{
    clock::{Clock, SystemClock},
    fingerprint::AddressFingerprint,
    ledger::{BlockEvent, BlockLedger, FailureEvent, FailureLedger, Ledger},
    policy::{RiskSignals, ThrottlePolicy},
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Blocked {
        /// Epoch seconds at which attempts are permitted again.
        block_until: i64,
        /// Seconds left until `block_until`.
        wait_seconds: u64,
    },
}

impl Verdict {
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }

    #[must_use]
    pub fn block_until(&self) -> Option<i64> {
        match self {
            Self::Allowed => None,
            Self::Blocked { block_until, .. } => Some(*block_until),
        }
    }

    #[must_use]
    pub fn wait_seconds(&self) -> Option<u64> {
        match self {
            Self::Allowed => None,
            Self::Blocked { wait_seconds, .. } => Some(*wait_seconds),
        }
    }
}

/// Everything `register_failure` derived from the ledgers for one decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Assessment {
    attempts_since_boundary: u64,
    signals: RiskSignals,
    past_blocks: u64,
    allowance: u64,
}

/// Absent, empty and whitespace-only keys all mean "no key".
fn normalize_key(key: Option<&str>) -> Option<&str> {
    key.map(str::trim).filter(|key| !key.is_empty())
}

#[derive(Clone)]
pub struct ProtectionService {
    ledger: Arc<dyn Ledger>,
    policy: Arc<ThrottlePolicy>,
    clock: Arc<dyn Clock>,
}

impl ProtectionService {
    #[must_use]
    pub fn new(ledger: Arc<dyn Ledger>, policy: ThrottlePolicy) -> Self {
        Self {
            ledger,
            policy: Arc::new(policy),
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn policy(&self) -> &ThrottlePolicy {
        &self.policy
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    /// Pre-attempt gate.
    ///
    /// # Errors
    /// Returns an error if the block ledger cannot be read.
    #[instrument(skip(self))]
    pub async fn check(&self, address_hash: &AddressFingerprint) -> Result<Verdict> {
        let now = self.clock.now();
        let active = self
            .ledger
            .active_block(address_hash, now)
            .await
            .context("failed to check for an active block")?;

        let verdict = match active {
            Some(block) if block.is_active(now) => Verdict::Blocked {
                block_until: block.block_until,
                wait_seconds: u64::try_from(block.block_until - now).unwrap_or(0),
            },
            _ => Verdict::Allowed,
        };
        debug!(?verdict, "checked address");

        Ok(verdict)
    }

    /// Post-attempt bookkeeping. Records the failure and issues a block once the
    /// free-attempt allowance for the current risk level is used up.
    ///
    /// # Errors
    /// Returns an error if any ledger read or write fails.
    #[instrument(skip(self, key))]
    pub async fn register_failure(
        &self,
        address_hash: &AddressFingerprint,
        action: &str,
        key: Option<&str>,
    ) -> Result<Verdict> {
        let now = self.clock.now();
        let key = normalize_key(key);

        self.ledger
            .append_failure(&FailureEvent {
                address_hash: *address_hash,
                action: action.to_string(),
                key: key.map(str::to_string),
                time: now,
            })
            .await?;

        let assessment = self.assess(address_hash, action, key, now).await?;
        debug!(?assessment, "assessed failure");

        if assessment.attempts_since_boundary < assessment.allowance {
            return Ok(Verdict::Allowed);
        }

        let risk_level = assessment.signals.level();
        let wait_seconds = self.policy.wait_seconds(risk_level, assessment.past_blocks);
        let block_until = now.saturating_add(i64::try_from(wait_seconds).unwrap_or(i64::MAX));

        self.ledger
            .append_block(&BlockEvent {
                address_hash: *address_hash,
                block_until,
            })
            .await?;

        warn!(
            address = %address_hash,
            action,
            risk_level,
            past_blocks = assessment.past_blocks,
            wait_seconds,
            "blocking address after repeated failures"
        );

        Ok(Verdict::Blocked {
            block_until,
            wait_seconds,
        })
    }

    async fn assess(
        &self,
        address_hash: &AddressFingerprint,
        action: &str,
        key: Option<&str>,
        now: i64,
    ) -> Result<Assessment> {
        let cutoff = self.policy.retention_cutoff(now);

        // Attempts made before the latest block count toward that block, not the next.
        let since_boundary = self
            .ledger
            .latest_block(address_hash)
            .await?
            .map_or(cutoff, |block| block.block_until.max(cutoff));

        // The failure just appended is the attempt being judged, not a prior one.
        let attempts_since_boundary = self
            .ledger
            .count_for_action(address_hash, action, since_boundary)
            .await?
            .saturating_sub(1);

        let from_key = match key {
            Some(key) => {
                self.ledger
                    .count_for_key_excluding_address(key, address_hash, cutoff)
                    .await?
            }
            None => 0,
        };
        let from_address = self
            .ledger
            .count_excluding_action(address_hash, action, cutoff)
            .await?;
        let signals = RiskSignals {
            from_key,
            from_address,
        };

        let past_blocks = self.ledger.block_count(address_hash).await?;
        let allowance = self.policy.free_attempts(signals.level(), past_blocks);

        Ok(Assessment {
            attempts_since_boundary,
            signals,
            past_blocks,
            allowance,
        })
    }
}

impl std::fmt::Debug for ProtectionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtectionService")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::guard::{
        clock::ManualClock,
        fingerprint::fingerprint,
        ledger::MemoryLedger,
    };
    use anyhow::anyhow;
    use async_trait::async_trait;

    const NOW: i64 = 1_700_000_000;
    const HOUR: i64 = 3600;

    struct Harness {
        service: ProtectionService,
        ledger: Arc<MemoryLedger>,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        let ledger = Arc::new(MemoryLedger::new());
        let clock = Arc::new(ManualClock::new(NOW));
        let service = ProtectionService::new(ledger.clone(), ThrottlePolicy::reference())
            .with_clock(clock.clone());
        Harness {
            service,
            ledger,
            clock,
        }
    }

    fn address(raw: &str) -> AddressFingerprint {
        fingerprint(raw, b"test-salt")
    }

    async fn seed_failure(
        ledger: &MemoryLedger,
        who: &AddressFingerprint,
        action: &str,
        key: Option<&str>,
        time: i64,
    ) {
        ledger
            .append_failure(&FailureEvent {
                address_hash: *who,
                action: action.to_string(),
                key: key.map(str::to_string),
                time,
            })
            .await
            .unwrap();
    }

    async fn seed_block(ledger: &MemoryLedger, who: &AddressFingerprint, block_until: i64) {
        ledger
            .append_block(&BlockEvent {
                address_hash: *who,
                block_until,
            })
            .await
            .unwrap();
    }

    #[test]
    fn verdict_accessors() {
        assert!(!Verdict::Allowed.is_blocked());
        assert_eq!(Verdict::Allowed.block_until(), None);
        let blocked = Verdict::Blocked {
            block_until: 10,
            wait_seconds: 3,
        };
        assert!(blocked.is_blocked());
        assert_eq!(blocked.block_until(), Some(10));
        assert_eq!(blocked.wait_seconds(), Some(3));
    }

    #[test]
    fn blank_keys_mean_no_key() {
        assert_eq!(normalize_key(None), None);
        assert_eq!(normalize_key(Some("")), None);
        assert_eq!(normalize_key(Some("   ")), None);
        assert_eq!(normalize_key(Some(" bob ")), Some("bob"));
    }

    #[tokio::test]
    async fn fresh_address_gets_eight_free_attempts_then_three_seconds() {
        let h = harness();
        let alice = address("192.0.2.1");

        for attempt in 1..=8 {
            let verdict = h
                .service
                .register_failure(&alice, "login", Some("alice"))
                .await
                .unwrap();
            assert_eq!(verdict, Verdict::Allowed, "attempt {attempt} must be free");
        }

        let verdict = h
            .service
            .register_failure(&alice, "login", Some("alice"))
            .await
            .unwrap();
        assert_eq!(
            verdict,
            Verdict::Blocked {
                block_until: NOW + 3,
                wait_seconds: 3
            }
        );
        assert_eq!(h.ledger.block_count(&alice).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn check_unblocks_when_time_passes() {
        let h = harness();
        let alice = address("192.0.2.1");
        assert_eq!(h.service.check(&alice).await.unwrap(), Verdict::Allowed);

        for _ in 0..9 {
            h.service.register_failure(&alice, "login", None).await.unwrap();
        }

        assert_eq!(
            h.service.check(&alice).await.unwrap(),
            Verdict::Blocked {
                block_until: NOW + 3,
                wait_seconds: 3
            }
        );
        h.clock.advance(2);
        assert_eq!(
            h.service.check(&alice).await.unwrap(),
            Verdict::Blocked {
                block_until: NOW + 3,
                wait_seconds: 1
            }
        );
        h.clock.advance(1);
        assert_eq!(h.service.check(&alice).await.unwrap(), Verdict::Allowed);
    }

    #[tokio::test]
    async fn escalates_after_first_block() {
        let h = harness();
        let alice = address("192.0.2.1");

        for _ in 0..9 {
            h.service.register_failure(&alice, "login", None).await.unwrap();
        }
        h.clock.advance(3);

        // risk 0, one past block: three free attempts, then ten seconds
        for _ in 0..3 {
            let verdict = h.service.register_failure(&alice, "login", None).await.unwrap();
            assert_eq!(verdict, Verdict::Allowed);
        }
        let verdict = h.service.register_failure(&alice, "login", None).await.unwrap();
        assert_eq!(
            verdict,
            Verdict::Blocked {
                block_until: NOW + 3 + 10,
                wait_seconds: 10
            }
        );
    }

    #[tokio::test]
    async fn risk_and_past_blocks_shrink_allowance() {
        let h = harness();
        let alice = address("192.0.2.1");

        seed_block(&h.ledger, &alice, NOW - 10).await;
        seed_failure(&h.ledger, &alice, "recover", None, NOW - 100).await;
        seed_failure(&h.ledger, &alice, "recover", None, NOW - 90).await;

        // risk 2, one past block: one free attempt, then thirty seconds
        let first = h.service.register_failure(&alice, "login", None).await.unwrap();
        assert_eq!(first, Verdict::Allowed);
        let second = h.service.register_failure(&alice, "login", None).await.unwrap();
        assert_eq!(
            second,
            Verdict::Blocked {
                block_until: NOW + 30,
                wait_seconds: 30
            }
        );
    }

    #[tokio::test]
    async fn other_addresses_on_same_key_raise_risk() {
        let h = harness();
        let alice = address("192.0.2.1");

        for (offset, raw) in [(0, "198.51.100.1"), (1, "198.51.100.2"), (2, "198.51.100.3")] {
            seed_failure(&h.ledger, &address(raw), "login", Some("bob"), NOW - 60 + offset).await;
        }

        // risk 3 clamps to the last free-attempt row: two free attempts, wait row 3
        for _ in 0..2 {
            let verdict = h
                .service
                .register_failure(&alice, "login", Some("bob"))
                .await
                .unwrap();
            assert_eq!(verdict, Verdict::Allowed);
        }
        let verdict = h
            .service
            .register_failure(&alice, "login", Some("bob"))
            .await
            .unwrap();
        assert_eq!(
            verdict,
            Verdict::Blocked {
                block_until: NOW + 9,
                wait_seconds: 9
            }
        );
    }

    #[tokio::test]
    async fn absent_key_contributes_no_risk() {
        let h = harness();
        let alice = address("192.0.2.1");

        for raw in ["198.51.100.1", "198.51.100.2"] {
            seed_failure(&h.ledger, &address(raw), "login", None, NOW - 60).await;
        }

        for _ in 0..8 {
            let verdict = h
                .service
                .register_failure(&alice, "login", Some("  "))
                .await
                .unwrap();
            assert_eq!(verdict, Verdict::Allowed);
        }
        assert!(
            h.service
                .register_failure(&alice, "login", None)
                .await
                .unwrap()
                .is_blocked()
        );
    }

    #[tokio::test]
    async fn stale_failures_fall_out_of_the_window() {
        let h = harness();
        let alice = address("192.0.2.1");

        for _ in 0..20 {
            seed_failure(&h.ledger, &alice, "login", None, NOW - 25 * HOUR).await;
            seed_failure(&h.ledger, &alice, "recover", None, NOW - 25 * HOUR).await;
        }

        for _ in 0..8 {
            let verdict = h.service.register_failure(&alice, "login", None).await.unwrap();
            assert_eq!(verdict, Verdict::Allowed);
        }
    }

    #[tokio::test]
    async fn long_block_outlives_the_window() {
        let h = harness();
        let alice = address("192.0.2.1");

        seed_failure(&h.ledger, &alice, "login", None, NOW - 25 * HOUR).await;
        // created 25 hours ago with a 26 hour wait
        seed_block(&h.ledger, &alice, NOW + HOUR).await;

        let cutoff = h.service.policy().retention_cutoff(NOW);
        assert_eq!(h.ledger.count_for_action(&alice, "login", cutoff).await.unwrap(), 0);
        assert_eq!(
            h.service.check(&alice).await.unwrap(),
            Verdict::Blocked {
                block_until: NOW + HOUR,
                wait_seconds: 3600
            }
        );
    }

    #[tokio::test]
    async fn addresses_are_isolated() {
        let h = harness();
        let alice = address("192.0.2.1");
        let carol = address("192.0.2.3");

        for _ in 0..9 {
            h.service.register_failure(&alice, "login", None).await.unwrap();
        }
        assert!(h.service.check(&alice).await.unwrap().is_blocked());
        assert_eq!(h.service.check(&carol).await.unwrap(), Verdict::Allowed);
    }

    struct BrokenLedger;

    #[async_trait]
    impl FailureLedger for BrokenLedger {
        async fn count_excluding_action(
            &self,
            _: &AddressFingerprint,
            _: &str,
            _: i64,
        ) -> Result<u64> {
            Err(anyhow!("store unreachable"))
        }
        async fn count_for_action_and_key(
            &self,
            _: &AddressFingerprint,
            _: &str,
            _: Option<&str>,
            _: i64,
        ) -> Result<u64> {
            Err(anyhow!("store unreachable"))
        }
        async fn count_for_action(&self, _: &AddressFingerprint, _: &str, _: i64) -> Result<u64> {
            Err(anyhow!("store unreachable"))
        }
        async fn count_for_action_and_key_across_addresses(
            &self,
            _: &str,
            _: Option<&str>,
            _: i64,
        ) -> Result<u64> {
            Err(anyhow!("store unreachable"))
        }
        async fn count_for_key_excluding_address(
            &self,
            _: &str,
            _: &AddressFingerprint,
            _: i64,
        ) -> Result<u64> {
            Err(anyhow!("store unreachable"))
        }
        async fn append_failure(&self, _: &FailureEvent) -> Result<()> {
            Err(anyhow!("store unreachable"))
        }
        async fn purge_failures(&self, _: i64) -> Result<u64> {
            Err(anyhow!("store unreachable"))
        }
    }

    #[async_trait]
    impl BlockLedger for BrokenLedger {
        async fn active_block(
            &self,
            _: &AddressFingerprint,
            _: i64,
        ) -> Result<Option<BlockEvent>> {
            Err(anyhow!("store unreachable"))
        }
        async fn latest_block(&self, _: &AddressFingerprint) -> Result<Option<BlockEvent>> {
            Err(anyhow!("store unreachable"))
        }
        async fn block_count(&self, _: &AddressFingerprint) -> Result<u64> {
            Err(anyhow!("store unreachable"))
        }
        async fn append_block(&self, _: &BlockEvent) -> Result<()> {
            Err(anyhow!("store unreachable"))
        }
        async fn purge_blocks(&self, _: i64) -> Result<u64> {
            Err(anyhow!("store unreachable"))
        }
    }

    #[tokio::test]
    async fn storage_errors_fail_closed() {
        let service = ProtectionService::new(Arc::new(BrokenLedger), ThrottlePolicy::reference());
        let alice = address("192.0.2.1");

        let err = service.check(&alice).await.unwrap_err();
        assert!(format!("{err:#}").contains("store unreachable"));
        assert!(service.register_failure(&alice, "login", None).await.is_err());
    }
}
