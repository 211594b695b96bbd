//! Retention sweeper.
//!
//! A background task that periodically deletes ledger rows that fell out of the
//! retention window. Failures go once `time < now - lifetime`. Blocks go once
//! `block_until < now - lifetime`, so a long block survives until it has expired
//! and aged out, however long ago it was issued.

use super::{
    clock::Clock,
    ledger::{BlockLedger, FailureLedger, Ledger},
    policy::ThrottlePolicy,
};
use anyhow::{Context, Result};
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{Instrument, error, info, info_span};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SweeperConfig {
    interval: Duration,
}

impl SweeperConfig {
    /// Default sweeper config: one pass per hour.
    #[must_use]
    pub fn new() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
        }
    }

    #[must_use]
    pub fn with_interval_seconds(mut self, seconds: u64) -> Self {
        self.interval = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn normalize(self) -> Self {
        let interval = if self.interval.is_zero() {
            Duration::from_secs(1)
        } else {
            self.interval
        };
        Self { interval }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub cutoff: i64,
    pub failures_deleted: u64,
    pub blocks_deleted: u64,
}

/// Run a single retention pass.
///
/// # Errors
/// Returns an error if either purge fails; the failure purge runs first.
pub async fn sweep_once(
    ledger: &dyn Ledger,
    policy: &ThrottlePolicy,
    clock: &dyn Clock,
) -> Result<SweepReport> {
    let cutoff = policy.retention_cutoff(clock.now());

    let failures_deleted = ledger
        .purge_failures(cutoff)
        .await
        .context("failed to purge expired failures")?;
    let blocks_deleted = ledger
        .purge_blocks(cutoff)
        .await
        .context("failed to purge expired blocks")?;

    Ok(SweepReport {
        cutoff,
        failures_deleted,
        blocks_deleted,
    })
}

/// Spawn the sweeper loop. A failed pass is logged and retried on the next tick.
pub fn spawn_sweeper(
    ledger: Arc<dyn Ledger>,
    policy: Arc<ThrottlePolicy>,
    clock: Arc<dyn Clock>,
    config: SweeperConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = config.normalize().interval();

        loop {
            let span = info_span!("guard.sweep");
            match sweep_once(ledger.as_ref(), &policy, clock.as_ref())
                .instrument(span)
                .await
            {
                Ok(report) => info!(
                    cutoff = report.cutoff,
                    failures_deleted = report.failures_deleted,
                    blocks_deleted = report.blocks_deleted,
                    "retention sweep finished"
                ),
                Err(err) => error!("retention sweep failed: {err:#}"),
            }

            sleep(interval).await;
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::guard::{
        clock::ManualClock,
        fingerprint::fingerprint,
        ledger::{BlockEvent, FailureEvent, MemoryLedger},
    };

    const NOW: i64 = 1_700_000_000;
    const HOUR: i64 = 3600;

    #[test]
    fn config_defaults_and_normalize() {
        assert_eq!(SweeperConfig::default().interval(), Duration::from_secs(3600));
        let config = SweeperConfig::new().with_interval_seconds(0).normalize();
        assert_eq!(config.interval(), Duration::from_secs(1));
        let config = SweeperConfig::new().with_interval_seconds(90).normalize();
        assert_eq!(config.interval(), Duration::from_secs(90));
    }

    #[tokio::test]
    async fn sweep_removes_only_what_aged_out() {
        let ledger = MemoryLedger::new();
        let policy = ThrottlePolicy::reference();
        let clock = ManualClock::new(NOW);
        let alice = fingerprint("192.0.2.1", b"salt");

        for time in [NOW - 25 * HOUR, NOW - 24 * HOUR - 1, NOW - 24 * HOUR, NOW - HOUR] {
            ledger
                .append_failure(&FailureEvent {
                    address_hash: alice,
                    action: "login".to_string(),
                    key: None,
                    time,
                })
                .await
                .unwrap();
        }
        // expired long ago, expired recently, still running after a very long wait
        for block_until in [NOW - 30 * HOUR, NOW - HOUR, NOW + 6 * HOUR] {
            ledger
                .append_block(&BlockEvent {
                    address_hash: alice,
                    block_until,
                })
                .await
                .unwrap();
        }

        let report = sweep_once(&ledger, &policy, &clock).await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                cutoff: NOW - 24 * HOUR,
                failures_deleted: 2,
                blocks_deleted: 1,
            }
        );

        assert_eq!(ledger.count_for_action(&alice, "login", i64::MIN).await.unwrap(), 2);
        assert_eq!(ledger.block_count(&alice).await.unwrap(), 2);
        let active = ledger.active_block(&alice, NOW).await.unwrap();
        assert_eq!(active.map(|block| block.block_until), Some(NOW + 6 * HOUR));

        let again = sweep_once(&ledger, &policy, &clock).await.unwrap();
        assert_eq!(again.failures_deleted, 0);
        assert_eq!(again.blocks_deleted, 0);
    }

    #[tokio::test]
    async fn active_block_survives_every_sweep_until_it_ages_out() {
        let ledger = MemoryLedger::new();
        let policy = ThrottlePolicy::reference();
        let clock = ManualClock::new(NOW);
        let alice = fingerprint("192.0.2.1", b"salt");
        ledger
            .append_block(&BlockEvent {
                address_hash: alice,
                block_until: NOW + HOUR,
            })
            .await
            .unwrap();

        clock.advance(24 * HOUR);
        sweep_once(&ledger, &policy, &clock).await.unwrap();
        assert_eq!(ledger.block_count(&alice).await.unwrap(), 1);

        clock.advance(HOUR + 1);
        let report = sweep_once(&ledger, &policy, &clock).await.unwrap();
        assert_eq!(report.blocks_deleted, 1);
        assert_eq!(ledger.block_count(&alice).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn spawned_sweeper_runs_immediately() {
        let ledger = Arc::new(MemoryLedger::new());
        let alice = fingerprint("192.0.2.1", b"salt");
        ledger
            .append_failure(&FailureEvent {
                address_hash: alice,
                action: "login".to_string(),
                key: None,
                time: NOW - 48 * HOUR,
            })
            .await
            .unwrap();

        let handle = spawn_sweeper(
            ledger.clone(),
            Arc::new(ThrottlePolicy::reference()),
            Arc::new(ManualClock::new(NOW)),
            SweeperConfig::new(),
        );

        for _ in 0..50 {
            if ledger.count_for_action(&alice, "login", i64::MIN).await.unwrap() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        handle.abort();

        assert_eq!(ledger.count_for_action(&alice, "login", i64::MIN).await.unwrap(), 0);
    }
}
