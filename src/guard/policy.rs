//! Risk scoring and the escalating throttle policy.
//!
//! Two tables drive every decision, both indexed by `(risk_level, past_block_count)`:
//!
//! - **Free attempts:** how many failures are tolerated before a new block is issued.
//! - **Wait seconds:** how long the block lasts once issued.
//!
//! Rows are risk levels, columns are the number of blocks the client has already
//! collected. Indices past the end of a table (or of an individual row) reuse the
//! last entry, so tolerance shrinks and punishment grows until it plateaus.

use std::time::Duration;

/// Failures tolerated per `(risk_level, past_block_count)`.
pub const REFERENCE_FREE_ATTEMPTS: &[&[u64]] = &[&[8, 3, 2, 2, 1], &[3, 2, 1], &[2, 1]];

/// Block duration in seconds per `(risk_level, past_block_count)`.
pub const REFERENCE_WAIT_SECONDS: &[&[u64]] = &[
    &[3, 10, 10, 30, 300, 600, 1800, 1800, 3600, 3600, 21600],
    &[3, 10, 60, 60, 120, 300, 900, 1800, 3600, 21600],
    &[6, 30, 60, 60, 120, 300, 1800, 3600, 3600, 21600],
    &[9, 60, 60, 60, 180, 540, 1800, 3600, 3600, 21600],
];

/// Retention window for ledger entries in the reference policy.
pub const REFERENCE_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("{table} table has no rows")]
    EmptyTable { table: &'static str },
    #[error("{table} table row {row} is empty")]
    EmptyRow { table: &'static str, row: usize },
    #[error("lifetime must be at least one second")]
    ZeroLifetime,
}

/// Ledger-derived counters feeding the risk level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RiskSignals {
    /// Failures against the same key coming from other addresses.
    pub from_key: u64,
    /// Failures from this address on any other action.
    pub from_address: u64,
}

impl RiskSignals {
    /// The two signals combine additively.
    #[must_use]
    pub fn level(&self) -> u64 {
        self.from_key.saturating_add(self.from_address)
    }
}

/// Immutable throttle configuration injected into the protection service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottlePolicy {
    free_attempts: Vec<Vec<u64>>,
    wait_seconds: Vec<Vec<u64>>,
    lifetime: Duration,
}

impl ThrottlePolicy {
    /// Build a policy from explicit tables.
    ///
    /// # Errors
    /// Returns `PolicyError` if a table or one of its rows is empty, or the lifetime
    /// is shorter than one second.
    pub fn new(
        free_attempts: Vec<Vec<u64>>,
        wait_seconds: Vec<Vec<u64>>,
        lifetime: Duration,
    ) -> Result<Self, PolicyError> {
        validate_table("free attempts", &free_attempts)?;
        validate_table("wait seconds", &wait_seconds)?;
        if lifetime.as_secs() == 0 {
            return Err(PolicyError::ZeroLifetime);
        }

        Ok(Self {
            free_attempts,
            wait_seconds,
            lifetime,
        })
    }

    /// The reference tables with a 24 hour lifetime.
    #[must_use]
    pub fn reference() -> Self {
        Self {
            free_attempts: to_rows(REFERENCE_FREE_ATTEMPTS),
            wait_seconds: to_rows(REFERENCE_WAIT_SECONDS),
            lifetime: REFERENCE_LIFETIME,
        }
    }

    /// Same tables, different retention window.
    ///
    /// # Errors
    /// Returns `PolicyError::ZeroLifetime` if `lifetime` is shorter than one second.
    pub fn with_lifetime(mut self, lifetime: Duration) -> Result<Self, PolicyError> {
        if lifetime.as_secs() == 0 {
            return Err(PolicyError::ZeroLifetime);
        }
        self.lifetime = lifetime;
        Ok(self)
    }

    #[must_use]
    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Lifetime in whole seconds, saturated to fit epoch arithmetic.
    #[must_use]
    pub fn lifetime_seconds(&self) -> i64 {
        i64::try_from(self.lifetime.as_secs()).unwrap_or(i64::MAX)
    }

    /// Oldest timestamp still inside the retention window at `now`.
    #[must_use]
    pub fn retention_cutoff(&self, now: i64) -> i64 {
        now.saturating_sub(self.lifetime_seconds())
    }

    /// Failures tolerated before a new block is issued.
    #[must_use]
    pub fn free_attempts(&self, risk_level: u64, past_blocks: u64) -> u64 {
        lookup(&self.free_attempts, risk_level, past_blocks)
    }

    /// Seconds a newly issued block lasts.
    #[must_use]
    pub fn wait_seconds(&self, risk_level: u64, past_blocks: u64) -> u64 {
        lookup(&self.wait_seconds, risk_level, past_blocks)
    }
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self::reference()
    }
}

fn to_rows(table: &[&[u64]]) -> Vec<Vec<u64>> {
    table.iter().map(|row| row.to_vec()).collect()
}

fn validate_table(table: &'static str, rows: &[Vec<u64>]) -> Result<(), PolicyError> {
    if rows.is_empty() {
        return Err(PolicyError::EmptyTable { table });
    }
    if let Some(row) = rows.iter().position(Vec::is_empty) {
        return Err(PolicyError::EmptyRow { table, row });
    }
    Ok(())
}

/// Clamp both indices into the table; tables are validated non-empty on construction.
fn lookup(table: &[Vec<u64>], row: u64, column: u64) -> u64 {
    let Some(last_row) = table.len().checked_sub(1) else {
        return 0;
    };
    let row = &table[clamp_index(row, last_row)];
    let Some(last_column) = row.len().checked_sub(1) else {
        return 0;
    };
    row[clamp_index(column, last_column)]
}

fn clamp_index(index: u64, last: usize) -> usize {
    usize::try_from(index).map_or(last, |index| index.min(last))
}
