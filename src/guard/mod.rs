//! Adaptive brute-force protection.
//!
//! Flow Overview:
//! 1) [`Fingerprinter`] turns the client address into a salted pseudonym.
//! 2) [`ProtectionService::check`] gates the attempt on any active block.
//! 3) [`ProtectionService::register_failure`] records a failed attempt, scores the
//!    risk from the [`Ledger`] and issues a block once the free attempts for that
//!    risk level are used up.
//! 4) [`spawn_sweeper`] drops ledger rows that aged out of the retention window.
//!
//! ## Escalation
//!
//! The risk level is the number of failures against the same key from other
//! addresses plus the failures from this address on other actions. Together with
//! the number of blocks the address already collected it selects the allowance and
//! the block duration from the [`ThrottlePolicy`] tables. Out-of-range indices reuse
//! the last row or column.
//!
//! The last block's expiry resets the attempt counter for the next one, while the
//! block history keeps growing, so each new block comes sooner and lasts longer.

pub mod clock;
pub mod fingerprint;
pub mod ledger;
pub mod policy;
pub mod service;
pub mod sweeper;

pub use clock::{Clock, ManualClock, SystemClock};
pub use fingerprint::{AddressFingerprint, Fingerprinter, fingerprint};
pub use ledger::{
    BlockEvent, BlockLedger, FailureEvent, FailureLedger, Ledger, MemoryLedger, PgLedger,
};
pub use policy::{PolicyError, RiskSignals, ThrottlePolicy};
pub use service::{ProtectionService, Verdict};
pub use sweeper::{SweepReport, SweeperConfig, spawn_sweeper, sweep_once};
