//! # Authguard (Adaptive Brute-Force Protection)
//!
//! `authguard` decides whether a client may attempt a guarded action (login, password
//! recovery, second factor, ...) and, after each failure, whether the client should be
//! locked out and for how long.
//!
//! ## Privacy
//!
//! Client addresses are never stored. They are replaced by a salted HMAC-SHA-256
//! fingerprint before they reach the ledgers or the logs. The salt is read from Vault
//! (KV v2) or passed on the command line, and can be rotated at runtime.
//!
//! ## Escalation
//!
//! Every failure is appended to a failure ledger. The risk level of the attempt is the
//! number of failures against the same key from other addresses plus the number of
//! failures from the same address on other actions. Risk and the number of blocks the
//! address already collected select how many free attempts it gets and how long the
//! next block lasts, so repeat offenders are blocked sooner and for longer.
//!
//! ## Retention
//!
//! Failures and blocks age out after the policy lifetime (24 hours by default). A
//! background sweeper deletes expired rows; a block that is still running is never
//! deleted, however long ago it was issued.

pub mod api;
pub mod cli;
pub mod guard;
pub mod vault;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
