//! Salted one-way pseudonyms for client network addresses.
//!
//! Raw addresses never reach the ledgers or the logs; only the HMAC-SHA-256 of the
//! address keyed with the current salt does. Rotating the salt changes every future
//! fingerprint without touching rows written under the previous salt.

use base64::Engine;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretSlice};
use sha2::{Digest, Sha256};
use std::{
    fmt,
    net::IpAddr,
    sync::{
        PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

pub const FINGERPRINT_LEN: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressFingerprint([u8; FINGERPRINT_LEN]);

impl AddressFingerprint {
    #[must_use]
    pub const fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }

    /// Rebuild a fingerprint read back from storage.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; FINGERPRINT_LEN]>::try_from(bytes).ok().map(Self)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }
}

impl fmt::Display for AddressFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(self.0))
    }
}

impl fmt::Debug for AddressFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AddressFingerprint({self})")
    }
}

/// Fingerprint `raw_address` with an explicit salt.
///
/// IP literals are canonicalized first so `::ffff:192.0.2.1` and `192.0.2.1`
/// map to the same pseudonym. Anything else is hashed as trimmed text.
#[must_use]
pub fn fingerprint(raw_address: &str, salt: &[u8]) -> AddressFingerprint {
    let address = canonical_address(raw_address);

    let digest = match HmacSha256::new_from_slice(salt) {
        Ok(mut mac) => {
            mac.update(address.as_bytes());
            mac.finalize().into_bytes()
        }
        // HMAC takes keys of any length; kept so this path stays panic free.
        Err(_) => Sha256::new()
            .chain_update(salt)
            .chain_update(address.as_bytes())
            .finalize(),
    };

    let mut bytes = [0u8; FINGERPRINT_LEN];
    bytes.copy_from_slice(&digest);
    AddressFingerprint(bytes)
}

fn canonical_address(raw_address: &str) -> String {
    let trimmed = raw_address.trim();
    trimmed.parse::<IpAddr>().map_or_else(
        |_| trimmed.to_string(),
        |ip| ip.to_canonical().to_string(),
    )
}

/// Holds the current salt and fingerprints addresses with it.
pub struct Fingerprinter {
    salt: RwLock<Option<SecretSlice<u8>>>,
    warned_missing: AtomicBool,
}

impl Fingerprinter {
    #[must_use]
    pub fn new(salt: Option<SecretSlice<u8>>) -> Self {
        let salt = salt.filter(|salt| !salt.expose_secret().is_empty());
        Self {
            salt: RwLock::new(salt),
            warned_missing: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn has_salt(&self) -> bool {
        self.salt
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Swap in a new salt. Returns `true` if it differs from the current one.
    pub fn rotate(&self, salt: SecretSlice<u8>) -> bool {
        if salt.expose_secret().is_empty() {
            warn!("ignoring empty fingerprint salt");
            return false;
        }

        let mut current = self.salt.write().unwrap_or_else(PoisonError::into_inner);
        let changed = current
            .as_ref()
            .is_none_or(|current| current.expose_secret() != salt.expose_secret());
        if changed {
            info!("fingerprint salt rotated");
            *current = Some(salt);
            self.warned_missing.store(false, Ordering::Relaxed);
        }
        changed
    }

    /// Fingerprint with the current salt.
    ///
    /// Without a salt the address is still hashed, but with an empty key: the
    /// pseudonym stays stable and the raw value is not stored, only unlinkability
    /// across deployments is lost.
    pub fn fingerprint(&self, raw_address: &str) -> AddressFingerprint {
        let salt = self.salt.read().unwrap_or_else(PoisonError::into_inner);
        match salt.as_ref() {
            Some(salt) => fingerprint(raw_address, salt.expose_secret()),
            None => {
                if !self.warned_missing.swap(true, Ordering::Relaxed) {
                    warn!("no fingerprint salt configured, hashing client addresses unsalted");
                }
                fingerprint(raw_address, &[])
            }
        }
    }
}

impl fmt::Debug for Fingerprinter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fingerprinter")
            .field("salt", &"***")
            .field("has_salt", &self.has_salt())
            .finish()
    }
}
