use crate::{cli::globals::GlobalArgs, guard::Fingerprinter, vault};
use anyhow::{Context, Result, anyhow};
use base64::Engine;
use secrecy::{ExposeSecret, SecretSlice};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::sleep};
use tracing::{Instrument, debug, info_span, instrument, warn};

const FINGERPRINT_SALT_FIELD: &str = "fingerprint_salt_b64";
const MIN_SALT_LEN: usize = 16;

/// Read the fingerprint salt from the KV v2 secret at `kv_mount`/`kv_path`.
///
/// # Errors
/// Returns an error if the Vault request fails, the field is missing, or the salt
/// is not base64 or shorter than 16 bytes.
#[instrument(skip(globals))]
pub async fn read_fingerprint_salt(
    globals: &GlobalArgs,
    kv_mount: &str,
    kv_path: &str,
) -> Result<SecretSlice<u8>> {
    let path = format!("/v1/{kv_mount}/data/{kv_path}");
    let url = vault::endpoint_url(&globals.vault_url, &path)?;

    let span = info_span!("vault.kv.read", http.method = "GET", url = %url);
    let response = vault::client()?
        .get(&url)
        .header("X-Vault-Token", globals.vault_token.expose_secret())
        .send()
        .instrument(span)
        .await?;
    let json = vault::json_or_error(&url, response).await?;

    let salt_b64 = json
        .get("data")
        .and_then(|data| data.get("data"))
        .and_then(|data| data.get(FINGERPRINT_SALT_FIELD))
        .and_then(Value::as_str)
        .context("fingerprint salt missing from vault response")?;

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(salt_b64.trim())
        .context("fingerprint salt is not valid base64")?;
    if decoded.len() < MIN_SALT_LEN {
        return Err(anyhow!(
            "fingerprint salt length is {}, expected at least {MIN_SALT_LEN}",
            decoded.len()
        ));
    }

    Ok(SecretSlice::from(decoded))
}

/// Re-read the salt every `interval` and hand changes to the fingerprinter.
///
/// A failed read keeps the current salt; the next tick tries again.
pub fn spawn_salt_refresher(
    globals: GlobalArgs,
    fingerprinter: Arc<Fingerprinter>,
    kv_mount: String,
    kv_path: String,
    interval: Duration,
) -> JoinHandle<()> {
    let interval = interval.max(Duration::from_secs(1));

    tokio::spawn(async move {
        loop {
            sleep(interval).await;

            match read_fingerprint_salt(&globals, &kv_mount, &kv_path).await {
                Ok(salt) => {
                    if !fingerprinter.rotate(salt) {
                        debug!("fingerprint salt unchanged");
                    }
                }
                Err(e) => warn!("Failed to refresh fingerprint salt, keeping the current one: {e:#}"),
            }
        }
    })
}
