use crate::{cli::globals::GlobalArgs, vault};
use anyhow::{Result, anyhow};
use rand::{Rng, SeedableRng, rngs::StdRng};
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use std::future::Future;
use tokio::{
    sync::mpsc,
    time::{Duration, sleep},
};
use tracing::{debug, error, instrument, warn};

const MAX_ATTEMPTS: u32 = 3;

/// Renew the client token, returning the new lease duration in seconds.
#[instrument(skip(token))]
async fn renew_token(url: &str, token: &SecretString) -> Result<u64> {
    let renew_url = vault::endpoint_url(url, "/v1/auth/token/renew-self")?;

    let response = vault::client()?
        .post(&renew_url)
        .header("X-Vault-Token", token.expose_secret())
        .json(&json!({}))
        .send()
        .await?;
    let json = vault::json_or_error(&renew_url, response).await?;

    json["auth"]["lease_duration"]
        .as_u64()
        .ok_or_else(|| anyhow!("Error parsing JSON response: no lease_duration found"))
}

/// Renew the dynamic database credentials lease.
#[instrument(skip(token))]
async fn renew_db_lease(
    url: &str,
    token: &SecretString,
    lease_id: &str,
    increment: u64,
) -> Result<u64> {
    let renew_url = vault::endpoint_url(url, "/v1/sys/leases/renew")?;

    let response = vault::client()?
        .put(&renew_url)
        .header("X-Vault-Token", token.expose_secret())
        .json(&json!({
            "lease_id": lease_id,
            "increment": increment
        }))
        .send()
        .await?;
    let json = vault::json_or_error(&renew_url, response).await?;

    json["lease_duration"]
        .as_u64()
        .ok_or_else(|| anyhow!("Error parsing JSON response: no lease_duration found"))
}

/// Renew at 70-90% of the lease so renewals from many replicas spread out.
fn jittered(rng: &mut StdRng, lease_duration: u64) -> Duration {
    let factor = rng.gen_range(70..90);
    Duration::from_secs(lease_duration * factor / 100)
}

/// Keep renewing `what` until it fails `MAX_ATTEMPTS` times in a row, then signal `tx`.
fn spawn_renewal<F, Fut>(what: &'static str, tx: mpsc::UnboundedSender<()>, renew: F)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<u64>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut rng = StdRng::from_entropy();

        loop {
            let mut next = Duration::default();

            for attempt in 1..=MAX_ATTEMPTS {
                if attempt > 1 {
                    let backoff = 2u64.pow(attempt - 1);
                    warn!("Backing off for {backoff} seconds");
                    sleep(Duration::from_secs(backoff)).await;
                }

                match renew().await {
                    Ok(lease_duration) => {
                        next = jittered(&mut rng, lease_duration);
                        break;
                    }
                    Err(e) if attempt == MAX_ATTEMPTS => {
                        error!("Failed to renew {what} after {MAX_ATTEMPTS} attempts: {e}");
                        let _ = tx.send(());
                        return;
                    }
                    Err(e) => error!("Failed to renew {what}: {e}"),
                }
            }

            debug!("Will renew {what} in {} seconds", next.as_secs());

            sleep(next).await;
        }
    });
}

/// Renew the Vault token and the DB lease in the background.
///
/// Once either renewal gives up, a message is sent on `tx` so the server can shut
/// down instead of running on credentials that are about to expire.
#[instrument(skip(globals, tx))]
pub fn try_renew(globals: &GlobalArgs, tx: mpsc::UnboundedSender<()>) {
    let url = globals.vault_url.clone();
    let token = globals.vault_token.clone();
    spawn_renewal("token", tx.clone(), move || {
        let url = url.clone();
        let token = token.clone();
        async move { renew_token(&url, &token).await }
    });

    let url = globals.vault_url.clone();
    let token = globals.vault_token.clone();
    let lease_id = globals.vault_db_lease_id.clone();
    let increment = globals.vault_db_lease_duration;
    spawn_renewal("DB lease", tx, move || {
        let url = url.clone();
        let token = token.clone();
        let lease_id = lease_id.clone();
        async move { renew_db_lease(&url, &token, &lease_id, increment).await }
    });
}
