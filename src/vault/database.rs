use crate::{cli::globals::GlobalArgs, vault};
use anyhow::{Result, anyhow};
use secrecy::{ExposeSecret, SecretString};
use tracing::instrument;

const DATABASE_CREDS_PATH: &str = "/v1/database/creds/authguard";

/// Get DB credentials from Vault
/// # Errors
/// Returns an error if the Vault request fails, Vault returns a non-success status, or the response is missing expected fields.
#[instrument(skip(globals))]
pub async fn database_creds(globals: &mut GlobalArgs) -> Result<()> {
    let creds_url = vault::endpoint_url(&globals.vault_url, DATABASE_CREDS_PATH)?;

    let response = vault::client()?
        .get(&creds_url)
        .header("X-Vault-Token", globals.vault_token.expose_secret())
        .send()
        .await?;
    let json = vault::json_or_error(&creds_url, response).await?;

    let field = |value: &serde_json::Value, name: &str| {
        value
            .as_str()
            .map(ToString::to_string)
            .ok_or_else(|| anyhow!("Error parsing JSON response: no {name} found"))
    };

    globals.vault_db_lease_id = field(&json["lease_id"], "lease_id")?;
    globals.vault_db_lease_duration = json["lease_duration"]
        .as_u64()
        .ok_or_else(|| anyhow!("Error parsing JSON response: no lease_duration found"))?;
    globals.vault_db_username = field(&json["data"]["username"], "username")?;
    globals.vault_db_password = SecretString::from(field(&json["data"]["password"], "password")?);

    Ok(())
}
