use crate::{
    api::{self, GuardConfig},
    cli::{commands::vault::Options as VaultOptions, globals::GlobalArgs},
    guard::{Fingerprinter, ThrottlePolicy},
    vault,
};
use anyhow::{Context, Result, anyhow};
use secrecy::{ExposeSecret, SecretSlice, SecretString};
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};
use url::Url;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub vault: Option<VaultOptions>,
    pub fingerprint_salt: Option<SecretString>,
    pub lifetime_seconds: u64,
    pub sweep_interval_seconds: u64,
    pub salt_refresh_seconds: u64,
}

/// Log in with `AppRole`, unwrapping the secret id first if it came wrapped.
async fn vault_login(options: &VaultOptions) -> Result<GlobalArgs> {
    let mut globals = GlobalArgs::new(options.url.clone());

    let secret_id = if let Some(wrapped) = &options.wrapped_token {
        SecretString::from(vault::unwrap(&globals.vault_url, wrapped.expose_secret()).await?)
    } else {
        options
            .secret_id
            .clone()
            .ok_or_else(|| anyhow!("Vault secret-id is required"))?
    };

    let (token, _) = vault::approle_login(
        &globals.vault_url,
        secret_id.expose_secret(),
        &options.role_id,
    )
    .await?;
    globals.set_token(SecretString::from(token));

    Ok(globals)
}

/// Inject the Vault database credentials into `dsn`.
fn dsn_with_credentials(dsn: &str, globals: &GlobalArgs) -> Result<String> {
    let mut dsn = Url::parse(dsn).context("invalid DSN")?;

    dsn.set_username(&globals.vault_db_username)
        .map_err(|()| anyhow!("Error setting username"))?;
    dsn.set_password(Some(globals.vault_db_password.expose_secret()))
        .map_err(|()| anyhow!("Error setting password"))?;

    Ok(dsn.to_string())
}

fn static_salt(salt: Option<&SecretString>) -> Option<SecretSlice<u8>> {
    salt.map(|salt| SecretSlice::from(salt.expose_secret().as_bytes().to_vec()))
}

/// Execute the server action.
/// # Errors
/// Returns an error if the policy is invalid, Vault login fails, DB credentials or the
/// salt cannot be fetched, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let policy = ThrottlePolicy::reference()
        .with_lifetime(Duration::from_secs(args.lifetime_seconds))
        .context("invalid throttle policy")?;
    let config = GuardConfig::new(policy)
        .with_sweep_interval_seconds(args.sweep_interval_seconds)
        .with_salt_refresh_seconds(args.salt_refresh_seconds);

    let Some(options) = &args.vault else {
        if args.fingerprint_salt.is_none() {
            warn!("no fingerprint salt configured, client addresses will be hashed unsalted");
        }
        let fingerprinter = Arc::new(Fingerprinter::new(static_salt(
            args.fingerprint_salt.as_ref(),
        )));
        return api::new(args.port, args.dsn, None, fingerprinter, config).await;
    };

    let mut globals = vault_login(options).await?;

    vault::database::database_creds(&mut globals)
        .await
        .context("Could not get database username and password")?;

    debug!("Global args: {:?}", globals);

    let dsn = dsn_with_credentials(&args.dsn, &globals)?;

    let salt = vault::kv::read_fingerprint_salt(&globals, &options.kv_mount, &options.kv_path)
        .await
        .context("Failed to load fingerprint salt from Vault")?;
    let fingerprinter = Arc::new(Fingerprinter::new(Some(salt)));

    let config = config
        .with_kv_mount(options.kv_mount.clone())
        .with_kv_path(options.kv_path.clone());

    api::new(args.port, dsn, Some(&globals), fingerprinter, config).await
}
