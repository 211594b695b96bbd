use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_VAULT_URL: &str = "vault-url";
pub const ARG_VAULT_ROLE_ID: &str = "vault-role-id";
pub const ARG_VAULT_SECRET_ID: &str = "vault-secret-id";
pub const ARG_VAULT_WRAPPED_TOKEN: &str = "vault-wrapped-token";
pub const ARG_VAULT_KV_MOUNT: &str = "vault-kv-mount";
pub const ARG_VAULT_KV_PATH: &str = "vault-kv-path";

/// Vault settings. Absent entirely when `--vault-url` is not given.
#[derive(Debug, Clone)]
pub struct Options {
    pub url: String,
    pub role_id: String,
    pub secret_id: Option<SecretString>,
    pub wrapped_token: Option<SecretString>,
    pub kv_mount: String,
    pub kv_path: String,
}

impl Options {
    /// Parse Vault arguments from matches.
    ///
    /// # Errors
    /// Returns an error if a Vault URL is given without a role id, or without
    /// either a secret id or a wrapped token.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Option<Self>> {
        let Some(url) = matches.get_one::<String>(ARG_VAULT_URL).cloned() else {
            return Ok(None);
        };
        let get = |id: &str| {
            matches
                .get_one::<String>(id)
                .cloned()
                .filter(|v| !v.trim().is_empty())
        };

        let role_id = get(ARG_VAULT_ROLE_ID)
            .ok_or_else(|| anyhow::anyhow!("missing required argument: --{ARG_VAULT_ROLE_ID}"))?;
        let secret_id = get(ARG_VAULT_SECRET_ID).map(SecretString::from);
        let wrapped_token = get(ARG_VAULT_WRAPPED_TOKEN).map(SecretString::from);
        if secret_id.is_none() && wrapped_token.is_none() {
            return Err(anyhow::anyhow!(
                "missing required argument: --{ARG_VAULT_SECRET_ID} or --{ARG_VAULT_WRAPPED_TOKEN}"
            ));
        }

        Ok(Some(Self {
            url,
            role_id,
            secret_id,
            wrapped_token,
            kv_mount: get(ARG_VAULT_KV_MOUNT).unwrap_or_else(|| "secret/authguard".to_string()),
            kv_path: get(ARG_VAULT_KV_PATH).unwrap_or_else(|| "config".to_string()),
        }))
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_VAULT_URL)
                .long(ARG_VAULT_URL)
                .help("Vault base URL (http(s)://host:port); enables AppRole login and dynamic DB credentials")
                .env("AUTHGUARD_VAULT_URL"),
        )
        .arg(
            Arg::new(ARG_VAULT_ROLE_ID)
                .long(ARG_VAULT_ROLE_ID)
                .help("Vault role id")
                .env("AUTHGUARD_VAULT_ROLE_ID")
                .requires(ARG_VAULT_URL),
        )
        .arg(
            Arg::new(ARG_VAULT_SECRET_ID)
                .long(ARG_VAULT_SECRET_ID)
                .help("Vault secret id")
                .env("AUTHGUARD_VAULT_SECRET_ID")
                .hide_env_values(true)
                .conflicts_with(ARG_VAULT_WRAPPED_TOKEN),
        )
        .arg(
            Arg::new(ARG_VAULT_WRAPPED_TOKEN)
                .long(ARG_VAULT_WRAPPED_TOKEN)
                .help("Vault wrapped secret id, unwrapped once at startup")
                .env("AUTHGUARD_VAULT_WRAPPED_TOKEN")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_VAULT_KV_MOUNT)
                .long(ARG_VAULT_KV_MOUNT)
                .help("Vault KV-v2 mount holding the fingerprint salt")
                .env("AUTHGUARD_VAULT_KV_MOUNT")
                .default_value("secret/authguard"),
        )
        .arg(
            Arg::new(ARG_VAULT_KV_PATH)
                .long(ARG_VAULT_KV_PATH)
                .help("Vault KV-v2 secret path holding the fingerprint salt")
                .env("AUTHGUARD_VAULT_KV_PATH")
                .default_value("config"),
        )
}
