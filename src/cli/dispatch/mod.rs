//! Map parsed CLI arguments to an [`Action`].

use crate::cli::actions::{Action, server::Args};
use crate::cli::commands::{guard, vault};
use anyhow::{Context, Result};

/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>("dsn")
        .cloned()
        .context("missing required argument: --dsn")?;

    let vault = vault::Options::parse(matches)?;
    let guard = guard::Options::parse(matches)?;

    Ok(Action::Server(Args {
        port,
        dsn,
        vault,
        fingerprint_salt: guard.fingerprint_salt,
        lifetime_seconds: guard.lifetime_seconds,
        sweep_interval_seconds: guard.sweep_interval_seconds,
        salt_refresh_seconds: guard.salt_refresh_seconds,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::commands;
    use secrecy::ExposeSecret;

    #[test]
    fn static_salt_server_args() {
        temp_env::with_vars(
            [
                ("AUTHGUARD_VAULT_URL", None::<&str>),
                ("AUTHGUARD_FINGERPRINT_SALT", Some("pepper")),
                ("AUTHGUARD_DSN", Some("postgres://guard@localhost:5432/authguard")),
                ("AUTHGUARD_SWEEP_INTERVAL_SECONDS", Some("60")),
            ],
            || {
                let matches = commands::new().get_matches_from(vec!["authguard"]);
                let Ok(Action::Server(args)) = handler(&matches) else {
                    panic!("expected server action");
                };

                assert_eq!(args.port, 8080);
                assert!(args.vault.is_none());
                assert_eq!(
                    args.fingerprint_salt
                        .as_ref()
                        .map(|salt| salt.expose_secret().to_string()),
                    Some("pepper".to_string())
                );
                assert_eq!(args.lifetime_seconds, 86_400);
                assert_eq!(args.sweep_interval_seconds, 60);
                assert_eq!(args.salt_refresh_seconds, 300);
            },
        );
    }

    #[test]
    fn vault_server_args() {
        temp_env::with_vars(
            [
                ("AUTHGUARD_VAULT_URL", Some("https://vault.tld:8200")),
                ("AUTHGUARD_VAULT_ROLE_ID", Some("role")),
                ("AUTHGUARD_VAULT_SECRET_ID", Some("secret")),
                ("AUTHGUARD_VAULT_WRAPPED_TOKEN", None),
                ("AUTHGUARD_FINGERPRINT_SALT", None),
                ("AUTHGUARD_DSN", Some("postgres://localhost:5432/authguard")),
            ],
            || {
                let matches = commands::new().get_matches_from(vec!["authguard"]);
                let Ok(Action::Server(args)) = handler(&matches) else {
                    panic!("expected server action");
                };

                let vault = args.vault.as_ref();
                assert_eq!(vault.map(|v| v.url.as_str()), Some("https://vault.tld:8200"));
                assert_eq!(vault.map(|v| v.kv_mount.as_str()), Some("secret/authguard"));
                assert!(args.fingerprint_salt.is_none());
                // secrets stay out of Debug output
                assert!(!format!("{args:?}").contains("\"secret\""));
            },
        );
    }
}
