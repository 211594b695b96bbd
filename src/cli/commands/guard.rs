use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_FINGERPRINT_SALT: &str = "fingerprint-salt";
pub const ARG_LIFETIME_SECONDS: &str = "lifetime-seconds";
pub const ARG_SWEEP_INTERVAL_SECONDS: &str = "sweep-interval-seconds";
pub const ARG_SALT_REFRESH_SECONDS: &str = "salt-refresh-seconds";

#[derive(Debug, Clone)]
pub struct Options {
    pub fingerprint_salt: Option<SecretString>,
    pub lifetime_seconds: u64,
    pub sweep_interval_seconds: u64,
    pub salt_refresh_seconds: u64,
}

impl Options {
    /// Parse engine arguments from matches.
    ///
    /// # Errors
    /// Returns an error if the lifetime is zero.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let seconds = |id: &str, default: u64| matches.get_one::<u64>(id).copied().unwrap_or(default);

        let lifetime_seconds = seconds(ARG_LIFETIME_SECONDS, 86_400);
        if lifetime_seconds == 0 {
            return Err(anyhow::anyhow!("--{ARG_LIFETIME_SECONDS} must be greater than 0"));
        }

        Ok(Self {
            fingerprint_salt: matches
                .get_one::<String>(ARG_FINGERPRINT_SALT)
                .filter(|salt| !salt.is_empty())
                .map(|salt| SecretString::from(salt.clone())),
            lifetime_seconds,
            sweep_interval_seconds: seconds(ARG_SWEEP_INTERVAL_SECONDS, 3_600),
            salt_refresh_seconds: seconds(ARG_SALT_REFRESH_SECONDS, 300),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_FINGERPRINT_SALT)
                .long(ARG_FINGERPRINT_SALT)
                .help("Static salt for client address fingerprints (when Vault is not used)")
                .env("AUTHGUARD_FINGERPRINT_SALT")
                .hide_env_values(true)
                .conflicts_with(super::vault::ARG_VAULT_URL),
        )
        .arg(
            Arg::new(ARG_LIFETIME_SECONDS)
                .long(ARG_LIFETIME_SECONDS)
                .help("How long failures and expired blocks are remembered, in seconds")
                .env("AUTHGUARD_LIFETIME_SECONDS")
                .default_value("86400")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_SWEEP_INTERVAL_SECONDS)
                .long(ARG_SWEEP_INTERVAL_SECONDS)
                .help("Interval between retention sweeps in seconds")
                .env("AUTHGUARD_SWEEP_INTERVAL_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_SALT_REFRESH_SECONDS)
                .long(ARG_SALT_REFRESH_SECONDS)
                .help("Interval between fingerprint salt reloads from Vault in seconds")
                .env("AUTHGUARD_SALT_REFRESH_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(u64)),
        )
}
