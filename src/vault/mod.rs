//! Minimal Vault HTTP client: `AppRole` login, token and lease renewal, dynamic
//! database credentials and the KV v2 secret holding the fingerprint salt.

pub mod database;
pub mod kv;
pub mod renew;

use crate::APP_USER_AGENT;
use anyhow::{Result, anyhow};
use reqwest::{Client, Response};
use serde_json::{Value, json};
use tracing::{debug, instrument};
use url::Url;

/// Join `path` onto the scheme, host and port of the Vault base `url`.
///
/// # Errors
/// Returns an error if `url` cannot be parsed, has no host, or uses an unsupported scheme.
#[instrument]
pub fn endpoint_url(url: &str, path: &str) -> Result<String> {
    let url = Url::parse(url)?;

    let scheme = url.scheme();
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("Error parsing URL: no host specified"))?;

    let port = match (url.port(), scheme) {
        (Some(port), _) => port,
        (None, "http") => 80,
        (None, "https") => 443,
        (None, _) => return Err(anyhow!("Error parsing URL: unsupported scheme {scheme}")),
    };

    let endpoint = format!("{scheme}://{host}:{port}{path}");

    debug!("endpoint URL: {endpoint}");

    Ok(endpoint)
}

pub(crate) fn client() -> Result<Client> {
    Ok(Client::builder().user_agent(APP_USER_AGENT).build()?)
}

/// Parse a successful JSON response, or turn Vault's `errors` array into an error.
pub(crate) async fn json_or_error(url: &str, response: Response) -> Result<Value> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let body: Value = response.json().await.unwrap_or_default();
    Err(anyhow!(
        "{url} - {status}, {}",
        body["errors"][0].as_str().unwrap_or("")
    ))
}

/// Unwrap a response-wrapped `AppRole` secret id.
/// Create one with:
/// vault write -wrap-ttl=300s -f auth/approle/role/authguard/secret-id
/// # Errors
/// Returns an error if the Vault request fails, Vault returns a non-success status, or the response has no `secret_id`.
#[instrument(skip(token))]
pub async fn unwrap(url: &str, token: &str) -> Result<String> {
    let unwrap_url = endpoint_url(url, "/v1/sys/wrapping/unwrap")?;

    let response = client()?
        .post(&unwrap_url)
        .header("X-Vault-Token", token)
        .send()
        .await?;
    let json = json_or_error(&unwrap_url, response).await?;

    json["data"]["secret_id"]
        .as_str()
        .map(ToString::to_string)
        .ok_or_else(|| anyhow!("Error parsing JSON response: no secret_id found"))
}

/// Login to Vault using `AppRole`, returning the client token and its lease duration.
/// Create a secret id with:
/// vault write -f auth/approle/role/authguard/secret-id
/// # Errors
/// Returns an error if the Vault request fails, Vault returns a non-success status, or the response has no `client_token`.
#[instrument(skip(sid))]
pub async fn approle_login(url: &str, sid: &str, rid: &str) -> Result<(String, u64)> {
    let login_url = endpoint_url(url, "/v1/auth/approle/login")?;

    let response = client()?
        .post(&login_url)
        .json(&json!({
            "role_id": rid,
            "secret_id": sid
        }))
        .send()
        .await?;
    let json = json_or_error(&login_url, response).await?;

    let token = json["auth"]["client_token"]
        .as_str()
        .ok_or_else(|| anyhow!("Error parsing JSON response: no client_token found"))?;
    let lease_duration = json["auth"]["lease_duration"].as_u64().unwrap_or(1800);

    Ok((token.to_string(), lease_duration))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_endpoint_url() {
        assert_eq!(
            endpoint_url("https://vault.tld", "/v1/sys/health").ok(),
            Some("https://vault.tld:443/v1/sys/health".to_string())
        );
        assert_eq!(
            endpoint_url("http://vault.tld:8200/ignored", "/v1/sys/health").ok(),
            Some("http://vault.tld:8200/v1/sys/health".to_string())
        );
        assert!(endpoint_url("ftp://vault.tld", "/v1").is_err());
        assert!(endpoint_url("not a url", "/v1").is_err());
    }

    #[tokio::test]
    async fn approle_login_returns_token_and_lease() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/auth/approle/login"))
            .and(body_json(json!({"role_id": "role", "secret_id": "secret"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "auth": {"client_token": "s.token", "lease_duration": 600}
            })))
            .mount(&server)
            .await;

        let (token, lease) = approle_login(&server.uri(), "secret", "role").await?;
        assert_eq!(token, "s.token");
        assert_eq!(lease, 600);
        Ok(())
    }

    #[tokio::test]
    async fn unwrap_returns_secret_id() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sys/wrapping/unwrap"))
            .and(header("X-Vault-Token", "wrapped"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"data": {"secret_id": "secret"}})),
            )
            .mount(&server)
            .await;

        assert_eq!(unwrap(&server.uri(), "wrapped").await?, "secret");
        Ok(())
    }

    #[tokio::test]
    async fn vault_errors_are_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/auth/approle/login"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"errors": ["invalid role id"]})),
            )
            .mount(&server)
            .await;

        let err = approle_login(&server.uri(), "secret", "nope")
            .await
            .map(|_| ())
            .unwrap_err();
        assert!(err.to_string().contains("invalid role id"));
    }
}
