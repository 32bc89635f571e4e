use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::process::Command;

use crate::token::{AccessToken, AuthError, TokenSource};

const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";

const CLI_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Client credentials (service principal)
// ---------------------------------------------------------------------------

/// OAuth2 client-credentials grant against Entra ID.
pub struct ClientSecretSource {
    tenant_id: String,
    client_id: String,
    client_secret: String,
    authority: String,
    http: reqwest::Client,
}

impl fmt::Debug for ClientSecretSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSecretSource")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("authority", &self.authority)
            .finish()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

impl ClientSecretSource {
    pub fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            authority: DEFAULT_AUTHORITY.to_string(),
            http,
        })
    }

    /// Point at a different authority host (sovereign clouds, tests).
    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = authority.into().trim_end_matches('/').to_string();
        self
    }

    fn token_url(&self) -> String {
        format!("{}/{}/oauth2/v2.0/token", self.authority, self.tenant_id)
    }
}

#[async_trait]
impl TokenSource for ClientSecretSource {
    async fn fetch(&self, scope: &str) -> Result<AccessToken, AuthError> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", scope),
        ];

        let requested_at = Utc::now();
        let response = self.http.post(self.token_url()).form(&form).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Provider {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Parse(e.to_string()))?;

        Ok(AccessToken::new(
            parsed.access_token,
            requested_at + chrono::Duration::seconds(parsed.expires_in),
        ))
    }

    fn name(&self) -> &'static str {
        "client_secret"
    }
}

// ---------------------------------------------------------------------------
// Developer CLI (`azd auth token`)
// ---------------------------------------------------------------------------

/// Borrows the signed-in developer's identity from the Azure Developer CLI.
#[derive(Debug, Clone)]
pub struct DeveloperCliSource {
    program: String,
    tenant_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliToken {
    token: String,
    expires_on: DateTime<Utc>,
}

impl DeveloperCliSource {
    pub fn new(tenant_id: Option<String>) -> Self {
        Self {
            program: "azd".to_string(),
            tenant_id,
        }
    }

    fn args(&self, scope: &str) -> Vec<String> {
        let mut args = vec![
            "auth".to_string(),
            "token".to_string(),
            "--output".to_string(),
            "json".to_string(),
            "--scope".to_string(),
            scope.to_string(),
        ];
        if let Some(tenant) = &self.tenant_id {
            args.push("--tenant-id".to_string());
            args.push(tenant.clone());
        }
        args
    }
}

fn parse_cli_output(stdout: &[u8]) -> Result<AccessToken, AuthError> {
    let parsed: CliToken =
        serde_json::from_slice(stdout).map_err(|e| AuthError::Parse(e.to_string()))?;
    Ok(AccessToken::new(parsed.token, parsed.expires_on))
}

#[async_trait]
impl TokenSource for DeveloperCliSource {
    async fn fetch(&self, scope: &str) -> Result<AccessToken, AuthError> {
        let child = Command::new(&self.program)
            .args(self.args(scope))
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(CLI_TIMEOUT, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Err(AuthError::Cli(format!("failed to run {}: {err}", self.program)))
            }
            Err(_) => {
                return Err(AuthError::Cli(format!(
                    "{} timed out after {}s",
                    self.program,
                    CLI_TIMEOUT.as_secs()
                )))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AuthError::Cli(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        parse_cli_output(&output.stdout)
    }

    fn name(&self) -> &'static str {
        "developer_cli"
    }
}
