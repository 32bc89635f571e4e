use std::fmt;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::refresher::{TokenHandle, TokenRefresher};
use crate::sources::{ClientSecretSource, DeveloperCliSource};
use crate::token::{AuthError, TokenSource};

/// Which Entra ID identity to use when no API key is configured.
#[derive(Clone, PartialEq, Eq)]
pub enum Identity {
    ClientSecret {
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
    DeveloperCli {
        tenant_id: Option<String>,
    },
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientSecret {
                tenant_id,
                client_id,
                ..
            } => f
                .debug_struct("ClientSecret")
                .field("tenant_id", tenant_id)
                .field("client_id", client_id)
                .field("client_secret", &"[REDACTED]")
                .finish(),
            Self::DeveloperCli { tenant_id } => f
                .debug_struct("DeveloperCli")
                .field("tenant_id", tenant_id)
                .finish(),
        }
    }
}

impl Identity {
    /// A service principal when all three values are present, otherwise the
    /// developer CLI (scoped to the tenant if one is given).
    pub fn select(
        tenant_id: Option<String>,
        client_id: Option<String>,
        client_secret: Option<String>,
    ) -> Self {
        match (tenant_id, client_id, client_secret) {
            (Some(tenant_id), Some(client_id), Some(client_secret)) => Self::ClientSecret {
                tenant_id,
                client_id,
                client_secret,
            },
            (tenant_id, _, _) => Self::DeveloperCli { tenant_id },
        }
    }

    pub fn source(&self) -> Result<Arc<dyn TokenSource>, AuthError> {
        Ok(match self {
            Self::ClientSecret {
                tenant_id,
                client_id,
                client_secret,
            } => Arc::new(ClientSecretSource::new(
                tenant_id.clone(),
                client_id.clone(),
                client_secret.clone(),
            )?),
            Self::DeveloperCli { tenant_id } => {
                Arc::new(DeveloperCliSource::new(tenant_id.clone()))
            }
        })
    }
}

/// How requests to one upstream service authenticate.
#[derive(Clone)]
pub enum Credential {
    ApiKey(String),
    Bearer(TokenHandle),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApiKey(_) => f.write_str("ApiKey([REDACTED])"),
            Self::Bearer(_) => f.write_str("Bearer([REDACTED])"),
        }
    }
}

impl Credential {
    /// Use `api_key` when set, otherwise start a token refresher for `scope`
    /// with the given identity. The returned task handle is `Some` only for
    /// bearer credentials.
    pub async fn resolve(
        api_key: Option<String>,
        identity: &Identity,
        scope: &str,
    ) -> Result<(Self, Option<JoinHandle<()>>), AuthError> {
        if let Some(key) = api_key.filter(|k| !k.trim().is_empty()) {
            return Ok((Self::ApiKey(key), None));
        }
        let (handle, task) = TokenRefresher::start(identity.source()?, scope).await?;
        Ok((Self::Bearer(handle), Some(task)))
    }

    /// Header name and value to attach to an outbound request.
    pub fn header(&self) -> Result<(&'static str, String), AuthError> {
        match self {
            Self::ApiKey(key) => Ok(("api-key", key.clone())),
            Self::Bearer(handle) => Ok(("Authorization", format!("Bearer {}", handle.current()?))),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ApiKey(_) => "api_key",
            Self::Bearer(_) => "bearer",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_header() {
        let cred = Credential::ApiKey("k-123".into());
        assert_eq!(cred.header().unwrap(), ("api-key", "k-123".to_string()));
        assert_eq!(format!("{cred:?}"), "ApiKey([REDACTED])");
    }

    #[test]
    fn identity_selection() {
        let full = Identity::select(Some("t".into()), Some("c".into()), Some("s".into()));
        assert!(matches!(full, Identity::ClientSecret { .. }));
        assert!(!format!("{full:?}").contains("\"s\""));

        let partial = Identity::select(Some("t".into()), Some("c".into()), None);
        assert_eq!(
            partial,
            Identity::DeveloperCli {
                tenant_id: Some("t".into())
            }
        );
    }

    #[tokio::test]
    async fn api_key_skips_token_refresher() {
        let identity = Identity::DeveloperCli { tenant_id: None };
        let (cred, task) = Credential::resolve(Some("real".into()), &identity, "scope")
            .await
            .unwrap();
        assert!(matches!(cred, Credential::ApiKey(ref k) if k == "real"));
        assert!(task.is_none());
        assert_eq!(cred.kind(), "api_key");
    }
}
