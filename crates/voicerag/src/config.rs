use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use listing_search::SearchSettings;
use serde::Deserialize;
use tracing::warn;
use upstream_auth::Identity;

/// Voice used when neither the environment nor the policy names one.
pub const FALLBACK_VOICE: &str = "alloy";

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "default_policy_file")]
    pub policy_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            upstream: UpstreamConfig::default(),
            search: SearchConfig::default(),
            logging: LoggingConfig::default(),
            policy_file: default_policy_file(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_listen")]
    pub listen_addr: String,
    #[serde(default = "default_path")]
    pub path: String,
    /// Extra `Origin` patterns accepted on upgrade. Localhost always is.
    #[serde(default)]
    pub origin_allowlist: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen(),
            path: default_path(),
            origin_allowlist: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub realtime_deployment: Option<String>,
    #[serde(default = "default_realtime_api_version")]
    pub api_version: String,
    /// Operator voice override. Wins over the policy file.
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            realtime_deployment: None,
            api_version: default_realtime_api_version(),
            voice: None,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchConfig {
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub index: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default = "default_embedding_deployment")]
    pub embedding_deployment: String,
    #[serde(default = "default_embedding_api_version")]
    pub embedding_api_version: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            service_name: None,
            index: None,
            api_version: None,
            embedding_deployment: default_embedding_deployment(),
            embedding_api_version: default_embedding_api_version(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default = "default_true")]
    pub audit_enabled: bool,
    #[serde(default = "default_audit_path")]
    pub audit_log_path: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            audit_enabled: default_true(),
            audit_log_path: default_audit_path(),
        }
    }
}

// ---------------------------------------------------------------------------
// Default-value functions used by serde
// ---------------------------------------------------------------------------

fn default_policy_file() -> PathBuf {
    PathBuf::from("policy.yaml")
}

fn default_listen() -> String {
    "127.0.0.1:8765".to_string()
}

fn default_path() -> String {
    "/realtime".to_string()
}

fn default_realtime_api_version() -> String {
    "2024-10-01-preview".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_embedding_deployment() -> String {
    "text-embedding-3-large".to_string()
}

fn default_embedding_api_version() -> String {
    "2024-10-21".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_audit_path() -> PathBuf {
    PathBuf::from("audit.jsonl")
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load configuration from a YAML file.
///
/// A missing file yields the defaults and a warning; everything needed to
/// reach Azure can then still come from the environment.
pub fn load(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        warn!(
            path = %path.display(),
            "configuration file not found; using defaults"
        );
        return Ok(Config::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;

    let config: Config = serde_yml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;

    Ok(config)
}

impl Config {
    /// Apply the `AZURE_*` overrides. `lookup` is `std::env::var` in
    /// production; blank values count as unset.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("AZURE_OPENAI_ENDPOINT") {
            self.upstream.endpoint = Some(v);
        }
        if let Some(v) = get("AZURE_OPENAI_REALTIME_DEPLOYMENT") {
            self.upstream.realtime_deployment = Some(v);
        }
        if let Some(v) = get("AZURE_OPENAI_REALTIME_VOICE_CHOICE") {
            self.upstream.voice = Some(v);
        }
        if let Some(v) = get("AZURE_OPENAI_API_VERSION") {
            self.search.embedding_api_version = v;
        }
        if let Some(v) = get("AZURE_OPENAI_EMBEDDING_DEPLOYMENT") {
            self.search.embedding_deployment = v;
        }
        if let Some(v) = get("AZURE_SEARCH_SERVICE_NAME") {
            self.search.service_name = Some(v);
        }
        if let Some(v) = get("AZURE_SEARCH_INDEX") {
            self.search.index = Some(v);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.upstream_target()?;
        self.listen_addr()?;
        if self.network.path.trim_matches('/').is_empty() {
            bail!("network.path must name a route, got '{}'", self.network.path);
        }
        if self.search.service_name.is_some() != self.search.index.is_some() {
            bail!("search.service_name and search.index must be set together");
        }
        if self.upstream.connect_timeout_secs == 0 {
            bail!("upstream.connect_timeout_secs must be greater than zero");
        }
        Ok(())
    }

    /// Realtime endpoint and deployment. Both are mandatory.
    pub fn upstream_target(&self) -> anyhow::Result<(&str, &str)> {
        let endpoint = self
            .upstream
            .endpoint
            .as_deref()
            .context("upstream endpoint missing; set AZURE_OPENAI_ENDPOINT")?;
        let deployment = self
            .upstream
            .realtime_deployment
            .as_deref()
            .context("realtime deployment missing; set AZURE_OPENAI_REALTIME_DEPLOYMENT")?;
        Ok((endpoint, deployment))
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.network
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address '{}'", self.network.listen_addr))
    }

    /// `None` when no search service is configured.
    pub fn search_settings(&self) -> Option<SearchSettings> {
        Some(SearchSettings {
            service_name: self.search.service_name.clone()?,
            index: self.search.index.clone()?,
            api_version: self.search.api_version.clone(),
        })
    }
}

/// Voice for every session: operator override, then policy, then alloy.
pub fn effective_voice(operator: Option<&str>, policy: Option<&str>) -> String {
    operator
        .or(policy)
        .unwrap_or(FALLBACK_VOICE)
        .to_string()
}

// ---------------------------------------------------------------------------
// Secrets
// ---------------------------------------------------------------------------

/// Credentials read from the environment only, never from the config file.
#[derive(Default)]
pub struct Secrets {
    pub openai_api_key: Option<String>,
    pub search_api_key: Option<String>,
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set = |v: &Option<String>| if v.is_some() { "[REDACTED]" } else { "unset" };
        f.debug_struct("Secrets")
            .field("openai_api_key", &set(&self.openai_api_key))
            .field("search_api_key", &set(&self.search_api_key))
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &set(&self.client_secret))
            .finish()
    }
}

impl Secrets {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            openai_api_key: get("AZURE_OPENAI_API_KEY"),
            search_api_key: get("AZURE_SEARCH_API_KEY"),
            tenant_id: get("AZURE_TENANT_ID"),
            client_id: get("AZURE_CLIENT_ID"),
            client_secret: get("AZURE_CLIENT_SECRET"),
        }
    }

    /// Identity used for whichever service has no API key.
    pub fn identity(&self) -> Identity {
        Identity::select(
            self.tenant_id.clone(),
            self.client_id.clone(),
            self.client_secret.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn configured() -> Config {
        let mut cfg = Config::default();
        cfg.apply_env(env(&[
            ("AZURE_OPENAI_ENDPOINT", "https://contoso.openai.azure.com"),
            ("AZURE_OPENAI_REALTIME_DEPLOYMENT", "gpt-4o-realtime-preview"),
        ]));
        cfg
    }

    #[test]
    fn missing_file_gives_defaults() {
        let cfg = load(Path::new("/does/not/exist/config.yaml")).unwrap();
        assert_eq!(cfg.network.listen_addr, "127.0.0.1:8765");
        assert_eq!(cfg.network.path, "/realtime");
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert!(cfg.logging.audit_enabled);
        assert_eq!(cfg.policy_file, PathBuf::from("policy.yaml"));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "network:\n  listen_addr: \"0.0.0.0:9000\"\nlogging:\n  format: pretty\n  audit_enabled: false\n"
        )
        .unwrap();

        let cfg = load(file.path()).unwrap();
        assert_eq!(cfg.network.listen_addr, "0.0.0.0:9000");
        assert_eq!(cfg.network.path, "/realtime");
        assert_eq!(cfg.logging.format, LogFormat::Pretty);
        assert!(!cfg.logging.audit_enabled);
        assert_eq!(cfg.upstream.api_version, "2024-10-01-preview");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "logging:\n  format: xml\n").unwrap();
        let err = load(file.path()).unwrap_err();
        assert!(
            err.to_string().contains("failed to parse config file"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn env_overrides_file_values() {
        let mut cfg = Config::default();
        cfg.upstream.endpoint = Some("https://from-file.openai.azure.com".into());
        cfg.apply_env(env(&[
            ("AZURE_OPENAI_ENDPOINT", "https://from-env.openai.azure.com"),
            ("AZURE_OPENAI_REALTIME_VOICE_CHOICE", "shimmer"),
            ("AZURE_OPENAI_API_VERSION", "2024-06-01"),
            ("AZURE_SEARCH_SERVICE_NAME", "contoso-search"),
            ("AZURE_SEARCH_INDEX", "  "),
        ]));
        assert_eq!(
            cfg.upstream.endpoint.as_deref(),
            Some("https://from-env.openai.azure.com")
        );
        assert_eq!(cfg.upstream.voice.as_deref(), Some("shimmer"));
        assert_eq!(cfg.search.embedding_api_version, "2024-06-01");
        assert_eq!(cfg.search.service_name.as_deref(), Some("contoso-search"));
        assert_eq!(cfg.search.index, None);
    }

    #[test]
    fn endpoint_and_deployment_are_required() {
        let mut cfg = Config::default();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("AZURE_OPENAI_ENDPOINT"), "unexpected error: {err}");

        cfg.upstream.endpoint = Some("https://contoso.openai.azure.com".into());
        let err = cfg.validate().unwrap_err();
        assert!(
            err.to_string().contains("AZURE_OPENAI_REALTIME_DEPLOYMENT"),
            "unexpected error: {err}"
        );

        assert!(configured().validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_network_settings() {
        let mut cfg = configured();
        cfg.network.listen_addr = "localhost".into();
        assert!(cfg.validate().is_err());

        let mut cfg = configured();
        cfg.network.path = "/".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn search_needs_service_and_index() {
        let mut cfg = configured();
        assert!(cfg.search_settings().is_none());

        cfg.search.service_name = Some("contoso-search".into());
        assert!(cfg.validate().is_err());

        cfg.search.index = Some("flats".into());
        cfg.validate().unwrap();
        let settings = cfg.search_settings().unwrap();
        assert_eq!(settings.service_name, "contoso-search");
        assert_eq!(settings.index, "flats");
    }

    #[test]
    fn voice_precedence() {
        assert_eq!(effective_voice(Some("echo"), Some("shimmer")), "echo");
        assert_eq!(effective_voice(None, Some("shimmer")), "shimmer");
        assert_eq!(effective_voice(None, None), "alloy");
    }

    #[test]
    fn secrets_ignore_blank_values_and_pick_identity() {
        let secrets = Secrets::from_lookup(env(&[
            ("AZURE_OPENAI_API_KEY", ""),
            ("AZURE_SEARCH_API_KEY", "search-key"),
            ("AZURE_TENANT_ID", "tenant"),
        ]));
        assert_eq!(secrets.openai_api_key, None);
        assert_eq!(secrets.search_api_key.as_deref(), Some("search-key"));
        assert_eq!(
            secrets.identity(),
            Identity::DeveloperCli {
                tenant_id: Some("tenant".into())
            }
        );

        let debug = format!("{secrets:?}");
        assert!(!debug.contains("search-key"));
    }
}
