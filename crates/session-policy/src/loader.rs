use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::filter::DownstreamFilter;
use crate::schema::PolicyConfig;

/// Load and validate a [`PolicyConfig`] from a YAML file.
pub fn load_policy(path: impl AsRef<Path>) -> Result<PolicyConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read policy file: {}", path.display()))?;
    load_policy_from_str(&contents)
        .with_context(|| format!("failed to parse policy file: {}", path.display()))
}

/// Parse and validate a [`PolicyConfig`] from a YAML string.
pub fn load_policy_from_str(yaml: &str) -> Result<PolicyConfig> {
    let config: PolicyConfig =
        serde_yml::from_str(yaml).context("YAML deserialization failed")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &PolicyConfig) -> Result<()> {
    if config.version != "1.0" {
        bail!(
            "unsupported policy version '{}'; only '1.0' is supported",
            config.version
        );
    }

    let session = &config.session;
    if let Some(t) = session.temperature {
        if !t.is_finite() || !(0.0..=2.0).contains(&t) {
            bail!("temperature {t} is outside the supported range 0.0..=2.0");
        }
    }
    if session.max_response_output_tokens == Some(0) {
        bail!("max_response_output_tokens must be greater than zero");
    }
    if let Some(voice) = &session.voice {
        if voice.trim().is_empty() {
            bail!("voice must not be blank");
        }
    }

    let mut seen = HashSet::new();
    for tool in &session.tools {
        if tool.is_empty() {
            bail!("tool name must not be empty");
        }
        if !seen.insert(tool) {
            bail!("duplicate tool name: '{tool}'");
        }
    }

    DownstreamFilter::new(&config.downstream).context("invalid downstream.blocked_events")?;

    Ok(())
}
