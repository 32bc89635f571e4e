use serde::{Deserialize, Serialize};

/// Top-level policy file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Schema version; currently must be "1.0".
    pub version: String,
    /// Values forced onto every upstream session configuration.
    pub session: SessionPolicy,
    /// Server-side filtering of upstream events bound for the client.
    #[serde(default)]
    pub downstream: DownstreamPolicy,
}

/// The policy-controlled session fields. A `None` means the server does not
/// pin the field; the client still cannot set it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionPolicy {
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_response_output_tokens: Option<u32>,
    #[serde(default)]
    pub voice: Option<String>,
    /// Names of registered tools the model may call.
    #[serde(default)]
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownstreamPolicy {
    /// Glob patterns over upstream event `type` values that are dropped
    /// instead of forwarded to the client.
    #[serde(default = "default_blocked_events")]
    pub blocked_events: Vec<String>,
}

impl Default for DownstreamPolicy {
    fn default() -> Self {
        Self {
            blocked_events: default_blocked_events(),
        }
    }
}

fn default_blocked_events() -> Vec<String> {
    vec!["session.updated".to_string()]
}
