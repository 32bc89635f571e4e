use serde_json::{json, Map, Value};
use tracing::debug;

use crate::schema::SessionPolicy;

/// Session fields the client never controls.
pub const POLICY_FIELDS: [&str; 6] = [
    "instructions",
    "temperature",
    "max_response_output_tokens",
    "voice",
    "tools",
    "tool_choice",
];

/// Result of enforcing policy on one client `session.update`.
#[derive(Debug, Clone)]
pub struct Enforced {
    /// The event to forward upstream.
    pub event: Value,
    /// Policy-controlled fields the client tried to set.
    pub discarded: Vec<String>,
}

/// Rewrites session configuration so the server's policy always wins.
pub struct PolicyEnforcer {
    policy: SessionPolicy,
    /// Function schemas of the enabled tools, in the order they are offered.
    tool_schemas: Vec<Value>,
}

impl std::fmt::Debug for PolicyEnforcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEnforcer")
            .field("temperature", &self.policy.temperature)
            .field("max_response_output_tokens", &self.policy.max_response_output_tokens)
            .field("voice", &self.policy.voice)
            .field("tools", &self.policy.tools)
            .field("has_instructions", &self.policy.instructions.is_some())
            .finish()
    }
}

impl PolicyEnforcer {
    pub fn new(policy: SessionPolicy, tool_schemas: Vec<Value>) -> Self {
        Self {
            policy,
            tool_schemas,
        }
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    pub fn allows_tool(&self, name: &str) -> bool {
        self.policy.tools.iter().any(|t| t == name)
    }

    /// Apply policy to a client `session.update`.
    ///
    /// Every field in [`POLICY_FIELDS`] is removed from the client's session
    /// object and replaced by the server value, if the policy has one. All
    /// other fields pass through untouched. A missing or non-object
    /// `session` is replaced with an empty object first.
    pub fn enforce(&self, mut event: Value) -> Enforced {
        let mut discarded = Vec::new();

        if let Value::Object(root) = &mut event {
            let session = root
                .entry("session")
                .or_insert_with(|| Value::Object(Map::new()));
            if !session.is_object() {
                discarded.push("session".to_string());
                *session = Value::Object(Map::new());
            }
            if let Value::Object(session) = session {
                for field in POLICY_FIELDS {
                    if session.remove(field).is_some() {
                        discarded.push(field.to_string());
                    }
                }
                self.apply(session);
            }
        }

        if !discarded.is_empty() {
            debug!(?discarded, "client session fields overridden by policy");
        }

        Enforced { event, discarded }
    }

    /// The `session.update` the relay pushes as soon as the upstream
    /// connection opens, before any client traffic.
    pub fn initial_update(&self) -> Value {
        let mut session = Map::new();
        self.apply(&mut session);
        json!({
            "type": "session.update",
            "session": Value::Object(session),
        })
    }

    /// Scrub server policy out of a `session.created` or `session.updated`
    /// echo bound for the client. Returns `false` if the event had no session object.
    pub fn redact_echo(&self, event: &mut Value) -> bool {
        let Some(session) = event.get_mut("session").and_then(Value::as_object_mut) else {
            return false;
        };
        session.insert("instructions".into(), Value::String(String::new()));
        session.insert("tools".into(), Value::Array(Vec::new()));
        session.insert("tool_choice".into(), Value::String("none".into()));
        session.insert("max_response_output_tokens".into(), Value::Null);
        match &self.policy.voice {
            Some(voice) => {
                session.insert("voice".into(), Value::String(voice.clone()));
            }
            None => {
                session.remove("voice");
            }
        }
        true
    }

    fn apply(&self, session: &mut Map<String, Value>) {
        let policy = &self.policy;
        if let Some(instructions) = &policy.instructions {
            session.insert("instructions".into(), Value::String(instructions.clone()));
        }
        if let Some(temperature) = policy.temperature {
            session.insert("temperature".into(), json!(temperature));
        }
        if let Some(max_tokens) = policy.max_response_output_tokens {
            session.insert("max_response_output_tokens".into(), json!(max_tokens));
        }
        if let Some(voice) = &policy.voice {
            session.insert("voice".into(), Value::String(voice.clone()));
        }
        let tool_choice = if self.tool_schemas.is_empty() { "none" } else { "auto" };
        session.insert("tool_choice".into(), Value::String(tool_choice.into()));
        session.insert("tools".into(), Value::Array(self.tool_schemas.clone()));
    }
}
