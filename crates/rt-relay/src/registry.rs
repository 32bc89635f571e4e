use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Where a tool's result goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultDirection {
    /// Back to the model as function output. The model is continued once
    /// the response that asked for it is done.
    ToServer,
    /// Straight to the client. The model never sees it.
    ToClient,
}

impl ResultDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ToServer => "to_server",
            Self::ToClient => "to_client",
        }
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Backend(String),

    #[error("tool call cancelled")]
    Cancelled,
}

impl ToolError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArguments(_) => "invalid_arguments",
            Self::Backend(_) => "tool_error",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("tool '{0}' is already registered")]
    DuplicateTool(String),

    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("invalid schema for tool '{name}': {reason}")]
    InvalidSchema { name: String, reason: String },
}

/// Executes one tool. Handlers get already-decoded arguments and should stop
/// early once `cancel` fires; a handler that does not is still awaited.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Value, cancel: CancellationToken) -> Result<Value, ToolError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ToolError>> + Send,
{
    async fn call(&self, args: Value, cancel: CancellationToken) -> Result<Value, ToolError> {
        (self.0)(args, cancel).await
    }
}

/// Wrap an async closure as a [`ToolHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Value, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// What an invocation produced, tagged with the tool's declared direction.
#[derive(Debug)]
pub struct ToolOutcome {
    pub direction: ResultDirection,
    pub result: Result<Value, ToolError>,
}

pub struct ToolDescriptor {
    pub name: String,
    /// Realtime function schema, as offered to the model.
    pub schema: Value,
    pub direction: ResultDirection,
    handler: Arc<dyn ToolHandler>,
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

impl ToolDescriptor {
    /// Run the handler. A panic inside the handler becomes a
    /// [`ToolError::Backend`] instead of unwinding into the session.
    pub async fn invoke(&self, args: Value, cancel: CancellationToken) -> ToolOutcome {
        let result = match AssertUnwindSafe(self.handler.call(args, cancel))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(tool = %self.name, "tool handler panicked");
                Err(ToolError::Backend("tool handler panicked".to_string()))
            }
        };
        ToolOutcome {
            direction: self.direction,
            result,
        }
    }
}

/// Name-keyed tool table. Filled once at startup, then shared behind an
/// `Arc` and only read.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<ToolDescriptor>>,
    by_name: HashMap<String, usize>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        schema: Value,
        handler: Arc<dyn ToolHandler>,
        direction: ResultDirection,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if self.by_name.contains_key(&name) {
            return Err(RegistryError::DuplicateTool(name));
        }
        let schema = normalize_schema(&name, schema)?;

        self.by_name.insert(name.clone(), self.tools.len());
        self.tools.push(Arc::new(ToolDescriptor {
            name,
            schema,
            direction,
            handler,
        }));
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<&Arc<ToolDescriptor>, RegistryError> {
        self.by_name
            .get(name)
            .map(|&i| &self.tools[i])
            .ok_or_else(|| RegistryError::UnknownTool(name.to_string()))
    }

    /// Declared direction of a registered tool.
    pub fn direction_of(&self, name: &str) -> Option<ResultDirection> {
        self.lookup(name).ok().map(|tool| tool.direction)
    }

    /// Schemas of the allow-listed tools, in registration order.
    pub fn schemas(&self, allow: &[String]) -> Vec<Value> {
        self.tools
            .iter()
            .filter(|tool| allow.iter().any(|a| a == &tool.name))
            .map(|tool| tool.schema.clone())
            .collect()
    }

    /// Fail on the first allow-listed name that was never registered.
    pub fn ensure_registered(&self, allow: &[String]) -> Result<(), RegistryError> {
        for name in allow {
            self.lookup(name)?;
        }
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().map(|tool| tool.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

fn normalize_schema(name: &str, schema: Value) -> Result<Value, RegistryError> {
    let invalid = |reason: &str| RegistryError::InvalidSchema {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let Value::Object(mut map) = schema else {
        return Err(invalid("schema must be a JSON object"));
    };

    match map.get("type") {
        None => {
            map.insert("type".into(), Value::String("function".into()));
        }
        Some(Value::String(t)) if t == "function" => {}
        Some(_) => return Err(invalid("`type` must be \"function\"")),
    }

    match map.get("name") {
        None => {
            map.insert("name".into(), Value::String(name.to_string()));
        }
        Some(Value::String(n)) if n == name => {}
        Some(_) => return Err(invalid("`name` does not match the registered name")),
    }

    Ok(Value::Object(map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo() -> Arc<dyn ToolHandler> {
        handler_fn(|args, _cancel| async move { Ok(args) })
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = ToolRegistry::new();
        registry
            .register("search", json!({}), echo(), ResultDirection::ToClient)
            .unwrap();
        let err = registry
            .register("search", json!({}), echo(), ResultDirection::ToServer)
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateTool(name) if name == "search"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.direction_of("search"), Some(ResultDirection::ToClient));
    }

    #[test]
    fn lookup_unknown_fails() {
        let registry = ToolRegistry::new();
        assert!(matches!(
            registry.lookup("nope"),
            Err(RegistryError::UnknownTool(name)) if name == "nope"
        ));
    }

    #[test]
    fn schema_gets_type_and_name() {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                "search",
                json!({"description": "find flats", "parameters": {"type": "object"}}),
                echo(),
                ResultDirection::ToClient,
            )
            .unwrap();
        let schema = &registry.lookup("search").unwrap().schema;
        assert_eq!(schema["type"], "function");
        assert_eq!(schema["name"], "search");
    }

    #[test]
    fn mismatched_schema_name_is_rejected() {
        let mut registry = ToolRegistry::new();
        let err = registry
            .register("search", json!({"name": "other"}), echo(), ResultDirection::ToClient)
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidSchema { .. }));
        assert!(registry
            .register("x", json!("not an object"), echo(), ResultDirection::ToClient)
            .is_err());
    }

    #[test]
    fn schemas_follow_registration_order_and_allowlist() {
        let mut registry = ToolRegistry::new();
        for name in ["a", "b", "c"] {
            registry
                .register(name, json!({}), echo(), ResultDirection::ToServer)
                .unwrap();
        }
        let allow = vec!["c".to_string(), "a".to_string()];
        let names: Vec<_> = registry
            .schemas(&allow)
            .iter()
            .map(|s| s["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a", "c"]);

        assert!(registry.ensure_registered(&allow).is_ok());
        assert!(registry.ensure_registered(&["zzz".to_string()]).is_err());
    }

    #[tokio::test]
    async fn invoke_reports_declared_direction() {
        let mut registry = ToolRegistry::new();
        registry
            .register("echo", json!({}), echo(), ResultDirection::ToClient)
            .unwrap();
        let outcome = registry
            .lookup("echo")
            .unwrap()
            .invoke(json!({"q": 1}), CancellationToken::new())
            .await;
        assert_eq!(outcome.direction, ResultDirection::ToClient);
        assert_eq!(outcome.result.unwrap(), json!({"q": 1}));
    }

    #[tokio::test]
    async fn panicking_handler_becomes_backend_error() {
        let mut registry = ToolRegistry::new();
        let handler = handler_fn(|_args, _cancel| async move {
            if true {
                panic!("kaboom");
            }
            Ok(Value::Null)
        });
        registry
            .register("bad", json!({}), handler, ResultDirection::ToServer)
            .unwrap();
        let outcome = registry
            .lookup("bad")
            .unwrap()
            .invoke(Value::Null, CancellationToken::new())
            .await;
        let err = outcome.result.unwrap_err();
        assert_eq!(err.code(), "tool_error");
    }
}
