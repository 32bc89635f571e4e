use serde_json::Value;

use crate::error::MalformedEvent;

/// Event types the relay acts on. Everything else is forwarded as is.
pub mod types {
    // client -> upstream
    pub const SESSION_UPDATE: &str = "session.update";
    pub const CONVERSATION_ITEM_CREATE: &str = "conversation.item.create";
    pub const RESPONSE_CREATE: &str = "response.create";

    // upstream -> client
    pub const SESSION_CREATED: &str = "session.created";
    pub const SESSION_UPDATED: &str = "session.updated";
    pub const CONVERSATION_ITEM_CREATED: &str = "conversation.item.created";
    pub const OUTPUT_ITEM_ADDED: &str = "response.output_item.added";
    pub const OUTPUT_ITEM_DONE: &str = "response.output_item.done";
    pub const ARGUMENTS_DELTA: &str = "response.function_call_arguments.delta";
    pub const ARGUMENTS_DONE: &str = "response.function_call_arguments.done";
    pub const RESPONSE_DONE: &str = "response.done";

    // relay -> client
    pub const TOOL_RESPONSE: &str = "extension.middle_tier_tool_response";
}

/// Conversation item kinds.
pub mod items {
    pub const FUNCTION_CALL: &str = "function_call";
    pub const FUNCTION_CALL_OUTPUT: &str = "function_call_output";
}

/// One decoded protocol message.
#[derive(Debug, Clone)]
pub struct RelayEvent {
    pub kind: String,
    pub body: Value,
}

impl RelayEvent {
    pub fn parse(text: &str) -> Result<Self, MalformedEvent> {
        let body: Value = serde_json::from_str(text)?;
        if !body.is_object() {
            return Err(MalformedEvent::NotAnObject);
        }
        let kind = body
            .get("type")
            .and_then(Value::as_str)
            .ok_or(MalformedEvent::MissingType)?
            .to_string();
        Ok(Self { kind, body })
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    pub fn require_str(&self, key: &'static str) -> Result<&str, MalformedEvent> {
        self.str_field(key).ok_or_else(|| MalformedEvent::MissingField {
            event_type: self.kind.clone(),
            field: key,
        })
    }

    /// The `item` object, when it is of the given item type.
    pub fn item_of_type(&self, item_type: &str) -> Option<&Value> {
        self.body
            .get("item")
            .filter(|item| item.get("type").and_then(Value::as_str) == Some(item_type))
    }

    pub fn item_type(&self) -> Option<&str> {
        self.body
            .get("item")
            .and_then(|item| item.get("type"))
            .and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_type_tag() {
        let event = RelayEvent::parse(r#"{"type":"input_audio_buffer.append","audio":"AAA="}"#)
            .unwrap();
        assert_eq!(event.kind, "input_audio_buffer.append");
        assert_eq!(event.str_field("audio"), Some("AAA="));
    }

    #[test]
    fn rejects_malformed() {
        assert!(matches!(
            RelayEvent::parse("{not json"),
            Err(MalformedEvent::InvalidJson(_))
        ));
        assert!(matches!(
            RelayEvent::parse("[1,2]"),
            Err(MalformedEvent::NotAnObject)
        ));
        assert!(matches!(
            RelayEvent::parse(r#"{"type":7}"#),
            Err(MalformedEvent::MissingType)
        ));
    }

    #[test]
    fn item_type_filtering() {
        let event = RelayEvent::parse(
            r#"{"type":"conversation.item.created","item":{"type":"function_call","call_id":"c1"}}"#,
        )
        .unwrap();
        assert!(event.item_of_type(items::FUNCTION_CALL).is_some());
        assert!(event.item_of_type(items::FUNCTION_CALL_OUTPUT).is_none());
        assert_eq!(event.item_type(), Some("function_call"));
    }

    #[test]
    fn missing_field_names_event() {
        let event = RelayEvent::parse(r#"{"type":"response.function_call_arguments.done"}"#)
            .unwrap();
        let err = event.require_str("call_id").unwrap_err();
        assert_eq!(
            err.to_string(),
            "`response.function_call_arguments.done` event is missing `call_id`"
        );
    }
}
