//! Tool catalogue for `tools/list` (§4.J): `send`, `check`, `receive`,
//! `complete`, `reply`, each with a JSON-Schema `inputSchema`. Follows
//! `mcp/tools/mod.rs`'s catalogue shape (`McpToolDef`, one function per
//! tool, schemas inline via `json!`).

use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, Serialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

impl ToolDef {
    fn new(name: &str, description: &str, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// Returns the five relay tools exposed over the protocol-adapter
/// transport. A function rather than a `static`, since `json!` values
/// aren't `const` (same reasoning as `clawd_tools()`).
pub fn relay_tools() -> Vec<ToolDef> {
    vec![
        ToolDef::new(
            "send",
            "Send a message to another agent's inbox.",
            json!({
                "type": "object",
                "required": ["to", "from", "task"],
                "properties": {
                    "to": {"type": "string", "description": "Destination inbox path, e.g. 'claude/web'."},
                    "from": {"type": "string", "description": "Sender inbox path."},
                    "task": {"type": "string", "description": "Task text, or a reserved control verb."},
                    "context": {"type": "string"},
                    "project": {"type": "string"},
                    "priority": {"type": "string", "enum": ["low", "normal", "high", "urgent"]},
                    "replyTo": {"type": "string", "description": "Id of the message this replies to."},
                },
            }),
        ),
        ToolDef::new(
            "check",
            "Check an inbox for actionable messages.",
            json!({
                "type": "object",
                "required": ["inbox"],
                "properties": {
                    "inbox": {"type": "string"},
                    "includeRead": {"type": "boolean", "default": false},
                    "autoApprove": {"type": "boolean", "default": false},
                },
            }),
        ),
        ToolDef::new(
            "receive",
            "Mark a message as read.",
            json!({
                "type": "object",
                "required": ["id"],
                "properties": {"id": {"type": "string"}},
            }),
        ),
        ToolDef::new(
            "complete",
            "Mark a message as completed.",
            json!({
                "type": "object",
                "required": ["id"],
                "properties": {"id": {"type": "string"}},
            }),
        ),
        ToolDef::new(
            "reply",
            "Reply to a message; the recipient is resolved from the original sender.",
            json!({
                "type": "object",
                "required": ["id", "task"],
                "properties": {
                    "id": {"type": "string", "description": "Id of the message being replied to."},
                    "task": {"type": "string"},
                    "context": {"type": "string"},
                },
            }),
        ),
    ]
}
