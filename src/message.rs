//! Wire envelope exchanged between host and worker.
//!
//! Every frame body is one JSON-encoded [`Message`]. The envelope is
//! intentionally schema-less: params are a string-keyed map of arbitrary
//! JSON values and results are arbitrary JSON. Typed wrappers belong to
//! callers, not to the wire.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Worker -> host: function list announcement.
    Register,
    /// Host -> worker: registration accepted; calls may follow.
    RegisterAck,
    Call,
    Result,
    Error,
    Ping,
    Pong,
    /// Host -> worker: exit cleanly.
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,

    /// Correlation id; present on call/result/error/ping/pong.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Call target; present on call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,

    /// Call arguments; on register, carries `{"functions": [...]}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Message {
    fn new(kind: MessageType) -> Self {
        Self {
            kind,
            id: None,
            function: None,
            params: None,
            result: None,
            error: None,
        }
    }

    pub fn register(functions: Vec<String>) -> Self {
        let mut params = Map::new();
        params.insert(
            "functions".to_string(),
            Value::Array(functions.into_iter().map(Value::String).collect()),
        );
        Self {
            params: Some(params),
            ..Self::new(MessageType::Register)
        }
    }

    pub fn register_ack() -> Self {
        Self::new(MessageType::RegisterAck)
    }

    pub fn call(id: String, function: String, params: Map<String, Value>) -> Self {
        Self {
            id: Some(id),
            function: Some(function),
            params: Some(params),
            ..Self::new(MessageType::Call)
        }
    }

    pub fn result(id: String, result: Value) -> Self {
        Self {
            id: Some(id),
            result: Some(result),
            ..Self::new(MessageType::Result)
        }
    }

    pub fn error(id: String, error: String) -> Self {
        Self {
            id: Some(id),
            error: Some(error),
            ..Self::new(MessageType::Error)
        }
    }

    pub fn ping(id: String) -> Self {
        Self {
            id: Some(id),
            ..Self::new(MessageType::Ping)
        }
    }

    /// A pong echoes the id of the ping it answers.
    pub fn pong(id: Option<String>) -> Self {
        Self {
            id,
            ..Self::new(MessageType::Pong)
        }
    }

    pub fn stop(id: String) -> Self {
        Self {
            id: Some(id),
            ..Self::new(MessageType::Stop)
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// The function list carried by a `register` message, if well-formed.
    pub fn registered_functions(&self) -> Option<Vec<String>> {
        let functions = self.params.as_ref()?.get("functions")?.as_array()?;
        let names: Vec<String> = functions
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        if names.is_empty() {
            None
        } else {
            Some(names)
        }
    }
}
