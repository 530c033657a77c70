use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Server generated event names. They are never returned by history queries.
pub const STATUS: &str = "status";
pub const HISTORY: &str = "history";
pub const LOG: &str = "log";

pub type Data = Map<String, Value>;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Command,
    Event,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Command => "command",
            MessageType::Event => "event",
        }
    }
}

/// Identity of the user a broadcast came from. Only set by the server.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct UserStamp {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub id: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub room: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub data: Data,
    #[serde(default)]
    pub user: UserStamp,
}

impl Message {
    pub fn event(room: impl Into<String>, name: impl Into<String>, data: Data) -> Self {
        Message {
            kind: MessageType::Event,
            room: room.into(),
            name: name.into(),
            data,
            user: UserStamp::default(),
        }
    }

    /// Roster of a room: `data.user_list` holds member display names.
    pub fn status(room: &str, user_list: Vec<String>) -> Self {
        Self::event(room, STATUS, object(json!({ "user_list": user_list })))
    }

    /// Reply to a `history` command: one page of past events plus the full count.
    pub fn history(room: &str, messages: &[Message], total: u64) -> Self {
        Self::event(
            room,
            HISTORY,
            object(json!({ "messages": messages, "total": total })),
        )
    }

    /// Reply to a `log` command with the room's recent in-memory events.
    pub fn log(room: &str, messages: &[Message]) -> Self {
        Self::event(room, LOG, object(json!({ "messages": messages })))
    }

    pub fn is_event(&self) -> bool {
        self.kind == MessageType::Event
    }

    pub fn is_control(&self) -> bool {
        is_control_name(&self.name)
    }

    pub fn stamped(mut self, user: UserStamp) -> Self {
        self.user = user;
        self
    }

    /// Reads a non-negative integer out of `data`, accepting numbers or numeric strings.
    pub fn data_u32(&self, key: &str) -> Option<u32> {
        match self.data.get(key)? {
            Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

fn is_control_name(name: &str) -> bool {
    matches!(name, STATUS | HISTORY | LOG)
}

fn object(value: Value) -> Data {
    match value {
        Value::Object(map) => map,
        _ => Data::new(),
    }
}
