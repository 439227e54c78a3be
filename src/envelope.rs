//! Message envelope exchanged between bus members.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::address::Uid;

/// Body field carrying the sender's uid.
pub const FROM_UID_FIELD: &str = "_fromUID";

/// A typed message: `{ "type": ..., "body": { ..., "_fromUID": ... } }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type; becomes the local event name on the receiving side.
    #[serde(rename = "type")]
    pub event: String,
    /// Structured body, always an object.
    pub body: Map<String, Value>,
}

impl Envelope {
    /// Wrap `data` for sending, stamping the sender uid into the body.
    ///
    /// Non-object data is replaced by an empty object, and any
    /// caller-supplied `_fromUID` is overwritten.
    pub fn stamped(event: impl Into<String>, data: Value, from: &Uid) -> Self {
        let mut body = match data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        body.insert(FROM_UID_FIELD.to_string(), uid_value(from));

        Self {
            event: event.into(),
            body,
        }
    }

    /// Uid of the member that sent this envelope, if present.
    pub fn from_uid(&self) -> Option<Uid> {
        sender_uid(&self.body)
    }
}

/// Read the `_fromUID` stamp out of a message body.
pub fn sender_uid(body: &Map<String, Value>) -> Option<Uid> {
    match body.get(FROM_UID_FIELD)? {
        Value::Number(n) => n.as_u64().map(Uid::Num),
        Value::String(s) => Some(Uid::from(s.as_str())),
        _ => None,
    }
}

fn uid_value(uid: &Uid) -> Value {
    match uid {
        Uid::Num(n) => Value::from(*n),
        Uid::Name(s) => Value::from(s.as_str()),
    }
}
