//! Frame codec.
//!
//! Stateless translation between the JSON text carried on the socket and
//! typed frames. One frame per socket message.
//!
//! | Direction | Shape |
//! |---|---|
//! | out | `{"type":"event","name":..,"id":"a-<n>","data":{..}}` |
//! | in  | `{"type":"result","id":..,"data":..}` |
//! | in  | `{"type":<event-name>,"id":..,"data":[args..]}` |
//! | in  | `{"type":"action","name":..,"data":..}` (no id) |
//!
//! Routing is decided purely by the presence of `id` and the value of
//! `type`: anything carrying an id is a [`Reply`], otherwise only the
//! `action` kind is routable.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::errors::ProtocolError;
use crate::ids::RequestId;

/// `type` of outbound request frames.
pub const EVENT_KIND: &str = "event";
/// `type` of terminal single-reply frames.
pub const RESULT_KIND: &str = "result";
/// `type` of unsolicited notification frames.
pub const ACTION_KIND: &str = "action";
/// `type` the peer uses to report failures.
pub const ERROR_KIND: &str = "error";

/// Request frame sent to the peer.
#[derive(Clone, Debug, PartialEq)]
pub struct OutboundFrame {
    /// Event name, e.g. `ui/init`.
    pub name: String,
    /// Correlation id.
    pub id: RequestId,
    /// Event payload. `null` is sent as `{}`.
    pub data: Value,
}

#[derive(Serialize)]
struct WireEvent<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    name: &'a str,
    id: &'a RequestId,
    data: &'a Value,
}

impl OutboundFrame {
    /// Build a request frame.
    pub fn new(name: impl Into<String>, id: RequestId, data: Value) -> Self {
        let data = if data.is_null() {
            Value::Object(Map::new())
        } else {
            data
        };
        Self {
            name: name.into(),
            id,
            data,
        }
    }

    /// Encode to wire text.
    pub fn encode(&self) -> String {
        let wire = WireEvent {
            kind: EVENT_KIND,
            name: &self.name,
            id: &self.id,
            data: &self.data,
        };
        // A `Value` tree with string keys always serializes.
        serde_json::to_string(&wire).unwrap_or_default()
    }
}

/// Correlated reply body.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    /// Terminal reply to a single-callback request.
    Result {
        /// Result payload.
        data: Value,
    },
    /// One of possibly several named replies to an event-map request.
    Named {
        /// The frame's `type`.
        event: String,
        /// Positional arguments.
        args: Vec<Value>,
    },
}

impl Reply {
    /// The reply's event name (`result` for result frames).
    pub fn event(&self) -> &str {
        match self {
            Self::Result { .. } => RESULT_KIND,
            Self::Named { event, .. } => event,
        }
    }

    /// Split into event name and positional arguments.
    ///
    /// A result frame's data is spread the same way a named frame's is.
    pub fn into_parts(self) -> (String, Vec<Value>) {
        match self {
            Self::Result { data } => (RESULT_KIND.to_owned(), spread_args(Some(data))),
            Self::Named { event, args } => (event, args),
        }
    }
}

/// A decoded inbound frame.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundFrame {
    /// A frame carrying a request id.
    Reply {
        /// The id it answers.
        id: RequestId,
        /// What it says.
        reply: Reply,
    },
    /// An unsolicited notification.
    Action {
        /// Action name, e.g. `view/add`.
        name: String,
        /// Action payload.
        data: Value,
    },
}

/// Decode one inbound text frame.
pub fn decode(raw: &str) -> Result<InboundFrame, ProtocolError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed {
        reason: e.to_string(),
    })?;
    let Value::Object(mut obj) = value else {
        return Err(ProtocolError::Malformed {
            reason: "frame is not a JSON object".into(),
        });
    };

    let kind = obj.get("type").and_then(Value::as_str).map(str::to_owned);

    if let Some(id) = obj.get("id").and_then(routable_id) {
        let reply = match kind.as_deref() {
            Some(RESULT_KIND) => Reply::Result {
                data: obj.remove("data").unwrap_or(Value::Null),
            },
            Some(ERROR_KIND) if !obj.contains_key("data") => Reply::Named {
                event: ERROR_KIND.into(),
                args: obj.remove("error").into_iter().collect(),
            },
            _ => Reply::Named {
                event: kind.unwrap_or_default(),
                args: spread_args(obj.remove("data")),
            },
        };
        return Ok(InboundFrame::Reply { id, reply });
    }

    match kind.as_deref() {
        Some(ACTION_KIND) => Ok(InboundFrame::Action {
            name: obj
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            data: obj.remove("data").unwrap_or(Value::Null),
        }),
        Some(ERROR_KIND) => Err(ProtocolError::Remote {
            message: obj
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unspecified error")
                .to_owned(),
        }),
        _ => Err(ProtocolError::Unroutable { kind }),
    }
}

/// Map the wire `id` to a request id. Absent, `null`, `false`, `""` and `0`
/// mean "no id".
fn routable_id(id: &Value) -> Option<RequestId> {
    match id {
        Value::String(s) if !s.is_empty() => Some(RequestId::from_raw(s.as_str())),
        Value::Number(n) if n.as_f64().is_some_and(|f| f.abs() > 0.0) => {
            Some(RequestId::from_raw(n.to_string()))
        }
        _ => None,
    }
}

fn spread_args(data: Option<Value>) -> Vec<Value> {
    match data {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(args)) => args,
        Some(other) => vec![other],
    }
}
