//! RPC protocol message types
//!
//! Defines the messages exchanged on a connection. Every message travels as
//! one length-prefixed JSON frame (see [`super::transport`]).
//!
//! A server greets each accepted connection with `validate_connection`
//! before the client may send requests. Either side ends a connection
//! gracefully with `close_connection`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::identity::Identity;
use crate::common::Error;

/// Request id reserved for oneway requests, which get no reply
pub const ONEWAY_REQUEST_ID: u32 = 0;

/// Type id every servant implements
pub const OBJECT_TYPE_ID: &str = "::Rpc::Object";

/// Built-in operations answered by the object adapter
pub const OP_PING: &str = "rpc_ping";
pub const OP_IS_A: &str = "rpc_isA";
pub const OP_ID: &str = "rpc_id";
pub const OP_IDS: &str = "rpc_ids";

/// Request context: free-form string pairs sent along with a request
pub type Context = BTreeMap<String, String>;

/// Every message on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    ValidateConnection,
    Request(RequestMessage),
    Reply(ReplyMessage),
    CloseConnection,
}

/// Whether an operation may safely be retried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    #[default]
    Normal,
    Idempotent,
}

/// Invocation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    /// Request ID for matching replies, [`ONEWAY_REQUEST_ID`] for oneway
    pub request_id: u32,
    pub identity: Identity,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub facet: String,
    pub operation: String,
    #[serde(default)]
    pub mode: OperationMode,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: Context,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Outcome of a dispatched request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Ok,
    UserException,
    ObjectNotExist,
    FacetNotExist,
    OperationNotExist,
    UnknownException,
}

/// Reply to a twoway request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyMessage {
    /// Request ID this reply corresponds to
    pub request_id: u32,
    pub status: ReplyStatus,
    /// Result on success, exception payload otherwise
    #[serde(default)]
    pub body: serde_json::Value,
}

impl ReplyMessage {
    /// Create a success reply
    pub fn ok(request_id: u32, body: serde_json::Value) -> Self {
        Self {
            request_id,
            status: ReplyStatus::Ok,
            body,
        }
    }

    /// Create a reply for a request that failed on the server
    pub fn failure(request: &RequestMessage, status: ReplyStatus, body: serde_json::Value) -> Self {
        Self {
            request_id: request.request_id,
            status,
            body,
        }
    }

    /// Body for the `*_not_exist` statuses
    pub fn not_exist_body(request: &RequestMessage) -> serde_json::Value {
        serde_json::json!({
            "identity": request.identity.to_string(),
            "facet": request.facet,
            "operation": request.operation,
        })
    }

    /// Turn the reply into the invocation result
    pub fn into_result(self) -> Result<serde_json::Value, Error> {
        let field = |name: &str| {
            self.body
                .get(name)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };

        match self.status {
            ReplyStatus::Ok => Ok(self.body),
            ReplyStatus::UserException => Err(Error::UserException(self.body)),
            ReplyStatus::ObjectNotExist => Err(Error::ObjectNotExist {
                identity: field("identity"),
                facet: field("facet"),
                operation: field("operation"),
            }),
            ReplyStatus::FacetNotExist => Err(Error::FacetNotExist {
                identity: field("identity"),
                facet: field("facet"),
                operation: field("operation"),
            }),
            ReplyStatus::OperationNotExist => Err(Error::OperationNotExist {
                identity: field("identity"),
                facet: field("facet"),
                operation: field("operation"),
            }),
            ReplyStatus::UnknownException => Err(Error::UnknownException(
                self.body
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| self.body.to_string()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> RequestMessage {
        RequestMessage {
            request_id: 7,
            identity: Identity::new("test"),
            facet: String::new(),
            operation: "getContext".to_string(),
            mode: OperationMode::Idempotent,
            context: Context::new(),
            params: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_request_wire_shape() {
        let json = serde_json::to_value(Message::Request(request())).unwrap();
        assert_eq!(json["type"], "request");
        assert_eq!(json["identity"]["name"], "test");
        assert_eq!(json["mode"], "idempotent");
        assert!(json.get("facet").is_none());
        assert!(json.get("context").is_none());
    }

    #[test]
    fn test_unit_messages() {
        let json = serde_json::to_string(&Message::ValidateConnection).unwrap();
        assert_eq!(json, r#"{"type":"validate_connection"}"#);
        let parsed: Message = serde_json::from_str(r#"{"type":"close_connection"}"#).unwrap();
        assert_eq!(parsed, Message::CloseConnection);
    }

    #[test]
    fn test_not_exist_reply_into_error() {
        let req = request();
        let reply = ReplyMessage::failure(
            &req,
            ReplyStatus::FacetNotExist,
            ReplyMessage::not_exist_body(&req),
        );
        match reply.into_result() {
            Err(Error::FacetNotExist { identity, operation, .. }) => {
                assert_eq!(identity, "test");
                assert_eq!(operation, "getContext");
            }
            other => panic!("Expected FacetNotExist, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_exception_message() {
        let reply = ReplyMessage {
            request_id: 1,
            status: ReplyStatus::UnknownException,
            body: serde_json::json!("servant panicked"),
        };
        match reply.into_result() {
            Err(Error::UnknownException(msg)) => assert_eq!(msg, "servant panicked"),
            other => panic!("Expected UnknownException, got {:?}", other),
        }
    }
}
