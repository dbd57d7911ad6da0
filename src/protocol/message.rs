use crate::protocol::{AsyncEvent, CorrelationId};
use crate::{RemoteError, Result, RpcError};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Protocol version carried in every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Parameter mapping of a request.
pub type Params = Map<String, Value>;

/// A JSON-RPC request as sent to the TRex sync socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: CorrelationId,
    pub method: String,
    #[serde(default)]
    pub params: Params,
}

impl Request {
    // ---

    pub fn new(id: CorrelationId, method: impl Into<String>, params: Params) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Result<Bytes> {
        // ---
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Parse one request from wire bytes.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        // ---
        serde_json::from_slice(payload)
            .map_err(|err| RpcError::Protocol(format!("invalid request: {err}")))
    }
}

/// Error member of a failed response.
///
/// TRex adds `specific_err` with a detailed reason next to the generic
/// JSON-RPC `message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specific_err: Option<String>,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
            specific_err: None,
        }
    }

    pub fn with_specific_err(mut self, specific_err: impl Into<String>) -> Self {
        self.specific_err = Some(specific_err.into());
        self
    }
}

impl From<ErrorObject> for RemoteError {
    fn from(err: ErrorObject) -> Self {
        // ---
        RemoteError {
            code: err.code,
            message: err.specific_err.unwrap_or(err.message),
            data: err.data,
        }
    }
}

/// A validated JSON-RPC response: exactly one of result or error.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: CorrelationId,
    pub outcome: std::result::Result<Value, ErrorObject>,
}

impl Response {
    // ---

    pub fn success(id: CorrelationId, result: Value) -> Self {
        Self {
            id,
            outcome: Ok(result),
        }
    }

    pub fn failure(id: CorrelationId, error: ErrorObject) -> Self {
        Self {
            id,
            outcome: Err(error),
        }
    }

    /// Build the wire object, `jsonrpc` member included.
    pub fn to_value(&self) -> Result<Value> {
        // ---
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
        obj.insert("id".into(), Value::from(self.id.get()));
        match &self.outcome {
            Ok(result) => obj.insert("result".into(), result.clone()),
            Err(error) => obj.insert("error".into(), serde_json::to_value(error)?),
        };
        Ok(Value::Object(obj))
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Result<Bytes> {
        // ---
        Ok(Bytes::from(serde_json::to_vec(&self.to_value()?)?))
    }

    /// Parse and validate one response from wire bytes.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        // ---
        let value: Value = serde_json::from_slice(payload)
            .map_err(|err| RpcError::Protocol(format!("response is not JSON: {err}")))?;
        Self::from_value(&value)
    }

    /// Validate a decoded JSON value as a response.
    ///
    /// Requires `jsonrpc == "2.0"`, an integer `id` and exactly one of
    /// `result` and `error`.
    pub fn from_value(value: &Value) -> Result<Self> {
        // ---
        let obj = value
            .as_object()
            .ok_or_else(|| RpcError::Protocol(format!("response is not an object: {value}")))?;

        let id = obj
            .get("id")
            .and_then(Value::as_u64)
            .map(CorrelationId::new)
            .ok_or_else(|| RpcError::Protocol(format!("response without integer id: {value}")))?;

        if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(RpcError::Protocol(format!("malformed response: {value}")));
        }

        match (obj.get("result"), obj.get("error")) {
            (Some(_), Some(_)) => Err(RpcError::Protocol(format!(
                "response carries both result and error: {value}"
            ))),
            (None, Some(error)) => {
                let error: ErrorObject = serde_json::from_value(error.clone())
                    .map_err(|err| RpcError::Protocol(format!("malformed error member: {err}")))?;
                Ok(Self::failure(id, error))
            }
            (Some(result), None) => Ok(Self::success(id, result.clone())),
            (None, None) => Err(RpcError::Protocol(format!("malformed response: {value}"))),
        }
    }

    /// Convert into the caller-facing result.
    pub fn into_result(self) -> Result<Value> {
        // ---
        self.outcome
            .map_err(|err| RpcError::Remote(RemoteError::from(err)))
    }
}

/// One item of a message received on the sync channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A well-formed response.
    Response(Response),

    /// A response naming an id that failed validation.
    Malformed { id: CorrelationId, reason: String },

    /// A JSON-RPC notification (`method` and no `id`).
    Notification(AsyncEvent),

    /// An error object without a usable id, such as a parse error the
    /// server reports with `"id": null`.
    Rejected(ErrorObject),

    /// Anything else that cannot be attributed to a request.
    Unattributable(String),
}

impl Inbound {
    /// Classify every item of a sync-channel message.
    ///
    /// A message is either a single object or a batch array. Fails only when
    /// the payload is not JSON at all.
    pub fn decode_all(payload: &[u8]) -> Result<Vec<Inbound>> {
        // ---
        let value: Value = serde_json::from_slice(payload)
            .map_err(|err| RpcError::Protocol(format!("message is not JSON: {err}")))?;

        Ok(match value {
            Value::Array(items) => items.iter().map(Self::classify).collect(),
            other => vec![Self::classify(&other)],
        })
    }

    fn classify(value: &Value) -> Inbound {
        // ---
        match Response::from_value(value) {
            Ok(response) => return Inbound::Response(response),
            Err(err) => {
                if let Some(id) = value.get("id").and_then(Value::as_u64) {
                    return Inbound::Malformed {
                        id: CorrelationId::new(id),
                        reason: err.to_string(),
                    };
                }
            }
        }

        if let Some(method) = value.get("method").and_then(Value::as_str) {
            return Inbound::Notification(AsyncEvent {
                name: method.to_string(),
                event_type: Value::Null,
                data: value.get("params").cloned().unwrap_or(Value::Null),
                baseline: false,
            });
        }

        match value.get("error").cloned().map(serde_json::from_value::<ErrorObject>) {
            Some(Ok(error)) => Inbound::Rejected(error),
            _ => Inbound::Unattributable(value.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    fn id(raw: u64) -> CorrelationId {
        CorrelationId::new(raw)
    }

    #[test]
    fn test_request_wire_shape() {
        // ---
        let mut params = Params::new();
        params.insert("port_id".into(), json!(0));
        let req = Request::new(id(7), "get_port_status", params);

        let wire: Value = serde_json::from_slice(&req.encode().unwrap()).unwrap();
        assert_eq!(
            wire,
            json!({"jsonrpc": "2.0", "id": 7, "method": "get_port_status", "params": {"port_id": 0}})
        );
        assert_eq!(Request::decode(&req.encode().unwrap()).unwrap(), req);
    }

    #[test]
    fn test_response_success_survives_encoding() {
        // ---
        let resp = Response::success(id(3), json!({"version": "v3.02"}));
        assert_eq!(Response::decode(&resp.encode().unwrap()).unwrap(), resp);
    }

    #[test]
    fn test_specific_err_preferred() {
        // ---
        let raw = br#"{"jsonrpc":"2.0","id":4,"error":{"code":-32000,"message":"Server error","specific_err":"port 0 is not owned by you"}}"#;
        let err = Response::decode(raw).unwrap().into_result().unwrap_err();

        let remote = err.remote().unwrap();
        assert_eq!(remote.code, -32000);
        assert_eq!(remote.message, "port 0 is not owned by you");
    }

    #[test]
    fn test_plain_error_message() {
        // ---
        let raw = br#"{"jsonrpc":"2.0","id":4,"error":{"code":-32601,"message":"Method not found"}}"#;
        let err = Response::decode(raw).unwrap().into_result().unwrap_err();
        assert_eq!(err.remote().unwrap().message, "Method not found");
    }

    #[test]
    fn test_validation_failures() {
        // ---
        let cases: [&[u8]; 5] = [
            br#"{"jsonrpc":"1.0","id":1,"result":{}}"#,
            br#"{"id":1,"result":{}}"#,
            br#"{"jsonrpc":"2.0","id":1}"#,
            br#"{"jsonrpc":"2.0","id":1,"result":1,"error":{"code":1,"message":"x"}}"#,
            br#"{"jsonrpc":"2.0","id":"abc","result":{}}"#,
        ];
        for raw in cases {
            assert!(
                matches!(Response::decode(raw), Err(RpcError::Protocol(_))),
                "accepted {}",
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[test]
    fn test_inbound_batch() {
        // ---
        let raw = br#"[
            {"jsonrpc":"2.0","id":1,"result":true},
            {"jsonrpc":"2.0","id":2},
            {"jsonrpc":"2.0","method":"port_changed","params":{"port_id":1}},
            {"hello":"world"}
        ]"#;
        let items = Inbound::decode_all(raw).unwrap();
        assert_eq!(items.len(), 4);

        assert!(matches!(&items[0], Inbound::Response(r) if r.id == id(1)));
        assert!(matches!(&items[1], Inbound::Malformed { id: bad, .. } if *bad == id(2)));
        match &items[2] {
            Inbound::Notification(event) => {
                assert_eq!(event.name, "port_changed");
                assert_eq!(event.data, json!({"port_id": 1}));
            }
            other => panic!("expected notification, got {other:?}"),
        }
        assert!(matches!(&items[3], Inbound::Unattributable(_)));
    }

    #[test]
    fn test_inbound_error_without_id() {
        // ---
        let raw = br#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error"}}"#;
        let items = Inbound::decode_all(raw).unwrap();
        match &items[..] {
            [Inbound::Rejected(error)] => assert_eq!(error.code, -32700),
            other => panic!("expected rejected item, got {other:?}"),
        }

        let items = Inbound::decode_all(br#""not an object""#).unwrap();
        assert!(matches!(&items[..], [Inbound::Unattributable(_)]));
    }

    #[test]
    fn test_inbound_not_json() {
        // ---
        assert!(matches!(
            Inbound::decode_all(b"\x00garbage"),
            Err(RpcError::Protocol(_))
        ));
    }
}
