//! Wire-level data types: the JSON-RPC 2.0 envelope, identifiers, and the
//! payload shapes of the reserved protocol methods.

use std::{borrow::Cow, fmt::Display, sync::Arc};

use serde::{Deserialize, Serialize, de};
use serde_json::Value;

/// A JSON object, the parameter/result shape used throughout the protocol.
pub type JsonObject<F = Value> = serde_json::Map<String, F>;

/// Reserved method: liveness check, answered automatically with an empty
/// result.
pub const METHOD_PING: &str = "ping";
/// Reserved method: a peer asks the other side to abandon an in-flight
/// request.
pub const METHOD_CANCELLED: &str = "notifications/cancelled";
/// Reserved method: incremental progress for a request that carried a
/// progress token.
pub const METHOD_PROGRESS: &str = "notifications/progress";

/// Key under `params` that carries protocol metadata.
pub const META_FIELD: &str = "_meta";
/// Key under `params._meta` that carries the progress token.
pub const PROGRESS_TOKEN_FIELD: &str = "progressToken";

/// The `jsonrpc` version marker. Serializes as the literal `"2.0"` and
/// refuses anything else on the way in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonRpcVersion2_0;

impl Serialize for JsonRpcVersion2_0 {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("2.0")
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion2_0 {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let version: Cow<'de, str> = Deserialize::deserialize(deserializer)?;
        if version != "2.0" {
            return Err(de::Error::custom(format!(
                "unsupported JSON-RPC version: {version}"
            )));
        }
        Ok(JsonRpcVersion2_0)
    }
}

/// An id or progress token on the wire: peers may use integers or strings.
///
/// Ids allocated locally are always [`NumberOrString::Number`], assigned
/// monotonically from zero per session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NumberOrString {
    Number(u32),
    String(Arc<str>),
}

impl NumberOrString {
    /// Coerce to a locally-allocated request number.
    ///
    /// String values that round-trip to an integer are accepted; anything
    /// else is treated as unknown by the caller.
    pub fn as_number(&self) -> Option<u32> {
        match self {
            NumberOrString::Number(number) => Some(*number),
            NumberOrString::String(string) => string.parse().ok(),
        }
    }
}

impl Display for NumberOrString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NumberOrString::Number(number) => Display::fmt(number, f),
            NumberOrString::String(string) => Display::fmt(string, f),
        }
    }
}

impl From<u32> for NumberOrString {
    fn from(value: u32) -> Self {
        NumberOrString::Number(value)
    }
}

impl From<String> for NumberOrString {
    fn from(value: String) -> Self {
        NumberOrString::String(value.into())
    }
}

impl From<&str> for NumberOrString {
    fn from(value: &str) -> Self {
        NumberOrString::String(value.into())
    }
}

impl Serialize for NumberOrString {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            NumberOrString::Number(number) => number.serialize(serializer),
            NumberOrString::String(string) => string.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for NumberOrString {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;
        impl de::Visitor<'_> for Visitor {
            type Value = NumberOrString;
            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a number or a string")
            }
            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                u32::try_from(v)
                    .map(NumberOrString::Number)
                    .map_err(|_| E::custom("id out of range"))
            }
            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                u32::try_from(v)
                    .map(NumberOrString::Number)
                    .map_err(|_| E::custom("id out of range"))
            }
            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(NumberOrString::String(v.into()))
            }
        }
        deserializer.deserialize_any(Visitor)
    }
}

/// Identifier of a request on the wire. Inbound ids are whatever the peer
/// sent; outbound ids are session-local integers.
pub type RequestId = NumberOrString;

/// Token a requester embeds under `params._meta.progressToken` so the peer
/// can report progress for that request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProgressToken(pub NumberOrString);

impl Display for ProgressToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// JSON-RPC error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    /// The connection was torn down before the request completed.
    pub const CONNECTION_CLOSED: Self = Self(-32000);
    /// The request exceeded its per-call timeout or total ceiling.
    pub const REQUEST_TIMEOUT: Self = Self(-32001);
    pub const PARSE_ERROR: Self = Self(-32700);
    pub const INVALID_REQUEST: Self = Self(-32600);
    pub const METHOD_NOT_FOUND: Self = Self(-32601);
    pub const INVALID_PARAMS: Self = Self(-32602);
    pub const INTERNAL_ERROR: Self = Self(-32603);
}

/// Error payload of a JSON-RPC error response, also used as the error type
/// request handlers return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: ErrorCode,
    pub message: Cow<'static, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorData {
    pub fn new(
        code: ErrorCode,
        message: impl Into<Cow<'static, str>>,
        data: Option<Value>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }

    pub fn parse_error(message: impl Into<Cow<'static, str>>, data: Option<Value>) -> Self {
        Self::new(ErrorCode::PARSE_ERROR, message, data)
    }

    pub fn invalid_request(message: impl Into<Cow<'static, str>>, data: Option<Value>) -> Self {
        Self::new(ErrorCode::INVALID_REQUEST, message, data)
    }

    pub fn method_not_found() -> Self {
        Self::new(ErrorCode::METHOD_NOT_FOUND, "Method not found", None)
    }

    pub fn invalid_params(message: impl Into<Cow<'static, str>>, data: Option<Value>) -> Self {
        Self::new(ErrorCode::INVALID_PARAMS, message, data)
    }

    pub fn internal_error(message: impl Into<Cow<'static, str>>, data: Option<Value>) -> Self {
        Self::new(ErrorCode::INTERNAL_ERROR, message, data)
    }

    pub fn request_timeout(message: impl Into<Cow<'static, str>>, data: Option<Value>) -> Self {
        Self::new(ErrorCode::REQUEST_TIMEOUT, message, data)
    }

    pub fn connection_closed() -> Self {
        Self::new(ErrorCode::CONNECTION_CLOSED, "Connection closed", None)
    }
}

/// An empty result object, the reply to `ping` and friends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyObject {}

/// Payload of `notifications/cancelled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledNotificationParam {
    pub request_id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Progress fields of a `notifications/progress`, minus the token.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Payload of `notifications/progress`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressNotificationParam {
    pub progress_token: ProgressToken,
    #[serde(flatten)]
    pub progress: Progress,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<JsonObject>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    pub error: ErrorData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: JsonRpcVersion2_0,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<JsonObject>,
}

/// One classified message on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
    Error(JsonRpcError),
}

impl JsonRpcMessage {
    pub fn request(method: impl Into<String>, id: RequestId, params: Option<JsonObject>) -> Self {
        JsonRpcMessage::Request(JsonRpcRequest {
            jsonrpc: JsonRpcVersion2_0,
            id,
            method: method.into(),
            params,
        })
    }

    pub fn response(result: Value, id: RequestId) -> Self {
        JsonRpcMessage::Response(JsonRpcResponse {
            jsonrpc: JsonRpcVersion2_0,
            id,
            result,
        })
    }

    pub fn error(error: ErrorData, id: RequestId) -> Self {
        JsonRpcMessage::Error(JsonRpcError {
            jsonrpc: JsonRpcVersion2_0,
            id,
            error,
        })
    }

    pub fn notification(method: impl Into<String>, params: Option<JsonObject>) -> Self {
        JsonRpcMessage::Notification(JsonRpcNotification {
            jsonrpc: JsonRpcVersion2_0,
            method: method.into(),
            params,
        })
    }

    pub fn into_request(self) -> Option<JsonRpcRequest> {
        match self {
            JsonRpcMessage::Request(request) => Some(request),
            _ => None,
        }
    }

    pub fn into_response(self) -> Option<JsonRpcResponse> {
        match self {
            JsonRpcMessage::Response(response) => Some(response),
            _ => None,
        }
    }

    pub fn into_notification(self) -> Option<JsonRpcNotification> {
        match self {
            JsonRpcMessage::Notification(notification) => Some(notification),
            _ => None,
        }
    }

    pub fn into_error(self) -> Option<JsonRpcError> {
        match self {
            JsonRpcMessage::Error(error) => Some(error),
            _ => None,
        }
    }
}

impl Serialize for JsonRpcMessage {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            JsonRpcMessage::Request(request) => request.serialize(serializer),
            JsonRpcMessage::Response(response) => response.serialize(serializer),
            JsonRpcMessage::Notification(notification) => notification.serialize(serializer),
            JsonRpcMessage::Error(error) => error.serialize(serializer),
        }
    }
}

/// Classification of a raw value into one of the four envelope shapes.
///
/// The order is significant: a response or error (an `id` plus exactly one
/// of `result`/`error`) wins over a request (`id` plus `method`), which
/// wins over a notification (`method`, no `id`). Anything else is rejected
/// with a descriptive error.
impl TryFrom<Value> for JsonRpcMessage {
    type Error = ErrorData;

    fn try_from(value: Value) -> Result<Self, ErrorData> {
        let Some(object) = value.as_object() else {
            return Err(ErrorData::invalid_request(
                "expected a JSON object",
                None,
            ));
        };
        let has_id = object.contains_key("id");
        let has_method = object.contains_key("method");
        let has_result = object.contains_key("result");
        let has_error = object.contains_key("error");

        let parsed = if has_id && (has_result ^ has_error) {
            if has_result {
                serde_json::from_value(value).map(JsonRpcMessage::Response)
            } else {
                serde_json::from_value(value).map(JsonRpcMessage::Error)
            }
        } else if has_id && has_method {
            serde_json::from_value(value).map(JsonRpcMessage::Request)
        } else if has_method {
            serde_json::from_value(value).map(JsonRpcMessage::Notification)
        } else {
            return Err(ErrorData::invalid_request(
                "message matches no JSON-RPC shape",
                None,
            ));
        };
        parsed.map_err(|error| {
            ErrorData::invalid_request(format!("malformed JSON-RPC message: {error}"), None)
        })
    }
}

impl<'de> Deserialize<'de> for JsonRpcMessage {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        JsonRpcMessage::try_from(value).map_err(|error| de::Error::custom(error.message))
    }
}
