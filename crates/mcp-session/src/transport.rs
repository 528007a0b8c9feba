//! The contract between the session engine and the message carrier
//! underneath it.
//!
//! A transport is any duplex message channel that can start, close, send,
//! and deliver inbound traffic through assignable callbacks. The engine
//! assumes exclusive ownership of an attached transport, but it chains
//! rather than replaces callbacks that were installed before it attached.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::model::{JsonRpcMessage, RequestId};

/// Error type transports fail with. The engine treats it as opaque.
pub type DynTransportError = Box<dyn std::error::Error + Send + Sync>;

/// Shared form of a transport error, used where an error fans out to more
/// than one observer (callback chains).
pub type SharedTransportError = Arc<dyn std::error::Error + Send + Sync>;

pub type MessageCallback = Arc<dyn Fn(JsonRpcMessage, Option<MessageExtras>) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn() + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(SharedTransportError) + Send + Sync>;
pub type ResumptionTokenCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Hints forwarded with a send, interpreted by transports that support
/// them and ignored by the rest.
#[derive(Clone, Default)]
pub struct TransportSendOptions {
    /// Routes the message to the stream of a related in-flight request.
    pub related_request_id: Option<RequestId>,
    /// Resume an interrupted delivery stream where it left off.
    pub resumption_token: Option<String>,
    /// Observes resumption tokens the transport hands out during delivery.
    pub on_resumption_token: Option<ResumptionTokenCallback>,
}

impl std::fmt::Debug for TransportSendOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSendOptions")
            .field("related_request_id", &self.related_request_id)
            .field("resumption_token", &self.resumption_token)
            .field(
                "on_resumption_token",
                &self.on_resumption_token.as_ref().map(|_| ".."),
            )
            .finish()
    }
}

/// Identity established by an authenticating layer for an inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthInfo {
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

/// Request-level metadata an HTTP layer may attach to an inbound message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestInfo {
    pub headers: HashMap<String, String>,
}

/// Out-of-band annotations accompanying a delivered message.
#[derive(Debug, Clone, Default)]
pub struct MessageExtras {
    pub auth_info: Option<AuthInfo>,
    pub request_info: Option<RequestInfo>,
}

/// A duplex message channel the session can drive.
///
/// Callback slots are readable so an attaching session can wrap whatever
/// was installed before it; implementations only need to store and invoke
/// them, which [`TransportCallbacks`] provides ready-made.
pub trait Transport: Send + Sync {
    fn start(&self) -> BoxFuture<'_, Result<(), DynTransportError>>;

    fn close(&self) -> BoxFuture<'_, Result<(), DynTransportError>>;

    fn send(
        &self,
        message: JsonRpcMessage,
        options: TransportSendOptions,
    ) -> BoxFuture<'_, Result<(), DynTransportError>>;

    fn on_message(&self) -> Option<MessageCallback>;
    fn set_on_message(&self, callback: Option<MessageCallback>);

    fn on_close(&self) -> Option<CloseCallback>;
    fn set_on_close(&self, callback: Option<CloseCallback>);

    fn on_error(&self) -> Option<ErrorCallback>;
    fn set_on_error(&self, callback: Option<ErrorCallback>);

    /// Stable identifier of the underlying connection, when the transport
    /// has one (e.g. the HTTP session id).
    fn session_id(&self) -> Option<String> {
        None
    }
}

/// Storage for the three assignable callback slots of a [`Transport`].
#[derive(Default)]
pub struct TransportCallbacks {
    message: Mutex<Option<MessageCallback>>,
    close: Mutex<Option<CloseCallback>>,
    error: Mutex<Option<ErrorCallback>>,
}

impl TransportCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_message(&self) -> Option<MessageCallback> {
        self.message.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_on_message(&self, callback: Option<MessageCallback>) {
        *self.message.lock().unwrap_or_else(|e| e.into_inner()) = callback;
    }

    pub fn on_close(&self) -> Option<CloseCallback> {
        self.close.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_on_close(&self, callback: Option<CloseCallback>) {
        *self.close.lock().unwrap_or_else(|e| e.into_inner()) = callback;
    }

    pub fn on_error(&self) -> Option<ErrorCallback> {
        self.error.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_on_error(&self, callback: Option<ErrorCallback>) {
        *self.error.lock().unwrap_or_else(|e| e.into_inner()) = callback;
    }

    /// Deliver an inbound message to the installed callback, if any.
    pub fn emit_message(&self, message: JsonRpcMessage, extras: Option<MessageExtras>) {
        if let Some(callback) = self.on_message() {
            callback(message, extras);
        }
    }

    /// Signal that the channel closed.
    pub fn emit_close(&self) {
        if let Some(callback) = self.on_close() {
            callback();
        }
    }

    /// Surface a transport-level error.
    pub fn emit_error(&self, error: SharedTransportError) {
        if let Some(callback) = self.on_error() {
            callback(error);
        }
    }
}

impl std::fmt::Debug for TransportCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportCallbacks").finish_non_exhaustive()
    }
}
