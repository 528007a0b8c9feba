#![allow(dead_code)]

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use futures::future::BoxFuture;
use mcp_session::{
    AllowAllCapabilities, CapabilityCheck, ServiceError, ServiceRole, Session, SessionMessage,
    SessionOptions, TypedNotification, TypedRequest,
    model::{ErrorData, JsonObject, JsonRpcMessage},
    transport::{
        CloseCallback, DynTransportError, ErrorCallback, MessageCallback, MessageExtras,
        Transport, TransportCallbacks, TransportSendOptions,
    },
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Hook the engine's tracing output up to the test harness. Safe to call
/// from every test; only the first call installs the subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Scripted in-memory transport: records sends, delivers inbound messages
/// through the installed callbacks, and signals close like a real duplex
/// channel would.
pub struct MockTransport {
    callbacks: TransportCallbacks,
    sent: Mutex<Vec<(JsonRpcMessage, TransportSendOptions)>>,
    fail_sends: AtomicBool,
    session_id: Option<String>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        init_tracing();
        Arc::new(Self {
            callbacks: TransportCallbacks::new(),
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            session_id: None,
        })
    }

    pub fn with_session_id(session_id: &str) -> Arc<Self> {
        init_tracing();
        Arc::new(Self {
            callbacks: TransportCallbacks::new(),
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            session_id: Some(session_id.to_owned()),
        })
    }

    /// Make every subsequent send fail.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn deliver(&self, message: JsonRpcMessage) {
        self.callbacks.emit_message(message, None);
    }

    pub fn deliver_with_extras(&self, message: JsonRpcMessage, extras: MessageExtras) {
        self.callbacks.emit_message(message, Some(extras));
    }

    pub fn deliver_value(&self, value: Value) {
        self.deliver(JsonRpcMessage::try_from(value).expect("test message must classify"));
    }

    /// Signal a peer-initiated close.
    pub fn trigger_close(&self) {
        self.callbacks.emit_close();
    }

    /// Surface a transport-level fault.
    pub fn trigger_error(&self, message: &str) {
        let error: DynTransportError = message.to_owned().into();
        self.callbacks.emit_error(error.into());
    }

    pub fn sent(&self) -> Vec<JsonRpcMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(message, _)| message.clone())
            .collect()
    }

    pub fn sent_with_options(&self) -> Vec<(JsonRpcMessage, TransportSendOptions)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_len(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl Transport for MockTransport {
    fn start(&self) -> BoxFuture<'_, Result<(), DynTransportError>> {
        Box::pin(async { Ok(()) })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), DynTransportError>> {
        Box::pin(async {
            // a graceful close signals onclose, as real transports do
            self.callbacks.emit_close();
            Ok(())
        })
    }

    fn send(
        &self,
        message: JsonRpcMessage,
        options: TransportSendOptions,
    ) -> BoxFuture<'_, Result<(), DynTransportError>> {
        Box::pin(async move {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err("mock send failure".into());
            }
            self.sent.lock().unwrap().push((message, options));
            Ok(())
        })
    }

    fn on_message(&self) -> Option<MessageCallback> {
        self.callbacks.on_message()
    }

    fn set_on_message(&self, callback: Option<MessageCallback>) {
        self.callbacks.set_on_message(callback);
    }

    fn on_close(&self) -> Option<CloseCallback> {
        self.callbacks.on_close()
    }

    fn set_on_close(&self, callback: Option<CloseCallback>) {
        self.callbacks.set_on_close(callback);
    }

    fn on_error(&self) -> Option<ErrorCallback> {
        self.callbacks.on_error()
    }

    fn set_on_error(&self, callback: Option<ErrorCallback>) {
        self.callbacks.set_on_error(callback);
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.clone()
    }
}

/// The message family used by the engine tests: raw method + params.
#[derive(Debug, Clone, Serialize)]
pub struct TestMessage {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<JsonObject>,
}

impl TestMessage {
    pub fn new(method: &str) -> Self {
        Self {
            method: method.to_owned(),
            params: None,
        }
    }

    pub fn with_params(method: &str, params: Value) -> Self {
        Self {
            method: method.to_owned(),
            params: params.as_object().cloned(),
        }
    }
}

impl SessionMessage for TestMessage {
    fn method(&self) -> &str {
        &self.method
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoleTest;

impl ServiceRole for RoleTest {
    type Req = TestMessage;
    type Not = TestMessage;
    type Resp = Value;
}

#[derive(Debug, Deserialize)]
pub struct EchoRequest {
    #[serde(default)]
    pub payload: Value,
}

impl TypedRequest for EchoRequest {
    const METHOD: &'static str = "test/echo";
    type Output = Value;
}

#[derive(Debug, Deserialize)]
pub struct EventNotification {
    #[serde(default)]
    pub label: String,
}

impl TypedNotification for EventNotification {
    const METHOD: &'static str = "test/event";
}

/// Gate that refuses every method, for strict-capability tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAllCapabilities;

impl CapabilityCheck for DenyAllCapabilities {
    fn assert_capability_for_method(&self, method: &str) -> Result<(), ErrorData> {
        Err(ErrorData::invalid_request(
            format!("peer does not support {method}"),
            None,
        ))
    }

    fn assert_notification_capability(&self, method: &str) -> Result<(), ErrorData> {
        Err(ErrorData::invalid_request(
            format!("peer does not support {method}"),
            None,
        ))
    }

    fn assert_request_handler_capability(&self, method: &str) -> Result<(), ErrorData> {
        Err(ErrorData::invalid_request(
            format!("cannot serve {method}"),
            None,
        ))
    }
}

pub fn session() -> Session<RoleTest> {
    session_with(SessionOptions::default())
}

pub fn session_with(options: SessionOptions) -> Session<RoleTest> {
    init_tracing();
    Session::new(Arc::new(AllowAllCapabilities), options)
}

pub async fn connected() -> (Session<RoleTest>, Arc<MockTransport>) {
    let session = session();
    let transport = MockTransport::new();
    session.connect(transport.clone()).await.unwrap();
    (session, transport)
}

/// Collects errors broadcast through the session's `on_error` observer.
pub fn collect_errors(session: &Session<RoleTest>) -> Arc<Mutex<Vec<ServiceError>>> {
    let errors: Arc<Mutex<Vec<ServiceError>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    session.set_on_error(move |error| {
        sink.lock().unwrap().push(error);
    });
    errors
}

/// Let spawned engine tasks (dispatch, debounce flushes) run to quiescence.
pub async fn flush() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
