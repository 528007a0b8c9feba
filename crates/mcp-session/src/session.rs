//! The session engine: request/response correlation, the handler registry,
//! timeouts and cancellation, progress routing, and notification
//! debouncing over a single attached transport.
//!
//! A [`Session`] owns at most one transport at a time and assumes it is
//! the sole driver while attached. All bookkeeping lives behind an `Arc`,
//! so the handle is cheap to clone into handlers and background tasks.

mod handler;

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use futures::{FutureExt, future::BoxFuture};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tokio::{sync::oneshot, task::JoinHandle, time::Instant};

pub use handler::{RequestHandlerExtra, TypedNotification, TypedRequest};
use handler::{BoxNotificationHandler, BoxRequestHandler};

use crate::{
    cancellation::CancellationHandle,
    error::ServiceError,
    model::{
        CancelledNotificationParam, ErrorData, JsonObject, JsonRpcError, JsonRpcMessage,
        JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, META_FIELD, METHOD_CANCELLED,
        METHOD_PING, METHOD_PROGRESS, PROGRESS_TOKEN_FIELD, Progress, ProgressNotificationParam,
        RequestId,
    },
    transport::{
        MessageExtras, ResumptionTokenCallback, Transport, TransportSendOptions,
    },
};

/// Applied to a request when the caller does not pick a timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Marker type tying together the three outbound message families of one
/// side of the protocol.
pub trait ServiceRole: std::fmt::Debug + Send + Sync + Clone + Copy + Default + 'static {
    /// Requests this side may send.
    type Req: SessionMessage;
    /// Notifications this side may send.
    type Not: SessionMessage;
    /// Results this side's request handlers produce.
    type Resp: Serialize + Send + Sync + 'static;
}

/// An outbound message: serializes to a `{method, params?}` body and
/// exposes its method literal for capability checks and debouncing.
pub trait SessionMessage: Serialize + Send + Sync + 'static {
    fn method(&self) -> &str;
}

/// Capability gates supplied by the specializing client or server layer.
///
/// The engine consults these at the points where a method crosses the
/// session boundary; failures propagate to the caller that triggered the
/// check and nothing is put on the wire.
pub trait CapabilityCheck: Send + Sync + 'static {
    /// May we send a request with this method right now?
    fn assert_capability_for_method(&self, method: &str) -> Result<(), ErrorData>;
    /// May we emit a notification with this method?
    fn assert_notification_capability(&self, method: &str) -> Result<(), ErrorData>;
    /// May we serve inbound requests with this method?
    fn assert_request_handler_capability(&self, method: &str) -> Result<(), ErrorData>;
}

/// A [`CapabilityCheck`] that allows everything. Useful for tests and for
/// peers that do not negotiate capabilities.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllCapabilities;

impl CapabilityCheck for AllowAllCapabilities {
    fn assert_capability_for_method(&self, _method: &str) -> Result<(), ErrorData> {
        Ok(())
    }
    fn assert_notification_capability(&self, _method: &str) -> Result<(), ErrorData> {
        Ok(())
    }
    fn assert_request_handler_capability(&self, _method: &str) -> Result<(), ErrorData> {
        Ok(())
    }
}

/// Allocates session-local request ids, monotonically from zero.
#[derive(Debug, Default)]
pub struct AtomicU32RequestIdProvider {
    id: AtomicU32,
}

impl AtomicU32RequestIdProvider {
    pub fn next_request_id(&self) -> u32 {
        self.id.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Gate outbound requests on [`CapabilityCheck::assert_capability_for_method`].
    pub enforce_strict_capabilities: bool,
    /// Notification methods whose param-less sends are coalesced per
    /// scheduling tick.
    pub debounced_notification_methods: Vec<String>,
}

impl SessionOptions {
    pub fn enforce_strict_capabilities(mut self) -> Self {
        self.enforce_strict_capabilities = true;
        self
    }

    pub fn debounce_notification(mut self, method: impl Into<String>) -> Self {
        self.debounced_notification_methods.push(method.into());
        self
    }
}

/// Callback observing `notifications/progress` for one outbound request.
pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// Per-call options of [`Session::request`].
#[derive(Clone, Default)]
pub struct RequestOptions {
    /// Tripping this abandons the request: the engine tells the peer and
    /// fails the caller with the signal's reason.
    pub signal: Option<CancellationHandle>,
    /// Per-call timeout; [`DEFAULT_REQUEST_TIMEOUT`] when absent.
    pub timeout: Option<Duration>,
    /// Hard ceiling measured from the send, regardless of progress resets.
    pub max_total_timeout: Option<Duration>,
    /// Restart the per-call timer whenever the peer reports progress.
    pub reset_timeout_on_progress: bool,
    /// Receives the peer's progress events for this request. Registering
    /// it embeds the progress token in `params._meta`.
    pub on_progress: Option<ProgressCallback>,
    pub related_request_id: Option<RequestId>,
    pub resumption_token: Option<String>,
    pub on_resumption_token: Option<ResumptionTokenCallback>,
}

impl RequestOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_total_timeout(mut self, ceiling: Duration) -> Self {
        self.max_total_timeout = Some(ceiling);
        self
    }

    pub fn reset_timeout_on_progress(mut self) -> Self {
        self.reset_timeout_on_progress = true;
        self
    }

    pub fn with_signal(mut self, signal: CancellationHandle) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn on_progress(mut self, callback: impl Fn(Progress) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }
}

/// Per-call options of [`Session::notification`].
#[derive(Debug, Clone, Default)]
pub struct NotificationOptions {
    /// Relates the notification to an in-flight inbound request so the
    /// transport can route it onto that request's stream. Relating a
    /// notification makes it ineligible for debouncing.
    pub related_request_id: Option<RequestId>,
}

/// An in-flight request we sent: the completion handle and the forwarding
/// hints reused when the request has to be cancelled on the wire.
struct OutboundRecord {
    completer: oneshot::Sender<Result<JsonRpcResponse, ServiceError>>,
    forward: TransportSendOptions,
}

/// Timer state paired 1:1 with an [`OutboundRecord`].
struct TimeoutRecord {
    started_at: Instant,
    timeout: Duration,
    max_total_timeout: Option<Duration>,
    reset_on_progress: bool,
    timer: JoinHandle<()>,
}

struct SessionInner<R: ServiceRole> {
    capabilities: Arc<dyn CapabilityCheck>,
    options: SessionOptions,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    request_id: AtomicU32RequestIdProvider,
    outbound: Mutex<HashMap<u32, OutboundRecord>>,
    progress_handlers: Mutex<HashMap<u32, ProgressCallback>>,
    timeouts: Mutex<HashMap<u32, TimeoutRecord>>,
    inbound: Mutex<HashMap<RequestId, CancellationHandle>>,
    request_handlers: Mutex<HashMap<String, BoxRequestHandler<R>>>,
    notification_handlers: Mutex<HashMap<String, BoxNotificationHandler>>,
    fallback_request_handler: Mutex<Option<BoxRequestHandler<R>>>,
    fallback_notification_handler: Mutex<Option<BoxNotificationHandler>>,
    pending_debounced: Mutex<HashSet<String>>,
    on_close: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    on_error: Mutex<Option<Arc<dyn Fn(ServiceError) + Send + Sync>>>,
}

/// The session engine. Cheap to clone; all clones share the same state.
pub struct Session<R: ServiceRole> {
    inner: Arc<SessionInner<R>>,
}

impl<R: ServiceRole> Clone for Session<R> {
    fn clone(&self) -> Self {
        Session {
            inner: self.inner.clone(),
        }
    }
}

impl<R: ServiceRole> std::fmt::Debug for Session<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("connected", &lock(&self.inner.transport).is_some())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Serialize an outbound message family value and pull out its `params`
/// object. The family serde shape is `{method, params?}`.
fn message_body<T: Serialize>(message: &T, method: &str) -> Result<Option<JsonObject>, ServiceError> {
    let value = serde_json::to_value(message).map_err(|error| {
        ServiceError::McpError(ErrorData::internal_error(
            format!("failed to encode {method} message: {error}"),
            None,
        ))
    })?;
    let Value::Object(mut body) = value else {
        return Err(ServiceError::McpError(ErrorData::internal_error(
            format!("{method} message body must be a JSON object"),
            None,
        )));
    };
    match body.remove("params") {
        Some(Value::Object(params)) => Ok(Some(params)),
        Some(Value::Null) | None => Ok(None),
        Some(_) => Err(ServiceError::McpError(ErrorData::internal_error(
            format!("{method} params must be a JSON object"),
            None,
        ))),
    }
}

/// Embed `params._meta.progressToken = id`, preserving other `_meta`
/// entries the caller put there.
fn set_progress_token(params: &mut Option<JsonObject>, id: u32) {
    let params = params.get_or_insert_with(JsonObject::default);
    match params.get_mut(META_FIELD) {
        Some(Value::Object(meta)) => {
            meta.insert(PROGRESS_TOKEN_FIELD.to_owned(), Value::from(id));
        }
        _ => {
            let mut meta = JsonObject::default();
            meta.insert(PROGRESS_TOKEN_FIELD.to_owned(), Value::from(id));
            params.insert(META_FIELD.to_owned(), Value::Object(meta));
        }
    }
}

fn params_object<T: Serialize>(value: &T) -> Option<JsonObject> {
    match serde_json::to_value(value) {
        Ok(Value::Object(params)) => Some(params),
        _ => None,
    }
}

impl<R: ServiceRole> Session<R> {
    pub fn new(capabilities: Arc<dyn CapabilityCheck>, options: SessionOptions) -> Self {
        Session {
            inner: Arc::new(SessionInner {
                capabilities,
                options,
                transport: Mutex::new(None),
                request_id: AtomicU32RequestIdProvider::default(),
                outbound: Mutex::new(HashMap::new()),
                progress_handlers: Mutex::new(HashMap::new()),
                timeouts: Mutex::new(HashMap::new()),
                inbound: Mutex::new(HashMap::new()),
                request_handlers: Mutex::new(HashMap::new()),
                notification_handlers: Mutex::new(HashMap::new()),
                fallback_request_handler: Mutex::new(None),
                fallback_notification_handler: Mutex::new(None),
                pending_debounced: Mutex::new(HashSet::new()),
                on_close: Mutex::new(None),
                on_error: Mutex::new(None),
            }),
        }
    }

    /// Attach a transport and start it.
    ///
    /// Callbacks already installed on the transport keep running: the
    /// engine wraps them so the prior observer fires before its own
    /// handling. Once attached, the engine assumes it is the transport's
    /// only driver.
    pub async fn connect(&self, transport: Arc<dyn Transport>) -> Result<(), ServiceError> {
        let weak = Arc::downgrade(&self.inner);
        {
            let prev = transport.on_message();
            let weak = weak.clone();
            transport.set_on_message(Some(Arc::new(move |message, extras| {
                if let Some(prev) = &prev {
                    prev(message.clone(), extras.clone());
                }
                if let Some(inner) = weak.upgrade() {
                    SessionInner::handle_message(&inner, message, extras);
                }
            })));
        }
        {
            let prev = transport.on_close();
            let weak = weak.clone();
            transport.set_on_close(Some(Arc::new(move || {
                if let Some(prev) = &prev {
                    prev();
                }
                if let Some(inner) = weak.upgrade() {
                    inner.handle_transport_close();
                }
            })));
        }
        {
            let prev = transport.on_error();
            let weak = weak.clone();
            transport.set_on_error(Some(Arc::new(move |error| {
                if let Some(prev) = &prev {
                    prev(error.clone());
                }
                if let Some(inner) = weak.upgrade() {
                    inner.report_error(ServiceError::Transport {
                        error,
                        context: "transport".into(),
                    });
                }
            })));
        }
        *lock(&self.inner.transport) = Some(transport.clone());
        transport
            .start()
            .await
            .map_err(|error| ServiceError::transport(error, "start transport"))
    }

    /// Ask the transport to close. The close cascade itself runs off the
    /// transport's close signal, so it also covers closes the peer
    /// initiated.
    pub async fn close(&self) -> Result<(), ServiceError> {
        let transport = lock(&self.inner.transport).clone();
        if let Some(transport) = transport {
            transport
                .close()
                .await
                .map_err(|error| ServiceError::transport(error, "close transport"))?;
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.transport).is_some()
    }

    /// Send a request and wait for its typed result.
    ///
    /// Exactly one terminal outcome is delivered: the validated result, a
    /// peer error, a timeout, the caller's cancellation, or connection
    /// close.
    pub async fn request<U: DeserializeOwned>(
        &self,
        request: R::Req,
        options: RequestOptions,
    ) -> Result<U, ServiceError> {
        let inner = &self.inner;
        let transport = lock(&inner.transport)
            .clone()
            .ok_or(ServiceError::NotConnected)?;
        if inner.options.enforce_strict_capabilities {
            inner
                .capabilities
                .assert_capability_for_method(request.method())?;
        }
        if let Some(signal) = &options.signal {
            if signal.is_cancelled() {
                return Err(ServiceError::Cancelled {
                    reason: signal.reason(),
                });
            }
        }

        let method = request.method().to_owned();
        let mut params = message_body(&request, &method)?;
        let id = inner.request_id.next_request_id();

        if let Some(on_progress) = options.on_progress.clone() {
            lock(&inner.progress_handlers).insert(id, on_progress);
            set_progress_token(&mut params, id);
        }

        let forward = TransportSendOptions {
            related_request_id: options.related_request_id.clone(),
            resumption_token: options.resumption_token.clone(),
            on_resumption_token: options.on_resumption_token.clone(),
        };
        let (completer, mut receiver) = oneshot::channel();
        lock(&inner.outbound).insert(
            id,
            OutboundRecord {
                completer,
                forward: forward.clone(),
            },
        );

        let timeout = options.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        SessionInner::install_timeout(
            inner,
            id,
            timeout,
            options.max_total_timeout,
            options.reset_timeout_on_progress,
        );

        tracing::debug!(%method, id, "sending request");
        let message = JsonRpcMessage::request(method, RequestId::Number(id), params);
        if let Err(error) = transport.send(message, forward).await {
            inner.remove_outbound(id);
            return Err(ServiceError::transport(error, "send request"));
        }

        let outcome = match &options.signal {
            Some(signal) => {
                tokio::select! {
                    outcome = &mut receiver => outcome,
                    _ = signal.cancelled() => {
                        let reason = signal.reason();
                        inner
                            .fail_outbound(id, ServiceError::Cancelled { reason })
                            .await;
                        (&mut receiver).await
                    }
                }
            }
            None => receiver.await,
        };
        // The completer only disappears without firing when the whole
        // session state is dropped mid-flight.
        let response = outcome
            .map_err(|_| ServiceError::McpError(ErrorData::connection_closed()))??;
        serde_json::from_value(response.result).map_err(ServiceError::InvalidResult)
    }

    /// Send a notification.
    ///
    /// For methods listed in
    /// [`SessionOptions::debounced_notification_methods`], a param-less,
    /// unrelated notification resolves immediately and the actual send is
    /// coalesced with any others of the same method scheduled in the same
    /// tick.
    pub async fn notification(
        &self,
        notification: R::Not,
        options: NotificationOptions,
    ) -> Result<(), ServiceError> {
        let inner = &self.inner;
        let method = notification.method().to_owned();
        inner.capabilities.assert_notification_capability(&method)?;
        if lock(&inner.transport).is_none() {
            return Err(ServiceError::NotConnected);
        }

        let params = message_body(&notification, &method)?;
        let debounced = inner
            .options
            .debounced_notification_methods
            .iter()
            .any(|candidate| candidate == &method);
        if debounced && params.is_none() && options.related_request_id.is_none() {
            {
                let mut pending = lock(&inner.pending_debounced);
                if !pending.insert(method.clone()) {
                    // a flush for this method is already scheduled
                    return Ok(());
                }
            }
            let inner = inner.clone();
            tokio::spawn(async move {
                lock(&inner.pending_debounced).remove(&method);
                // the transport may have detached since scheduling; a
                // notification after graceful close is dropped silently
                let Some(transport) = lock(&inner.transport).clone() else {
                    return;
                };
                let message = JsonRpcMessage::notification(method, None);
                if let Err(error) = transport
                    .send(message, TransportSendOptions::default())
                    .await
                {
                    inner.report_error(ServiceError::transport(
                        error,
                        "send debounced notification",
                    ));
                }
            });
            return Ok(());
        }

        let transport = lock(&inner.transport)
            .clone()
            .ok_or(ServiceError::NotConnected)?;
        let message = JsonRpcMessage::notification(method, params);
        let send_options = TransportSendOptions {
            related_request_id: options.related_request_id,
            ..Default::default()
        };
        transport
            .send(message, send_options)
            .await
            .map_err(|error| ServiceError::transport(error, "send notification"))
    }

    /// Install the handler for an inbound request method, replacing any
    /// previous one. Parameter validation runs before the handler; a
    /// parse failure is answered as an invalid-params error.
    pub fn set_request_handler<T, F, Fut>(&self, handler: F) -> Result<(), ErrorData>
    where
        T: TypedRequest,
        T::Output: Into<R::Resp>,
        F: Fn(T, RequestHandlerExtra<R>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T::Output, ErrorData>> + Send + 'static,
    {
        self.inner
            .capabilities
            .assert_request_handler_capability(T::METHOD)?;
        let handler = Arc::new(handler);
        let trampoline: BoxRequestHandler<R> = Arc::new(move |request: JsonRpcRequest, extra| {
            let handler = handler.clone();
            let fut: BoxFuture<'static, Result<R::Resp, ErrorData>> = Box::pin(async move {
                let params = request
                    .params
                    .map(Value::Object)
                    .unwrap_or_else(|| Value::Object(JsonObject::default()));
                let parsed: T = serde_json::from_value(params).map_err(|error| {
                    ErrorData::invalid_params(
                        format!("invalid parameters for {}: {error}", T::METHOD),
                        None,
                    )
                })?;
                handler(parsed, extra).await.map(Into::into)
            });
            fut
        });
        lock(&self.inner.request_handlers).insert(T::METHOD.to_owned(), trampoline);
        Ok(())
    }

    pub fn remove_request_handler(&self, method: &str) {
        lock(&self.inner.request_handlers).remove(method);
    }

    /// Fails when a handler for `method` is already installed. Used by
    /// layers that auto-install canonical handlers and must not clobber
    /// user ones.
    pub fn assert_can_set_request_handler(&self, method: &str) -> Result<(), ErrorData> {
        if lock(&self.inner.request_handlers).contains_key(method) {
            return Err(ErrorData::invalid_request(
                format!("A request handler for {method} already exists, which would be overridden"),
                None,
            ));
        }
        Ok(())
    }

    /// Install the handler for an inbound notification method, replacing
    /// any previous one.
    pub fn set_notification_handler<T, F, Fut>(&self, handler: F)
    where
        T: TypedNotification,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ErrorData>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let trampoline: BoxNotificationHandler =
            Arc::new(move |notification: JsonRpcNotification| {
                let handler = handler.clone();
                let fut: BoxFuture<'static, Result<(), ErrorData>> = Box::pin(async move {
                    let params = notification
                        .params
                        .map(Value::Object)
                        .unwrap_or_else(|| Value::Object(JsonObject::default()));
                    let parsed: T = serde_json::from_value(params).map_err(|error| {
                        ErrorData::invalid_params(
                            format!("invalid parameters for {}: {error}", T::METHOD),
                            None,
                        )
                    })?;
                    handler(parsed).await
                });
                fut
            });
        lock(&self.inner.notification_handlers).insert(T::METHOD.to_owned(), trampoline);
    }

    pub fn remove_notification_handler(&self, method: &str) {
        lock(&self.inner.notification_handlers).remove(method);
    }

    /// Handler for inbound requests no registered method matches.
    pub fn set_fallback_request_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(JsonRpcRequest, RequestHandlerExtra<R>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R::Resp, ErrorData>> + Send + 'static,
    {
        let trampoline: BoxRequestHandler<R> = Arc::new(move |request, extra| {
            let fut: BoxFuture<'static, Result<R::Resp, ErrorData>> =
                Box::pin(handler(request, extra));
            fut
        });
        *lock(&self.inner.fallback_request_handler) = Some(trampoline);
    }

    /// Handler for inbound notifications no registered method matches.
    pub fn set_fallback_notification_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(JsonRpcNotification) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ErrorData>> + Send + 'static,
    {
        let trampoline: BoxNotificationHandler = Arc::new(move |notification| {
            let fut: BoxFuture<'static, Result<(), ErrorData>> = Box::pin(handler(notification));
            fut
        });
        *lock(&self.inner.fallback_notification_handler) = Some(trampoline);
    }

    /// Observer fired when the transport closes, before in-flight requests
    /// are failed.
    pub fn set_on_close(&self, callback: impl Fn() + Send + Sync + 'static) {
        *lock(&self.inner.on_close) = Some(Arc::new(callback));
    }

    /// Observer for errors that belong to no specific caller: transport
    /// faults, unroutable messages, notification handler failures.
    pub fn set_on_error(&self, callback: impl Fn(ServiceError) + Send + Sync + 'static) {
        *lock(&self.inner.on_error) = Some(Arc::new(callback));
    }
}

impl<R: ServiceRole> SessionInner<R> {
    /// Dispatcher entry: classify and route one delivered message.
    fn handle_message(this: &Arc<Self>, message: JsonRpcMessage, extras: Option<MessageExtras>) {
        match message {
            JsonRpcMessage::Response(response) => this.handle_response(Ok(response)),
            JsonRpcMessage::Error(error) => this.handle_response(Err(error)),
            JsonRpcMessage::Request(request) => {
                let inner = this.clone();
                tokio::spawn(async move { inner.handle_request(request, extras).await });
            }
            JsonRpcMessage::Notification(notification) => {
                let inner = this.clone();
                tokio::spawn(async move { inner.handle_notification(notification).await });
            }
        }
    }

    fn handle_response(&self, message: Result<JsonRpcResponse, JsonRpcError>) {
        let wire_id = match &message {
            Ok(response) => response.id.clone(),
            Err(error) => error.id.clone(),
        };
        let Some(id) = wire_id.as_number() else {
            self.report_error(ServiceError::UnknownRequestId(wire_id));
            return;
        };
        let Some(record) = self.remove_outbound(id) else {
            self.report_error(ServiceError::UnknownRequestId(wire_id));
            return;
        };
        tracing::debug!(id, ok = message.is_ok(), "routing response");
        let outcome = match message {
            Ok(response) => Ok(response),
            Err(error) => Err(ServiceError::McpError(error.error)),
        };
        let _ = record.completer.send(outcome);
    }

    async fn handle_request(self: Arc<Self>, request: JsonRpcRequest, extras: Option<MessageExtras>) {
        // Responses go back through the transport serving this request,
        // even if the session is re-attached while the handler runs.
        let transport = lock(&self.transport).clone();
        let request_id = request.id.clone();

        if request.method == METHOD_PING {
            let message =
                JsonRpcMessage::response(Value::Object(JsonObject::default()), request_id.clone());
            self.respond_via(transport.as_ref(), message, request_id, "send pong")
                .await;
            return;
        }

        let handler = lock(&self.request_handlers)
            .get(&request.method)
            .cloned()
            .or_else(|| lock(&self.fallback_request_handler).clone());
        let Some(handler) = handler else {
            tracing::debug!(method = %request.method, "no handler for inbound request");
            let message = JsonRpcMessage::error(ErrorData::method_not_found(), request_id.clone());
            self.respond_via(
                transport.as_ref(),
                message,
                request_id,
                "send method-not-found response",
            )
            .await;
            return;
        };

        let signal = CancellationHandle::new();
        lock(&self.inbound).insert(request_id.clone(), signal.clone());

        let extras = extras.unwrap_or_default();
        let meta = request.params.as_ref().and_then(|params| {
            match params.get(META_FIELD) {
                Some(Value::Object(meta)) => Some(meta.clone()),
                _ => None,
            }
        });
        let extra = RequestHandlerExtra {
            signal: signal.clone(),
            request_id: request_id.clone(),
            session_id: transport.as_ref().and_then(|t| t.session_id()),
            meta,
            auth_info: extras.auth_info,
            request_info: extras.request_info,
            session: Session {
                inner: self.clone(),
            },
        };

        let outcome = AssertUnwindSafe(handler(request, extra))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(ErrorData::internal_error("request handler panicked", None))
            });
        let outcome = outcome.and_then(|result| {
            serde_json::to_value(result).map_err(|error| {
                ErrorData::internal_error(format!("failed to encode response: {error}"), None)
            })
        });

        if signal.is_cancelled() {
            // the peer no longer expects an answer
            tracing::debug!(id = %request_id, "suppressing response of a cancelled request");
        } else {
            let message = match outcome {
                Ok(result) => JsonRpcMessage::response(result, request_id.clone()),
                Err(error) => JsonRpcMessage::error(error, request_id.clone()),
            };
            self.respond_via(transport.as_ref(), message, request_id.clone(), "send response")
                .await;
        }
        lock(&self.inbound).remove(&request_id);
    }

    async fn handle_notification(self: Arc<Self>, notification: JsonRpcNotification) {
        match notification.method.as_str() {
            METHOD_CANCELLED => self.handle_cancelled_notification(notification),
            METHOD_PROGRESS => Self::handle_progress_notification(&self, notification).await,
            _ => {
                let handler = lock(&self.notification_handlers)
                    .get(&notification.method)
                    .cloned()
                    .or_else(|| lock(&self.fallback_notification_handler).clone());
                let Some(handler) = handler else {
                    // notifications are fire-and-forget; nothing to answer
                    tracing::debug!(method = %notification.method, "ignoring unhandled notification");
                    return;
                };
                let method = notification.method.clone();
                let outcome = AssertUnwindSafe(handler(notification)).catch_unwind().await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        self.report_error(ServiceError::NotificationHandler { method, error });
                    }
                    Err(_) => self.report_error(ServiceError::NotificationHandler {
                        method,
                        error: ErrorData::internal_error("notification handler panicked", None),
                    }),
                }
            }
        }
    }

    fn handle_cancelled_notification(&self, notification: JsonRpcNotification) {
        let params = notification
            .params
            .map(Value::Object)
            .unwrap_or_else(|| Value::Object(JsonObject::default()));
        match serde_json::from_value::<CancelledNotificationParam>(params) {
            Ok(param) => {
                let handle = lock(&self.inbound).remove(&param.request_id);
                if let Some(handle) = handle {
                    tracing::debug!(id = %param.request_id, "peer cancelled in-flight request");
                    handle.cancel(param.reason);
                }
                // an unknown id usually means the request just completed
            }
            Err(error) => self.report_error(ServiceError::McpError(ErrorData::invalid_params(
                format!("malformed cancellation notification: {error}"),
                None,
            ))),
        }
    }

    async fn handle_progress_notification(this: &Arc<Self>, notification: JsonRpcNotification) {
        let params = notification
            .params
            .map(Value::Object)
            .unwrap_or_else(|| Value::Object(JsonObject::default()));
        let param = match serde_json::from_value::<ProgressNotificationParam>(params) {
            Ok(param) => param,
            Err(error) => {
                this.report_error(ServiceError::McpError(ErrorData::invalid_params(
                    format!("malformed progress notification: {error}"),
                    None,
                )));
                return;
            }
        };
        let Some(id) = param.progress_token.0.as_number() else {
            this.report_error(ServiceError::UnknownProgressToken(param.progress_token));
            return;
        };
        let Some(handler) = lock(&this.progress_handlers).get(&id).cloned() else {
            this.report_error(ServiceError::UnknownProgressToken(param.progress_token));
            return;
        };
        let awaiting_response = lock(&this.outbound).contains_key(&id);
        let wants_reset = awaiting_response
            && lock(&this.timeouts)
                .get(&id)
                .map(|record| record.reset_on_progress)
                .unwrap_or(false);
        if wants_reset {
            if let Err(error) = Self::reset_timeout(this, id) {
                // ceiling breached: the request fails now, and this
                // progress event is not delivered
                this.fail_outbound(id, ServiceError::McpError(error)).await;
                return;
            }
        }
        handler(param.progress);
    }

    /// The close cascade. Snapshot the outbound table first so no
    /// completer can observe a half-torn-down session, notify the user,
    /// then fail everything that was in flight.
    fn handle_transport_close(&self) {
        tracing::debug!("transport closed, running close cascade");
        let outbound = std::mem::take(&mut *lock(&self.outbound));
        lock(&self.progress_handlers).clear();
        for (_, record) in lock(&self.timeouts).drain() {
            record.timer.abort();
        }
        lock(&self.pending_debounced).clear();
        *lock(&self.transport) = None;
        let on_close = lock(&self.on_close).clone();
        if let Some(on_close) = on_close {
            on_close();
        }
        for (_, record) in outbound {
            let _ = record
                .completer
                .send(Err(ServiceError::McpError(ErrorData::connection_closed())));
        }
    }

    /// Remove every record of an outbound request, cancelling its timer.
    fn remove_outbound(&self, id: u32) -> Option<OutboundRecord> {
        let record = lock(&self.outbound).remove(&id);
        lock(&self.progress_handlers).remove(&id);
        if let Some(timeout) = lock(&self.timeouts).remove(&id) {
            timeout.timer.abort();
        }
        record
    }

    /// The cancel path: tear the request down, tell the peer, fail the
    /// caller with `reason`. Used for caller cancellation and timeouts.
    async fn fail_outbound(&self, id: u32, reason: ServiceError) {
        let Some(record) = self.remove_outbound(id) else {
            return;
        };
        let transport = lock(&self.transport).clone();
        if let Some(transport) = transport {
            let params = params_object(&CancelledNotificationParam {
                request_id: RequestId::Number(id),
                reason: Some(reason.to_string()),
            });
            let message = JsonRpcMessage::notification(METHOD_CANCELLED, params);
            // best effort: a failure here surfaces to the observer, never
            // to the request's caller
            if let Err(error) = transport.send(message, record.forward.clone()).await {
                self.report_error(ServiceError::transport(
                    error,
                    "send cancellation notification",
                ));
            }
        }
        let _ = record.completer.send(Err(reason));
    }

    fn install_timeout(
        this: &Arc<Self>,
        id: u32,
        timeout: Duration,
        max_total_timeout: Option<Duration>,
        reset_on_progress: bool,
    ) {
        let timer = Self::spawn_timer(this, id, timeout);
        lock(&this.timeouts).insert(
            id,
            TimeoutRecord {
                started_at: Instant::now(),
                timeout,
                max_total_timeout,
                reset_on_progress,
                timer,
            },
        );
    }

    fn spawn_timer(this: &Arc<Self>, id: u32, timeout: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(this);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let error = ErrorData::request_timeout(
                "Request timed out",
                Some(json!({ "timeout": timeout.as_millis() as u64 })),
            );
            inner.fail_outbound(id, ServiceError::McpError(error)).await;
        })
    }

    /// Restart the per-call timer after a progress event. The ceiling is
    /// measured from the original send, so `started_at` never moves; once
    /// it is exceeded the whole record is dropped and the error goes to
    /// the request's completer.
    fn reset_timeout(this: &Arc<Self>, id: u32) -> Result<(), ErrorData> {
        let mut timeouts = lock(&this.timeouts);
        let Some(record) = timeouts.get_mut(&id) else {
            return Ok(());
        };
        if let Some(max_total) = record.max_total_timeout {
            let elapsed = record.started_at.elapsed();
            if elapsed >= max_total {
                if let Some(record) = timeouts.remove(&id) {
                    record.timer.abort();
                }
                return Err(ErrorData::request_timeout(
                    "Maximum total timeout exceeded",
                    Some(json!({
                        "maxTotalTimeout": max_total.as_millis() as u64,
                        "totalElapsed": elapsed.as_millis() as u64,
                    })),
                ));
            }
        }
        record.timer.abort();
        record.timer = Self::spawn_timer(this, id, record.timeout);
        Ok(())
    }

    async fn respond_via(
        &self,
        transport: Option<&Arc<dyn Transport>>,
        message: JsonRpcMessage,
        related: RequestId,
        context: &'static str,
    ) {
        let Some(transport) = transport else {
            return;
        };
        let options = TransportSendOptions {
            related_request_id: Some(related),
            ..Default::default()
        };
        if let Err(error) = transport.send(message, options).await {
            self.report_error(ServiceError::transport(error, context));
        }
    }

    fn report_error(&self, error: ServiceError) {
        match lock(&self.on_error).clone() {
            Some(on_error) => on_error(error),
            None => tracing::error!(%error, "uncaught session error"),
        }
    }
}
