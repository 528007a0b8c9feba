//! The typed handler registry: method-literal traits, the boxed trampoline
//! shapes stored in the session tables, and the per-request context handed
//! to inbound request handlers.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Serialize, de::DeserializeOwned};

use super::{NotificationOptions, RequestOptions, ServiceRole, Session};
use crate::{
    ServiceError,
    cancellation::CancellationHandle,
    model::{ErrorData, JsonObject, JsonRpcNotification, JsonRpcRequest, RequestId},
    transport::{AuthInfo, RequestInfo},
};

/// An inbound request shape: a method literal plus a payload parsed from
/// the wire `params` object. Validation is the deserialization itself; it
/// happens in the registry trampoline before user code runs.
pub trait TypedRequest: DeserializeOwned + Send + 'static {
    const METHOD: &'static str;
    /// What the handler produces on success.
    type Output: Serialize + Send + 'static;
}

/// An inbound notification shape, parsed from the wire `params` object.
pub trait TypedNotification: DeserializeOwned + Send + 'static {
    const METHOD: &'static str;
}

/// Uniform trampoline stored in the request handler table.
pub(crate) type BoxRequestHandler<R> = Arc<
    dyn Fn(
            JsonRpcRequest,
            RequestHandlerExtra<R>,
        ) -> BoxFuture<'static, Result<<R as ServiceRole>::Resp, ErrorData>>
        + Send
        + Sync,
>;

/// Uniform trampoline stored in the notification handler table.
pub(crate) type BoxNotificationHandler =
    Arc<dyn Fn(JsonRpcNotification) -> BoxFuture<'static, Result<(), ErrorData>> + Send + Sync>;

/// Context passed to an inbound request handler alongside its parsed
/// payload.
pub struct RequestHandlerExtra<R: ServiceRole> {
    /// Tripped when the peer cancels this request; once tripped, the
    /// handler's eventual result is discarded instead of answered.
    pub signal: CancellationHandle,
    /// The id the peer assigned to this request.
    pub request_id: RequestId,
    /// Identifier of the transport connection serving this request.
    pub session_id: Option<String>,
    /// The `_meta` object of the request params, if any.
    pub meta: Option<JsonObject>,
    /// Identity established by the authenticating layer, if any.
    pub auth_info: Option<AuthInfo>,
    /// Request-level metadata from the HTTP layer, if any.
    pub request_info: Option<RequestInfo>,
    pub(crate) session: Session<R>,
}

impl<R: ServiceRole> RequestHandlerExtra<R> {
    /// Send a notification tied to the request being handled. The
    /// transport can use the relation to route it onto the right stream.
    pub async fn send_notification(&self, notification: R::Not) -> Result<(), ServiceError> {
        self.session
            .notification(
                notification,
                NotificationOptions {
                    related_request_id: Some(self.request_id.clone()),
                },
            )
            .await
    }

    /// Issue an outbound request tied to the request being handled.
    pub async fn send_request<U: DeserializeOwned>(
        &self,
        request: R::Req,
        mut options: RequestOptions,
    ) -> Result<U, ServiceError> {
        options.related_request_id = Some(self.request_id.clone());
        self.session.request(request, options).await
    }

    /// The session serving this request.
    pub fn session(&self) -> &Session<R> {
        &self.session
    }
}

impl<R: ServiceRole> std::fmt::Debug for RequestHandlerExtra<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandlerExtra")
            .field("request_id", &self.request_id)
            .field("session_id", &self.session_id)
            .field("cancelled", &self.signal.is_cancelled())
            .finish_non_exhaustive()
    }
}
