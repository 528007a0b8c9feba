#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

mod error;
pub use error::ServiceError;

/// Basic data types of the JSON-RPC envelope and reserved methods
pub mod model;
pub use model::{ErrorCode, ErrorData};

mod cancellation;
pub use cancellation::CancellationHandle;

pub mod session;
pub use session::{
    AllowAllCapabilities, AtomicU32RequestIdProvider, CapabilityCheck, DEFAULT_REQUEST_TIMEOUT,
    NotificationOptions, ProgressCallback, RequestHandlerExtra, RequestOptions, ServiceRole,
    Session, SessionMessage, SessionOptions, TypedNotification, TypedRequest,
};

pub mod transport;

// re-export the serde stack the public traits are expressed in
pub use serde;
pub use serde_json;
