//! Error types for the tidepool object runtime.
//!
//! The taxonomy follows the request path:
//!
//! - [`AllocationError`]: building or parsing an [`ObjectId`] failed.
//! - [`RoutingError`]: the router could not deliver a request to an instance.
//! - [`InvocationFault`]: the object's own code failed during a turn. Faults are
//!   turned into error [`Response`](crate::Response)s, never into routing errors.
//! - [`StorageError`]: the durable storage layer failed or rejected a commit.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::object::{Jurisdiction, ObjectId};

/// Errors raised while allocating or parsing object identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    /// Names used for `id_from_name` must not be empty.
    #[error("object name cannot be empty")]
    EmptyName,

    /// The name exceeds the maximum accepted length.
    #[error("object name too long: {len} bytes (max: {max} bytes)")]
    NameTooLong {
        /// Length of the rejected name in bytes.
        len: usize,
        /// Maximum accepted length in bytes.
        max: usize,
    },

    /// The string is not a valid rendered object id.
    #[error("malformed object id: {0}")]
    Malformed(String),

    /// The id was allocated by a different namespace.
    #[error("object id {id} does not belong to namespace {namespace}")]
    ForeignNamespace {
        /// Hex rendering of the rejected id.
        id: String,
        /// The namespace that rejected it.
        namespace: String,
    },

    /// The namespace is restricted to one jurisdiction and the request asked
    /// for another (or for none).
    #[error("namespace restricted to {restricted}, got {requested:?}")]
    JurisdictionConflict {
        /// Jurisdiction the namespace is restricted to.
        restricted: Jurisdiction,
        /// Jurisdiction carried by the request or id.
        requested: Option<Jurisdiction>,
    },

    /// The jurisdiction name is not supported.
    #[error("unknown jurisdiction: {0}")]
    UnknownJurisdiction(String),
}

/// Errors raised by the instance router while delivering a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    /// No storage region serves the id's jurisdiction.
    #[error("no storage region serves jurisdiction {jurisdiction:?} (object {id})")]
    JurisdictionUnavailable {
        /// The object that could not be placed.
        id: ObjectId,
        /// The jurisdiction the id is tagged with.
        jurisdiction: Option<Jurisdiction>,
    },

    /// The storage region for the object did not answer its activation probe.
    #[error("storage unavailable for object {id}: {reason}")]
    StorageUnavailable {
        /// The object that could not be activated.
        id: ObjectId,
        /// Backend-provided detail.
        reason: String,
    },

    /// The instance task ended before replying.
    #[error("instance for object {0} went away before replying")]
    InstanceGone(ObjectId),

    /// The runtime is shutting down and accepts no new requests.
    #[error("runtime is shutting down")]
    ShuttingDown,

    /// The caller stopped waiting. The request itself keeps running.
    #[error("no response within {0:?}")]
    Timeout(Duration),
}

/// Errors from the durable storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend is not reachable.
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    /// Underlying file I/O failed.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted record could not be decoded.
    #[error("corrupt storage record: {0}")]
    Corrupt(String),

    /// A commit or snapshot encodes to more bytes than one log record holds.
    /// Nothing was written.
    #[error("record of {size} bytes exceeds the {limit} byte limit")]
    RecordTooLarge {
        /// Encoded payload size.
        size: usize,
        /// Largest payload the backend accepts.
        limit: usize,
    },

    /// A value could not be converted to or from its stored form.
    #[error("value codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A version-checked write found a different version than expected.
    #[error("version mismatch on {key:?}: expected {expected:?}, found {actual:?}")]
    VersionMismatch {
        /// The key that was checked.
        key: String,
        /// The version the writer expected.
        expected: Option<u64>,
        /// The version currently stored.
        actual: Option<u64>,
    },
}

/// A failure inside an object's turn.
///
/// Returned by [`ObjectBehavior`](crate::ObjectBehavior) implementations. The
/// router converts it into an error response carrying [`status`](Self::status).
#[derive(Debug, Error)]
pub enum InvocationFault {
    /// A storage operation failed; the enclosing transaction did not commit.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The request or response body could not be decoded/encoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The object does not understand the request's method.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// Application-level failure with an explicit status.
    #[error("{message}")]
    Failed {
        /// Status code placed on the error response.
        status: u16,
        /// Message placed in the error response body.
        message: String,
    },

    /// The turn panicked.
    #[error("object panicked during its turn")]
    Panicked,

    /// A call to another object could not be routed.
    #[error("nested call failed: {0}")]
    Routing(#[from] RoutingError),
}

impl InvocationFault {
    /// Application failure with status 500.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            status: 500,
            message: message.into(),
        }
    }

    /// Application failure with status 400.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::Failed {
            status: 400,
            message: message.into(),
        }
    }

    /// Status code for the error response built from this fault.
    pub fn status(&self) -> u16 {
        match self {
            InvocationFault::Failed { status, .. } => *status,
            InvocationFault::Codec(_) => 400,
            InvocationFault::UnknownMethod(_) => 404,
            InvocationFault::Routing(RoutingError::Timeout(_)) => 504,
            InvocationFault::Routing(_) => 502,
            InvocationFault::Storage(StorageError::VersionMismatch { .. }) => 409,
            InvocationFault::Storage(StorageError::RecordTooLarge { .. }) => 413,
            InvocationFault::Storage(_) | InvocationFault::Panicked => 500,
        }
    }
}

/// Errors from the typed [`ObjectStub::call`](crate::ObjectStub::call) helper.
#[derive(Debug, Error)]
pub enum CallError {
    /// The request could not be delivered.
    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),

    /// The object answered with a non-success status.
    #[error("object returned status {status}: {message}")]
    Status {
        /// Status code of the response.
        status: u16,
        /// Response body, decoded lossily as text.
        message: String,
    },

    /// Encoding the request or decoding the response failed.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<CallError> for InvocationFault {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Routing(e) => InvocationFault::Routing(e),
            CallError::Status { status, message } => InvocationFault::Failed { status, message },
            CallError::Codec(e) => InvocationFault::Codec(e),
        }
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config {path}: {source}")]
    Io {
        /// Path that was read.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The TOML document is invalid.
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A binding refers to a class that was never registered on the builder.
    #[error("namespace {namespace} binds unknown class {class}")]
    UnknownClass {
        /// Namespace being bound.
        namespace: String,
        /// Class name that was not registered.
        class: String,
    },

    /// Two bindings use the same namespace name.
    #[error("namespace {0} is bound more than once")]
    DuplicateNamespace(String),

    /// Two namespace names hash to the same id tag.
    #[error("namespaces {first} and {second} share an id tag")]
    NamespaceTagCollision {
        /// First namespace.
        first: String,
        /// Second namespace.
        second: String,
    },

    /// A file-backed store was configured without a path.
    #[error("file storage requires a path")]
    MissingPath,

    /// Two regions were declared for the same jurisdiction.
    #[error("region for {0} declared more than once")]
    DuplicateRegion(Jurisdiction),
}

/// Top-level error for building a [`Runtime`](crate::Runtime).
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration problem.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Opening or scanning a storage backend failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_status_codes() {
        assert_eq!(InvocationFault::failed("boom").status(), 500);
        assert_eq!(InvocationFault::bad_request("nope").status(), 400);
        assert_eq!(InvocationFault::UnknownMethod("x".into()).status(), 404);
        assert_eq!(InvocationFault::Panicked.status(), 500);
        assert_eq!(
            InvocationFault::Routing(RoutingError::Timeout(Duration::from_secs(1))).status(),
            504
        );
        assert_eq!(
            InvocationFault::Storage(StorageError::VersionMismatch {
                key: "k".into(),
                expected: Some(1),
                actual: Some(2),
            })
            .status(),
            409
        );
        assert_eq!(
            InvocationFault::Storage(StorageError::RecordTooLarge {
                size: 10,
                limit: 5,
            })
            .status(),
            413
        );
    }

    #[test]
    fn test_call_error_into_fault_keeps_status() {
        let fault: InvocationFault = CallError::Status {
            status: 418,
            message: "teapot".into(),
        }
        .into();
        assert_eq!(fault.status(), 418);
        assert_eq!(fault.to_string(), "teapot");
    }
}
