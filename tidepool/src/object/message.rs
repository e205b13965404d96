//! Request and response envelopes exchanged with objects.
//!
//! Bodies are opaque bytes. The `json` helpers cover the common case of
//! serde-encoded payloads.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::InvocationFault;

/// A request delivered to an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Operation name, interpreted by the object.
    pub method: String,
    /// Opaque payload.
    pub body: Vec<u8>,
}

impl Request {
    /// Request with an arbitrary body.
    pub fn new(method: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            method: method.into(),
            body: body.into(),
        }
    }

    /// Request with an empty body.
    pub fn empty(method: impl Into<String>) -> Self {
        Self::new(method, Vec::new())
    }

    /// Request whose body is `payload` encoded as JSON.
    pub fn json<T: Serialize + ?Sized>(
        method: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(method, serde_json::to_vec(payload)?))
    }

    /// Decode the body as JSON.
    pub fn json_body<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// An object's answer to a [`Request`].
///
/// Status codes follow HTTP conventions: 2xx is success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Status code.
    pub status: u16,
    /// Opaque payload.
    pub body: Vec<u8>,
}

impl Response {
    /// Status 200 with the given body.
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    /// Status 200 with `payload` encoded as JSON.
    pub fn json<T: Serialize + ?Sized>(payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::ok(serde_json::to_vec(payload)?))
    }

    /// Error response with a text body.
    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: message.into().into_bytes(),
        }
    }

    /// Error response describing a fault raised during a turn.
    pub fn from_fault(fault: &InvocationFault) -> Self {
        Self::error(fault.status(), fault.to_string())
    }

    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decode the body as JSON.
    pub fn json_body<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Body decoded lossily as UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
