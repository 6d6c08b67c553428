use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::header::HeaderMap;

/// Opaque host-assigned request identifier.
///
/// Stable for the lifetime of one request and never reused within a
/// process lifetime. Exposed read-only to the guest for log correlation;
/// the bridge also stamps it onto every response head as
/// [`REQUEST_ID_HEADER`](crate::REQUEST_ID_HEADER).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Allocate a fresh identifier. Only the host side calls this.
    pub fn allocate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Immutable snapshot of an inbound request's head.
///
/// Owned by the host; the guest receives a read-only copy per request.
/// The body travels separately through the chunk channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMetadata {
    method: String,
    uri: String,
    headers: HeaderMap,
}

impl RequestMetadata {
    /// Build a snapshot. The method is normalized to uppercase.
    pub fn new(method: impl Into<String>, uri: impl Into<String>, headers: HeaderMap) -> Self {
        Self {
            method: method.into().to_ascii_uppercase(),
            uri: uri.into(),
            headers,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Whether the method carries no request body by definition.
    ///
    /// Bodyless requests never get a body stream attached, regardless of
    /// what the host-side transport delivered.
    pub fn is_bodyless(&self) -> bool {
        matches!(self.method.as_str(), "GET" | "HEAD")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_is_uppercased() {
        let meta = RequestMetadata::new("post", "/echo", HeaderMap::new());
        assert_eq!(meta.method(), "POST");
    }

    #[test]
    fn get_and_head_are_bodyless() {
        for method in ["GET", "get", "HEAD", "head"] {
            let meta = RequestMetadata::new(method, "/", HeaderMap::new());
            assert!(meta.is_bodyless(), "{method} should be bodyless");
        }
        for method in ["POST", "PUT", "PATCH", "DELETE"] {
            let meta = RequestMetadata::new(method, "/", HeaderMap::new());
            assert!(!meta.is_bodyless(), "{method} should carry a body");
        }
    }

    #[test]
    fn request_ids_are_unique() {
        let a = RequestId::allocate();
        let b = RequestId::allocate();
        assert_ne!(a, b);
    }

    #[test]
    fn request_id_round_trips_through_json() {
        let id = RequestId::allocate();
        let encoded = serde_json::to_string(&id).unwrap();
        assert_eq!(encoded, format!("\"{id}\""));
        let decoded: RequestId = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, id);
    }
}
