use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::request::RequestId;

/// A response head could not be normalized into a valid HTTP response.
#[derive(Debug, Error)]
#[error("invalid response status {0}")]
pub struct InvalidStatus(pub u16);

/// The normalized head of a response: status plus a name→value header
/// mapping.
///
/// Header keys are case-insensitive and last-write-wins, which is the
/// mapping contract handlers get (as opposed to the ordered,
/// duplicate-preserving request [`HeaderMap`](crate::HeaderMap)). Keys are
/// folded to lowercase on insertion so serialization is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseHead {
    pub status: u16,
    headers: HashMap<String, String>,
}

impl ResponseHead {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HashMap::new(),
        }
    }

    /// Set a header, replacing any previous value for the same name
    /// (compared case-insensitively).
    pub fn set_header(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Apply defaults and validate.
    ///
    /// A zero status (the unset marker) becomes 200. Anything outside the
    /// HTTP status range is rejected — a handler that sets status 9999 is
    /// a contract violation, not something to forward to a caller.
    pub fn normalize(&mut self) -> Result<(), InvalidStatus> {
        if self.status == 0 {
            self.status = 200;
        }
        if !(100..=599).contains(&self.status) {
            return Err(InvalidStatus(self.status));
        }
        Ok(())
    }

    /// Stamp the correlation header the bridge adds to every response.
    pub fn apply_runtime_headers(&mut self, request_id: RequestId) {
        self.set_header(crate::REQUEST_ID_HEADER, request_id.to_string());
    }
}
