//! Session identifiers carried in the `session_id` query parameter.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Longest token accepted from a client.
pub const MAX_SESSION_ID_LEN: usize = 64;

/// Opaque key partitioning the conversation store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Parse a client-supplied token.
    pub fn parse(token: &str) -> Option<Self> {
        is_well_formed(token).then(|| Self(token.to_string()))
    }

    /// Reuse `token` when well-formed, otherwise generate a new id.
    ///
    /// The flag is `true` when a new id was created.
    pub fn resolve(token: Option<&str>) -> (Self, bool) {
        match token.and_then(Self::parse) {
            Some(id) => (id, false),
            None => (Self::generate(), true),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix shown in the page header.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_well_formed(token: &str) -> bool {
    !token.is_empty()
        && token.len() <= MAX_SESSION_ID_LEN
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
