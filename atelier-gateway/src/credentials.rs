//! Credential assembly for key rotation.
//!
//! The try order is: the user's personal key (when non-empty), then the
//! server pool in configured order.

use atelier_common::util::mask_secret;
use std::fmt;
use zeroize::Zeroizing;

/// Where a credential came from. Doubles as its log label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    /// Entered by the user in the page
    Personal,
    /// Position in the server pool, 1-indexed
    Server(usize),
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Personal => f.write_str("personal"),
            Self::Server(n) => write!(f, "server #{n}"),
        }
    }
}

/// An API key plus its source label. Zeroed on drop, never printed in full.
#[derive(Clone)]
pub struct Credential {
    secret: Zeroizing<String>,
    source: CredentialSource,
}

impl Credential {
    pub fn new(secret: impl Into<String>, source: CredentialSource) -> Self {
        Self {
            secret: Zeroizing::new(secret.into()),
            source,
        }
    }

    pub fn secret(&self) -> &str {
        self.secret.as_str()
    }

    pub fn source(&self) -> CredentialSource {
        self.source
    }

    /// Human-readable label used in rotation logs.
    pub fn label(&self) -> String {
        self.source.to_string()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("source", &self.label())
            .field("secret", &mask_secret(&self.secret))
            .finish()
    }
}

/// Build the priority-ordered candidate list.
///
/// `pool` is expected to be already trimmed (see `KeyPool::keys`); blank
/// entries are skipped here as well so labels stay aligned with usable keys.
pub fn build_credentials(personal: Option<&str>, pool: &[String]) -> Vec<Credential> {
    let mut credentials = Vec::with_capacity(pool.len() + 1);

    if let Some(key) = personal.map(str::trim).filter(|k| !k.is_empty()) {
        credentials.push(Credential::new(key, CredentialSource::Personal));
    }

    credentials.extend(
        pool.iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .enumerate()
            .map(|(idx, key)| Credential::new(key, CredentialSource::Server(idx + 1))),
    );

    credentials
}
