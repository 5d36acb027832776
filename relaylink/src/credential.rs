//! Credential value and store.

use std::fmt;
use std::sync::RwLock;

use serde::Deserialize;

/// Opaque authentication token for the device session.
///
/// The value never appears in `Debug` or `Display` output; log statements may
/// only record that a credential exists.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Credential(value.into())
    }

    /// The raw token value, for handing to the device transport.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// How the instance obtains its credential.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialMode {
    /// Operator-supplied token, fixed for the lifetime of the instance.
    Fixed(Credential),
    /// Token fetched on demand from the out-of-band channel.
    Dynamic,
}

/// Holds the current credential for one device instance.
///
/// Read by the session manager and the transport; written only by the token
/// refresh coordinator.
pub struct CredentialStore {
    dynamic: bool,
    current: RwLock<Option<Credential>>,
}

impl CredentialStore {
    pub fn new(mode: &CredentialMode) -> Self {
        let (dynamic, initial) = match mode {
            CredentialMode::Fixed(token) => (false, Some(token.clone())),
            CredentialMode::Dynamic => (true, None),
        };
        CredentialStore {
            dynamic,
            current: RwLock::new(initial),
        }
    }

    /// Whether out-of-band refresh applies to this instance.
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn current(&self) -> Option<Credential> {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn has_credential(&self) -> bool {
        self.current.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Replace the stored credential with a freshly fetched one.
    pub fn replace(&self, credential: Credential) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(credential);
    }
}
