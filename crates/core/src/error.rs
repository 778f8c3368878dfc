//! Store error taxonomy shared by every layer that talks to the resource store.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("conflict on {0}: object has been modified")]
    Conflict(String),
    #[error("{0} not found")]
    NotFound(String),
    /// Connection refused/reset, timeouts, service unavailable.
    #[error("transient: {0}")]
    Transient(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Malformed object or request; never retried.
    #[error("invalid: {0}")]
    Invalid(String),
    /// No discovery mapping for a group/version/kind.
    #[error("no resource mapping for {0}")]
    UnknownKind(String),
    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },
    /// Non-API client failure (transport setup, serialization).
    #[error("client: {0}")]
    Client(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool { matches!(self, StoreError::Transient(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict(_)) }
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }
    pub fn is_already_exists(&self) -> bool { matches!(self, StoreError::AlreadyExists(_)) }
}
