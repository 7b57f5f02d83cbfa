//! Authentication and authorization contracts.
//!
//! Capabilities are split into small traits composed by [`AuthStack`]:
//! access policy is mandatory, password and public-key verification
//! are optional. Listeners introspect the stack at startup: SSH only
//! offers the auth methods that are present, HTTP only wires Basic
//! auth when a password checker exists.

pub mod file;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::paths::RepositoryLocation;

/// The caller on whose behalf a request runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Anonymous,
    User(String),
}

impl Identity {
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous)
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Anonymous => None,
            Self::User(name) => Some(name),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => write!(f, "anonymous"),
            Self::User(name) => write!(f, "{name}"),
        }
    }
}

/// Per-repository read/write policy.
#[async_trait]
pub trait AccessControl: Send + Sync {
    async fn can_read(&self, identity: &Identity, location: &RepositoryLocation) -> bool;

    /// Write policy. Callers short-circuit anonymous identities, and
    /// implementations must still answer `false` for them.
    async fn can_write(&self, identity: &Identity, location: &RepositoryLocation) -> bool;
}

/// Optional capability: username/password verification.
#[async_trait]
pub trait PasswordAuth: Send + Sync {
    async fn check_password(&self, username: &str, password: &str) -> bool;
}

/// Optional capability: SSH public key verification.
///
/// `key_blob` is the key in SSH wire form, as offered by the client.
#[async_trait]
pub trait PublicKeyAuth: Send + Sync {
    async fn check_public_key(&self, username: &str, key_blob: &[u8]) -> bool;
}

/// The composed authn/z record handed to every listener.
#[derive(Clone)]
pub struct AuthStack {
    pub access: Arc<dyn AccessControl>,
    pub password: Option<Arc<dyn PasswordAuth>>,
    pub public_key: Option<Arc<dyn PublicKeyAuth>>,
}

impl AuthStack {
    pub async fn can_read(&self, identity: &Identity, location: &RepositoryLocation) -> bool {
        self.access.can_read(identity, location).await
    }

    /// Anonymous identities never get write access, regardless of the
    /// underlying policy.
    pub async fn can_write(&self, identity: &Identity, location: &RepositoryLocation) -> bool {
        if identity.is_anonymous() {
            return false;
        }
        self.access.can_write(identity, location).await
    }
}
