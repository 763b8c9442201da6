//! Endpoint + credential identity.

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::ClientError;

/// Identifies one endpoint and the credential used against it.
///
/// Scopes the limiter bucket, sequence numbers, and listener registries.
/// Equality and hashing use `(host, port, owner_id)` only, so a re-created
/// identity for the same endpoint maps onto the same registry entries.
#[derive(Clone)]
pub struct ServerIdentity {
    host: String,
    port: u16,
    owner_id: u64,
    credential_token: i32,
    caller_id: u64,
}

impl ServerIdentity {
    /// Build an identity, rejecting missing fields.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        owner_id: u64,
        credential_token: i32,
    ) -> Result<Self, ClientError> {
        let host = host.into();
        if host.trim().is_empty() {
            return Err(ClientError::Configuration("host cannot be empty".into()));
        }
        if owner_id == 0 {
            return Err(ClientError::Configuration("owner id cannot be zero".into()));
        }
        Ok(Self {
            host,
            port,
            owner_id,
            credential_token,
            // Requests are issued on behalf of the credential owner.
            caller_id: owner_id,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn owner_id(&self) -> u64 {
        self.owner_id
    }

    pub fn credential_token(&self) -> i32 {
        self.credential_token
    }

    /// Player id stamped into every request envelope.
    pub fn caller_id(&self) -> u64 {
        self.caller_id
    }

    /// `host:port` string handed to the transport.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl PartialEq for ServerIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port && self.owner_id == other.owner_id
    }
}

impl Eq for ServerIdentity {}

impl Hash for ServerIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
        self.owner_id.hash(state);
    }
}

// The token never appears in logs.
impl fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("owner_id", &self.owner_id)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.host, self.port, self.owner_id)
    }
}
