//! OpenStack client abstraction.
//!
//! [`Openstack`] is a handle onto one authenticated session with one
//! endpoint. Handles are produced by an [`OpenstackFactory`] and are expensive
//! to build, which is why the provisioner keeps them in a [`ClientCache`].

use async_trait::async_trait;
use cumulus_rs::options::BootSource;
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use thiserror::Error;

pub mod cache;
pub mod rest;

pub use cache::ClientCache;

#[derive(Debug, Error)]
pub enum OpenstackError {
    #[error("invalid identity '{0}': expected 'tenant:user'")]
    InvalidIdentity(String),
    #[error("invalid endpoint URL '{0}'")]
    InvalidEndpoint(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("no compute endpoint in service catalog for region {region:?}")]
    NoComputeEndpoint { region: Option<String> },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("OpenStack API returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("no such server: {0}")]
    NoSuchServer(String),
    #[error("{0}")]
    Other(String),
}

/// The four components a client session is keyed by. Comparison is exact and
/// case sensitive.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub endpoint: String,
    pub identity: String,
    pub credential: String,
    pub region: Option<String>,
}
impl ClientKey {
    pub fn new(
        endpoint: impl Into<String>,
        identity: impl Into<String>,
        credential: impl Into<String>,
        region: Option<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            identity: identity.into(),
            credential: credential.into(),
            region,
        }
    }

    pub fn for_cloud(cloud: &cumulus_rs::cloud::Cloud) -> Self {
        Self::new(
            cloud.endpoint_url.clone(),
            cloud.identity.clone(),
            cloud.credential.clone(),
            cloud.region.clone(),
        )
    }
}
impl Debug for ClientKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientKey")
            .field("endpoint", &self.endpoint)
            .field("identity", &self.identity)
            .field("credential", &"<redacted>")
            .field("region", &self.region)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerStatus {
    Build,
    Active,
    Error,
    Deleted,
    Other(String),
}
impl From<&str> for ServerStatus {
    fn from(value: &str) -> Self {
        match value {
            "BUILD" => ServerStatus::Build,
            "ACTIVE" => ServerStatus::Active,
            "ERROR" => ServerStatus::Error,
            "DELETED" | "SOFT_DELETED" => ServerStatus::Deleted,
            other => ServerStatus::Other(other.to_string()),
        }
    }
}
impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerStatus::Build => write!(f, "BUILD"),
            ServerStatus::Active => write!(f, "ACTIVE"),
            ServerStatus::Error => write!(f, "ERROR"),
            ServerStatus::Deleted => write!(f, "DELETED"),
            ServerStatus::Other(s) => write!(f, "{s}"),
        }
    }
}

/// Everything needed to ask Nova for one new server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpec {
    pub name: String,
    pub boot_source: BootSource,
    pub flavor_id: String,
    pub network_id: Option<String>,
    pub user_data: Option<String>,
    pub key_pair_name: Option<String>,
    pub security_groups: Vec<String>,
    pub availability_zone: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub status: ServerStatus,
    pub metadata: BTreeMap<String, String>,
    /// Fixed and floating addresses, in the order Nova reports them.
    pub addresses: Vec<String>,
    /// Nova's fault message for servers in `ERROR`.
    pub fault: Option<String>,
}

/// A live session with one OpenStack endpoint.
#[async_trait]
pub trait Openstack: Send + Sync + Debug {
    /// Check that the session can actually be used, e.g. that the compute API
    /// answers with the credentials we were given.
    async fn sanity_check(&self) -> Result<(), OpenstackError>;

    async fn boot_server(&self, spec: &ServerSpec) -> Result<Server, OpenstackError>;

    async fn get_server(&self, server_id: &str) -> Result<Server, OpenstackError>;

    /// Delete a server, releasing floating IPs attached to it.
    async fn destroy_server(&self, server_id: &str) -> Result<(), OpenstackError>;

    /// Servers whose metadata maps `key` to `value`.
    async fn servers_tagged(&self, key: &str, value: &str) -> Result<Vec<Server>, OpenstackError>;

    /// Allocate an address from `pool` and attach it to the server. Returns
    /// the address.
    async fn assign_floating_ip(&self, server_id: &str, pool: &str)
        -> Result<String, OpenstackError>;
}

/// Builds new sessions. Every call is expected to do the full (slow) session
/// setup.
#[async_trait]
pub trait OpenstackFactory: Send + Sync {
    async fn connect(&self, key: &ClientKey) -> Result<Arc<dyn Openstack>, OpenstackError>;
}
