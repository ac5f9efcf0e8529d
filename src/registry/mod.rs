//! The service registry the DNS answers are synthesized from

/// Hierarchical (tree) backend
pub mod hierarchical;

/// Flat (prefix range) backend
pub mod flat;

/// In-memory store implementing both store shapes
pub mod memory;

/// HTTP clients for etcd
pub mod etcd;

pub mod path;
pub mod service;
pub mod singleflight;
pub mod store;

use async_trait::async_trait;
use derive_more::{Display, Error, From};

use crate::registry::path::PathMapper;
use crate::registry::service::Service;
use crate::registry::singleflight::FlightError;
use crate::registry::store::StoreError;

#[derive(Debug, Display, From, Error)]
pub enum RegistryError {
    Store(StoreError),
    Flight(FlightError),
    #[display(fmt = "reverse lookups can not contain wildcards")]
    #[from(ignore)]
    WildcardReverse,
    #[display(fmt = "reverse lookup must yield one record, found {}", _0)]
    #[from(ignore)]
    NotUnique(#[error(not(source))] usize),
}

impl RegistryError {
    /// True if the name does not exist in the registry
    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::Store(StoreError::KeyNotFound))
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Settings shared by both backends
#[derive(Clone, Debug)]
pub struct BackendConfig {
    pub paths: PathMapper,

    /// TTL used when neither the lease nor the service sets one
    pub ttl: u32,

    /// Priority used when the service stores 0
    pub priority: u16,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            paths: PathMapper::default(),
            ttl: 3600,
            priority: 10,
        }
    }
}

/// A change feed below a registry name
#[async_trait]
pub trait Watcher: Send {
    /// Wait for the next change
    async fn next(&mut self) -> Result<()>;
}

/// The capability set the DNS server relies on. The server never needs to
/// know which kind of registry it talks to.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Services stored at or below `name`. Wildcard labels match any single
    /// segment. With `exact` only the value at the name's own key is
    /// returned, and a directory yields nothing.
    async fn records(&self, name: &str, exact: bool) -> Result<Vec<Service>>;

    /// The single service stored for a reverse lookup name
    async fn reverse_record(&self, name: &str) -> Result<Service> {
        if path::has_wildcard(name) {
            return Err(RegistryError::WildcardReverse);
        }

        let mut records = self.records(name, true).await?;
        if records.len() != 1 {
            return Err(RegistryError::NotUnique(records.len()));
        }

        Ok(records.remove(0))
    }

    /// True once the backend is ready to serve
    fn has_synced(&self) -> bool;

    /// Change feed for everything below `name`
    fn watch(&self, name: &str) -> Box<dyn Watcher>;
}

/// Fill in registry defaults and derive the TTL of a decoded service
pub(crate) fn finish_service(
    config: &BackendConfig,
    mut service: Service,
    lease_ttl: i64,
) -> Service {
    service.ttl = service::calculate_ttl(lease_ttl, service.ttl, config.ttl);
    if service.priority == 0 {
        service.priority = config.priority;
    }

    service
}
