use crate::error::Result;
use crate::types::{InstanceSnapshot, ServiceSnapshot, WaitIndex};
use async_trait::async_trait;

pub mod consul;
pub use consul::ConsulGateway;

/// A value read from the registry together with the index it is valid at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched<T> {
    pub value: T,
    pub index: WaitIndex,
}

impl<T> Fetched<T> {
    pub fn new(value: T, index: WaitIndex) -> Self {
        Self { value, index }
    }
}

/// Blocking-query access to a service registry.
///
/// Both calls may block until something changes past `index` or the
/// gateway's max wait elapses.  Returning the same index with an
/// unchanged value is a legal "nothing changed yet" answer.
#[async_trait]
pub trait RegistryGateway: Send + Sync {
    /// List the names of all known services.
    async fn fetch_service_names(&self, index: WaitIndex) -> Result<Fetched<ServiceSnapshot>>;

    /// List the instances of `service` with their health checks.
    async fn fetch_service_instances(
        &self,
        service: &str,
        index: WaitIndex,
    ) -> Result<Fetched<InstanceSnapshot>>;
}
