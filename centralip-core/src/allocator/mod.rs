use std::net::Ipv4Addr;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use log::debug;

use crate::{
    config::{ClusterConfig, IpamSettings, StrategyConfig},
    error::IpamError,
    keys::is_valid_hostname_segment,
    store::{EtcdStore, KvStore},
};

pub mod cluster;
pub mod lease;
pub mod node;

pub use cluster::ClusterAllocator;
pub use node::NodeAllocator;

/// Address allocator bound to a single workload.
#[async_trait]
pub trait Ipam: Send + Sync {
    /// Gateway of the allocator's subnet, `None` when the network has no
    /// gateway managed by us.
    async fn get_gateway(&self) -> Result<Option<Ipv4Addr>, IpamError>;

    /// Leases a free address to the bound workload.
    async fn get_available_ip(&self) -> Result<Ipv4Net, IpamError>;

    /// Frees every address held by `workload_id`, returning them in ascending
    /// order.
    async fn release(&self, workload_id: &str) -> Result<Vec<Ipv4Addr>, IpamError>;

    /// Addresses currently leased to `workload_id`, empty when it holds none.
    async fn leases_of(&self, workload_id: &str) -> Result<Vec<Ipv4Addr>, IpamError>;

    /// Network addresses are leased from: the host subnet or the shared network.
    fn subnet(&self) -> Ipv4Net;
}

pub fn resolve_hostname() -> Result<String, IpamError> {
    let hostname = hostname::get()
        .map_err(IpamError::Hostname)?
        .to_string_lossy()
        .into_owned();

    if !is_valid_hostname_segment(&hostname) {
        return Err(IpamError::InvalidHostname(hostname));
    }

    Ok(hostname)
}

fn node_hostname(hostname: Option<&str>) -> Result<String, IpamError> {
    let hostname = match hostname {
        Some(hostname) => hostname.to_owned(),
        None => resolve_hostname()?,
    };
    debug!("Using the node strategy on '{hostname}'");

    Ok(hostname)
}

fn cluster_allocator<S>(
    store: S,
    settings: &IpamSettings,
    config: &ClusterConfig,
    workload_id: &str,
) -> Result<Box<dyn Ipam>, IpamError>
where
    S: KvStore + 'static,
{
    debug!("Using the cluster strategy on {}", config.network);

    let allocator =
        ClusterAllocator::new(store, settings.key_space(), config, workload_id.to_owned())?;

    Ok(Box::new(allocator))
}

/// Builds the allocator selected by `settings` on top of an existing store.
/// The node strategy registers the host subnet on the way, `hostname` falls
/// back to the local one.
pub async fn build_allocator<S>(
    store: S,
    settings: &IpamSettings,
    workload_id: &str,
    hostname: Option<&str>,
) -> Result<Box<dyn Ipam>, IpamError>
where
    S: KvStore + 'static,
{
    match &settings.strategy {
        StrategyConfig::Node(config) => {
            let allocator = NodeAllocator::new(
                store,
                settings.key_space(),
                config,
                node_hostname(hostname)?,
                workload_id.to_owned(),
            )
            .await?;

            Ok(Box::new(allocator))
        }
        StrategyConfig::Cluster(config) => cluster_allocator(store, settings, config, workload_id),
    }
}

/// Like [`build_allocator`] but never writes: the node strategy only binds to
/// a subnet the host already owns and fails with `LeaseNotFound` otherwise.
/// Used for releasing and inspecting leases.
pub async fn open_allocator<S>(
    store: S,
    settings: &IpamSettings,
    workload_id: &str,
    hostname: Option<&str>,
) -> Result<Box<dyn Ipam>, IpamError>
where
    S: KvStore + 'static,
{
    match &settings.strategy {
        StrategyConfig::Node(_) => {
            let allocator = NodeAllocator::open(
                store,
                settings.key_space(),
                node_hostname(hostname)?,
                workload_id.to_owned(),
            )
            .await?;

            Ok(Box::new(allocator))
        }
        StrategyConfig::Cluster(config) => cluster_allocator(store, settings, config, workload_id),
    }
}

/// Connects to the configured etcd endpoint and builds the allocator on it.
pub async fn connect_allocator(
    settings: &IpamSettings,
    workload_id: &str,
    hostname: Option<&str>,
) -> Result<Box<dyn Ipam>, IpamError> {
    let store = EtcdStore::connect(&settings.store).await?;

    build_allocator(store, settings, workload_id, hostname).await
}

pub async fn connect_existing_allocator(
    settings: &IpamSettings,
    workload_id: &str,
    hostname: Option<&str>,
) -> Result<Box<dyn Ipam>, IpamError> {
    let store = EtcdStore::connect(&settings.store).await?;

    open_allocator(store, settings, workload_id, hostname).await
}
