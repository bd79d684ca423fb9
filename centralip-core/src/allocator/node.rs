use std::net::Ipv4Addr;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use log::{debug, info};

use crate::{
    config::NodeConfig,
    error::IpamError,
    ip::{address_at, first_usable_address, with_prefix},
    keys::{is_valid_hostname_segment, KeySpace},
    store::KvStore,
    subnet::{lookup_host_subnet, register_host},
};

use super::{
    lease::{claim_lease, leases_held_by, release_leases, used_addresses},
    Ipam,
};

/// Per-host allocator: the host owns one subnet carved out of the configured
/// range and leases addresses from it in ascending order.
///
/// Only constructible once the host's subnet is known.
pub struct NodeAllocator<S> {
    store: S,
    keys: KeySpace,
    hostname: String,
    workload_id: String,
    subnet: Ipv4Net,
}

impl<S: KvStore> NodeAllocator<S> {
    pub async fn new(
        store: S,
        keys: KeySpace,
        config: &NodeConfig,
        hostname: String,
        workload_id: String,
    ) -> Result<Self, IpamError> {
        if !is_valid_hostname_segment(&hostname) {
            return Err(IpamError::InvalidHostname(hostname));
        }

        let subnet = register_host(&store, &keys, config, &hostname).await?;

        Ok(Self {
            store,
            keys,
            hostname,
            workload_id,
            subnet,
        })
    }

    /// Binds to the subnet the host already owns without ever carving one.
    /// A host with no subnet holds no leases, which is `LeaseNotFound`.
    pub async fn open(
        store: S,
        keys: KeySpace,
        hostname: String,
        workload_id: String,
    ) -> Result<Self, IpamError> {
        if !is_valid_hostname_segment(&hostname) {
            return Err(IpamError::InvalidHostname(hostname));
        }

        let Some(subnet) = lookup_host_subnet(&store, &keys, &hostname).await? else {
            debug!("'{hostname}' has no registered subnet");
            return Err(IpamError::LeaseNotFound(workload_id));
        };

        Ok(Self {
            store,
            keys,
            hostname,
            workload_id,
            subnet,
        })
    }

    async fn stored_gateway(&self) -> Result<Option<Ipv4Addr>, IpamError> {
        let key = self.keys.gateway(&self.hostname);

        match self.store.get(&key).await? {
            Some(stored) => parse_gateway(&key, &stored).map(Some),
            None => Ok(None),
        }
    }

    fn lease_prefix(&self) -> String {
        self.keys.lease_prefix(Some(&self.hostname))
    }
}

#[async_trait]
impl<S: KvStore> Ipam for NodeAllocator<S> {
    async fn get_gateway(&self) -> Result<Option<Ipv4Addr>, IpamError> {
        if let Some(stored) = self.stored_gateway().await? {
            return Ok(Some(stored));
        }

        let gateway = first_usable_address(&self.subnet);
        let key = self.keys.gateway(&self.hostname);

        if self.store.put_if_absent(&key, &gateway.to_string()).await? {
            info!("Reserved {gateway} as the gateway of {}", self.subnet);
            return Ok(Some(gateway));
        }

        Ok(Some(self.stored_gateway().await?.unwrap_or(gateway)))
    }

    async fn get_available_ip(&self) -> Result<Ipv4Net, IpamError> {
        let prefix = self.lease_prefix();
        let mut used = used_addresses(&self.store.get_prefix(&prefix).await?, &prefix);
        let broadcast = self.subnet.broadcast();

        // a stored gateway may sit anywhere in the subnet and is never leased
        if let Some(gateway) = self.stored_gateway().await? {
            used.insert(gateway);
        }

        // network + 1 stays reserved for the gateway even before it is stored
        let mut candidate = address_at(first_usable_address(&self.subnet), 1)?;

        while candidate < broadcast {
            if !used.contains(&candidate) {
                let key = self.keys.lease(Some(&self.hostname), candidate);

                if claim_lease(&self.store, &key, &self.workload_id).await? {
                    info!("Leased {candidate} to '{}'", self.workload_id);
                    return Ok(with_prefix(candidate, self.subnet.prefix_len())?);
                }

                debug!("{candidate} was leased concurrently, scanning on...");
            }

            candidate = address_at(candidate, 1)?;
        }

        Err(IpamError::NoAvailableAddress(self.subnet))
    }

    async fn release(&self, workload_id: &str) -> Result<Vec<Ipv4Addr>, IpamError> {
        release_leases(&self.store, &self.lease_prefix(), workload_id).await
    }

    async fn leases_of(&self, workload_id: &str) -> Result<Vec<Ipv4Addr>, IpamError> {
        Ok(leases_held_by(&self.store, &self.lease_prefix(), workload_id)
            .await?
            .into_iter()
            .map(|(_, address)| address)
            .collect())
    }

    fn subnet(&self) -> Ipv4Net {
        self.subnet
    }
}

fn parse_gateway(key: &str, value: &str) -> Result<Ipv4Addr, IpamError> {
    value
        .trim()
        .parse()
        .map_err(|_| IpamError::CorruptRecord {
            key: key.to_owned(),
            value: value.to_owned(),
        })
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, net::Ipv4Addr, sync::Arc};

    use futures::future::join_all;
    use ipnet::Ipv4Net;

    use crate::{
        allocator::Ipam,
        config::{NodeConfig, Strategy},
        error::IpamError,
        keys::{KeySpace, DEFAULT_STORE_ROOT},
        store::{KvStore, MemoryStore},
    };

    use super::NodeAllocator;

    fn net(raw: &str) -> Ipv4Net {
        raw.parse().unwrap()
    }

    fn config() -> NodeConfig {
        NodeConfig {
            subnet_min: Ipv4Addr::new(10, 0, 0, 0),
            subnet_max: Ipv4Addr::new(10, 0, 2, 0),
            subnet_len: 24,
        }
    }

    async fn allocator(
        store: &Arc<MemoryStore>,
        hostname: &str,
        workload_id: &str,
    ) -> NodeAllocator<Arc<MemoryStore>> {
        NodeAllocator::new(
            store.clone(),
            KeySpace::new(DEFAULT_STORE_ROOT, Strategy::Node),
            &config(),
            hostname.to_owned(),
            workload_id.to_owned(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn gateway_is_first_usable_address_and_stable() {
        let store = MemoryStore::new();
        let node = allocator(&store, "host-a", "pod-1").await;

        let gateway = Some(Ipv4Addr::new(10, 0, 0, 1));

        assert_eq!(node.get_gateway().await.unwrap(), gateway);
        assert_eq!(node.get_gateway().await.unwrap(), gateway);
        assert_eq!(
            store
                .get("/ovs-cni/networks/node/host-a/gateway")
                .await
                .unwrap()
                .as_deref(),
            Some("10.0.0.1")
        );
    }

    #[tokio::test]
    async fn stored_gateway_wins_over_the_computed_one() {
        let store = MemoryStore::new();
        store
            .put("/ovs-cni/networks/node/host-a/gateway", "10.0.0.254")
            .await
            .unwrap();
        let node = allocator(&store, "host-a", "pod-1").await;

        assert_eq!(
            node.get_gateway().await.unwrap(),
            Some(Ipv4Addr::new(10, 0, 0, 254))
        );
    }

    #[tokio::test]
    async fn stored_gateway_is_never_leased() {
        let store = MemoryStore::new();
        store
            .put("/ovs-cni/networks/node/host-a/gateway", "10.0.0.2")
            .await
            .unwrap();
        let node = allocator(&store, "host-a", "pod-1").await;

        let gateway = node.get_gateway().await.unwrap();
        let first = node.get_available_ip().await.unwrap();
        let second = node.get_available_ip().await.unwrap();

        assert_eq!(gateway, Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(first, net("10.0.0.3/24"));
        assert_eq!(second, net("10.0.0.4/24"));
        assert_eq!(
            store
                .get("/ovs-cni/networks/node/host-a/used/10.0.0.2")
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn corrupt_gateway_record_stops_leasing() {
        let store = MemoryStore::new();
        store
            .put("/ovs-cni/networks/node/host-a/gateway", "not-an-address")
            .await
            .unwrap();
        let node = allocator(&store, "host-a", "pod-1").await;

        assert!(matches!(
            node.get_available_ip().await,
            Err(IpamError::CorruptRecord { .. })
        ));
    }

    #[tokio::test]
    async fn open_binds_to_the_registered_subnet() {
        let store = MemoryStore::new();
        let registered = allocator(&store, "host-a", "pod-1").await;
        let leased = registered.get_available_ip().await.unwrap();

        let opened = NodeAllocator::open(
            store.clone(),
            KeySpace::new(DEFAULT_STORE_ROOT, Strategy::Node),
            "host-a".to_owned(),
            "pod-1".to_owned(),
        )
        .await
        .unwrap();

        assert_eq!(opened.subnet(), registered.subnet());
        assert_eq!(opened.leases_of("pod-1").await.unwrap(), vec![leased.addr()]);
        assert_eq!(opened.release("pod-1").await.unwrap(), vec![leased.addr()]);
    }

    #[tokio::test]
    async fn open_never_registers_a_subnet() {
        let store = MemoryStore::new();

        let result = NodeAllocator::open(
            store.clone(),
            KeySpace::new(DEFAULT_STORE_ROOT, Strategy::Node),
            "host-c".to_owned(),
            "pod-1".to_owned(),
        )
        .await;

        assert!(matches!(result, Err(IpamError::LeaseNotFound(id)) if id == "pod-1"));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn addresses_are_leased_sequentially_after_the_gateway() {
        let store = MemoryStore::new();
        let node = allocator(&store, "host-a", "pod-1").await;

        node.get_gateway().await.unwrap();

        assert_eq!(node.get_available_ip().await.unwrap(), net("10.0.0.2/24"));
        assert_eq!(node.get_available_ip().await.unwrap(), net("10.0.0.3/24"));
        assert_eq!(
            store
                .get("/ovs-cni/networks/node/host-a/used/10.0.0.2")
                .await
                .unwrap()
                .as_deref(),
            Some("pod-1")
        );
    }

    #[tokio::test]
    async fn released_address_is_leased_again() {
        let store = MemoryStore::new();
        let first = allocator(&store, "host-a", "pod-1").await;
        let second = allocator(&store, "host-a", "pod-2").await;

        let leased = first.get_available_ip().await.unwrap();
        second.get_available_ip().await.unwrap();

        assert_eq!(first.release("pod-1").await.unwrap(), vec![leased.addr()]);
        assert_eq!(first.get_available_ip().await.unwrap(), leased);
    }

    #[tokio::test]
    async fn leases_are_partitioned_per_host() {
        let store = MemoryStore::new();
        let host_a = allocator(&store, "host-a", "pod-1").await;
        let host_b = allocator(&store, "host-b", "pod-1").await;

        assert_eq!(host_b.subnet(), net("10.0.1.0/24"));
        assert_eq!(host_a.get_available_ip().await.unwrap(), net("10.0.0.2/24"));
        assert_eq!(host_b.get_available_ip().await.unwrap(), net("10.0.1.2/24"));

        host_b.release("pod-1").await.unwrap();

        assert_eq!(
            host_a.leases_of("pod-1").await.unwrap(),
            vec![Ipv4Addr::new(10, 0, 0, 2)]
        );
        assert!(host_b.leases_of("pod-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn releasing_without_a_lease_is_reported() {
        let store = MemoryStore::new();
        let node = allocator(&store, "host-a", "pod-1").await;

        assert!(matches!(
            node.release("pod-1").await,
            Err(IpamError::LeaseNotFound(_))
        ));
    }

    #[tokio::test]
    async fn full_subnet_is_an_explicit_error() {
        let store = MemoryStore::new();
        let node = NodeAllocator::new(
            store.clone(),
            KeySpace::new(DEFAULT_STORE_ROOT, Strategy::Node),
            &NodeConfig {
                subnet_min: Ipv4Addr::new(10, 0, 0, 0),
                subnet_max: Ipv4Addr::new(10, 0, 0, 248),
                subnet_len: 29,
            },
            "host-a".to_owned(),
            "pod".to_owned(),
        )
        .await
        .unwrap();

        // .0 network, .1 gateway, .7 broadcast
        let leased = [
            node.get_available_ip().await.unwrap().addr(),
            node.get_available_ip().await.unwrap().addr(),
            node.get_available_ip().await.unwrap().addr(),
            node.get_available_ip().await.unwrap().addr(),
            node.get_available_ip().await.unwrap().addr(),
        ];

        assert_eq!(leased, [2, 3, 4, 5, 6].map(|host| Ipv4Addr::new(10, 0, 0, host)));

        let exhausted = node.get_available_ip().await;

        assert!(matches!(
            exhausted,
            Err(IpamError::NoAvailableAddress(subnet)) if subnet == node.subnet()
        ));
    }

    #[tokio::test]
    async fn invalid_hostnames_are_rejected_before_touching_the_store() {
        let store = MemoryStore::new();
        let result = NodeAllocator::new(
            store.clone(),
            KeySpace::new(DEFAULT_STORE_ROOT, Strategy::Node),
            &config(),
            "subnets".to_owned(),
            "pod".to_owned(),
        )
        .await;

        assert!(matches!(result, Err(IpamError::InvalidHostname(_))));
        assert!(store.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_leases_are_distinct() {
        let store = MemoryStore::new();
        // register the host up front so every task shares one subnet
        allocator(&store, "host-a", "setup").await;

        let tasks = (0..32).map(|index| {
            let store = store.clone();
            tokio::spawn(async move {
                let node = allocator(&store, "host-a", &format!("pod-{index}")).await;
                node.get_available_ip().await
            })
        });

        let leased = join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap().addr())
            .collect::<Vec<_>>();
        let distinct = leased.iter().copied().collect::<BTreeSet<_>>();

        assert_eq!(distinct.len(), 32);
        assert!(!distinct.contains(&Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(
            store
                .get_prefix("/ovs-cni/networks/node/host-a/used/")
                .await
                .unwrap()
                .len(),
            32
        );
    }
}
