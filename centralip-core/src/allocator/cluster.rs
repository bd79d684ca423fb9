use std::net::Ipv4Addr;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use log::{debug, info};
use rand::rngs::OsRng;
use tokio::sync::Mutex;

use crate::{
    config::ClusterConfig,
    error::IpamError,
    ip::{probe::RandomHostProbe, with_prefix},
    keys::KeySpace,
    store::KvStore,
};

use super::{
    lease::{claim_lease, leases_held_by, release_leases, used_addresses},
    Ipam,
};

/// Cluster-wide allocator: every host leases from one shared network by
/// probing random host addresses.
pub struct ClusterAllocator<S> {
    store: S,
    keys: KeySpace,
    workload_id: String,
    network: Ipv4Net,
    probe_attempts: u32,
    probe: Mutex<RandomHostProbe<OsRng>>,
}

impl<S: KvStore> ClusterAllocator<S> {
    pub fn new(
        store: S,
        keys: KeySpace,
        config: &ClusterConfig,
        workload_id: String,
    ) -> Result<Self, IpamError> {
        let probe = RandomHostProbe::new(config.network)?;

        Ok(Self {
            store,
            keys,
            workload_id,
            network: config.network,
            probe_attempts: config.probe_attempts,
            probe: Mutex::new(probe),
        })
    }
}

#[async_trait]
impl<S: KvStore> Ipam for ClusterAllocator<S> {
    /// The gateway of a cluster network is owned by the fabric, not by us.
    async fn get_gateway(&self) -> Result<Option<Ipv4Addr>, IpamError> {
        Ok(None)
    }

    async fn get_available_ip(&self) -> Result<Ipv4Net, IpamError> {
        let prefix = self.keys.lease_prefix(None);

        for attempt in 1..=self.probe_attempts {
            let used = used_addresses(&self.store.get_prefix(&prefix).await?, &prefix);
            let candidate = self.probe.lock().await.get();

            if used.contains(&candidate) {
                debug!("Probe {attempt} hit leased {candidate}");
                continue;
            }

            let key = self.keys.lease(None, candidate);

            if claim_lease(&self.store, &key, &self.workload_id).await? {
                info!("Leased {candidate} to '{}' after {attempt} probe(s)", self.workload_id);
                return Ok(with_prefix(candidate, self.network.prefix_len())?);
            }
        }

        debug!("Gave up on {} after {} probes", self.network, self.probe_attempts);

        Err(IpamError::NoAvailableAddress(self.network))
    }

    async fn release(&self, workload_id: &str) -> Result<Vec<Ipv4Addr>, IpamError> {
        release_leases(&self.store, &self.keys.lease_prefix(None), workload_id).await
    }

    async fn leases_of(&self, workload_id: &str) -> Result<Vec<Ipv4Addr>, IpamError> {
        Ok(
            leases_held_by(&self.store, &self.keys.lease_prefix(None), workload_id)
                .await?
                .into_iter()
                .map(|(_, address)| address)
                .collect(),
        )
    }

    fn subnet(&self) -> Ipv4Net {
        self.network
    }
}
