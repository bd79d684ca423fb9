use std::{
    collections::{BTreeMap, BTreeSet},
    net::Ipv4Addr,
};

use itertools::Itertools;
use log::{debug, info, warn};

use crate::{error::IpamError, keys::KeySpace, store::KvStore};

/// Addresses leased under `prefix` according to a store snapshot.
pub fn used_addresses(snapshot: &BTreeMap<String, String>, prefix: &str) -> BTreeSet<Ipv4Addr> {
    snapshot
        .keys()
        .filter_map(|key| KeySpace::lease_address(prefix, key))
        .collect()
}

/// Lease keys under `prefix` owned by `workload_id`, ordered by address.
pub async fn leases_held_by<S>(
    store: &S,
    prefix: &str,
    workload_id: &str,
) -> Result<Vec<(String, Ipv4Addr)>, IpamError>
where
    S: KvStore + ?Sized,
{
    let snapshot = store.get_prefix(prefix).await?;

    Ok(snapshot
        .into_iter()
        .filter(|(_, owner)| owner == workload_id)
        .filter_map(|(key, _)| match KeySpace::lease_address(prefix, &key) {
            Some(address) => Some((key, address)),
            None => {
                warn!("Ignoring malformed lease key '{key}' held by '{workload_id}'");
                None
            }
        })
        .sorted_by_key(|(_, address)| *address)
        .collect())
}

/// Claims `key` for `workload_id`; `false` means somebody else holds it.
pub async fn claim_lease<S>(store: &S, key: &str, workload_id: &str) -> Result<bool, IpamError>
where
    S: KvStore + ?Sized,
{
    let claimed = store.put_if_absent(key, workload_id).await?;

    if !claimed {
        debug!("Lease '{key}' was taken concurrently");
    }

    Ok(claimed)
}

/// Deletes every lease under `prefix` held by `workload_id`, lowest address
/// first, and returns the freed addresses.
pub async fn release_leases<S>(
    store: &S,
    prefix: &str,
    workload_id: &str,
) -> Result<Vec<Ipv4Addr>, IpamError>
where
    S: KvStore + ?Sized,
{
    let held = leases_held_by(store, prefix, workload_id).await?;

    if held.is_empty() {
        return Err(IpamError::LeaseNotFound(workload_id.to_owned()));
    }

    if held.len() > 1 {
        warn!(
            "'{workload_id}' holds {} leases, releasing all of them",
            held.len()
        );
    }

    let mut released = Vec::with_capacity(held.len());
    for (key, address) in held {
        store.delete(&key).await?;
        info!("Released {address} held by '{workload_id}'");
        released.push(address);
    }

    Ok(released)
}
