use std::{iter::successors, net::Ipv4Addr};

use ipnet::Ipv4Net;
use log::{debug, info, warn};

use crate::{
    config::NodeConfig,
    error::IpamError,
    ip::block_size,
    keys::KeySpace,
    store::KvStore,
};

/// Candidate `/subnet_len` blocks from `subnet_min` up to and including
/// `subnet_max`.
#[derive(Debug, Clone)]
pub struct SubnetRange {
    min: Ipv4Addr,
    max: Ipv4Addr,
    prefix_len: u8,
}

impl SubnetRange {
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            min: config.subnet_min,
            max: config.subnet_max,
            prefix_len: config.subnet_len,
        }
    }

    pub fn candidates(&self) -> Result<impl Iterator<Item = Ipv4Net>, IpamError> {
        let step = block_size(self.prefix_len)?;
        let max = u32::from(self.max);
        let prefix_len = self.prefix_len;

        Ok(successors(Some(u32::from(self.min)), move |current| {
            current.checked_add(step)
        })
        .take_while(move |candidate| *candidate <= max)
        .filter_map(move |candidate| Ipv4Net::new(Ipv4Addr::from(candidate), prefix_len).ok()))
    }

    pub fn exhausted(&self) -> IpamError {
        IpamError::NoAvailableSubnet(self.min, self.max)
    }
}

/// Returns the subnet owned by `hostname`, carving and claiming a new one if
/// the host has none yet.
pub async fn register_host<S>(
    store: &S,
    keys: &KeySpace,
    config: &NodeConfig,
    hostname: &str,
) -> Result<Ipv4Net, IpamError>
where
    S: KvStore + ?Sized,
{
    if let Some(subnet) = lookup_host_subnet(store, keys, hostname).await? {
        debug!("Host '{hostname}' already owns {subnet}");
        return Ok(subnet);
    }

    carve_subnet(store, keys, &SubnetRange::new(config), hostname).await
}

pub async fn lookup_host_subnet<S>(
    store: &S,
    keys: &KeySpace,
    hostname: &str,
) -> Result<Option<Ipv4Net>, IpamError>
where
    S: KvStore + ?Sized,
{
    let key = keys.host_subnet(hostname);

    match store.get(&key).await? {
        Some(value) => parse_subnet(&key, &value).map(Some),
        None => Ok(None),
    }
}

async fn carve_subnet<S>(
    store: &S,
    keys: &KeySpace,
    range: &SubnetRange,
    hostname: &str,
) -> Result<Ipv4Net, IpamError>
where
    S: KvStore + ?Sized,
{
    let index_prefix = keys.subnet_index_prefix();
    let taken = store.get_prefix(&index_prefix).await?;

    // a previous invocation may have died between the two registration writes
    if let Some((index_key, _)) = taken.iter().find(|(_, owner)| owner.as_str() == hostname) {
        let subnet_raw = index_key.strip_prefix(&index_prefix).unwrap_or_default();
        let subnet = parse_subnet(index_key, subnet_raw)?;

        warn!("Found an orphaned {subnet} claim for '{hostname}', adopting it...");

        return finish_registration(store, keys, hostname, subnet, index_key).await;
    }

    for candidate in range.candidates()? {
        let index_key = keys.subnet_index(&candidate);

        if taken.contains_key(&index_key) {
            continue;
        }

        if !store.put_if_absent(&index_key, hostname).await? {
            debug!("{candidate} was claimed concurrently, trying the next subnet...");
            continue;
        }

        return finish_registration(store, keys, hostname, candidate, &index_key).await;
    }

    Err(range.exhausted())
}

async fn finish_registration<S>(
    store: &S,
    keys: &KeySpace,
    hostname: &str,
    subnet: Ipv4Net,
    index_key: &str,
) -> Result<Ipv4Net, IpamError>
where
    S: KvStore + ?Sized,
{
    let host_key = keys.host_subnet(hostname);

    if store.put_if_absent(&host_key, &subnet.to_string()).await? {
        info!("Registered {subnet} subnet for '{hostname}'!");
        return Ok(subnet);
    }

    // another invocation on this host registered first, keep its subnet
    let registered = lookup_host_subnet(store, keys, hostname)
        .await?
        .ok_or_else(|| IpamError::CorruptRecord {
            key: host_key.to_owned(),
            value: String::new(),
        })?;

    if registered != subnet {
        debug!("'{hostname}' registered {registered} concurrently, releasing {subnet}...");
        store.delete(index_key).await?;
    }

    Ok(registered)
}

fn parse_subnet(key: &str, value: &str) -> Result<Ipv4Net, IpamError> {
    value
        .trim()
        .parse::<Ipv4Net>()
        .map(|subnet| subnet.trunc())
        .map_err(|_| IpamError::CorruptRecord {
            key: key.to_owned(),
            value: value.to_owned(),
        })
}
