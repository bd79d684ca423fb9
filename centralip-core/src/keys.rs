use std::{fmt::Display, net::Ipv4Addr};

use ipnet::Ipv4Net;

use crate::config::Strategy;

pub const DEFAULT_STORE_ROOT: &str = "/ovs-cni/networks";

const SUBNETS_SEGMENT: &str = "subnets";
const GATEWAY_SEGMENT: &str = "gateway";
const USED_SEGMENT: &str = "used";

/// Store key layout for one strategy, rooted at a configurable prefix.
///
/// ```text
/// <root>/<strategy>/<hostname>                  -> subnet CIDR
/// <root>/<strategy>/subnets/<cidr>              -> hostname
/// <root>/<strategy>/<hostname>/gateway          -> gateway address
/// <root>/<strategy>/<hostname>/used/<ip>        -> workload id
/// <root>/cluster/used/<ip>                      -> workload id
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    base: String,
}

impl KeySpace {
    pub fn new(root: &str, strategy: Strategy) -> Self {
        Self {
            base: format!("{}/{}", root.trim_end_matches('/'), strategy),
        }
    }

    pub fn host_subnet(&self, hostname: &str) -> String {
        format!("{}/{hostname}", self.base)
    }

    pub fn subnet_index_prefix(&self) -> String {
        format!("{}/{SUBNETS_SEGMENT}/", self.base)
    }

    pub fn subnet_index(&self, subnet: &Ipv4Net) -> String {
        format!("{}{subnet}", self.subnet_index_prefix())
    }

    pub fn gateway(&self, hostname: &str) -> String {
        format!("{}/{GATEWAY_SEGMENT}", self.host_subnet(hostname))
    }

    /// Lease prefix for a host, or the shared one when `hostname` is `None`.
    pub fn lease_prefix(&self, hostname: Option<&str>) -> String {
        match hostname {
            Some(hostname) => format!("{}/{USED_SEGMENT}/", self.host_subnet(hostname)),
            None => format!("{}/{USED_SEGMENT}/", self.base),
        }
    }

    pub fn lease(&self, hostname: Option<&str>, address: impl Display) -> String {
        format!("{}{address}", self.lease_prefix(hostname))
    }

    /// Recovers the leased address from a lease key under `prefix`.
    pub fn lease_address(prefix: &str, key: &str) -> Option<Ipv4Addr> {
        key.strip_prefix(prefix)?.parse().ok()
    }
}

/// Hostnames become key segments, so they must not alias another key family.
pub fn is_valid_hostname_segment(hostname: &str) -> bool {
    !hostname.is_empty() && !hostname.contains('/') && hostname != SUBNETS_SEGMENT
}
