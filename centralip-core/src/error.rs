use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use thiserror::Error;

use crate::{config::ConfigError, ip::AddressError, store::StoreError};

#[derive(Debug, Error)]
pub enum IpamError {
    #[error("Invalid ipam configuration! Details: {}", .0)]
    Config(#[from] ConfigError),
    #[error("{}", .0)]
    Store(#[from] StoreError),
    #[error("Address arithmetic failed! Details: {}", .0)]
    Address(#[from] AddressError),
    #[error("Couldn't resolve the local hostname! Reason: {}", .0)]
    Hostname(std::io::Error),
    #[error("Hostname '{}' can't be used as a store key segment!", .0)]
    InvalidHostname(String),
    #[error("No available subnet between {} and {} for registering!", .0, .1)]
    NoAvailableSubnet(Ipv4Addr, Ipv4Addr),
    #[error("No available address left in {}!", .0)]
    NoAvailableAddress(Ipv4Net),
    #[error("There are no address leases held by '{}'!", .0)]
    LeaseNotFound(String),
    #[error("Store record '{}' holds unexpected value '{}'!", .key, .value)]
    CorruptRecord { key: String, value: String },
}

impl IpamError {
    /// Whether the address space (rather than the store or the input) is the problem.
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            IpamError::NoAvailableSubnet(..) | IpamError::NoAvailableAddress(_)
        )
    }
}
