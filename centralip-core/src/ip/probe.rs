use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use rand::{rngs::OsRng, Rng, RngCore};

use super::{block_size, first_usable_address, AddressError};

/// Endless stream of uniformly random host addresses of a subnet.
///
/// The network, gateway and broadcast addresses are never produced. Draws are
/// independent, so the same address can come up more than once.
///
/// Offsets from the gateway are drawn from `1..=size - 3`. A `1..=size - 2`
/// range would include the broadcast address, which is not assignable.
#[derive(Debug)]
pub struct RandomHostProbe<R> {
    gateway: Ipv4Addr,
    candidate_count: u32,
    rng: R,
}

impl RandomHostProbe<OsRng> {
    pub fn new(subnet: Ipv4Net) -> Result<Self, AddressError> {
        Self::with_rng(subnet, OsRng)
    }
}

impl<R: RngCore> RandomHostProbe<R> {
    pub fn with_rng(subnet: Ipv4Net, rng: R) -> Result<Self, AddressError> {
        let size = block_size(subnet.prefix_len())?;

        if size < 4 {
            return Err(AddressError::SubnetTooSmall(subnet));
        }

        Ok(Self {
            gateway: first_usable_address(&subnet),
            candidate_count: size - 3,
            rng,
        })
    }

    pub fn get(&mut self) -> Ipv4Addr {
        let offset = self.rng.gen_range(1..=self.candidate_count);

        // gateway + candidate_count is the last address before broadcast
        Ipv4Addr::from(u32::from(self.gateway) + offset)
    }
}

impl<R: RngCore> Iterator for RandomHostProbe<R> {
    type Item = Ipv4Addr;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.get())
    }
}
