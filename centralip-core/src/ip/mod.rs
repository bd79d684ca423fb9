use std::net::{IpAddr, Ipv4Addr};

use ipnet::Ipv4Net;
use thiserror::Error;

pub mod probe;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("Couldn't parse '{}' as an IP address!", .0)]
    Invalid(String),
    #[error("Address {} is not an IPv4 address!", .0)]
    NotIpv4(IpAddr),
    #[error("2^{} doesn't fit in 32 bits!", .0)]
    ExponentTooLarge(u32),
    #[error("Address {} shifted by {} overflows the IPv4 address space!", .0, .1)]
    Overflow(Ipv4Addr, u32),
    #[error("Subnet {} is too small to hold a gateway and any hosts!", .0)]
    SubnetTooSmall(Ipv4Net),
    #[error("Prefix length {} is longer than 32 bits!", .0)]
    InvalidPrefix(u8),
}

pub fn with_prefix(address: Ipv4Addr, prefix_len: u8) -> Result<Ipv4Net, AddressError> {
    Ipv4Net::new(address, prefix_len).map_err(|_| AddressError::InvalidPrefix(prefix_len))
}

/// 2^`exponent`, guarded against shifts that don't fit in an u32
pub fn power_of_two(exponent: u32) -> Result<u32, AddressError> {
    let too_large = AddressError::ExponentTooLarge(exponent);

    1u32.checked_shl(exponent).ok_or(too_large)
}

pub fn address_to_integer(address: &str) -> Result<u32, AddressError> {
    match address
        .trim()
        .parse::<IpAddr>()
        .map_err(|_| AddressError::Invalid(address.to_owned()))?
    {
        IpAddr::V4(ipv4) => Ok(u32::from(ipv4)),
        IpAddr::V6(ipv6) => Err(AddressError::NotIpv4(IpAddr::V6(ipv6))),
    }
}

pub fn integer_to_address(value: u32) -> Ipv4Addr {
    Ipv4Addr::from(value)
}

/// The first host address of a subnet (network address + 1), used as the
/// subnet's gateway everywhere in the allocator.
pub fn first_usable_address(subnet: &Ipv4Net) -> Ipv4Addr {
    integer_to_address(u32::from(subnet.network()).saturating_add(1))
}

pub fn address_at(base: Ipv4Addr, offset: u32) -> Result<Ipv4Addr, AddressError> {
    u32::from(base)
        .checked_add(offset)
        .map(integer_to_address)
        .ok_or(AddressError::Overflow(base, offset))
}

/// Number of addresses covered by a prefix of the given length.
pub fn block_size(prefix_len: u8) -> Result<u32, AddressError> {
    power_of_two(32u32.saturating_sub(prefix_len as u32))
}
