use centralip_core::{
    connect_allocator, connect_existing_allocator, Ipam, IpamError, IpamSettings, NetConf,
};
use log::debug;

use crate::{
    cli::Cli,
    result::{is_supported_version, CniError, ErrorCode, SUPPORTED_VERSIONS},
};

pub mod add;
pub mod check;
pub mod del;
pub mod version;

pub fn require_container_id(cli: &Cli) -> anyhow::Result<&str> {
    cli.require_container_id().ok_or_else(|| {
        CniError::new(
            ErrorCode::InvalidEnvironment,
            "CNI_CONTAINERID is required for this command!",
        )
        .into()
    })
}

/// Decodes and validates the network configuration, failing before any store
/// access.
pub fn load_network_config(stdin: &[u8]) -> anyhow::Result<(NetConf, IpamSettings)> {
    let conf = NetConf::from_slice(stdin)?;

    if !is_supported_version(&conf.cni_version) {
        return Err(CniError::new(
            ErrorCode::IncompatibleVersion,
            format!("CNI version '{}' isn't supported!", conf.cni_version),
        )
        .with_details(format!("Supported versions: {}", SUPPORTED_VERSIONS.join(", ")))
        .into());
    }

    let settings = conf.ipam.validated()?;

    debug!("{settings:#?}");

    Ok((conf, settings))
}

/// Allocator for ADD, registering the host subnet when the host has none yet.
pub async fn register_allocator(
    cli: &Cli,
    settings: &IpamSettings,
    container_id: &str,
) -> anyhow::Result<Box<dyn Ipam>> {
    Ok(connect_allocator(settings, container_id, cli.hostname.as_deref()).await?)
}

/// Allocator for DEL and CHECK. Never claims a subnet, a host without one
/// yields `LeaseNotFound`.
pub async fn existing_allocator(
    cli: &Cli,
    settings: &IpamSettings,
    container_id: &str,
) -> Result<Box<dyn Ipam>, IpamError> {
    connect_existing_allocator(settings, container_id, cli.hostname.as_deref()).await
}
