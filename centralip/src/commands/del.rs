use std::net::Ipv4Addr;

use centralip_core::IpamError;
use itertools::Itertools;
use log::{info, warn};

use crate::cli::Cli;

use super::{existing_allocator, load_network_config, require_container_id};

pub async fn del(cli: &Cli, stdin: &[u8]) -> anyhow::Result<()> {
    let container_id = require_container_id(cli)?;
    let (conf, settings) = load_network_config(stdin)?;

    info!(
        "Releasing addresses of '{container_id}' on '{}' network...",
        conf.name
    );

    let released = match existing_allocator(cli, &settings, container_id).await {
        Ok(ipam) => ipam.release(container_id).await,
        Err(error) => Err(error),
    };

    settle_release(container_id, released)
}

/// DEL is idempotent: holding nothing, including on a host that never
/// registered a subnet, counts as released.
fn settle_release(
    container_id: &str,
    released: Result<Vec<Ipv4Addr>, IpamError>,
) -> anyhow::Result<()> {
    match released {
        Ok(released) => {
            info!("Released {}", released.iter().join(", "));
            Ok(())
        }
        Err(IpamError::LeaseNotFound(_)) => {
            warn!("'{container_id}' holds no leases, nothing to release");
            Ok(())
        }
        Err(error) => Err(error.into()),
    }
}
