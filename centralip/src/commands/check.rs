use itertools::Itertools;
use log::info;

use crate::{
    cli::Cli,
    result::{CniError, ErrorCode},
};

use super::{existing_allocator, load_network_config, require_container_id};

/// Succeeds only while the container still holds a lease in its scope. A
/// host without a subnet surfaces as `LeaseNotFound`, reported as code 3.
pub async fn check(cli: &Cli, stdin: &[u8]) -> anyhow::Result<()> {
    let container_id = require_container_id(cli)?;
    let (_, settings) = load_network_config(stdin)?;

    let ipam = existing_allocator(cli, &settings, container_id).await?;
    let leases = ipam.leases_of(container_id).await?;

    if leases.is_empty() {
        return Err(CniError::new(
            ErrorCode::UnknownContainer,
            format!("'{container_id}' holds no address lease!"),
        )
        .into());
    }

    info!(
        "'{container_id}' holds {} in {}",
        leases.iter().join(", "),
        ipam.subnet()
    );

    Ok(())
}
