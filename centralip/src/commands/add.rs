use anyhow::Context;
use log::info;

use crate::{
    cli::Cli,
    result::{AddResult, SerializableOutputDisplay},
};

use super::{load_network_config, register_allocator, require_container_id};

pub async fn add(cli: &Cli, stdin: &[u8]) -> anyhow::Result<()> {
    let container_id = require_container_id(cli)?;
    let (conf, settings) = load_network_config(stdin)?;

    info!(
        "Allocating an address for '{container_id}' on '{}' network...",
        conf.name
    );

    let ipam = register_allocator(cli, &settings, container_id).await?;
    let gateway = ipam
        .get_gateway()
        .await
        .context("Couldn't resolve the gateway!")?;
    let address = ipam
        .get_available_ip()
        .await
        .context("Couldn't lease an address!")?;

    AddResult::new(&conf.cni_version, address, gateway).print_json()?;

    Ok(())
}
