use crate::result::{
    requested_version, SerializableOutputDisplay, VersionResult, DEFAULT_CNI_VERSION,
    SUPPORTED_VERSIONS,
};

pub const LOCAL_CENTRALIP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn print_version(stdin: &[u8]) -> anyhow::Result<()> {
    let cni_version = requested_version(stdin);

    VersionResult {
        cni_version: cni_version.as_deref().unwrap_or(DEFAULT_CNI_VERSION),
        supported_versions: &SUPPORTED_VERSIONS,
    }
    .print_json()?;

    Ok(())
}
