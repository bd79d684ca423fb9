use std::{
    fmt::{Display, Formatter},
    net::Ipv4Addr,
};

use centralip_core::{config::ConfigError, IpamError};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SUPPORTED_VERSIONS: [&str; 6] = ["0.1.0", "0.2.0", "0.3.0", "0.3.1", "0.4.0", "1.0.0"];
pub const DEFAULT_CNI_VERSION: &str = "0.3.1";

/// Error codes defined by CNI plus the plugin-specific range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    IncompatibleVersion,
    UnknownContainer,
    InvalidEnvironment,
    Decoding,
    InvalidNetworkConfig,
    TryAgainLater,
    AddressExhausted,
    CorruptRecord,
    Internal,
}

impl ErrorCode {
    pub fn code(self) -> u32 {
        match self {
            ErrorCode::IncompatibleVersion => 1,
            ErrorCode::UnknownContainer => 3,
            ErrorCode::InvalidEnvironment => 4,
            ErrorCode::Decoding => 6,
            ErrorCode::InvalidNetworkConfig => 7,
            ErrorCode::TryAgainLater => 11,
            ErrorCode::AddressExhausted => 100,
            ErrorCode::CorruptRecord => 101,
            ErrorCode::Internal => 999,
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[derive(Debug, Error)]
#[error("{}", .msg)]
pub struct CniError {
    pub code: ErrorCode,
    pub msg: String,
    pub details: Option<String>,
}

impl CniError {
    pub fn new(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Display) -> Self {
        self.details = Some(details.to_string());
        self
    }

    /// Picks the most specific CNI error for anything a command failed with.
    pub fn from_anyhow(error: &anyhow::Error) -> Self {
        let code = if let Some(error) = error.downcast_ref::<CniError>() {
            error.code
        } else if let Some(error) = error.downcast_ref::<IpamError>() {
            code_of_ipam_error(error)
        } else if let Some(error) = error.downcast_ref::<ConfigError>() {
            code_of_config_error(error)
        } else {
            ErrorCode::Internal
        };

        let error_message = error.to_string();
        let root_message = error.root_cause().to_string();
        let cni_error = Self::new(code, error_message.clone());

        if root_message != error_message {
            cni_error.with_details(root_message)
        } else {
            cni_error
        }
    }

    pub fn document<'a>(&'a self, cni_version: &'a str) -> ErrorDocument<'a> {
        ErrorDocument {
            cni_version,
            code: self.code.code(),
            msg: &self.msg,
            details: self.details.as_deref(),
        }
    }
}

fn code_of_ipam_error(error: &IpamError) -> ErrorCode {
    match error {
        IpamError::Config(error) => code_of_config_error(error),
        IpamError::Store(_) => ErrorCode::TryAgainLater,
        IpamError::CorruptRecord { .. } => ErrorCode::CorruptRecord,
        IpamError::LeaseNotFound(_) => ErrorCode::UnknownContainer,
        error if error.is_exhaustion() => ErrorCode::AddressExhausted,
        _ => ErrorCode::Internal,
    }
}

fn code_of_config_error(error: &ConfigError) -> ErrorCode {
    match error {
        ConfigError::Decode(_) => ErrorCode::Decoding,
        _ => ErrorCode::InvalidNetworkConfig,
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDocument<'a> {
    pub cni_version: &'a str,
    pub code: u32,
    pub msg: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<&'a str>,
}

/// Result layouts across CNI versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultFlavor {
    /// 0.1.x and 0.2.x: a single `ip4` object
    Legacy,
    /// 0.3.x and 0.4.x: `ips` entries carry a `version` field
    Versioned,
    /// 1.0.0 onward
    Current,
}

impl ResultFlavor {
    pub fn of(cni_version: &str) -> Self {
        let mut parts = cni_version
            .trim()
            .split('.')
            .map(|part| part.parse::<u32>().unwrap_or(0));

        match (parts.next().unwrap_or(0), parts.next().unwrap_or(0)) {
            (0, minor) if minor < 3 => ResultFlavor::Legacy,
            (0, _) => ResultFlavor::Versioned,
            _ => ResultFlavor::Current,
        }
    }
}

pub fn is_supported_version(cni_version: &str) -> bool {
    SUPPORTED_VERSIONS.contains(&cni_version.trim())
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum AddResult {
    Legacy(LegacyResult),
    Current(CurrentResult),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyResult {
    pub cni_version: String,
    pub ip4: LegacyIpConfig,
}

#[derive(Debug, Serialize)]
pub struct LegacyIpConfig {
    pub ip: Ipv4Net,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentResult {
    pub cni_version: String,
    pub ips: Vec<IpConfig>,
    /// routing is left to the main plugin, this stays empty
    pub routes: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct IpConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<&'static str>,
    pub address: Ipv4Net,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
}

impl AddResult {
    pub fn new(cni_version: &str, address: Ipv4Net, gateway: Option<Ipv4Addr>) -> Self {
        let cni_version = cni_version.trim().to_owned();

        match ResultFlavor::of(&cni_version) {
            ResultFlavor::Legacy => AddResult::Legacy(LegacyResult {
                cni_version,
                ip4: LegacyIpConfig {
                    ip: address,
                    gateway,
                },
            }),
            flavor => AddResult::Current(CurrentResult {
                cni_version,
                ips: vec![IpConfig {
                    version: (flavor == ResultFlavor::Versioned).then_some("4"),
                    address,
                    gateway,
                }],
                routes: Vec::new(),
            }),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionResult<'a> {
    pub cni_version: &'a str,
    pub supported_versions: &'a [&'a str],
}

pub trait SerializableOutputDisplay {
    fn print_json(&self) -> Result<(), serde_json::Error>;
}

impl<T: ?Sized + Serialize> SerializableOutputDisplay for T {
    fn print_json(&self) -> Result<(), serde_json::Error> {
        let output = serde_json::to_string(self)?;
        println!("{output}");

        Ok(())
    }
}

/// Just enough of the stdin document to learn the requested version, even
/// when the rest of it is broken.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionProbe {
    cni_version: Option<String>,
}

pub fn requested_version(stdin: &[u8]) -> Option<String> {
    serde_json::from_slice::<VersionProbe>(stdin)
        .ok()
        .and_then(|probe| probe.cni_version)
        .filter(|version| !version.trim().is_empty())
}
