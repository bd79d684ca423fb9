use std::{
    fmt::{Display, Formatter},
    net::Ipv4Addr,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use ipnet::Ipv4Net;
use serde::Deserialize;
use thiserror::Error;

use crate::{
    ip::{address_to_integer, block_size, integer_to_address, AddressError},
    keys::{KeySpace, DEFAULT_STORE_ROOT},
    store::{StoreOptions, StoreOptionsBuilder, StoreOptionsBuilderError, DEFAULT_STORE_TIMEOUT},
};

pub const DEFAULT_PROBE_ATTEMPTS: u32 = 20;

/// Shortest and longest prefixes that still leave room for a gateway and hosts.
pub const MIN_SUBNET_LEN: u8 = 1;
pub const MAX_SUBNET_LEN: u8 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't decode the network configuration! Reason: {}", .0)]
    Decode(serde_json::Error),
    #[error("Required '{}' field is missing from the ipam configuration!", .0)]
    MissingField(&'static str),
    #[error("Unknown ipType '{}'! Expected 'node' or 'cluster'.", .0)]
    UnknownStrategy(String),
    #[error("'{}' contains an invalid address! Reason: {}", .field, .source)]
    InvalidAddress {
        field: &'static str,
        source: AddressError,
    },
    #[error("'{}' doesn't contain a valid IPv4 CIDR: '{}'!", .field, .value)]
    InvalidNetwork { field: &'static str, value: String },
    #[error("Subnet length {} is outside {}..={}!", .0, MIN_SUBNET_LEN, MAX_SUBNET_LEN)]
    SubnetLenOutOfRange(u8),
    #[error("subnetMin {} isn't aligned to a /{} boundary!", .0, .1)]
    UnalignedSubnetMin(Ipv4Addr, u8),
    #[error("subnetMin {} is greater than subnetMax {}!", .0, .1)]
    InvertedSubnetRange(Ipv4Addr, Ipv4Addr),
    #[error("probeAttempts must be at least 1!")]
    ZeroProbeAttempts,
    #[error("Secure store endpoint '{}' requires storeCertFile and storeKeyFile!", .0)]
    MissingClientIdentity(String),
    #[error("Couldn't prepare store options! Reason: {}", .0)]
    StoreOptions(StoreOptionsBuilderError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// every host carves its own subnet and leases sequentially from it
    #[default]
    Node,
    /// all hosts share one subnet and lease by random probing
    Cluster,
}

impl Display for Strategy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Node => f.write_str("node"),
            Strategy::Cluster => f.write_str("cluster"),
        }
    }
}

impl FromStr for Strategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "node" => Ok(Strategy::Node),
            "cluster" => Ok(Strategy::Cluster),
            other => Err(ConfigError::UnknownStrategy(other.to_owned())),
        }
    }
}

/// The network configuration document handed to the plugin on stdin.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetConf {
    pub cni_version: String,
    #[serde(default)]
    pub name: String,
    pub ipam: IpamConf,
}

impl NetConf {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ConfigError> {
        serde_json::from_slice(bytes).map_err(ConfigError::Decode)
    }
}

/// The raw `ipam` section, as written by the operator.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpamConf {
    #[serde(rename = "type", default)]
    pub plugin: String,
    pub ip_type: Option<String>,
    pub network: Option<String>,
    pub subnet_len: Option<u8>,
    pub subnet_min: Option<String>,
    pub subnet_max: Option<String>,
    #[serde(rename = "storeURL", alias = "etcdURL")]
    pub store_url: Option<String>,
    #[serde(rename = "storeCertFile", alias = "etcdCertFile")]
    pub store_cert_file: Option<String>,
    #[serde(rename = "storeKeyFile", alias = "etcdKeyFile")]
    pub store_key_file: Option<String>,
    #[serde(
        rename = "storeTrustedCAFile",
        alias = "etcdTrustedCAFile",
        alias = "etcdTrustedCAFileFile"
    )]
    pub store_trusted_ca_file: Option<String>,
    pub store_root: Option<String>,
    /// per-request store deadline in seconds
    pub store_timeout: Option<u64>,
    pub probe_attempts: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub subnet_min: Ipv4Addr,
    pub subnet_max: Ipv4Addr,
    pub subnet_len: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    pub network: Ipv4Net,
    pub probe_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyConfig {
    Node(NodeConfig),
    Cluster(ClusterConfig),
}

impl StrategyConfig {
    pub fn strategy(&self) -> Strategy {
        match self {
            StrategyConfig::Node(_) => Strategy::Node,
            StrategyConfig::Cluster(_) => Strategy::Cluster,
        }
    }
}

/// Validated allocator configuration; nothing here touches the store yet.
#[derive(Debug, Clone)]
pub struct IpamSettings {
    pub strategy: StrategyConfig,
    pub store: StoreOptions,
    pub store_root: String,
}

impl IpamSettings {
    pub fn key_space(&self) -> KeySpace {
        KeySpace::new(&self.store_root, self.strategy.strategy())
    }
}

impl IpamConf {
    pub fn validated(&self) -> Result<IpamSettings, ConfigError> {
        let strategy = match non_empty(&self.ip_type) {
            Some(ip_type) => ip_type.parse()?,
            None => Strategy::default(),
        };

        let strategy = match strategy {
            Strategy::Node => StrategyConfig::Node(self.node_config()?),
            Strategy::Cluster => StrategyConfig::Cluster(self.cluster_config()?),
        };

        Ok(IpamSettings {
            strategy,
            store: self.store_options()?,
            store_root: non_empty(&self.store_root)
                .unwrap_or(DEFAULT_STORE_ROOT)
                .to_owned(),
        })
    }

    fn node_config(&self) -> Result<NodeConfig, ConfigError> {
        let subnet_len = self
            .subnet_len
            .ok_or(ConfigError::MissingField("subnetLen"))?;

        if !(MIN_SUBNET_LEN..=MAX_SUBNET_LEN).contains(&subnet_len) {
            return Err(ConfigError::SubnetLenOutOfRange(subnet_len));
        }

        let subnet_min = parse_address("subnetMin", &self.subnet_min)?;
        let subnet_max = parse_address("subnetMax", &self.subnet_max)?;

        let block = block_size(subnet_len)
            .map_err(|source| ConfigError::InvalidAddress { field: "subnetLen", source })?;

        if u32::from(subnet_min) % block != 0 {
            return Err(ConfigError::UnalignedSubnetMin(subnet_min, subnet_len));
        }

        if subnet_min > subnet_max {
            return Err(ConfigError::InvertedSubnetRange(subnet_min, subnet_max));
        }

        Ok(NodeConfig {
            subnet_min,
            subnet_max,
            subnet_len,
        })
    }

    fn cluster_config(&self) -> Result<ClusterConfig, ConfigError> {
        let raw = non_empty(&self.network).ok_or(ConfigError::MissingField("network"))?;
        let network = raw
            .parse::<Ipv4Net>()
            .map_err(|_| ConfigError::InvalidNetwork {
                field: "network",
                value: raw.to_owned(),
            })?;

        if !(MIN_SUBNET_LEN..=MAX_SUBNET_LEN).contains(&network.prefix_len()) {
            return Err(ConfigError::SubnetLenOutOfRange(network.prefix_len()));
        }

        let probe_attempts = self.probe_attempts.unwrap_or(DEFAULT_PROBE_ATTEMPTS);

        if probe_attempts == 0 {
            return Err(ConfigError::ZeroProbeAttempts);
        }

        Ok(ClusterConfig {
            network: network.trunc(),
            probe_attempts,
        })
    }

    fn store_options(&self) -> Result<StoreOptions, ConfigError> {
        let endpoint = non_empty(&self.store_url).ok_or(ConfigError::MissingField("storeURL"))?;
        let cert_file = non_empty(&self.store_cert_file).map(PathBuf::from);
        let key_file = non_empty(&self.store_key_file).map(PathBuf::from);

        let options = StoreOptionsBuilder::default()
            .endpoint(endpoint)
            .cert_file(cert_file)
            .key_file(key_file)
            .trusted_ca_file(non_empty(&self.store_trusted_ca_file).map(PathBuf::from))
            .timeout(
                self.store_timeout
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_STORE_TIMEOUT),
            )
            .build()
            .map_err(ConfigError::StoreOptions)?;

        if options.is_secure() && (options.cert_file.is_none() || options.key_file.is_none()) {
            return Err(ConfigError::MissingClientIdentity(options.endpoint));
        }

        Ok(options)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn parse_address(field: &'static str, value: &Option<String>) -> Result<Ipv4Addr, ConfigError> {
    let raw = non_empty(value).ok_or(ConfigError::MissingField(field))?;

    address_to_integer(raw)
        .map(integer_to_address)
        .map_err(|source| ConfigError::InvalidAddress { field, source })
}

#[cfg(test)]
mod tests {
    use std::{net::Ipv4Addr, path::PathBuf, time::Duration};

    use crate::ip::AddressError;

    use super::{
        ClusterConfig, ConfigError, NetConf, NodeConfig, Strategy, StrategyConfig,
        DEFAULT_PROBE_ATTEMPTS,
    };

    const NODE_CONF: &str = r#"{
        "cniVersion": "0.3.1",
        "name": "ovs-net",
        "type": "ovs",
        "ipam": {
            "type": "centralip",
            "ipType": "node",
            "network": "10.245.0.0/16",
            "subnetLen": 24,
            "subnetMin": "10.245.5.0",
            "subnetMax": "10.245.50.0",
            "etcdURL": "http://127.0.0.1:2379"
        }
    }"#;

    fn conf_with(ipam: &str) -> NetConf {
        NetConf::from_slice(format!(r#"{{"cniVersion":"0.4.0","ipam":{ipam}}}"#).as_bytes())
            .unwrap()
    }

    #[test]
    fn node_configuration_is_validated() {
        let settings = NetConf::from_slice(NODE_CONF.as_bytes())
            .unwrap()
            .ipam
            .validated()
            .unwrap();

        assert_eq!(
            settings.strategy,
            StrategyConfig::Node(NodeConfig {
                subnet_min: Ipv4Addr::new(10, 245, 5, 0),
                subnet_max: Ipv4Addr::new(10, 245, 50, 0),
                subnet_len: 24,
            })
        );
        assert_eq!(settings.store.endpoint, "http://127.0.0.1:2379");
        assert_eq!(settings.store.timeout, Duration::from_secs(5));
        assert_eq!(settings.store_root, "/ovs-cni/networks");
        assert_eq!(
            settings.key_space().host_subnet("h"),
            "/ovs-cni/networks/node/h"
        );
    }

    #[test]
    fn ip_type_defaults_to_node() {
        let conf = conf_with(
            r#"{"subnetLen":24,"subnetMin":"10.0.0.0","subnetMax":"10.0.2.0","storeURL":"http://etcd:2379"}"#,
        );

        assert_eq!(conf.ipam.validated().unwrap().strategy.strategy(), Strategy::Node);
    }

    #[test]
    fn cluster_configuration_is_validated() {
        let conf = conf_with(
            r#"{"ipType":"cluster","network":"172.16.3.7/22","storeURL":"http://etcd:2379","probeAttempts":5,"storeTimeout":2,"storeRoot":"/x/"}"#,
        );
        let settings = conf.ipam.validated().unwrap();

        assert_eq!(
            settings.strategy,
            StrategyConfig::Cluster(ClusterConfig {
                network: "172.16.0.0/22".parse().unwrap(),
                probe_attempts: 5,
            })
        );
        assert_eq!(settings.store.timeout, Duration::from_secs(2));
        assert_eq!(settings.key_space().lease_prefix(None), "/x/cluster/used/");
    }

    #[test]
    fn cluster_probe_attempts_default_to_twenty() {
        let conf = conf_with(
            r#"{"ipType":"cluster","network":"172.16.0.0/16","storeURL":"http://e"}"#,
        );

        match conf.ipam.validated().unwrap().strategy {
            StrategyConfig::Cluster(cluster) => {
                assert_eq!(cluster.probe_attempts, DEFAULT_PROBE_ATTEMPTS)
            }
            other => panic!("unexpected strategy {other:?}"),
        }
    }

    #[test]
    fn unknown_strategy_fails_fast() {
        let conf = conf_with(r#"{"ipType":"region","storeURL":"http://e"}"#);

        assert!(matches!(
            conf.ipam.validated(),
            Err(ConfigError::UnknownStrategy(name)) if name == "region"
        ));
    }

    #[test]
    fn missing_fields_are_reported_by_name() {
        let conf = conf_with(
            r#"{"subnetMin":"10.0.0.0","subnetMax":"10.0.2.0","storeURL":"http://e"}"#,
        );
        assert!(matches!(conf.ipam.validated(), Err(ConfigError::MissingField("subnetLen"))));

        let conf = conf_with(r#"{"subnetLen":24,"subnetMin":"10.0.0.0","subnetMax":"10.0.2.0"}"#);
        assert!(matches!(conf.ipam.validated(), Err(ConfigError::MissingField("storeURL"))));

        let conf = conf_with(r#"{"ipType":"cluster","storeURL":"http://e"}"#);
        assert!(matches!(conf.ipam.validated(), Err(ConfigError::MissingField("network"))));
    }

    #[test]
    fn ipv6_ranges_are_rejected() {
        let conf = conf_with(
            r#"{"subnetLen":24,"subnetMin":"fd00::","subnetMax":"10.0.2.0","storeURL":"http://e"}"#,
        );

        assert!(matches!(
            conf.ipam.validated(),
            Err(ConfigError::InvalidAddress {
                field: "subnetMin",
                source: AddressError::NotIpv4(_)
            })
        ));
    }

    #[test]
    fn subnet_range_shape_is_checked() {
        let conf = conf_with(
            r#"{"subnetLen":31,"subnetMin":"10.0.0.0","subnetMax":"10.0.2.0","storeURL":"http://e"}"#,
        );
        assert!(matches!(conf.ipam.validated(), Err(ConfigError::SubnetLenOutOfRange(31))));

        let conf = conf_with(
            r#"{"subnetLen":24,"subnetMin":"10.0.0.128","subnetMax":"10.0.2.0","storeURL":"http://e"}"#,
        );
        assert!(matches!(conf.ipam.validated(), Err(ConfigError::UnalignedSubnetMin(_, 24))));

        let conf = conf_with(
            r#"{"subnetLen":24,"subnetMin":"10.0.3.0","subnetMax":"10.0.2.0","storeURL":"http://e"}"#,
        );
        assert!(matches!(conf.ipam.validated(), Err(ConfigError::InvertedSubnetRange(_, _))));
    }

    #[test]
    fn secure_endpoints_need_a_client_identity() {
        let conf = conf_with(
            r#"{"ipType":"cluster","network":"10.0.0.0/16","storeURL":"https://etcd:2379","storeCertFile":"/etc/c.pem"}"#,
        );
        assert!(matches!(conf.ipam.validated(), Err(ConfigError::MissingClientIdentity(_))));

        let conf = conf_with(
            r#"{"ipType":"cluster","network":"10.0.0.0/16","etcdURL":"https://etcd:2379","etcdCertFile":"/etc/c.pem","etcdKeyFile":"/etc/k.pem","etcdTrustedCAFileFile":"/etc/ca.pem"}"#,
        );
        let store = conf.ipam.validated().unwrap().store;

        assert_eq!(store.cert_file, Some(PathBuf::from("/etc/c.pem")));
        assert_eq!(store.key_file, Some(PathBuf::from("/etc/k.pem")));
        assert_eq!(store.trusted_ca_file, Some(PathBuf::from("/etc/ca.pem")));
    }

    #[test]
    fn empty_tls_paths_count_as_unset() {
        let conf = conf_with(
            r#"{"ipType":"cluster","network":"10.0.0.0/16","storeURL":"http://e","storeCertFile":"","storeKeyFile":" "}"#,
        );

        assert!(conf.ipam.validated().unwrap().store.cert_file.is_none());
    }

    #[test]
    fn malformed_documents_are_decode_errors() {
        assert!(matches!(NetConf::from_slice(b"{not json"), Err(ConfigError::Decode(_))));
        assert!(matches!(
            NetConf::from_slice(br#"{"cniVersion":"0.4.0"}"#),
            Err(ConfigError::Decode(_))
        ));
    }
}
