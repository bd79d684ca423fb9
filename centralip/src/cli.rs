use clap::{Parser, ValueEnum};

/// CNI IPAM plugin leasing subnets and addresses from etcd.
///
/// Every argument is normally supplied by the container runtime through the
/// CNI_* environment variables; the flags exist for manual runs.
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Cli {
    /// CNI operation to perform
    #[arg(long, env = "CNI_COMMAND", value_enum)]
    pub command: CniCommand,
    /// id of the container the operation concerns, used as the lease owner
    #[arg(long, env = "CNI_CONTAINERID")]
    pub container_id: Option<String>,
    /// path to the container's network namespace
    #[arg(long, env = "CNI_NETNS")]
    pub netns: Option<String>,
    /// name of the interface inside the container
    #[arg(long, env = "CNI_IFNAME")]
    pub ifname: Option<String>,
    /// extra semicolon-separated KEY=VALUE arguments
    #[arg(long = "cni-args", env = "CNI_ARGS")]
    pub cni_args: Option<String>,
    /// plugin search path
    #[arg(long = "cni-path", env = "CNI_PATH")]
    pub cni_path: Option<String>,
    /// override the node hostname used to key the host subnet
    #[arg(long, env = "CENTRALIP_HOSTNAME")]
    pub hostname: Option<String>,
    /// enable verbose output
    #[arg(short = 'v', long = "verbose")]
    pub verbose_logging: bool,
    /// enable trace output (more detailed than verbose, overrides it if present)
    #[arg(long = "trace")]
    pub trace_logging: bool,
}

impl Cli {
    pub fn get_log_level(&self) -> LogLevel {
        if self.trace_logging {
            return LogLevel::Trace;
        }

        if self.verbose_logging {
            return LogLevel::Verbose;
        }

        LogLevel::Normal
    }

    /// The container id, which every command but VERSION requires.
    pub fn require_container_id(&self) -> Option<&str> {
        self.container_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

pub enum LogLevel {
    Normal,
    Verbose,
    Trace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CniCommand {
    #[value(name = "ADD")]
    Add,
    #[value(name = "DEL")]
    Del,
    #[value(name = "CHECK")]
    Check,
    #[value(name = "VERSION")]
    Version,
}
