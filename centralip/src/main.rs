use std::{io::Read, process::ExitCode};

use clap::{error::ErrorKind, Parser};
use cli::{Cli, CniCommand, LogLevel};
use commands::{
    add::add, check::check, del::del, version::print_version, version::LOCAL_CENTRALIP_VERSION,
};
use env_logger::Target;
use log::{debug, error, LevelFilter};
use result::{
    requested_version, CniError, ErrorCode, SerializableOutputDisplay, DEFAULT_CNI_VERSION,
};

mod cli;
mod commands;
mod result;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => error.exit(),
            _ => {
                let cni_error = CniError::new(
                    ErrorCode::InvalidEnvironment,
                    "Invalid CNI environment!",
                )
                .with_details(error.to_string().trim());

                return report(&cni_error, DEFAULT_CNI_VERSION);
            }
        },
    };

    configure_logging(&cli);

    debug!(
        "centralip {LOCAL_CENTRALIP_VERSION} handling {:?} for {:?} (netns: {:?}, ifname: {:?}, args: {:?}, path: {:?})",
        cli.command, cli.container_id, cli.netns, cli.ifname, cli.cni_args, cli.cni_path
    );

    let mut stdin = Vec::new();
    if let Err(read_error) = std::io::stdin().read_to_end(&mut stdin) {
        let cni_error =
            CniError::new(ErrorCode::Internal, "Couldn't read the network configuration!")
                .with_details(read_error);

        return report(&cni_error, DEFAULT_CNI_VERSION);
    }

    let outcome = match cli.command {
        CniCommand::Add => add(&cli, &stdin).await,
        CniCommand::Del => del(&cli, &stdin).await,
        CniCommand::Check => check(&cli, &stdin).await,
        CniCommand::Version => print_version(&stdin),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(command_error) => {
            let cni_error = CniError::from_anyhow(&command_error);
            let cni_version =
                requested_version(&stdin).unwrap_or_else(|| DEFAULT_CNI_VERSION.to_owned());

            error!("{command_error:#} (CNI code {})", cni_error.code);

            report(&cni_error, &cni_version)
        }
    }
}

/// Prints the CNI error document on stdout, where the runtime expects it.
fn report(cni_error: &CniError, cni_version: &str) -> ExitCode {
    if let Err(print_error) = cni_error.document(cni_version).print_json() {
        error!("Couldn't print the error document! {print_error}");
    }

    ExitCode::FAILURE
}

fn configure_logging(cli: &Cli) {
    let log_level = cli.get_log_level();
    let mut logger = env_logger::builder();

    logger
        .format_timestamp(None)
        .format_module_path(matches!(log_level, LogLevel::Trace))
        .format_target(false)
        .target(Target::Stderr);

    match log_level {
        LogLevel::Normal => {
            logger.filter(Some("centralip"), LevelFilter::Info);
            logger.filter(Some("centralip_core"), LevelFilter::Info);
        }
        LogLevel::Verbose => {
            logger.filter(Some("centralip"), LevelFilter::Debug);
            logger.filter(Some("centralip_core"), LevelFilter::Debug);
        }
        LogLevel::Trace => {
            logger.filter(None, LevelFilter::Trace);
        }
    }

    // an explicit RUST_LOG wins over the flags
    if let Ok(filters) = std::env::var("RUST_LOG") {
        logger.parse_filters(&filters);
    }

    logger.init();
}
