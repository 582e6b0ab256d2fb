// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use custodia::{
    config::load_config,
    server::service::Server,
    signal_handler,
};
use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan, layer::SubscriberExt};

// The path, relative to $CONFIGURATION_DIRECTORY, of the default config file.
const DEFAULT_CONFIG: &str = "custodia/server.toml";

/// The custodia signing server.
///
/// Clients authenticate with TLS client certificates and request signatures
/// from keys held by the configured custodians. To begin, you'll need to
/// provide a configuration file; consult the `config` subcommand for the
/// current format.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// The path to the server's configuration file.
    #[arg(long, short, env = "CUSTODIA_SERVER_CONFIG")]
    config: Option<PathBuf>,

    /// A set of one or more comma-separated directives to filter logs.
    ///
    /// The general format is "target_name[span_name{field=value}]=level"
    /// where level is one of TRACE, DEBUG, INFO, WARN, ERROR.
    #[arg(long, env = "CUSTODIA_SERVER_LOG", default_value = "WARN,custodia=INFO")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Run the service.
    Listen {
        /// The directory containing the service's secrets.
        ///
        /// Any file referenced in the configuration that is not an
        /// absolute path is expected to be in this directory. When run
        /// under systemd, a `LoadCredential=` directive sets the
        /// environment variable automatically.
        #[arg(long, env = "CREDENTIALS_DIRECTORY")]
        credentials_directory: PathBuf,
    },

    /// Validate and print the current server configuration.
    Config {},
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Cli::parse();

    let log_filter = EnvFilter::builder().parse(&opts.log_filter).context(
        "CUSTODIA_SERVER_LOG contains an invalid log directive; refer to \
            the tracing-subscriber EnvFilter documentation for format details.",
    )?;
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(log_filter);
    tracing::subscriber::set_global_default(registry)
        .expect("Programming error: set_global_default should only be called once.");

    let mut config = match load_config(opts.config, PathBuf::from(DEFAULT_CONFIG).as_path()) {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(?error, "configuration is unusable");
            std::process::exit(1);
        }
    };

    match opts.command {
        Command::Listen {
            credentials_directory,
        } => {
            if let Err(error) = config
                .server
                .credentials
                .with_credentials_dir(&credentials_directory)
            {
                tracing::error!(?error, "credentials are unusable");
                std::process::exit(1);
            }

            let server = match Server::new(config) {
                Ok(server) => server,
                Err(error) => {
                    tracing::error!(?error, "failed to initialize the server");
                    std::process::exit(1);
                }
            };
            let listener = server.run();
            tokio::spawn(signal_handler(listener.halt_token()));

            // Watchdog: when every pool has been disabled by fatal
            // custodian errors the service cannot sign anything again
            // without a restart.
            let all_dead = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
            {
                let state = listener.state();
                let halt = listener.halt_token();
                let all_dead = all_dead.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        if state.all_pools_disabled() {
                            tracing::error!("every worker pool is dead; shutting down");
                            all_dead.store(true, std::sync::atomic::Ordering::Relaxed);
                            halt.cancel();
                            break;
                        }
                    }
                });
            }

            match listener.wait_to_finish().await {
                Ok(()) => {
                    if all_dead.load(std::sync::atomic::Ordering::Relaxed) {
                        std::process::exit(2);
                    }
                }
                Err(error) => {
                    tracing::error!(?error, "server failed");
                    std::process::exit(1);
                }
            }
        }
        Command::Config {} => {
            println!("# This is the current configuration\n\n{config}");
        }
    };

    Ok(())
}
