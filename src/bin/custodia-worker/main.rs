// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

/// A custodia token worker.
///
/// Spawned by the server (or by a socket unit), configured over stdin with
/// a single token descriptor, and holding exactly one custodian session for
/// its lifetime. You should not need to run this by hand.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// A set of one or more comma-separated directives to filter logs.
    #[arg(long, env = "CUSTODIA_WORKER_LOG", default_value = "WARN,custodia=INFO")]
    pub log_filter: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Cli::parse();

    let log_filter = EnvFilter::builder()
        .parse(&opts.log_filter)
        .context("CUSTODIA_WORKER_LOG contains an invalid log directive")?;
    // stdout carries the RPC; logs must go to stderr only.
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(log_filter);
    tracing::subscriber::set_global_default(registry)
        .expect("Programming error: set_global_default should only be called once.");

    custodia::worker::serve().await
}
