// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

/*!
# Custodia

Custodia is a multi-tenant remote signing service. Clients submit artifacts
or digests over mutually-authenticated TLS and receive signatures produced
by private keys that never leave the server's trust boundary. The server
brokers access to heterogeneous key custodians: PKCS#11 hardware tokens,
OpenPGP smartcards via scdaemon, on-disk key files, and the Google Cloud,
Azure Key Vault, and AWS KMS services.

## Architecture

Each configured token gets a pool of isolated workers; a worker owns one
custodian session and serializes every operation on it, so a crashing or
misbehaving provider library takes down a replaceable subprocess rather
than the server. Signing requests flow through authentication, role-based
authorization against the named key, a key-info cache, the token's worker
pool, format-specific assembly (raw, PKCS#7/CMS, OpenPGP, ZIP-family
containers), and optional RFC 3161 or Microsoft Authenticode
timestamping.

Configuration is loaded once at startup, validated, and frozen; the server
holds no durable state beyond its TTL caches.

## Crate features

* **cli** -
  Include the `custodia-server` and `custodia-worker` binaries. This is a
  default feature.
*/

use tokio_util::sync::CancellationToken;

pub mod audit;
pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod pkcs7;
pub mod protocol;
pub mod server;
pub mod sign;
pub mod timestamp;
pub mod token;
pub mod worker;
pub mod zip;

/// Install and manage signal handlers for the process.
///
/// # SIGTERM and SIGINT
///
/// Sending SIGTERM or SIGINT to the process will cause it to stop accepting
/// new signing requests. Existing signing requests will be allowed to
/// complete before the process shuts down.
#[doc(hidden)]
pub async fn signal_handler(halt_token: CancellationToken) -> Result<(), anyhow::Error> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm_stream = signal(SignalKind::terminate()).inspect_err(|error| {
        tracing::error!(?error, "Failed to register a SIGTERM signal handler");
    })?;
    let mut sigint_stream = signal(SignalKind::interrupt()).inspect_err(|error| {
        tracing::error!(?error, "Failed to register a SIGINT signal handler");
    })?;

    loop {
        tokio::select! {
            _ = sigterm_stream.recv() => {
                tracing::info!("SIGTERM received, beginning service shutdown");
                halt_token.cancel();
            }
            _ = sigint_stream.recv() => {
                tracing::info!("SIGINT received, beginning service shutdown");
                halt_token.cancel();
            }
        }
    }
}
