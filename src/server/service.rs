// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The custodia server: listeners, TLS, and request dispatch plumbing.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Context;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use openssl::ssl::{Ssl, SslAcceptor};
use openssl::x509::X509;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_openssl::SslStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, instrument};

use crate::audit::AuditSink;
use crate::auth::Authenticator;
use crate::cache::KeyInfoCache;
use crate::config::{Config, KeyConfig};
use crate::server::handlers;
use crate::timestamp::Timestamper;
use crate::worker::WorkerPool;

/// Everything a request handler needs, frozen at startup.
pub struct AppState {
    pub config: Arc<Config>,
    pub auth: Authenticator,
    /// One pool per configured token.
    pub pools: HashMap<String, Arc<WorkerPool>>,
    pub cache: KeyInfoCache,
    pub timestamper: Timestamper,
    pub audit: AuditSink,
    /// Server-wide concurrency limit; exhausted means 503 Busy.
    pub limiter: Semaphore,
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let pin_file = config.load_pin_file()?;

        let mut pools = HashMap::new();
        for token in &config.tokens {
            let keys: Vec<KeyConfig> = config
                .keys
                .iter()
                .filter(|key| key.token.as_deref() == Some(token.name.as_str()))
                .cloned()
                .collect();
            let pin = token.resolve_pin(&pin_file);
            pools.insert(
                token.name.clone(),
                Arc::new(WorkerPool::new(
                    token.clone(),
                    keys,
                    pin,
                    config.server.worker_executable.clone(),
                    config.server.worker_socket_path.clone(),
                )),
            );
        }

        let auth = Authenticator::new(&config)?;
        let timestamper = Timestamper::new(config.timestamp.clone())?;
        let audit = AuditSink::new(&config.audit)?;
        let limiter = Semaphore::new(config.server.concurrency);

        Ok(Self {
            config,
            auth,
            pools,
            cache: KeyInfoCache::new(),
            timestamper,
            audit,
            limiter,
        })
    }

    pub fn pool_for(&self, key: &KeyConfig) -> Option<&Arc<WorkerPool>> {
        key.token.as_deref().and_then(|token| self.pools.get(token))
    }

    /// True once every pool has been disabled by a fatal custodian error.
    pub fn all_pools_disabled(&self) -> bool {
        !self.pools.is_empty() && self.pools.values().all(|pool| pool.is_disabled())
    }

    /// Drop cached key info belonging to dead pools.
    pub fn sweep_cache(&self) {
        for pool in self.pools.values() {
            if pool.is_disabled() {
                let keys: Vec<&str> = self
                    .config
                    .keys
                    .iter()
                    .filter(|key| key.token.as_deref() == Some(pool.token_name()))
                    .map(|key| key.name.as_str())
                    .collect();
                self.cache.invalidate_keys(keys);
            }
        }
    }
}

/// What the connection layer learned about the peer.
#[derive(Clone)]
pub struct Peer {
    pub addr: SocketAddr,
    pub certificate: Option<Arc<X509>>,
}

pub struct Server {
    state: Arc<AppState>,
}

pub struct Listener {
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
    halt_token: CancellationToken,
    state: Arc<AppState>,
}

impl Listener {
    /// Stop accepting new connections and wait for in-flight requests and
    /// pools to drain.
    pub async fn halt(self) -> anyhow::Result<()> {
        self.halt_token.cancel();
        self.task.await??;
        Ok(())
    }

    pub fn halt_token(&self) -> CancellationToken {
        self.halt_token.clone()
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    pub async fn wait_to_finish(self) -> anyhow::Result<()> {
        self.task.await??;
        Ok(())
    }
}

/// Take over a listener handed down by the service manager, when present.
/// The first passed descriptor (fd 3) replaces the configured `listen`.
fn activated_listener() -> Option<std::net::TcpListener> {
    let pid: u32 = std::env::var("LISTEN_PID").ok()?.parse().ok()?;
    if pid != std::process::id() {
        return None;
    }
    let fds: i32 = std::env::var("LISTEN_FDS").ok()?.parse().ok()?;
    if fds < 1 {
        return None;
    }
    use std::os::fd::FromRawFd;
    // SAFETY: fd 3 is the first socket passed by the service manager and
    // is not otherwise owned by this process.
    Some(unsafe { std::net::TcpListener::from_raw_fd(3) })
}

/// ":6300" style addresses listen on all interfaces.
fn normalize_listen_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_string()
    }
}

impl Server {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        Ok(Self {
            state: Arc::new(AppState::new(config)?),
        })
    }

    /// Bind the listeners and run the accept loops.
    #[instrument(skip_all, name = "server")]
    pub fn run(self) -> Listener {
        let state = self.state.clone();
        let halt_token = CancellationToken::new();
        let server_halt_token = halt_token.clone();
        let task = tokio::spawn(async move {
            let acceptor = state
                .config
                .server
                .credentials
                .ssl_acceptor()
                .context("failed to build the TLS acceptor")?;

            let tls_listener = match activated_listener() {
                Some(listener) => {
                    tracing::info!("using the socket-activated listener");
                    listener.set_nonblocking(true)?;
                    TcpListener::from_std(listener)?
                }
                None => {
                    let addr = normalize_listen_addr(&state.config.server.listen);
                    TcpListener::bind(&addr)
                        .await
                        .with_context(|| format!("failed to bind {addr}"))?
                }
            };
            tracing::info!(addr = ?tls_listener.local_addr()?, "mTLS listener ready");

            let request_tracker = TaskTracker::new();
            let connection_tracker = TaskTracker::new();

            if let Some(plain_addr) = &state.config.server.listen_http {
                let addr = normalize_listen_addr(plain_addr);
                let plain_listener = TcpListener::bind(&addr)
                    .await
                    .with_context(|| format!("failed to bind {addr}"))?;
                tracing::info!(addr = ?plain_listener.local_addr()?, "plaintext listener ready");
                let state = state.clone();
                let halt = server_halt_token.clone();
                let requests = request_tracker.clone();
                connection_tracker.spawn(async move {
                    accept_plain(state, plain_listener, halt, requests).await;
                });
            }

            {
                let state = state.clone();
                let halt = server_halt_token.clone();
                let requests = request_tracker.clone();
                connection_tracker.spawn(async move {
                    accept_tls(state, tls_listener, acceptor, halt, requests).await;
                });
            }
            connection_tracker.close();

            server_halt_token.cancelled().await;
            tracing::info!("Shutdown requested, no new requests will be accepted");
            connection_tracker.wait().await;
            request_tracker.close();
            request_tracker.wait().await;

            for pool in state.pools.values() {
                pool.shutdown().await;
            }

            Ok::<_, anyhow::Error>(())
        });

        Listener {
            task,
            halt_token,
            state: self.state,
        }
    }
}

async fn accept_tls(
    state: Arc<AppState>,
    listener: TcpListener,
    acceptor: SslAcceptor,
    halt: CancellationToken,
    requests: TaskTracker,
) {
    loop {
        let (tcp_stream, addr) = tokio::select! {
            _ = halt.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(error) => {
                    tracing::error!(%error, "failed to accept incoming connection");
                    continue;
                }
            },
        };
        let acceptor = acceptor.clone();
        let state = state.clone();
        requests.spawn(
            async move {
                if let Err(error) = serve_tls_connection(state, acceptor, tcp_stream, addr).await {
                    tracing::debug!(%error, %addr, "connection ended with an error");
                }
            }
            .instrument(tracing::info_span!("conn", %addr)),
        );
    }
}

async fn serve_tls_connection(
    state: Arc<AppState>,
    acceptor: SslAcceptor,
    tcp_stream: TcpStream,
    addr: SocketAddr,
) -> anyhow::Result<()> {
    let ssl = Ssl::new(acceptor.context())?;
    let mut stream = SslStream::new(ssl, tcp_stream)?;
    Pin::new(&mut stream).accept().await?;
    let certificate = stream.ssl().peer_certificate().map(Arc::new);
    tracing::debug!(%addr, has_cert = certificate.is_some(), "TLS session established");

    let peer = Peer { addr, certificate };
    let io = TokioIo::new(stream);
    http1::Builder::new()
        .serve_connection(
            io,
            service_fn(move |req| handlers::handle(state.clone(), peer.clone(), req)),
        )
        .await?;
    Ok(())
}

async fn accept_plain(
    state: Arc<AppState>,
    listener: TcpListener,
    halt: CancellationToken,
    requests: TaskTracker,
) {
    loop {
        let (tcp_stream, addr) = tokio::select! {
            _ = halt.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(error) => {
                    tracing::error!(%error, "failed to accept incoming connection");
                    continue;
                }
            },
        };
        let state = state.clone();
        requests.spawn(
            async move {
                let peer = Peer {
                    addr,
                    certificate: None,
                };
                let io = TokioIo::new(tcp_stream);
                let served = http1::Builder::new()
                    .serve_connection(
                        io,
                        service_fn(move |req| handlers::handle(state.clone(), peer.clone(), req)),
                    )
                    .await;
                if let Err(error) = served {
                    tracing::debug!(%error, %addr, "connection ended with an error");
                }
            }
            .instrument(tracing::info_span!("conn", %addr)),
        );
    }
}
