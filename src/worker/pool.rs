// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Per-token worker pool.
//!
//! Each token gets `num_workers` workers behind one strict-FIFO queue.
//! Workers are respawned with capped exponential backoff when they die or
//! go sick; requests that lost their custodian session are transparently
//! retried on a fresh worker.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{Isolation, KeyConfig, TokenConfig};
use crate::error::{BackendError, ErrorClass, SignError};
use crate::protocol::{DigestAlgorithm, KeyInfo};
use crate::worker::Client;

/// Grace period between a shutdown request and forced termination.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

const BASE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Respawn backoff is capped here.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

enum PoolOp {
    Sign {
        key: String,
        digest: Vec<u8>,
        algorithm: DigestAlgorithm,
    },
    KeyInfo {
        key: String,
    },
    PgpSign {
        key: String,
        payload: Bytes,
    },
}

enum PoolReply {
    Signature(Vec<u8>),
    KeyInfo(KeyInfo),
    PgpSignature(Vec<u8>),
}

struct PoolRequest {
    op: PoolOp,
    attempts: u32,
    response_tx: oneshot::Sender<Result<PoolReply, BackendError>>,
}

/// Exponential backoff with jitter for worker respawns.
/// Full-jitter strategy: sleep = random(0, min(cap, base * 2^attempt)).
fn backoff_with_jitter(attempt: u32) -> Duration {
    let exp_ms = BASE_RETRY_DELAY.as_millis() as u64 * 2u64.saturating_pow(attempt);
    let capped_ms = exp_ms.min(MAX_RETRY_DELAY.as_millis() as u64);
    let jitter_ms = if capped_ms > 0 {
        rand::random::<u64>() % capped_ms
    } else {
        0
    };
    Duration::from_millis(jitter_ms)
}

struct Shared {
    token: TokenConfig,
    keys: Vec<KeyConfig>,
    pin: Option<String>,
    worker_executable: Option<PathBuf>,
    worker_socket: Option<PathBuf>,
    request_tx: mpsc::UnboundedSender<PoolRequest>,
    request_rx: Mutex<mpsc::UnboundedReceiver<PoolRequest>>,
    healthy_workers: AtomicUsize,
    /// Consecutive health-check failures across the pool; any success
    /// resets it.
    check_failures: AtomicU32,
    /// Set when a Fatal custodian error disables the pool for good.
    disabled: AtomicBool,
    halt: CancellationToken,
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    tracker: TaskTracker,
}

impl WorkerPool {
    pub fn new(
        token: TokenConfig,
        keys: Vec<KeyConfig>,
        pin: Option<String>,
        worker_executable: Option<PathBuf>,
        worker_socket: Option<PathBuf>,
    ) -> Self {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            token,
            keys,
            pin,
            worker_executable,
            worker_socket,
            request_tx,
            request_rx: Mutex::new(request_rx),
            healthy_workers: AtomicUsize::new(0),
            check_failures: AtomicU32::new(0),
            disabled: AtomicBool::new(false),
            halt: CancellationToken::new(),
        });

        let tracker = TaskTracker::new();
        for index in 0..shared.token.num_workers {
            let shared = shared.clone();
            tracker.spawn(worker_loop(shared, index));
        }
        tracker.close();

        Self { shared, tracker }
    }

    pub fn token_name(&self) -> &str {
        &self.shared.token.name
    }

    pub fn cache_ttl(&self) -> Duration {
        self.shared.token.cache_ttl()
    }

    /// Healthy means at least one live worker, no fatal error, and the
    /// health-check failure budget not exhausted.
    pub fn healthy(&self) -> bool {
        !self.shared.disabled.load(Ordering::Relaxed)
            && self.shared.healthy_workers.load(Ordering::Relaxed) > 0
            && self.shared.check_failures.load(Ordering::Relaxed) < self.shared.token.check_failures
    }

    pub fn healthy_workers(&self) -> usize {
        self.shared.healthy_workers.load(Ordering::Relaxed)
    }

    pub fn worker_count(&self) -> usize {
        self.shared.token.num_workers
    }

    pub fn is_disabled(&self) -> bool {
        self.shared.disabled.load(Ordering::Relaxed)
    }

    async fn submit(&self, op: PoolOp) -> Result<PoolReply, SignError> {
        if self.shared.disabled.load(Ordering::Relaxed) {
            return Err(SignError::TokenUnavailable(
                self.shared.token.name.clone(),
            ));
        }
        let (response_tx, response_rx) = oneshot::channel();
        self.shared
            .request_tx
            .send(PoolRequest {
                op,
                attempts: 0,
                response_tx,
            })
            .map_err(|_| SignError::TokenUnavailable(self.shared.token.name.clone()))?;

        // The request waits up to the token deadline for a worker to take
        // it and answer; if the pool never recovered in that window the
        // caller gets a retryable TokenUnavailable instead of Timeout.
        match tokio::time::timeout(self.shared.token.timeout(), response_rx).await {
            Ok(Ok(result)) => result.map_err(SignError::from),
            Ok(Err(_)) => Err(SignError::TokenUnavailable(
                self.shared.token.name.clone(),
            )),
            Err(_) => {
                if self.healthy() {
                    Err(SignError::Timeout)
                } else {
                    Err(SignError::TokenUnavailable(
                        self.shared.token.name.clone(),
                    ))
                }
            }
        }
    }

    pub async fn sign(
        &self,
        key: &str,
        digest: &[u8],
        algorithm: DigestAlgorithm,
    ) -> Result<Vec<u8>, SignError> {
        match self
            .submit(PoolOp::Sign {
                key: key.to_string(),
                digest: digest.to_vec(),
                algorithm,
            })
            .await?
        {
            PoolReply::Signature(signature) => Ok(signature),
            _ => Err(SignError::Internal(anyhow::anyhow!(
                "pool returned a mismatched reply"
            ))),
        }
    }

    pub async fn key_info(&self, key: &str) -> Result<KeyInfo, SignError> {
        match self
            .submit(PoolOp::KeyInfo {
                key: key.to_string(),
            })
            .await?
        {
            PoolReply::KeyInfo(info) => Ok(info),
            _ => Err(SignError::Internal(anyhow::anyhow!(
                "pool returned a mismatched reply"
            ))),
        }
    }

    pub async fn pgp_sign(&self, key: &str, payload: Bytes) -> Result<Vec<u8>, SignError> {
        match self
            .submit(PoolOp::PgpSign {
                key: key.to_string(),
                payload,
            })
            .await?
        {
            PoolReply::PgpSignature(signature) => Ok(signature),
            _ => Err(SignError::Internal(anyhow::anyhow!(
                "pool returned a mismatched reply"
            ))),
        }
    }

    /// Drain the pool: workers finish their current request, receive a
    /// shutdown, and are killed after a grace period.
    pub async fn shutdown(&self) {
        self.shared.halt.cancel();
        self.tracker.wait().await;
    }
}

async fn spawn_client(shared: &Shared) -> Result<Client, BackendError> {
    match shared.token.isolation {
        Isolation::Process => {
            // Socket-activated workers are connected to, not spawned.
            if let Some(socket) = &shared.worker_socket {
                return Client::connect(socket, &shared.token, &shared.keys, shared.pin.clone())
                    .await;
            }
            let executable = match &shared.worker_executable {
                Some(path) => path.clone(),
                None => {
                    let mut path = std::env::current_exe().map_err(|e| {
                        BackendError::Fatal(format!("cannot locate the worker executable: {e}"))
                    })?;
                    path.set_file_name("custodia-worker");
                    path
                }
            };
            Client::spawn(&executable, &shared.token, &shared.keys, shared.pin.clone()).await
        }
        Isolation::Task => {
            Client::in_process(&shared.token, &shared.keys, shared.pin.clone()).await
        }
    }
}

async fn handle_request(client: &mut Client, token: &TokenConfig, op: &PoolOp) -> Result<PoolReply, BackendError> {
    let operation = async {
        match op {
            PoolOp::Sign {
                key,
                digest,
                algorithm,
            } => client
                .sign(key, digest, *algorithm)
                .await
                .map(PoolReply::Signature),
            PoolOp::KeyInfo { key } => client.key_info(key).await.map(PoolReply::KeyInfo),
            PoolOp::PgpSign { key, payload } => client
                .pgp_sign(key, payload.clone())
                .await
                .map(PoolReply::PgpSignature),
        }
    };
    match tokio::time::timeout(token.timeout(), operation).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout),
    }
}

#[tracing::instrument(skip(shared), fields(token = %shared.token.name))]
async fn worker_loop(shared: Arc<Shared>, index: usize) {
    let mut boot_failures: u32 = 0;
    'respawn: loop {
        if shared.halt.is_cancelled() || shared.disabled.load(Ordering::Relaxed) {
            return;
        }

        // Booting: open a client with capped exponential backoff.
        let mut client = match spawn_client(&shared).await {
            Ok(client) => {
                boot_failures = 0;
                client
            }
            Err(error) => {
                if error.classify() == ErrorClass::Permanent {
                    tracing::error!(%error, index, "worker cannot boot; disabling pool");
                    shared.disabled.store(true, Ordering::Relaxed);
                    return;
                }
                boot_failures += 1;
                let delay = backoff_with_jitter(boot_failures);
                tracing::warn!(%error, index, attempt = boot_failures, ?delay, "worker boot failed; retrying");
                tokio::select! {
                    _ = shared.halt.cancelled() => return,
                    _ = tokio::time::sleep(delay) => continue 'respawn,
                }
            }
        };

        shared.healthy_workers.fetch_add(1, Ordering::Relaxed);
        tracing::info!(index, "worker is healthy");
        let mut check_interval = tokio::time::interval(shared.token.check_interval());
        check_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        check_interval.reset();

        loop {
            tokio::select! {
                _ = shared.halt.cancelled() => {
                    shared.healthy_workers.fetch_sub(1, Ordering::Relaxed);
                    client.shutdown(SHUTDOWN_GRACE).await;
                    tracing::info!(index, "worker drained and shut down");
                    return;
                }
                _ = check_interval.tick() => {
                    let ping = tokio::time::timeout(shared.token.check_timeout(), client.ping()).await;
                    match ping {
                        Ok(Ok(())) => {
                            shared.check_failures.store(0, Ordering::Relaxed);
                        }
                        Ok(Err(error)) => {
                            let failures = shared.check_failures.fetch_add(1, Ordering::Relaxed) + 1;
                            tracing::warn!(%error, index, failures, "health check failed; replacing worker");
                            shared.healthy_workers.fetch_sub(1, Ordering::Relaxed);
                            client.kill().await;
                            continue 'respawn;
                        }
                        Err(_) => {
                            let failures = shared.check_failures.fetch_add(1, Ordering::Relaxed) + 1;
                            tracing::warn!(index, failures, "health check timed out; replacing worker");
                            shared.healthy_workers.fetch_sub(1, Ordering::Relaxed);
                            client.kill().await;
                            continue 'respawn;
                        }
                    }
                }
                request = async {
                    let mut rx = shared.request_rx.lock().await;
                    rx.recv().await
                } => {
                    let Some(request) = request else {
                        shared.healthy_workers.fetch_sub(1, Ordering::Relaxed);
                        client.shutdown(SHUTDOWN_GRACE).await;
                        return;
                    };
                    match handle_request(&mut client, &shared.token, &request.op).await {
                        Ok(reply) => {
                            let _ = request.response_tx.send(Ok(reply));
                        }
                        Err(error) => {
                            let transient = error.classify() == ErrorClass::Transient;
                            let retry = matches!(error, BackendError::SessionLost(_))
                                && request.attempts < shared.token.retries;
                            if retry {
                                // A lost session is retried on a fresh
                                // worker, within the retry budget.
                                tracing::warn!(%error, index, attempt = request.attempts, "retrying request on a fresh worker");
                                let _ = shared.request_tx.send(PoolRequest {
                                    op: request.op,
                                    attempts: request.attempts + 1,
                                    response_tx: request.response_tx,
                                });
                            } else {
                                if let BackendError::Fatal(ref reason) = error {
                                    tracing::error!(%reason, index, "fatal custodian error; disabling pool");
                                    shared.disabled.store(true, Ordering::Relaxed);
                                }
                                let _ = request.response_tx.send(Err(error));
                            }
                            if transient {
                                // A worker whose session died or whose
                                // operation timed out cannot be trusted;
                                // replace it. Permanent errors leave the
                                // worker in place.
                                shared.healthy_workers.fetch_sub(1, Ordering::Relaxed);
                                client.kill().await;
                                continue 'respawn;
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Pkcs11User, TokenKind};
    use std::io::Write as _;

    fn file_token(path: &std::path::Path, workers: usize) -> TokenConfig {
        TokenConfig {
            name: "softkey".to_string(),
            kind: TokenKind::File,
            provider: Some(path.display().to_string()),
            label: None,
            serial: None,
            pin: None,
            user: Pkcs11User::default(),
            isolation: Isolation::Task,
            num_workers: workers,
            timeout: 5,
            retries: 2,
            check_interval: 60,
            check_timeout: 5,
            check_failures: 3,
            cache_seconds: 600,
        }
    }

    fn test_keys() -> Vec<KeyConfig> {
        vec![KeyConfig {
            name: "release".to_string(),
            token: Some("softkey".to_string()),
            ..Default::default()
        }]
    }

    fn write_rsa_key() -> tempfile::NamedTempFile {
        let rsa = openssl::rsa::Rsa::generate(2048).unwrap();
        let pkey = openssl::pkey::PKey::from_rsa(rsa).unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&pkey.private_key_to_pem_pkcs8().unwrap())
            .unwrap();
        file
    }

    #[tokio::test]
    async fn concurrent_signs_on_one_worker_complete_in_order() {
        let key_file = write_rsa_key();
        let pool = Arc::new(WorkerPool::new(
            file_token(key_file.path(), 1),
            test_keys(),
            None,
            None,
            None,
        ));
        let digest =
            openssl::hash::hash(openssl::hash::MessageDigest::sha256(), b"payload").unwrap();

        let order = Arc::new(std::sync::Mutex::new(vec![]));
        let mut handles = vec![];
        for i in 0..4 {
            let pool = pool.clone();
            let order = order.clone();
            let digest = digest.to_vec();
            handles.push(tokio::spawn(async move {
                let result = pool
                    .sign("release", &digest, DigestAlgorithm::Sha256)
                    .await;
                order.lock().unwrap().push(i);
                result
            }));
            // Stagger submissions so queue order matches loop order.
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn key_not_found_is_not_retried() {
        let key_file = write_rsa_key();
        let pool = WorkerPool::new(file_token(key_file.path(), 1), test_keys(), None, None, None);
        let digest = [0u8; 32];
        let error = pool
            .sign("missing", &digest, DigestAlgorithm::Sha256)
            .await
            .unwrap_err();
        assert!(matches!(error, SignError::KeyNotFound(_)));
        // The pool stays healthy after a permanent per-key error.
        let good = openssl::hash::hash(openssl::hash::MessageDigest::sha256(), b"x").unwrap();
        assert!(pool
            .sign("release", &good, DigestAlgorithm::Sha256)
            .await
            .is_ok());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn boot_failure_reports_unavailable() {
        let token = file_token(std::path::Path::new("/nonexistent/key.pem"), 1);
        let pool = WorkerPool::new(token, test_keys(), None, None, None);
        // Workers never get healthy; the submit deadline converts into
        // TokenUnavailable.
        let digest = [0u8; 32];
        let error = pool
            .sign("release", &digest, DigestAlgorithm::Sha256)
            .await
            .unwrap_err();
        assert!(matches!(error, SignError::TokenUnavailable(_)));
        assert!(!pool.healthy());
        pool.shutdown().await;
    }

    #[test]
    fn backoff_is_capped() {
        for attempt in 0..20 {
            assert!(backoff_with_jitter(attempt) <= MAX_RETRY_DELAY);
        }
    }
}
