// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The worker-side loop.
//!
//! A worker owns exactly one custodian session and handles requests
//! strictly one at a time. The first message must configure it; every
//! operation after that is bounded by the token's per-operation deadline.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::config::TokenConfig;
use crate::error::BackendError;
use crate::protocol::{WireError, WorkerRequest, WorkerResponse};
use crate::token::Session;

/// Serve worker requests on stdin/stdout. This is the entry point of the
/// `custodia-worker` binary.
#[tracing::instrument(name = "custodia-worker")]
pub async fn serve() -> anyhow::Result<()> {
    serve_stream(tokio::io::stdin(), tokio::io::stdout()).await
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &WorkerResponse,
) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(response)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

fn failure(error: &BackendError) -> WorkerResponse {
    WorkerResponse::Failure {
        error: WireError::from(error),
    }
}

/// Serve worker requests over an arbitrary byte stream.
pub async fn serve_stream<R, W>(reader: R, mut writer: W) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut requests = BufReader::new(reader).lines();

    // The first message must configure this worker for one token.
    let (token, keys, pin) = match requests.next_line().await? {
        Some(line) => match serde_json::from_str::<WorkerRequest>(&line)? {
            WorkerRequest::Configure { token, keys, pin } => (token, keys, pin),
            _ => {
                anyhow::bail!("the first message must configure this worker");
            }
        },
        None => return Ok(()),
    };

    let mut session = match Session::open(&token, &keys, pin).await {
        Ok(session) => {
            write_response(&mut writer, &WorkerResponse::Ok {}).await?;
            session
        }
        Err(error) => {
            tracing::error!(%error, token = token.name, "failed to open custodian session");
            write_response(&mut writer, &failure(&error)).await?;
            return Ok(());
        }
    };
    tracing::debug!(token = token.name, "worker is configured and ready");

    loop {
        let Some(line) = requests.next_line().await? else {
            tracing::info!("worker received EOF and is shutting down");
            break;
        };
        let request: WorkerRequest = serde_json::from_str(&line)?;

        let response = match request {
            WorkerRequest::Configure { .. } => WorkerResponse::Failure {
                error: WireError::from(&BackendError::Fatal(
                    "worker cannot be configured twice".to_string(),
                )),
            },
            WorkerRequest::Sign {
                key,
                digest,
                algorithm,
            } => match handle_sign(&mut session, &token, &keys, &key, &digest, algorithm).await {
                Ok(signature) => WorkerResponse::Signature {
                    signature: hex::encode(signature),
                },
                Err(error) => failure(&error),
            },
            WorkerRequest::KeyInfo { key } => {
                let result = match find_key(&keys, &key) {
                    Ok(config) => {
                        bounded(&token, session.key_info(config)).await
                    }
                    Err(error) => Err(error),
                };
                match result {
                    Ok(info) => WorkerResponse::KeyInfo { info },
                    Err(error) => failure(&error),
                }
            }
            WorkerRequest::PgpSign { key, payload_size } => {
                let mut inner = requests.into_inner();
                let mut payload = vec![0; payload_size];
                inner.read_exact(&mut payload).await?;
                requests = inner.lines();

                let result = match find_key(&keys, &key) {
                    Ok(config) => bounded(&token, session.pgp_sign(config, &payload)).await,
                    Err(error) => Err(error),
                };
                match result {
                    Ok(signature) => {
                        write_response(
                            &mut writer,
                            &WorkerResponse::PgpSignature {
                                payload_size: signature.len(),
                            },
                        )
                        .await?;
                        writer.write_all(&signature).await?;
                        writer.flush().await?;
                        continue;
                    }
                    Err(error) => failure(&error),
                }
            }
            WorkerRequest::Ping {} => {
                let deadline = token.check_timeout();
                match tokio::time::timeout(deadline, session.ping()).await {
                    Ok(Ok(())) => WorkerResponse::Ok {},
                    Ok(Err(error)) => failure(&error),
                    Err(_) => failure(&BackendError::Timeout),
                }
            }
            WorkerRequest::Shutdown {} => {
                write_response(&mut writer, &WorkerResponse::Ok {}).await?;
                break;
            }
        };
        write_response(&mut writer, &response).await?;
    }

    session.close().await;
    Ok(())
}

fn find_key<'a>(
    keys: &'a [crate::config::KeyConfig],
    name: &str,
) -> Result<&'a crate::config::KeyConfig, BackendError> {
    keys.iter()
        .find(|key| key.name == name)
        .ok_or_else(|| BackendError::KeyNotFound(name.to_string()))
}

/// Bound an operation by the token's per-operation deadline.
///
/// This preempts async custodians (scdaemon, cloud); a blocking PKCS#11
/// call cannot be cancelled mid-flight, which is why the pool also times
/// the request and replaces the whole worker on expiry.
async fn bounded<T>(
    token: &TokenConfig,
    operation: impl Future<Output = Result<T, BackendError>>,
) -> Result<T, BackendError> {
    match tokio::time::timeout(token.timeout(), operation).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout),
    }
}

async fn handle_sign(
    session: &mut Session,
    token: &TokenConfig,
    keys: &[crate::config::KeyConfig],
    key: &str,
    digest_hex: &str,
    algorithm: crate::protocol::DigestAlgorithm,
) -> Result<Vec<u8>, BackendError> {
    let config = find_key(keys, key)?;
    let digest = hex::decode(digest_hex)
        .map_err(|_| BackendError::Fatal("digest payload is not valid hex".to_string()))?;
    if digest.len() != algorithm.size() {
        return Err(BackendError::Fatal(format!(
            "digest algorithm {algorithm} is {} bytes; payload was {}",
            algorithm.size(),
            digest.len()
        )));
    }
    bounded(token, session.sign(config, &digest, algorithm)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Isolation, KeyConfig, Pkcs11User, TokenConfig, TokenKind};
    use crate::protocol::DigestAlgorithm;
    use crate::worker::Client;
    use std::io::Write as _;

    fn file_token(path: &std::path::Path) -> TokenConfig {
        TokenConfig {
            name: "softkey".to_string(),
            kind: TokenKind::File,
            provider: Some(path.display().to_string()),
            label: None,
            serial: None,
            pin: None,
            user: Pkcs11User::default(),
            isolation: Isolation::Task,
            num_workers: 1,
            timeout: 5,
            retries: 2,
            check_interval: 60,
            check_timeout: 5,
            check_failures: 3,
            cache_seconds: 600,
        }
    }

    fn test_key() -> KeyConfig {
        KeyConfig {
            name: "release".to_string(),
            token: Some("softkey".to_string()),
            ..Default::default()
        }
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
    async fn configure_sign_ping_shutdown() {
        let key_file = write_rsa_key();
        let token = file_token(key_file.path());
        let keys = vec![test_key()];

        let mut client = Client::in_process(&token, &keys, None).await.unwrap();

        let digest =
            openssl::hash::hash(openssl::hash::MessageDigest::sha256(), b"payload").unwrap();
        let signature = client
            .sign("release", &digest, DigestAlgorithm::Sha256)
            .await
            .unwrap();
        assert!(!signature.is_empty());

        client.ping().await.unwrap();

        let info = client.key_info("release").await.unwrap();
        assert_eq!(info.algorithm, crate::protocol::KeyAlgorithm::Rsa);

        client.shutdown(std::time::Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn unknown_key_is_key_not_found() {
        let key_file = write_rsa_key();
        let token = file_token(key_file.path());
        let keys = vec![test_key()];

        let mut client = Client::in_process(&token, &keys, None).await.unwrap();
        let digest = [0u8; 32];
        let error = client
            .sign("missing", &digest, DigestAlgorithm::Sha256)
            .await
            .unwrap_err();
        assert!(matches!(error, BackendError::KeyNotFound(_)));
    }

    #[tokio::test]
    async fn bad_session_reports_failure_on_configure() {
        let token = file_token(std::path::Path::new("/nonexistent/key.pem"));
        let result = Client::in_process(&token, &[], None).await;
        assert!(matches!(result, Err(BackendError::Unavailable(_))));
    }
}
