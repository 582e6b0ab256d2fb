// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Parent-side client for a token worker.
//!
//! Requests are newline-delimited JSON; OpenPGP payloads and signatures
//! travel as raw bytes immediately after their JSON line. A client owns
//! one worker and serializes all traffic to it.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{
    AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf,
    WriteHalf,
};
use tokio::net::UnixStream;
use tokio::process::{Child, ChildStdin, ChildStdout};

use crate::config::{KeyConfig, TokenConfig};
use crate::error::BackendError;
use crate::protocol::{DigestAlgorithm, KeyInfo, WorkerRequest, WorkerResponse};
use crate::worker::serve;

pub struct Client {
    inner: ClientInner,
}

/// The transport to the worker: a spawned subprocess (production), a Unix
/// socket (socket activation), or an in-process task (the documented
/// weaker-isolation substitute).
enum ClientInner {
    Process {
        child: Box<Child>,
        writer: ChildStdin,
        reader: Option<Lines<BufReader<ChildStdout>>>,
    },
    Socket {
        writer: WriteHalf<UnixStream>,
        reader: Option<Lines<BufReader<ReadHalf<UnixStream>>>>,
    },
    Task {
        handle: tokio::task::JoinHandle<()>,
        writer: WriteHalf<DuplexStream>,
        reader: Option<Lines<BufReader<ReadHalf<DuplexStream>>>>,
    },
}

impl Client {
    /// Spawn a worker subprocess and configure it for one token.
    pub async fn spawn(
        executable: &Path,
        token: &TokenConfig,
        keys: &[KeyConfig],
        pin: Option<String>,
    ) -> Result<Self, BackendError> {
        let mut command = tokio::process::Command::new(executable);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(|e| {
            BackendError::Fatal(format!(
                "failed to spawn worker executable at {}: {e}",
                executable.display()
            ))
        })?;
        let writer = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");
        let mut client = Self {
            inner: ClientInner::Process {
                child: Box::new(child),
                writer,
                reader: Some(BufReader::new(stdout).lines()),
            },
        };
        client.configure(token, keys, pin).await?;
        Ok(client)
    }

    /// Connect to a socket-activated worker.
    pub async fn connect(
        socket_path: &Path,
        token: &TokenConfig,
        keys: &[KeyConfig],
        pin: Option<String>,
    ) -> Result<Self, BackendError> {
        let stream = UnixStream::connect(socket_path).await.map_err(|e| {
            BackendError::Unavailable(format!(
                "failed to connect to worker socket at {}: {e}",
                socket_path.display()
            ))
        })?;
        let (reader, writer) = tokio::io::split(stream);
        let mut client = Self {
            inner: ClientInner::Socket {
                writer,
                reader: Some(BufReader::new(reader).lines()),
            },
        };
        client.configure(token, keys, pin).await?;
        Ok(client)
    }

    /// Run the worker loop as a supervised in-process task. The custodian
    /// session shares the server's address space; a misbehaving provider
    /// library can take the whole process down.
    pub async fn in_process(
        token: &TokenConfig,
        keys: &[KeyConfig],
        pin: Option<String>,
    ) -> Result<Self, BackendError> {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (remote_read, remote_write) = tokio::io::split(remote);
        let handle = tokio::spawn(async move {
            if let Err(error) = serve::serve_stream(remote_read, remote_write).await {
                tracing::error!(%error, "in-process worker exited with an error");
            }
        });
        let (reader, writer) = tokio::io::split(local);
        let mut client = Self {
            inner: ClientInner::Task {
                handle,
                writer,
                reader: Some(BufReader::new(reader).lines()),
            },
        };
        client.configure(token, keys, pin).await?;
        Ok(client)
    }

    async fn configure(
        &mut self,
        token: &TokenConfig,
        keys: &[KeyConfig],
        pin: Option<String>,
    ) -> Result<(), BackendError> {
        let request = WorkerRequest::Configure {
            token: token.clone(),
            keys: keys.to_vec(),
            pin,
        };
        match self.request(&request).await? {
            WorkerResponse::Ok {} => Ok(()),
            WorkerResponse::Failure { error } => Err(error.into()),
            _ => Err(BackendError::Fatal(
                "worker returned an invalid configure response".to_string(),
            )),
        }
    }

    async fn write_line(&mut self, request: &WorkerRequest) -> Result<(), BackendError> {
        let mut line = serde_json::to_string(request)
            .map_err(|e| BackendError::Fatal(format!("serializing worker request: {e}")))?;
        line.push('\n');
        let result = match &mut self.inner {
            ClientInner::Process { writer, .. } => writer.write_all(line.as_bytes()).await,
            ClientInner::Socket { writer, .. } => writer.write_all(line.as_bytes()).await,
            ClientInner::Task { writer, .. } => writer.write_all(line.as_bytes()).await,
        };
        result.map_err(|e| BackendError::SessionLost(format!("worker is gone: {e}")))
    }

    async fn read_line(&mut self) -> Result<WorkerResponse, BackendError> {
        let line = match &mut self.inner {
            ClientInner::Process { reader, .. } => {
                reader.as_mut().expect("reader present").next_line().await
            }
            ClientInner::Socket { reader, .. } => {
                reader.as_mut().expect("reader present").next_line().await
            }
            ClientInner::Task { reader, .. } => {
                reader.as_mut().expect("reader present").next_line().await
            }
        }
        .map_err(|e| BackendError::SessionLost(format!("reading from worker: {e}")))?;
        match line {
            Some(line) => serde_json::from_str(&line)
                .map_err(|e| BackendError::Fatal(format!("worker response is invalid: {e}"))),
            None => Err(BackendError::SessionLost(
                "worker returned EOF unexpectedly".to_string(),
            )),
        }
    }

    async fn request(&mut self, request: &WorkerRequest) -> Result<WorkerResponse, BackendError> {
        self.write_line(request).await?;
        self.read_line().await
    }

    pub async fn sign(
        &mut self,
        key: &str,
        digest: &[u8],
        algorithm: DigestAlgorithm,
    ) -> Result<Vec<u8>, BackendError> {
        let request = WorkerRequest::Sign {
            key: key.to_string(),
            digest: hex::encode(digest),
            algorithm,
        };
        match self.request(&request).await? {
            WorkerResponse::Signature { signature } => hex::decode(&signature)
                .map_err(|e| BackendError::Fatal(format!("worker signature is not hex: {e}"))),
            WorkerResponse::Failure { error } => Err(error.into()),
            _ => Err(BackendError::Fatal(
                "worker returned an invalid sign response".to_string(),
            )),
        }
    }

    pub async fn key_info(&mut self, key: &str) -> Result<KeyInfo, BackendError> {
        let request = WorkerRequest::KeyInfo {
            key: key.to_string(),
        };
        match self.request(&request).await? {
            WorkerResponse::KeyInfo { info } => Ok(info),
            WorkerResponse::Failure { error } => Err(error.into()),
            _ => Err(BackendError::Fatal(
                "worker returned an invalid key info response".to_string(),
            )),
        }
    }

    /// OpenPGP signing: the request line is followed by the payload bytes,
    /// the response line by the signature bytes.
    pub async fn pgp_sign(&mut self, key: &str, payload: Bytes) -> Result<Vec<u8>, BackendError> {
        self.write_line(&WorkerRequest::PgpSign {
            key: key.to_string(),
            payload_size: payload.len(),
        })
        .await?;
        let write_result = match &mut self.inner {
            ClientInner::Process { writer, .. } => {
                writer.write_all(&payload).await.and(writer.flush().await)
            }
            ClientInner::Socket { writer, .. } => {
                writer.write_all(&payload).await.and(writer.flush().await)
            }
            ClientInner::Task { writer, .. } => {
                writer.write_all(&payload).await.and(writer.flush().await)
            }
        };
        write_result.map_err(|e| BackendError::SessionLost(format!("worker is gone: {e}")))?;

        let payload_size = match self.read_line().await? {
            WorkerResponse::PgpSignature { payload_size } => payload_size,
            WorkerResponse::Failure { error } => return Err(error.into()),
            _ => {
                return Err(BackendError::Fatal(
                    "worker returned an invalid pgp sign response".to_string(),
                ));
            }
        };

        let mut buffer = vec![0; payload_size];
        macro_rules! read_binary {
            ($reader:expr) => {{
                let mut inner = $reader.take().expect("reader present").into_inner();
                let result = inner.read_exact(&mut buffer).await;
                *$reader = Some(inner.lines());
                result
            }};
        }
        let result = match &mut self.inner {
            ClientInner::Process { reader, .. } => read_binary!(reader),
            ClientInner::Socket { reader, .. } => read_binary!(reader),
            ClientInner::Task { reader, .. } => read_binary!(reader),
        };
        result.map_err(|e| BackendError::SessionLost(format!("reading signature: {e}")))?;
        Ok(buffer)
    }

    pub async fn ping(&mut self) -> Result<(), BackendError> {
        match self.request(&WorkerRequest::Ping {}).await? {
            WorkerResponse::Ok {} => Ok(()),
            WorkerResponse::Failure { error } => Err(error.into()),
            _ => Err(BackendError::Fatal(
                "worker returned an invalid ping response".to_string(),
            )),
        }
    }

    /// Graceful shutdown: ask the worker to stop, then give it a moment.
    pub async fn shutdown(mut self, grace: Duration) {
        let _ = self.write_line(&WorkerRequest::Shutdown {}).await;
        match self.inner {
            ClientInner::Process {
                mut child, writer, ..
            } => {
                drop(writer);
                if tokio::time::timeout(grace, child.wait()).await.is_err() {
                    let _ = child.kill().await;
                }
            }
            ClientInner::Socket { mut writer, .. } => {
                let _ = writer.shutdown().await;
            }
            ClientInner::Task { handle, writer, .. } => {
                drop(writer);
                if tokio::time::timeout(grace, handle).await.is_err() {
                    // The task is still running; nothing more we can do
                    // without a process boundary.
                }
            }
        }
    }

    /// Immediate termination for workers declared sick.
    pub async fn kill(self) {
        match self.inner {
            ClientInner::Process { mut child, .. } => {
                let _ = child.kill().await;
            }
            ClientInner::Socket { mut writer, .. } => {
                let _ = writer.shutdown().await;
            }
            ClientInner::Task { handle, .. } => {
                handle.abort();
            }
        }
    }
}
