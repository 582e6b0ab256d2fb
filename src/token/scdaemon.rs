// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! OpenPGP smartcard backend, speaking Assuan to scdaemon.
//!
//! The daemon listens on a Unix socket; commands and responses are
//! newline-delimited text, with binary payloads percent-escaped in `D`
//! lines. Key IDs on the card are of the form `OPENPGP.n`.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, ReadHalf, WriteHalf};
use tokio::net::UnixStream;

use crate::config::{KeyConfig, TokenConfig};
use crate::error::BackendError;
use crate::protocol::{DigestAlgorithm, KeyAlgorithm, KeyInfo};
use crate::token::{KeyEntry, assemble_key_info, ecdsa_raw_to_der};

const DEFAULT_KEY_ID: &str = "OPENPGP.1";

/// One reply from the daemon, already split by kind.
struct Reply {
    data: Vec<u8>,
    status: Vec<String>,
}

pub struct ScdaemonSession {
    token_name: String,
    writer: WriteHalf<UnixStream>,
    reader: Lines<BufReader<ReadHalf<UnixStream>>>,
    pin: Option<String>,
    serial: String,
}

impl ScdaemonSession {
    pub async fn open(
        token: &TokenConfig,
        _keys: &[KeyConfig],
        pin: Option<String>,
    ) -> Result<Self, BackendError> {
        let socket_path = token.provider.as_deref().ok_or_else(|| {
            BackendError::Fatal(format!(
                "token '{}' names no scdaemon socket path",
                token.name
            ))
        })?;
        let stream = UnixStream::connect(socket_path).await.map_err(|e| {
            BackendError::Unavailable(format!("connecting to scdaemon at {socket_path}: {e}"))
        })?;
        let (reader, writer) = tokio::io::split(stream);
        let mut session = Self {
            token_name: token.name.clone(),
            writer,
            reader: BufReader::new(reader).lines(),
            pin,
            serial: String::new(),
        };

        // The daemon greets with a status line before the first command.
        session.read_reply(true).await?;

        let reply = session.command("SERIALNO openpgp").await?;
        session.serial = reply
            .status
            .iter()
            .find_map(|line| line.strip_prefix("SERIALNO "))
            .map(|rest| rest.split_whitespace().next().unwrap_or("").to_string())
            .ok_or_else(|| {
                BackendError::Unavailable("scdaemon reported no card serial".to_string())
            })?;
        if let Some(wanted) = &token.serial
            && &session.serial != wanted
        {
            return Err(BackendError::Unavailable(format!(
                "card serial {} does not match configured {}",
                session.serial, wanted
            )));
        }
        tracing::info!(token = session.token_name, serial = session.serial, "card session open");
        Ok(session)
    }

    async fn command(&mut self, line: &str) -> Result<Reply, BackendError> {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|e| BackendError::SessionLost(format!("writing to scdaemon: {e}")))?;
        self.read_reply(false).await
    }

    /// Read until `OK` or `ERR`, answering PIN inquiries along the way.
    async fn read_reply(&mut self, greeting: bool) -> Result<Reply, BackendError> {
        let mut reply = Reply {
            data: vec![],
            status: vec![],
        };
        loop {
            let line = self
                .reader
                .next_line()
                .await
                .map_err(|e| BackendError::SessionLost(format!("reading from scdaemon: {e}")))?
                .ok_or_else(|| {
                    BackendError::SessionLost("scdaemon closed the connection".to_string())
                })?;
            if line.starts_with("OK") {
                return Ok(reply);
            }
            if let Some(detail) = line.strip_prefix("ERR ") {
                if greeting {
                    return Err(BackendError::Unavailable(format!("scdaemon: {detail}")));
                }
                return Err(BackendError::SigningRefused(format!("scdaemon: {detail}")));
            }
            if let Some(status) = line.strip_prefix("S ") {
                reply.status.push(status.to_string());
            } else if let Some(data) = line.strip_prefix("D ") {
                reply.data.extend_from_slice(&percent_decode(data));
            } else if line.starts_with("INQUIRE") {
                let answer = match &self.pin {
                    Some(pin) => format!("D {}\nEND\n", percent_encode(pin.as_bytes())),
                    None => "END\n".to_string(),
                };
                self.writer
                    .write_all(answer.as_bytes())
                    .await
                    .map_err(|e| BackendError::SessionLost(format!("answering inquiry: {e}")))?;
            }
            // Comment lines ("# ...") are dropped.
        }
    }

    pub async fn list_keys(&mut self) -> Result<Vec<KeyEntry>, BackendError> {
        // The OpenPGP card application has fixed key slots; the signature
        // and authentication slots are the ones usable for signing.
        Ok(["OPENPGP.1", "OPENPGP.3"]
            .into_iter()
            .map(|id| KeyEntry {
                id: id.to_string(),
                label: None,
                algorithm: None,
                has_certificate: false,
            })
            .collect())
    }

    pub async fn sign(
        &mut self,
        key: &KeyConfig,
        digest: &[u8],
        algorithm: DigestAlgorithm,
    ) -> Result<Vec<u8>, BackendError> {
        let key_id = key.id.as_deref().unwrap_or(DEFAULT_KEY_ID);
        if !key_id.starts_with("OPENPGP.") {
            return Err(BackendError::KeyNotFound(format!(
                "key '{}' id '{key_id}' is not an OPENPGP.n slot",
                key.name
            )));
        }
        self.command(&format!("SETDATA {}", hex::encode_upper(digest)))
            .await?;
        let reply = self
            .command(&format!("PKSIGN --hash={} {key_id}", algorithm.as_str()))
            .await?;
        if reply.data.is_empty() {
            return Err(BackendError::SessionLost(
                "scdaemon returned no signature data".to_string(),
            ));
        }

        // ECDSA cards hand back a raw r||s pair.
        let key_algorithm = self
            .key_info(key)
            .await
            .map(|info| info.algorithm)
            .unwrap_or(KeyAlgorithm::Rsa);
        match key_algorithm {
            KeyAlgorithm::Rsa => Ok(reply.data),
            KeyAlgorithm::P256 | KeyAlgorithm::P384 => ecdsa_raw_to_der(&reply.data),
        }
    }

    pub async fn key_info(&mut self, key: &KeyConfig) -> Result<KeyInfo, BackendError> {
        // The card exposes no certificate store; key material descriptions
        // come from the configured certificate.
        assemble_key_info(key, vec![], None)
    }

    pub async fn ping(&mut self) -> Result<(), BackendError> {
        self.command("GETINFO version").await.map(|_| ())
    }

    pub async fn close(mut self) {
        let _ = self.command("BYE").await;
        let _ = self.writer.shutdown().await;
    }
}

fn percent_decode(data: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let bytes = data.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(value) = u8::from_str_radix(&data[i + 1..i + 3], 16) {
                out.push(value);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

fn percent_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len());
    for &byte in data {
        match byte {
            b'%' | b'\r' | b'\n' => out.push_str(&format!("%{byte:02X}")),
            _ => out.push(byte as char),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_codec() {
        assert_eq!(percent_decode("abc%0Adef"), b"abc\ndef");
        assert_eq!(percent_decode("%25"), b"%");
        assert_eq!(percent_encode(b"pin%with\nnewline"), "pin%25with%0Anewline");
    }

    #[tokio::test]
    async fn serial_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("scd.sock");
        let listener = tokio::net::UnixListener::bind(&socket_path).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"OK how can I serve you\n").await.unwrap();
            let mut buf = [0u8; 256];
            use tokio::io::AsyncReadExt;
            let _ = stream.read(&mut buf).await;
            stream
                .write_all(b"S SERIALNO D2760001240103\nOK\n")
                .await
                .unwrap();
        });

        let token = TokenConfig {
            name: "card".to_string(),
            kind: crate::config::TokenKind::Scdaemon,
            provider: Some(socket_path.display().to_string()),
            label: None,
            serial: Some("D2760009999999".to_string()),
            pin: None,
            user: Default::default(),
            isolation: Default::default(),
            num_workers: 1,
            timeout: 60,
            retries: 5,
            check_interval: 60,
            check_timeout: 10,
            check_failures: 3,
            cache_seconds: 600,
        };
        let result = ScdaemonSession::open(&token, &[], None).await;
        assert!(matches!(result, Err(BackendError::Unavailable(_))));
    }
}
