// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Audit record emission.
//!
//! Every completed signing produces one JSON document. Records flow
//! through a channel to a writer task that appends them to the configured
//! JSONL log and mirrors them into the structured log; an external shipper
//! can forward the same documents to a fanout exchange.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::AuditConfig;

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    /// Principal nickname.
    pub client: String,
    /// The key name the client asked for (an alias keeps its own name).
    pub key: String,
    pub format: String,
    /// Hex digest of the signed payload.
    pub digest: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct AuditSink {
    tx: mpsc::UnboundedSender<AuditRecord>,
    exchange: String,
}

impl AuditSink {
    pub fn new(config: &AuditConfig) -> anyhow::Result<Self> {
        let mut log = match &config.log {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Some(
                    std::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)?,
                )
            }
            None => None,
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<AuditRecord>();
        let exchange = config.exchange.clone();
        let log_exchange = exchange.clone();
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let line = match serde_json::to_string(&record) {
                    Ok(line) => line,
                    Err(error) => {
                        tracing::error!(%error, "failed to serialize audit record");
                        continue;
                    }
                };
                tracing::info!(
                    target: "custodia::audit",
                    exchange = log_exchange,
                    client = record.client,
                    key = record.key,
                    format = record.format,
                    success = record.success,
                    "signing completed"
                );
                if let Some(file) = log.as_mut() {
                    use std::io::Write;
                    if let Err(error) = writeln!(file, "{line}") {
                        tracing::error!(%error, "failed to append audit record");
                    }
                }
            }
        });

        Ok(Self { tx, exchange })
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn emit(&self, record: AuditRecord) {
        if self.tx.send(record).is_err() {
            tracing::error!("audit writer is gone; record dropped");
        }
    }

    pub fn success(&self, client: &str, key: &str, format: &str, digest: &str) {
        self.emit(AuditRecord {
            timestamp: Utc::now(),
            client: client.to_string(),
            key: key.to_string(),
            format: format.to_string(),
            digest: digest.to_string(),
            success: true,
            error: None,
        });
    }

    pub fn failure(&self, client: &str, key: &str, format: &str, digest: &str, error: &str) {
        self.emit(AuditRecord {
            timestamp: Utc::now(),
            client: client.to_string(),
            key: key.to_string(),
            format: format.to_string(),
            digest: digest.to_string(),
            success: false,
            error: Some(error.to_string()),
        });
    }
}
