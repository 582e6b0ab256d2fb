// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! RFC 3161 and Microsoft Authenticode timestamp clients.
//!
//! Both clients share one token bucket and one memoization table. URL
//! fallback is transport-level only: a well-formed TSP rejection is final,
//! while connection and HTTP errors advance to the next configured URL.

pub mod tsp;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

use crate::config::TimestampConfig;
use crate::pkcs7::der::{self, TAG_CONTEXT_0, TAG_OCTET_STRING, TAG_SEQUENCE};
use crate::pkcs7::{ContentInfo, OID_DATA, OID_SIGNED_DATA, SignedData};
use crate::protocol::DigestAlgorithm;

/// szOID_TIMESTAMP_REQUEST, the legacy Authenticode request type.
const OID_MS_TIMESTAMP_REQUEST: asn1::ObjectIdentifier = asn1::oid!(1, 3, 6, 1, 4, 1, 311, 3, 2, 1);

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TimestampError {
    /// A timestamp authority produced a well-formed rejection; other URLs
    /// are not consulted.
    #[error("timestamp rejected with PKIStatus {status}: {detail}")]
    Rejected { status: u8, detail: String },

    /// Every configured URL failed at the transport or HTTP level.
    #[error("all timestamp URLs failed; last error: {0}")]
    Exhausted(String),

    /// The Microsoft token's content did not match the signature it was
    /// requested for, and strict matching is enabled.
    #[error("microsoft timestamp does not match the enclosing signature")]
    Mismatch,

    #[error("no timestamp URLs are configured")]
    Unconfigured,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// The protocol a token was obtained with; decides the attachment OID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Rfc3161,
    Microsoft,
}

struct TokenBucket {
    tokens: f64,
    burst: f64,
    rate: f64,
    refilled: Instant,
}

impl TokenBucket {
    fn new(rate: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            tokens: burst,
            burst,
            rate,
            refilled: Instant::now(),
        }
    }

    /// How long the caller must wait before its request is admitted.
    fn reserve(&mut self, now: Instant) -> Duration {
        let elapsed = now.duration_since(self.refilled).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.refilled = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Duration::ZERO
        } else {
            let wait = (1.0 - self.tokens) / self.rate;
            self.tokens -= 1.0;
            Duration::from_secs_f64(wait)
        }
    }
}

/// Timestamp client pool. One instance is shared by every signer plugin;
/// the rate limit bucket is shared across both protocol kinds and every
/// URL, never per-URL.
pub struct Timestamper {
    config: TimestampConfig,
    client: reqwest::Client,
    bucket: Option<Mutex<TokenBucket>>,
    memo: DashMap<Vec<u8>, Vec<u8>>,
}

impl Timestamper {
    pub fn new(config: TimestampConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        let bucket = if config.rate_limit > 0.0 {
            Some(Mutex::new(TokenBucket::new(
                config.rate_limit,
                config.rate_burst,
            )))
        } else {
            None
        };
        Ok(Self {
            config,
            client,
            bucket,
            memo: DashMap::new(),
        })
    }

    pub fn enabled(&self) -> bool {
        !self.config.urls.is_empty() || !self.config.ms_urls.is_empty()
    }

    async fn admit(&self) {
        if let Some(bucket) = &self.bucket {
            let wait = bucket.lock().await.reserve(Instant::now());
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }
    }

    /// Obtain a timestamp token for a signature's encrypted digest,
    /// preferring RFC 3161 authorities over the legacy Microsoft endpoint.
    pub async fn timestamp(
        &self,
        encrypted_digest: &[u8],
        digest: DigestAlgorithm,
    ) -> Result<(TokenKind, Vec<u8>), TimestampError> {
        if !self.config.urls.is_empty() {
            self.rfc3161(encrypted_digest, digest)
                .await
                .map(|token| (TokenKind::Rfc3161, token))
        } else if !self.config.ms_urls.is_empty() {
            self.microsoft(encrypted_digest)
                .await
                .map(|token| (TokenKind::Microsoft, token))
        } else {
            Err(TimestampError::Unconfigured)
        }
    }

    /// RFC 3161: post a TSQ over the digest of the signature's
    /// `EncryptedDigest` and expect a granted `TimeStampToken`.
    #[tracing::instrument(skip_all, fields(digest = %digest))]
    pub async fn rfc3161(
        &self,
        encrypted_digest: &[u8],
        digest: DigestAlgorithm,
    ) -> Result<Vec<u8>, TimestampError> {
        if self.config.urls.is_empty() {
            return Err(TimestampError::Unconfigured);
        }
        let imprint = openssl::hash::hash(digest.into(), encrypted_digest)
            .map_err(|e| TimestampError::Internal(e.into()))?;
        let query = tsp::build_query(digest, &imprint);

        if self.config.memoize
            && let Some(token) = self.memo.get(&query)
        {
            tracing::debug!("serving memoized timestamp token");
            return Ok(token.clone());
        }

        self.admit().await;
        let mut last_error = "no URLs attempted".to_string();
        for url in &self.config.urls {
            match self.post_query(url, &query).await {
                Ok(body) => match tsp::parse_response(&body) {
                    Ok(token) => {
                        if self.config.memoize {
                            self.memo.insert(query.clone(), token.clone());
                        }
                        return Ok(token);
                    }
                    Err(tsp::TspError::Rejected { status, detail }) => {
                        return Err(TimestampError::Rejected { status, detail });
                    }
                    Err(tsp::TspError::Malformed(detail)) => {
                        tracing::warn!(url, detail, "timestamp response unparseable; trying next URL");
                        last_error = detail;
                    }
                },
                Err(error) => {
                    tracing::warn!(url, %error, "timestamp URL failed; trying next");
                    last_error = error.to_string();
                }
            }
        }
        Err(TimestampError::Exhausted(last_error))
    }

    async fn post_query(&self, url: &str, query: &[u8]) -> Result<Vec<u8>, reqwest::Error> {
        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/timestamp-query")
            .body(query.to_vec())
            .send()
            .await?
            .error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Legacy Authenticode endpoint: a base64 DER request whose content is
    /// the signature's `EncryptedDigest`; the token content is compared to
    /// it on return. Legacy servers sometimes answer with a detached form,
    /// so a mismatch warns rather than fails unless strict matching is on.
    #[tracing::instrument(skip_all)]
    pub async fn microsoft(&self, encrypted_digest: &[u8]) -> Result<Vec<u8>, TimestampError> {
        if self.config.ms_urls.is_empty() {
            return Err(TimestampError::Unconfigured);
        }
        let request = ms_request(encrypted_digest);
        let body = BASE64.encode(&request);

        if self.config.memoize
            && let Some(token) = self.memo.get(&request)
        {
            tracing::debug!("serving memoized timestamp token");
            return Ok(token.clone());
        }

        self.admit().await;
        let mut last_error = "no URLs attempted".to_string();
        for url in &self.config.ms_urls {
            let response = self
                .client
                .post(url)
                .header("Content-Type", "application/octet-stream")
                .body(body.clone())
                .send()
                .await
                .and_then(|r| r.error_for_status());
            let text = match response {
                Ok(response) => match response.text().await {
                    Ok(text) => text,
                    Err(error) => {
                        last_error = error.to_string();
                        continue;
                    }
                },
                Err(error) => {
                    tracing::warn!(url, %error, "microsoft timestamp URL failed; trying next");
                    last_error = error.to_string();
                    continue;
                }
            };
            let token = match BASE64.decode(text.trim()) {
                Ok(der) => der,
                Err(error) => {
                    last_error = format!("response is not base64: {error}");
                    continue;
                }
            };
            self.check_ms_token(&token, encrypted_digest)?;
            if self.config.memoize {
                self.memo.insert(request.clone(), token.clone());
            }
            return Ok(token);
        }
        Err(TimestampError::Exhausted(last_error))
    }

    /// Compare the returned token's content against the digest we asked to
    /// have stamped.
    fn check_ms_token(&self, token: &[u8], encrypted_digest: &[u8]) -> Result<(), TimestampError> {
        let matches = ms_token_content(token)
            .map(|content| content == encrypted_digest)
            .unwrap_or(false);
        if !matches {
            if self.config.strict_ms_match {
                return Err(TimestampError::Mismatch);
            }
            tracing::warn!("timestamp does not match the enclosing signature");
        }
        Ok(())
    }
}

/// The legacy request: `SEQUENCE { reqOID, ContentInfo { data, [0] OCTET } }`.
fn ms_request(encrypted_digest: &[u8]) -> Vec<u8> {
    let mut content_info = der::oid_tlv(&OID_DATA);
    let octets = der::tlv(TAG_OCTET_STRING, encrypted_digest);
    content_info.extend_from_slice(&der::tlv(TAG_CONTEXT_0, &octets));

    let mut request = der::oid_tlv(&OID_MS_TIMESTAMP_REQUEST);
    request.extend_from_slice(&der::tlv(TAG_SEQUENCE, &content_info));
    der::tlv(TAG_SEQUENCE, &request)
}

/// The content bytes of a legacy token's encapsulated data.
fn ms_token_content(token: &[u8]) -> Option<Vec<u8>> {
    let content_info = asn1::parse_single::<ContentInfo<'_>>(token).ok()?;
    if content_info.content_type != OID_SIGNED_DATA {
        return None;
    }
    let signed_data = content_info.content?.parse::<SignedData<'_>>().ok()?;
    let econtent = signed_data.content_info.content?;
    econtent.parse::<&[u8]>().ok().map(|b| b.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn config(urls: Vec<String>) -> TimestampConfig {
        TimestampConfig {
            urls,
            timeout: 5,
            ..Default::default()
        }
    }

    /// Serve one canned HTTP response, then exit.
    async fn one_shot_server(body: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let _ = socket.read(&mut buf).await;
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/timestamp-reply\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(header.as_bytes()).await.unwrap();
            socket.write_all(&body).await.unwrap();
        });
        format!("http://{addr}/")
    }

    /// A granted TimeStampResp wrapping an opaque token TLV.
    fn granted_response(token: &[u8]) -> Vec<u8> {
        let status = der::tlv(TAG_SEQUENCE, &[0x02, 0x01, 0x00]);
        let mut resp = status;
        resp.extend_from_slice(token);
        der::tlv(TAG_SEQUENCE, &resp)
    }

    #[tokio::test]
    async fn fallback_to_second_url() {
        // First URL: a port with nothing listening on it.
        let dead = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            drop(listener);
            format!("http://{addr}/")
        };
        let token = der::tlv(TAG_SEQUENCE, &[0x02, 0x01, 0x2A]);
        let live = one_shot_server(granted_response(&token)).await;

        let stamper = Timestamper::new(config(vec![dead, live])).unwrap();
        let result = stamper
            .rfc3161(b"signature bytes", DigestAlgorithm::Sha256)
            .await
            .unwrap();
        assert_eq!(result, token);
    }

    #[tokio::test]
    async fn rejection_aborts_without_fallback() {
        // PKIStatus rejection(2); the second URL must never be consulted.
        let rejected = der::tlv(TAG_SEQUENCE, &der::tlv(TAG_SEQUENCE, &[0x02, 0x01, 0x02]));
        let first = one_shot_server(rejected).await;
        let second = "http://127.0.0.1:1/".to_string();

        let stamper = Timestamper::new(config(vec![first, second])).unwrap();
        let error = stamper
            .rfc3161(b"signature bytes", DigestAlgorithm::Sha256)
            .await
            .unwrap_err();
        assert!(matches!(error, TimestampError::Rejected { status: 2, .. }));
    }

    #[tokio::test]
    async fn all_urls_failing_is_exhausted() {
        let dead = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            drop(listener);
            format!("http://{addr}/")
        };
        let stamper = Timestamper::new(config(vec![dead])).unwrap();
        let error = stamper
            .rfc3161(b"signature bytes", DigestAlgorithm::Sha256)
            .await
            .unwrap_err();
        assert!(matches!(error, TimestampError::Exhausted(_)));
    }

    #[tokio::test]
    async fn memoization_skips_the_network() {
        let token = der::tlv(TAG_SEQUENCE, &[0x02, 0x01, 0x07]);
        let live = one_shot_server(granted_response(&token)).await;
        let mut cfg = config(vec![live]);
        cfg.memoize = true;

        let stamper = Timestamper::new(cfg).unwrap();
        let first = stamper
            .rfc3161(b"same digest", DigestAlgorithm::Sha256)
            .await
            .unwrap();
        // The one-shot server is gone; only the memo can answer now.
        let second = stamper
            .rfc3161(b"same digest", DigestAlgorithm::Sha256)
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_paces_requests() {
        let mut bucket = TokenBucket::new(1.0, 1);
        let now = Instant::now();
        assert_eq!(bucket.reserve(now), Duration::ZERO);
        let wait = bucket.reserve(now);
        assert!(wait >= Duration::from_millis(900), "wait was {wait:?}");
        // After the burst is spent, a second consumer waits even longer.
        let wait2 = bucket.reserve(now);
        assert!(wait2 > wait);
    }

    #[test]
    fn ms_request_embeds_digest() {
        let request = ms_request(b"ENCRYPTED");
        let position = request.windows(9).position(|w| w == b"ENCRYPTED");
        assert!(position.is_some());
        assert_eq!(request[0], TAG_SEQUENCE);
    }
}
