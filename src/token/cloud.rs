// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Cloud KMS backends: Google Cloud KMS, Azure Key Vault, AWS KMS.
//!
//! Key IDs are fully-qualified resource URIs: a Cloud KMS key version
//! resource name, an Azure key URL including its version, or an AWS key
//! ARN. Signing happens remotely over REST; ECDSA output is normalized to
//! the DER form the rest of the pipeline expects (Azure returns a raw
//! `r || s` pair, the other two return DER already).

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD as BASE64_URL};
use serde_json::json;

use crate::config::{KeyConfig, TokenConfig, TokenKind};
use crate::error::BackendError;
use crate::protocol::{DigestAlgorithm, KeyAlgorithm, KeyInfo};
use crate::token::{KeyEntry, assemble_key_info, detect_algorithm, ecdsa_raw_to_der};

enum Credential {
    /// OAuth bearer token (Google Cloud, Azure after the AAD exchange).
    Bearer(String),
    /// SigV4 signing material (AWS).
    Aws {
        access_key: String,
        secret_key: String,
        session_token: Option<String>,
    },
}

pub struct CloudSession {
    token_name: String,
    kind: TokenKind,
    endpoint: Option<String>,
    client: reqwest::Client,
    credential: Credential,
    keys: Vec<KeyConfig>,
    /// Public key material fetched per key name.
    fetched: HashMap<String, (KeyAlgorithm, String)>,
}

fn http_error(context: &str, status: reqwest::StatusCode, body: &str) -> BackendError {
    let detail = format!("{context}: HTTP {status}: {body}");
    match status.as_u16() {
        401 | 403 => BackendError::SigningRefused(detail),
        404 => BackendError::KeyNotFound(detail),
        400 => BackendError::Fatal(detail),
        _ => BackendError::SessionLost(detail),
    }
}

fn transport_error(context: &str, error: reqwest::Error) -> BackendError {
    BackendError::SessionLost(format!("{context}: {error}"))
}

impl CloudSession {
    pub async fn open(
        token: &TokenConfig,
        keys: &[KeyConfig],
        pin: Option<String>,
    ) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(token.timeout())
            .build()
            .map_err(|e| BackendError::Fatal(e.to_string()))?;

        let credential = match token.kind {
            TokenKind::Gcloud => Credential::Bearer(gcloud_token(pin)?),
            TokenKind::Azure => {
                Credential::Bearer(azure_token(&client, token, pin).await?)
            }
            TokenKind::Aws => aws_credential(pin)?,
            other => {
                return Err(BackendError::Fatal(format!(
                    "token kind {other:?} is not a cloud custodian"
                )));
            }
        };

        Ok(Self {
            token_name: token.name.clone(),
            kind: token.kind,
            endpoint: token.provider.clone(),
            client,
            credential,
            keys: keys.to_vec(),
            fetched: HashMap::new(),
        })
    }

    fn key_id<'a>(&self, key: &'a KeyConfig) -> Result<&'a str, BackendError> {
        key.id.as_deref().ok_or_else(|| {
            BackendError::KeyNotFound(format!(
                "key '{}' has no cloud resource URI configured",
                key.name
            ))
        })
    }

    pub fn list_keys(&mut self) -> Result<Vec<KeyEntry>, BackendError> {
        // Cloud inventories are large and permission-gated; the session
        // serves the keys it was configured with.
        Ok(self
            .keys
            .iter()
            .filter_map(|key| key.id.as_ref())
            .map(|id| KeyEntry {
                id: id.clone(),
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
        let key_algorithm = self.algorithm_for(key).await?;
        if !key_algorithm.accepts(algorithm) {
            return Err(BackendError::SigningRefused(format!(
                "digest {algorithm} is not usable with key '{}'",
                key.name
            )));
        }
        match self.kind {
            TokenKind::Gcloud => self.gcloud_sign(key, digest, algorithm).await,
            TokenKind::Azure => self.azure_sign(key, digest, algorithm, key_algorithm).await,
            TokenKind::Aws => self.aws_sign(key, digest, algorithm, key_algorithm).await,
            _ => unreachable!("open() rejects non-cloud kinds"),
        }
    }

    pub async fn key_info(&mut self, key: &KeyConfig) -> Result<KeyInfo, BackendError> {
        let (_, pem) = self.fetch_public_key(key).await?;
        assemble_key_info(key, vec![], Some(pem))
    }

    pub async fn ping(&mut self) -> Result<(), BackendError> {
        // Fetching a configured key's public material exercises endpoint,
        // credentials, and key access in one round trip.
        let Some(key) = self.keys.first().cloned() else {
            return Ok(());
        };
        self.fetch_public_key(&key).await.map(|_| ())
    }

    async fn algorithm_for(&mut self, key: &KeyConfig) -> Result<KeyAlgorithm, BackendError> {
        // A configured certificate answers without a network round trip.
        if key.x509_certificate.is_some() {
            return assemble_key_info(key, vec![], None).map(|info| info.algorithm);
        }
        self.fetch_public_key(key).await.map(|(alg, _)| alg)
    }

    async fn fetch_public_key(
        &mut self,
        key: &KeyConfig,
    ) -> Result<(KeyAlgorithm, String), BackendError> {
        if let Some(found) = self.fetched.get(&key.name) {
            return Ok(found.clone());
        }
        let pem = match self.kind {
            TokenKind::Gcloud => self.gcloud_public_key(key).await?,
            TokenKind::Azure => self.azure_public_key(key).await?,
            TokenKind::Aws => self.aws_public_key(key).await?,
            _ => unreachable!("open() rejects non-cloud kinds"),
        };
        let pkey = openssl::pkey::PKey::public_key_from_pem(pem.as_bytes())
            .map_err(|e| BackendError::Fatal(format!("key '{}': {e}", key.name)))?;
        let algorithm = detect_algorithm(&pkey)?;
        self.fetched
            .insert(key.name.clone(), (algorithm, pem.clone()));
        Ok((algorithm, pem))
    }

    // Google Cloud KMS

    fn gcloud_url(&self, resource: &str, suffix: &str) -> String {
        let endpoint = self
            .endpoint
            .as_deref()
            .unwrap_or("https://cloudkms.googleapis.com");
        format!("{endpoint}/v1/{resource}{suffix}")
    }

    async fn gcloud_sign(
        &self,
        key: &KeyConfig,
        digest: &[u8],
        algorithm: DigestAlgorithm,
    ) -> Result<Vec<u8>, BackendError> {
        let Credential::Bearer(bearer) = &self.credential else {
            return Err(BackendError::Fatal("mismatched credential kind".to_string()));
        };
        let body = json!({ "digest": { algorithm.as_str(): BASE64.encode(digest) } });
        let response = self
            .client
            .post(self.gcloud_url(self.key_id(key)?, ":asymmetricSign"))
            .bearer_auth(bearer)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("Cloud KMS sign", e))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| transport_error("Cloud KMS sign", e))?;
        if !status.is_success() {
            return Err(http_error("Cloud KMS sign", status, &text));
        }
        let parsed: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| BackendError::Fatal(format!("Cloud KMS response: {e}")))?;
        let signature = parsed
            .get("signature")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BackendError::Fatal("Cloud KMS response lacks a signature".into()))?;
        BASE64
            .decode(signature)
            .map_err(|e| BackendError::Fatal(format!("Cloud KMS signature is not base64: {e}")))
    }

    async fn gcloud_public_key(&self, key: &KeyConfig) -> Result<String, BackendError> {
        let Credential::Bearer(bearer) = &self.credential else {
            return Err(BackendError::Fatal("mismatched credential kind".to_string()));
        };
        let response = self
            .client
            .get(self.gcloud_url(self.key_id(key)?, "/publicKey"))
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(|e| transport_error("Cloud KMS publicKey", e))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| transport_error("Cloud KMS publicKey", e))?;
        if !status.is_success() {
            return Err(http_error("Cloud KMS publicKey", status, &text));
        }
        let parsed: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| BackendError::Fatal(format!("Cloud KMS response: {e}")))?;
        parsed
            .get("pem")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| BackendError::Fatal("Cloud KMS publicKey lacks a pem".into()))
    }

    // Azure Key Vault

    async fn azure_sign(
        &self,
        key: &KeyConfig,
        digest: &[u8],
        algorithm: DigestAlgorithm,
        key_algorithm: KeyAlgorithm,
    ) -> Result<Vec<u8>, BackendError> {
        let Credential::Bearer(bearer) = &self.credential else {
            return Err(BackendError::Fatal("mismatched credential kind".to_string()));
        };
        let alg = match (key_algorithm, algorithm) {
            (KeyAlgorithm::Rsa, DigestAlgorithm::Sha256) => "RS256",
            (KeyAlgorithm::Rsa, DigestAlgorithm::Sha384) => "RS384",
            (KeyAlgorithm::Rsa, DigestAlgorithm::Sha512) => "RS512",
            (KeyAlgorithm::P256, _) => "ES256",
            (KeyAlgorithm::P384, _) => "ES384",
        };
        let url = format!("{}/sign?api-version=7.4", self.key_id(key)?);
        let body = json!({ "alg": alg, "value": BASE64_URL.encode(digest) });
        let response = self
            .client
            .post(&url)
            .bearer_auth(bearer)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("Key Vault sign", e))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| transport_error("Key Vault sign", e))?;
        if !status.is_success() {
            return Err(http_error("Key Vault sign", status, &text));
        }
        let parsed: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| BackendError::Fatal(format!("Key Vault response: {e}")))?;
        let value = parsed
            .get("value")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BackendError::Fatal("Key Vault response lacks a value".into()))?;
        let raw = BASE64_URL
            .decode(value)
            .map_err(|e| BackendError::Fatal(format!("Key Vault signature is not base64: {e}")))?;
        match key_algorithm {
            KeyAlgorithm::Rsa => Ok(raw),
            KeyAlgorithm::P256 | KeyAlgorithm::P384 => ecdsa_raw_to_der(&raw),
        }
    }

    async fn azure_public_key(&self, key: &KeyConfig) -> Result<String, BackendError> {
        let Credential::Bearer(bearer) = &self.credential else {
            return Err(BackendError::Fatal("mismatched credential kind".to_string()));
        };
        let url = format!("{}?api-version=7.4", self.key_id(key)?);
        let response = self
            .client
            .get(&url)
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(|e| transport_error("Key Vault get key", e))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| transport_error("Key Vault get key", e))?;
        if !status.is_success() {
            return Err(http_error("Key Vault get key", status, &text));
        }
        let parsed: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| BackendError::Fatal(format!("Key Vault response: {e}")))?;
        let jwk = parsed
            .get("key")
            .ok_or_else(|| BackendError::Fatal("Key Vault response lacks a key".into()))?;
        jwk_to_pem(jwk)
    }

    // AWS KMS

    async fn aws_request(
        &self,
        key_arn: &str,
        target: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, BackendError> {
        let Credential::Aws {
            access_key,
            secret_key,
            session_token,
        } = &self.credential
        else {
            return Err(BackendError::Fatal("mismatched credential kind".to_string()));
        };
        let region = key_arn
            .split(':')
            .nth(3)
            .filter(|region| !region.is_empty())
            .ok_or_else(|| {
                BackendError::Fatal(format!("'{key_arn}' is not a usable key ARN"))
            })?;
        let host = match &self.endpoint {
            Some(endpoint) => endpoint
                .trim_start_matches("https://")
                .trim_end_matches('/')
                .to_string(),
            None => format!("kms.{region}.amazonaws.com"),
        };
        let payload = body.to_string();
        let now = chrono::Utc::now();
        let headers = sigv4_headers(
            &host,
            region,
            target,
            &payload,
            access_key,
            secret_key,
            session_token.as_deref(),
            now,
        )?;

        let mut request = self
            .client
            .post(format!("https://{host}/"))
            .body(payload);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| transport_error("KMS request", e))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| transport_error("KMS request", e))?;
        if !status.is_success() {
            return Err(http_error("KMS request", status, &text));
        }
        serde_json::from_str(&text)
            .map_err(|e| BackendError::Fatal(format!("KMS response: {e}")))
    }

    async fn aws_sign(
        &self,
        key: &KeyConfig,
        digest: &[u8],
        algorithm: DigestAlgorithm,
        key_algorithm: KeyAlgorithm,
    ) -> Result<Vec<u8>, BackendError> {
        let signing_algorithm = match (key_algorithm, algorithm) {
            (KeyAlgorithm::Rsa, DigestAlgorithm::Sha256) => "RSASSA_PKCS1_V1_5_SHA_256",
            (KeyAlgorithm::Rsa, DigestAlgorithm::Sha384) => "RSASSA_PKCS1_V1_5_SHA_384",
            (KeyAlgorithm::Rsa, DigestAlgorithm::Sha512) => "RSASSA_PKCS1_V1_5_SHA_512",
            (KeyAlgorithm::P256, _) => "ECDSA_SHA_256",
            (KeyAlgorithm::P384, _) => "ECDSA_SHA_384",
        };
        let key_arn = self.key_id(key)?;
        let response = self
            .aws_request(
                key_arn,
                "TrentService.Sign",
                json!({
                    "KeyId": key_arn,
                    "Message": BASE64.encode(digest),
                    "MessageType": "DIGEST",
                    "SigningAlgorithm": signing_algorithm,
                }),
            )
            .await?;
        let signature = response
            .get("Signature")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BackendError::Fatal("KMS response lacks a Signature".into()))?;
        BASE64
            .decode(signature)
            .map_err(|e| BackendError::Fatal(format!("KMS signature is not base64: {e}")))
    }

    async fn aws_public_key(&self, key: &KeyConfig) -> Result<String, BackendError> {
        let key_arn = self.key_id(key)?;
        let response = self
            .aws_request(
                key_arn,
                "TrentService.GetPublicKey",
                json!({ "KeyId": key_arn }),
            )
            .await?;
        let der = response
            .get("PublicKey")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BackendError::Fatal("KMS response lacks a PublicKey".into()))?;
        let der = BASE64
            .decode(der)
            .map_err(|e| BackendError::Fatal(format!("KMS public key is not base64: {e}")))?;
        openssl::pkey::PKey::public_key_from_der(&der)
            .and_then(|pkey| pkey.public_key_to_pem())
            .map_err(|e| BackendError::Fatal(e.to_string()))
            .and_then(|pem| {
                String::from_utf8(pem).map_err(|e| BackendError::Fatal(e.to_string()))
            })
    }
}

fn gcloud_token(pin: Option<String>) -> Result<String, BackendError> {
    if let Some(pin) = pin {
        // The pin is either the bearer token itself or a path to a file
        // holding one.
        if pin.starts_with('/') {
            return std::fs::read_to_string(&pin)
                .map(|token| token.trim().to_string())
                .map_err(|e| BackendError::Unavailable(format!("reading token file {pin}: {e}")));
        }
        return Ok(pin);
    }
    std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN").map_err(|_| {
        BackendError::Unavailable(
            "no Cloud KMS credential: set the token pin or GOOGLE_OAUTH_ACCESS_TOKEN".to_string(),
        )
    })
}

/// Exchange AAD client credentials for a Key Vault bearer token.
async fn azure_token(
    client: &reqwest::Client,
    token: &TokenConfig,
    pin: Option<String>,
) -> Result<String, BackendError> {
    let (tenant, client_id, secret) = match pin {
        Some(pin) => {
            let mut parts = pin.splitn(3, ':');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(t), Some(c), Some(s)) => (t.to_string(), c.to_string(), s.to_string()),
                _ => {
                    return Err(BackendError::Unavailable(format!(
                        "token '{}' pin must be tenant:client_id:client_secret",
                        token.name
                    )));
                }
            }
        }
        None => {
            let var = |name: &str| {
                std::env::var(name).map_err(|_| {
                    BackendError::Unavailable(format!("environment variable {name} is not set"))
                })
            };
            (
                var("AZURE_TENANT_ID")?,
                var("AZURE_CLIENT_ID")?,
                var("AZURE_CLIENT_SECRET")?,
            )
        }
    };
    let response = client
        .post(format!(
            "https://login.microsoftonline.com/{tenant}/oauth2/v2.0/token"
        ))
        .form(&[
            ("grant_type", "client_credentials"),
            ("client_id", client_id.as_str()),
            ("client_secret", secret.as_str()),
            ("scope", "https://vault.azure.net/.default"),
        ])
        .send()
        .await
        .map_err(|e| transport_error("AAD token exchange", e))?;
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| transport_error("AAD token exchange", e))?;
    if !status.is_success() {
        return Err(http_error("AAD token exchange", status, &text));
    }
    let parsed: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| BackendError::Fatal(format!("AAD response: {e}")))?;
    parsed
        .get("access_token")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| BackendError::Unavailable("AAD response lacks an access token".into()))
}

fn aws_credential(pin: Option<String>) -> Result<Credential, BackendError> {
    if let Some(pin) = pin
        && let Some((access_key, secret_key)) = pin.split_once(':')
    {
        return Ok(Credential::Aws {
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
            session_token: None,
        });
    }
    let access_key = std::env::var("AWS_ACCESS_KEY_ID").map_err(|_| {
        BackendError::Unavailable("AWS_ACCESS_KEY_ID is not set".to_string())
    })?;
    let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY").map_err(|_| {
        BackendError::Unavailable("AWS_SECRET_ACCESS_KEY is not set".to_string())
    })?;
    Ok(Credential::Aws {
        access_key,
        secret_key,
        session_token: std::env::var("AWS_SESSION_TOKEN").ok(),
    })
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, BackendError> {
    let pkey = openssl::pkey::PKey::hmac(key).map_err(|e| BackendError::Fatal(e.to_string()))?;
    let mut signer = openssl::sign::Signer::new(openssl::hash::MessageDigest::sha256(), &pkey)
        .map_err(|e| BackendError::Fatal(e.to_string()))?;
    signer
        .update(data)
        .and_then(|_| signer.sign_to_vec())
        .map_err(|e| BackendError::Fatal(e.to_string()))
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(
        openssl::hash::hash(openssl::hash::MessageDigest::sha256(), data)
            .expect("sha256 is always available"),
    )
}

/// SigV4-sign a KMS POST and return the headers to attach.
#[allow(clippy::too_many_arguments)]
fn sigv4_headers(
    host: &str,
    region: &str,
    target: &str,
    payload: &str,
    access_key: &str,
    secret_key: &str,
    session_token: Option<&str>,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<Vec<(String, String)>, BackendError> {
    const SERVICE: &str = "kms";
    const CONTENT_TYPE: &str = "application/x-amz-json-1.1";
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();
    let payload_hash = sha256_hex(payload.as_bytes());

    let mut canonical_headers = format!(
        "content-type:{CONTENT_TYPE}\nhost:{host}\nx-amz-date:{amz_date}\n"
    );
    let mut signed_headers = "content-type;host;x-amz-date".to_string();
    if let Some(token) = session_token {
        canonical_headers.push_str(&format!("x-amz-security-token:{token}\n"));
        signed_headers.push_str(";x-amz-security-token");
    }
    canonical_headers.push_str(&format!("x-amz-target:{target}\n"));
    signed_headers.push_str(";x-amz-target");

    let canonical_request =
        format!("POST\n/\n\n{canonical_headers}\n{signed_headers}\n{payload_hash}");
    let scope = format!("{date_stamp}/{region}/{SERVICE}/aws4_request");
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );

    let mut key = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date_stamp.as_bytes())?;
    for part in [region, SERVICE, "aws4_request"] {
        key = hmac_sha256(&key, part.as_bytes())?;
    }
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={access_key}/{scope}, SignedHeaders={signed_headers}, Signature={signature}"
    );
    let mut headers = vec![
        ("Content-Type".to_string(), CONTENT_TYPE.to_string()),
        ("X-Amz-Date".to_string(), amz_date),
        ("X-Amz-Target".to_string(), target.to_string()),
        ("Authorization".to_string(), authorization),
    ];
    if let Some(token) = session_token {
        headers.push(("X-Amz-Security-Token".to_string(), token.to_string()));
    }
    Ok(headers)
}

/// Rebuild a PEM public key from an Azure JWK.
fn jwk_to_pem(jwk: &serde_json::Value) -> Result<String, BackendError> {
    let field = |name: &str| -> Result<Vec<u8>, BackendError> {
        jwk.get(name)
            .and_then(|v| v.as_str())
            .ok_or_else(|| BackendError::Fatal(format!("JWK lacks the '{name}' field")))
            .and_then(|value| {
                BASE64_URL
                    .decode(value)
                    .map_err(|e| BackendError::Fatal(format!("JWK '{name}' is not base64url: {e}")))
            })
    };
    let kty = jwk.get("kty").and_then(|v| v.as_str()).unwrap_or("");
    let pkey = match kty {
        "RSA" | "RSA-HSM" => {
            let n = openssl::bn::BigNum::from_slice(&field("n")?)
                .map_err(|e| BackendError::Fatal(e.to_string()))?;
            let e = openssl::bn::BigNum::from_slice(&field("e")?)
                .map_err(|e| BackendError::Fatal(e.to_string()))?;
            openssl::rsa::Rsa::from_public_components(n, e)
                .and_then(openssl::pkey::PKey::from_rsa)
                .map_err(|e| BackendError::Fatal(e.to_string()))?
        }
        "EC" | "EC-HSM" => {
            let curve = jwk.get("crv").and_then(|v| v.as_str()).unwrap_or("");
            let nid = match curve {
                "P-256" => openssl::nid::Nid::X9_62_PRIME256V1,
                "P-384" => openssl::nid::Nid::SECP384R1,
                other => {
                    return Err(BackendError::Fatal(format!(
                        "unsupported JWK curve '{other}'"
                    )));
                }
            };
            let group = openssl::ec::EcGroup::from_curve_name(nid)
                .map_err(|e| BackendError::Fatal(e.to_string()))?;
            let x = openssl::bn::BigNum::from_slice(&field("x")?)
                .map_err(|e| BackendError::Fatal(e.to_string()))?;
            let y = openssl::bn::BigNum::from_slice(&field("y")?)
                .map_err(|e| BackendError::Fatal(e.to_string()))?;
            openssl::ec::EcKey::from_public_key_affine_coordinates(&group, &x, &y)
                .and_then(openssl::pkey::PKey::from_ec_key)
                .map_err(|e| BackendError::Fatal(e.to_string()))?
        }
        other => {
            return Err(BackendError::Fatal(format!(
                "unsupported JWK key type '{other}'"
            )));
        }
    };
    pkey.public_key_to_pem()
        .map_err(|e| BackendError::Fatal(e.to_string()))
        .and_then(|pem| String::from_utf8(pem).map_err(|e| BackendError::Fatal(e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn sigv4_is_deterministic() {
        let now = chrono::Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap();
        let headers = sigv4_headers(
            "kms.us-east-1.amazonaws.com",
            "us-east-1",
            "TrentService.Sign",
            r#"{"KeyId":"arn:aws:kms:us-east-1:123456789012:key/abc"}"#,
            "AKIDEXAMPLE",
            "wJalrXUtnFEMI",
            None,
            now,
        )
        .unwrap();
        let authorization = headers
            .iter()
            .find(|(name, _)| name == "Authorization")
            .map(|(_, value)| value.clone())
            .unwrap();
        assert!(authorization.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20260314/us-east-1/kms/aws4_request"
        ));
        assert!(authorization.contains("SignedHeaders=content-type;host;x-amz-date;x-amz-target"));
        // Same inputs, same signature.
        let again = sigv4_headers(
            "kms.us-east-1.amazonaws.com",
            "us-east-1",
            "TrentService.Sign",
            r#"{"KeyId":"arn:aws:kms:us-east-1:123456789012:key/abc"}"#,
            "AKIDEXAMPLE",
            "wJalrXUtnFEMI",
            None,
            now,
        )
        .unwrap();
        assert_eq!(headers, again);
    }

    #[test]
    fn jwk_rsa_round_trip() {
        let rsa = openssl::rsa::Rsa::generate(2048).unwrap();
        let jwk = serde_json::json!({
            "kty": "RSA",
            "n": BASE64_URL.encode(rsa.n().to_vec()),
            "e": BASE64_URL.encode(rsa.e().to_vec()),
        });
        let pem = jwk_to_pem(&jwk).unwrap();
        let restored = openssl::pkey::PKey::public_key_from_pem(pem.as_bytes()).unwrap();
        assert_eq!(restored.rsa().unwrap().n().to_vec(), rsa.n().to_vec());
    }

    #[test]
    fn arn_region_extraction_failure() {
        // aws_request rejects ARNs without a region field; exercised via
        // the public key ID parsing path.
        let arn = "arn:aws:kms::123456789012:key/abc";
        assert!(arn.split(':').nth(3).unwrap().is_empty());
    }
}
