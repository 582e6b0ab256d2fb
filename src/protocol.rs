// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Shared vocabulary: digest and key algorithms, signature formats, and the
//! worker RPC message types.

use serde::{Deserialize, Serialize};

use crate::error::BackendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    /// Digest length in bytes.
    pub fn size(&self) -> usize {
        match self {
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha384 => 48,
            DigestAlgorithm::Sha512 => 64,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha384 => "sha384",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }
}

impl std::fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DigestAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(DigestAlgorithm::Sha256),
            "sha384" | "sha-384" => Ok(DigestAlgorithm::Sha384),
            "sha512" | "sha-512" => Ok(DigestAlgorithm::Sha512),
            other => Err(format!("unsupported digest algorithm '{other}'")),
        }
    }
}

impl From<DigestAlgorithm> for openssl::hash::MessageDigest {
    fn from(value: DigestAlgorithm) -> Self {
        match value {
            DigestAlgorithm::Sha256 => openssl::hash::MessageDigest::sha256(),
            DigestAlgorithm::Sha384 => openssl::hash::MessageDigest::sha384(),
            DigestAlgorithm::Sha512 => openssl::hash::MessageDigest::sha512(),
        }
    }
}

/// The public-key family of a signing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgorithm {
    Rsa,
    P256,
    P384,
}

impl KeyAlgorithm {
    /// Whether the digest is usable with this key family. ECDSA keys pair
    /// with the digest matching their curve size; RSA accepts any.
    pub fn accepts(&self, digest: DigestAlgorithm) -> bool {
        match self {
            KeyAlgorithm::Rsa => true,
            KeyAlgorithm::P256 => digest == DigestAlgorithm::Sha256,
            KeyAlgorithm::P384 => digest == DigestAlgorithm::Sha384,
        }
    }

    /// The natural digest for this key family.
    pub fn default_digest(&self) -> DigestAlgorithm {
        match self {
            KeyAlgorithm::Rsa | KeyAlgorithm::P256 => DigestAlgorithm::Sha256,
            KeyAlgorithm::P384 => DigestAlgorithm::Sha384,
        }
    }
}

/// The requested signature format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureFormat {
    Raw,
    Pkcs7,
    Pgp,
    Zip,
}

impl std::str::FromStr for SignatureFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" => Ok(SignatureFormat::Raw),
            "pkcs7" | "cms" => Ok(SignatureFormat::Pkcs7),
            "pgp" => Ok(SignatureFormat::Pgp),
            "zip" | "jar" | "apk" | "vsix" | "xpi" => Ok(SignatureFormat::Zip),
            other => Err(format!("unsupported signature format '{other}'")),
        }
    }
}

impl SignatureFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureFormat::Raw => "raw",
            SignatureFormat::Pkcs7 => "pkcs7",
            SignatureFormat::Pgp => "pgp",
            SignatureFormat::Zip => "zip",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            SignatureFormat::Raw => "application/octet-stream",
            SignatureFormat::Pkcs7 => "application/pkcs7-signature",
            SignatureFormat::Pgp => "application/pgp-signature",
            SignatureFormat::Zip => "application/zip",
        }
    }
}

/// Key material a worker reports for a key: certificates, public key, and
/// the algorithms it can produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyInfo {
    /// PEM certificate chain, leaf first. May be empty for bare keys.
    pub certificate_chain: Vec<String>,
    /// PEM SubjectPublicKeyInfo.
    pub public_key: String,
    pub algorithm: KeyAlgorithm,
    /// Armored OpenPGP certificate, when the key has one configured.
    pub pgp_certificate: Option<String>,
}

/// Error as it crosses the worker RPC boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub kind: WireErrorKind,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireErrorKind {
    Unavailable,
    KeyNotFound,
    SelectorAmbiguous,
    SigningRefused,
    SessionLost,
    Timeout,
    Fatal,
}

impl From<&BackendError> for WireError {
    fn from(error: &BackendError) -> Self {
        let (kind, reason) = match error {
            BackendError::Unavailable(r) => (WireErrorKind::Unavailable, r.clone()),
            BackendError::KeyNotFound(r) => (WireErrorKind::KeyNotFound, r.clone()),
            BackendError::SelectorAmbiguous(r) => (WireErrorKind::SelectorAmbiguous, r.clone()),
            BackendError::SigningRefused(r) => (WireErrorKind::SigningRefused, r.clone()),
            BackendError::SessionLost(r) => (WireErrorKind::SessionLost, r.clone()),
            BackendError::Timeout => (WireErrorKind::Timeout, String::new()),
            BackendError::Fatal(r) => (WireErrorKind::Fatal, r.clone()),
        };
        WireError { kind, reason }
    }
}

impl From<WireError> for BackendError {
    fn from(error: WireError) -> Self {
        match error.kind {
            WireErrorKind::Unavailable => BackendError::Unavailable(error.reason),
            WireErrorKind::KeyNotFound => BackendError::KeyNotFound(error.reason),
            WireErrorKind::SelectorAmbiguous => BackendError::SelectorAmbiguous(error.reason),
            WireErrorKind::SigningRefused => BackendError::SigningRefused(error.reason),
            WireErrorKind::SessionLost => BackendError::SessionLost(error.reason),
            WireErrorKind::Timeout => BackendError::Timeout,
            WireErrorKind::Fatal => BackendError::Fatal(error.reason),
        }
    }
}

/// Requests the server sends to a token worker, one JSON document per line.
///
/// `PgpSign` is followed by `payload_size` raw bytes on the same channel.
#[derive(Debug, Serialize, Deserialize)]
pub enum WorkerRequest {
    /// Must be the first message; binds the worker to one token.
    Configure {
        token: crate::config::TokenConfig,
        keys: Vec<crate::config::KeyConfig>,
        pin: Option<String>,
    },
    Sign {
        key: String,
        digest: String,
        algorithm: DigestAlgorithm,
    },
    KeyInfo {
        key: String,
    },
    PgpSign {
        key: String,
        payload_size: usize,
    },
    Ping {},
    Shutdown {},
}

/// Responses a token worker writes, one JSON document per line.
///
/// `PgpSignature` is followed by `payload_size` raw bytes.
#[derive(Debug, Serialize, Deserialize)]
pub enum WorkerResponse {
    Signature { signature: String },
    KeyInfo { info: KeyInfo },
    PgpSignature { payload_size: usize },
    Ok {},
    Failure { error: WireError },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_compatibility() {
        assert!(KeyAlgorithm::Rsa.accepts(DigestAlgorithm::Sha512));
        assert!(KeyAlgorithm::P256.accepts(DigestAlgorithm::Sha256));
        assert!(!KeyAlgorithm::P256.accepts(DigestAlgorithm::Sha384));
        assert!(KeyAlgorithm::P384.accepts(DigestAlgorithm::Sha384));
        assert!(!KeyAlgorithm::P384.accepts(DigestAlgorithm::Sha512));
    }

    #[test]
    fn format_aliases() {
        assert_eq!("jar".parse::<SignatureFormat>(), Ok(SignatureFormat::Zip));
        assert_eq!("cms".parse::<SignatureFormat>(), Ok(SignatureFormat::Pkcs7));
        assert!("elf".parse::<SignatureFormat>().is_err());
    }

    #[test]
    fn wire_error_round_trip() {
        let error = BackendError::SessionLost("socket closed".to_string());
        let wire = WireError::from(&error);
        let back: BackendError = wire.into();
        assert!(matches!(back, BackendError::SessionLost(r) if r == "socket closed"));
    }
}
