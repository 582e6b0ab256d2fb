// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Token backends: uniform operations over the custodian families.
//!
//! Every family exposes the same contract (open, list keys, sign, ping,
//! close) behind one enum dispatching statically on the configured kind.
//! A session is owned by exactly one worker and never shared.

pub mod cloud;
pub mod file;
pub mod pkcs11;
pub mod scdaemon;

use openssl::nid::Nid;
use openssl::pkey::{PKeyRef, Public};

use crate::config::{KeyConfig, TokenConfig, TokenKind};
use crate::error::BackendError;
use crate::protocol::{DigestAlgorithm, KeyAlgorithm, KeyInfo};

/// One enumerated key as a backend reports it.
#[derive(Debug, Clone)]
pub struct KeyEntry {
    pub id: String,
    pub label: Option<String>,
    pub algorithm: Option<KeyAlgorithm>,
    pub has_certificate: bool,
}

/// An open custodian session. Owned by a single worker; all operations are
/// serialized by construction.
pub enum Session {
    Pkcs11(pkcs11::Pkcs11Session),
    Scdaemon(scdaemon::ScdaemonSession),
    File(file::FileSession),
    Cloud(cloud::CloudSession),
}

impl Session {
    /// Open a session against the custodian the token describes.
    pub async fn open(
        token: &TokenConfig,
        keys: &[KeyConfig],
        pin: Option<String>,
    ) -> Result<Session, BackendError> {
        match token.kind {
            TokenKind::Pkcs11 => {
                pkcs11::Pkcs11Session::open(token, keys, pin).map(Session::Pkcs11)
            }
            TokenKind::Scdaemon => scdaemon::ScdaemonSession::open(token, keys, pin)
                .await
                .map(Session::Scdaemon),
            TokenKind::File => file::FileSession::open(token, keys, pin).map(Session::File),
            TokenKind::Gcloud | TokenKind::Azure | TokenKind::Aws => {
                cloud::CloudSession::open(token, keys, pin)
                    .await
                    .map(Session::Cloud)
            }
        }
    }

    pub async fn list_keys(&mut self) -> Result<Vec<KeyEntry>, BackendError> {
        match self {
            Session::Pkcs11(session) => session.list_keys(),
            Session::Scdaemon(session) => session.list_keys().await,
            Session::File(session) => session.list_keys(),
            Session::Cloud(session) => session.list_keys(),
        }
    }

    /// Sign a digest with the named key's selector.
    pub async fn sign(
        &mut self,
        key: &KeyConfig,
        digest: &[u8],
        algorithm: DigestAlgorithm,
    ) -> Result<Vec<u8>, BackendError> {
        match self {
            Session::Pkcs11(session) => session.sign(key, digest, algorithm),
            Session::Scdaemon(session) => session.sign(key, digest, algorithm).await,
            Session::File(session) => session.sign(key, digest, algorithm),
            Session::Cloud(session) => session.sign(key, digest, algorithm).await,
        }
    }

    /// Certificates, public key, and algorithm for the named key.
    pub async fn key_info(&mut self, key: &KeyConfig) -> Result<KeyInfo, BackendError> {
        match self {
            Session::Pkcs11(session) => session.key_info(key),
            Session::Scdaemon(session) => session.key_info(key).await,
            Session::File(session) => session.key_info(key),
            Session::Cloud(session) => session.key_info(key).await,
        }
    }

    /// Sign arbitrary content as an OpenPGP signature packet. Only key
    /// files carry PGP secret material; other custodians refuse.
    pub async fn pgp_sign(
        &mut self,
        key: &KeyConfig,
        payload: &[u8],
    ) -> Result<Vec<u8>, BackendError> {
        match self {
            Session::File(session) => session.pgp_sign(key, payload),
            _ => Err(BackendError::SigningRefused(
                "this custodian does not hold OpenPGP secrets".to_string(),
            )),
        }
    }

    pub async fn ping(&mut self) -> Result<(), BackendError> {
        match self {
            Session::Pkcs11(session) => session.ping(),
            Session::Scdaemon(session) => session.ping().await,
            Session::File(session) => session.ping(),
            Session::Cloud(session) => session.ping().await,
        }
    }

    pub async fn close(self) {
        match self {
            Session::Pkcs11(session) => session.close(),
            Session::Scdaemon(session) => session.close().await,
            Session::File(_) => {}
            Session::Cloud(_) => {}
        }
    }
}

/// Classify a public key into the supported families.
pub(crate) fn detect_algorithm(pkey: &PKeyRef<Public>) -> Result<KeyAlgorithm, BackendError> {
    match pkey.id() {
        openssl::pkey::Id::RSA => Ok(KeyAlgorithm::Rsa),
        openssl::pkey::Id::EC => {
            let ec = pkey
                .ec_key()
                .map_err(|e| BackendError::Fatal(e.to_string()))?;
            match ec.group().curve_name() {
                Some(Nid::X9_62_PRIME256V1) => Ok(KeyAlgorithm::P256),
                Some(Nid::SECP384R1) => Ok(KeyAlgorithm::P384),
                other => Err(BackendError::Fatal(format!(
                    "unsupported ECC curve {other:?}"
                ))),
            }
        }
        other => Err(BackendError::Fatal(format!(
            "unsupported key type {other:?}"
        ))),
    }
}

/// Normalize a raw `r || s` ECDSA signature to the DER form every other
/// path produces.
pub(crate) fn ecdsa_raw_to_der(raw: &[u8]) -> Result<Vec<u8>, BackendError> {
    if raw.len() % 2 != 0 || raw.is_empty() {
        return Err(BackendError::Fatal(format!(
            "ECDSA signature length {} is not an r||s pair",
            raw.len()
        )));
    }
    let half = raw.len() / 2;
    let convert = |bytes: &[u8]| {
        openssl::bn::BigNum::from_slice(bytes).map_err(|e| BackendError::Fatal(e.to_string()))
    };
    let r = convert(&raw[..half])?;
    let s = convert(&raw[half..])?;
    let signature = openssl::ecdsa::EcdsaSig::from_private_components(r, s)
        .and_then(|sig| sig.to_der())
        .map_err(|e| BackendError::Fatal(e.to_string()))?;
    Ok(signature)
}

/// Assemble a [`KeyInfo`] from the key's configured materials, falling back
/// to what the backend reported. The configured certificate chain always
/// wins; the public key comes from the leaf when a chain exists.
pub(crate) fn assemble_key_info(
    key: &KeyConfig,
    backend_chain: Vec<String>,
    backend_public_key: Option<String>,
) -> Result<KeyInfo, BackendError> {
    let chain = match &key.x509_certificate {
        Some(path) => split_pem_chain(
            &std::fs::read_to_string(path)
                .map_err(|e| BackendError::Fatal(format!("reading {}: {e}", path.display())))?,
        ),
        None => backend_chain,
    };

    let public_key = if let Some(leaf) = chain.first() {
        let cert = openssl::x509::X509::from_pem(leaf.as_bytes())
            .map_err(|e| BackendError::Fatal(format!("certificate for '{}': {e}", key.name)))?;
        let pkey = cert
            .public_key()
            .map_err(|e| BackendError::Fatal(e.to_string()))?;
        String::from_utf8(
            pkey.public_key_to_pem()
                .map_err(|e| BackendError::Fatal(e.to_string()))?,
        )
        .map_err(|e| BackendError::Fatal(e.to_string()))?
    } else {
        backend_public_key.ok_or_else(|| {
            BackendError::KeyNotFound(format!(
                "key '{}' has no certificate and the custodian reported no public key",
                key.name
            ))
        })?
    };

    let pkey = openssl::pkey::PKey::public_key_from_pem(public_key.as_bytes())
        .map_err(|e| BackendError::Fatal(e.to_string()))?;
    let algorithm = detect_algorithm(&pkey)?;

    let pgp_certificate = match &key.pgp_certificate {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .map_err(|e| BackendError::Fatal(format!("reading {}: {e}", path.display())))?,
        ),
        None => None,
    };

    Ok(KeyInfo {
        certificate_chain: chain,
        public_key,
        algorithm,
        pgp_certificate,
    })
}

/// Split a PEM bundle into individual certificate blocks.
pub(crate) fn split_pem_chain(bundle: &str) -> Vec<String> {
    const BEGIN: &str = "-----BEGIN CERTIFICATE-----";
    const END: &str = "-----END CERTIFICATE-----";
    let mut chain = vec![];
    let mut rest = bundle;
    while let Some(start) = rest.find(BEGIN) {
        let Some(end) = rest[start..].find(END) else {
            break;
        };
        let stop = start + end + END.len();
        chain.push(rest[start..stop].to_string());
        rest = &rest[stop..];
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecdsa_normalization_round_trips() {
        let group =
            openssl::ec::EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        let key = openssl::ec::EcKey::generate(&group).unwrap();
        let digest = [7u8; 32];
        let sig = openssl::ecdsa::EcdsaSig::sign(&digest, &key).unwrap();

        let mut raw = vec![0u8; 64];
        let r = sig.r().to_vec();
        let s = sig.s().to_vec();
        raw[32 - r.len()..32].copy_from_slice(&r);
        raw[64 - s.len()..].copy_from_slice(&s);

        let der = ecdsa_raw_to_der(&raw).unwrap();
        let restored = openssl::ecdsa::EcdsaSig::from_der(&der).unwrap();
        assert!(restored.verify(&digest, &key).unwrap());
    }

    #[test]
    fn pem_chain_splitting() {
        let bundle = "\
-----BEGIN CERTIFICATE-----\nAAA\n-----END CERTIFICATE-----\n\
junk between blocks\n\
-----BEGIN CERTIFICATE-----\nBBB\n-----END CERTIFICATE-----\n";
        let chain = split_pem_chain(bundle);
        assert_eq!(chain.len(), 2);
        assert!(chain[0].contains("AAA"));
        assert!(chain[1].contains("BBB"));
    }

    #[test]
    fn bad_raw_signature_rejected() {
        assert!(matches!(
            ecdsa_raw_to_der(&[1, 2, 3]),
            Err(BackendError::Fatal(_))
        ));
        assert!(matches!(ecdsa_raw_to_der(&[]), Err(BackendError::Fatal(_))));
    }
}
