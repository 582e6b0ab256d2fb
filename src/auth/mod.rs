// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Client authentication and per-key authorization.
//!
//! Direct clients are recognized by the SHA-256 fingerprint of their TLS
//! certificate; delegated clients by validating their leaf against a
//! configured CA. When a policy URL is set, the builtin table is bypassed
//! and an Open Policy Agent endpoint decides instead.

pub mod opa;

use std::collections::HashSet;
use std::net::IpAddr;

use openssl::x509::{X509, X509Ref};

use crate::config::{AzureAd, Config, KeyConfig, network_contains};
use crate::error::SignError;

/// An authenticated caller and the roles it may exercise.
#[derive(Debug, Clone)]
pub struct Principal {
    pub nickname: String,
    pub roles: HashSet<String>,
}

struct CaEntry {
    certificate: X509,
    nickname: String,
    roles: HashSet<String>,
}

pub struct Authenticator {
    /// Fingerprint (64 uppercase hex) to principal.
    fingerprints: Vec<(String, Principal)>,
    ca_entries: Vec<CaEntry>,
    trusted_proxies: Vec<(IpAddr, u8)>,
    policy: Option<opa::PolicyClient>,
    azure_ad: Option<AzureAd>,
}

/// Uppercase hex SHA-256 of the certificate DER, the form fingerprints are
/// configured in.
pub fn fingerprint(cert: &X509Ref) -> anyhow::Result<String> {
    let der = cert.to_der()?;
    let digest = openssl::hash::hash(openssl::hash::MessageDigest::sha256(), &der)?;
    Ok(hex::encode_upper(digest))
}

impl Authenticator {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let mut fingerprints = vec![];
        let mut ca_entries = vec![];
        for client in &config.clients {
            match (&client.fingerprint, &client.certificate) {
                (Some(fp), _) => fingerprints.push((
                    fp.clone(),
                    Principal {
                        nickname: client.nickname.clone(),
                        roles: client.roles.clone(),
                    },
                )),
                (None, Some(path)) => {
                    let pem = std::fs::read(path)?;
                    ca_entries.push(CaEntry {
                        certificate: X509::from_pem(&pem)?,
                        nickname: client.nickname.clone(),
                        roles: client.roles.clone(),
                    });
                }
                (None, None) => unreachable!("config validation requires one of the two"),
            }
        }

        let policy = match &config.server.policy_url {
            Some(url) => Some(opa::PolicyClient::new(
                url.clone(),
                std::time::Duration::from_secs(10),
            )?),
            None => None,
        };

        Ok(Self {
            fingerprints,
            ca_entries,
            trusted_proxies: config.trusted_proxy_networks()?,
            policy,
            azure_ad: config.server.azure_ad.clone(),
        })
    }

    /// Whether proxy-supplied headers from this source address are honored.
    pub fn is_trusted_proxy(&self, ip: &IpAddr) -> bool {
        self.trusted_proxies
            .iter()
            .any(|network| network_contains(network, ip))
    }

    /// The WWW-Authenticate challenge for unauthenticated clients, when
    /// interactive Azure AD sign-in is configured alongside OPA.
    pub fn challenge(&self) -> Option<String> {
        match (&self.policy, &self.azure_ad) {
            (Some(_), Some(azure_ad)) => Some(format!(
                "Bearer authorization_uri=\"{}\", client_id=\"{}\"",
                azure_ad.authority, azure_ad.client_id
            )),
            _ => None,
        }
    }

    /// Authenticate a request. `certificate` is the client certificate
    /// from the TLS session or, behind a trusted proxy, from the
    /// `Ssl-Client-Certificate` header.
    #[tracing::instrument(skip_all, fields(path, method))]
    pub async fn authenticate(
        &self,
        certificate: Option<&X509Ref>,
        path: &str,
        method: &str,
    ) -> Result<Principal, SignError> {
        // The policy endpoint replaces the builtin table entirely.
        if let Some(policy) = &self.policy {
            let (cert_pem, fp) = match certificate {
                Some(cert) => {
                    let pem = cert
                        .to_pem()
                        .ok()
                        .and_then(|pem| String::from_utf8(pem).ok());
                    (pem, fingerprint(cert).ok())
                }
                None => (None, None),
            };
            let input = opa::PolicyInput {
                cert: cert_pem,
                fingerprint: fp.clone(),
                path: path.to_string(),
                method: method.to_string(),
            };
            let decision = policy
                .check(&input)
                .await
                .map_err(SignError::Internal)?;
            if !decision.allow {
                return Err(SignError::Unauthorized);
            }
            return Ok(Principal {
                nickname: fp.unwrap_or_else(|| "policy-client".to_string()),
                roles: decision.roles,
            });
        }

        let certificate = certificate.ok_or(SignError::Unauthorized)?;
        let fp = fingerprint(certificate).map_err(SignError::Internal)?;
        if let Some((_, principal)) = self.fingerprints.iter().find(|(known, _)| *known == fp) {
            tracing::debug!(nickname = principal.nickname, "client matched by fingerprint");
            return Ok(principal.clone());
        }

        for entry in &self.ca_entries {
            if verify_issued_by(certificate, &entry.certificate) {
                let subject = certificate
                    .subject_name()
                    .entries()
                    .filter_map(|e| e.data().as_utf8().ok().map(|v| v.to_string()))
                    .collect::<Vec<_>>()
                    .join(", ");
                tracing::info!(
                    nickname = entry.nickname,
                    subject,
                    "client delegated by configured CA"
                );
                return Ok(Principal {
                    nickname: entry.nickname.clone(),
                    roles: entry.roles.clone(),
                });
            }
        }

        tracing::warn!(fingerprint = fp, "client certificate is not recognized");
        Err(SignError::Unauthorized)
    }
}

/// Check that `leaf` was issued and signed by `ca` and is within its
/// validity period.
fn verify_issued_by(leaf: &X509Ref, ca: &X509Ref) -> bool {
    if !matches!(
        leaf.issuer_name().try_cmp(ca.subject_name()),
        Ok(std::cmp::Ordering::Equal)
    ) {
        return false;
    }
    let Ok(ca_key) = ca.public_key() else {
        return false;
    };
    if !leaf.verify(&ca_key).unwrap_or(false) {
        return false;
    }
    let now = openssl::asn1::Asn1Time::days_from_now(0);
    let Ok(now) = now else { return false };
    let not_yet = leaf
        .not_before()
        .diff(&now)
        .map(|d| d.days < 0 || (d.days == 0 && d.secs < 0))
        .unwrap_or(true);
    let expired = now
        .diff(leaf.not_after())
        .map(|d| d.days < 0 || (d.days == 0 && d.secs < 0))
        .unwrap_or(true);
    !not_yet && !expired
}

/// A request is authorized iff the key's roles intersect the principal's.
/// Aliases were resolved at configuration load, so `key.roles` is always
/// the primary's role set and an alias can never widen access.
pub fn authorize(principal: &Principal, key: &KeyConfig) -> Result<(), SignError> {
    if key.roles.intersection(&principal.roles).next().is_some() {
        Ok(())
    } else {
        Err(SignError::Forbidden(format!(
            "'{}' has no role granting access to key '{}'",
            principal.nickname, key.name
        )))
    }
}

/// Visible keys for the directory listing.
pub fn visible_keys<'a>(principal: &Principal, config: &'a Config) -> Vec<&'a KeyConfig> {
    config
        .keys
        .iter()
        .filter(|key| authorize(principal, key).is_ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeyConfig;

    fn principal(roles: &[&str]) -> Principal {
        Principal {
            nickname: "builder".to_string(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    fn key(name: &str, roles: &[&str]) -> KeyConfig {
        KeyConfig {
            name: name.to_string(),
            token: Some("hsm".to_string()),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn authorization_is_role_intersection() {
        assert!(authorize(&principal(&["release"]), &key("k", &["release", "qa"])).is_ok());
        assert!(authorize(&principal(&["other"]), &key("k", &["release"])).is_err());
        assert!(authorize(&principal(&[]), &key("k", &["release"])).is_err());
        assert!(authorize(&principal(&["release"]), &key("k", &[])).is_err());
    }

    #[test]
    fn fingerprints_are_uppercase_hex() {
        let rsa = openssl::rsa::Rsa::generate(2048).unwrap();
        let pkey = openssl::pkey::PKey::from_rsa(rsa).unwrap();
        let mut builder = X509::builder().unwrap();
        builder.set_pubkey(&pkey).unwrap();
        builder
            .sign(&pkey, openssl::hash::MessageDigest::sha256())
            .unwrap();
        let cert = builder.build();

        let fp = fingerprint(&cert).unwrap();
        assert_eq!(fp.len(), 64);
        assert!(fp.bytes().all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b)));
    }

    #[test]
    fn ca_issued_leaf_is_recognized() {
        let ca_key = openssl::pkey::PKey::from_rsa(openssl::rsa::Rsa::generate(2048).unwrap())
            .unwrap();
        let mut name = openssl::x509::X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "delegating-ca").unwrap();
        let ca_name = name.build();
        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&ca_name).unwrap();
        builder.set_issuer_name(&ca_name).unwrap();
        builder.set_pubkey(&ca_key).unwrap();
        builder
            .set_not_before(&openssl::asn1::Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&openssl::asn1::Asn1Time::days_from_now(30).unwrap())
            .unwrap();
        builder
            .sign(&ca_key, openssl::hash::MessageDigest::sha256())
            .unwrap();
        let ca = builder.build();

        let leaf_key = openssl::pkey::PKey::from_rsa(openssl::rsa::Rsa::generate(2048).unwrap())
            .unwrap();
        let mut name = openssl::x509::X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "build-client").unwrap();
        let leaf_name = name.build();
        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&leaf_name).unwrap();
        builder.set_issuer_name(&ca_name).unwrap();
        builder.set_pubkey(&leaf_key).unwrap();
        builder
            .set_not_before(&openssl::asn1::Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&openssl::asn1::Asn1Time::days_from_now(7).unwrap())
            .unwrap();
        builder
            .sign(&ca_key, openssl::hash::MessageDigest::sha256())
            .unwrap();
        let leaf = builder.build();

        assert!(verify_issued_by(&leaf, &ca));
        // A self-signed stranger is not accepted.
        assert!(!verify_issued_by(&ca, &leaf));
    }
}
