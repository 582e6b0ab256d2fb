// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Bottom-up `SignedData` assembly.

use anyhow::Context;
use asn1::ObjectIdentifier;
use chrono::{DateTime, Utc};

use crate::pkcs7::der::*;
use crate::pkcs7::{
    CertificateShell, OID_ATTR_CONTENT_TYPE, OID_ATTR_MESSAGE_DIGEST, OID_ATTR_SIGNING_TIME,
    OID_ATTR_TIMESTAMP_TOKEN, OID_DATA, OID_ECDSA_SHA256, OID_ECDSA_SHA384, OID_ECDSA_SHA512,
    OID_RSA_ENCRYPTION, OID_SIGNED_DATA, OID_SPC_TIMESTAMP_TOKEN, digest_oid,
};
use crate::protocol::{DigestAlgorithm, KeyAlgorithm};

/// Assembles a single-signer PKCS#7 `SignedData`.
///
/// The caller hashes nothing itself: it asks for
/// [`SignedBuilder::signed_attributes_digest`], signs that digest through
/// the worker pool, and hands the raw signature to
/// [`SignedBuilder::assemble`]. Attaching a timestamp token later means
/// re-assembling with an extra unauthenticated attribute, so the signature
/// over the authenticated attributes never changes.
pub struct SignedBuilder {
    digest: DigestAlgorithm,
    key_algorithm: KeyAlgorithm,
    /// DER certificates, leaf first.
    certificates: Vec<Vec<u8>>,
    content: Vec<u8>,
    detached: bool,
    signing_time: DateTime<Utc>,
}

impl SignedBuilder {
    pub fn new(
        digest: DigestAlgorithm,
        key_algorithm: KeyAlgorithm,
        certificates: Vec<Vec<u8>>,
        content: Vec<u8>,
        detached: bool,
    ) -> Self {
        Self {
            digest,
            key_algorithm,
            certificates,
            content,
            detached,
            signing_time: Utc::now(),
        }
    }

    pub fn signing_time(mut self, time: DateTime<Utc>) -> Self {
        self.signing_time = time;
        self
    }

    /// The DER encodings of the authenticated attributes.
    fn authenticated_attributes(&self) -> anyhow::Result<Vec<Vec<u8>>> {
        let content_digest =
            openssl::hash::hash(self.digest.into(), &self.content).context("digesting content")?;

        let content_type = attribute(&OID_ATTR_CONTENT_TYPE, oid_tlv(&OID_DATA));
        let signing_time = attribute(
            &OID_ATTR_SIGNING_TIME,
            tlv(
                TAG_UTC_TIME,
                self.signing_time
                    .format("%y%m%d%H%M%SZ")
                    .to_string()
                    .as_bytes(),
            ),
        );
        let message_digest = attribute(&OID_ATTR_MESSAGE_DIGEST, tlv(TAG_OCTET_STRING, &content_digest));
        Ok(vec![content_type, signing_time, message_digest])
    }

    /// The digest the custodian must sign: the hash of the authenticated
    /// attributes serialized as a DER SET OF.
    pub fn signed_attributes_digest(&self) -> anyhow::Result<Vec<u8>> {
        let set = set_of(self.authenticated_attributes()?);
        Ok(openssl::hash::hash(self.digest.into(), &set)
            .context("digesting signed attributes")?
            .to_vec())
    }

    pub fn digest_algorithm(&self) -> DigestAlgorithm {
        self.digest
    }

    /// Assemble the complete `ContentInfo`-wrapped `SignedData`.
    ///
    /// `unauthenticated` carries `(attribute OID, DER value)` pairs, such
    /// as a timestamp token produced after signing.
    pub fn assemble(
        &self,
        raw_signature: &[u8],
        unauthenticated: &[(ObjectIdentifier, Vec<u8>)],
    ) -> anyhow::Result<Vec<u8>> {
        let leaf = self
            .certificates
            .first()
            .ok_or_else(|| anyhow::anyhow!("assembling PKCS#7 requires the signer certificate"))?;
        let shell = asn1::parse_single::<CertificateShell<'_>>(leaf)
            .map_err(|error| anyhow::anyhow!("signer certificate is not valid DER: {error:?}"))?;

        let mut signer_info = vec![];
        signer_info.extend_from_slice(&[TAG_INTEGER, 0x01, 0x01]); // version 1

        let mut sid = shell.tbs.issuer.full_data().to_vec();
        sid.extend_from_slice(&tlv(TAG_INTEGER, shell.tbs.serial_number.as_bytes()));
        signer_info.extend_from_slice(&tlv(TAG_SEQUENCE, &sid));

        signer_info.extend_from_slice(&algorithm_null_params(&digest_oid(self.digest)));

        // Stored as [0] IMPLICIT, signed as SET OF; same content bytes.
        let attributes = {
            let mut sorted = self.authenticated_attributes()?;
            sorted.sort();
            let mut content = vec![];
            for attr in &sorted {
                content.extend_from_slice(attr);
            }
            content
        };
        signer_info.extend_from_slice(&tlv(TAG_CONTEXT_0, &attributes));

        let signature_algorithm = match self.key_algorithm {
            KeyAlgorithm::Rsa => algorithm_null_params(&OID_RSA_ENCRYPTION),
            KeyAlgorithm::P256 | KeyAlgorithm::P384 => {
                let oid = match self.digest {
                    DigestAlgorithm::Sha256 => OID_ECDSA_SHA256,
                    DigestAlgorithm::Sha384 => OID_ECDSA_SHA384,
                    DigestAlgorithm::Sha512 => OID_ECDSA_SHA512,
                };
                algorithm_no_params(&oid)
            }
        };
        signer_info.extend_from_slice(&signature_algorithm);
        signer_info.extend_from_slice(&tlv(TAG_OCTET_STRING, raw_signature));

        if !unauthenticated.is_empty() {
            let mut encoded: Vec<Vec<u8>> = unauthenticated
                .iter()
                .map(|(oid, value)| attribute(oid, value.clone()))
                .collect();
            encoded.sort();
            let mut content = vec![];
            for attr in &encoded {
                content.extend_from_slice(attr);
            }
            signer_info.extend_from_slice(&tlv(TAG_CONTEXT_1, &content));
        }
        let signer_info = tlv(TAG_SEQUENCE, &signer_info);

        let mut signed_data = vec![];
        signed_data.extend_from_slice(&[TAG_INTEGER, 0x01, 0x01]); // version 1
        signed_data.extend_from_slice(&set_of(vec![algorithm_null_params(&digest_oid(
            self.digest,
        ))]));

        let mut encap = oid_tlv(&OID_DATA);
        if !self.detached {
            let octets = tlv(TAG_OCTET_STRING, &self.content);
            encap.extend_from_slice(&tlv(TAG_CONTEXT_0, &octets));
        }
        signed_data.extend_from_slice(&tlv(TAG_SEQUENCE, &encap));

        let mut certs = vec![];
        for cert in &self.certificates {
            certs.extend_from_slice(cert);
        }
        signed_data.extend_from_slice(&tlv(TAG_CONTEXT_0, &certs));

        signed_data.extend_from_slice(&tlv(TAG_SET, &signer_info));
        let signed_data = tlv(TAG_SEQUENCE, &signed_data);

        let mut content_info = oid_tlv(&OID_SIGNED_DATA);
        content_info.extend_from_slice(&tlv(TAG_CONTEXT_0, &signed_data));
        Ok(tlv(TAG_SEQUENCE, &content_info))
    }
}

/// The attribute OID a timestamp token is attached under.
pub fn timestamp_attribute_oid(authenticode: bool) -> ObjectIdentifier {
    if authenticode {
        OID_SPC_TIMESTAMP_TOKEN
    } else {
        OID_ATTR_TIMESTAMP_TOKEN
    }
}

fn attribute(oid: &ObjectIdentifier, value_tlv: Vec<u8>) -> Vec<u8> {
    let mut inner = oid_tlv(oid);
    inner.extend_from_slice(&tlv(TAG_SET, &value_tlv));
    tlv(TAG_SEQUENCE, &inner)
}
