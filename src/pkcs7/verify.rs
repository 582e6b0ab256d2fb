// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Self-verification of assembled signatures.
//!
//! After any multi-step assembly the result is re-parsed and the inner
//! signature re-verified against the known public key; an attached
//! timestamp token is independently checked against the encrypted digest
//! it stamps.

use anyhow::Context;
use chrono::{DateTime, Utc};
use openssl::pkey::{PKeyRef, Public};
use openssl::stack::Stack;
use openssl::x509::X509;
use openssl::x509::store::X509StoreBuilder;

use crate::pkcs7::{
    Attribute, CertificateShell, ContentInfo, OID_ATTR_COUNTER_SIGN, OID_ATTR_MESSAGE_DIGEST,
    OID_ATTR_TIMESTAMP_TOKEN, OID_SIGNED_DATA, OID_SPC_TIMESTAMP_TOKEN, SignedData, SignerInfo,
    digest_from_oid,
};
use crate::protocol::DigestAlgorithm;
use crate::timestamp::tsp;

/// A validated timestamp counter-signature.
pub struct CounterSignature {
    pub digest: DigestAlgorithm,
    pub signing_time: DateTime<Utc>,
    /// The certificates embedded in the token, DER, in order of appearance.
    pub certificates: Vec<Vec<u8>>,
}

/// The result of a successful self-check.
pub struct VerifiedSignature {
    pub digest: DigestAlgorithm,
    pub encrypted_digest: Vec<u8>,
    pub counter_signature: Option<CounterSignature>,
}

fn md_ref(algorithm: DigestAlgorithm) -> &'static openssl::md::MdRef {
    match algorithm {
        DigestAlgorithm::Sha256 => openssl::md::Md::sha256(),
        DigestAlgorithm::Sha384 => openssl::md::Md::sha384(),
        DigestAlgorithm::Sha512 => openssl::md::Md::sha512(),
    }
}

fn attribute_value<'a>(
    attributes: &asn1::SetOf<'a, Attribute<'a>>,
    oid: &asn1::ObjectIdentifier,
) -> Option<asn1::Tlv<'a>> {
    attributes
        .clone()
        .find(|attr| attr.attr_type == *oid)
        .and_then(|attr| attr.values.clone().next())
}

/// Verify one `SignerInfo` against its encapsulated content and a known
/// public key. Returns the digest algorithm the signer used.
fn verify_signer(
    signer: &SignerInfo<'_>,
    econtent: &[u8],
    public_key: &PKeyRef<Public>,
) -> anyhow::Result<DigestAlgorithm> {
    let digest = digest_from_oid(&signer.digest_algorithm.algorithm)
        .ok_or_else(|| anyhow::anyhow!("signature uses an unsupported digest algorithm"))?;

    let signed_bytes = match &signer.authenticated_attributes {
        Some(attributes) => {
            let value = attribute_value(attributes, &OID_ATTR_MESSAGE_DIGEST)
                .ok_or_else(|| anyhow::anyhow!("authenticated attributes lack messageDigest"))?;
            let claimed = value
                .parse::<&[u8]>()
                .map_err(|error| anyhow::anyhow!("messageDigest is not an octet string: {error:?}"))?;
            let actual = openssl::hash::hash(digest.into(), econtent)?;
            if claimed != actual.as_ref() {
                anyhow::bail!("messageDigest attribute does not match the content");
            }
            // Attributes are signed as SET OF, not as stored ([0] IMPLICIT).
            asn1::write_single(attributes)
                .map_err(|error| anyhow::anyhow!("re-encoding attributes failed: {error:?}"))?
        }
        None => econtent.to_vec(),
    };

    let hashed = openssl::hash::hash(digest.into(), &signed_bytes)?;
    let mut ctx = openssl::pkey_ctx::PkeyCtx::new(public_key)?;
    ctx.verify_init()?;
    ctx.set_signature_md(md_ref(digest))?;
    if public_key.id() == openssl::pkey::Id::RSA {
        ctx.set_rsa_padding(openssl::rsa::Padding::PKCS1)?;
    }
    let valid = ctx
        .verify(&hashed, signer.encrypted_digest)
        .unwrap_or(false);
    if !valid {
        anyhow::bail!("signature does not verify against the signer's public key");
    }
    Ok(digest)
}

fn parse_signed_data(der: &[u8]) -> anyhow::Result<(ContentInfo<'_>, SignedData<'_>)> {
    let content_info = asn1::parse_single::<ContentInfo<'_>>(der)
        .map_err(|error| anyhow::anyhow!("not a ContentInfo: {error:?}"))?;
    if content_info.content_type != OID_SIGNED_DATA {
        anyhow::bail!("not a SignedData");
    }
    let signed_data = content_info
        .content
        .ok_or_else(|| anyhow::anyhow!("SignedData content is absent"))?
        .parse::<SignedData<'_>>()
        .map_err(|error| anyhow::anyhow!("SignedData is malformed: {error:?}"))?;
    Ok((content_info, signed_data))
}

/// Locate the signer's certificate within the token by issuer and serial.
fn find_signer_certificate(
    signer: &SignerInfo<'_>,
    certificates: &[Vec<u8>],
) -> anyhow::Result<X509> {
    for der in certificates {
        let shell = asn1::parse_single::<CertificateShell<'_>>(der)
            .map_err(|error| anyhow::anyhow!("embedded certificate is invalid: {error:?}"))?;
        if shell.tbs.serial_number.as_bytes() == signer.sid.serial_number.as_bytes()
            && shell.tbs.issuer.full_data() == signer.sid.issuer.full_data()
        {
            return Ok(X509::from_der(der)?);
        }
    }
    anyhow::bail!("token does not include its signer's certificate");
}

/// Verify a timestamp token against the encrypted digest it stamps.
fn verify_token(token_der: &[u8], stamped_digest: &[u8]) -> anyhow::Result<CounterSignature> {
    let summary = tsp::parse_token(token_der)?;
    let imprint = openssl::hash::hash(summary.imprint_algorithm.into(), stamped_digest)?;
    if summary.imprint != imprint.as_ref() {
        anyhow::bail!("timestamp imprint does not match the signature");
    }

    let (_, signed_data) = parse_signed_data(token_der)?;
    let tst_der = signed_data
        .content_info
        .content
        .ok_or_else(|| anyhow::anyhow!("token eContent is absent"))?
        .parse::<&[u8]>()
        .map_err(|error| anyhow::anyhow!("token eContent is not an octet string: {error:?}"))?;
    let certificates: Vec<Vec<u8>> = signed_data
        .certificates
        .as_ref()
        .map(|certs| certs.clone().map(|tlv| tlv.full_data().to_vec()).collect())
        .unwrap_or_default();
    let signer = signed_data
        .signer_infos
        .clone()
        .next()
        .ok_or_else(|| anyhow::anyhow!("token has no SignerInfo"))?;
    let signer_cert = find_signer_certificate(&signer, &certificates)?;
    let public_key = signer_cert.public_key()?;
    let digest = verify_signer(&signer, tst_der, &public_key)?;

    Ok(CounterSignature {
        digest,
        signing_time: summary.gen_time,
        certificates,
    })
}

/// Re-parse an assembled `SignedData` and verify its first signer against
/// the known public key, then verify the attached timestamp token if one
/// is present. For detached signatures the external content must be
/// supplied via `detached_content`.
pub fn verify_signed_data(
    der: &[u8],
    public_key: &PKeyRef<Public>,
    detached_content: Option<&[u8]>,
) -> anyhow::Result<VerifiedSignature> {
    let (_, signed_data) = parse_signed_data(der)?;
    let econtent = match signed_data.content_info.content {
        Some(content) => content
            .parse::<&[u8]>()
            .map_err(|error| anyhow::anyhow!("eContent is not an octet string: {error:?}"))?
            .to_vec(),
        None => detached_content
            .ok_or_else(|| anyhow::anyhow!("detached signature requires external content"))?
            .to_vec(),
    };
    let signer = signed_data
        .signer_infos
        .clone()
        .next()
        .ok_or_else(|| anyhow::anyhow!("SignedData has no SignerInfo"))?;
    let digest = verify_signer(&signer, &econtent, public_key)
        .context("pkcs7: failed signature self-check")?;

    let counter_signature = match &signer.unauthenticated_attributes {
        Some(attributes) => {
            let token = [
                OID_ATTR_TIMESTAMP_TOKEN,
                OID_SPC_TIMESTAMP_TOKEN,
                OID_ATTR_COUNTER_SIGN,
            ]
            .iter()
            .find_map(|oid| attribute_value(attributes, oid));
            match token {
                Some(token) => Some(
                    verify_token(token.full_data(), signer.encrypted_digest)
                        .context("pkcs7: failed timestamp self-check")?,
                ),
                None => None,
            }
        }
        None => None,
    };

    Ok(VerifiedSignature {
        digest,
        encrypted_digest: signer.encrypted_digest.to_vec(),
        counter_signature,
    })
}

impl CounterSignature {
    /// Validate the token's certificate chain against the given roots.
    ///
    /// The signer certificate must cover the token's signing time and
    /// carry the time-stamping extended key usage.
    pub fn verify_chain(&self, roots: &[X509]) -> anyhow::Result<()> {
        let signer_der = self
            .certificates
            .first()
            .ok_or_else(|| anyhow::anyhow!("token has no certificates"))?;
        let signer = X509::from_der(signer_der)?;

        if !has_timestamping_eku(signer_der)? {
            anyhow::bail!("timestamp certificate lacks the time-stamping extended key usage");
        }

        let at = openssl::asn1::Asn1Time::from_unix(self.signing_time.timestamp())?;
        let after_start = signer.not_before().diff(&at)?;
        if after_start.days < 0 || (after_start.days == 0 && after_start.secs < 0) {
            anyhow::bail!("timestamp certificate was not yet valid at signing time");
        }
        let before_end = at.diff(signer.not_after())?;
        if before_end.days < 0 || (before_end.days == 0 && before_end.secs < 0) {
            anyhow::bail!("timestamp certificate had expired at signing time");
        }

        let mut store = X509StoreBuilder::new()?;
        for root in roots {
            store.add_cert(root.clone())?;
        }
        store.set_flags(openssl::x509::verify::X509VerifyFlags::NO_CHECK_TIME)?;
        let store = store.build();

        let mut untrusted = Stack::new()?;
        for der in self.certificates.iter().skip(1) {
            untrusted.push(X509::from_der(der)?)?;
        }
        let mut ctx = openssl::x509::X509StoreContext::new()?;
        let valid = ctx.init(&store, &signer, &untrusted, |c| c.verify_cert())?;
        if !valid {
            anyhow::bail!("timestamp certificate chain does not validate");
        }
        Ok(())
    }
}

/// id-kp-timeStamping, parsed straight out of the certificate extensions.
fn has_timestamping_eku(cert_der: &[u8]) -> anyhow::Result<bool> {
    const OID_EXT_EKU: asn1::ObjectIdentifier = asn1::oid!(2, 5, 29, 37);
    const OID_KP_TIMESTAMPING: asn1::ObjectIdentifier = asn1::oid!(1, 3, 6, 1, 5, 5, 7, 3, 8);

    #[derive(asn1::Asn1Read)]
    struct Extension<'a> {
        extn_id: asn1::ObjectIdentifier,
        #[default(false)]
        critical: bool,
        extn_value: &'a [u8],
    }

    let shell = asn1::parse_single::<CertificateShell<'_>>(cert_der)
        .map_err(|error| anyhow::anyhow!("certificate is invalid: {error:?}"))?;
    let Some(extensions) = shell.tbs.extensions else {
        return Ok(false);
    };
    let extensions = extensions
        .parse::<asn1::SequenceOf<'_, Extension<'_>>>()
        .map_err(|error| anyhow::anyhow!("certificate extensions are invalid: {error:?}"))?;
    for extension in extensions {
        let _ = extension.critical;
        if extension.extn_id == OID_EXT_EKU {
            let usages = asn1::parse_single::<asn1::SequenceOf<'_, asn1::ObjectIdentifier>>(
                extension.extn_value,
            )
            .map_err(|error| anyhow::anyhow!("extended key usage is invalid: {error:?}"))?;
            return Ok(usages.into_iter().any(|oid| oid == OID_KP_TIMESTAMPING));
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use openssl::pkey::PKey;

    use super::*;
    use crate::pkcs7::SignedBuilder;
    use crate::protocol::KeyAlgorithm;

    fn test_rsa_key() -> (PKey<openssl::pkey::Private>, X509) {
        let rsa = openssl::rsa::Rsa::generate(2048).unwrap();
        let key = PKey::from_rsa(rsa).unwrap();
        let mut name = openssl::x509::X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "custodia-test").unwrap();
        let name = name.build();
        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        let serial = openssl::bn::BigNum::from_u32(4242)
            .and_then(|bn| bn.to_asn1_integer())
            .unwrap();
        builder.set_serial_number(&serial).unwrap();
        builder
            .set_not_before(&openssl::asn1::Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&openssl::asn1::Asn1Time::days_from_now(30).unwrap())
            .unwrap();
        builder
            .sign(&key, openssl::hash::MessageDigest::sha256())
            .unwrap();
        (key, builder.build())
    }

    fn sign_digest(key: &PKey<openssl::pkey::Private>, digest: &[u8]) -> Vec<u8> {
        let mut ctx = openssl::pkey_ctx::PkeyCtx::new(key).unwrap();
        ctx.sign_init().unwrap();
        ctx.set_signature_md(openssl::md::Md::sha256()).unwrap();
        ctx.set_rsa_padding(openssl::rsa::Padding::PKCS1).unwrap();
        let mut signature = vec![];
        ctx.sign_to_vec(digest, &mut signature).unwrap();
        signature
    }

    #[test]
    fn assemble_verify_round_trip() {
        let (key, cert) = test_rsa_key();
        let builder = SignedBuilder::new(
            DigestAlgorithm::Sha256,
            KeyAlgorithm::Rsa,
            vec![cert.to_der().unwrap()],
            b"signed payload".to_vec(),
            false,
        );
        let digest = builder.signed_attributes_digest().unwrap();
        let signature = sign_digest(&key, &digest);
        let assembled = builder.assemble(&signature, &[]).unwrap();

        let public = PKey::public_key_from_pem(&key.public_key_to_pem().unwrap()).unwrap();
        let verified = verify_signed_data(&assembled, &public, None).unwrap();
        assert_eq!(verified.digest, DigestAlgorithm::Sha256);
        assert!(verified.counter_signature.is_none());
        assert_eq!(verified.encrypted_digest, signature);
    }

    #[test]
    fn marshal_parse_marshal_is_byte_identical() {
        let (key, cert) = test_rsa_key();
        let builder = SignedBuilder::new(
            DigestAlgorithm::Sha256,
            KeyAlgorithm::Rsa,
            vec![cert.to_der().unwrap()],
            b"round trip".to_vec(),
            false,
        );
        let digest = builder.signed_attributes_digest().unwrap();
        let signature = sign_digest(&key, &digest);
        let assembled = builder.assemble(&signature, &[]).unwrap();

        let parsed = asn1::parse_single::<ContentInfo<'_>>(&assembled).unwrap();
        let rewritten = asn1::write_single(&parsed).unwrap();
        assert_eq!(assembled, rewritten);
    }

    #[test]
    fn tampered_content_fails_self_check() {
        let (key, cert) = test_rsa_key();
        let builder = SignedBuilder::new(
            DigestAlgorithm::Sha256,
            KeyAlgorithm::Rsa,
            vec![cert.to_der().unwrap()],
            b"original".to_vec(),
            false,
        );
        let digest = builder.signed_attributes_digest().unwrap();
        let signature = sign_digest(&key, &digest);
        let mut assembled = builder.assemble(&signature, &[]).unwrap();

        // Flip a byte inside the encapsulated content.
        let position = assembled
            .windows(8)
            .position(|w| w == b"original")
            .unwrap();
        assembled[position] ^= 0x01;

        let public = PKey::public_key_from_pem(&key.public_key_to_pem().unwrap()).unwrap();
        assert!(verify_signed_data(&assembled, &public, None).is_err());
    }

    #[test]
    fn wrong_key_fails_self_check() {
        let (key, cert) = test_rsa_key();
        let (other_key, _) = test_rsa_key();
        let builder = SignedBuilder::new(
            DigestAlgorithm::Sha256,
            KeyAlgorithm::Rsa,
            vec![cert.to_der().unwrap()],
            b"payload".to_vec(),
            false,
        );
        let digest = builder.signed_attributes_digest().unwrap();
        let signature = sign_digest(&key, &digest);
        let assembled = builder.assemble(&signature, &[]).unwrap();

        let public =
            PKey::public_key_from_pem(&other_key.public_key_to_pem().unwrap()).unwrap();
        assert!(verify_signed_data(&assembled, &public, None).is_err());
    }

    #[test]
    fn eku_detection() {
        let (_, cert) = test_rsa_key();
        // The test certificate has no EKU extension at all.
        assert!(!has_timestamping_eku(&cert.to_der().unwrap()).unwrap());
    }
}
