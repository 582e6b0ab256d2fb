// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Format plugins: raw, PKCS#7, OpenPGP, and ZIP-family containers.
//!
//! A plugin is handed the payload, the key and its cached materials, the
//! worker pool, and the timestamper. Custodian errors pass through
//! untouched; plugins only add their own assembly errors.

use bytes::Bytes;

use crate::config::KeyConfig;
use crate::error::SignError;
use crate::pkcs7::{self, SignedBuilder};
use crate::protocol::{DigestAlgorithm, KeyInfo, SignatureFormat};
use crate::timestamp::{TimestampError, Timestamper, TokenKind};
use crate::worker::WorkerPool;
use crate::zip;

pub struct SignContext<'a> {
    pub key: &'a KeyConfig,
    pub info: &'a KeyInfo,
    pub pool: &'a WorkerPool,
    pub timestamper: &'a Timestamper,
}

#[derive(Debug, Clone)]
pub struct SignOptions {
    pub format: SignatureFormat,
    pub digest: DigestAlgorithm,
    pub timestamp: bool,
    /// Attach the timestamp under the Authenticode OID.
    pub authenticode: bool,
    /// The request body is a pre-computed digest rather than content.
    pub payload_is_digest: bool,
    /// Emit a detached PKCS#7 (no encapsulated content).
    pub detached: bool,
}

#[derive(Debug)]
pub struct SignatureArtifact {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
    /// Hex digest of the signed payload, for the audit record.
    pub digest_hex: String,
}

impl From<TimestampError> for SignError {
    fn from(error: TimestampError) -> Self {
        SignError::Internal(anyhow::Error::new(error))
    }
}

/// Produce a signature in the requested format.
pub async fn produce(
    ctx: &SignContext<'_>,
    options: &SignOptions,
    payload: Bytes,
) -> Result<SignatureArtifact, SignError> {
    if !ctx.info.algorithm.accepts(options.digest) {
        return Err(SignError::BadRequest(format!(
            "digest {} is not compatible with key '{}'",
            options.digest, ctx.key.name
        )));
    }
    if options.payload_is_digest && options.format != SignatureFormat::Raw {
        return Err(SignError::BadRequest(
            "digest-only payloads are limited to the raw format".to_string(),
        ));
    }

    match options.format {
        SignatureFormat::Raw => raw(ctx, options, payload).await,
        SignatureFormat::Pkcs7 => pkcs7_sign(ctx, options, payload).await,
        SignatureFormat::Pgp => pgp(ctx, options, payload).await,
        SignatureFormat::Zip => zip_sign(ctx, options, payload).await,
    }
}

async fn raw(
    ctx: &SignContext<'_>,
    options: &SignOptions,
    payload: Bytes,
) -> Result<SignatureArtifact, SignError> {
    let digest = if options.payload_is_digest {
        if payload.len() != options.digest.size() {
            return Err(SignError::BadRequest(format!(
                "digest payload is {} bytes; {} produces {}",
                payload.len(),
                options.digest,
                options.digest.size()
            )));
        }
        payload.to_vec()
    } else {
        openssl::hash::hash(options.digest.into(), &payload)
            .map_err(|e| SignError::Internal(e.into()))?
            .to_vec()
    };

    let signature = ctx.pool.sign(&ctx.key.name, &digest, options.digest).await?;
    Ok(SignatureArtifact {
        bytes: signature,
        content_type: SignatureFormat::Raw.content_type(),
        digest_hex: hex::encode(&digest),
    })
}

/// PKCS#7 assembly: authenticated attributes, a pool-produced signature,
/// an optional timestamp counter-signature, then a mandatory self-check
/// against the known public key.
async fn pkcs7_sign(
    ctx: &SignContext<'_>,
    options: &SignOptions,
    payload: Bytes,
) -> Result<SignatureArtifact, SignError> {
    let artifact = assemble_pkcs7(ctx, options, &payload).await?;
    Ok(SignatureArtifact {
        bytes: artifact,
        content_type: SignatureFormat::Pkcs7.content_type(),
        digest_hex: hex::encode(
            openssl::hash::hash(options.digest.into(), &payload)
                .map_err(|e| SignError::Internal(e.into()))?,
        ),
    })
}

async fn assemble_pkcs7(
    ctx: &SignContext<'_>,
    options: &SignOptions,
    content: &[u8],
) -> Result<Vec<u8>, SignError> {
    if ctx.info.certificate_chain.is_empty() {
        return Err(SignError::BadRequest(format!(
            "key '{}' has no certificate; PKCS#7 requires one",
            ctx.key.name
        )));
    }
    let certificates = ctx
        .info
        .certificate_chain
        .iter()
        .map(|pem| {
            openssl::x509::X509::from_pem(pem.as_bytes())
                .and_then(|cert| cert.to_der())
                .map_err(|e| SignError::Internal(e.into()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let builder = SignedBuilder::new(
        options.digest,
        ctx.info.algorithm,
        certificates,
        content.to_vec(),
        options.detached,
    );
    let attributes_digest = builder
        .signed_attributes_digest()
        .map_err(SignError::Internal)?;
    let signature = ctx
        .pool
        .sign(&ctx.key.name, &attributes_digest, options.digest)
        .await?;

    let timestamp_wanted = options.timestamp || ctx.key.timestamp;
    let unauthenticated = if timestamp_wanted && ctx.timestamper.enabled() {
        let (kind, token) = ctx.timestamper.timestamp(&signature, options.digest).await?;
        let oid = match kind {
            TokenKind::Rfc3161 => pkcs7::timestamp_attribute_oid(options.authenticode),
            TokenKind::Microsoft => pkcs7::OID_ATTR_COUNTER_SIGN,
        };
        vec![(oid, token)]
    } else {
        vec![]
    };

    let assembled = builder
        .assemble(&signature, &unauthenticated)
        .map_err(SignError::Internal)?;

    // Self-check: re-parse and re-verify against the known public key.
    // A failure here means the assembly itself is broken, never the
    // client's fault.
    let public_key =
        openssl::pkey::PKey::public_key_from_pem(ctx.info.public_key.as_bytes())
            .map_err(|e| SignError::Internal(e.into()))?;
    let detached_content = options.detached.then_some(content);
    let verified = pkcs7::verify_signed_data(&assembled, &public_key, detached_content)
        .map_err(SignError::Internal)?;
    if !unauthenticated.is_empty() && verified.counter_signature.is_none() {
        return Err(SignError::Internal(anyhow::anyhow!(
            "timestamp token was attached but did not survive re-parsing"
        )));
    }

    Ok(assembled)
}

async fn pgp(
    ctx: &SignContext<'_>,
    options: &SignOptions,
    payload: Bytes,
) -> Result<SignatureArtifact, SignError> {
    let digest_hex = hex::encode(
        openssl::hash::hash(options.digest.into(), &payload)
            .map_err(|e| SignError::Internal(e.into()))?,
    );
    let signature = ctx.pool.pgp_sign(&ctx.key.name, payload).await?;
    Ok(SignatureArtifact {
        bytes: signature,
        content_type: SignatureFormat::Pgp.content_type(),
        digest_hex,
    })
}

/// The name of the signature entry appended to ZIP-family containers.
const SIGNATURE_ENTRY: &str = "META-INF/SIGNATURE.p7s";

/// Sign a ZIP-family container by re-emitting it with a detached PKCS#7
/// over the rewritten body appended as its final entry.
async fn zip_sign(
    ctx: &SignContext<'_>,
    options: &SignOptions,
    payload: Bytes,
) -> Result<SignatureArtifact, SignError> {
    let size = payload.len() as u64;
    let mut source = zip::Directory::read(payload.as_ref(), size)?;

    let mut out = vec![];
    let mut rebuilt = zip::Directory::new();
    for index in 0..source.files.len() {
        if source.files[index].name == SIGNATURE_ENTRY {
            // Re-signing replaces any previous signature entry.
            continue;
        }
        rebuilt.add_file_from(&mut source, index, &mut out)?;
    }

    let mut inner_options = options.clone();
    inner_options.detached = true;
    let signature = assemble_pkcs7(ctx, &inner_options, &out).await?;

    rebuilt.add_file_data(SIGNATURE_ENTRY, &signature, &mut out)?;
    rebuilt.write_directory_all(&mut out, source.is_zip64())?;

    let digest_hex = hex::encode(
        openssl::hash::hash(options.digest.into(), &payload)
            .map_err(|e| SignError::Internal(e.into()))?,
    );
    Ok(SignatureArtifact {
        bytes: out,
        content_type: SignatureFormat::Zip.content_type(),
        digest_hex,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Isolation, Pkcs11User, TokenConfig, TokenKind as ConfigTokenKind};
    use crate::config::TimestampConfig;
    use crate::protocol::KeyAlgorithm;
    use std::io::Write as _;

    fn file_token(path: &std::path::Path) -> TokenConfig {
        TokenConfig {
            name: "softkey".to_string(),
            kind: ConfigTokenKind::File,
            provider: Some(path.display().to_string()),
            label: None,
            serial: None,
            pin: None,
            user: Pkcs11User::default(),
            isolation: Isolation::Task,
            num_workers: 1,
            timeout: 10,
            retries: 2,
            check_interval: 60,
            check_timeout: 5,
            check_failures: 3,
            cache_seconds: 600,
        }
    }

    struct Fixture {
        _key_file: tempfile::NamedTempFile,
        key: KeyConfig,
        info: KeyInfo,
        pool: WorkerPool,
        timestamper: Timestamper,
    }

    async fn fixture() -> Fixture {
        let rsa = openssl::rsa::Rsa::generate(2048).unwrap();
        let pkey = openssl::pkey::PKey::from_rsa(rsa).unwrap();
        let mut key_file = tempfile::NamedTempFile::new().unwrap();
        key_file
            .write_all(&pkey.private_key_to_pem_pkcs8().unwrap())
            .unwrap();

        // Self-signed certificate so PKCS#7 has a chain to embed.
        let mut name = openssl::x509::X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "release-signer").unwrap();
        let name = name.build();
        let mut builder = openssl::x509::X509::builder().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&pkey).unwrap();
        let serial = openssl::bn::BigNum::from_u32(7)
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
            .sign(&pkey, openssl::hash::MessageDigest::sha256())
            .unwrap();
        let cert = builder.build();

        let key = KeyConfig {
            name: "release".to_string(),
            token: Some("softkey".to_string()),
            ..Default::default()
        };
        let info = KeyInfo {
            certificate_chain: vec![String::from_utf8(cert.to_pem().unwrap()).unwrap()],
            public_key: String::from_utf8(pkey.public_key_to_pem().unwrap()).unwrap(),
            algorithm: KeyAlgorithm::Rsa,
            pgp_certificate: None,
        };
        let pool = WorkerPool::new(
            file_token(key_file.path()),
            vec![key.clone()],
            None,
            None,
            None,
        );
        let timestamper = Timestamper::new(TimestampConfig::default()).unwrap();
        Fixture {
            _key_file: key_file,
            key,
            info,
            pool,
            timestamper,
        }
    }

    fn options(format: SignatureFormat) -> SignOptions {
        SignOptions {
            format,
            digest: DigestAlgorithm::Sha256,
            timestamp: false,
            authenticode: false,
            payload_is_digest: false,
            detached: false,
        }
    }

    #[tokio::test]
    async fn raw_signature_verifies() {
        let fixture = fixture().await;
        let ctx = SignContext {
            key: &fixture.key,
            info: &fixture.info,
            pool: &fixture.pool,
            timestamper: &fixture.timestamper,
        };
        let artifact = produce(&ctx, &options(SignatureFormat::Raw), Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let public =
            openssl::pkey::PKey::public_key_from_pem(fixture.info.public_key.as_bytes()).unwrap();
        let digest =
            openssl::hash::hash(openssl::hash::MessageDigest::sha256(), b"hello").unwrap();
        let mut vctx = openssl::pkey_ctx::PkeyCtx::new(&public).unwrap();
        vctx.verify_init().unwrap();
        vctx.set_signature_md(openssl::md::Md::sha256()).unwrap();
        vctx.set_rsa_padding(openssl::rsa::Padding::PKCS1).unwrap();
        assert!(vctx.verify(&digest, &artifact.bytes).unwrap());
        fixture.pool.shutdown().await;
    }

    #[tokio::test]
    async fn pkcs7_passes_self_check_and_reparses() {
        let fixture = fixture().await;
        let ctx = SignContext {
            key: &fixture.key,
            info: &fixture.info,
            pool: &fixture.pool,
            timestamper: &fixture.timestamper,
        };
        let artifact = produce(
            &ctx,
            &options(SignatureFormat::Pkcs7),
            Bytes::from_static(b"the content"),
        )
        .await
        .unwrap();
        assert_eq!(artifact.content_type, "application/pkcs7-signature");

        let public =
            openssl::pkey::PKey::public_key_from_pem(fixture.info.public_key.as_bytes()).unwrap();
        let verified = pkcs7::verify_signed_data(&artifact.bytes, &public, None).unwrap();
        assert!(verified.counter_signature.is_none());
        fixture.pool.shutdown().await;
    }

    #[tokio::test]
    async fn zip_signing_appends_signature_entry() {
        let fixture = fixture().await;
        let ctx = SignContext {
            key: &fixture.key,
            info: &fixture.info,
            pool: &fixture.pool,
            timestamper: &fixture.timestamper,
        };

        let mut archive = vec![];
        let mut dir = zip::Directory::new();
        dir.add_file_data("hello.txt", b"hello world", &mut archive)
            .unwrap();
        dir.add_file_data("dir/data.bin", &[7u8; 128], &mut archive)
            .unwrap();
        dir.write_directory_all(&mut archive, false).unwrap();

        let artifact = produce(
            &ctx,
            &options(SignatureFormat::Zip),
            Bytes::from(archive),
        )
        .await
        .unwrap();

        let size = artifact.bytes.len() as u64;
        let signed = zip::Directory::read(artifact.bytes.as_slice(), size).unwrap();
        assert_eq!(signed.files.len(), 3);
        assert_eq!(signed.files[0].name, "hello.txt");
        assert_eq!(signed.files[2].name, SIGNATURE_ENTRY);

        // The appended entry holds a PKCS#7 over the body prefix.
        let signature_offset = signed.files[2].offset as usize;
        let body = &artifact.bytes[..signature_offset];
        let entry = &signed.files[2];
        let local_len = 30 + entry.name.len();
        let p7 = &artifact.bytes
            [signature_offset + local_len..signature_offset + local_len + entry.compressed_size as usize];
        let public =
            openssl::pkey::PKey::public_key_from_pem(fixture.info.public_key.as_bytes()).unwrap();
        // Detached signature: the message digest attribute covers the body.
        assert!(pkcs7::verify_signed_data(p7, &public, Some(body)).is_ok());
        assert!(pkcs7::verify_signed_data(p7, &public, None).is_err());
        fixture.pool.shutdown().await;
    }

    #[tokio::test]
    async fn digest_only_payload_rejected_for_pkcs7() {
        let fixture = fixture().await;
        let ctx = SignContext {
            key: &fixture.key,
            info: &fixture.info,
            pool: &fixture.pool,
            timestamper: &fixture.timestamper,
        };
        let mut opts = options(SignatureFormat::Pkcs7);
        opts.payload_is_digest = true;
        let error = produce(&ctx, &opts, Bytes::from_static(&[0u8; 32]))
            .await
            .unwrap_err();
        assert!(matches!(error, SignError::BadRequest(_)));
        fixture.pool.shutdown().await;
    }

    #[tokio::test]
    async fn incompatible_digest_rejected() {
        let fixture = fixture().await;
        let mut info = fixture.info.clone();
        info.algorithm = KeyAlgorithm::P256;
        let ctx = SignContext {
            key: &fixture.key,
            info: &info,
            pool: &fixture.pool,
            timestamper: &fixture.timestamper,
        };
        let mut opts = options(SignatureFormat::Raw);
        opts.digest = DigestAlgorithm::Sha512;
        let error = produce(&ctx, &opts, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(error, SignError::BadRequest(_)));
        fixture.pool.shutdown().await;
    }
}
