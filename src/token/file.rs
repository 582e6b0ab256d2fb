// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! On-disk key file backend.
//!
//! A token of kind `file` points at a PEM private key or a PKCS#12 bundle;
//! PKCS#12 bundles decompose into the key plus its certificate chain. The
//! token `pin` doubles as the file passphrase. OpenPGP keys live in the
//! same files as armored transferable secret keys.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use openssl::pkey::{PKey, Private};
use sequoia_openpgp::crypto::Password;
use sequoia_openpgp::parse::Parse;
use sequoia_openpgp::policy::StandardPolicy;
use sequoia_openpgp::serialize::stream::{Message, Signer as PgpSigner};

use crate::config::{KeyConfig, TokenConfig};
use crate::error::BackendError;
use crate::protocol::{DigestAlgorithm, KeyAlgorithm, KeyInfo};
use crate::token::{KeyEntry, assemble_key_info, detect_algorithm};

struct LoadedKey {
    pkey: PKey<Private>,
    chain: Vec<String>,
    algorithm: KeyAlgorithm,
}

pub struct FileSession {
    token_name: String,
    default_path: Option<PathBuf>,
    passphrase: Option<String>,
    loaded: HashMap<String, LoadedKey>,
}

impl FileSession {
    pub fn open(
        token: &TokenConfig,
        _keys: &[KeyConfig],
        pin: Option<String>,
    ) -> Result<Self, BackendError> {
        let default_path = token.provider.as_deref().map(PathBuf::from);
        if let Some(path) = &default_path
            && !path.exists()
        {
            return Err(BackendError::Unavailable(format!(
                "key file {} does not exist",
                path.display()
            )));
        }
        Ok(Self {
            token_name: token.name.clone(),
            default_path,
            passphrase: pin,
            loaded: HashMap::new(),
        })
    }

    fn key_path(&self, key: &KeyConfig) -> Result<PathBuf, BackendError> {
        key.key_file
            .clone()
            .or_else(|| self.default_path.clone())
            .ok_or_else(|| {
                BackendError::KeyNotFound(format!(
                    "key '{}' names no key file and token '{}' has no default",
                    key.name, self.token_name
                ))
            })
    }

    fn load(&mut self, key: &KeyConfig) -> Result<&LoadedKey, BackendError> {
        if !self.loaded.contains_key(&key.name) {
            let path = self.key_path(key)?;
            let raw = std::fs::read(&path).map_err(|e| {
                BackendError::Unavailable(format!("reading {}: {e}", path.display()))
            })?;

            let (pkey, chain) = if raw.starts_with(b"-----BEGIN") {
                let pkey = match &self.passphrase {
                    Some(passphrase) => {
                        PKey::private_key_from_pem_passphrase(&raw, passphrase.as_bytes())
                    }
                    None => PKey::private_key_from_pem(&raw),
                }
                .map_err(|e| {
                    BackendError::Unavailable(format!("decrypting {}: {e}", path.display()))
                })?;
                (pkey, vec![])
            } else {
                let parsed = openssl::pkcs12::Pkcs12::from_der(&raw)
                    .and_then(|p12| p12.parse2(self.passphrase.as_deref().unwrap_or("")))
                    .map_err(|e| {
                        BackendError::Unavailable(format!("opening {}: {e}", path.display()))
                    })?;
                let pkey = parsed.pkey.ok_or_else(|| {
                    BackendError::KeyNotFound(format!(
                        "{} holds no private key",
                        path.display()
                    ))
                })?;
                let mut chain = vec![];
                if let Some(cert) = parsed.cert {
                    if let Ok(pem) = cert.to_pem().map(|p| String::from_utf8_lossy(&p).into_owned())
                    {
                        chain.push(pem);
                    }
                }
                if let Some(ca) = parsed.ca {
                    for cert in ca {
                        if let Ok(pem) =
                            cert.to_pem().map(|p| String::from_utf8_lossy(&p).into_owned())
                        {
                            chain.push(pem);
                        }
                    }
                }
                (pkey, chain)
            };

            let public = PKey::public_key_from_pem(&pkey.public_key_to_pem().map_err(|e| {
                BackendError::Fatal(e.to_string())
            })?)
            .map_err(|e| BackendError::Fatal(e.to_string()))?;
            let algorithm = detect_algorithm(&public)?;
            self.loaded.insert(
                key.name.clone(),
                LoadedKey {
                    pkey,
                    chain,
                    algorithm,
                },
            );
        }
        Ok(self.loaded.get(&key.name).expect("just inserted"))
    }

    pub fn list_keys(&mut self) -> Result<Vec<KeyEntry>, BackendError> {
        match &self.default_path {
            Some(path) => Ok(vec![KeyEntry {
                id: path.display().to_string(),
                label: None,
                algorithm: None,
                has_certificate: false,
            }]),
            None => Ok(vec![]),
        }
    }

    pub fn sign(
        &mut self,
        key: &KeyConfig,
        digest: &[u8],
        algorithm: DigestAlgorithm,
    ) -> Result<Vec<u8>, BackendError> {
        let loaded = self.load(key)?;
        let mut ctx = openssl::pkey_ctx::PkeyCtx::new(&loaded.pkey)
            .map_err(|e| BackendError::Fatal(e.to_string()))?;
        ctx.sign_init().map_err(|e| BackendError::Fatal(e.to_string()))?;
        let md = match algorithm {
            DigestAlgorithm::Sha256 => openssl::md::Md::sha256(),
            DigestAlgorithm::Sha384 => openssl::md::Md::sha384(),
            DigestAlgorithm::Sha512 => openssl::md::Md::sha512(),
        };
        ctx.set_signature_md(md)
            .map_err(|e| BackendError::Fatal(e.to_string()))?;
        if loaded.algorithm == KeyAlgorithm::Rsa {
            // PKCS #1 should be the default, but lets be explicit about it.
            ctx.set_rsa_padding(openssl::rsa::Padding::PKCS1)
                .map_err(|e| BackendError::Fatal(e.to_string()))?;
        }
        let mut signature = vec![];
        ctx.sign_to_vec(digest, &mut signature)
            .map_err(|e| BackendError::Fatal(format!("signing failed: {e}")))?;
        Ok(signature)
    }

    /// Produce a detached OpenPGP signature over the payload.
    pub fn pgp_sign(&mut self, key: &KeyConfig, payload: &[u8]) -> Result<Vec<u8>, BackendError> {
        let path = self.key_path(key)?;
        let cert = sequoia_openpgp::Cert::from_file(&path).map_err(|e| {
            BackendError::Unavailable(format!("reading OpenPGP key {}: {e}", path.display()))
        })?;
        let policy = &StandardPolicy::new();
        let signing_key = cert
            .keys()
            .secret()
            .with_policy(policy, None)
            .supported()
            .for_signing()
            .next()
            .ok_or_else(|| {
                BackendError::KeyNotFound(format!(
                    "no signing-capable key found in {}",
                    path.display()
                ))
            })?
            .key()
            .clone();
        let signing_key = match &self.passphrase {
            Some(passphrase) => signing_key
                .decrypt_secret(&Password::from(passphrase.as_str()))
                .map_err(|e| BackendError::Unavailable(format!("decrypting OpenPGP key: {e}")))?,
            None => signing_key,
        };
        let keypair = signing_key
            .into_keypair()
            .map_err(|e| BackendError::Fatal(format!("OpenPGP key is unusable: {e}")))?;

        let mut sink = vec![];
        (|| {
            let message = Message::new(&mut sink);
            let signer = PgpSigner::new(message, keypair)?;
            let mut message = signer.detached().build()?;
            message.write_all(payload)?;
            message.finalize()?;
            Ok::<_, anyhow::Error>(())
        })()
        .map_err(|e| BackendError::Fatal(format!("OpenPGP signing failed: {e}")))?;
        Ok(sink)
    }

    pub fn key_info(&mut self, key: &KeyConfig) -> Result<KeyInfo, BackendError> {
        self.load(key)?;
        let loaded = self.loaded.get(&key.name).expect("loaded above");
        let public_key = loaded
            .pkey
            .public_key_to_pem()
            .ok()
            .and_then(|pem| String::from_utf8(pem).ok());
        assemble_key_info(key, loaded.chain.clone(), public_key)
    }

    pub fn ping(&mut self) -> Result<(), BackendError> {
        if let Some(path) = &self.default_path
            && !path.exists()
        {
            return Err(BackendError::Unavailable(format!(
                "key file {} disappeared",
                path.display()
            )));
        }
        Ok(())
    }
}
