// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! PKCS#11 hardware token backend.

use std::collections::HashMap;

use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::error::RvError;
use cryptoki::mechanism::Mechanism;
use cryptoki::object::{Attribute, AttributeType, ObjectClass, ObjectHandle};
use cryptoki::session::UserType;
use cryptoki::slot::Slot;
use cryptoki::types::AuthPin;

use crate::config::{KeyConfig, Pkcs11User, TokenConfig};
use crate::error::BackendError;
use crate::pkcs7::digest_oid;
use crate::protocol::{DigestAlgorithm, KeyAlgorithm, KeyInfo};
use crate::token::{KeyEntry, assemble_key_info, ecdsa_raw_to_der};

/// Used for RSA PKCS1 v1.5 signatures.
/// Reference: https://www.ietf.org/rfc/rfc8017.html#section-9.2
#[derive(asn1::Asn1Write, asn1::Asn1Read)]
struct DigestInfo<'a> {
    digest_algorithm: AlgorithmIdentifier,
    digest: &'a [u8],
}

#[derive(asn1::Asn1Write, asn1::Asn1Read)]
struct AlgorithmIdentifier {
    algorithm: asn1::ObjectIdentifier,
    parameters: (),
}

/// Encode a hash into the DigestInfo structure CKM_RSA_PKCS expects.
fn encode_digest_info(algorithm: DigestAlgorithm, hash: &[u8]) -> Result<Vec<u8>, BackendError> {
    let digest_info = DigestInfo {
        digest_algorithm: AlgorithmIdentifier {
            algorithm: digest_oid(algorithm),
            parameters: (),
        },
        digest: hash,
    };
    asn1::write_single(&digest_info)
        .map_err(|e| BackendError::Fatal(format!("failed to encode DigestInfo: {e}")))
}

fn map_error(context: &str, error: cryptoki::error::Error) -> BackendError {
    use cryptoki::error::Error;
    match &error {
        Error::Pkcs11(rv, _) => match rv {
            RvError::DeviceRemoved
            | RvError::DeviceError
            | RvError::SessionClosed
            | RvError::SessionHandleInvalid
            | RvError::TokenNotPresent
            | RvError::GeneralError => {
                BackendError::SessionLost(format!("{context}: {error}"))
            }
            RvError::PinIncorrect | RvError::PinLocked | RvError::UserNotLoggedIn => {
                BackendError::Unavailable(format!("{context}: {error}"))
            }
            RvError::KeyFunctionNotPermitted | RvError::KeyTypeInconsistent => {
                BackendError::SigningRefused(format!("{context}: {error}"))
            }
            _ => BackendError::Fatal(format!("{context}: {error}")),
        },
        Error::LibraryLoading(_) => BackendError::Unavailable(format!("{context}: {error}")),
        _ => BackendError::Fatal(format!("{context}: {error}")),
    }
}

/// Pick the slot matching the token's label/serial selectors. Without
/// selectors the most recently listed slot wins.
fn select_slot(pkcs11: &Pkcs11, token: &TokenConfig) -> Result<Slot, BackendError> {
    let slots = pkcs11
        .get_slots_with_token()
        .map_err(|e| map_error("listing slots", e))?;
    if token.label.is_none() && token.serial.is_none() {
        return slots.last().copied().ok_or_else(|| {
            BackendError::Unavailable(format!("token '{}' has no slots", token.name))
        });
    }
    let mut matches = vec![];
    for slot in slots {
        let info = pkcs11
            .get_token_info(slot)
            .map_err(|e| map_error("reading token info", e))?;
        let label_ok = token
            .label
            .as_deref()
            .is_none_or(|label| info.label().trim_end() == label);
        let serial_ok = token
            .serial
            .as_deref()
            .is_none_or(|serial| info.serial_number().trim_end() == serial);
        if label_ok && serial_ok {
            matches.push(slot);
        }
    }
    match matches.len() {
        0 => Err(BackendError::Unavailable(format!(
            "no slot matches the selectors for token '{}'",
            token.name
        ))),
        1 => Ok(matches[0]),
        _ => Err(BackendError::SelectorAmbiguous(format!(
            "token '{}' selectors match {} slots",
            token.name,
            matches.len()
        ))),
    }
}

pub struct Pkcs11Session {
    token_name: String,
    pkcs11: Pkcs11,
    slot: Slot,
    session: cryptoki::session::Session,
    /// Private-key object handles resolved per key name.
    handles: HashMap<String, ObjectHandle>,
}

impl Pkcs11Session {
    pub fn open(
        token: &TokenConfig,
        _keys: &[KeyConfig],
        pin: Option<String>,
    ) -> Result<Self, BackendError> {
        let module = token.provider.as_deref().ok_or_else(|| {
            BackendError::Fatal(format!("token '{}' names no provider module", token.name))
        })?;
        let pkcs11 = Pkcs11::new(module)
            .map_err(|e| map_error("loading PKCS#11 module", e))?;
        pkcs11
            .initialize(CInitializeArgs::OsThreads)
            .map_err(|e| map_error("initializing PKCS#11 module", e))?;

        let slot = select_slot(&pkcs11, token)?;
        let session = pkcs11
            .open_ro_session(slot)
            .map_err(|e| map_error("opening session", e))?;

        // An absent PIN skips login entirely; a blank PIN logs in over the
        // protected authentication path (PIN pad, biometric).
        if let Some(pin) = pin {
            let user_type = match token.user {
                Pkcs11User::User => UserType::User,
                Pkcs11User::SecurityOfficer => UserType::So,
                Pkcs11User::ContextSpecific => UserType::ContextSpecific,
            };
            let auth_pin = if pin.is_empty() {
                None
            } else {
                Some(AuthPin::from(pin))
            };
            session
                .login(user_type, auth_pin.as_ref())
                .map_err(|e| map_error("logging in to token", e))?;
        }

        tracing::info!(token = token.name, slot = slot.id(), "PKCS#11 session open");
        Ok(Self {
            token_name: token.name.clone(),
            pkcs11,
            slot,
            session,
            handles: HashMap::new(),
        })
    }

    pub fn list_keys(&mut self) -> Result<Vec<KeyEntry>, BackendError> {
        let attributes = [AttributeType::Id, AttributeType::Label, AttributeType::KeyType];
        // Only one find operation may be active on a session; finish the
        // private-key sweep before probing for certificates.
        let mut found = vec![];
        {
            let objects = self
                .session
                .iter_objects(&[Attribute::Class(ObjectClass::PRIVATE_KEY)])
                .map_err(|e| map_error("searching private keys", e))?;
            for object in objects {
                let object = object.map_err(|e| map_error("iterating private keys", e))?;
                let mut id = None;
                let mut label = None;
                let mut key_type = None;
                for attr in self
                    .session
                    .get_attributes(object, &attributes)
                    .map_err(|e| map_error("reading key attributes", e))?
                {
                    match attr {
                        Attribute::Id(value) => id = Some(hex::encode(value)),
                        Attribute::Label(value) => label = String::from_utf8(value).ok(),
                        Attribute::KeyType(kt) => {
                            key_type = match kt {
                                cryptoki::object::KeyType::RSA => Some(KeyAlgorithm::Rsa),
                                cryptoki::object::KeyType::EC => Some(KeyAlgorithm::P256),
                                _ => None,
                            }
                        }
                        _ => {}
                    }
                }
                if let Some(id) = id {
                    found.push((id, label, key_type));
                }
            }
        }

        let mut entries = vec![];
        for (id, label, algorithm) in found {
            let has_certificate = self
                .find_one(
                    &[
                        Attribute::Class(ObjectClass::CERTIFICATE),
                        Attribute::Id(hex::decode(&id).unwrap_or_default()),
                    ],
                    "certificate",
                )
                .is_ok();
            entries.push(KeyEntry {
                id,
                label,
                algorithm,
                has_certificate,
            });
        }
        Ok(entries)
    }

    /// Resolve a key's private-key object by its configured selectors.
    fn key_handle(&mut self, key: &KeyConfig) -> Result<ObjectHandle, BackendError> {
        if let Some(handle) = self.handles.get(&key.name) {
            return Ok(*handle);
        }
        let mut template = vec![Attribute::Class(ObjectClass::PRIVATE_KEY)];
        if let Some(label) = &key.label {
            template.push(Attribute::Label(label.as_bytes().to_vec()));
        }
        if let Some(id) = &key.id {
            let id = hex::decode(id).map_err(|_| {
                BackendError::Fatal(format!("key '{}' id selector is not hex", key.name))
            })?;
            template.push(Attribute::Id(id));
        }
        if template.len() == 1 {
            return Err(BackendError::KeyNotFound(format!(
                "key '{}' has no label or id selector",
                key.name
            )));
        }
        let handle = self.find_one(&template, &key.name)?;
        self.handles.insert(key.name.clone(), handle);
        Ok(handle)
    }

    fn find_one(
        &self,
        template: &[Attribute],
        what: &str,
    ) -> Result<ObjectHandle, BackendError> {
        let mut matches = vec![];
        let objects = self
            .session
            .iter_objects(template)
            .map_err(|e| map_error("searching objects", e))?;
        for object in objects {
            matches.push(object.map_err(|e| map_error("iterating objects", e))?);
            if matches.len() > 1 {
                return Err(BackendError::SelectorAmbiguous(format!(
                    "selector for '{what}' matches more than one object on token '{}'",
                    self.token_name
                )));
            }
        }
        matches
            .pop()
            .ok_or_else(|| BackendError::KeyNotFound(what.to_string()))
    }

    pub fn sign(
        &mut self,
        key: &KeyConfig,
        digest: &[u8],
        algorithm: DigestAlgorithm,
    ) -> Result<Vec<u8>, BackendError> {
        let handle = self.key_handle(key)?;
        let key_type = self.key_type(handle)?;

        // The input format differs per mechanism: CKM_RSA_PKCS wants the
        // full DigestInfo, CKM_ECDSA wants the raw hash.
        let (mechanism, data) = match key_type {
            KeyAlgorithm::Rsa => (Mechanism::RsaPkcs, encode_digest_info(algorithm, digest)?),
            KeyAlgorithm::P256 | KeyAlgorithm::P384 => (Mechanism::Ecdsa, digest.to_vec()),
        };
        let signature = self
            .session
            .sign(&mechanism, handle, &data)
            .map_err(|e| map_error("PKCS#11 signing operation", e))?;

        match key_type {
            KeyAlgorithm::Rsa => Ok(signature),
            // PKCS#11 returns raw r and s; normalize to DER like every
            // other signing path (refer to RFC 6979 appendix A.1.3).
            KeyAlgorithm::P256 | KeyAlgorithm::P384 => ecdsa_raw_to_der(&signature),
        }
    }

    fn key_type(&self, handle: ObjectHandle) -> Result<KeyAlgorithm, BackendError> {
        for attr in self
            .session
            .get_attributes(handle, &[AttributeType::KeyType])
            .map_err(|e| map_error("reading key type", e))?
        {
            if let Attribute::KeyType(kt) = attr {
                return match kt {
                    cryptoki::object::KeyType::RSA => Ok(KeyAlgorithm::Rsa),
                    cryptoki::object::KeyType::EC => Ok(KeyAlgorithm::P256),
                    other => Err(BackendError::Fatal(format!(
                        "unsupported key type {other:?}"
                    ))),
                };
            }
        }
        Err(BackendError::Fatal("token reports no key type".to_string()))
    }

    pub fn key_info(&mut self, key: &KeyConfig) -> Result<KeyInfo, BackendError> {
        let handle = self.key_handle(key)?;

        let mut key_id = None;
        for attr in self
            .session
            .get_attributes(handle, &[AttributeType::Id])
            .map_err(|e| map_error("reading key id", e))?
        {
            if let Attribute::Id(id) = attr {
                key_id = Some(id);
            }
        }

        // Match up the certificate and public key stored on the token with
        // the private key via the Id attribute.
        let mut chain = vec![];
        let mut public_key = None;
        if let Some(id) = key_id {
            if let Ok(cert) = self.find_one(
                &[
                    Attribute::Class(ObjectClass::CERTIFICATE),
                    Attribute::Id(id.clone()),
                ],
                &key.name,
            ) {
                for attr in self
                    .session
                    .get_attributes(cert, &[AttributeType::Value])
                    .map_err(|e| map_error("reading certificate", e))?
                {
                    if let Attribute::Value(der) = attr {
                        let pem = openssl::x509::X509::from_der(&der)
                            .and_then(|cert| cert.to_pem())
                            .ok()
                            .and_then(|pem| String::from_utf8(pem).ok());
                        if let Some(pem) = pem {
                            chain.push(pem);
                        }
                    }
                }
            }
            if let Ok(public) = self.find_one(
                &[
                    Attribute::Class(ObjectClass::PUBLIC_KEY),
                    Attribute::Id(id),
                ],
                &key.name,
            ) {
                for attr in self
                    .session
                    .get_attributes(public, &[AttributeType::PublicKeyInfo])
                    .map_err(|e| map_error("reading public key", e))?
                {
                    if let Attribute::PublicKeyInfo(der) = attr {
                        public_key = openssl::pkey::PKey::public_key_from_der(&der)
                            .and_then(|pkey| pkey.public_key_to_pem())
                            .ok()
                            .and_then(|pem| String::from_utf8(pem).ok());
                    }
                }
            }
        }

        assemble_key_info(key, chain, public_key)
    }

    pub fn ping(&mut self) -> Result<(), BackendError> {
        self.pkcs11
            .get_token_info(self.slot)
            .map(|_| ())
            .map_err(|e| map_error("token health check", e))
    }

    pub fn close(self) {
        drop(self.session);
        self.pkcs11.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_info_encoding_round_trips() {
        let hash = [0x5Au8; 32];
        let encoded = encode_digest_info(DigestAlgorithm::Sha256, &hash).unwrap();
        let decoded = asn1::parse_single::<DigestInfo<'_>>(&encoded).unwrap();
        assert_eq!(decoded.digest, hash);
        assert_eq!(
            decoded.digest_algorithm.algorithm,
            digest_oid(DigestAlgorithm::Sha256)
        );
    }
}
