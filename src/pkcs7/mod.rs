// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! PKCS#7 / CMS `SignedData` reading, assembly, and self-verification.
//!
//! Parsed structures borrow from the input and re-serialize byte-identically;
//! assembly builds DER bottom-up so the signature over the authenticated
//! attributes is computed on exactly the bytes that get emitted.

mod builder;
mod verify;

use asn1::{ObjectIdentifier, oid};

pub use builder::{SignedBuilder, timestamp_attribute_oid};
pub use verify::{CounterSignature, VerifiedSignature, verify_signed_data};

use crate::protocol::DigestAlgorithm;

pub const OID_DATA: ObjectIdentifier = oid!(1, 2, 840, 113549, 1, 7, 1);
pub const OID_SIGNED_DATA: ObjectIdentifier = oid!(1, 2, 840, 113549, 1, 7, 2);

pub const OID_ATTR_CONTENT_TYPE: ObjectIdentifier = oid!(1, 2, 840, 113549, 1, 9, 3);
pub const OID_ATTR_MESSAGE_DIGEST: ObjectIdentifier = oid!(1, 2, 840, 113549, 1, 9, 4);
pub const OID_ATTR_SIGNING_TIME: ObjectIdentifier = oid!(1, 2, 840, 113549, 1, 9, 5);
pub const OID_ATTR_COUNTER_SIGN: ObjectIdentifier = oid!(1, 2, 840, 113549, 1, 9, 6);
/// id-aa-timeStampToken, the generic RFC 3161 attachment point.
pub const OID_ATTR_TIMESTAMP_TOKEN: ObjectIdentifier =
    oid!(1, 2, 840, 113549, 1, 9, 16, 2, 14);
/// szOID_RFC3161_counterSign, the Authenticode attachment point.
pub const OID_SPC_TIMESTAMP_TOKEN: ObjectIdentifier = oid!(1, 3, 6, 1, 4, 1, 311, 3, 3, 1);

pub const OID_CT_TSTINFO: ObjectIdentifier = oid!(1, 2, 840, 113549, 1, 9, 16, 1, 4);

// SHA OID references: https://www.ietf.org/rfc/rfc4055.html#section-6
pub const OID_SHA256: ObjectIdentifier = oid!(2, 16, 840, 1, 101, 3, 4, 2, 1);
pub const OID_SHA384: ObjectIdentifier = oid!(2, 16, 840, 1, 101, 3, 4, 2, 2);
pub const OID_SHA512: ObjectIdentifier = oid!(2, 16, 840, 1, 101, 3, 4, 2, 3);

pub const OID_RSA_ENCRYPTION: ObjectIdentifier = oid!(1, 2, 840, 113549, 1, 1, 1);
pub const OID_ECDSA_SHA256: ObjectIdentifier = oid!(1, 2, 840, 10045, 4, 3, 2);
pub const OID_ECDSA_SHA384: ObjectIdentifier = oid!(1, 2, 840, 10045, 4, 3, 3);
pub const OID_ECDSA_SHA512: ObjectIdentifier = oid!(1, 2, 840, 10045, 4, 3, 4);

pub fn digest_oid(algorithm: DigestAlgorithm) -> ObjectIdentifier {
    match algorithm {
        DigestAlgorithm::Sha256 => OID_SHA256,
        DigestAlgorithm::Sha384 => OID_SHA384,
        DigestAlgorithm::Sha512 => OID_SHA512,
    }
}

pub fn digest_from_oid(oid: &ObjectIdentifier) -> Option<DigestAlgorithm> {
    if *oid == OID_SHA256 {
        Some(DigestAlgorithm::Sha256)
    } else if *oid == OID_SHA384 {
        Some(DigestAlgorithm::Sha384)
    } else if *oid == OID_SHA512 {
        Some(DigestAlgorithm::Sha512)
    } else {
        None
    }
}

#[derive(asn1::Asn1Read, asn1::Asn1Write)]
pub struct AlgorithmIdentifier<'a> {
    pub algorithm: ObjectIdentifier,
    pub parameters: Option<asn1::Tlv<'a>>,
}

#[derive(asn1::Asn1Read, asn1::Asn1Write)]
pub struct ContentInfo<'a> {
    pub content_type: ObjectIdentifier,
    #[explicit(0)]
    pub content: Option<asn1::Tlv<'a>>,
}

#[derive(asn1::Asn1Read, asn1::Asn1Write)]
pub struct SignedData<'a> {
    pub version: u8,
    pub digest_algorithms: asn1::SetOf<'a, AlgorithmIdentifier<'a>>,
    pub content_info: ContentInfo<'a>,
    #[implicit(0)]
    pub certificates: Option<asn1::SetOf<'a, asn1::Tlv<'a>>>,
    #[implicit(1)]
    pub crls: Option<asn1::SetOf<'a, asn1::Tlv<'a>>>,
    pub signer_infos: asn1::SetOf<'a, SignerInfo<'a>>,
}

#[derive(asn1::Asn1Read, asn1::Asn1Write)]
pub struct IssuerAndSerialNumber<'a> {
    pub issuer: asn1::Tlv<'a>,
    pub serial_number: asn1::BigInt<'a>,
}

#[derive(asn1::Asn1Read, asn1::Asn1Write)]
pub struct SignerInfo<'a> {
    pub version: u8,
    pub sid: IssuerAndSerialNumber<'a>,
    pub digest_algorithm: AlgorithmIdentifier<'a>,
    #[implicit(0)]
    pub authenticated_attributes: Option<asn1::SetOf<'a, Attribute<'a>>>,
    pub digest_encryption_algorithm: AlgorithmIdentifier<'a>,
    pub encrypted_digest: &'a [u8],
    #[implicit(1)]
    pub unauthenticated_attributes: Option<asn1::SetOf<'a, Attribute<'a>>>,
}

#[derive(asn1::Asn1Read, asn1::Asn1Write)]
pub struct Attribute<'a> {
    pub attr_type: ObjectIdentifier,
    pub values: asn1::SetOf<'a, asn1::Tlv<'a>>,
}

/// The subset of an X.509 certificate assembly needs: issuer and serial.
#[derive(asn1::Asn1Read)]
pub(crate) struct CertificateShell<'a> {
    pub tbs: TbsCertificateShell<'a>,
    pub signature_algorithm: asn1::Tlv<'a>,
    pub signature: asn1::Tlv<'a>,
}

#[derive(asn1::Asn1Read)]
pub(crate) struct TbsCertificateShell<'a> {
    #[explicit(0)]
    pub version: Option<asn1::Tlv<'a>>,
    pub serial_number: asn1::BigInt<'a>,
    pub signature: asn1::Tlv<'a>,
    pub issuer: asn1::Tlv<'a>,
    pub validity: asn1::Tlv<'a>,
    pub subject: asn1::Tlv<'a>,
    pub subject_public_key_info: asn1::Tlv<'a>,
    #[implicit(1)]
    pub issuer_unique_id: Option<asn1::BitString<'a>>,
    #[implicit(2)]
    pub subject_unique_id: Option<asn1::BitString<'a>>,
    #[explicit(3)]
    pub extensions: Option<asn1::Tlv<'a>>,
}

/// Minimal DER emission helpers for bottom-up assembly.
pub(crate) mod der {
    use asn1::ObjectIdentifier;

    pub const TAG_INTEGER: u8 = 0x02;
    pub const TAG_OCTET_STRING: u8 = 0x04;
    pub const TAG_NULL: u8 = 0x05;
    pub const TAG_UTC_TIME: u8 = 0x17;
    pub const TAG_SEQUENCE: u8 = 0x30;
    pub const TAG_SET: u8 = 0x31;
    pub const TAG_CONTEXT_0: u8 = 0xA0;
    pub const TAG_CONTEXT_1: u8 = 0xA1;

    pub fn write_tlv(buf: &mut Vec<u8>, tag: u8, value: &[u8]) {
        buf.push(tag);
        let len = value.len();
        if len < 128 {
            buf.push(len as u8);
        } else if len < 256 {
            buf.push(0x81);
            buf.push(len as u8);
        } else if len < 65_536 {
            buf.push(0x82);
            buf.extend_from_slice(&(len as u16).to_be_bytes());
        } else if len < 16_777_216 {
            buf.push(0x83);
            buf.extend_from_slice(&(len as u32).to_be_bytes()[1..]);
        } else {
            buf.push(0x84);
            buf.extend_from_slice(&(len as u32).to_be_bytes());
        }
        buf.extend_from_slice(value);
    }

    pub fn tlv(tag: u8, value: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(value.len() + 6);
        write_tlv(&mut buf, tag, value);
        buf
    }

    /// The complete DER encoding (tag, length, value) of an OID.
    pub fn oid_tlv(oid: &ObjectIdentifier) -> Vec<u8> {
        asn1::write_single(oid).expect("OID encoding is infallible")
    }

    /// An `AlgorithmIdentifier` with explicit NULL parameters.
    pub fn algorithm_null_params(oid: &ObjectIdentifier) -> Vec<u8> {
        let mut inner = oid_tlv(oid);
        write_tlv(&mut inner, TAG_NULL, &[]);
        tlv(TAG_SEQUENCE, &inner)
    }

    /// An `AlgorithmIdentifier` with absent parameters (ECDSA style).
    pub fn algorithm_no_params(oid: &ObjectIdentifier) -> Vec<u8> {
        tlv(TAG_SEQUENCE, &oid_tlv(oid))
    }

    /// A DER SET OF from pre-encoded elements; DER requires the elements in
    /// ascending encoded order.
    pub fn set_of(mut elements: Vec<Vec<u8>>) -> Vec<u8> {
        elements.sort();
        let mut content = vec![];
        for element in &elements {
            content.extend_from_slice(element);
        }
        tlv(TAG_SET, &content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn der_lengths() {
        let short = der::tlv(0x04, &[1, 2, 3]);
        assert_eq!(short, vec![0x04, 0x03, 1, 2, 3]);

        let medium = der::tlv(0x04, &vec![0u8; 200]);
        assert_eq!(&medium[..3], &[0x04, 0x81, 200]);

        let long = der::tlv(0x04, &vec![0u8; 70_000]);
        assert_eq!(&long[..4], &[0x04, 0x83, 0x01, 0x11]);
        assert_eq!(long[4], 0x70);
    }

    #[test]
    fn set_of_sorts_elements() {
        let set = der::set_of(vec![vec![0x30, 0x01, 0xFF], vec![0x30, 0x01, 0x00]]);
        assert_eq!(set, vec![0x31, 0x06, 0x30, 0x01, 0x00, 0x30, 0x01, 0xFF]);
    }

    #[test]
    fn digest_oid_round_trip() {
        for algorithm in [
            DigestAlgorithm::Sha256,
            DigestAlgorithm::Sha384,
            DigestAlgorithm::Sha512,
        ] {
            assert_eq!(digest_from_oid(&digest_oid(algorithm)), Some(algorithm));
        }
    }
}
