// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! RFC 3161 Time-Stamp Protocol structures.

use asn1::ObjectIdentifier;
use chrono::{DateTime, TimeZone, Utc};

use crate::pkcs7::der::{self, TAG_OCTET_STRING, TAG_SEQUENCE};
use crate::pkcs7::{
    AlgorithmIdentifier, ContentInfo, OID_CT_TSTINFO, OID_SIGNED_DATA, SignedData, digest_from_oid,
    digest_oid,
};
use crate::protocol::DigestAlgorithm;

/// `PKIStatus granted`.
pub const PKI_STATUS_GRANTED: u8 = 0;
/// `PKIStatus grantedWithMods`.
pub const PKI_STATUS_GRANTED_WITH_MODS: u8 = 1;

#[derive(asn1::Asn1Read, asn1::Asn1Write)]
pub struct MessageImprint<'a> {
    pub hash_algorithm: AlgorithmIdentifier<'a>,
    pub hashed_message: &'a [u8],
}

#[derive(asn1::Asn1Read)]
pub struct PkiStatusInfo<'a> {
    pub status: u8,
    pub status_string: Option<asn1::SequenceOf<'a, asn1::Utf8String<'a>>>,
    pub fail_info: Option<asn1::BitString<'a>>,
}

#[derive(asn1::Asn1Read)]
pub struct TimeStampResp<'a> {
    pub status: PkiStatusInfo<'a>,
    pub time_stamp_token: Option<asn1::Tlv<'a>>,
}

#[derive(asn1::Asn1Read)]
pub struct Accuracy {
    pub seconds: Option<i64>,
    #[implicit(0)]
    pub millis: Option<i64>,
    #[implicit(1)]
    pub micros: Option<i64>,
}

#[derive(asn1::Asn1Read)]
pub struct TstInfo<'a> {
    pub version: u8,
    pub policy: ObjectIdentifier,
    pub message_imprint: MessageImprint<'a>,
    pub serial_number: asn1::BigInt<'a>,
    /// GeneralizedTime; kept raw because timestamp authorities emit
    /// fractional seconds X.509 profiles forbid.
    pub gen_time: asn1::Tlv<'a>,
    pub accuracy: Option<Accuracy>,
    #[default(false)]
    pub ordering: bool,
    pub nonce: Option<asn1::BigInt<'a>>,
    #[explicit(0)]
    pub tsa: Option<asn1::Tlv<'a>>,
    #[implicit(1)]
    pub extensions: Option<asn1::SequenceOf<'a, asn1::Tlv<'a>>>,
}

/// Build a deterministic `TimeStampReq` for the given imprint.
///
/// No nonce is included: the request bytes double as the memoization key,
/// and a nonce would make every request unique.
pub fn build_query(algorithm: DigestAlgorithm, imprint: &[u8]) -> Vec<u8> {
    let mut imprint_seq = der::algorithm_null_params(&digest_oid(algorithm));
    imprint_seq.extend_from_slice(&der::tlv(TAG_OCTET_STRING, imprint));

    let mut req = vec![0x02, 0x01, 0x01]; // version 1
    req.extend_from_slice(&der::tlv(TAG_SEQUENCE, &imprint_seq));
    req.extend_from_slice(&[0x01, 0x01, 0xFF]); // certReq TRUE
    der::tlv(TAG_SEQUENCE, &req)
}

/// What the timestamper needs to know about a parsed token.
#[derive(Debug, Clone)]
pub struct TokenSummary {
    pub imprint_algorithm: DigestAlgorithm,
    pub imprint: Vec<u8>,
    pub gen_time: DateTime<Utc>,
    pub serial_hex: String,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TspError {
    /// The authority answered with a well-formed TSP error status. This is
    /// final; trying another URL will not change the answer.
    #[error("timestamp request rejected with PKIStatus {status}: {detail}")]
    Rejected { status: u8, detail: String },

    #[error("malformed timestamp response: {0}")]
    Malformed(String),
}

/// Parse a `TimeStampResp`, returning the token DER when granted.
pub fn parse_response(der: &[u8]) -> Result<Vec<u8>, TspError> {
    let response = asn1::parse_single::<TimeStampResp<'_>>(der)
        .map_err(|error| TspError::Malformed(format!("{error:?}")))?;
    let status = response.status.status;
    if status != PKI_STATUS_GRANTED && status != PKI_STATUS_GRANTED_WITH_MODS {
        let detail = response
            .status
            .status_string
            .map(|strings| {
                strings
                    .map(|s| s.as_str().to_string())
                    .collect::<Vec<_>>()
                    .join("; ")
            })
            .unwrap_or_default();
        return Err(TspError::Rejected { status, detail });
    }
    let token = response
        .time_stamp_token
        .ok_or_else(|| TspError::Malformed("granted response carries no token".to_string()))?;
    Ok(token.full_data().to_vec())
}

/// Dig the `TSTInfo` out of a timestamp token and summarize it.
pub fn parse_token(token_der: &[u8]) -> anyhow::Result<TokenSummary> {
    let content_info = asn1::parse_single::<ContentInfo<'_>>(token_der)
        .map_err(|error| anyhow::anyhow!("token is not a ContentInfo: {error:?}"))?;
    if content_info.content_type != OID_SIGNED_DATA {
        anyhow::bail!("token is not a SignedData");
    }
    let signed_data = content_info
        .content
        .ok_or_else(|| anyhow::anyhow!("token SignedData is empty"))?
        .parse::<SignedData<'_>>()
        .map_err(|error| anyhow::anyhow!("token SignedData is malformed: {error:?}"))?;
    if signed_data.content_info.content_type != OID_CT_TSTINFO {
        anyhow::bail!("token does not contain a TSTInfo");
    }
    let tst_der = signed_data
        .content_info
        .content
        .ok_or_else(|| anyhow::anyhow!("token TSTInfo is absent"))?
        .parse::<&[u8]>()
        .map_err(|error| anyhow::anyhow!("token eContent is not an octet string: {error:?}"))?;
    summarize_tst_info(tst_der)
}

pub fn summarize_tst_info(tst_der: &[u8]) -> anyhow::Result<TokenSummary> {
    let tst = asn1::parse_single::<TstInfo<'_>>(tst_der)
        .map_err(|error| anyhow::anyhow!("TSTInfo is malformed: {error:?}"))?;
    let imprint_algorithm = digest_from_oid(&tst.message_imprint.hash_algorithm.algorithm)
        .ok_or_else(|| anyhow::anyhow!("TSTInfo uses an unsupported imprint digest"))?;
    Ok(TokenSummary {
        imprint_algorithm,
        imprint: tst.message_imprint.hashed_message.to_vec(),
        gen_time: parse_generalized_time(tst.gen_time.data())?,
        serial_hex: hex::encode(tst.serial_number.as_bytes()),
    })
}

/// Parse a GeneralizedTime body, tolerating fractional seconds.
fn parse_generalized_time(data: &[u8]) -> anyhow::Result<DateTime<Utc>> {
    let text = std::str::from_utf8(data)
        .map_err(|_| anyhow::anyhow!("GeneralizedTime is not ASCII"))?;
    let text = text
        .strip_suffix('Z')
        .ok_or_else(|| anyhow::anyhow!("GeneralizedTime must be UTC"))?;
    let whole = match text.split_once('.') {
        Some((whole, _fraction)) => whole,
        None => text,
    };
    if whole.len() != 14 {
        anyhow::bail!("GeneralizedTime '{whole}' is not YYYYMMDDHHMMSS");
    }
    let field = |range: std::ops::Range<usize>| -> anyhow::Result<u32> {
        whole[range.clone()]
            .parse()
            .map_err(|_| anyhow::anyhow!("GeneralizedTime field {range:?} is not numeric"))
    };
    let year = field(0..4)? as i32;
    let (month, day) = (field(4..6)?, field(6..8)?);
    let (hour, minute, second) = (field(8..10)?, field(10..12)?, field(12..14)?);
    Utc.with_ymd_and_hms(year, month, day, hour, minute, second)
        .single()
        .ok_or_else(|| anyhow::anyhow!("GeneralizedTime is out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_structure() {
        let imprint = vec![0xAB; 32];
        let query = build_query(DigestAlgorithm::Sha256, &imprint);
        assert_eq!(query[0], TAG_SEQUENCE);
        // version INTEGER 1 right after the header
        assert_eq!(&query[2..5], &[0x02, 0x01, 0x01]);
        // certReq TRUE at the tail
        assert_eq!(&query[query.len() - 3..], &[0x01, 0x01, 0xFF]);
        // Deterministic: same inputs produce identical bytes (memo key).
        assert_eq!(query, build_query(DigestAlgorithm::Sha256, &imprint));
    }

    #[test]
    fn rejected_response_is_final() {
        // TimeStampResp { status: PKIStatusInfo { status: 2 } }
        let der = [0x30, 0x05, 0x30, 0x03, 0x02, 0x01, 0x02];
        let error = parse_response(&der).unwrap_err();
        assert!(matches!(error, TspError::Rejected { status: 2, .. }));
    }

    #[test]
    fn granted_without_token_is_malformed() {
        let der = [0x30, 0x05, 0x30, 0x03, 0x02, 0x01, 0x00];
        let error = parse_response(&der).unwrap_err();
        assert!(matches!(error, TspError::Malformed(_)));
    }

    #[test]
    fn generalized_time_with_fraction() {
        let time = parse_generalized_time(b"20260102030405.123Z").unwrap();
        assert_eq!(time, Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap());
        assert!(parse_generalized_time(b"20260102030405").is_err());
    }
}
