//! SpcIndirectDataContent and friends.

use der::asn1::OctetString;
use der::{Any, Decode, Sequence};
use spki::AlgorithmIdentifierOwned;

use crate::error::{PesignError, Result};
use crate::pkcs7::oids;
use crate::DigestKind;

/// Authenticode's encapsulated content: what was hashed, and the hash.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct SpcIndirectDataContent {
    pub data: SpcAttributeTypeAndOptionalValue,
    pub message_digest: DigestInfo,
}

/// `(type, value)` pair naming the hashed object; for PE images the value
/// is an SpcPeImageData structure.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct SpcAttributeTypeAndOptionalValue {
    pub value_type: der::asn1::ObjectIdentifier,
    pub value: Any,
}

/// Digest algorithm plus the Authenticode PE digest itself.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct DigestInfo {
    pub digest_algorithm: AlgorithmIdentifierOwned,
    pub digest: OctetString,
}

/// NULL algorithm parameters, spelled out for interop with verifiers that
/// insist on their presence.
pub(crate) fn null_params() -> Result<Any> {
    Ok(Any::from_der(&[0x05, 0x00])?)
}

/// Build the SpcIndirectDataContent for a PE digest.
pub fn spc_indirect_data(kind: DigestKind, pe_digest: &[u8]) -> Result<SpcIndirectDataContent> {
    Ok(SpcIndirectDataContent {
        data: SpcAttributeTypeAndOptionalValue {
            value_type: oids::SPC_PE_IMAGE_DATA_OBJID,
            value: Any::from_der(&oids::SPC_PE_IMAGE_DATA_CONTENT)?,
        },
        message_digest: DigestInfo {
            digest_algorithm: AlgorithmIdentifierOwned {
                oid: kind.oid(),
                parameters: Some(null_params()?),
            },
            digest: OctetString::new(pe_digest.to_vec())?,
        },
    })
}

/// Content octets of a DER value, outer tag and length stripped.
///
/// The messageDigest attribute covers the SpcIndirectDataContent without
/// its outermost SEQUENCE header; Windows and every extant verifier hash
/// that way.
pub fn der_content_octets(der: &[u8]) -> Result<&[u8]> {
    if der.len() < 2 {
        return Err(PesignError::MalformedCms(
            "DER value shorter than a header".into(),
        ));
    }
    let first_len_octet = der[1];
    let header_len = if first_len_octet < 0x80 {
        2
    } else {
        2 + (first_len_octet & 0x7f) as usize
    };
    der.get(header_len..).ok_or_else(|| {
        PesignError::MalformedCms("DER length octets run past the value".into())
    })
}
