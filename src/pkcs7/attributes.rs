//! Signed-attribute construction and canonicalization.
//!
//! Authenticode's SignerInfo carries exactly three signed attributes:
//! contentType, messageDigest and an empty SpcSpOpusInfo. For signing they
//! are DER-encoded as a SET OF, which sorts the attributes by their
//! encodings; the same set is re-tagged `[0] IMPLICIT` inside the
//! SignerInfo. The blob exported by `--export-signed-attributes` and
//! consumed by `--import-signed-attributes` is that SET OF encoding.

use cms::signed_data::SignedAttributes;
use der::asn1::{OctetString, SetOfVec};
use der::{Any, Decode, Encode};
use x509_cert::attr::Attribute;

use crate::error::Result;
use crate::pkcs7::oids;
use crate::pkcs7::spc::der_content_octets;
use crate::DigestKind;

/// Build the canonical signed-attribute set over an encoded
/// SpcIndirectDataContent.
pub fn build_signed_attributes(kind: DigestKind, spc_der: &[u8]) -> Result<SignedAttributes> {
    let message_digest = kind.digest_bytes(der_content_octets(spc_der)?);

    let content_type = Attribute {
        oid: const_oid::db::rfc6268::ID_CONTENT_TYPE,
        values: SetOfVec::try_from(vec![Any::encode_from(&oids::SPC_INDIRECT_DATA_OBJID)?])?,
    };
    let message_digest = Attribute {
        oid: const_oid::db::rfc6268::ID_MESSAGE_DIGEST,
        values: SetOfVec::try_from(vec![Any::encode_from(&OctetString::new(message_digest)?)?])?,
    };
    let opus_info = Attribute {
        oid: oids::SPC_SP_OPUS_INFO_OBJID,
        values: SetOfVec::try_from(vec![Any::from_der(&oids::SPC_SP_OPUS_INFO_EMPTY)?])?,
    };

    Ok(SignedAttributes::try_from(vec![
        content_type,
        message_digest,
        opus_info,
    ])?)
}

/// The byte string the signer actually signs: the attributes as an
/// explicit DER SET OF.
pub fn signing_input(attrs: &SignedAttributes) -> Result<Vec<u8>> {
    Ok(attrs.to_der()?)
}

/// Decode an exported signed-attribute blob.
pub fn decode_signed_attributes(blob: &[u8]) -> Result<SignedAttributes> {
    Ok(SignedAttributes::from_der(blob)?)
}
