//! Dissection of a WIN_CERTIFICATE payload back into its CMS parts.

use cms::content_info::{CmsVersion, ContentInfo};
use cms::signed_data::{SignedData, SignerInfo};
use der::{Decode, SliceReader};
use x509_cert::Certificate;

use crate::error::{PesignError, Result};
use crate::pkcs7::oids;
use crate::pkcs7::spc::SpcIndirectDataContent;
use crate::DigestKind;

/// Parsed view of one embedded or detached Authenticode signature.
///
/// Parsing validates structure only; it does not verify the signature or
/// evaluate trust in the carried certificates.
#[derive(Debug)]
pub struct SignatureInfo {
    signed_data: SignedData,
    indirect_data: SpcIndirectDataContent,
}

impl SignatureInfo {
    /// Decode a DER ContentInfo. Trailing bytes (zero padding from the
    /// certificate table) are tolerated.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut reader = SliceReader::new(bytes)
            .map_err(|_| PesignError::MalformedCms("empty signature payload".into()))?;
        let content_info = ContentInfo::decode(&mut reader)
            .map_err(|e| PesignError::MalformedCms(format!("not a ContentInfo: {e}")))?;

        if content_info.content_type != const_oid::db::rfc6268::ID_SIGNED_DATA {
            return Err(PesignError::MalformedCms(format!(
                "outer content type {} is not signedData",
                content_info.content_type
            )));
        }
        let signed_data = content_info
            .content
            .decode_as::<SignedData>()
            .map_err(|e| PesignError::MalformedCms(format!("bad SignedData: {e}")))?;

        if signed_data.version != CmsVersion::V1 {
            return Err(PesignError::MalformedCms(format!(
                "SignedData version {:?} is not 1",
                signed_data.version
            )));
        }
        if signed_data.digest_algorithms.len() != 1 {
            return Err(PesignError::MalformedCms(format!(
                "{} digest algorithms present, expected 1",
                signed_data.digest_algorithms.len()
            )));
        }
        if signed_data.encap_content_info.econtent_type != oids::SPC_INDIRECT_DATA_OBJID {
            return Err(PesignError::UnsupportedContentType(
                signed_data.encap_content_info.econtent_type.to_string(),
            ));
        }

        let indirect_data = signed_data
            .encap_content_info
            .econtent
            .clone()
            .ok_or_else(|| PesignError::MalformedCms("encapsulated content is empty".into()))?
            .decode_as::<SpcIndirectDataContent>()
            .map_err(|e| PesignError::MalformedCms(format!("bad SpcIndirectDataContent: {e}")))?;

        if signed_data.signer_infos.0.len() != 1 {
            return Err(PesignError::MalformedCms(format!(
                "{} signer infos present, expected 1",
                signed_data.signer_infos.0.len()
            )));
        }
        let signer_info = &signed_data.signer_infos.0.as_slice()[0];
        if signer_info.version != CmsVersion::V1 {
            return Err(PesignError::MalformedCms(format!(
                "SignerInfo version {:?} is not 1",
                signer_info.version
            )));
        }
        if signer_info.digest_alg != signed_data.digest_algorithms.as_slice()[0] {
            return Err(PesignError::MalformedCms(
                "SignerInfo digest algorithm disagrees with SignedData".into(),
            ));
        }
        let signed_attrs = signer_info
            .signed_attrs
            .as_ref()
            .ok_or_else(|| PesignError::MalformedCms("no signed attributes".into()))?;
        for required in [
            const_oid::db::rfc6268::ID_CONTENT_TYPE,
            const_oid::db::rfc6268::ID_MESSAGE_DIGEST,
        ] {
            if !signed_attrs.iter().any(|a| a.oid == required) {
                return Err(PesignError::MalformedCms(format!(
                    "missing required signed attribute {required}"
                )));
            }
        }

        Ok(SignatureInfo {
            signed_data,
            indirect_data,
        })
    }

    /// The Authenticode PE digest embedded in the signature. Not verified
    /// against anything here.
    #[must_use]
    pub fn pe_digest(&self) -> &[u8] {
        self.indirect_data.message_digest.digest.as_bytes()
    }

    /// Digest algorithm named in the embedded DigestInfo.
    pub fn digest_kind(&self) -> Result<DigestKind> {
        let oid = &self.indirect_data.message_digest.digest_algorithm.oid;
        DigestKind::from_oid(oid)
            .ok_or_else(|| PesignError::UnsupportedAlgorithm(oid.to_string()))
    }

    #[must_use]
    pub fn signer_info(&self) -> &SignerInfo {
        // Exactly one signer info was enforced at parse time.
        &self.signed_data.signer_infos.0.as_slice()[0]
    }

    /// The raw signature value from the SignerInfo.
    #[must_use]
    pub fn signature(&self) -> &[u8] {
        self.signer_info().signature.as_bytes()
    }

    pub fn certificates(&self) -> impl Iterator<Item = &Certificate> {
        self.signed_data
            .certificates
            .iter()
            .flat_map(|set| set.0.iter())
            .filter_map(|choice| match choice {
                cms::cert::CertificateChoices::Certificate(cert) => Some(cert),
                _ => None,
            })
    }

    /// Signer identity as `(issuer, serial)` display strings.
    #[must_use]
    pub fn signer_id(&self) -> (String, String) {
        match &self.signer_info().sid {
            cms::signed_data::SignerIdentifier::IssuerAndSerialNumber(isn) => (
                isn.issuer.to_string(),
                hex::encode(isn.serial_number.as_bytes()),
            ),
            cms::signed_data::SignerIdentifier::SubjectKeyIdentifier(skid) => (
                "(subject key identifier)".to_string(),
                hex::encode(skid.0.as_bytes()),
            ),
        }
    }
}
