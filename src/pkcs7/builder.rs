//! Assembly of the Authenticode SignedData container.
//!
//! The SignerInfo is put together from parts rather than driven through a
//! one-shot signing helper because the disaggregated flows need to inject
//! attributes and signatures produced elsewhere: `--export-signed-attributes`
//! hands the to-be-signed set to another host and
//! `--import-raw-signature` brings the resulting raw RSA signature back.

use cms::cert::{CertificateChoices, IssuerAndSerialNumber};
use cms::content_info::{CmsVersion, ContentInfo};
use cms::signed_data::{
    CertificateSet, DigestAlgorithmIdentifiers, EncapsulatedContentInfo, SignatureValue,
    SignedAttributes, SignedData, SignerIdentifier, SignerInfo, SignerInfos,
};
use der::{Any, Decode, Encode};
use log::debug;
use spki::AlgorithmIdentifierOwned;

use crate::error::Result;
use crate::identity::SigningIdentity;
use crate::pkcs7::attributes::{build_signed_attributes, signing_input};
use crate::pkcs7::oids;
use crate::pkcs7::spc::{null_params, spc_indirect_data};
use crate::DigestKind;

/// Builds the DER ContentInfo that becomes a WIN_CERTIFICATE payload.
pub struct CmsBuilder<'a> {
    identity: &'a SigningIdentity,
    kind: DigestKind,
}

impl<'a> CmsBuilder<'a> {
    #[must_use]
    pub fn new(identity: &'a SigningIdentity, kind: DigestKind) -> Self {
        CmsBuilder { identity, kind }
    }

    /// Sign `pe_digest` with the identity's private key and return the
    /// serialized ContentInfo.
    pub fn build_signed(&self, pe_digest: &[u8]) -> Result<Vec<u8>> {
        let spc_der = spc_indirect_data(self.kind, pe_digest)?.to_der()?;
        let attrs = build_signed_attributes(self.kind, &spc_der)?;
        let signature = self.identity.sign(&signing_input(&attrs)?, self.kind)?;
        self.assemble(&spc_der, attrs, signature)
    }

    /// Assemble a ContentInfo around externally produced signed attributes
    /// and a raw signature over their SET OF encoding.
    pub fn build_with_raw_signature(
        &self,
        pe_digest: &[u8],
        attrs: SignedAttributes,
        raw_signature: &[u8],
    ) -> Result<Vec<u8>> {
        let spc_der = spc_indirect_data(self.kind, pe_digest)?.to_der()?;
        self.assemble(&spc_der, attrs, raw_signature.to_vec())
    }

    /// Serialized size of the SignedData this builder would produce.
    ///
    /// A PKCS#1 v1.5 signature always spans the key modulus, and every
    /// digest has a fixed width, so substituting zeros yields the exact
    /// final length. Used to size the certificate table before signing so
    /// the image grows exactly once.
    pub fn estimate_len(&self) -> Result<usize> {
        let digest = vec![0u8; self.kind.digest_len()];
        let spc_der = spc_indirect_data(self.kind, &digest)?.to_der()?;
        let attrs = build_signed_attributes(self.kind, &spc_der)?;
        let signature = vec![0u8; self.identity.modulus_len()];
        Ok(self.assemble(&spc_der, attrs, signature)?.len())
    }

    fn assemble(
        &self,
        spc_der: &[u8],
        attrs: SignedAttributes,
        signature: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let digest_algorithm = AlgorithmIdentifierOwned {
            oid: self.kind.oid(),
            parameters: Some(null_params()?),
        };

        let cert = self.identity.certificate();
        let mut choices = vec![CertificateChoices::Certificate(cert.clone())];
        for chained in self.identity.chain() {
            choices.push(CertificateChoices::Certificate(chained.clone()));
        }

        let signer_info = SignerInfo {
            version: CmsVersion::V1,
            sid: SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
                issuer: cert.tbs_certificate.issuer.clone(),
                serial_number: cert.tbs_certificate.serial_number.clone(),
            }),
            digest_alg: digest_algorithm.clone(),
            signed_attrs: Some(attrs),
            signature_algorithm: AlgorithmIdentifierOwned {
                oid: oids::RSA_ENCRYPTION,
                parameters: Some(null_params()?),
            },
            signature: SignatureValue::new(signature)?,
            unsigned_attrs: None,
        };

        let signed_data = SignedData {
            version: CmsVersion::V1,
            digest_algorithms: DigestAlgorithmIdentifiers::try_from(vec![digest_algorithm])?,
            encap_content_info: EncapsulatedContentInfo {
                econtent_type: oids::SPC_INDIRECT_DATA_OBJID,
                econtent: Some(Any::from_der(spc_der)?),
            },
            certificates: Some(CertificateSet::from(der::asn1::SetOfVec::try_from(choices)?)),
            crls: None,
            signer_infos: SignerInfos::from(der::asn1::SetOfVec::try_from(vec![signer_info])?),
        };

        let content_info = ContentInfo {
            content_type: const_oid::db::rfc6268::ID_SIGNED_DATA,
            content: Any::encode_from(&signed_data)?,
        };
        let der = content_info.to_der()?;
        debug!("assembled SignedData: {} bytes", der.len());
        Ok(der)
    }
}
