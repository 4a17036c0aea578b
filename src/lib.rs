//! pesign library
//!
//! Signs, inspects and edits Authenticode signatures attached to PE/COFF
//! binaries. The crate is split along the natural seams of the format: a
//! byte-accurate PE image model, the Authenticode digest engine, the
//! certificate-table editor, CMS SignedData construction and dissection, a
//! file-backed signing identity provider, and the operation dispatcher the
//! CLI drives.

pub mod dispatch;
pub mod error;
pub mod identity;
pub mod ops;
pub mod pe;
pub mod pkcs7;

use der::asn1::ObjectIdentifier;

pub use dispatch::Outcome;
pub use error::{PesignError, Result};
pub use identity::{CredentialStore, SigningIdentity};
pub use ops::OperationDescriptor;
pub use pe::{CertificateTable, PeDigester, PeImage};
pub use pkcs7::{CmsBuilder, SignatureInfo};

/// Digest algorithms accepted for the Authenticode PE hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestKind {
    Sha1,
    Sha224,
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl DigestKind {
    pub const ALL: [DigestKind; 5] = [
        DigestKind::Sha1,
        DigestKind::Sha224,
        DigestKind::Sha256,
        DigestKind::Sha384,
        DigestKind::Sha512,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sha1" => Some(DigestKind::Sha1),
            "sha224" => Some(DigestKind::Sha224),
            "sha256" => Some(DigestKind::Sha256),
            "sha384" => Some(DigestKind::Sha384),
            "sha512" => Some(DigestKind::Sha512),
            _ => None,
        }
    }

    pub fn from_oid(oid: &ObjectIdentifier) -> Option<Self> {
        DigestKind::ALL.iter().copied().find(|k| k.oid() == *oid)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestKind::Sha1 => "sha1",
            DigestKind::Sha224 => "sha224",
            DigestKind::Sha256 => "sha256",
            DigestKind::Sha384 => "sha384",
            DigestKind::Sha512 => "sha512",
        }
    }

    #[must_use]
    pub fn digest_len(&self) -> usize {
        match self {
            DigestKind::Sha1 => 20,
            DigestKind::Sha224 => 28,
            DigestKind::Sha256 => 32,
            DigestKind::Sha384 => 48,
            DigestKind::Sha512 => 64,
        }
    }

    #[must_use]
    pub fn oid(&self) -> ObjectIdentifier {
        match self {
            DigestKind::Sha1 => pkcs7::oids::SHA1,
            DigestKind::Sha224 => pkcs7::oids::SHA224,
            DigestKind::Sha256 => pkcs7::oids::SHA256,
            DigestKind::Sha384 => pkcs7::oids::SHA384,
            DigestKind::Sha512 => pkcs7::oids::SHA512,
        }
    }

    #[must_use]
    pub fn hasher(&self) -> Box<dyn digest::DynDigest> {
        match self {
            DigestKind::Sha1 => Box::new(sha1::Sha1::default()),
            DigestKind::Sha224 => Box::new(sha2::Sha224::default()),
            DigestKind::Sha256 => Box::new(sha2::Sha256::default()),
            DigestKind::Sha384 => Box::new(sha2::Sha384::default()),
            DigestKind::Sha512 => Box::new(sha2::Sha512::default()),
        }
    }

    /// One-shot digest of `data` with this algorithm.
    #[must_use]
    pub fn digest_bytes(&self, data: &[u8]) -> Vec<u8> {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_kind_names_round_trip() {
        for kind in DigestKind::ALL {
            assert_eq!(DigestKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(DigestKind::from_name("md5"), None);
    }

    #[test]
    fn digest_kind_lengths() {
        assert_eq!(DigestKind::Sha1.digest_len(), 20);
        assert_eq!(DigestKind::Sha224.digest_len(), 28);
        assert_eq!(DigestKind::Sha256.digest_len(), 32);
        assert_eq!(DigestKind::Sha384.digest_len(), 48);
        assert_eq!(DigestKind::Sha512.digest_len(), 64);
    }

    #[test]
    fn digest_bytes_matches_len() {
        for kind in DigestKind::ALL {
            assert_eq!(kind.digest_bytes(b"abc").len(), kind.digest_len());
        }
    }

    #[test]
    fn oid_round_trip() {
        for kind in DigestKind::ALL {
            assert_eq!(DigestKind::from_oid(&kind.oid()), Some(kind));
        }
    }
}
