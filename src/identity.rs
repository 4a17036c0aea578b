//! Signing identity provider.
//!
//! A credential store is a directory holding PEM or DER credentials
//! addressed by nickname: `<nickname>.crt` (or `.pem`/`.cer`/`.der`) for
//! the certificate, `<nickname>.key` for the RSA private key, and an
//! optional `<nickname>.chain.pem` with intermediates to embed alongside
//! the signer certificate. Keys never leave the provider; callers hand it
//! bytes and get back a PKCS#1 v1.5 signature.

use std::fs;
use std::path::{Path, PathBuf};

use der::{Decode, DecodePem, Encode};
use log::{debug, info};
use pkcs1::DecodeRsaPrivateKey;
use pkcs8::{DecodePrivateKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use x509_cert::Certificate;

use crate::error::{PesignError, Result};
use crate::DigestKind;

const CERT_EXTENSIONS: [&str; 4] = ["crt", "pem", "cer", "der"];

/// Directory-backed credential store.
pub struct CredentialStore {
    dir: PathBuf,
}

impl CredentialStore {
    /// Open a store rooted at `dir`. The directory must exist; its
    /// contents are only touched when a nickname is resolved.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(PesignError::IoFailure(format!(
                "certificate directory \"{}\" does not exist",
                dir.display()
            )));
        }
        debug!("opened credential store at {}", dir.display());
        Ok(CredentialStore {
            dir: dir.to_path_buf(),
        })
    }

    /// Resolve `nickname` to a signing identity.
    ///
    /// With `need_key` set the private key must load too; otherwise the
    /// certificate alone satisfies the lookup and signing attempts fail
    /// later with `PrivateKeyUnavailable`.
    pub fn find(&self, nickname: &str, need_key: bool) -> Result<SigningIdentity> {
        let cert_path = self.locate_certificate(nickname)?;
        let cert_bytes = fs::read(&cert_path)
            .map_err(|e| PesignError::IoFailure(format!("{}: {e}", cert_path.display())))?;
        let certificate = decode_certificate(&cert_bytes)
            .map_err(|e| PesignError::CertificateNotFound(format!("{nickname}: {e}")))?;
        info!("using certificate {}", cert_path.display());

        let key = match self.load_key(nickname) {
            Ok(key) => Some(key),
            Err(e) if need_key => return Err(e),
            Err(e) => {
                debug!("no usable private key for {nickname}: {e}");
                None
            }
        };

        let chain = self.load_chain(nickname)?;

        Ok(SigningIdentity {
            nickname: nickname.to_string(),
            certificate,
            chain,
            key,
        })
    }

    fn locate_certificate(&self, nickname: &str) -> Result<PathBuf> {
        for ext in CERT_EXTENSIONS {
            let candidate = self.dir.join(format!("{nickname}.{ext}"));
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        // Fall back to probing for generically named certificate files,
        // the way the certificate database layout used to be discovered.
        let mut probed = Vec::new();
        if let Ok(entries) = fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy().into_owned();
                if name.starts_with("cert") && entry.path().is_file() {
                    probed.push(name);
                }
            }
        }
        if !probed.is_empty() {
            probed.sort();
            debug!("store probe found candidate files: {}", probed.join(", "));
        }
        Err(PesignError::CertificateNotFound(nickname.to_string()))
    }

    fn load_key(&self, nickname: &str) -> Result<RsaPrivateKey> {
        let path = self.dir.join(format!("{nickname}.key"));
        let bytes = fs::read(&path).map_err(|e| {
            PesignError::PrivateKeyUnavailable(format!("{nickname} ({}: {e})", path.display()))
        })?;
        decode_private_key(&bytes)
            .map_err(|e| PesignError::PrivateKeyUnavailable(format!("{nickname}: {e}")))
    }

    fn load_chain(&self, nickname: &str) -> Result<Vec<Certificate>> {
        let path = self.dir.join(format!("{nickname}.chain.pem"));
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let bytes = fs::read(&path)
            .map_err(|e| PesignError::IoFailure(format!("{}: {e}", path.display())))?;
        let blocks = pem::parse_many(&bytes).map_err(|e| {
            PesignError::CertificateNotFound(format!("{nickname} chain: {e}"))
        })?;
        let mut chain = Vec::with_capacity(blocks.len());
        for block in blocks {
            let cert = Certificate::from_der(block.contents()).map_err(|e| {
                PesignError::CertificateNotFound(format!("{nickname} chain: {e}"))
            })?;
            chain.push(cert);
        }
        debug!("loaded {} chain certificate(s) for {nickname}", chain.len());
        Ok(chain)
    }
}

fn decode_certificate(bytes: &[u8]) -> std::result::Result<Certificate, der::Error> {
    if bytes.starts_with(b"-----BEGIN") {
        Certificate::from_pem(bytes)
    } else {
        Certificate::from_der(bytes)
    }
}

fn decode_private_key(bytes: &[u8]) -> std::result::Result<RsaPrivateKey, String> {
    if bytes.starts_with(b"-----BEGIN") {
        let text = std::str::from_utf8(bytes).map_err(|e| e.to_string())?;
        RsaPrivateKey::from_pkcs8_pem(text)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(text))
            .map_err(|e| e.to_string())
    } else {
        RsaPrivateKey::from_pkcs8_der(bytes)
            .or_else(|_| RsaPrivateKey::from_pkcs1_der(bytes))
            .map_err(|e| e.to_string())
    }
}

/// A signing certificate, its optional chain, and (when loaded) the
/// private key that matches it.
#[derive(Debug)]
pub struct SigningIdentity {
    nickname: String,
    certificate: Certificate,
    chain: Vec<Certificate>,
    key: Option<RsaPrivateKey>,
}

impl SigningIdentity {
    /// Build an identity from an in-memory certificate and key, bypassing
    /// the store. Used by embedders and tests.
    pub fn from_parts(
        nickname: impl Into<String>,
        cert_der: &[u8],
        key: RsaPrivateKey,
    ) -> Result<Self> {
        let certificate = Certificate::from_der(cert_der)
            .map_err(|e| PesignError::CertificateNotFound(e.to_string()))?;
        Ok(SigningIdentity {
            nickname: nickname.into(),
            certificate,
            chain: Vec::new(),
            key: Some(key),
        })
    }

    #[must_use]
    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    #[must_use]
    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn certificate_der(&self) -> Result<Vec<u8>> {
        Ok(self.certificate.to_der()?)
    }

    #[must_use]
    pub fn chain(&self) -> &[Certificate] {
        &self.chain
    }

    /// DER SubjectPublicKeyInfo of the signing key.
    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        match &self.key {
            Some(key) => {
                let doc = key
                    .to_public_key()
                    .to_public_key_der()
                    .map_err(|e| PesignError::SigningFailed(e.to_string()))?;
                Ok(doc.as_bytes().to_vec())
            }
            None => Ok(self
                .certificate
                .tbs_certificate
                .subject_public_key_info
                .to_der()?),
        }
    }

    /// RSA modulus size in bytes; also the length of every signature this
    /// identity produces.
    #[must_use]
    pub fn modulus_len(&self) -> usize {
        self.key.as_ref().map_or(0, PublicKeyParts::size)
    }

    /// PKCS#1 v1.5 signature over `message`, digesting with `kind`.
    pub fn sign(&self, message: &[u8], kind: DigestKind) -> Result<Vec<u8>> {
        let key = self.key.as_ref().ok_or_else(|| {
            PesignError::PrivateKeyUnavailable(self.nickname.clone())
        })?;
        let scheme = match kind {
            DigestKind::Sha1 => Pkcs1v15Sign::new::<sha1::Sha1>(),
            DigestKind::Sha224 => Pkcs1v15Sign::new::<sha2::Sha224>(),
            DigestKind::Sha256 => Pkcs1v15Sign::new::<sha2::Sha256>(),
            DigestKind::Sha384 => Pkcs1v15Sign::new::<sha2::Sha384>(),
            DigestKind::Sha512 => Pkcs1v15Sign::new::<sha2::Sha512>(),
        };
        let digest = kind.digest_bytes(message);
        key.sign(scheme, &digest)
            .map_err(|e| PesignError::SigningFailed(e.to_string()))
    }
}
