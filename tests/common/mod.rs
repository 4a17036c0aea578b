//! Shared fixtures: synthetic PE images and a generated signing identity.
#![allow(dead_code)]

use std::sync::OnceLock;
use std::time::Duration;

use der::Decode;
use pkcs8::EncodePublicKey;
use rsa::RsaPrivateKey;
use spki::SubjectPublicKeyInfoOwned;
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::der::Encode;
use x509_cert::serial_number::SerialNumber;
use x509_cert::time::Validity;

use pesign::SigningIdentity;

pub const FILE_ALIGNMENT: usize = 0x200;
const PE_OFFSET: usize = 0x80;
const SIZE_OF_HEADERS: usize = 0x200;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Pe32,
    Pe32Plus,
}

pub struct PeFixtureBuilder {
    flavor: Flavor,
    sections: Vec<(&'static str, Vec<u8>)>,
    trailing: Vec<u8>,
}

pub fn pe32() -> PeFixtureBuilder {
    PeFixtureBuilder {
        flavor: Flavor::Pe32,
        sections: Vec::new(),
        trailing: Vec::new(),
    }
}

pub fn pe32plus() -> PeFixtureBuilder {
    PeFixtureBuilder {
        flavor: Flavor::Pe32Plus,
        sections: Vec::new(),
        trailing: Vec::new(),
    }
}

impl PeFixtureBuilder {
    pub fn section(mut self, name: &'static str, data: &[u8]) -> Self {
        assert!(self.sections.len() < 3, "fixture headers fit three sections");
        self.sections.push((name, data.to_vec()));
        self
    }

    pub fn trailing(mut self, data: &[u8]) -> Self {
        self.trailing = data.to_vec();
        self
    }

    pub fn build(self) -> Vec<u8> {
        let (magic, opt_size, num_dirs_off) = match self.flavor {
            Flavor::Pe32 => (0x010Bu16, 0xE0usize, 92usize),
            Flavor::Pe32Plus => (0x020Bu16, 0xF0usize, 108usize),
        };
        let opt = PE_OFFSET + 24;
        let section_table = opt + opt_size;
        assert!(section_table + self.sections.len() * 40 <= SIZE_OF_HEADERS);

        // Lay out raw section data at FILE_ALIGNMENT granularity.
        let mut rows = Vec::new();
        let mut ptr = SIZE_OF_HEADERS;
        let mut body = Vec::new();
        for (name, data) in &self.sections {
            let mut raw = data.clone();
            let size = raw.len().div_ceil(FILE_ALIGNMENT).max(1) * FILE_ALIGNMENT;
            raw.resize(size, 0);
            rows.push((*name, data.len() as u32, ptr as u32, size as u32));
            body.extend_from_slice(&raw);
            ptr += size;
        }

        let mut image = vec![0u8; SIZE_OF_HEADERS];
        image[0] = b'M';
        image[1] = b'Z';
        image[0x3C..0x40].copy_from_slice(&(PE_OFFSET as u32).to_le_bytes());
        image[PE_OFFSET..PE_OFFSET + 4].copy_from_slice(b"PE\0\0");

        let coff = PE_OFFSET + 4;
        let machine: u16 = match self.flavor {
            Flavor::Pe32 => 0x014C,
            Flavor::Pe32Plus => 0x8664,
        };
        image[coff..coff + 2].copy_from_slice(&machine.to_le_bytes());
        image[coff + 2..coff + 4].copy_from_slice(&(self.sections.len() as u16).to_le_bytes());
        image[coff + 16..coff + 18].copy_from_slice(&(opt_size as u16).to_le_bytes());
        image[coff + 18..coff + 20].copy_from_slice(&0x010Fu16.to_le_bytes());

        image[opt..opt + 2].copy_from_slice(&magic.to_le_bytes());
        image[opt + 32..opt + 36].copy_from_slice(&0x1000u32.to_le_bytes());
        image[opt + 36..opt + 40].copy_from_slice(&(FILE_ALIGNMENT as u32).to_le_bytes());
        image[opt + 60..opt + 64].copy_from_slice(&(SIZE_OF_HEADERS as u32).to_le_bytes());
        image[opt + num_dirs_off..opt + num_dirs_off + 4].copy_from_slice(&16u32.to_le_bytes());

        let mut virtual_address = 0x1000u32;
        for (i, (name, virtual_size, raw_ptr, raw_size)) in rows.iter().enumerate() {
            let row = section_table + i * 40;
            let mut name_bytes = [0u8; 8];
            name_bytes[..name.len().min(8)].copy_from_slice(&name.as_bytes()[..name.len().min(8)]);
            image[row..row + 8].copy_from_slice(&name_bytes);
            image[row + 8..row + 12].copy_from_slice(&virtual_size.to_le_bytes());
            image[row + 12..row + 16].copy_from_slice(&virtual_address.to_le_bytes());
            image[row + 16..row + 20].copy_from_slice(&raw_size.to_le_bytes());
            image[row + 20..row + 24].copy_from_slice(&raw_ptr.to_le_bytes());
            virtual_address += 0x1000;
        }

        image.extend_from_slice(&body);
        image.extend_from_slice(&self.trailing);
        image
    }
}

/// One-section PE32 with recognizable content.
pub fn sample_pe32() -> Vec<u8> {
    let text: Vec<u8> = (0u32..0x180).map(|i| (i % 251) as u8).collect();
    pe32().section(".text", &text).build()
}

/// Two-section PE32+ image.
pub fn sample_pe32plus() -> Vec<u8> {
    let text: Vec<u8> = (0u32..0x250).map(|i| (i % 13) as u8).collect();
    let data: Vec<u8> = vec![0x5A; 0x40];
    pe32plus().section(".text", &text).section(".data", &data).build()
}

static TEST_KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
static TEST_CERT: OnceLock<Vec<u8>> = OnceLock::new();

/// Process-wide 2048-bit RSA test key; generation is slow enough to share.
pub fn test_key() -> RsaPrivateKey {
    TEST_KEY
        .get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("generate key"))
        .clone()
}

/// Self-signed certificate over the shared test key. Cached because the
/// validity window is stamped at build time.
pub fn test_cert_der() -> Vec<u8> {
    TEST_CERT
        .get_or_init(|| {
            let key = test_key();
            let public_key_der = key.to_public_key().to_public_key_der().expect("spki");
            let spki =
                SubjectPublicKeyInfoOwned::from_der(public_key_der.as_bytes()).expect("spki der");
            let signing_key = rsa::pkcs1v15::SigningKey::<sha2::Sha256>::new(key.clone());
            let builder = CertificateBuilder::new(
                Profile::Root,
                SerialNumber::from(0x77u64),
                Validity::from_now(Duration::from_secs(3600 * 24 * 365)).expect("validity"),
                "CN=pesign test signer".parse().expect("name"),
                spki,
                &signing_key,
            )
            .expect("builder");
            let cert = builder
                .build_with_rng(&mut rand::thread_rng())
                .expect("build cert");
            cert.to_der().expect("cert der")
        })
        .clone()
}

pub fn test_identity() -> SigningIdentity {
    SigningIdentity::from_parts("Test CA", &test_cert_der(), test_key()).expect("identity")
}
