//! End-to-end operation flows driven through the dispatcher, over real
//! files and a generated credential store.

mod common;

use std::fs;
use std::path::{Path, PathBuf};

use der::Decode;
use pkcs8::{EncodePrivateKey, LineEnding};
use tempfile::TempDir;

use pesign::pe::CertificateTable;
use pesign::{
    dispatch, CredentialStore, DigestKind, OperationDescriptor, Outcome, PeDigester, PeImage,
    PesignError, SignatureInfo,
};

const NICKNAME: &str = "Test CA";

/// Materialize the generated identity as store files under `dir`.
fn write_store(dir: &Path) {
    let key = common::test_key();
    fs::write(dir.join(format!("{NICKNAME}.crt")), common::test_cert_der()).unwrap();
    let key_pem = key.to_pkcs8_pem(LineEnding::LF).unwrap();
    fs::write(dir.join(format!("{NICKNAME}.key")), key_pem.as_bytes()).unwrap();
}

struct Env {
    _tmp: TempDir,
    dir: PathBuf,
    input: PathBuf,
}

fn setup() -> Env {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().to_path_buf();
    write_store(&dir);
    let input = dir.join("unsigned.efi");
    fs::write(&input, common::sample_pe32()).unwrap();
    Env {
        _tmp: tmp,
        dir,
        input,
    }
}

fn base_descriptor(env: &Env) -> OperationDescriptor {
    OperationDescriptor {
        in_path: Some(env.input.clone()),
        cert_dir: env.dir.clone(),
        ..Default::default()
    }
}

fn sign_to(env: &Env, out: &Path) {
    let desc = OperationDescriptor {
        out_path: Some(out.to_path_buf()),
        cert_nickname: Some(NICKNAME.into()),
        sign: true,
        ..base_descriptor(env)
    };
    assert_eq!(dispatch::run(&desc).unwrap(), Outcome::Done);
}

#[test]
fn sign_embeds_one_valid_signature() {
    let env = setup();
    let out = env.dir.join("signed.efi");
    sign_to(&env, &out);

    let image = PeImage::open(&out).unwrap();
    let table = CertificateTable::parse(&image).unwrap();
    assert_eq!(table.len(), 1);
    let entry = &table.entries()[0];
    assert_eq!(entry.revision, 0x0200);
    assert_eq!(entry.cert_type, 0x0002);

    // The embedded digest must equal the output file's own Authenticode
    // digest, certificate table excluded.
    let info = SignatureInfo::parse(&entry.payload).unwrap();
    let recomputed = PeDigester::new(DigestKind::Sha256).digest(&image).unwrap();
    assert_eq!(info.pe_digest(), recomputed.selected_digest());
    assert_eq!(info.digest_kind().unwrap(), DigestKind::Sha256);
}

#[test]
fn sign_then_remove_restores_unsigned_digest() {
    let env = setup();
    let signed = env.dir.join("signed.efi");
    sign_to(&env, &signed);

    let stripped = env.dir.join("stripped.efi");
    let desc = OperationDescriptor {
        in_path: Some(signed.clone()),
        out_path: Some(stripped.clone()),
        remove: true,
        ..base_descriptor(&env)
    };
    assert_eq!(dispatch::run(&desc).unwrap(), Outcome::Done);

    let image = PeImage::open(&stripped).unwrap();
    assert!(image.certificate_table().is_none());

    let unsigned = PeImage::open(&env.input).unwrap();
    let a = PeDigester::new(DigestKind::Sha256).digest(&unsigned).unwrap();
    let b = PeDigester::new(DigestKind::Sha256).digest(&image).unwrap();
    assert_eq!(a.selected_digest(), b.selected_digest());
    // Fixture is section-aligned, so stripping restores the exact length.
    assert_eq!(image.len(), unsigned.len());
}

#[test]
fn export_and_import_signature_round_trip() {
    let env = setup();
    let signed = env.dir.join("signed.efi");
    sign_to(&env, &signed);

    let sig_file = env.dir.join("sig.der");
    let desc = OperationDescriptor {
        in_path: Some(signed.clone()),
        sig_out: Some(sig_file.clone()),
        ..base_descriptor(&env)
    };
    assert_eq!(dispatch::run(&desc).unwrap(), Outcome::Done);

    let exported = fs::read(&sig_file).unwrap();
    let embedded = {
        let image = PeImage::open(&signed).unwrap();
        CertificateTable::parse(&image).unwrap().entries()[0]
            .payload
            .clone()
    };
    assert_eq!(exported, embedded);

    // Import the exported signature into a fresh copy of the unsigned
    // binary.
    let reimported = env.dir.join("reimported.efi");
    let desc = OperationDescriptor {
        sig_in: Some(sig_file),
        out_path: Some(reimported.clone()),
        ..base_descriptor(&env)
    };
    assert_eq!(dispatch::run(&desc).unwrap(), Outcome::Done);
    let image = PeImage::open(&reimported).unwrap();
    let table = CertificateTable::parse(&image).unwrap();
    assert_eq!(table.len(), 1);
    assert_eq!(table.entries()[0].payload, embedded);
}

#[test]
fn ascii_armored_export_imports_back() {
    let env = setup();
    let signed = env.dir.join("signed.efi");
    sign_to(&env, &signed);

    let sig_file = env.dir.join("sig.pem");
    let desc = OperationDescriptor {
        in_path: Some(signed),
        sig_out: Some(sig_file.clone()),
        ascii_armor: true,
        ..base_descriptor(&env)
    };
    assert_eq!(dispatch::run(&desc).unwrap(), Outcome::Done);
    let text = fs::read_to_string(&sig_file).unwrap();
    assert!(text.starts_with("-----BEGIN SIGNATURE-----"));
    assert!(text.trim_end().ends_with("-----END SIGNATURE-----"));

    let out = env.dir.join("armored-import.efi");
    let desc = OperationDescriptor {
        sig_in: Some(sig_file),
        out_path: Some(out.clone()),
        ..base_descriptor(&env)
    };
    assert_eq!(dispatch::run(&desc).unwrap(), Outcome::Done);
    let image = PeImage::open(&out).unwrap();
    assert_eq!(CertificateTable::parse(&image).unwrap().len(), 1);
}

#[test]
fn detached_signing_writes_a_parseable_signature() {
    let env = setup();
    let sig_file = env.dir.join("detached.der");
    let desc = OperationDescriptor {
        sig_out: Some(sig_file.clone()),
        cert_nickname: Some(NICKNAME.into()),
        sign: true,
        ..base_descriptor(&env)
    };
    assert_eq!(dispatch::run(&desc).unwrap(), Outcome::Done);

    let info = SignatureInfo::parse(&fs::read(&sig_file).unwrap()).unwrap();
    let input = PeImage::open(&env.input).unwrap();
    let digest = PeDigester::new(DigestKind::Sha256)
        .with_padding(true)
        .digest(&input)
        .unwrap();
    assert_eq!(info.pe_digest(), digest.selected_digest());
}

#[test]
fn sattr_export_and_raw_signature_import() {
    let env = setup();

    // Stage 1: export the to-be-signed attributes.
    let sattrs = env.dir.join("sattrs.bin");
    let desc = OperationDescriptor {
        sattrs_out: Some(sattrs.clone()),
        ..base_descriptor(&env)
    };
    assert_eq!(dispatch::run(&desc).unwrap(), Outcome::Done);

    // Stage 2: produce the raw signature elsewhere.
    let identity = common::test_identity();
    let blob = fs::read(&sattrs).unwrap();
    let raw_sig = identity.sign(&blob, DigestKind::Sha256).unwrap();
    let raw_path = env.dir.join("raw.sig");
    fs::write(&raw_path, &raw_sig).unwrap();

    // Stage 3: reassemble and embed.
    let out = env.dir.join("raw-signed.efi");
    let desc = OperationDescriptor {
        out_path: Some(out.clone()),
        raw_sig_in: Some(raw_path),
        sattrs_in: Some(sattrs),
        cert_nickname: Some(NICKNAME.into()),
        ..base_descriptor(&env)
    };
    assert_eq!(dispatch::run(&desc).unwrap(), Outcome::Done);

    let image = PeImage::open(&out).unwrap();
    let table = CertificateTable::parse(&image).unwrap();
    assert_eq!(table.len(), 1);
    let info = SignatureInfo::parse(&table.entries()[0].payload).unwrap();
    let recomputed = PeDigester::new(DigestKind::Sha256).digest(&image).unwrap();
    assert_eq!(info.pe_digest(), recomputed.selected_digest());
    assert_eq!(info.signature(), raw_sig.as_slice());
}

#[test]
fn export_pubkey_and_cert() {
    let env = setup();
    let key_file = env.dir.join("signer.spki");
    let cert_file = env.dir.join("signer.der");

    let desc = OperationDescriptor {
        pubkey_out: Some(key_file.clone()),
        cert_nickname: Some(NICKNAME.into()),
        ..base_descriptor(&env)
    };
    assert_eq!(dispatch::run(&desc).unwrap(), Outcome::Done);
    let spki_der = fs::read(&key_file).unwrap();
    spki::SubjectPublicKeyInfoOwned::from_der(&spki_der).unwrap();

    let desc = OperationDescriptor {
        cert_out: Some(cert_file.clone()),
        cert_nickname: Some(NICKNAME.into()),
        ..base_descriptor(&env)
    };
    assert_eq!(dispatch::run(&desc).unwrap(), Outcome::Done);
    assert_eq!(fs::read(&cert_file).unwrap(), common::test_cert_der());
}

#[test]
fn in_place_signing_is_refused() {
    let env = setup();
    let desc = OperationDescriptor {
        out_path: Some(env.input.clone()),
        cert_nickname: Some("X".into()),
        sign: true,
        ..base_descriptor(&env)
    };
    let err = dispatch::run(&desc).unwrap_err();
    assert!(err.to_string().contains("in-place file editing"));
}

#[test]
fn existing_output_requires_force() {
    let env = setup();
    let out = env.dir.join("already-there.efi");
    fs::write(&out, b"occupied").unwrap();

    let desc = OperationDescriptor {
        out_path: Some(out.clone()),
        cert_nickname: Some(NICKNAME.into()),
        sign: true,
        ..base_descriptor(&env)
    };
    match dispatch::run(&desc).unwrap_err() {
        PesignError::OutputExists(path) => assert_eq!(path, out),
        other => panic!("expected OutputExists, got {other}"),
    }
    // Refusal must leave the existing file alone.
    assert_eq!(fs::read(&out).unwrap(), b"occupied");

    let desc = OperationDescriptor {
        force: true,
        ..desc
    };
    assert_eq!(dispatch::run(&desc).unwrap(), Outcome::Done);
    assert!(PeImage::open(&out).is_ok());
}

#[test]
fn second_signature_lands_at_requested_index() {
    let env = setup();
    let signed = env.dir.join("signed.efi");
    sign_to(&env, &signed);

    let twice = env.dir.join("twice.efi");
    let desc = OperationDescriptor {
        in_path: Some(signed),
        out_path: Some(twice.clone()),
        cert_nickname: Some(NICKNAME.into()),
        sign: true,
        digest: DigestKind::Sha384,
        ..base_descriptor(&env)
    };
    let desc = OperationDescriptor { signum: 1, ..desc };
    assert_eq!(dispatch::run(&desc).unwrap(), Outcome::Done);

    let image = PeImage::open(&twice).unwrap();
    let table = CertificateTable::parse(&image).unwrap();
    assert_eq!(table.len(), 2);
    let first = SignatureInfo::parse(&table.entries()[0].payload).unwrap();
    let second = SignatureInfo::parse(&table.entries()[1].payload).unwrap();
    assert_eq!(first.digest_kind().unwrap(), DigestKind::Sha256);
    assert_eq!(second.digest_kind().unwrap(), DigestKind::Sha384);
    // Both signatures cover the same final image.
    let sha384 = PeDigester::new(DigestKind::Sha384).digest(&image).unwrap();
    assert_eq!(second.pe_digest(), sha384.selected_digest());
}

#[test]
fn invalid_signature_number_is_reported() {
    let env = setup();
    let out = env.dir.join("never.efi");
    let desc = OperationDescriptor {
        out_path: Some(out),
        remove: true,
        signum: 3,
        ..base_descriptor(&env)
    };
    match dispatch::run(&desc).unwrap_err() {
        PesignError::InvalidSignatureNumber {
            requested,
            available,
        } => {
            assert_eq!(requested, 3);
            assert_eq!(available, 0);
        }
        other => panic!("expected InvalidSignatureNumber, got {other}"),
    }
}

#[test]
fn unknown_nickname_is_certificate_not_found() {
    let env = setup();
    let out = env.dir.join("never.efi");
    let desc = OperationDescriptor {
        out_path: Some(out),
        cert_nickname: Some("No Such Signer".into()),
        sign: true,
        ..base_descriptor(&env)
    };
    match dispatch::run(&desc).unwrap_err() {
        PesignError::CertificateNotFound(name) => assert_eq!(name, "No Such Signer"),
        other => panic!("expected CertificateNotFound, got {other}"),
    }
}

#[test]
fn store_find_loads_certificate_without_key() {
    let env = setup();
    fs::remove_file(env.dir.join(format!("{NICKNAME}.key"))).unwrap();
    let store = CredentialStore::open(&env.dir).unwrap();

    let identity = store.find(NICKNAME, false).unwrap();
    assert!(identity.sign(b"anything", DigestKind::Sha256).is_err());

    match store.find(NICKNAME, true).unwrap_err() {
        PesignError::PrivateKeyUnavailable(_) => {}
        other => panic!("expected PrivateKeyUnavailable, got {other}"),
    }
}

#[test]
fn hash_action_succeeds_on_valid_input() {
    let env = setup();
    let desc = OperationDescriptor {
        hash: true,
        ..base_descriptor(&env)
    };
    assert_eq!(dispatch::run(&desc).unwrap(), Outcome::Done);
}
