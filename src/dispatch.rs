//! Operation dispatcher.
//!
//! Matches the composed action mask against the fixed set of legal
//! combinations and runs the corresponding component sequence. Inputs are
//! validated before any output file is created, the signing identity is
//! resolved before anything destructive happens, and a partially written
//! output is removed on failure.

use std::fs;
use std::path::Path;

use log::{debug, info, warn};

use der::Encode;

use crate::error::{PesignError, Result};
use crate::identity::{CredentialStore, SigningIdentity};
use crate::ops::{action, flag_names, OperationDescriptor};
use crate::pe::{CertificateTable, PeDigester, PeImage, WinCertificate};
use crate::pkcs7::attributes::{build_signed_attributes, decode_signed_attributes, signing_input};
use crate::pkcs7::spc::spc_indirect_data;
use crate::pkcs7::{CmsBuilder, SignatureInfo};

const PEM_SIGNATURE_TAG: &str = "SIGNATURE";

/// How a successfully dispatched operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The requested work was performed.
    Done,
    /// The empty action mask: nothing was requested.
    NothingToDo,
}

/// Run the operation the descriptor asks for.
pub fn run(desc: &OperationDescriptor) -> Result<Outcome> {
    let mask = desc.action_mask();
    debug!("action mask {mask:#06x}: {}", flag_names(mask));

    if desc.sign && desc.cert_nickname.is_none() {
        return Err(PesignError::MissingNickname);
    }

    match mask {
        action::NO_FLAGS => Ok(Outcome::NothingToDo),

        m if m == action::IMPORT_RAW_SIGNATURE | action::IMPORT_SATTRS => {
            import_raw_signature(desc)
        }
        action::EXPORT_SATTRS => export_sattrs(desc),
        action::IMPORT_SIGNATURE => import_signature(desc),
        action::EXPORT_PUBKEY => export_pubkey(desc),
        action::EXPORT_CERT => export_cert(desc),
        action::EXPORT_SIGNATURE => export_signature(desc),
        action::REMOVE_SIGNATURE => remove_signature(desc),
        action::LIST_SIGNATURES => list_signatures(desc),
        m if m == action::GENERATE_DIGEST | action::PRINT_DIGEST => print_digest(desc),
        m if m == action::EXPORT_SIGNATURE | action::GENERATE_SIGNATURE => sign_detached(desc),
        m if m == action::IMPORT_SIGNATURE | action::GENERATE_SIGNATURE => sign_embedded(desc),
        action::DAEMONIZE => Err(PesignError::DaemonUnavailable),

        other => Err(PesignError::IncompatibleFlags {
            mask: other,
            names: flag_names(other),
        }),
    }
}

fn in_path(desc: &OperationDescriptor) -> Result<&Path> {
    desc.in_path.as_deref().ok_or(PesignError::MissingInput)
}

fn out_path(desc: &OperationDescriptor) -> Result<&Path> {
    desc.out_path.as_deref().ok_or(PesignError::MissingOutput)
}

/// Both paths present and distinct. Editing a binary in place is refused.
fn check_inputs(desc: &OperationDescriptor) -> Result<(&Path, &Path)> {
    let input = in_path(desc)?;
    let output = out_path(desc)?;
    if input == output {
        return Err(PesignError::InPlaceUnsupported);
    }
    Ok((input, output))
}

fn open_store(desc: &OperationDescriptor) -> Result<CredentialStore> {
    CredentialStore::open(&desc.cert_dir)
}

fn find_identity(desc: &OperationDescriptor, need_key: bool) -> Result<SigningIdentity> {
    let nickname = desc
        .cert_nickname
        .as_deref()
        .ok_or(PesignError::MissingNickname)?;
    open_store(desc)?.find(nickname, need_key)
}

fn validate_signum_for_insert(desc: &OperationDescriptor, existing: usize) -> Result<usize> {
    if desc.signum < 0 || desc.signum as usize > existing {
        return Err(PesignError::InvalidSignatureNumber {
            requested: desc.signum,
            available: existing,
        });
    }
    Ok(desc.signum as usize)
}

fn validate_signum_for_lookup(desc: &OperationDescriptor, existing: usize) -> Result<usize> {
    if desc.signum < 0 || desc.signum as usize >= existing {
        return Err(PesignError::InvalidSignatureNumber {
            requested: desc.signum,
            available: existing,
        });
    }
    Ok(desc.signum as usize)
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| PesignError::IoFailure(format!("{}: {e}", path.display())))
}

/// Write `bytes` to `path` honoring the overwrite policy: refuse existing
/// files unless forced, create exclusively otherwise.
fn write_output(path: &Path, bytes: &[u8], force: bool) -> Result<()> {
    if !force && path.exists() {
        return Err(PesignError::OutputExists(path.to_path_buf()));
    }
    let result = if force {
        fs::write(path, bytes)
            .map_err(|e| PesignError::IoFailure(format!("{}: {e}", path.display())))
    } else {
        use std::io::Write;
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .and_then(|mut f| f.write_all(bytes))
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    PesignError::OutputExists(path.to_path_buf())
                } else {
                    PesignError::IoFailure(format!("{}: {e}", path.display()))
                }
            })
    };
    if result.is_err() {
        remove_partial_output(path);
    }
    result
}

fn remove_partial_output(path: &Path) {
    if fs::remove_file(path).is_ok() {
        debug!("removed partial output {}", path.display());
    }
}

/// Finalize a cloned image, cleaning up the half-written file on error.
fn finalize_output(image: &PeImage, force: bool) -> Result<()> {
    let result = image.finalize(force);
    if result.is_err() {
        if let Some(path) = image.out_path() {
            remove_partial_output(path);
        }
    }
    result
}

/// Decode a detached signature file, accepting raw DER or the armored
/// form produced by `--ascii-armor`.
fn decode_signature_file(bytes: &[u8]) -> Result<Vec<u8>> {
    if bytes.starts_with(b"-----BEGIN") {
        let block = pem::parse(bytes)
            .map_err(|e| PesignError::MalformedCms(format!("bad PEM armor: {e}")))?;
        Ok(block.contents().to_vec())
    } else {
        Ok(bytes.to_vec())
    }
}

fn encode_signature_file(payload: &[u8], ascii_armor: bool) -> Vec<u8> {
    if ascii_armor {
        pem::encode(&pem::Pem::new(PEM_SIGNATURE_TAG, payload)).into_bytes()
    } else {
        payload.to_vec()
    }
}

/// Shared tail of every embedding flow: reserve table space on the output
/// image, recompute the authoritative digest, build the SignedData and
/// write the final table.
///
/// The digest taken after space reservation is the one that ends up in the
/// embedded messageDigest; reservation itself must not perturb it.
fn embed_signature<F>(
    mut table: CertificateTable,
    mut out_image: PeImage,
    desc: &OperationDescriptor,
    index: usize,
    build: F,
) -> Result<()>
where
    F: Fn(&[u8]) -> Result<Vec<u8>>,
{
    CertificateTable::clear(&mut out_image)?;

    let digester = PeDigester::new(desc.digest).with_padding(true);
    let first = digester.digest(&out_image)?;

    let probe = build(first.selected_digest())?;
    let needed = table.total_size() + CertificateTable::estimate_size(probe.len());
    CertificateTable::allocate_space(&mut out_image, needed)?;

    let authoritative = digester.digest(&out_image)?;
    let payload = build(authoritative.selected_digest())?;
    if payload.len() != probe.len() {
        debug!(
            "signature size estimate was off ({} != {}); table rewrite absorbs it",
            probe.len(),
            payload.len()
        );
    }

    table.insert(&mut out_image, WinCertificate::pkcs_signed_data(payload), index)?;
    finalize_output(&out_image, desc.force)
}

/// hash: digest the input and print the selected digest.
fn print_digest(desc: &OperationDescriptor) -> Result<Outcome> {
    let image = PeImage::open(in_path(desc)?)?;
    let digests = PeDigester::new(desc.digest)
        .with_padding(desc.padding)
        .digest(&image)?;
    println!("hash: {}", hex::encode(digests.selected_digest()));
    Ok(Outcome::Done)
}

/// sign + embed: the canonical sign-and-embed flow.
fn sign_embedded(desc: &OperationDescriptor) -> Result<Outcome> {
    let (input, output) = check_inputs(desc)?;
    let identity = find_identity(desc, true)?;

    let in_image = PeImage::open(input)?;
    let table = CertificateTable::parse(&in_image)?;
    let index = validate_signum_for_insert(desc, table.len())?;
    let out_image = in_image.clone_to(output, desc.force)?;

    let builder = CmsBuilder::new(&identity, desc.digest);
    embed_signature(table, out_image, desc, index, |digest| {
        builder.build_signed(digest)
    })?;
    info!("signed {} into {}", input.display(), output.display());
    Ok(Outcome::Done)
}

/// sign + export: generate a signature and save it detached.
fn sign_detached(desc: &OperationDescriptor) -> Result<Outcome> {
    let identity = find_identity(desc, true)?;
    let image = PeImage::open(in_path(desc)?)?;
    let sig_out = desc.sig_out.as_deref().ok_or(PesignError::MissingOutput)?;

    let digests = PeDigester::new(desc.digest).with_padding(true).digest(&image)?;
    let payload = CmsBuilder::new(&identity, desc.digest).build_signed(digests.selected_digest())?;
    write_output(sig_out, &encode_signature_file(&payload, desc.ascii_armor), desc.force)?;
    Ok(Outcome::Done)
}

/// import-raw-sig + import-sattrs: rebuild a signature from its parts.
fn import_raw_signature(desc: &OperationDescriptor) -> Result<Outcome> {
    let (input, output) = check_inputs(desc)?;
    let identity = find_identity(desc, false)?;

    let raw_sig_path = desc.raw_sig_in.as_deref().ok_or(PesignError::MissingInput)?;
    let sattrs_path = desc.sattrs_in.as_deref().ok_or(PesignError::MissingInput)?;
    let raw_signature = read_file(raw_sig_path)?;
    let attrs = decode_signed_attributes(&read_file(sattrs_path)?)?;

    let modulus = identity.modulus_len();
    if modulus != 0 && raw_signature.len() != modulus {
        return Err(PesignError::SigningFailed(format!(
            "raw signature is {} bytes but the certificate's key takes {modulus}",
            raw_signature.len()
        )));
    }

    let in_image = PeImage::open(input)?;
    let table = CertificateTable::parse(&in_image)?;
    let index = validate_signum_for_insert(desc, table.len())?;
    let out_image = in_image.clone_to(output, desc.force)?;

    let builder = CmsBuilder::new(&identity, desc.digest);
    embed_signature(table, out_image, desc, index, |digest| {
        builder.build_with_raw_signature(digest, attrs.clone(), &raw_signature)
    })?;
    Ok(Outcome::Done)
}

/// export-sattrs: write the to-be-signed attribute set for this binary.
fn export_sattrs(desc: &OperationDescriptor) -> Result<Outcome> {
    let image = PeImage::open(in_path(desc)?)?;
    let sattrs_out = desc.sattrs_out.as_deref().ok_or(PesignError::MissingOutput)?;

    let digests = PeDigester::new(desc.digest).with_padding(true).digest(&image)?;
    let spc_der = spc_indirect_data(desc.digest, digests.selected_digest())?.to_der()?;
    let attrs = build_signed_attributes(desc.digest, &spc_der)?;
    write_output(sattrs_out, &signing_input(&attrs)?, desc.force)?;
    Ok(Outcome::Done)
}

/// import-sig: embed a signature produced elsewhere.
fn import_signature(desc: &OperationDescriptor) -> Result<Outcome> {
    let (input, output) = check_inputs(desc)?;
    let sig_in = desc.sig_in.as_deref().ok_or(PesignError::MissingInput)?;

    let payload = decode_signature_file(&read_file(sig_in)?)?;
    SignatureInfo::parse(&payload)?;

    let in_image = PeImage::open(input)?;
    let mut table = CertificateTable::parse(&in_image)?;
    let index = validate_signum_for_insert(desc, table.len())?;

    let mut out_image = in_image.clone_to(output, desc.force)?;
    table.insert(&mut out_image, WinCertificate::pkcs_signed_data(payload), index)?;
    finalize_output(&out_image, desc.force)?;
    Ok(Outcome::Done)
}

/// export-sig: save one embedded signature verbatim.
fn export_signature(desc: &OperationDescriptor) -> Result<Outcome> {
    let image = PeImage::open(in_path(desc)?)?;
    let sig_out = desc.sig_out.as_deref().ok_or(PesignError::MissingOutput)?;

    let table = CertificateTable::parse(&image)?;
    let index = validate_signum_for_lookup(desc, table.len())?;
    let entry = &table.entries()[index];
    write_output(
        sig_out,
        &encode_signature_file(&entry.payload, desc.ascii_armor),
        desc.force,
    )?;
    Ok(Outcome::Done)
}

/// remove: drop one signature from the table.
fn remove_signature(desc: &OperationDescriptor) -> Result<Outcome> {
    let (input, output) = check_inputs(desc)?;
    let in_image = PeImage::open(input)?;
    let mut table = CertificateTable::parse(&in_image)?;
    let index = validate_signum_for_lookup(desc, table.len())?;

    let mut out_image = in_image.clone_to(output, desc.force)?;
    table.remove(&mut out_image, index)?;
    finalize_output(&out_image, desc.force)?;
    Ok(Outcome::Done)
}

/// list: describe each certificate table entry.
fn list_signatures(desc: &OperationDescriptor) -> Result<Outcome> {
    let image = PeImage::open(in_path(desc)?)?;
    let table = CertificateTable::parse(&image)?;
    if table.is_empty() {
        println!("No signatures found.");
        return Ok(Outcome::Done);
    }
    for (i, entry) in table.entries().iter().enumerate() {
        println!("---------------------------------------------");
        println!("signature {i}");
        println!(
            "type {:#06x} revision {:#06x}, {} bytes",
            entry.cert_type,
            entry.revision,
            entry.payload.len()
        );
        match SignatureInfo::parse(&entry.payload) {
            Ok(info) => {
                match info.digest_kind() {
                    Ok(kind) => println!("digest algorithm: {}", kind.as_str()),
                    Err(_) => println!("digest algorithm: (unrecognized)"),
                }
                println!("authenticode digest: {}", hex::encode(info.pe_digest()));
                let (issuer, serial) = info.signer_id();
                println!("issuer: {issuer}");
                println!("serial: {serial}");
                println!("certificates: {}", info.certificates().count());
            }
            Err(e) => {
                warn!("signature {i} did not parse: {e}");
                println!("(unparseable signature: {e})");
            }
        }
    }
    Ok(Outcome::Done)
}

/// export-pubkey: DER SubjectPublicKeyInfo of the signing identity.
fn export_pubkey(desc: &OperationDescriptor) -> Result<Outcome> {
    let identity = find_identity(desc, true)?;
    let pubkey_out = desc.pubkey_out.as_deref().ok_or(PesignError::MissingOutput)?;
    write_output(pubkey_out, &identity.public_key_der()?, desc.force)?;
    Ok(Outcome::Done)
}

/// export-cert: DER certificate of the signing identity.
fn export_cert(desc: &OperationDescriptor) -> Result<Outcome> {
    let identity = find_identity(desc, false)?;
    let cert_out = desc.cert_out.as_deref().ok_or(PesignError::MissingOutput)?;
    write_output(cert_out, &identity.certificate_der()?, desc.force)?;
    Ok(Outcome::Done)
}
