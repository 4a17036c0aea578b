//! Error types shared by every pesign component.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for pesign operations
pub type Result<T> = std::result::Result<T, PesignError>;

/// Failures surfaced by the PE, CMS, identity and dispatch layers.
///
/// The library never terminates the process; the CLI maps any of these to a
/// single diagnostic line and exit status 1.
#[derive(Error, Debug)]
pub enum PesignError {
    #[error("malformed PE image: {0}")]
    MalformedImage(String),

    #[error("malformed certificate table: {0}")]
    MalformedCertTable(String),

    #[error("malformed CMS signature: {0}")]
    MalformedCms(String),

    #[error("digest \"{0}\" not found")]
    UnsupportedAlgorithm(String),

    #[error("unsupported content type {0}")]
    UnsupportedContentType(String),

    #[error("could not find certificate {0}")]
    CertificateNotFound(String),

    #[error("private key unavailable for {0}")]
    PrivateKeyUnavailable(String),

    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error("invalid signature number {requested}; image has {available} signature(s)")]
    InvalidSignatureNumber { requested: i64, available: usize },

    #[error("incompatible flags ({mask:#06x}): {names}")]
    IncompatibleFlags { mask: u32, names: String },

    #[error("in-place file editing is not yet supported")]
    InPlaceUnsupported,

    #[error("\"{}\" exists and --force was not given", .0.display())]
    OutputExists(PathBuf),

    #[error("{0}")]
    IoFailure(String),

    #[error("no input file specified")]
    MissingInput,

    #[error("no output file specified")]
    MissingOutput,

    #[error("signing requested but no certificate nickname provided")]
    MissingNickname,

    #[error("daemon mode is not available in this build")]
    DaemonUnavailable,
}

impl From<std::io::Error> for PesignError {
    fn from(error: std::io::Error) -> Self {
        PesignError::IoFailure(error.to_string())
    }
}

impl From<der::Error> for PesignError {
    fn from(error: der::Error) -> Self {
        PesignError::MalformedCms(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_place_message_names_the_restriction() {
        let msg = PesignError::InPlaceUnsupported.to_string();
        assert!(msg.contains("in-place file editing"));
    }

    #[test]
    fn incompatible_flags_lists_names() {
        let err = PesignError::IncompatibleFlags {
            mask: 0x81,
            names: "hash remove".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("0x0081"));
        assert!(msg.contains("hash remove"));
    }

    #[test]
    fn output_exists_names_the_path() {
        let err = PesignError::OutputExists(PathBuf::from("signed.efi"));
        assert!(err.to_string().contains("signed.efi"));
        assert!(err.to_string().contains("--force"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = PesignError::from(io);
        assert!(matches!(err, PesignError::IoFailure(_)));
    }
}
