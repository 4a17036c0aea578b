//! PE/COFF image model, Authenticode digest engine and certificate-table
//! editor.

mod certtable;
mod digest;
mod image;

pub use certtable::{
    align8, CertificateTable, WinCertificate, WIN_CERT_REVISION_2_0, WIN_CERT_TYPE_PKCS_SIGNED_DATA,
};
pub use digest::{DigestSet, PeDigester};
pub use image::{PeFormat, PeImage, SectionHeader, CERT_TABLE_INDEX};
