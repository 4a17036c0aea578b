//! CMS SignedData construction and dissection for Authenticode.

pub mod attributes;
pub mod builder;
pub mod oids;
pub mod parser;
pub mod spc;

pub use builder::CmsBuilder;
pub use parser::SignatureInfo;
pub use spc::{DigestInfo, SpcAttributeTypeAndOptionalValue, SpcIndirectDataContent};
