//! Object identifiers and fixed DER fragments used by Authenticode CMS
//! structures.

use der::asn1::ObjectIdentifier;

/// SpcIndirectDataContent, the Authenticode encapsulated content type.
pub const SPC_INDIRECT_DATA_OBJID: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.311.2.1.4");

/// SpcPeImageData, the attribute type naming what was hashed.
pub const SPC_PE_IMAGE_DATA_OBJID: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.311.2.1.15");

/// SpcSpOpusInfo signed attribute.
pub const SPC_SP_OPUS_INFO_OBJID: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.311.2.1.12");

/// rsaEncryption, used as the SignerInfo signature algorithm.
pub const RSA_ENCRYPTION: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");

pub const SHA1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.14.3.2.26");
pub const SHA224: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.4");
pub const SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.1");
pub const SHA384: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.2");
pub const SHA512: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.3");

/// SpcPeImageData with empty flags and an empty unicode file link:
/// `SEQUENCE { BIT STRING 0 bits, [0] { [2] { [0] "" } } }`.
pub const SPC_PE_IMAGE_DATA_CONTENT: [u8; 11] = [
    0x30, 0x09, 0x03, 0x01, 0x00, 0xA0, 0x04, 0xA2, 0x02, 0x80, 0x00,
];

/// Empty SpcSpOpusInfo: `SEQUENCE {}`.
pub const SPC_SP_OPUS_INFO_EMPTY: [u8; 2] = [0x30, 0x00];
