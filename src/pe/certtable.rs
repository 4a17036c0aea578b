//! Attribute certificate table editor.
//!
//! The table lives at a raw file offset recorded in data directory entry 4
//! (a file offset, not an RVA, unlike every other directory entry) and
//! holds 8-byte-aligned WIN_CERTIFICATE entries. All mutations of the
//! table region go through this module; it keeps the directory entry, the
//! entry list and the file tail consistent, and zeroes the optional-header
//! checksum after every change.

use log::{debug, warn};

use crate::error::{PesignError, Result};
use crate::pe::{PeImage, CERT_TABLE_INDEX};

/// WIN_CERTIFICATE revision this tool produces and accepts.
pub const WIN_CERT_REVISION_2_0: u16 = 0x0200;

/// Certificate type for PKCS#7 SignedData payloads.
pub const WIN_CERT_TYPE_PKCS_SIGNED_DATA: u16 = 0x0002;

const WIN_CERT_HEADER_SIZE: usize = 8;

/// Round `n` up to the next 8-byte boundary.
#[must_use]
pub fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// One parsed WIN_CERTIFICATE entry.
///
/// `dwLength` covers the 8-byte header plus the payload but not the zero
/// padding that aligns the next entry; the padding is counted only in the
/// containing table's size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WinCertificate {
    pub revision: u16,
    pub cert_type: u16,
    pub payload: Vec<u8>,
}

impl WinCertificate {
    /// Wrap a DER-encoded SignedData payload in the standard envelope.
    #[must_use]
    pub fn pkcs_signed_data(payload: Vec<u8>) -> Self {
        WinCertificate {
            revision: WIN_CERT_REVISION_2_0,
            cert_type: WIN_CERT_TYPE_PKCS_SIGNED_DATA,
            payload,
        }
    }

    #[must_use]
    pub fn dw_length(&self) -> u32 {
        (WIN_CERT_HEADER_SIZE + self.payload.len()) as u32
    }

    /// Bytes the entry occupies in the table, padding included.
    #[must_use]
    pub fn aligned_len(&self) -> usize {
        align8(WIN_CERT_HEADER_SIZE + self.payload.len())
    }
}

/// Ordered view of the certificate table entries of one image.
#[derive(Debug, Default)]
pub struct CertificateTable {
    entries: Vec<WinCertificate>,
}

impl CertificateTable {
    /// Parse the table referenced by the image's data directory.
    ///
    /// A `(0, 0)` directory entry yields an empty table.
    pub fn parse(image: &PeImage) -> Result<Self> {
        let Some((offset, size)) = image.certificate_table() else {
            return Ok(CertificateTable::default());
        };
        let data = image.raw_bytes();
        let end = offset
            .checked_add(size)
            .filter(|&e| e <= data.len())
            .ok_or_else(|| {
                PesignError::MalformedCertTable("table range lies outside the file".into())
            })?;

        let mut entries = Vec::new();
        let mut cursor = offset;
        while cursor < end {
            if end - cursor < WIN_CERT_HEADER_SIZE {
                return Err(PesignError::MalformedCertTable(format!(
                    "{} stray bytes at end of table",
                    end - cursor
                )));
            }
            let dw_length =
                u32::from_le_bytes(data[cursor..cursor + 4].try_into().unwrap()) as usize;
            let revision = u16::from_le_bytes(data[cursor + 4..cursor + 6].try_into().unwrap());
            let cert_type = u16::from_le_bytes(data[cursor + 6..cursor + 8].try_into().unwrap());

            if dw_length < WIN_CERT_HEADER_SIZE {
                return Err(PesignError::MalformedCertTable(format!(
                    "entry {} has impossible length {dw_length}",
                    entries.len()
                )));
            }
            if revision != WIN_CERT_REVISION_2_0 {
                return Err(PesignError::MalformedCertTable(format!(
                    "entry {} has unknown revision {revision:#06x}",
                    entries.len()
                )));
            }
            let payload_end = cursor + dw_length;
            if payload_end > end {
                return Err(PesignError::MalformedCertTable(format!(
                    "entry {} overruns the table",
                    entries.len()
                )));
            }
            entries.push(WinCertificate {
                revision,
                cert_type,
                payload: data[cursor + WIN_CERT_HEADER_SIZE..payload_end].to_vec(),
            });
            cursor += align8(dw_length);
        }
        debug!("parsed {} certificate table entries", entries.len());
        Ok(CertificateTable { entries })
    }

    #[must_use]
    pub fn entries(&self) -> &[WinCertificate] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&WinCertificate> {
        self.entries.get(index)
    }

    /// Table size with every entry padded to its 8-byte boundary.
    #[must_use]
    pub fn total_size(&self) -> usize {
        self.entries.iter().map(WinCertificate::aligned_len).sum()
    }

    /// Upper bound on the table space one SignedData of `cms_len` bytes
    /// needs, envelope and padding included.
    #[must_use]
    pub fn estimate_size(cms_len: usize) -> usize {
        align8(WIN_CERT_HEADER_SIZE + cms_len)
    }

    /// Drop the certificate table from the image: clear the directory
    /// entry and, when the table ran to end of file, cut the file back.
    pub fn clear(image: &mut PeImage) -> Result<()> {
        if let Some((offset, size)) = image.certificate_table() {
            if offset + size == image.len() {
                image.truncate(offset);
            } else {
                warn!("certificate table not at EOF; clearing directory entry only");
            }
            image.set_data_directory(CERT_TABLE_INDEX, 0, 0)?;
            image.set_checksum(0);
        }
        Ok(())
    }

    /// Grow the certificate table region by `extra` bytes at end of image.
    ///
    /// Creates the table region (8-aligned, at EOF) if the image has none.
    /// The reserved bytes are zero and excluded from the Authenticode
    /// digest, so reserving space never changes the image hash once the
    /// file tail is aligned.
    pub fn allocate_space(image: &mut PeImage, extra: usize) -> Result<()> {
        let (start, size) = match image.certificate_table() {
            Some((offset, size)) => {
                if offset + size != image.len() {
                    return Err(PesignError::MalformedCertTable(
                        "cannot grow a table that does not end at EOF".into(),
                    ));
                }
                (offset, size)
            }
            None => {
                let start = align8(image.len());
                if start > image.len() {
                    debug!("padding image tail by {} bytes", start - image.len());
                    image.resize(start);
                }
                (start, 0)
            }
        };
        if start < image.end_of_image() {
            return Err(PesignError::MalformedCertTable(
                "certificate table would precede the last section".into(),
            ));
        }
        image.resize(start + size + extra);
        image.set_data_directory(CERT_TABLE_INDEX, start as u32, (size + extra) as u32)?;
        image.set_checksum(0);
        Ok(())
    }

    /// Serialize the entry list into the image, resizing the table region
    /// to fit exactly and rewriting the data directory.
    pub fn write(&self, image: &mut PeImage) -> Result<()> {
        if self.entries.is_empty() {
            return Self::clear(image);
        }
        let start = match image.certificate_table() {
            Some((offset, size)) => {
                if offset + size != image.len() {
                    return Err(PesignError::MalformedCertTable(
                        "cannot rewrite a table that does not end at EOF".into(),
                    ));
                }
                offset
            }
            None => align8(image.len()),
        };
        let total = self.total_size();
        image.resize(start + total);

        let mut cursor = start;
        for entry in &self.entries {
            let mut bytes = Vec::with_capacity(entry.aligned_len());
            bytes.extend_from_slice(&entry.dw_length().to_le_bytes());
            bytes.extend_from_slice(&entry.revision.to_le_bytes());
            bytes.extend_from_slice(&entry.cert_type.to_le_bytes());
            bytes.extend_from_slice(&entry.payload);
            bytes.resize(entry.aligned_len(), 0);
            image.write_at(cursor, &bytes)?;
            cursor += bytes.len();
        }
        image.set_data_directory(CERT_TABLE_INDEX, start as u32, total as u32)?;
        image.set_checksum(0);
        Ok(())
    }

    /// Place `entry` at `index` (clamped to the entry count) and rewrite
    /// the table.
    pub fn insert(&mut self, image: &mut PeImage, entry: WinCertificate, index: usize) -> Result<()> {
        let index = index.min(self.entries.len());
        self.entries.insert(index, entry);
        self.write(image)
    }

    /// Remove the entry at `index` and rewrite the table.
    pub fn remove(&mut self, image: &mut PeImage, index: usize) -> Result<WinCertificate> {
        if index >= self.entries.len() {
            return Err(PesignError::InvalidSignatureNumber {
                requested: index as i64,
                available: self.entries.len(),
            });
        }
        let entry = self.entries.remove(index);
        self.write(image)?;
        Ok(entry)
    }
}
