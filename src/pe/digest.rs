//! Authenticode PE digest engine.
//!
//! The canonical hash covers the whole file except three regions: the
//! optional-header checksum, the certificate-table data directory entry,
//! and the certificate table itself. Sections are hashed in raw-offset
//! order and any trailing data outside the certificate table is covered
//! too, so re-signing a stripped file reproduces the original digest.

use log::debug;

use crate::error::{PesignError, Result};
use crate::pe::PeImage;
use crate::DigestKind;

/// One digest per supported algorithm, plus the marker naming the
/// algorithm the current operation selected.
#[derive(Debug, Clone)]
pub struct DigestSet {
    entries: Vec<(DigestKind, Vec<u8>)>,
    selected: DigestKind,
}

impl DigestSet {
    #[must_use]
    pub fn selected(&self) -> DigestKind {
        self.selected
    }

    #[must_use]
    pub fn selected_digest(&self) -> &[u8] {
        self.get(self.selected)
            .unwrap_or_else(|| unreachable!("selected digest is always computed"))
    }

    #[must_use]
    pub fn get(&self, kind: DigestKind) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, d)| d.as_slice())
    }

    #[must_use]
    pub fn entries(&self) -> &[(DigestKind, Vec<u8>)] {
        &self.entries
    }
}

/// Computes the Authenticode digest of a PE image.
pub struct PeDigester {
    selected: DigestKind,
    padding: bool,
}

impl PeDigester {
    #[must_use]
    pub fn new(selected: DigestKind) -> Self {
        PeDigester {
            selected,
            padding: false,
        }
    }

    /// Pad truncated section data with zeros instead of failing. Signing
    /// flows enable this so malformed inputs hash deterministically.
    #[must_use]
    pub fn with_padding(mut self, padding: bool) -> Self {
        self.padding = padding;
        self
    }

    /// Produce the digest set for `image`.
    pub fn digest(&self, image: &PeImage) -> Result<DigestSet> {
        let mut hashers: Vec<(DigestKind, Box<dyn digest::DynDigest>)> = DigestKind::ALL
            .iter()
            .map(|k| (*k, k.hasher()))
            .collect();
        let mut update = |bytes: &[u8]| {
            for (_, h) in &mut hashers {
                h.update(bytes);
            }
        };

        let data = image.raw_bytes();
        let checksum = image.checksum_offset();
        let cert_dir = image.cert_dir_offset();
        let headers_end = image.size_of_headers();

        if checksum + 4 > cert_dir || cert_dir + 8 > headers_end {
            return Err(PesignError::MalformedImage(
                "optional header fields out of order".into(),
            ));
        }

        // Headers, minus the checksum field and the certificate table
        // directory entry.
        update(&data[..checksum]);
        update(&data[checksum + 4..cert_dir]);
        update(&data[cert_dir + 8..headers_end]);

        // Sections in file order.
        let mut sections: Vec<_> = image.section_iter().collect();
        sections.sort_by_key(|s| s.pointer_to_raw_data);

        let mut sum_of_bytes_hashed = headers_end;
        for section in &sections {
            let start = section.pointer_to_raw_data as usize;
            let size = section.size_of_raw_data as usize;
            if size == 0 {
                continue;
            }
            let end = start + size;
            if end <= data.len() {
                update(&data[start..end]);
            } else if self.padding {
                let avail = data.len().saturating_sub(start);
                debug!(
                    "padding section {} with {} zero bytes",
                    section.name_str(),
                    size - avail
                );
                if avail > 0 {
                    update(&data[start..start + avail]);
                }
                update(&vec![0u8; size - avail]);
            } else {
                return Err(PesignError::MalformedImage(format!(
                    "section {} raw data [{start:#x}, {end:#x}) lies outside the file",
                    section.name_str()
                )));
            }
            sum_of_bytes_hashed += size;
        }

        // Trailing data is covered; the certificate table is not.
        let cert_size = image.certificate_table().map_or(0, |(_, size)| size);
        if data.len() > sum_of_bytes_hashed + cert_size {
            update(&data[sum_of_bytes_hashed..data.len() - cert_size]);
        }

        let entries = hashers
            .into_iter()
            .map(|(k, h)| (k, h.finalize().to_vec()))
            .collect();
        Ok(DigestSet {
            entries,
            selected: self.selected,
        })
    }
}
