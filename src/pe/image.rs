//! Byte-accurate PE/COFF image model.
//!
//! `PeImage` owns the raw file bytes plus the header geometry every other
//! component needs: the checksum field, the data directory array and the
//! section table. Offsets are computed from the optional-header size field
//! and validated against the file bounds up front, so downstream code can
//! index without re-checking.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::{PesignError, Result};

/// Data directory index of the attribute certificate table.
pub const CERT_TABLE_INDEX: usize = 4;

const E_LFANEW_OFFSET: usize = 0x3c;
const COFF_HEADER_SIZE: usize = 20;
const PE32_MAGIC: u16 = 0x10b;
const PE32PLUS_MAGIC: u16 = 0x20b;
const SECTION_HEADER_SIZE: usize = 40;
const DATA_DIR_ENTRY_SIZE: usize = 8;

/// Optional header flavor, discriminated by the magic field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeFormat {
    Pe32,
    Pe32Plus,
}

/// One row of the section table.
#[derive(Debug, Clone)]
pub struct SectionHeader {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
}

impl SectionHeader {
    #[must_use]
    pub fn name_str(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(8);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    /// File offset one past the section's raw data.
    #[must_use]
    pub fn raw_end(&self) -> usize {
        self.pointer_to_raw_data as usize + self.size_of_raw_data as usize
    }
}

/// Parsed header geometry. All offsets are absolute file offsets and have
/// been bounds-checked against the buffer at parse time.
#[derive(Debug, Clone, Copy)]
struct Layout {
    format: PeFormat,
    checksum_offset: usize,
    data_dir_offset: usize,
    num_data_dirs: usize,
    cert_dir_offset: usize,
    section_table_offset: usize,
    num_sections: usize,
    size_of_headers: usize,
    file_alignment: u32,
}

/// In-memory handle over a PE/COFF file.
#[derive(Debug)]
pub struct PeImage {
    bytes: Vec<u8>,
    layout: Layout,
    out_path: Option<PathBuf>,
    permissions: Option<fs::Permissions>,
}

fn read_u16(data: &[u8], offset: usize) -> Result<u16> {
    data.get(offset..offset + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| PesignError::MalformedImage(format!("truncated field at offset {offset:#x}")))
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| PesignError::MalformedImage(format!("truncated field at offset {offset:#x}")))
}

impl PeImage {
    /// Open a PE file read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)
            .map_err(|e| PesignError::IoFailure(format!("{}: {e}", path.display())))?;
        let permissions = fs::metadata(path).ok().map(|m| m.permissions());
        let mut image = Self::parse(bytes)?;
        image.permissions = permissions;
        Ok(image)
    }

    /// Parse a PE image from an owned buffer.
    pub fn parse(bytes: Vec<u8>) -> Result<Self> {
        let layout = Self::parse_layout(&bytes)?;
        Ok(PeImage {
            bytes,
            layout,
            out_path: None,
            permissions: None,
        })
    }

    fn parse_layout(data: &[u8]) -> Result<Layout> {
        if data.len() < 64 {
            return Err(PesignError::MalformedImage(format!(
                "file too small for a DOS header ({} bytes)",
                data.len()
            )));
        }
        if &data[0..2] != b"MZ" {
            return Err(PesignError::MalformedImage("missing MZ signature".into()));
        }

        let pe_offset = read_u32(data, E_LFANEW_OFFSET)? as usize;
        if pe_offset + 4 + COFF_HEADER_SIZE > data.len() {
            return Err(PesignError::MalformedImage(
                "PE header pointer out of range".into(),
            ));
        }
        if &data[pe_offset..pe_offset + 4] != b"PE\0\0" {
            return Err(PesignError::MalformedImage("missing PE signature".into()));
        }

        let coff_offset = pe_offset + 4;
        let num_sections = read_u16(data, coff_offset + 2)? as usize;
        let size_of_optional_header = read_u16(data, coff_offset + 16)? as usize;
        let opt_offset = coff_offset + COFF_HEADER_SIZE;

        let magic = read_u16(data, opt_offset)?;
        let format = match magic {
            PE32_MAGIC => PeFormat::Pe32,
            PE32PLUS_MAGIC => PeFormat::Pe32Plus,
            _ => {
                return Err(PesignError::MalformedImage(format!(
                    "unknown optional header magic {magic:#06x}"
                )))
            }
        };

        // The checksum sits at the same offset for both flavors; only the
        // data directory array moves.
        let checksum_offset = opt_offset + 64;
        let (data_dir_offset, num_dirs_offset) = match format {
            PeFormat::Pe32 => (opt_offset + 96, opt_offset + 92),
            PeFormat::Pe32Plus => (opt_offset + 112, opt_offset + 108),
        };

        let file_alignment = read_u32(data, opt_offset + 36)?;
        let size_of_headers = read_u32(data, opt_offset + 60)? as usize;
        let num_data_dirs = read_u32(data, num_dirs_offset)? as usize;

        if num_data_dirs <= CERT_TABLE_INDEX {
            return Err(PesignError::MalformedImage(format!(
                "image has {num_data_dirs} data directories; no certificate table entry"
            )));
        }
        if data_dir_offset + num_data_dirs * DATA_DIR_ENTRY_SIZE > data.len() {
            return Err(PesignError::MalformedImage(
                "data directory array out of range".into(),
            ));
        }
        let cert_dir_offset = data_dir_offset + CERT_TABLE_INDEX * DATA_DIR_ENTRY_SIZE;

        let section_table_offset = opt_offset + size_of_optional_header;
        let section_table_end = section_table_offset + num_sections * SECTION_HEADER_SIZE;
        if section_table_end > data.len() {
            return Err(PesignError::MalformedImage(
                "section table out of range".into(),
            ));
        }
        if size_of_headers > data.len() {
            return Err(PesignError::MalformedImage(format!(
                "SizeOfHeaders ({size_of_headers:#x}) exceeds file size ({:#x})",
                data.len()
            )));
        }
        if section_table_end > size_of_headers {
            return Err(PesignError::MalformedImage(
                "section table overflows SizeOfHeaders".into(),
            ));
        }

        let layout = Layout {
            format,
            checksum_offset,
            data_dir_offset,
            num_data_dirs,
            cert_dir_offset,
            section_table_offset,
            num_sections,
            size_of_headers,
            file_alignment,
        };

        Self::validate_sections(data, &layout)?;
        Self::validate_cert_dir(data, &layout)?;

        debug!(
            "parsed {:?} image: {} sections, headers {:#x}, checksum at {:#x}",
            format, num_sections, size_of_headers, checksum_offset
        );
        Ok(layout)
    }

    fn validate_sections(data: &[u8], layout: &Layout) -> Result<()> {
        for i in 0..layout.num_sections {
            let off = layout.section_table_offset + i * SECTION_HEADER_SIZE;
            let ptr = read_u32(data, off + 20)? as usize;
            let size = read_u32(data, off + 16)? as usize;
            if ptr > data.len() {
                return Err(PesignError::MalformedImage(format!(
                    "section {i} raw data starts past end of file ({ptr:#x})"
                )));
            }
            if ptr + size > data.len() {
                // Tolerated: the digester pads truncated sections on request.
                warn!(
                    "section {i} raw data runs past end of file ({:#x} > {:#x})",
                    ptr + size,
                    data.len()
                );
            }
        }
        Ok(())
    }

    fn validate_cert_dir(data: &[u8], layout: &Layout) -> Result<()> {
        let offset = read_u32(data, layout.cert_dir_offset)? as usize;
        let size = read_u32(data, layout.cert_dir_offset + 4)? as usize;
        if offset == 0 && size == 0 {
            return Ok(());
        }
        if offset % 8 != 0 {
            return Err(PesignError::MalformedImage(format!(
                "certificate table offset {offset:#x} is not 8-byte aligned"
            )));
        }
        let end = offset
            .checked_add(size)
            .ok_or_else(|| PesignError::MalformedImage("certificate table size overflow".into()))?;
        if end > data.len() {
            return Err(PesignError::MalformedImage(format!(
                "certificate table [{offset:#x}, {end:#x}) lies outside the file"
            )));
        }
        if end != data.len() {
            warn!(
                "certificate table does not end at EOF ({:#x} != {:#x})",
                end,
                data.len()
            );
        }
        Ok(())
    }

    /// Clone this image into a writable copy destined for `path`.
    ///
    /// Nothing is written to disk until [`PeImage::finalize`]; the existence
    /// check happens here so operations fail before any work is done.
    pub fn clone_to(&self, path: impl AsRef<Path>, force: bool) -> Result<PeImage> {
        let path = path.as_ref();
        if !force && path.exists() {
            return Err(PesignError::OutputExists(path.to_path_buf()));
        }
        Ok(PeImage {
            bytes: self.bytes.clone(),
            layout: self.layout,
            out_path: Some(path.to_path_buf()),
            permissions: self.permissions.clone(),
        })
    }

    /// Write the buffer to the output path set by [`PeImage::clone_to`].
    pub fn finalize(&self, force: bool) -> Result<()> {
        let path = self
            .out_path
            .as_deref()
            .ok_or_else(|| PesignError::IoFailure("image has no output path".into()))?;
        let mut opts = fs::OpenOptions::new();
        opts.write(true);
        if force {
            opts.create(true).truncate(true);
        } else {
            opts.create_new(true);
        }
        let mut file = opts.open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                PesignError::OutputExists(path.to_path_buf())
            } else {
                PesignError::IoFailure(format!("{}: {e}", path.display()))
            }
        })?;
        file.write_all(&self.bytes)
            .map_err(|e| PesignError::IoFailure(format!("{}: {e}", path.display())))?;
        if let Some(perm) = &self.permissions {
            let _ = fs::set_permissions(path, perm.clone());
        }
        Ok(())
    }

    #[must_use]
    pub fn out_path(&self) -> Option<&Path> {
        self.out_path.as_deref()
    }

    #[must_use]
    pub fn raw_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn format(&self) -> PeFormat {
        self.layout.format
    }

    #[must_use]
    pub fn checksum_offset(&self) -> usize {
        self.layout.checksum_offset
    }

    #[must_use]
    pub fn cert_dir_offset(&self) -> usize {
        self.layout.cert_dir_offset
    }

    #[must_use]
    pub fn size_of_headers(&self) -> usize {
        self.layout.size_of_headers
    }

    #[must_use]
    pub fn file_alignment(&self) -> u32 {
        self.layout.file_alignment
    }

    /// Read a data directory entry as `(offset, size)`.
    ///
    /// For index 4 the first field is a raw file offset, not an RVA.
    pub fn data_directory(&self, idx: usize) -> Result<(u32, u32)> {
        if idx >= self.layout.num_data_dirs {
            return Err(PesignError::MalformedImage(format!(
                "data directory index {idx} out of range ({} entries)",
                self.layout.num_data_dirs
            )));
        }
        let off = self.layout.data_dir_offset + idx * DATA_DIR_ENTRY_SIZE;
        Ok((read_u32(&self.bytes, off)?, read_u32(&self.bytes, off + 4)?))
    }

    pub fn set_data_directory(&mut self, idx: usize, offset: u32, size: u32) -> Result<()> {
        if idx >= self.layout.num_data_dirs {
            return Err(PesignError::MalformedImage(format!(
                "data directory index {idx} out of range ({} entries)",
                self.layout.num_data_dirs
            )));
        }
        let off = self.layout.data_dir_offset + idx * DATA_DIR_ENTRY_SIZE;
        self.bytes[off..off + 4].copy_from_slice(&offset.to_le_bytes());
        self.bytes[off + 4..off + 8].copy_from_slice(&size.to_le_bytes());
        Ok(())
    }

    /// Certificate table location, or `None` when the directory entry is
    /// `(0, 0)`.
    #[must_use]
    pub fn certificate_table(&self) -> Option<(usize, usize)> {
        // The entry's presence was validated at parse time.
        let off = self.layout.cert_dir_offset;
        let offset = u32::from_le_bytes(self.bytes[off..off + 4].try_into().unwrap()) as usize;
        let size = u32::from_le_bytes(self.bytes[off + 4..off + 8].try_into().unwrap()) as usize;
        if offset == 0 && size == 0 {
            None
        } else {
            Some((offset, size))
        }
    }

    pub fn section_iter(&self) -> impl Iterator<Item = SectionHeader> + '_ {
        (0..self.layout.num_sections).map(move |i| {
            let off = self.layout.section_table_offset + i * SECTION_HEADER_SIZE;
            let mut name = [0u8; 8];
            name.copy_from_slice(&self.bytes[off..off + 8]);
            SectionHeader {
                name,
                virtual_size: u32::from_le_bytes(self.bytes[off + 8..off + 12].try_into().unwrap()),
                virtual_address: u32::from_le_bytes(
                    self.bytes[off + 12..off + 16].try_into().unwrap(),
                ),
                size_of_raw_data: u32::from_le_bytes(
                    self.bytes[off + 16..off + 20].try_into().unwrap(),
                ),
                pointer_to_raw_data: u32::from_le_bytes(
                    self.bytes[off + 20..off + 24].try_into().unwrap(),
                ),
            }
        })
    }

    /// End of the loadable image: headers plus every section's raw data.
    /// Bytes past this point are overlay (trailing data) or certificates.
    #[must_use]
    pub fn end_of_image(&self) -> usize {
        let mut end = self.layout.size_of_headers;
        for section in self.section_iter() {
            end = end.max(section.raw_end());
        }
        end
    }

    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(data.len())
            .filter(|&e| e <= self.bytes.len())
            .ok_or_else(|| {
                PesignError::IoFailure(format!(
                    "write of {} bytes at {offset:#x} exceeds image size {:#x}",
                    data.len(),
                    self.bytes.len()
                ))
            })?;
        self.bytes[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Grow (zero-filled) or shrink the buffer to `new_len`.
    pub fn resize(&mut self, new_len: usize) {
        self.bytes.resize(new_len, 0);
    }

    pub fn truncate(&mut self, new_len: usize) {
        self.bytes.truncate(new_len);
    }

    pub fn set_checksum(&mut self, value: u32) {
        let off = self.layout.checksum_offset;
        self.bytes[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    #[must_use]
    pub fn checksum(&self) -> u32 {
        let off = self.layout.checksum_offset;
        u32::from_le_bytes(self.bytes[off..off + 4].try_into().unwrap())
    }

    /// Recompute and store the optional-header checksum.
    ///
    /// Sums little-endian 16-bit words with the checksum field treated as
    /// zero, folding into 16 bits after each addition, then adds the file
    /// length. Loaders for signed images ignore this field, so mutations
    /// normally leave it zeroed and callers opt into recomputation.
    pub fn update_checksum(&mut self) {
        let checksum_offset = self.layout.checksum_offset;
        let len = self.bytes.len();
        let mut sum: u32 = 0;
        let mut offset = 0;
        while offset + 1 < len {
            if offset != checksum_offset && offset != checksum_offset + 2 {
                let val = u32::from(u16::from_le_bytes([
                    self.bytes[offset],
                    self.bytes[offset + 1],
                ]));
                sum = sum.wrapping_add(val);
                sum = (sum & 0xFFFF) + (sum >> 16);
            }
            offset += 2;
        }
        if offset < len {
            sum = sum.wrapping_add(u32::from(self.bytes[offset]));
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        sum = (sum & 0xFFFF) + (sum >> 16);
        let checksum = sum.wrapping_add(len as u32);
        self.set_checksum(checksum);
    }
}
