use std::io::{self, Read, Seek, SeekFrom};

use thiserror::Error;

const DOS_MAGIC: &[u8; 2] = b"MZ";
const PE_SIGNATURE: &[u8; 4] = b"PE\0\0";
const DOS_HEADER_LEN: usize = 64;
const LFANEW_OFFSET: usize = 0x3C;
const COFF_HEADER_LEN: usize = 20;
const SECTION_HEADER_LEN: usize = 40;
const PE32_MAGIC: u16 = 0x10b;
const PE32_PLUS_MAGIC: u16 = 0x20b;
const CLI_HEADER_DIRECTORY: usize = 14;
const DATA_DIRECTORY_LEN: usize = 8;
const MAX_SECTIONS: u16 = 96;

#[derive(Debug, Error)]
pub enum PeError {
    #[error("i/o error reading image: {0}")]
    Io(#[from] io::Error),
    #[error("missing MZ signature")]
    NotDosImage,
    #[error("missing PE signature")]
    NotPeImage,
    #[error("unknown optional header magic {0:#x}")]
    UnknownMagic(u16),
    #[error("malformed image: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataDirectory {
    pub rva: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Section {
    virtual_address: u32,
    virtual_size: u32,
    raw_size: u32,
    raw_pointer: u32,
}

/// The subset of PE/COFF headers needed to tell managed images from native ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeHeaders {
    pub machine: u16,
    pub pe32_plus: bool,
    pub cli_header: Option<DataDirectory>,
    cli_header_offset: Option<u64>,
}

impl PeHeaders {
    pub fn read<R: Read + Seek>(reader: &mut R) -> Result<Self, PeError> {
        let mut dos = [0u8; DOS_HEADER_LEN];
        read_exact_or_malformed(reader, &mut dos, "truncated DOS header")?;
        if &dos[..2] != DOS_MAGIC {
            return Err(PeError::NotDosImage);
        }
        let lfanew = le_u32(&dos, LFANEW_OFFSET);

        reader.seek(SeekFrom::Start(u64::from(lfanew)))?;
        let mut signature = [0u8; 4];
        read_exact_or_malformed(reader, &mut signature, "truncated PE signature")?;
        if &signature != PE_SIGNATURE {
            return Err(PeError::NotPeImage);
        }

        let mut coff = [0u8; COFF_HEADER_LEN];
        read_exact_or_malformed(reader, &mut coff, "truncated COFF header")?;
        let machine = le_u16(&coff, 0);
        let section_count = le_u16(&coff, 2);
        let optional_len = le_u16(&coff, 16) as usize;
        if section_count > MAX_SECTIONS {
            return Err(PeError::Malformed("too many sections"));
        }
        if optional_len < 2 {
            return Err(PeError::Malformed("optional header too small"));
        }

        let mut optional = vec![0u8; optional_len];
        read_exact_or_malformed(reader, &mut optional, "truncated optional header")?;
        let (pe32_plus, rva_count_at, directories_at) = match le_u16(&optional, 0) {
            PE32_MAGIC => (false, 92, 96),
            PE32_PLUS_MAGIC => (true, 108, 112),
            other => return Err(PeError::UnknownMagic(other)),
        };
        if optional.len() < directories_at {
            return Err(PeError::Malformed("optional header too small"));
        }
        let rva_count = le_u32(&optional, rva_count_at) as usize;
        let cli_at = directories_at + CLI_HEADER_DIRECTORY * DATA_DIRECTORY_LEN;
        let cli_header = if rva_count > CLI_HEADER_DIRECTORY
            && optional.len() >= cli_at + DATA_DIRECTORY_LEN
        {
            let directory = DataDirectory {
                rva: le_u32(&optional, cli_at),
                size: le_u32(&optional, cli_at + 4),
            };
            (directory.rva != 0 && directory.size != 0).then_some(directory)
        } else {
            None
        };

        let mut sections = Vec::with_capacity(section_count as usize);
        for _ in 0..section_count {
            let mut raw = [0u8; SECTION_HEADER_LEN];
            read_exact_or_malformed(reader, &mut raw, "truncated section table")?;
            sections.push(Section {
                virtual_size: le_u32(&raw, 8),
                virtual_address: le_u32(&raw, 12),
                raw_size: le_u32(&raw, 16),
                raw_pointer: le_u32(&raw, 20),
            });
        }

        let cli_header_offset = cli_header.and_then(|dir| rva_to_offset(&sections, dir.rva));
        Ok(Self {
            machine,
            pe32_plus,
            cli_header,
            cli_header_offset,
        })
    }

    /// File offset of the CLI header, or -1 when it cannot be located.
    pub fn cor_header_start_offset(&self) -> i64 {
        self.cli_header_offset
            .and_then(|offset| i64::try_from(offset).ok())
            .unwrap_or(-1)
    }

    pub fn is_managed(&self) -> bool {
        self.cli_header.is_some() && self.cor_header_start_offset() >= 0
    }
}

fn rva_to_offset(sections: &[Section], rva: u32) -> Option<u64> {
    sections.iter().find_map(|section| {
        let span = section.virtual_size.max(section.raw_size);
        let start = section.virtual_address;
        let end = start.checked_add(span)?;
        (rva >= start && rva < end)
            .then(|| u64::from(section.raw_pointer) + u64::from(rva - start))
    })
}

fn read_exact_or_malformed<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    what: &'static str,
) -> Result<(), PeError> {
    reader.read_exact(buf).map_err(|err| match err.kind() {
        io::ErrorKind::UnexpectedEof => PeError::Malformed(what),
        _ => PeError::Io(err),
    })
}

fn le_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn managed_image_exposes_cli_header_offset() {
        let headers = PeHeaders::read(&mut Cursor::new(fixture::image(true))).expect("parse");
        assert_eq!(headers.machine, 0x14c);
        assert!(!headers.pe32_plus);
        assert_eq!(headers.cor_header_start_offset(), 0x208);
        assert!(headers.is_managed());
    }

    #[test]
    fn native_image_has_negative_offset() {
        let headers = PeHeaders::read(&mut Cursor::new(fixture::image(false))).expect("parse");
        assert!(headers.cli_header.is_none());
        assert_eq!(headers.cor_header_start_offset(), -1);
        assert!(!headers.is_managed());
    }

    #[test]
    fn unmapped_cli_header_is_not_managed() {
        let mut image = fixture::image(true);
        let cli = 0x80 + 4 + 20 + 96 + 14 * 8;
        image[cli..cli + 4].copy_from_slice(&0x9000u32.to_le_bytes());
        let headers = PeHeaders::read(&mut Cursor::new(image)).expect("parse");
        assert!(headers.cli_header.is_some());
        assert_eq!(headers.cor_header_start_offset(), -1);
        assert!(!headers.is_managed());
    }

    #[test]
    fn rejects_non_images() {
        let err = PeHeaders::read(&mut Cursor::new(b"#!/bin/sh\necho hi\n".repeat(8)))
            .expect_err("not a PE");
        assert!(matches!(err, PeError::NotDosImage));

        let mut image = fixture::image(true);
        image[0x80] = b'X';
        let err = PeHeaders::read(&mut Cursor::new(image)).expect_err("bad signature");
        assert!(matches!(err, PeError::NotPeImage));

        let err = PeHeaders::read(&mut Cursor::new(b"MZ".to_vec())).expect_err("truncated");
        assert!(matches!(err, PeError::Malformed(_)));
    }
}
