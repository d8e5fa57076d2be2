//! dbheader reads the 100-byte header at the start of a database file.

use byteorder::{BigEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom};
use tracing::warn;

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("The magic bytes for this file are wrong.")]
    WrongMagic,
    #[error("The page size {0} is not a power of two in 512..=65536.")]
    InvalidPagesize(u32),
    #[error("The file format read/write version {0} is not 1 (legacy) or 2 (WAL).")]
    InvalidFileFormatVersion(u8),
    #[error("The text encoding value {0} is not 1 (UTF-8), 2 (UTF-16le) or 3 (UTF-16be).")]
    InvalidTextEncoding(u32),
    #[error("The payload fraction fields are not the required 64/32/32.")]
    InvalidPayloadFractions,
    #[error("The schema format number {0} is not in 1..=4.")]
    InvalidSchemaFormat(u32),
    #[error("A field value is invalid per the SQLite format spec: {0}")]
    Invalid(&'static str),
    #[error("Error reading file.")]
    ReadFailed,
}

/// Database text encoding, from header offset 56.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Utf16Le,
    Utf16Be,
}

impl std::fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            TextEncoding::Utf8 => write!(f, "UTF-8"),
            TextEncoding::Utf16Le => write!(f, "UTF-16le"),
            TextEncoding::Utf16Be => write!(f, "UTF-16be"),
        }
    }
}

impl TextEncoding {
    /// Decode raw TEXT bytes to a `String`, replacing invalid sequences.
    /// Forensic inputs are frequently damaged; decoding never fails.
    pub fn decode_lossy(&self, bytes: &[u8]) -> String {
        match self {
            TextEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            TextEncoding::Utf16Le | TextEncoding::Utf16Be => {
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|c| match self {
                        TextEncoding::Utf16Le => u16::from_le_bytes([c[0], c[1]]),
                        _ => u16::from_be_bytes([c[0], c[1]]),
                    })
                    .collect();
                String::from_utf16_lossy(&units)
            }
        }
    }
}

pub const SQLITE_DB_HEADER_BYTES: usize = 100;
const SQLITE3_MAGIC_STRING: &[u8] = &[
    0x53, 0x51, 0x4c, 0x69, 0x74, 0x65, 0x20, 0x66, 0x6f, 0x72, 0x6d, 0x61, 0x74, 0x20, 0x33, 0x00,
];

/// The database file header, all fields retained for reporting.
#[derive(Debug, Clone)]
pub struct DbHeader {
    pub page_size: u32,
    pub file_format_write_version: u8,
    pub file_format_read_version: u8,
    pub reserved_bytes_per_page: u8,
    pub change_counter: u32,
    /// The in-header database size in pages. Zero in files written before
    /// SQLite 3.7.0; callers fall back to the file size.
    pub database_size_in_pages: u32,
    pub first_freelist_trunk_page: u32,
    pub freelist_page_count: u32,
    pub schema_cookie: u32,
    pub schema_format: u32,
    pub default_page_cache_size: u32,
    pub largest_root_btree_page: u32,
    pub text_encoding: TextEncoding,
    pub user_version: u32,
    pub incremental_vacuum_mode: u32,
    pub application_id: u32,
    pub version_valid_for: u32,
    pub sqlite_version_number: u32,
}

impl DbHeader {
    /// Usable bytes per page, excluding the reserved region at the tail.
    pub fn usable_page_size(&self) -> usize {
        self.page_size as usize - self.reserved_bytes_per_page as usize
    }
}

pub fn parse_header_bytes(bytes: &[u8], strict: bool) -> Result<DbHeader, Error> {
    if bytes.len() < SQLITE_DB_HEADER_BYTES {
        return Err(Error::ReadFailed);
    }
    let mut c = Cursor::new(bytes);
    parse_header(&mut c, strict)
}

pub fn parse_header<R: Read + Seek>(f: &mut R, strict: bool) -> Result<DbHeader, Error> {
    f.seek(SeekFrom::Start(0)).map_err(|_| Error::ReadFailed)?;

    // Offset	Size	Description
    // 0        16	    The header string: "SQLite format 3\000"
    let mut magic = [0; 16];
    f.read_exact(&mut magic).map_err(|_| Error::ReadFailed)?;
    if magic != SQLITE3_MAGIC_STRING {
        return Err(Error::WrongMagic);
    }

    // 16	    2	    The database page size in bytes. A power of two between 512
    //                  and 32768 inclusive, or the value 1 representing 65536.
    let page_size = match f.read_u16::<BigEndian>().map_err(|_| Error::ReadFailed)? {
        1 => 65536_u32,
        x if (512..=32768).contains(&x) && x.is_power_of_two() => x as u32,
        x => return Err(Error::InvalidPagesize(x as u32)),
    };

    // 18	    1	    File format write version. 1 for legacy; 2 for WAL.
    // 19	    1	    File format read version. 1 for legacy; 2 for WAL.
    let file_format_write_version = f.read_u8().map_err(|_| Error::ReadFailed)?;
    let file_format_read_version = f.read_u8().map_err(|_| Error::ReadFailed)?;
    for v in [file_format_write_version, file_format_read_version] {
        if v != 1 && v != 2 {
            if strict {
                return Err(Error::InvalidFileFormatVersion(v));
            }
            warn!(component = "dbheader", version = v, "unexpected file format version");
        }
    }

    // 20	    1	    Bytes of unused "reserved" space at the end of each page.
    // 21	    1	    Maximum embedded payload fraction. Must be 64.
    // 22	    1	    Minimum embedded payload fraction. Must be 32.
    // 23	    1	    Leaf payload fraction. Must be 32.
    let reserved_bytes_per_page = f.read_u8().map_err(|_| Error::ReadFailed)?;
    let max_fraction = f.read_u8().map_err(|_| Error::ReadFailed)?;
    let min_fraction = f.read_u8().map_err(|_| Error::ReadFailed)?;
    let leaf_fraction = f.read_u8().map_err(|_| Error::ReadFailed)?;
    if (max_fraction, min_fraction, leaf_fraction) != (0x40, 0x20, 0x20) {
        if strict {
            return Err(Error::InvalidPayloadFractions);
        }
        warn!(component = "dbheader", "unexpected payload fraction fields");
    }

    // 24	    4	    File change counter.
    // 28	    4	    Size of the database file in pages ("in-header database size").
    // 32	    4	    Page number of the first freelist trunk page.
    // 36	    4	    Total number of freelist pages.
    // 40	    4	    The schema cookie.
    // 44	    4	    The schema format number. Supported formats are 1, 2, 3, 4.
    let change_counter = f.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)?;
    let database_size_in_pages = f.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)?;
    let first_freelist_trunk_page = f.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)?;
    let freelist_page_count = f.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)?;
    let schema_cookie = f.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)?;
    let schema_format = f.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)?;
    if !(1..=4).contains(&schema_format) && schema_format != 0 {
        if strict {
            return Err(Error::InvalidSchemaFormat(schema_format));
        }
        warn!(component = "dbheader", schema_format, "unexpected schema format number");
    }

    // 48	    4	    Default page cache size.
    // 52	    4	    Page number of the largest root b-tree page when in
    //                  auto/incremental-vacuum modes, zero otherwise.
    // 56	    4	    The database text encoding. 1 UTF-8, 2 UTF-16le, 3 UTF-16be.
    // 60	    4	    The "user version" (user_version pragma).
    // 64	    4	    Non-zero for incremental-vacuum mode.
    // 68	    4	    The "Application ID" (application_id pragma).
    let default_page_cache_size = f.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)?;
    let largest_root_btree_page = f.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)?;
    let text_encoding = match f.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)? {
        1 => TextEncoding::Utf8,
        2 => TextEncoding::Utf16Le,
        3 => TextEncoding::Utf16Be,
        // An all-zero field shows up in never-written databases; treat it as UTF-8.
        0 => TextEncoding::Utf8,
        x => return Err(Error::InvalidTextEncoding(x)),
    };
    let user_version = f.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)?;
    let incremental_vacuum_mode = f.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)?;
    let application_id = f.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)?;

    // 72	    20	    Reserved for expansion. Must be zero.
    let mut reserved = [0; 20];
    f.read_exact(&mut reserved).map_err(|_| Error::ReadFailed)?;
    if reserved != [0; 20] {
        if strict {
            return Err(Error::Invalid("reserved expansion bytes are not zero"));
        }
        warn!(component = "dbheader", "reserved expansion bytes are not zero");
    }

    // 92	    4	    The version-valid-for number.
    // 96	    4	    SQLITE_VERSION_NUMBER of the writing library.
    let version_valid_for = f.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)?;
    let sqlite_version_number = f.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)?;

    Ok(DbHeader {
        page_size,
        file_format_write_version,
        file_format_read_version,
        reserved_bytes_per_page,
        change_counter,
        database_size_in_pages,
        first_freelist_trunk_page,
        freelist_page_count,
        schema_cookie,
        schema_format,
        default_page_cache_size,
        largest_root_btree_page,
        text_encoding,
        user_version,
        incremental_vacuum_mode,
        application_id,
        version_valid_for,
        sqlite_version_number,
    })
}

#[cfg(test)]
pub(crate) fn build_test_header(page_size: u32, database_size_in_pages: u32) -> Vec<u8> {
    let mut h = vec![0_u8; SQLITE_DB_HEADER_BYTES];
    h[..16].copy_from_slice(SQLITE3_MAGIC_STRING);
    let ps_field: u16 = if page_size == 65536 { 1 } else { page_size as u16 };
    h[16..18].copy_from_slice(&ps_field.to_be_bytes());
    h[18] = 1; // write version
    h[19] = 1; // read version
    h[21] = 0x40;
    h[22] = 0x20;
    h[23] = 0x20;
    h[28..32].copy_from_slice(&database_size_in_pages.to_be_bytes());
    h[44..48].copy_from_slice(&4_u32.to_be_bytes()); // schema format
    h[56..60].copy_from_slice(&1_u32.to_be_bytes()); // UTF-8
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_header() {
        let bytes = build_test_header(0x1000, 2);
        let h = parse_header_bytes(&bytes, true).unwrap();
        assert_eq!(h.page_size, 4096);
        assert_eq!(h.database_size_in_pages, 2);
        assert_eq!(h.text_encoding, TextEncoding::Utf8);
        assert_eq!(h.reserved_bytes_per_page, 0);
        assert_eq!(h.usable_page_size(), 4096);
    }

    #[test]
    fn test_wrong_magic_rejected() {
        let mut bytes = build_test_header(4096, 1);
        bytes[0] = b'X';
        assert!(matches!(parse_header_bytes(&bytes, true), Err(Error::WrongMagic)));
    }

    #[test]
    fn test_page_size_one_means_64k() {
        let bytes = build_test_header(65536, 1);
        assert_eq!(parse_header_bytes(&bytes, true).unwrap().page_size, 65536);
    }

    #[test]
    fn test_invalid_page_size_rejected() {
        let mut bytes = build_test_header(4096, 1);
        bytes[16..18].copy_from_slice(&1000_u16.to_be_bytes());
        assert!(matches!(
            parse_header_bytes(&bytes, true),
            Err(Error::InvalidPagesize(1000))
        ));
    }

    #[test]
    fn test_bad_fractions_strict_vs_lenient() {
        let mut bytes = build_test_header(4096, 1);
        bytes[21] = 0x41;
        assert!(parse_header_bytes(&bytes, true).is_err());
        assert!(parse_header_bytes(&bytes, false).is_ok());
    }

    #[test]
    fn test_invalid_text_encoding_rejected() {
        let mut bytes = build_test_header(4096, 1);
        bytes[56..60].copy_from_slice(&9_u32.to_be_bytes());
        assert!(matches!(
            parse_header_bytes(&bytes, true),
            Err(Error::InvalidTextEncoding(9))
        ));
    }

    #[test]
    fn test_short_buffer_rejected() {
        assert!(parse_header_bytes(&[0_u8; 50], true).is_err());
    }
}
