//! header reads the header of a b-tree page.
//! A b-tree page is divided into regions in the following order
//! 1. The 100-byte database file header (found on page 1 only)
//! 2. The 8 or 12 byte b-tree page header
//! 3. The cell pointer array
//! 4. Unallocated space
//! 5. The cell content area
//! 6. The reserved region

use byteorder::{BigEndian, ReadBytesExt};
use std::io::{Cursor, Seek, SeekFrom};

use super::{BTreePageType, Error};
use crate::database::PageNum;

#[derive(Debug, Clone)]
pub struct BTreePageHeader {
    pub page_type: BTreePageType,
    /// Offset of the first freeblock, or zero when there are none.
    pub first_freeblock: u16,
    pub cell_count: u16,
    pub cell_content_start: u32,
    pub fragmented_bytes: u8,
    pub rightmost_pointer: Option<u32>,
}

pub fn parse(page: &[u8], page_number: PageNum, header_offset: usize) -> Result<BTreePageHeader, Error> {
    if page.len() < header_offset + 8 {
        return Err(Error::PageTooShort { page: page_number });
    }
    let mut c = Cursor::new(page);
    c.seek(SeekFrom::Start(header_offset as u64))
        .map_err(|_| Error::PageTooShort { page: page_number })?;

    // Offset	Size	Description
    // 0	1	The one-byte flag indicating the b-tree page type.
    let flag = c.read_u8().map_err(|_| Error::PageTooShort { page: page_number })?;
    let page_type = BTreePageType::from_flag(flag)
        .ok_or(Error::InvalidPageType { page: page_number, flag })?;

    // 1	2	Start of the first freeblock, or zero if there are none.
    let first_freeblock = c
        .read_u16::<BigEndian>()
        .map_err(|_| Error::PageTooShort { page: page_number })?;
    // 3	2	The number of cells on the page.
    let cell_count = c
        .read_u16::<BigEndian>()
        .map_err(|_| Error::PageTooShort { page: page_number })?;
    // 5	2	Start of the cell content area. Zero is interpreted as 65536.
    let cell_content_start = match c
        .read_u16::<BigEndian>()
        .map_err(|_| Error::PageTooShort { page: page_number })?
    {
        0 => 65536,
        x => x as u32,
    };
    // 7	1	The number of fragmented free bytes within the cell content area.
    let fragmented_bytes = c.read_u8().map_err(|_| Error::PageTooShort { page: page_number })?;
    // 8	4	The right-most pointer. Interior pages only.
    let rightmost_pointer = match page_type {
        BTreePageType::IndexInterior | BTreePageType::TableInterior => {
            if page.len() < header_offset + 12 {
                return Err(Error::PageTooShort { page: page_number });
            }
            Some(
                c.read_u32::<BigEndian>()
                    .map_err(|_| Error::PageTooShort { page: page_number })?,
            )
        }
        BTreePageType::IndexLeaf | BTreePageType::TableLeaf => None,
    };

    Ok(BTreePageHeader {
        page_type,
        first_freeblock,
        cell_count,
        cell_content_start,
        fragmented_bytes,
        rightmost_pointer,
    })
}
