//! page decodes one b-tree page: the cell pointer array, the cells
//! themselves (following overflow chains), the freeblock chain and the
//! unallocated region between the pointer array and the cell content.

use byteorder::{BigEndian, ByteOrder};
use std::borrow::Cow;
use std::collections::HashSet;
use tracing::warn;

use super::header::{self, BTreePageHeader};
use super::{BTreePageType, Error, PageKind, PageSource};
use crate::database::PageNum;
use crate::varint;

/// One entry of a page's freeblock chain.
///
/// A freeblock begins with `[next_offset:u16][size:u16]`; `size` includes
/// the 4-byte header. Reallocation consumes bytes from the tail, so the
/// middle of a freeblock is where residue of the previous occupant
/// survives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Freeblock {
    /// Position in the freeblock chain, 0-based.
    pub index: usize,
    /// Page-relative offset of the freeblock header.
    pub start_offset: usize,
    pub next_offset: u16,
    pub byte_size: u16,
}

impl Freeblock {
    /// The byte range past the 4-byte header, where residue can live.
    pub fn content_range(&self) -> (usize, usize) {
        (self.start_offset + 4, self.start_offset + self.byte_size as usize)
    }
}

#[derive(Debug, Clone)]
pub struct TableLeafCell<'a> {
    pub start_offset: usize,
    /// Bytes the cell occupies on this page, overflow pointer included.
    pub bytes_on_page: usize,
    pub row_id: i64,
    pub payload_size: i64,
    pub overflow_first_page: Option<PageNum>,
    /// The full payload; reassembled across overflow pages when spilled.
    pub payload: Cow<'a, [u8]>,
}

#[derive(Debug, Clone, Copy)]
pub struct TableInteriorCell {
    pub start_offset: usize,
    pub bytes_on_page: usize,
    pub left_child_page: PageNum,
    pub row_id: i64,
}

#[derive(Debug, Clone)]
pub struct IndexLeafCell<'a> {
    pub start_offset: usize,
    pub bytes_on_page: usize,
    pub payload_size: i64,
    pub overflow_first_page: Option<PageNum>,
    pub payload: Cow<'a, [u8]>,
}

#[derive(Debug, Clone)]
pub struct IndexInteriorCell<'a> {
    pub start_offset: usize,
    pub bytes_on_page: usize,
    pub left_child_page: PageNum,
    pub payload_size: i64,
    pub overflow_first_page: Option<PageNum>,
    pub payload: Cow<'a, [u8]>,
}

/// The four cell shapes, matching the four b-tree page types.
#[derive(Debug, Clone)]
pub enum Cell<'a> {
    TableLeaf(TableLeafCell<'a>),
    TableInterior(TableInteriorCell),
    IndexLeaf(IndexLeafCell<'a>),
    IndexInterior(IndexInteriorCell<'a>),
}

impl<'a> Cell<'a> {
    pub fn start_offset(&self) -> usize {
        match self {
            Cell::TableLeaf(c) => c.start_offset,
            Cell::TableInterior(c) => c.start_offset,
            Cell::IndexLeaf(c) => c.start_offset,
            Cell::IndexInterior(c) => c.start_offset,
        }
    }

    pub fn bytes_on_page(&self) -> usize {
        match self {
            Cell::TableLeaf(c) => c.bytes_on_page,
            Cell::TableInterior(c) => c.bytes_on_page,
            Cell::IndexLeaf(c) => c.bytes_on_page,
            Cell::IndexInterior(c) => c.bytes_on_page,
        }
    }
}

/// A decoded b-tree page borrowing the page bytes.
pub struct BTreePage<'a> {
    bytes: &'a [u8],
    page_number: PageNum,
    header_offset: usize,
    header: BTreePageHeader,
    usable_size: usize,
    strict: bool,
}

impl<'a> BTreePage<'a> {
    pub fn parse(
        bytes: &'a [u8],
        page_number: PageNum,
        usable_size: usize,
        strict: bool,
    ) -> Result<BTreePage<'a>, Error> {
        let header_offset = super::btree_start_offset(page_number);
        let header = header::parse(bytes, page_number, header_offset)?;
        Ok(BTreePage {
            bytes,
            page_number,
            header_offset,
            header,
            usable_size,
            strict,
        })
    }

    pub fn page_number(&self) -> PageNum {
        self.page_number
    }

    pub fn page_type(&self) -> BTreePageType {
        self.header.page_type
    }

    pub fn header(&self) -> &BTreePageHeader {
        &self.header
    }

    pub fn cell_count(&self) -> usize {
        self.header.cell_count as usize
    }

    pub fn fragmented_bytes(&self) -> u8 {
        self.header.fragmented_bytes
    }

    fn cell_pointer_array_start(&self) -> usize {
        self.header_offset + self.header.page_type.header_size()
    }

    fn cell_pointer_array_end(&self) -> usize {
        self.cell_pointer_array_start() + 2 * self.cell_count()
    }

    /// The cell pointer array: page-relative cell start offsets, in key
    /// order (which addresses cells from the page tail toward the header).
    pub fn cell_pointers(&self) -> Result<Vec<usize>, Error> {
        let start = self.cell_pointer_array_start();
        let end = self.cell_pointer_array_end();
        if end > self.bytes.len() {
            return Err(Error::PageTooShort { page: self.page_number });
        }
        let mut pointers = Vec::with_capacity(self.cell_count());
        for i in 0..self.cell_count() {
            let off = BigEndian::read_u16(&self.bytes[start + 2 * i..]) as usize;
            if off < self.cell_pointer_array_end() || off >= self.usable_size {
                if self.strict {
                    return Err(Error::CellPointerOutOfRange {
                        page: self.page_number,
                        offset: off,
                    });
                }
                warn!(
                    component = "btree",
                    page = self.page_number,
                    offset = off,
                    "cell pointer outside the content area, skipping"
                );
                continue;
            }
            pointers.push(off);
        }
        Ok(pointers)
    }

    /// The range between the end of the cell pointer array and the start of
    /// the cell content area. Deleted-record residue accumulates here.
    pub fn unallocated_range(&self) -> (usize, usize) {
        let start = self.cell_pointer_array_end().min(self.usable_size);
        let end = (self.header.cell_content_start as usize)
            .min(self.usable_size)
            .max(start);
        (start, end)
    }

    pub fn unallocated_bytes(&self) -> &'a [u8] {
        let (start, end) = self.unallocated_range();
        &self.bytes[start..end]
    }

    /// Walk the freeblock chain from the page header.
    ///
    /// The chain must be ascending; a backward or out-of-range link ends the
    /// walk (fatal in strict mode).
    pub fn freeblocks(&self) -> Result<Vec<Freeblock>, Error> {
        let mut blocks = Vec::new();
        let mut offset = self.header.first_freeblock as usize;
        while offset != 0 {
            if offset + 4 > self.usable_size {
                if self.strict {
                    return Err(Error::FreeblockChainInvalid {
                        page: self.page_number,
                        offset,
                    });
                }
                warn!(
                    component = "btree",
                    page = self.page_number,
                    offset,
                    "freeblock header reaches past the usable page, stopping chain walk"
                );
                break;
            }
            let next_offset = BigEndian::read_u16(&self.bytes[offset..]);
            let byte_size = BigEndian::read_u16(&self.bytes[offset + 2..]);
            if (byte_size as usize) < 4 || offset + byte_size as usize > self.usable_size {
                if self.strict {
                    return Err(Error::FreeblockChainInvalid {
                        page: self.page_number,
                        offset,
                    });
                }
                warn!(
                    component = "btree",
                    page = self.page_number,
                    offset,
                    size = byte_size,
                    "freeblock size out of range, stopping chain walk"
                );
                break;
            }
            blocks.push(Freeblock {
                index: blocks.len(),
                start_offset: offset,
                next_offset,
                byte_size,
            });
            let next = next_offset as usize;
            if next != 0 && next <= offset {
                if self.strict {
                    return Err(Error::FreeblockChainInvalid {
                        page: self.page_number,
                        offset: next,
                    });
                }
                warn!(
                    component = "btree",
                    page = self.page_number,
                    offset = next,
                    "freeblock chain runs backward, stopping chain walk"
                );
                break;
            }
            offset = next;
        }
        Ok(blocks)
    }

    /// Decode every cell on the page, resolving overflow through `source`.
    ///
    /// In lenient mode a cell that fails to parse is logged and skipped; in
    /// strict mode it fails the page.
    pub fn cells<S: PageSource>(&self, source: &S) -> Result<Vec<Cell<'a>>, Error> {
        let mut cells = Vec::with_capacity(self.cell_count());
        let mut last_offset: Option<usize> = None;
        for offset in self.cell_pointers()? {
            if let Some(prev) = last_offset {
                if offset >= prev {
                    if self.strict {
                        return Err(Error::CellPointersNotDescending { page: self.page_number });
                    }
                    warn!(
                        component = "btree",
                        page = self.page_number,
                        offset,
                        "cell pointers are not monotonically decreasing"
                    );
                }
            }
            last_offset = Some(offset);
            match self.cell_at(offset, source) {
                Ok(cell) => cells.push(cell),
                Err(e) if self.strict => return Err(e),
                Err(e) => {
                    warn!(
                        component = "btree",
                        page = self.page_number,
                        offset,
                        error = %e,
                        "failed to parse cell, skipping"
                    );
                }
            }
        }
        Ok(cells)
    }

    /// Decode the cell at a page-relative offset.
    pub fn cell_at<S: PageSource>(&self, offset: usize, source: &S) -> Result<Cell<'a>, Error> {
        match self.header.page_type {
            BTreePageType::TableLeaf => self.table_leaf_cell_at(offset, source).map(Cell::TableLeaf),
            BTreePageType::TableInterior => {
                self.table_interior_cell_at(offset).map(Cell::TableInterior)
            }
            BTreePageType::IndexLeaf => self.index_leaf_cell_at(offset, source).map(Cell::IndexLeaf),
            BTreePageType::IndexInterior => {
                self.index_interior_cell_at(offset, source).map(Cell::IndexInterior)
            }
        }
    }

    fn read_varint_at(&self, offset: usize) -> Result<(i64, usize), Error> {
        varint::decode(&self.bytes[..self.usable_size.min(self.bytes.len())], offset).map_err(|e| {
            Error::Varint {
                page: self.page_number,
                offset,
                source: e,
            }
        })
    }

    // Table B-Tree Leaf Cell (page flag 0x0d):
    //   payload size varint | rowid varint | local payload | overflow page u32?
    fn table_leaf_cell_at<S: PageSource>(
        &self,
        offset: usize,
        source: &S,
    ) -> Result<TableLeafCell<'a>, Error> {
        let (payload_size, n1) = self.read_varint_at(offset)?;
        let (row_id, n2) = self.read_varint_at(offset + n1)?;
        if payload_size < 0 {
            return Err(self.cell_error(offset, "negative payload size"));
        }
        let payload_start = offset + n1 + n2;
        let (local, spilled) =
            local_payload_size(payload_size as usize, self.usable_size, true);
        let (payload, overflow_first_page, trailer) = self.payload_at(
            payload_start,
            payload_size as usize,
            local,
            spilled,
            source,
        )?;
        Ok(TableLeafCell {
            start_offset: offset,
            bytes_on_page: n1 + n2 + local + trailer,
            row_id,
            payload_size,
            overflow_first_page,
            payload,
        })
    }

    // Table B-Tree Interior Cell (page flag 0x05):
    //   left child page u32 | rowid varint
    fn table_interior_cell_at(&self, offset: usize) -> Result<TableInteriorCell, Error> {
        if offset + 4 > self.usable_size {
            return Err(self.cell_error(offset, "left child pointer past page end"));
        }
        let left_child_page = BigEndian::read_u32(&self.bytes[offset..]);
        let (row_id, n) = self.read_varint_at(offset + 4)?;
        Ok(TableInteriorCell {
            start_offset: offset,
            bytes_on_page: 4 + n,
            left_child_page,
            row_id,
        })
    }

    // Index B-Tree Leaf Cell (page flag 0x0a):
    //   payload size varint | local payload | overflow page u32?
    fn index_leaf_cell_at<S: PageSource>(
        &self,
        offset: usize,
        source: &S,
    ) -> Result<IndexLeafCell<'a>, Error> {
        let (payload_size, n1) = self.read_varint_at(offset)?;
        if payload_size < 0 {
            return Err(self.cell_error(offset, "negative payload size"));
        }
        let (local, spilled) =
            local_payload_size(payload_size as usize, self.usable_size, false);
        let (payload, overflow_first_page, trailer) =
            self.payload_at(offset + n1, payload_size as usize, local, spilled, source)?;
        Ok(IndexLeafCell {
            start_offset: offset,
            bytes_on_page: n1 + local + trailer,
            payload_size,
            overflow_first_page,
            payload,
        })
    }

    // Index B-Tree Interior Cell (page flag 0x02):
    //   left child page u32 | payload size varint | local payload | overflow page u32?
    fn index_interior_cell_at<S: PageSource>(
        &self,
        offset: usize,
        source: &S,
    ) -> Result<IndexInteriorCell<'a>, Error> {
        if offset + 4 > self.usable_size {
            return Err(self.cell_error(offset, "left child pointer past page end"));
        }
        let left_child_page = BigEndian::read_u32(&self.bytes[offset..]);
        let (payload_size, n1) = self.read_varint_at(offset + 4)?;
        if payload_size < 0 {
            return Err(self.cell_error(offset, "negative payload size"));
        }
        let (local, spilled) =
            local_payload_size(payload_size as usize, self.usable_size, false);
        let (payload, overflow_first_page, trailer) =
            self.payload_at(offset + 4 + n1, payload_size as usize, local, spilled, source)?;
        Ok(IndexInteriorCell {
            start_offset: offset,
            bytes_on_page: 4 + n1 + local + trailer,
            left_child_page,
            payload_size,
            overflow_first_page,
            payload,
        })
    }

    /// Collect `payload_size` payload bytes starting at `start`, following
    /// the overflow chain when the cell spilled. Returns the payload, the
    /// first overflow page if any, and the on-page trailer size (4 for the
    /// overflow pointer, else 0).
    fn payload_at<S: PageSource>(
        &self,
        start: usize,
        payload_size: usize,
        local: usize,
        spilled: bool,
        source: &S,
    ) -> Result<(Cow<'a, [u8]>, Option<PageNum>, usize), Error> {
        if start + local > self.usable_size {
            return Err(self.cell_error(start, "local payload reaches past the usable page"));
        }
        if !spilled {
            return Ok((Cow::Borrowed(&self.bytes[start..start + local]), None, 0));
        }
        if start + local + 4 > self.usable_size {
            return Err(self.cell_error(start, "overflow pointer reaches past the usable page"));
        }
        let first_overflow = BigEndian::read_u32(&self.bytes[start + local..]);
        if first_overflow == 0 {
            return Err(self.cell_error(start, "spilled cell has a zero overflow page number"));
        }
        let mut payload = Vec::with_capacity(payload_size);
        payload.extend_from_slice(&self.bytes[start..start + local]);
        read_overflow_chain(source, first_overflow, payload_size - local, &mut payload)?;
        Ok((Cow::Owned(payload), Some(first_overflow), 4))
    }

    fn cell_error(&self, offset: usize, reason: &str) -> Error {
        Error::CellParsing {
            page: self.page_number,
            offset,
            reason: reason.to_string(),
        }
    }

    /// Gaps inside the cell content area covered by neither a live cell nor
    /// a freeblock. These are the fragments counted by the page header's
    /// fragmented-bytes field.
    pub fn fragments(&self, cells: &[Cell]) -> Result<Vec<(usize, usize)>, Error> {
        let content_start = (self.header.cell_content_start as usize).min(self.usable_size);
        let mut covered: Vec<(usize, usize)> = cells
            .iter()
            .map(|c| (c.start_offset(), c.start_offset() + c.bytes_on_page()))
            .collect();
        for fb in self.freeblocks()? {
            covered.push((fb.start_offset, fb.start_offset + fb.byte_size as usize));
        }
        covered.sort_unstable();
        let mut gaps = Vec::new();
        let mut cursor = content_start;
        for (start, end) in covered {
            if start > cursor {
                gaps.push((cursor, start));
            }
            cursor = cursor.max(end);
        }
        if cursor < self.usable_size {
            gaps.push((cursor, self.usable_size));
        }
        Ok(gaps)
    }
}

/// How many payload bytes stay on the b-tree page.
///
/// Follows the K/M/X formulas of the file format documentation; `U` is the
/// usable page size.
pub fn local_payload_size(payload_size: usize, usable_size: usize, table_leaf: bool) -> (usize, bool) {
    let u = usable_size;
    let x = if table_leaf {
        u - 35
    } else {
        ((u - 12) * 64 / 255) - 23
    };
    if payload_size <= x {
        return (payload_size, false);
    }
    let m = ((u - 12) * 32 / 255) - 23;
    let k = m + (payload_size - m) % (u - 4);
    if k <= x {
        (k, true)
    } else {
        (m, true)
    }
}

/// Follow an overflow chain collecting `needed` bytes into `out`.
/// Each overflow page is `[next_page:u32][content...]`.
fn read_overflow_chain<S: PageSource>(
    source: &S,
    first_page: PageNum,
    needed: usize,
    out: &mut Vec<u8>,
) -> Result<(), Error> {
    let usable = source.usable_page_size();
    let mut visited: HashSet<PageNum> = HashSet::new();
    let mut page_number = first_page;
    let mut remaining = needed;
    while remaining > 0 {
        if !visited.insert(page_number) {
            return Err(Error::OverflowCycle { first_page, page: page_number });
        }
        let page = source.page(page_number)?;
        let next = BigEndian::read_u32(&page[..4]);
        let take = remaining.min(usable - 4);
        out.extend_from_slice(&page[4..4 + take]);
        remaining -= take;
        if remaining > 0 {
            if next == 0 {
                return Err(Error::OverflowTruncated { first_page, missing: remaining });
            }
            page_number = next;
        }
    }
    Ok(())
}

/// Classify a page by its position and flag byte.
///
/// Freelist membership cannot be derived from the page bytes alone, so the
/// caller passes the page numbers collected from the freelist trunk walk.
pub fn classify_page(
    page_number: PageNum,
    bytes: &[u8],
    page_size: u32,
    largest_root_btree_page: u32,
    freelist_trunks: &HashSet<PageNum>,
    freelist_leaves: &HashSet<PageNum>,
) -> PageKind {
    if freelist_trunks.contains(&page_number) {
        return PageKind::FreelistTrunk;
    }
    if freelist_leaves.contains(&page_number) {
        return PageKind::FreelistLeaf;
    }
    // The lock-byte page is the page spanning file offset 2^30.
    if (page_number as u64 - 1) * page_size as u64 <= 0x4000_0000
        && page_number as u64 * page_size as u64 > 0x4000_0000
    {
        return PageKind::LockByte;
    }
    // In auto-vacuum databases, pointer-map pages start at page 2 and
    // repeat after every page_size/5 mapped pages.
    if largest_root_btree_page > 0 && page_number >= 2 {
        let entries_per_map = page_size as u64 / 5;
        if (page_number as u64 - 2) % (entries_per_map + 1) == 0 {
            return PageKind::PointerMap;
        }
    }
    let flag_offset = super::btree_start_offset(page_number);
    match bytes.get(flag_offset).copied().and_then(BTreePageType::from_flag) {
        Some(t) => PageKind::BTree(t),
        None => PageKind::Overflow,
    }
}
