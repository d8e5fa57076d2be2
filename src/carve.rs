//! carve scans the byte ranges SQLite no longer accounts for (unallocated
//! space, freeblocks, freed pages) for records matching a table signature,
//! and reconstructs as much of each deleted record as survives.
//!
//! Cells are packed from the page tail toward the header, so later match
//! offsets are younger; the scan walks matches in reverse and maintains a
//! cutoff so that older, partially overwritten records are truncated at the
//! point where a younger record overwrote them. Freeblock reallocation
//! overwrites the first four bytes of a dead cell (payload-size varint,
//! rowid varint, header-size varint, first serial type), so a second pass
//! matches the signature without its first column and back-solves the lost
//! serial type from the freeblock size field.

use regex::bytes::Regex;
use tracing::{debug, warn};

use crate::btree::page::Freeblock;
use crate::database::PageNum;
use crate::serial_type::{self, OwnedValue, BLOB_ID, TEXT_ID};
use crate::signature::Signature;
use crate::varint;

/// Longest varint accepted for a record header size while probing.
const MAX_HEADER_SIZE_VARINT_LENGTH: usize = 5;
/// Largest first-column content size expressible with a 1-byte serial type.
const MAX_ONE_BYTE_VARINT_CONTENT: i64 = 0x7f;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Error building carving signature regex: {0}")]
    Signature(#[from] crate::signature::Error),
    #[error("Candidate cell rejected at offset {offset}: {reason}")]
    CellCarving { offset: usize, reason: String },
}

/// Where a carved cell was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarveLocation {
    UnallocatedSpace,
    Freeblock,
    FreelistLeafPage,
    JournalPage,
}

impl std::fmt::Display for CarveLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CarveLocation::UnallocatedSpace => write!(f, "unallocated space"),
            CarveLocation::Freeblock => write!(f, "freeblock"),
            CarveLocation::FreelistLeafPage => write!(f, "freelist leaf page"),
            CarveLocation::JournalPage => write!(f, "journal page"),
        }
    }
}

/// One record reconstructed from dead bytes.
///
/// Offsets are relative to the page the bytes came from. The digest covers
/// the carved byte range and keys deduplication across passes and versions;
/// rowids are only present when the bytes preceding the header survived.
#[derive(Debug, Clone)]
pub struct CarvedCell {
    pub page_number: PageNum,
    pub location: CarveLocation,
    /// Freeblock index within the page's chain; zero elsewhere.
    pub source_index: usize,
    pub cell_start_offset: usize,
    pub cell_end_offset: usize,
    pub row_id: Option<i64>,
    pub payload_size: Option<i64>,
    pub serial_types: Vec<i64>,
    pub values: Vec<OwnedValue>,
    pub md5_digest: [u8; 16],
    pub truncated_beginning: bool,
    pub truncated_ending: bool,
    pub probabilistic_first_serial_type: bool,
}

impl CarvedCell {
    pub fn md5_hex(&self) -> String {
        hex::encode(self.md5_digest)
    }
}

/// A signature-directed carver over byte regions.
pub struct Carver<'s> {
    signature: &'s Signature,
    full_regex: Regex,
    /// Absent when the signature has a single column; with the first column
    /// skipped nothing would remain to match.
    partial_regex: Option<Regex>,
}

impl<'s> Carver<'s> {
    pub fn new(signature: &'s Signature) -> Result<Carver<'s>, Error> {
        let full_regex = signature.compile_regex(false)?;
        let partial_regex = match signature.compile_regex(true) {
            Ok(re) => Some(re),
            Err(crate::signature::Error::EmptySignature) => None,
            Err(e) => return Err(e.into()),
        };
        Ok(Carver { signature, full_regex, partial_regex })
    }

    pub fn signature(&self) -> &Signature {
        self.signature
    }

    /// Carve a contiguous region of a page: its unallocated space, or the
    /// whole content of a freed or journaled page.
    ///
    /// `region_start_offset` is the page-relative offset of `region`.
    /// Candidate rejection never aborts the scan.
    pub fn carve_unallocated(
        &self,
        page_number: PageNum,
        region: &[u8],
        region_start_offset: usize,
        location: CarveLocation,
    ) -> Vec<CarvedCell> {
        let mut cells: Vec<CarvedCell> = Vec::new();

        // Pass 1: full-header matches, youngest (highest offset) first.
        let full_matches: Vec<(usize, usize)> =
            self.full_regex.find_iter(region).map(|m| (m.start(), m.end())).collect();
        let mut accepted_ranges: Vec<(usize, usize)> = Vec::new();
        let mut cutoff_offset = region.len();
        for &(start, end) in full_matches.iter().rev() {
            match self.carve_full_match(page_number, region, region_start_offset, location, start, end, cutoff_offset)
            {
                Ok(cell) => {
                    cutoff_offset = cell.cell_start_offset - region_start_offset;
                    accepted_ranges.push((
                        cell.cell_start_offset - region_start_offset,
                        cell.cell_end_offset - region_start_offset,
                    ));
                    cells.push(cell);
                }
                Err(e) => {
                    debug!(
                        component = "carver",
                        page = page_number,
                        offset = region_start_offset + start,
                        location = %location,
                        "full-header candidate rejected: {}",
                        e
                    );
                }
            }
        }

        // Pass 2: partial-header matches. A freeblock header that consumed
        // the whole preamble leaves only the 2nd..Nth serial types behind;
        // rescan without the first column and keep whatever the full pass
        // did not already claim.
        if let Some(partial_regex) = &self.partial_regex {
            let partial_matches: Vec<(usize, usize)> =
                partial_regex.find_iter(region).map(|m| (m.start(), m.end())).collect();
            let mut partial_cutoff = region.len();
            for &(start, end) in partial_matches.iter().rev() {
                if accepted_ranges.iter().any(|&(s, e)| start >= s && start < e) {
                    continue;
                }
                let cutoff = accepted_ranges
                    .iter()
                    .map(|&(s, _)| s)
                    .filter(|&s| s >= end)
                    .chain(std::iter::once(partial_cutoff))
                    .min()
                    .unwrap_or(partial_cutoff);
                match self.carve_partial_match(
                    page_number,
                    region,
                    region_start_offset,
                    location,
                    0,
                    start,
                    end,
                    cutoff,
                    None,
                ) {
                    Ok(cell) => {
                        partial_cutoff = cell.cell_start_offset - region_start_offset;
                        cells.push(cell);
                    }
                    Err(e) => {
                        debug!(
                            component = "carver",
                            page = page_number,
                            offset = region_start_offset + start,
                            location = %location,
                            "partial-header candidate rejected: {}",
                            e
                        );
                    }
                }
            }
        }

        cells
    }

    /// Carve the freeblock chain of a page.
    ///
    /// The 4-byte freeblock header has overwritten the cell preamble, so
    /// only the partial signature can match; the lost first serial type is
    /// back-solved from the freeblock's size field.
    pub fn carve_freeblocks(
        &self,
        page_number: PageNum,
        page: &[u8],
        freeblocks: &[Freeblock],
    ) -> Vec<CarvedCell> {
        let partial_regex = match &self.partial_regex {
            Some(re) => re,
            None => {
                warn!(
                    component = "carver",
                    page = page_number,
                    table = %self.signature.name,
                    "single-column signature cannot be matched inside freeblocks"
                );
                return Vec::new();
            }
        };
        let mut cells = Vec::new();
        for freeblock in freeblocks {
            let (content_start, content_end) = freeblock.content_range();
            if content_start > content_end || content_end > page.len() {
                continue;
            }
            let content = &page[content_start..content_end];
            let matches: Vec<(usize, usize)> =
                partial_regex.find_iter(content).map(|m| (m.start(), m.end())).collect();
            let mut cutoff_offset = content.len();
            for &(start, end) in matches.iter().rev() {
                match self.carve_partial_match(
                    page_number,
                    content,
                    content_start,
                    CarveLocation::Freeblock,
                    freeblock.index,
                    start,
                    end,
                    cutoff_offset,
                    Some(freeblock.byte_size),
                ) {
                    Ok(cell) => {
                        cutoff_offset = start;
                        cells.push(cell);
                    }
                    Err(e) => {
                        debug!(
                            component = "carver",
                            page = page_number,
                            offset = content_start + start,
                            freeblock = freeblock.index,
                            "freeblock candidate rejected: {}",
                            e
                        );
                    }
                }
            }
        }
        cells
    }

    /// A match of the complete signature: the serial types are all present;
    /// probe backward for the header-size, rowid and payload-size varints.
    #[allow(clippy::too_many_arguments)]
    fn carve_full_match(
        &self,
        page_number: PageNum,
        region: &[u8],
        region_start_offset: usize,
        location: CarveLocation,
        match_start: usize,
        match_end: usize,
        cutoff_offset: usize,
    ) -> Result<CarvedCell, Error> {
        let serial_types = decode_serial_types(&region[match_start..match_end], match_start)?;

        let mut truncated_beginning = false;
        let mut row_id = None;
        let mut payload_size = None;
        let mut cell_start = match_start;

        // The header-size varint must immediately precede the match and
        // account for the match plus itself.
        match varint::decode_in_reverse(region, match_start, MAX_HEADER_SIZE_VARINT_LENGTH) {
            Ok((header_size, header_start)) => {
                let expected = (match_end - match_start) + (match_start - header_start);
                if header_size as usize != expected {
                    return Err(reject(
                        match_start,
                        format!(
                            "header size varint {} does not cover the {}-byte header",
                            header_size, expected
                        ),
                    ));
                }
                cell_start = header_start;
                // Rowid, then payload size, walking further back.
                match varint::decode_in_reverse(region, header_start, 9) {
                    Ok((rid, rid_start)) => {
                        cell_start = rid_start;
                        match varint::decode_in_reverse(region, rid_start, 9) {
                            Ok((psize, payload_start)) => {
                                cell_start = payload_start;
                                payload_size = Some(psize as i64);
                            }
                            Err(_) => truncated_beginning = true,
                        }
                        row_id = Some(rid as i64);
                    }
                    Err(_) => truncated_beginning = true,
                }
            }
            Err(_) => {
                // Nothing readable before the match; the preamble is gone.
                truncated_beginning = true;
            }
        }

        let (values, body_end, truncated_ending) =
            parse_body(region, match_end, &serial_types, cutoff_offset, match_start)?;

        Ok(self.finish_cell(
            page_number,
            region,
            region_start_offset,
            location,
            0,
            cell_start,
            body_end,
            row_id,
            payload_size,
            serial_types.iter().map(|(st, _)| *st).collect(),
            values,
            truncated_beginning,
            truncated_ending,
            false,
        ))
    }

    /// A match of the signature without its first column. The first serial
    /// type is reconstructed: from the surviving byte before the match, from
    /// the freeblock size field, or from a single-candidate signature.
    #[allow(clippy::too_many_arguments)]
    fn carve_partial_match(
        &self,
        page_number: PageNum,
        region: &[u8],
        region_start_offset: usize,
        location: CarveLocation,
        source_index: usize,
        match_start: usize,
        match_end: usize,
        cutoff_offset: usize,
        enclosing_freeblock_size: Option<u16>,
    ) -> Result<CarvedCell, Error> {
        let rest_serial_types = decode_serial_types(&region[match_start..match_end], match_start)?;
        let rest_content_size: usize = rest_serial_types.iter().map(|(_, size)| size).sum();
        let first_column = self.signature.first_column_serial_types();

        // Decision ladder for the first serial type.
        let (first_serial_type, probabilistic, cell_start) = if match_start == 1 {
            // The byte right before the match survived; if it is a plausible
            // first serial type, the header is whole apart from the preamble.
            let byte = region[0];
            let st = byte as i64;
            if byte < 0x80
                && serial_type::content_size(st).is_ok()
                && first_column.contains(&serial_type::simplified(st))
            {
                (st, false, 0)
            } else {
                return Err(reject(
                    match_start,
                    format!("byte {:#04x} before the match is not a candidate first serial type", byte),
                ));
            }
        } else if match_start == 0 {
            match enclosing_freeblock_size {
                Some(fb_size) => {
                    let st = self.back_solve_first_serial_type(
                        fb_size,
                        match_end - match_start,
                        rest_content_size,
                        match_start,
                    )?;
                    (st, true, 0)
                }
                None => self.adopt_singleton_first_type(match_start)?,
            }
        } else {
            // Deeper in the region: the two bytes before the match may be a
            // younger freeblock's size field overwritten onto this record.
            let embedded_size =
                u16::from_be_bytes([region[match_start - 2], region[match_start - 1]]);
            let header_overhead = 2 + (match_end - match_start);
            let payload_min = header_overhead + rest_content_size;
            let payload_max = payload_min + MAX_ONE_BYTE_VARINT_CONTENT as usize;
            let plausible = (embedded_size as usize) >= payload_min + 2
                && (embedded_size as usize) <= payload_max + 2;
            if plausible {
                let st = self.back_solve_first_serial_type(
                    embedded_size,
                    match_end - match_start,
                    rest_content_size,
                    match_start,
                )?;
                (st, true, match_start.saturating_sub(4))
            } else {
                let (st, prob, _) = self.adopt_singleton_first_type(match_start)?;
                (st, prob, match_start)
            }
        };

        let first_content_size = serial_type::content_size(first_serial_type)
            .map_err(|e| reject(match_start, e.to_string()))?;

        // Body: the first column's content survives right after the matched
        // serial types, then the remaining columns.
        let mut serial_types = vec![(first_serial_type, first_content_size)];
        serial_types.extend(rest_serial_types.iter().copied());
        let (values, body_end, truncated_ending) =
            parse_body(region, match_end, &serial_types, cutoff_offset, match_start)?;
        if values.is_empty() {
            return Err(reject(match_start, "no column content survived".to_string()));
        }

        Ok(self.finish_cell(
            page_number,
            region,
            region_start_offset,
            location,
            source_index,
            cell_start,
            body_end,
            None,
            None,
            serial_types.iter().map(|(st, _)| *st).collect(),
            values,
            true,
            truncated_ending,
            probabilistic,
        ))
    }

    /// Solve `first_size = freeblock_size - 2 - header_overhead - rest` and
    /// find the signature candidate whose content length fits.
    fn back_solve_first_serial_type(
        &self,
        freeblock_size: u16,
        match_length: usize,
        rest_content_size: usize,
        offset: usize,
    ) -> Result<i64, Error> {
        // Header: size varint (1) + first serial type (1) + matched types.
        let header_overhead = 2 + match_length;
        let payload_size = freeblock_size as i64 - 2;
        let first_size = payload_size - header_overhead as i64 - rest_content_size as i64;
        if first_size < 0 {
            return Err(reject(
                offset,
                format!("freeblock size {} leaves no room for a first column", freeblock_size),
            ));
        }
        if first_size > MAX_ONE_BYTE_VARINT_CONTENT {
            return Err(reject(
                offset,
                format!(
                    "first column of {} bytes would need a multi-byte serial type varint",
                    first_size
                ),
            ));
        }

        let candidates: Vec<i64> = self
            .signature
            .first_column_serial_types()
            .iter()
            .filter_map(|&st| serial_type_for_content_size(st, first_size as usize))
            .collect();
        match candidates.len() {
            0 => Err(reject(
                offset,
                format!("no first-column serial type stores {} bytes", first_size),
            )),
            1 => Ok(candidates[0]),
            _ => {
                // Several fit; take the one the table used most often.
                let best = candidates
                    .iter()
                    .copied()
                    .max_by(|a, b| {
                        let pa = self.signature.first_column_probability(serial_type::simplified(*a));
                        let pb = self.signature.first_column_probability(serial_type::simplified(*b));
                        pa.partial_cmp(&pb).unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .expect("candidates is non-empty");
                Ok(best)
            }
        }
    }

    /// With no size to solve against, only an unambiguous signature lets the
    /// first serial type be assumed.
    fn adopt_singleton_first_type(&self, offset: usize) -> Result<(i64, bool, usize), Error> {
        let first_column = self.signature.first_column_serial_types();
        if first_column.len() != 1 {
            return Err(reject(
                offset,
                format!(
                    "first column has {} candidate serial types and no freeblock size to solve against",
                    first_column.len()
                ),
            ));
        }
        let st = *first_column.iter().next().expect("len checked");
        if st == BLOB_ID || st == TEXT_ID {
            return Err(reject(
                offset,
                "variable-length first column cannot be sized without a freeblock".to_string(),
            ));
        }
        Ok((st, true, offset))
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_cell(
        &self,
        page_number: PageNum,
        region: &[u8],
        region_start_offset: usize,
        location: CarveLocation,
        source_index: usize,
        cell_start: usize,
        body_end: usize,
        row_id: Option<i64>,
        payload_size: Option<i64>,
        serial_types: Vec<i64>,
        values: Vec<OwnedValue>,
        truncated_beginning: bool,
        truncated_ending: bool,
        probabilistic_first_serial_type: bool,
    ) -> CarvedCell {
        let end = body_end.min(region.len()).max(cell_start);
        let digest = md5::compute(&region[cell_start..end]);
        CarvedCell {
            page_number,
            location,
            source_index,
            cell_start_offset: region_start_offset + cell_start,
            cell_end_offset: region_start_offset + end,
            row_id,
            payload_size,
            serial_types,
            values,
            md5_digest: digest.0,
            truncated_beginning,
            truncated_ending,
            probabilistic_first_serial_type,
        }
    }
}

fn reject(offset: usize, reason: String) -> Error {
    Error::CellCarving { offset, reason }
}

/// Decode the serial type varints inside a matched header fragment.
fn decode_serial_types(bytes: &[u8], offset_for_errors: usize) -> Result<Vec<(i64, usize)>, Error> {
    let mut serial_types = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let (st, len) = varint::decode(bytes, offset)
            .map_err(|e| reject(offset_for_errors, e.to_string()))?;
        let size = serial_type::content_size(st)
            .map_err(|e| reject(offset_for_errors, e.to_string()))?;
        serial_types.push((st, size));
        offset += len;
    }
    Ok(serial_types)
}

/// Parse column values from the body, stopping at the cutoff. Columns past
/// the truncation point come back NULL so the shape stays intact.
fn parse_body(
    region: &[u8],
    body_start: usize,
    serial_types: &[(i64, usize)],
    cutoff_offset: usize,
    offset_for_errors: usize,
) -> Result<(Vec<OwnedValue>, usize, bool), Error> {
    let limit = cutoff_offset.clamp(body_start.min(region.len()), region.len());
    let mut values = Vec::with_capacity(serial_types.len());
    let mut offset = body_start;
    let mut truncated = false;
    for (i, &(st, size)) in serial_types.iter().enumerate() {
        if offset + size > limit {
            // The first column must at least fit; otherwise this was never
            // a record body.
            if i == 0 && size > 0 && offset >= limit {
                return Err(reject(
                    offset_for_errors,
                    "no body bytes available for the first column".to_string(),
                ));
            }
            truncated = true;
            values.push(OwnedValue::Null);
            offset = limit;
            continue;
        }
        match serial_type::value_at(st, &region[..limit], offset) {
            Ok((read, value)) => {
                values.push(value.to_owned());
                offset += read;
            }
            Err(e) => return Err(reject(offset_for_errors, e.to_string())),
        }
    }
    Ok((values, offset, truncated))
}

/// The serial type a candidate simplified type would need to store
/// `content_size` bytes, if any.
fn serial_type_for_content_size(simplified_type: i64, content_size: usize) -> Option<i64> {
    match simplified_type {
        BLOB_ID => Some(12 + 2 * content_size as i64),
        TEXT_ID => Some(13 + 2 * content_size as i64),
        st => match serial_type::content_size(st) {
            Ok(size) if size == content_size => Some(st),
            _ => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::Signature;
    use std::collections::BTreeSet;

    fn signature_with(simplified: Vec<BTreeSet<i64>>) -> Signature {
        Signature {
            name: "t".to_string(),
            table_name: "t".to_string(),
            number_of_columns: simplified.len(),
            probabilistic_signature: simplified
                .iter()
                .map(|s| s.iter().map(|st| (*st, 1.0 / s.len() as f64)).collect())
                .collect(),
            simplified_signature: simplified.clone(),
            recommended_schema_signature: simplified,
            rows_observed: 1,
        }
    }

    /// Signature of `(id INTEGER, name TEXT, age INTEGER)` as observed from
    /// rows: NULL rowid alias, text, one-byte int.
    fn int_text_int_signature() -> Signature {
        signature_with(vec![
            BTreeSet::from([1, 2, 3, 4, 5, 6]),
            BTreeSet::from([TEXT_ID]),
            BTreeSet::from([1, 2, 3, 4, 5, 6]),
        ])
    }

    /// A full table-leaf cell for (rowid, ival, text, ival2).
    fn build_cell(row_id: i64, first: i64, text: &str, last: i64) -> Vec<u8> {
        let mut header = vec![0x01, (13 + 2 * text.len()) as u8, 0x01];
        header[0] = 0x01; // first column: 1-byte int
        let mut body = vec![first as u8];
        body.extend_from_slice(text.as_bytes());
        body.push(last as u8);
        let mut record = vec![(1 + header.len()) as u8];
        record.extend(&header);
        record.extend(&body);
        let mut cell = varint::encode(record.len() as i64);
        cell.extend(varint::encode(row_id));
        cell.extend(record);
        cell
    }

    #[test]
    fn test_carve_full_header_from_unallocated() {
        // A deleted cell drifting in unallocated space, preamble intact.
        let cell = build_cell(2, 41, "bob", 9);
        let mut region = vec![0_u8; 8];
        region.extend(&cell);
        region.extend(vec![0_u8; 4]);

        let sig = int_text_int_signature();
        let carver = Carver::new(&sig).unwrap();
        let cells = carver.carve_unallocated(5, &region, 100, CarveLocation::UnallocatedSpace);
        assert_eq!(cells.len(), 1);
        let c = &cells[0];
        assert_eq!(c.row_id, Some(2));
        assert_eq!(c.page_number, 5);
        assert_eq!(c.cell_start_offset, 108);
        assert!(!c.truncated_beginning);
        assert!(!c.truncated_ending);
        assert_eq!(
            c.values,
            vec![
                OwnedValue::Int(41),
                OwnedValue::Text(b"bob".to_vec()),
                OwnedValue::Int(9)
            ]
        );
    }

    #[test]
    fn test_carve_is_idempotent() {
        let cell = build_cell(2, 41, "bob", 9);
        let mut region = vec![0_u8; 8];
        region.extend(&cell);
        let sig = int_text_int_signature();
        let carver = Carver::new(&sig).unwrap();
        let a = carver.carve_unallocated(5, &region, 0, CarveLocation::UnallocatedSpace);
        let b = carver.carve_unallocated(5, &region, 0, CarveLocation::UnallocatedSpace);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.md5_digest, y.md5_digest);
            assert_eq!(x.cell_start_offset, y.cell_start_offset);
            assert_eq!(x.cell_end_offset, y.cell_end_offset);
        }
    }

    #[test]
    fn test_carve_freeblock_back_solves_first_serial_type() {
        // The cell for rowid 2, ('bob', 41): record is
        // [04][01][13][01] [2a]['b','o','b'][29] after payload+rowid bytes.
        // A freeblock overwrites the first four bytes (payload size, rowid,
        // header size, first serial type) with next-offset and size.
        let text = "bob";
        let cell = build_cell(2, 0x2a, text, 0x29);
        let cell_len = cell.len();

        // Lay the dead cell at offset 200 of a page, then stamp the
        // freeblock header over its first 4 bytes.
        let mut page = vec![0_u8; 512];
        page[200..200 + cell_len].copy_from_slice(&cell);
        page[200..202].copy_from_slice(&0_u16.to_be_bytes()); // next
        page[202..204].copy_from_slice(&(cell_len as u16).to_be_bytes()); // size

        let freeblock = Freeblock {
            index: 0,
            start_offset: 200,
            next_offset: 0,
            byte_size: cell_len as u16,
        };

        let sig = int_text_int_signature();
        let carver = Carver::new(&sig).unwrap();
        let cells = carver.carve_freeblocks(5, &page, &[freeblock]);
        assert_eq!(cells.len(), 1);
        let c = &cells[0];
        assert!(c.truncated_beginning);
        assert!(c.probabilistic_first_serial_type);
        assert_eq!(c.serial_types[0], 1, "one-byte int back-solved from the freeblock size");
        assert_eq!(
            c.values,
            vec![
                OwnedValue::Int(0x2a),
                OwnedValue::Text(b"bob".to_vec()),
                OwnedValue::Int(0x29)
            ]
        );
        assert_eq!(c.location, CarveLocation::Freeblock);
        assert_eq!(c.row_id, None, "rowid bytes were overwritten");
    }

    #[test]
    fn test_freeblock_back_solve_prefers_text_size() {
        // First column TEXT or INT1; freeblock size implies 5 content bytes
        // for the first column, which only TEXT can store.
        let sig = signature_with(vec![
            BTreeSet::from([1, TEXT_ID]),
            BTreeSet::from([1]),
        ]);
        let carver = Carver::new(&sig).unwrap();

        // Record: header [03][17][01], body "hello" + one int byte.
        let record: &[u8] = &[0x03, 0x17, 0x01, b'h', b'e', b'l', b'l', b'o', 0x07];
        // Cell = payload varint + rowid varint + record; freeblock covers it.
        let cell_len = 2 + record.len();
        let mut page = vec![0_u8; 64];
        page[10..12].copy_from_slice(&0_u16.to_be_bytes());
        page[12..14].copy_from_slice(&(cell_len as u16).to_be_bytes());
        // Content after the 4-byte header: record minus its first 2 bytes.
        page[14..14 + record.len() - 2].copy_from_slice(&record[2..]);

        let freeblock = Freeblock { index: 0, start_offset: 10, next_offset: 0, byte_size: cell_len as u16 };
        let cells = carver.carve_freeblocks(3, &page, &[freeblock]);
        assert_eq!(cells.len(), 1);
        // 5 bytes of text: serial type 13 + 2*5 = 23 = 0x17.
        assert_eq!(cells[0].serial_types[0], 0x17);
        assert_eq!(cells[0].values[0], OwnedValue::Text(b"hello".to_vec()));
    }

    #[test]
    fn test_cutoff_truncates_older_overwritten_record() {
        // Two dead cells; the younger one overwrote the tail of the older.
        let young = build_cell(7, 1, "yo", 2);
        let old = build_cell(3, 5, "old", 6);
        let mut region = vec![0_u8; 0];
        // Old cell first, but its tail is where the young cell begins.
        region.extend(&old[..old.len() - 3]);
        let young_start = region.len();
        region.extend(&young);
        let _ = young_start;

        let sig = int_text_int_signature();
        let carver = Carver::new(&sig).unwrap();
        let cells = carver.carve_unallocated(4, &region, 0, CarveLocation::UnallocatedSpace);
        // Youngest first in the result (reverse scan order).
        assert!(cells.len() >= 2);
        let young_cell = &cells[0];
        assert_eq!(young_cell.row_id, Some(7));
        assert!(!young_cell.truncated_ending);
        let old_cell = &cells[1];
        assert_eq!(old_cell.row_id, Some(3));
        assert!(old_cell.truncated_ending, "older record is cut off by the younger one");
        assert_eq!(old_cell.values[2], OwnedValue::Null);
    }

    #[test]
    fn test_rejection_does_not_abort_scan() {
        // A lone matching header fragment at the region start with garbage
        // around it and one real cell later.
        let mut region = vec![0x01, 0x13, 0x01];
        region.extend(vec![0xff_u8; 3]);
        region.extend(build_cell(9, 1, "abc", 2));
        let sig = int_text_int_signature();
        let carver = Carver::new(&sig).unwrap();
        let cells = carver.carve_unallocated(6, &region, 0, CarveLocation::UnallocatedSpace);
        assert!(cells.iter().any(|c| c.row_id == Some(9)));
    }

    #[test]
    fn test_single_column_signature_skips_freeblock_pass() {
        let sig = signature_with(vec![BTreeSet::from([1])]);
        let carver = Carver::new(&sig).unwrap();
        let page = vec![0_u8; 64];
        let freeblock = Freeblock { index: 0, start_offset: 10, next_offset: 0, byte_size: 20 };
        assert!(carver.carve_freeblocks(2, &page, &[freeblock]).is_empty());
    }
}
