//! signature profiles the serial types a table's columns actually use, and
//! compiles those profiles into the byte regexes that drive carving.
//!
//! A column's entry collapses every BLOB to [`BLOB_ID`] and every TEXT to
//! [`TEXT_ID`]; the numeric serial types 0..=9 stand for themselves. When a
//! table has no live rows to observe, a fallback signature is derived from
//! the declared column affinities.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use regex::bytes::Regex;

use crate::btree::table as btree_table;
use crate::record::Record;
use crate::schema::{MasterSchemaEntry, TypeAffinity};
use crate::serial_type::{simplified, BLOB_ID, TEXT_ID};
use crate::version::Version;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Table {0:?} has no columns to build a signature from.")]
    NoColumns(String),
    #[error("Column {column} has {count} possible serial types; at most 12 are possible.")]
    TooManySerialTypes { column: usize, count: usize },
    #[error("No serial types remain in the signature after skipping the first column.")]
    EmptySignature,
    #[error("Serial type {0} cannot appear in a signature.")]
    UnrepresentableSerialType(i64),
    #[error("Failed to compile signature regex: {0}")]
    Regex(#[from] regex::Error),
    #[error("Error walking table while building signature: {0}")]
    BTree(#[from] crate::btree::Error),
}

/// The serial-type profile of one table, ready to be turned into regexes.
#[derive(Debug, Clone)]
pub struct Signature {
    pub name: String,
    pub table_name: String,
    pub number_of_columns: usize,
    /// Per column: the set of simplified serial types observed in live rows.
    pub simplified_signature: Vec<BTreeSet<i64>>,
    /// Per column: observed simplified serial types with their frequency,
    /// most frequent first. Used to rank candidates when a carved fragment
    /// is ambiguous.
    pub probabilistic_signature: Vec<Vec<(i64, f64)>>,
    /// Fallback derived from declared column affinities, for tables with no
    /// observable rows.
    pub recommended_schema_signature: Vec<BTreeSet<i64>>,
    /// Live rows observed across all versions.
    pub rows_observed: u64,
}

impl Signature {
    /// Profile `entry` by scanning its live rows in every version.
    pub fn build(versions: &[Version], entry: &MasterSchemaEntry) -> Result<Signature, Error> {
        if entry.column_definitions.is_empty() {
            return Err(Error::NoColumns(entry.name.clone()));
        }
        let n = entry.column_definitions.len();
        let mut counts: Vec<std::collections::BTreeMap<i64, u64>> = vec![Default::default(); n];
        let mut rows_observed = 0_u64;
        for version in versions {
            let strict = version.strict();
            let walk = btree_table::walk(version, entry.root_page, strict)?;
            for cell in &walk.cells {
                let record = match Record::parse(&cell.payload) {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(
                            component = "signature",
                            table = %entry.name,
                            page = cell.page_number,
                            offset = cell.cell_start_offset,
                            error = %e,
                            "skipping unparsable row while building signature"
                        );
                        continue;
                    }
                };
                rows_observed += 1;
                for column in record.columns.iter().take(n) {
                    *counts[column.index].entry(simplified(column.serial_type)).or_insert(0) += 1;
                }
            }
        }

        let simplified_signature: Vec<BTreeSet<i64>> =
            counts.iter().map(|c| c.keys().copied().collect()).collect();
        let probabilistic_signature = counts
            .iter()
            .map(|c| {
                let total: u64 = c.values().sum();
                let mut freq: Vec<(i64, f64)> = c
                    .iter()
                    .map(|(st, n)| (*st, *n as f64 / total.max(1) as f64))
                    .collect();
                freq.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
                freq
            })
            .collect();
        let recommended_schema_signature = entry
            .column_definitions
            .iter()
            .map(|c| recommended_serial_types(c.type_affinity))
            .collect();

        Ok(Signature {
            name: entry.name.clone(),
            table_name: entry.table_name.clone(),
            number_of_columns: n,
            simplified_signature,
            probabilistic_signature,
            recommended_schema_signature,
            rows_observed,
        })
    }

    /// The signature carving should match against: the observed one when any
    /// rows existed, else the schema-derived fallback.
    pub fn effective_signature(&self) -> &[BTreeSet<i64>] {
        if self.rows_observed > 0 {
            &self.simplified_signature
        } else {
            &self.recommended_schema_signature
        }
    }

    pub fn first_column_serial_types(&self) -> &BTreeSet<i64> {
        &self.effective_signature()[0]
    }

    /// Observed frequency of a simplified serial type in the first column;
    /// zero when never seen.
    pub fn first_column_probability(&self, serial_type: i64) -> f64 {
        self.probabilistic_signature
            .first()
            .and_then(|freq| freq.iter().find(|(st, _)| *st == serial_type))
            .map(|(_, p)| *p)
            .unwrap_or(0.0)
    }

    /// The regex source for this signature's record header, optionally
    /// skipping the first column (freeblock headers overwrite it).
    pub fn regex_pattern(&self, skip_first_serial_type: bool) -> Result<String, Error> {
        let signature = self.effective_signature();
        let signature =
            if skip_first_serial_type { &signature[1..] } else { signature };
        if signature.is_empty() || signature.iter().any(|s| s.is_empty()) {
            return Err(Error::EmptySignature);
        }
        let mut pattern = String::new();
        for (column, serial_types) in signature.iter().enumerate() {
            if serial_types.len() > 12 {
                return Err(Error::TooManySerialTypes { column, count: serial_types.len() });
            }
            pattern.push_str(&column_pattern(serial_types)?);
        }
        Ok(pattern)
    }

    /// Compile the header regex. Matching is byte-wise, never unicode.
    pub fn compile_regex(&self, skip_first_serial_type: bool) -> Result<Regex, Error> {
        let pattern = self.regex_pattern(skip_first_serial_type)?;
        Ok(Regex::new(&format!("(?s-u){}", pattern))?)
    }
}

/// Serial types a column of the given affinity could have stored. NUMERIC
/// accepts any storage class, so it gets the union of the other four.
fn recommended_serial_types(affinity: TypeAffinity) -> BTreeSet<i64> {
    match affinity {
        TypeAffinity::Text => BTreeSet::from([TEXT_ID]),
        TypeAffinity::Integer => BTreeSet::from([0, 1, 2, 3, 4, 5, 6, 8, 9]),
        TypeAffinity::Real => BTreeSet::from([7, 8, 9]),
        TypeAffinity::Blob => BTreeSet::from([BLOB_ID]),
        TypeAffinity::Numeric => {
            BTreeSet::from([0, 1, 2, 3, 4, 5, 6, 7, 8, 9, BLOB_ID, TEXT_ID])
        }
    }
}

/// The alternation matching one column's possible serial type varints.
fn column_pattern(serial_types: &BTreeSet<i64>) -> Result<String, Error> {
    let mut basic: Vec<i64> = Vec::new();
    let mut blob = false;
    let mut text = false;
    for &st in serial_types {
        match st {
            BLOB_ID => blob = true,
            TEXT_ID => text = true,
            0..=9 => basic.push(st),
            other => return Err(Error::UnrepresentableSerialType(other)),
        }
    }

    let basic_class = if basic.is_empty() {
        None
    } else {
        let mut class = String::from("[");
        for st in &basic {
            let _ = write!(class, "\\x{:02x}", st);
        }
        class.push(']');
        Some(class)
    };

    let mut variable: Vec<String> = Vec::new();
    if blob {
        variable.push(variable_length_pattern(0x0c));
    }
    if text {
        variable.push(variable_length_pattern(0x0d));
    }

    Ok(match (basic_class, variable.is_empty()) {
        (Some(class), true) => class,
        (Some(class), false) => format!("(?:{}|{})", class, variable.join("|")),
        (None, false) => {
            if variable.len() == 1 {
                variable.pop().expect("one element")
            } else {
                format!("(?:{})", variable.join("|"))
            }
        }
        (None, true) => unreachable!("empty serial type sets are rejected above"),
    })
}

/// A BLOB or TEXT serial type is a varint: either one byte from the lower
/// bound up, or up to seven continuation bytes and a terminator.
/// Nine-byte varints do not occur in practice for header serial types.
fn variable_length_pattern(lower_bound: u8) -> String {
    format!(
        "(?:[\\x{:02x}-\\x7f]|[\\x80-\\xff]{{1,7}}[\\x00-\\x7f])",
        lower_bound
    )
}
