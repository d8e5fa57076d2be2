//! journal reads rollback-journal files and carves their page records.
//!
//! A journal stores pre-images: the state pages had before the transaction
//! that was in flight. Newer SQLite versions zero the journal header on
//! commit, so the page size comes from the companion database and the
//! leading sector is assumed to be the library's hard-coded 512 bytes.
//! After the header, records of `[page_number:u32][page_content:page_size]
//! [checksum:u32]` repeat until the file ends, the last one possibly cut
//! off mid-record.

use byteorder::{BigEndian, ByteOrder};
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::btree::BTreePageType;
use crate::carve::{CarveLocation, Carver};
use crate::commit::{Commit, CommitFileType};
use crate::database::PageNum;
use crate::schema::MasterSchemaEntry;
use crate::signature::Signature;
use crate::version::Version;

/// The sector holding the journal's master header. Not recorded in newer
/// files, so the library's fixed value is assumed.
const JOURNAL_SECTOR_SIZE: usize = 512;
const PAGE_RECORD_HEADER_SIZE: usize = 4;
const PAGE_RECORD_CHECKSUM_SIZE: usize = 4;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Error accessing rollback journal file: {0}")]
    Io(#[from] std::io::Error),
    #[error("The rollback journal is empty.")]
    Empty,
    #[error("Error carving journal page: {0}")]
    Carve(#[from] crate::carve::Error),
    #[error("Error building carving signature: {0}")]
    Signature(#[from] crate::signature::Error),
}

/// One page record lifted from the journal.
#[derive(Debug, Clone)]
pub struct JournalPageRecord {
    /// File offset of the record's page-number field.
    pub file_offset: usize,
    pub page_number: PageNum,
    pub content: Vec<u8>,
    /// Absent on the trailing record of a cut-off journal.
    pub checksum: Option<u32>,
    pub truncated: bool,
}

impl JournalPageRecord {
    /// The b-tree page type of the journaled page, if its flag byte is one.
    pub fn page_type(&self) -> Option<BTreePageType> {
        self.content.first().copied().and_then(BTreePageType::from_flag)
    }
}

/// A rollback journal file, held in memory.
pub struct RollbackJournal {
    path: PathBuf,
    bytes: Vec<u8>,
}

impl RollbackJournal {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<RollbackJournal, Error> {
        let path = path.as_ref().to_path_buf();
        let mut bytes = Vec::new();
        std::fs::File::open(&path)?.read_to_end(&mut bytes)?;
        if bytes.is_empty() {
            return Err(Error::Empty);
        }
        Ok(RollbackJournal { path, bytes })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_size(&self) -> usize {
        self.bytes.len()
    }

    /// Iterate the page records following the leading sector. The trailing
    /// record of a cut-off journal is returned truncated rather than lost.
    pub fn page_records(&self, page_size: usize) -> Vec<JournalPageRecord> {
        let record_size = PAGE_RECORD_HEADER_SIZE + page_size + PAGE_RECORD_CHECKSUM_SIZE;
        let mut records = Vec::new();
        let mut offset = JOURNAL_SECTOR_SIZE;
        while offset + PAGE_RECORD_HEADER_SIZE < self.bytes.len() {
            let page_number = BigEndian::read_u32(&self.bytes[offset..]);
            let content_start = offset + PAGE_RECORD_HEADER_SIZE;
            if offset + record_size <= self.bytes.len() {
                let content = self.bytes[content_start..content_start + page_size].to_vec();
                let checksum = BigEndian::read_u32(&self.bytes[content_start + page_size..]);
                records.push(JournalPageRecord {
                    file_offset: offset,
                    page_number,
                    content,
                    checksum: Some(checksum),
                    truncated: false,
                });
            } else {
                // Cut-off tail: keep whatever content bytes exist, skip the
                // checksum, and stop.
                let content = self.bytes[content_start..].to_vec();
                debug!(
                    component = "journal",
                    offset,
                    bytes = content.len(),
                    "truncated trailing page record"
                );
                records.push(JournalPageRecord {
                    file_offset: offset,
                    page_number,
                    content,
                    checksum: None,
                    truncated: true,
                });
                break;
            }
            offset += record_size;
        }
        records
    }
}

/// Carves every table-leaf or table-interior page record of a journal with
/// one table's signature.
pub struct RollbackJournalCarver;

impl RollbackJournalCarver {
    /// The base version supplies the page size the journal header no longer
    /// records. Commits carry version number -1: journal data is pre-image
    /// data and sits outside the version chain.
    pub fn carve(
        journal: &RollbackJournal,
        base_version: &Version,
        entry: &MasterSchemaEntry,
        signature: &Signature,
    ) -> Result<Vec<Commit>, Error> {
        let page_size = crate::btree::PageSource::page_size(base_version) as usize;
        let carver = Carver::new(signature)?;
        let mut commits = Vec::new();
        debug!(component = "journal", table = %entry.name, "carving rollback journal");
        for record in journal.page_records(page_size) {
            let page_type = match record.page_type() {
                Some(t @ (BTreePageType::TableLeaf | BTreePageType::TableInterior)) => t,
                _ => continue,
            };
            let carved = carver.carve_unallocated(
                record.page_number,
                &record.content,
                0,
                CarveLocation::JournalPage,
            );
            if record.truncated && carved.is_empty() {
                continue;
            }
            let mut commit = Commit {
                name: entry.name.clone(),
                file_type: CommitFileType::RollbackJournal,
                version_number: -1,
                page_type,
                root_page_number: entry.root_page,
                b_tree_page_numbers: vec![record.page_number],
                added_cells: Vec::new(),
                updated_cells: Vec::new(),
                deleted_cells: Vec::new(),
                carved_cells: carved,
                updated: false,
            };
            commit.updated = !commit.carved_cells.is_empty();
            if commit.carved_cells.is_empty() {
                warn!(
                    component = "journal",
                    page = record.page_number,
                    offset = record.file_offset,
                    table = %entry.name,
                    "no cells carved from journaled b-tree page"
                );
            }
            commits.push(commit);
        }
        Ok(commits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::page::test_support::build_table_leaf;
    use crate::database::Database;
    use crate::dbheader::build_test_header;
    use crate::schema::{parse_create_table_statement, MasterSchemaRowType};
    use crate::serial_type::OwnedValue;
    use crate::version::VersionHistory;
    use std::path::PathBuf;
    use std::rc::Rc;

    fn write_temp(name: &str, bytes: &[u8]) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("sqlite_scour_journaltest_{}_{}", std::process::id(), name));
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn person_record(name: &str, age: i64) -> Vec<u8> {
        let mut record = vec![4, 0x00, (13 + 2 * name.len()) as u8, 0x01];
        record.extend_from_slice(name.as_bytes());
        record.push(age as u8);
        record
    }

    fn journal_bytes(records: &[(u32, Vec<u8>)], page_size: usize, truncate_last_by: usize) -> Vec<u8> {
        let mut bytes = vec![0_u8; JOURNAL_SECTOR_SIZE];
        for (page_number, content) in records {
            let mut content = content.clone();
            content.resize(page_size, 0);
            bytes.extend(page_number.to_be_bytes());
            bytes.extend(content);
            bytes.extend(0xdead_beef_u32.to_be_bytes());
        }
        bytes.truncate(bytes.len() - truncate_last_by);
        bytes
    }

    fn entry_and_versions() -> (MasterSchemaEntry, Vec<Version>, PathBuf) {
        let mut full = build_test_header(512, 2);
        full.resize(512, 0);
        full[100] = 0x0d;
        full[105..107].copy_from_slice(&512_u16.to_be_bytes());
        full.extend(build_table_leaf(512, &[(1, person_record("ada", 36))]));
        let path = write_temp("base", &full);
        let db = Rc::new(Database::open(&path, true).unwrap());
        let history = VersionHistory::new(db, None).unwrap();
        let versions = history.versions().unwrap();
        let parsed =
            parse_create_table_statement("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)")
                .unwrap();
        let entry = MasterSchemaEntry {
            row_type: MasterSchemaRowType::Table,
            name: parsed.table_name.clone(),
            table_name: parsed.table_name.clone(),
            root_page: 2,
            sql: None,
            column_definitions: parsed.columns,
            internal_schema_object: false,
            without_row_id: false,
            virtual_table: false,
        };
        (entry, versions, path)
    }

    #[test]
    fn test_page_records_iteration() {
        let bytes = journal_bytes(&[(2, vec![0x0d]), (3, vec![0x05])], 512, 0);
        let path = write_temp("records", &bytes);
        let journal = RollbackJournal::open(&path).unwrap();
        let records = journal.page_records(512);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].page_number, 2);
        assert_eq!(records[0].page_type(), Some(BTreePageType::TableLeaf));
        assert_eq!(records[0].checksum, Some(0xdead_beef));
        assert!(!records[0].truncated);
        assert_eq!(records[1].page_type(), Some(BTreePageType::TableInterior));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_truncated_trailing_record() {
        let bytes = journal_bytes(&[(2, vec![0x0d]), (3, vec![0x0d])], 512, 100);
        let path = write_temp("truncated", &bytes);
        let journal = RollbackJournal::open(&path).unwrap();
        let records = journal.page_records(512);
        assert_eq!(records.len(), 2);
        assert!(records[1].truncated);
        assert!(records[1].checksum.is_none());
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_carve_journaled_deleted_row() {
        // A journaled pre-image page still holding a row that was deleted
        // from the live database.
        let page = build_table_leaf(
            512,
            &[(1, person_record("ada", 36)), (2, person_record("bob", 41))],
        );
        let bytes = journal_bytes(&[(2, page), (9, vec![0x02; 16])], 512, 0);
        let journal_path = write_temp("carve", &bytes);
        let journal = RollbackJournal::open(&journal_path).unwrap();

        let (entry, versions, base_path) = entry_and_versions();
        let signature = Signature::build(&versions, &entry).unwrap();
        let commits =
            RollbackJournalCarver::carve(&journal, &versions[0], &entry, &signature).unwrap();

        // Only the 0x0d record produces a commit; the 0x02 record is an
        // index page and is skipped.
        assert_eq!(commits.len(), 1);
        let commit = &commits[0];
        assert_eq!(commit.file_type, CommitFileType::RollbackJournal);
        assert_eq!(commit.version_number, -1);
        assert!(commit.updated);
        assert!(commit
            .carved_cells
            .iter()
            .any(|c| c.values.get(1) == Some(&OwnedValue::Text(b"bob".to_vec()))));
        std::fs::remove_file(journal_path).ok();
        std::fs::remove_file(base_path).ok();
    }
}
