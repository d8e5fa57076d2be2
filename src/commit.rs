//! commit derives per-table, per-version change records: which cells were
//! added, updated or deleted between adjacent versions, plus whatever the
//! carver recovered from the table's dead bytes at that version.

use std::collections::{BTreeMap, HashMap, HashSet};

use byteorder::{BigEndian, ByteOrder};
use itertools::Itertools;
use tracing::warn;

use crate::btree::page::BTreePage;
use crate::btree::table as btree_table;
use crate::btree::{BTreePageType, PageSource};
use crate::carve::{CarveLocation, CarvedCell, Carver};
use crate::database::PageNum;
use crate::record::Record;
use crate::schema::{MasterSchemaEntry, MasterSchemaRowType};
use crate::serial_type::OwnedValue;
use crate::signature::Signature;
use crate::version::Version;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Error walking b-tree for commit: {0}")]
    BTree(#[from] crate::btree::Error),
    #[error("Error decoding record for commit: {0}")]
    Record(#[from] crate::record::Error),
    #[error("Error reading page for commit: {0}")]
    Database(#[from] crate::database::Error),
    #[error("Error preparing carver: {0}")]
    Carve(#[from] crate::carve::Error),
}

/// Which file the cells of a commit were observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitFileType {
    Database,
    WriteAheadLog,
    RollbackJournal,
}

impl std::fmt::Display for CommitFileType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CommitFileType::Database => write!(f, "database"),
            CommitFileType::WriteAheadLog => write!(f, "write ahead log"),
            CommitFileType::RollbackJournal => write!(f, "rollback journal"),
        }
    }
}

/// One live cell in a commit's added/updated/deleted sets.
#[derive(Debug, Clone)]
pub struct CommitCell {
    pub page_number: PageNum,
    pub cell_start_offset: usize,
    /// Rowid for table b-trees; index b-trees key by payload digest.
    pub row_id: Option<i64>,
    pub payload_md5: [u8; 16],
    pub serial_types: Vec<i64>,
    pub values: Vec<OwnedValue>,
}

impl CommitCell {
    pub fn md5_hex(&self) -> String {
        hex::encode(self.payload_md5)
    }
}

/// The change record for one (table, version) pair.
#[derive(Debug, Clone)]
pub struct Commit {
    pub name: String,
    pub file_type: CommitFileType,
    /// Version the commit belongs to; -1 for rollback-journal carvings,
    /// which hold pre-image data with no place in the version chain.
    pub version_number: i64,
    pub page_type: BTreePageType,
    pub root_page_number: PageNum,
    pub b_tree_page_numbers: Vec<PageNum>,
    pub added_cells: Vec<CommitCell>,
    pub updated_cells: Vec<CommitCell>,
    pub deleted_cells: Vec<CommitCell>,
    /// Carved cells keep scan order; their rowids are not deterministic.
    pub carved_cells: Vec<CarvedCell>,
    pub updated: bool,
}

impl Commit {
    fn new(
        name: String,
        file_type: CommitFileType,
        version_number: i64,
        page_type: BTreePageType,
        root_page_number: PageNum,
    ) -> Commit {
        Commit {
            name,
            file_type,
            version_number,
            page_type,
            root_page_number,
            b_tree_page_numbers: Vec::new(),
            added_cells: Vec::new(),
            updated_cells: Vec::new(),
            deleted_cells: Vec::new(),
            carved_cells: Vec::new(),
            updated: false,
        }
    }
}

/// Walks one schema entry across the version chain, yielding a [`Commit`]
/// for every version in which any page of the entry's b-tree changed.
pub struct VersionHistoryParser<'a> {
    versions: &'a [Version],
    entry: &'a MasterSchemaEntry,
    carver: Option<Carver<'a>>,
    carve_freelists: bool,
    next_index: usize,
    previous: Option<TreeSnapshot>,
    /// Digests of cells already carved in earlier versions, so a commit only
    /// reports newly surfaced residue.
    carved_seen: HashSet<[u8; 16]>,
}

struct TreeSnapshot {
    pages: Vec<PageNum>,
    cells: BTreeMap<CellKey, CommitCell>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum CellKey {
    RowId(i64),
    PayloadDigest([u8; 16]),
}

impl<'a> VersionHistoryParser<'a> {
    /// `signature` enables carving; without it only the live diff is
    /// produced. `carve_freelists` extends carving to freelist pages.
    pub fn new(
        versions: &'a [Version],
        entry: &'a MasterSchemaEntry,
        signature: Option<&'a Signature>,
        carve_freelists: bool,
    ) -> Result<VersionHistoryParser<'a>, Error> {
        let carver = match signature {
            Some(signature) => Some(Carver::new(signature)?),
            None => None,
        };
        Ok(VersionHistoryParser {
            versions,
            entry,
            carver,
            carve_freelists,
            next_index: 0,
            previous: None,
            carved_seen: HashSet::new(),
        })
    }

    fn page_type(&self) -> BTreePageType {
        match self.entry.row_type {
            MasterSchemaRowType::Index => BTreePageType::IndexLeaf,
            _ => BTreePageType::TableLeaf,
        }
    }

    fn snapshot(&self, version: &Version) -> Result<TreeSnapshot, Error> {
        let strict = version.strict();
        let walk = btree_table::walk(version, self.entry.root_page, strict)?;
        let mut cells = BTreeMap::new();
        for cell in &walk.cells {
            let record = match Record::parse(&cell.payload) {
                Ok(r) => r,
                Err(e) if strict => return Err(e.into()),
                Err(e) => {
                    warn!(
                        component = "commit",
                        table = %self.entry.name,
                        version = version.version_number(),
                        page = cell.page_number,
                        offset = cell.cell_start_offset,
                        error = %e,
                        "unparsable record during b-tree walk, partial data emitted"
                    );
                    continue;
                }
            };
            let digest = md5::compute(&cell.payload).0;
            let key = match cell.row_id {
                Some(row_id) => CellKey::RowId(row_id),
                None => CellKey::PayloadDigest(digest),
            };
            cells.insert(
                key,
                CommitCell {
                    page_number: cell.page_number,
                    cell_start_offset: cell.cell_start_offset,
                    row_id: cell.row_id,
                    payload_md5: digest,
                    serial_types: record.columns.iter().map(|c| c.serial_type).collect(),
                    values: record.columns.iter().map(|c| c.value.to_owned()).collect(),
                },
            );
        }
        Ok(TreeSnapshot { pages: walk.page_numbers, cells })
    }

    fn tree_changed(&self, version: &Version, previous: &TreeSnapshot) -> bool {
        if version.master_schema_modified() {
            return true;
        }
        previous.pages.iter().any(|p| version.pages_modified().contains(p))
    }

    fn carve_version(&mut self, version: &Version, snapshot: &TreeSnapshot, commit: &mut Commit) {
        let carver = match self.carver.as_ref() {
            Some(c) => c,
            None => return,
        };
        let carved_seen = &mut self.carved_seen;
        let leaf_pages: Vec<PageNum> = snapshot
            .pages
            .iter()
            .copied()
            .filter(|p| {
                // Only leaf pages hold record residue worth scanning.
                match version.page(*p) {
                    Ok(bytes) => BTreePage::parse(&bytes, *p, version.usable_page_size(), false)
                        .map(|page| page.page_type().is_leaf())
                        .unwrap_or(false),
                    Err(_) => false,
                }
            })
            .collect();
        for page_number in leaf_pages {
            let bytes = match version.page(page_number) {
                Ok(b) => b,
                Err(e) => {
                    warn!(
                        component = "commit",
                        page = page_number,
                        error = %e,
                        "failed to read leaf page for carving"
                    );
                    continue;
                }
            };
            let page = match BTreePage::parse(&bytes, page_number, version.usable_page_size(), false)
            {
                Ok(p) => p,
                Err(_) => continue,
            };
            let (unalloc_start, _) = page.unallocated_range();
            let carved = carver.carve_unallocated(
                page_number,
                page.unallocated_bytes(),
                unalloc_start,
                CarveLocation::UnallocatedSpace,
            );
            absorb_carvings(carved_seen, commit, carved);
            match page.freeblocks() {
                Ok(freeblocks) => {
                    let carved = carver.carve_freeblocks(page_number, &bytes, &freeblocks);
                    absorb_carvings(carved_seen, commit, carved);
                }
                Err(e) => warn!(
                    component = "commit",
                    page = page_number,
                    error = %e,
                    "failed to walk freeblocks for carving"
                ),
            }
        }
        if self.carve_freelists {
            self.carve_freelist_pages(version, commit);
        }
    }

    fn carve_freelist_pages(&mut self, version: &Version, commit: &mut Commit) {
        let carver = match self.carver.as_ref() {
            Some(c) => c,
            None => return,
        };
        let freelist = match read_freelist(version) {
            Ok(f) => f,
            Err(e) => {
                warn!(component = "commit", error = %e, "failed to walk the freelist");
                return;
            }
        };
        let mut carved_all = Vec::new();
        for page_number in freelist.leaves {
            match version.page(page_number) {
                Ok(bytes) => {
                    carved_all.extend(carver.carve_unallocated(
                        page_number,
                        &bytes,
                        0,
                        CarveLocation::FreelistLeafPage,
                    ));
                }
                Err(e) => {
                    warn!(
                        component = "commit",
                        page = page_number,
                        error = %e,
                        "failed to read freelist leaf page"
                    );
                }
            }
        }
        for (page_number, content_start) in freelist.trunk_tails {
            if let Ok(bytes) = version.page(page_number) {
                carved_all.extend(carver.carve_unallocated(
                    page_number,
                    &bytes[content_start..],
                    content_start,
                    CarveLocation::FreelistLeafPage,
                ));
            }
        }
        absorb_carvings(&mut self.carved_seen, commit, carved_all);
    }
}

/// Keep only carvings whose digest has not surfaced in an earlier version,
/// so commits report new residue instead of repeating old finds.
fn absorb_carvings(
    carved_seen: &mut HashSet<[u8; 16]>,
    commit: &mut Commit,
    carved: Vec<CarvedCell>,
) {
    for cell in carved {
        if carved_seen.insert(cell.md5_digest) {
            commit.carved_cells.push(cell);
        }
    }
}

impl<'a> Iterator for VersionHistoryParser<'a> {
    type Item = Result<Commit, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let version = self.versions.get(self.next_index)?;
            self.next_index += 1;

            if let Some(previous) = &self.previous {
                if !self.tree_changed(version, previous) {
                    continue;
                }
            }

            let snapshot = match self.snapshot(version) {
                Ok(s) => s,
                Err(e) => return Some(Err(e)),
            };

            let mut commit = Commit::new(
                self.entry.name.clone(),
                if version.version_number() == 0 {
                    CommitFileType::Database
                } else {
                    CommitFileType::WriteAheadLog
                },
                version.version_number() as i64,
                self.page_type(),
                self.entry.root_page,
            );
            commit.b_tree_page_numbers = snapshot.pages.clone();

            let empty = BTreeMap::new();
            let previous_cells = self.previous.as_ref().map(|p| &p.cells).unwrap_or(&empty);
            for (key, cell) in &snapshot.cells {
                match previous_cells.get(key) {
                    None => commit.added_cells.push(cell.clone()),
                    Some(old) if old.payload_md5 != cell.payload_md5 => {
                        commit.updated_cells.push(cell.clone())
                    }
                    Some(_) => {}
                }
            }
            for (key, cell) in previous_cells {
                if !snapshot.cells.contains_key(key) {
                    commit.deleted_cells.push(cell.clone());
                }
            }
            // Deterministic emission order: rowid for tables, digest for
            // indexes (BTreeMap iteration already sorts, but deleted cells
            // come from the previous map and are re-sorted for clarity).
            for cells in [
                &mut commit.added_cells,
                &mut commit.updated_cells,
                &mut commit.deleted_cells,
            ] {
                cells.sort_by(|a, b| match (a.row_id, b.row_id) {
                    (Some(x), Some(y)) => x.cmp(&y),
                    _ => a.payload_md5.cmp(&b.payload_md5),
                });
            }

            self.carve_version(version, &snapshot, &mut commit);

            commit.updated = !commit.added_cells.is_empty()
                || !commit.updated_cells.is_empty()
                || !commit.deleted_cells.is_empty()
                || !commit.carved_cells.is_empty();

            self.previous = Some(snapshot);
            return Some(Ok(commit));
        }
    }
}

/// The freelist of one version: leaf pages hold nothing but dead content;
/// trunk pages hold dead content past their pointer array.
pub struct Freelist {
    pub trunks: Vec<PageNum>,
    pub leaves: Vec<PageNum>,
    /// (trunk page, offset where dead bytes begin).
    pub trunk_tails: Vec<(PageNum, usize)>,
}

/// Walk the freelist trunk chain from the database header fields on page 1.
pub fn read_freelist<S: PageSource>(source: &S) -> Result<Freelist, crate::database::Error> {
    let page1 = source.page(1)?;
    let first_trunk = BigEndian::read_u32(&page1[32..36]);
    let total_count = BigEndian::read_u32(&page1[36..40]);
    let mut freelist =
        Freelist { trunks: Vec::new(), leaves: Vec::new(), trunk_tails: Vec::new() };
    let mut visited: HashSet<PageNum> = HashSet::new();
    let mut trunk = first_trunk;
    while trunk != 0 && trunk <= source.page_count() {
        if !visited.insert(trunk) {
            warn!(component = "commit", page = trunk, "freelist trunk chain loops, stopping");
            break;
        }
        let bytes = source.page(trunk)?;
        let next_trunk = BigEndian::read_u32(&bytes[0..4]);
        let leaf_count = BigEndian::read_u32(&bytes[4..8]) as usize;
        let max_leaves = (source.usable_page_size() - 8) / 4;
        let leaf_count = leaf_count.min(max_leaves);
        for i in 0..leaf_count {
            let leaf = BigEndian::read_u32(&bytes[8 + 4 * i..12 + 4 * i]);
            if leaf != 0 && leaf <= source.page_count() {
                freelist.leaves.push(leaf);
            }
        }
        freelist.trunks.push(trunk);
        freelist.trunk_tails.push((trunk, 8 + 4 * leaf_count));
        trunk = next_trunk;
    }
    if freelist.trunks.len() + freelist.leaves.len() > total_count as usize {
        warn!(
            component = "commit",
            counted = freelist.trunks.len() + freelist.leaves.len(),
            in_header = total_count,
            "freelist walk found more pages than the header declares"
        );
    }
    Ok(freelist)
}

/// The commits of every requested table of a version chain, in ascending
/// (table, version) order, for drivers that want the whole picture at once.
pub fn all_commits(
    versions: &[Version],
    entries: &[&MasterSchemaEntry],
    signatures: &HashMap<String, Signature>,
    carve_freelists: bool,
) -> Result<Vec<Commit>, Error> {
    let mut commits = Vec::new();
    for entry in entries.iter().sorted_by(|a, b| a.name.cmp(&b.name)) {
        let signature = signatures.get(&entry.name);
        let parser = VersionHistoryParser::new(versions, entry, signature, carve_freelists)?;
        for commit in parser {
            commits.push(commit?);
        }
    }
    Ok(commits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::page::test_support::build_table_leaf;
    use crate::database::Database;
    use crate::dbheader::build_test_header;
    use crate::schema::parse_create_table_statement;
    use crate::version::VersionHistory;
    use crate::wal::test_support::WalBuilder;
    use crate::wal::Wal;
    use std::path::PathBuf;
    use std::rc::Rc;

    fn entry_for(sql: &str, root_page: PageNum) -> MasterSchemaEntry {
        let parsed = parse_create_table_statement(sql).unwrap();
        MasterSchemaEntry {
            row_type: MasterSchemaRowType::Table,
            name: parsed.table_name.clone(),
            table_name: parsed.table_name.clone(),
            root_page,
            sql: Some(sql.to_string()),
            column_definitions: parsed.columns,
            internal_schema_object: false,
            without_row_id: parsed.without_row_id,
            virtual_table: false,
        }
    }

    /// Record for (id INTEGER PRIMARY KEY, name TEXT, age INTEGER): the
    /// rowid alias column stores NULL.
    fn person_record(name: &str, age: i64) -> Vec<u8> {
        let mut record = vec![4, 0x00, (13 + 2 * name.len()) as u8, 0x01];
        record.extend_from_slice(name.as_bytes());
        record.push(age as u8);
        record
    }

    fn write_temp(name: &str, bytes: &[u8]) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("sqlite_scour_committest_{}_{}", std::process::id(), name));
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn base_db(rows: &[(i64, Vec<u8>)]) -> Vec<u8> {
        let mut full = build_test_header(512, 2);
        full.resize(512, 0);
        full[100] = 0x0d;
        full[105..107].copy_from_slice(&512_u16.to_be_bytes());
        full.extend(build_table_leaf(512, rows));
        full
    }

    #[test]
    fn test_base_version_commit_adds_all_rows() {
        let rows = vec![(1, person_record("ada", 36)), (2, person_record("bob", 41))];
        let path = write_temp("adds", &base_db(&rows));
        let db = Rc::new(Database::open(&path, true).unwrap());
        let history = VersionHistory::new(db, None).unwrap();
        let versions = history.versions().unwrap();
        let entry = entry_for("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)", 2);
        let parser = VersionHistoryParser::new(&versions, &entry, None, false).unwrap();
        let commits: Vec<Commit> = parser.map(|c| c.unwrap()).collect();
        assert_eq!(commits.len(), 1);
        let c = &commits[0];
        assert_eq!(c.version_number, 0);
        assert_eq!(c.file_type, CommitFileType::Database);
        assert_eq!(c.added_cells.len(), 2);
        assert_eq!(c.added_cells[0].row_id, Some(1));
        assert_eq!(c.added_cells[1].row_id, Some(2));
        assert_eq!(
            c.added_cells[0].values,
            vec![
                OwnedValue::Null,
                OwnedValue::Text(b"ada".to_vec()),
                OwnedValue::Int(36)
            ]
        );
        assert!(c.updated);
        assert!(c.deleted_cells.is_empty());
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_wal_version_commit_diffs_added_row() {
        let rows = vec![(1, person_record("ada", 36)), (2, person_record("bob", 41))];
        let path = write_temp("diff", &base_db(&rows));
        let db = Rc::new(Database::open(&path, true).unwrap());

        let new_rows = vec![
            (1, person_record("ada", 36)),
            (2, person_record("bob", 41)),
            (3, person_record("cy", 29)),
        ];
        let mut wal = WalBuilder::new(512);
        wal.push_frame(2, 2, &build_table_leaf(512, &new_rows));
        let wal_path = write_temp("diff.wal", &wal.into_bytes());
        let wal = Wal::open(&wal_path, true).unwrap();

        let history = VersionHistory::new(db, Some(wal)).unwrap();
        let versions = history.versions().unwrap();
        let entry = entry_for("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)", 2);
        let parser = VersionHistoryParser::new(&versions, &entry, None, false).unwrap();
        let commits: Vec<Commit> = parser.map(|c| c.unwrap()).collect();
        assert_eq!(commits.len(), 2);
        let c1 = &commits[1];
        assert_eq!(c1.version_number, 1);
        assert_eq!(c1.file_type, CommitFileType::WriteAheadLog);
        assert_eq!(c1.added_cells.len(), 1);
        assert_eq!(c1.added_cells[0].row_id, Some(3));
        assert!(c1.updated_cells.is_empty());
        assert!(c1.deleted_cells.is_empty());
        assert_eq!(versions[1].page_version(2), 1);
        std::fs::remove_file(path).ok();
        std::fs::remove_file(wal_path).ok();
    }

    #[test]
    fn test_untouched_tree_yields_empty_commit() {
        let rows = vec![(1, person_record("ada", 36))];
        let path = write_temp("unchanged", &base_db(&rows));
        let db = Rc::new(Database::open(&path, true).unwrap());
        // The WAL rewrites only page 1, untouched by table t's b-tree.
        let page1 = db.page(1).unwrap().to_vec();
        let mut wal = WalBuilder::new(512);
        wal.push_frame(1, 2, &page1);
        let wal_path = write_temp("unchanged.wal", &wal.into_bytes());
        let wal = Wal::open(&wal_path, true).unwrap();
        let history = VersionHistory::new(db, Some(wal)).unwrap();
        let versions = history.versions().unwrap();
        let entry = entry_for("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)", 2);
        let parser = VersionHistoryParser::new(&versions, &entry, None, false).unwrap();
        let commits: Vec<Commit> = parser.map(|c| c.unwrap()).collect();
        // Page 1 counts as a schema page, so the parser re-walks; but the
        // tree itself is unchanged, producing an empty commit.
        for c in commits.iter().skip(1) {
            assert!(c.added_cells.is_empty());
            assert!(c.deleted_cells.is_empty());
            assert!(c.updated_cells.is_empty());
            assert!(!c.updated);
        }
        std::fs::remove_file(path).ok();
        std::fs::remove_file(wal_path).ok();
    }

    #[test]
    fn test_deleted_row_detected_and_carved() {
        let rows = vec![(1, person_record("ada", 36)), (2, person_record("bob", 41))];
        let path = write_temp("delete", &base_db(&rows));
        let db = Rc::new(Database::open(&path, true).unwrap());

        // Version 1 drops rowid 2; SQLite would turn the dead cell into a
        // freeblock whose header overwrites the cell preamble.
        let mut new_page = build_table_leaf(512, &[(1, person_record("ada", 36))]);
        let bob = person_record("bob", 41);
        let mut bob_cell = crate::varint::encode(bob.len() as i64);
        bob_cell.extend(crate::varint::encode(2));
        bob_cell.extend(&bob);
        let ada_cell_len = 2 + person_record("ada", 36).len();
        let bob_start = 512 - ada_cell_len - bob_cell.len();
        new_page[bob_start..bob_start + bob_cell.len()].copy_from_slice(&bob_cell);
        // Freeblock header over the first 4 bytes of the dead cell.
        new_page[1..3].copy_from_slice(&(bob_start as u16).to_be_bytes());
        new_page[bob_start..bob_start + 2].copy_from_slice(&0_u16.to_be_bytes());
        new_page[bob_start + 2..bob_start + 4]
            .copy_from_slice(&(bob_cell.len() as u16).to_be_bytes());

        let mut wal = WalBuilder::new(512);
        wal.push_frame(2, 2, &new_page);
        let wal_path = write_temp("delete.wal", &wal.into_bytes());
        let wal = Wal::open(&wal_path, true).unwrap();

        let history = VersionHistory::new(db, Some(wal)).unwrap();
        let versions = history.versions().unwrap();
        let entry = entry_for("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)", 2);
        let signature = Signature::build(&versions[..1], &entry).unwrap();
        let parser =
            VersionHistoryParser::new(&versions, &entry, Some(&signature), false).unwrap();
        let commits: Vec<Commit> = parser.map(|c| c.unwrap()).collect();
        assert_eq!(commits.len(), 2);

        let c1 = &commits[1];
        assert_eq!(c1.deleted_cells.len(), 1);
        assert_eq!(c1.deleted_cells[0].row_id, Some(2));

        // The freeblock carving recovers bob's row with the first column
        // reconstructed probabilistically.
        let carved: Vec<&CarvedCell> = c1
            .carved_cells
            .iter()
            .filter(|c| c.location == CarveLocation::Freeblock)
            .collect();
        assert_eq!(carved.len(), 1);
        let cell = carved[0];
        assert!(cell.truncated_beginning);
        assert!(cell.probabilistic_first_serial_type);
        assert_eq!(cell.values[1], OwnedValue::Text(b"bob".to_vec()));
        assert_eq!(cell.values[2], OwnedValue::Int(41));
        std::fs::remove_file(path).ok();
        std::fs::remove_file(wal_path).ok();
    }

    #[test]
    fn test_updated_row_detected() {
        let rows = vec![(1, person_record("ada", 36))];
        let path = write_temp("update", &base_db(&rows));
        let db = Rc::new(Database::open(&path, true).unwrap());
        let mut wal = WalBuilder::new(512);
        wal.push_frame(2, 2, &build_table_leaf(512, &[(1, person_record("ada", 37))]));
        let wal_path = write_temp("update.wal", &wal.into_bytes());
        let wal = Wal::open(&wal_path, true).unwrap();
        let history = VersionHistory::new(db, Some(wal)).unwrap();
        let versions = history.versions().unwrap();
        let entry = entry_for("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)", 2);
        let parser = VersionHistoryParser::new(&versions, &entry, None, false).unwrap();
        let commits: Vec<Commit> = parser.map(|c| c.unwrap()).collect();
        let c1 = &commits[1];
        assert_eq!(c1.updated_cells.len(), 1);
        assert_eq!(c1.updated_cells[0].values[2], OwnedValue::Int(37));
        assert!(c1.added_cells.is_empty());
        assert!(c1.deleted_cells.is_empty());
        std::fs::remove_file(path).ok();
        std::fs::remove_file(wal_path).ok();
    }

    #[test]
    fn test_read_freelist() {
        // Page 2: trunk with one leaf (page 3).
        let mut full = build_test_header(512, 3);
        full.resize(512, 0);
        full[100] = 0x0d;
        full[105..107].copy_from_slice(&512_u16.to_be_bytes());
        full[32..36].copy_from_slice(&2_u32.to_be_bytes());
        full[36..40].copy_from_slice(&2_u32.to_be_bytes());
        let mut trunk = vec![0_u8; 512];
        trunk[0..4].copy_from_slice(&0_u32.to_be_bytes());
        trunk[4..8].copy_from_slice(&1_u32.to_be_bytes());
        trunk[8..12].copy_from_slice(&3_u32.to_be_bytes());
        full.extend(trunk);
        full.extend(vec![0_u8; 512]);
        let path = write_temp("freelist", &full);
        let db = Database::open(&path, true).unwrap();
        let freelist = read_freelist(&db).unwrap();
        assert_eq!(freelist.trunks, vec![2]);
        assert_eq!(freelist.leaves, vec![3]);
        assert_eq!(freelist.trunk_tails, vec![(2, 12)]);
        std::fs::remove_file(path).ok();
    }
}
