//! sqlite-scour recovers data from SQLite database files: the live rows,
//! and the deleted or partially overwritten records that survive as residue
//! in unallocated page regions, freeblocks, freelist pages, write-ahead
//! logs and rollback journals.
//!
//! The pieces, bottom up:
//! - [`varint`] and [`serial_type`]: the primitive codecs of the file format.
//! - [`record`]: record header and column value decoding.
//! - [`dbheader`] and [`database`]: the main file and its page cache.
//! - [`btree`]: page headers, cells, freeblocks, overflow chains, tree walks.
//! - [`schema`]: the master schema and CREATE statement parsing.
//! - [`wal`] and [`version`]: committed WAL transactions layered over the
//!   base file as an ordered chain of versions.
//! - [`signature`] and [`carve`]: per-table serial-type profiles and the
//!   regex-directed scan of dead bytes.
//! - [`commit`]: per-table, per-version diffs with carvings attached.
//! - [`journal`]: rollback-journal page records, carved with the same engine.
//! - [`export`]: the sink interface commits are handed to.

pub mod btree;
pub mod carve;
pub mod commit;
pub mod database;
pub mod dbheader;
pub mod export;
pub mod journal;
pub mod record;
pub mod schema;
pub mod serial_type;
pub mod signature;
pub mod varint;
pub mod version;
pub mod wal;

use std::path::Path;
use std::rc::Rc;

pub use crate::carve::{CarveLocation, CarvedCell, Carver};
pub use crate::commit::{Commit, CommitFileType, VersionHistoryParser};
pub use crate::database::Database;
pub use crate::journal::{RollbackJournal, RollbackJournalCarver};
pub use crate::schema::{MasterSchema, MasterSchemaEntry};
pub use crate::signature::Signature;
pub use crate::version::{Version, VersionHistory};
pub use crate::wal::Wal;

/// Root error: every component failure converts into this at the API
/// surface, while staying matchable by kind.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Varint(#[from] varint::Error),
    #[error(transparent)]
    SerialType(#[from] serial_type::Error),
    #[error(transparent)]
    Record(#[from] record::Error),
    #[error(transparent)]
    Header(#[from] dbheader::Error),
    #[error(transparent)]
    Database(#[from] database::Error),
    #[error(transparent)]
    BTree(#[from] btree::Error),
    #[error(transparent)]
    Schema(#[from] schema::Error),
    #[error(transparent)]
    Wal(#[from] wal::Error),
    #[error(transparent)]
    Version(#[from] version::Error),
    #[error(transparent)]
    Signature(#[from] signature::Error),
    #[error(transparent)]
    Carve(#[from] carve::Error),
    #[error(transparent)]
    Commit(#[from] commit::Error),
    #[error(transparent)]
    Journal(#[from] journal::Error),
    #[error(transparent)]
    Export(#[from] export::Error),
}

/// Open and validate a main database file.
pub fn open_database<P: AsRef<Path>>(path: P, strict: bool) -> Result<Database, Error> {
    Ok(Database::open(path, strict)?)
}

/// Open and validate a write-ahead log.
pub fn open_wal<P: AsRef<Path>>(path: P, strict: bool) -> Result<Wal, Error> {
    Ok(Wal::open(path, strict)?)
}

/// Open a rollback journal.
pub fn open_journal<P: AsRef<Path>>(path: P) -> Result<RollbackJournal, Error> {
    Ok(RollbackJournal::open(path)?)
}

/// The companion journal files SQLite would use for a database path:
/// `<path>-wal` and `<path>-journal`, when they exist and are non-empty.
pub fn companion_paths<P: AsRef<Path>>(
    database_path: P,
) -> (Option<std::path::PathBuf>, Option<std::path::PathBuf>) {
    let base = database_path.as_ref().as_os_str().to_os_string();
    let probe = |suffix: &str| {
        let mut os = base.clone();
        os.push(suffix);
        let path = std::path::PathBuf::from(os);
        match std::fs::metadata(&path) {
            Ok(m) if m.len() > 0 => Some(path),
            _ => None,
        }
    };
    (probe("-wal"), probe("-journal"))
}

/// Build the version chain for a database and optional WAL, rejecting the
/// invalid combination of both journal flavors at once.
pub fn version_history(
    database: Rc<Database>,
    wal: Option<Wal>,
    journal_present: bool,
) -> Result<VersionHistory, Error> {
    if wal.is_some() && journal_present {
        return Err(database::Error::ConflictingJournals.into());
    }
    Ok(VersionHistory::new(database, wal)?)
}
