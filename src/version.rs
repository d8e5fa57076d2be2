//! version composes the base database with committed WAL transactions into
//! an ordered chain of point-in-time views of the file.
//!
//! Version 0 is the base database; version i applies the first i committed
//! WAL transactions. Each version resolves a page from the latest frame in
//! any commit up to it, falling back to the base file, so unchanged pages
//! stay byte-identical across the chain.

use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use tracing::warn;

use crate::btree::PageSource;
use crate::database::{Database, PageNum};
use crate::dbheader::TextEncoding;
use crate::schema::MasterSchema;
use crate::wal::Wal;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Error reading database page: {0}")]
    Database(#[from] crate::database::Error),
    #[error("WAL page size {wal} does not match the database page size {database}.")]
    PageSizeMismatch { wal: u32, database: u32 },
    #[error("Commit {commit} reports a database of zero pages.")]
    ZeroSizeCommit { commit: usize },
}

/// One point-in-time view of the database file.
///
/// A version borrows nothing from its history: it holds the shared database
/// handle and `Rc` clones of the frame pages that apply to it, so it stays
/// usable after the iterator producing it is gone.
#[derive(Clone)]
pub struct Version {
    database: Rc<Database>,
    version_number: usize,
    /// Latest frame image for every page changed in any commit <= this one.
    frame_pages: HashMap<PageNum, Rc<Vec<u8>>>,
    /// For changed pages, the version that last changed them. Pages absent
    /// here are still at their base-file state (version 0).
    page_version_index: HashMap<PageNum, usize>,
    /// Pages changed by this version's own commit.
    pages_modified: BTreeSet<PageNum>,
    database_size_in_pages: u32,
    master_schema_modified: bool,
}

impl Version {
    pub fn version_number(&self) -> usize {
        self.version_number
    }

    pub fn database(&self) -> &Rc<Database> {
        &self.database
    }

    pub fn database_size_in_pages(&self) -> u32 {
        self.database_size_in_pages
    }

    /// Pages changed by the commit that produced this version. Empty for
    /// version 0.
    pub fn pages_modified(&self) -> &BTreeSet<PageNum> {
        &self.pages_modified
    }

    /// True when page 1 or any schema root page changed in this version.
    pub fn master_schema_modified(&self) -> bool {
        self.master_schema_modified
    }

    /// The version that last changed page `p`.
    pub fn page_version(&self, p: PageNum) -> usize {
        self.page_version_index.get(&p).copied().unwrap_or(0)
    }

    pub fn page_version_index(&self) -> &HashMap<PageNum, usize> {
        &self.page_version_index
    }

    pub fn text_encoding(&self) -> TextEncoding {
        self.database.text_encoding()
    }

    pub fn strict(&self) -> bool {
        self.database.strict()
    }
}

impl PageSource for Version {
    fn page(&self, n: PageNum) -> Result<Rc<Vec<u8>>, crate::database::Error> {
        if n == 0 {
            return Err(crate::database::Error::PageZero);
        }
        if n > self.database_size_in_pages {
            return Err(crate::database::Error::PageOutOfRange {
                page: n,
                count: self.database_size_in_pages,
            });
        }
        if let Some(p) = self.frame_pages.get(&n) {
            return Ok(Rc::clone(p));
        }
        self.database.page(n)
    }

    fn page_size(&self) -> u32 {
        self.database.page_size()
    }

    fn usable_page_size(&self) -> usize {
        self.database.usable_page_size()
    }

    fn page_count(&self) -> u32 {
        self.database_size_in_pages
    }
}

/// The ordered chain of versions for a database and its optional WAL.
pub struct VersionHistory {
    database: Rc<Database>,
    wal: Option<Wal>,
}

impl VersionHistory {
    pub fn new(database: Rc<Database>, wal: Option<Wal>) -> Result<VersionHistory, Error> {
        if let Some(wal) = &wal {
            if wal.page_size() != database.page_size() {
                return Err(Error::PageSizeMismatch {
                    wal: wal.page_size(),
                    database: database.page_size(),
                });
            }
        }
        Ok(VersionHistory { database, wal })
    }

    pub fn database(&self) -> &Rc<Database> {
        &self.database
    }

    pub fn wal(&self) -> Option<&Wal> {
        self.wal.as_ref()
    }

    /// Number of versions: the base plus one per committed transaction.
    pub fn version_count(&self) -> usize {
        1 + self.wal.as_ref().map_or(0, |w| w.commits().len())
    }

    /// Iterate the chain, materializing one version at a time.
    pub fn iter(&self) -> VersionIter<'_> {
        VersionIter {
            history: self,
            next_version: 0,
            frame_pages: HashMap::new(),
            page_version_index: HashMap::new(),
            schema_pages: BTreeSet::new(),
        }
    }

    /// Materialize the whole chain.
    pub fn versions(&self) -> Result<Vec<Version>, Error> {
        self.iter().collect()
    }
}

pub struct VersionIter<'h> {
    history: &'h VersionHistory,
    next_version: usize,
    frame_pages: HashMap<PageNum, Rc<Vec<u8>>>,
    page_version_index: HashMap<PageNum, usize>,
    /// Pages whose change means the master schema may have changed: page 1,
    /// the master b-tree pages, and every schema root page, as of the
    /// previous version.
    schema_pages: BTreeSet<PageNum>,
}

impl<'h> VersionIter<'h> {
    fn schema_pages_of(&self, version: &Version) -> BTreeSet<PageNum> {
        let mut pages: BTreeSet<PageNum> = BTreeSet::new();
        pages.insert(crate::schema::SCHEMA_BTREE_ROOT_PAGENUM);
        match crate::btree::table::walk(version, crate::schema::SCHEMA_BTREE_ROOT_PAGENUM, false) {
            Ok(walk) => pages.extend(walk.page_numbers.iter().copied()),
            Err(e) => warn!(
                component = "version",
                version = version.version_number(),
                error = %e,
                "failed to walk the master schema b-tree for change tracking"
            ),
        }
        match MasterSchema::parse(version, version.text_encoding(), false) {
            Ok(schema) => pages.extend(schema.root_pages()),
            Err(e) => warn!(
                component = "version",
                version = version.version_number(),
                error = %e,
                "failed to parse the master schema for change tracking"
            ),
        }
        pages
    }
}

impl<'h> Iterator for VersionIter<'h> {
    type Item = Result<Version, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let history = self.history;
        let version_number = self.next_version;
        if version_number >= history.version_count() {
            return None;
        }
        self.next_version += 1;

        let version = if version_number == 0 {
            Version {
                database: Rc::clone(&history.database),
                version_number: 0,
                frame_pages: HashMap::new(),
                page_version_index: HashMap::new(),
                pages_modified: BTreeSet::new(),
                database_size_in_pages: history.database.page_count(),
                master_schema_modified: false,
            }
        } else {
            let commit = &history.wal.as_ref().expect("versions beyond 0 imply a WAL").commits()
                [version_number - 1];
            if commit.db_size_after_commit == 0 {
                return Some(Err(Error::ZeroSizeCommit { commit: version_number - 1 }));
            }
            let mut pages_modified = BTreeSet::new();
            for frame in &commit.frames {
                self.frame_pages.insert(frame.page_number, Rc::clone(&frame.page_data));
                self.page_version_index.insert(frame.page_number, version_number);
                pages_modified.insert(frame.page_number);
            }
            let master_schema_modified =
                pages_modified.intersection(&self.schema_pages).next().is_some();
            Version {
                database: Rc::clone(&history.database),
                version_number,
                frame_pages: self.frame_pages.clone(),
                page_version_index: self.page_version_index.clone(),
                pages_modified,
                database_size_in_pages: commit.db_size_after_commit,
                master_schema_modified,
            }
        };

        self.schema_pages = self.schema_pages_of(&version);
        Some(Ok(version))
    }
}
