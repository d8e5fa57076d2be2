//! database opens a main database file and exposes its pages by number.
//!
//! The reader is strictly read-only: forensic inputs must never be modified
//! while being parsed. Pages are loaded on demand and cached as `Rc` slices
//! so that versions and cells can share them without copying.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::warn;

use crate::dbheader;
use crate::dbheader::{DbHeader, TextEncoding};

// Page numbers are 1-based, to match how SQLite numbers pages.
pub type PageNum = u32;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Error accessing database file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Error in database header: {0}")]
    Header(#[from] dbheader::Error),
    #[error("Page number {page} out of range; the database has {count} pages.")]
    PageOutOfRange { page: PageNum, count: u32 },
    #[error("Page number 0 is not a valid page number.")]
    PageZero,
    #[error("Page {page} is truncated: wanted {wanted} bytes, file holds {got}.")]
    TruncatedPage { page: PageNum, wanted: usize, got: usize },
    #[error("The file is empty.")]
    EmptyFile,
    #[error("A WAL and a rollback journal were both supplied; a database uses one journal mode at a time.")]
    ConflictingJournals,
}

/// One open database file with a lazy read-only page cache.
pub struct Database {
    path: PathBuf,
    file: RefCell<std::fs::File>,
    header: DbHeader,
    file_size: u64,
    page_count: u32,
    strict: bool,
    pages: RefCell<HashMap<PageNum, Rc<Vec<u8>>>>,
}

impl Database {
    /// Open and validate a database file.
    ///
    /// With `strict` set, any header field outside the format spec is fatal;
    /// otherwise violations are logged and parsing continues.
    pub fn open<P: AsRef<Path>>(path: P, strict: bool) -> Result<Database, Error> {
        let path = path.as_ref().to_path_buf();
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(false)
            .create(false)
            .open(&path)?;
        let file_size = file.seek(SeekFrom::End(0))?;
        if file_size == 0 {
            return Err(Error::EmptyFile);
        }
        let header = dbheader::parse_header(&mut file, strict)?;

        // The in-header size is authoritative when present; files written
        // before SQLite 3.7.0 leave it zero and the file size decides.
        let derived = (file_size / header.page_size as u64) as u32;
        let page_count = if header.database_size_in_pages != 0 {
            if header.database_size_in_pages != derived && derived != 0 {
                warn!(
                    component = "database",
                    in_header = header.database_size_in_pages,
                    from_file_size = derived,
                    "in-header database size disagrees with the file size"
                );
            }
            header.database_size_in_pages
        } else {
            derived
        };

        Ok(Database {
            path,
            file: RefCell::new(file),
            header,
            file_size,
            page_count,
            strict,
            pages: RefCell::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &DbHeader {
        &self.header
    }

    pub fn page_size(&self) -> u32 {
        self.header.page_size
    }

    pub fn usable_page_size(&self) -> usize {
        self.header.usable_page_size()
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn text_encoding(&self) -> TextEncoding {
        self.header.text_encoding
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn strict(&self) -> bool {
        self.strict
    }

    /// The bytes of page `n` (1-based). Cached after the first read.
    pub fn page(&self, n: PageNum) -> Result<Rc<Vec<u8>>, Error> {
        if n == 0 {
            return Err(Error::PageZero);
        }
        if n > self.page_count {
            return Err(Error::PageOutOfRange { page: n, count: self.page_count });
        }
        if let Some(p) = self.pages.borrow().get(&n) {
            return Ok(Rc::clone(p));
        }
        let page_size = self.header.page_size as usize;
        let mut buf = vec![0_u8; page_size];
        let offset = (n as u64 - 1) * page_size as u64;
        let got = {
            let mut f = self.file.borrow_mut();
            f.seek(SeekFrom::Start(offset))?;
            read_up_to(&mut *f, &mut buf)?
        };
        if got < page_size {
            if self.strict {
                return Err(Error::TruncatedPage { page: n, wanted: page_size, got });
            }
            warn!(
                component = "database",
                page = n,
                wanted = page_size,
                got,
                "short page read, padding with zeros"
            );
        }
        let page = Rc::new(buf);
        self.pages.borrow_mut().insert(n, Rc::clone(&page));
        Ok(page)
    }
}

fn read_up_to<R: Read>(r: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
