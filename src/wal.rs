//! wal parses a write-ahead log: the 32-byte header, the frames, and the
//! grouping of frames into committed transactions.
//!
//! Layout per https://www.sqlite.org/fileformat2.html#walformat : frames of
//! `24 + page_size` bytes follow the header; a frame whose
//! db-size-after-commit field is non-zero is a commit frame and ends a
//! transaction. Frame checksums are cumulative, so a single corrupt frame
//! invalidates everything after it.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::warn;

use crate::database::PageNum;

/// Magic for WALs whose checksums read the data as little-endian words.
pub const WAL_MAGIC_LITTLE_ENDIAN: u32 = 0x377f_0682;
/// Magic for WALs whose checksums read the data as big-endian words.
pub const WAL_MAGIC_BIG_ENDIAN: u32 = 0x377f_0683;
pub const WAL_FILE_FORMAT: u32 = 3_007_000;
pub const WAL_HEADER_SIZE: usize = 32;
pub const WAL_FRAME_HEADER_SIZE: usize = 24;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Error accessing WAL file: {0}")]
    Io(#[from] std::io::Error),
    #[error("The WAL file is shorter than its 32-byte header.")]
    TooShort,
    #[error("The WAL magic {0:#010x} is not a WAL magic number.")]
    BadMagic(u32),
    #[error("The WAL file format version {0} is not 3007000.")]
    UnsupportedFileFormat(u32),
    #[error("The WAL page size {0} is not a power of two in 512..=65536.")]
    InvalidPageSize(u32),
    #[error("The WAL header checksum does not match its contents.")]
    HeaderChecksumMismatch,
    #[error("WAL frame {index} is invalid: {reason}")]
    FrameParsing { index: usize, reason: &'static str },
}

#[derive(Debug, Clone, Copy)]
pub struct WalHeader {
    pub magic: u32,
    pub file_format: u32,
    pub page_size: u32,
    pub checkpoint_sequence: u32,
    pub salt1: u32,
    pub salt2: u32,
    pub checksum1: u32,
    pub checksum2: u32,
}

impl WalHeader {
    pub fn big_endian_checksums(&self) -> bool {
        self.magic == WAL_MAGIC_BIG_ENDIAN
    }
}

/// One WAL frame: a 24-byte header and one page image.
#[derive(Debug, Clone)]
pub struct WalFrame {
    /// 0-based position in the WAL.
    pub index: usize,
    pub page_number: PageNum,
    /// Size of the database in pages after a commit; zero for non-commit
    /// frames.
    pub db_size_after_commit: u32,
    pub salt1: u32,
    pub salt2: u32,
    pub checksum1: u32,
    pub checksum2: u32,
    pub page_data: Rc<Vec<u8>>,
}

impl WalFrame {
    pub fn is_commit_frame(&self) -> bool {
        self.db_size_after_commit != 0
    }
}

/// One committed transaction: a run of frames ending in a commit frame.
#[derive(Debug, Clone)]
pub struct WalCommit {
    /// 0-based commit number within the WAL.
    pub index: usize,
    pub frames: Vec<WalFrame>,
    pub db_size_after_commit: u32,
}

impl WalCommit {
    /// Page numbers touched by this commit, in frame order.
    pub fn page_numbers(&self) -> Vec<PageNum> {
        self.frames.iter().map(|f| f.page_number).collect()
    }
}

/// A parsed WAL file. Frames past the last valid commit are kept for
/// diagnostics but excluded from [`Wal::commits`].
pub struct Wal {
    path: PathBuf,
    header: WalHeader,
    commits: Vec<WalCommit>,
    uncommitted_frames: Vec<WalFrame>,
}

impl Wal {
    pub fn open<P: AsRef<Path>>(path: P, strict: bool) -> Result<Wal, Error> {
        let path = path.as_ref().to_path_buf();
        let mut bytes = Vec::new();
        std::fs::File::open(&path)?.read_to_end(&mut bytes)?;
        Self::from_bytes(path, &bytes, strict)
    }

    fn from_bytes(path: PathBuf, bytes: &[u8], strict: bool) -> Result<Wal, Error> {
        if bytes.len() < WAL_HEADER_SIZE {
            return Err(Error::TooShort);
        }
        let header = parse_header(bytes, strict)?;

        let frame_size = WAL_FRAME_HEADER_SIZE + header.page_size as usize;
        let mut commits = Vec::new();
        let mut pending: Vec<WalFrame> = Vec::new();
        let (mut s1, mut s2) = (header.checksum1, header.checksum2);
        let mut offset = WAL_HEADER_SIZE;
        let mut index = 0;
        while offset + frame_size <= bytes.len() {
            let fh = &bytes[offset..offset + WAL_FRAME_HEADER_SIZE];
            let page_data = &bytes[offset + WAL_FRAME_HEADER_SIZE..offset + frame_size];
            let frame = WalFrame {
                index,
                page_number: BigEndian::read_u32(&fh[0..]),
                db_size_after_commit: BigEndian::read_u32(&fh[4..]),
                salt1: BigEndian::read_u32(&fh[8..]),
                salt2: BigEndian::read_u32(&fh[12..]),
                checksum1: BigEndian::read_u32(&fh[16..]),
                checksum2: BigEndian::read_u32(&fh[20..]),
                page_data: Rc::new(page_data.to_vec()),
            };

            // A frame from an earlier WAL epoch: the log was checkpointed
            // and restarted, and this is stale tail data.
            if frame.salt1 != header.salt1 || frame.salt2 != header.salt2 {
                warn!(
                    component = "wal",
                    frame = index,
                    "frame salts do not match the WAL header; truncating at the last valid commit"
                );
                pending.clear();
                break;
            }

            (s1, s2) = if header.big_endian_checksums() {
                let (a, b) = checksum::<BigEndian>(s1, s2, &fh[0..8]);
                checksum::<BigEndian>(a, b, page_data)
            } else {
                let (a, b) = checksum::<LittleEndian>(s1, s2, &fh[0..8]);
                checksum::<LittleEndian>(a, b, page_data)
            };
            if (s1, s2) != (frame.checksum1, frame.checksum2) {
                warn!(
                    component = "wal",
                    frame = index,
                    "frame checksum mismatch; truncating at the last valid commit"
                );
                pending.clear();
                break;
            }

            if frame.page_number == 0 {
                warn!(
                    component = "wal",
                    frame = index,
                    "frame names page zero; truncating at the last valid commit"
                );
                pending.clear();
                break;
            }

            let is_commit = frame.is_commit_frame();
            let db_size = frame.db_size_after_commit;
            pending.push(frame);
            if is_commit {
                commits.push(WalCommit {
                    index: commits.len(),
                    frames: std::mem::take(&mut pending),
                    db_size_after_commit: db_size,
                });
            }
            offset += frame_size;
            index += 1;
        }

        if offset < bytes.len() && offset + frame_size > bytes.len() && bytes.len() > WAL_HEADER_SIZE
        {
            warn!(
                component = "wal",
                offset,
                "trailing partial frame at the end of the WAL, ignored"
            );
        }
        if !pending.is_empty() {
            warn!(
                component = "wal",
                frames = pending.len(),
                "uncommitted frames after the last commit are excluded from version composition"
            );
        }

        Ok(Wal { path, header, commits, uncommitted_frames: pending })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &WalHeader {
        &self.header
    }

    pub fn page_size(&self) -> u32 {
        self.header.page_size
    }

    /// The committed transactions, in commit order.
    pub fn commits(&self) -> &[WalCommit] {
        &self.commits
    }

    /// Frames of an open (never committed) transaction at the WAL tail.
    pub fn uncommitted_frames(&self) -> &[WalFrame] {
        &self.uncommitted_frames
    }
}

fn parse_header(bytes: &[u8], strict: bool) -> Result<WalHeader, Error> {
    let magic = BigEndian::read_u32(&bytes[0..]);
    if magic != WAL_MAGIC_LITTLE_ENDIAN && magic != WAL_MAGIC_BIG_ENDIAN {
        return Err(Error::BadMagic(magic));
    }
    let file_format = BigEndian::read_u32(&bytes[4..]);
    if file_format != WAL_FILE_FORMAT {
        if strict {
            return Err(Error::UnsupportedFileFormat(file_format));
        }
        warn!(component = "wal", file_format, "unexpected WAL file format version");
    }
    let page_size = BigEndian::read_u32(&bytes[8..]);
    if !(512..=65536).contains(&page_size) || !page_size.is_power_of_two() {
        return Err(Error::InvalidPageSize(page_size));
    }
    let header = WalHeader {
        magic,
        file_format,
        page_size,
        checkpoint_sequence: BigEndian::read_u32(&bytes[12..]),
        salt1: BigEndian::read_u32(&bytes[16..]),
        salt2: BigEndian::read_u32(&bytes[20..]),
        checksum1: BigEndian::read_u32(&bytes[24..]),
        checksum2: BigEndian::read_u32(&bytes[28..]),
    };
    let (s1, s2) = if header.big_endian_checksums() {
        checksum::<BigEndian>(0, 0, &bytes[0..24])
    } else {
        checksum::<LittleEndian>(0, 0, &bytes[0..24])
    };
    if (s1, s2) != (header.checksum1, header.checksum2) {
        if strict {
            return Err(Error::HeaderChecksumMismatch);
        }
        warn!(component = "wal", "WAL header checksum mismatch");
    }
    Ok(header)
}

// Documented: https://www.sqlite.org/fileformat2.html#walcksm
pub fn checksum<E: ByteOrder>(s1: u32, s2: u32, data: &[u8]) -> (u32, u32) {
    assert!(data.len() % 8 == 0, "checksum input must be a multiple of 8 bytes");
    let mut s1 = s1;
    let mut s2 = s2;
    for i in (0..data.len()).step_by(8) {
        s1 = s1.wrapping_add(E::read_u32(&data[i..]).wrapping_add(s2));
        s2 = s2.wrapping_add(E::read_u32(&data[i + 4..]).wrapping_add(s1));
    }
    (s1, s2)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Build a WAL with the given frames, computing all checksums so the
    /// file validates. `frames` is (page_number, db_size_after_commit,
    /// page_data) with data padded to the page size.
    pub struct WalBuilder {
        pub page_size: u32,
        pub salt1: u32,
        pub salt2: u32,
        bytes: Vec<u8>,
        s1: u32,
        s2: u32,
    }

    impl WalBuilder {
        pub fn new(page_size: u32) -> WalBuilder {
            let (salt1, salt2) = (0x11111111, 0x22222222);
            let mut header = vec![0_u8; WAL_HEADER_SIZE];
            BigEndian::write_u32(&mut header[0..], WAL_MAGIC_BIG_ENDIAN);
            BigEndian::write_u32(&mut header[4..], WAL_FILE_FORMAT);
            BigEndian::write_u32(&mut header[8..], page_size);
            BigEndian::write_u32(&mut header[12..], 0); // checkpoint sequence
            BigEndian::write_u32(&mut header[16..], salt1);
            BigEndian::write_u32(&mut header[20..], salt2);
            let (s1, s2) = checksum::<BigEndian>(0, 0, &header[0..24]);
            BigEndian::write_u32(&mut header[24..], s1);
            BigEndian::write_u32(&mut header[28..], s2);
            WalBuilder { page_size, salt1, salt2, bytes: header, s1, s2 }
        }

        pub fn push_frame(&mut self, page_number: u32, db_size_after_commit: u32, page_data: &[u8]) {
            let mut data = page_data.to_vec();
            data.resize(self.page_size as usize, 0);
            let mut fh = vec![0_u8; WAL_FRAME_HEADER_SIZE];
            BigEndian::write_u32(&mut fh[0..], page_number);
            BigEndian::write_u32(&mut fh[4..], db_size_after_commit);
            BigEndian::write_u32(&mut fh[8..], self.salt1);
            BigEndian::write_u32(&mut fh[12..], self.salt2);
            let (a, b) = checksum::<BigEndian>(self.s1, self.s2, &fh[0..8]);
            let (a, b) = checksum::<BigEndian>(a, b, &data);
            self.s1 = a;
            self.s2 = b;
            BigEndian::write_u32(&mut fh[16..], a);
            BigEndian::write_u32(&mut fh[20..], b);
            self.bytes.extend(fh);
            self.bytes.extend(data);
        }

        pub fn into_bytes(self) -> Vec<u8> {
            self.bytes
        }
    }

    pub fn parse_wal_bytes(bytes: &[u8], strict: bool) -> Result<Wal, Error> {
        Wal::from_bytes(PathBuf::from("test.wal"), bytes, strict)
    }
}
