//! Durable storage of the current term (and the vote cast in it)
use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use binrw::{binrw, BinRead, BinWrite};
use clusterd_api::{PeerName, TermId};
use error_stack::{IntoReport, Report, ResultExt};
use thiserror::Error;
use tracing::{debug, info};

use crate::peers::PeerId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TermStoreError {
    #[error("could not read term file")]
    Read,
    #[error("could not write term file")]
    Write,
    #[error("term file corrupted")]
    Corrupted,
    #[error("refusing to persist term {requested} lower than stored {stored}")]
    TermRegression { stored: TermId, requested: TermId },
    #[error("injected failure")]
    Injected,
}

pub type TermStoreResult<T> = error_stack::Result<T, TermStoreError>;

/// What has to survive a restart
///
/// The vote is stored together with the term it was cast in, so a
/// restarted node can never vote twice in the same term.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PersistedTerm {
    pub term: TermId,
    pub voted_for: Option<PeerId>,
}

impl PersistedTerm {
    pub fn new(term: TermId, voted_for: Option<PeerId>) -> Self {
        Self { term, voted_for }
    }
}

/// Synchronous, durable term storage
///
/// `persist` must not return before the data is on stable storage.
pub trait TermStore: Send + Sync {
    fn load(&self) -> TermStoreResult<PersistedTerm>;
    fn persist(&self, state: &PersistedTerm) -> TermStoreResult<()>;
}

/// On-disk format of the term file
#[binrw]
#[brw(big, magic = b"CDTS")]
#[derive(Debug)]
struct TermFile {
    #[br(assert(version == TermFile::VERSION))]
    version: u8,
    term: TermId,
    #[br(temp)]
    #[bw(calc = u8::from(voted_for.is_some()))]
    has_vote: u8,
    #[br(if(has_vote != 0))]
    voted_for: Option<PeerName>,
    /// Detects truncated files
    #[bw(magic = 0xffu8)]
    #[br(magic = 0xffu8)]
    ff_end: (),
}

impl TermFile {
    const VERSION: u8 = 1;
}

/// [`TermStore`] keeping a single small file in the data dir
///
/// Every write goes to a temporary file first, which is fsynced and
/// renamed over the old one.
pub struct FileTermStore {
    dir: PathBuf,
    /// Last value durably stored
    current: Mutex<PersistedTerm>,
}

impl FileTermStore {
    pub const FILE_NAME: &'static str = "raft-state";
    const TMP_FILE_NAME: &'static str = "raft-state.tmp";

    pub fn open(data_dir: &Path) -> TermStoreResult<Self> {
        fs::create_dir_all(data_dir)
            .report()
            .change_context(TermStoreError::Write)
            .attach_printable(data_dir.display().to_string())?;

        let current = Self::read_file(&data_dir.join(Self::FILE_NAME))?;
        info!(
            term = %current.term,
            voted_for = ?current.voted_for,
            "data-dir" = %data_dir.display(),
            "Loaded persisted term"
        );

        Ok(Self {
            dir: data_dir.to_owned(),
            current: Mutex::new(current),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(Self::FILE_NAME)
    }

    fn read_file(path: &Path) -> TermStoreResult<PersistedTerm> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No term file, starting at term 0");
                return Ok(PersistedTerm::default());
            }
            Err(e) => {
                return Err(e)
                    .report()
                    .change_context(TermStoreError::Read)
                    .attach_printable(path.display().to_string())
            }
        };

        let file = TermFile::read(&mut Cursor::new(&bytes)).map_err(|e| {
            Report::new(TermStoreError::Corrupted)
                .attach_printable(format!("{}: {e}", path.display()))
        })?;

        Ok(PersistedTerm {
            term: file.term,
            voted_for: file.voted_for.map(PeerId::from),
        })
    }

    fn write_file(&self, state: &PersistedTerm) -> TermStoreResult<()> {
        let mut buf = Cursor::new(vec![]);
        TermFile {
            version: TermFile::VERSION,
            term: state.term,
            voted_for: state.voted_for.as_ref().map(PeerName::from),
            ff_end: (),
        }
        .write(&mut buf)
        .map_err(|e| Report::new(TermStoreError::Write).attach_printable(e.to_string()))?;

        let tmp_path = self.dir.join(Self::TMP_FILE_NAME);
        let path = self.path();

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .report()
            .change_context(TermStoreError::Write)
            .attach_printable(tmp_path.display().to_string())?;
        file.write_all(buf.get_ref())
            .report()
            .change_context(TermStoreError::Write)?;
        nix::unistd::fsync(file.as_raw_fd())
            .report()
            .change_context(TermStoreError::Write)?;
        drop(file);

        fs::rename(&tmp_path, &path)
            .report()
            .change_context(TermStoreError::Write)
            .attach_printable(path.display().to_string())?;

        // make the rename itself durable
        let dir = File::open(&self.dir)
            .report()
            .change_context(TermStoreError::Write)?;
        nix::unistd::fsync(dir.as_raw_fd())
            .report()
            .change_context(TermStoreError::Write)?;

        Ok(())
    }
}

impl TermStore for FileTermStore {
    fn load(&self) -> TermStoreResult<PersistedTerm> {
        Ok(self.current.lock().expect("Locking failed").clone())
    }

    fn persist(&self, state: &PersistedTerm) -> TermStoreResult<()> {
        // held across the write, so concurrent writers can't reorder
        let mut current = self.current.lock().expect("Locking failed");

        if state.term < current.term {
            return Err(Report::new(TermStoreError::TermRegression {
                stored: current.term,
                requested: state.term,
            }));
        }
        if *current == *state {
            return Ok(());
        }

        self.write_file(state)?;
        debug!(term = %state.term, voted_for = ?state.voted_for, "Term persisted");
        *current = state.clone();
        Ok(())
    }
}

#[derive(Default)]
struct MemTermStoreInner {
    current: PersistedTerm,
    history: Vec<PersistedTerm>,
    failures_left: usize,
}

/// In-memory [`TermStore`] for simulations
///
/// Records every persisted value and can be told to fail.
#[derive(Default)]
pub struct MemTermStore {
    inner: Mutex<MemTermStoreInner>,
}

impl MemTermStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every value persisted so far, in order
    pub fn history(&self) -> Vec<PersistedTerm> {
        self.inner.lock().expect("Locking failed").history.clone()
    }

    /// Make the next `count` calls to `persist` fail
    pub fn fail_next(&self, count: usize) {
        self.inner.lock().expect("Locking failed").failures_left = count;
    }
}

impl TermStore for MemTermStore {
    fn load(&self) -> TermStoreResult<PersistedTerm> {
        Ok(self.inner.lock().expect("Locking failed").current.clone())
    }

    fn persist(&self, state: &PersistedTerm) -> TermStoreResult<()> {
        let mut inner = self.inner.lock().expect("Locking failed");
        if 0 < inner.failures_left {
            inner.failures_left -= 1;
            return Err(Report::new(TermStoreError::Injected));
        }
        if state.term < inner.current.term {
            return Err(Report::new(TermStoreError::TermRegression {
                stored: inner.current.term,
                requested: state.term,
            }));
        }
        inner.current = state.clone();
        inner.history.push(state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let store = FileTermStore::open(dir.path()).unwrap();
        assert_eq!(store.load().unwrap(), PersistedTerm::default());

        store
            .persist(&PersistedTerm::new(TermId(5), Some(PeerId::from("b.local"))))
            .unwrap();
        store.persist(&PersistedTerm::new(TermId(6), None)).unwrap();
        drop(store);

        let store = FileTermStore::open(dir.path()).unwrap();
        assert_eq!(store.load().unwrap(), PersistedTerm::new(TermId(6), None));

        store
            .persist(&PersistedTerm::new(TermId(6), Some(PeerId::from("c.local"))))
            .unwrap();
        drop(store);
        let store = FileTermStore::open(dir.path()).unwrap();
        assert_eq!(
            store.load().unwrap(),
            PersistedTerm::new(TermId(6), Some(PeerId::from("c.local")))
        );
    }

    #[test]
    fn file_store_refuses_lower_term() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTermStore::open(dir.path()).unwrap();
        store.persist(&PersistedTerm::new(TermId(3), None)).unwrap();

        let err = store
            .persist(&PersistedTerm::new(TermId(2), None))
            .unwrap_err();
        assert!(format!("{err:?}").contains("refusing to persist term 2 lower than stored 3"));
    }

    #[test]
    fn truncated_file_is_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTermStore::open(dir.path()).unwrap();
        store.persist(&PersistedTerm::new(TermId(9), None)).unwrap();
        let path = store.path();
        drop(store);

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 1]).unwrap();

        let err = FileTermStore::open(dir.path()).err().unwrap();
        assert!(format!("{err:?}").contains("term file corrupted"));
    }

    #[test]
    fn mem_store_injected_failure() {
        let store = MemTermStore::new();
        store.fail_next(1);
        assert!(store.persist(&PersistedTerm::new(TermId(1), None)).is_err());
        store.persist(&PersistedTerm::new(TermId(1), None)).unwrap();
        assert_eq!(store.history(), vec![PersistedTerm::new(TermId(1), None)]);
    }
}
