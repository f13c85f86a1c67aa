//! Memory-mapped photo files
//!
//! A [`MappedFile`] owns the read-only mapping of a photo's backing file for as
//! long as the photo is open. Readers borrow it through [`MappedView`]s, which
//! hand out seekable streams over the mapped bytes. Both types can be disposed
//! explicitly from any thread; after that every accessor fails with
//! [`MappedFileError::Disposed`]. Streams already handed out keep the mapping
//! alive until they are dropped, so no reader ever sees unmapped memory.

use crate::error::MappedFileError;
use memmap2::Mmap;
use parking_lot::Mutex;
use std::fs::File;
use std::io::Cursor;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Shared, read-only access to mapped bytes.
#[derive(Clone)]
pub struct MappedBytes {
    map: Arc<Mmap>,
}

impl Deref for MappedBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.map[..]
    }
}

impl AsRef<[u8]> for MappedBytes {
    fn as_ref(&self) -> &[u8] {
        &self.map[..]
    }
}

/// A `Read + Seek + BufRead` cursor over exactly the mapped range.
pub type MappedStream = Cursor<MappedBytes>;

/// Read-only memory map of a photo file.
pub struct MappedFile {
    path: PathBuf,
    len: usize,
    map: Mutex<Option<Arc<Mmap>>>,
}

impl MappedFile {
    pub fn open(path: &Path) -> Result<Self, MappedFileError> {
        let file = File::open(path).map_err(|source| MappedFileError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        // SAFETY: the map is read-only and photos are only ever replaced by
        // renaming a new file over the old name, never truncated in place.
        let map = unsafe { Mmap::map(&file) }.map_err(|source| MappedFileError::Map {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            len: map.len(),
            map: Mutex::new(Some(Arc::new(map))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Length of the mapped range in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_disposed(&self) -> bool {
        self.map.lock().is_none()
    }

    /// A new view sharing this mapping.
    pub fn view(&self) -> Result<MappedView, MappedFileError> {
        let guard = self.map.lock();
        let map = guard.as_ref().ok_or(MappedFileError::Disposed)?;
        Ok(MappedView {
            map: Mutex::new(Some(Arc::clone(map))),
        })
    }

    /// Release the mapping. Returns `false` if it was already released.
    pub fn dispose(&self) -> bool {
        self.map.lock().take().is_some()
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        if self.map.get_mut().is_some() {
            debug!(path = %self.path.display(), "Mapped file dropped without dispose");
        }
    }
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// A reader's handle on a [`MappedFile`].
pub struct MappedView {
    map: Mutex<Option<Arc<Mmap>>>,
}

impl MappedView {
    /// A fresh stream positioned at the start of the file.
    pub fn stream(&self) -> Result<MappedStream, MappedFileError> {
        Ok(Cursor::new(self.bytes()?))
    }

    pub fn bytes(&self) -> Result<MappedBytes, MappedFileError> {
        let guard = self.map.lock();
        let map = guard.as_ref().ok_or(MappedFileError::Disposed)?;
        Ok(MappedBytes { map: Arc::clone(map) })
    }

    pub fn is_disposed(&self) -> bool {
        self.map.lock().is_none()
    }

    /// Returns `false` if the view was already disposed.
    pub fn dispose(&self) -> bool {
        self.map.lock().take().is_some()
    }
}
