//! Random-access byte stores an [`Archive`] lives in
//!
//! The archive engine is written once against [`ByteStore`];
//! [`FileStore`] puts the archive on disk and [`MemoryStore`] keeps it in a buffer.
//!
//! [`Archive`]: ../read/struct.Archive.html

use std::fs::{self, File, OpenOptions};
use std::io::{self, prelude::*, SeekFrom};
use std::path::{Path, PathBuf};

use log::*;
use tempfile::{NamedTempFile, TempPath};

/// A readable, writable, seekable and truncatable run of bytes
pub trait ByteStore: Read + Write + Seek + Sized {
    /// Cuts (or zero-extends) the store to exactly `len` bytes.
    /// The cursor isn't moved.
    fn truncate(&mut self, len: u64) -> io::Result<()>;

    /// Creates an empty store of the same kind to build a replacement in.
    fn scratch(&self) -> io::Result<Self>;

    /// Replaces the contents of this store with those of a scratch store
    /// from [`scratch()`](ByteStore::scratch), leaving the cursor at the start.
    fn replace_with(&mut self, scratch: Self) -> io::Result<()>;

    /// Current length of the store, leaving the cursor where it was
    fn len(&mut self) -> io::Result<u64> {
        let position = self.stream_position()?;
        let len = self.seek(SeekFrom::End(0))?;
        self.seek(SeekFrom::Start(position))?;
        Ok(len)
    }
}

/// An archive on disk
#[derive(Debug)]
pub struct FileStore {
    file: File,
    path: PathBuf,
    /// Set for scratch files, which disappear if never persisted.
    temp: Option<TempPath>,
}

impl FileStore {
    /// Opens an existing file, for reading and optionally for writing.
    pub fn open<P: AsRef<Path>>(path: P, writable: bool) -> io::Result<Self> {
        let path = path.as_ref().to_owned();
        let file = OpenOptions::new().read(true).write(writable).open(&path)?;
        Ok(Self {
            file,
            path,
            temp: None,
        })
    }

    /// Creates a new file, failing if one already exists at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_owned();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        Ok(Self {
            file,
            path,
            temp: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Read for FileStore {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for FileStore {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for FileStore {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl ByteStore for FileStore {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    fn scratch(&self) -> io::Result<Self> {
        // Same directory, so the final move is a rename and not a copy.
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let (file, temp) = NamedTempFile::new_in(dir)?.into_parts();
        Ok(Self {
            file,
            path: temp.to_path_buf(),
            temp: Some(temp),
        })
    }

    fn replace_with(&mut self, mut scratch: Self) -> io::Result<()> {
        let temp = scratch.temp.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "Not a scratch file store")
        })?;
        scratch.file.sync_all()?;
        drop(scratch);

        fs::set_permissions(&temp, self.file.metadata()?.permissions())?;
        match temp.persist(&self.path) {
            Ok(()) => {
                self.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
            }
            Err(e) => {
                debug!(
                    "Couldn't move {} over {} ({}); copying instead",
                    e.path.display(),
                    self.path.display(),
                    e.error
                );
                let mut replacement = File::open(&e.path)?;
                self.file.set_len(0)?;
                self.file.seek(SeekFrom::Start(0))?;
                io::copy(&mut replacement, &mut self.file)?;
                self.file.flush()?;
                // Dropping e.path deletes the scratch file.
            }
        }
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }
}

/// An archive in a growable buffer
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    data: Vec<u8>,
    position: u64,
}

impl MemoryStore {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, position: 0 }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    fn cursor(&self) -> io::Result<usize> {
        usize::try_from(self.position)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Position out of range"))
    }
}

impl Read for MemoryStore {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let start = self.cursor()?.min(self.data.len());
        let count = buf.len().min(self.data.len() - start);
        buf[..count].copy_from_slice(&self.data[start..start + count]);
        self.position += count as u64;
        Ok(count)
    }
}

impl Write for MemoryStore {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let start = self.cursor()?;
        if start > self.data.len() {
            // Writing past the end leaves a zero-filled hole, like a sparse file.
            self.data.resize(start, 0);
        }
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Write out of range"))?;
        if end <= self.data.len() {
            self.data[start..end].copy_from_slice(buf);
        } else {
            self.data.truncate(start);
            self.data.extend_from_slice(buf);
        }
        self.position = end as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryStore {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (base, offset) = match pos {
            SeekFrom::Start(p) => {
                self.position = p;
                return Ok(p);
            }
            SeekFrom::Current(o) => (self.position, o),
            SeekFrom::End(o) => (self.data.len() as u64, o),
        };
        let new_position = if offset >= 0 {
            base.checked_add(offset as u64)
        } else {
            base.checked_sub(offset.unsigned_abs())
        };
        match new_position {
            Some(p) => {
                self.position = p;
                Ok(p)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Invalid seek to a negative or overflowing position",
            )),
        }
    }
}

impl ByteStore for MemoryStore {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Length out of range"))?;
        self.data.resize(len, 0);
        Ok(())
    }

    fn scratch(&self) -> io::Result<Self> {
        Ok(Self::default())
    }

    fn replace_with(&mut self, scratch: Self) -> io::Result<()> {
        self.data = scratch.data;
        self.position = 0;
        Ok(())
    }

    fn len(&mut self) -> io::Result<u64> {
        Ok(self.data.len() as u64)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reads_stop_at_the_end() {
        let mut store = MemoryStore::new(b"hello".to_vec());
        let mut buf = [0; 3];
        assert_eq!(store.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"hel");
        assert_eq!(store.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"lo");
        assert_eq!(store.read(&mut buf).unwrap(), 0);

        store.seek(SeekFrom::Start(100)).unwrap();
        assert_eq!(store.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn writes_inside_overwrite() {
        let mut store = MemoryStore::new(b"hello world".to_vec());
        store.seek(SeekFrom::Start(6)).unwrap();
        store.write_all(b"WORLD").unwrap();
        assert_eq!(store.data(), b"hello WORLD");
        assert_eq!(store.stream_position().unwrap(), 11);
    }

    #[test]
    fn writes_past_the_end_drop_the_tail() {
        let mut store = MemoryStore::new(b"hello world".to_vec());
        store.seek(SeekFrom::End(-2)).unwrap();
        store.write_all(b"k!!!").unwrap();
        assert_eq!(store.data(), b"hello work!!!");
    }

    #[test]
    fn writes_beyond_the_end_zero_fill() {
        let mut store = MemoryStore::new(b"ab".to_vec());
        store.seek(SeekFrom::Current(4)).unwrap();
        store.write_all(b"c").unwrap();
        assert_eq!(store.data(), b"ab\0\0\0\0c");
    }

    #[test]
    fn negative_seek_fails() {
        let mut store = MemoryStore::new(b"ab".to_vec());
        assert!(store.seek(SeekFrom::End(-3)).is_err());
        assert!(store.seek(SeekFrom::Current(-1)).is_err());
        // The failed seek didn't move anything.
        assert_eq!(store.stream_position().unwrap(), 0);
    }

    #[test]
    fn truncate_and_replace() {
        let mut store = MemoryStore::new(b"abcdef".to_vec());
        store.truncate(3).unwrap();
        assert_eq!(store.data(), b"abc");
        assert_eq!(ByteStore::len(&mut store).unwrap(), 3);

        let mut scratch = store.scratch().unwrap();
        scratch.write_all(b"xyz!").unwrap();
        store.replace_with(scratch).unwrap();
        assert_eq!(store.data(), b"xyz!");
        assert_eq!(store.stream_position().unwrap(), 0);
    }

    #[test]
    fn file_store_replace() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("store.bin");
        let mut store = FileStore::create(&path)?;
        store.write_all(b"old contents")?;
        assert!(FileStore::create(&path).is_err());

        store.truncate(3)?;
        assert_eq!(ByteStore::len(&mut store)?, 3);

        let mut scratch = store.scratch()?;
        scratch.write_all(b"new")?;
        store.replace_with(scratch)?;
        assert_eq!(fs::read(&path)?, b"new");

        // Still usable after the swap
        store.seek(SeekFrom::End(0))?;
        store.write_all(b"er")?;
        store.flush()?;
        assert_eq!(fs::read(&path)?, b"newer");
        // Nothing left behind but the store itself
        assert_eq!(fs::read_dir(dir.path())?.count(), 1);
        Ok(())
    }
}
