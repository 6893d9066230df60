//! Opening ZIP archives and reading entries out of them.
//!
//! To start, open an [`Archive`] over a file or a buffer:
//!
//! ```no_run
//! # use zipmend::*;
//! let mut archive = Archive::open("foo.zip", AccessMode::Read)?;
//! for entry in archive.entries() {
//!     println!("{} ({} bytes)", entry.path(), entry.uncompressed_size());
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Entries are read lazily from the central directory on every call to
//! [`Archive::entries()`]; nothing is cached between calls,
//! so changes made by the [`write`](../write/index.html) half are seen right away.
//!
//! [`Archive`]: struct.Archive.html
//! [`Archive::entries()`]: struct.Archive.html#method.entries

use std::io::{self, prelude::*, SeekFrom};
use std::path::Path;

use camino::Utf8Path;
use flate2::read::DeflateDecoder;
use log::*;
use memchr::memmem;

use crate::arch::usize;
use crate::crc_reader::Crc32Reader;
use crate::entry::*;
use crate::result::*;
use crate::spec::{self, Record};
use crate::store::{ByteStore, FileStore, MemoryStore};
use crate::transfer::{self, TransferOptions};

/// What an [`Archive`] may do to its store
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AccessMode {
    /// Start a new, empty archive. The store must be empty
    /// (or, for files, not exist yet).
    /// Once created, the archive is open for updates.
    Create,
    /// Read entries, change nothing.
    Read,
    /// Read, add, and remove entries.
    Update,
}

/// The largest values the legacy 32 and 16-bit fields may hold
/// before they overflow into Zip64 structures.
///
/// These are `u32::MAX` and `u16::MAX` unless lowered,
/// which is mostly useful for testing Zip64 without writing 4 GB files.
/// Overflowed fields always get the real `0xFFFFFFFF` or `0xFFFF` sentinel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FormatLimits {
    pub max_u32: u64,
    pub max_u16: u64,
}

impl Default for FormatLimits {
    fn default() -> Self {
        Self {
            max_u32: u32::MAX as u64,
            max_u16: u16::MAX as u64,
        }
    }
}

impl FormatLimits {
    pub(crate) fn overflows_u32(&self, value: u64) -> bool {
        value >= self.max_u32.min(u32::MAX as u64)
    }

    pub(crate) fn overflows_u16(&self, value: u64) -> bool {
        value >= self.max_u16.min(u16::MAX as u64)
    }
}

/// Settings for an open [`Archive`]
#[derive(Debug, Clone, Default)]
pub struct ArchiveOptions {
    /// How to decode entry paths that aren't flagged as UTF-8.
    /// If unset, they're assumed to be CP437.
    pub preferred_encoding: Option<PathEncoding>,
    pub limits: FormatLimits,
}

/// The records at the back of the archive: the End of central directory
/// record and, if anything overflowed, its Zip64 counterpart.
#[derive(Debug, Clone)]
pub(crate) struct Trailer {
    pub eocdr: spec::EndOfCentralDirectory,
    pub zip64: Option<spec::Zip64EndOfCentralDirectory>,
}

impl Trailer {
    pub fn entries(&self) -> u64 {
        match &self.zip64 {
            Some(z) => z.entries,
            None => self.eocdr.entries as u64,
        }
    }

    pub fn central_directory_offset(&self) -> u64 {
        match &self.zip64 {
            Some(z) => z.central_directory_offset,
            None => self.eocdr.central_directory_offset as u64,
        }
    }

    pub fn central_directory_size(&self) -> u64 {
        match &self.zip64 {
            Some(z) => z.central_directory_size,
            None => self.eocdr.central_directory_size as u64,
        }
    }
}

/// The End of central directory record is 22 bytes, plus a comment of up to 64 kB.
/// Don't look any further back than that (and change).
const MAX_TRAILER_WINDOW: u64 = 66_000;

/// Reads a record at the given offset, pulling its variable-length data from the store.
pub(crate) fn read_record<R: Record, S: Read + Seek>(store: &mut S, offset: u64) -> ZipResult<R> {
    store.seek(SeekFrom::Start(offset))?;
    let mut fixed = vec![0; R::SIZE];
    store.read_exact(&mut fixed).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => ZipError::MalformedRecord("Record runs past the end"),
        _ => ZipError::Io(e),
    })?;
    R::decode(&fixed, |len| {
        let mut additional = Vec::with_capacity(len);
        (&mut *store).take(len as u64).read_to_end(&mut additional)?;
        Ok(additional)
    })
}

/// Searches backward from the end of the store for the End of central directory record,
/// then checks for a Zip64 locator right in front of it.
fn read_trailer<S: ByteStore>(store: &mut S) -> ZipResult<Trailer> {
    let len = store.len()?;
    if len < spec::EndOfCentralDirectory::SIZE as u64 {
        return Err(ZipError::MissingDirectoryRecord);
    }
    let window_start = len - len.min(MAX_TRAILER_WINDOW);
    store.seek(SeekFrom::Start(window_start))?;
    let mut window = vec![0; usize(len - window_start)?];
    store.read_exact(&mut window)?;

    // A comment could contain the magic number, so keep looking
    // until we find something that actually decodes.
    let mut search_end = window.len();
    let (eocdr_posit, eocdr) = loop {
        let posit = memmem::rfind(&window[..search_end], &spec::EOCDR_MAGIC)
            .ok_or(ZipError::MissingDirectoryRecord)?;
        let fixed_end = posit + spec::EndOfCentralDirectory::SIZE;
        if fixed_end <= window.len() {
            let mut rest = &window[fixed_end..];
            let decoded = spec::EndOfCentralDirectory::decode(&window[posit..fixed_end], |len| {
                let (taken, remaining) = rest.split_at(len.min(rest.len()));
                rest = remaining;
                Ok(taken.to_vec())
            });
            match decoded {
                Ok(eocdr) => break (window_start + posit as u64, eocdr),
                Err(e) => trace!("Skipping candidate at {}: {}", window_start + posit as u64, e),
            }
        }
        search_end = posit;
    };
    trace!("{:?}", eocdr);

    if eocdr.disk_number != eocdr.disk_with_central_directory {
        return Err(ZipError::UnreadableArchive(format!(
            "No support for multi-disk archives: disk ({}) != disk with central directory ({})",
            eocdr.disk_number, eocdr.disk_with_central_directory
        )));
    }
    if eocdr.entries != eocdr.entries_on_this_disk {
        return Err(ZipError::UnreadableArchive(format!(
            "No support for multi-disk archives: entries ({}) != entries this disk ({})",
            eocdr.entries, eocdr.entries_on_this_disk
        )));
    }

    let mut trailer_start = eocdr_posit;
    let mut zip64 = None;
    let locator_size = spec::Zip64EndOfCentralDirectoryLocator::SIZE as u64;
    if eocdr_posit >= locator_size {
        let locator_posit = eocdr_posit - locator_size;
        // No locator is fine; most archives don't need one.
        if let Ok(locator) =
            read_record::<spec::Zip64EndOfCentralDirectoryLocator, _>(store, locator_posit)
        {
            trace!("{:?}", locator);
            if locator.disks > 1 {
                return Err(ZipError::UnreadableArchive(format!(
                    "No support for multi-disk archives: Zip64 EOCDR locator reports {} disks",
                    locator.disks
                )));
            }
            if locator.zip64_eocdr_offset >= locator_posit {
                return Err(ZipError::MalformedRecord(
                    "Zip64 End Of Central Directory Record after its locator",
                ));
            }
            let record: spec::Zip64EndOfCentralDirectory =
                read_record(store, locator.zip64_eocdr_offset)?;
            trace!("{:?}", record);
            if record.disk_number != record.disk_with_central_directory
                || record.entries != record.entries_on_this_disk
            {
                return Err(ZipError::UnreadableArchive(String::from(
                    "No support for multi-disk archives: Zip64 record spans disks",
                )));
            }
            trailer_start = locator.zip64_eocdr_offset;
            zip64 = Some(record);
        }
    }

    let trailer = Trailer { eocdr, zip64 };
    let central_directory_end = trailer
        .central_directory_offset()
        .checked_add(trailer.central_directory_size());
    match central_directory_end {
        Some(end) if end <= trailer_start => {}
        _ => {
            return Err(ZipError::MalformedRecord(
                "Central directory overlaps the end of the archive",
            ))
        }
    }
    debug!(
        "{} entries, central directory at {} ({} bytes){}",
        trailer.entries(),
        trailer.central_directory_offset(),
        trailer.central_directory_size(),
        if trailer.zip64.is_some() { ", Zip64" } else { "" }
    );
    Ok(trailer)
}

/// A ZIP archive in some [`ByteStore`]
pub struct Archive<S: ByteStore> {
    pub(crate) store: S,
    pub(crate) mode: AccessMode,
    pub(crate) trailer: Trailer,
    pub(crate) options: ArchiveOptions,
}

impl Archive<FileStore> {
    /// Opens (or, with [`AccessMode::Create`], creates) an archive on disk.
    pub fn open<P: AsRef<Path>>(path: P, mode: AccessMode) -> ZipResult<Self> {
        Self::open_with(path, mode, ArchiveOptions::default())
    }

    pub fn open_with<P: AsRef<Path>>(
        path: P,
        mode: AccessMode,
        options: ArchiveOptions,
    ) -> ZipResult<Self> {
        let path = path.as_ref();
        let store = match mode {
            AccessMode::Create => FileStore::create(path),
            AccessMode::Read => FileStore::open(path, false),
            AccessMode::Update => FileStore::open(path, true),
        };
        let store = store.map_err(|e| {
            let why = format!("Couldn't open {}: {}", path.display(), e);
            match mode {
                AccessMode::Read => ZipError::UnreadableArchive(why),
                _ => ZipError::UnwritableArchive(why),
            }
        })?;
        Self::with_store(store, mode, options)
    }
}

impl Archive<MemoryStore> {
    /// Opens an archive in a buffer.
    /// With [`AccessMode::Create`], the buffer must be empty.
    pub fn from_memory(data: Vec<u8>, mode: AccessMode) -> ZipResult<Self> {
        Self::with_store(MemoryStore::new(data), mode, ArchiveOptions::default())
    }

    /// Returns the archive's bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.store.into_inner()
    }
}

impl<S: ByteStore> Archive<S> {
    /// Opens an archive in the given store.
    pub fn with_store(mut store: S, mode: AccessMode, options: ArchiveOptions) -> ZipResult<Self> {
        let mode = if mode == AccessMode::Create {
            if store.len()? != 0 {
                return Err(ZipError::UnwritableArchive(String::from(
                    "Can't create an archive over existing data",
                )));
            }
            store.seek(SeekFrom::Start(0))?;
            store.write_all(&spec::EndOfCentralDirectory::empty().encode())?;
            store.flush()?;
            debug!("Created an empty archive");
            AccessMode::Update
        } else {
            mode
        };
        let trailer = read_trailer(&mut store)?;
        Ok(Self {
            store,
            mode,
            trailer,
            options,
        })
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn options(&self) -> &ArchiveOptions {
        &self.options
    }

    /// The number of entries the central directory claims to have
    pub fn len(&self) -> u64 {
        self.trailer.entries()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The archive comment, in whatever encoding its author used
    pub fn comment(&self) -> &[u8] {
        &self.trailer.eocdr.file_comment
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Re-reads the trailer after the store changed under us.
    pub(crate) fn refresh_trailer(&mut self) -> ZipResult<()> {
        self.trailer = read_trailer(&mut self.store)?;
        Ok(())
    }

    /// Walks the records for every central directory entry, readable or not.
    pub(crate) fn raw_entries(&mut self) -> RawEntries<'_, S> {
        RawEntries {
            next_record: self.trailer.central_directory_offset(),
            remaining: self.trailer.entries(),
            store: &mut self.store,
        }
    }

    /// Iterates over the entries in the archive, in central directory order.
    ///
    /// Encrypted entries and those whose paths can't be decoded are skipped.
    /// If the central directory is damaged, iteration stops at the damage.
    pub fn entries(&mut self) -> Entries<'_, S> {
        Entries {
            preferred_encoding: self.options.preferred_encoding,
            raw: self.raw_entries(),
        }
    }

    /// Finds the first entry with the given path.
    ///
    /// ZIP archives can hold several entries with the same path;
    /// this returns the one earliest in the central directory.
    pub fn entry(&mut self, path: &str) -> Option<Entry> {
        self.entries().find(|e| e.path() == path)
    }

    /// Streams the entry's (decompressed) data to `consumer`,
    /// returning the CRC-32 of what was consumed.
    ///
    /// Compare it against [`Entry::checksum()`] to catch corruption;
    /// it's 0 if the options skip the CRC.
    /// Directories get a single empty chunk.
    pub fn extract<C>(
        &mut self,
        entry: &Entry,
        options: &TransferOptions,
        mut consumer: C,
    ) -> ZipResult<u32>
    where
        C: FnMut(&[u8]) -> ZipResult<()>,
    {
        check_local_header(&entry.records)?;
        if entry.entry_type() == EntryType::Directory {
            consumer(&[])?;
            return Ok(0);
        }

        let data_offset = entry.data_offset();
        let store = &mut self.store;
        let provider = |position: u64, len: usize| -> ZipResult<Vec<u8>> {
            store.seek(SeekFrom::Start(data_offset + position))?;
            let mut chunk = Vec::with_capacity(len);
            (&mut *store).take(len as u64).read_to_end(&mut chunk)?;
            Ok(chunk)
        };
        let moved = match entry.compression_method() {
            CompressionMethod::None => {
                transfer::copy_stored(entry.uncompressed_size(), options, provider, consumer)?
            }
            CompressionMethod::Deflate => {
                transfer::decompress(entry.compressed_size(), options, provider, consumer)?
            }
            CompressionMethod::Unsupported(method) => {
                return Err(ZipError::InvalidCompressionMethod(method))
            }
        };
        debug!(
            "Extracted {} ({} bytes, CRC {:#010x})",
            entry.path(),
            moved.written,
            moved.crc32
        );
        Ok(moved.crc32)
    }

    /// Returns a reader over the entry's (decompressed) data,
    /// which fails at the end if the CRC-32 doesn't match.
    pub fn reader<'a>(&'a mut self, entry: &Entry) -> ZipResult<Box<dyn Read + 'a>>
    where
        S: 'a,
    {
        check_local_header(&entry.records)?;
        debug!("Reading {:?}", entry);
        self.store.seek(SeekFrom::Start(entry.data_offset()))?;
        let data = (&mut self.store).take(entry.records.stored_size());
        make_reader(entry.compression_method(), entry.checksum(), data)
    }

    /// Reads the path a symbolic link entry points to.
    pub fn symlink_target(&mut self, entry: &Entry) -> ZipResult<String> {
        let mut target = Vec::new();
        let options = TransferOptions::default().skip_crc32(true);
        self.extract(entry, &options, |chunk| {
            target.extend_from_slice(chunk);
            Ok(())
        })?;
        String::from_utf8(target).map_err(|_| {
            ZipError::InvalidEntryPath(format!("{} doesn't point to a UTF-8 path", entry.path()))
        })
    }

    /// Returns the entries in an order they can be safely recreated in:
    /// directories, then files (each as they appear in the archive),
    /// then symbolic links, with any link that resolves under another link's
    /// target after it.
    pub fn sorted_entries(&mut self) -> ZipResult<Vec<Entry>> {
        let entries: Vec<Entry> = self.entries().collect();
        let mut sorted = Vec::with_capacity(entries.len());
        let mut files = Vec::new();
        let mut links: Vec<(Entry, String)> = Vec::new();

        for entry in entries {
            match entry.entry_type() {
                EntryType::Directory => {
                    sorted.push(entry);
                    continue;
                }
                EntryType::File => {
                    files.push(entry);
                    continue;
                }
                EntryType::Symlink => {}
            }
            let target = self.symlink_target(&entry)?;
            let parent = Utf8Path::new(entry.path())
                .parent()
                .map(|p| p.as_str())
                .unwrap_or("");
            let destination = format!("{parent}/{target}");

            let position = links.iter().enumerate().find_map(|(i, (other, other_dest))| {
                if destination.starts_with(other_dest.as_str()) {
                    Some(i + 1)
                } else if other_dest.starts_with(&destination) {
                    Some(i)
                } else if other_dest.starts_with(entry.path()) {
                    Some(i)
                } else if destination.starts_with(other.path()) {
                    Some(i + 1)
                } else {
                    None
                }
            });
            links.insert(position.unwrap_or(links.len()), (entry, destination));
        }

        sorted.append(&mut files);
        sorted.extend(links.into_iter().map(|(entry, _)| entry));
        Ok(sorted)
    }
}

/// Makes sure the local file header agrees with the central directory
/// (if the `check-local-metadata` feature is on).
fn check_local_header(records: &EntryRecords) -> ZipResult<()> {
    if !cfg!(feature = "check-local-metadata") {
        return Ok(());
    }
    let central = &records.central_directory;
    let local = &records.local_header;
    let mismatch = Err(ZipError::MalformedRecord(
        "Central directory entry doesn't match local file header",
    ));
    if local.path != central.path || local.compression_method != central.compression_method {
        return mismatch;
    }
    // Streamed entries have zeros up front; the descriptor has the real values.
    if spec::uses_data_descriptor(local.flags) {
        return Ok(());
    }
    let local_zip64 = local.zip64_info()?.unwrap_or_default();
    let local_uncompressed = match local_zip64.uncompressed_size {
        Some(size) if local.uncompressed_size == u32::MAX => size,
        _ => local.uncompressed_size as u64,
    };
    let local_compressed = match local_zip64.compressed_size {
        Some(size) if local.compressed_size == u32::MAX => size,
        _ => local.compressed_size as u64,
    };
    if local.crc32 != central.crc32
        || local_uncompressed != records.uncompressed_size()
        || local_compressed != records.compressed_size()
    {
        return mismatch;
    }
    Ok(())
}

/// Returns a boxed read trait for a compressed file,
/// given its compression method and expected CRC.
fn make_reader<'a, R: Read + 'a>(
    compression_method: CompressionMethod,
    crc32: u32,
    reader: R,
) -> ZipResult<Box<dyn Read + 'a>> {
    match compression_method {
        CompressionMethod::None => Ok(Box::new(Crc32Reader::new(reader, crc32))),
        CompressionMethod::Deflate => {
            let deflate_reader = DeflateDecoder::new(reader);
            Ok(Box::new(Crc32Reader::new(deflate_reader, crc32)))
        }
        CompressionMethod::Unsupported(method) => Err(ZipError::InvalidCompressionMethod(method)),
    }
}

/// Walks the central directory, pairing each record with its local header
/// (and data descriptor, if it has one).
///
/// Stops at the first error, after yielding it.
pub(crate) struct RawEntries<'a, S> {
    store: &'a mut S,
    next_record: u64,
    remaining: u64,
}

impl<S: Read + Seek> RawEntries<'_, S> {
    fn read_next(&mut self) -> ZipResult<EntryRecords> {
        let central: spec::CentralDirectoryEntry = read_record(self.store, self.next_record)?;
        trace!("{:?}", central);
        self.next_record += central.len_in_file();

        let header_offset = central.exact_header_offset(central.zip64_info()?.as_ref());
        let local: spec::LocalFileHeader = read_record(self.store, header_offset)?;
        trace!("{:?}", local);

        let mut records = EntryRecords::new(central, local)?;
        if records.uses_data_descriptor() {
            let descriptor_posit = records
                .data_offset()?
                .checked_add(records.stored_size())
                .ok_or(ZipError::MalformedRecord("Data descriptor past the largest possible offset"))?;
            if records.has_zip64_descriptor()? {
                let descriptor: spec::Zip64DataDescriptor =
                    read_record(self.store, descriptor_posit)?;
                trace!("{:?}", descriptor);
                records.zip64_data_descriptor = Some(descriptor);
            } else {
                let descriptor: spec::DataDescriptor = read_record(self.store, descriptor_posit)?;
                trace!("{:?}", descriptor);
                records.data_descriptor = Some(descriptor);
            }
        }
        // Everything downstream can add offsets and sizes without checking.
        records.end_offset()?;
        Ok(records)
    }
}

impl<S: Read + Seek> Iterator for RawEntries<'_, S> {
    type Item = ZipResult<EntryRecords>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let next = self.read_next();
        if next.is_err() {
            self.remaining = 0;
        }
        Some(next)
    }
}

/// Iterates over the entries of an [`Archive`].
///
/// Returned by [`Archive::entries()`].
pub struct Entries<'a, S> {
    raw: RawEntries<'a, S>,
    preferred_encoding: Option<PathEncoding>,
}

impl<S: Read + Seek> Iterator for Entries<'_, S> {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        loop {
            match self.raw.next()? {
                Ok(records) => match Entry::new(records, self.preferred_encoding) {
                    Ok(entry) => return Some(entry),
                    Err(e) => warn!("Skipping entry: {}", e),
                },
                Err(e) => {
                    debug!("Central directory ends early: {}", e);
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// A hand-built archive holding "hi.txt" (stored, "hi")
    fn hi_archive(comment: &[u8]) -> Vec<u8> {
        let crc = crc32fast::hash(b"hi");
        let local = spec::LocalFileHeader {
            minimum_extract_version: spec::DEFAULT_VERSION,
            flags: spec::UTF8_FLAG,
            compression_method: 0,
            last_modified_time: 0,
            last_modified_date: (1 << 5) | 1,
            crc32: crc,
            compressed_size: 2,
            uncompressed_size: 2,
            path: b"hi.txt".to_vec(),
            extra_field: Vec::new(),
        };
        let central = spec::CentralDirectoryEntry {
            source_version: spec::UNIX_VERSION_MADE_BY,
            minimum_extract_version: spec::DEFAULT_VERSION,
            flags: spec::UTF8_FLAG,
            compression_method: 0,
            last_modified_time: 0,
            last_modified_date: (1 << 5) | 1,
            crc32: crc,
            compressed_size: 2,
            uncompressed_size: 2,
            disk_number: 0,
            internal_file_attributes: 0,
            external_file_attributes: 0o100644 << 16,
            header_offset: 0,
            path: b"hi.txt".to_vec(),
            extra_field: Vec::new(),
            file_comment: Vec::new(),
        };
        single_entry_archive(&local, b"hi", &central, comment)
    }

    /// Lays out one local header, whatever follows it, its central directory record,
    /// and an EOCDR.
    fn single_entry_archive(
        local: &spec::LocalFileHeader,
        body: &[u8],
        central: &spec::CentralDirectoryEntry,
        comment: &[u8],
    ) -> Vec<u8> {
        let mut bytes = local.encode();
        bytes.extend_from_slice(body);
        let cd_offset = bytes.len() as u32;
        let cd = central.encode();
        bytes.extend_from_slice(&cd);
        let eocdr = spec::EndOfCentralDirectory {
            entries_on_this_disk: 1,
            entries: 1,
            central_directory_size: cd.len() as u32,
            central_directory_offset: cd_offset,
            file_comment: comment.to_vec(),
            ..spec::EndOfCentralDirectory::empty()
        };
        bytes.extend_from_slice(&eocdr.encode());
        bytes
    }

    /// A streamed "dd.txt": zeros in the local header,
    /// the real checksum and sizes in a data descriptor after the data.
    fn streamed_archive() -> Vec<u8> {
        let data = b"streamed";
        let crc = crc32fast::hash(data);
        let flags = spec::DATA_DESCRIPTOR_FLAG | spec::UTF8_FLAG;
        let local = spec::LocalFileHeader {
            minimum_extract_version: spec::DEFAULT_VERSION,
            flags,
            compression_method: 0,
            last_modified_time: 0,
            last_modified_date: (1 << 5) | 1,
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            path: b"dd.txt".to_vec(),
            extra_field: Vec::new(),
        };
        let descriptor = spec::DataDescriptor {
            crc32: crc,
            compressed_size: data.len() as u32,
            uncompressed_size: data.len() as u32,
        };
        let central = spec::CentralDirectoryEntry {
            source_version: spec::UNIX_VERSION_MADE_BY,
            minimum_extract_version: spec::DEFAULT_VERSION,
            flags,
            compression_method: 0,
            last_modified_time: 0,
            last_modified_date: (1 << 5) | 1,
            crc32: crc,
            compressed_size: data.len() as u32,
            uncompressed_size: data.len() as u32,
            disk_number: 0,
            internal_file_attributes: 0,
            external_file_attributes: 0o100644 << 16,
            header_offset: 0,
            path: b"dd.txt".to_vec(),
            extra_field: Vec::new(),
            file_comment: Vec::new(),
        };
        let mut body = data.to_vec();
        body.extend_from_slice(&descriptor.encode());
        single_entry_archive(&local, &body, &central, b"")
    }

    /// An entry whose Zip64 sizes claim the whole address space
    fn huge_entry_archive(flags: u16) -> Vec<u8> {
        let local = spec::LocalFileHeader {
            minimum_extract_version: spec::ZIP64_VERSION,
            flags,
            compression_method: 0,
            last_modified_time: 0,
            last_modified_date: (1 << 5) | 1,
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            path: b"huge".to_vec(),
            extra_field: Vec::new(),
        };
        let zip64 = spec::Zip64ExtendedInformation {
            uncompressed_size: Some(u64::MAX),
            compressed_size: Some(u64::MAX),
            ..Default::default()
        };
        let central = spec::CentralDirectoryEntry {
            source_version: spec::UNIX_VERSION_MADE_BY,
            minimum_extract_version: spec::ZIP64_VERSION,
            flags,
            compression_method: 0,
            last_modified_time: 0,
            last_modified_date: (1 << 5) | 1,
            crc32: 0,
            compressed_size: u32::MAX,
            uncompressed_size: u32::MAX,
            disk_number: 0,
            internal_file_attributes: 0,
            external_file_attributes: 0o100644 << 16,
            header_offset: 0,
            path: b"huge".to_vec(),
            extra_field: zip64.encode(),
            file_comment: Vec::new(),
        };
        single_entry_archive(&local, b"tiny", &central, b"")
    }

    #[test]
    fn reads_a_stored_entry() -> ZipResult<()> {
        let mut archive = Archive::from_memory(hi_archive(b""), AccessMode::Read)?;
        assert_eq!(archive.len(), 1);
        let entry = archive.entry("hi.txt").expect("no hi.txt");
        assert_eq!(entry.uncompressed_size(), 2);
        assert_eq!(entry.entry_type(), EntryType::File);
        assert_eq!(entry.unix_permissions(), Some(0o644));

        let mut out = Vec::new();
        let crc = archive.extract(&entry, &TransferOptions::default(), |c| {
            out.extend_from_slice(c);
            Ok(())
        })?;
        assert_eq!(out, b"hi");
        assert_eq!(crc, entry.checksum());

        let mut read_back = String::new();
        archive.reader(&entry)?.read_to_string(&mut read_back)?;
        assert_eq!(read_back, "hi");
        Ok(())
    }

    #[test]
    fn comment_with_magic_in_it() -> ZipResult<()> {
        // The comment holds a bogus EOCDR signature that doesn't decode.
        let mut comment = b"see ".to_vec();
        comment.extend_from_slice(&spec::EOCDR_MAGIC);
        comment.extend_from_slice(b" for details");
        let archive = Archive::from_memory(hi_archive(&comment), AccessMode::Read)?;
        assert_eq!(archive.comment(), &comment[..]);
        assert_eq!(archive.len(), 1);
        Ok(())
    }

    #[test]
    fn no_trailer() {
        assert!(matches!(
            Archive::from_memory(b"definitely not a zip file".to_vec(), AccessMode::Read),
            Err(ZipError::MissingDirectoryRecord)
        ));
        assert!(matches!(
            Archive::from_memory(Vec::new(), AccessMode::Read),
            Err(ZipError::MissingDirectoryRecord)
        ));
    }

    #[test]
    fn create_needs_an_empty_store() {
        assert!(matches!(
            Archive::from_memory(hi_archive(b""), AccessMode::Create),
            Err(ZipError::UnwritableArchive(_))
        ));
        let created = Archive::from_memory(Vec::new(), AccessMode::Create).unwrap();
        assert_eq!(created.mode(), AccessMode::Update);
        assert!(created.is_empty());
        assert_eq!(created.into_bytes(), spec::EndOfCentralDirectory::empty().encode());
    }

    #[test]
    fn damaged_directory_truncates_iteration() -> ZipResult<()> {
        let mut bytes = hi_archive(b"");
        // Claim two entries; the second "record" is the EOCDR itself.
        let eocdr_posit = bytes.len() - spec::EndOfCentralDirectory::SIZE;
        bytes[eocdr_posit + 8] = 2;
        bytes[eocdr_posit + 10] = 2;
        let mut archive = Archive::from_memory(bytes, AccessMode::Read)?;
        let entries: Vec<Entry> = archive.entries().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path(), "hi.txt");
        Ok(())
    }

    #[test]
    fn corrupt_data_fails_the_reader() -> ZipResult<()> {
        let mut bytes = hi_archive(b"");
        bytes[spec::LocalFileHeader::SIZE + 6] = b'H'; // "hi" -> "Hi"
        let mut archive = Archive::from_memory(bytes, AccessMode::Read)?;
        let entry = archive.entry("hi.txt").expect("no hi.txt");
        let mut out = Vec::new();
        assert!(archive.reader(&entry)?.read_to_end(&mut out).is_err());

        let crc = archive.extract(&entry, &TransferOptions::default(), |_| Ok(()))?;
        assert_ne!(crc, entry.checksum());
        Ok(())
    }

    #[test]
    fn multi_disk_archives_are_refused() {
        let mut bytes = hi_archive(b"");
        let eocdr_posit = bytes.len() - spec::EndOfCentralDirectory::SIZE;
        bytes[eocdr_posit + 4] = 1; // this disk
        assert!(matches!(
            Archive::from_memory(bytes, AccessMode::Read),
            Err(ZipError::UnreadableArchive(_))
        ));
    }

    #[test]
    fn limits_compare_inclusively() {
        let limits = FormatLimits {
            max_u32: 4096,
            max_u16: 2,
        };
        assert!(!limits.overflows_u32(4095));
        assert!(limits.overflows_u32(4096));
        assert!(limits.overflows_u16(2));
        assert!(FormatLimits::default().overflows_u32(u32::MAX as u64));
        assert!(!FormatLimits::default().overflows_u32(u32::MAX as u64 - 1));
    }

    #[test]
    fn sizes_past_the_end_of_everything() -> ZipResult<()> {
        let hi = Archive::from_memory(hi_archive(b""), AccessMode::Read)?
            .entry("hi.txt")
            .expect("no hi.txt");

        for flags in [spec::DATA_DESCRIPTOR_FLAG | spec::UTF8_FLAG, spec::UTF8_FLAG] {
            let mut archive = Archive::from_memory(huge_entry_archive(flags), AccessMode::Update)?;
            assert_eq!(archive.len(), 1);
            assert_eq!(archive.entries().count(), 0);
            assert!(matches!(
                archive.raw_entries().next(),
                Some(Err(ZipError::MalformedRecord(_)))
            ));
            let before = archive.store().data().to_vec();
            assert!(matches!(
                archive.remove(&hi, &TransferOptions::default()),
                Err(ZipError::MalformedRecord(_))
            ));
            assert_eq!(archive.store().data(), &before[..]);
        }
        Ok(())
    }

    #[test]
    fn reads_sizes_from_data_descriptors() -> ZipResult<()> {
        let mut archive = Archive::from_memory(streamed_archive(), AccessMode::Read)?;
        let entries: Vec<Entry> = archive.entries().collect();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.path(), "dd.txt");
        assert!(!entry.is_zip64());
        assert_eq!(entry.uncompressed_size(), 8);
        assert_eq!(entry.checksum(), crc32fast::hash(b"streamed"));
        assert_eq!(entry.data_offset(), 30 + 6);
        assert_eq!(entry.local_size(), 30 + 6 + 8 + 16);

        let mut out = String::new();
        archive.reader(entry)?.read_to_string(&mut out)?;
        assert_eq!(out, "streamed");
        Ok(())
    }

    #[test]
    fn streamed_entries_survive_updates() -> ZipResult<()> {
        let mut archive = Archive::from_memory(streamed_archive(), AccessMode::Update)?;
        archive.add_entry(
            "after.txt",
            EntryType::File,
            5,
            &crate::write::FileOptions::default(),
            crate::transfer::slice_provider(b"after"),
        )?;
        let after = archive.entry("after.txt").expect("no after.txt");
        // Right past dd.txt's data descriptor
        assert_eq!(after.header_offset(), 30 + 6 + 8 + 16);

        let streamed = archive.entry("dd.txt").expect("no dd.txt");
        let mut out = String::new();
        archive.reader(&streamed)?.read_to_string(&mut out)?;
        assert_eq!(out, "streamed");

        // Removing the entry after it copies its descriptor along.
        archive.remove(&after, &TransferOptions::default())?;
        let streamed = archive.entry("dd.txt").expect("no dd.txt");
        assert_eq!(streamed.local_size(), 30 + 6 + 8 + 16);
        archive.add_entry(
            "again.txt",
            EntryType::File,
            5,
            &crate::write::FileOptions::default(),
            crate::transfer::slice_provider(b"again"),
        )?;

        // And removing it moves everything after it up.
        let streamed = archive.entry("dd.txt").expect("no dd.txt");
        archive.remove(&streamed, &TransferOptions::default())?;
        let entries: Vec<Entry> = archive.entries().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path(), "again.txt");
        assert_eq!(entries[0].header_offset(), 0);
        let mut out = String::new();
        archive.reader(&entries[0])?.read_to_string(&mut out)?;
        assert_eq!(out, "again");
        Ok(())
    }
}
