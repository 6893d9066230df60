//! Adding entries to an [`Archive`] and removing them.
//!
//! ZIP archives keep their central directory at the very end, so adding an
//! entry writes its local header and data over the old central directory,
//! then writes that directory back out after it, plus a record for the newcomer.
//! If anything goes wrong along the way, the old directory and trailer are put
//! back where they were and the archive is byte-for-byte what it was before.
//!
//! Removing an entry copies everything else into a scratch store,
//! then swaps it in for the original.
//!
//! ```no_run
//! # use zipmend::*;
//! let mut archive = Archive::open("foo.zip", AccessMode::Update)?;
//! let contents = b"Hello, world!";
//! archive.add_entry(
//!     "hello.txt",
//!     EntryType::File,
//!     contents.len() as u64,
//!     &FileOptions::default().compression_method(CompressionMethod::Deflate),
//!     slice_provider(contents),
//! )?;
//!
//! if let Some(old) = archive.entry("goodbye.txt") {
//!     archive.remove(&old, &TransferOptions::default())?;
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! [`Archive`]: ../read/struct.Archive.html

use std::io::{prelude::*, SeekFrom};

use chrono::{Local, NaiveDateTime};
use log::*;

use crate::arch::usize;
use crate::entry::*;
use crate::msdos::to_msdos;
use crate::read::{AccessMode, Archive, FormatLimits, Trailer};
use crate::result::*;
use crate::spec::{self, Record};
use crate::store::ByteStore;
use crate::transfer::{self, TransferOptions};

/// Permissions for new files and symbolic links, unless told otherwise
pub const DEFAULT_FILE_PERMISSIONS: u16 = 0o644;
/// Permissions for new directories, unless told otherwise
pub const DEFAULT_DIRECTORY_PERMISSIONS: u16 = 0o755;

/// How to store a new entry
#[derive(Debug, Clone)]
pub struct FileOptions {
    /// Ignored (and forced to [`CompressionMethod::None`])
    /// for directories and symbolic links.
    pub compression_method: CompressionMethod,
    /// Defaults to now.
    pub last_modified: Option<NaiveDateTime>,
    /// Defaults to [`DEFAULT_FILE_PERMISSIONS`] or [`DEFAULT_DIRECTORY_PERMISSIONS`].
    pub permissions: Option<u16>,
    pub transfer: TransferOptions,
}

impl Default for FileOptions {
    fn default() -> Self {
        Self {
            compression_method: CompressionMethod::None,
            last_modified: None,
            permissions: None,
            transfer: TransferOptions::default(),
        }
    }
}

impl FileOptions {
    pub fn compression_method(mut self, method: CompressionMethod) -> Self {
        self.compression_method = method;
        self
    }

    pub fn last_modified(mut self, when: NaiveDateTime) -> Self {
        self.last_modified = Some(when);
        self
    }

    pub fn permissions(mut self, permissions: u16) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn transfer(mut self, transfer: TransferOptions) -> Self {
        self.transfer = transfer;
        self
    }
}

/// Everything about a new entry that doesn't depend on its data
struct NewEntry {
    path: Vec<u8>,
    method: CompressionMethod,
    size: u64,
    time: u16,
    date: u16,
    external_attributes: u32,
}

/// What goes in a new entry's local extra field
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum LocalExtra {
    Empty,
    /// Padding as long as a Zip64 block, so one can replace it
    /// without moving the data that follows.
    Reserved,
    /// Both sizes, with sentinels in the legacy fields
    Zip64,
}

/// The Zip64 block of a local header, which always carries both sizes (4.5.3).
fn local_zip64_block(compressed: u64, uncompressed: u64) -> Vec<u8> {
    spec::Zip64ExtendedInformation {
        uncompressed_size: Some(uncompressed),
        compressed_size: Some(compressed),
        ..Default::default()
    }
    .encode()
}

impl NewEntry {
    /// Builds the local file header.
    fn local_header(
        &self,
        crc32: u32,
        compressed: u64,
        uncompressed: u64,
        extra: LocalExtra,
    ) -> spec::LocalFileHeader {
        let (version, compressed_size, uncompressed_size, extra_field) = match extra {
            LocalExtra::Zip64 => (
                spec::ZIP64_VERSION,
                u32::MAX,
                u32::MAX,
                local_zip64_block(compressed, uncompressed),
            ),
            LocalExtra::Reserved => (
                spec::DEFAULT_VERSION,
                compressed as u32,
                uncompressed as u32,
                spec::padding_field(local_zip64_block(0, 0).len()),
            ),
            LocalExtra::Empty => (
                spec::DEFAULT_VERSION,
                compressed as u32,
                uncompressed as u32,
                Vec::new(),
            ),
        };
        spec::LocalFileHeader {
            minimum_extract_version: version,
            flags: spec::UTF8_FLAG,
            compression_method: self.method.as_u16(),
            last_modified_time: self.time,
            last_modified_date: self.date,
            crc32,
            compressed_size,
            uncompressed_size,
            path: self.path.clone(),
            extra_field,
        }
    }

    /// Builds the central directory record,
    /// moving each overflowing field into a Zip64 extra field on its own.
    fn central_directory_entry(
        &self,
        local: &spec::LocalFileHeader,
        compressed: u64,
        uncompressed: u64,
        header_offset: u64,
        limits: &FormatLimits,
    ) -> spec::CentralDirectoryEntry {
        let info = spec::Zip64ExtendedInformation {
            uncompressed_size: Some(uncompressed).filter(|s| limits.overflows_u32(*s)),
            compressed_size: Some(compressed).filter(|s| limits.overflows_u32(*s)),
            header_offset: Some(header_offset).filter(|o| limits.overflows_u32(*o)),
            disk_number: None,
        };
        if !info.is_empty() {
            debug!("Promoting to Zip64: {:?}", info);
        }
        let (minimum_extract_version, extra_field) = if info.is_empty() {
            (spec::DEFAULT_VERSION, Vec::new())
        } else {
            (spec::ZIP64_VERSION, info.encode())
        };
        spec::CentralDirectoryEntry {
            source_version: spec::UNIX_VERSION_MADE_BY,
            minimum_extract_version,
            flags: local.flags,
            compression_method: local.compression_method,
            last_modified_time: local.last_modified_time,
            last_modified_date: local.last_modified_date,
            crc32: local.crc32,
            compressed_size: legacy_u32(info.compressed_size, compressed),
            uncompressed_size: legacy_u32(info.uncompressed_size, uncompressed),
            disk_number: 0,
            internal_file_attributes: 0,
            external_file_attributes: self.external_attributes,
            header_offset: legacy_u32(info.header_offset, header_offset),
            path: self.path.clone(),
            extra_field,
            file_comment: Vec::new(),
        }
    }
}

/// The value for a legacy field: the sentinel if it moved to a Zip64 field.
fn legacy_u32(promoted: Option<u64>, value: u64) -> u32 {
    match promoted {
        Some(_) => u32::MAX,
        None => value as u32,
    }
}

/// zlib's worst case for deflating `size` bytes
fn deflate_bound(size: u64) -> u64 {
    size.saturating_add(size >> 12)
        .saturating_add(size >> 14)
        .saturating_add(size >> 25)
        .saturating_add(13)
}

/// Writes the (optional) Zip64 trailer and the End of central directory record
/// at the current position, just after the central directory.
pub(crate) fn write_trailer<W: Write>(
    store: &mut W,
    entries: u64,
    central_directory_size: u64,
    central_directory_offset: u64,
    comment: &[u8],
    limits: &FormatLimits,
) -> ZipResult<Trailer> {
    let entries_overflow = limits.overflows_u16(entries);
    let size_overflow = limits.overflows_u32(central_directory_size);
    let offset_overflow = limits.overflows_u32(central_directory_offset);

    let zip64 = if entries_overflow || size_overflow || offset_overflow {
        let record_offset = central_directory_offset
            .checked_add(central_directory_size)
            .ok_or(ZipError::InvalidCentralDirectorySize)?;
        debug!(
            "Writing Zip64 trailer at {} (entries: {}, size: {}, offset: {})",
            record_offset, entries_overflow, size_overflow, offset_overflow
        );
        let record = spec::Zip64EndOfCentralDirectory::new(
            entries,
            central_directory_size,
            central_directory_offset,
        );
        store.write_all(&record.encode())?;
        let locator = spec::Zip64EndOfCentralDirectoryLocator::new(record_offset);
        store.write_all(&locator.encode())?;
        Some(record)
    } else {
        None
    };

    let legacy_entries = if entries_overflow {
        u16::MAX
    } else {
        entries as u16
    };
    let eocdr = spec::EndOfCentralDirectory {
        disk_number: 0,
        disk_with_central_directory: 0,
        entries_on_this_disk: legacy_entries,
        entries: legacy_entries,
        central_directory_size: if size_overflow {
            u32::MAX
        } else {
            central_directory_size as u32
        },
        central_directory_offset: if offset_overflow {
            u32::MAX
        } else {
            central_directory_offset as u32
        },
        file_comment: comment.to_vec(),
    };
    store.write_all(&eocdr.encode())?;
    Ok(Trailer { eocdr, zip64 })
}

/// Moves a central directory record to describe a local header at `new_offset`,
/// redoing its Zip64 extra field as needed.
fn relocate(
    records: &EntryRecords,
    new_offset: u64,
    limits: &FormatLimits,
) -> ZipResult<spec::CentralDirectoryEntry> {
    let mut relocated = records.central_directory.clone();
    let old = records.zip64_info.unwrap_or_default();
    let offset_overflows = limits.overflows_u32(new_offset);
    let info = spec::Zip64ExtendedInformation {
        header_offset: Some(new_offset).filter(|_| offset_overflows),
        ..old
    };
    relocated.header_offset = legacy_u32(info.header_offset, new_offset);

    let mut extra_field = Vec::new();
    if !info.is_empty() {
        extra_field = info.encode();
        relocated.minimum_extract_version =
            relocated.minimum_extract_version.max(spec::ZIP64_VERSION);
    } else if records.zip64_info.is_some()
        && relocated.minimum_extract_version == spec::ZIP64_VERSION
        && !records.has_zip64_descriptor()?
    {
        // Zip64 was all that needed version 4.5, and it's gone now.
        relocated.minimum_extract_version = spec::DEFAULT_VERSION;
    }
    extra_field.extend_from_slice(&spec::without_zip64_field(&relocated.extra_field)?);
    if extra_field.len() > u16::MAX as usize {
        return Err(ZipError::UnwritableArchive(format!(
            "No room left in the extra field of {}",
            String::from_utf8_lossy(&relocated.path)
        )));
    }
    relocated.extra_field = extra_field;
    Ok(relocated)
}

impl<S: ByteStore> Archive<S> {
    fn check_writable(&self) -> ZipResult<()> {
        match self.mode {
            AccessMode::Read => Err(ZipError::UnwritableArchive(String::from(
                "Archive was opened read-only",
            ))),
            _ => Ok(()),
        }
    }

    /// Adds an entry of the given type and (uncompressed) size,
    /// pulling its data from `provider`.
    ///
    /// Directories have no data (and get a trailing `/` if they lack one);
    /// a symbolic link's data is the path it points to.
    /// If this fails, the archive is left exactly as it was.
    pub fn add_entry<P>(
        &mut self,
        path: &str,
        entry_type: EntryType,
        size: u64,
        options: &FileOptions,
        provider: P,
    ) -> ZipResult<()>
    where
        P: FnMut(u64, usize) -> ZipResult<Vec<u8>>,
    {
        self.check_writable()?;

        let mut path = path.to_owned();
        if entry_type == EntryType::Directory && !path.ends_with('/') {
            path.push('/');
        }
        if path.is_empty() || path.len() > u16::MAX as usize {
            return Err(ZipError::InvalidEntryPath(format!(
                "Entry paths must be 1 to 65535 bytes long (got {})",
                path.len()
            )));
        }
        let method = match entry_type {
            EntryType::File => options.compression_method,
            EntryType::Directory | EntryType::Symlink => CompressionMethod::None,
        };
        if let CompressionMethod::Unsupported(m) = method {
            return Err(ZipError::InvalidCompressionMethod(m));
        }
        let size = match entry_type {
            EntryType::Directory => 0,
            _ => size,
        };
        let modified = options
            .last_modified
            .unwrap_or_else(|| Local::now().naive_local());
        let (time, date) = to_msdos(&modified);
        let permissions = options.permissions.unwrap_or(match entry_type {
            EntryType::Directory => DEFAULT_DIRECTORY_PERMISSIONS,
            _ => DEFAULT_FILE_PERMISSIONS,
        });
        let new_entry = NewEntry {
            path: path.into_bytes(),
            method,
            size,
            time,
            date,
            external_attributes: external_attributes(entry_type, permissions),
        };

        // The new entry goes where the central directory is now.
        // Hang onto it (and the trailer after it) so we can put them back.
        let central_directory_offset = self.trailer.central_directory_offset();
        let store_len = self.store.len()?;
        let tail_len = store_len
            .checked_sub(central_directory_offset)
            .ok_or(ZipError::InvalidOffset)?;
        let mut tail = Vec::with_capacity(usize(tail_len)?);
        self.store.seek(SeekFrom::Start(central_directory_offset))?;
        (&mut self.store).take(tail_len).read_to_end(&mut tail)?;
        let central_directory_size = usize(self.trailer.central_directory_size())?;
        if tail.len() < central_directory_size {
            return Err(ZipError::MalformedRecord("Central directory runs past the end"));
        }

        let written = self.write_entry(
            &new_entry,
            &options.transfer,
            provider,
            central_directory_offset,
            &tail[..central_directory_size],
        );
        match written {
            Ok(trailer) => {
                debug!(
                    "Added {} ({} bytes)",
                    String::from_utf8_lossy(&new_entry.path),
                    new_entry.size
                );
                self.trailer = trailer;
                Ok(())
            }
            Err(e) => {
                debug!("Adding entry failed ({}); rolling back", e);
                if let Err(rollback_error) = self.restore_tail(central_directory_offset, &tail) {
                    warn!("Couldn't roll back failed add: {}", rollback_error);
                }
                Err(e)
            }
        }
    }

    /// Puts back the central directory and trailer an add was writing over.
    fn restore_tail(&mut self, offset: u64, tail: &[u8]) -> ZipResult<()> {
        self.store.truncate(offset)?;
        self.store.seek(SeekFrom::Start(offset))?;
        self.store.write_all(tail)?;
        self.store.flush()?;
        Ok(())
    }

    fn write_entry<P>(
        &mut self,
        new_entry: &NewEntry,
        transfer_options: &TransferOptions,
        provider: P,
        header_offset: u64,
        old_central_directory: &[u8],
    ) -> ZipResult<Trailer>
    where
        P: FnMut(u64, usize) -> ZipResult<Vec<u8>>,
    {
        let limits = self.options.limits;

        // We don't know the compressed size until we're done,
        // so assume the worst when deciding if the header needs Zip64 room.
        let worst_case = match new_entry.method {
            CompressionMethod::Deflate => deflate_bound(new_entry.size),
            _ => new_entry.size,
        };
        let reserved = limits.overflows_u32(new_entry.size) || limits.overflows_u32(worst_case);
        let provisional_extra = if reserved {
            LocalExtra::Reserved
        } else {
            LocalExtra::Empty
        };

        let provisional = new_entry.local_header(0, 0, 0, provisional_extra);
        trace!("{:?}", provisional);
        self.store.seek(SeekFrom::Start(header_offset))?;
        self.store.write_all(&provisional.encode())?;

        let store = &mut self.store;
        let consumer = |chunk: &[u8]| -> ZipResult<()> {
            store.write_all(chunk)?;
            Ok(())
        };
        let moved = match new_entry.method {
            CompressionMethod::Deflate => {
                transfer::compress(new_entry.size, transfer_options, provider, consumer)?
            }
            _ => transfer::copy_stored(new_entry.size, transfer_options, provider, consumer)?,
        };
        let (uncompressed, compressed) = (moved.read, moved.written);
        let overflowed = limits.overflows_u32(compressed) || limits.overflows_u32(uncompressed);
        let extra = match (overflowed, provisional_extra) {
            (false, e) => e,
            (true, LocalExtra::Reserved) => {
                debug!("Local header for {} goes Zip64", String::from_utf8_lossy(&new_entry.path));
                LocalExtra::Zip64
            }
            (true, _) => {
                return Err(ZipError::UnwritableArchive(String::from(
                    "Compressed data outgrew its local file header",
                )))
            }
        };

        let local = new_entry.local_header(moved.crc32, compressed, uncompressed, extra);
        trace!("{:?}", local);
        debug_assert_eq!(local.len_in_file(), provisional.len_in_file());
        let data_end = header_offset
            .checked_add(local.len_in_file())
            .and_then(|o| o.checked_add(compressed))
            .ok_or(ZipError::InvalidOffset)?;
        self.store.seek(SeekFrom::Start(header_offset))?;
        self.store.write_all(&local.encode())?;

        let central =
            new_entry.central_directory_entry(&local, compressed, uncompressed, header_offset, &limits);
        trace!("{:?}", central);
        self.store.seek(SeekFrom::Start(data_end))?;
        self.store.write_all(old_central_directory)?;
        self.store.write_all(&central.encode())?;

        let entries = self
            .trailer
            .entries()
            .checked_add(1)
            .ok_or(ZipError::InvalidNumberOfEntries)?;
        let central_directory_size = (old_central_directory.len() as u64)
            .checked_add(central.len_in_file())
            .ok_or(ZipError::InvalidCentralDirectorySize)?;
        let comment = self.trailer.eocdr.file_comment.clone();
        let trailer = write_trailer(
            &mut self.store,
            entries,
            central_directory_size,
            data_end,
            &comment,
            &limits,
        )?;
        let end = self.store.stream_position()?;
        self.store.truncate(end)?;
        self.store.flush()?;
        Ok(trailer)
    }

    /// Removes the given entry from the archive.
    ///
    /// Everything else is copied (without decompressing) into a scratch store,
    /// which then replaces the archive's own.
    /// The archive isn't touched until that final swap.
    pub fn remove(&mut self, entry: &Entry, options: &TransferOptions) -> ZipResult<()> {
        self.check_writable()?;

        // Unlike entries(), don't skip anything: encrypted entries
        // and those with odd paths still need to be carried over.
        let all = self.raw_entries().collect::<ZipResult<Vec<_>>>()?;
        let target = all
            .iter()
            .position(|records| entry.is_backed_by(records))
            .ok_or_else(|| ZipError::NoSuchFile(entry.path().to_owned()))?;

        let limits = self.options.limits;
        let copy_options = TransferOptions {
            skip_crc32: true,
            ..options.clone()
        };
        let mut scratch = self.store.scratch()?;
        let mut central_directory = Vec::new();
        let mut offset = 0u64;
        let mut count = 0u64;

        for (i, records) in all.iter().enumerate() {
            if i == target {
                continue;
            }
            let start = records.header_offset();
            let local_size = records.local_size()?;
            let store = &mut self.store;
            transfer::copy_stored(
                local_size,
                &copy_options,
                |position, len| {
                    store.seek(SeekFrom::Start(start + position))?;
                    let mut chunk = Vec::with_capacity(len);
                    (&mut *store).take(len as u64).read_to_end(&mut chunk)?;
                    Ok(chunk)
                },
                |chunk| {
                    scratch.write_all(chunk)?;
                    Ok(())
                },
            )?;

            let relocated = relocate(records, offset, &limits)?;
            trace!("{:?}", relocated);
            central_directory.extend_from_slice(&relocated.encode());
            offset = offset
                .checked_add(local_size)
                .ok_or(ZipError::InvalidOffset)?;
            count += 1;
        }

        scratch.write_all(&central_directory)?;
        write_trailer(
            &mut scratch,
            count,
            central_directory.len() as u64,
            offset,
            self.comment(),
            &limits,
        )?;
        scratch.flush()?;

        self.store.replace_with(scratch)?;
        self.refresh_trailer()?;
        debug!("Removed {}", entry.path());
        Ok(())
    }
}
