//! Entries: what the archive knows about each file, directory, or symlink in it

use std::borrow::Cow;
use std::fmt;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use chrono::NaiveDateTime;
use codepage_437::*;

use crate::msdos::parse_msdos;
use crate::result::*;
use crate::spec::{self, Record};

/// The compression method used to store a file
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompressionMethod {
    /// The file is uncompressed
    None,
    /// The file is [DEFLATE](https://en.wikipedia.org/wiki/DEFLATE)d.
    /// This is the most common format used by ZIP archives.
    Deflate,
    /// The file is compressed with a yet-unsupported format.
    /// (The u16 indicates the internal format code.)
    Unsupported(u16),
}

impl CompressionMethod {
    pub fn from_u16(u: u16) -> Self {
        match u {
            0 => CompressionMethod::None,
            8 => CompressionMethod::Deflate,
            v => CompressionMethod::Unsupported(v),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            CompressionMethod::None => 0,
            CompressionMethod::Deflate => 8,
            CompressionMethod::Unsupported(v) => v,
        }
    }
}

/// What an entry is
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EntryType {
    File,
    Directory,
    Symlink,
}

/// How to decode paths not flagged as UTF-8
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PathEncoding {
    Utf8,
    /// IBM PC code page 437, the ZIP default
    Cp437,
}

impl PathEncoding {
    pub fn decode<'a>(self, bytes: &'a [u8]) -> ZipResult<Cow<'a, str>> {
        match self {
            PathEncoding::Utf8 => std::str::from_utf8(bytes)
                .map(Cow::Borrowed)
                .map_err(|e| ZipError::InvalidEntryPath(format!("Path isn't UTF-8: {e}"))),
            PathEncoding::Cp437 => Ok(Cow::borrow_from_cp437(bytes, &CP437_CONTROL)),
        }
    }
}

/// Decodes a raw path, honoring the UTF-8 flag first and the caller's preference second.
pub(crate) fn decode_path(
    raw: &[u8],
    flags: u16,
    preferred: Option<PathEncoding>,
) -> ZipResult<String> {
    let encoding = if spec::is_utf8(flags) {
        PathEncoding::Utf8
    } else {
        preferred.unwrap_or(PathEncoding::Cp437)
    };
    Ok(encoding.decode(raw)?.into_owned())
}

/// The OS a file in the archive was compressed with.
/// Used to decode additional metadata like permissions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum System {
    Dos,
    Unix,
    Osx,
    Unknown,
}

impl System {
    fn from_source_version(source_version: u16) -> Self {
        // 4.4.2: The upper byte of "version made by" says whose
        // file attributes are stored in the external attributes field.
        // 0 is MS-DOS, 3 is UNIX, 19 is OS X (Darwin); the rest
        // (VMS, Amiga, NTFS, ...) we can't decode.
        match source_version >> 8 {
            0 => System::Dos,
            3 => System::Unix,
            19 => System::Osx,
            _ => System::Unknown,
        }
    }
}

// POSIX file type bits, as stored in the upper half of the external attributes
pub(crate) const S_IFMT: u32 = 0o170000;
pub(crate) const S_IFREG: u32 = 0o100000;
pub(crate) const S_IFDIR: u32 = 0o040000;
pub(crate) const S_IFLNK: u32 = 0o120000;

/// MS-DOS directory attribute bit
const DOS_DIRECTORY: u32 = 0x10;

/// External attributes for a new entry, UNIX style
pub(crate) fn external_attributes(entry_type: EntryType, permissions: u16) -> u32 {
    let file_type = match entry_type {
        EntryType::File => S_IFREG,
        EntryType::Directory => S_IFDIR,
        EntryType::Symlink => S_IFLNK,
    };
    (file_type | (permissions as u32 & 0o7777)) << 16
}

/// The records behind one entry, straight from the archive.
///
/// Unlike [`Entry`], these exist for every central directory record,
/// encrypted or not, so the archive can shuffle them around without reading them.
#[derive(Debug, Clone)]
pub(crate) struct EntryRecords {
    pub central_directory: spec::CentralDirectoryEntry,
    pub local_header: spec::LocalFileHeader,
    pub data_descriptor: Option<spec::DataDescriptor>,
    pub zip64_data_descriptor: Option<spec::Zip64DataDescriptor>,
    pub zip64_info: Option<spec::Zip64ExtendedInformation>,
}

impl EntryRecords {
    /// Pairs a central directory record with its local header.
    /// Any data descriptor is filled in afterwards.
    pub fn new(
        central_directory: spec::CentralDirectoryEntry,
        local_header: spec::LocalFileHeader,
    ) -> ZipResult<Self> {
        let zip64_info = central_directory.zip64_info()?;
        Ok(Self {
            central_directory,
            local_header,
            data_descriptor: None,
            zip64_data_descriptor: None,
            zip64_info,
        })
    }

    pub fn is_zip64(&self) -> bool {
        (self.central_directory.minimum_extract_version & 0xff) >= spec::ZIP64_VERSION
            || self.zip64_info.is_some()
    }

    pub fn uses_data_descriptor(&self) -> bool {
        spec::uses_data_descriptor(self.central_directory.flags)
    }

    fn exact_uncompressed_size(&self) -> u64 {
        match self.zip64_info.and_then(|z| z.uncompressed_size) {
            Some(size) if self.central_directory.uncompressed_size == u32::MAX => size,
            _ => self.central_directory.uncompressed_size as u64,
        }
    }

    fn exact_compressed_size(&self) -> u64 {
        match self.zip64_info.and_then(|z| z.compressed_size) {
            Some(size) if self.central_directory.compressed_size == u32::MAX => size,
            _ => self.central_directory.compressed_size as u64,
        }
    }

    pub fn uncompressed_size(&self) -> u64 {
        self.zip64_data_descriptor
            .map(|d| d.uncompressed_size)
            .or_else(|| self.data_descriptor.map(|d| d.uncompressed_size as u64))
            .unwrap_or_else(|| self.exact_uncompressed_size())
    }

    pub fn compressed_size(&self) -> u64 {
        self.zip64_data_descriptor
            .map(|d| d.compressed_size)
            .or_else(|| self.data_descriptor.map(|d| d.compressed_size as u64))
            .unwrap_or_else(|| self.exact_compressed_size())
    }

    /// True if the data descriptor (if any) has 8-byte sizes,
    /// which is the case whenever the local header has a Zip64 block (4.3.9.2).
    pub fn has_zip64_descriptor(&self) -> ZipResult<bool> {
        spec::has_zip64_field(&self.local_header.extra_field)
    }

    pub fn checksum(&self) -> u32 {
        if self.uses_data_descriptor() {
            self.zip64_data_descriptor
                .map(|d| d.crc32)
                .or_else(|| self.data_descriptor.map(|d| d.crc32))
                .unwrap_or(0)
        } else {
            self.central_directory.crc32
        }
    }

    pub fn header_offset(&self) -> u64 {
        self.central_directory
            .exact_header_offset(self.zip64_info.as_ref())
    }

    pub fn data_offset(&self) -> ZipResult<u64> {
        self.header_offset()
            .checked_add(self.local_header.len_in_file())
            .ok_or_else(past_the_end)
    }

    /// Bytes of entry data as it sits in the archive
    pub fn stored_size(&self) -> u64 {
        if self.central_directory.compression_method == CompressionMethod::None.as_u16() {
            self.uncompressed_size()
        } else {
            self.compressed_size()
        }
    }

    /// Bytes taken up by the local file header, the data, and any data descriptor
    pub fn local_size(&self) -> ZipResult<u64> {
        let descriptor = if self.zip64_data_descriptor.is_some() {
            spec::Zip64DataDescriptor::SIZE
        } else if self.data_descriptor.is_some() {
            spec::DataDescriptor::SIZE
        } else {
            0
        };
        self.local_header
            .len_in_file()
            .checked_add(self.stored_size())
            .and_then(|size| size.checked_add(descriptor as u64))
            .ok_or_else(past_the_end)
    }

    /// Offset just past the entry's data and any data descriptor
    pub fn end_offset(&self) -> ZipResult<u64> {
        self.header_offset()
            .checked_add(self.local_size()?)
            .ok_or_else(past_the_end)
    }
}

fn past_the_end() -> ZipError {
    ZipError::MalformedRecord("Entry runs past the largest possible offset")
}

/// A file, directory, or symbolic link in the archive.
///
/// Entries are snapshots: any change to the archive invalidates them,
/// so get fresh ones from [`Archive::entries()`] afterwards.
///
/// [`Archive::entries()`]: ../read/struct.Archive.html#method.entries
#[derive(Clone)]
pub struct Entry {
    pub(crate) records: EntryRecords,
    path: String,
    data_offset: u64,
    local_size: u64,
}

impl Entry {
    /// Checks over an entry's records.
    ///
    /// Fails for encrypted entries (which we can't read),
    /// paths we can't decode, and sizes that don't fit in the archive.
    pub(crate) fn new(
        records: EntryRecords,
        preferred_encoding: Option<PathEncoding>,
    ) -> ZipResult<Self> {
        let cde = &records.central_directory;
        let path = decode_path(&cde.path, cde.flags, preferred_encoding)?;
        if spec::is_encrypted(cde.flags) {
            return Err(ZipError::UnreadableArchive(format!(
                "No support for encrypted files, as {path} claims to be"
            )));
        }
        let data_offset = records.data_offset()?;
        let local_size = records.local_size()?;
        records.end_offset()?;
        Ok(Self {
            records,
            path,
            data_offset,
            local_size,
        })
    }

    /// The path of the entry inside the archive, as stored.
    ///
    /// This is _not_ sanitized; see [`enclosed_path()`](Entry::enclosed_path)
    /// before using it as a file system path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The path, if it's relative and doesn't climb out of wherever it's extracted to.
    ///
    /// `.` components are dropped. Absolute paths and those with `..` give `None`.
    pub fn enclosed_path(&self) -> Option<Utf8PathBuf> {
        let mut enclosed = Utf8PathBuf::new();
        for component in Utf8Path::new(&self.path).components() {
            match component {
                Utf8Component::Normal(c) => enclosed.push(c),
                Utf8Component::CurDir => {}
                Utf8Component::Prefix(_) | Utf8Component::RootDir | Utf8Component::ParentDir => {
                    return None
                }
            }
        }
        if enclosed.as_str().is_empty() {
            None
        } else {
            Some(enclosed)
        }
    }

    pub fn entry_type(&self) -> EntryType {
        let trailing_slash = self.path.ends_with('/');
        let guess = |is_dir| {
            if is_dir {
                EntryType::Directory
            } else {
                EntryType::File
            }
        };
        let cde = &self.records.central_directory;
        let external = cde.external_file_attributes;
        match System::from_source_version(cde.source_version) {
            System::Unix | System::Osx => match (external >> 16) & S_IFMT {
                S_IFREG => EntryType::File,
                S_IFDIR => EntryType::Directory,
                S_IFLNK => EntryType::Symlink,
                _ => guess(trailing_slash),
            },
            System::Dos => guess(trailing_slash || external & DOS_DIRECTORY != 0),
            System::Unknown => guess(trailing_slash),
        }
    }

    pub fn compression_method(&self) -> CompressionMethod {
        CompressionMethod::from_u16(self.records.central_directory.compression_method)
    }

    /// The CRC-32 of the uncompressed data,
    /// from the data descriptor if the entry has one.
    pub fn checksum(&self) -> u32 {
        self.records.checksum()
    }

    /// True if the entry uses any Zip64 structures
    pub fn is_zip64(&self) -> bool {
        self.records.is_zip64()
    }

    /// Size of the entry's data once extracted
    pub fn uncompressed_size(&self) -> u64 {
        self.records.uncompressed_size()
    }

    /// Size of the entry's data as stored in the archive
    pub fn compressed_size(&self) -> u64 {
        self.records.compressed_size()
    }

    /// Offset of the entry's local file header in the archive
    pub fn header_offset(&self) -> u64 {
        self.records.header_offset()
    }

    /// Offset of the entry's data in the archive, just past its local file header
    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }

    /// Bytes taken up by the local file header, the data, and any data descriptor
    pub fn local_size(&self) -> u64 {
        self.local_size
    }

    pub fn last_modified(&self) -> NaiveDateTime {
        let cde = &self.records.central_directory;
        parse_msdos(cde.last_modified_time, cde.last_modified_date)
    }

    pub fn external_attributes(&self) -> u32 {
        self.records.central_directory.external_file_attributes
    }

    /// Unix permission bits, if the entry was archived on a Unix-like OS.
    ///
    /// No attempt is made to translate DOS attributes.
    pub fn unix_permissions(&self) -> Option<u16> {
        let cde = &self.records.central_directory;
        match System::from_source_version(cde.source_version) {
            System::Unix | System::Osx => Some(((cde.external_file_attributes >> 16) & 0o7777) as u16),
            _ => None,
        }
    }

    /// True if these are the records behind this entry
    pub(crate) fn is_backed_by(&self, records: &EntryRecords) -> bool {
        self.records.central_directory.path == records.central_directory.path
            && self.records.local_header.crc32 == records.local_header.crc32
            && self.header_offset() == records.header_offset()
    }
}

impl PartialEq for Entry {
    /// Paths can repeat in an archive, so the header offset tells duplicates apart.
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
            && self.records.local_header.crc32 == other.records.local_header.crc32
            && self.header_offset() == other.header_offset()
    }
}

impl Eq for Entry {}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("path", &self.path)
            .field("type", &self.entry_type())
            .field("compression_method", &self.compression_method())
            .field("uncompressed_size", &self.uncompressed_size())
            .field("compressed_size", &self.compressed_size())
            .field("checksum", &format_args!("{:#010x}", self.checksum()))
            .field("header_offset", &self.header_offset())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn central_directory(path: &str, source_version: u16, external: u32) -> spec::CentralDirectoryEntry {
        spec::CentralDirectoryEntry {
            source_version,
            minimum_extract_version: spec::DEFAULT_VERSION,
            flags: spec::UTF8_FLAG,
            compression_method: 0,
            last_modified_time: 0,
            last_modified_date: (1 << 5) | 1,
            crc32: 0x1234,
            compressed_size: 10,
            uncompressed_size: 10,
            disk_number: 0,
            internal_file_attributes: 0,
            external_file_attributes: external,
            header_offset: 100,
            path: path.as_bytes().to_vec(),
            extra_field: Vec::new(),
            file_comment: Vec::new(),
        }
    }

    fn local_header(cd: &spec::CentralDirectoryEntry) -> spec::LocalFileHeader {
        spec::LocalFileHeader {
            minimum_extract_version: cd.minimum_extract_version,
            flags: cd.flags,
            compression_method: cd.compression_method,
            last_modified_time: cd.last_modified_time,
            last_modified_date: cd.last_modified_date,
            crc32: cd.crc32,
            compressed_size: cd.compressed_size,
            uncompressed_size: cd.uncompressed_size,
            path: cd.path.clone(),
            extra_field: Vec::new(),
        }
    }

    fn records(cd: spec::CentralDirectoryEntry) -> EntryRecords {
        let lfh = local_header(&cd);
        EntryRecords::new(cd, lfh).unwrap()
    }

    fn entry(cd: spec::CentralDirectoryEntry) -> Entry {
        Entry::new(records(cd), None).unwrap()
    }

    #[test]
    fn types_from_unix_modes() {
        let unix = spec::UNIX_VERSION_MADE_BY;
        let e = entry(central_directory("a", unix, external_attributes(EntryType::File, 0o644)));
        assert_eq!(e.entry_type(), EntryType::File);
        assert_eq!(e.unix_permissions(), Some(0o644));

        let e = entry(central_directory("d/", unix, external_attributes(EntryType::Directory, 0o755)));
        assert_eq!(e.entry_type(), EntryType::Directory);

        let e = entry(central_directory("l", unix, external_attributes(EntryType::Symlink, 0o777)));
        assert_eq!(e.entry_type(), EntryType::Symlink);

        // No mode bits; fall back to the trailing slash.
        let e = entry(central_directory("d/", unix, 0));
        assert_eq!(e.entry_type(), EntryType::Directory);
    }

    #[test]
    fn types_from_dos_attributes() {
        let e = entry(central_directory("dir", 20, DOS_DIRECTORY));
        assert_eq!(e.entry_type(), EntryType::Directory);
        assert_eq!(e.unix_permissions(), None);
        let e = entry(central_directory("file", 20, 0x20));
        assert_eq!(e.entry_type(), EntryType::File);
        // NTFS: only the slash counts.
        let e = entry(central_directory("dir/", 10 << 8, 0));
        assert_eq!(e.entry_type(), EntryType::Directory);
    }

    #[test]
    fn encrypted_entries_are_refused() {
        let mut cd = central_directory("secret", spec::UNIX_VERSION_MADE_BY, 0);
        cd.flags |= spec::ENCRYPTED_FLAG;
        assert!(Entry::new(records(cd), None).is_err());
    }

    #[test]
    fn cp437_paths() {
        let mut cd = central_directory("", 0, 0);
        cd.flags = 0;
        cd.path = vec![b'c', b'a', b'f', 0x82]; // 0x82 is é
        let e = Entry::new(records(cd.clone()), None).unwrap();
        assert_eq!(e.path(), "café");

        // Asking for UTF-8 fails on the same bytes.
        assert!(Entry::new(records(cd), Some(PathEncoding::Utf8)).is_err());
    }

    #[test]
    fn descriptor_overrides_checksum_and_sizes() {
        let mut cd = central_directory("streamed", spec::UNIX_VERSION_MADE_BY, 0);
        cd.flags |= spec::DATA_DESCRIPTOR_FLAG;
        cd.crc32 = 0;
        let mut records = records(cd);
        records.data_descriptor = Some(spec::DataDescriptor {
            crc32: 0xcafe,
            compressed_size: 10,
            uncompressed_size: 10,
        });
        let e = Entry::new(records, None).unwrap();
        assert_eq!(e.checksum(), 0xcafe);
        assert_eq!(e.local_size(), 30 + 8 + 10 + 16);
        assert_eq!(e.data_offset(), 100 + 30 + 8);
    }

    #[test]
    fn zip64_values_win_over_sentinels() {
        let mut cd = central_directory("big", spec::UNIX_VERSION_MADE_BY, 0);
        cd.uncompressed_size = u32::MAX;
        cd.compressed_size = u32::MAX;
        cd.header_offset = u32::MAX;
        cd.extra_field = spec::Zip64ExtendedInformation {
            uncompressed_size: Some(1 << 32),
            compressed_size: Some((1 << 32) + 1),
            header_offset: Some(1 << 40),
            disk_number: None,
        }
        .encode();
        let e = entry(cd);
        assert!(e.is_zip64());
        assert_eq!(e.uncompressed_size(), 1 << 32);
        assert_eq!(e.compressed_size(), (1 << 32) + 1);
        assert_eq!(e.header_offset(), 1 << 40);
    }

    #[test]
    fn enclosed_paths() {
        let unix = spec::UNIX_VERSION_MADE_BY;
        let path_of = |p: &str| entry(central_directory(p, unix, 0)).enclosed_path();
        assert_eq!(path_of("a/./b.txt").unwrap(), "a/b.txt");
        assert_eq!(path_of("dir/").unwrap(), "dir");
        assert!(path_of("../evil").is_none());
        assert!(path_of("a/../../evil").is_none());
        assert!(path_of("/etc/passwd").is_none());
        assert!(path_of("./").is_none());
    }

    #[test]
    fn equality_tells_duplicates_apart() {
        let unix = spec::UNIX_VERSION_MADE_BY;
        let a = entry(central_directory("same", unix, 0));
        let mut cd = central_directory("same", unix, 0);
        assert_eq!(a, entry(cd.clone()));
        cd.header_offset = 200;
        assert_ne!(a, entry(cd));
    }
}
