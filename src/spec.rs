//! Code specific to the ZIP file format specification.
//!
//! Every fixed-layout record in a ZIP archive lives here,
//! along with its encoder and its (paranoid) decoder.
//! Higher-level stuff lives in the [`read`] and [`write`] modules.
//!
//! Section numbers in comments refer to [`APPNOTE.TXT`].
//! [_Zip Files: History, Explanation and Implementation_]
//! is also a fantastic resource and a great read.
//!
//! Decoders take the fixed-size part of a record as a slice and fetch the
//! variable-length tail (names, extra fields, comments) through a callback,
//! so they don't care whether the bytes come from a file or a buffer.
//!
//! [`read`]: ../read/index.html
//! [`write`]: ../write/index.html
//! [`APPNOTE.TXT`]: https://pkware.cachefly.net/webdocs/APPNOTE/APPNOTE-6.3.6.TXT
//! [_Zip Files: History, Explanation and Implementation_]: https://www.hanshq.net/zip.html

use crate::result::*;

// Magic numbers denoting various sections of a ZIP archive

/// Local file header magic number
pub const LOCAL_FILE_HEADER_MAGIC: [u8; 4] = [b'P', b'K', 3, 4];
/// Central directory magic number
pub const CENTRAL_DIRECTORY_MAGIC: [u8; 4] = [b'P', b'K', 1, 2];
/// End of central directory magic number
pub const EOCDR_MAGIC: [u8; 4] = [b'P', b'K', 5, 6];
/// Zip64 end of central directory magic number
pub const ZIP64_EOCDR_MAGIC: [u8; 4] = [b'P', b'K', 6, 6];
/// Zip64 end of central directory locator magic number
pub const ZIP64_EOCDR_LOCATOR_MAGIC: [u8; 4] = [b'P', b'K', 6, 7];
/// Data descriptor magic number
pub const DATA_DESCRIPTOR_MAGIC: [u8; 4] = [b'P', b'K', 7, 8];

/// Header ID of the Zip64 extended information extra field (4.5.3)
pub const ZIP64_EXTRA_FIELD_ID: u16 = 0x0001;
/// Header ID of the alignment padding block Android's `zipalign` writes.
/// Readers skip it, so we use it to hold space in local headers.
pub const PADDING_EXTRA_FIELD_ID: u16 = 0xD935;

/// "Version needed to extract" for plain old stored/deflated files
pub const DEFAULT_VERSION: u16 = 20;
/// Minimum "version needed to extract" for anything using Zip64 structures
pub const ZIP64_VERSION: u16 = 45;
/// "Version made by": UNIX host (upper byte 3), spec version 2.1
pub const UNIX_VERSION_MADE_BY: u16 = (3 << 8) | 21;

/// Bit 0: the entry is encrypted.
pub const ENCRYPTED_FLAG: u16 = 1;
/// Bit 3: sizes and checksum follow the data in a data descriptor.
pub const DATA_DESCRIPTOR_FLAG: u16 = 1 << 3;
/// Bit 11: Language encoding flag (EFS); the path is UTF-8.
pub const UTF8_FLAG: u16 = 1 << 11;

/// Extracts the "is this text UTF-8?" bit from the 16-bit flags field.
///
/// If false, text is assumed to be CP437.
pub fn is_utf8(flags: u16) -> bool {
    flags & UTF8_FLAG != 0
}

/// Extracts the "is this file encrypted?" bit from the 16-bit flags field.
pub fn is_encrypted(flags: u16) -> bool {
    flags & ENCRYPTED_FLAG != 0
}

/// Extracts the "is there a data descriptor after the data?" bit.
pub fn uses_data_descriptor(flags: u16) -> bool {
    flags & DATA_DESCRIPTOR_FLAG != 0
}

/// A fixed-layout ZIP record, optionally followed by variable-length data.
pub trait Record: Sized {
    /// Size in bytes of the fixed part of the record, signature included.
    const SIZE: usize;

    /// Decodes the record from exactly [`Self::SIZE`] bytes,
    /// pulling any trailing variable-length data from `additional`,
    /// which is asked for a number of bytes and should return that many.
    fn decode<F>(fixed: &[u8], additional: F) -> ZipResult<Self>
    where
        F: FnMut(usize) -> ZipResult<Vec<u8>>;

    /// Encodes the record, variable-length data included.
    fn encode(&self) -> Vec<u8>;
}

// Straight from the Rust docs.
// Callers check the slice length against Record::SIZE first,
// so running short here is a bug, not bad input.

/// Reads a little-endian u64 from the front of the provided slice, shrinking it.
fn read_u64(input: &mut &[u8]) -> u64 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u64>());
    *input = rest;
    u64::from_le_bytes(int_bytes.try_into().expect("less than eight bytes for u64"))
}

/// Reads a little-endian u32 from the front of the provided slice, shrinking it.
fn read_u32(input: &mut &[u8]) -> u32 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u32>());
    *input = rest;
    u32::from_le_bytes(int_bytes.try_into().expect("less than four bytes for u32"))
}

/// Reads a little-endian u16 from the front of the provided slice, shrinking it.
fn read_u16(input: &mut &[u8]) -> u16 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u16>());
    *input = rest;
    u16::from_le_bytes(int_bytes.try_into().expect("less than two bytes for u16"))
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Checks the length and signature of a record's fixed part,
/// returning what follows the signature.
fn check_fixed<'a>(
    fixed: &'a [u8],
    size: usize,
    magic: [u8; 4],
    what: &'static str,
) -> ZipResult<&'a [u8]> {
    if fixed.len() != size || fixed[..4] != magic {
        return Err(ZipError::MalformedRecord(what));
    }
    Ok(&fixed[4..])
}

/// Pulls `len` trailing bytes from the supplier, insisting it delivers all of them.
fn fetch<F>(additional: &mut F, len: usize, what: &'static str) -> ZipResult<Vec<u8>>
where
    F: FnMut(usize) -> ZipResult<Vec<u8>>,
{
    if len == 0 {
        return Ok(Vec::new());
    }
    let bytes = additional(len)?;
    if bytes.len() != len {
        return Err(ZipError::MalformedRecord(what));
    }
    Ok(bytes)
}

/// Data from a local file header (4.3.7)
///
/// Each file's contents are preceded by one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFileHeader {
    pub minimum_extract_version: u16,
    pub flags: u16,
    pub compression_method: u16,
    pub last_modified_time: u16,
    pub last_modified_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub path: Vec<u8>,
    pub extra_field: Vec<u8>,
}

impl LocalFileHeader {
    /// Total length of the header in the archive, name and extra field included
    pub fn len_in_file(&self) -> u64 {
        (Self::SIZE + self.path.len() + self.extra_field.len()) as u64
    }

    /// Zip64 sizes, if the header's size fields are set to the sentinel.
    ///
    /// 4.5.3: The local header MUST include BOTH original
    /// and compressed file size fields if either is stored there.
    pub fn zip64_info(&self) -> ZipResult<Option<Zip64ExtendedInformation>> {
        let fields: &[Zip64Field] =
            if self.uncompressed_size == u32::MAX || self.compressed_size == u32::MAX {
                &[Zip64Field::UncompressedSize, Zip64Field::CompressedSize]
            } else {
                &[]
            };
        Zip64ExtendedInformation::scan(&self.extra_field, fields)
    }
}

impl Record for LocalFileHeader {
    const SIZE: usize = 30;

    fn decode<F>(fixed: &[u8], mut additional: F) -> ZipResult<Self>
    where
        F: FnMut(usize) -> ZipResult<Vec<u8>>,
    {
        // signature 4 | version needed 2 | flags 2 | method 2 | mod time 2 |
        // mod date 2 | crc-32 4 | compressed size 4 | uncompressed size 4 |
        // name length 2 | extra field length 2 | name | extra field
        let what = "Invalid local file header";
        let mut header = check_fixed(fixed, Self::SIZE, LOCAL_FILE_HEADER_MAGIC, what)?;
        let minimum_extract_version = read_u16(&mut header);
        let flags = read_u16(&mut header);
        let compression_method = read_u16(&mut header);
        let last_modified_time = read_u16(&mut header);
        let last_modified_date = read_u16(&mut header);
        let crc32 = read_u32(&mut header);
        let compressed_size = read_u32(&mut header);
        let uncompressed_size = read_u32(&mut header);
        let path_length = read_u16(&mut header) as usize;
        let extra_field_length = read_u16(&mut header) as usize;
        let path = fetch(&mut additional, path_length, what)?;
        let extra_field = fetch(&mut additional, extra_field_length, what)?;

        Ok(Self {
            minimum_extract_version,
            flags,
            compression_method,
            last_modified_time,
            last_modified_date,
            crc32,
            compressed_size,
            uncompressed_size,
            path,
            extra_field,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE + self.path.len() + self.extra_field.len());
        out.extend_from_slice(&LOCAL_FILE_HEADER_MAGIC);
        put_u16(&mut out, self.minimum_extract_version);
        put_u16(&mut out, self.flags);
        put_u16(&mut out, self.compression_method);
        put_u16(&mut out, self.last_modified_time);
        put_u16(&mut out, self.last_modified_date);
        put_u32(&mut out, self.crc32);
        put_u32(&mut out, self.compressed_size);
        put_u32(&mut out, self.uncompressed_size);
        put_u16(&mut out, self.path.len() as u16);
        put_u16(&mut out, self.extra_field.len() as u16);
        out.extend_from_slice(&self.path);
        out.extend_from_slice(&self.extra_field);
        out
    }
}

/// Data from a central directory entry (4.3.12)
///
/// Each of these records contains information about a file or folder
/// stored in the ZIP archive. This is the authoritative copy;
/// the local file header just duplicates (some of) it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CentralDirectoryEntry {
    pub source_version: u16,
    pub minimum_extract_version: u16,
    pub flags: u16,
    pub compression_method: u16,
    pub last_modified_time: u16,
    pub last_modified_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub disk_number: u16,
    pub internal_file_attributes: u16,
    pub external_file_attributes: u32,
    pub header_offset: u32,
    pub path: Vec<u8>,
    pub extra_field: Vec<u8>,
    pub file_comment: Vec<u8>,
}

impl CentralDirectoryEntry {
    /// Total length of the record in the archive, variable data included
    pub fn len_in_file(&self) -> u64 {
        (Self::SIZE + self.path.len() + self.extra_field.len() + self.file_comment.len()) as u64
    }

    /// Which fields of the Zip64 extra field we expect,
    /// based on which legacy fields hold the sentinel.
    pub fn zip64_fields(&self) -> Vec<Zip64Field> {
        let mut fields = Vec::with_capacity(4);
        if self.uncompressed_size == u32::MAX {
            fields.push(Zip64Field::UncompressedSize);
        }
        if self.compressed_size == u32::MAX {
            fields.push(Zip64Field::CompressedSize);
        }
        if self.header_offset == u32::MAX {
            fields.push(Zip64Field::HeaderOffset);
        }
        if self.disk_number == u16::MAX {
            fields.push(Zip64Field::DiskNumber);
        }
        fields
    }

    pub fn zip64_info(&self) -> ZipResult<Option<Zip64ExtendedInformation>> {
        Zip64ExtendedInformation::scan(&self.extra_field, &self.zip64_fields())
    }

    /// The local header offset, from the Zip64 extra field if the legacy one is the sentinel
    pub fn exact_header_offset(&self, zip64: Option<&Zip64ExtendedInformation>) -> u64 {
        match zip64.and_then(|z| z.header_offset) {
            Some(offset) if self.header_offset == u32::MAX => offset,
            _ => self.header_offset as u64,
        }
    }
}

impl Record for CentralDirectoryEntry {
    const SIZE: usize = 46;

    fn decode<F>(fixed: &[u8], mut additional: F) -> ZipResult<Self>
    where
        F: FnMut(usize) -> ZipResult<Vec<u8>>,
    {
        // signature 4 | version made by 2 | version needed 2 | flags 2 |
        // method 2 | mod time 2 | mod date 2 | crc-32 4 | compressed size 4 |
        // uncompressed size 4 | name length 2 | extra field length 2 |
        // comment length 2 | disk number start 2 | internal attributes 2 |
        // external attributes 4 | local header offset 4 |
        // name | extra field | comment
        let what = "Invalid central directory entry";
        let mut entry = check_fixed(fixed, Self::SIZE, CENTRAL_DIRECTORY_MAGIC, what)?;
        let source_version = read_u16(&mut entry);
        let minimum_extract_version = read_u16(&mut entry);
        let flags = read_u16(&mut entry);
        let compression_method = read_u16(&mut entry);
        let last_modified_time = read_u16(&mut entry);
        let last_modified_date = read_u16(&mut entry);
        let crc32 = read_u32(&mut entry);
        let compressed_size = read_u32(&mut entry);
        let uncompressed_size = read_u32(&mut entry);
        let path_length = read_u16(&mut entry) as usize;
        let extra_field_length = read_u16(&mut entry) as usize;
        let file_comment_length = read_u16(&mut entry) as usize;
        let disk_number = read_u16(&mut entry);
        let internal_file_attributes = read_u16(&mut entry);
        let external_file_attributes = read_u32(&mut entry);
        let header_offset = read_u32(&mut entry);
        let path = fetch(&mut additional, path_length, what)?;
        let extra_field = fetch(&mut additional, extra_field_length, what)?;
        let file_comment = fetch(&mut additional, file_comment_length, what)?;

        Ok(Self {
            source_version,
            minimum_extract_version,
            flags,
            compression_method,
            last_modified_time,
            last_modified_date,
            crc32,
            compressed_size,
            uncompressed_size,
            disk_number,
            internal_file_attributes,
            external_file_attributes,
            header_offset,
            path,
            extra_field,
            file_comment,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len_in_file() as usize);
        out.extend_from_slice(&CENTRAL_DIRECTORY_MAGIC);
        put_u16(&mut out, self.source_version);
        put_u16(&mut out, self.minimum_extract_version);
        put_u16(&mut out, self.flags);
        put_u16(&mut out, self.compression_method);
        put_u16(&mut out, self.last_modified_time);
        put_u16(&mut out, self.last_modified_date);
        put_u32(&mut out, self.crc32);
        put_u32(&mut out, self.compressed_size);
        put_u32(&mut out, self.uncompressed_size);
        put_u16(&mut out, self.path.len() as u16);
        put_u16(&mut out, self.extra_field.len() as u16);
        put_u16(&mut out, self.file_comment.len() as u16);
        put_u16(&mut out, self.disk_number);
        put_u16(&mut out, self.internal_file_attributes);
        put_u32(&mut out, self.external_file_attributes);
        put_u32(&mut out, self.header_offset);
        out.extend_from_slice(&self.path);
        out.extend_from_slice(&self.extra_field);
        out.extend_from_slice(&self.file_comment);
        out
    }
}

/// Data from a data descriptor (4.3.9)
///
/// Streamed writers that didn't know sizes or the checksum up front
/// put them after the file data instead, and set bit 3 of the flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataDescriptor {
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
}

impl Record for DataDescriptor {
    const SIZE: usize = 16;

    fn decode<F>(fixed: &[u8], _additional: F) -> ZipResult<Self>
    where
        F: FnMut(usize) -> ZipResult<Vec<u8>>,
    {
        let mut descriptor =
            check_fixed(fixed, Self::SIZE, DATA_DESCRIPTOR_MAGIC, "Invalid data descriptor")?;
        Ok(Self {
            crc32: read_u32(&mut descriptor),
            compressed_size: read_u32(&mut descriptor),
            uncompressed_size: read_u32(&mut descriptor),
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&DATA_DESCRIPTOR_MAGIC);
        put_u32(&mut out, self.crc32);
        put_u32(&mut out, self.compressed_size);
        put_u32(&mut out, self.uncompressed_size);
        out
    }
}

/// A data descriptor with 8-byte sizes, used by Zip64 entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Zip64DataDescriptor {
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
}

impl Record for Zip64DataDescriptor {
    const SIZE: usize = 24;

    fn decode<F>(fixed: &[u8], _additional: F) -> ZipResult<Self>
    where
        F: FnMut(usize) -> ZipResult<Vec<u8>>,
    {
        let mut descriptor = check_fixed(
            fixed,
            Self::SIZE,
            DATA_DESCRIPTOR_MAGIC,
            "Invalid Zip64 data descriptor",
        )?;
        Ok(Self {
            crc32: read_u32(&mut descriptor),
            compressed_size: read_u64(&mut descriptor),
            uncompressed_size: read_u64(&mut descriptor),
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&DATA_DESCRIPTOR_MAGIC);
        put_u32(&mut out, self.crc32);
        put_u64(&mut out, self.compressed_size);
        put_u64(&mut out, self.uncompressed_size);
        out
    }
}

/// Data from the End of central directory record (4.3.16)
///
/// Found at the back of the ZIP archive and provides offsets for finding
/// its central directory, along with lots of stuff that stopped being relevant
/// when we stopped breaking ZIP archives onto multiple floppies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub disk_with_central_directory: u16,
    pub entries_on_this_disk: u16,
    pub entries: u16,
    pub central_directory_size: u32,
    pub central_directory_offset: u32,
    pub file_comment: Vec<u8>,
}

impl EndOfCentralDirectory {
    /// The record for an archive with nothing in it
    pub fn empty() -> Self {
        Self {
            disk_number: 0,
            disk_with_central_directory: 0,
            entries_on_this_disk: 0,
            entries: 0,
            central_directory_size: 0,
            central_directory_offset: 0,
            file_comment: Vec::new(),
        }
    }
}

impl Record for EndOfCentralDirectory {
    const SIZE: usize = 22;

    fn decode<F>(fixed: &[u8], mut additional: F) -> ZipResult<Self>
    where
        F: FnMut(usize) -> ZipResult<Vec<u8>>,
    {
        // signature 4 | this disk 2 | disk with central directory 2 |
        // entries on this disk 2 | entries 2 | central directory size 4 |
        // central directory offset 4 | comment length 2 | comment
        let what = "Invalid End Of Central Directory Record";
        let mut eocdr = check_fixed(fixed, Self::SIZE, EOCDR_MAGIC, what)?;
        let disk_number = read_u16(&mut eocdr);
        let disk_with_central_directory = read_u16(&mut eocdr);
        let entries_on_this_disk = read_u16(&mut eocdr);
        let entries = read_u16(&mut eocdr);
        let central_directory_size = read_u32(&mut eocdr);
        let central_directory_offset = read_u32(&mut eocdr);
        let comment_length = read_u16(&mut eocdr) as usize;
        let file_comment = fetch(&mut additional, comment_length, what)?;

        Ok(Self {
            disk_number,
            disk_with_central_directory,
            entries_on_this_disk,
            entries,
            central_directory_size,
            central_directory_offset,
            file_comment,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE + self.file_comment.len());
        out.extend_from_slice(&EOCDR_MAGIC);
        put_u16(&mut out, self.disk_number);
        put_u16(&mut out, self.disk_with_central_directory);
        put_u16(&mut out, self.entries_on_this_disk);
        put_u16(&mut out, self.entries);
        put_u32(&mut out, self.central_directory_size);
        put_u32(&mut out, self.central_directory_offset);
        put_u16(&mut out, self.file_comment.len() as u16);
        out.extend_from_slice(&self.file_comment);
        out
    }
}

/// Data from the Zip64 end of central directory record (4.3.14)
///
/// Carries the 64-bit versions of the End of central directory fields
/// that overflowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zip64EndOfCentralDirectory {
    pub record_size: u64,
    pub source_version: u16,
    pub minimum_extract_version: u16,
    pub disk_number: u32,
    pub disk_with_central_directory: u32,
    pub entries_on_this_disk: u64,
    pub entries: u64,
    pub central_directory_size: u64,
    pub central_directory_offset: u64,
    pub extensible_data: Vec<u8>,
}

impl Zip64EndOfCentralDirectory {
    /// 4.3.14.1 The value stored into the "size of zip64 end of central
    /// directory record" SHOULD be the size of the remaining
    /// record and SHOULD NOT include the leading 12 bytes.
    const LEADING_BYTES: u64 = 12;

    pub fn new(entries: u64, central_directory_size: u64, central_directory_offset: u64) -> Self {
        Self {
            record_size: Self::SIZE as u64 - Self::LEADING_BYTES,
            source_version: UNIX_VERSION_MADE_BY,
            minimum_extract_version: ZIP64_VERSION,
            disk_number: 0,
            disk_with_central_directory: 0,
            entries_on_this_disk: entries,
            entries,
            central_directory_size,
            central_directory_offset,
            extensible_data: Vec::new(),
        }
    }
}

impl Record for Zip64EndOfCentralDirectory {
    const SIZE: usize = 56;

    fn decode<F>(fixed: &[u8], mut additional: F) -> ZipResult<Self>
    where
        F: FnMut(usize) -> ZipResult<Vec<u8>>,
    {
        // signature 4 | record size 8 | version made by 2 | version needed 2 |
        // this disk 4 | disk with central directory 4 | entries on this disk 8 |
        // entries 8 | central directory size 8 | central directory offset 8 |
        // extensible data
        let what = "Invalid Zip64 End Of Central Directory Record";
        let mut eocdr = check_fixed(fixed, Self::SIZE, ZIP64_EOCDR_MAGIC, what)?;
        let record_size = read_u64(&mut eocdr);
        let source_version = read_u16(&mut eocdr);
        let minimum_extract_version = read_u16(&mut eocdr);
        if minimum_extract_version < ZIP64_VERSION {
            return Err(ZipError::MalformedRecord(what));
        }
        let disk_number = read_u32(&mut eocdr);
        let disk_with_central_directory = read_u32(&mut eocdr);
        let entries_on_this_disk = read_u64(&mut eocdr);
        let entries = read_u64(&mut eocdr);
        let central_directory_size = read_u64(&mut eocdr);
        let central_directory_offset = read_u64(&mut eocdr);

        // Size = SizeOfFixedFields + SizeOfVariableData - 12.
        let extensible_data_length = record_size
            .checked_add(Self::LEADING_BYTES)
            .and_then(|total| total.checked_sub(Self::SIZE as u64))
            .ok_or(ZipError::MalformedRecord(what))?;
        let extensible_data_length = crate::arch::usize(extensible_data_length)?;
        let extensible_data = fetch(&mut additional, extensible_data_length, what)?;

        Ok(Self {
            record_size,
            source_version,
            minimum_extract_version,
            disk_number,
            disk_with_central_directory,
            entries_on_this_disk,
            entries,
            central_directory_size,
            central_directory_offset,
            extensible_data,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE + self.extensible_data.len());
        out.extend_from_slice(&ZIP64_EOCDR_MAGIC);
        put_u64(&mut out, self.record_size);
        put_u16(&mut out, self.source_version);
        put_u16(&mut out, self.minimum_extract_version);
        put_u32(&mut out, self.disk_number);
        put_u32(&mut out, self.disk_with_central_directory);
        put_u64(&mut out, self.entries_on_this_disk);
        put_u64(&mut out, self.entries);
        put_u64(&mut out, self.central_directory_size);
        put_u64(&mut out, self.central_directory_offset);
        out.extend_from_slice(&self.extensible_data);
        out
    }
}

/// Data from the Zip64 end of central directory locator (4.3.15)
///
/// This immediately precedes the End of central directory record
/// on Zip64 files and tells us where to find the Zip64 end of central directory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Zip64EndOfCentralDirectoryLocator {
    pub disk_with_central_directory: u32,
    pub zip64_eocdr_offset: u64,
    pub disks: u32,
}

impl Zip64EndOfCentralDirectoryLocator {
    pub fn new(zip64_eocdr_offset: u64) -> Self {
        Self {
            disk_with_central_directory: 0,
            zip64_eocdr_offset,
            disks: 1,
        }
    }
}

impl Record for Zip64EndOfCentralDirectoryLocator {
    const SIZE: usize = 20;

    fn decode<F>(fixed: &[u8], _additional: F) -> ZipResult<Self>
    where
        F: FnMut(usize) -> ZipResult<Vec<u8>>,
    {
        let mut locator = check_fixed(
            fixed,
            Self::SIZE,
            ZIP64_EOCDR_LOCATOR_MAGIC,
            "Invalid Zip64 End Of Central Directory Locator",
        )?;
        Ok(Self {
            disk_with_central_directory: read_u32(&mut locator),
            zip64_eocdr_offset: read_u64(&mut locator),
            disks: read_u32(&mut locator),
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&ZIP64_EOCDR_LOCATOR_MAGIC);
        put_u32(&mut out, self.disk_with_central_directory);
        put_u64(&mut out, self.zip64_eocdr_offset);
        put_u32(&mut out, self.disks);
        out
    }
}

/// The fields a Zip64 extended information extra field can carry,
/// in the order they appear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zip64Field {
    UncompressedSize,
    CompressedSize,
    HeaderOffset,
    DiskNumber,
}

impl Zip64Field {
    fn size(self) -> usize {
        match self {
            Zip64Field::UncompressedSize | Zip64Field::CompressedSize | Zip64Field::HeaderOffset => 8,
            Zip64Field::DiskNumber => 4,
        }
    }
}

/// Zip64 extended information extra field (4.5.3)
///
/// A sparse record: only the fields whose legacy counterparts overflowed
/// are present, always in the order of [`Zip64Field`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Zip64ExtendedInformation {
    pub uncompressed_size: Option<u64>,
    pub compressed_size: Option<u64>,
    pub header_offset: Option<u64>,
    pub disk_number: Option<u32>,
}

impl Zip64ExtendedInformation {
    const HEADER_SIZE: usize = 4;

    /// True if no field is present, i.e., it shouldn't be written at all.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn fields(&self) -> Vec<Zip64Field> {
        let mut fields = Vec::with_capacity(4);
        if self.uncompressed_size.is_some() {
            fields.push(Zip64Field::UncompressedSize);
        }
        if self.compressed_size.is_some() {
            fields.push(Zip64Field::CompressedSize);
        }
        if self.header_offset.is_some() {
            fields.push(Zip64Field::HeaderOffset);
        }
        if self.disk_number.is_some() {
            fields.push(Zip64Field::DiskNumber);
        }
        fields
    }

    /// Decodes one extra field block (header included),
    /// which must hold exactly the requested fields.
    pub fn decode(mut block: &[u8], fields: &[Zip64Field]) -> ZipResult<Self> {
        let what = "Invalid Zip64 extended information extra field";
        let expected: usize = fields.iter().map(|f| f.size()).sum();
        if block.len() != Self::HEADER_SIZE + expected {
            return Err(ZipError::MalformedRecord(what));
        }
        let header_id = read_u16(&mut block);
        let data_size = read_u16(&mut block) as usize;
        if header_id != ZIP64_EXTRA_FIELD_ID || data_size != expected {
            return Err(ZipError::MalformedRecord(what));
        }

        let mut info = Self::default();
        if fields.contains(&Zip64Field::UncompressedSize) {
            info.uncompressed_size = Some(read_u64(&mut block));
        }
        if fields.contains(&Zip64Field::CompressedSize) {
            info.compressed_size = Some(read_u64(&mut block));
        }
        if fields.contains(&Zip64Field::HeaderOffset) {
            info.header_offset = Some(read_u64(&mut block));
        }
        if fields.contains(&Zip64Field::DiskNumber) {
            info.disk_number = Some(read_u32(&mut block));
        }
        Ok(info)
    }

    pub fn encode(&self) -> Vec<u8> {
        let data_size: usize = self.fields().iter().map(|f| f.size()).sum();
        let mut out = Vec::with_capacity(Self::HEADER_SIZE + data_size);
        put_u16(&mut out, ZIP64_EXTRA_FIELD_ID);
        put_u16(&mut out, data_size as u16);
        if let Some(size) = self.uncompressed_size {
            put_u64(&mut out, size);
        }
        if let Some(size) = self.compressed_size {
            put_u64(&mut out, size);
        }
        if let Some(offset) = self.header_offset {
            put_u64(&mut out, offset);
        }
        if let Some(disk) = self.disk_number {
            put_u32(&mut out, disk);
        }
        out
    }

    /// Looks for the Zip64 block in an extra field and decodes the given fields from it.
    ///
    /// If no fields are wanted, there's nothing to look for.
    pub fn scan(extra_field: &[u8], fields: &[Zip64Field]) -> ZipResult<Option<Self>> {
        if fields.is_empty() {
            return Ok(None);
        }
        for (header_id, block) in ExtraFieldBlocks::new(extra_field) {
            if header_id? == ZIP64_EXTRA_FIELD_ID {
                return Self::decode(block, fields).map(Some);
            }
        }
        Ok(None)
    }
}

/// Returns the extra field with any Zip64 block removed,
/// keeping everything else as-is.
pub fn without_zip64_field(extra_field: &[u8]) -> ZipResult<Vec<u8>> {
    let mut kept = Vec::with_capacity(extra_field.len());
    for (header_id, block) in ExtraFieldBlocks::new(extra_field) {
        if header_id? != ZIP64_EXTRA_FIELD_ID {
            kept.extend_from_slice(block);
        }
    }
    Ok(kept)
}

/// True if the extra field has a Zip64 block, whatever fields it holds.
pub fn has_zip64_field(extra_field: &[u8]) -> ZipResult<bool> {
    for (header_id, _) in ExtraFieldBlocks::new(extra_field) {
        if header_id? == ZIP64_EXTRA_FIELD_ID {
            return Ok(true);
        }
    }
    Ok(false)
}

/// An extra field block of zeros, `len` bytes long (header included).
pub fn padding_field(len: usize) -> Vec<u8> {
    debug_assert!((4..=u16::MAX as usize).contains(&len));
    let mut out = Vec::with_capacity(len);
    put_u16(&mut out, PADDING_EXTRA_FIELD_ID);
    put_u16(&mut out, (len - 4) as u16);
    out.resize(len, 0);
    out
}

/// Walks the `header1+data1 + header2+data2 ...` blocks of an extra field (4.5.1),
/// yielding each block's ID and its bytes (header included).
struct ExtraFieldBlocks<'a> {
    remaining: &'a [u8],
}

impl<'a> ExtraFieldBlocks<'a> {
    fn new(extra_field: &'a [u8]) -> Self {
        Self {
            remaining: extra_field,
        }
    }
}

impl<'a> Iterator for ExtraFieldBlocks<'a> {
    type Item = (ZipResult<u16>, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        // Some writers pad the extra field; fewer than four bytes can't be a block.
        if self.remaining.len() < 4 {
            return None;
        }
        let mut header = self.remaining;
        let header_id = read_u16(&mut header);
        let data_size = read_u16(&mut header) as usize;
        let block_len = 4 + data_size;
        if block_len > self.remaining.len() {
            let rest = std::mem::take(&mut self.remaining);
            return Some((
                Err(ZipError::MalformedRecord("Extra field block overruns its field")),
                rest,
            ));
        }
        let (block, rest) = self.remaining.split_at(block_len);
        self.remaining = rest;
        Some((Ok(header_id), block))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn no_data(_: usize) -> ZipResult<Vec<u8>> {
        Ok(Vec::new())
    }

    /// Splits an encoded record into its fixed part and a supplier for the rest.
    fn roundtrip<R: Record>(record: &R) -> R {
        let bytes = record.encode();
        let (fixed, mut rest) = bytes.split_at(R::SIZE);
        R::decode(fixed, |len| {
            let (taken, remaining) = rest.split_at(len.min(rest.len()));
            rest = remaining;
            Ok(taken.to_vec())
        })
        .unwrap()
    }

    fn central_directory_entry() -> CentralDirectoryEntry {
        CentralDirectoryEntry {
            source_version: UNIX_VERSION_MADE_BY,
            minimum_extract_version: ZIP64_VERSION,
            flags: UTF8_FLAG,
            compression_method: 8,
            last_modified_time: 0x6000,
            last_modified_date: 0x5021,
            crc32: 0xdeadbeef,
            compressed_size: u32::MAX,
            uncompressed_size: u32::MAX - 1,
            disk_number: 0,
            internal_file_attributes: 0,
            external_file_attributes: 0o100644 << 16,
            header_offset: u32::MAX,
            path: b"dir/file.txt".to_vec(),
            extra_field: Zip64ExtendedInformation {
                compressed_size: Some(1 << 33),
                header_offset: Some(1 << 34),
                ..Default::default()
            }
            .encode(),
            file_comment: b"hi there".to_vec(),
        }
    }

    #[test]
    fn records_roundtrip() {
        let cde = central_directory_entry();
        assert_eq!(roundtrip(&cde), cde);
        assert_eq!(cde.encode().len() as u64, cde.len_in_file());

        let local = LocalFileHeader {
            minimum_extract_version: DEFAULT_VERSION,
            flags: UTF8_FLAG | DATA_DESCRIPTOR_FLAG,
            compression_method: 0,
            last_modified_time: 1,
            last_modified_date: 2,
            crc32: 3,
            compressed_size: u32::MAX - 1,
            uncompressed_size: u32::MAX - 1,
            path: b"a".to_vec(),
            extra_field: Vec::new(),
        };
        assert_eq!(roundtrip(&local), local);

        let eocdr = EndOfCentralDirectory {
            entries_on_this_disk: u16::MAX,
            entries: u16::MAX,
            central_directory_size: u32::MAX,
            central_directory_offset: u32::MAX - 1,
            file_comment: b"comment".to_vec(),
            ..EndOfCentralDirectory::empty()
        };
        assert_eq!(roundtrip(&eocdr), eocdr);

        let zip64_eocdr = Zip64EndOfCentralDirectory::new(1 << 16, 1 << 32, u64::MAX);
        assert_eq!(roundtrip(&zip64_eocdr), zip64_eocdr);

        let locator = Zip64EndOfCentralDirectoryLocator::new(0xffff_ffff);
        assert_eq!(roundtrip(&locator), locator);

        let descriptor = DataDescriptor {
            crc32: 1,
            compressed_size: u32::MAX,
            uncompressed_size: u32::MAX - 1,
        };
        assert_eq!(roundtrip(&descriptor), descriptor);
        let descriptor = Zip64DataDescriptor {
            crc32: 1,
            compressed_size: u32::MAX as u64,
            uncompressed_size: 1 << 40,
        };
        assert_eq!(roundtrip(&descriptor), descriptor);
    }

    #[test]
    fn empty_end_of_central_directory_layout() {
        let bytes = EndOfCentralDirectory::empty().encode();
        assert_eq!(bytes.len(), 22);
        assert_eq!(bytes[..4], EOCDR_MAGIC);
        assert!(bytes[4..].iter().all(|b| *b == 0));
    }

    #[test]
    fn bad_signature_or_length_is_rejected() {
        let mut bytes = EndOfCentralDirectory::empty().encode();
        assert!(EndOfCentralDirectory::decode(&bytes[..21], no_data).is_err());
        bytes[3] = 7;
        assert!(matches!(
            EndOfCentralDirectory::decode(&bytes, no_data),
            Err(ZipError::MalformedRecord(_))
        ));
    }

    #[test]
    fn short_trailing_data_is_rejected() {
        let cde = central_directory_entry();
        let bytes = cde.encode();
        let result = CentralDirectoryEntry::decode(&bytes[..CentralDirectoryEntry::SIZE], |_| {
            Ok(vec![0; 1])
        });
        assert!(matches!(result, Err(ZipError::MalformedRecord(_))));
    }

    #[test]
    fn zip64_eocdr_needs_version_45() {
        let mut record = Zip64EndOfCentralDirectory::new(1, 2, 3);
        record.minimum_extract_version = DEFAULT_VERSION;
        let bytes = record.encode();
        assert!(Zip64EndOfCentralDirectory::decode(&bytes, no_data).is_err());
    }

    #[test]
    fn zip64_eocdr_with_bogus_record_size() {
        let mut record = Zip64EndOfCentralDirectory::new(1, 2, 3);
        record.record_size = 10;
        let bytes = record.encode();
        assert!(Zip64EndOfCentralDirectory::decode(&bytes, no_data).is_err());
    }

    #[test]
    fn zip64_extra_field_must_match_requested_fields() {
        let info = Zip64ExtendedInformation {
            uncompressed_size: Some(5000),
            compressed_size: Some(5000),
            ..Default::default()
        };
        let block = info.encode();
        assert_eq!(block.len(), 20);
        let both = [Zip64Field::UncompressedSize, Zip64Field::CompressedSize];
        assert_eq!(Zip64ExtendedInformation::decode(&block, &both).unwrap(), info);

        // Asking for fewer (or more) fields than were written is a decode failure.
        assert!(Zip64ExtendedInformation::decode(&block, &both[..1]).is_err());
        let three = [
            Zip64Field::UncompressedSize,
            Zip64Field::CompressedSize,
            Zip64Field::HeaderOffset,
        ];
        assert!(Zip64ExtendedInformation::decode(&block, &three).is_err());
    }

    #[test]
    fn zip64_field_found_among_others() {
        let mut extra = vec![0x55, 0x54, 5, 0, 1, 2, 3, 4, 5]; // extended timestamp
        let info = Zip64ExtendedInformation {
            header_offset: Some(1 << 35),
            ..Default::default()
        };
        extra.extend_from_slice(&info.encode());

        let found = Zip64ExtendedInformation::scan(&extra, &[Zip64Field::HeaderOffset]).unwrap();
        assert_eq!(found, Some(info));
        assert_eq!(without_zip64_field(&extra).unwrap(), &extra[..9]);
        // Nothing overflowed, nothing to find.
        assert_eq!(Zip64ExtendedInformation::scan(&extra, &[]).unwrap(), None);
    }

    #[test]
    fn overrunning_extra_field_block() {
        let extra = [1, 0, 200, 0, 1, 2];
        assert!(Zip64ExtendedInformation::scan(&extra, &[Zip64Field::CompressedSize]).is_err());
        assert!(without_zip64_field(&extra).is_err());
    }

    #[test]
    fn sentinel_fields_are_requested() {
        let cde = central_directory_entry();
        assert_eq!(
            cde.zip64_fields(),
            [Zip64Field::CompressedSize, Zip64Field::HeaderOffset]
        );
        let info = cde.zip64_info().unwrap().unwrap();
        assert_eq!(info.compressed_size, Some(1 << 33));
        assert_eq!(info.header_offset, Some(1 << 34));
        assert_eq!(info.uncompressed_size, None);
    }

    #[test]
    fn padding_is_not_zip64() {
        let padding = padding_field(20);
        assert_eq!(padding.len(), 20);
        assert_eq!(&padding[..4], &[0x35, 0xD9, 16, 0]);
        assert!(!has_zip64_field(&padding).unwrap());
        assert_eq!(without_zip64_field(&padding).unwrap(), padding);

        let zip64 = Zip64ExtendedInformation {
            uncompressed_size: Some(0),
            ..Default::default()
        };
        assert!(has_zip64_field(&zip64.encode()).unwrap());
    }
}
