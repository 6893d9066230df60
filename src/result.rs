//! Error types and the related `Result<T>`

use thiserror::Error;

pub type ZipResult<T> = Result<T, ZipError>;

#[derive(Debug, Error)]
pub enum ZipError {
    /// An error from the underlying backing store
    #[error("I/O Error")]
    Io(#[from] std::io::Error),

    /// The archive couldn't be opened for reading,
    /// or it uses a feature we can't read (like spanning multiple disks).
    #[error("Unreadable Zip archive: {0}")]
    UnreadableArchive(String),

    /// The archive was opened read-only, or its backing store can't be written.
    #[error("Unwritable Zip archive: {0}")]
    UnwritableArchive(String),

    /// No End of central directory record was found near the end of the archive.
    #[error("Couldn't find End Of Central Directory Record")]
    MissingDirectoryRecord,

    /// A record's signature, length, or fields didn't make sense.
    #[error("Malformed Zip record: {0}")]
    MalformedRecord(&'static str),

    /// A path couldn't be decoded or stored,
    /// or a symbolic link's target isn't valid text.
    #[error("Invalid entry path: {0}")]
    InvalidEntryPath(String),

    /// The entry uses a compression method other than store or deflate.
    #[error("Unsupported compression method {0}")]
    InvalidCompressionMethod(u16),

    /// The entry count doesn't fit, even in a Zip64 record.
    #[error("Too many entries for a Zip archive")]
    InvalidNumberOfEntries,

    /// The central directory size doesn't fit, even in a Zip64 record.
    #[error("Central directory too large for a Zip archive")]
    InvalidCentralDirectorySize,

    /// An offset into the archive doesn't fit, even in a Zip64 record.
    #[error("Offset too large for a Zip archive")]
    InvalidOffset,

    /// The caller cancelled the operation between chunks.
    #[error("Operation cancelled")]
    CancelledOperation,

    /// Compressed data failed to inflate.
    #[error("Corrupted entry data: {0}")]
    CorruptedData(String),

    /// The entry to remove isn't in the archive (anymore).
    #[error("No entry in the archive with the path {0}")]
    NoSuchFile(String),

    /// A 64-bit size couldn't be buffered in this address space,
    /// probably on a 32-bit system.
    #[error("Zip structure too large for address space")]
    InsufficientAddressSpace,
}
