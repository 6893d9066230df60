//! zipmend reads, creates, and updates Zip archives in place,
//! whether they live in a file or in a buffer:
//!
//! ```no_run
//! # use zipmend::*;
//! let mut archive = Archive::open("foo.zip", AccessMode::Update)?;
//!
//! // Entries come straight from the central directory.
//! for entry in archive.entries() {
//!     println!("{} ({} bytes)", entry.path(), entry.uncompressed_size());
//! }
//!
//! // Data goes in through a provider, which hands out chunks by position...
//! let greeting = b"Hello, world!";
//! archive.add_entry(
//!     "greeting.txt",
//!     EntryType::File,
//!     greeting.len() as u64,
//!     &FileOptions::default().compression_method(CompressionMethod::Deflate),
//!     slice_provider(greeting),
//! )?;
//!
//! // ...and comes out through a consumer, one chunk at a time.
//! let entry = archive.entry("greeting.txt").expect("we just added it");
//! let mut contents = Vec::new();
//! let crc = archive.extract(&entry, &TransferOptions::default(), |chunk| {
//!     contents.extend_from_slice(chunk);
//!     Ok(())
//! })?;
//! assert_eq!(crc, entry.checksum());
//!
//! archive.remove(&entry, &TransferOptions::default())?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Zip keeps its table of contents, the central directory, at the very end of
//! the archive. That makes appending cheap: a new entry is written where the
//! central directory was, and the directory (plus one more record) goes after it.
//! If an add fails or is cancelled partway through, the archive is rolled back
//! to exactly the bytes it had before. Removing an entry means rewriting
//! everything after it, so that's done in a scratch copy that replaces the
//! archive once it's complete.
//!
//! Archives (and entries) past the 4 GB and 65,535-entry limits of the original
//! format use Zip64 records, which are read and written as needed.
//! [`FormatLimits`] can lower those thresholds to exercise Zip64 on small data.
//!
//! Only stored and deflated entries are supported, on a single disk, unencrypted.

pub mod entry;
pub mod read;
pub mod result;
pub mod store;
pub mod transfer;
pub mod write;

pub use entry::{CompressionMethod, Entry, EntryType, PathEncoding};
pub use read::{AccessMode, Archive, ArchiveOptions, Entries, FormatLimits};
pub use result::{ZipError, ZipResult};
pub use store::{ByteStore, FileStore, MemoryStore};
pub use transfer::{slice_provider, CancelToken, TransferOptions, Transferred};
pub use write::FileOptions;

mod arch;
mod crc_reader;
mod msdos;
mod spec;
