//! Chunked movement of entry data between a provider and a consumer
//!
//! Data is pulled from a provider `(position, max_len) -> bytes`
//! and pushed to a consumer `(bytes) -> ()`, one chunk at a time.
//! Along the way we keep a running CRC-32 of the uncompressed bytes,
//! optionally deflate or inflate, and check for cancellation between chunks.

use std::io::{self, prelude::*};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crc32fast::Hasher;
use flate2::write::{DeflateDecoder, DeflateEncoder};
use flate2::Compression;

use crate::result::*;

pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// A flag another thread can raise to stop a transfer between chunks.
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Knobs for a single transfer
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Most bytes asked of the provider at once
    pub chunk_size: usize,
    /// Don't bother computing the CRC-32 (it's reported as 0).
    pub skip_crc32: bool,
    pub cancel: Option<CancelToken>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            skip_crc32: false,
            cancel: None,
        }
    }
}

impl TransferOptions {
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn skip_crc32(mut self, skip: bool) -> Self {
        self.skip_crc32 = skip;
        self
    }

    pub fn cancel_with(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn check_cancelled(&self) -> ZipResult<()> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => Err(ZipError::CancelledOperation),
            _ => Ok(()),
        }
    }
}

/// What a transfer moved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transferred {
    /// Bytes pulled from the provider
    pub read: u64,
    /// Bytes pushed to the consumer
    pub written: u64,
    /// CRC-32 of the uncompressed side, or 0 if skipped
    pub crc32: u32,
}

struct Checksum(Option<Hasher>);

impl Checksum {
    fn new(skip: bool) -> Self {
        Self(if skip { None } else { Some(Hasher::new()) })
    }

    fn update(&mut self, bytes: &[u8]) {
        if let Some(h) = &mut self.0 {
            h.update(bytes);
        }
    }

    fn finalize(self) -> u32 {
        self.0.map(Hasher::finalize).unwrap_or(0)
    }
}

/// A provider handing out pieces of a byte slice
pub fn slice_provider(data: &[u8]) -> impl FnMut(u64, usize) -> ZipResult<Vec<u8>> + '_ {
    move |position, len| {
        let start = usize::try_from(position)
            .unwrap_or(usize::MAX)
            .min(data.len());
        let end = start.saturating_add(len).min(data.len());
        Ok(data[start..end].to_vec())
    }
}

/// Pulls exactly `size` bytes from the provider, chunk by chunk,
/// handing each chunk to `sink`.
fn pump<P, S>(size: u64, options: &TransferOptions, mut provider: P, mut sink: S) -> ZipResult<()>
where
    P: FnMut(u64, usize) -> ZipResult<Vec<u8>>,
    S: FnMut(&[u8]) -> ZipResult<()>,
{
    let chunk_size = options.chunk_size.max(1) as u64;
    let mut position = 0u64;
    while position < size {
        options.check_cancelled()?;
        let wanted = chunk_size.min(size - position) as usize;
        let chunk = provider(position, wanted)?;
        if chunk.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("Provider ran dry after {position} of {size} bytes"),
            )
            .into());
        }
        let chunk = &chunk[..chunk.len().min(wanted)];
        sink(chunk)?;
        position += chunk.len() as u64;
    }
    Ok(())
}

/// Copies `size` bytes as-is.
pub fn copy_stored<P, C>(
    size: u64,
    options: &TransferOptions,
    provider: P,
    mut consumer: C,
) -> ZipResult<Transferred>
where
    P: FnMut(u64, usize) -> ZipResult<Vec<u8>>,
    C: FnMut(&[u8]) -> ZipResult<()>,
{
    let mut checksum = Checksum::new(options.skip_crc32);
    let mut moved = 0u64;
    pump(size, options, provider, |chunk| {
        checksum.update(chunk);
        moved += chunk.len() as u64;
        consumer(chunk)
    })?;
    Ok(Transferred {
        read: moved,
        written: moved,
        crc32: checksum.finalize(),
    })
}

/// Deflates `size` bytes from the provider, checksumming them before compression.
pub fn compress<P, C>(
    size: u64,
    options: &TransferOptions,
    provider: P,
    mut consumer: C,
) -> ZipResult<Transferred>
where
    P: FnMut(u64, usize) -> ZipResult<Vec<u8>>,
    C: FnMut(&[u8]) -> ZipResult<()>,
{
    let mut checksum = Checksum::new(options.skip_crc32);
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    let mut read = 0u64;
    let mut written = 0u64;
    pump(size, options, provider, |chunk| {
        checksum.update(chunk);
        read += chunk.len() as u64;
        encoder.write_all(chunk)?;
        let compressed = mem::take(encoder.get_mut());
        if !compressed.is_empty() {
            written += compressed.len() as u64;
            consumer(&compressed)?;
        }
        Ok(())
    })?;
    let tail = encoder.finish()?;
    if !tail.is_empty() {
        written += tail.len() as u64;
        consumer(&tail)?;
    }
    Ok(Transferred {
        read,
        written,
        crc32: checksum.finalize(),
    })
}

fn corrupted(e: io::Error) -> ZipError {
    ZipError::CorruptedData(e.to_string())
}

/// Inflates `compressed_size` bytes from the provider,
/// checksumming what comes out.
pub fn decompress<P, C>(
    compressed_size: u64,
    options: &TransferOptions,
    provider: P,
    mut consumer: C,
) -> ZipResult<Transferred>
where
    P: FnMut(u64, usize) -> ZipResult<Vec<u8>>,
    C: FnMut(&[u8]) -> ZipResult<()>,
{
    let mut checksum = Checksum::new(options.skip_crc32);
    let mut decoder = DeflateDecoder::new(Vec::new());
    let mut read = 0u64;
    let mut written = 0u64;
    pump(compressed_size, options, provider, |chunk| {
        read += chunk.len() as u64;
        decoder.write_all(chunk).map_err(corrupted)?;
        let inflated = mem::take(decoder.get_mut());
        if !inflated.is_empty() {
            checksum.update(&inflated);
            written += inflated.len() as u64;
            consumer(&inflated)?;
        }
        Ok(())
    })?;
    let tail = decoder.finish().map_err(corrupted)?;
    if !tail.is_empty() {
        checksum.update(&tail);
        written += tail.len() as u64;
        consumer(&tail)?;
    }
    Ok(Transferred {
        read,
        written,
        crc32: checksum.finalize(),
    })
}
