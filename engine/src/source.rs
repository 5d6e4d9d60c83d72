//! Remote sources and how they are resolved.
//!
//! A `SourceResolver` turns a locator into a `MediaSource`; the engine then
//! asks the source to open a byte stream, possibly at an offset. Sources that
//! cannot honor an offset report the offset they actually start at, and the
//! engine falls back to a full refetch.

use std::io::{self, Read};
use std::time::Duration;

use crate::error::EngineError;
use crate::model::SourceInfo;

/// A byte stream opened by a source, and where in the resource it starts.
pub struct OpenedStream {
    pub reader: Box<dyn Read + Send>,
    pub offset: u64,
}

impl std::fmt::Debug for OpenedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedStream")
            .field("offset", &self.offset)
            .finish_non_exhaustive()
    }
}

/// A resolved remote resource.
pub trait MediaSource: Send {
    fn info(&self) -> &SourceInfo;

    /// Open the content stream, starting at `offset` if supported.
    ///
    /// The returned `OpenedStream::offset` is the offset the stream really
    /// starts at; implementations without range support return 0.
    fn open(&mut self, offset: u64) -> Result<OpenedStream, EngineError>;
}

/// Turns locators into sources. Shared by every transfer of an engine.
pub trait SourceResolver: Send + Sync {
    fn resolve(&self, locator: &str) -> Result<Box<dyn MediaSource>, EngineError>;
}

impl<F> SourceResolver for F
where
    F: Fn(&str) -> Result<Box<dyn MediaSource>, EngineError> + Send + Sync,
{
    fn resolve(&self, locator: &str) -> Result<Box<dyn MediaSource>, EngineError> {
        self(locator)
    }
}

/// A source backed by bytes in memory.
///
/// Each `read` yields at most `chunk_size` bytes, which makes chunk
/// boundaries predictable.
#[derive(Debug, Clone)]
pub struct MemorySource {
    info: SourceInfo,
    data: Vec<u8>,
    chunk_size: usize,
}

impl MemorySource {
    pub fn new(locator: &str, filename: &str, data: Vec<u8>) -> Self {
        let info = SourceInfo::new(locator, data.len() as u64, filename);
        MemorySource {
            info,
            data,
            chunk_size: usize::MAX,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.info.duration = Some(duration);
        self
    }

    pub fn with_resume_support(mut self, supported: bool) -> Self {
        self.info.supports_resume = supported;
        self
    }
}

impl MediaSource for MemorySource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn open(&mut self, offset: u64) -> Result<OpenedStream, EngineError> {
        let start = if self.info.supports_resume {
            offset.min(self.data.len() as u64)
        } else {
            0
        };
        Ok(OpenedStream {
            reader: Box::new(ChunkedReader {
                data: self.data.clone(),
                position: start as usize,
                chunk_size: self.chunk_size,
            }),
            offset: start,
        })
    }
}

struct ChunkedReader {
    data: Vec<u8>,
    position: usize,
    chunk_size: usize,
}

impl Read for ChunkedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.data[self.position..];
        let n = remaining.len().min(buf.len()).min(self.chunk_size);
        buf[..n].copy_from_slice(&remaining[..n]);
        self.position += n;
        Ok(n)
    }
}
