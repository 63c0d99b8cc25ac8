//! Splits an intercepted buffer into fixed-size chunks and exports the ones
//! the content filter accepts.

use crate::filter::ContentFilter;
use crate::{Direction, MAX_CHUNK_SIZE, MAX_CHUNKS, SslEvent, SslEventMeta, TlsSource};

/// Copies bytes out of the traced process.
pub trait SourceReader {
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<(), i64>;
}

/// Destination of finished chunks.
pub trait EventSink {
    fn export(&self, event: &SslEvent) -> Result<(), i64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamLimits {
    max_chunks: usize,
    chunk_capacity: usize,
}

impl StreamLimits {
    pub const DEFAULT: StreamLimits = StreamLimits {
        max_chunks: MAX_CHUNKS,
        chunk_capacity: MAX_CHUNK_SIZE,
    };

    /// `chunk_capacity` is clamped to `1..=MAX_CHUNK_SIZE`.
    pub const fn new(max_chunks: usize, chunk_capacity: usize) -> Self {
        let chunk_capacity = if chunk_capacity == 0 {
            1
        } else if chunk_capacity > MAX_CHUNK_SIZE {
            MAX_CHUNK_SIZE
        } else {
            chunk_capacity
        };
        StreamLimits { max_chunks, chunk_capacity }
    }

    pub const fn max_chunks(&self) -> usize {
        self.max_chunks
    }

    pub const fn chunk_capacity(&self) -> usize {
        self.chunk_capacity
    }

    /// Most bytes of one buffer that can ever be exported.
    pub const fn max_bytes(&self) -> u64 {
        (self.max_chunks * self.chunk_capacity) as u64
    }
}

impl Default for StreamLimits {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Per-call fields copied into every chunk header.
#[derive(Debug, Clone, Copy)]
pub struct ChunkMeta {
    pub pid: u32,
    pub tid: u32,
    pub timestamp_ns: u64,
    pub direction: Direction,
    pub source: TlsSource,
}

/// What happened to each chunk of one buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitReport {
    pub exported: u32,
    pub filtered: u32,
    pub read_failures: u32,
    pub export_failures: u32,
    /// The buffer was longer than the limits allow; the tail was dropped.
    pub truncated: bool,
}

impl EmitReport {
    pub fn attempted(&self) -> u32 {
        self.exported + self.filtered + self.read_failures + self.export_failures
    }
}

/// Emits `len` bytes at `ptr` as up to `limits.max_chunks()` chunks.
///
/// Chunk `i` covers `[i * cap, min((i + 1) * cap, len))`. A failed read skips
/// only that chunk. Nothing is emitted for an empty or null buffer.
#[allow(clippy::too_many_arguments)]
#[inline(always)]
pub fn emit_stream<R, S, F>(
    reader: &R,
    sink: &S,
    filter: &mut F,
    scratch: &mut SslEvent,
    limits: StreamLimits,
    ptr: u64,
    len: u64,
    meta: ChunkMeta,
) -> EmitReport
where
    R: SourceReader + ?Sized,
    S: EventSink + ?Sized,
    F: ContentFilter + ?Sized,
{
    let mut report = EmitReport::default();
    if len == 0 || ptr == 0 {
        return report;
    }

    let capacity = limits.chunk_capacity() as u64;
    let total_size = if len > u32::MAX as u64 { u32::MAX } else { len as u32 };
    let mut bytes_sent: u64 = 0;

    for _ in 0..limits.max_chunks() {
        let remaining = len - bytes_sent;
        let size_to_read = remaining.min(capacity) as usize;
        if size_to_read > MAX_CHUNK_SIZE {
            break;
        }

        scratch.meta = SslEventMeta {
            pid: meta.pid,
            tid: meta.tid,
            timestamp_ns: meta.timestamp_ns,
            position: bytes_sent,
            chunk_size: size_to_read as u32,
            total_size,
            direction: meta.direction as u8,
            source: meta.source as u8,
            _pad: [0; 6],
        };

        match reader.read(ptr + bytes_sent, &mut scratch.data[..size_to_read]) {
            Ok(()) => {
                if filter.should_forward(&scratch.data[..size_to_read]) {
                    match sink.export(scratch) {
                        Ok(()) => report.exported += 1,
                        Err(_) => report.export_failures += 1,
                    }
                } else {
                    report.filtered += 1;
                }
            }
            Err(_) => report.read_failures += 1,
        }

        bytes_sent += size_to_read as u64;
        if bytes_sent >= len {
            return report;
        }
    }

    report.truncated = bytes_sent < len;
    report
}
