//! Userspace side of the capture stream: reassembles chunks into per-call
//! fragments and prints them.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use log::info;
use serde_json::json;
use tlstap_common::{Direction, TlsSource, decode_record};

use super::http;
use crate::settings::OutputFormat;

const PREVIEW_BYTES: usize = 96;

/// One chunk as received from the ring buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedChunk {
    pub pid: u32,
    pub tid: u32,
    pub timestamp_ns: u64,
    pub direction: Direction,
    pub source: TlsSource,
    pub position: u64,
    pub total_size: u64,
    pub data: Vec<u8>,
}

impl CapturedChunk {
    /// Decodes one ring buffer record; `None` if it is too short.
    pub fn from_record(record: &[u8]) -> Option<Self> {
        let (meta, payload) = decode_record(record)?;
        Some(Self {
            pid: meta.pid,
            tid: meta.tid,
            timestamp_ns: meta.timestamp_ns,
            direction: Direction::from_raw(meta.direction),
            source: TlsSource::from_raw(meta.source),
            position: meta.position,
            total_size: meta.total_size as u64,
            data: payload.to_vec(),
        })
    }
}

/// Bytes of one intercepted call, as far as they could be reassembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub pid: u32,
    pub tid: u32,
    pub timestamp_ns: u64,
    pub direction: Direction,
    pub source: TlsSource,
    /// Offset of `data[0]` inside the intercepted buffer.
    pub start: u64,
    pub total_size: u64,
    pub data: Vec<u8>,
    /// The tail was cut by the per-call chunk limit.
    pub truncated: bool,
}

impl Fragment {
    /// Whether `data` is the whole intercepted buffer.
    pub fn is_complete(&self) -> bool {
        self.start == 0 && self.data.len() as u64 == self.total_size
    }
}

type StreamKey = (u32, u32, Direction);

struct Partial {
    fragment: Fragment,
    last_seen: Instant,
}

impl Partial {
    fn start(chunk: &CapturedChunk, now: Instant) -> Self {
        Self {
            fragment: Fragment {
                pid: chunk.pid,
                tid: chunk.tid,
                timestamp_ns: chunk.timestamp_ns,
                direction: chunk.direction,
                source: chunk.source,
                start: chunk.position,
                total_size: chunk.total_size,
                data: Vec::with_capacity(chunk.total_size.min(64 * 1024) as usize),
                truncated: false,
            },
            last_seen: now,
        }
    }

    fn next_position(&self) -> u64 {
        self.fragment.start + self.fragment.data.len() as u64
    }

    fn continues_with(&self, chunk: &CapturedChunk) -> bool {
        chunk.position != 0
            && chunk.position == self.next_position()
            && chunk.total_size == self.fragment.total_size
            && chunk.timestamp_ns == self.fragment.timestamp_ns
    }
}

/// Joins consecutive chunks of the same call. Chunks of one call share a
/// timestamp and arrive in order; a gap (filtered or failed chunk) ends the
/// current fragment and starts a new one.
pub struct FragmentAssembler {
    partials: HashMap<StreamKey, Partial>,
    max_bytes: u64,
}

impl FragmentAssembler {
    /// `max_bytes` is the most the kernel side ever emits for one call.
    pub fn new(max_bytes: u64) -> Self {
        Self {
            partials: HashMap::new(),
            max_bytes,
        }
    }

    pub fn push(&mut self, chunk: CapturedChunk) -> Vec<Fragment> {
        self.push_at(chunk, Instant::now())
    }

    fn push_at(&mut self, chunk: CapturedChunk, now: Instant) -> Vec<Fragment> {
        let mut out = Vec::new();
        let key = (chunk.pid, chunk.tid, chunk.direction);

        let mut partial = match self.partials.remove(&key) {
            Some(p) if p.continues_with(&chunk) => p,
            Some(p) => {
                out.push(p.fragment);
                Partial::start(&chunk, now)
            }
            None => Partial::start(&chunk, now),
        };
        partial.fragment.data.extend_from_slice(&chunk.data);
        partial.last_seen = now;

        let end = partial.next_position();
        if end >= partial.fragment.total_size {
            out.push(partial.fragment);
        } else if end >= self.max_bytes {
            partial.fragment.truncated = true;
            out.push(partial.fragment);
        } else {
            self.partials.insert(key, partial);
        }
        out
    }

    /// Emits fragments that have not grown for `max_age`.
    pub fn flush_stale(&mut self, max_age: Duration) -> Vec<Fragment> {
        self.flush_stale_at(Instant::now(), max_age)
    }

    fn flush_stale_at(&mut self, now: Instant, max_age: Duration) -> Vec<Fragment> {
        let stale: Vec<StreamKey> = self
            .partials
            .iter()
            .filter(|(_, p)| now.duration_since(p.last_seen) >= max_age)
            .map(|(k, _)| *k)
            .collect();
        stale
            .into_iter()
            .filter_map(|k| self.partials.remove(&k))
            .map(|p| p.fragment)
            .collect()
    }

    pub fn pending(&self) -> usize {
        self.partials.len()
    }
}

pub struct FragmentPrinter {
    format: OutputFormat,
}

impl FragmentPrinter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn render(&self, fragment: &Fragment) -> String {
        let summary = if fragment.start == 0 {
            http::summarize(&fragment.data)
        } else {
            None
        };

        match self.format {
            OutputFormat::Log => {
                let mut line = format!(
                    "{} {} pid={} tid={} bytes={}..{}/{}",
                    fragment.source.as_str(),
                    fragment.direction.as_str(),
                    fragment.pid,
                    fragment.tid,
                    fragment.start,
                    fragment.start + fragment.data.len() as u64,
                    fragment.total_size,
                );
                if fragment.truncated {
                    line.push_str(" truncated");
                }
                match summary {
                    Some(summary) => line.push_str(&format!(" {}", summary)),
                    None => line.push_str(&format!(" {}", preview(&fragment.data))),
                }
                line
            }
            OutputFormat::Json => json!({
                "timestamp_ns": fragment.timestamp_ns,
                "pid": fragment.pid,
                "tid": fragment.tid,
                "source": fragment.source.as_str(),
                "direction": fragment.direction.as_str(),
                "offset": fragment.start,
                "total_size": fragment.total_size,
                "complete": fragment.is_complete(),
                "truncated": fragment.truncated,
                "http": summary,
                "payload": String::from_utf8_lossy(&fragment.data),
            })
            .to_string(),
        }
    }

    pub fn print(&self, fragment: &Fragment) {
        let rendered = self.render(fragment);
        match self.format {
            OutputFormat::Log => info!("{}", rendered),
            OutputFormat::Json => println!("{}", rendered),
        }
    }
}

/// Printable prefix of `data` with control bytes escaped.
fn preview(data: &[u8]) -> String {
    let shown = &data[..data.len().min(PREVIEW_BYTES)];
    let mut out: String = shown.escape_ascii().to_string();
    if data.len() > PREVIEW_BYTES {
        out.push_str("...");
    }
    format!("\"{}\"", out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tlstap_common::SslEvent;

    fn chunk(position: u64, total: u64, data: &[u8]) -> CapturedChunk {
        CapturedChunk {
            pid: 100,
            tid: 101,
            timestamp_ns: 5,
            direction: Direction::Egress,
            source: TlsSource::OpenSsl,
            position,
            total_size: total,
            data: data.to_vec(),
        }
    }

    #[test]
    fn test_chunk_from_record() {
        let mut event = SslEvent::zeroed();
        event.meta.pid = 7;
        event.meta.tid = 8;
        event.meta.direction = Direction::Ingress as u8;
        event.meta.source = TlsSource::GoTls as u8;
        event.meta.position = 4096;
        event.meta.total_size = 5000;
        event.meta.chunk_size = 3;
        event.data[..3].copy_from_slice(b"abc");

        let chunk = CapturedChunk::from_record(event.wire_bytes()).unwrap();
        assert_eq!(chunk.direction, Direction::Ingress);
        assert_eq!(chunk.source, TlsSource::GoTls);
        assert_eq!(chunk.position, 4096);
        assert_eq!(chunk.data, b"abc");
        assert!(CapturedChunk::from_record(&[0u8; 8]).is_none());
    }

    #[test]
    fn test_single_chunk_is_complete() {
        let mut asm = FragmentAssembler::new(16);
        let out = asm.push(chunk(0, 5, b"hello"));
        assert_eq!(out.len(), 1);
        assert!(out[0].is_complete());
        assert!(!out[0].truncated);
        assert_eq!(asm.pending(), 0);
    }

    #[test]
    fn test_chunks_are_joined_in_order() {
        let mut asm = FragmentAssembler::new(64);
        assert!(asm.push(chunk(0, 10, b"01234")).is_empty());
        assert_eq!(asm.pending(), 1);
        let out = asm.push(chunk(5, 10, b"56789"));
        assert_eq!(out[0].data, b"0123456789");
        assert!(out[0].is_complete());
    }

    #[test]
    fn test_truncated_call_is_flushed_at_limit() {
        let mut asm = FragmentAssembler::new(8);
        assert!(asm.push(chunk(0, 100, b"abcd")).is_empty());
        let out = asm.push(chunk(4, 100, b"efgh"));
        assert_eq!(out.len(), 1);
        assert!(out[0].truncated);
        assert!(!out[0].is_complete());
        assert_eq!(asm.pending(), 0);
    }

    #[test]
    fn test_gap_splits_fragments() {
        let mut asm = FragmentAssembler::new(64);
        asm.push(chunk(0, 12, b"aaaa"));
        // chunk at 4 was dropped
        let out = asm.push(chunk(8, 12, b"cccc"));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].data, b"aaaa");
        assert!(!out[0].is_complete());
        assert_eq!(out[1].start, 8);
        assert_eq!(out[1].data, b"cccc");
    }

    #[test]
    fn test_new_call_flushes_previous_partial() {
        let mut asm = FragmentAssembler::new(64);
        asm.push(chunk(0, 10, b"01234"));
        let mut next = chunk(0, 3, b"xyz");
        next.timestamp_ns = 6;
        let out = asm.push(next);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].data, b"01234");
        assert!(out[1].is_complete());
    }

    #[test]
    fn test_directions_are_separate_streams() {
        let mut asm = FragmentAssembler::new(64);
        asm.push(chunk(0, 10, b"01234"));
        let mut ingress = chunk(0, 10, b"abcde");
        ingress.direction = Direction::Ingress;
        assert!(asm.push(ingress).is_empty());
        assert_eq!(asm.pending(), 2);
    }

    #[test]
    fn test_stale_partials_are_flushed() {
        let mut asm = FragmentAssembler::new(64);
        let t0 = Instant::now();
        asm.push_at(chunk(0, 10, b"01234"), t0);

        assert!(asm.flush_stale_at(t0 + Duration::from_secs(1), Duration::from_secs(5)).is_empty());
        let out = asm.flush_stale_at(t0 + Duration::from_secs(6), Duration::from_secs(5));
        assert_eq!(out.len(), 1);
        assert_eq!(asm.pending(), 0);
    }

    #[test]
    fn test_render_log_with_http_summary() {
        let mut asm = FragmentAssembler::new(4096);
        let data = b"GET /bucket HTTP/1.1\r\nHost: s3.amazonaws.com\r\n\r\n";
        let fragment = asm.push(chunk(0, data.len() as u64, data)).remove(0);

        let line = FragmentPrinter::new(OutputFormat::Log).render(&fragment);
        assert_eq!(
            line,
            format!(
                "openssl egress pid=100 tid=101 bytes=0..{0}/{0} GET /bucket host=s3.amazonaws.com",
                data.len()
            )
        );
    }

    #[test]
    fn test_render_log_preview_escapes_binary() {
        let fragment = FragmentAssembler::new(64).push(chunk(0, 3, b"a\x00\n")).remove(0);
        let line = FragmentPrinter::new(OutputFormat::Log).render(&fragment);
        assert!(line.ends_with("\"a\\x00\\n\""), "{}", line);
    }

    #[test]
    fn test_render_json() {
        let data = b"HTTP/1.1 200 OK\r\n\r\n";
        let mut c = chunk(0, data.len() as u64, data);
        c.direction = Direction::Ingress;
        c.source = TlsSource::GoTls;
        let fragment = FragmentAssembler::new(64).push(c).remove(0);

        let rendered = FragmentPrinter::new(OutputFormat::Json).render(&fragment);
        let value: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(value["source"], "gotls");
        assert_eq!(value["direction"], "ingress");
        assert_eq!(value["complete"], true);
        assert_eq!(value["http"]["kind"], "response");
        assert_eq!(value["http"]["status"], 200);
        assert_eq!(value["payload"], "HTTP/1.1 200 OK\r\n\r\n");
    }
}
