//! Shared types and the capture core used by both the tlstap eBPF object and
//! the userspace agent.
//!
//! Everything that decides *what* gets captured lives here behind small
//! traits so the same code runs in the kernel (backed by BPF maps and
//! helpers) and in host unit tests (backed by in-memory fakes).
#![cfg_attr(not(test), no_std)]

pub mod correlate;
pub mod emit;
pub mod filter;
pub mod gate;
pub mod probe;

/// Capacity of one exported chunk.
pub const MAX_CHUNK_SIZE: usize = 4096;
/// Chunks emitted per intercepted call; anything beyond is dropped.
pub const MAX_CHUNKS: usize = 4;
/// Bytes of a fragment the header scanner looks at.
pub const MAX_SCAN_BYTES: usize = 4096;
/// Longest Host/Authorization line kept by the header scanner.
pub const MAX_HEADER_LENGTH: usize = 255;
pub const MIN_CARD_LEN: usize = 13;
pub const MAX_CARD_LEN: usize = 19;

pub const MAX_TARGETS: u32 = 4096;
pub const MAX_CONTEXTS: u32 = 1024;

/// Offset of `goid` inside the runtime `g` struct.
pub const GOROUTINE_ID_OFFSET: u64 = 152;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Plaintext handed to a TLS write.
    Egress = 0,
    /// Plaintext returned from a TLS read.
    Ingress = 1,
}

impl Direction {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Direction::Ingress,
            _ => Direction::Egress,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Egress => "egress",
            Direction::Ingress => "ingress",
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlsSource {
    OpenSsl = 0,
    GoTls = 1,
}

impl TlsSource {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => TlsSource::GoTls,
            _ => TlsSource::OpenSsl,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TlsSource::OpenSsl => "openssl",
            TlsSource::GoTls => "gotls",
        }
    }
}

/// Header of every chunk pushed to the ring buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SslEventMeta {
    pub pid: u32,
    pub tid: u32,
    pub timestamp_ns: u64,
    /// Byte offset of this chunk inside the intercepted buffer.
    pub position: u64,
    /// Valid bytes in `SslEvent::data`.
    pub chunk_size: u32,
    /// Length of the whole intercepted buffer, before truncation.
    pub total_size: u32,
    pub direction: u8,
    pub source: u8,
    pub _pad: [u8; 6],
}

/// Size of the metadata prefix of every exported record.
pub const SSL_EVENT_META_SIZE: usize = core::mem::size_of::<SslEventMeta>();

/// Scratch buffer for one chunk. Only `wire_bytes()` is exported, so a
/// record is the metadata followed by `chunk_size` payload bytes.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SslEvent {
    pub meta: SslEventMeta,
    pub data: [u8; MAX_CHUNK_SIZE],
}

impl SslEvent {
    pub const fn zeroed() -> Self {
        SslEvent {
            meta: SslEventMeta {
                pid: 0,
                tid: 0,
                timestamp_ns: 0,
                position: 0,
                chunk_size: 0,
                total_size: 0,
                direction: 0,
                source: 0,
                _pad: [0; 6],
            },
            data: [0; MAX_CHUNK_SIZE],
        }
    }

    #[inline(always)]
    pub fn wire_len(&self) -> usize {
        let len = self.meta.chunk_size as usize;
        SSL_EVENT_META_SIZE + if len > MAX_CHUNK_SIZE { MAX_CHUNK_SIZE } else { len }
    }

    /// The record handed to the export channel.
    #[inline(always)]
    pub fn wire_bytes(&self) -> &[u8] {
        // `data` directly follows `meta`: repr(C) and a u8 array
        unsafe { core::slice::from_raw_parts(self as *const SslEvent as *const u8, self.wire_len()) }
    }
}

/// Splits an exported record into metadata and payload. The payload is cut
/// to `chunk_size` and to what the record actually holds.
pub fn decode_record(record: &[u8]) -> Option<(SslEventMeta, &[u8])> {
    if record.len() < SSL_EVENT_META_SIZE {
        return None;
    }
    let meta = unsafe { (record.as_ptr() as *const SslEventMeta).read_unaligned() };
    let data = &record[SSL_EVENT_META_SIZE..];
    let len = (meta.chunk_size as usize).min(data.len()).min(MAX_CHUNK_SIZE);
    Some((meta, &data[..len]))
}

/// Key used to pair a read entry with its return.
///
/// `lwt_id` is the kernel thread id for native callers and the goroutine id
/// for Go callers.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CallIdentity {
    pub pid: u64,
    pub lwt_id: u64,
}

/// Caller buffer captured at a read entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub ptr: u64,
    pub len: u64,
    pub cap: u64,
    /// Address of an out-parameter holding the transferred length
    /// (`SSL_read_ex`); zero when the length comes from the return value.
    pub len_ptr: u64,
}

impl BufferDescriptor {
    /// Buffer described by a C `int` length (`SSL_write`, `SSL_read`).
    /// Negative lengths describe nothing.
    #[inline(always)]
    pub fn with_int_len(ptr: u64, num: i32, len_ptr: u64) -> Self {
        let len = if num > 0 { num as u64 } else { 0 };
        BufferDescriptor { ptr, len, cap: len, len_ptr }
    }

    /// Buffer described by a `size_t` length (`SSL_write_ex`, `SSL_read_ex`).
    #[inline(always)]
    pub fn with_size_len(ptr: u64, num: u64, len_ptr: u64) -> Self {
        BufferDescriptor { ptr, len: num, cap: num, len_ptr }
    }
}

/// Value of the target table, keyed by PID-namespace inode.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceTarget {
    pub enabled: u8,
}

impl TraceTarget {
    pub const ENABLED: TraceTarget = TraceTarget { enabled: 1 };
    pub const DISABLED: TraceTarget = TraceTarget { enabled: 0 };

    pub fn is_enabled(&self) -> bool {
        self.enabled != 0
    }
}

pub const POLICY_HTTP_CLOUD_HOST: u8 = 1 << 0;
pub const POLICY_CARD_NUMBER: u8 = 1 << 1;

/// How a header line length is bounded before it is copied.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeaderLenMode {
    /// `len & MAX_HEADER_LENGTH`; long lines wrap around.
    #[default]
    Masked = 0,
    /// `min(len, MAX_HEADER_LENGTH)`.
    Clamped = 1,
}

impl HeaderLenMode {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => HeaderLenMode::Clamped,
            _ => HeaderLenMode::Masked,
        }
    }
}

/// Single-entry config map written by userspace before attaching.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterConfig {
    /// Bitset of `POLICY_*`. Zero forwards every chunk.
    pub policies: u8,
    pub header_len_mode: u8,
    pub _pad: [u8; 2],
}

impl FilterConfig {
    pub const fn new(policies: u8, mode: HeaderLenMode) -> Self {
        FilterConfig {
            policies,
            header_len_mode: mode as u8,
            _pad: [0; 2],
        }
    }

    pub fn has(&self, policy: u8) -> bool {
        self.policies & policy != 0
    }

    pub fn header_len_mode(&self) -> HeaderLenMode {
        HeaderLenMode::from_raw(self.header_len_mode)
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig::new(POLICY_HTTP_CLOUD_HOST, HeaderLenMode::Masked)
    }
}

/// Kernel struct offsets used to walk
/// `task->group_leader->nsproxy->pid_ns_for_children->ns.inum`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskOffsets {
    pub group_leader: u32,
    pub nsproxy: u32,
    pub pid_ns_for_children: u32,
    pub ns_inum: u32,
}

impl Default for TaskOffsets {
    // x86_64 6.8 generic build; check with `pahole task_struct` elsewhere
    fn default() -> Self {
        TaskOffsets {
            group_leader: 0x988,
            nsproxy: 0xbc8,
            pid_ns_for_children: 0x20,
            ns_inum: 0xc0,
        }
    }
}

/// Slots of the per-CPU `PROBE_STATS` counter array.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStat {
    GateClosed = 0,
    CorrelationMiss = 1,
    ReadFailure = 2,
    ExportFailure = 3,
    Truncated = 4,
    Filtered = 5,
    Exported = 6,
    ContextStoreFailure = 7,
}

impl ProbeStat {
    pub const COUNT: u32 = 8;

    pub const ALL: [ProbeStat; ProbeStat::COUNT as usize] = [
        ProbeStat::GateClosed,
        ProbeStat::CorrelationMiss,
        ProbeStat::ReadFailure,
        ProbeStat::ExportFailure,
        ProbeStat::Truncated,
        ProbeStat::Filtered,
        ProbeStat::Exported,
        ProbeStat::ContextStoreFailure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeStat::GateClosed => "gate_closed",
            ProbeStat::CorrelationMiss => "correlation_miss",
            ProbeStat::ReadFailure => "read_failure",
            ProbeStat::ExportFailure => "export_failure",
            ProbeStat::Truncated => "truncated",
            ProbeStat::Filtered => "filtered",
            ProbeStat::Exported => "exported",
            ProbeStat::ContextStoreFailure => "context_store_failure",
        }
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for SslEventMeta {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for SslEvent {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for CallIdentity {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for BufferDescriptor {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for TraceTarget {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for FilterConfig {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for TaskOffsets {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_carries_only_valid_payload() {
        let mut event = SslEvent::zeroed();
        event.meta.pid = 9;
        event.meta.chunk_size = 5;
        event.data[..8].copy_from_slice(b"hello!!!");

        let record = event.wire_bytes();
        assert_eq!(record.len(), SSL_EVENT_META_SIZE + 5);

        let (meta, payload) = decode_record(record).unwrap();
        assert_eq!(meta.pid, 9);
        assert_eq!(payload, b"hello");

        event.meta.chunk_size = u32::MAX;
        assert_eq!(event.wire_len(), SSL_EVENT_META_SIZE + MAX_CHUNK_SIZE);
    }

    #[test]
    fn test_decode_record_rejects_short_records() {
        let mut event = SslEvent::zeroed();
        event.meta.chunk_size = 100;
        let full = &event.wire_bytes()[..SSL_EVENT_META_SIZE + 10];
        assert_eq!(decode_record(full).unwrap().1.len(), 10);
        assert!(decode_record(&full[..SSL_EVENT_META_SIZE - 1]).is_none());
    }

    #[test]
    fn test_native_length_conversions() {
        let int_buf = BufferDescriptor::with_int_len(0x1000, -1, 0);
        assert_eq!(int_buf.len, 0);
        assert_eq!(BufferDescriptor::with_int_len(0x1000, 64, 0).len, 64);

        // A size_t request of 2 GiB or more keeps its length.
        let big = 3u64 << 30;
        let ex = BufferDescriptor::with_size_len(0x1000, big, 0x2000);
        assert_eq!(ex.len, big);
        assert_eq!(ex.cap, big);
        assert_eq!(ex.len_ptr, 0x2000);
    }

    #[test]
    fn test_raw_enum_decoding_defaults() {
        assert_eq!(Direction::from_raw(1), Direction::Ingress);
        assert_eq!(Direction::from_raw(7), Direction::Egress);
        assert_eq!(TlsSource::from_raw(1), TlsSource::GoTls);
        assert_eq!(HeaderLenMode::from_raw(1), HeaderLenMode::Clamped);
        assert_eq!(HeaderLenMode::from_raw(9), HeaderLenMode::Masked);
    }

    #[test]
    fn test_filter_config_defaults_to_http_masked() {
        let config = FilterConfig::default();
        assert!(config.has(POLICY_HTTP_CLOUD_HOST));
        assert!(!config.has(POLICY_CARD_NUMBER));
        assert_eq!(config.header_len_mode(), HeaderLenMode::Masked);
    }

    #[test]
    fn test_probe_stat_slots_are_dense() {
        for (i, stat) in ProbeStat::ALL.iter().enumerate() {
            assert_eq!(*stat as u32, i as u32);
        }
    }
}
