use aya_ebpf::{
    macros::map,
    maps::{Array, HashMap, LruHashMap, PerCpuArray, RingBuf},
};
use tlstap_common::{
    BufferDescriptor, CallIdentity, FilterConfig, MAX_CONTEXTS, MAX_TARGETS, ProbeStat, SslEvent,
    TaskOffsets, TraceTarget, filter::RequestHeaders,
};

pub const SSL_RINGBUF_SIZE: u32 = 8 * 1024 * 1024; // 8MB

#[map]
pub static SSL_EVENTS: RingBuf = RingBuf::with_byte_size(SSL_RINGBUF_SIZE, 0);

/// PID-namespace inode -> enable flag. Written by userspace only.
#[map]
pub static TARGETS: HashMap<u32, TraceTarget> = HashMap::with_max_entries(MAX_TARGETS, 0);

/// In-flight Go `Conn.Read` calls keyed by {pid, goroutine id}.
#[map]
pub static GO_TLS_CONTEXTS: LruHashMap<CallIdentity, BufferDescriptor> =
    LruHashMap::with_max_entries(MAX_CONTEXTS, 0);

/// In-flight `SSL_read`/`SSL_read_ex` calls keyed by {pid, tid}.
#[map]
pub static SSL_CONTEXTS: LruHashMap<CallIdentity, BufferDescriptor> =
    LruHashMap::with_max_entries(MAX_CONTEXTS, 0);

// Per-CPU scratch, too large for the BPF stack.
#[map]
pub static SSL_EVENT: PerCpuArray<SslEvent> = PerCpuArray::with_max_entries(1, 0);

#[map]
pub static HTTP_REQUEST: PerCpuArray<RequestHeaders> = PerCpuArray::with_max_entries(1, 0);

#[map]
pub static FILTER_CONFIG: Array<FilterConfig> = Array::with_max_entries(1, 0);

#[map]
pub static TASK_OFFSETS: Array<TaskOffsets> = Array::with_max_entries(1, 0);

#[map]
pub static PROBE_STATS: PerCpuArray<u64> = PerCpuArray::with_max_entries(ProbeStat::COUNT, 0);
