use aya_ebpf::{
    EbpfContext,
    helpers::{
        bpf_get_current_pid_tgid, bpf_get_current_task, bpf_ktime_get_ns, bpf_probe_read_kernel,
        bpf_probe_read_user, bpf_probe_read_user_buf,
    },
    maps::{HashMap, LruHashMap},
    programs::ProbeContext,
};
use aya_log_ebpf::{debug, warn};
use tlstap_common::{
    BufferDescriptor, CallIdentity, GOROUTINE_ID_OFFSET, ProbeStat, SslEvent,
    TlsSource, TraceTarget,
    correlate::ContextStore,
    emit::{EventSink, SourceReader, StreamLimits},
    gate::TargetTable,
    probe::{CallInfo, Pipeline, ProbeOutcome},
};

use super::maps::{
    FILTER_CONFIG, HTTP_REQUEST, PROBE_STATS, SSL_EVENT, SSL_EVENTS, TARGETS, TASK_OFFSETS,
};

pub struct TargetMap(&'static HashMap<u32, TraceTarget>);

impl TargetTable for TargetMap {
    #[inline(always)]
    fn lookup(&self, pid_ns_inode: u32) -> Option<TraceTarget> {
        unsafe { self.0.get(&pid_ns_inode).copied() }
    }
}

pub struct ContextMap(&'static LruHashMap<CallIdentity, BufferDescriptor>);

impl ContextStore for ContextMap {
    #[inline(always)]
    fn get(&self, id: &CallIdentity) -> Option<BufferDescriptor> {
        unsafe { self.0.get(id).copied() }
    }

    #[inline(always)]
    fn insert(&self, id: &CallIdentity, desc: &BufferDescriptor) -> Result<(), i64> {
        self.0.insert(id, desc, 0)
    }

    #[inline(always)]
    fn remove(&self, id: &CallIdentity) {
        let _ = self.0.remove(id);
    }
}

pub struct UserMemory;

impl SourceReader for UserMemory {
    #[inline(always)]
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<(), i64> {
        unsafe { bpf_probe_read_user_buf(addr as *const u8, dst) }
    }
}

pub struct RingSink;

impl EventSink for RingSink {
    #[inline(always)]
    fn export(&self, event: &SslEvent) -> Result<(), i64> {
        SSL_EVENTS.output(event.wire_bytes(), 0)
    }
}

pub type TlsPipeline<'a> = Pipeline<'a, TargetMap, ContextMap, UserMemory, RingSink>;

/// Builds a pipeline over the shared maps and per-CPU scratch, then runs `f`.
/// Returns `None` only if a scratch slot is missing.
#[inline(always)]
pub fn with_pipeline<F>(
    contexts: &'static LruHashMap<CallIdentity, BufferDescriptor>,
    f: F,
) -> Option<ProbeOutcome>
where
    F: FnOnce(&mut TlsPipeline<'_>) -> ProbeOutcome,
{
    let event = SSL_EVENT.get_ptr_mut(0)?;
    let headers = HTTP_REQUEST.get_ptr_mut(0)?;
    let filter = FILTER_CONFIG.get(0).copied().unwrap_or_default();

    let targets = TargetMap(&TARGETS);
    let contexts = ContextMap(contexts);
    let mut pipeline = Pipeline {
        targets: &targets,
        contexts: &contexts,
        reader: &UserMemory,
        sink: &RingSink,
        event: unsafe { &mut *event },
        headers: unsafe { &mut *headers },
        filter,
        limits: StreamLimits::DEFAULT,
    };
    Some(f(&mut pipeline))
}

/// Inode of the PID namespace the calling process lives in.
///
/// Walks `task->group_leader->nsproxy->pid_ns_for_children->ns.inum` with
/// the offsets userspace wrote to `TASK_OFFSETS`.
#[inline(always)]
pub fn current_pid_ns_inode() -> Option<u32> {
    let offsets = TASK_OFFSETS.get(0)?;
    if offsets.group_leader == 0 || offsets.nsproxy == 0 {
        return None;
    }
    unsafe {
        let task = bpf_get_current_task();
        let leader: u64 =
            bpf_probe_read_kernel((task + offsets.group_leader as u64) as *const u64).ok()?;
        let nsproxy: u64 =
            bpf_probe_read_kernel((leader + offsets.nsproxy as u64) as *const u64).ok()?;
        if nsproxy == 0 {
            return None;
        }
        let pid_ns: u64 =
            bpf_probe_read_kernel((nsproxy + offsets.pid_ns_for_children as u64) as *const u64)
                .ok()?;
        if pid_ns == 0 {
            return None;
        }
        bpf_probe_read_kernel((pid_ns + offsets.ns_inum as u64) as *const u32).ok()
    }
}

#[inline(always)]
fn call_info(identity: CallIdentity, tid: u32, source: TlsSource) -> CallInfo {
    CallInfo {
        identity,
        tid,
        pid_ns_inode: current_pid_ns_inode(),
        timestamp_ns: unsafe { bpf_ktime_get_ns() },
        source,
    }
}

/// Native callers are keyed by {pid, tid}.
#[inline(always)]
pub fn native_call_info() -> CallInfo {
    let pid_tgid = bpf_get_current_pid_tgid();
    let pid = pid_tgid >> 32;
    let tid = pid_tgid as u32;
    call_info(CallIdentity { pid, lwt_id: tid as u64 }, tid, TlsSource::OpenSsl)
}

/// Go callers are keyed by {pid, goroutine id} since goroutines migrate
/// between threads across a blocking read. An unreadable `g` degrades to
/// goroutine id 0.
#[inline(always)]
pub fn go_call_info(ctx: &ProbeContext) -> CallInfo {
    let pid_tgid = bpf_get_current_pid_tgid();
    let goid = go_goroutine_id(ctx).unwrap_or(0);
    call_info(
        CallIdentity { pid: pid_tgid >> 32, lwt_id: goid },
        pid_tgid as u32,
        TlsSource::GoTls,
    )
}

// Go register ABI, as u64 slots of the saved user registers.
#[cfg(bpf_target_arch = "x86_64")]
mod go_abi {
    // RAX, RBX, RCX, RDI
    pub const ARGS: [usize; 4] = [10, 5, 11, 14];
    pub const RET: usize = 10;
    // R14
    pub const G: usize = 1;
}

#[cfg(bpf_target_arch = "aarch64")]
mod go_abi {
    pub const ARGS: [usize; 4] = [0, 1, 2, 3];
    pub const RET: usize = 0;
    pub const G: usize = 28;
}

#[cfg(not(any(bpf_target_arch = "x86_64", bpf_target_arch = "aarch64")))]
mod go_abi {
    compile_error!("Go register ABI is only mapped for x86_64 and aarch64");
}

#[inline(always)]
fn go_reg(ctx: &ProbeContext, slot: usize) -> Option<u64> {
    unsafe { bpf_probe_read_kernel((ctx.regs as *const u64).add(slot)).ok() }
}

#[inline(always)]
fn go_goroutine_id(ctx: &ProbeContext) -> Option<u64> {
    let g = go_reg(ctx, go_abi::G)?;
    if g == 0 {
        return None;
    }
    unsafe { bpf_probe_read_user((g + GOROUTINE_ID_OFFSET) as *const u64).ok() }
}

/// The `b []byte` argument of a `(*Conn)` method: the receiver takes the
/// first register, then pointer, length and capacity.
#[inline(always)]
pub fn go_slice_arg(ctx: &ProbeContext) -> BufferDescriptor {
    let len = go_reg(ctx, go_abi::ARGS[2]).unwrap_or(0) as i64;
    let cap = go_reg(ctx, go_abi::ARGS[3]).unwrap_or(0) as i64;
    BufferDescriptor {
        ptr: go_reg(ctx, go_abi::ARGS[1]).unwrap_or(0),
        len: if len > 0 { len as u64 } else { 0 },
        cap: if cap > 0 { cap as u64 } else { 0 },
        len_ptr: 0,
    }
}

/// First integer result, read at a `RET` instruction.
#[inline(always)]
pub fn go_return_value(ctx: &ProbeContext) -> i64 {
    go_reg(ctx, go_abi::RET).unwrap_or(0) as i64
}

#[inline(always)]
fn bump(stat: ProbeStat, n: u32) {
    if n == 0 {
        return;
    }
    if let Some(slot) = PROBE_STATS.get_ptr_mut(stat as u32) {
        unsafe { *slot += n as u64 };
    }
}

/// Counts the outcome in `PROBE_STATS` and logs the unusual ones.
#[inline(always)]
pub fn record_outcome<C: EbpfContext>(ctx: &C, probe: &str, outcome: Option<ProbeOutcome>) {
    let Some(outcome) = outcome else {
        return;
    };
    match outcome {
        ProbeOutcome::GateClosed => bump(ProbeStat::GateClosed, 1),
        ProbeOutcome::ContextStored | ProbeOutcome::Empty => {}
        ProbeOutcome::ContextStoreFailed(err) => {
            bump(ProbeStat::ContextStoreFailure, 1);
            warn!(ctx, "{}: failed to store read context: {}", probe, err);
        }
        ProbeOutcome::CorrelationMiss => {
            bump(ProbeStat::CorrelationMiss, 1);
            debug!(ctx, "{}: no read context for return", probe);
        }
        ProbeOutcome::LengthUnreadable => {
            bump(ProbeStat::ReadFailure, 1);
            debug!(ctx, "{}: could not read transferred length", probe);
        }
        ProbeOutcome::Emitted(report) => {
            bump(ProbeStat::Exported, report.exported);
            bump(ProbeStat::Filtered, report.filtered);
            bump(ProbeStat::ReadFailure, report.read_failures);
            bump(ProbeStat::ExportFailure, report.export_failures);
            if report.truncated {
                bump(ProbeStat::Truncated, 1);
            }
            if report.export_failures > 0 {
                warn!(ctx, "{}: ring buffer full, dropped {} chunks", probe, report.export_failures);
            }
        }
    }
}
