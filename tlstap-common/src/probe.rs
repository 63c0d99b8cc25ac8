//! Handler logic shared by every TLS probe.
//!
//! Each probe entry point resolves its own arguments (calling convention,
//! identity, namespace) into a `CallInfo` plus a `BufferDescriptor`, then
//! hands them to a `Pipeline`. The returned `ProbeOutcome` is what the caller
//! logs and counts.

use crate::correlate::{ContextStore, Correlator};
use crate::emit::{ChunkMeta, EmitReport, EventSink, SourceReader, StreamLimits, emit_stream};
use crate::filter::{PolicyFilter, RequestHeaders};
use crate::gate::{TargetTable, is_enabled};
use crate::{BufferDescriptor, CallIdentity, Direction, FilterConfig, SslEvent, TlsSource};

#[derive(Debug, Clone, Copy)]
pub struct CallInfo {
    pub identity: CallIdentity,
    pub tid: u32,
    /// `None` when the namespace could not be resolved.
    pub pid_ns_inode: Option<u32>,
    pub timestamp_ns: u64,
    pub source: TlsSource,
}

impl CallInfo {
    fn chunk_meta(&self, direction: Direction) -> ChunkMeta {
        ChunkMeta {
            pid: self.identity.pid as u32,
            tid: self.tid,
            timestamp_ns: self.timestamp_ns,
            direction,
            source: self.source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    GateClosed,
    ContextStored,
    ContextStoreFailed(i64),
    CorrelationMiss,
    /// The call transferred nothing (error return or zero length).
    Empty,
    /// The out-parameter holding the transferred length could not be read.
    LengthUnreadable,
    Emitted(EmitReport),
}

pub struct Pipeline<'a, T, C, R, S>
where
    T: TargetTable + ?Sized,
    C: ContextStore + ?Sized,
    R: SourceReader + ?Sized,
    S: EventSink + ?Sized,
{
    pub targets: &'a T,
    pub contexts: &'a C,
    pub reader: &'a R,
    pub sink: &'a S,
    pub event: &'a mut SslEvent,
    pub headers: &'a mut RequestHeaders,
    pub filter: FilterConfig,
    pub limits: StreamLimits,
}

impl<T, C, R, S> Pipeline<'_, T, C, R, S>
where
    T: TargetTable + ?Sized,
    C: ContextStore + ?Sized,
    R: SourceReader + ?Sized,
    S: EventSink + ?Sized,
{
    /// Write entry: the buffer already holds the plaintext.
    #[inline(always)]
    pub fn on_write(&mut self, call: &CallInfo, buf: &BufferDescriptor) -> ProbeOutcome {
        if !is_enabled(self.targets, call.pid_ns_inode) {
            return ProbeOutcome::GateClosed;
        }
        self.stream(call, buf.ptr, buf.len, Direction::Egress)
    }

    /// Read entry: remember the caller buffer until the read returns.
    #[inline(always)]
    pub fn on_read_enter(&mut self, call: &CallInfo, buf: &BufferDescriptor) -> ProbeOutcome {
        if !is_enabled(self.targets, call.pid_ns_inode) {
            return ProbeOutcome::GateClosed;
        }
        match Correlator::new(self.contexts).begin(&call.identity, buf) {
            Ok(()) => ProbeOutcome::ContextStored,
            Err(e) => ProbeOutcome::ContextStoreFailed(e),
        }
    }

    /// Read return: emit what the read actually produced.
    ///
    /// The gate is not consulted again; a context only exists if the entry
    /// passed it.
    #[inline(always)]
    pub fn on_read_return(&mut self, call: &CallInfo, returned: i64) -> ProbeOutcome {
        let Some(desc) = Correlator::new(self.contexts).end(&call.identity) else {
            return ProbeOutcome::CorrelationMiss;
        };
        if returned <= 0 {
            return ProbeOutcome::Empty;
        }

        let mut len = returned as u64;
        if desc.len_ptr != 0 {
            let mut raw = [0u8; 8];
            if self.reader.read(desc.len_ptr, &mut raw).is_err() {
                return ProbeOutcome::LengthUnreadable;
            }
            len = u64::from_ne_bytes(raw);
        }
        if desc.len != 0 && len > desc.len {
            len = desc.len;
        }
        if len == 0 {
            return ProbeOutcome::Empty;
        }
        self.stream(call, desc.ptr, len, Direction::Ingress)
    }

    #[inline(always)]
    fn stream(&mut self, call: &CallInfo, ptr: u64, len: u64, direction: Direction) -> ProbeOutcome {
        if len == 0 {
            return ProbeOutcome::Empty;
        }
        let mut filter = PolicyFilter::new(self.filter, self.headers);
        let report = emit_stream(
            self.reader,
            self.sink,
            &mut filter,
            self.event,
            self.limits,
            ptr,
            len,
            call.chunk_meta(direction),
        );
        ProbeOutcome::Emitted(report)
    }
}
