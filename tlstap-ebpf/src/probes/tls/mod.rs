//! Uprobes capturing TLS plaintext at the library boundary.
//!
//! # Probe Mapping
//! - `go_tls_write_enter` → entry of `crypto/tls.(*Conn).Write`
//! - `go_tls_read_enter` → entry of `crypto/tls.(*Conn).Read`
//! - `go_tls_read_return` → every `RET` inside `crypto/tls.(*Conn).Read`
//! - `ssl_write` / `ssl_write_ex` → entry of `SSL_write` / `SSL_write_ex`
//! - `ssl_read_enter` / `ssl_read_ex_enter` → entry of `SSL_read` / `SSL_read_ex`
//! - `ssl_read_return` → return of both read variants
//!
//! Go code moves goroutines between threads and grows stacks, which breaks
//! uretprobes, so the Go read return is a plain uprobe on each `RET`.

use aya_ebpf::{
    macros::{uprobe, uretprobe},
    programs::{ProbeContext, RetProbeContext},
};
use tlstap_common::BufferDescriptor;

mod helpers;
pub mod maps;

use helpers::{
    go_call_info, go_return_value, go_slice_arg, native_call_info, record_outcome, with_pipeline,
};
use maps::{GO_TLS_CONTEXTS, SSL_CONTEXTS};

#[uprobe]
pub fn go_tls_write_enter(ctx: ProbeContext) -> u32 {
    let call = go_call_info(&ctx);
    let buf = go_slice_arg(&ctx);
    let outcome = with_pipeline(&GO_TLS_CONTEXTS, |p| p.on_write(&call, &buf));
    record_outcome(&ctx, "go write", outcome);
    0
}

#[uprobe]
pub fn go_tls_read_enter(ctx: ProbeContext) -> u32 {
    let call = go_call_info(&ctx);
    let buf = go_slice_arg(&ctx);
    let outcome = with_pipeline(&GO_TLS_CONTEXTS, |p| p.on_read_enter(&call, &buf));
    record_outcome(&ctx, "go read", outcome);
    0
}

#[uprobe]
pub fn go_tls_read_return(ctx: ProbeContext) -> u32 {
    let call = go_call_info(&ctx);
    let returned = go_return_value(&ctx);
    let outcome = with_pipeline(&GO_TLS_CONTEXTS, |p| p.on_read_return(&call, returned));
    record_outcome(&ctx, "go read return", outcome);
    0
}

/// `SSL_write(ssl, buf, int num)`. The buffer is complete at entry, so no
/// return probe is needed.
#[uprobe]
pub fn ssl_write(ctx: ProbeContext) -> u32 {
    let ptr: u64 = ctx.arg(1).unwrap_or(0);
    let num: i32 = ctx.arg(2).unwrap_or(0);
    ssl_write_emit(&ctx, BufferDescriptor::with_int_len(ptr, num, 0))
}

/// `SSL_write_ex(ssl, buf, size_t num, written)`.
#[uprobe]
pub fn ssl_write_ex(ctx: ProbeContext) -> u32 {
    let ptr: u64 = ctx.arg(1).unwrap_or(0);
    let num: u64 = ctx.arg(2).unwrap_or(0);
    ssl_write_emit(&ctx, BufferDescriptor::with_size_len(ptr, num, 0))
}

/// `SSL_read(ssl, buf, int num)`: the return value is the byte count.
#[uprobe]
pub fn ssl_read_enter(ctx: ProbeContext) -> u32 {
    let ptr: u64 = ctx.arg(1).unwrap_or(0);
    let num: i32 = ctx.arg(2).unwrap_or(0);
    ssl_read_begin(&ctx, BufferDescriptor::with_int_len(ptr, num, 0))
}

/// `SSL_read_ex(ssl, buf, size_t num, readbytes)`: the byte count lands in
/// `*readbytes` and the return value is only a success flag.
#[uprobe]
pub fn ssl_read_ex_enter(ctx: ProbeContext) -> u32 {
    let ptr: u64 = ctx.arg(1).unwrap_or(0);
    let num: u64 = ctx.arg(2).unwrap_or(0);
    let len_ptr: u64 = ctx.arg(3).unwrap_or(0);
    ssl_read_begin(&ctx, BufferDescriptor::with_size_len(ptr, num, len_ptr))
}

#[uretprobe]
pub fn ssl_read_return(ctx: RetProbeContext) -> u32 {
    let call = native_call_info();
    let returned: i32 = ctx.ret().unwrap_or(0);
    let outcome = with_pipeline(&SSL_CONTEXTS, |p| p.on_read_return(&call, returned as i64));
    record_outcome(&ctx, "ssl read return", outcome);
    0
}

#[inline(always)]
fn ssl_write_emit(ctx: &ProbeContext, buf: BufferDescriptor) -> u32 {
    let call = native_call_info();
    let outcome = with_pipeline(&SSL_CONTEXTS, |p| p.on_write(&call, &buf));
    record_outcome(ctx, "ssl write", outcome);
    0
}

#[inline(always)]
fn ssl_read_begin(ctx: &ProbeContext, buf: BufferDescriptor) -> u32 {
    let call = native_call_info();
    let outcome = with_pipeline(&SSL_CONTEXTS, |p| p.on_read_enter(&call, &buf));
    record_outcome(ctx, "ssl read", outcome);
    0
}
