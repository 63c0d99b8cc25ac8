use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use aya::{Ebpf, maps::RingBuf, programs::UProbe};
use log::debug;

static SHUTDOWN: once_cell::sync::Lazy<Arc<AtomicBool>> =
    once_cell::sync::Lazy::new(|| Arc::new(AtomicBool::new(false)));

pub fn shutdown_flag() -> Arc<AtomicBool> {
    SHUTDOWN.clone()
}

pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

pub mod discovery;
pub mod stats;
pub mod targets;
pub mod tls;

pub trait Probe {
    fn attach(&self, bpf: &mut Ebpf) -> Result<()>;
}

pub const POLL_INTERVAL_MS: u64 = 10;

/// Where a uprobe lands inside `target`.
#[derive(Debug, Clone, Copy)]
pub struct UprobeSite<'a> {
    pub program_name: &'a str,
    pub symbol: &'a str,
    /// Byte offset from the start of `symbol`.
    pub offset: u64,
}

impl<'a> UprobeSite<'a> {
    pub fn entry(program_name: &'a str, symbol: &'a str) -> Self {
        Self {
            program_name,
            symbol,
            offset: 0,
        }
    }
}

/// Loads `site.program_name` on first use and attaches it to `target`.
/// A program may be attached to many sites.
pub fn attach_uprobe(bpf: &mut Ebpf, site: UprobeSite, target: &str) -> Result<()> {
    let program: &mut UProbe = bpf
        .program_mut(site.program_name)
        .with_context(|| format!("Failed to find program: {}", site.program_name))?
        .try_into()
        .with_context(|| format!("Program {} is not a UProbe", site.program_name))?;

    if program.fd().is_err() {
        program
            .load()
            .with_context(|| format!("Failed to load {}", site.program_name))?;
    }

    program
        .attach(Some(site.symbol), site.offset, target, None)
        .with_context(|| {
            format!(
                "Failed to attach uprobe to {}:{}+{:#x}",
                target, site.symbol, site.offset
            )
        })?;
    debug!(
        "Attached {} to {}:{}+{:#x}",
        site.program_name, target, site.symbol, site.offset
    );

    Ok(())
}

/// Hands every record of `map_name` to `handler` on a blocking thread.
/// Records may be variable-length; decoding is up to the handler.
pub fn spawn_ringbuf_handler<F>(bpf: &mut Ebpf, map_name: &str, mut handler: F) -> Result<()>
where
    F: FnMut(&[u8]) + Send + 'static,
{
    let mut ring_buf = RingBuf::try_from(
        bpf.take_map(map_name)
            .with_context(|| format!("Failed to get map {}", map_name))?,
    )?;
    let shutdown = shutdown_flag();

    tokio::task::spawn_blocking(move || {
        while !shutdown.load(Ordering::Relaxed) {
            let mut has_work = false;
            while let Some(item) = ring_buf.next() {
                has_work = true;
                handler(&item);
            }
            if !has_work {
                std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
            }
        }
    });
    Ok(())
}

/// Sleeps in short steps so a shutdown request is noticed promptly.
/// Returns false once shutdown has been requested.
pub(crate) fn sleep_unless_shutdown(total: Duration) -> bool {
    let shutdown = shutdown_flag();
    let step = Duration::from_millis(200);
    let mut slept = Duration::ZERO;
    while slept < total {
        if shutdown.load(Ordering::Relaxed) {
            return false;
        }
        let chunk = step.min(total - slept);
        std::thread::sleep(chunk);
        slept += chunk;
    }
    !shutdown.load(Ordering::Relaxed)
}
