//! TLS plaintext capture for OpenSSL and Go `crypto/tls`.

pub mod consumer;
pub mod gotls;
pub mod http;
pub mod openssl;

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use aya::Ebpf;
use log::{info, warn};
use tlstap_common::emit::StreamLimits;

use crate::probes::{
    Probe,
    discovery::{self, LIBSSL_PATTERN},
    sleep_unless_shutdown, spawn_ringbuf_handler,
};
use crate::settings::{DEFAULT_PROC_ROOT, OutputFormat};
use crate::telemetry;
use consumer::{CapturedChunk, FragmentAssembler, FragmentPrinter};

pub const SSL_EVENTS_MAP: &str = "SSL_EVENTS";

const CLEANUP_INTERVAL_SECS: u64 = 5;
const FRAGMENT_RETENTION_SECS: u64 = 2;

#[derive(Debug, Clone)]
pub struct TlsProbe {
    pub openssl: bool,
    pub gotls: bool,
    pub pids: Vec<u32>,
    pub libssl_paths: Vec<String>,
    pub go_binaries: Vec<String>,
    /// procfs the PIDs belong to, e.g. `/host/proc` inside a container.
    pub proc_root: PathBuf,
    pub output: OutputFormat,
}

impl TlsProbe {
    fn libssl_targets(&self) -> Result<BTreeSet<String>> {
        if !self.libssl_paths.is_empty() {
            return Ok(self.libssl_paths.iter().cloned().collect());
        }
        if !self.pids.is_empty() {
            return discovery::find_libraries_for_pids(&self.proc_root, &self.pids, &LIBSSL_PATTERN);
        }
        // ldconfig describes our own filesystem, not the one under a mounted host procfs
        let ldconfig = (self.proc_root == Path::new(DEFAULT_PROC_ROOT)).then_some("libssl.so");
        discovery::find_libraries_all(&self.proc_root, &LIBSSL_PATTERN, ldconfig)
    }

    fn go_targets(&self) -> BTreeSet<String> {
        let mut paths: BTreeSet<String> = self.go_binaries.iter().cloned().collect();
        for &pid in &self.pids {
            match discovery::process_executable(&self.proc_root, pid) {
                Ok(exe) => {
                    paths.insert(exe.to_string_lossy().to_string());
                }
                Err(e) => warn!("{:#}", e),
            }
        }
        paths
    }

    fn attach_openssl(&self, bpf: &mut Ebpf) -> Result<usize> {
        let targets = self.libssl_targets()?;
        if targets.is_empty() {
            warn!("No libssl found. OpenSSL capture disabled.");
            return Ok(0);
        }

        let mut attached = 0;
        for path in &targets {
            info!("Attaching OpenSSL probes to {}", path);
            match openssl::attach_libssl(bpf, path) {
                Ok(()) => attached += 1,
                Err(e) => warn!("Failed to attach to {}: {:#}", path, e),
            }
        }
        Ok(attached)
    }

    fn attach_gotls(&self, bpf: &mut Ebpf) -> usize {
        let mut attached = 0;
        for path in self.go_targets() {
            match gotls::attach_go_binary(bpf, &path) {
                Ok(true) => {
                    info!("Attached Go TLS probes to {}", path);
                    attached += 1;
                }
                Ok(false) => info!("{} is not a Go binary; skipping", path),
                Err(e) => warn!("Failed to attach Go TLS probes to {}: {:#}", path, e),
            }
        }
        attached
    }
}

impl Probe for TlsProbe {
    fn attach(&self, bpf: &mut Ebpf) -> Result<()> {
        if self.openssl {
            let n = self.attach_openssl(bpf)?;
            telemetry::record_active_probe("openssl", n as u64);
        }
        if self.gotls {
            let n = self.attach_gotls(bpf);
            telemetry::record_active_probe("gotls", n as u64);
        }

        let state = Arc::new(Mutex::new(FragmentAssembler::new(
            StreamLimits::DEFAULT.max_bytes(),
        )));
        let printer = Arc::new(FragmentPrinter::new(self.output));

        let handler_state = state.clone();
        let handler_printer = printer.clone();
        spawn_ringbuf_handler(bpf, SSL_EVENTS_MAP, move |record: &[u8]| {
            let Some(chunk) = CapturedChunk::from_record(record) else {
                warn!("Dropping short record ({} bytes)", record.len());
                return;
            };
            telemetry::record_chunk(chunk.direction, chunk.source, chunk.data.len() as u64);

            let fragments = {
                let mut asm = handler_state.lock().unwrap_or_else(|e| e.into_inner());
                asm.push(chunk)
            };
            for fragment in &fragments {
                telemetry::record_fragment(fragment.direction, fragment.source, fragment.truncated);
                handler_printer.print(fragment);
            }
        })?;

        start_cleanup_task(state, printer);
        Ok(())
    }
}

fn start_cleanup_task(state: Arc<Mutex<FragmentAssembler>>, printer: Arc<FragmentPrinter>) {
    std::thread::spawn(move || {
        while sleep_unless_shutdown(Duration::from_secs(CLEANUP_INTERVAL_SECS)) {
            let stale = {
                let mut asm = state.lock().unwrap_or_else(|e| e.into_inner());
                asm.flush_stale(Duration::from_secs(FRAGMENT_RETENTION_SECS))
            };
            for fragment in &stale {
                telemetry::record_fragment(fragment.direction, fragment.source, fragment.truncated);
                printer.print(fragment);
            }
        }
    });
}
