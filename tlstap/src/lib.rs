pub mod probes;
pub mod settings;
pub mod telemetry;

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use aya::{
    Ebpf,
    maps::{Array, HashMap, MapData},
};
use aya_log::EbpfLogger;
use log::{info, warn};
use tlstap_common::{FilterConfig, TaskOffsets, TraceTarget};
use tokio::signal;

use crate::probes::{
    Probe, request_shutdown,
    stats::spawn_stats_reporter,
    targets::TargetRegistry,
    tls::TlsProbe,
};
use crate::settings::Settings;

pub const FILTER_CONFIG_MAP: &str = "FILTER_CONFIG";
pub const TASK_OFFSETS_MAP: &str = "TASK_OFFSETS";

pub struct TlsTapEngine {
    pub settings: Settings,
    bpf: Ebpf,
    targets: Option<TargetRegistry<HashMap<MapData, u32, TraceTarget>>>,
}

impl TlsTapEngine {
    pub fn new(settings: Settings, bytecode: &[u8]) -> Result<Self> {
        bump_memlock_rlimit()?;
        let mut bpf = Ebpf::load(bytecode)?;
        if let Err(e) = EbpfLogger::init(&mut bpf) {
            warn!("Failed to initialize eBPF logger: {}", e);
        }
        Ok(Self {
            settings,
            bpf,
            targets: None,
        })
    }

    pub async fn run(mut self) -> Result<()> {
        self.configure_maps()?;
        self.register_targets()?;
        self.attach_probes()?;
        spawn_stats_reporter(
            &mut self.bpf,
            Duration::from_secs(self.settings.stats_interval_secs()),
        )?;

        info!("Monitoring active. Press Ctrl-C to exit.");
        signal::ctrl_c().await?;
        info!("Exiting...");
        request_shutdown();
        if let Some(registry) = &self.targets {
            info!(
                "Traced PID namespaces: {:?}",
                registry.namespaces().collect::<Vec<_>>()
            );
        }

        Ok(())
    }

    /// Config maps must be written before any program is attached.
    fn configure_maps(&mut self) -> Result<()> {
        let filter = self.settings.to_filter_config()?;
        let mut filter_map: Array<_, FilterConfig> = Array::try_from(
            self.bpf
                .map_mut(FILTER_CONFIG_MAP)
                .with_context(|| format!("Failed to get {} map", FILTER_CONFIG_MAP))?,
        )?;
        filter_map.set(0, filter, 0)?;
        info!(
            "Filter policies={:#04b} header_length_mode={:?}",
            filter.policies,
            filter.header_len_mode()
        );

        let offsets = self.settings.to_task_offsets();
        let mut offsets_map: Array<_, TaskOffsets> = Array::try_from(
            self.bpf
                .map_mut(TASK_OFFSETS_MAP)
                .with_context(|| format!("Failed to get {} map", TASK_OFFSETS_MAP))?,
        )?;
        offsets_map.set(0, offsets, 0)?;

        Ok(())
    }

    fn register_targets(&mut self) -> Result<()> {
        let mut registry = TargetRegistry::from_ebpf(&mut self.bpf, self.settings.proc_root())?;
        let pids = self.settings.target_pids();
        if pids.is_empty() {
            warn!("No target PIDs configured; every call will be gated out.");
        }
        for pid in pids {
            if let Err(e) = registry.enable_pid(pid) {
                warn!("Failed to enable PID {}: {:#}", pid, e);
            }
        }
        self.targets = Some(registry);
        Ok(())
    }

    fn attach_probes(&mut self) -> Result<()> {
        let probe = TlsProbe {
            openssl: self.settings.openssl_enabled(),
            gotls: self.settings.gotls_enabled(),
            pids: self.settings.target_pids(),
            libssl_paths: self.settings.targets.libssl_paths.clone().unwrap_or_default(),
            go_binaries: self.settings.targets.go_binaries.clone().unwrap_or_default(),
            proc_root: PathBuf::from(self.settings.proc_root()),
            output: self.settings.output_format()?,
        };
        probe.attach(&mut self.bpf)
    }
}

fn bump_memlock_rlimit() -> Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("Failed to increase rlimit");
    }
    Ok(())
}
