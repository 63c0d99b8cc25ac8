//! Periodic reporting of the kernel-side `PROBE_STATS` counters.

use std::time::Duration;

use anyhow::{Context, Result};
use aya::{
    Ebpf,
    maps::{MapData, PerCpuArray},
};
use log::{info, warn};
use tlstap_common::ProbeStat;

use crate::probes::sleep_unless_shutdown;
use crate::telemetry;

pub const PROBE_STATS_MAP: &str = "PROBE_STATS";

const SLOTS: usize = ProbeStat::COUNT as usize;

/// Per-slot totals summed across CPUs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot([u64; SLOTS]);

impl StatsSnapshot {
    pub fn from_counts(counts: [u64; SLOTS]) -> Self {
        Self(counts)
    }

    pub fn get(&self, stat: ProbeStat) -> u64 {
        self.0[stat as usize]
    }

    /// Growth since `earlier`. Counters only go up; a smaller value (map
    /// recreated) is treated as a restart from zero.
    pub fn delta(&self, earlier: &StatsSnapshot) -> StatsSnapshot {
        let mut out = [0; SLOTS];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = if self.0[i] >= earlier.0[i] {
                self.0[i] - earlier.0[i]
            } else {
                self.0[i]
            };
        }
        StatsSnapshot(out)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|v| *v == 0)
    }

    /// `name=value` pairs for non-zero slots.
    pub fn describe(&self) -> String {
        ProbeStat::ALL
            .iter()
            .filter(|stat| self.get(**stat) > 0)
            .map(|stat| format!("{}={}", stat.as_str(), self.get(*stat)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn read_snapshot(stats: &PerCpuArray<MapData, u64>) -> Result<StatsSnapshot> {
    let mut counts = [0u64; SLOTS];
    for stat in ProbeStat::ALL {
        let values = stats
            .get(&(stat as u32), 0)
            .with_context(|| format!("Failed to read {} counter", stat.as_str()))?;
        counts[stat as usize] = values.iter().sum();
    }
    Ok(StatsSnapshot(counts))
}

/// Logs and exports counter growth every `interval`.
pub fn spawn_stats_reporter(bpf: &mut Ebpf, interval: Duration) -> Result<()> {
    let stats: PerCpuArray<MapData, u64> = PerCpuArray::try_from(
        bpf.take_map(PROBE_STATS_MAP)
            .with_context(|| format!("Failed to get {} map", PROBE_STATS_MAP))?,
    )?;

    std::thread::spawn(move || {
        let mut previous = StatsSnapshot::default();
        while sleep_unless_shutdown(interval) {
            let current = match read_snapshot(&stats) {
                Ok(s) => s,
                Err(e) => {
                    warn!("{:#}", e);
                    continue;
                }
            };
            let delta = current.delta(&previous);
            previous = current;

            if delta.is_zero() {
                continue;
            }
            info!("Probe stats: {}", delta.describe());
            for stat in ProbeStat::ALL {
                telemetry::record_probe_stat(stat.as_str(), delta.get(stat));
            }
        }
    });

    Ok(())
}
