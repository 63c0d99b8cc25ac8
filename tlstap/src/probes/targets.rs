//! Control plane for the kernel-side target gate.
//!
//! Capture is enabled per PID namespace: enabling a process enables every
//! process sharing its namespace, which maps naturally onto containers.

use std::{
    borrow::BorrowMut,
    collections::BTreeMap,
    ffi::OsStr,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use aya::{
    Ebpf,
    maps::{HashMap, MapData},
};
use log::info;
use procfs::process::Process;
use tlstap_common::TraceTarget;

pub const TARGETS_MAP: &str = "TARGETS";

/// Write side of the target table.
pub trait TargetWriter {
    fn set(&mut self, pid_ns_inode: u32, target: TraceTarget) -> Result<()>;
    fn clear(&mut self, pid_ns_inode: u32) -> Result<()>;
}

impl<T: BorrowMut<MapData>> TargetWriter for HashMap<T, u32, TraceTarget> {
    fn set(&mut self, pid_ns_inode: u32, target: TraceTarget) -> Result<()> {
        self.insert(pid_ns_inode, target, 0)
            .with_context(|| format!("Failed to update target {}", pid_ns_inode))
    }

    fn clear(&mut self, pid_ns_inode: u32) -> Result<()> {
        self.remove(&pid_ns_inode)
            .with_context(|| format!("Failed to remove target {}", pid_ns_inode))
    }
}

/// Inode of the PID namespace `pid` lives in, read from `<proc_root>/<pid>/ns/pid`.
pub fn pid_namespace_inode(proc_root: &Path, pid: u32) -> Result<u32> {
    let process = Process::new_with_root(proc_root.join(pid.to_string()))
        .with_context(|| format!("No such process: {}", pid))?;
    let namespaces = process
        .namespaces()
        .with_context(|| format!("Failed to read namespaces of PID {}", pid))?;
    let ns = namespaces
        .0
        .get(OsStr::new("pid"))
        .with_context(|| format!("PID {} has no pid namespace entry", pid))?;
    u32::try_from(ns.identifier)
        .with_context(|| format!("Namespace inode {} does not fit in u32", ns.identifier))
}

pub struct TargetRegistry<W: TargetWriter> {
    writer: W,
    proc_root: PathBuf,
    /// namespace inode -> PIDs that were used to enable it
    enabled: BTreeMap<u32, Vec<u32>>,
}

impl TargetRegistry<HashMap<MapData, u32, TraceTarget>> {
    /// Takes ownership of the `TARGETS` map.
    pub fn from_ebpf(bpf: &mut Ebpf, proc_root: impl Into<PathBuf>) -> Result<Self> {
        let map = HashMap::try_from(
            bpf.take_map(TARGETS_MAP)
                .with_context(|| format!("Failed to get {} map", TARGETS_MAP))?,
        )?;
        Ok(Self::new(map, proc_root))
    }
}

impl<W: TargetWriter> TargetRegistry<W> {
    pub fn new(writer: W, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            writer,
            proc_root: proc_root.into(),
            enabled: BTreeMap::new(),
        }
    }

    /// Enables the namespace of `pid`, returning its inode.
    pub fn enable_pid(&mut self, pid: u32) -> Result<u32> {
        let inode = pid_namespace_inode(&self.proc_root, pid)?;
        self.enable_namespace(inode)?;
        let pids = self.enabled.entry(inode).or_default();
        if !pids.contains(&pid) {
            pids.push(pid);
        }
        info!("Tracing PID {} (pid namespace {})", pid, inode);
        Ok(inode)
    }

    pub fn enable_namespace(&mut self, pid_ns_inode: u32) -> Result<()> {
        self.writer.set(pid_ns_inode, TraceTarget::ENABLED)?;
        self.enabled.entry(pid_ns_inode).or_default();
        Ok(())
    }

    /// Removes the namespace entry; subsequent calls from it are gated.
    pub fn disable_namespace(&mut self, pid_ns_inode: u32) -> Result<()> {
        if self.enabled.remove(&pid_ns_inode).is_some() {
            self.writer.clear(pid_ns_inode)?;
            info!("Stopped tracing pid namespace {}", pid_ns_inode);
        }
        Ok(())
    }

    pub fn is_enabled(&self, pid_ns_inode: u32) -> bool {
        self.enabled.contains_key(&pid_ns_inode)
    }

    pub fn namespaces(&self) -> impl Iterator<Item = u32> + '_ {
        self.enabled.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeTable(std::collections::HashMap<u32, TraceTarget>);

    impl TargetWriter for FakeTable {
        fn set(&mut self, pid_ns_inode: u32, target: TraceTarget) -> Result<()> {
            self.0.insert(pid_ns_inode, target);
            Ok(())
        }

        fn clear(&mut self, pid_ns_inode: u32) -> Result<()> {
            self.0.remove(&pid_ns_inode);
            Ok(())
        }
    }

    #[test]
    fn test_own_namespace_resolves() {
        let inode = pid_namespace_inode(Path::new("/proc"), std::process::id()).unwrap();
        assert_ne!(inode, 0);
    }

    #[test]
    fn test_missing_process_is_an_error() {
        assert!(pid_namespace_inode(Path::new("/proc"), u32::MAX).is_err());
    }

    #[test]
    fn test_enable_pid_writes_namespace_entry() {
        let mut registry = TargetRegistry::new(FakeTable::default(), "/proc");
        let inode = registry.enable_pid(std::process::id()).unwrap();

        assert!(registry.is_enabled(inode));
        assert_eq!(registry.writer.0.get(&inode), Some(&TraceTarget::ENABLED));
        assert_eq!(registry.namespaces().collect::<Vec<_>>(), vec![inode]);
    }

    #[test]
    fn test_disable_removes_entry() {
        let mut registry = TargetRegistry::new(FakeTable::default(), "/proc");
        registry.enable_namespace(4026531836).unwrap();
        registry.disable_namespace(4026531836).unwrap();

        assert!(!registry.is_enabled(4026531836));
        assert!(registry.writer.0.is_empty());
        // disabling an unknown namespace is a no-op
        registry.disable_namespace(1).unwrap();
    }
}
