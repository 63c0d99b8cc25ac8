//! Locating TLS libraries and executables to attach to.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{Context, Result};
use log::debug;
use once_cell::sync::Lazy;
use procfs::process::{MMapPath, Process};
use regex::Regex;

/// Matches `libssl.so.3`, `libssl.so.1.1`, ...
pub static LIBSSL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^libssl\.so(\..*)?$").expect("valid libssl pattern"));

/// Resolves a path from a process's mount namespace to the host filesystem
/// by going through `<proc_root>/<pid>/root`.
pub fn resolve_host_path(proc_root: &Path, pid: i32, container_path: &Path) -> PathBuf {
    if container_path.starts_with(proc_root) {
        return container_path.to_path_buf();
    }

    let mut root_path = proc_root.join(pid.to_string()).join("root");
    let relative_path = container_path.strip_prefix("/").unwrap_or(container_path);
    root_path.push(relative_path);

    root_path
}

fn open_process(proc_root: &Path, pid: u32) -> Result<Process> {
    Process::new_with_root(proc_root.join(pid.to_string()))
        .with_context(|| format!("No such process: {}", pid))
}

fn libraries_of(
    proc_root: &Path,
    process: &Process,
    pattern: &Regex,
    paths: &mut BTreeSet<String>,
) {
    let maps = match process.maps() {
        Ok(m) => m,
        Err(_) => return,
    };

    for map in maps {
        if let MMapPath::Path(path_buf) = map.pathname
            && let Some(file_name) = path_buf.file_name().and_then(|n| n.to_str())
            && pattern.is_match(file_name)
        {
            let host_path = resolve_host_path(proc_root, process.pid, &path_buf);
            if host_path.exists() {
                let path_str = host_path.to_string_lossy().to_string();
                if paths.insert(path_str.clone()) {
                    debug!("Found library: {} (from PID: {})", path_str, process.pid);
                }
            }
        }
    }
}

/// Libraries matching `pattern` mapped by any process under `proc_root`,
/// plus system copies listed by ldconfig when `ldconfig_substring` is given.
pub fn find_libraries_all(
    proc_root: &Path,
    pattern: &Regex,
    ldconfig_substring: Option<&str>,
) -> Result<BTreeSet<String>> {
    let mut paths = BTreeSet::new();

    if let Some(substring) = ldconfig_substring {
        for path in find_system_libraries(substring)? {
            paths.insert(path);
        }
    }

    debug!("Scanning processes for libraries matching {}", pattern);
    if let Ok(procs) = procfs::process::all_processes_with_root(proc_root) {
        for process in procs.flatten() {
            libraries_of(proc_root, &process, pattern, &mut paths);
        }
    }

    Ok(paths)
}

/// Same as `find_libraries_all`, restricted to the given processes.
pub fn find_libraries_for_pids(
    proc_root: &Path,
    pids: &[u32],
    pattern: &Regex,
) -> Result<BTreeSet<String>> {
    let mut paths = BTreeSet::new();

    for &pid in pids {
        match open_process(proc_root, pid) {
            Ok(process) => libraries_of(proc_root, &process, pattern, &mut paths),
            Err(e) => debug!("Skipping PID {}: {:#}", pid, e),
        }
    }

    Ok(paths)
}

/// System libraries known to ldconfig whose entry contains `substring`.
pub fn find_system_libraries(substring: &str) -> Result<Vec<String>> {
    debug!("Finding system libraries via ldconfig for '{}'", substring);
    match Command::new("ldconfig").arg("-p").output() {
        Ok(output) => Ok(parse_ldconfig_output(
            &String::from_utf8_lossy(&output.stdout),
            substring,
        )),
        Err(e) => {
            debug!("ldconfig unavailable: {}", e);
            Ok(Vec::new())
        }
    }
}

fn parse_ldconfig_output(stdout: &str, substring: &str) -> Vec<String> {
    let mut paths = Vec::new();
    for line in stdout.lines() {
        if !line.contains(substring) {
            continue;
        }
        if let Some((_, path)) = line.split_once("=>") {
            let path = path.trim().to_string();
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
    }
    paths
}

/// Host path of the executable backing `pid`.
pub fn process_executable(proc_root: &Path, pid: u32) -> Result<PathBuf> {
    let process = open_process(proc_root, pid)?;
    let exe = process
        .exe()
        .with_context(|| format!("Failed to resolve executable of PID {}", pid))?;
    Ok(resolve_host_path(proc_root, pid as i32, &exe))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_host_path_goes_through_proc_root() {
        let proc_root = Path::new("/proc");
        assert_eq!(
            resolve_host_path(proc_root, 42, Path::new("/usr/lib/libssl.so.3")),
            PathBuf::from("/proc/42/root/usr/lib/libssl.so.3")
        );
        assert_eq!(
            resolve_host_path(proc_root, 42, Path::new("/proc/42/exe")),
            PathBuf::from("/proc/42/exe")
        );
    }

    #[test]
    fn test_resolve_host_path_with_mounted_host_proc() {
        let proc_root = Path::new("/host/proc");
        assert_eq!(
            resolve_host_path(proc_root, 42, Path::new("/usr/local/bin/server")),
            PathBuf::from("/host/proc/42/root/usr/local/bin/server")
        );
        assert_eq!(
            resolve_host_path(proc_root, 42, Path::new("/host/proc/42/exe")),
            PathBuf::from("/host/proc/42/exe")
        );
    }

    #[test]
    fn test_process_executable_uses_proc_root() {
        let pid = std::process::id();
        let exe = process_executable(Path::new("/proc"), pid).unwrap();
        assert!(exe.starts_with(format!("/proc/{}/root", pid)));
        assert!(exe.exists());
    }

    #[test]
    fn test_missing_proc_root_finds_nothing() {
        let root = Path::new("/nonexistent/proc");
        assert!(process_executable(root, std::process::id()).is_err());
        let found =
            find_libraries_for_pids(root, &[std::process::id()], &LIBSSL_PATTERN).unwrap();
        assert!(found.is_empty());
        assert!(find_libraries_all(root, &LIBSSL_PATTERN, None).unwrap().is_empty());
    }

    #[test]
    fn test_libssl_pattern() {
        assert!(LIBSSL_PATTERN.is_match("libssl.so.3"));
        assert!(LIBSSL_PATTERN.is_match("libssl.so.1.1"));
        assert!(LIBSSL_PATTERN.is_match("libssl.so"));
        assert!(!LIBSSL_PATTERN.is_match("libcrypto.so.3"));
        assert!(!LIBSSL_PATTERN.is_match("libssl3.so"));
    }

    #[test]
    fn test_parse_ldconfig_output() {
        let stdout = "\
1234 libs found in cache `/etc/ld.so.cache'
\tlibssl.so.3 (libc6,x86-64) => /lib/x86_64-linux-gnu/libssl.so.3
\tlibssl.so.3 (libc6,x86-64) => /lib/x86_64-linux-gnu/libssl.so.3
\tlibcrypto.so.3 (libc6,x86-64) => /lib/x86_64-linux-gnu/libcrypto.so.3
";
        assert_eq!(
            parse_ldconfig_output(stdout, "libssl.so"),
            vec!["/lib/x86_64-linux-gnu/libssl.so.3".to_string()]
        );
    }
}
