use which::which;

/// Emits the `bpf_target_arch` cfg the Go register mapping is keyed on, and
/// rebuilds when bpf-linker changes.
fn main() {
    if let Ok(bpf_linker) = which("bpf-linker") {
        println!("cargo:rerun-if-changed={}", bpf_linker.display());
    }

    println!("cargo::rustc-check-cfg=cfg(bpf_target_arch, values(\"x86_64\", \"aarch64\", \"arm\", \"riscv64\", \"powerpc64\", \"s390x\", \"mips\"))");
    println!("cargo:rerun-if-env-changed=CARGO_CFG_BPF_TARGET_ARCH");

    let arch = match std::env::var("CARGO_CFG_BPF_TARGET_ARCH") {
        Ok(arch) => arch,
        Err(_) => {
            let host = std::env::var("HOST").unwrap_or_default();
            host.split('-').next().unwrap_or_default().to_string()
        }
    };
    println!("cargo:rustc-cfg=bpf_target_arch=\"{}\"", arch);
}
