//! Attaching to Go's `crypto/tls` in statically linked Go binaries.
//!
//! Entry probes go on the function symbols. The read return cannot use a
//! uretprobe (the Go runtime moves and grows goroutine stacks, which
//! corrupts the trampoline), so a plain uprobe is placed on every `RET`
//! instruction inside `(*Conn).Read` instead.

use std::{fs, path::Path};

use anyhow::{Context, Result, bail};
use aya::Ebpf;
use iced_x86::{Decoder, DecoderOptions, Mnemonic};
use log::{info, warn};
use object::{Architecture, Object, ObjectSection, ObjectSymbol};

use crate::probes::{UprobeSite, attach_uprobe};

pub const GO_TLS_WRITE_SYMBOL: &str = "crypto/tls.(*Conn).Write";
pub const GO_TLS_READ_SYMBOL: &str = "crypto/tls.(*Conn).Read";

pub const GO_TLS_WRITE_PROGRAM: &str = "go_tls_write_enter";
pub const GO_TLS_READ_PROGRAM: &str = "go_tls_read_enter";
pub const GO_TLS_READ_RETURN_PROGRAM: &str = "go_tls_read_return";

const AARCH64_RET: u32 = 0xd65f_03c0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoArch {
    X86_64,
    Aarch64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoBinaryInfo {
    pub arch: GoArch,
    pub has_write: bool,
    /// Offsets of each `RET` from the start of `(*Conn).Read`; `None` when
    /// the read symbol is missing or its body cannot be decoded.
    pub read_return_offsets: Option<Vec<u64>>,
}

/// Offsets of `RET` instructions within a function body.
pub fn find_return_offsets(arch: GoArch, code: &[u8]) -> Result<Vec<u64>> {
    match arch {
        GoArch::Aarch64 => Ok(code
            .chunks_exact(4)
            .enumerate()
            .filter(|(_, insn)| u32::from_le_bytes([insn[0], insn[1], insn[2], insn[3]]) == AARCH64_RET)
            .map(|(i, _)| (i * 4) as u64)
            .collect()),
        GoArch::X86_64 => x86_64_return_offsets(code),
    }
}

/// Variable-length encoding: walk instruction boundaries so a `0xC3` inside
/// an operand is never mistaken for a return.
fn x86_64_return_offsets(code: &[u8]) -> Result<Vec<u64>> {
    let mut decoder = Decoder::with_ip(64, code, 0, DecoderOptions::NONE);
    let mut offsets = Vec::new();
    for insn in &mut decoder {
        if insn.is_invalid() {
            bail!("Undecodable instruction at offset {:#x}", insn.ip());
        }
        if insn.mnemonic() == Mnemonic::Ret {
            offsets.push(insn.ip());
        }
    }
    Ok(offsets)
}

/// Inspects an ELF file. Returns `Ok(None)` if it is not a Go binary.
pub fn inspect_go_binary(path: &Path) -> Result<Option<GoBinaryInfo>> {
    let data = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    inspect_go_elf(&data).with_context(|| format!("Failed to parse {}", path.display()))
}

fn inspect_go_elf(data: &[u8]) -> Result<Option<GoBinaryInfo>> {
    let file = object::File::parse(data)?;

    let is_go = file.section_by_name(".go.buildinfo").is_some()
        || file.section_by_name(".gopclntab").is_some();
    if !is_go {
        return Ok(None);
    }

    let arch = match file.architecture() {
        Architecture::X86_64 => GoArch::X86_64,
        Architecture::Aarch64 => GoArch::Aarch64,
        other => bail!("Unsupported architecture {:?}", other),
    };

    let mut has_write = false;
    let mut read = None;
    for symbol in file.symbols() {
        match symbol.name() {
            Ok(GO_TLS_WRITE_SYMBOL) => has_write = true,
            Ok(GO_TLS_READ_SYMBOL) => read = Some((symbol.address(), symbol.size())),
            _ => {}
        }
    }

    let read_return_offsets = match read {
        Some((address, size)) => {
            let section = file
                .sections()
                .find(|s| address >= s.address() && address + size <= s.address() + s.size())
                .context("No section contains crypto/tls.(*Conn).Read")?;
            let start = (address - section.address()) as usize;
            let body = section
                .data()?
                .get(start..start + size as usize)
                .context("crypto/tls.(*Conn).Read body out of range")?;
            find_return_offsets(arch, body).ok()
        }
        None => None,
    };

    Ok(Some(GoBinaryInfo {
        arch,
        has_write,
        read_return_offsets,
    }))
}

/// Attaches the Go TLS probes to one binary. The read pair is attached only
/// if its return sites are known, so there are never dangling read entries.
pub fn attach_go_binary(bpf: &mut Ebpf, path: &str) -> Result<bool> {
    let Some(info) = inspect_go_binary(Path::new(path))? else {
        return Ok(false);
    };

    if info.has_write {
        attach_uprobe(bpf, UprobeSite::entry(GO_TLS_WRITE_PROGRAM, GO_TLS_WRITE_SYMBOL), path)?;
    } else {
        warn!("{} has no {} symbol (stripped?)", path, GO_TLS_WRITE_SYMBOL);
    }

    match info.read_return_offsets {
        Some(offsets) if !offsets.is_empty() => {
            attach_uprobe(bpf, UprobeSite::entry(GO_TLS_READ_PROGRAM, GO_TLS_READ_SYMBOL), path)?;
            for offset in &offsets {
                attach_uprobe(
                    bpf,
                    UprobeSite {
                        program_name: GO_TLS_READ_RETURN_PROGRAM,
                        symbol: GO_TLS_READ_SYMBOL,
                        offset: *offset,
                    },
                    path,
                )?;
            }
            info!(
                "Go TLS read probes attached to {} ({} return sites)",
                path,
                offsets.len()
            );
        }
        _ => warn!(
            "Skipping Go TLS read capture for {} ({:?}): return sites unavailable",
            path, info.arch
        ),
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arm_words(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn test_aarch64_return_offsets() {
        // stp, ret, mov, ret
        let code = arm_words(&[0xa9bf7bfd, AARCH64_RET, 0xaa0003e1, AARCH64_RET]);
        assert_eq!(find_return_offsets(GoArch::Aarch64, &code).unwrap(), vec![4, 12]);
    }

    #[test]
    fn test_aarch64_ignores_trailing_partial_word() {
        let mut code = arm_words(&[AARCH64_RET]);
        code.extend_from_slice(&[0xc0, 0x03]);
        assert_eq!(find_return_offsets(GoArch::Aarch64, &code).unwrap(), vec![0]);
    }

    #[test]
    fn test_x86_64_ret_inside_operand_is_ignored() {
        // mov eax, 0xc3; ret
        let code = [0xb8, 0xc3, 0x00, 0x00, 0x00, 0xc3];
        assert_eq!(find_return_offsets(GoArch::X86_64, &code).unwrap(), vec![5]);
    }

    #[test]
    fn test_x86_64_return_offsets() {
        // push rbp; ret; xor eax, eax; ret 8
        let code = [0x55, 0xc3, 0x31, 0xc0, 0xc2, 0x08, 0x00];
        assert_eq!(find_return_offsets(GoArch::X86_64, &code).unwrap(), vec![1, 4]);
    }

    #[test]
    fn test_x86_64_truncated_body_is_an_error() {
        // mov eax, imm32 cut short
        assert!(find_return_offsets(GoArch::X86_64, &[0xc3, 0xb8, 0xc3]).is_err());
    }

    #[test]
    fn test_non_elf_is_rejected() {
        assert!(inspect_go_elf(b"not an elf").is_err());
    }

    #[test]
    fn test_non_go_binary_is_skipped() {
        // The test runner itself is a Rust ELF without Go sections
        let exe = std::env::current_exe().unwrap();
        assert_eq!(inspect_go_binary(&exe).unwrap(), None);
    }
}
