use anyhow::Result;
use aya::Ebpf;
use log::debug;

use crate::probes::{UprobeSite, attach_uprobe};

pub const SSL_WRITE_PROGRAM: &str = "ssl_write";
pub const SSL_WRITE_EX_PROGRAM: &str = "ssl_write_ex";
pub const SSL_READ_PROGRAM: &str = "ssl_read_enter";
pub const SSL_READ_EX_PROGRAM: &str = "ssl_read_ex_enter";
pub const SSL_READ_RETURN_PROGRAM: &str = "ssl_read_return";

/// Attaches the OpenSSL probes to one libssl.
///
/// `SSL_write`/`SSL_read` are required. The `_ex` variants only exist in
/// OpenSSL 1.1.1+, so failing to attach them is not an error.
pub fn attach_libssl(bpf: &mut Ebpf, libssl_path: &str) -> Result<()> {
    attach_uprobe(bpf, UprobeSite::entry(SSL_WRITE_PROGRAM, "SSL_write"), libssl_path)?;
    // Returns go in before entries so an entry never lacks its pair
    attach_uprobe(bpf, UprobeSite::entry(SSL_READ_RETURN_PROGRAM, "SSL_read"), libssl_path)?;
    attach_uprobe(bpf, UprobeSite::entry(SSL_READ_PROGRAM, "SSL_read"), libssl_path)?;

    if let Err(e) = attach_uprobe(bpf, UprobeSite::entry(SSL_WRITE_EX_PROGRAM, "SSL_write_ex"), libssl_path) {
        debug!("{:#}", e);
    }
    match attach_uprobe(bpf, UprobeSite::entry(SSL_READ_RETURN_PROGRAM, "SSL_read_ex"), libssl_path) {
        Ok(()) => attach_uprobe(bpf, UprobeSite::entry(SSL_READ_EX_PROGRAM, "SSL_read_ex"), libssl_path)?,
        Err(e) => debug!("{:#}", e),
    }

    Ok(())
}
