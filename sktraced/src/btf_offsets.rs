//! Kernel-struct offsets from BTF.
//!
//! On kernels that expose `/sys/kernel/btf/vmlinux` the runtime
//! inference pass is unnecessary: the four offsets the probes need are
//! resolved here at startup, broadcast to every CPU slot and marked
//! ready before the first event fires.

use anyhow::{anyhow, Context, Result};
use btf::btf::{Btf, Struct, Type};
use sktrace_common::MemberOffsets;
use std::env;

const KERNEL_BTF_PATH: &str = "/sys/kernel/btf/vmlinux";
const ENV_KERNEL_BTF_PATH: &str = "SKTRACE_KERNEL_BTF";

/// Derive the offset table from kernel BTF. Fails on kernels without
/// BTF, in which case the caller falls back to runtime inference.
pub fn derive_member_offsets() -> Result<MemberOffsets> {
    let btf_path = env::var(ENV_KERNEL_BTF_PATH).unwrap_or_else(|_| KERNEL_BTF_PATH.to_string());
    let btf = Btf::from_file(btf_path).context("failed to load kernel BTF metadata")?;

    let task_struct = expect_named_struct(&btf, "task_struct")?;
    let (files_bits, _) = member_offset(task_struct, "files")?;

    let sock = expect_named_struct(&btf, "sock")?;
    let (sk_type_bits, _) = member_offset(sock, "sk_type")?;

    let tcp_sock = expect_named_struct(&btf, "tcp_sock")?;
    let (copied_seq_bits, _) = member_offset(tcp_sock, "copied_seq")?;
    let (write_seq_bits, _) = member_offset(tcp_sock, "write_seq")?;

    let mut offsets = MemberOffsets::zeroed();
    offsets.task_files = to_bytes(files_bits)?;
    // The probes read a 32-bit word whose upper half is `sk_type`;
    // anchor it two bytes before the member.
    offsets.sock_flags = to_bytes(sk_type_bits)?
        .checked_sub(2)
        .ok_or_else(|| anyhow!("sock.sk_type offset too small: {sk_type_bits} bits"))?;
    offsets.tcp_copied_seq = to_bytes(copied_seq_bits)?;
    offsets.tcp_write_seq = to_bytes(write_seq_bits)?;
    offsets.ready = 1;

    Ok(offsets)
}

fn expect_named_struct<'a>(btf: &'a Btf, name: &str) -> Result<&'a Struct> {
    let ty = btf
        .get_type_by_name(name)
        .with_context(|| format!("type {name} not found in BTF"))?;
    match &ty.base_type {
        Type::Struct(st) => Ok(st),
        other => Err(anyhow!("type {name} is not a struct (found {:?})", other)),
    }
}

fn member_offset(st: &Struct, name: &str) -> Result<(u32, u32)> {
    st.members
        .iter()
        .find(|member| member.name.as_deref() == Some(name))
        .map(|member| (member.offset, member.type_id))
        .ok_or_else(|| anyhow!("member {name} not found"))
}

fn to_bytes(bits: u32) -> Result<u32> {
    if bits % 8 == 0 {
        Ok(bits / 8)
    } else {
        Err(anyhow!("member offset {bits} is not byte aligned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_bytes_requires_byte_alignment() {
        assert_eq!(to_bytes(0).unwrap(), 0);
        assert_eq!(to_bytes(0x790 * 8).unwrap(), 0x790);
        assert!(to_bytes(3).is_err());
    }
}
