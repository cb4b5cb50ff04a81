#![cfg_attr(all(feature = "bpf", not(feature = "user")), no_std)]

//! Shared definitions for the sktrace socket tracer.
//!
//! Everything the kernel programs and the user-space daemon must agree
//! on lives here: the capture-record wire layout, the map value types,
//! the per-CPU id allocator, the protocol-inference contract and the
//! socket/trace tracking policy. The policy is deliberately pure code
//! so the syscall hooks execute it in eBPF context and the user-space
//! test suite can drive the exact same logic against plain hash maps.

pub mod batch;
pub mod inference;
pub mod policy;
pub mod types;

pub use types::*;
