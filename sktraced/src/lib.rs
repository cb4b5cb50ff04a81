//! User-space core of the sktrace socket tracer.
//!
//! The daemon loads the syscall probes, adapts them to the running
//! kernel (BTF relocation or runtime offset inference), drains the
//! per-CPU perf rings, splits socket-data batches into per-record
//! work items hashed across worker queues, reclaims stale table
//! entries and exposes counters over a control socket.

pub mod adapt;
pub mod boot_time;
pub mod btf_offsets;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod reclaim;
pub mod stats;
pub mod tracer;

pub use config::Config;
pub use dispatch::{CapturedData, L7Handler, PayloadSlice};
pub use error::TracerError;
pub use tracer::{find_tracer, SocketTracer, TracerState, SK_TRACER_NAME};

/// Wrapper granting `aya::Pod` to the shared map value types. The
/// orphan rule keeps the impl out of `sktrace-common`, so map handles
/// use `MapValue<T>` as their value type.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default)]
pub struct MapValue<T>(pub T);

// SAFETY: `bytemuck::Pod` already guarantees the plain-old-data
// contract aya requires.
unsafe impl<T: bytemuck::Pod> aya::Pod for MapValue<T> {}
