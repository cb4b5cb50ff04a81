use thiserror::Error;

/// Fatal startup failures. Everything per-event is recovered locally
/// by counting and dropping; only these abort the tracer, which then
/// stays in INIT.
#[derive(Debug, Error)]
pub enum TracerError {
    #[error("kernel {major}.{minor} is below the supported minimum 4.14")]
    KernelTooOld { major: u32, minor: u32 },

    #[error("failed to load eBPF object: {0}")]
    LoadFailed(String),

    #[error("map configuration failed: {0}")]
    MapConfig(String),

    #[error("probe attach failed for {symbol}: {reason}")]
    AttachFailed { symbol: String, reason: String },

    #[error("offset-inference driver failed: {0}")]
    InferenceDriverFailed(String),
}
