use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/sktrace/sktrace.toml";
const ENV_CONFIG_PATH: &str = "SKTRACE_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub tracer: TracerConfig,
    #[serde(default)]
    pub control: ControlConfig,
}

impl Config {
    /// Load configuration from file. The path can be overridden with
    /// the `SKTRACE_CONFIG` environment variable. A missing or broken
    /// file falls back to defaults.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&PathBuf::from(path))
    }

    pub fn load_from(path: &PathBuf) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TracerConfig {
    /// Compiled eBPF object to load.
    #[serde(default = "default_bpf_object")]
    pub bpf_object: String,
    /// Dispatcher worker threads, each owning one queue.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Perf ring size per CPU, in pages (power of two).
    #[serde(default = "default_perf_pages")]
    pub perf_pages: usize,
    /// Worker queue capacity (power of two).
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Socket-table capacity.
    #[serde(default = "default_max_socket_entries")]
    pub max_socket_entries: u32,
    /// Trace-table capacity.
    #[serde(default = "default_max_trace_entries")]
    pub max_trace_entries: u32,
    /// Socket entries above this trigger a reclaim pass.
    #[serde(default = "default_socket_map_reclaim")]
    pub socket_map_max_reclaim: u32,
    /// Loopback port the offset-inference driver listens on.
    #[serde(default = "default_infer_port")]
    pub offset_infer_port: u16,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            bpf_object: default_bpf_object(),
            worker_threads: default_worker_threads(),
            perf_pages: default_perf_pages(),
            queue_size: default_queue_size(),
            max_socket_entries: default_max_socket_entries(),
            max_trace_entries: default_max_trace_entries(),
            socket_map_max_reclaim: default_socket_map_reclaim(),
            offset_infer_port: default_infer_port(),
        }
    }
}

fn default_bpf_object() -> String {
    "/usr/lib/sktrace/sktrace-ebpf".to_string()
}
fn default_worker_threads() -> usize {
    4
}
fn default_perf_pages() -> usize {
    128
}
fn default_queue_size() -> usize {
    65536
}
fn default_max_socket_entries() -> u32 {
    524_288
}
fn default_max_trace_entries() -> u32 {
    65_536
}
fn default_socket_map_reclaim() -> u32 {
    450_000
}
fn default_infer_port() -> u16 {
    54583
}

#[derive(Debug, Deserialize, Clone)]
pub struct ControlConfig {
    #[serde(default = "default_control_path")]
    pub socket_path: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            socket_path: default_control_path(),
        }
    }
}

fn default_control_path() -> String {
    "/var/run/sktrace.sock".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.tracer.queue_size.is_power_of_two());
        assert!(config.tracer.perf_pages.is_power_of_two());
        assert!(config.tracer.socket_map_max_reclaim < config.tracer.max_socket_entries);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [tracer]
            worker_threads = 8
            offset_infer_port = 40000

            [control]
            socket_path = "/tmp/skt.sock"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.tracer.worker_threads, 8);
        assert_eq!(parsed.tracer.offset_infer_port, 40000);
        assert_eq!(parsed.tracer.max_socket_entries, 524_288);
        assert_eq!(parsed.control.socket_path, "/tmp/skt.sock");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load_from(&PathBuf::from("/nonexistent/sktrace.toml"));
        assert_eq!(config.tracer.worker_threads, default_worker_threads());
    }
}
