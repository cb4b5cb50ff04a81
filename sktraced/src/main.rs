use anyhow::Result;
use clap::Parser;
use log::{debug, info, warn};
use sktrace_common::{direction, l7_proto, msg_type};
use sktraced::dispatch::{CapturedData, L7Handler};
use sktraced::events::ExtraEventRegistry;
use sktraced::{control, Config, SocketTracer};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "sktraced")]
#[command(about = "Socket-level L7 protocol tracer")]
struct Args {
    /// Path to config file
    #[arg(long, value_name = "PATH", default_value = "/etc/sktrace/sktrace.toml")]
    config: PathBuf,
    /// Override the compiled eBPF object path
    #[arg(long, value_name = "PATH")]
    bpf_object: Option<String>,
    /// Print every captured message at info level
    #[arg(long)]
    print: bool,
}

fn msg_type_label(msg: u8) -> &'static str {
    match msg {
        msg_type::REQUEST => "request",
        msg_type::RESPONSE => "response",
        _ => "unknown",
    }
}

fn capture_handler(print: bool) -> L7Handler {
    Arc::new(move |data: CapturedData| {
        let arrow = if data.direction == direction::EGRESS {
            "->"
        } else {
            "<-"
        };
        if print {
            let sport = data.tuple.num;
            let dport = data.tuple.dport;
            info!(
                "{} [{}] {} {} sport={} dport={} seq={} trace={} len={} payload={}B",
                data.process_name_str(),
                l7_proto::name(data.protocol),
                msg_type_label(data.msg_type),
                arrow,
                sport,
                dport,
                data.capture_seq,
                data.thread_trace_id,
                data.syscall_len,
                data.payload.len(),
            );
        } else {
            debug!(
                "capture socket={:#x} proto={} seq={}",
                data.socket_id,
                l7_proto::name(data.protocol),
                data.capture_seq
            );
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = Config::load_from(&args.config);
    if let Some(object) = args.bpf_object {
        config.tracer.bpf_object = object;
    }

    let registry = Arc::new(ExtraEventRegistry::new());
    let tracer = SocketTracer::run(config.tracer.clone(), capture_handler(args.print), registry)?;
    info!("socket tracer loaded; adapting to the running kernel");

    let provider = control::tracer_provider(tracer.clone());
    let socket_path = config.control.socket_path.clone();
    tokio::spawn(async move {
        if let Err(e) = control::serve(socket_path, provider).await {
            warn!("control socket terminated: {e}");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    if let Err(e) = tracer.stop() {
        warn!("stop failed: {e}");
    }
    Ok(())
}
