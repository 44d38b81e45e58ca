use anyhow::{bail, Context};
use clap::Parser;
use pdp::config::{Config, LogLevel, TraceMode};
use pdp::coordinator::Coordinator;
use pdp::tracer::{self, ExecutionTracer};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file [default: ~/.config/pdp/config.toml]
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host that runs the debugged program, helper commands go there through ssh
    #[arg(long, env = "PDP_HOST")]
    host: Option<String>,

    /// GDB executable
    #[arg(long)]
    gdb: Option<PathBuf>,

    /// Record every system call outcome into a trace file
    #[arg(long, conflicts_with = "replay")]
    record: Option<PathBuf>,

    /// Replay a trace file instead of talking to real peers
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Descriptor carrying editor messages
    #[arg(long, default_value_t = 0)]
    input_fd: RawFd,

    /// Descriptor for messages to the editor
    #[arg(long, default_value_t = 1)]
    output_fd: RawFd,

    #[arg(long)]
    log_level: Option<LogLevel>,

    /// Program to debug
    program: Option<String>,
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => {
            Config::from_file(path).with_context(|| format!("read config {}", path.display()))?
        }
        None => match Config::default_path().filter(|p| p.exists()) {
            Some(path) => Config::from_file(&path)
                .with_context(|| format!("read config {}", path.display()))?,
            None => Config::default(),
        },
    };

    if let Some(host) = &args.host {
        config.host = Some(host.clone());
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    match &args.gdb {
        Some(gdb) => config.gdb = gdb.clone(),
        None if !config.gdb.exists() => {
            config.gdb = which::which("gdb").context("gdb is not found in PATH")?;
        }
        None => {}
    }
    config.trace = match (&args.record, &args.replay) {
        (Some(path), _) => TraceMode::Record(path.clone()),
        (_, Some(path)) => TraceMode::Replay(path.clone()),
        _ => TraceMode::Normal,
    };
    Ok(config)
}

/// Own a duplicate of an inherited descriptor.
fn adopt_fd(fd: RawFd) -> anyhow::Result<OwnedFd> {
    let dup = nix::unistd::dup(fd).with_context(|| format!("duplicate descriptor {fd}"))?;
    // SAFETY: `dup` returned a fresh descriptor nobody else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    pdp::log::init(config.log_level.into()).context("install logger")?;

    let tracer = match &config.trace {
        TraceMode::Normal => ExecutionTracer::normal(),
        TraceMode::Record(path) => ExecutionTracer::record(path)
            .with_context(|| format!("open trace {}", path.display()))?,
        TraceMode::Replay(path) => ExecutionTracer::replay(path)
            .with_context(|| format!("map trace {}", path.display()))?,
    };
    tracer::install(tracer);

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::Release))
            .context("install interrupt handler")?;
    }

    let mut coordinator = Coordinator::new(
        &config,
        args.program.as_deref(),
        adopt_fd(args.input_fd)?,
        adopt_fd(args.output_fd)?,
    )
    .context("start coordinator")?;
    log::info!(target: "pdp", "Debugging {}", args.program.as_deref().unwrap_or("nothing"));

    while !stop.load(Ordering::Acquire) && coordinator.is_running() {
        if let Err(e) = coordinator.poll(config.poll_timeout) {
            log::error!(target: "pdp", "Core loop stopped: {e}");
            break;
        }
    }

    if !coordinator.is_idle() {
        coordinator.print_activity();
    }
    coordinator.shutdown();
    if matches!(config.trace, TraceMode::Replay(_)) && !tracer::with(|t| t.check_end_of_stream()) {
        bail!("replay stopped before the end of the trace");
    }
    Ok(())
}
