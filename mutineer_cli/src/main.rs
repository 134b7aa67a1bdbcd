use mutineer_core::config::{FuzzerSettings, MutineerConfig, SessionFile, parse_fuzz_targets};
use mutineer_core::executor::{ExecutorOptions, NetworkExecutor};
use mutineer_core::findings::FINDINGS_FILE;
use mutineer_core::fuzzer::{FuzzError, FuzzLoop, FuzzSummary, LoopOptions};
use mutineer_core::hooks::{DefaultExceptionProcessor, PassthroughProcessor};
use mutineer_core::monitor::{Monitor, NullMonitor, StopHandle};
use mutineer_core::mutator::MutationGateway;
use mutineer_core::scheduler::Scheduler;
use mutineer_core::session::Session;
use mutineer_core::transport::Transport;

use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Directory used for packet dumps when no log directory is configured.
const DEFAULT_DUMP_DIR: &str = "dumpraw";
const DEFAULT_CONFIG_FILE: &str = "mutineer.toml";
const LAST_CASE_FILE: &str = "last-case.json";

/// Replay a recorded network session against a target, mutating it on every run.
#[derive(Parser, Debug)]
#[command(name = "mutineer")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Session definition (TOML)
    session: PathBuf,

    #[arg(short, long, value_parser)]
    config_file: Option<PathBuf>,

    /// Target host: IPv4, IPv6, a local socket path or an interface name
    #[arg(short = 'i', long)]
    target_host: Option<String>,

    /// Overrides the session's port
    #[arg(short, long)]
    port: Option<u16>,

    /// Run range: X, X- or X-Y
    #[arg(short, long, group = "seeds")]
    range: Option<String>,

    /// Loop over a seed list: X, X-Y or X,Y,Z-Q
    #[arg(short = 'l', long = "loop", group = "seeds")]
    seed_loop: Option<String>,

    /// Rotate the fuzzed message every N runs
    #[arg(short = 'R', long)]
    round_robin: Option<u64>,

    /// Receive timeout in seconds, overriding the session's
    #[arg(short, long)]
    timeout: Option<f64>,

    /// Messages to fuzz: x, x-y, x,y,z-Q or m.s
    #[arg(short, long)]
    messages_to_fuzz: Option<String>,

    /// Run a single seed and dump every packet
    #[arg(short, long, group = "seeds")]
    dump_raw: Option<u64>,

    /// Like --dump-raw, but without sending anything
    #[arg(short, long, group = "seeds")]
    emulate: Option<u64>,

    /// Seconds to sleep between runs
    #[arg(short, long)]
    sleep_time: Option<f64>,

    /// Start and stop a harness trace around the fuzz loop
    #[arg(short = 'H', long)]
    harness: bool,

    /// Directory for findings, packet dumps and the last case
    #[arg(short = 'L', long)]
    log_dir: Option<PathBuf>,

    /// Only log warnings and errors
    #[arg(short, long)]
    quiet: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn apply_overrides(&self, settings: &mut FuzzerSettings) {
        if let Some(host) = &self.target_host {
            settings.target_host = host.clone();
        }
        settings.port = self.port.or(settings.port);
        if self.range.is_some() {
            settings.range = self.range.clone();
        }
        if self.seed_loop.is_some() {
            settings.seed_loop = self.seed_loop.clone();
        }
        settings.round_robin = self.round_robin.or(settings.round_robin);
        settings.receive_timeout_secs = self.timeout.or(settings.receive_timeout_secs);
        if self.messages_to_fuzz.is_some() {
            settings.messages_to_fuzz = self.messages_to_fuzz.clone();
        }
        settings.dump_raw = self.dump_raw.or(settings.dump_raw);
        settings.emulate = self.emulate.or(settings.emulate);
        if let Some(secs) = self.sleep_time {
            settings.sleep_secs = secs;
        }
        settings.harness |= self.harness;
        if self.log_dir.is_some() {
            settings.log_dir = self.log_dir.clone();
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<MutineerConfig, anyhow::Error> {
    match path {
        Some(config_path) => {
            tracing::info!("Loading configuration from {config_path:?}");
            MutineerConfig::load_from_file(config_path)
        }
        None => {
            let default_config_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_config_path.exists() {
                tracing::info!("Loading default configuration from {default_config_path:?}");
                MutineerConfig::load_from_file(&default_config_path)
            } else {
                tracing::debug!("No configuration file, using built-in defaults");
                Ok(MutineerConfig::default())
            }
        }
    }
}

fn install_interrupt_handler(
    stop: StopHandle,
    monitor: &dyn Monitor,
) -> Result<(), anyhow::Error> {
    let crash_signal = monitor.crash_signal();
    ctrlc::set_handler(move || {
        if crash_signal.is_raised() {
            return;
        }
        if stop.is_stop_requested() {
            tracing::warn!("Second interrupt, exiting immediately");
            std::process::exit(130);
        }
        tracing::info!("Received interrupt signal (Ctrl+C), stopping after the current run");
        stop.request_stop();
    })
    .map_err(|e| anyhow::anyhow!("Failed to set Ctrl+C handler: {}", e))
}

fn dump_dir(settings: &FuzzerSettings) -> Option<PathBuf> {
    settings.single_seed()?;
    Some(
        settings
            .log_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DUMP_DIR)),
    )
}

fn write_last_case(
    dir: &Path,
    session: &Session,
    summary: &FuzzSummary,
) -> Result<(), anyhow::Error> {
    let Some(last) = &summary.last_fuzzed else {
        return Ok(());
    };
    let path = dir.join(LAST_CASE_FILE);
    let json = session.snapshot(Some(last)).to_json()?;
    std::fs::write(&path, json)
        .map_err(|e| anyhow::anyhow!("Failed to write last case to {:?}: {}", path, e))?;
    tracing::info!("Last fuzzed case written to {path:?}");
    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    let level = if cli.quiet { "warn" } else { cli.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let mut config = load_config(cli.config_file.as_ref())?;
    cli.apply_overrides(&mut config.fuzzer);
    let settings = &config.fuzzer;

    let (mode, bounds) = settings.schedule()?;
    let scheduler = Scheduler::new(mode, bounds)?;

    let mut session = Session::try_from(SessionFile::load_from_file(&cli.session)?)?;
    if let Some(port) = settings.port {
        session.port = port;
    }
    if let Some(list) = &settings.messages_to_fuzz {
        session.set_targets(parse_fuzz_targets(list)?)?;
    }
    tracing::info!(
        messages = session.len(),
        targets = session.targets().len(),
        proto = %session.proto,
        port = session.port,
        "Loaded session from {:?}",
        cli.session
    );

    let gateway = MutationGateway::new(config.engine.build()?);
    tracing::info!("Using mutation engine '{}'", gateway.engine_name());

    let dump_dir = dump_dir(settings);
    for dir in dump_dir.iter().chain(settings.log_dir.iter()) {
        std::fs::create_dir_all(dir)
            .map_err(|e| anyhow::anyhow!("Failed to create directory {:?}: {}", dir, e))?;
    }

    let stop = StopHandle::new();
    let monitor = NullMonitor::new(&settings.target_host, session.port);
    install_interrupt_handler(stop.clone(), &monitor)?;

    let executor = NetworkExecutor::new(
        Transport::new(settings.target_host.clone(), stop.clone()),
        gateway,
        Box::new(PassthroughProcessor),
        ExecutorOptions {
            receive_timeout: settings.receive_timeout()?,
            dump_dir,
            emulate: settings.emulate.is_some(),
        },
    );
    let mut fuzz = FuzzLoop::new(Box::new(executor), scheduler)
        .with_exception_processor(Box::new(DefaultExceptionProcessor))
        .with_monitor(Box::new(monitor))
        .with_options(LoopOptions {
            sleep_time: settings.sleep_time()?,
            harness_trace: settings.harness,
            findings_dir: settings.log_dir.clone(),
        })
        .with_stop_handle(stop);

    tracing::info!(target_host = %settings.target_host, "Starting fuzz loop");
    let start_time = Instant::now();
    let summary = match fuzz.run(&mut session) {
        Ok(summary) => summary,
        Err(FuzzError::Fatal {
            seed,
            source,
            summary,
        }) => {
            tracing::error!(
                seed,
                findings = summary.findings.len(),
                "Fuzz loop aborted after {} runs",
                summary.attempts
            );
            if let Some(dir) = &settings.log_dir {
                write_last_case(dir, &session, &summary)?;
            }
            return Err(anyhow::Error::new(source)
                .context(format!("Fatal error on seed {seed}")));
        }
        Err(e) => return Err(e.into()),
    };
    let elapsed_total = start_time.elapsed();

    tracing::info!(
        "Fuzz loop finished in {elapsed_total:.2?}: {} runs, {} findings, stopped: {:?}",
        summary.attempts,
        summary.findings.len(),
        summary.stop_reason
    );
    for finding in &summary.findings {
        tracing::warn!(
            kind = ?finding.kind,
            seed = finding.seed,
            run = finding.run,
            md5 = finding.message_md5.as_deref().unwrap_or("-"),
            "finding"
        );
    }

    if let Some(dir) = &settings.log_dir {
        if !summary.findings.is_empty() {
            tracing::info!("Findings written to {:?}", dir.join(FINDINGS_FILE));
        }
        write_last_case(dir, &session, &summary)?;
    }

    Ok(())
}
