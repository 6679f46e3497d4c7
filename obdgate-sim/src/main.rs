//! Host simulator for the obdgate CAN proxy
//!
//! Wires the proxy engine to two in-memory buses: a scan tool on bus A that
//! cycles through common OBD2 requests, and a mock engine ECU on bus B.
//!
//! Usage: cargo run -p obdgate-sim -- [OPTIONS]

mod rig;
mod telemetry;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::{info, warn, LevelFilter};
use obdgate_lib::responder::MONITOR_STATUS_ALL_READY;
use obdgate_lib::{
    CycleOutcome, Emulator, InterruptRegistry, Level, ProxyConfig, ProxyEngine, VirtualController,
};
use rig::{MockEcu, ScanTool};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use telemetry::TelemetryLogger;

type SimEngine = ProxyEngine<Arc<VirtualController>, Arc<VirtualController>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Forward between scan tool and ECU, answering some requests locally
    Proxy,
    /// Answer requests on a single bus, no ECU attached
    Emulator,
}

#[derive(Parser, Debug)]
#[command(name = "obdgate-sim")]
#[command(about = "Run the OBD2 CAN proxy against a simulated scan tool and ECU")]
struct Args {
    /// JSON configuration file (built-in defaults when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long, value_enum, default_value_t = Mode::Proxy)]
    mode: Mode,

    /// How long to run in seconds (0 = run forever)
    #[arg(short, long, default_value = "10")]
    duration: u64,

    /// Interval between scan tool requests in milliseconds
    #[arg(short, long, default_value = "100")]
    interval: u64,

    /// Hold the responder enable input low so every request is forwarded
    #[arg(long)]
    gate_low: bool,

    /// Report every readiness monitor as complete in mode 01 PID 01 replies
    #[arg(long)]
    all_monitors_ready: bool,

    /// Log per-frame detail regardless of the configured level
    #[arg(short, long)]
    verbose: bool,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    print_config: bool,
}

fn load_config(path: Option<&PathBuf>) -> Result<ProxyConfig> {
    let Some(path) = path else {
        return Ok(ProxyConfig::default());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    ProxyConfig::from_json(&json).with_context(|| format!("parsing config {}", path.display()))
}

/// Outer scheduling: run time limit plus periodic status dumps.
struct Schedule {
    started: Instant,
    duration: Duration,
    stats_interval: Duration,
    last_dump: Instant,
}

impl Schedule {
    fn new(duration: Duration, stats_interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            duration,
            stats_interval,
            last_dump: now,
        }
    }

    fn running(&self) -> bool {
        self.duration.is_zero() || self.started.elapsed() < self.duration
    }

    fn stats_due(&mut self) -> bool {
        if self.last_dump.elapsed() < self.stats_interval {
            return false;
        }
        info!("=== OBD-II CAN Proxy Status ===");
        self.last_dump = Instant::now();
        true
    }
}

/// Nothing happened this cycle; let the producer threads run.
fn idle() {
    std::thread::sleep(Duration::from_millis(1));
}

fn log_proxy_stats(engine: &SimEngine) {
    engine.log_stats();
    engine.bus_a().log_stats();
    engine.bus_b().log_stats();
}

fn run_proxy(config: &ProxyConfig, args: &Args) -> Result<()> {
    let registry = InterruptRegistry::new();
    let bus_a = Arc::new(VirtualController::new(config.bus_a.instance_id));
    let bus_b = Arc::new(VirtualController::new(config.bus_b.instance_id));
    bus_b.set_peer(MockEcu::new().into_peer());

    let mut engine: SimEngine = ProxyEngine::new(config, Arc::clone(&bus_a), bus_b, &registry)
        .context("building proxy engine")?;
    engine.log_hardware_status();
    if let Err(e) = engine.begin() {
        let status = e.status_code();
        return Err(e).with_context(|| format!("starting proxy (status {status})"));
    }

    if config.responder.enabled {
        let gate = engine
            .activate_responder(config.responder.enable_pin)
            .context("activating responder")?;
        if args.gate_low {
            gate.set_level(Level::Low);
        }
    }

    let scan_tool = ScanTool::spawn(Arc::clone(&bus_a), Duration::from_millis(args.interval));
    let mut schedule = Schedule::new(
        Duration::from_secs(args.duration),
        Duration::from_millis(config.stats_interval_ms),
    );
    while schedule.running() {
        if engine.poll() == CycleOutcome::Idle {
            idle();
        }
        if schedule.stats_due() {
            log_proxy_stats(&engine);
        }
    }

    let requests = scan_tool.stop();
    info!(
        "Simulation finished: {requests} requests, {} replies on {}, {} stray interrupts",
        bus_a.transmitted().len(),
        engine.bus_a().name(),
        registry.stray_interrupts()
    );
    log_proxy_stats(&engine);
    engine.end();
    Ok(())
}

fn run_emulator(config: &ProxyConfig, args: &Args) -> Result<()> {
    let registry = InterruptRegistry::new();
    let bus = Arc::new(VirtualController::new(config.bus_a.instance_id));
    let mut emulator = Emulator::new(
        config.bus_a.clone(),
        &config.responder,
        Arc::clone(&bus),
        config.buffer_capacity,
        config.settle_delay_us,
        &registry,
    )
    .context("building emulator")?;
    emulator.begin().context("starting emulator")?;

    let scan_tool = ScanTool::spawn(Arc::clone(&bus), Duration::from_millis(args.interval));
    let mut schedule = Schedule::new(
        Duration::from_secs(args.duration),
        Duration::from_millis(config.stats_interval_ms),
    );
    while schedule.running() {
        if !emulator.poll().is_handled() {
            idle();
        }
        if schedule.stats_due() {
            emulator.stream().log_stats();
        }
    }

    let requests = scan_tool.stop();
    info!(
        "Simulation finished: {requests} requests, {} answered, {} stray interrupts",
        bus.transmitted().len(),
        registry.stray_interrupts()
    );
    emulator.end();
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = load_config(args.config.as_ref())?;
    if args.all_monitors_ready {
        config.responder.monitor_status = Some(MONITOR_STATUS_ALL_READY);
    }

    if args.print_config {
        println!("{}", config.to_json());
        return Ok(());
    }

    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        config.log_level.as_level_filter()
    };
    TelemetryLogger::new(Box::new(std::io::stderr()), level)
        .install()
        .context("installing logger")?;

    info!("Starting up OBD-II CAN proxy simulator ({:?} mode)", args.mode);
    if !config.responder.enabled && args.gate_low {
        warn!("--gate-low has no effect with the responder disabled");
    }

    match args.mode {
        Mode::Proxy => run_proxy(&config, &args),
        Mode::Emulator => run_emulator(&config, &args),
    }
}
