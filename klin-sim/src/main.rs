//! KLIN Sim - Fleet coordination harness
//!
//! This CLI drives simulated KLIN fleets:
//! - `run` - Run one scenario on a discrete clock and check it
//! - `suite` - Run every scenario and report pass/fail
//! - `live` - Run a fleet in wall-clock time and log what happens

mod fault_injection;
mod kinematics;
mod report;
mod scenarios;
mod world;

use clap::{Parser, Subcommand};
use fault_injection::{CrashPlan, FaultConfig};
use kinematics::MotionKind;
use klin_core::FleetConfig;
use report::{RunReport, SuiteReport};
use scenarios::{ScenarioError, ScenarioKind, ScenarioOptions, SafetyKind};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::interval;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use world::{Layout, World};

#[derive(Parser)]
#[command(name = "klin")]
#[command(about = "Simulation harness for KLIN fleet coordination")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Fleet settings shared by all commands
#[derive(clap::Args, Debug)]
struct FleetArgs {
    /// JSON fleet config; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of agents
    #[arg(short, long)]
    agents: Option<usize>,

    /// Disable the slot auction
    #[arg(long)]
    no_auction: bool,

    /// Tick length in milliseconds
    #[arg(long, default_value = "50")]
    dt_ms: u64,

    /// Fraction of messages to drop
    #[arg(long, default_value = "0.0")]
    loss: f64,

    /// Seed for message loss and the initial layout
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Safety filter applied to every command
    #[arg(long, value_enum, default_value = "ttc")]
    safety: SafetyKind,
}

impl FleetArgs {
    fn fleet_config(&self) -> Result<FleetConfig, ScenarioError> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => FleetConfig::default(),
        };
        if let Some(n) = self.agents {
            config.fleet_size = n;
        }
        if self.no_auction {
            config = config.with_auction(false);
        }
        config.validate()?;
        Ok(config)
    }

    fn options(&self) -> Result<ScenarioOptions, ScenarioError> {
        let layout = match Layout::default() {
            Layout::Scatter { min, max, .. } => Layout::Scatter {
                min,
                max,
                seed: self.seed,
            },
            other => other,
        };
        Ok(ScenarioOptions {
            config: self.fleet_config()?,
            dt: Duration::from_millis(self.dt_ms),
            layout,
            safety: self.safety,
            faults: FaultConfig::lossy(self.loss, self.seed),
            ..Default::default()
        })
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run one scenario on a discrete clock
    Run {
        /// Scenario to run
        #[arg(short, long, value_enum, default_value = "settle")]
        scenario: ScenarioKind,

        /// Main phase length in seconds (scenario default if omitted)
        #[arg(short, long)]
        duration: Option<f64>,

        /// Leader motion (scenario default if omitted)
        #[arg(short, long, value_enum)]
        motion: Option<MotionKind>,

        /// Path to write the JSON run report
        #[arg(short, long)]
        report: Option<PathBuf>,

        #[command(flatten)]
        fleet: FleetArgs,
    },

    /// Run every scenario
    Suite {
        /// Comma-separated scenario names (all if omitted)
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,

        /// Output directory for per-scenario reports
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Output JUnit XML file
        #[arg(long)]
        junit_xml: Option<PathBuf>,

        #[command(flatten)]
        fleet: FleetArgs,
    },

    /// Run a fleet in wall-clock time
    Live {
        /// How long to run, in seconds
        #[arg(short, long, default_value = "20")]
        duration: f64,

        /// Leader motion
        #[arg(short, long, value_enum, default_value = "circle")]
        motion: MotionKind,

        /// Crash whoever leads at this many seconds in
        #[arg(long)]
        crash_leader_at: Option<f64>,

        #[command(flatten)]
        fleet: FleetArgs,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run {
            scenario,
            duration,
            motion,
            report,
            fleet,
        } => {
            let mut opts = fleet.options()?;
            opts.duration = duration.map(seconds).transpose()?;
            opts.motion = motion;

            let outcome = scenarios::run(scenario, &opts)?;
            let run_report = RunReport::from(&outcome);
            run_report.print_summary();

            if let Some(path) = report {
                run_report.write_json(&path)?;
            }

            if !outcome.passed() {
                return Err(ScenarioError::ChecksFailed {
                    failed: outcome.failed_checks(),
                }
                .into());
            }
        }

        Commands::Suite {
            only,
            output_dir,
            junit_xml,
            fleet,
        } => {
            let kinds = if only.is_empty() {
                ScenarioKind::ALL.to_vec()
            } else {
                only.iter()
                    .map(|name| name.trim().parse())
                    .collect::<Result<Vec<ScenarioKind>, _>>()?
            };
            info!("Running {} scenario(s)", kinds.len());

            let opts = fleet.options()?;
            let mut suite = SuiteReport::default();
            let mut failed_checks = 0;
            for kind in kinds {
                let outcome = scenarios::run(kind, &opts)?;
                failed_checks += outcome.failed_checks();
                let run_report = RunReport::from(&outcome);
                run_report.print_summary();
                suite.push(run_report);
            }

            println!("\nScenario Suite Results:");
            println!("  Total: {}", suite.total);
            println!("  Passed: {}", suite.passed);
            println!("  Failed: {}", suite.failed);

            if let Some(dir) = output_dir {
                suite.write_dir(&dir)?;
            }
            if let Some(xml_path) = junit_xml {
                std::fs::write(&xml_path, suite.to_junit_xml())?;
                info!("JUnit XML written to: {}", xml_path.display());
            }

            if suite.failed > 0 {
                return Err(ScenarioError::ChecksFailed {
                    failed: failed_checks,
                }
                .into());
            }
        }

        Commands::Live {
            duration,
            motion,
            crash_leader_at,
            fleet,
        } => {
            let opts = fleet.options()?;
            let duration = seconds(duration)?;
            let crash = crash_leader_at
                .map(seconds)
                .transpose()?
                .map(CrashPlan::leader_at);
            live(opts, motion, duration, crash).await?;
        }
    }

    Ok(())
}

/// Drive a wall-clock world from a tokio interval
async fn live(
    opts: ScenarioOptions,
    motion: MotionKind,
    duration: Duration,
    mut crash: Option<CrashPlan>,
) -> Result<(), ScenarioError> {
    if opts.dt.is_zero() {
        return Err(ScenarioError::InvalidOptions("dt must be positive".into()));
    }

    let mut world = World::realtime(opts.config.clone(), opts.layout, motion, opts.safety.build())?;
    opts.faults.install(world.context_mut().bus_mut());
    info!(
        "Live run {}: {} agents for {:.1}s",
        world.context().run_id(),
        opts.config.fleet_size,
        duration.as_secs_f64()
    );

    let mut ticker = interval(opts.dt);
    let mut last_leaders = None;
    while world.now() < duration {
        ticker.tick().await;

        if let Some(plan) = crash.filter(|p| world.now() >= p.at) {
            let live = world.live_ids();
            let leader = live.first().and_then(|id| world.context().leader_of(*id));
            match plan.victim(&live, leader) {
                Some(id) => {
                    world.crash(id);
                }
                None => warn!("Live: no agent to crash"),
            }
            crash = None;
        }

        let tick = world.step(opts.dt);
        let leaders = tick.leaders();
        if last_leaders.as_ref() != Some(&leaders) {
            info!("Live: {:.2}s leaders {:?}", tick.time.as_secs_f64(), leaders);
            last_leaders = Some(leaders);
        }
    }

    let metrics = world.context().metrics_report();
    println!("{}", metrics.export_json()?);
    Ok(())
}

fn load_config(path: &Path) -> Result<FleetConfig, ScenarioError> {
    let text = std::fs::read_to_string(path)?;
    let config = FleetConfig::from_json(&text)?;
    info!("Loaded fleet config from {}", path.display());
    Ok(config)
}

fn seconds(value: f64) -> Result<Duration, ScenarioError> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| ScenarioError::InvalidOptions(format!("bad duration {}: {}", value, e)))
}
