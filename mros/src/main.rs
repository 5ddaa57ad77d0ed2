use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::*;
use mros_core::prelude::*;
use mros_core::{ClockMode, Group};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

/// Exit code when a dire system event ends the control loop
const EXIT_DIRE_EVENT: i32 = 3;
/// Exit code when the external clock stops ticking
const EXIT_CLOCK_LOSS: i32 = 4;

#[derive(Parser)]
#[command(name = "mros")]
#[command(about = "MROS - behaviour-based robot message core")]
#[command(version = "0.1.0")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control loop
    Run {
        /// YAML configuration file
        #[arg(short = 'c', long = "config", value_name = "FILE")]
        config: Option<PathBuf>,

        /// Stop after this many milliseconds (default: run until Ctrl+C)
        #[arg(short = 'd', long = "duration-ms")]
        duration_ms: Option<u64>,

        /// Exit when BATTERY_LOW or HIGH_TEMPERATURE is dispatched
        #[arg(long = "exit-on-dire-event")]
        exit_on_dire_event: bool,

        /// Drive the external clock from a local thread at this rate
        #[arg(long = "simulate-clock-hz", value_name = "HZ")]
        simulate_clock_hz: Option<f64>,

        /// Publish an event before the first tick (repeatable)
        #[arg(short = 'i', long = "inject", value_name = "EVENT")]
        inject: Vec<String>,

        /// Print final bus statistics as JSON
        #[arg(long = "stats-json")]
        stats_json: bool,
    },

    /// List the event table
    Events {
        /// Only events of this group (e.g. bumper, system)
        #[arg(short = 'g', long = "group")]
        group: Option<String>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mros=info,mros_core=info".into()),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = run_command(cli.command) {
        match e.downcast_ref::<MrosError>() {
            Some(MrosError::DireSystemEvent { event }) => {
                eprintln!("{} dire system event {}", "Exiting:".red().bold(), event);
                std::process::exit(EXIT_DIRE_EVENT);
            }
            Some(MrosError::ClockSourceLoss { waited }) => {
                eprintln!(
                    "{} external clock silent for {:?}",
                    "Clock lost:".red().bold(),
                    waited
                );
                std::process::exit(EXIT_CLOCK_LOSS);
            }
            _ => {
                eprintln!("{} {:#}", "Error:".red().bold(), e);
                std::process::exit(1);
            }
        }
    }
}

fn run_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run {
            config,
            duration_ms,
            exit_on_dire_event,
            simulate_clock_hz,
            inject,
            stats_json,
        } => {
            let mut config = match config {
                Some(path) => MrosConfig::from_file(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => MrosConfig::standard(),
            };
            if exit_on_dire_event {
                config.exit_on_dire_event = true;
            }
            if simulate_clock_hz.is_some() {
                config.clock.mode = ClockMode::External;
            }
            run_scheduler(
                config,
                duration_ms.map(Duration::from_millis),
                simulate_clock_hz,
                &inject,
                stats_json,
            )
        }
        Commands::Events { group } => list_events(group.as_deref()),
    }
}

/// Logs every dispatched event
struct Trace;

impl Behaviour for Trace {
    fn name(&self) -> &str {
        "trace"
    }

    fn execute(&mut self, message: &Message) -> MrosResult<()> {
        tracing::info!("dispatched {} {:?}", message.event(), message.payload());
        Ok(())
    }
}

fn run_scheduler(
    config: MrosConfig,
    duration: Option<Duration>,
    simulate_clock_hz: Option<f64>,
    inject: &[String],
    stats_json: bool,
) -> anyhow::Result<()> {
    let mut scheduler = Scheduler::from_config(config)?;
    scheduler.install_builtin_components()?;
    scheduler.add_behaviour(Box::new(Trace), Event::ALL);

    let stop = scheduler.stop_handle();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("{}", "\nCtrl+C received! Shutting down MROS...".red());
        stop.request_stop();
    }) {
        tracing::warn!("failed to set signal handler: {}", e);
    }

    if let (Some(hz), Some(signal)) = (simulate_clock_hz, scheduler.clock_signal()) {
        anyhow::ensure!(hz > 0.0, "--simulate-clock-hz must be positive");
        let period = Duration::from_secs_f64(1.0 / hz);
        thread::Builder::new()
            .name("mros-clock-sim".to_string())
            .spawn(move || loop {
                thread::sleep(period);
                signal.pulse();
            })?;
        tracing::info!("simulating external clock at {} Hz", hz);
    }

    for name in inject {
        let event: Event = name.parse()?;
        scheduler.bus().publish(event, Payload::Empty)?;
    }

    let result = match duration {
        Some(limit) => scheduler.run_for(limit),
        None => scheduler.run(),
    };

    let stats = scheduler.bus().stats();
    if stats_json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!(
            "{} {} ticks, {} published, {} dispatched, {} expired ({} partially delivered)",
            "Done:".green().bold(),
            scheduler.ticks(),
            stats.published,
            stats.dispatched,
            stats.expired,
            stats.partially_delivered
        );
    }

    result.map_err(Into::into)
}

fn list_events(group: Option<&str>) -> anyhow::Result<()> {
    let group = group
        .map(|name| {
            Group::ALL
                .iter()
                .copied()
                .find(|g| format!("{:?}", g).eq_ignore_ascii_case(name))
                .ok_or_else(|| anyhow::anyhow!("unknown group '{}'", name))
        })
        .transpose()?;

    println!(
        "{}",
        format!("{:<24} {:>5} {:>8}  {}", "EVENT", "CODE", "PRIORITY", "GROUP").bold()
    );
    for event in Event::ALL
        .iter()
        .filter(|e| group.map_or(true, |g| e.group() == g))
    {
        let name = format!("{:<24}", event.name());
        let name = if event.is_dire() { name.red() } else { name.normal() };
        println!(
            "{} {:>5} {:>8}  {:?}",
            name,
            event.code(),
            event.priority().value(),
            event.group()
        );
    }
    Ok(())
}
