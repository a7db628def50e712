use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use testflight::config::Config;
use testflight::model::{ProcessInfo, ProcessState, RunMode, RunParameters};
use testflight::worker::CommandExecutor;
use testflight::{discovery, storage};

#[derive(Parser)]
#[command(
    name = "testflight",
    about = "Parallel test-run scheduling and process supervision",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the test suite (scheduler + worker processes + live updates)
    Run {
        /// SQLite database path
        #[arg(long)]
        db: Option<String>,

        /// Maximum number of test processes running at once
        #[arg(long, short = 'j')]
        jobs: Option<usize>,

        /// Run mode: restart, resume or check
        #[arg(long)]
        mode: Option<String>,

        /// Scheduler tick period in seconds
        #[arg(long)]
        refresh: Option<f64>,

        /// Test runner program (the unit path is appended)
        #[arg(long)]
        runner: Option<String>,

        /// Extra argument for the runner (repeatable)
        #[arg(long = "runner-arg", allow_hyphen_values = true)]
        runner_args: Vec<String>,

        /// Directory to discover test units in
        #[arg(long)]
        dir: Option<String>,

        /// Substring a file name must contain to be a test unit
        #[arg(long)]
        pattern: Option<String>,

        /// Program-under-test fingerprint, used by check mode
        #[arg(long)]
        fingerprint: Option<String>,

        /// Explicit test units (skips discovery)
        tests: Vec<String>,
    },

    /// Show the latest state of every unit in a run
    Status {
        /// SQLite database path
        #[arg(long)]
        db: Option<String>,

        /// Run GUID (defaults to the most recent run)
        #[arg(long)]
        run: Option<String>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Delete recorded history for one run, or everything
    Clear {
        /// SQLite database path
        #[arg(long)]
        db: Option<String>,

        /// Run GUID to delete; omit to drop all history
        #[arg(long)]
        run: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load_or_default();

    match cli.command {
        Commands::Run {
            db,
            jobs,
            mode,
            refresh,
            runner,
            runner_args,
            dir,
            pattern,
            fingerprint,
            tests,
        } => {
            let db_path = db.unwrap_or(config.storage.db_path);
            let pool = storage::open_pool(&db_path)?;

            let units = if tests.is_empty() {
                let dir = dir.unwrap_or(config.discovery.dir);
                let pattern = pattern.unwrap_or(config.discovery.pattern);
                discovery::discover(Path::new(&dir), &pattern)?
            } else {
                tests
            };
            if units.is_empty() {
                anyhow::bail!("no test units to run");
            }

            let run_mode: RunMode = mode.unwrap_or(config.scheduler.run_mode).parse()?;
            let jobs = jobs.unwrap_or(config.scheduler.max_processes);
            let tick = Duration::from_secs_f64(refresh.unwrap_or(config.scheduler.refresh_rate));
            let sample = Duration::from_secs_f64(config.scheduler.sample_rate);

            let program = runner.unwrap_or(config.runner.program);
            let mut args = config.runner.args;
            args.extend(runner_args);
            let executor = Arc::new(CommandExecutor::new(program, args));

            let params = RunParameters::new(run_mode, jobs).with_fingerprint(fingerprint);
            tracing::info!(
                run_guid = %params.run_guid,
                units = units.len(),
                jobs = params.max_processes,
                "starting test run"
            );

            let summary = testflight::run_suite(
                pool,
                executor,
                units,
                params,
                tick,
                sample,
                print_update,
            )
            .await?;

            println!();
            println!(
                "run {}: {} passed, {} failed, {} terminated, {} not run",
                summary.run_guid,
                summary.passed,
                summary.failed,
                summary.terminated,
                summary.queued
            );
            if !summary.is_success() {
                std::process::exit(1);
            }
        }

        Commands::Status { db, run, json } => {
            let db_path = db.unwrap_or(config.storage.db_path);
            let pool = storage::open_pool(&db_path)?;
            let rows = storage::query(&pool, run.as_deref())?;
            let latest = storage::latest_by_unit(&rows);
            let mut units: Vec<_> = latest.into_values().collect();
            units.sort_by(|a, b| a.name.cmp(&b.name));

            if json {
                println!("{}", serde_json::to_string_pretty(&units)?);
            } else if units.is_empty() {
                println!("No recorded runs.");
            } else {
                println!("run: {}", units[0].run_guid);
                println!(
                    "{:<40} | {:<10} | {:<8} | {:<12} | {:>6} | {:>6}",
                    "Unit", "State", "Pid", "Exit", "CPU%", "Mem%"
                );
                println!(
                    "{:-<40}-|-{:-<10}-|-{:-<8}-|-{:-<12}-|-{:-<6}-|-{:-<6}",
                    "", "", "", "", "", ""
                );
                for info in &units {
                    println!(
                        "{:<40} | {:<10} | {:<8} | {:<12} | {:>6} | {:>6}",
                        info.name,
                        info.state.to_string(),
                        info.pid.map(|p| p.to_string()).unwrap_or_default(),
                        info.exit_code.map(|c| c.to_string()).unwrap_or_default(),
                        info.cpu_percent
                            .map(|c| format!("{:.1}", c))
                            .unwrap_or_default(),
                        info.memory_percent
                            .map(|m| format!("{:.1}", m))
                            .unwrap_or_default(),
                    );
                }
            }
        }

        Commands::Clear { db, run } => {
            let db_path = db.unwrap_or(config.storage.db_path);
            let pool = storage::open_pool(&db_path)?;
            storage::delete(&pool, run.as_deref())?;
            match run {
                Some(guid) => println!("Cleared run {}.", guid),
                None => println!("Cleared all recorded history."),
            }
        }
    }

    Ok(())
}

fn print_update(info: &ProcessInfo) {
    match info.state {
        ProcessState::Queued => println!("queued     {}", info.name),
        ProcessState::Running => {
            // Two RUNNING events arrive per unit: the dispatch record and
            // the worker's own pid-bearing record. Print the one with a pid.
            if let Some(pid) = info.pid {
                if info.cpu_percent.is_none() {
                    println!("running    {} (pid {})", info.name, pid);
                }
            }
        }
        ProcessState::Finished => {
            let outcome = info
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            println!("finished   {} ({})", info.name, outcome);
        }
        ProcessState::Terminated => println!("terminated {}", info.name),
        ProcessState::Unknown => {}
    }
}
