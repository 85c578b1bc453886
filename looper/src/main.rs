//! `looper` command line.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use looper::core::types::ExecutionMode;
use looper::exit_codes;
use looper::io::agent::{OutputObserver, OutputStream};
use looper::io::config::{LoopConfig, load_config};
use looper::io::init::{InitOptions, init_looper};
use looper::io::paths::LooperPaths;
use looper::io::process::{AgentCommand, AgentProcessHandle};
use looper::io::prompt::TemplatePrompts;
use looper::io::session_state::load_session;
use looper::io::status_store::StatusStore;
use looper::io::stop::request_stop_file;
use looper::io::watcher::LogSink;
use looper::logging;
use looper::scheduler::{IterationScheduler, SessionOutcome};

#[derive(Parser)]
#[command(
    name = "looper",
    version,
    about = "Run an external agent in a loop until the task is done"
)]
struct Cli {
    /// Task working directory.
    #[arg(short = 'C', long, global = true, default_value = ".")]
    dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.looper/` with config, instructions and status schema.
    Init {
        /// Overwrite existing looper files (instructions are kept).
        #[arg(short, long)]
        force: bool,
    },
    /// Run a session until completion, a budget, or a stop request.
    Run(RunArgs),
    /// Ask a running session to stop after its current iteration.
    Stop,
    /// Print the last session record and the current status file.
    Status,
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,
    #[arg(long)]
    max_iterations: Option<u32>,
    /// Seconds to sleep between iterations.
    #[arg(long)]
    delay: Option<u64>,
    /// Consecutive no-op iterations before stopping (autonomous mode, 0 disables).
    #[arg(long)]
    stagnation_threshold: Option<u32>,
    /// Verify claimed completion with a separate agent pass.
    #[arg(long)]
    verify: bool,
    /// Disable status change notifications.
    #[arg(long)]
    no_watch: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    Incremental,
    Autonomous,
}

impl From<ModeArg> for ExecutionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Incremental => ExecutionMode::Incremental,
            ModeArg::Autonomous => ExecutionMode::Autonomous,
        }
    }
}

impl RunArgs {
    fn apply(&self, config: &mut LoopConfig) {
        if let Some(mode) = self.mode {
            config.mode = mode.into();
        }
        if let Some(max_iterations) = self.max_iterations {
            config.max_iterations = max_iterations;
        }
        if let Some(delay) = self.delay {
            config.delay_secs = delay;
        }
        if let Some(threshold) = self.stagnation_threshold {
            config.stagnation_threshold = threshold;
        }
        if self.verify {
            config.verification.enabled = true;
        }
        if self.no_watch {
            config.watcher.enabled = false;
        }
    }
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let paths = LooperPaths::new(&cli.dir);
    match cli.command {
        Command::Init { force } => cmd_init(&cli.dir, force),
        Command::Run(args) => cmd_run(paths, &args),
        Command::Stop => cmd_stop(&paths),
        Command::Status => cmd_status(&paths),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_looper(root, &InitOptions { force })?;
    println!(
        "initialized {}; describe the task in {}",
        paths.looper_dir.display(),
        paths.instructions_path.display()
    );
    Ok(exit_codes::OK)
}

fn cmd_run(paths: LooperPaths, args: &RunArgs) -> Result<i32> {
    let mut config = load_config(&paths.config_path)?;
    args.apply(&mut config);
    config.validate().context("invalid run options")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")?;
    let outcome = runtime.block_on(run_session(paths, config))?;
    print_outcome(&outcome);
    Ok(exit_codes::for_reason(&outcome.reason))
}

async fn run_session(paths: LooperPaths, config: LoopConfig) -> Result<SessionOutcome> {
    let agent = AgentProcessHandle::new(AgentCommand::from_config(&config, &paths.root));
    let interrupt = CancellationToken::new();
    let listener = tokio::spawn(listen_for_interrupt(interrupt.clone()));

    let observer: OutputObserver = Arc::new(|stream, line| match stream {
        OutputStream::Stdout => info!(target: "agent", "{line}"),
        OutputStream::Stderr => info!(target: "agent", stream = "stderr", "{line}"),
    });
    let mut scheduler = IterationScheduler::new(agent, TemplatePrompts::new()?, config, paths)?
        .with_sink(Arc::new(LogSink))
        .with_output_observer(observer)
        .with_interrupt(interrupt);
    let outcome = scheduler.run().await;
    listener.abort();
    outcome
}

async fn listen_for_interrupt(interrupt: CancellationToken) {
    loop {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(err = %err, "cannot listen for interrupt");
            return;
        }
        if interrupt.is_cancelled() {
            warn!("already shutting down, waiting for the agent to exit");
        } else {
            warn!("interrupt received, shutting down");
            interrupt.cancel();
        }
    }
}

fn print_outcome(outcome: &SessionOutcome) {
    println!("session {}: {}", outcome.session_id, outcome.reason);
    println!(
        "iterations: {}, invocations: {}, verification resumes: {}",
        outcome.iterations, outcome.invocations, outcome.verification_attempts
    );
    if let Some(report) = &outcome.verification {
        if let Some(summary) = &report.summary {
            println!("verification: {summary}");
        }
        for gap in &report.gaps {
            println!("  - {gap}");
        }
    }
    if let Some(diagnostic) = &outcome.diagnostic {
        eprintln!("last agent output:\n{diagnostic}");
    }
}

fn cmd_stop(paths: &LooperPaths) -> Result<i32> {
    request_stop_file(&paths.stop_path)?;
    println!(
        "stop requested ({}); the session stops after its current iteration",
        paths.stop_path.display()
    );
    Ok(exit_codes::OK)
}

fn cmd_status(paths: &LooperPaths) -> Result<i32> {
    let config = load_config(&paths.config_path)?;
    match load_session(&paths.session_path)? {
        Some(record) => {
            println!("session: {}", record.session_id);
            println!("mode: {}", record.mode);
            println!("state: {:?}", record.state);
            if let Some(reason) = &record.exit_reason {
                println!("exit reason: {reason}");
            }
            println!(
                "iterations: {}/{}",
                record.iteration_index, record.max_iterations
            );
            println!("stagnation: {}", record.stagnation_count);
            println!("verification resumes: {}", record.verification_attempts);
            if let Some(avg) = record.average_iteration_secs {
                println!("average iteration: {avg:.1}s");
            }
            if let Some(eta) = record.eta_secs {
                println!("eta: {eta:.0}s");
            }
        }
        None => println!("no session has run yet"),
    }

    let store = StatusStore::new(&paths.status_path, config.mode)?;
    let snapshot = store.read();
    println!("complete: {}", snapshot.complete);
    if let Some(progress) = snapshot.progress() {
        println!("progress: {}/{}", progress.completed, progress.total);
    }
    if let Some(worked) = snapshot.worked() {
        println!("worked: {worked}");
    }
    if let Some(remaining) = store.compute_remaining() {
        println!("remaining: {remaining}");
    }
    if let Some(summary) = &snapshot.summary {
        println!("summary: {summary}");
    }
    for warning in store.validate().warnings {
        println!("warning: {warning}");
    }
    if paths.stop_path.exists() {
        println!("stop requested: yes");
    }
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_args_override_config() {
        let cli = Cli::try_parse_from([
            "looper",
            "run",
            "--mode",
            "autonomous",
            "--max-iterations",
            "4",
            "--delay",
            "2",
            "--stagnation-threshold",
            "0",
            "--verify",
            "--no-watch",
        ])
        .expect("parse");
        let Command::Run(args) = cli.command else {
            panic!("expected run command");
        };
        let mut config = LoopConfig::default();
        args.apply(&mut config);
        assert_eq!(config.mode, ExecutionMode::Autonomous);
        assert_eq!(config.max_iterations, 4);
        assert_eq!(config.delay_secs, 2);
        assert_eq!(config.stagnation_threshold, 0);
        assert!(config.verification.enabled);
        assert!(!config.watcher.enabled);
    }

    #[test]
    fn run_without_flags_keeps_config() {
        let mut config = LoopConfig::default();
        RunArgs::default().apply(&mut config);
        assert_eq!(config, LoopConfig::default());
    }

    #[test]
    fn directory_flag_is_global() {
        let cli = Cli::try_parse_from(["looper", "status", "-C", "/tmp/task"]).expect("parse");
        assert_eq!(cli.dir, PathBuf::from("/tmp/task"));
    }
}
