use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::Receiver;
use proctor_core::classify::AssemblyClassifier;
use proctor_core::config::ProctorConfig;
use proctor_core::telemetry::logging::{self, LogConfig, LogLevel};
use proctor_core::{
    DiscoveryCriteria, EventCollector, RunCriteria, SessionEvent, SessionOutcome, TestPlatform,
};
use proctor_proto::TestOutcome;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "proctor", about = "Discover and run tests in isolated test hosts")]
struct Cli {
    #[arg(long, value_enum, default_value_t = LogLevel::Warn, global = true)]
    log_level: LogLevel,

    #[arg(long, help = "Write logs to a file instead of stderr", global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the tests found in the given sources
    Discover(SessionArgs),
    /// Run every test in the given sources
    Run(SessionArgs),
    /// Print whether each source is a native or managed binary
    Classify { sources: Vec<String> },
}

#[derive(Args, Debug)]
struct SessionArgs {
    /// TOML run settings file
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Test host executable
    #[arg(long, env = "PROCTOR_TESTHOST_PATH")]
    testhost: Option<PathBuf>,

    /// Extension search paths forwarded to the test host
    #[arg(long = "extension")]
    extensions: Vec<PathBuf>,

    /// Give up on the session after this many seconds
    #[arg(long, default_value_t = 600)]
    timeout_secs: u64,

    #[arg(required = true)]
    sources: Vec<String>,
}

impl SessionArgs {
    fn platform(&self) -> TestPlatform {
        let mut config = ProctorConfig::from_env();
        if let Some(testhost) = &self.testhost {
            config.testhost_path = testhost.clone();
        }
        let platform = TestPlatform::new(config);
        platform.initialize_extensions(self.extensions.iter().cloned(), false);
        platform
    }

    fn run_settings(&self) -> Result<String> {
        match &self.settings {
            Some(path) => read_settings(path),
            None => Ok(String::new()),
        }
    }
}

fn read_settings(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("reading run settings {}", path.display()))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let log_config = LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    };
    if let Err(err) = logging::init(&log_config) {
        eprintln!("⚠️  {err}");
    }

    match run(cli.command) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("❌ {err:#}");
            ExitCode::from(2)
        }
    }
}

fn run(command: Command) -> Result<bool> {
    match command {
        Command::Classify { sources } => {
            let classifier = AssemblyClassifier::new();
            let types = classifier.detect_assembly_types(&sources);
            for source in &sources {
                match types.get(source) {
                    Some(assembly_type) => println!("{source}\t{assembly_type:?}"),
                    None => println!("{source}\t-"),
                }
            }
            Ok(true)
        }
        Command::Discover(args) => {
            let platform = args.platform();
            let criteria = DiscoveryCriteria::new(args.sources.iter().cloned(), args.run_settings()?);
            let request = platform.create_discovery_request(criteria)?;
            let (collector, events) = EventCollector::channel();
            request.discover_async(Arc::new(collector))?;
            info!(session = %request.id(), "discovery started");
            let outcome = drain(&events, Duration::from_secs(args.timeout_secs), |event| {
                if let SessionEvent::TestsFound(tests) = event {
                    for test in tests {
                        println!("{}", test.fully_qualified_name);
                    }
                }
            });
            report(outcome, || request.abort())
        }
        Command::Run(args) => {
            let platform = args.platform();
            let criteria = RunCriteria::from_sources(args.sources.iter().cloned(), args.run_settings()?);
            let request = platform.create_run_request(criteria)?;
            let (collector, events) = EventCollector::channel();
            request.execute_async(Arc::new(collector))?;
            info!(session = %request.id(), "run started");
            let mut failed = 0usize;
            let outcome = drain(&events, Duration::from_secs(args.timeout_secs), |event| {
                if let SessionEvent::TestResults(results) = event {
                    for result in results {
                        if result.outcome == TestOutcome::Failed {
                            failed += 1;
                        }
                        println!("{:?}\t{}", result.outcome, result.test_case.fully_qualified_name);
                    }
                }
            });
            let completed = report(outcome, || request.abort())?;
            if failed > 0 {
                eprintln!("{failed} test(s) failed");
            }
            Ok(completed && failed == 0)
        }
    }
}

/// Feeds events to `on_event` until the session completes or `timeout` passes.
fn drain(
    events: &Receiver<SessionEvent>,
    timeout: Duration,
    mut on_event: impl FnMut(SessionEvent),
) -> Option<SessionOutcome> {
    let deadline = crossbeam_channel::after(timeout);
    loop {
        crossbeam_channel::select! {
            recv(events) -> event => match event {
                Ok(SessionEvent::Complete(outcome)) => return Some(outcome),
                Ok(SessionEvent::Log(message)) => info!(level = ?message.level, "{}", message.message),
                Ok(event) => on_event(event),
                Err(_) => return None,
            },
            recv(deadline) -> _ => return None,
        }
    }
}

fn report(outcome: Option<SessionOutcome>, abort: impl FnOnce()) -> Result<bool> {
    match outcome {
        Some(SessionOutcome::Completed(end)) => {
            eprintln!("✅ {} test(s) in {} ms", end.total_tests, end.elapsed_ms);
            Ok(true)
        }
        Some(SessionOutcome::Aborted) => {
            eprintln!("session aborted");
            Ok(false)
        }
        Some(SessionOutcome::Faulted(fault)) => {
            let host = if fault.host_terminated {
                "test host was terminated"
            } else {
                "test host had already exited"
            };
            bail!("session failed during {:?}: {} ({host})", fault.phase, fault.error)
        }
        None => {
            abort();
            bail!("session did not finish in time")
        }
    }
}
