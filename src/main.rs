//! isolator - CLI entry point
//!
//! Runs an application inside a bubblewrap sandbox built from a named
//! profile and an isolation level.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use isolator::config::{LaunchDefaults, Settings};
use isolator::policy::IsolationLevel;
use isolator::profile::LimitValue;
use isolator::sandbox::executor::Bubblewrap;
use isolator::sandbox::manager::SandboxManager;
use isolator::sandbox::plan::LaunchRequest;
use isolator::sandbox::signals::ForwardedSignals;

/// Run an application in an isolated sandbox
///
/// The profile is taken from `--profile`, the settings file, or detected
/// from the executable name.
///
/// # Examples
///
/// Run a browser with its detected profile:
///     isolator firefox
///
/// Strict isolation with a persistent directory:
///     isolator --isolation-level strict --persist ~/sandboxed firefox
///
/// Print the launch plan without running anything:
///     isolator --dry-run --profile development code .
#[derive(Parser, Debug)]
#[command(name = "isolator")]
#[command(about = "Run applications in isolated sandboxes")]
#[command(version)]
pub struct Cli {
    /// The command to run in the sandbox
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,

    /// Profile to apply (default: detected from the executable name)
    #[arg(long, short = 'p')]
    profile: Option<String>,

    /// How much of the host the application may see
    #[arg(long, short = 'l', value_enum)]
    isolation_level: Option<IsolationLevel>,

    /// Host directory mounted read-write at /persist
    #[arg(long)]
    persist: Option<PathBuf>,

    /// Disable network access
    #[arg(long)]
    no_network: bool,

    /// Disable display access
    #[arg(long)]
    no_gui: bool,

    /// Settings file (default: ~/.config/isolator/config.toml)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Memory limit, e.g. 2G
    #[arg(long)]
    memory: Option<String>,

    /// CPU limit as a percentage of one core
    #[arg(long)]
    cpu: Option<u64>,

    /// IO weight (10-1000)
    #[arg(long)]
    io_weight: Option<u64>,

    /// Maximum number of processes
    #[arg(long)]
    max_processes: Option<u64>,

    /// Maximum number of open files
    #[arg(long)]
    max_files: Option<u64>,

    /// Maximum size of a written file, e.g. 512M
    #[arg(long)]
    max_file_size: Option<String>,

    /// Add a capability (repeatable)
    #[arg(long = "cap-add", value_name = "CAP")]
    cap_add: Vec<String>,

    /// Drop a capability (repeatable)
    #[arg(long = "cap-drop", value_name = "CAP")]
    cap_drop: Vec<String>,

    /// Set an environment variable, KEY=VALUE (repeatable)
    #[arg(long = "setenv", value_name = "KEY=VALUE")]
    setenv: Vec<String>,

    /// Print the launch plan as JSON instead of running it
    #[arg(long)]
    dry_run: bool,

    /// Enable debug logging
    #[arg(long, short = 'd')]
    debug: bool,
}

impl Cli {
    /// The settings layer given on the command line.
    fn launch_defaults(&self) -> LaunchDefaults {
        LaunchDefaults {
            isolation_level: self.isolation_level,
            persist_dir: self.persist.clone(),
            network: self.no_network.then_some(false),
            gui: self.no_gui.then_some(false),
            debug: self.debug.then_some(true),
        }
    }

    /// Builds the launch request: command line over settings.
    fn request(&self, settings: &Settings) -> Result<LaunchRequest> {
        let mut request = LaunchRequest::new(&self.command)?;
        request.profile = self.profile.clone().or_else(|| settings.profile.clone());

        let defaults = self
            .launch_defaults()
            .or(&settings.launch_defaults(&request.profile_name()));
        defaults.apply(&mut request);

        let overrides = &mut request.overrides;
        overrides.cap_add = self.cap_add.clone();
        overrides.cap_drop = self.cap_drop.clone();
        overrides.env = self.setenv.clone();
        overrides.limits.memory_limit = self.memory.clone().map(LimitValue::Text);
        overrides.limits.cpu_limit = self.cpu.map(LimitValue::Number);
        overrides.limits.io_weight = self.io_weight.map(LimitValue::Number);
        overrides.limits.max_processes = self.max_processes.map(LimitValue::Number);
        overrides.limits.max_files = self.max_files.map(LimitValue::Number);
        overrides.limits.max_file_size = self.max_file_size.clone().map(LimitValue::Text);

        Ok(request)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("isolator: {:#}", err);
            1
        }
    };

    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let settings = Settings::load(cli.config.as_deref())?;
    let request = cli.request(&settings)?;

    initialize_logging(request.debug)?;

    let store = settings.profile_store();

    if cli.dry_run {
        let executor = Bubblewrap::locate().unwrap_or_else(|_| Bubblewrap::new("bwrap"));
        let manager = SandboxManager::new(store, executor)
            .with_seccomp_dir(settings.seccomp_dir());
        let plan = manager.dry_run(&request)?;
        println!("{}", plan.to_json_string()?);
        return Ok(0);
    }

    let mut signals = ForwardedSignals::install()?;
    let manager = SandboxManager::new(store, Bubblewrap::locate()?)
        .with_seccomp_dir(settings.seccomp_dir());

    let code = manager.run(&request, &mut signals).await?;
    tracing::debug!("Sandbox exited with code {}", code);

    Ok(code)
}

/// Initializes the logging system.
///
/// Sets up tracing subscriber with appropriate log level:
/// - `debug=true`: DEBUG level, including the full launch plan
/// - `debug=false`: INFO level for lifecycle events and warnings
///
/// Respects the `RUST_LOG` environment variable for fine-grained control.
///
/// # Errors
///
/// Returns an error if the logging subscriber fails to initialize.
fn initialize_logging(debug: bool) -> Result<()> {
    let log_level = if debug { "debug" } else { "info" };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!("Failed to initialize logging: {}", err))?;

    Ok(())
}
