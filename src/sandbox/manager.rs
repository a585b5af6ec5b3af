//! Launch orchestration and session lifecycle.
//!
//! The `SandboxManager` turns a [`LaunchRequest`] into a running sandbox and
//! guarantees the session's ephemeral state is removed afterwards.
//!
//! # Lifecycle
//!
//! Every session moves through these states:
//!
//! ```text
//! Created -> PlanBuilt -> Spawned -> Running -> Exited -> TornDown
//!                            \-> FailedToSpawn ------------^
//! ```
//!
//! 1. **Planning**: resolves the policy, creates the ephemeral directory and
//!    builds the filesystem and display plans
//! 2. **Spawn**: hands the [`LaunchPlan`] to the [`SandboxExecutor`]
//! 3. **Supervision**: forwards `SIGINT`/`SIGTERM` to the child and waits for it
//! 4. **Teardown**: removes the ephemeral directory, leaving persistent storage
//!
//! Teardown runs exactly once per session, on every path: normal exit, spawn
//! failure, a fatal planning error, or an interrupt.
//!
//! # Example
//!
//! ```no_run
//! use isolator::policy::IsolationLevel;
//! use isolator::profile::ProfileStore;
//! use isolator::sandbox::executor::Bubblewrap;
//! use isolator::sandbox::manager::SandboxManager;
//! use isolator::sandbox::plan::LaunchRequest;
//! use isolator::sandbox::signals::ForwardedSignals;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let manager = SandboxManager::new(ProfileStore::builtin(), Bubblewrap::locate()?);
//!
//! let mut request = LaunchRequest::new(&["firefox".to_string()])?;
//! request.level = IsolationLevel::Strict;
//!
//! let mut signals = ForwardedSignals::install()?;
//! let code = manager.run(&request, &mut signals).await?;
//! println!("Exit code: {code}");
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::SystemTime;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tokio::process::Child;

use crate::error::{IsolatorError, Result, Warning};
use crate::policy::{resolve, Policy};
use crate::profile::ProfileStore;
use crate::sandbox::display::{DisplayManager, DisplayPlan};
use crate::sandbox::executor::SandboxExecutor;
use crate::sandbox::filesystem::{EphemeralDir, FilesystemPlanBuilder};
use crate::sandbox::plan::{LaunchPlan, LaunchRequest, PlanContext, SECCOMP_DIR};
use crate::sandbox::signals::ForwardedSignals;
use crate::utils::paths::{home_dir, resolve_executable};

/// Exit code reported when the launcher is interrupted before spawning.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    PlanBuilt,
    Spawned,
    Running,
    FailedToSpawn,
    Exited,
    TornDown,
}

/// Runtime record for one launch.
///
/// Owns the ephemeral directory and the child handle. Dropping a session tears
/// it down if that has not happened yet.
#[derive(Debug)]
pub struct SandboxSession {
    state: SessionState,
    ephemeral: Option<EphemeralDir>,
    ephemeral_path: Option<PathBuf>,
    persist_path: Option<PathBuf>,
    plan: Option<LaunchPlan>,
    child: Option<Child>,
    started_at: Option<SystemTime>,
    exit_code: Option<i32>,
}

impl SandboxSession {
    fn new() -> Self {
        Self {
            state: SessionState::Created,
            ephemeral: None,
            ephemeral_path: None,
            persist_path: None,
            plan: None,
            child: None,
            started_at: None,
            exit_code: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The ephemeral directory, even after it has been removed.
    pub fn ephemeral_path(&self) -> Option<&PathBuf> {
        self.ephemeral_path.as_ref()
    }

    pub fn persist_path(&self) -> Option<&PathBuf> {
        self.persist_path.as_ref()
    }

    pub fn plan(&self) -> Option<&LaunchPlan> {
        self.plan.as_ref()
    }

    pub fn started_at(&self) -> Option<SystemTime> {
        self.started_at
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!("Session {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Removes the ephemeral directory and releases the child handle.
    ///
    /// Safe to call more than once; only the first call has any effect. The
    /// persistent directory is never touched.
    pub fn teardown(&mut self) {
        if self.state == SessionState::TornDown {
            return;
        }

        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.start_kill() {
                tracing::debug!("Child already gone at teardown: {}", err);
            }
        }
        if let Some(ephemeral) = self.ephemeral.take() {
            if let Err(err) = ephemeral.close() {
                tracing::warn!("Failed to remove ephemeral directory: {}", err);
            }
        }
        if let Some(persist) = &self.persist_path {
            tracing::debug!("Leaving persistent directory {} in place", persist.display());
        }

        self.transition(SessionState::TornDown);
        tracing::info!("Session torn down");
    }
}

impl Drop for SandboxSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// High-level orchestration of sandbox launches.
pub struct SandboxManager {
    store: ProfileStore,
    executor: Box<dyn SandboxExecutor>,
    display: DisplayManager,
    sandbox_home: PathBuf,
    seccomp_dir: PathBuf,
    ephemeral_base: Option<PathBuf>,
}

impl SandboxManager {
    /// Creates a manager that spawns through `executor`.
    ///
    /// Display detection reads the current environment; the sandbox home
    /// mirrors the invoking user's home path.
    pub fn new(store: ProfileStore, executor: impl SandboxExecutor + 'static) -> Self {
        Self {
            store,
            executor: Box::new(executor),
            display: DisplayManager::default(),
            sandbox_home: home_dir(),
            seccomp_dir: PathBuf::from(SECCOMP_DIR),
            ephemeral_base: None,
        }
    }

    pub fn with_display(mut self, display: DisplayManager) -> Self {
        self.display = display;
        self
    }

    pub fn with_sandbox_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.sandbox_home = home.into();
        self
    }

    pub fn with_seccomp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.seccomp_dir = dir.into();
        self
    }

    /// Creates ephemeral directories under `base` instead of the runtime dir.
    pub fn with_ephemeral_base(mut self, base: impl Into<PathBuf>) -> Self {
        self.ephemeral_base = Some(base.into());
        self
    }

    pub fn store(&self) -> &ProfileStore {
        &self.store
    }

    /// Builds the session's launch plan (`Created -> PlanBuilt`).
    ///
    /// On error the partially built session is torn down before returning.
    ///
    /// # Errors
    ///
    /// - [`IsolatorError::ProfileNotFound`] / [`IsolatorError::InvalidOverride`]
    ///   from policy resolution
    /// - [`IsolatorError::PlanInvalid`] / [`IsolatorError::PersistentPathUnwritable`]
    ///   from plan building
    pub fn prepare(&self, request: &LaunchRequest) -> Result<SandboxSession> {
        self.prepare_session(request, false)
    }

    fn prepare_session(
        &self,
        request: &LaunchRequest,
        planning_only: bool,
    ) -> Result<SandboxSession> {
        let mut session = SandboxSession::new();

        let profile = request.profile_name();
        tracing::info!(
            "Launching {} with profile '{}' at level {}",
            request.executable,
            profile,
            request.level
        );
        let policy = resolve(&self.store, &profile, request.level, &request.overrides)?;

        let ephemeral = match &self.ephemeral_base {
            Some(base) => EphemeralDir::create_in(base)?,
            None => EphemeralDir::create()?,
        };
        session.ephemeral_path = Some(ephemeral.path().to_path_buf());
        let ephemeral = session.ephemeral.insert(ephemeral);

        let filesystem = FilesystemPlanBuilder::new(&self.sandbox_home)
            .with_persist_creation(!planning_only)
            .build(&policy, ephemeral)?;
        let (policy, display) = self.plan_display(policy, ephemeral.path())?;

        let mut warnings = Vec::new();
        let executable = resolve_executable(&request.executable).unwrap_or_else(|| {
            let warning = Warning::ExecutableUnresolved {
                name: request.executable.clone(),
            };
            warning.emit();
            warnings.push(warning);
            PathBuf::from(&request.executable)
        });

        let mut plan = LaunchPlan::assemble(
            &policy,
            request,
            filesystem,
            display,
            PlanContext {
                executable,
                sandbox_home: self.sandbox_home.clone(),
                seccomp_dir: self.seccomp_dir.clone(),
                warnings,
            },
        )?;
        for warning in self.executor.enforcement_warnings(&plan) {
            warning.emit();
            plan.warnings.push(warning);
        }
        tracing::debug!("Launch plan: {:?}", plan);

        session.persist_path = policy.persist_path;
        session.plan = Some(plan);
        session.transition(SessionState::PlanBuilt);
        Ok(session)
    }

    fn plan_display(
        &self,
        policy: Policy,
        session_dir: &std::path::Path,
    ) -> Result<(Policy, DisplayPlan)> {
        match self.display.plan(&policy, session_dir, &self.sandbox_home) {
            Ok(display) => Ok((policy, display)),
            Err(err) if err.is_recoverable() => {
                let mut warnings = policy.warnings.clone();
                if let Some(warning) = Option::<Warning>::from(&err) {
                    warning.emit();
                    warnings.push(warning);
                }
                let degraded = Policy {
                    gui_enabled: false,
                    warnings,
                    ..policy
                };
                Ok((degraded, DisplayPlan::default()))
            }
            Err(err) => Err(err),
        }
    }

    /// Resolves and plans `request` without spawning anything.
    ///
    /// The ephemeral directory created for planning is removed before
    /// returning, and a missing persistent directory is not created.
    pub fn dry_run(&self, request: &LaunchRequest) -> Result<LaunchPlan> {
        let mut session = self.prepare_session(request, true)?;
        let plan = session
            .plan
            .take()
            .ok_or_else(|| IsolatorError::PlanInvalid("session has no plan".into()))?;
        session.teardown();
        Ok(plan)
    }

    /// Plans, spawns and supervises `request`, returning the exit code.
    ///
    /// Signals queued in `signals` before the spawn abort the launch with
    /// [`INTERRUPTED_EXIT_CODE`]; signals received while the child runs are
    /// forwarded to it.
    pub async fn run(
        &self,
        request: &LaunchRequest,
        signals: &mut ForwardedSignals,
    ) -> Result<i32> {
        let mut session = self.prepare(request)?;

        if let Some(signal) = signals.pending() {
            tracing::info!("Received {} before spawn, aborting launch", signal);
            session.teardown();
            return Ok(INTERRUPTED_EXIT_CODE);
        }

        let result = self.launch(&mut session, signals).await;
        session.teardown();
        result
    }

    /// Spawns and supervises a prepared session (`PlanBuilt -> Exited`).
    ///
    /// Does not tear the session down; the caller (or drop) does.
    pub async fn launch(
        &self,
        session: &mut SandboxSession,
        signals: &mut ForwardedSignals,
    ) -> Result<i32> {
        if session.state != SessionState::PlanBuilt {
            return Err(IsolatorError::PlanInvalid(format!(
                "cannot launch a session in state {:?}",
                session.state
            )));
        }
        let plan = session
            .plan
            .as_ref()
            .ok_or_else(|| IsolatorError::PlanInvalid("session has no plan".into()))?;

        tracing::info!(
            "Spawning {} via {}",
            plan.executable.display(),
            self.executor.name()
        );
        let child = match self.executor.spawn(plan) {
            Ok(child) => child,
            Err(err) => {
                session.transition(SessionState::FailedToSpawn);
                tracing::error!("Spawn failed: {}", err);
                return Err(err);
            }
        };
        session.started_at = Some(SystemTime::now());
        session.transition(SessionState::Spawned);
        let child = session.child.insert(child);

        session.state = SessionState::Running;
        let status = supervise(child, signals).await?;
        session.child = None;

        let code = exit_code(status);
        let elapsed = session
            .started_at
            .and_then(|start| start.elapsed().ok())
            .unwrap_or_default();
        tracing::info!(
            "Sandboxed process exited with code {} after {:.1}s",
            code,
            elapsed.as_secs_f64()
        );
        session.exit_code = Some(code);
        session.transition(SessionState::Exited);
        Ok(code)
    }
}

/// Waits for `child`, forwarding every queued signal to it.
async fn supervise(child: &mut Child, signals: &mut ForwardedSignals) -> Result<ExitStatus> {
    loop {
        tokio::select! {
            result = child.wait() => {
                return result.map_err(IsolatorError::from);
            }
            Some(signal) = signals.recv() => {
                // The child runs in its own session, so terminal signals do
                // not reach it directly.
                if let Err(err) = forward_signal(child, signal) {
                    tracing::warn!("Failed to forward {} to sandbox: {}", signal, err);
                }
            }
        }
    }
}

fn forward_signal(child: &Child, signal: Signal) -> Result<()> {
    let pid = child
        .id()
        .ok_or_else(|| IsolatorError::SpawnFailure("child has already exited".into()))?;
    let pid = i32::try_from(pid)
        .map_err(|_| IsolatorError::SpawnFailure(format!("pid {pid} out of range")))?;
    tracing::info!("Forwarding {} to sandbox (pid {})", signal, pid);
    nix::sys::signal::kill(Pid::from_raw(pid), signal)
        .map_err(|errno| IsolatorError::Io(errno.into()))
}

/// The child's exit code, or `128 + n` for a child killed by signal `n`.
pub fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}
