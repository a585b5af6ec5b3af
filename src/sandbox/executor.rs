//! The external sandbox primitive.
//!
//! [`SandboxExecutor`] is the seam between planning and enforcement. The
//! production implementation drives `bwrap`, optionally inside a transient
//! `systemd-run --user --scope` unit so cgroup limits apply.
//!
//! Whole-sandbox caps (memory, CPU, IO, tasks) are cgroup properties.
//! `RLIMIT_NPROC` counts every process of the invoking user and `RLIMIT_AS`
//! caps address space rather than memory, so both are used only for limits
//! the caller asked for explicitly, and only when no cgroup is available.

use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use nix::sys::resource::Resource;
use tokio::process::{Child, Command};

use crate::error::{IsolatorError, Result, Warning};
use crate::policy::Namespace;
use crate::profile::ResourceLimits;
use crate::sandbox::filesystem::{AccessMode, MountKind};
use crate::sandbox::plan::LaunchPlan;

/// Descriptor the seccomp filter is handed over on.
pub const SECCOMP_FD: i32 = 9;

/// Starts a process according to a [`LaunchPlan`].
pub trait SandboxExecutor: Send + Sync {
    /// Spawns the sandboxed process. Never retried by callers.
    fn spawn(&self, plan: &LaunchPlan) -> Result<Child>;

    /// Short name for logs.
    fn name(&self) -> &str;

    /// Limits in `plan` this executor cannot enforce.
    fn enforcement_warnings(&self, _plan: &LaunchPlan) -> Vec<Warning> {
        Vec::new()
    }
}

/// How one plan's resource limits are applied.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Enforcement {
    /// `systemd-run -p` properties; empty when running bwrap directly.
    pub properties: Vec<String>,
    /// rlimits set on the spawned process.
    pub rlimits: Vec<(Resource, u64)>,
    /// Limits that nothing enforces.
    pub unenforced: Vec<&'static str>,
}

/// Runs plans with bubblewrap.
#[derive(Debug, Clone)]
pub struct Bubblewrap {
    program: PathBuf,
    systemd_run: Option<PathBuf>,
}

impl Bubblewrap {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            systemd_run: None,
        }
    }

    /// Finds `bwrap` on `PATH`, plus `systemd-run` when a user manager
    /// answers.
    pub fn locate() -> Result<Self> {
        let program = which::which("bwrap").map_err(|_| {
            IsolatorError::SpawnFailure("bubblewrap (bwrap) not found in PATH".into())
        })?;
        let systemd_run = which::which("systemd-run")
            .ok()
            .filter(|_| user_session_present())
            .filter(|path| systemd_run_works(path));
        tracing::debug!(
            "Using {} (cgroup wrapper: {:?})",
            program.display(),
            systemd_run
        );
        Ok(Self {
            program,
            systemd_run,
        })
    }

    pub fn with_systemd_run(mut self, program: Option<PathBuf>) -> Self {
        self.systemd_run = program;
        self
    }

    /// Encodes `plan` as bwrap arguments, ending with `-- <executable> <args>`.
    pub fn arguments(&self, plan: &LaunchPlan) -> Result<Vec<OsString>> {
        let mut args = Args::default();

        args.push("--die-with-parent");
        args.push("--new-session");

        for namespace in &plan.namespaces {
            match namespace {
                Namespace::Pid => args.push("--unshare-pid"),
                Namespace::Ipc => args.push("--unshare-ipc"),
                Namespace::Uts => args.push("--unshare-uts"),
                Namespace::User => args.push("--unshare-user-try"),
                Namespace::Cgroup => args.push("--unshare-cgroup-try"),
                Namespace::Net => args.push("--unshare-net"),
                // bwrap always runs in its own mount namespace
                Namespace::Mount => {}
            }
        }
        if plan.network_enabled {
            args.push("--share-net");
        }
        if plan.namespaces.contains(&Namespace::Uts) {
            args.extend(["--hostname", "isolated"]);
        }

        for mount in &plan.mounts {
            let target = mount.target.as_os_str();
            match (mount.kind, &mount.source) {
                (MountKind::Bind, Some(source)) => {
                    let flag = match mount.mode {
                        AccessMode::ReadOnly => "--ro-bind",
                        AccessMode::ReadWrite => "--bind",
                    };
                    args.push(flag);
                    args.push(source);
                    args.push(target);
                }
                (MountKind::Bind, None) => {
                    return Err(IsolatorError::SpawnFailure(format!(
                        "bind mount {} has no source",
                        mount.target.display()
                    )))
                }
                (MountKind::Tmpfs, _) => {
                    args.push("--tmpfs");
                    args.push(target);
                }
                (MountKind::Proc, _) => {
                    args.push("--proc");
                    args.push(target);
                }
                (MountKind::Dev, _) => {
                    args.push("--dev");
                    args.push(target);
                }
            }
        }
        for device in &plan.devices {
            args.push("--dev-bind-try");
            args.push(device);
            args.push(device);
        }

        args.push("--clearenv");
        for (key, value) in &plan.env {
            args.push("--setenv");
            args.push(key);
            args.push(value);
        }

        args.extend(["--cap-drop", "ALL"]);
        for cap in &plan.capabilities {
            args.extend(["--cap-add", cap.as_str()]);
        }

        args.push("--chdir");
        args.push(&plan.working_dir);

        if plan.seccomp.is_some() {
            args.push("--seccomp");
            args.push(SECCOMP_FD.to_string());
        }

        args.push("--");
        args.push(&plan.executable);
        for arg in &plan.args {
            args.push(arg);
        }

        args.finish()
    }

    /// Encodes whole-sandbox limits as `systemd-run -p` properties.
    pub fn cgroup_properties(limits: &ResourceLimits) -> Vec<String> {
        let mut properties = Vec::new();
        if let Some(bytes) = limits.memory_limit {
            properties.push(format!("MemoryMax={bytes}"));
        }
        if let Some(percent) = limits.cpu_limit {
            properties.push(format!("CPUQuota={percent}%"));
        }
        if let Some(weight) = limits.io_weight {
            properties.push(format!("IOWeight={weight}"));
        }
        if let Some(tasks) = limits.max_processes {
            properties.push(format!("TasksMax={tasks}"));
        }
        properties
    }

    /// Decides how each limit of `plan` is applied.
    pub fn enforcement(&self, plan: &LaunchPlan) -> Enforcement {
        let limits = &plan.resource_limits;
        let requested = &plan.requested_limits;
        let mut enforcement = Enforcement::default();

        // Per-process limits, safe to apply at any level.
        for (resource, value) in [
            (Resource::RLIMIT_NOFILE, limits.max_files),
            (Resource::RLIMIT_FSIZE, limits.max_file_size),
        ] {
            if let Some(value) = value {
                enforcement.rlimits.push((resource, value));
            }
        }

        let properties = Self::cgroup_properties(limits);
        if properties.is_empty() {
            return enforcement;
        }
        if self.systemd_run.is_some() {
            enforcement.properties = properties;
            return enforcement;
        }

        for (name, resource, effective, explicit) in [
            (
                "memory_limit",
                Resource::RLIMIT_AS,
                limits.memory_limit,
                requested.memory_limit.is_some(),
            ),
            (
                "max_processes",
                Resource::RLIMIT_NPROC,
                limits.max_processes,
                requested.max_processes.is_some(),
            ),
        ] {
            match effective {
                Some(value) if explicit => enforcement.rlimits.push((resource, value)),
                Some(_) => enforcement.unenforced.push(name),
                None => {}
            }
        }
        if limits.cpu_limit.is_some() {
            enforcement.unenforced.push("cpu_limit");
        }
        if limits.io_weight.is_some() {
            enforcement.unenforced.push("io_weight");
        }
        enforcement
    }

    fn command(&self, plan: &LaunchPlan, enforcement: &Enforcement) -> Result<Command> {
        let bwrap_args = self.arguments(plan)?;

        let mut command = match &self.systemd_run {
            Some(systemd_run) if !enforcement.properties.is_empty() => {
                let mut command = Command::new(systemd_run);
                command.args(["--user", "--scope", "--quiet", "--collect"]);
                for property in &enforcement.properties {
                    command.arg("-p").arg(property);
                }
                command.arg("--").arg(&self.program);
                command
            }
            _ => Command::new(&self.program),
        };
        command.args(bwrap_args);
        Ok(command)
    }
}

impl SandboxExecutor for Bubblewrap {
    fn spawn(&self, plan: &LaunchPlan) -> Result<Child> {
        let enforcement = self.enforcement(plan);
        let mut command = self.command(plan, &enforcement)?;

        let seccomp = plan
            .seccomp
            .as_ref()
            .map(|path| {
                File::open(path).map_err(|e| {
                    IsolatorError::SpawnFailure(format!(
                        "cannot open seccomp filter {}: {e}",
                        path.display()
                    ))
                })
            })
            .transpose()?;
        let seccomp_fd = seccomp.as_ref().map(|file| file.as_raw_fd());
        let rlimits = enforcement.rlimits;

        // SAFETY: the closure only calls async-signal-safe functions
        // (setrlimit, dup2, fcntl) between fork and exec.
        unsafe {
            command.pre_exec(move || {
                apply_rlimits(&rlimits)?;
                if let Some(fd) = seccomp_fd {
                    pass_fd(fd, SECCOMP_FD)?;
                }
                Ok(())
            });
        }

        command
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| {
            IsolatorError::SpawnFailure(format!("{}: {e}", self.program.display()))
        })?;
        drop(seccomp);
        Ok(child)
    }

    fn name(&self) -> &str {
        "bubblewrap"
    }

    fn enforcement_warnings(&self, plan: &LaunchPlan) -> Vec<Warning> {
        self.enforcement(plan)
            .unenforced
            .into_iter()
            .map(|limit| Warning::LimitNotEnforced {
                limit: limit.into(),
            })
            .collect()
    }
}

/// A user manager is only reachable inside a login session.
fn user_session_present() -> bool {
    ["DBUS_SESSION_BUS_ADDRESS", "XDG_RUNTIME_DIR"]
        .iter()
        .any(|name| std::env::var_os(name).is_some_and(|v| !v.is_empty()))
}

/// Checks that `program` can start a user scope, by running `true` in one.
pub fn systemd_run_works(program: &Path) -> bool {
    let status = std::process::Command::new(program)
        .args(["--user", "--scope", "--quiet", "--collect", "--", "true"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match status {
        Ok(status) if status.success() => true,
        Ok(status) => {
            tracing::debug!("{} cannot create a user scope ({})", program.display(), status);
            false
        }
        Err(err) => {
            tracing::debug!("{} failed to run: {}", program.display(), err);
            false
        }
    }
}

fn apply_rlimits(rlimits: &[(Resource, u64)]) -> std::io::Result<()> {
    for (resource, value) in rlimits {
        nix::sys::resource::setrlimit(*resource, *value, *value)?;
    }
    Ok(())
}

/// Makes `fd` available as `target` in the exec'd program.
fn pass_fd(fd: i32, target: i32) -> std::io::Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};

    if fd == target {
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
    } else {
        nix::unistd::dup2(fd, target)?;
    }
    Ok(())
}

/// Argument accumulator that rejects embedded NUL bytes.
#[derive(Default)]
struct Args {
    args: Vec<OsString>,
    invalid: Option<OsString>,
}

impl Args {
    fn push(&mut self, arg: impl AsRef<OsStr>) {
        let arg = arg.as_ref();
        if self.invalid.is_none() && arg.as_encoded_bytes().contains(&0) {
            self.invalid = Some(arg.to_os_string());
        }
        self.args.push(arg.to_os_string());
    }

    fn extend<const N: usize>(&mut self, args: [&str; N]) {
        for arg in args {
            self.push(arg);
        }
    }

    fn finish(self) -> Result<Vec<OsString>> {
        match self.invalid {
            Some(arg) => Err(IsolatorError::SpawnFailure(format!(
                "argument {arg:?} contains a NUL byte"
            ))),
            None => Ok(self.args),
        }
    }
}
