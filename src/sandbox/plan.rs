//! Launch requests and the flattened plan handed to the sandbox primitive.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{IsolatorError, Result, Warning};
use crate::policy::level::is_unsafe;
use crate::policy::{IsolationLevel, Namespace, Overrides, Policy};
use crate::profile::{detect_profile, is_valid_env_key, Capability, ResourceLimits};
use crate::sandbox::display::DisplayPlan;
use crate::sandbox::filesystem::{FilesystemPlan, MountKind, MountSpec};

/// Default directory holding compiled seccomp filters.
pub const SECCOMP_DIR: &str = "/etc/isolator/seccomp";

const SANDBOX_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// What the caller asked to run, and how.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchRequest {
    pub executable: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Profile name; detected from the executable when absent.
    pub profile: Option<String>,
    pub level: IsolationLevel,
    pub overrides: Overrides,
    pub debug: bool,
}

impl LaunchRequest {
    /// Builds a request from a command line, `command[0]` being the executable.
    pub fn new(command: &[String]) -> Result<Self> {
        let (executable, args) = command
            .split_first()
            .ok_or_else(|| IsolatorError::InvalidOverride("command cannot be empty".into()))?;
        Ok(Self {
            executable: executable.clone(),
            args: args.to_vec(),
            ..Default::default()
        })
    }

    /// The requested profile, or one detected from the executable name.
    pub fn profile_name(&self) -> String {
        self.profile
            .clone()
            .unwrap_or_else(|| detect_profile(&self.executable).to_string())
    }
}

/// The complete directive set for one launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchPlan {
    pub profile: String,
    pub level: IsolationLevel,
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub mounts: Vec<MountSpec>,
    pub devices: Vec<PathBuf>,
    pub namespaces: BTreeSet<Namespace>,
    pub network_enabled: bool,
    pub capabilities: BTreeSet<Capability>,
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seccomp: Option<PathBuf>,
    pub resource_limits: ResourceLimits,
    /// The subset of limits the caller asked for explicitly.
    pub requested_limits: ResourceLimits,
    pub exposed_host_paths: BTreeSet<PathBuf>,
    pub warnings: Vec<Warning>,
}

/// Inputs the plan needs besides the policy and request.
#[derive(Debug, Clone)]
pub struct PlanContext {
    pub executable: PathBuf,
    pub sandbox_home: PathBuf,
    pub seccomp_dir: PathBuf,
    /// Warnings raised before assembly, e.g. an unresolved executable.
    pub warnings: Vec<Warning>,
}

impl LaunchPlan {
    /// Flattens a policy plus its filesystem and display plans.
    ///
    /// Display mounts go through [`FilesystemPlan::push`], so they replace a
    /// profile mount on the same target.
    ///
    /// Environment precedence, lowest first: base sandbox environment, socket
    /// variables, display variables, policy variables.
    pub fn assemble(
        policy: &Policy,
        request: &LaunchRequest,
        filesystem: FilesystemPlan,
        display: DisplayPlan,
        context: PlanContext,
    ) -> Result<Self> {
        let mut warnings = policy.warnings.clone();
        warnings.extend(context.warnings);
        warnings.extend(filesystem.warnings.iter().cloned());

        let mut filesystem = filesystem;
        for mount in display.mounts {
            filesystem.push(mount);
        }
        let FilesystemPlan {
            mounts,
            mut exposed_host_paths,
            env: socket_env,
            ..
        } = filesystem;
        exposed_host_paths.extend(policy.devices.iter().cloned());

        let mut env = base_environment(&context.sandbox_home);
        env.extend(socket_env);
        env.extend(display.env);
        env.extend(policy.env_vars.clone());

        let seccomp = match &policy.seccomp_profile {
            Some(reference) => {
                let found = resolve_seccomp(&context.seccomp_dir, reference);
                if found.is_none() {
                    let warning = Warning::SeccompMissing {
                        reference: reference.clone(),
                    };
                    warning.emit();
                    warnings.push(warning);
                }
                found
            }
            None => None,
        };

        let plan = Self {
            profile: policy.profile.clone(),
            level: policy.level,
            executable: context.executable,
            args: request.args.clone(),
            working_dir: request
                .working_dir
                .clone()
                .unwrap_or(context.sandbox_home),
            mounts,
            devices: policy.devices.clone(),
            namespaces: policy.namespaces.clone(),
            network_enabled: policy.network_enabled,
            capabilities: policy.capabilities.clone(),
            env,
            seccomp,
            resource_limits: policy.resource_limits,
            requested_limits: policy.requested_limits,
            exposed_host_paths,
            warnings,
        };
        plan.validate()?;
        Ok(plan)
    }

    /// Checks the plan is internally consistent.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(IsolatorError::PlanInvalid(msg));

        if self.executable.as_os_str().is_empty() {
            return invalid("executable is empty".into());
        }
        if !self.working_dir.is_absolute() {
            return invalid(format!(
                "working directory {} is not absolute",
                self.working_dir.display()
            ));
        }
        for mount in &self.mounts {
            if !mount.target.is_absolute() {
                return invalid(format!("mount target {} is not absolute", mount.target.display()));
            }
            if mount.kind == MountKind::Bind && mount.source.is_none() {
                return invalid(format!("bind mount {} has no source", mount.target.display()));
            }
        }
        if let Some(cap) = self.capabilities.iter().find(|cap| is_unsafe(**cap)) {
            return invalid(format!("capability {cap} may not be retained"));
        }
        if self.network_enabled && self.namespaces.contains(&Namespace::Net) {
            return invalid("network enabled inside an isolated network namespace".into());
        }
        if let Some(key) = self.env.keys().find(|k| !is_valid_env_key(k)) {
            return invalid(format!("invalid environment variable name '{key}'"));
        }
        Ok(())
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| IsolatorError::PlanInvalid(format!("failed to serialize plan: {e}")))
    }
}

/// The variables every sandbox starts with. Empty values are omitted.
pub fn base_environment(sandbox_home: &Path) -> BTreeMap<String, String> {
    let host = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
    let user = host("USER").or_else(|| {
        nix::unistd::User::from_uid(nix::unistd::getuid())
            .ok()
            .flatten()
            .map(|u| u.name)
    });

    [
        ("PATH", Some(SANDBOX_PATH.to_string())),
        ("HOME", Some(sandbox_home.to_string_lossy().into_owned())),
        ("USER", user),
        ("LANG", host("LANG").or_else(|| Some("C.UTF-8".into()))),
        ("TERM", host("TERM").or_else(|| Some("xterm-256color".into()))),
        ("XDG_RUNTIME_DIR", host("XDG_RUNTIME_DIR")),
    ]
    .into_iter()
    .filter_map(|(key, value)| {
        value
            .filter(|v| !v.is_empty())
            .map(|v| (key.to_string(), v))
    })
    .collect()
}

/// Finds the compiled filter for `reference` in `dir`.
///
/// Tries `<dir>/<reference>`, `<dir>/<reference>.bpf`, then `<dir>/default.bpf`.
pub fn resolve_seccomp(dir: &Path, reference: &str) -> Option<PathBuf> {
    if reference.is_empty() || reference.contains('/') {
        tracing::warn!("Ignoring malformed seccomp reference '{}'", reference);
        return None;
    }
    [
        dir.join(reference),
        dir.join(format!("{reference}.bpf")),
        dir.join("default.bpf"),
    ]
    .into_iter()
    .find(|candidate| candidate.is_file())
    .inspect(|found| tracing::debug!("Using seccomp filter {}", found.display()))
}
