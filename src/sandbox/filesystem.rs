//! Filesystem plan: the ordered bind mounts a sandbox sees.
//!
//! Mounts are laid down in five fixed stages:
//!
//! 1. read-only system paths plus fresh `/proc` and `/dev`
//! 2. read-only profile mounts (missing sources are skipped with a warning)
//! 3. the per-session ephemeral home and `/tmp`
//! 4. runtime sockets the policy exposes (pulse, session and system bus)
//! 5. the optional persistent directory at [`PERSIST_TARGET`]
//!
//! When two entries share a target, the later entry's mode wins and the host
//! sources of both are kept in the exposed-paths audit list.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::TempDir;

use crate::error::{IsolatorError, Result, Warning};
use crate::policy::Policy;
use crate::profile::RuntimeSocket;
use crate::utils::paths::is_writable_dir;

/// Where the persistent directory appears inside the sandbox.
pub const PERSIST_TARGET: &str = "/persist";

/// Where the system bus directory appears inside the sandbox.
pub const SYSTEM_BUS_TARGET: &str = "/run/dbus";

/// Host paths every sandbox gets read-only, when present.
pub const SYSTEM_MOUNTS: &[&str] = &["/usr", "/bin", "/sbin", "/lib", "/lib64", "/etc", "/opt"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MountKind {
    /// Host path bound into the sandbox.
    Bind,
    /// Empty in-memory filesystem.
    Tmpfs,
    /// Fresh procfs for the sandbox's pid namespace.
    Proc,
    /// Minimal devtmpfs with the standard nodes.
    Dev,
}

/// One mount directive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountSpec {
    pub kind: MountKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    pub target: PathBuf,
    pub mode: AccessMode,
}

impl MountSpec {
    /// Read-only bind, same path inside and outside.
    pub fn ro(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self::bind(path.clone(), path, AccessMode::ReadOnly)
    }

    /// Read-write bind, same path inside and outside.
    pub fn rw(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self::bind(path.clone(), path, AccessMode::ReadWrite)
    }

    pub fn bind(source: impl Into<PathBuf>, target: impl Into<PathBuf>, mode: AccessMode) -> Self {
        Self {
            kind: MountKind::Bind,
            source: Some(source.into()),
            target: target.into(),
            mode,
        }
    }

    pub fn tmpfs(target: impl Into<PathBuf>) -> Self {
        Self::virtual_fs(MountKind::Tmpfs, target)
    }

    pub fn proc() -> Self {
        Self::virtual_fs(MountKind::Proc, "/proc")
    }

    pub fn dev() -> Self {
        Self::virtual_fs(MountKind::Dev, "/dev")
    }

    fn virtual_fs(kind: MountKind, target: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            source: None,
            target: target.into(),
            mode: AccessMode::ReadWrite,
        }
    }
}

/// Per-session scratch space, removed when dropped or closed.
///
/// Holds a `home/` directory bound as the sandbox home and a `tmp/` directory
/// bound at `/tmp`.
#[derive(Debug)]
pub struct EphemeralDir {
    dir: TempDir,
}

impl EphemeralDir {
    /// Creates the directory under `$XDG_RUNTIME_DIR` when it exists, or the
    /// system temp directory otherwise.
    pub fn create() -> Result<Self> {
        let base = std::env::var_os("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .filter(|dir| is_writable_dir(dir))
            .unwrap_or_else(std::env::temp_dir);
        Self::create_in(&base)
    }

    pub fn create_in(base: &Path) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("isolator-").tempdir_in(base)?;
        std::fs::create_dir(dir.path().join("home"))?;
        std::fs::create_dir(dir.path().join("tmp"))?;
        tracing::debug!("Created ephemeral directory {}", dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn home(&self) -> PathBuf {
        self.path().join("home")
    }

    pub fn tmp(&self) -> PathBuf {
        self.path().join("tmp")
    }

    /// Removes the directory tree, reporting any failure.
    pub fn close(self) -> Result<()> {
        let path = self.path().to_path_buf();
        self.dir.close()?;
        tracing::debug!("Removed ephemeral directory {}", path.display());
        Ok(())
    }
}

/// The ordered mounts produced from a policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilesystemPlan {
    pub mounts: Vec<MountSpec>,
    /// Every host path exposed by any mount, including overridden ones.
    pub exposed_host_paths: BTreeSet<PathBuf>,
    /// Variables pointing at exposed sockets.
    pub env: BTreeMap<String, String>,
    pub warnings: Vec<Warning>,
}

impl FilesystemPlan {
    /// Appends a mount, replacing any earlier mount on the same target.
    pub fn push(&mut self, mount: MountSpec) {
        if let Some(source) = &mount.source {
            self.exposed_host_paths.insert(source.clone());
        }
        if let Some(index) = self.mounts.iter().position(|m| m.target == mount.target) {
            let earlier = self.mounts.remove(index);
            tracing::info!(
                "Mount target {} redeclared ({:?} -> {:?}), exposed host paths: {:?}",
                mount.target.display(),
                earlier.mode,
                mount.mode,
                earlier.source.iter().chain(mount.source.iter()).collect::<Vec<_>>()
            );
        }
        self.mounts.push(mount);
    }

    fn warn(&mut self, warning: Warning) {
        warning.emit();
        self.warnings.push(warning);
    }
}

/// Builds [`FilesystemPlan`]s for a fixed sandbox home and system mount list.
#[derive(Debug, Clone)]
pub struct FilesystemPlanBuilder {
    sandbox_home: PathBuf,
    system_mounts: Vec<PathBuf>,
    runtime_dir: PathBuf,
    system_bus_dir: PathBuf,
    create_persist: bool,
}

impl FilesystemPlanBuilder {
    /// Uses the host `$XDG_RUNTIME_DIR` (or `/run/user/<uid>`) for session
    /// sockets.
    pub fn new(sandbox_home: impl Into<PathBuf>) -> Self {
        let runtime_dir = std::env::var_os("XDG_RUNTIME_DIR")
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                PathBuf::from(format!("/run/user/{}", nix::unistd::getuid()))
            });
        Self {
            sandbox_home: sandbox_home.into(),
            system_mounts: SYSTEM_MOUNTS.iter().map(PathBuf::from).collect(),
            runtime_dir,
            system_bus_dir: PathBuf::from(SYSTEM_BUS_TARGET),
            create_persist: true,
        }
    }

    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = dir.into();
        self
    }

    pub fn with_system_bus_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.system_bus_dir = dir.into();
        self
    }

    /// When `false`, a missing persistent directory is only checked for
    /// creatability, not created.
    pub fn with_persist_creation(mut self, create: bool) -> Self {
        self.create_persist = create;
        self
    }

    pub fn with_system_mounts<I, P>(mut self, mounts: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.system_mounts = mounts.into_iter().map(Into::into).collect();
        self
    }

    pub fn sandbox_home(&self) -> &Path {
        &self.sandbox_home
    }

    /// Computes the mount list for `policy`, using `ephemeral` for the
    /// writable home and `/tmp`.
    ///
    /// Creates the persistent directory if it does not exist yet, unless
    /// disabled with [`FilesystemPlanBuilder::with_persist_creation`].
    ///
    /// # Errors
    ///
    /// - [`IsolatorError::PlanInvalid`] if the sandbox home is not absolute or
    ///   the persistent path exists but is not a directory
    /// - [`IsolatorError::PersistentPathUnwritable`] if the persistent path
    ///   cannot be created or written to
    pub fn build(&self, policy: &Policy, ephemeral: &EphemeralDir) -> Result<FilesystemPlan> {
        if !self.sandbox_home.is_absolute() {
            return Err(IsolatorError::PlanInvalid(format!(
                "sandbox home {} is not absolute",
                self.sandbox_home.display()
            )));
        }

        let mut plan = FilesystemPlan::default();

        for path in self.system_mounts.iter().filter(|p| p.exists()) {
            plan.push(MountSpec::ro(path));
        }
        plan.push(MountSpec::proc());
        plan.push(MountSpec::dev());

        let mut under_home = Vec::new();
        for path in &policy.mounts {
            if !path.exists() {
                plan.warn(Warning::MountSourceMissing { path: path.clone() });
                continue;
            }
            let mount = MountSpec::ro(path);
            if path.starts_with(&self.sandbox_home) {
                under_home.push(mount.clone());
            }
            plan.push(mount);
        }

        plan.push(MountSpec::bind(
            ephemeral.home(),
            &self.sandbox_home,
            AccessMode::ReadWrite,
        ));
        plan.push(MountSpec::bind(ephemeral.tmp(), "/tmp", AccessMode::ReadWrite));
        // The home bind hides anything mounted beneath it.
        for mount in under_home {
            plan.push(mount);
        }

        for socket in &policy.runtime_sockets {
            self.expose_socket(&mut plan, *socket);
        }

        if let Some(persist) = &policy.persist_path {
            prepare_persist_dir(persist, self.create_persist)?;
            plan.push(MountSpec::bind(persist, PERSIST_TARGET, AccessMode::ReadWrite));
        }

        tracing::debug!("Filesystem plan has {} mounts", plan.mounts.len());
        Ok(plan)
    }

    fn expose_socket(&self, plan: &mut FilesystemPlan, socket: RuntimeSocket) {
        let (source, target) = match socket {
            RuntimeSocket::Pulse => {
                let dir = self.runtime_dir.join("pulse");
                (dir.clone(), dir)
            }
            RuntimeSocket::SessionBus => {
                let bus = self.runtime_dir.join("bus");
                (bus.clone(), bus)
            }
            RuntimeSocket::SystemBus => {
                (self.system_bus_dir.clone(), PathBuf::from(SYSTEM_BUS_TARGET))
            }
        };

        if !source.exists() {
            plan.warn(Warning::MountSourceMissing { path: source });
            return;
        }

        tracing::debug!("Exposing {} socket at {}", socket, target.display());
        if socket == RuntimeSocket::SessionBus {
            plan.env.insert(
                "DBUS_SESSION_BUS_ADDRESS".into(),
                format!("unix:path={}", target.display()),
            );
        }
        if socket != RuntimeSocket::SystemBus {
            plan.env.insert(
                "XDG_RUNTIME_DIR".into(),
                self.runtime_dir.to_string_lossy().into_owned(),
            );
        }
        plan.push(MountSpec::bind(source, target, AccessMode::ReadWrite));
    }
}

fn prepare_persist_dir(path: &Path, create: bool) -> Result<()> {
    if path.exists() && !path.is_dir() {
        return Err(IsolatorError::PlanInvalid(format!(
            "persistent path {} is not a directory",
            path.display()
        )));
    }
    if !path.exists() && !create {
        let creatable = path
            .ancestors()
            .skip(1)
            .find(|ancestor| ancestor.exists())
            .is_some_and(is_writable_dir);
        if !creatable {
            return Err(IsolatorError::PersistentPathUnwritable(path.to_path_buf()));
        }
        tracing::debug!("Persistent directory {} would be created", path.display());
        return Ok(());
    }
    if !path.exists() {
        std::fs::create_dir_all(path)
            .map_err(|_| IsolatorError::PersistentPathUnwritable(path.to_path_buf()))?;
        tracing::info!("Created persistent directory {}", path.display());
    }
    if !is_writable_dir(path) {
        return Err(IsolatorError::PersistentPathUnwritable(path.to_path_buf()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{resolve, IsolationLevel, Overrides};
    use crate::profile::{Profile, ProfileStore};
    use pretty_assertions::assert_eq;

    fn policy_with(mounts: Vec<PathBuf>, persist: Option<PathBuf>) -> Policy {
        let mut store = ProfileStore::builtin();
        store.insert(Profile::new("fs").with_mounts(mounts));
        let overrides = Overrides {
            persist,
            ..Default::default()
        };
        resolve(&store, "fs", IsolationLevel::Standard, &overrides).unwrap()
    }

    fn targets(plan: &FilesystemPlan) -> Vec<PathBuf> {
        plan.mounts.iter().map(|m| m.target.clone()).collect()
    }

    #[test]
    fn test_mount_order() {
        let scratch = tempfile::tempdir().unwrap();
        let system = scratch.path().join("usr");
        let fonts = scratch.path().join("fonts");
        std::fs::create_dir(&system).unwrap();
        std::fs::create_dir(&fonts).unwrap();

        let ephemeral = EphemeralDir::create_in(scratch.path()).unwrap();
        let persist = scratch.path().join("persist");
        let policy = policy_with(vec![fonts.clone()], Some(persist.clone()));

        let plan = FilesystemPlanBuilder::new("/home/sandbox")
            .with_system_mounts([system.clone(), scratch.path().join("absent")])
            .build(&policy, &ephemeral)
            .unwrap();

        assert_eq!(
            targets(&plan),
            vec![
                system.clone(),
                PathBuf::from("/proc"),
                PathBuf::from("/dev"),
                fonts.clone(),
                PathBuf::from("/home/sandbox"),
                PathBuf::from("/tmp"),
                PathBuf::from(PERSIST_TARGET),
            ]
        );
        assert_eq!(plan.mounts[3].mode, AccessMode::ReadOnly);
        assert_eq!(plan.mounts[4].source, Some(ephemeral.home()));
        assert_eq!(plan.mounts[4].mode, AccessMode::ReadWrite);
        assert!(persist.is_dir());
        assert!(plan.warnings.is_empty());
    }

    #[test]
    fn test_missing_profile_mount_is_skipped_with_warning() {
        let scratch = tempfile::tempdir().unwrap();
        let ephemeral = EphemeralDir::create_in(scratch.path()).unwrap();
        let missing = scratch.path().join("no-such-dir");
        let policy = policy_with(vec![missing.clone()], None);

        let plan = FilesystemPlanBuilder::new("/home/sandbox")
            .with_system_mounts(Vec::<PathBuf>::new())
            .build(&policy, &ephemeral)
            .unwrap();

        assert!(!targets(&plan).contains(&missing));
        assert_eq!(plan.warnings, vec![Warning::MountSourceMissing { path: missing }]);
    }

    #[test]
    fn test_mounts_under_home_survive_home_bind() {
        let scratch = tempfile::tempdir().unwrap();
        let home = scratch.path().join("home");
        let fonts = home.join(".fonts");
        std::fs::create_dir_all(&fonts).unwrap();
        let ephemeral = EphemeralDir::create_in(scratch.path()).unwrap();
        let policy = policy_with(vec![fonts.clone()], None);

        let plan = FilesystemPlanBuilder::new(&home)
            .with_system_mounts(Vec::<PathBuf>::new())
            .build(&policy, &ephemeral)
            .unwrap();

        let order = targets(&plan);
        let home_at = order.iter().position(|t| *t == home).unwrap();
        let fonts_at = order.iter().position(|t| *t == fonts).unwrap();
        assert!(fonts_at > home_at);
    }

    #[test]
    fn test_later_mount_overrides_mode_and_audits_sources() {
        let mut plan = FilesystemPlan::default();
        plan.push(MountSpec::ro("/srv/data"));
        plan.push(MountSpec::bind("/var/scratch", "/srv/data", AccessMode::ReadWrite));

        assert_eq!(plan.mounts.len(), 1);
        assert_eq!(plan.mounts[0].mode, AccessMode::ReadWrite);
        assert_eq!(
            plan.exposed_host_paths,
            BTreeSet::from([PathBuf::from("/srv/data"), PathBuf::from("/var/scratch")])
        );
    }

    #[test]
    fn test_persist_path_that_is_a_file_is_invalid() {
        let scratch = tempfile::tempdir().unwrap();
        let file = scratch.path().join("file");
        std::fs::write(&file, b"x").unwrap();
        let ephemeral = EphemeralDir::create_in(scratch.path()).unwrap();
        let policy = policy_with(Vec::new(), Some(file));

        let err = FilesystemPlanBuilder::new("/home/sandbox")
            .build(&policy, &ephemeral)
            .unwrap_err();
        assert!(matches!(err, IsolatorError::PlanInvalid(_)));
    }

    #[test]
    fn test_persist_path_that_cannot_be_created() {
        let scratch = tempfile::tempdir().unwrap();
        let blocker = scratch.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let ephemeral = EphemeralDir::create_in(scratch.path()).unwrap();
        let policy = policy_with(Vec::new(), Some(blocker.join("nested")));

        let err = FilesystemPlanBuilder::new("/home/sandbox")
            .build(&policy, &ephemeral)
            .unwrap_err();
        assert!(matches!(err, IsolatorError::PersistentPathUnwritable(_)));
    }

    #[test]
    fn test_persist_dir_is_not_created_when_only_planning() {
        let scratch = tempfile::tempdir().unwrap();
        let ephemeral = EphemeralDir::create_in(scratch.path()).unwrap();
        let persist = scratch.path().join("keep").join("me");
        let policy = policy_with(Vec::new(), Some(persist.clone()));

        let plan = FilesystemPlanBuilder::new("/home/sandbox")
            .with_system_mounts(Vec::<PathBuf>::new())
            .with_persist_creation(false)
            .build(&policy, &ephemeral)
            .unwrap();

        assert!(targets(&plan).contains(&PathBuf::from(PERSIST_TARGET)));
        assert!(!scratch.path().join("keep").exists());

        let blocker = scratch.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let policy = policy_with(Vec::new(), Some(blocker.join("nested")));
        let err = FilesystemPlanBuilder::new("/home/sandbox")
            .with_persist_creation(false)
            .build(&policy, &ephemeral)
            .unwrap_err();
        assert!(matches!(err, IsolatorError::PersistentPathUnwritable(_)));
    }

    #[test]
    fn test_multimedia_reaches_pulse_and_session_bus() {
        let scratch = tempfile::tempdir().unwrap();
        let runtime = scratch.path().join("run-user");
        std::fs::create_dir_all(runtime.join("pulse")).unwrap();
        std::fs::write(runtime.join("bus"), b"").unwrap();
        let ephemeral = EphemeralDir::create_in(scratch.path()).unwrap();
        let policy = resolve(
            &ProfileStore::builtin(),
            "multimedia",
            IsolationLevel::Standard,
            &Overrides::default(),
        )
        .unwrap();

        let plan = FilesystemPlanBuilder::new("/home/sandbox")
            .with_system_mounts(Vec::<PathBuf>::new())
            .with_runtime_dir(&runtime)
            .build(&policy, &ephemeral)
            .unwrap();

        let pulse = plan
            .mounts
            .iter()
            .find(|m| m.target == runtime.join("pulse"))
            .unwrap();
        assert_eq!(pulse.mode, AccessMode::ReadWrite);
        assert!(targets(&plan).contains(&runtime.join("bus")));
        assert_eq!(
            plan.env["DBUS_SESSION_BUS_ADDRESS"],
            format!("unix:path={}", runtime.join("bus").display())
        );
        assert_eq!(plan.env["XDG_RUNTIME_DIR"], runtime.to_string_lossy());
    }

    #[test]
    fn test_missing_socket_is_skipped_with_warning() {
        let scratch = tempfile::tempdir().unwrap();
        let ephemeral = EphemeralDir::create_in(scratch.path()).unwrap();
        let mut store = ProfileStore::builtin();
        store.insert(Profile::new("bus").with_runtime_sockets([RuntimeSocket::SystemBus]));
        let policy =
            resolve(&store, "bus", IsolationLevel::Minimal, &Overrides::default()).unwrap();
        let missing = scratch.path().join("no-dbus");

        let plan = FilesystemPlanBuilder::new("/home/sandbox")
            .with_system_mounts(Vec::<PathBuf>::new())
            .with_system_bus_dir(&missing)
            .build(&policy, &ephemeral)
            .unwrap();

        assert!(!targets(&plan).contains(&PathBuf::from(SYSTEM_BUS_TARGET)));
        assert_eq!(plan.warnings, vec![Warning::MountSourceMissing { path: missing }]);
        assert!(plan.env.is_empty());
    }

    #[test]
    fn test_ephemeral_dirs_are_unique_and_removed() {
        let scratch = tempfile::tempdir().unwrap();
        let first = EphemeralDir::create_in(scratch.path()).unwrap();
        let second = EphemeralDir::create_in(scratch.path()).unwrap();
        assert_ne!(first.path(), second.path());
        assert!(first.home().is_dir() && first.tmp().is_dir());

        let path = first.path().to_path_buf();
        first.close().unwrap();
        assert!(!path.exists());

        let path = second.path().to_path_buf();
        drop(second);
        assert!(!path.exists());
    }
}
