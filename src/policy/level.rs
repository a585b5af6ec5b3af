//! Isolation levels and the restriction template each one maps to.
//!
//! [`template`] is a pure lookup. Precedence when applying a template:
//!
//! 1. hard blocks (unsafe capabilities, blocked devices, strict network) always win
//! 2. an explicit profile request beats a level soft default
//! 3. soft defaults (capability allow-lists, device pruning) apply otherwise

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::IsolatorError;
use crate::profile::{Capability, ResourceLimits, RuntimeSocket};

/// How aggressively a launch is isolated. Ordered `Minimal < Standard < Strict`.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    Minimal,
    #[default]
    Standard,
    Strict,
}

impl IsolationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Standard => "standard",
            Self::Strict => "strict",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IsolationLevel {
    type Err = IsolatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minimal" => Ok(Self::Minimal),
            "standard" => Ok(Self::Standard),
            "strict" => Ok(Self::Strict),
            other => Err(IsolatorError::InvalidOverride(format!(
                "unknown isolation level '{other}'"
            ))),
        }
    }
}

/// Kernel namespaces the primitive is asked to unshare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Pid,
    Ipc,
    Mount,
    Uts,
    User,
    Cgroup,
    Net,
}

/// Whether the level lets network through at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkRule {
    /// Network is on unless the caller turns it off.
    Allowed,
    /// Network is off and no override can turn it on.
    HardBlocked,
}

/// How display-server credentials reach the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialMode {
    /// Reuse the host's existing credential.
    PassThrough,
    /// Mint a credential scoped to the session.
    SessionScoped,
}

/// Restrictions an isolation level applies on top of a profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestrictionTemplate {
    pub level: IsolationLevel,
    pub namespaces: BTreeSet<Namespace>,
    /// Capabilities a profile may keep without an explicit override.
    pub permitted_capabilities: BTreeSet<Capability>,
    pub network: NetworkRule,
    pub gui_default: bool,
    pub display_credentials: CredentialMode,
    /// Device globs removed unless the profile itself asks for them.
    pub soft_blocked_devices: &'static [&'static str],
    /// Device globs removed regardless of profile or override.
    pub hard_blocked_devices: Vec<&'static str>,
    /// Host sockets withheld even when the profile asks for them.
    pub blocked_sockets: &'static [RuntimeSocket],
    /// Caps for the whole sandbox. Enforced per cgroup, never as
    /// per-user rlimits.
    pub limits: ResourceLimits,
}

/// Capabilities that are never granted, at any level, by any means.
pub const UNSAFE_CAPABILITIES: &[Capability] = &[
    Capability::SysModule,
    Capability::SysRawio,
    Capability::SysBoot,
    Capability::MacAdmin,
    Capability::MacOverride,
    Capability::Bpf,
];

/// Capabilities `standard` strips in addition to the unsafe set.
const STANDARD_STRIPPED: &[Capability] = &[
    Capability::SysPtrace,
    Capability::SysTime,
    Capability::SysPacct,
    Capability::SysTtyConfig,
    Capability::DacReadSearch,
    Capability::LinuxImmutable,
    Capability::AuditControl,
    Capability::AuditRead,
    Capability::Syslog,
    Capability::Perfmon,
    Capability::WakeAlarm,
    Capability::BlockSuspend,
];

/// Raw memory access, blocked at every level.
const RAW_MEMORY_DEVICES: &[&str] = &["/dev/mem", "/dev/kmem", "/dev/port"];

/// Raw block devices, hard-blocked at `strict`.
const RAW_BLOCK_DEVICES: &[&str] = &[
    "/dev/sd*",
    "/dev/hd*",
    "/dev/vd*",
    "/dev/xvd*",
    "/dev/nvme*",
    "/dev/mmcblk*",
    "/dev/loop*",
    "/dev/dm-*",
];

/// Graphics devices, soft-pruned at `strict`.
const GRAPHICS_DEVICES: &[&str] = &[
    "/dev/dri",
    "/dev/dri/**",
    "/dev/fb*",
    "/dev/nvidia*",
    "/dev/kfd",
];

pub fn is_unsafe(cap: Capability) -> bool {
    UNSAFE_CAPABILITIES.contains(&cap)
}

fn all_except(excluded: &[&[Capability]]) -> BTreeSet<Capability> {
    Capability::ALL
        .iter()
        .copied()
        .filter(|cap| !excluded.iter().any(|set| set.contains(cap)))
        .collect()
}

/// Returns the restriction template for `level`.
pub fn template(level: IsolationLevel) -> RestrictionTemplate {
    match level {
        IsolationLevel::Minimal => RestrictionTemplate {
            level,
            namespaces: BTreeSet::from([Namespace::Pid, Namespace::Ipc]),
            permitted_capabilities: all_except(&[UNSAFE_CAPABILITIES]),
            network: NetworkRule::Allowed,
            gui_default: true,
            display_credentials: CredentialMode::PassThrough,
            soft_blocked_devices: &[],
            hard_blocked_devices: RAW_MEMORY_DEVICES.to_vec(),
            blocked_sockets: &[],
            limits: ResourceLimits::default(),
        },
        IsolationLevel::Standard => RestrictionTemplate {
            level,
            namespaces: BTreeSet::from([
                Namespace::Pid,
                Namespace::Ipc,
                Namespace::Mount,
                Namespace::Uts,
            ]),
            permitted_capabilities: all_except(&[UNSAFE_CAPABILITIES, STANDARD_STRIPPED]),
            network: NetworkRule::Allowed,
            gui_default: true,
            display_credentials: CredentialMode::PassThrough,
            soft_blocked_devices: &[],
            hard_blocked_devices: RAW_MEMORY_DEVICES.to_vec(),
            blocked_sockets: &[],
            limits: ResourceLimits {
                max_processes: Some(1024),
                max_files: Some(4096),
                ..Default::default()
            },
        },
        IsolationLevel::Strict => RestrictionTemplate {
            level,
            namespaces: BTreeSet::from([
                Namespace::Pid,
                Namespace::Ipc,
                Namespace::Mount,
                Namespace::Uts,
                Namespace::User,
                Namespace::Cgroup,
            ]),
            permitted_capabilities: BTreeSet::new(),
            network: NetworkRule::HardBlocked,
            gui_default: true,
            display_credentials: CredentialMode::SessionScoped,
            soft_blocked_devices: GRAPHICS_DEVICES,
            hard_blocked_devices: RAW_MEMORY_DEVICES
                .iter()
                .chain(RAW_BLOCK_DEVICES)
                .copied()
                .collect(),
            blocked_sockets: &[RuntimeSocket::SessionBus, RuntimeSocket::SystemBus],
            limits: ResourceLimits {
                memory_limit: Some(4 << 30),
                max_processes: Some(64),
                max_files: Some(1024),
                max_file_size: Some(1 << 30),
                ..Default::default()
            },
        },
    }
}
