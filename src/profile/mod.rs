//! Application profiles: named bundles of mounts, devices, capabilities,
//! environment and resource declarations.
//!
//! A profile only carries the attributes it declares. Undeclared attributes
//! (`None`) are inherited from the default profile during resolution, while a
//! declared list (even an empty one) replaces the default's list outright.

mod capability;
mod limits;
mod store;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{IsolatorError, Result};

pub use capability::Capability;
pub use limits::{LimitValue, ResourceLimitSpec, ResourceLimits};
pub use store::{detect_profile, ProfileStore, DEFAULT_PROFILE};

/// A profile definition document.
///
/// ```yaml
/// name: browser
/// mounts: [/usr/share/fonts, /usr/share/themes]
/// devices: [/dev/dri]
/// capabilities: [CAP_SYS_ADMIN]
/// env_vars: { NO_AT_BRIDGE: "1" }
/// seccomp_profile: browser
/// network_ports: [80, 443]
/// resource_limits: { memory_limit: 4G, max_processes: 512 }
/// runtime_sockets: [session_bus]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mounts: Option<Vec<PathBuf>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devices: Option<Vec<PathBuf>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<BTreeSet<Capability>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_vars: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seccomp_profile: Option<String>,
    /// Ports the application is expected to use. Informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_ports: Option<BTreeSet<u16>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_limits: Option<ResourceLimits>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_sockets: Option<BTreeSet<RuntimeSocket>>,
}

/// Host session sockets a profile can ask to reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeSocket {
    /// The PulseAudio directory, `$XDG_RUNTIME_DIR/pulse`.
    Pulse,
    /// The D-Bus session bus, `$XDG_RUNTIME_DIR/bus`.
    SessionBus,
    /// The D-Bus system bus directory, `/run/dbus`.
    SystemBus,
}

impl RuntimeSocket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pulse => "pulse",
            Self::SessionBus => "session_bus",
            Self::SystemBus => "system_bus",
        }
    }
}

impl std::fmt::Display for RuntimeSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Profile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_mounts<I, P>(mut self, mounts: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.mounts = Some(mounts.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_devices<I, P>(mut self, devices: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.devices = Some(devices.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_capabilities(mut self, caps: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities = Some(caps.into_iter().collect());
        self
    }

    pub fn with_env<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.env_vars
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_seccomp(mut self, reference: impl Into<String>) -> Self {
        self.seccomp_profile = Some(reference.into());
        self
    }

    pub fn with_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.network_ports = Some(ports.into_iter().collect());
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = Some(limits);
        self
    }

    pub fn with_runtime_sockets(mut self, sockets: impl IntoIterator<Item = RuntimeSocket>) -> Self {
        self.runtime_sockets = Some(sockets.into_iter().collect());
        self
    }

    /// Parses and validates a YAML profile document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let profile: Profile = serde_yaml::from_str(yaml)
            .map_err(|e| IsolatorError::Config(format!("invalid profile document: {e}")))?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| IsolatorError::Config(format!("failed to serialize profile: {e}")))
    }

    /// Checks the profile invariants: a non-empty name, absolute and unique
    /// mount and device paths, and well-formed environment keys.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(IsolatorError::Config("profile name cannot be empty".into()));
        }

        for (field, paths) in [("mounts", &self.mounts), ("devices", &self.devices)] {
            let Some(paths) = paths else { continue };
            let mut seen = HashSet::new();
            for path in paths {
                if !path.is_absolute() {
                    return Err(IsolatorError::Config(format!(
                        "profile '{}': {field} entry {} must be absolute",
                        self.name,
                        path.display()
                    )));
                }
                if !seen.insert(path) {
                    return Err(IsolatorError::Config(format!(
                        "profile '{}': duplicate {field} entry {}",
                        self.name,
                        path.display()
                    )));
                }
            }
        }

        if let Some(env) = &self.env_vars {
            if let Some(key) = env.keys().find(|k| !is_valid_env_key(k)) {
                return Err(IsolatorError::Config(format!(
                    "profile '{}': invalid environment variable name '{key}'",
                    self.name
                )));
            }
        }

        Ok(())
    }
}

pub(crate) fn is_valid_env_key(key: &str) -> bool {
    !key.is_empty() && !key.contains('=') && !key.contains('\0')
}
