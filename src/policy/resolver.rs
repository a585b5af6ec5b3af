//! Merges the default profile, a named profile, an isolation level and
//! caller overrides into one immutable [`Policy`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::Serialize;

use crate::error::{IsolatorError, Result, Warning};
use crate::policy::level::{
    is_unsafe, template, CredentialMode, IsolationLevel, Namespace, NetworkRule,
    RestrictionTemplate,
};
use crate::profile::{
    is_valid_env_key, Capability, ProfileStore, ResourceLimitSpec, ResourceLimits, RuntimeSocket,
};
use crate::utils::glob::PathPatterns;
use crate::utils::paths::expand_tilde;

/// Caller-supplied adjustments, applied after the level template.
///
/// Values stay in their raw textual form until [`resolve`] validates them, so
/// a malformed override surfaces as [`IsolatorError::InvalidOverride`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub network: Option<bool>,
    pub gui: Option<bool>,
    pub persist: Option<PathBuf>,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    /// `KEY=VALUE` assignments.
    pub env: Vec<String>,
    pub limits: ResourceLimitSpec,
}

/// Where a device entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Inherited from the default profile.
    Default,
    /// Declared by the named profile itself.
    Profile,
}

/// The fully merged configuration for one launch.
///
/// Nothing downstream of a `Policy` consults the profile store again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Policy {
    pub profile: String,
    pub level: IsolationLevel,
    pub mounts: Vec<PathBuf>,
    pub devices: Vec<PathBuf>,
    pub capabilities: BTreeSet<Capability>,
    pub namespaces: BTreeSet<Namespace>,
    pub env_vars: BTreeMap<String, String>,
    pub gui_enabled: bool,
    pub network_enabled: bool,
    pub display_credentials: CredentialMode,
    pub persist_path: Option<PathBuf>,
    pub seccomp_profile: Option<String>,
    pub network_ports: BTreeSet<u16>,
    /// Effective limits: profile, overrides and level combined.
    pub resource_limits: ResourceLimits,
    /// Limits given explicitly as overrides, before the level is applied.
    pub requested_limits: ResourceLimits,
    pub runtime_sockets: BTreeSet<RuntimeSocket>,
    pub warnings: Vec<Warning>,
}

/// Resolves `profile_name` at `level` against `store`, applying `overrides`.
///
/// Merge order, lowest precedence first:
///
/// 1. the default profile
/// 2. the named profile (declared lists replace, limits overlay per field)
/// 3. the level template (capability intersection, network and device rules)
/// 4. the overrides
///
/// Hard blocks from the level (unsafe capabilities, blocked devices, strict
/// network) are never lifted by an override. Resource limits end up no looser
/// than the level's.
pub fn resolve(
    store: &ProfileStore,
    profile_name: &str,
    level: IsolationLevel,
    overrides: &Overrides,
) -> Result<Policy> {
    let named = store.get(profile_name)?;
    let base = store.default_profile()?;
    let rules = template(level);
    let mut warnings = Vec::new();

    // The default profile resolved by name has no declarations of its own.
    let is_base = named.name.eq_ignore_ascii_case(&base.name);

    let mounts = named
        .mounts
        .clone()
        .or_else(|| base.mounts.clone())
        .unwrap_or_default();

    let (device_list, device_origin) = match &named.devices {
        Some(devices) if !is_base => (devices.clone(), Origin::Profile),
        _ => (base.devices.clone().unwrap_or_default(), Origin::Default),
    };
    let devices = prune_devices(&rules, device_list, device_origin, &mut warnings)?;

    let requested_caps = named
        .capabilities
        .clone()
        .or_else(|| base.capabilities.clone())
        .unwrap_or_default();
    let mut capabilities = filter_capabilities(&rules, requested_caps, &mut warnings);
    apply_capability_overrides(&mut capabilities, overrides)?;

    let mut env_vars = named
        .env_vars
        .clone()
        .or_else(|| base.env_vars.clone())
        .unwrap_or_default();
    for assignment in &overrides.env {
        let (key, value) = parse_env_assignment(assignment)?;
        env_vars.insert(key, value);
    }

    let network_enabled = match (rules.network, overrides.network) {
        (NetworkRule::HardBlocked, requested) => {
            if requested == Some(true) {
                let warning = Warning::NetworkBlocked {
                    reason: format!("isolation level {level} blocks network"),
                };
                warning.emit();
                warnings.push(warning);
            }
            false
        }
        (NetworkRule::Allowed, requested) => requested.unwrap_or(true),
    };
    let gui_enabled = overrides.gui.unwrap_or(rules.gui_default);

    let mut namespaces = rules.namespaces.clone();
    if !network_enabled {
        namespaces.insert(Namespace::Net);
    }

    let profile_limits = base
        .resource_limits
        .unwrap_or_default()
        .overlay(&named.resource_limits.unwrap_or_default());
    let override_limits = ResourceLimits::try_from(overrides.limits.clone())?;
    let resource_limits = profile_limits
        .overlay(&override_limits)
        .tighter(&rules.limits);

    let mut runtime_sockets = named
        .runtime_sockets
        .clone()
        .or_else(|| base.runtime_sockets.clone())
        .unwrap_or_default();
    runtime_sockets.retain(|socket| {
        if !rules.blocked_sockets.contains(socket) {
            return true;
        }
        let warning = Warning::SocketBlocked {
            socket: socket.to_string(),
            reason: format!("not exposed at level {level}"),
        };
        warning.emit();
        warnings.push(warning);
        false
    });

    let policy = Policy {
        profile: named.name.clone(),
        level,
        mounts,
        devices,
        capabilities,
        namespaces,
        env_vars,
        gui_enabled,
        network_enabled,
        display_credentials: rules.display_credentials,
        persist_path: overrides.persist.as_ref().map(expand_tilde),
        seccomp_profile: named
            .seccomp_profile
            .clone()
            .or_else(|| base.seccomp_profile.clone()),
        network_ports: named
            .network_ports
            .clone()
            .or_else(|| base.network_ports.clone())
            .unwrap_or_default(),
        resource_limits,
        requested_limits: override_limits,
        runtime_sockets,
        warnings,
    };

    tracing::debug!(
        "Resolved policy for profile '{}' at level {}: network={}, gui={}, caps={:?}",
        policy.profile,
        policy.level,
        policy.network_enabled,
        policy.gui_enabled,
        policy.capabilities
    );
    Ok(policy)
}

fn prune_devices(
    rules: &RestrictionTemplate,
    devices: Vec<PathBuf>,
    origin: Origin,
    warnings: &mut Vec<Warning>,
) -> Result<Vec<PathBuf>> {
    let hard = PathPatterns::new(rules.hard_blocked_devices.iter().copied())?;
    let soft = PathPatterns::new(rules.soft_blocked_devices.iter().copied())?;

    let mut kept = Vec::with_capacity(devices.len());
    for device in devices {
        let reason = if let Some(pattern) = hard.matching(&device) {
            Some(format!("blocked at level {} by {pattern}", rules.level))
        } else if origin == Origin::Default {
            soft.matching(&device).map(|pattern| {
                format!("{pattern} is pruned at level {} unless requested", rules.level)
            })
        } else {
            None
        };

        match reason {
            Some(reason) => {
                let warning = Warning::DevicePruned {
                    path: device,
                    reason,
                };
                warning.emit();
                warnings.push(warning);
            }
            None => kept.push(device),
        }
    }
    Ok(kept)
}

fn filter_capabilities(
    rules: &RestrictionTemplate,
    requested: BTreeSet<Capability>,
    warnings: &mut Vec<Warning>,
) -> BTreeSet<Capability> {
    let mut kept = BTreeSet::new();
    for cap in requested {
        let reason = if is_unsafe(cap) {
            Some("never permitted".to_string())
        } else if !rules.permitted_capabilities.contains(&cap) {
            Some(format!("not permitted at level {}", rules.level))
        } else {
            None
        };

        match reason {
            Some(reason) => {
                let warning = Warning::CapabilityFiltered {
                    capability: cap.to_string(),
                    reason,
                };
                warning.emit();
                warnings.push(warning);
            }
            None => {
                kept.insert(cap);
            }
        }
    }
    kept
}

fn apply_capability_overrides(
    capabilities: &mut BTreeSet<Capability>,
    overrides: &Overrides,
) -> Result<()> {
    for name in &overrides.cap_drop {
        let cap: Capability = name.parse()?;
        capabilities.remove(&cap);
    }
    for name in &overrides.cap_add {
        let cap: Capability = name.parse()?;
        if is_unsafe(cap) {
            return Err(IsolatorError::InvalidOverride(format!(
                "capability {cap} is never permitted"
            )));
        }
        capabilities.insert(cap);
    }
    Ok(())
}

/// Splits a `KEY=VALUE` assignment.
pub fn parse_env_assignment(assignment: &str) -> Result<(String, String)> {
    match assignment.split_once('=') {
        Some((key, value)) if is_valid_env_key(key) && !value.contains('\0') => {
            Ok((key.to_string(), value.to_string()))
        }
        _ => Err(IsolatorError::InvalidOverride(format!(
            "malformed environment assignment '{assignment}', expected KEY=VALUE"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{LimitValue, Profile};
    use pretty_assertions::assert_eq;

    fn browser_caps() -> BTreeSet<Capability> {
        BTreeSet::from([
            Capability::SysAdmin,
            Capability::NetAdmin,
            Capability::Setuid,
            Capability::Setgid,
        ])
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let store = ProfileStore::builtin();
        let overrides = Overrides {
            env: vec!["EDITOR=vi".into()],
            cap_add: vec!["net_raw".into()],
            ..Default::default()
        };
        for level in [
            IsolationLevel::Minimal,
            IsolationLevel::Standard,
            IsolationLevel::Strict,
        ] {
            for name in ["basic", "browser", "multimedia", "development", "graphics"] {
                let first = resolve(&store, name, level, &overrides).unwrap();
                let second = resolve(&store, name, level, &overrides).unwrap();
                assert_eq!(first, second);
            }
        }
    }

    #[test]
    fn test_missing_profile() {
        let store = ProfileStore::builtin();
        let err = resolve(&store, "nonexistent", IsolationLevel::Standard, &Overrides::default())
            .unwrap_err();
        assert!(matches!(err, IsolatorError::ProfileNotFound(name) if name == "nonexistent"));
    }

    #[test]
    fn test_no_network_override_wins_over_level() {
        let store = ProfileStore::builtin();
        let overrides = Overrides {
            network: Some(false),
            ..Default::default()
        };
        let policy = resolve(&store, "BROWSER", IsolationLevel::Standard, &overrides).unwrap();
        assert!(!policy.network_enabled);
        assert!(policy.namespaces.contains(&Namespace::Net));

        let default = resolve(&store, "browser", IsolationLevel::Standard, &Overrides::default())
            .unwrap();
        assert!(default.network_enabled);
        assert!(!default.namespaces.contains(&Namespace::Net));
    }

    #[test]
    fn test_strict_never_enables_network() {
        let store = ProfileStore::builtin();
        for network in [None, Some(false), Some(true)] {
            let overrides = Overrides {
                network,
                ..Default::default()
            };
            let policy = resolve(&store, "browser", IsolationLevel::Strict, &overrides).unwrap();
            assert!(!policy.network_enabled, "network enabled with override {network:?}");
            assert!(!policy.network_ports.is_empty());
        }
    }

    #[test]
    fn test_strict_records_blocked_network_request() {
        let store = ProfileStore::builtin();
        let overrides = Overrides {
            network: Some(true),
            ..Default::default()
        };
        let policy = resolve(&store, "basic", IsolationLevel::Strict, &overrides).unwrap();
        assert!(policy
            .warnings
            .iter()
            .any(|w| matches!(w, Warning::NetworkBlocked { .. })));
    }

    #[test]
    fn test_browser_minimal_keeps_profile_capabilities() {
        let store = ProfileStore::builtin();
        let policy =
            resolve(&store, "browser", IsolationLevel::Minimal, &Overrides::default()).unwrap();
        assert_eq!(policy.capabilities, browser_caps());
    }

    #[test]
    fn test_unsafe_profile_capability_is_filtered() {
        let mut store = ProfileStore::builtin();
        store.insert(
            Profile::new("tracer").with_capabilities([Capability::SysPtrace, Capability::SysModule]),
        );
        let policy =
            resolve(&store, "tracer", IsolationLevel::Minimal, &Overrides::default()).unwrap();
        assert_eq!(policy.capabilities, BTreeSet::from([Capability::SysPtrace]));
        assert!(policy.warnings.contains(&Warning::CapabilityFiltered {
            capability: "CAP_SYS_MODULE".into(),
            reason: "never permitted".into(),
        }));

        let standard =
            resolve(&store, "tracer", IsolationLevel::Standard, &Overrides::default()).unwrap();
        assert!(standard.capabilities.is_empty());
    }

    #[test]
    fn test_strict_drops_capabilities_unless_added_explicitly() {
        let store = ProfileStore::builtin();
        let policy =
            resolve(&store, "browser", IsolationLevel::Strict, &Overrides::default()).unwrap();
        assert!(policy.capabilities.is_empty());

        let overrides = Overrides {
            cap_add: vec!["CAP_SETUID".into()],
            ..Default::default()
        };
        let policy = resolve(&store, "browser", IsolationLevel::Strict, &overrides).unwrap();
        assert_eq!(policy.capabilities, BTreeSet::from([Capability::Setuid]));
    }

    #[test]
    fn test_capability_overrides_are_validated() {
        let store = ProfileStore::builtin();
        let unknown = Overrides {
            cap_add: vec!["CAP_TELEPORT".into()],
            ..Default::default()
        };
        assert!(matches!(
            resolve(&store, "basic", IsolationLevel::Minimal, &unknown),
            Err(IsolatorError::InvalidOverride(_))
        ));

        let unsafe_cap = Overrides {
            cap_add: vec!["sys_module".into()],
            ..Default::default()
        };
        assert!(matches!(
            resolve(&store, "basic", IsolationLevel::Minimal, &unsafe_cap),
            Err(IsolatorError::InvalidOverride(_))
        ));

        let drop = Overrides {
            cap_drop: vec!["sys_admin".into()],
            ..Default::default()
        };
        let policy = resolve(&store, "browser", IsolationLevel::Minimal, &drop).unwrap();
        assert!(!policy.capabilities.contains(&Capability::SysAdmin));
    }

    #[test]
    fn test_limits_take_tighter_of_profile_and_level() {
        let mut store = ProfileStore::builtin();
        store.insert(Profile::new("busy").with_limits(ResourceLimits {
            max_processes: Some(100),
            max_files: Some(512),
            ..Default::default()
        }));

        let strict = resolve(&store, "busy", IsolationLevel::Strict, &Overrides::default()).unwrap();
        assert_eq!(strict.resource_limits.max_processes, Some(64));
        assert_eq!(strict.resource_limits.max_files, Some(512));

        let minimal =
            resolve(&store, "busy", IsolationLevel::Minimal, &Overrides::default()).unwrap();
        assert_eq!(minimal.resource_limits.max_processes, Some(100));
    }

    #[test]
    fn test_limit_override_cannot_loosen_level() {
        let store = ProfileStore::builtin();
        let overrides = Overrides {
            limits: ResourceLimitSpec {
                max_processes: Some(LimitValue::Number(5000)),
                memory_limit: Some(LimitValue::Text("512M".into())),
                ..Default::default()
            },
            ..Default::default()
        };
        let policy = resolve(&store, "browser", IsolationLevel::Strict, &overrides).unwrap();
        assert_eq!(policy.resource_limits.max_processes, Some(64));
        assert_eq!(policy.resource_limits.memory_limit, Some(512 << 20));
        assert_eq!(policy.requested_limits.max_processes, Some(5000));
        assert_eq!(policy.requested_limits.memory_limit, Some(512 << 20));
    }

    #[test]
    fn test_level_limits_are_not_recorded_as_requested() {
        let store = ProfileStore::builtin();
        let policy =
            resolve(&store, "browser", IsolationLevel::Strict, &Overrides::default()).unwrap();
        assert_eq!(policy.resource_limits.max_processes, Some(64));
        assert_eq!(policy.resource_limits.memory_limit, Some(4 << 30));
        assert_eq!(policy.requested_limits, ResourceLimits::default());
    }

    #[test]
    fn test_runtime_sockets_follow_profile_and_level() {
        let store = ProfileStore::builtin();

        let standard =
            resolve(&store, "multimedia", IsolationLevel::Standard, &Overrides::default())
                .unwrap();
        assert_eq!(
            standard.runtime_sockets,
            BTreeSet::from([RuntimeSocket::Pulse, RuntimeSocket::SessionBus])
        );

        let strict =
            resolve(&store, "multimedia", IsolationLevel::Strict, &Overrides::default()).unwrap();
        assert_eq!(strict.runtime_sockets, BTreeSet::from([RuntimeSocket::Pulse]));
        assert!(strict.warnings.iter().any(|w| matches!(
            w,
            Warning::SocketBlocked { socket, .. } if socket == "session_bus"
        )));

        let basic = resolve(&store, "basic", IsolationLevel::Standard, &Overrides::default())
            .unwrap();
        assert!(basic.runtime_sockets.is_empty());
    }

    #[test]
    fn test_malformed_limit_override() {
        let store = ProfileStore::builtin();
        let overrides = Overrides {
            limits: ResourceLimitSpec {
                memory_limit: Some(LimitValue::Text("lots".into())),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            resolve(&store, "basic", IsolationLevel::Standard, &overrides),
            Err(IsolatorError::InvalidOverride(_))
        ));
    }

    #[test]
    fn test_env_override_wins_on_collision() {
        let store = ProfileStore::builtin();
        let overrides = Overrides {
            env: vec!["NO_AT_BRIDGE=0".into(), "LANG=de_DE.UTF-8".into()],
            ..Default::default()
        };
        let policy = resolve(&store, "browser", IsolationLevel::Standard, &overrides).unwrap();
        assert_eq!(policy.env_vars["NO_AT_BRIDGE"], "0");
        assert_eq!(policy.env_vars["LANG"], "de_DE.UTF-8");
        assert_eq!(policy.env_vars["FONTCONFIG_PATH"], "/etc/fonts");

        let bad = Overrides {
            env: vec!["NOEQUALS".into()],
            ..Default::default()
        };
        assert!(matches!(
            resolve(&store, "basic", IsolationLevel::Standard, &bad),
            Err(IsolatorError::InvalidOverride(_))
        ));
    }

    #[test]
    fn test_named_profile_lists_replace_default() {
        let store = ProfileStore::builtin();
        let policy = resolve(
            &store,
            "development",
            IsolationLevel::Standard,
            &Overrides::default(),
        )
        .unwrap();
        assert!(policy.devices.is_empty());
        // env is undeclared by development and inherited from basic
        assert_eq!(policy.env_vars["NO_AT_BRIDGE"], "1");
    }

    #[test]
    fn test_strict_device_precedence() {
        let mut store = ProfileStore::builtin();
        store.insert(Profile::new("disk").with_devices(["/dev/dri", "/dev/sda", "/dev/snd"]));

        // inherited graphics device is soft-pruned
        let basic = resolve(&store, "basic", IsolationLevel::Strict, &Overrides::default()).unwrap();
        assert!(basic.devices.is_empty());
        assert!(matches!(basic.warnings[0], Warning::DevicePruned { .. }));

        // explicitly requested graphics device survives, raw block device does not
        let disk = resolve(&store, "disk", IsolationLevel::Strict, &Overrides::default()).unwrap();
        assert_eq!(
            disk.devices,
            vec![PathBuf::from("/dev/dri"), PathBuf::from("/dev/snd")]
        );

        // no pruning below strict
        let standard =
            resolve(&store, "disk", IsolationLevel::Standard, &Overrides::default()).unwrap();
        assert_eq!(standard.devices.len(), 3);
    }

    #[test]
    fn test_raw_memory_devices_blocked_everywhere() {
        let mut store = ProfileStore::builtin();
        store.insert(Profile::new("peek").with_devices(["/dev/mem", "/dev/null"]));
        let policy = resolve(&store, "peek", IsolationLevel::Minimal, &Overrides::default()).unwrap();
        assert_eq!(policy.devices, vec![PathBuf::from("/dev/null")]);
    }

    #[test]
    fn test_gui_and_persist_overrides() {
        let store = ProfileStore::builtin();
        let overrides = Overrides {
            gui: Some(false),
            persist: Some(PathBuf::from("~/sandbox-data")),
            ..Default::default()
        };
        let policy = resolve(&store, "basic", IsolationLevel::Minimal, &overrides).unwrap();
        assert!(!policy.gui_enabled);
        assert_eq!(
            policy.persist_path,
            Some(crate::utils::paths::home_dir().join("sandbox-data"))
        );
        assert_eq!(policy.display_credentials, CredentialMode::PassThrough);
    }

    #[test]
    fn test_parse_env_assignment() {
        assert_eq!(
            parse_env_assignment("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert_eq!(parse_env_assignment("EMPTY=").unwrap().1, "");
        assert!(parse_env_assignment("=x").is_err());
    }
}
