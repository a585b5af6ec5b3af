//! Per-user launcher settings.
//!
//! Settings are a TOML document loaded once at start and read-only
//! afterwards. Top-level keys set defaults for every launch; a
//! `[profiles.<name>]` table overrides them for one profile.
//!
//! ```toml
//! isolation-level = "standard"
//! persist-dir = "~/.local/share/isolator"
//! gui = true
//! profile-dirs = ["/opt/isolator/profiles"]
//!
//! [profiles.browser]
//! isolation-level = "strict"
//! network = false
//! ```
//!
//! Precedence for each field: command line, then the profile table, then
//! the top-level value, then the built-in default.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::policy::IsolationLevel;
use crate::profile::ProfileStore;
use crate::sandbox::plan::{LaunchRequest, SECCOMP_DIR};
use crate::utils::paths::{expand_tilde, home_dir};

/// Launch defaults that may be set globally or per profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct LaunchDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation_level: Option<IsolationLevel>,

    /// Persistent storage bound at `/persist`. `~` is expanded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persist_dir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gui: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<bool>,
}

impl LaunchDefaults {
    /// Field-by-field: values set in `self` win over `fallback`.
    pub fn or(self, fallback: &LaunchDefaults) -> LaunchDefaults {
        LaunchDefaults {
            isolation_level: self.isolation_level.or(fallback.isolation_level),
            persist_dir: self.persist_dir.or_else(|| fallback.persist_dir.clone()),
            network: self.network.or(fallback.network),
            gui: self.gui.or(fallback.gui),
            debug: self.debug.or(fallback.debug),
        }
    }

    /// Writes these defaults into `request`.
    ///
    /// Unset fields leave the request's isolation level at its default and
    /// its overrides unset, so level and profile defaults apply later.
    pub fn apply(&self, request: &mut LaunchRequest) {
        request.level = self.isolation_level.unwrap_or_default();
        request.overrides.network = self.network;
        request.overrides.gui = self.gui;
        request.overrides.persist = self.persist_dir.as_ref().map(expand_tilde);
        request.debug = self.debug.unwrap_or(false);
    }

    fn validate(&self) -> Result<()> {
        if let Some(dir) = &self.persist_dir {
            validate_path(dir).with_context(|| format!("Invalid persist-dir: {}", dir.display()))?;
        }
        Ok(())
    }
}

/// The settings document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Settings {
    /// Profile used when none is given on the command line. When unset the
    /// profile is detected from the executable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation_level: Option<IsolationLevel>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persist_dir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gui: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<bool>,

    /// Extra directories of YAML profile documents, searched last.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub profile_dirs: Vec<PathBuf>,

    /// Directory of compiled seccomp filters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seccomp_dir: Option<PathBuf>,

    /// Per-profile overrides, keyed by profile name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub profiles: BTreeMap<String, LaunchDefaults>,
}

impl Settings {
    /// `$XDG_CONFIG_HOME/isolator/config.toml`, or `~/.config/isolator/config.toml`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| home_dir().join(".config"))
            .join("isolator")
            .join("config.toml")
    }

    /// Loads `explicit` if given, else the default path if it exists, else
    /// empty settings.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit file is missing, or if any file that
    /// is read fails to parse or validate.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::from_file(&path)
                } else {
                    tracing::debug!("No settings file at {}", path.display());
                    Ok(Self::default())
                }
            }
        }
    }

    /// Loads settings from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;

        Self::from_toml_string(&content)
            .with_context(|| format!("Invalid settings file: {}", path.display()))
    }

    /// Parses and validates settings from a TOML string.
    pub fn from_toml_string(toml: &str) -> Result<Self> {
        let settings: Settings =
            toml::from_str(toml).context("Failed to parse TOML settings")?;

        settings.validate()?;

        Ok(settings)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize settings to TOML")
    }

    /// Checks paths and profile table names.
    ///
    /// # Errors
    ///
    /// Returns an error if a path is empty or contains NUL bytes, or a profile
    /// table name is blank.
    pub fn validate(&self) -> Result<()> {
        self.top_level().validate()?;

        for dir in &self.profile_dirs {
            validate_path(dir)
                .with_context(|| format!("Invalid profile-dirs entry: {}", dir.display()))?;
        }
        if let Some(dir) = &self.seccomp_dir {
            validate_path(dir).with_context(|| format!("Invalid seccomp-dir: {}", dir.display()))?;
        }
        if let Some(profile) = &self.profile {
            if profile.trim().is_empty() {
                return Err(anyhow!("profile cannot be empty"));
            }
        }

        for (name, section) in &self.profiles {
            if name.trim().is_empty() {
                return Err(anyhow!("Profile table name cannot be empty"));
            }
            section
                .validate()
                .with_context(|| format!("Invalid [profiles.{}] table", name))?;
        }

        Ok(())
    }

    fn top_level(&self) -> LaunchDefaults {
        LaunchDefaults {
            isolation_level: self.isolation_level,
            persist_dir: self.persist_dir.clone(),
            network: self.network,
            gui: self.gui,
            debug: self.debug,
        }
    }

    /// Defaults for launching `profile`: its table over the top-level values.
    pub fn launch_defaults(&self, profile: &str) -> LaunchDefaults {
        let section = self
            .profiles
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(profile.trim()))
            .map(|(_, section)| section.clone())
            .unwrap_or_default();
        section.or(&self.top_level())
    }

    /// The profile store: built-ins, system and user directories, then
    /// `profile-dirs`.
    pub fn profile_store(&self) -> ProfileStore {
        let extra: Vec<PathBuf> = self.profile_dirs.iter().map(expand_tilde).collect();
        ProfileStore::load_default(&extra)
    }

    pub fn seccomp_dir(&self) -> PathBuf {
        self.seccomp_dir
            .as_ref()
            .map(expand_tilde)
            .unwrap_or_else(|| PathBuf::from(SECCOMP_DIR))
    }
}

/// Validates a path value from the settings file.
fn validate_path(path: &Path) -> Result<()> {
    let raw = path.as_os_str();

    if raw.is_empty() {
        return Err(anyhow!("Path cannot be empty"));
    }

    if raw.as_encoded_bytes().contains(&0) {
        return Err(anyhow!("Path contains null bytes"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"
isolation-level = "standard"
persist-dir = "/srv/isolator"
gui = true
debug = false
profile-dirs = ["/opt/isolator/profiles"]
seccomp-dir = "/opt/isolator/seccomp"

[profiles.browser]
isolation-level = "strict"
network = false

[profiles.Graphics]
gui = false
"#;

    #[test]
    fn test_parse_settings() {
        let settings = Settings::from_toml_string(SAMPLE).unwrap();
        assert_eq!(settings.isolation_level, Some(IsolationLevel::Standard));
        assert_eq!(settings.persist_dir, Some(PathBuf::from("/srv/isolator")));
        assert_eq!(settings.profile_dirs, vec![PathBuf::from("/opt/isolator/profiles")]);
        assert_eq!(settings.seccomp_dir(), PathBuf::from("/opt/isolator/seccomp"));
        assert_eq!(settings.profiles.len(), 2);
    }

    #[test]
    fn test_empty_settings() {
        let settings = Settings::from_toml_string("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.seccomp_dir(), PathBuf::from(SECCOMP_DIR));
    }

    #[test]
    fn test_rejects_unknown_keys_and_bad_values() {
        assert!(Settings::from_toml_string("colour = \"blue\"").is_err());
        assert!(Settings::from_toml_string("isolation-level = \"paranoid\"").is_err());
        assert!(Settings::from_toml_string("[profiles.browser]\nswap = 1").is_err());
        assert!(Settings::from_toml_string("persist-dir = \"\"").is_err());
        assert!(Settings::from_toml_string("[profiles.\" \"]\ngui = true").is_err());
    }

    #[test]
    fn test_profile_table_overrides_top_level() {
        let settings = Settings::from_toml_string(SAMPLE).unwrap();

        let browser = settings.launch_defaults("BROWSER");
        assert_eq!(browser.isolation_level, Some(IsolationLevel::Strict));
        assert_eq!(browser.network, Some(false));
        assert_eq!(browser.gui, Some(true));
        assert_eq!(browser.persist_dir, Some(PathBuf::from("/srv/isolator")));

        let graphics = settings.launch_defaults("graphics");
        assert_eq!(graphics.gui, Some(false));
        assert_eq!(graphics.isolation_level, Some(IsolationLevel::Standard));

        let basic = settings.launch_defaults("basic");
        assert_eq!(basic.network, None);
    }

    #[test]
    fn test_command_line_wins_over_settings() {
        let settings = Settings::from_toml_string(SAMPLE).unwrap();
        let cli = LaunchDefaults {
            isolation_level: Some(IsolationLevel::Minimal),
            network: Some(true),
            ..Default::default()
        };

        let merged = cli.or(&settings.launch_defaults("browser"));
        assert_eq!(merged.isolation_level, Some(IsolationLevel::Minimal));
        assert_eq!(merged.network, Some(true));
        assert_eq!(merged.gui, Some(true));

        let mut request = LaunchRequest::new(&["firefox".to_string()]).unwrap();
        merged.apply(&mut request);
        assert_eq!(request.level, IsolationLevel::Minimal);
        assert_eq!(request.overrides.network, Some(true));
        assert_eq!(request.overrides.persist, Some(PathBuf::from("/srv/isolator")));
        assert!(!request.debug);
    }

    #[test]
    fn test_load_from_file_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.isolation_level, Some(IsolationLevel::Standard));

        let err = Settings::load(Some(&dir.path().join("missing.toml"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read settings file"));
    }

    #[test]
    fn test_toml_round_trip() {
        let settings = Settings::from_toml_string(SAMPLE).unwrap();
        let toml = settings.to_toml_string().unwrap();
        assert_eq!(Settings::from_toml_string(&toml).unwrap(), settings);
    }
}
