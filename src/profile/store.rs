//! The profile store: built-in profiles plus YAML documents from disk.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::error::{IsolatorError, Result};
use crate::profile::{Capability, Profile, ResourceLimits, RuntimeSocket};
use crate::utils::paths::home_dir;

/// Name of the profile every other profile is overlaid on.
pub const DEFAULT_PROFILE: &str = "basic";

const SYSTEM_PROFILE_DIR: &str = "/etc/isolator/profiles";

const FONT_AND_THEME_PATHS: &[&str] = &[
    "/etc/fonts",
    "/usr/share/fonts",
    "/usr/share/fontconfig",
    "/var/cache/fontconfig",
    "/usr/share/icons",
    "/usr/share/themes",
];

/// Holds named profiles, keyed by lowercase name.
#[derive(Debug, Clone)]
pub struct ProfileStore {
    profiles: BTreeMap<String, Profile>,
    user_dir: PathBuf,
}

fn key(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

fn builtin_profiles() -> Vec<Profile> {
    let basic = Profile::new(DEFAULT_PROFILE)
        .with_mounts(Vec::<PathBuf>::new())
        .with_devices(["/dev/dri"])
        .with_capabilities(Vec::<Capability>::new())
        .with_env("NO_AT_BRIDGE", "1")
        .with_ports(Vec::<u16>::new())
        .with_limits(ResourceLimits::default())
        .with_runtime_sockets(Vec::<RuntimeSocket>::new());

    let browser = Profile::new("browser")
        .with_mounts(
            FONT_AND_THEME_PATHS
                .iter()
                .copied()
                .chain(["/usr/share/mime", "/usr/share/applications", "/usr/share/glib-2.0"]),
        )
        .with_devices(["/dev/dri", "/dev/shm"])
        .with_capabilities([
            Capability::SysAdmin,
            Capability::NetAdmin,
            Capability::Setuid,
            Capability::Setgid,
        ])
        .with_env("NO_AT_BRIDGE", "1")
        .with_env("FONTCONFIG_PATH", "/etc/fonts")
        .with_seccomp("browser")
        .with_ports([80, 443])
        .with_limits(ResourceLimits {
            max_processes: Some(512),
            ..Default::default()
        });

    let mut multimedia = Profile::new("multimedia")
        .with_mounts([
            "/etc/machine-id",
            "/usr/share/sounds",
            "/usr/share/alsa",
            "/usr/share/icons",
            "/usr/share/themes",
        ])
        .with_devices(["/dev/dri", "/dev/snd"])
        .with_runtime_sockets([RuntimeSocket::Pulse, RuntimeSocket::SessionBus]);
    if let Ok(runtime) = std::env::var("XDG_RUNTIME_DIR") {
        multimedia = multimedia.with_env("PULSE_SERVER", format!("unix:{runtime}/pulse/native"));
    }

    let development = Profile::new("development")
        .with_mounts(["/usr/share/git-core", "/etc/ssl", "/etc/ca-certificates"])
        .with_devices(Vec::<PathBuf>::new());

    let graphics = Profile::new("graphics")
        .with_mounts(
            FONT_AND_THEME_PATHS
                .iter()
                .copied()
                .chain(["/usr/share/color", "/usr/share/mime"]),
        )
        .with_devices(["/dev/dri"]);

    vec![basic, browser, multimedia, development, graphics]
}

impl ProfileStore {
    /// A store containing only the built-in profiles.
    pub fn builtin() -> Self {
        let profiles = builtin_profiles()
            .into_iter()
            .map(|p| (key(&p.name), p))
            .collect();
        Self {
            profiles,
            user_dir: Self::user_profile_dir(),
        }
    }

    /// The directories searched by [`ProfileStore::load_default`], in override order.
    pub fn default_search_dirs() -> Vec<PathBuf> {
        vec![PathBuf::from(SYSTEM_PROFILE_DIR), Self::user_profile_dir()]
    }

    /// Where new profiles are written.
    pub fn user_profile_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| home_dir().join(".config"))
            .join("isolator")
            .join("profiles")
    }

    /// Built-ins overlaid with documents from the default search directories
    /// and any extra directories.
    pub fn load_default(extra_dirs: &[PathBuf]) -> Self {
        let mut dirs = Self::default_search_dirs();
        dirs.extend(extra_dirs.iter().cloned());
        Self::builtin().with_dirs(&dirs)
    }

    /// Loads every `*.yaml`/`*.yml` document in `dirs`, in order.
    ///
    /// Later documents replace earlier profiles of the same name. Unreadable
    /// or invalid documents are skipped with a warning.
    pub fn with_dirs(mut self, dirs: &[PathBuf]) -> Self {
        for dir in dirs {
            let entries = match std::fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(_) => {
                    tracing::debug!("Profile directory {} not present", dir.display());
                    continue;
                }
            };

            let mut files: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| {
                    matches!(
                        path.extension().and_then(|e| e.to_str()),
                        Some("yaml" | "yml")
                    )
                })
                .collect();
            files.sort();

            for file in files {
                match Self::read_profile(&file) {
                    Ok(profile) => {
                        tracing::debug!("Loaded profile '{}' from {}", profile.name, file.display());
                        self.insert(profile);
                    }
                    Err(err) => {
                        tracing::warn!("Skipping profile {}: {}", file.display(), err);
                    }
                }
            }
        }
        self
    }

    fn read_profile(path: &Path) -> Result<Profile> {
        let content = std::fs::read_to_string(path)?;
        Profile::from_yaml_str(&content)
    }

    /// Redirects where [`create_profile`](Self::create_profile) and
    /// [`update_profile`](Self::update_profile) write documents.
    pub fn with_user_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.user_dir = dir.into();
        self
    }

    pub fn insert(&mut self, profile: Profile) {
        self.profiles.insert(key(&profile.name), profile);
    }

    /// Looks up a profile by case-insensitive name.
    pub fn get(&self, name: &str) -> Result<&Profile> {
        self.profiles
            .get(&key(name))
            .ok_or_else(|| IsolatorError::ProfileNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.profiles.contains_key(&key(name))
    }

    /// The profile every resolution starts from.
    pub fn default_profile(&self) -> Result<&Profile> {
        self.get(DEFAULT_PROFILE)
    }

    pub fn names(&self) -> BTreeSet<&str> {
        self.profiles.values().map(|p| p.name.as_str()).collect()
    }

    /// Persists a new profile to the user directory and registers it.
    pub fn create_profile(&mut self, profile: Profile) -> Result<PathBuf> {
        if self.contains(&profile.name) {
            return Err(IsolatorError::Config(format!(
                "profile '{}' already exists",
                profile.name
            )));
        }
        self.persist(profile)
    }

    /// Rewrites an existing profile in the user directory.
    pub fn update_profile(&mut self, profile: Profile) -> Result<PathBuf> {
        if !self.contains(&profile.name) {
            return Err(IsolatorError::ProfileNotFound(profile.name));
        }
        self.persist(profile)
    }

    fn persist(&mut self, profile: Profile) -> Result<PathBuf> {
        profile.validate()?;
        std::fs::create_dir_all(&self.user_dir)?;
        let path = self.user_dir.join(format!("{}.yaml", key(&profile.name)));
        std::fs::write(&path, profile.to_yaml_string()?)?;
        tracing::info!("Saved profile '{}' to {}", profile.name, path.display());
        self.insert(profile);
        Ok(path)
    }
}

impl Default for ProfileStore {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Picks a built-in profile name from the executable's base name.
pub fn detect_profile(executable: &str) -> &'static str {
    const RULES: &[(&str, &[&str])] = &[
        ("browser", &["chrome", "chromium", "firefox", "opera", "brave"]),
        ("multimedia", &["vlc", "mpv", "audacity", "obs"]),
        ("development", &["code", "idea", "pycharm", "eclipse"]),
        ("graphics", &["gimp", "inkscape", "krita", "blender"]),
    ];

    let base = Path::new(executable)
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    RULES
        .iter()
        .find(|(_, needles)| needles.iter().any(|needle| base.contains(needle)))
        .map(|(profile, _)| *profile)
        .unwrap_or(DEFAULT_PROFILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_builtins_are_present_and_valid() {
        let store = ProfileStore::builtin();
        for name in ["basic", "browser", "multimedia", "development", "graphics"] {
            let profile = store.get(name).unwrap();
            profile.validate().unwrap();
        }
        assert!(store.get("BROWSER").is_ok());
    }

    #[test]
    fn test_browser_profile_capabilities() {
        let store = ProfileStore::builtin();
        let browser = store.get("browser").unwrap();
        assert_eq!(
            browser.capabilities.clone().unwrap(),
            BTreeSet::from([
                Capability::SysAdmin,
                Capability::NetAdmin,
                Capability::Setuid,
                Capability::Setgid,
            ])
        );
    }

    #[test]
    fn test_multimedia_declares_audio_and_bus_sockets() {
        let store = ProfileStore::builtin();
        assert_eq!(
            store.get("multimedia").unwrap().runtime_sockets.clone().unwrap(),
            BTreeSet::from([RuntimeSocket::Pulse, RuntimeSocket::SessionBus])
        );
        assert!(store
            .get("basic")
            .unwrap()
            .runtime_sockets
            .as_ref()
            .is_some_and(|sockets| sockets.is_empty()));
    }

    #[test]
    fn test_missing_profile() {
        let store = ProfileStore::builtin();
        let err = store.get("nonexistent").unwrap_err();
        assert!(matches!(err, IsolatorError::ProfileNotFound(name) if name == "nonexistent"));
    }

    #[test]
    fn test_load_from_dirs_overrides_and_skips_invalid() {
        let system = tempfile::tempdir().unwrap();
        let user = tempfile::tempdir().unwrap();

        std::fs::write(
            system.path().join("editor.yaml"),
            "name: editor\nmounts: [/usr/share/editor]\n",
        )
        .unwrap();
        std::fs::write(
            user.path().join("editor.yml"),
            "name: editor\nmounts: [/opt/editor]\n",
        )
        .unwrap();
        std::fs::write(user.path().join("broken.yaml"), "name: [not a string\n").unwrap();
        std::fs::write(user.path().join("notes.txt"), "name: ignored\n").unwrap();

        let store = ProfileStore::builtin()
            .with_dirs(&[system.path().to_path_buf(), user.path().to_path_buf()]);

        let editor = store.get("editor").unwrap();
        assert_eq!(editor.mounts, Some(vec![PathBuf::from("/opt/editor")]));
        assert!(!store.contains("ignored"));
        assert!(store.contains("basic"));
    }

    #[test]
    fn test_create_and_update_profile() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ProfileStore::builtin().with_user_dir(dir.path());

        let path = store
            .create_profile(Profile::new("Reader").with_mounts(["/usr/share/doc"]))
            .unwrap();
        assert_eq!(path, dir.path().join("reader.yaml"));
        assert!(store.contains("reader"));

        assert!(store.create_profile(Profile::new("reader")).is_err());

        store
            .update_profile(Profile::new("reader").with_devices(["/dev/snd"]))
            .unwrap();
        let reloaded = ProfileStore::builtin().with_dirs(&[dir.path().to_path_buf()]);
        assert_eq!(
            reloaded.get("reader").unwrap().devices,
            Some(vec![PathBuf::from("/dev/snd")])
        );

        let err = store.update_profile(Profile::new("ghost")).unwrap_err();
        assert!(matches!(err, IsolatorError::ProfileNotFound(_)));
    }

    #[test]
    fn test_detect_profile() {
        assert_eq!(detect_profile("/usr/bin/firefox"), "browser");
        assert_eq!(detect_profile("google-chrome-stable"), "browser");
        assert_eq!(detect_profile("mpv"), "multimedia");
        assert_eq!(detect_profile("/usr/bin/code"), "development");
        assert_eq!(detect_profile("gimp-2.10"), "graphics");
        assert_eq!(detect_profile("xterm"), "basic");
    }
}
