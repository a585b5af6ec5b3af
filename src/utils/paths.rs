//! Host path helpers: home expansion, writability checks and executable lookup.

use std::path::{Path, PathBuf};

use nix::unistd::{access, AccessFlags};

/// Install prefixes searched when an executable is not on `PATH`.
const COMMON_BIN_DIRS: &[&str] = &[
    "/usr/bin",
    "/usr/local/bin",
    "/bin",
    "/usr/sbin",
    "/usr/games",
    "/opt",
    "/opt/bin",
    "/snap/bin",
    "/usr/lib/firefox",
    "/usr/lib/chromium",
    "/opt/google/chrome",
];

/// The invoking user's home directory.
pub fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"))
}

/// Expands a leading `~` or `~/` to the user's home directory.
pub fn expand_tilde(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    match path.strip_prefix("~") {
        Ok(rest) => home_dir().join(rest),
        Err(_) => path.to_path_buf(),
    }
}

/// Returns `true` if `path` is a directory the current user may write to.
pub fn is_writable_dir(path: &Path) -> bool {
    path.is_dir() && access(path, AccessFlags::W_OK | AccessFlags::X_OK).is_ok()
}

fn is_executable_file(path: &Path) -> bool {
    path.is_file() && access(path, AccessFlags::X_OK).is_ok()
}

/// Resolves an executable name to an absolute path.
///
/// Absolute and relative paths containing a separator are returned as given.
/// Bare names are looked up on `PATH`, then in a fixed list of common install
/// locations. Returns `None` when nothing is found.
pub fn resolve_executable(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        return Some(PathBuf::from(name));
    }

    if let Ok(found) = which::which(name) {
        tracing::debug!("Resolved {} on PATH: {}", name, found.display());
        return Some(found);
    }

    find_in(COMMON_BIN_DIRS, name)
}

fn find_in<P: AsRef<Path>>(dirs: &[P], name: &str) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.as_ref().join(name))
        .find(|candidate| is_executable_file(candidate))
        .inspect(|found| tracing::debug!("Resolved {} in {}", name, found.display()))
}
