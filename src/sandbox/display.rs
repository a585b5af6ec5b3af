//! Display-server exposure.
//!
//! Wayland is preferred when both servers are advertised. X11 credentials are
//! passed through from the host below `strict`; at `strict` a fresh untrusted
//! cookie is minted with `xauth` into the session directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::Serialize;

use crate::error::{IsolatorError, Result};
use crate::policy::{CredentialMode, Policy};
use crate::sandbox::filesystem::{AccessMode, MountSpec};
use crate::utils::paths::home_dir;

const X11_SOCKET_DIR: &str = "/tmp/.X11-unix";

/// A detected display server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "server", rename_all = "lowercase")]
pub enum DisplayServer {
    Wayland { display: String, socket: PathBuf },
    X11 { display: String },
}

/// Display-related host state, captured once so detection is testable.
#[derive(Debug, Clone, Default)]
pub struct DisplayEnvironment {
    pub wayland_display: Option<String>,
    pub display: Option<String>,
    pub runtime_dir: Option<PathBuf>,
    pub xauthority: Option<PathBuf>,
    pub x11_socket_dir: PathBuf,
}

impl DisplayEnvironment {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            wayland_display: var("WAYLAND_DISPLAY"),
            display: var("DISPLAY"),
            runtime_dir: var("XDG_RUNTIME_DIR").map(PathBuf::from),
            xauthority: var("XAUTHORITY")
                .map(PathBuf::from)
                .or_else(|| Some(home_dir().join(".Xauthority"))),
            x11_socket_dir: PathBuf::from(X11_SOCKET_DIR),
        }
    }

    /// Finds a usable display server, Wayland first.
    pub fn detect(&self) -> Result<DisplayServer> {
        if let Some(name) = &self.wayland_display {
            let socket = match &self.runtime_dir {
                _ if Path::new(name).is_absolute() => PathBuf::from(name),
                Some(dir) => dir.join(name),
                None => PathBuf::from(name),
            };
            if socket.exists() {
                return Ok(DisplayServer::Wayland {
                    display: name.clone(),
                    socket,
                });
            }
            tracing::debug!("Wayland socket {} not found", socket.display());
        }

        if let Some(name) = &self.display {
            if self.x11_socket_dir.is_dir() {
                return Ok(DisplayServer::X11 {
                    display: name.clone(),
                });
            }
            tracing::debug!("X11 socket directory {} not found", self.x11_socket_dir.display());
        }

        Err(IsolatorError::DisplayUnavailable(
            "neither WAYLAND_DISPLAY nor DISPLAY points at a live socket".into(),
        ))
    }
}

/// Mounts and environment needed to reach the display.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DisplayPlan {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<DisplayServer>,
    pub mounts: Vec<MountSpec>,
    pub env: BTreeMap<String, String>,
}

impl DisplayPlan {
    pub fn is_empty(&self) -> bool {
        self.server.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct DisplayManager {
    environment: DisplayEnvironment,
    xauth: PathBuf,
}

impl DisplayManager {
    pub fn new(environment: DisplayEnvironment) -> Self {
        Self {
            environment,
            xauth: PathBuf::from("xauth"),
        }
    }

    /// Uses a different `xauth` program for minting session cookies.
    pub fn with_xauth(mut self, program: impl Into<PathBuf>) -> Self {
        self.xauth = program.into();
        self
    }

    /// Plans display exposure for `policy`.
    ///
    /// Returns an empty plan when GUI is disabled. Session cookies are written
    /// to `session_dir`; credentials appear at `<sandbox_home>/.Xauthority`.
    ///
    /// # Errors
    ///
    /// [`IsolatorError::DisplayUnavailable`] when no server is detected or a
    /// session cookie cannot be minted. Callers degrade this to GUI-disabled.
    pub fn plan(
        &self,
        policy: &Policy,
        session_dir: &Path,
        sandbox_home: &Path,
    ) -> Result<DisplayPlan> {
        if !policy.gui_enabled {
            return Ok(DisplayPlan::default());
        }

        let server = self.environment.detect()?;
        let mut plan = DisplayPlan::default();

        match &server {
            DisplayServer::Wayland { display: name, socket } => {
                tracing::info!("Exposing Wayland socket {}", socket.display());
                plan.mounts.push(MountSpec::rw(socket));
                plan.env.insert("WAYLAND_DISPLAY".into(), name.clone());
                plan.env.insert("XDG_SESSION_TYPE".into(), "wayland".into());
            }
            DisplayServer::X11 { display: name } => {
                tracing::info!("Exposing X11 display {}", name);
                plan.mounts.push(MountSpec::bind(
                    &self.environment.x11_socket_dir,
                    X11_SOCKET_DIR,
                    AccessMode::ReadWrite,
                ));
                plan.env.insert("DISPLAY".into(), name.clone());
                plan.env.insert("XDG_SESSION_TYPE".into(), "x11".into());

                let cookie = match policy.display_credentials {
                    CredentialMode::PassThrough => self
                        .environment
                        .xauthority
                        .clone()
                        .filter(|path| path.is_file()),
                    CredentialMode::SessionScoped => {
                        Some(self.mint_cookie(name, session_dir)?)
                    }
                };
                if let Some(cookie) = cookie {
                    let target = sandbox_home.join(".Xauthority");
                    plan.env
                        .insert("XAUTHORITY".into(), target.to_string_lossy().into_owned());
                    plan.mounts
                        .push(MountSpec::bind(cookie, target, AccessMode::ReadOnly));
                }
            }
        }

        plan.server = Some(server);
        Ok(plan)
    }

    fn mint_cookie(&self, display: &str, session_dir: &Path) -> Result<PathBuf> {
        let cookie = session_dir.join("Xauthority");
        tracing::debug!("Generating untrusted X11 cookie in {}", cookie.display());

        let status = Command::new(&self.xauth)
            .arg("-f")
            .arg(&cookie)
            .args(["generate", display, ".", "untrusted", "timeout", "0"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| {
                IsolatorError::DisplayUnavailable(format!(
                    "failed to run {}: {e}",
                    self.xauth.display()
                ))
            })?;

        if !status.success() || !cookie.is_file() {
            return Err(IsolatorError::DisplayUnavailable(format!(
                "{} could not generate a cookie for {display}",
                self.xauth.display()
            )));
        }
        Ok(cookie)
    }
}

impl Default for DisplayManager {
    fn default() -> Self {
        Self::new(DisplayEnvironment::from_env())
    }
}
