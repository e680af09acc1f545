//! Reload Controller: renders the full snapshot into the data plane's
//! configuration file and has the data plane reload it.
//!
//! The candidate is written next to the live file, checked with the test
//! command, then renamed into place. If the reload command fails the
//! previous file is put back, so the data plane is never left pointing at a
//! configuration it refused.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Output;

use serde::Serialize;
use sluice_core::domain::route::Affinity;
use sluice_core::{ConfigurationSnapshot, RouteKind};
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::ReloadConfig;
use crate::error::ReloadError;

/// Placeholder in the test command replaced by the candidate file path.
pub const CONFIG_PLACEHOLDER: &str = "{config}";

/// The rendered configuration document.
#[derive(Serialize)]
struct NativeConfig<'a> {
    version: u32,
    #[serde(flatten)]
    snapshot: &'a ConfigurationSnapshot,
}

/// Check that every route can be rendered.
fn validate(snapshot: &ConfigurationSnapshot) -> Result<(), ReloadError> {
    for route in snapshot.routes() {
        let key = route.key();
        if route.kind == RouteKind::Rule && route.host.trim().is_empty() {
            return Err(ReloadError::Malformed(format!("route {key} has an empty host")));
        }
        if !route.path.starts_with('/') {
            return Err(ReloadError::Malformed(format!(
                "route {key} path must start with '/'"
            )));
        }
        if let Affinity::Cookie(cookie) = &route.policy.affinity {
            let valid = !cookie.name.is_empty()
                && cookie
                    .name
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
            if !valid {
                return Err(ReloadError::Malformed(format!(
                    "route {key} has invalid affinity cookie name {:?}",
                    cookie.name
                )));
            }
        }
    }
    Ok(())
}

/// Render `snapshot` as the data plane's native configuration.
pub fn render(snapshot: &ConfigurationSnapshot) -> Result<Vec<u8>, ReloadError> {
    validate(snapshot)?;
    let mut rendered = serde_json::to_vec_pretty(&NativeConfig {
        version: 1,
        snapshot,
    })?;
    rendered.push(b'\n');
    Ok(rendered)
}

/// Writes the configuration file and drives the data plane's reload.
#[derive(Debug, Clone)]
pub struct ReloadController {
    config_path: PathBuf,
    test_command: Option<Vec<String>>,
    reload_command: Option<Vec<String>>,
}

impl ReloadController {
    /// A controller for the configured file and commands.
    pub fn new(config: &ReloadConfig) -> Self {
        Self {
            config_path: config.config_path.clone(),
            test_command: config.test_command.clone(),
            reload_command: config.reload_command.clone(),
        }
    }

    /// The live configuration file.
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    fn backup_path(&self) -> PathBuf {
        let mut name = self.config_path.as_os_str().to_owned();
        name.push(".bak");
        PathBuf::from(name)
    }

    /// Render, validate, install and reload `snapshot`.
    ///
    /// On any error the previously installed file stays in effect.
    pub async fn reload(&self, snapshot: &ConfigurationSnapshot) -> Result<(), ReloadError> {
        let rendered = render(snapshot)?;
        let bytes = rendered.len();
        let candidate = self.write_candidate(rendered).await?;

        if let Some(argv) = &self.test_command {
            let argv: Vec<String> = argv
                .iter()
                .map(|arg| arg.replace(CONFIG_PLACEHOLDER, &candidate.path().to_string_lossy()))
                .collect();
            let output = run(&argv).await?;
            if !output.status.success() {
                return Err(ReloadError::TestFailed {
                    status: output.status.to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }
            debug!(command = ?argv, "candidate configuration passed test");
        }

        let had_previous = tokio::fs::try_exists(&self.config_path)
            .await
            .map_err(|source| ReloadError::Io {
                path: self.config_path.clone(),
                source,
            })?;
        if had_previous {
            tokio::fs::copy(&self.config_path, self.backup_path())
                .await
                .map_err(|source| ReloadError::Io {
                    path: self.backup_path(),
                    source,
                })?;
        }
        self.install(candidate).await?;
        info!(path = %self.config_path.display(), bytes, "configuration written");

        let Some(argv) = &self.reload_command else {
            return Ok(());
        };
        let output = run(argv).await?;
        if output.status.success() {
            return Ok(());
        }

        self.restore(had_previous).await;
        Err(ReloadError::ReloadFailed {
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Write and sync the candidate next to the live file.
    async fn write_candidate(&self, rendered: Vec<u8>) -> Result<NamedTempFile, ReloadError> {
        let dir = match self.config_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let target = dir.clone();
        tokio::task::spawn_blocking(move || -> io::Result<NamedTempFile> {
            let mut file = tempfile::Builder::new()
                .prefix(".sluice-")
                .suffix(".json")
                .tempfile_in(&target)?;
            file.write_all(&rendered)?;
            file.as_file().sync_all()?;
            Ok(file)
        })
        .await
        .map_err(io::Error::other)
        .and_then(|written| written)
        .map_err(|source| ReloadError::Io { path: dir, source })
    }

    /// Rename the candidate over the live file.
    async fn install(&self, candidate: NamedTempFile) -> Result<(), ReloadError> {
        let path = self.config_path.clone();
        let persisted = tokio::task::spawn_blocking(move || candidate.persist(&path).map(drop))
            .await
            .map_err(|err| ReloadError::Io {
                path: self.config_path.clone(),
                source: io::Error::other(err),
            })?;
        persisted.map_err(|err| ReloadError::Io {
            path: self.config_path.clone(),
            source: err.error,
        })
    }

    /// Put the previous file back after a failed reload.
    async fn restore(&self, had_previous: bool) {
        let result = if had_previous {
            tokio::fs::rename(self.backup_path(), &self.config_path).await
        } else {
            tokio::fs::remove_file(&self.config_path).await
        };
        match result {
            Ok(()) => warn!(path = %self.config_path.display(), "previous configuration restored"),
            Err(err) => warn!(
                path = %self.config_path.display(),
                error = %err,
                "could not restore previous configuration"
            ),
        }
    }
}

async fn run(argv: &[String]) -> Result<Output, ReloadError> {
    let (program, args) = argv.split_first().ok_or_else(|| ReloadError::Spawn {
        command: String::new(),
        source: io::Error::new(io::ErrorKind::InvalidInput, "empty command"),
    })?;
    Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|source| ReloadError::Spawn {
            command: program.clone(),
            source,
        })
}
