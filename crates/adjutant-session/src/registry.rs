//! On-disk session registry (`sessions.json`).

use std::{
    io,
    path::{Path, PathBuf},
};

use adjutant_core::{AgentSession, SessionId, WorkspaceKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Registry file name inside the data directory.
pub const REGISTRY_FILE: &str = "sessions.json";

/// Registry error.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("registry file {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One persisted session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub session_id: SessionId,
    pub name: String,
    pub backing_session_name: String,
    pub project_path: PathBuf,
    #[serde(default)]
    pub workspace_kind: WorkspaceKind,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pane_id: Option<String>,
    /// Set while the session is dead and waiting out its grace window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_since: Option<DateTime<Utc>>,
}

impl RegistryEntry {
    #[must_use]
    pub fn from_session(session: &AgentSession, dead_since: Option<DateTime<Utc>>) -> Self {
        Self {
            session_id: session.id,
            name: session.name.clone(),
            backing_session_name: session.backing_session.clone(),
            project_path: session.project_path.clone(),
            workspace_kind: session.workspace_kind,
            created_at: session.created_at,
            last_activity: session.last_activity,
            pane_id: session.pane_id.clone(),
            dead_since,
        }
    }
}

/// The registry file.
#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
}

impl Registry {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Registry stored as `sessions.json` under `dir`.
    #[must_use]
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(REGISTRY_FILE))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all entries. A missing file is an empty registry.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub async fn load(&self) -> Result<Vec<RegistryEntry>, RegistryError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(self.io_error(source)),
        };
        serde_json::from_slice(&raw).map_err(|source| RegistryError::Malformed {
            path: self.path.clone(),
            source,
        })
    }

    /// Replace the file's contents with `entries`.
    ///
    /// Writes a sibling temp file and renames it over the registry, so a
    /// crash leaves either the old or the new contents.
    ///
    /// # Errors
    /// Returns error if the file cannot be written.
    pub async fn save(&self, entries: &[RegistryEntry]) -> Result<(), RegistryError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }
        let json = serde_json::to_vec_pretty(entries).map_err(|source| RegistryError::Malformed {
            path: self.path.clone(),
            source,
        })?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;

        tracing::trace!(path = %self.path.display(), entries = entries.len(), "Registry saved");
        Ok(())
    }

    fn io_error(&self, source: io::Error) -> RegistryError {
        RegistryError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
