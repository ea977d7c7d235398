//! Agent session types.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Session identifier.
pub type SessionId = Uuid;

/// Identifier of one attached viewer connection.
pub type ViewerId = Uuid;

/// Lifecycle status of an agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Backing session is being created.
    Starting,
    /// Backing session exists and its pane is running.
    Alive,
    /// Backing session is gone.
    Dead,
    /// Backing session exists but the pane process has exited.
    Zombie,
}

impl SessionStatus {
    /// Whether the session counts towards the active set.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Alive)
    }

    /// Status name as used on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Alive => "alive",
            Self::Dead => "dead",
            Self::Zombie => "zombie",
        }
    }
}

/// Where an agent's working directory lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceKind {
    /// Work directly in the project root.
    #[default]
    Shared,
    /// Work in a per-session worktree under `<project>/.worktrees/<name>`.
    Worktree,
}

impl WorkspaceKind {
    /// Working directory for a session named `name` in `project`.
    #[must_use]
    pub fn working_dir(self, project: &Path, name: &str) -> PathBuf {
        match self {
            Self::Shared => project.to_path_buf(),
            Self::Worktree => project.join(".worktrees").join(name),
        }
    }
}

/// A supervised terminal session bound to one agent identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSession {
    /// Unique session identifier.
    pub id: SessionId,
    /// Display name.
    pub name: String,
    /// Name of the backing multiplexer session.
    pub backing_session: String,
    /// Pane id inside the backing session (e.g. `%3`).
    pub pane_id: Option<String>,
    /// Project the session belongs to.
    pub project_path: PathBuf,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Workspace policy.
    pub workspace_kind: WorkspaceKind,
    /// Currently attached viewer connections.
    pub viewers: BTreeSet<ViewerId>,
    /// Whether an output pipe is running for this session.
    pub piping: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl AgentSession {
    /// Working directory the agent runs in.
    #[must_use]
    pub fn working_dir(&self) -> PathBuf {
        self.workspace_kind.working_dir(&self.project_path, &self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worktree_sessions_get_their_own_directory() {
        let project = Path::new("/srv/app");
        assert_eq!(WorkspaceKind::Shared.working_dir(project, "w1"), project);
        assert_eq!(
            WorkspaceKind::Worktree.working_dir(project, "w1"),
            Path::new("/srv/app/.worktrees/w1")
        );
    }

    #[test]
    fn only_starting_and_alive_are_active() {
        assert!(SessionStatus::Alive.is_active());
        assert!(SessionStatus::Starting.is_active());
        assert!(!SessionStatus::Dead.is_active());
        assert!(!SessionStatus::Zombie.is_active());
    }
}
