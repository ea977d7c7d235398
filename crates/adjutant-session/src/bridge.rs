//! Supervises agent sessions hosted by the terminal multiplexer.
//!
//! Every mutation of one session runs under that session's async mutex, so
//! create/verify/attach/detach/teardown on one id are totally ordered while
//! unrelated sessions proceed in parallel. The name claim set, the registry
//! mirror and the tombstone set each have their own short critical section.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    path::Path,
    sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, RwLock},
    time::Duration,
};

use adjutant_core::{AgentSession, OutputBuffer, SessionId, SessionStatus, ViewerId, WorkspaceKind};
use adjutant_tmux::{CreateSpec, Multiplexer, MuxError, OutputPipe, Probe};
use chrono::{DateTime, TimeDelta, Utc};
use tokio::{
    sync::{Mutex, OwnedMutexGuard, broadcast},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, timeout},
};
use uuid::Uuid;

use crate::{
    BridgeError,
    registry::{Registry, RegistryEntry, RegistryError},
};

const CHANGE_CAPACITY: usize = 256;

const MIN_RECONCILE_INTERVAL: Duration = Duration::from_secs(1);

/// Creates retried when an auto-derived name turns out to be taken by a
/// session the listing did not show.
const CREATE_ATTEMPTS: usize = 8;

/// Session bridge settings.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Backing sessions are named `<prefix>-<name>`.
    pub name_prefix: String,
    /// Program run in new panes; `None` runs the default shell.
    pub agent_command: Option<Vec<String>>,
    /// How long a dead session may come back before it is pruned.
    pub grace_period: Duration,
    /// Bound on each multiplexer probe.
    pub verify_timeout: Duration,
    /// Bound on the boot-time auto-create.
    pub create_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name_prefix: "adj".to_string(),
            agent_command: None,
            grace_period: Duration::from_secs(60),
            verify_timeout: Duration::from_secs(5),
            create_timeout: Duration::from_secs(10),
        }
    }
}

/// A lifecycle transition, published to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionChange {
    pub session_id: SessionId,
    pub status: SessionStatus,
}

/// Outcome of boot-time recovery.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub restored: Vec<SessionId>,
    pub dead: Vec<SessionId>,
    pub zombies: Vec<SessionId>,
    pub pruned: Vec<SessionId>,
    pub auto_created: Option<SessionId>,
    /// Failures that were logged and skipped.
    pub errors: Vec<String>,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub alive: usize,
    pub died: Vec<SessionId>,
    pub revived: Vec<SessionId>,
    pub zombies: Vec<SessionId>,
    pub pruned: Vec<SessionId>,
    /// Backing sessions with our prefix that no row claims.
    pub untracked: Vec<String>,
}

impl ReconcileReport {
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !(self.died.is_empty()
            && self.revived.is_empty()
            && self.zombies.is_empty()
            && self.pruned.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Keep,
    Become(SessionStatus),
    Prune,
}

/// Next lifecycle step given what the multiplexer reports.
///
/// Only a dead row inside its grace window may come back; every other move
/// is forward.
fn next_state(
    status: SessionStatus,
    dead_since: Option<DateTime<Utc>>,
    probe: Probe,
    now: DateTime<Utc>,
    grace: TimeDelta,
) -> Transition {
    let expired = dead_since.is_some_and(|since| now - since >= grace);
    match (status, probe) {
        (SessionStatus::Dead, _) if expired => Transition::Prune,
        (SessionStatus::Dead, Probe::Running) => Transition::Become(SessionStatus::Alive),
        (SessionStatus::Dead, Probe::PaneDead) => Transition::Become(SessionStatus::Zombie),
        (SessionStatus::Dead, Probe::Missing)
        | (SessionStatus::Zombie | SessionStatus::Alive, Probe::Running)
        | (SessionStatus::Zombie, Probe::PaneDead) => Transition::Keep,
        (_, Probe::Missing) => Transition::Become(SessionStatus::Dead),
        (_, Probe::PaneDead) => Transition::Become(SessionStatus::Zombie),
        (SessionStatus::Starting, Probe::Running) => Transition::Become(SessionStatus::Alive),
    }
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Unchanged(SessionStatus),
    Changed(SessionStatus),
    Pruned,
}

struct Slot {
    session: AgentSession,
    dead_since: Option<DateTime<Utc>>,
    output: Arc<OutputBuffer>,
    pipe: Option<JoinHandle<()>>,
    /// Set once the slot left the table; waiters must not touch it.
    removed: bool,
}

impl Slot {
    fn new(session: AgentSession, dead_since: Option<DateTime<Utc>>) -> Self {
        Self {
            session,
            dead_since,
            output: Arc::new(OutputBuffer::new()),
            pipe: None,
            removed: false,
        }
    }

    fn restore(entry: RegistryEntry) -> Self {
        let status = if entry.dead_since.is_some() {
            SessionStatus::Dead
        } else {
            SessionStatus::Starting
        };
        let session = AgentSession {
            id: entry.session_id,
            name: entry.name,
            backing_session: entry.backing_session_name,
            pane_id: entry.pane_id,
            project_path: entry.project_path,
            status,
            workspace_kind: entry.workspace_kind,
            viewers: BTreeSet::new(),
            piping: false,
            created_at: entry.created_at,
            last_activity: entry.last_activity,
        };
        Self::new(session, entry.dead_since)
    }

    fn is_piping(&self) -> bool {
        self.pipe.as_ref().is_some_and(|task| !task.is_finished())
    }

    fn snapshot(&self) -> AgentSession {
        let mut session = self.session.clone();
        session.piping = self.is_piping();
        session
    }

    async fn stop_pipe(&mut self) {
        if let Some(task) = self.pipe.take() {
            task.abort();
            // Completes once the task (and with it the pipe) is dropped.
            let _ = task.await;
        }
    }
}

/// Releases a claimed backing name unless kept.
struct NameClaim<'a> {
    names: &'a StdMutex<HashSet<String>>,
    backing: Option<String>,
}

impl NameClaim<'_> {
    fn keep(mut self) {
        self.backing = None;
    }
}

impl Drop for NameClaim<'_> {
    fn drop(&mut self) {
        if let Some(backing) = self.backing.take() {
            lock(self.names).remove(&backing);
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lowercase, dash-separated, tmux-safe form of `raw`.
fn slugify(raw: &str) -> String {
    let mut slug = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}

fn spawn_forwarder(id: SessionId, mut pipe: OutputPipe, output: Arc<OutputBuffer>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(chunk) = pipe.chunks.recv().await {
            output.push_data(chunk);
        }
        tracing::debug!(session_id = %id, "Output pipe closed");
    })
}

/// Makes multiplexer sessions addressable, durable across restarts and
/// self-healing.
pub struct SessionBridge {
    mux: Arc<dyn Multiplexer>,
    registry: Registry,
    config: BridgeConfig,
    slots: RwLock<HashMap<SessionId, Arc<Mutex<Slot>>>>,
    names: StdMutex<HashSet<String>>,
    mirror: StdMutex<BTreeMap<SessionId, RegistryEntry>>,
    persist_lock: Mutex<()>,
    tombstones: StdMutex<HashSet<SessionId>>,
    changes: broadcast::Sender<SessionChange>,
}

impl SessionBridge {
    #[must_use]
    pub fn new(mux: Arc<dyn Multiplexer>, registry: Registry, config: BridgeConfig) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            mux,
            registry,
            config,
            slots: RwLock::new(HashMap::new()),
            names: StdMutex::new(HashSet::new()),
            mirror: StdMutex::new(BTreeMap::new()),
            persist_lock: Mutex::new(()),
            tombstones: StdMutex::new(HashSet::new()),
            changes,
        }
    }

    /// Lifecycle transitions from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionChange> {
        self.changes.subscribe()
    }

    /// Load the registry, verify every entry and make sure `project_root`
    /// has a live session.
    ///
    /// Never fails: problems are logged and collected in the report.
    pub async fn initialize(&self, project_root: &Path) -> RecoveryReport {
        let mut report = RecoveryReport::default();

        let entries = match self.registry.load().await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load session registry, starting empty");
                report.errors.push(e.to_string());
                Vec::new()
            }
        };
        tracing::info!(entries = entries.len(), "Recovering sessions from registry");

        for entry in entries {
            let id = entry.session_id;
            if self.read_slots().contains_key(&id) {
                continue;
            }
            if !lock(&self.names).insert(entry.backing_session_name.clone()) {
                tracing::warn!(
                    session_id = %id,
                    backing = %entry.backing_session_name,
                    "Registry entry reuses a claimed backing name, skipping"
                );
                report
                    .errors
                    .push(format!("duplicate backing name {}", entry.backing_session_name));
                continue;
            }

            lock(&self.mirror).insert(id, entry.clone());
            self.write_slots()
                .insert(id, Arc::new(Mutex::new(Slot::restore(entry))));

            let Ok(mut slot) = self.lock_slot(id).await else {
                continue;
            };
            let probe = self.probe(&slot.session.backing_session).await;
            match self.apply_probe(&mut slot, probe, Utc::now()).await {
                Outcome::Changed(SessionStatus::Alive) | Outcome::Unchanged(SessionStatus::Alive) => {
                    report.restored.push(id);
                }
                Outcome::Changed(SessionStatus::Zombie) | Outcome::Unchanged(SessionStatus::Zombie) => {
                    report.zombies.push(id);
                }
                Outcome::Changed(_) | Outcome::Unchanged(_) => report.dead.push(id),
                Outcome::Pruned => report.pruned.push(id),
            }
        }

        if let Err(e) = self.persist().await {
            tracing::error!(error = %e, "Failed to persist recovered registry");
            report.errors.push(e.to_string());
        }

        let has_live = self
            .list_active()
            .await
            .iter()
            .any(|s| s.project_path == project_root);
        if !has_live {
            let create = self.create_session(project_root, None, WorkspaceKind::default());
            match timeout(self.config.create_timeout, create).await {
                Ok(Ok(session)) => {
                    tracing::info!(
                        session_id = %session.id,
                        backing = %session.backing_session,
                        project = %project_root.display(),
                        "Auto-created session for project"
                    );
                    report.auto_created = Some(session.id);
                }
                Ok(Err(e)) => {
                    tracing::error!(error = %e, project = %project_root.display(), "Auto-create failed");
                    report.errors.push(e.to_string());
                }
                Err(_) => {
                    tracing::error!(
                        timeout_ms = self.config.create_timeout.as_millis(),
                        project = %project_root.display(),
                        "Auto-create timed out"
                    );
                    report.errors.push("auto-create timed out".to_string());
                }
            }
        }

        tracing::info!(
            restored = report.restored.len(),
            dead = report.dead.len(),
            zombies = report.zombies.len(),
            pruned = report.pruned.len(),
            auto_created = report.auto_created.is_some(),
            "Session recovery complete"
        );
        report
    }

    /// Create a backing session and register it.
    ///
    /// Without an explicit `name` the project directory name is used and a
    /// numeric suffix resolves collisions.
    ///
    /// # Errors
    /// Returns `Conflict` if an explicit name is taken, `Multiplexer` if the
    /// backing session cannot be created, `Registry` if it cannot be persisted.
    pub async fn create_session(
        &self,
        project_path: &Path,
        name: Option<&str>,
        workspace_kind: WorkspaceKind,
    ) -> Result<AgentSession, BridgeError> {
        let explicit = name.map(slugify).filter(|s| !s.is_empty());
        let base = explicit.clone().unwrap_or_else(|| {
            project_path
                .file_name()
                .map(|n| slugify(&n.to_string_lossy()))
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "agent".to_string())
        });

        let mut external = self.external_names().await;
        for _ in 0..CREATE_ATTEMPTS {
            let (display, claim) = self.claim(&base, explicit.is_some(), &external)?;
            let backing = self.backing_name(&display);
            let id = Uuid::new_v4();
            let spec = CreateSpec {
                name: backing.clone(),
                working_dir: workspace_kind.working_dir(project_path, &display),
                command: self.config.agent_command.clone(),
                env: vec![
                    ("ADJUTANT_SESSION_ID".to_string(), id.to_string()),
                    ("ADJUTANT_SESSION_NAME".to_string(), display.clone()),
                ],
            };

            match self.mux.create(&spec).await {
                Ok(pane) => {
                    let now = Utc::now();
                    let session = AgentSession {
                        id,
                        name: display,
                        backing_session: backing,
                        pane_id: Some(pane.pane_id),
                        project_path: project_path.to_path_buf(),
                        status: SessionStatus::Alive,
                        workspace_kind,
                        viewers: BTreeSet::new(),
                        piping: false,
                        created_at: now,
                        last_activity: now,
                    };
                    claim.keep();
                    return self.register(session).await;
                }
                Err(MuxError::DuplicateSession(_)) if explicit.is_none() => {
                    tracing::debug!(backing = %backing, "Backing name taken externally, retrying");
                    external.insert(backing);
                }
                Err(MuxError::DuplicateSession(_)) => return Err(BridgeError::Conflict(display)),
                Err(e) => return Err(e.into()),
            }
        }
        Err(BridgeError::Conflict(base))
    }

    async fn register(&self, session: AgentSession) -> Result<AgentSession, BridgeError> {
        let id = session.id;
        let slot = Arc::new(Mutex::new(Slot::new(session, None)));
        let guard = Arc::clone(&slot).lock_owned().await;
        self.write_slots().insert(id, slot);
        self.record(&guard);
        self.notify(id, SessionStatus::Alive);

        tracing::info!(
            session_id = %id,
            name = %guard.session.name,
            backing = %guard.session.backing_session,
            workspace = ?guard.session.workspace_kind,
            "Session created"
        );
        self.persist().await?;
        Ok(guard.snapshot())
    }

    /// Probe the backing session and apply the resulting transition.
    ///
    /// A multiplexer failure counts as the backing session being gone. A
    /// dead session past its grace window is pruned and reported `Dead`.
    ///
    /// # Errors
    /// Returns `NotFound` or `Pruned` for unknown ids.
    pub async fn verify_liveness(&self, id: SessionId) -> Result<SessionStatus, BridgeError> {
        let mut slot = self.lock_slot(id).await?;
        let probe = self.probe(&slot.session.backing_session).await;
        let outcome = self.apply_probe(&mut slot, probe, Utc::now()).await;
        match outcome {
            Outcome::Unchanged(status) => Ok(status),
            Outcome::Changed(status) => {
                self.persist_soft().await;
                Ok(status)
            }
            Outcome::Pruned => {
                self.persist_soft().await;
                Ok(SessionStatus::Dead)
            }
        }
    }

    /// Diff the multiplexer's session list against the table and apply
    /// every correction.
    pub async fn reconcile(&self) -> ReconcileReport {
        let listing = match timeout(self.config.verify_timeout, self.mux.list_sessions()).await {
            Ok(Ok(listing)) => listing,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Listing backing sessions failed, treating all as gone");
                Vec::new()
            }
            Err(_) => {
                tracing::warn!("Listing backing sessions timed out, treating all as gone");
                Vec::new()
            }
        };
        let probes: HashMap<String, Probe> = listing
            .into_iter()
            .map(|s| (s.name, s.probe))
            .collect();

        let mut report = ReconcileReport::default();
        let ids: Vec<SessionId> = self.read_slots().keys().copied().collect();
        for id in ids {
            let Ok(mut slot) = self.lock_slot(id).await else {
                continue;
            };
            let before = slot.session.status;
            let probe = probes
                .get(&slot.session.backing_session)
                .copied()
                .unwrap_or(Probe::Missing);

            match self.apply_probe(&mut slot, probe, Utc::now()).await {
                Outcome::Unchanged(status) => {
                    if status == SessionStatus::Alive {
                        report.alive += 1;
                    }
                    continue;
                }
                Outcome::Changed(SessionStatus::Alive) => {
                    report.alive += 1;
                    if before == SessionStatus::Dead {
                        report.revived.push(id);
                    }
                }
                Outcome::Changed(SessionStatus::Zombie) => report.zombies.push(id),
                Outcome::Changed(_) => report.died.push(id),
                Outcome::Pruned => report.pruned.push(id),
            }
            self.persist_soft().await;
        }

        let prefix = format!("{}-", self.config.name_prefix);
        let claimed = lock(&self.names);
        report.untracked = probes
            .keys()
            .filter(|name| name.starts_with(&prefix) && !claimed.contains(*name))
            .cloned()
            .collect();
        drop(claimed);
        report.untracked.sort();

        for name in &report.untracked {
            tracing::info!(backing = %name, "Untracked backing session");
        }
        report
    }

    /// Run [`reconcile`](Self::reconcile) every `every` until the bridge is
    /// dropped. Intervals below one second are raised to one second.
    #[must_use]
    pub fn spawn_reconciler(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let bridge = Arc::downgrade(self);
        let every = every.max(MIN_RECONCILE_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(bridge) = bridge.upgrade() else {
                    break;
                };
                let report = bridge.reconcile().await;
                if report.has_changes() {
                    tracing::info!(
                        alive = report.alive,
                        died = report.died.len(),
                        revived = report.revived.len(),
                        zombies = report.zombies.len(),
                        pruned = report.pruned.len(),
                        "Reconciled sessions"
                    );
                }
            }
        })
    }

    /// Attach a viewer, starting the output pipe if it is the first.
    ///
    /// # Errors
    /// Returns `NotFound` or `Pruned` for unknown ids.
    pub async fn attach_viewer(
        &self,
        id: SessionId,
        viewer: ViewerId,
    ) -> Result<AgentSession, BridgeError> {
        let mut slot = self.lock_slot(id).await?;
        slot.session.viewers.insert(viewer);
        self.ensure_pipe(&mut slot).await;

        slot.session.last_activity = Utc::now();
        self.record(&slot);
        Ok(slot.snapshot())
    }

    /// Detach a viewer, stopping the output pipe once none remain.
    ///
    /// # Errors
    /// Returns `NotFound` or `Pruned` for unknown ids.
    pub async fn detach_viewer(
        &self,
        id: SessionId,
        viewer: ViewerId,
    ) -> Result<AgentSession, BridgeError> {
        let mut slot = self.lock_slot(id).await?;
        slot.session.viewers.remove(&viewer);
        if slot.session.viewers.is_empty() && slot.pipe.is_some() {
            slot.stop_pipe().await;
            tracing::debug!(session_id = %id, "Output pipe stopped, no viewers left");
        }
        Ok(slot.snapshot())
    }

    /// Type `data` into the session's pane.
    ///
    /// # Errors
    /// Returns `NotFound`/`Pruned` for unknown ids, `Multiplexer` if the
    /// keys cannot be delivered.
    pub async fn send_input(&self, id: SessionId, data: &[u8]) -> Result<(), BridgeError> {
        let mut slot = self.lock_slot(id).await?;
        self.mux
            .send_keys(&slot.session.backing_session, data)
            .await?;
        slot.session.last_activity = Utc::now();
        self.record(&slot);
        Ok(())
    }

    /// Kill the backing session and forget the row for good.
    ///
    /// # Errors
    /// Returns `NotFound`/`Pruned` for unknown ids, `Multiplexer` if the
    /// kill fails (the row is kept), `Registry` if the removal cannot be
    /// persisted.
    pub async fn teardown(&self, id: SessionId) -> Result<(), BridgeError> {
        let mut slot = self.lock_slot(id).await?;
        self.mux.kill(&slot.session.backing_session).await?;
        self.forget(&mut slot).await;
        tracing::info!(
            session_id = %id,
            backing = %slot.session.backing_session,
            "Session torn down"
        );
        self.persist().await?;
        Ok(())
    }

    /// # Errors
    /// Returns `NotFound` or `Pruned` for unknown ids.
    pub async fn get(&self, id: SessionId) -> Result<AgentSession, BridgeError> {
        Ok(self.lock_slot(id).await?.snapshot())
    }

    /// Every known session, oldest first.
    pub async fn list(&self) -> Vec<AgentSession> {
        let slots: Vec<_> = self.read_slots().values().cloned().collect();
        let mut sessions = Vec::with_capacity(slots.len());
        for slot in slots {
            let slot = slot.lock().await;
            if !slot.removed {
                sessions.push(slot.snapshot());
            }
        }
        sessions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        sessions
    }

    /// Sessions that are starting or alive.
    pub async fn list_active(&self) -> Vec<AgentSession> {
        let mut sessions = self.list().await;
        sessions.retain(|s| s.status.is_active());
        sessions
    }

    /// The session's terminal output buffer.
    ///
    /// # Errors
    /// Returns `NotFound` or `Pruned` for unknown ids.
    pub async fn output(&self, id: SessionId) -> Result<Arc<OutputBuffer>, BridgeError> {
        Ok(Arc::clone(&self.lock_slot(id).await?.output))
    }

    fn backing_name(&self, name: &str) -> String {
        format!("{}-{name}", self.config.name_prefix)
    }

    fn claim(
        &self,
        base: &str,
        explicit: bool,
        external: &HashSet<String>,
    ) -> Result<(String, NameClaim<'_>), BridgeError> {
        let mut names = lock(&self.names);
        let mut n = 1_usize;
        loop {
            let candidate = if n == 1 {
                base.to_string()
            } else {
                format!("{base}-{n}")
            };
            let backing = self.backing_name(&candidate);
            if !names.contains(&backing) && !external.contains(&backing) {
                names.insert(backing.clone());
                let claim = NameClaim {
                    names: &self.names,
                    backing: Some(backing),
                };
                return Ok((candidate, claim));
            }
            if explicit {
                return Err(BridgeError::Conflict(candidate));
            }
            n += 1;
        }
    }

    async fn external_names(&self) -> HashSet<String> {
        match timeout(self.config.verify_timeout, self.mux.list_sessions()).await {
            Ok(Ok(listing)) => listing.into_iter().map(|s| s.name).collect(),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Could not list backing sessions");
                HashSet::new()
            }
            Err(_) => {
                tracing::warn!("Listing backing sessions timed out");
                HashSet::new()
            }
        }
    }

    async fn probe(&self, backing: &str) -> Probe {
        match timeout(self.config.verify_timeout, self.mux.probe(backing)).await {
            Ok(Ok(probe)) => probe,
            Ok(Err(e)) => {
                tracing::warn!(backing = %backing, error = %e, "Liveness probe failed");
                Probe::Missing
            }
            Err(_) => {
                tracing::warn!(backing = %backing, "Liveness probe timed out");
                Probe::Missing
            }
        }
    }

    async fn apply_probe(&self, slot: &mut Slot, probe: Probe, now: DateTime<Utc>) -> Outcome {
        let id = slot.session.id;
        let status = slot.session.status;
        let grace = TimeDelta::from_std(self.config.grace_period).unwrap_or(TimeDelta::MAX);

        match next_state(status, slot.dead_since, probe, now, grace) {
            Transition::Keep => Outcome::Unchanged(status),
            Transition::Prune => {
                self.forget(slot).await;
                tracing::info!(
                    session_id = %id,
                    backing = %slot.session.backing_session,
                    "Pruned dead session after grace period"
                );
                Outcome::Pruned
            }
            Transition::Become(next) => {
                slot.session.status = next;
                slot.dead_since = (next == SessionStatus::Dead).then_some(now);
                if next == SessionStatus::Dead {
                    slot.stop_pipe().await;
                } else {
                    self.ensure_pipe(slot).await;
                }
                self.record(slot);
                self.notify(id, next);
                tracing::info!(
                    session_id = %id,
                    from = status.as_str(),
                    to = next.as_str(),
                    "Session status changed"
                );
                Outcome::Changed(next)
            }
        }
    }

    /// Start the output pipe if viewers are attached to a pipeable session
    /// that has none running.
    async fn ensure_pipe(&self, slot: &mut Slot) {
        let id = slot.session.id;
        let pipeable = matches!(
            slot.session.status,
            SessionStatus::Alive | SessionStatus::Zombie
        );
        if !pipeable || slot.session.viewers.is_empty() || slot.is_piping() {
            return;
        }
        match self.mux.open_pipe(&slot.session.backing_session).await {
            Ok(pipe) => {
                slot.pipe = Some(spawn_forwarder(id, pipe, Arc::clone(&slot.output)));
                tracing::debug!(session_id = %id, "Output pipe started");
            }
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "Failed to start output pipe");
            }
        }
    }

    /// Drop a slot from every table and tombstone its id.
    async fn forget(&self, slot: &mut Slot) {
        let id = slot.session.id;
        slot.removed = true;
        slot.stop_pipe().await;
        slot.output.push_ended();

        self.write_slots().remove(&id);
        lock(&self.mirror).remove(&id);
        lock(&self.names).remove(&slot.session.backing_session);
        lock(&self.tombstones).insert(id);
        self.notify(id, SessionStatus::Dead);
    }

    fn record(&self, slot: &Slot) {
        lock(&self.mirror).insert(
            slot.session.id,
            RegistryEntry::from_session(&slot.session, slot.dead_since),
        );
    }

    fn notify(&self, session_id: SessionId, status: SessionStatus) {
        // No subscribers is fine.
        let _ = self.changes.send(SessionChange { session_id, status });
    }

    async fn persist(&self) -> Result<(), RegistryError> {
        let _guard = self.persist_lock.lock().await;
        let entries: Vec<RegistryEntry> = lock(&self.mirror).values().cloned().collect();
        self.registry.save(&entries).await
    }

    async fn persist_soft(&self) {
        if let Err(e) = self.persist().await {
            tracing::warn!(error = %e, "Failed to persist session registry");
        }
    }

    fn missing(&self, id: SessionId) -> BridgeError {
        if lock(&self.tombstones).contains(&id) {
            BridgeError::Pruned(id)
        } else {
            BridgeError::NotFound(id)
        }
    }

    async fn lock_slot(&self, id: SessionId) -> Result<OwnedMutexGuard<Slot>, BridgeError> {
        let slot = self
            .read_slots()
            .get(&id)
            .cloned()
            .ok_or_else(|| self.missing(id))?;
        let guard = slot.lock_owned().await;
        if guard.removed {
            return Err(self.missing(id));
        }
        Ok(guard)
    }

    fn read_slots(&self) -> std::sync::RwLockReadGuard<'_, HashMap<SessionId, Arc<Mutex<Slot>>>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_slots(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<SessionId, Arc<Mutex<Slot>>>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }
}
