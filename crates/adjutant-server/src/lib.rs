//! Adjutant server: wires the session bridge, stores, real-time channels and
//! the tool protocol into one HTTP listener.
//!
//! Routes:
//! - `GET /health`
//! - `/api/...` - REST over sessions, messages and events
//! - `/ws/chat`, `/ws/status`, `/ws/terminal/{sessionId}` - real-time channels
//! - `/mcp` - JSON-RPC tool protocol for agent processes

pub mod api;
pub mod auth;
pub mod config;
pub mod state;

use std::{path::Path, sync::Arc, time::Instant};

use adjutant_core::{DefaultTopology, Topology};
use adjutant_protocol::{FleetTools, ProtocolSessionManager, jsonrpc::JsonRpcNotification};
use adjutant_session::{Registry, SessionBridge};
use adjutant_store::{Database, spawn_retention};
use adjutant_tmux::{Multiplexer, TmuxMultiplexer};
use adjutant_transport::{ChatServerFrame, PathPredicate, StatusHub, TerminalChannel, UpgradeRouter};
use anyhow::Context;
use axum::{Router, middleware, routing::get};
use tokio::sync::broadcast::error::RecvError;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use auth::ApiKey;
pub use config::Config;
pub use state::AppState;

/// Build the complete router.
pub fn app(state: AppState, api_key: Option<ApiKey>) -> Router {
    let channels = UpgradeRouter::new()
        .channel(PathPredicate::exact("/ws/chat"), Arc::clone(&state.chat) as _)
        .channel(PathPredicate::exact("/ws/status"), Arc::clone(&state.status) as _)
        .channel(
            PathPredicate::param("/ws/terminal/"),
            Arc::new(TerminalChannel::new(Arc::clone(&state.bridge))),
        );

    let mut router = Router::new()
        .route("/health", get(api::health))
        .nest("/api", api::routes())
        .merge(channels.into_router())
        .merge(adjutant_protocol::http::router(Arc::clone(&state.protocol)))
        .with_state(state);

    if let Some(key) = api_key {
        router = router.layer(middleware::from_fn_with_state(key, auth::require_api_key));
    }
    router
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Forward bridge lifecycle changes to status viewers.
fn forward_session_changes(bridge: &SessionBridge, status: Arc<StatusHub>) {
    let mut changes = bridge.subscribe();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) => status.session_changed(change.session_id, change.status),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Session change forwarder lagging");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Surface new chat messages to protocol clients as notifications.
fn forward_chat_to_protocol(state: &AppState) {
    let mut frames = state.chat.subscribe();
    let protocol = Arc::clone(&state.protocol);
    tokio::spawn(async move {
        loop {
            match frames.recv().await {
                Ok(ChatServerFrame::ChatMessage { message }) => {
                    let params = serde_json::to_value(&message).ok();
                    protocol
                        .notify_all(&JsonRpcNotification::new("notifications/message", params))
                        .await;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Protocol notification forwarder lagging");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn multiplexer(config: &Config) -> Arc<dyn Multiplexer> {
    let tmux = match &config.tmux {
        Some(binary) => TmuxMultiplexer::new(binary.clone()),
        None => TmuxMultiplexer::locate().await.unwrap_or_else(|e| {
            // Boot stays up; every probe reports the sessions missing until tmux appears.
            tracing::error!(error = %e, "tmux not found on PATH");
            TmuxMultiplexer::new("tmux".into())
        }),
    };
    match &config.tmux_socket {
        Some(socket) => Arc::new(tmux.with_socket(socket.clone())),
        None => Arc::new(tmux),
    }
}

/// Assemble state from configuration and start the background tasks.
///
/// # Errors
/// Returns error if the data directory or database cannot be opened, or the
/// configuration is invalid.
pub async fn build(config: &Config) -> anyhow::Result<AppState> {
    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;

    let db = Database::connect(&config.database_url())
        .await
        .context("opening database")?;
    drop(spawn_retention(db.events(), config.retention()));

    let bridge = Arc::new(SessionBridge::new(
        multiplexer(config).await,
        Registry::in_dir(&data_dir),
        config.bridge()?,
    ));

    let topology: Arc<dyn Topology> = Arc::new(DefaultTopology::new());
    let state = assemble(bridge, &db, topology, config.project_root())?;

    let report = state.bridge.initialize(&state.project_root).await;
    tracing::info!(
        restored = report.restored.len(),
        dead = report.dead.len(),
        zombies = report.zombies.len(),
        pruned = report.pruned.len(),
        auto_created = ?report.auto_created,
        errors = report.errors.len(),
        "Session recovery finished"
    );
    drop(state.bridge.spawn_reconciler(config.reconcile_interval()));

    Ok(state)
}

/// Wire hubs and the protocol manager around an existing bridge and database.
///
/// # Errors
/// Returns error if the tool registrar cannot be installed.
pub fn assemble(
    bridge: Arc<SessionBridge>,
    db: &Database,
    topology: Arc<dyn Topology>,
    project_root: impl AsRef<Path>,
) -> anyhow::Result<AppState> {
    let chat = Arc::new(adjutant_transport::ChatHub::new(db.messages(), Arc::clone(&topology)));
    let status = Arc::new(StatusHub::new());
    forward_session_changes(&bridge, Arc::clone(&status));

    let protocol = Arc::new(ProtocolSessionManager::new());
    protocol.set_registrar(Arc::new(FleetTools::new(
        db.messages(),
        db.events(),
        Arc::clone(&chat),
        Arc::clone(&status),
        topology,
    )))?;

    let state = AppState {
        bridge,
        messages: db.messages(),
        events: db.events(),
        chat,
        status,
        protocol,
        project_root: project_root.as_ref().to_path_buf(),
        started_at: Instant::now(),
    };
    forward_chat_to_protocol(&state);
    Ok(state)
}

/// Run the server until Ctrl-C.
///
/// # Errors
/// Returns error if startup fails or the listener cannot be bound.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let state = build(&config).await?;
    let api_key = config.api_key.clone().filter(|k| !k.is_empty()).map(ApiKey::new);
    if api_key.is_none() {
        tracing::warn!("No API key configured; all routes are open");
    }

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    tracing::info!("Server listening on http://{}", config.bind);

    axum::serve(listener, app(state, api_key))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use adjutant_tmux::testing::FakeMultiplexer;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;

    struct Harness {
        state: AppState,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mux: Arc<dyn Multiplexer> = Arc::new(FakeMultiplexer::new());
        let bridge = Arc::new(SessionBridge::new(
            mux,
            Registry::in_dir(dir.path()),
            adjutant_session::BridgeConfig::default(),
        ));
        let db = Database::in_memory().await.unwrap();
        let state = assemble(bridge, &db, Arc::new(DefaultTopology::new()), "/srv/app").unwrap();
        Harness { state, _dir: dir }
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post(uri: &str, body: &Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_is_open_even_with_a_key() {
        let h = harness().await;
        let app = app(h.state, Some(ApiKey::new("k")));
        let (status, body) = send(app.clone(), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["protocolReady"], true);

        let (status, body) = send(app.clone(), get("/api/sessions")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "MISSING_API_KEY");

        let authorized = Request::get("/api/sessions")
            .header("authorization", "Bearer k")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(app, authorized).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn session_lifecycle_over_rest() {
        let h = harness().await;
        let app = app(h.state, None);

        let (status, created) = send(app.clone(), post("/api/sessions", &json!({"name": "web"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["name"], "web");
        assert_eq!(created["projectPath"], "/srv/app");
        let id = created["id"].as_str().unwrap().to_string();

        let (status, _) = send(app.clone(), post("/api/sessions", &json!({"name": "web"}))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, verified) = send(app.clone(), post(&format!("/api/sessions/{id}/verify"), &json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(verified["status"], "alive");

        let (_, listed) = send(app.clone(), get("/api/sessions")).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let delete = Request::delete(format!("/api/sessions/{id}"))
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(app.clone(), delete).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = send(app, get(&format!("/api/sessions/{id}"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn messages_over_rest() {
        let h = harness().await;
        let mut viewer = h.state.chat.subscribe();
        let app = app(h.state, None);

        let (status, sent) = send(
            app.clone(),
            post("/api/messages", &json!({"from": "app/polecats/nux", "body": "ready for review", "threadId": "t1"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(sent["role"], "agent");
        assert!(matches!(viewer.recv().await.unwrap(), ChatServerFrame::ChatMessage { .. }));

        let (_, unread) = send(app.clone(), get("/api/messages/unread")).await;
        assert_eq!(unread["app/polecats/nux"], 1);

        let (_, found) = send(app.clone(), get("/api/messages/search?q=REVIEW")).await;
        assert_eq!(found.as_array().unwrap().len(), 1);

        let (_, thread) = send(app.clone(), get("/api/messages?threadId=t1&limit=10")).await;
        assert_eq!(thread["items"][0]["body"], "ready for review");

        let id = sent["id"].as_str().unwrap();
        let (status, read) = send(app.clone(), post(&format!("/api/messages/{id}/read"), &json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(read["alreadyRead"], false);

        let (_, unread) = send(app.clone(), get("/api/messages/unread")).await;
        assert!(unread.as_object().unwrap().is_empty());

        let (status, _) = send(app.clone(), get("/api/messages?cursor=bogus")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(app, post("/api/messages", &json!({"body": "  "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn events_over_rest() {
        let h = harness().await;
        h.state
            .events
            .append(adjutant_store::NewEvent::new("work", "a1", "claim").for_work_item("gt-1"))
            .await
            .unwrap();
        let app = app(h.state, None);

        let (status, page) = send(app.clone(), get("/api/events?type=work&limit=5")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["items"][0]["workItemId"], "gt-1");

        let (_, none) = send(app, get("/api/events?agentId=a2")).await;
        assert!(none["items"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unmatched_upgrade_paths_are_refused() {
        let h = harness().await;
        let app = app(h.state, None);
        let (status, _) = send(app, get("/ws/nowhere/deep")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn session_changes_reach_status_viewers() {
        let h = harness().await;
        let (_, mut rx) = h.state.status.subscribe();
        let session = h
            .state
            .bridge
            .create_session(Path::new("/srv/app"), None, adjutant_core::WorkspaceKind::Shared)
            .await
            .unwrap();

        let frame = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            frame,
            adjutant_transport::StatusFrame::Session { session_id, .. } if session_id == session.id
        ));
    }

    #[tokio::test]
    async fn chat_messages_become_protocol_notifications() {
        let h = harness().await;
        let session = h.state.protocol.create_session().await.unwrap();
        let mut rx = session.notifications().unwrap();

        h.state
            .chat
            .send(adjutant_store::NewMessage::new(
                "user",
                adjutant_store::MessageRole::User,
                "status?",
            ))
            .await
            .unwrap();

        let note = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(note.method, "notifications/message");
        assert_eq!(note.params.unwrap()["body"], "status?");
    }
}
