//! Single owner of the WebSocket upgrade endpoint.
//!
//! Channels never attach their own listener. The router looks at the
//! request path once, picks the first matching channel, and only that
//! channel's handler ever sees the socket. Everything else is refused
//! before the handshake.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use axum::{
    Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{WebSocket, rejection::WebSocketUpgradeRejection},
    },
    http::{StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::get,
};

/// What the handler learns about the connection it was given.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelRequest {
    pub path: String,
    /// Path remainder captured by a prefix predicate.
    pub param: Option<String>,
    pub query: HashMap<String, String>,
}

/// A real-time channel.
#[async_trait]
pub trait ChannelHandler: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Own the upgraded connection until it closes.
    async fn serve(&self, socket: WebSocket, request: ChannelRequest);
}

/// Which paths a channel answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPredicate {
    /// Exactly this path.
    Exact(String),
    /// This prefix followed by one non-empty segment, captured as the param.
    Param(String),
}

impl PathPredicate {
    pub fn exact(path: impl Into<String>) -> Self {
        Self::Exact(path.into())
    }

    /// `prefix` should end with `/`.
    pub fn param(prefix: impl Into<String>) -> Self {
        Self::Param(prefix.into())
    }

    /// `Some(param)` if `path` matches.
    #[must_use]
    pub fn matches(&self, path: &str) -> Option<Option<String>> {
        let path = path.strip_suffix('/').filter(|p| !p.is_empty()).unwrap_or(path);
        match self {
            Self::Exact(want) => (path == want.as_str()).then_some(None),
            Self::Param(prefix) => path
                .strip_prefix(prefix.as_str())
                .filter(|rest| !rest.is_empty() && !rest.contains('/'))
                .map(|rest| Some(rest.to_string())),
        }
    }
}

/// Routing outcome for one path.
pub enum Dispatch {
    Matched {
        handler: Arc<dyn ChannelHandler>,
        param: Option<String>,
    },
    /// No channel wants the connection; it is closed without a handshake.
    Mismatch,
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Matched { handler, param } => f
                .debug_struct("Matched")
                .field("handler", &handler.name())
                .field("param", param)
                .finish(),
            Self::Mismatch => f.write_str("Mismatch"),
        }
    }
}

/// Ordered `(predicate, handler)` table.
#[derive(Default)]
pub struct UpgradeRouter {
    routes: Vec<(PathPredicate, Arc<dyn ChannelHandler>)>,
}

impl UpgradeRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a channel. Earlier routes win.
    #[must_use]
    pub fn channel(mut self, predicate: PathPredicate, handler: Arc<dyn ChannelHandler>) -> Self {
        self.routes.push((predicate, handler));
        self
    }

    /// The first route matching `path`, if any.
    #[must_use]
    pub fn dispatch(&self, path: &str) -> Dispatch {
        self.routes
            .iter()
            .find_map(|(predicate, handler)| {
                predicate.matches(path).map(|param| Dispatch::Matched {
                    handler: Arc::clone(handler),
                    param,
                })
            })
            .unwrap_or(Dispatch::Mismatch)
    }

    /// Axum routes for `/ws` and everything below it.
    pub fn into_router<S>(self) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        let router = Arc::new(self);
        Router::new()
            .route("/ws", get(upgrade))
            .route("/ws/{*rest}", get(upgrade))
            .with_state(router)
    }
}

fn refuse(status: StatusCode) -> Response {
    (status, [(header::CONNECTION, "close")]).into_response()
}

async fn upgrade(
    State(router): State<Arc<UpgradeRouter>>,
    uri: Uri,
    Query(query): Query<HashMap<String, String>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let path = uri.path().to_string();
    let Dispatch::Matched { handler, param } = router.dispatch(&path) else {
        tracing::debug!(%path, "Upgrade mismatch, closing connection");
        return refuse(StatusCode::NOT_FOUND);
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!(%path, "Not an upgrade request: {e}");
            return refuse(StatusCode::UPGRADE_REQUIRED);
        }
    };

    let channel = handler.name();
    tracing::debug!(%path, channel, "Upgrading connection");
    let request = ChannelRequest { path, param, query };
    ws.on_upgrade(move |socket| async move {
        handler.serve(socket, request).await;
        tracing::debug!(channel, "Connection closed");
    })
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl ChannelHandler for Named {
        fn name(&self) -> &'static str {
            self.0
        }

        async fn serve(&self, _socket: WebSocket, _request: ChannelRequest) {}
    }

    fn router() -> UpgradeRouter {
        UpgradeRouter::new()
            .channel(PathPredicate::exact("/ws/chat"), Arc::new(Named("chat")))
            .channel(PathPredicate::exact("/ws/status"), Arc::new(Named("status")))
            .channel(PathPredicate::param("/ws/terminal/"), Arc::new(Named("terminal")))
            .channel(PathPredicate::param("/ws/"), Arc::new(Named("catch-all")))
    }

    fn target(dispatch: &Dispatch) -> Option<(&'static str, Option<String>)> {
        match dispatch {
            Dispatch::Matched { handler, param } => Some((handler.name(), param.clone())),
            Dispatch::Mismatch => None,
        }
    }

    #[test]
    fn each_path_reaches_at_most_one_channel() {
        let router = router();
        assert_eq!(target(&router.dispatch("/ws/chat")), Some(("chat", None)));
        assert_eq!(target(&router.dispatch("/ws/chat/")), Some(("chat", None)));
        assert_eq!(target(&router.dispatch("/ws/status")), Some(("status", None)));
        assert_eq!(
            target(&router.dispatch("/ws/terminal/abc")),
            Some(("terminal", Some("abc".to_string())))
        );
    }

    #[test]
    fn earlier_routes_win() {
        // "/ws/chat" also matches the catch-all param route.
        assert_eq!(target(&router().dispatch("/ws/chat")).unwrap().0, "chat");
        assert_eq!(
            target(&router().dispatch("/ws/other")),
            Some(("catch-all", Some("other".to_string())))
        );
    }

    #[test]
    fn unmatched_paths_mismatch() {
        let router = UpgradeRouter::new()
            .channel(PathPredicate::exact("/ws/chat"), Arc::new(Named("chat")))
            .channel(PathPredicate::param("/ws/terminal/"), Arc::new(Named("terminal")));
        for path in ["/ws", "/ws/chatter", "/ws/terminal/", "/ws/terminal/a/b", "/", ""] {
            assert!(
                matches!(router.dispatch(path), Dispatch::Mismatch),
                "{path} should not match"
            );
        }
    }

    fn upgrade_request(path: &str) -> Request<Body> {
        Request::builder()
            .uri(path)
            .header(header::CONNECTION, "upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn mismatched_upgrades_are_closed_not_left_hanging() {
        let app: Router = router_without_catch_all().into_router();
        let response = app.oneshot(upgrade_request("/ws/nope")).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[header::CONNECTION], "close");
    }

    #[tokio::test]
    async fn plain_requests_need_an_upgrade() {
        let app: Router = router_without_catch_all().into_router();
        let request = Request::builder()
            .uri("/ws/chat")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED);
        assert_eq!(response.headers()[header::CONNECTION], "close");
    }

    fn router_without_catch_all() -> UpgradeRouter {
        UpgradeRouter::new()
            .channel(PathPredicate::exact("/ws/chat"), Arc::new(Named("chat")))
            .channel(PathPredicate::exact("/ws/status"), Arc::new(Named("status")))
    }
}
