//! JSON-RPC over HTTP at `/mcp`.
//!
//! `POST` carries requests, `GET` opens the session's notification stream
//! (SSE) and `DELETE` ends the session. The session is named by the
//! `Mcp-Session-Id` header returned from `initialize`.

use std::{convert::Infallible, sync::Arc};

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::post,
};
use futures::{Stream, StreamExt};
use serde_json::{Value, json};
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::{
    ProtocolError, ProtocolSession, ProtocolSessionManager,
    jsonrpc::{
        CallToolParams, CallToolResult, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST,
        InitializeResult, JsonRpcError, JsonRpcRequest, JsonRpcResponse, ListToolsResult,
        METHOD_NOT_FOUND, PARSE_ERROR, SESSION_NOT_FOUND,
    },
};

/// Header naming the protocol session.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Routes for `/mcp`, ready to merge into the server's router.
pub fn router<S>(manager: Arc<ProtocolSessionManager>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route(
            "/mcp",
            post(handle_post).get(handle_stream).delete(handle_delete),
        )
        .with_state(manager)
}

fn rpc_error(status: StatusCode, id: Value, code: i32, message: impl Into<String>) -> Response {
    (
        status,
        Json(JsonRpcResponse::failure(id, JsonRpcError::new(code, message))),
    )
        .into_response()
}

async fn resolve(
    manager: &ProtocolSessionManager,
    headers: &HeaderMap,
    id: &Value,
) -> Result<Arc<ProtocolSession>, Response> {
    let Some(raw) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) else {
        return Err(rpc_error(
            StatusCode::BAD_REQUEST,
            id.clone(),
            INVALID_REQUEST,
            "Missing Mcp-Session-Id header",
        ));
    };
    let Ok(session_id) = Uuid::parse_str(raw) else {
        return Err(rpc_error(
            StatusCode::BAD_REQUEST,
            id.clone(),
            INVALID_REQUEST,
            "Malformed Mcp-Session-Id header",
        ));
    };
    manager.get(session_id).await.ok_or_else(|| {
        let e = ProtocolError::SessionNotFound(session_id);
        rpc_error(StatusCode::NOT_FOUND, id.clone(), e.code(), e.to_string())
    })
}

async fn handle_post(
    State(manager): State<Arc<ProtocolSessionManager>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return rpc_error(
                StatusCode::BAD_REQUEST,
                Value::Null,
                PARSE_ERROR,
                format!("Parse error: {e}"),
            );
        }
    };
    let id = request.id.clone().unwrap_or(Value::Null);
    if request.jsonrpc != "2.0" {
        return rpc_error(
            StatusCode::BAD_REQUEST,
            id,
            INVALID_REQUEST,
            "Only JSON-RPC 2.0 is supported",
        );
    }

    if request.method == "initialize" {
        return initialize(&manager, id).await;
    }

    let session = match resolve(&manager, &headers, &id).await {
        Ok(session) => session,
        Err(response) => return response,
    };
    if request.is_notification() {
        tracing::trace!(session = %session.id(), method = %request.method, "Notification");
        return StatusCode::ACCEPTED.into_response();
    }

    let outcome = dispatch(&session, &request.method, request.params).await;
    let response = match outcome {
        Ok(result) => JsonRpcResponse::success(id, result),
        Err(error) => JsonRpcResponse::failure(id, error),
    };
    Json(response).into_response()
}

async fn initialize(manager: &ProtocolSessionManager, id: Value) -> Response {
    match manager.create_session().await {
        Ok(session) => {
            let result = serde_json::to_value(InitializeResult::current()).unwrap_or_default();
            (
                [(SESSION_HEADER, session.id().to_string())],
                Json(JsonRpcResponse::success(id, result)),
            )
                .into_response()
        }
        Err(e @ ProtocolError::NotReady) => {
            tracing::debug!("Protocol client arrived before tools were wired");
            rpc_error(StatusCode::SERVICE_UNAVAILABLE, id, e.code(), e.to_string())
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to create protocol session");
            rpc_error(StatusCode::INTERNAL_SERVER_ERROR, id, e.code(), e.to_string())
        }
    }
}

async fn dispatch(
    session: &ProtocolSession,
    method: &str,
    params: Option<Value>,
) -> Result<Value, JsonRpcError> {
    match method {
        "ping" => Ok(json!({})),
        "tools/list" => to_result(&ListToolsResult {
            tools: session.tools(),
        }),
        "tools/call" => {
            let params: CallToolParams = params
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| JsonRpcError::new(INVALID_PARAMS, e.to_string()))?
                .ok_or_else(|| JsonRpcError::new(INVALID_PARAMS, "Missing params"))?;
            let args = params.arguments.unwrap_or_else(|| json!({}));

            match session.call(&params.name, args).await {
                Ok(output) => to_result(&CallToolResult::success(output)),
                // Tool failures are results the agent can read, not protocol errors.
                Err(ProtocolError::Tool(message)) => {
                    tracing::debug!(session = %session.id(), tool = %params.name, %message, "Tool failed");
                    to_result(&CallToolResult::error(message))
                }
                Err(e) => Err(JsonRpcError::from(&e)),
            }
        }
        other => Err(JsonRpcError::new(
            METHOD_NOT_FOUND,
            format!("Method not found: {other}"),
        )),
    }
}

fn to_result(value: &impl serde::Serialize) -> Result<Value, JsonRpcError> {
    serde_json::to_value(value).map_err(|e| JsonRpcError::new(INTERNAL_ERROR, e.to_string()))
}

async fn handle_stream(
    State(manager): State<Arc<ProtocolSessionManager>>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, Response> {
    let session = resolve(&manager, &headers, &Value::Null).await?;
    let rx = session.notifications().ok_or_else(|| {
        rpc_error(
            StatusCode::NOT_FOUND,
            Value::Null,
            SESSION_NOT_FOUND,
            "Session closed",
        )
    })?;
    tracing::debug!(session = %session.id(), "Notification stream opened");

    // Lagged receivers skip what they missed; the stream ends at teardown.
    let events = BroadcastStream::new(rx).filter_map(|item| async move {
        let notification = item.ok()?;
        let data = serde_json::to_string(&notification).ok()?;
        Some(Ok(Event::default().event("message").data(data)))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn handle_delete(
    State(manager): State<Arc<ProtocolSessionManager>>,
    headers: HeaderMap,
) -> Response {
    let session = match resolve(&manager, &headers, &Value::Null).await {
        Ok(session) => session,
        Err(response) => return response,
    };
    match manager.teardown(session.id()).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => rpc_error(StatusCode::NOT_FOUND, Value::Null, e.code(), e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    use super::*;
    use crate::{ToolDefinition, ToolRegistrar, jsonrpc::NOT_READY};

    struct Tools;

    #[async_trait]
    impl ToolRegistrar for Tools {
        async fn register_tools(&self, session: &ProtocolSession) -> Result<(), ProtocolError> {
            session.register_tool(
                ToolDefinition {
                    name: "echo".to_string(),
                    description: "Echo".to_string(),
                    input_schema: json!({"type": "object"}),
                },
                |args: Value| async move { Ok::<_, ProtocolError>(args) },
            )?;
            session.register_tool(
                ToolDefinition {
                    name: "fail".to_string(),
                    description: "Always fails".to_string(),
                    input_schema: json!({"type": "object"}),
                },
                |_: Value| async move { Err::<Value, _>(ProtocolError::Tool("nope".to_string())) },
            )
        }
    }

    fn app(manager: &Arc<ProtocolSessionManager>) -> Router {
        router(Arc::clone(manager))
    }

    fn post_rpc(session: Option<&str>, body: &Value) -> Request<Body> {
        let mut builder = Request::post("/mcp").header("content-type", "application/json");
        if let Some(session) = session {
            builder = builder.header(SESSION_HEADER, session);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn initialize(manager: &Arc<ProtocolSessionManager>) -> String {
        let response = app(manager)
            .oneshot(post_rpc(
                None,
                &json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        response
            .headers()
            .get(SESSION_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string()
    }

    fn ready() -> Arc<ProtocolSessionManager> {
        let manager = Arc::new(ProtocolSessionManager::new());
        manager.set_registrar(Arc::new(Tools)).unwrap();
        manager
    }

    #[tokio::test]
    async fn initialize_before_tools_is_unavailable() {
        let manager = Arc::new(ProtocolSessionManager::new());
        let response = app(&manager)
            .oneshot(post_rpc(
                None,
                &json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["error"]["code"], NOT_READY);
    }

    #[tokio::test]
    async fn initialize_then_list_and_call() {
        let manager = ready();
        let session = initialize(&manager).await;

        let listed = app(&manager)
            .oneshot(post_rpc(
                Some(&session),
                &json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
            ))
            .await
            .unwrap();
        let listed = json_body(listed).await;
        assert_eq!(listed["result"]["tools"][0]["name"], "echo");
        assert_eq!(listed["result"]["tools"][0]["inputSchema"]["type"], "object");

        let called = app(&manager)
            .oneshot(post_rpc(
                Some(&session),
                &json!({
                    "jsonrpc": "2.0", "id": 3, "method": "tools/call",
                    "params": {"name": "echo", "arguments": {"hello": "world"}}
                }),
            ))
            .await
            .unwrap();
        let called = json_body(called).await;
        assert_eq!(called["id"], 3);
        assert_eq!(called["result"]["isError"], false);
        assert_eq!(called["result"]["structuredContent"]["hello"], "world");
    }

    #[tokio::test]
    async fn tool_failures_are_results() {
        let manager = ready();
        let session = initialize(&manager).await;
        let response = app(&manager)
            .oneshot(post_rpc(
                Some(&session),
                &json!({
                    "jsonrpc": "2.0", "id": 4, "method": "tools/call",
                    "params": {"name": "fail"}
                }),
            ))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["result"]["isError"], true);
        assert_eq!(body["result"]["content"][0]["text"], "nope");
    }

    #[tokio::test]
    async fn protocol_errors_use_jsonrpc_codes() {
        let manager = ready();
        let session = initialize(&manager).await;

        let unknown_method = app(&manager)
            .oneshot(post_rpc(
                Some(&session),
                &json!({"jsonrpc": "2.0", "id": 5, "method": "resources/list"}),
            ))
            .await
            .unwrap();
        assert_eq!(json_body(unknown_method).await["error"]["code"], METHOD_NOT_FOUND);

        let unknown_tool = app(&manager)
            .oneshot(post_rpc(
                Some(&session),
                &json!({"jsonrpc": "2.0", "id": 6, "method": "tools/call", "params": {"name": "x"}}),
            ))
            .await
            .unwrap();
        assert_eq!(json_body(unknown_tool).await["error"]["code"], METHOD_NOT_FOUND);

        let garbage = app(&manager)
            .oneshot(post_rpc(Some(&session), &json!("not a request")))
            .await
            .unwrap();
        assert_eq!(garbage.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(garbage).await["error"]["code"], PARSE_ERROR);
    }

    #[tokio::test]
    async fn notifications_are_accepted_without_a_body() {
        let manager = ready();
        let session = initialize(&manager).await;
        let response = app(&manager)
            .oneshot(post_rpc(
                Some(&session),
                &json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn null_id_requests_get_a_response() {
        let manager = ready();
        let session = initialize(&manager).await;
        let response = app(&manager)
            .oneshot(post_rpc(
                Some(&session),
                &json!({"jsonrpc": "2.0", "id": null, "method": "ping"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["id"], Value::Null);
        assert!(body["result"].is_object());
    }

    #[tokio::test]
    async fn requests_need_a_known_session() {
        let manager = ready();
        let ping = json!({"jsonrpc": "2.0", "id": 7, "method": "ping"});

        let missing = app(&manager).oneshot(post_rpc(None, &ping)).await.unwrap();
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

        let unknown = app(&manager)
            .oneshot(post_rpc(Some(&Uuid::new_v4().to_string()), &ping))
            .await
            .unwrap();
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(unknown).await["error"]["code"], SESSION_NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_ends_the_session() {
        let manager = ready();
        let session = initialize(&manager).await;

        let delete = || {
            Request::delete("/mcp")
                .header(SESSION_HEADER, session.as_str())
                .body(Body::empty())
                .unwrap()
        };
        let first = app(&manager).oneshot(delete()).await.unwrap();
        assert_eq!(first.status(), StatusCode::NO_CONTENT);
        let second = app(&manager).oneshot(delete()).await.unwrap();
        assert_eq!(second.status(), StatusCode::NOT_FOUND);
        assert_eq!(manager.session_count().await, 0);
    }
}
