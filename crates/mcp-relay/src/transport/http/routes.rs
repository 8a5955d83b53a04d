//! HTTP route handlers.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{Request, State},
    http::{
        HeaderMap, HeaderValue, Method, StatusCode,
        header::{
            ACCEPT, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
            ACCESS_CONTROL_ALLOW_ORIGIN,
        },
    },
    middleware::{self, Next},
    response::{
        IntoResponse, Json, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{any, get, post},
};
use futures::{StreamExt, future, stream};
use serde::Serialize;

use crate::bridge::protocol::{RpcMessage, SERVER_ERROR};
use crate::health::HealthResponse;
use crate::service::BridgeService;

/// Largest request body accepted on `/mcp` and `/message`.
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Interval between keep-alive comments on the legacy `/sse` stream.
const SSE_KEEPALIVE: Duration = Duration::from_secs(30);

const NOT_ACCEPTABLE_MESSAGE: &str = "Not Acceptable: Client must accept text/event-stream";

/// Frame payload on the legacy `/sse` stream.
#[derive(Debug, Serialize)]
struct OutputEvent<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: &'a str,
}

async fn health_check(State(service): State<Arc<BridgeService>>) -> Json<HealthResponse> {
    Json(service.health().to_response())
}

/// Streamable HTTP endpoint: one JSON-RPC message in, at most one SSE event out.
async fn mcp(State(service): State<Arc<BridgeService>>, request: Request) -> Response {
    if !accepts_event_stream(request.headers()) {
        tracing::debug!("Rejecting /mcp request without text/event-stream in Accept");
        let reply = RpcMessage::error_reply(None, SERVER_ERROR, NOT_ACCEPTABLE_MESSAGE);
        return (StatusCode::NOT_ACCEPTABLE, Json(reply.as_value().clone())).into_response();
    }

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read /mcp request body");
            return sse_reply(future::ready(RpcMessage::parse_error()));
        }
    };

    let message = match RpcMessage::from_slice(&body) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!(error = %e, "Unparseable /mcp request body");
            return sse_reply(future::ready(RpcMessage::parse_error()));
        }
    };

    if message.is_notification() {
        tracing::debug!(method = message.method().unwrap_or("-"), "Forwarding notification");
        // Send failures are logged by the supervisor; the client gets 202 either way.
        let _ = service.notify(message);
        return StatusCode::ACCEPTED.into_response();
    }

    let id = message.id().cloned();
    tracing::debug!(
        id = %id.as_ref().map(ToString::to_string).unwrap_or_default(),
        method = message.method().unwrap_or("-"),
        "Forwarding call"
    );

    match service.call(message) {
        Ok(pending) => sse_reply(pending),
        Err(e) => {
            let reply = RpcMessage::error_reply(id.as_ref(), SERVER_ERROR, e.to_string());
            sse_reply(future::ready(reply))
        }
    }
}

/// Legacy stream of everything the child writes.
async fn sse(State(service): State<Arc<BridgeService>>) -> Response {
    tracing::debug!("Legacy SSE client connected");
    let events = service
        .message_stream()
        .take_until(service.shutdown_signal())
        .map(|message| Ok::<_, Infallible>(output_event(&message)));

    Sse::new(events)
        .keep_alive(KeepAlive::new().interval(SSE_KEEPALIVE).text("keepalive"))
        .into_response()
}

/// Legacy fire-and-forget forwarding.
async fn message(State(service): State<Arc<BridgeService>>, request: Request) -> Response {
    let parsed = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(body) => RpcMessage::from_slice(&body).ok(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read /message request body");
            None
        }
    };

    let Some(message) = parsed else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Invalid JSON"})),
        )
            .into_response();
    };

    let _ = service.notify(message);
    (StatusCode::OK, Json(serde_json::json!({"status": "sent"}))).into_response()
}

async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": "Not found"})),
    )
        .into_response()
}

/// Answer preflight requests and stamp CORS headers on every response.
async fn cors(request: Request, next: Next) -> Response {
    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else {
        next.run(request).await
    };

    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    response
}

/// True if any `Accept` header lists `text/event-stream` (parameters ignored).
fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|item| item.split(';').next())
        .any(|media| media.trim().eq_ignore_ascii_case("text/event-stream"))
}

/// SSE response carrying exactly one `message` event, then closing.
fn sse_reply<F>(reply: F) -> Response
where
    F: Future<Output = RpcMessage> + Send + 'static,
{
    let events = stream::once(async move {
        let message = reply.await;
        Ok::<_, Infallible>(Event::default().event("message").data(message.as_str()))
    });
    Sse::new(events).into_response()
}

fn output_event(message: &RpcMessage) -> Event {
    let payload = OutputEvent {
        kind: "output",
        data: message.as_str(),
    };
    match serde_json::to_string(&payload) {
        Ok(data) => Event::default().data(data),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode SSE output event");
            Event::default().comment("encode error")
        }
    }
}

pub fn routes(service: Arc<BridgeService>) -> Router {
    Router::new()
        .route("/health", any(health_check))
        .route("/mcp", post(mcp).fallback(not_found))
        .route("/sse", get(sse).fallback(not_found))
        .route("/message", post(message).fallback(not_found))
        .fallback(not_found)
        .layer(middleware::from_fn(cors))
        .with_state(service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::config::BridgeConfig;
    use crate::supervisor::SupervisorConfig;

    /// Answers `"id":"42"` with pong and echoes nothing else.
    const PONG_SCRIPT: &str = r#"while IFS= read -r line; do case "$line" in *'"id":"42"'*) printf '%s\n' '{"jsonrpc":"2.0","id":"42","result":"pong"}';; esac; done"#;

    fn service(script: &str) -> Arc<BridgeService> {
        let supervisor = SupervisorConfig::new("sh", vec!["-c".to_string(), script.to_string()])
            .with_restart_delay(Duration::from_secs(60));
        BridgeService::with_supervisor_config(BridgeConfig::new("contoso"), supervisor)
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn sse_data(body: &str) -> &str {
        body.lines()
            .find_map(|line| line.strip_prefix("data: "))
            .unwrap()
    }

    fn mcp_post(body: &'static str) -> Request<Body> {
        Request::post("/mcp")
            .header("content-type", "application/json")
            .header("accept", "application/json, text/event-stream")
            .body(Body::from(body))
            .unwrap()
    }

    #[test]
    fn accept_header_matching() {
        let mut headers = HeaderMap::new();
        assert!(!accepts_event_stream(&headers));

        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        assert!(!accepts_event_stream(&headers));

        headers.append(ACCEPT, HeaderValue::from_static("Text/Event-Stream;q=0.9"));
        assert!(accepts_event_stream(&headers));

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-streaming"));
        assert!(!accepts_event_stream(&headers));
    }

    #[tokio::test]
    async fn health_reports_starting_with_identity() {
        let app = routes(service("cat"));

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["status"], "starting");
        assert_eq!(json["organization"], "contoso");
        assert_eq!(json["authType"], "env");
    }

    #[tokio::test]
    async fn health_reports_healthy_when_child_runs() {
        let svc = service("cat");
        svc.start().unwrap();
        let app = routes(Arc::clone(&svc));

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let json = response_json(response).await;
        assert_eq!(json["status"], "healthy");
        svc.shutdown();
    }

    #[tokio::test]
    async fn mcp_without_event_stream_accept_is_406() {
        let svc = service("cat");
        let app = routes(Arc::clone(&svc));

        let response = app
            .oneshot(
                Request::post("/mcp")
                    .header("accept", "application/json")
                    .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
        let json = response_json(response).await;
        assert_eq!(json["id"], serde_json::Value::Null);
        assert_eq!(json["error"]["code"], -32000);
        assert_eq!(json["error"]["message"], NOT_ACCEPTABLE_MESSAGE);
        assert_eq!(svc.correlator().pending_count(), 0);
    }

    #[tokio::test]
    async fn mcp_parse_error_is_single_sse_event() {
        let app = routes(service("cat"));

        let response = app.oneshot(mcp_post("{not json")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            HeaderValue::from_static("text/event-stream")
        );
        let body = body_text(response).await;
        assert_eq!(body.matches("event: message\n").count(), 1);
        let reply: serde_json::Value = serde_json::from_str(sse_data(&body)).unwrap();
        assert_eq!(reply["id"], serde_json::Value::Null);
        assert_eq!(reply["error"]["code"], -32700);
    }

    #[tokio::test]
    async fn mcp_notification_is_202_without_body() {
        let svc = service("cat > /dev/null");
        svc.start().unwrap();
        let app = routes(Arc::clone(&svc));

        let response = app
            .oneshot(mcp_post(
                r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(body_text(response).await.is_empty());
        assert_eq!(svc.correlator().pending_count(), 0);
        svc.shutdown();
    }

    #[tokio::test]
    async fn mcp_call_streams_reply_text() {
        let svc = service(PONG_SCRIPT);
        svc.start().unwrap();
        let app = routes(Arc::clone(&svc));

        let response = app
            .oneshot(mcp_post(r#"{"jsonrpc":"2.0","id":"42","method":"ping"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = tokio::time::timeout(Duration::from_secs(5), body_text(response))
            .await
            .expect("reply timed out");
        assert_eq!(
            body,
            "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":\"42\",\"result\":\"pong\"}\n\n"
        );
        svc.shutdown();
    }

    #[tokio::test]
    async fn mcp_call_without_child_streams_server_error() {
        let svc = service("cat");
        let app = routes(Arc::clone(&svc));

        let response = app
            .oneshot(mcp_post(r#"{"jsonrpc":"2.0","id":3,"method":"ping"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_text(response).await;
        let reply: serde_json::Value = serde_json::from_str(sse_data(&body)).unwrap();
        assert_eq!(reply["id"], 3);
        assert_eq!(reply["error"]["code"], -32000);
        assert_eq!(svc.correlator().pending_count(), 0);
    }

    #[tokio::test]
    async fn legacy_message_forwards_or_rejects() {
        let svc = service("cat > /dev/null");
        svc.start().unwrap();
        let app = routes(Arc::clone(&svc));

        let response = app
            .clone()
            .oneshot(
                Request::post("/message")
                    .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await["status"], "sent");

        let response = app
            .oneshot(Request::post("/message").body(Body::from("nope")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response_json(response).await["error"], "Invalid JSON");
        svc.shutdown();
    }

    #[tokio::test]
    async fn legacy_sse_streams_child_output_until_shutdown() {
        let svc = service("cat");
        let app = routes(Arc::clone(&svc));

        let response = app
            .oneshot(Request::get("/sse").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(svc.bus().subscriber_count(), 2);

        svc.bus().publish(crate::bus::BusEvent::Message(
            RpcMessage::parse(r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#).unwrap(),
        ));

        let mut body = response.into_body();
        let frame = body.frame().await.unwrap().unwrap();
        let text = String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap();
        assert_eq!(
            text,
            "data: {\"type\":\"output\",\"data\":\"{\\\"jsonrpc\\\":\\\"2.0\\\",\\\"method\\\":\\\"notifications/progress\\\"}\"}\n\n"
        );

        svc.shutdown();
        let rest = tokio::time::timeout(Duration::from_secs(1), body.collect())
            .await
            .expect("stream did not end on shutdown");
        assert!(rest.is_ok());
    }

    #[tokio::test]
    async fn options_is_200_with_cors() {
        let app = routes(service("cat"));

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/anything")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(
            response.headers()[ACCESS_CONTROL_ALLOW_METHODS],
            "GET, POST, OPTIONS"
        );
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_HEADERS], "Content-Type");
        assert!(body_text(response).await.is_empty());
    }

    #[tokio::test]
    async fn unknown_path_and_method_are_404() {
        let app = routes(service("cat"));

        let response = app
            .clone()
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(response_json(response).await["error"], "Not found");

        let response = app
            .oneshot(Request::get("/mcp").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
