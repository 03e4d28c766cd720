use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use msgbridge_rs::config::{AppConfig, UpstreamConfig};
use msgbridge_rs::routing::dispatch_request;
use msgbridge_rs::state::AppState;
use serde_json::{json, Value};

type Captured = Arc<Mutex<Vec<(HeaderMap, Value)>>>;

async fn spawn_backend(app: Router) -> (String, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock backend");
    let addr = listener.local_addr().expect("local addr");
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), server)
}

fn build_state(base_url: String) -> Arc<AppState> {
    let config = AppConfig {
        upstream: UpstreamConfig {
            base_url,
            api_key: Some("backend-secret".to_string()),
            reasoning_model: "mock/reasoner".to_string(),
            completion_model: "mock/completer".to_string(),
        },
        ..AppConfig::default()
    };
    Arc::new(AppState::from_config(config).expect("build state"))
}

/// Backend that records each request and replies with a fixed SSE body.
fn sse_backend(captured: Captured, sse_body: &'static str) -> Router {
    Router::new()
        .route(
            "/v1/chat/completions",
            post(
                move |State(captured): State<Captured>,
                      headers: HeaderMap,
                      Json(body): Json<Value>| async move {
                    captured.lock().expect("capture lock").push((headers, body));
                    Response::builder()
                        .header("content-type", "text/event-stream")
                        .body(Body::from(sse_body))
                        .expect("sse response")
                },
            ),
        )
        .with_state(captured)
}

fn json_backend(captured: Captured, status: StatusCode, reply: Value) -> Router {
    Router::new()
        .route(
            "/v1/chat/completions",
            post(
                move |State(captured): State<Captured>,
                      headers: HeaderMap,
                      Json(body): Json<Value>| async move {
                    captured.lock().expect("capture lock").push((headers, body));
                    (status, Json(reply))
                },
            ),
        )
        .with_state(captured)
}

async fn post_messages(state: Arc<AppState>, body: Value) -> Response {
    let request = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).expect("serialize")))
        .expect("build request");
    dispatch_request(state, Arc::<str>::from(""), request)
        .await
        .expect("dispatch")
}

async fn body_text(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    String::from_utf8(bytes.to_vec()).expect("utf8 body")
}

/// Split an SSE body into `(event, data)` pairs.
fn parse_frames(body: &str) -> Vec<(String, Value)> {
    body.split("\n\n")
        .filter(|frame| !frame.trim().is_empty())
        .map(|frame| {
            let mut event = String::new();
            let mut data = Value::Null;
            for line in frame.lines() {
                if let Some(name) = line.strip_prefix("event: ") {
                    event = name.to_string();
                } else if let Some(payload) = line.strip_prefix("data: ") {
                    data = serde_json::from_str(payload).expect("frame json");
                }
            }
            (event, data)
        })
        .collect()
}

fn event_names(frames: &[(String, Value)]) -> Vec<&str> {
    frames.iter().map(|(event, _)| event.as_str()).collect()
}

#[tokio::test]
async fn test_non_stream_hi() {
    let captured = Captured::default();
    let (base_url, server) = spawn_backend(json_backend(
        Arc::clone(&captured),
        StatusCode::OK,
        json!({
            "id": "chatcmpl-abc",
            "model": "mock/completer",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Hi"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
        }),
    ))
    .await;

    let response = post_messages(
        build_state(base_url),
        json!({
            "model": "claude-3-5-sonnet",
            "max_tokens": 64,
            "messages": [{"role": "user", "content": "Hello"}]
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let payload: Value = serde_json::from_str(&body_text(response).await).expect("json");
    assert_eq!(payload["id"], "msg-abc");
    assert_eq!(payload["type"], "message");
    assert_eq!(payload["role"], "assistant");
    assert_eq!(payload["content"], json!([{"type": "text", "text": "Hi"}]));
    assert_eq!(payload["stop_reason"], "end_turn");
    assert_eq!(payload["usage"]["input_tokens"], 3);
    assert_eq!(payload["usage"]["output_tokens"], 1);

    let captured = captured.lock().expect("capture lock");
    let (headers, body) = &captured[0];
    assert_eq!(headers["authorization"], "Bearer backend-secret");
    assert_eq!(body["model"], "mock/completer");
    assert_eq!(body["stream"], false);
    assert_eq!(
        body["messages"],
        json!([{"role": "user", "content": "Hello"}])
    );

    server.abort();
}

#[tokio::test]
async fn test_thinking_selects_reasoning_model() {
    let captured = Captured::default();
    let (base_url, server) = spawn_backend(json_backend(
        Arc::clone(&captured),
        StatusCode::OK,
        json!({
            "choices": [{"message": {"role": "assistant", "content": "ok"}, "finish_reason": "stop"}]
        }),
    ))
    .await;

    let response = post_messages(
        build_state(base_url),
        json!({
            "thinking": {"type": "enabled", "budget_tokens": 1024},
            "messages": [{"role": "user", "content": "think"}]
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let payload: Value = serde_json::from_str(&body_text(response).await).expect("json");
    // backend omitted its model
    assert_eq!(payload["model"], "mock/reasoner");
    assert_eq!(captured.lock().expect("capture lock")[0].1["model"], "mock/reasoner");

    server.abort();
}

#[tokio::test]
async fn test_excluded_tools_are_not_forwarded() {
    let captured = Captured::default();
    let (base_url, server) = spawn_backend(json_backend(
        Arc::clone(&captured),
        StatusCode::OK,
        json!({
            "choices": [{"message": {"role": "assistant", "content": ""}, "finish_reason": "stop"}]
        }),
    ))
    .await;

    let response = post_messages(
        build_state(base_url),
        json!({
            "messages": [{"role": "user", "content": "use tools"}],
            "tools": [
                {"name": "BatchTool", "input_schema": {"type": "object"}},
                {
                    "name": "get_weather",
                    "description": "Weather lookup",
                    "input_schema": {
                        "type": "object",
                        "properties": {"city": {"type": "string", "format": "uri"}}
                    }
                }
            ]
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let captured = captured.lock().expect("capture lock");
    let tools = captured[0].1["tools"].as_array().expect("tools array").clone();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0]["type"], "function");
    assert_eq!(tools[0]["function"]["name"], "get_weather");
    assert!(tools[0]["function"]["parameters"]["properties"]["city"]
        .get("format")
        .is_none());

    server.abort();
}

#[tokio::test]
async fn test_backend_error_status_passes_through() {
    let captured = Captured::default();
    let (base_url, server) = spawn_backend(json_backend(
        Arc::clone(&captured),
        StatusCode::TOO_MANY_REQUESTS,
        json!({"error": {"message": "rate limited"}}),
    ))
    .await;

    let response = post_messages(
        build_state(base_url),
        json!({"stream": true, "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let payload: Value = serde_json::from_str(&body_text(response).await).expect("json");
    assert_eq!(payload, json!({"error": {"message": "rate limited"}}));

    server.abort();
}

#[tokio::test]
async fn test_stream_tool_call() {
    let sse = concat!(
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"type\":\"function\",\"function\":{\"name\":\"get_weather\",\"arguments\":\"\"}}]}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"city\\\":\"}}]}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"\\\"Paris\\\"}\"}}]},\"finish_reason\":\"tool_calls\"}]}\n\n",
        "data: [DONE]\n\n",
    );
    let captured = Captured::default();
    let (base_url, server) = spawn_backend(sse_backend(Arc::clone(&captured), sse)).await;

    let response = post_messages(
        build_state(base_url),
        json!({
            "stream": true,
            "messages": [{"role": "user", "content": "Weather in Paris?"}],
            "tools": [{"name": "get_weather", "input_schema": {"type": "object"}}]
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");

    let frames = parse_frames(&body_text(response).await);
    assert_eq!(
        event_names(&frames),
        vec![
            "message_start",
            "ping",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );
    assert_eq!(frames[0].1["message"]["model"], "mock/completer");
    assert_eq!(
        frames[2].1["content_block"],
        json!({"type": "tool_use", "id": "call_1", "name": "get_weather", "input": {}})
    );
    let arguments: String = frames[3..5]
        .iter()
        .map(|(_, data)| data["delta"]["partial_json"].as_str().expect("partial_json"))
        .collect();
    assert_eq!(arguments, "{\"city\":\"Paris\"}");
    assert_eq!(frames[6].1["delta"]["stop_reason"], "tool_use");

    let captured = captured.lock().expect("capture lock");
    assert_eq!(captured[0].1["stream"], true);

    server.abort();
}

#[tokio::test]
async fn test_stream_text() {
    let sse = concat!(
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hel\"}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo there\"}}]}\n\n",
        "data: [DONE]\n\n",
    );
    let (base_url, server) = spawn_backend(sse_backend(Captured::default(), sse)).await;

    let response = post_messages(
        build_state(base_url),
        json!({"stream": true, "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let frames = parse_frames(&body_text(response).await);
    assert_eq!(
        event_names(&frames),
        vec![
            "message_start",
            "ping",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );
    assert_eq!(frames[3].1["delta"], json!({"type": "text_delta", "text": "Hel"}));
    assert_eq!(frames[6].1["delta"]["stop_reason"], "end_turn");
    // "Hello there" is two words
    assert_eq!(frames[6].1["usage"]["output_tokens"], 2);

    server.abort();
}

#[tokio::test]
async fn test_stream_error_before_first_frame_is_json_500() {
    let sse = "data: {\"error\":{\"message\":\"model overloaded\"}}\n\n";
    let (base_url, server) = spawn_backend(sse_backend(Captured::default(), sse)).await;

    let response = post_messages(
        build_state(base_url),
        json!({"stream": true, "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let payload: Value = serde_json::from_str(&body_text(response).await).expect("json");
    assert_eq!(payload, json!({"error": "model overloaded"}));

    server.abort();
}

#[tokio::test]
async fn test_stream_closed_without_done_ends_with_error_event() {
    let sse = "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"partial\"}}]}\n\n";
    let (base_url, server) = spawn_backend(sse_backend(Captured::default(), sse)).await;

    let response = post_messages(
        build_state(base_url),
        json!({"stream": true, "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let frames = parse_frames(&body_text(response).await);
    let names = event_names(&frames);
    assert_eq!(names.first(), Some(&"message_start"));
    assert_eq!(names.last(), Some(&"error"));
    assert!(!names.contains(&"message_stop"));
    let (_, error) = frames.last().expect("error frame");
    assert_eq!(error["error"]["type"], "api_error");

    server.abort();
}

#[tokio::test]
async fn test_unknown_path_and_method() {
    let state = build_state("http://127.0.0.1:9".to_string());

    let request = Request::builder()
        .method("GET")
        .uri("/v1/messages")
        .body(Body::empty())
        .expect("build request");
    let response = dispatch_request(Arc::clone(&state), Arc::<str>::from(""), request)
        .await
        .expect("dispatch");
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/complete")
        .body(Body::empty())
        .expect("build request");
    let response = dispatch_request(state, Arc::<str>::from(""), request)
        .await
        .expect("dispatch");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
