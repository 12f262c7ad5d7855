use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use streamr_client::stream::connection::ConnectionError;
use streamr_client::stream::proto::{
    decode_request, encode_response, Content, Request, ResendStatus, Response, StreamMessage,
    StreamPartition,
};
use streamr_client::{
    Client, ClientError, ClientEvent, ClientOptions, RestError, SubscribeOptions,
    SubscriptionState,
};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

const TEST_API_KEY: &str = "test-api-key";
const TEST_SESSION_TOKEN: &str = "session-1";
const TEST_STREAM_ID: &str = "temps-id";
const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct MockState {
    requests: mpsc::UnboundedSender<Request>,
}

struct MockServer {
    addr: SocketAddr,
    requests: mpsc::UnboundedReceiver<Request>,
    shutdown_tx: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl MockServer {
    async fn start() -> Self {
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let app = Router::new()
            .route("/api/v1/login/apikey", post(login_handler))
            .route(
                "/api/v1/streams",
                get(find_streams_handler).post(create_stream_handler),
            )
            .route("/api/v1/streams/:id", get(stream_by_id_handler))
            .route("/api/v1/ws", get(ws_handler))
            .with_state(MockState {
                requests: requests_tx,
            });
        let (addr, shutdown_tx, task) = spawn_server(app).await;
        Self {
            addr,
            requests,
            shutdown_tx,
            task,
        }
    }

    fn options(&self, api_key: &str) -> ClientOptions {
        ClientOptions::new(SecretString::new(api_key.to_string()))
            .with_endpoint(format!("ws://{}/api/v1/ws", self.addr))
            .with_rest_url(format!("http://{}/api/v1", self.addr))
    }

    async fn next_request(&mut self) -> Request {
        timeout(WAIT, self.requests.recv())
            .await
            .expect("timed out waiting for client request")
            .expect("mock server request channel closed")
    }

    fn stop(self) {
        let _ = self.shutdown_tx.send(());
        self.task.abort();
    }
}

async fn wait_for_event<F>(events: &mut mpsc::UnboundedReceiver<ClientEvent>, mut matches: F)
where
    F: FnMut(&ClientEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("client event channel closed");
            if matches(&event) {
                return;
            }
        }
    })
    .await
    .expect("timed out waiting for client event");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscribe_receives_broadcast_and_publish_reaches_server() {
    let mut server = MockServer::start().await;
    let client = Client::new(server.options(TEST_API_KEY))
        .await
        .expect("client with valid api key");
    assert_eq!(
        client
            .session_token()
            .map(|token| token.expose_secret().to_string())
            .as_deref(),
        Some(TEST_SESSION_TOKEN)
    );
    let mut events = client.events();

    let (delivered_tx, mut delivered_rx) = mpsc::unbounded_channel();
    let handle = client
        .subscribe(
            TEST_STREAM_ID,
            move |content: &Value, message: &StreamMessage| {
                let _ = delivered_tx.send((content.clone(), message.offset));
            },
            SubscribeOptions::default(),
        )
        .expect("subscribe");

    match server.next_request().await {
        Request::Subscribe(request) => {
            assert_eq!(request.stream_id, TEST_STREAM_ID);
            assert_eq!(request.api_key.as_deref(), Some(TEST_API_KEY));
            assert_eq!(request.session_token.as_deref(), Some(TEST_SESSION_TOKEN));
        }
        other => panic!("expected subscribe request, got {other:?}"),
    }

    let (content, offset) = timeout(WAIT, delivered_rx.recv())
        .await
        .expect("timed out waiting for broadcast")
        .expect("delivery channel closed");
    assert_eq!(content, json!({ "temperature": 21 }));
    assert_eq!(offset, 1);
    timeout(WAIT, handle.wait_for(SubscriptionState::Subscribed))
        .await
        .expect("timed out waiting for subscribed")
        .expect("subscription dropped");
    wait_for_event(&mut events, |event| matches!(event, ClientEvent::Connected)).await;

    client
        .publish(&handle, &json!({ "temperature": 22 }), None)
        .expect("publish");
    match server.next_request().await {
        Request::Publish(request) => {
            assert_eq!(request.stream_id, TEST_STREAM_ID);
            assert_eq!(request.content(), r#"{"temperature":22}"#);
            assert_eq!(request.api_key.as_deref(), Some(TEST_API_KEY));
            assert_eq!(request.session_token.as_deref(), Some(TEST_SESSION_TOKEN));
        }
        other => panic!("expected publish request, got {other:?}"),
    }

    client.unsubscribe(&handle).expect("unsubscribe");
    assert!(matches!(
        server.next_request().await,
        Request::Unsubscribe(_)
    ));
    timeout(WAIT, handle.wait_for(SubscriptionState::Unsubscribed))
        .await
        .expect("timed out waiting for unsubscribed")
        .expect("subscription dropped");
    wait_for_event(&mut events, |event| {
        matches!(event, ClientEvent::Disconnected)
    })
    .await;

    drop(client);
    server.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn publish_before_connect_is_flushed_on_open() {
    let mut server = MockServer::start().await;
    let client = Client::new(server.options(TEST_API_KEY).with_auto_disconnect(false))
        .await
        .expect("client with valid api key");

    for n in 1..=3 {
        client
            .publish(TEST_STREAM_ID, &json!({ "n": n }), None)
            .expect("queue publish");
    }
    for n in 1..=3 {
        match server.next_request().await {
            Request::Publish(request) => {
                assert_eq!(request.content(), format!(r#"{{"n":{n}}}"#));
            }
            other => panic!("expected publish request, got {other:?}"),
        }
    }

    assert!(matches!(
        client.publish(TEST_STREAM_ID, &json!(42), None),
        Err(ClientError::InvalidPublishData)
    ));

    client.disconnect().expect("disconnect");
    server.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_while_down_still_drops_subscriptions() {
    let server = MockServer::start().await;
    let client = Client::new(server.options(TEST_API_KEY).with_auto_connect(false))
        .await
        .expect("client with valid api key");

    let handle = client
        .subscribe(
            TEST_STREAM_ID,
            |_: &Value, _: &StreamMessage| {},
            SubscribeOptions::default(),
        )
        .expect("subscribe");

    assert!(matches!(
        client.disconnect(),
        Err(ClientError::Connection(ConnectionError::AlreadyDisconnected))
    ));
    let dropped = timeout(WAIT, handle.wait_for(SubscriptionState::Subscribed))
        .await
        .expect("timed out waiting for subscription to drop");
    assert!(matches!(dropped, Err(ClientError::Closed)));

    server.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rest_passthroughs_use_session_token() {
    let server = MockServer::start().await;
    let client = Client::new(server.options(TEST_API_KEY))
        .await
        .expect("client with valid api key");

    let existing = client
        .get_or_create_stream("temps", None)
        .await
        .expect("lookup existing stream");
    assert_eq!(existing.id, TEST_STREAM_ID);
    assert_eq!(existing.partitions, Some(1));

    let created = client
        .get_or_create_stream("fresh", Some("new stream"))
        .await
        .expect("create missing stream");
    assert_eq!(created.id, "fresh-id");
    assert_eq!(created.name, "fresh");
    assert_eq!(created.description.as_deref(), Some("new stream"));

    let by_id = client
        .get_stream_by_id(TEST_STREAM_ID)
        .await
        .expect("lookup by id");
    assert_eq!(by_id.map(|stream| stream.name).as_deref(), Some("temps"));
    assert!(client
        .get_stream_by_id("missing")
        .await
        .expect("lookup missing id")
        .is_none());

    server.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_api_key_fails_construction() {
    let server = MockServer::start().await;
    let result = Client::new(server.options("wrong-key")).await;
    match result {
        Err(ClientError::Session(RestError::HttpStatus { status, body })) => {
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(body, "invalid api key");
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("client construction should fail"),
    }
    server.stop();
}

async fn login_handler(Json(body): Json<Value>) -> impl IntoResponse {
    if body.get("apiKey").and_then(Value::as_str) == Some(TEST_API_KEY) {
        (StatusCode::OK, Json(json!({ "token": TEST_SESSION_TOKEN })))
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "message": "invalid api key" })),
        )
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == format!("Bearer {TEST_SESSION_TOKEN}"))
}

fn unauthorized() -> (StatusCode, Json<Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "message": "missing session token" })),
    )
}

fn temps_record() -> Value {
    json!({ "id": TEST_STREAM_ID, "name": "temps", "partitions": 1 })
}

async fn find_streams_handler(
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if !authorized(&headers) {
        return unauthorized();
    }
    let streams = match query.get("name").map(String::as_str) {
        Some("temps") => json!([temps_record()]),
        _ => json!([]),
    };
    (StatusCode::OK, Json(streams))
}

async fn create_stream_handler(headers: HeaderMap, Json(body): Json<Value>) -> impl IntoResponse {
    if !authorized(&headers) {
        return unauthorized();
    }
    let has_fields = body.pointer("/config/fields").is_some_and(Value::is_array);
    if !has_fields {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "message": "config.fields is required" })),
        );
    }
    (
        StatusCode::CREATED,
        Json(json!({
            "id": format!("{}-id", body["name"].as_str().unwrap_or_default()),
            "name": body["name"],
            "description": body["description"],
            "config": body["config"],
        })),
    )
}

async fn stream_by_id_handler(headers: HeaderMap, Path(id): Path<String>) -> impl IntoResponse {
    if !authorized(&headers) {
        return unauthorized();
    }
    if id == TEST_STREAM_ID {
        (StatusCode::OK, Json(temps_record()))
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "message": "stream not found" })),
        )
    }
}

async fn ws_handler(State(state): State<MockState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

/// Acks subscribe and unsubscribe requests and broadcasts one message per
/// subscribe. Every decoded request is forwarded to the test.
async fn serve_socket(mut socket: WebSocket, state: MockState) {
    while let Some(Ok(frame)) = socket.next().await {
        let Message::Text(text) = frame else {
            continue;
        };
        let Ok(request) = decode_request(&text) else {
            continue;
        };

        let replies = match &request {
            Request::Subscribe(subscribe) => vec![
                Response::SubscribeAck(StreamPartition {
                    stream: subscribe.stream_id.clone(),
                    partition: subscribe.partition,
                }),
                Response::Broadcast(StreamMessage::new(
                    subscribe.stream_id.clone(),
                    subscribe.partition,
                    1_700_000_000_000,
                    1,
                    None,
                    Content::Text(r#"{"temperature":21}"#.to_string()),
                )),
            ],
            Request::Unsubscribe(unsubscribe) => vec![Response::UnsubscribeAck(StreamPartition {
                stream: unsubscribe.stream_id.clone(),
                partition: unsubscribe.partition,
            })],
            Request::Resend(resend) => vec![Response::ResendNoResend(ResendStatus {
                stream: resend.stream_id.clone(),
                partition: resend.partition,
                sub: resend.sub_id.clone(),
            })],
            Request::Publish(_) => Vec::new(),
        };
        let _ = state.requests.send(request);

        for reply in replies {
            if socket
                .send(Message::Text(encode_response(&reply)))
                .await
                .is_err()
            {
                return;
            }
        }
    }
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, shutdown_tx, task)
}
