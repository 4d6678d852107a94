//! Request-recording mock endpoints for pipeline tests: an APM Server
//! intake and the Lambda platform APIs the extension talks to.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

#[derive(Clone, Debug)]
pub struct ReceivedIntake {
    pub authorization: Option<String>,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    /// True when the mock answered this request with a 500.
    pub failed: bool,
}

impl ReceivedIntake {
    pub fn body_string(&self) -> String {
        String::from_utf8(self.body.clone()).unwrap()
    }
}

/// Mock APM Server that records every intake request. Flip `fail` to make
/// it answer 500s.
#[derive(Clone)]
pub struct MockApmServer {
    pub addr: SocketAddr,
    pub requests: Arc<Mutex<Vec<ReceivedIntake>>>,
    pub fail: Arc<AtomicBool>,
}

impl MockApmServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock APM server");
        let addr = listener.local_addr().expect("mock APM server local addr");
        let server = MockApmServer {
            addr,
            requests: Arc::new(Mutex::new(Vec::new())),
            fail: Arc::new(AtomicBool::new(false)),
        };
        let router = Router::new()
            .route("/intake/v2/events", post(Self::intake))
            .with_state(server.clone());
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("mock APM server died");
        });
        server
    }

    async fn intake(
        State(server): State<MockApmServer>,
        headers: HeaderMap,
        body: Bytes,
    ) -> StatusCode {
        let failed = server.fail.load(Ordering::SeqCst);
        server.requests.lock().unwrap().push(ReceivedIntake {
            authorization: header_string(&headers, "authorization"),
            content_type: header_string(&headers, "content-type"),
            body: body.to_vec(),
            failed,
        });
        if failed {
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            StatusCode::ACCEPTED
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<ReceivedIntake> {
        self.requests.lock().unwrap().clone()
    }
}

/// Mock Lambda platform: Extensions API register/next plus the Logs API
/// subscription endpoint. Lifecycle events are fed in by the test and
/// handed out through the `next` long poll.
#[derive(Clone)]
pub struct MockPlatform {
    pub addr: SocketAddr,
    events_tx: mpsc::Sender<serde_json::Value>,
    events_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<serde_json::Value>>>,
    pub subscriptions: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl MockPlatform {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock platform");
        let addr = listener.local_addr().expect("mock platform local addr");
        let (events_tx, events_rx) = mpsc::channel(16);
        let platform = MockPlatform {
            addr,
            events_tx,
            events_rx: Arc::new(tokio::sync::Mutex::new(events_rx)),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
        };
        let router = Router::new()
            .route("/2020-01-01/extension/register", post(Self::register))
            .route("/2020-01-01/extension/event/next", get(Self::next_event))
            .route("/2020-08-15/logs", put(Self::subscribe))
            .with_state(platform.clone());
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("mock platform died");
        });
        platform
    }

    async fn register(State(_): State<MockPlatform>) -> Response {
        Response::builder()
            .status(StatusCode::OK)
            .header("Lambda-Extension-Identifier", "mock-extension-id")
            .header("content-type", "application/json")
            .body(r#"{"functionName":"mock-fn"}"#.into())
            .unwrap()
    }

    async fn next_event(State(platform): State<MockPlatform>) -> Response {
        let event = platform.events_rx.lock().await.recv().await;
        match event {
            Some(event) => Json(event).into_response(),
            None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        }
    }

    async fn subscribe(State(platform): State<MockPlatform>, Json(body): Json<serde_json::Value>) -> StatusCode {
        platform.subscriptions.lock().unwrap().push(body);
        StatusCode::OK
    }

    pub async fn send_invoke(&self, request_id: &str, function_arn: &str, deadline_ms: i64) {
        self.events_tx
            .send(serde_json::json!({
                "eventType": "INVOKE",
                "requestId": request_id,
                "invokedFunctionArn": function_arn,
                "deadlineMs": deadline_ms,
            }))
            .await
            .expect("mock platform event queue closed");
    }

    pub async fn send_shutdown(&self, reason: &str) {
        self.events_tx
            .send(serde_json::json!({
                "eventType": "SHUTDOWN",
                "shutdownReason": reason,
                "deadlineMs": 0,
            }))
            .await
            .expect("mock platform event queue closed");
    }

    /// Destination URI of the first Logs API subscription, once the
    /// extension has subscribed.
    pub fn subscribed_destination(&self) -> Option<String> {
        self.subscriptions
            .lock()
            .unwrap()
            .first()
            .and_then(|s| s["destination"]["URI"].as_str().map(String::from))
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}
