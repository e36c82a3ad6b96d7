//! End-to-end WebSocket tests against a real listener.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use pollroom::config::Config;
use pollroom::history::HistoryBackend;
use pollroom::server;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn start() -> Self {
        let mut config = Config::default();
        config.history.backend = HistoryBackend::None;
        let state = server::build_state(&config).await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            server::serve(listener, state, &config.server.cors_origins, async {
                let _ = rx.await;
            })
            .await
            .unwrap();
        });
        Self {
            addr,
            shutdown: Some(tx),
            handle,
        }
    }

    async fn client(&self) -> Client {
        let (ws, _) = connect_async(format!("ws://{}/ws", self.addr)).await.unwrap();
        Client {
            ws,
            pending: Vec::new(),
            next_id: 0,
        }
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = tokio::time::timeout(READ_TIMEOUT, self.handle).await;
    }
}

struct Client {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pending: Vec<Value>,
    next_id: u64,
}

impl Client {
    async fn read_frame(&mut self) -> Value {
        loop {
            let message = tokio::time::timeout(READ_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("socket closed")
                .unwrap();
            if let Message::Text(text) = message {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    /// Send a request and return its response, buffering events seen meanwhile.
    async fn call(&mut self, method: &str, params: Value) -> Value {
        self.next_id += 1;
        let id = format!("r{}", self.next_id);
        let frame = json!({ "type": "req", "id": id, "method": method, "params": params });
        self.ws
            .send(Message::text(frame.to_string()))
            .await
            .unwrap();
        loop {
            let frame = self.read_frame().await;
            if frame["type"] == "res" && frame["id"] == id.as_str() {
                return frame;
            }
            self.pending.push(frame);
        }
    }

    /// Next event named `name`, skipping others.
    async fn event(&mut self, name: &str) -> Value {
        if let Some(pos) = self.pending.iter().position(|f| f["event"] == name) {
            return self.pending.remove(pos)["payload"].clone();
        }
        loop {
            let frame = self.read_frame().await;
            if frame["type"] == "event" && frame["event"] == name {
                return frame["payload"].clone();
            }
        }
    }
}

#[tokio::test]
async fn test_health_over_websocket() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    let res = client.call("health", json!({})).await;
    assert_eq!(res["ok"], true);
    assert_eq!(res["payload"]["status"], "healthy");

    let res = client.call("no.such.method", json!({})).await;
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"]["code"], "UNAVAILABLE");

    server.stop().await;
}

#[tokio::test]
async fn test_full_poll_round() {
    let server = TestServer::start().await;
    let mut moderator = server.client().await;
    let mut p1 = server.client().await;
    let mut p2 = server.client().await;

    let res = moderator.call("moderator.join", json!({ "name": "host" })).await;
    assert_eq!(res["ok"], true);
    assert_eq!(p1.call("participant.join", json!({ "name": "p1" })).await["ok"], true);
    assert_eq!(p2.call("participant.join", json!({ "name": "p2" })).await["ok"], true);

    let res = moderator
        .call(
            "poll.start",
            json!({ "question": "Best?", "options": ["A", "B"], "timeoutSecs": 60 }),
        )
        .await;
    assert_eq!(res["ok"], true);
    let started = p1.event("poll.started").await;
    assert_eq!(started["question"], "Best?");

    let res = p1.call("poll.answer", json!({ "name": "p1", "option": "A" })).await;
    assert_eq!(res["ok"], true);
    assert_eq!(res["payload"]["results"], json!({ "A": 1, "B": 0 }));

    let res = p1.call("poll.answer", json!({ "name": "p1", "option": "C" })).await;
    assert_eq!(res["error"]["code"], "INVALID_OPTION");

    let res = p2.call("poll.answer", json!({ "name": "p2", "option": "B" })).await;
    assert_eq!(res["ok"], true);

    for client in [&mut moderator, &mut p1, &mut p2] {
        let ended = client.event("poll.ended").await;
        assert_eq!(ended["reason"], "allAnswered");
    }

    let res = moderator.call("poll.history", json!({})).await;
    let polls = res["payload"]["polls"].as_array().unwrap();
    assert_eq!(polls.len(), 1);
    assert_eq!(polls[0]["tally"], json!({ "A": 1, "B": 1 }));

    let res = p1.call("poll.hasAnswered", json!({ "name": "p1" })).await;
    assert_eq!(res["payload"]["hasAnswered"], false);

    server.stop().await;
}

#[tokio::test]
async fn test_participant_cannot_run_moderator_methods() {
    let server = TestServer::start().await;
    let mut p1 = server.client().await;
    p1.call("participant.join", json!({ "name": "p1" })).await;

    let res = p1
        .call(
            "poll.start",
            json!({ "question": "Mine?", "options": ["A"], "timeoutSecs": 30 }),
        )
        .await;
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"]["code"], "FORBIDDEN");

    let res = p1.call("participant.kick", json!({ "name": "p1" })).await;
    assert_eq!(res["error"]["code"], "FORBIDDEN");

    let active = reqwest::get(format!("http://{}/api/polls/active", server.addr))
        .await
        .unwrap();
    assert_eq!(active.status(), reqwest::StatusCode::NOT_FOUND);

    server.stop().await;
}

#[tokio::test]
async fn test_kick_notifies_target() {
    let server = TestServer::start().await;
    let mut moderator = server.client().await;
    let mut p1 = server.client().await;

    moderator.call("moderator.join", json!({ "name": "host" })).await;
    p1.call("participant.join", json!({ "name": "p1" })).await;
    let joined = moderator.event("participants.updated").await;
    assert_eq!(joined["participants"].as_array().unwrap().len(), 1);

    let res = moderator.call("participant.kick", json!({ "name": "p1" })).await;
    assert_eq!(res["ok"], true);
    let kicked = p1.event("participant.kicked").await;
    assert_eq!(kicked["name"], "p1");

    let update = moderator.event("participants.updated").await;
    assert!(update["participants"].as_array().unwrap().is_empty());

    let res = moderator.call("participant.kick", json!({ "name": "p1" })).await;
    assert_eq!(res["error"]["code"], "NOT_FOUND");

    server.stop().await;
}

#[tokio::test]
async fn test_disconnect_removes_participant() {
    let server = TestServer::start().await;
    let mut moderator = server.client().await;
    moderator.call("moderator.join", json!({ "name": "host" })).await;

    let mut p1 = server.client().await;
    p1.call("participant.join", json!({ "name": "p1" })).await;
    let joined = moderator.event("participants.updated").await;
    assert_eq!(joined["participants"].as_array().unwrap().len(), 1);

    p1.ws.close(None).await.unwrap();
    drop(p1);

    let left = moderator.event("participants.updated").await;
    assert!(left["participants"].as_array().unwrap().is_empty());

    let participants: Value = reqwest::get(format!("http://{}/api/participants", server.addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(participants, json!([]));

    server.stop().await;
}

#[tokio::test]
async fn test_http_api_sends_cors_headers() {
    let server = TestServer::start().await;

    let response = reqwest::Client::new()
        .get(format!("http://{}/api/polls", server.addr))
        .header("Origin", "http://localhost:5173")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .unwrap(),
        "http://localhost:5173"
    );
    let polls: Value = response.json().await.unwrap();
    assert_eq!(polls, json!([]));

    server.stop().await;
}
