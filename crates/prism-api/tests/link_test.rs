// Session tests for `HubLink` against a scripted in-process hub.
#![allow(clippy::unwrap_used)]

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use prism_api::{
    CallOutcome, ConnectionState, HubConfig, HubLink, LinkEvent, ReconnectConfig, ServiceCall,
};

const TOKEN: &str = "test-token";

type Ws = WebSocketStream<TcpStream>;

// ── Scripted hub ────────────────────────────────────────────────────

/// Start a hub that serves each accepted connection with `serve(index, ws)`.
async fn start_hub<F, Fut>(serve: F) -> Url
where
    F: Fn(usize, Ws) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut index = 0;
        while let Ok((stream, _)) = listener.accept().await {
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            tokio::spawn(serve(index, ws));
            index += 1;
        }
    });
    Url::parse(&format!("http://{addr}")).unwrap()
}

async fn hub_send(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

async fn hub_recv(ws: &mut Ws) -> Value {
    loop {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            _ => continue,
        }
    }
}

/// Run auth + subscription and deliver `snapshot` as the first event.
async fn handshake(ws: &mut Ws, snapshot: Value) {
    hub_send(ws, json!({"type": "auth_required", "ha_version": "2025.1.0"})).await;

    let auth = hub_recv(ws).await;
    assert_eq!(auth, json!({"type": "auth", "access_token": TOKEN}));
    hub_send(ws, json!({"type": "auth_ok", "ha_version": "2025.1.0"})).await;

    let sub = hub_recv(ws).await;
    assert_eq!(sub, json!({"type": "subscribe_entities", "id": 1}));
    hub_send(ws, json!({"id": 1, "type": "result", "success": true, "result": null})).await;
    hub_send(ws, json!({"id": 1, "type": "event", "event": {"a": snapshot}})).await;
}

fn kitchen_on() -> Value {
    json!({
        "light.kitchen": {"s": "on", "a": {"brightness": 200}, "lc": 1_700_000_000.0}
    })
}

// ── Client helpers ──────────────────────────────────────────────────

fn config(url: Url) -> HubConfig {
    let mut config = HubConfig::new(url, SecretString::from(TOKEN.to_owned()));
    config.reconnect = ReconnectConfig {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        max_retries: None,
    };
    config.handshake_timeout = Duration::from_secs(2);
    config
}

async fn next_event(rx: &mut mpsc::Receiver<LinkEvent>) -> LinkEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for link event")
        .expect("link event channel closed")
}

async fn wait_live(rx: &mut mpsc::Receiver<LinkEvent>) {
    while next_event(rx).await != LinkEvent::State(ConnectionState::Live) {}
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn handshake_reaches_live_with_snapshot() {
    let url = start_hub(|_, mut ws| async move {
        handshake(&mut ws, kitchen_on()).await;
        futures_util::future::pending::<()>().await;
        drop(ws);
    })
    .await;

    let (link, mut rx) = HubLink::spawn(config(url), &CancellationToken::new());

    assert_eq!(next_event(&mut rx).await, LinkEvent::State(ConnectionState::Connecting));
    assert_eq!(
        next_event(&mut rx).await,
        LinkEvent::State(ConnectionState::Authenticating)
    );
    assert_eq!(next_event(&mut rx).await, LinkEvent::State(ConnectionState::Subscribing));

    let LinkEvent::Snapshot(snapshot) = next_event(&mut rx).await else {
        panic!("expected snapshot");
    };
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot["light.kitchen"].state, "on");

    assert_eq!(next_event(&mut rx).await, LinkEvent::State(ConnectionState::Live));
    assert!(link.current_state().is_live());

    link.shutdown();
    let mut state = link.state();
    state
        .wait_for(|s| *s == ConnectionState::Disconnected)
        .await
        .unwrap();
}

#[tokio::test]
async fn call_results_are_correlated_and_updates_streamed() {
    let url = start_hub(|_, mut ws| async move {
        handshake(&mut ws, kitchen_on()).await;

        let first = hub_recv(&mut ws).await;
        assert_eq!(first["type"], "call_service");
        assert_eq!(first["id"], 2);
        assert_eq!(first["domain"], "light");
        assert_eq!(first["service"], "toggle");
        assert_eq!(first["target"]["entity_id"], "light.kitchen");

        let second = hub_recv(&mut ws).await;
        assert_eq!(second["id"], 3);

        // One batched frame: a state diff plus both results, second first
        hub_send(
            &mut ws,
            json!([
                {"id": 1, "type": "event", "event": {
                    "c": {"light.kitchen": {"+": {"s": "off", "lc": 1_700_000_005.0}}}
                }},
                {"id": 3, "type": "result", "success": false,
                 "error": {"code": "not_found", "message": "Service not found."}},
                {"id": 2, "type": "result", "success": true, "result": null}
            ]),
        )
        .await;
        futures_util::future::pending::<()>().await;
        drop(ws);
    })
    .await;

    let (link, mut rx) = HubLink::spawn(config(url), &CancellationToken::new());
    wait_live(&mut rx).await;

    let toggle = Uuid::new_v4();
    let bogus = Uuid::new_v4();
    link.send(
        ServiceCall::new(toggle, "light", "toggle")
            .unwrap()
            .with_target("light.kitchen"),
    )
    .await
    .unwrap();
    link.send(ServiceCall::new(bogus, "light", "explode").unwrap())
        .await
        .unwrap();

    let LinkEvent::Entities(update) = next_event(&mut rx).await else {
        panic!("expected entities update");
    };
    let diff = &update.changed["light.kitchen"];
    assert_eq!(diff.additions.as_ref().unwrap().state.as_deref(), Some("off"));

    assert_eq!(
        next_event(&mut rx).await,
        LinkEvent::CallResult {
            tag: bogus,
            outcome: CallOutcome::Failed {
                code: "not_found".into(),
                message: "Service not found.".into(),
            },
        }
    );
    assert_eq!(
        next_event(&mut rx).await,
        LinkEvent::CallResult {
            tag: toggle,
            outcome: CallOutcome::Success,
        }
    );

    link.shutdown();
}

#[tokio::test]
async fn rejected_token_stops_the_link() {
    let url = start_hub(|_, mut ws| async move {
        hub_send(&mut ws, json!({"type": "auth_required"})).await;
        let _auth = hub_recv(&mut ws).await;
        hub_send(&mut ws, json!({"type": "auth_invalid", "message": "Invalid access token"}))
            .await;
    })
    .await;

    let (link, mut rx) = HubLink::spawn(config(url), &CancellationToken::new());

    let mut seen = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
        seen.push(event);
    }

    assert!(seen.contains(&LinkEvent::AuthenticationFailed {
        message: "Invalid access token".into()
    }));
    assert_eq!(seen.last(), Some(&LinkEvent::State(ConnectionState::Disconnected)));
    assert!(
        !seen
            .iter()
            .any(|e| matches!(e, LinkEvent::State(ConnectionState::Reconnecting { .. }))),
        "auth failure must not trigger reconnects: {seen:?}"
    );
    assert_eq!(link.current_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn drop_loses_in_flight_calls_and_resyncs() {
    let url = start_hub(|index, mut ws| async move {
        if index == 0 {
            handshake(&mut ws, kitchen_on()).await;
            let _call = hub_recv(&mut ws).await;
            // Drop the connection without answering
            return;
        }
        handshake(
            &mut ws,
            json!({"switch.fan": {"s": "off", "a": {}, "lc": 1_700_000_100.0}}),
        )
        .await;
        futures_util::future::pending::<()>().await;
        drop(ws);
    })
    .await;

    let (link, mut rx) = HubLink::spawn(config(url), &CancellationToken::new());
    wait_live(&mut rx).await;

    let tag = Uuid::new_v4();
    link.send(
        ServiceCall::new(tag, "light", "toggle")
            .unwrap()
            .with_target("light.kitchen"),
    )
    .await
    .unwrap();

    assert_eq!(
        next_event(&mut rx).await,
        LinkEvent::CallResult {
            tag,
            outcome: CallOutcome::Lost,
        }
    );
    assert_eq!(
        next_event(&mut rx).await,
        LinkEvent::State(ConnectionState::Reconnecting { attempt: 1 })
    );

    let snapshot = loop {
        if let LinkEvent::Snapshot(snapshot) = next_event(&mut rx).await {
            break snapshot;
        }
    };
    assert!(snapshot.contains_key("switch.fan"));
    assert!(!snapshot.contains_key("light.kitchen"));
    assert_eq!(next_event(&mut rx).await, LinkEvent::State(ConnectionState::Live));

    link.shutdown();
}

#[tokio::test]
async fn silent_hub_times_out_and_respects_retry_cap() {
    let url = start_hub(|_, ws| async move {
        // Accept the socket but never start the handshake
        futures_util::future::pending::<()>().await;
        drop(ws);
    })
    .await;

    let mut config = config(url);
    config.handshake_timeout = Duration::from_millis(100);
    config.reconnect.max_retries = Some(0);

    let (link, mut rx) = HubLink::spawn(config, &CancellationToken::new());

    assert_eq!(next_event(&mut rx).await, LinkEvent::State(ConnectionState::Connecting));
    assert_eq!(
        next_event(&mut rx).await,
        LinkEvent::State(ConnectionState::Authenticating)
    );
    assert_eq!(
        next_event(&mut rx).await,
        LinkEvent::State(ConnectionState::Disconnected)
    );
    assert_eq!(link.current_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn parent_cancellation_stops_the_link() {
    let url = start_hub(|_, mut ws| async move {
        handshake(&mut ws, kitchen_on()).await;
        futures_util::future::pending::<()>().await;
        drop(ws);
    })
    .await;

    let parent = CancellationToken::new();
    let (link, mut rx) = HubLink::spawn(config(url), &parent);
    wait_live(&mut rx).await;

    parent.cancel();
    assert_eq!(
        next_event(&mut rx).await,
        LinkEvent::State(ConnectionState::Disconnected)
    );
    // Task gone: event channel closes and new calls are refused
    assert!(rx.recv().await.is_none());
    assert!(
        link.send(ServiceCall::new(Uuid::new_v4(), "light", "toggle").unwrap())
            .await
            .is_err()
    );
}
