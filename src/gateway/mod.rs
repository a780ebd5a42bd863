//! Axum-based HTTP gateway for the Slack Events API.
//!
//! - Request body size limits (64KB max)
//! - Request timeouts (30s) to prevent slow-loris attacks
//! - Optional Slack request-signature verification
//! - Immediate acknowledgement; orchestration runs on a tracked task that
//!   graceful shutdown waits for

use crate::assistant::{AssistantApi, AssistantClient};
use crate::channels::{
    verify_slack_signature, InboundEvent, SlackChannel, SlackEnvelope, ThreadChannel,
};
use crate::config::Config;
use crate::relay::{Relay, RelayOutcome, RelaySettings};
use crate::store::{SqliteTopicStore, TopicStore};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{any, get},
    Router,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::task::{AbortHandle, JoinError, JoinSet};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size (64KB)
pub const MAX_BODY_SIZE: usize = 65_536;
/// Request timeout (30s)
pub const REQUEST_TIMEOUT_SECS: u64 = 30;
/// Fallback max distinct idempotency keys retained in gateway memory.
pub const IDEMPOTENCY_MAX_KEYS_DEFAULT: usize = 10_000;
/// Upper bound on waiting for in-flight events after a shutdown signal.
pub const SHUTDOWN_DRAIN_TIMEOUT_SECS: u64 = 90;

const GREETING: &str = "threadrelay is running. Point Slack event subscriptions at /slack/events.";

pub fn is_public_bind(host: &str) -> bool {
    !matches!(
        host,
        "127.0.0.1" | "localhost" | "::1" | "[::1]" | "0:0:0:0:0:0:0:1"
    )
}

/// Remembers recently seen Slack `event_id`s so redeliveries run once.
#[derive(Debug)]
pub struct IdempotencyStore {
    ttl: Duration,
    max_keys: usize,
    keys: Mutex<HashMap<String, Instant>>,
}

impl IdempotencyStore {
    pub fn new(ttl: Duration, max_keys: usize) -> Self {
        Self {
            ttl,
            max_keys: max_keys.max(1),
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true if this key is new and is now recorded.
    pub fn record_if_new(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut keys = self.keys.lock();

        keys.retain(|_, seen_at| now.duration_since(*seen_at) < self.ttl);

        if keys.contains_key(key) {
            return false;
        }

        if keys.len() >= self.max_keys {
            let evict_key = keys
                .iter()
                .min_by_key(|(_, seen_at)| *seen_at)
                .map(|(k, _)| k.clone());
            if let Some(evict_key) = evict_key {
                keys.remove(&evict_key);
            }
        }

        keys.insert(key.to_owned(), now);
        true
    }
}

fn normalize_max_keys(configured: usize, fallback: usize) -> usize {
    if configured == 0 {
        fallback.max(1)
    } else {
        configured
    }
}

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub channel: Arc<dyn ThreadChannel>,
    /// The bot's own Slack user id, used to recognise echoes and self-mentions.
    pub bot_user_id: Option<Arc<str>>,
    /// Slack signing secret; requests are accepted unsigned when `None`.
    pub signing_secret: Option<Arc<str>>,
    pub idempotency_store: Arc<IdempotencyStore>,
    /// Relay runs still in flight; drained on graceful shutdown.
    pub inflight: Arc<Mutex<JoinSet<RelayOutcome>>>,
}

/// Run the HTTP gateway.
pub async fn run_gateway(host: &str, port: u16, config: Config) -> Result<()> {
    // ── Security: refuse public bind without explicit opt-in ──
    if is_public_bind(host) && !config.gateway.allow_public_bind {
        anyhow::bail!(
            "Refusing to bind to {host}: the gateway would be exposed to the internet.\n\
             Fix: use --host 127.0.0.1 (default), put a reverse proxy in front, or set\n\
             [gateway] allow_public_bind = true in config.toml."
        );
    }
    config.validate()?;

    let store = SqliteTopicStore::open(&config.store_path())?;
    match store.purge_expired().await {
        Ok(0) => {}
        Ok(purged) => tracing::info!("Purged {purged} expired thread topics"),
        Err(e) => tracing::warn!("Failed to purge expired thread topics: {e:#}"),
    }
    let store: Arc<dyn TopicStore> = Arc::new(store);

    let assistant: Arc<dyn AssistantApi> = Arc::new(AssistantClient::from_config(&config.assistant)?);

    let mut slack = SlackChannel::from_config(&config.slack);
    if slack.bot_user_id().is_none() {
        match slack.resolve_bot_user_id().await {
            Ok(user_id) => {
                tracing::info!("Slack bot user id resolved: {user_id}");
                slack = slack.with_bot_user_id(user_id);
            }
            Err(e) => tracing::warn!(
                "Could not resolve Slack bot user id (self-echo filtering falls back to bot_id/subtype): {e:#}"
            ),
        }
    }
    let bot_user_id: Option<Arc<str>> = slack.bot_user_id().map(Arc::from);

    let signing_secret: Option<Arc<str>> = config
        .slack
        .signing_secret
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Arc::from);
    if signing_secret.is_none() {
        tracing::warn!("slack.signing_secret is not set; inbound requests are not verified");
    }

    let idempotency_store = Arc::new(IdempotencyStore::new(
        Duration::from_secs(config.gateway.idempotency_ttl_secs.max(1)),
        normalize_max_keys(
            config.gateway.idempotency_max_keys,
            IDEMPOTENCY_MAX_KEYS_DEFAULT,
        ),
    ));

    let state = AppState {
        relay: Arc::new(Relay::new(
            assistant,
            store,
            RelaySettings::from_config(&config),
        )),
        channel: Arc::new(slack),
        bot_user_id,
        signing_secret,
        idempotency_store,
        inflight: Arc::new(Mutex::new(JoinSet::new())),
    };

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("Invalid gateway address {host}:{port}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind gateway to {addr}"))?;
    let actual_port = listener.local_addr()?.port();

    tracing::info!("threadrelay gateway listening on http://{host}:{actual_port}");
    println!("threadrelay gateway listening on http://{host}:{actual_port}");
    println!("  ANY  /slack/events  Slack Events API");
    println!("  GET  /health        health check");
    println!("  Press Ctrl+C to stop.\n");

    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let finished = drain_inflight(&state, Duration::from_secs(SHUTDOWN_DRAIN_TIMEOUT_SECS)).await;
    if !finished.is_empty() {
        tracing::info!("Finished {} in-flight Slack events before exit", finished.len());
    }

    Ok(())
}

/// Routes and middleware, separated from `run_gateway` for handler tests.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/slack/events", any(handle_slack_events))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, stopping gateway");
}

// ══════════════════════════════════════════════════════════════════════════════
// AXUM HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

/// GET / liveness greeting
async fn handle_root() -> &'static str {
    GREETING
}

/// GET /health
async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

fn log_relay_join_result(result: Result<RelayOutcome, JoinError>) -> Option<RelayOutcome> {
    match result {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            tracing::error!("Relay task failed: {e}");
            None
        }
    }
}

/// Hand an event to the relay on its own task, tracked in `state.inflight`.
pub fn dispatch_event(state: &AppState, event: InboundEvent) -> AbortHandle {
    let relay = Arc::clone(&state.relay);
    let channel = Arc::clone(&state.channel);
    let mut inflight = state.inflight.lock();
    while let Some(result) = inflight.try_join_next() {
        log_relay_join_result(result);
    }
    inflight.spawn(async move { relay.handle_event(channel.as_ref(), event).await })
}

/// Wait for in-flight relay runs so no message is left mid-processing.
/// Runs still going after `timeout` are aborted.
pub async fn drain_inflight(state: &AppState, timeout: Duration) -> Vec<RelayOutcome> {
    let mut inflight = std::mem::take(&mut *state.inflight.lock());
    let mut outcomes = Vec::new();
    let drained = tokio::time::timeout(timeout, async {
        while let Some(result) = inflight.join_next().await {
            outcomes.extend(log_relay_join_result(result));
        }
    })
    .await;

    if drained.is_err() {
        tracing::warn!(
            "Aborting {} relay tasks still running after {}s",
            inflight.len(),
            timeout.as_secs()
        );
        inflight.shutdown().await;
    }
    outcomes
}

/// ANY /slack/events Events API intake
async fn handle_slack_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // ── Security: Verify X-Slack-Signature if signing secret is configured ──
    if let Some(ref secret) = state.signing_secret {
        let timestamp = headers
            .get("X-Slack-Request-Timestamp")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let signature = headers
            .get("X-Slack-Signature")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        if let Err(e) = verify_slack_signature(secret, timestamp, &body, signature, unix_now_secs())
        {
            tracing::warn!("Slack request rejected: {e}");
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "Invalid signature"})),
            )
                .into_response();
        }
    }

    let envelope = match serde_json::from_slice::<SlackEnvelope>(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!("Slack request body is not a valid envelope: {e}");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "Invalid JSON payload"})),
            )
                .into_response();
        }
    };

    match envelope {
        SlackEnvelope::UrlVerification { challenge } => {
            tracing::info!("Slack URL verification handshake");
            (StatusCode::OK, challenge).into_response()
        }
        SlackEnvelope::EventCallback { event_id, event } => {
            if let Some(ref id) = event_id {
                if !state.idempotency_store.record_if_new(id) {
                    tracing::info!("Slack event {id} already handled, skipping redelivery");
                    return (
                        StatusCode::OK,
                        Json(serde_json::json!({"status": "duplicate"})),
                    )
                        .into_response();
                }
            }

            let kind = event.kind.clone();
            match event.into_inbound(state.bot_user_id.as_deref()) {
                Some(inbound) => {
                    dispatch_event(&state, inbound);
                }
                None => tracing::debug!("Ignoring Slack event of type {kind}"),
            }
            (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))).into_response()
        }
        SlackEnvelope::Other => {
            (StatusCode::OK, Json(serde_json::json!({"status": "ignored"}))).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::AssistantError;
    use crate::channels::HistoryMessage;
    use crate::store::ThreadKey;
    use async_trait::async_trait;
    use axum::http::HeaderValue;
    use hmac::{Hmac, Mac};
    use http_body_util::BodyExt;
    use sha2::Sha256;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingAssistant {
        creates: AtomicUsize,
        sends: AtomicUsize,
    }

    #[async_trait]
    impl AssistantApi for CountingAssistant {
        async fn create_topic(&self) -> Result<String, AssistantError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            Ok("topic-1".into())
        }

        async fn send_message(&self, _topic_id: &str, message: &str) -> Result<String, AssistantError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            Ok(format!("echo: {message}"))
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        map: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl TopicStore for MemoryStore {
        async fn get(&self, key: &ThreadKey) -> anyhow::Result<Option<String>> {
            Ok(self.map.lock().get(&key.storage_key()).cloned())
        }

        async fn put(&self, key: &ThreadKey, topic_id: &str, _ttl: Duration) -> anyhow::Result<()> {
            self.map.lock().insert(key.storage_key(), topic_id.into());
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockChannel {
        replies: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ThreadChannel for MockChannel {
        fn name(&self) -> &str {
            "mock"
        }

        async fn add_reaction(&self, _c: &str, _ts: &str, _name: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn remove_reaction(&self, _c: &str, _ts: &str, _name: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn reply(&self, _c: &str, _thread_ts: &str, text: &str) -> anyhow::Result<()> {
            self.replies.lock().push(text.into());
            Ok(())
        }

        async fn list_replies(
            &self,
            _c: &str,
            _thread_ts: &str,
            _limit: usize,
        ) -> anyhow::Result<Vec<HistoryMessage>> {
            Ok(Vec::new())
        }
    }

    struct Harness {
        state: AppState,
        assistant: Arc<CountingAssistant>,
        channel: Arc<MockChannel>,
    }

    fn harness(signing_secret: Option<&str>) -> Harness {
        let assistant = Arc::new(CountingAssistant::default());
        let channel = Arc::new(MockChannel::default());
        let state = AppState {
            relay: Arc::new(Relay::new(
                assistant.clone(),
                Arc::new(MemoryStore::default()),
                RelaySettings::default(),
            )),
            channel: channel.clone(),
            bot_user_id: Some(Arc::from("UBOT")),
            signing_secret: signing_secret.map(Arc::from),
            idempotency_store: Arc::new(IdempotencyStore::new(Duration::from_secs(300), 1000)),
            inflight: Arc::new(Mutex::new(JoinSet::new())),
        };
        Harness {
            state,
            assistant,
            channel,
        }
    }

    fn mention_body(event_id: &str) -> Bytes {
        Bytes::from(
            serde_json::json!({
                "type": "event_callback",
                "event_id": event_id,
                "event": {
                    "type": "app_mention",
                    "text": "<@UBOT> hello",
                    "channel": "C1",
                    "ts": "10.0",
                    "user": "U1"
                }
            })
            .to_string(),
        )
    }

    async fn wait_for_replies(channel: &MockChannel, count: usize) {
        for _ in 0..200 {
            if channel.replies.lock().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {count} replies");
    }

    fn signed_headers(secret: &str, body: &[u8]) -> HeaderMap {
        let timestamp = unix_now_secs().to_string();
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("v0:{timestamp}:").as_bytes());
        mac.update(body);
        let signature = format!("v0={}", hex::encode(mac.finalize().into_bytes()));

        let mut headers = HeaderMap::new();
        headers.insert(
            "X-Slack-Request-Timestamp",
            HeaderValue::from_str(&timestamp).unwrap(),
        );
        headers.insert("X-Slack-Signature", HeaderValue::from_str(&signature).unwrap());
        headers
    }

    #[test]
    fn idempotency_store_rejects_duplicate_key() {
        let store = IdempotencyStore::new(Duration::from_secs(30), 10);
        assert!(store.record_if_new("Ev1"));
        assert!(!store.record_if_new("Ev1"));
        assert!(store.record_if_new("Ev2"));
    }

    #[test]
    fn idempotency_store_bounded_cardinality_evicts_oldest_key() {
        let store = IdempotencyStore::new(Duration::from_secs(300), 2);
        assert!(store.record_if_new("k1"));
        std::thread::sleep(Duration::from_millis(2));
        assert!(store.record_if_new("k2"));
        std::thread::sleep(Duration::from_millis(2));
        assert!(store.record_if_new("k3"));

        let keys = store.keys.lock();
        assert_eq!(keys.len(), 2);
        assert!(!keys.contains_key("k1"));
        assert!(keys.contains_key("k2"));
        assert!(keys.contains_key("k3"));
    }

    #[test]
    fn public_bind_detection() {
        assert!(!is_public_bind("127.0.0.1"));
        assert!(!is_public_bind("localhost"));
        assert!(is_public_bind("0.0.0.0"));
    }

    #[test]
    fn normalize_max_keys_uses_fallback_for_zero() {
        assert_eq!(normalize_max_keys(0, 10_000), 10_000);
        assert_eq!(normalize_max_keys(5, 10_000), 5);
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let response = handle_health().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn url_verification_echoes_challenge() {
        let h = harness(None);
        let body = Bytes::from_static(br#"{"type":"url_verification","challenge":"ch-42","token":"t"}"#);

        let response = handle_slack_events(State(h.state), HeaderMap::new(), body).await;
        assert_eq!(response.status(), StatusCode::OK);
        let payload = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&payload[..], b"ch-42");
    }

    #[tokio::test]
    async fn mention_is_acknowledged_and_relayed() {
        let h = harness(None);

        let response =
            handle_slack_events(State(h.state.clone()), HeaderMap::new(), mention_body("Ev1")).await;
        assert_eq!(response.status(), StatusCode::OK);

        wait_for_replies(&h.channel, 1).await;
        assert_eq!(h.channel.replies.lock()[0], "echo: hello");
        assert_eq!(h.assistant.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn redelivered_event_runs_once() {
        let h = harness(None);

        let first =
            handle_slack_events(State(h.state.clone()), HeaderMap::new(), mention_body("Ev1")).await;
        let second =
            handle_slack_events(State(h.state.clone()), HeaderMap::new(), mention_body("Ev1")).await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::OK);

        let payload = second.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(json["status"], "duplicate");

        wait_for_replies(&h.channel, 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.assistant.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_signature_is_rejected() {
        let h = harness(Some("shh"));
        let mut headers = HeaderMap::new();
        headers.insert("X-Slack-Request-Timestamp", HeaderValue::from_static("1"));
        headers.insert("X-Slack-Signature", HeaderValue::from_static("v0=deadbeef"));

        let response = handle_slack_events(State(h.state), headers, mention_body("Ev1")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(h.assistant.sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn valid_signature_is_accepted() {
        let h = harness(Some("shh"));
        let body = mention_body("Ev9");
        let headers = signed_headers("shh", &body);

        let response = handle_slack_events(State(h.state.clone()), headers, body).await;
        assert_eq!(response.status(), StatusCode::OK);
        wait_for_replies(&h.channel, 1).await;
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let h = harness(None);
        let response =
            handle_slack_events(State(h.state), HeaderMap::new(), Bytes::from_static(b"not json")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unrelated_event_types_are_acknowledged() {
        let h = harness(None);
        let body = Bytes::from_static(
            br#"{"type":"event_callback","event_id":"Ev3","event":{"type":"reaction_added","user":"U1"}}"#,
        );
        let response = handle_slack_events(State(h.state), HeaderMap::new(), body).await;
        assert_eq!(response.status(), StatusCode::OK);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.assistant.sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dispatch_event_returns_outcome() {
        let h = harness(None);
        let event = crate::channels::SlackEvent {
            kind: "app_mention".into(),
            text: Some("<@UBOT> hi".into()),
            channel: Some("C1".into()),
            ts: Some("10.0".into()),
            thread_ts: None,
            subtype: None,
            bot_id: None,
            user: Some("U1".into()),
        }
        .into_inbound(Some("UBOT"))
        .unwrap();

        dispatch_event(&h.state, event);
        let outcomes = drain_inflight(&h.state, Duration::from_secs(5)).await;
        assert_eq!(outcomes, vec![RelayOutcome::Replied]);
    }

    #[tokio::test]
    async fn shutdown_drain_waits_for_acknowledged_events() {
        let h = harness(None);

        for event_id in ["Ev1", "Ev2"] {
            let body = Bytes::from(
                serde_json::json!({
                    "type": "event_callback",
                    "event_id": event_id,
                    "event": {
                        "type": "app_mention",
                        "text": "<@UBOT> hello",
                        "channel": "C1",
                        "ts": format!("{event_id}.0"),
                        "user": "U1"
                    }
                })
                .to_string(),
            );
            let response = handle_slack_events(State(h.state.clone()), HeaderMap::new(), body).await;
            assert_eq!(response.status(), StatusCode::OK);
        }

        let outcomes = drain_inflight(&h.state, Duration::from_secs(5)).await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| *o == RelayOutcome::Replied));
        assert_eq!(h.channel.replies.lock().len(), 2);
        assert!(h.state.inflight.lock().is_empty());
    }
}
