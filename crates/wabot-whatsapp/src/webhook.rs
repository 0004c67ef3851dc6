//! Webhook server: the protocol boundary with Meta
//!
//! Owns the GET verification handshake, inbound event handling, per-user
//! turn serialization, delivery-status tracking, and the
//! retry-then-apologize outbound dispatch. Event processing always acks
//! with 200: the provider treats non-2xx as "redeliver", which would
//! amplify any failure into duplicate processing.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::client::{OutboundSender, MAX_TEXT_LENGTH};
use crate::error::{Result, WhatsAppError};
use crate::processor::{MessageProcessor, APOLOGY_TEMPLATE};
use crate::retry::RetryPolicy;
use crate::store::ConversationStore;
use crate::types::{StatusEvent, WebhookPayload, MESSAGES_FIELD, WEBHOOK_OBJECT};

/// Delivery state of an outbound message we are still tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryState {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, Self::Read | Self::Failed)
    }
}

/// An outbound message awaiting status callbacks
#[derive(Debug, Clone)]
struct PendingDelivery {
    user_id: String,
    status: DeliveryState,
    updated_at: DateTime<Utc>,
}

/// Query parameters of the GET verification handshake
#[derive(Debug, Deserialize)]
pub struct VerifyParams {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// Pure handshake check: echo the challenge only for a subscribe request
/// carrying the configured token.
pub fn verify_handshake<'a>(
    mode: &str,
    token: &str,
    expected_token: &str,
    challenge: &'a str,
) -> Option<&'a str> {
    if mode == "subscribe" && !expected_token.is_empty() && token == expected_token {
        Some(challenge)
    } else {
        None
    }
}

/// Verify the `X-Hub-Signature-256` header against the raw body
fn verify_signature(app_secret: &str, body: &[u8], signature_header: &str) -> bool {
    let Some(hex_sig) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Shared webhook state
pub struct WebhookState {
    sender: Arc<dyn OutboundSender>,
    store: Arc<ConversationStore>,
    processor: Arc<MessageProcessor>,
    verify_token: String,
    app_secret: Option<String>,
    retry: RetryPolicy,
    /// Per-user turn serialization; a whole turn (read, compute, send,
    /// append) runs under this lock so turns never interleave per user
    turn_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Sent messages awaiting status callbacks, keyed by provider id
    in_flight: DashMap<String, PendingDelivery>,
}

impl WebhookState {
    pub fn new(
        sender: Arc<dyn OutboundSender>,
        store: Arc<ConversationStore>,
        processor: Arc<MessageProcessor>,
        verify_token: String,
        app_secret: Option<String>,
    ) -> Self {
        Self {
            sender,
            store,
            processor,
            verify_token,
            app_secret,
            retry: RetryPolicy::default(),
            turn_locks: DashMap::new(),
            in_flight: DashMap::new(),
        }
    }

    fn turn_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.turn_locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Process one parsed webhook notification
    pub async fn handle_event(&self, payload: WebhookPayload) {
        if payload.object != WEBHOOK_OBJECT {
            warn!(object = %payload.object, "ignoring webhook for unexpected object");
            return;
        }

        for entry in payload.entry {
            for change in entry.changes {
                if change.field != MESSAGES_FIELD {
                    debug!(field = %change.field, "ignoring non-message change");
                    continue;
                }

                for status in &change.value.statuses {
                    self.handle_status(status);
                }

                for message in &change.value.messages {
                    if message.kind != "text" {
                        // Acknowledged at the transport level only; replying
                        // to unhandled types triggers provider retry storms
                        info!(
                            from = %message.from,
                            kind = %message.kind,
                            "ignoring non-text message"
                        );
                        continue;
                    }

                    let Some(text) = &message.text else {
                        warn!(from = %message.from, "text message without body");
                        continue;
                    };
                    if text.body.chars().count() > MAX_TEXT_LENGTH {
                        warn!(
                            from = %message.from,
                            chars = text.body.chars().count(),
                            "dropping oversized inbound message"
                        );
                        continue;
                    }

                    self.handle_text(&message.from, &message.id, &text.body)
                        .await;
                }
            }
        }
    }

    /// One full conversational turn for a text message
    async fn handle_text(&self, from: &str, message_id: &str, body: &str) {
        let lock = self.turn_lock(from);
        let _guard = lock.lock().await;

        let conversation = self.store.get_or_create(from);

        // Read receipt off the turn's critical path, fire-and-forget
        let sender = Arc::clone(&self.sender);
        let receipt_id = message_id.to_string();
        tokio::spawn(async move {
            sender.mark_read(&receipt_id).await;
        });

        let reply = self.processor.process(body, &conversation).await;

        // Send before append: a failed delivery must not pollute history
        // with an assistant turn the user never received
        let sent = self
            .retry
            .run(|_| self.sender.send_text(from, &reply))
            .await;

        match sent {
            Ok(provider_id) => {
                if let Err(e) = self.store.append_turn(from, body, &reply) {
                    // NotFound here means the sweep raced us; log loudly
                    error!(user_id = %from, error = %e, "failed to record turn");
                }
                self.in_flight.insert(
                    provider_id,
                    PendingDelivery {
                        user_id: from.to_string(),
                        status: DeliveryState::Sent,
                        updated_at: Utc::now(),
                    },
                );
            }
            Err(e) => {
                error!(
                    user_id = %from,
                    payload_type = "text",
                    class = e.class(),
                    error = %e,
                    "delivery failed after retries"
                );
                // One best-effort apology, single attempt, then silence
                if let Err(apology_err) = self.sender.send_text(from, APOLOGY_TEMPLATE).await {
                    warn!(
                        user_id = %from,
                        error = %apology_err,
                        "apology delivery failed, giving up"
                    );
                }
            }
        }
    }

    /// Correlate a delivery-status callback with an in-flight message.
    /// Unknown or out-of-order ids are ignored, never errors.
    fn handle_status(&self, status: &StatusEvent) {
        let Some(new_state) = DeliveryState::parse(&status.status) else {
            debug!(status = %status.status, "unrecognized delivery status");
            return;
        };

        let user_id = match self.in_flight.get_mut(&status.id) {
            Some(mut entry) => {
                entry.status = new_state;
                entry.updated_at = Utc::now();
                entry.user_id.clone()
            }
            None => {
                debug!(message_id = %status.id, "status for untracked message, ignoring");
                return;
            }
        };

        if new_state == DeliveryState::Failed {
            warn!(
                message_id = %status.id,
                user_id = %user_id,
                recipient = %status.recipient_id,
                "provider reported delivery failure"
            );
        }
        if new_state.is_terminal() {
            self.in_flight.remove(&status.id);
        }
    }

    /// Drop stale delivery tracking and idle turn locks. Called from the
    /// retention sweeper.
    pub fn prune(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let before = self.in_flight.len();
        self.in_flight.retain(|_, pending| pending.updated_at >= cutoff);
        self.turn_locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - self.in_flight.len()
    }

    #[cfg(test)]
    fn tracked_delivery(&self, provider_id: &str) -> Option<DeliveryState> {
        self.in_flight.get(provider_id).map(|e| e.status)
    }
}

/// Webhook HTTP server
pub struct WebhookServer {
    addr: SocketAddr,
    state: Arc<WebhookState>,
}

impl WebhookServer {
    pub fn new(addr: SocketAddr, state: Arc<WebhookState>) -> Self {
        Self { addr, state }
    }

    /// Bind and serve until the task is cancelled
    pub async fn start(self) -> Result<()> {
        info!("starting WhatsApp webhook server on {}", self.addr);

        let app = routes(self.state);

        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| WhatsAppError::Config(e.to_string()))?;

        axum::serve(listener, app)
            .await
            .map_err(|e| WhatsAppError::Transient(e.to_string()))?;

        Ok(())
    }
}

/// Router for the webhook endpoints
pub fn routes(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(
            "/webhook/whatsapp",
            get(verify_webhook).post(receive_webhook),
        )
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// GET handshake endpoint
async fn verify_webhook(
    State(state): State<Arc<WebhookState>>,
    Query(params): Query<VerifyParams>,
) -> impl IntoResponse {
    let mode = params.mode.unwrap_or_default();
    let token = params.verify_token.unwrap_or_default();
    let challenge = params.challenge.unwrap_or_default();

    match verify_handshake(&mode, &token, &state.verify_token, &challenge) {
        Some(challenge) => {
            info!("webhook verification succeeded");
            (StatusCode::OK, challenge.to_string())
        }
        None => {
            warn!(mode = %mode, "webhook verification rejected");
            (StatusCode::FORBIDDEN, String::new())
        }
    }
}

/// POST event endpoint
async fn receive_webhook(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if let Some(secret) = &state.app_secret {
        let signature = headers
            .get("x-hub-signature-256")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !verify_signature(secret, &body, signature) {
            warn!("webhook signature mismatch");
            return StatusCode::FORBIDDEN;
        }
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            // Ack anyway: a malformed batch must not trigger redelivery
            warn!(error = %e, "unparseable webhook payload");
            return StatusCode::OK;
        }
    };

    state.handle_event(payload).await;
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Button;
    use crate::processor::{PRICING_TEMPLATE, SERVICES_TEMPLATE};
    use crate::store::Stage;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted outbound sender: fails the first `fail_first` text sends
    struct FakeSender {
        fail_first: u32,
        calls: AtomicU32,
        bodies: std::sync::Mutex<Vec<String>>,
        read_receipts: AtomicU32,
    }

    impl FakeSender {
        fn new(fail_first: u32) -> Self {
            Self {
                fail_first,
                calls: AtomicU32::new(0),
                bodies: std::sync::Mutex::new(Vec::new()),
                read_receipts: AtomicU32::new(0),
            }
        }

        fn attempts(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn bodies(&self) -> Vec<String> {
            self.bodies.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl OutboundSender for FakeSender {
        async fn send_text(&self, _to: &str, body: &str) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.bodies.lock().unwrap().push(body.to_string());
            if n <= self.fail_first {
                Err(WhatsAppError::Transient("simulated 503".into()))
            } else {
                Ok(format!("wamid.fake{n}"))
            }
        }

        async fn send_template(&self, _: &str, _: &str, _: &str) -> Result<String> {
            Ok("wamid.template".into())
        }

        async fn send_interactive(&self, _: &str, _: &str, _: &[Button]) -> Result<String> {
            Ok("wamid.interactive".into())
        }

        async fn mark_read(&self, _: &str) {
            self.read_receipts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn state_with(fake: Arc<FakeSender>) -> Arc<WebhookState> {
        Arc::new(WebhookState::new(
            fake,
            Arc::new(ConversationStore::new()),
            Arc::new(MessageProcessor::new(None)),
            "verify_me".to_string(),
            None,
        ))
    }

    fn text_payload(from: &str, id: &str, body: &str) -> WebhookPayload {
        serde_json::from_value(serde_json::json!({
            "object": "whatsapp_business_account",
            "entry": [{"changes": [{"field": "messages", "value": {"messages": [{
                "from": from, "id": id, "timestamp": "1700000000",
                "type": "text", "text": {"body": body}
            }]}}]}]
        }))
        .unwrap()
    }

    fn status_payload(id: &str, status: &str) -> WebhookPayload {
        serde_json::from_value(serde_json::json!({
            "object": "whatsapp_business_account",
            "entry": [{"changes": [{"field": "messages", "value": {"statuses": [{
                "id": id, "status": status, "timestamp": "1700000001",
                "recipient_id": "5215550001111"
            }]}}]}]
        }))
        .unwrap()
    }

    #[test]
    fn test_verify_handshake_matrix() {
        assert_eq!(
            verify_handshake("subscribe", "tok", "tok", "abc123"),
            Some("abc123")
        );
        assert_eq!(verify_handshake("subscribe", "wrong", "tok", "abc123"), None);
        assert_eq!(verify_handshake("unsubscribe", "tok", "tok", "abc123"), None);
        assert_eq!(verify_handshake("subscribe", "", "", "abc123"), None);
    }

    #[test]
    fn test_verify_signature_roundtrip() {
        let secret = "app_secret";
        let body = br#"{"object":"whatsapp_business_account"}"#;

        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let header = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

        assert!(verify_signature(secret, body, &header));
        assert!(!verify_signature(secret, b"tampered", &header));
        assert!(!verify_signature(secret, body, "sha256=deadbeef"));
        assert!(!verify_signature(secret, body, "no-prefix"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_records_both_messages_and_tracks_delivery() {
        let fake = Arc::new(FakeSender::new(0));
        let state = state_with(fake.clone());

        state
            .handle_event(text_payload("5215550001111", "wamid.in1", "necesito un chatbot"))
            .await;

        assert_eq!(fake.attempts(), 1);
        let history = state.store.history("5215550001111", 10);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "necesito un chatbot");
        assert_eq!(
            state.tracked_delivery("wamid.fake1"),
            Some(DeliveryState::Sent)
        );

        // The read receipt runs on a spawned task, let it get scheduled
        tokio::task::yield_now().await;
        assert_eq!(fake.read_receipts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_failures_then_success_appends_once() {
        let fake = Arc::new(FakeSender::new(2));
        let state = state_with(fake.clone());

        state
            .handle_event(text_payload("5215550001111", "wamid.in1", "hola"))
            .await;

        assert_eq!(fake.attempts(), 3);
        assert_eq!(state.store.history("5215550001111", 10).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_apologize_and_append_nothing() {
        let fake = Arc::new(FakeSender::new(u32::MAX));
        let state = state_with(fake.clone());

        state
            .handle_event(text_payload("5215550001111", "wamid.in1", "hola"))
            .await;

        // 3 retry-budget attempts plus exactly one apology attempt
        assert_eq!(fake.attempts(), 4);
        assert_eq!(fake.bodies().last().unwrap(), APOLOGY_TEMPLATE);
        assert!(state.store.history("5215550001111", 10).is_empty());
        // Conversation exists but holds no half-recorded turn
        assert_eq!(state.store.get_or_create("5215550001111").total_messages, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_service_then_pricing() {
        let fake = Arc::new(FakeSender::new(0));
        let state = state_with(fake.clone());
        let user = "5215550001111";

        state
            .handle_event(text_payload(user, "wamid.in1", "Hola, quiero saber de automatización"))
            .await;
        assert_eq!(state.store.get_or_create(user).stage, Stage::ServiceInquiry);
        assert_eq!(fake.bodies()[0], SERVICES_TEMPLATE);

        state
            .handle_event(text_payload(user, "wamid.in2", "cuánto cuesta"))
            .await;
        // Pricing words are not in the stage classifier: stage unchanged
        assert_eq!(state.store.get_or_create(user).stage, Stage::ServiceInquiry);
        assert_eq!(fake.bodies()[1], PRICING_TEMPLATE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_text_messages_are_ignored() {
        let fake = Arc::new(FakeSender::new(0));
        let state = state_with(fake.clone());

        let payload: WebhookPayload = serde_json::from_value(serde_json::json!({
            "object": "whatsapp_business_account",
            "entry": [{"changes": [{"field": "messages", "value": {"messages": [{
                "from": "5215550001111", "id": "wamid.img", "timestamp": "1700000000",
                "type": "image"
            }]}}]}]
        }))
        .unwrap();
        state.handle_event(payload).await;

        assert_eq!(fake.attempts(), 0);
        assert!(state.store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_object_is_discarded() {
        let fake = Arc::new(FakeSender::new(0));
        let state = state_with(fake.clone());

        let mut payload = text_payload("5215550001111", "wamid.in1", "hola");
        payload.object = "instagram".to_string();
        state.handle_event(payload).await;

        assert_eq!(fake.attempts(), 0);
        assert!(state.store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_lifecycle_and_unknown_ids() {
        let fake = Arc::new(FakeSender::new(0));
        let state = state_with(fake.clone());

        state
            .handle_event(text_payload("5215550001111", "wamid.in1", "hola"))
            .await;
        assert_eq!(
            state.tracked_delivery("wamid.fake1"),
            Some(DeliveryState::Sent)
        );

        state.handle_event(status_payload("wamid.fake1", "delivered")).await;
        assert_eq!(
            state.tracked_delivery("wamid.fake1"),
            Some(DeliveryState::Delivered)
        );

        // Terminal status drops the tracking entry
        state.handle_event(status_payload("wamid.fake1", "read")).await;
        assert_eq!(state.tracked_delivery("wamid.fake1"), None);

        // Unknown and out-of-order ids are ignored without error
        state.handle_event(status_payload("wamid.never-sent", "read")).await;
        state.handle_event(status_payload("wamid.fake1", "delivered")).await;
        assert_eq!(state.tracked_delivery("wamid.fake1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_inbound_text_is_dropped() {
        let fake = Arc::new(FakeSender::new(0));
        let state = state_with(fake.clone());

        let body = "x".repeat(MAX_TEXT_LENGTH + 1);
        state
            .handle_event(text_payload("5215550001111", "wamid.in1", &body))
            .await;

        assert_eq!(fake.attempts(), 0);
        assert!(state.store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_clears_stale_in_flight() {
        let fake = Arc::new(FakeSender::new(0));
        let state = state_with(fake.clone());

        state
            .handle_event(text_payload("5215550001111", "wamid.in1", "hola"))
            .await;
        assert_eq!(state.prune(Duration::seconds(-1)), 1);
        assert_eq!(state.tracked_delivery("wamid.fake1"), None);
    }
}
