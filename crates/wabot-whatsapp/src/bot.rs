//! WhatsApp bot wrapper

use std::net::SocketAddr;
use std::sync::Arc;

use wabot_core::{CompletionClient, Config};

use crate::client::CloudApiClient;
use crate::error::Result;
use crate::processor::MessageProcessor;
use crate::store::ConversationStore;
use crate::webhook::{WebhookServer, WebhookState};

/// WhatsApp bot wrapper: wires the outbound client, conversation store,
/// message processor, and webhook server together.
pub struct WhatsAppBot {
    state: Arc<WebhookState>,
    store: Arc<ConversationStore>,
    port: u16,
}

impl WhatsAppBot {
    /// Create a new bot from configuration. `completion` is the optional
    /// generative backend; without it every reply is deterministic.
    pub fn new(config: &Config, completion: Option<Arc<CompletionClient>>) -> Result<Self> {
        let client = Arc::new(CloudApiClient::new(&config.whatsapp)?);
        let store = Arc::new(ConversationStore::new());
        let processor = Arc::new(MessageProcessor::new(completion));

        let state = Arc::new(WebhookState::new(
            client,
            Arc::clone(&store),
            processor,
            config.whatsapp.verify_token.clone(),
            config.whatsapp.app_secret.clone(),
        ));

        Ok(Self {
            state,
            store,
            port: config.server.port,
        })
    }

    /// Conversation store handle, for the retention sweeper
    pub fn store(&self) -> Arc<ConversationStore> {
        Arc::clone(&self.store)
    }

    /// Webhook state handle, for pruning delivery tracking
    pub fn webhook_state(&self) -> Arc<WebhookState> {
        Arc::clone(&self.state)
    }

    /// Start the webhook server (runs until cancelled)
    pub async fn start(self) -> Result<()> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.port).into();
        let server = WebhookServer::new(addr, self.state);
        server.start().await
    }
}
