//! Reply generation
//!
//! Ordered, short-circuiting decision: quick keyword patterns first, then
//! the optional completion backend, then a stage-based canned fallback.
//! The result is always a non-empty string; backend failures never escape
//! this module.

use std::sync::Arc;

use tracing::{debug, warn};
use wabot_core::llm::types::Message;
use wabot_core::CompletionClient;

use crate::client::MAX_TEXT_LENGTH;
use crate::store::{Conversation, Role, Stage, SERVICE_KEYWORDS};

/// Greeting fast-path keywords
const GREETING_KEYWORDS: &[&str] = &[
    "hola",
    "buenas",
    "buenos días",
    "buenos dias",
    "hello",
    "hey",
    "saludos",
];

/// Contact fast-path keywords
const CONTACT_KEYWORDS: &[&str] = &[
    "contacto",
    "contactar",
    "asesor",
    "llamar",
    "correo",
    "teléfono",
    "telefono",
    "email",
];

/// Pricing fast-path keywords
const PRICING_KEYWORDS: &[&str] = &[
    "precio",
    "costo",
    "cuánto cuesta",
    "cuanto cuesta",
    "cotización",
    "cotizacion",
    "tarifa",
    "price",
];

/// Messages longer than this never count as a bare greeting, so a greeting
/// embedded in an actual question routes on the question instead.
const GREETING_MAX_CHARS: usize = 20;

pub const GREETING_TEMPLATE: &str = "¡Hola! 👋 Soy el asistente virtual. Puedo contarte sobre \
    nuestros servicios de automatización, chatbots y marketing digital. ¿En qué puedo ayudarte?";

pub const SERVICES_TEMPLATE: &str = "Ofrecemos automatización de procesos, chatbots para \
    WhatsApp, marketing digital y desarrollo web. ¿Te interesa alguno en particular?";

pub const CONTACT_TEMPLATE: &str = "Con gusto te ponemos en contacto con un asesor. \
    Escríbenos a hola@wabot.example o déjanos tu correo y te llamamos.";

pub const PRICING_TEMPLATE: &str = "Cada proyecto se cotiza a la medida. Cuéntanos qué \
    necesitas y te enviamos una propuesta sin compromiso.";

const STAGE_GREETING_TEMPLATE: &str =
    "¡Hola! ¿En qué puedo ayudarte hoy? Pregúntame por nuestros servicios cuando quieras.";

const STAGE_SERVICE_TEMPLATE: &str = "Seguimos con tu consulta de servicios. ¿Quieres más \
    detalle de automatización, chatbots, marketing digital o desarrollo web?";

const STAGE_SUPPORT_TEMPLATE: &str =
    "Lamento el inconveniente. Cuéntame qué está pasando y lo revisamos de inmediato.";

const STAGE_INFO_TEMPLATE: &str = "Claro, te comparto más información. ¿Sobre qué tema te \
    gustaría profundizar?";

/// Best-effort apology when delivery ultimately fails
pub const APOLOGY_TEMPLATE: &str = "Lo sentimos, tuvimos un problema técnico al responder. \
    Por favor intenta de nuevo en unos minutos.";

const SYSTEM_PROMPT: &str = "Eres el asistente de WhatsApp de una agencia de automatización \
    y marketing digital. Responde en el idioma del usuario, breve y útil. No inventes \
    precios ni datos de contacto.";

/// Stateless reply generator
pub struct MessageProcessor {
    completion: Option<Arc<CompletionClient>>,
}

impl MessageProcessor {
    /// Create a processor; pass `None` to run fully deterministic
    pub fn new(completion: Option<Arc<CompletionClient>>) -> Self {
        Self { completion }
    }

    /// Decide the reply for an inbound text. Total: always returns a
    /// non-empty string, regardless of backend availability.
    pub async fn process(&self, text: &str, conversation: &Conversation) -> String {
        let normalized = text.trim().to_lowercase();

        if let Some(reply) = quick_reply(&normalized) {
            debug!(user_id = %conversation.user_id, "quick pattern matched");
            return reply.to_string();
        }

        if let Some(client) = &self.completion {
            match self.generate(client, text, conversation).await {
                Ok(reply) if !reply.trim().is_empty() => return truncate_reply(reply),
                Ok(_) => {
                    warn!(user_id = %conversation.user_id, "backend returned empty reply");
                }
                Err(e) => {
                    warn!(user_id = %conversation.user_id, error = %e, "completion backend failed, using stage fallback");
                }
            }
        }

        stage_reply(conversation.stage).to_string()
    }

    async fn generate(
        &self,
        client: &CompletionClient,
        text: &str,
        conversation: &Conversation,
    ) -> wabot_core::Result<String> {
        let mut builder = client
            .request_builder()
            .system(SYSTEM_PROMPT)
            .max_tokens(1024);

        // Last 10 history entries as context, oldest first
        let skip = conversation
            .messages
            .len()
            .saturating_sub(crate::store::DEFAULT_HISTORY_LIMIT);
        for msg in conversation.messages.iter().skip(skip) {
            builder = builder.message(match msg.role {
                Role::User => Message::user(&msg.content),
                Role::Assistant => Message::assistant(&msg.content),
            });
        }
        builder = builder.message(Message::user(text));

        let response = client.messages(builder.build()).await?;
        Ok(response.text())
    }
}

/// First matching quick pattern, in fixed order:
/// greeting, service, contact, pricing.
fn quick_reply(normalized: &str) -> Option<&'static str> {
    if normalized.chars().count() <= GREETING_MAX_CHARS
        && GREETING_KEYWORDS.iter().any(|k| normalized.contains(k))
    {
        return Some(GREETING_TEMPLATE);
    }
    if SERVICE_KEYWORDS.iter().any(|k| normalized.contains(k)) {
        return Some(SERVICES_TEMPLATE);
    }
    if CONTACT_KEYWORDS.iter().any(|k| normalized.contains(k)) {
        return Some(CONTACT_TEMPLATE);
    }
    if PRICING_KEYWORDS.iter().any(|k| normalized.contains(k)) {
        return Some(PRICING_TEMPLATE);
    }
    None
}

/// Canned fallback for the current stage
fn stage_reply(stage: Stage) -> &'static str {
    match stage {
        Stage::Greeting => STAGE_GREETING_TEMPLATE,
        Stage::ServiceInquiry => STAGE_SERVICE_TEMPLATE,
        Stage::Support => STAGE_SUPPORT_TEMPLATE,
        Stage::Information => STAGE_INFO_TEMPLATE,
    }
}

/// Cap a generated reply at the provider's text limit, on a char boundary
fn truncate_reply(text: String) -> String {
    if text.chars().count() <= MAX_TEXT_LENGTH {
        return text;
    }
    let mut capped: String = text.chars().take(MAX_TEXT_LENGTH - 1).collect();
    capped.push('…');
    capped
}
