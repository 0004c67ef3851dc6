//! wabot-gateway: WhatsApp Bot Gateway Main Binary
//!
//! Usage:
//!   wabot-gateway            - Start the webhook server
//!   wabot-gateway --help     - Show help
//!   wabot-gateway --version  - Show version

use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use wabot_core::{CompletionClient, Config};
use wabot_whatsapp::WhatsAppBot;

/// Run mode
enum RunMode {
    /// Webhook server mode
    Server,
    /// Show help
    Help,
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match parse_args() {
        RunMode::Help => {
            print_help();
            return Ok(());
        }
        RunMode::Version => {
            println!("wabot-gateway {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        RunMode::Server => {}
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    // Load .env file
    dotenvy::dotenv().ok();

    // Missing WhatsApp credentials are fatal here, never per-request
    let config = Config::load().map_err(|e| anyhow::anyhow!("config error: {}", e))?;

    tracing::info!("Starting wabot-gateway...");

    // Completion backend is optional: without it the bot answers from
    // the deterministic keyword/stage templates only
    let completion = match &config.llm {
        Some(llm_config) => {
            let client = CompletionClient::new(llm_config)
                .map_err(|e| anyhow::anyhow!("failed to create completion client: {}", e))?;
            tracing::info!("Completion backend enabled: {}", llm_config.model);
            Some(Arc::new(client))
        }
        None => {
            tracing::info!("Completion backend disabled (no LLM_API_KEY)");
            None
        }
    };

    let bot = WhatsAppBot::new(&config, completion)
        .map_err(|e| anyhow::anyhow!("failed to create bot: {}", e))?;

    let mut service_handles = Vec::new();

    // Retention sweeper: drops idle conversations and stale delivery
    // tracking on a fixed interval
    {
        let store = bot.store();
        let webhook_state = bot.webhook_state();
        let retention_days = config.retention.days;
        let sweep_interval = std::time::Duration::from_secs(config.retention.sweep_interval_secs);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.tick().await; // first tick is immediate, skip it
            loop {
                ticker.tick().await;
                let removed = store.sweep(chrono::Duration::days(retention_days));
                let pruned = webhook_state.prune(chrono::Duration::days(1));
                tracing::debug!(removed, pruned, "retention sweep complete");
            }
        });
        service_handles.push(handle);
        tracing::info!(
            "Retention sweeper started ({} day window, every {}s)",
            config.retention.days,
            config.retention.sweep_interval_secs
        );
    }

    // Webhook server
    let port = config.server.port;
    let handle = tokio::spawn(async move {
        if let Err(e) = bot.start().await {
            tracing::error!("webhook server error: {}", e);
        }
    });
    service_handles.push(handle);
    tracing::info!("Webhook server started on port {}", port);

    tracing::info!("wabot-gateway initialized successfully");
    tracing::info!("Press Ctrl+C to exit");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    for handle in service_handles {
        handle.abort();
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Parse command line arguments
fn parse_args() -> RunMode {
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => return RunMode::Help,
            "--version" | "-v" => return RunMode::Version,
            _ => {}
        }
    }
    RunMode::Server
}

/// Print help message
fn print_help() {
    println!("wabot-gateway - WhatsApp Bot Gateway");
    println!();
    println!("Usage:");
    println!("  wabot-gateway            Start the webhook server");
    println!("  wabot-gateway --help     Show this help message");
    println!("  wabot-gateway --version  Show version");
    println!();
    println!("Environment Variables:");
    println!("  WHATSAPP_ACCESS_TOKEN     Graph API access token (required)");
    println!("  WHATSAPP_PHONE_NUMBER_ID  Sending phone number id (required)");
    println!("  WHATSAPP_VERIFY_TOKEN     Webhook verification token (required)");
    println!("  WHATSAPP_API_VERSION      Graph API version (default: v21.0)");
    println!("  WHATSAPP_APP_SECRET       App secret for signature checks (optional)");
    println!("  LLM_API_KEY               Completion backend key (optional)");
    println!("  LLM_MODEL                 Completion model name");
    println!("  WEBHOOK_PORT              HTTP port (default: 3000)");
    println!("  RETENTION_DAYS            Conversation retention (default: 7)");
}
