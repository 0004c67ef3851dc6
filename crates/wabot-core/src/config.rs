//! Configuration management
//!
//! Settings are resolved in the following priority order:
//! 1. Environment variables
//! 2. `wabot.toml` config file
//! 3. Built-in defaults
//!
//! Inside the config file, `${VAR_NAME}` expands to the value of the
//! corresponding environment variable.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// WhatsApp Cloud API credentials and endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppConfig {
    /// Graph API access token (bearer)
    pub access_token: String,

    /// Phone number id the bot sends from
    pub phone_number_id: String,

    /// Token echoed back during the webhook GET handshake
    pub verify_token: String,

    /// Graph API version segment
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// App secret for webhook signature verification (optional)
    pub app_secret: Option<String>,

    /// Graph API base URL
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

/// Completion backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// API key
    pub api_key: String,

    /// Model to use
    #[serde(default = "default_model")]
    pub model: String,

    /// Base URL (optional, for custom endpoints)
    pub base_url: Option<String>,
}

/// Webhook server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port for the webhook HTTP server
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

/// Conversation retention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Conversations idle longer than this are swept
    #[serde(default = "default_retention_days")]
    pub days: i64,

    /// How often the sweeper runs
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            days: default_retention_days(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// Main configuration for the wabot gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// WhatsApp credentials (required)
    pub whatsapp: WhatsAppConfig,

    /// Completion backend (optional; the bot degrades to canned replies)
    pub llm: Option<LlmConfig>,

    /// Webhook server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Retention sweep settings
    #[serde(default)]
    pub retention: RetentionConfig,
}

fn default_api_version() -> String {
    "v21.0".to_string()
}

fn default_api_url() -> String {
    "https://graph.facebook.com".to_string()
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_retention_days() -> i64 {
    7
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

/// TOML file shape (everything optional; validation happens on conversion)
#[derive(Debug, Default, Deserialize)]
struct TomlConfig {
    whatsapp: Option<TomlWhatsApp>,
    llm: Option<TomlLlm>,
    server: Option<ServerConfig>,
    retention: Option<RetentionConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct TomlWhatsApp {
    access_token: Option<String>,
    phone_number_id: Option<String>,
    verify_token: Option<String>,
    api_version: Option<String>,
    app_secret: Option<String>,
    api_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TomlLlm {
    api_key: Option<String>,
    model: Option<String>,
    base_url: Option<String>,
}

impl Config {
    /// Expand `${VAR_NAME}` occurrences using environment variables.
    ///
    /// Unknown variables expand to the empty string.
    fn expand_env_vars(value: &str) -> String {
        let mut result = String::new();
        let mut chars = value.chars().peekable();

        while let Some(c) = chars.next() {
            if c == '$' && chars.peek() == Some(&'{') {
                chars.next(); // consume '{'

                let mut var_name = String::new();
                while let Some(&c) = chars.peek() {
                    if c == '}' {
                        chars.next(); // consume '}'
                        break;
                    }
                    var_name.push(c);
                    chars.next();
                }

                if let Ok(env_value) = std::env::var(&var_name) {
                    result.push_str(&env_value);
                }
            } else {
                result.push(c);
            }
        }

        result
    }

    /// Load configuration from the default locations.
    ///
    /// Tries `./wabot.toml` first, then falls back to environment variables
    /// only. Missing WhatsApp credentials are a fatal error either way.
    pub fn load() -> Result<Self> {
        if Path::new("wabot.toml").exists() {
            return Self::from_toml_file("wabot.toml");
        }

        Self::from_env()
    }

    /// Load configuration from a TOML file, then apply env overrides.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let toml_content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("failed to read config file: {}", e)))?;

        let expanded = Self::expand_env_vars(&toml_content);
        let mut cfg = Self::from_toml_str(&expanded)?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse configuration from a TOML string (no env overrides applied).
    fn from_toml_str(content: &str) -> Result<Self> {
        let toml: TomlConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse TOML: {}", e)))?;

        let wa = toml.whatsapp.unwrap_or_default();
        let whatsapp = WhatsAppConfig {
            access_token: wa.access_token.unwrap_or_default(),
            phone_number_id: wa.phone_number_id.unwrap_or_default(),
            verify_token: wa.verify_token.unwrap_or_default(),
            api_version: wa.api_version.unwrap_or_else(default_api_version),
            app_secret: wa.app_secret,
            api_url: wa.api_url.unwrap_or_else(default_api_url),
        };

        let llm = toml.llm.and_then(|l| {
            let api_key = l.api_key.unwrap_or_default();
            if api_key.is_empty() {
                return None;
            }
            Some(LlmConfig {
                api_key,
                model: l.model.unwrap_or_else(default_model),
                base_url: l.base_url,
            })
        });

        Ok(Config {
            whatsapp,
            llm,
            server: toml.server.unwrap_or_default(),
            retention: toml.retention.unwrap_or_default(),
        })
    }

    /// Load configuration from environment variables only.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Config {
            whatsapp: WhatsAppConfig {
                access_token: String::new(),
                phone_number_id: String::new(),
                verify_token: String::new(),
                api_version: default_api_version(),
                app_secret: None,
                api_url: default_api_url(),
            },
            llm: None,
            server: ServerConfig::default(),
            retention: RetentionConfig::default(),
        };

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Overwrite settings from environment variables (env wins over file).
    fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("WHATSAPP_ACCESS_TOKEN") {
            if !token.is_empty() {
                self.whatsapp.access_token = token;
            }
        }
        if let Ok(id) = std::env::var("WHATSAPP_PHONE_NUMBER_ID") {
            if !id.is_empty() {
                self.whatsapp.phone_number_id = id;
            }
        }
        if let Ok(token) = std::env::var("WHATSAPP_VERIFY_TOKEN") {
            if !token.is_empty() {
                self.whatsapp.verify_token = token;
            }
        }
        if let Ok(version) = std::env::var("WHATSAPP_API_VERSION") {
            if !version.is_empty() {
                self.whatsapp.api_version = version;
            }
        }
        if let Ok(secret) = std::env::var("WHATSAPP_APP_SECRET") {
            if !secret.is_empty() {
                self.whatsapp.app_secret = Some(secret);
            }
        }
        if let Ok(url) = std::env::var("WHATSAPP_API_URL") {
            if !url.is_empty() {
                self.whatsapp.api_url = url;
            }
        }

        if let Ok(api_key) = std::env::var("LLM_API_KEY") {
            if !api_key.is_empty() {
                let llm = self.llm.get_or_insert_with(|| LlmConfig {
                    api_key: String::new(),
                    model: default_model(),
                    base_url: None,
                });
                llm.api_key = api_key;
            }
        }
        if let Some(llm) = &mut self.llm {
            if let Ok(model) = std::env::var("LLM_MODEL") {
                if !model.is_empty() {
                    llm.model = model;
                }
            }
            if let Ok(base_url) = std::env::var("LLM_BASE_URL") {
                if !base_url.is_empty() {
                    llm.base_url = Some(base_url);
                }
            }
        }

        if let Ok(port) = std::env::var("WEBHOOK_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(days) = std::env::var("RETENTION_DAYS") {
            if let Ok(days) = days.parse() {
                self.retention.days = days;
            }
        }
    }

    /// Reject configurations that cannot start the gateway.
    fn validate(&self) -> Result<()> {
        if self.whatsapp.access_token.is_empty() {
            return Err(Error::Config(
                "WHATSAPP_ACCESS_TOKEN is required".to_string(),
            ));
        }
        if self.whatsapp.phone_number_id.is_empty() {
            return Err(Error::Config(
                "WHATSAPP_PHONE_NUMBER_ID is required".to_string(),
            ));
        }
        if self.whatsapp.verify_token.is_empty() {
            return Err(Error::Config(
                "WHATSAPP_VERIFY_TOKEN is required".to_string(),
            ));
        }
        Ok(())
    }
}
