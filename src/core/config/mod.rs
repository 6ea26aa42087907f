pub mod sms_config;
pub mod sse_config;

pub use sms_config::SmsConfig;
pub use sse_config::SseConfig;

use log::{debug, warn};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub drive: Option<DriveConfig>,
    pub stripe: Option<StripeConfig>,
    pub twilio: Option<TwilioConfig>,
    pub signalhouse: Option<SignalHouseConfig>,
    pub realestate: Option<RealEstateConfig>,
    pub apollo: Option<ApolloConfig>,
    pub llm: LlmConfig,
    pub sms: SmsConfig,
    pub sse: SseConfig,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub base_url: String,
    /// Empty means any origin.
    pub cors_origins: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Shared bearer token. When unset, only the team header is required.
    pub api_token: Option<String>,
}

#[derive(Clone, Debug)]
pub struct DriveConfig {
    pub server: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub region: String,
}

#[derive(Clone, Debug)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: Option<String>,
    /// plan id -> Stripe price id
    pub prices: HashMap<String, String>,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Clone, Debug)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
    pub forward_number: Option<String>,
    pub validate_signatures: bool,
}

#[derive(Clone, Debug)]
pub struct SignalHouseConfig {
    pub api_key: String,
    pub base_url: String,
    pub default_from: Option<String>,
}

#[derive(Clone, Debug)]
pub struct RealEstateConfig {
    pub api_key: String,
    pub base_url: String,
}

#[derive(Clone, Debug)]
pub struct ApolloConfig {
    pub api_key: String,
    pub base_url: String,
}

#[derive(Clone, Debug, Default)]
pub struct LlmConfig {
    pub openai_key: Option<String>,
    pub openai_model: String,
    pub openai_url: Option<String>,
    pub anthropic_key: Option<String>,
    pub anthropic_model: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = env_opt("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let port = match env_opt("PORT") {
            Some(v) => v.parse().map_err(|_| ConfigError::Invalid {
                key: "PORT",
                value: v,
            })?,
            None => 8080,
        };
        let host = env_or("HOST", "0.0.0.0");

        let config = Self {
            server: ServerConfig {
                base_url: env_or("BASE_URL", &format!("http://localhost:{port}")),
                host,
                port,
                cors_origins: env_opt("CORS_ALLOWED_ORIGINS")
                    .map(|raw| {
                        raw.split(',')
                            .map(|o| o.trim().to_string())
                            .filter(|o| !o.is_empty())
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            database: DatabaseConfig {
                url: database_url,
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 10),
            },
            auth: AuthConfig {
                api_token: env_opt("API_TOKEN"),
            },
            drive: DriveConfig::from_env(),
            stripe: StripeConfig::from_env(),
            twilio: TwilioConfig::from_env(),
            signalhouse: env_opt("SIGNALHOUSE_API_KEY").map(|api_key| SignalHouseConfig {
                api_key,
                base_url: env_or("SIGNALHOUSE_API_URL", "https://api.signalhouse.io"),
                default_from: env_opt("SIGNALHOUSE_FROM_NUMBER"),
            }),
            realestate: env_opt("REALESTATE_API_KEY").map(|api_key| RealEstateConfig {
                api_key,
                base_url: env_or("REALESTATE_API_URL", "https://api.realestateapi.com"),
            }),
            apollo: env_opt("APOLLO_API_KEY").map(|api_key| ApolloConfig {
                api_key,
                base_url: env_or("APOLLO_API_URL", "https://api.apollo.io/api/v1"),
            }),
            llm: LlmConfig {
                openai_key: env_opt("OPENAI_API_KEY"),
                openai_model: env_or("OPENAI_MODEL", "gpt-4o-mini"),
                openai_url: env_opt("OPENAI_API_URL"),
                anthropic_key: env_opt("ANTHROPIC_API_KEY"),
                anthropic_model: env_or("ANTHROPIC_MODEL", "claude-3-5-haiku-latest"),
            },
            sms: SmsConfig::from_env(),
            sse: SseConfig::from_env(),
        };

        config.log_providers();
        Ok(config)
    }

    /// Database only, every provider unconfigured, default limits.
    pub fn with_database_url(url: &str) -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                base_url: "http://localhost:8080".to_string(),
                cors_origins: Vec::new(),
            },
            database: DatabaseConfig {
                url: url.to_string(),
                max_connections: 1,
            },
            auth: AuthConfig::default(),
            drive: None,
            stripe: None,
            twilio: None,
            signalhouse: None,
            realestate: None,
            apollo: None,
            llm: LlmConfig::default(),
            sms: SmsConfig::default(),
            sse: SseConfig::default(),
        }
    }

    fn log_providers(&self) {
        let providers = [
            ("drive", self.drive.is_some()),
            ("stripe", self.stripe.is_some()),
            ("twilio", self.twilio.is_some()),
            ("signalhouse", self.signalhouse.is_some()),
            ("realestate", self.realestate.is_some()),
            ("apollo", self.apollo.is_some()),
            ("openai", self.llm.openai_key.is_some()),
            ("anthropic", self.llm.anthropic_key.is_some()),
        ];
        for (name, enabled) in providers {
            if enabled {
                debug!("Provider {name} configured");
            } else {
                warn!("Provider {name} not configured, its endpoints will answer 503");
            }
        }
    }
}

impl DriveConfig {
    fn from_env() -> Option<Self> {
        Some(Self {
            server: env_opt("DRIVE_SERVER")?,
            access_key: env_opt("DRIVE_ACCESSKEY")?,
            secret_key: env_opt("DRIVE_SECRET")?,
            bucket: env_or("DRIVE_BUCKET", "nextier-uploads"),
            region: env_or("DRIVE_REGION", "us-east-1"),
        })
    }
}

impl StripeConfig {
    fn from_env() -> Option<Self> {
        let secret_key = env_opt("STRIPE_SECRET_KEY")?;
        let mut prices = HashMap::new();
        for plan in ["starter", "pro", "agency"] {
            let key = format!("STRIPE_PRICE_{}", plan.to_uppercase());
            if let Ok(price) = std::env::var(&key) {
                prices.insert(plan.to_string(), price);
            }
        }
        Some(Self {
            secret_key,
            webhook_secret: env_opt("STRIPE_WEBHOOK_SECRET"),
            prices,
            success_url: env_or("STRIPE_SUCCESS_URL", "http://localhost:3000/billing/success"),
            cancel_url: env_or("STRIPE_CANCEL_URL", "http://localhost:3000/billing"),
        })
    }
}

impl TwilioConfig {
    fn from_env() -> Option<Self> {
        Some(Self {
            account_sid: env_opt("TWILIO_ACCOUNT_SID")?,
            auth_token: env_opt("TWILIO_AUTH_TOKEN")?,
            from_number: env_opt("TWILIO_PHONE_NUMBER")?,
            forward_number: env_opt("TWILIO_FORWARD_NUMBER"),
            validate_signatures: env_parse("TWILIO_VALIDATE_SIGNATURES", true),
        })
    }
}

pub(crate) fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

pub(crate) fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env_opt(key) {
        Some(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                warn!("Ignoring unparsable {key}={raw}, using default");
                default
            }
        },
        None => default,
    }
}
