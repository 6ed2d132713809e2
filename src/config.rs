use chrono::{DateTime, Utc};
use clap::builder::FalseyValueParser;
use clap::{Parser, ValueEnum};
use std::collections::HashSet;
use std::time::Duration;
use tracing::info;

use crate::error::ConfigError;

// CLI argument structure, every flag can also come from the environment
#[derive(Parser, Debug, Clone)]
#[command(name = "admission-gateway")]
#[command(about = "Admission-controlled bridge between a chat bot and a completion service")]
pub struct Args {
    // Port to run the webhook server on
    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    // Completion backends (comma-separated)
    // Example: "api.one.example:443,api.two.example:443"
    #[arg(short, long, env = "COMPLETION_BACKENDS", default_value = "localhost:8000")]
    pub backends: String,

    #[arg(long, env = "BEARER_TOKEN", default_value = "", hide_env_values = true)]
    pub bearer_token: String,

    #[arg(long, env = "LLM_API_KEY", default_value = "", hide_env_values = true)]
    pub llm_api_key: String,

    // Completion cache TTL in seconds
    #[arg(short, long, env = "CACHE_TTL", default_value_t = 300)]
    pub cache_ttl: u64,

    // Health check interval in seconds
    #[arg(long, env = "HEALTH_INTERVAL", default_value_t = 30)]
    pub health_interval: u64,

    #[arg(long, env = "HEALTH_PATH", default_value = "/health")]
    pub health_path: String,

    // Completions allowed in flight at once
    #[arg(long, env = "MAX_INFLIGHT", default_value_t = 4)]
    pub max_inflight: usize,

    #[arg(long, env = "TELETOKEN", hide_env_values = true)]
    pub telegram_token: String,

    #[arg(long, env = "TELEGRAM_API_URL", default_value = "https://api.telegram.org")]
    pub telegram_api_url: String,

    #[arg(long, env = "WEBHOOK_SECRET", hide_env_values = true)]
    pub webhook_secret: Option<String>,

    #[arg(long, env = "BOT_USERNAME", default_value = "AssistantBot")]
    pub bot_username: String,

    // Maintenance mode, everyone but the admin is turned away
    #[arg(long, env = "DOWNTIME", value_parser = FalseyValueParser::new())]
    pub maintenance: bool,

    // RFC 3339 instant maintenance is expected to end
    #[arg(long, env = "DOWNTIME_UNTIL")]
    pub downtime_until: Option<DateTime<Utc>>,

    // Skip entitlement checks for everyone
    #[arg(long, env = "FREEMODE", value_parser = FalseyValueParser::new())]
    pub free_mode: bool,

    #[arg(long, env = "ADMIN_TELEGRAM_ID", allow_negative_numbers = true)]
    pub admin_id: Option<i64>,

    #[arg(long, env = "RESTRICTED_USER_IDS", value_delimiter = ',', allow_negative_numbers = true)]
    pub restricted_users: Vec<i64>,

    // Groups whose traffic goes through the group rate limiter
    #[arg(long, env = "RESTRICTED_GROUP_IDS", value_delimiter = ',', allow_negative_numbers = true)]
    pub restricted_groups: Vec<i64>,

    #[arg(long, env = "PRIVILEGED_USER_IDS", value_delimiter = ',', allow_negative_numbers = true)]
    pub privileged_users: Vec<i64>,

    #[arg(long, env = "PRIVILEGED_GROUP_IDS", value_delimiter = ',', allow_negative_numbers = true)]
    pub privileged_groups: Vec<i64>,

    #[arg(long, env = "BETA_TESTER_USERS", value_delimiter = ',', allow_negative_numbers = true)]
    pub beta_users: Vec<i64>,

    #[arg(long, env = "BETA_TESTER_GROUPS", value_delimiter = ',', allow_negative_numbers = true)]
    pub beta_groups: Vec<i64>,

    // /ask requests per window, per restricted group
    #[arg(long, env = "ASK_RATE_LIMIT", default_value_t = 5)]
    pub ask_rate_limit: usize,

    // /info requests per window, per restricted group
    #[arg(long, env = "INFO_RATE_LIMIT", default_value_t = 20)]
    pub info_rate_limit: usize,

    // Rate limit window in seconds
    #[arg(long, env = "RATE_WINDOW", default_value_t = 3600)]
    pub rate_window: u64,

    #[arg(long, env = "STORE_FAILURE_POLICY", value_enum, default_value_t = StoreFailurePolicy::FailClosed)]
    pub store_failure_policy: StoreFailurePolicy,

    // PostgREST base url; in-memory entitlements when unset
    #[arg(long, env = "SUPABASE_URL")]
    pub store_url: Option<String>,

    #[arg(long, env = "SUPABASE_KEY", default_value = "", hide_env_values = true)]
    pub store_key: String,

    #[arg(long, env = "ENTITLEMENT_TABLE", default_value = "users")]
    pub store_table: String,

    #[arg(long, env = "STORE_TIMEOUT_MS", default_value_t = 3000)]
    pub store_timeout_ms: u64,

    #[arg(long, env = "LLM_RESTRICT_MSG", default_value = "Sorry, this bot is not available to you.")]
    pub restrict_message: String,

    #[arg(long, env = "SUBSCRIBE_URL", default_value = "https://example.org/subscribe")]
    pub subscribe_url: String,

    #[arg(long, env = "LLM_MODEL_ID", default_value = "gpt-4")]
    pub model_id: String,

    #[arg(long, env = "LLM_BETA_MODEL_ID")]
    pub beta_model_id: Option<String>,

    #[arg(long, env = "LLM_Q_SUFFIX", default_value = "(Please limit your response to 10000 characters max.)")]
    pub ask_suffix: String,

    #[arg(long, env = "LLM_INFO_PROMPT_SUFIX", default_value = "")]
    pub info_suffix: String,

    #[arg(long, env = "LLM_MAX_TOKENS", default_value_t = 6000)]
    pub max_tokens: u32,

    // Appended to /info and /fx replies, Markdown allowed
    #[arg(long, env = "CONTACT_FOOTER", default_value = "")]
    pub contact_footer: String,

    // Effect search for /fx; the command answers with an apology when unset
    #[arg(long, env = "ALGO_APP_ID")]
    pub search_app_id: Option<String>,

    #[arg(long, env = "ALGO_API_KEY", default_value = "", hide_env_values = true)]
    pub search_api_key: String,

    #[arg(long, env = "ALGO_INDEX")]
    pub search_index: Option<String>,
}

// What the entitlement gate does when the store cannot be reached
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreFailurePolicy {
    // deny as if the user had no credits
    #[default]
    FailClosed,
    // admit without charging
    FailOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitParams {
    pub max_requests: usize,
    pub window: Duration,
}

impl RateLimitParams {
    pub fn per_hour(max_requests: usize) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdmissionMessages {
    pub restricted: String,
    pub rate_limited: String,
    pub quota_exhausted: String,
}

impl AdmissionMessages {
    pub fn new(restricted: String, subscribe_url: &str) -> Self {
        Self {
            restricted,
            rate_limited: "This group has reached its request limit. Please try again later."
                .to_string(),
            quota_exhausted: format!(
                "You have used all of your free questions. Subscribe to keep asking: {}",
                subscribe_url
            ),
        }
    }
}

impl Default for AdmissionMessages {
    fn default() -> Self {
        Self::new(
            "Sorry, this bot is not available to you.".to_string(),
            "https://example.org/subscribe",
        )
    }
}

// Gate settings, built once at startup and shared read-only
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub maintenance: bool,
    pub downtime_until: Option<DateTime<Utc>>,
    pub free_mode: bool,
    pub admin_id: Option<i64>,
    pub restricted_users: HashSet<i64>,
    pub restricted_groups: HashSet<i64>,
    pub privileged_users: HashSet<i64>,
    pub privileged_groups: HashSet<i64>,
    pub ask_limit: RateLimitParams,
    pub info_limit: RateLimitParams,
    pub store_failure_policy: StoreFailurePolicy,
    pub store_timeout: Duration,
    pub messages: AdmissionMessages,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            maintenance: false,
            downtime_until: None,
            free_mode: false,
            admin_id: None,
            restricted_users: HashSet::new(),
            restricted_groups: HashSet::new(),
            privileged_users: HashSet::new(),
            privileged_groups: HashSet::new(),
            ask_limit: RateLimitParams::per_hour(5),
            info_limit: RateLimitParams::per_hour(20),
            store_failure_policy: StoreFailurePolicy::FailClosed,
            store_timeout: Duration::from_secs(3),
            messages: AdmissionMessages::default(),
        }
    }
}

impl AdmissionConfig {
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        if args.ask_rate_limit == 0 || args.info_rate_limit == 0 {
            return Err(ConfigError::Invalid(
                "rate limits must allow at least one request".to_string(),
            ));
        }
        if args.rate_window == 0 {
            return Err(ConfigError::Invalid("rate window must be positive".to_string()));
        }
        if args.store_timeout_ms == 0 {
            return Err(ConfigError::Invalid("store timeout must be positive".to_string()));
        }

        let window = Duration::from_secs(args.rate_window);
        let config = Self {
            maintenance: args.maintenance,
            downtime_until: args.downtime_until,
            free_mode: args.free_mode,
            admin_id: args.admin_id,
            restricted_users: args.restricted_users.iter().copied().collect(),
            restricted_groups: args.restricted_groups.iter().copied().collect(),
            privileged_users: args.privileged_users.iter().copied().collect(),
            privileged_groups: args.privileged_groups.iter().copied().collect(),
            ask_limit: RateLimitParams {
                max_requests: args.ask_rate_limit,
                window,
            },
            info_limit: RateLimitParams {
                max_requests: args.info_rate_limit,
                window,
            },
            store_failure_policy: args.store_failure_policy,
            store_timeout: Duration::from_millis(args.store_timeout_ms),
            messages: AdmissionMessages::new(args.restrict_message.clone(), &args.subscribe_url),
        };
        config.log_summary();
        Ok(config)
    }

    fn log_summary(&self) {
        info!("=== Admission Configuration ===");
        info!(
            maintenance = self.maintenance,
            downtime_until = ?self.downtime_until,
            free_mode = self.free_mode,
            admin = ?self.admin_id,
            "Global flags"
        );
        info!(
            restricted_users = self.restricted_users.len(),
            restricted_groups = self.restricted_groups.len(),
            privileged_users = self.privileged_users.len(),
            privileged_groups = self.privileged_groups.len(),
            "Identity sets"
        );
        info!(
            "Rate limits: /ask {} per {:?}, /info {} per {:?}",
            self.ask_limit.max_requests,
            self.ask_limit.window,
            self.info_limit.max_requests,
            self.info_limit.window
        );
        info!("Store failure policy: {:?}", self.store_failure_policy);
    }
}

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub bot_username: String,
    pub model_id: String,
    pub beta_model_id: Option<String>,
    pub beta_users: HashSet<i64>,
    pub beta_groups: HashSet<i64>,
    pub ask_suffix: String,
    pub info_suffix: String,
    pub max_tokens: u32,
    pub contact_footer: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            bot_username: "AssistantBot".to_string(),
            model_id: "gpt-4".to_string(),
            beta_model_id: None,
            beta_users: HashSet::new(),
            beta_groups: HashSet::new(),
            ask_suffix: String::new(),
            info_suffix: String::new(),
            max_tokens: 6000,
            contact_footer: String::new(),
        }
    }
}

impl BotConfig {
    pub fn from_args(args: &Args) -> Self {
        Self {
            bot_username: args.bot_username.trim_start_matches('@').to_string(),
            model_id: args.model_id.clone(),
            beta_model_id: args.beta_model_id.clone(),
            beta_users: args.beta_users.iter().copied().collect(),
            beta_groups: args.beta_groups.iter().copied().collect(),
            ask_suffix: args.ask_suffix.clone(),
            info_suffix: args.info_suffix.clone(),
            max_tokens: args.max_tokens,
            contact_footer: args.contact_footer.trim().to_string(),
        }
    }

    // Beta testers get the beta model when one is configured
    pub fn model_for(&self, user_id: i64, chat_id: i64) -> &str {
        match &self.beta_model_id {
            Some(beta) if self.beta_users.contains(&user_id) || self.beta_groups.contains(&chat_id) => {
                beta
            }
            _ => &self.model_id,
        }
    }
}
