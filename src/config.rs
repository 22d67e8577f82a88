use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub signalwire: SignalWireConfig,
    #[serde(default)]
    pub sms: SmsConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub hubspot: HubSpotConfig,
    #[serde(default)]
    pub slack: SlackConfig,
    #[serde(default)]
    pub google: GoogleConfig,
    #[serde(default)]
    pub calcom: CalComConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub external_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            external_url: String::new(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Supabase,
    /// Process-local tables. Nothing survives a restart.
    Memory,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// PostgREST base, e.g. https://xyz.supabase.co
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub service_role_key: String,
    /// JSON file of rows loaded into the memory backend at startup.
    #[serde(default)]
    pub seed_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OpenAiConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_openai_base")]
    pub base_url: String,
    #[serde(default = "default_chat_model")]
    pub model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_openai_base(),
            model: default_chat_model(),
            embedding_model: default_embedding_model(),
        }
    }
}

fn default_openai_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-ada-002".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SignalWireConfig {
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub api_token: String,
    /// Space host without scheme, e.g. example.signalwire.com
    #[serde(default)]
    pub space_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SmsConfig {
    /// Send agent-initiated texts to US numbers from the registered 10DLC
    /// campaign number. Replies keep the texted number.
    #[serde(default)]
    pub use_campaign_number: bool,
    #[serde(default = "default_campaign_number")]
    pub campaign_number: String,
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            use_campaign_number: false,
            campaign_number: default_campaign_number(),
        }
    }
}

fn default_campaign_number() -> String {
    "+16503912711".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct PricingConfig {
    /// Dollars per SMS segment, either direction.
    #[serde(default = "default_sms_rate")]
    pub sms_rate: f64,
    /// Surcharge added when the outbound text was generated by the agent.
    #[serde(default = "default_sms_ai_rate")]
    pub sms_ai_rate: f64,
    /// Dollars per inbound email handled.
    #[serde(default = "default_email_rate")]
    pub email_rate: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            sms_rate: default_sms_rate(),
            sms_ai_rate: default_sms_ai_rate(),
            email_rate: default_email_rate(),
        }
    }
}

fn default_sms_rate() -> f64 {
    0.01
}

fn default_sms_ai_rate() -> f64 {
    0.005
}

fn default_email_rate() -> f64 {
    0.01
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct HubSpotConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SlackConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct GoogleConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub places_api_key: String,
    /// Shared secret expected in the `?secret=` query of Gmail push deliveries.
    #[serde(default)]
    pub pubsub_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CalComConfig {
    #[serde(default = "default_calcom_base")]
    pub base_url: String,
}

impl Default for CalComConfig {
    fn default() -> Self {
        Self {
            base_url: default_calcom_base(),
        }
    }
}

fn default_calcom_base() -> String {
    "https://api.cal.com/v2".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct NotificationsConfig {
    /// Endpoint that fans new-message events out to email, SMS and push.
    #[serde(default)]
    pub relay_url: Option<String>,
    /// Endpoint that looks up public profile data for a phone number.
    #[serde(default)]
    pub contact_lookup_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ApiConfig {
    /// Service bearer token accepted by /mcp/execute together with `x-user-id`.
    /// If empty, only user tokens are accepted.
    #[serde(default)]
    pub token: String,
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        // Load .env file from same directory as config.toml
        let env_path = config_dir().join(".env");
        match dotenvy::from_path(&env_path) {
            Ok(()) => tracing::info!("Loaded .env from {}", env_path.display()),
            Err(dotenvy::Error::Io(_)) => {
                tracing::debug!(
                    "No .env file at {}, using environment only",
                    env_path.display()
                );
            }
            Err(e) => tracing::warn!("Failed to parse .env: {e}"),
        }

        let path = config_path();
        tracing::info!("Loading config from {}", path.display());

        let contents = std::fs::read_to_string(&path).map_err(|e| {
            format!(
                "Failed to read config at {}: {}. Copy config.example.toml to {}",
                path.display(),
                e,
                path.display()
            )
        })?;

        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Secrets from the environment win over the file.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let overrides: [(&str, &mut String); 15] = [
            ("SUPABASE_URL", &mut self.store.url),
            ("SUPABASE_SERVICE_ROLE_KEY", &mut self.store.service_role_key),
            ("OPENAI_API_KEY", &mut self.openai.api_key),
            ("SIGNALWIRE_PROJECT_ID", &mut self.signalwire.project_id),
            ("SIGNALWIRE_API_TOKEN", &mut self.signalwire.api_token),
            ("SIGNALWIRE_SPACE_URL", &mut self.signalwire.space_url),
            ("HUBSPOT_CLIENT_ID", &mut self.hubspot.client_id),
            ("HUBSPOT_CLIENT_SECRET", &mut self.hubspot.client_secret),
            ("SLACK_CLIENT_ID", &mut self.slack.client_id),
            ("SLACK_CLIENT_SECRET", &mut self.slack.client_secret),
            ("GOOGLE_CLIENT_ID", &mut self.google.client_id),
            ("GOOGLE_CLIENT_SECRET", &mut self.google.client_secret),
            ("GOOGLE_PLACES_API_KEY", &mut self.google.places_api_key),
            ("GMAIL_PUBSUB_SECRET", &mut self.google.pubsub_secret),
            ("SERVER_EXTERNAL_URL", &mut self.server.external_url),
        ];
        for (key, slot) in overrides {
            if let Some(v) = lookup(key) {
                *slot = v;
            }
        }
        if let Some(v) = lookup("MAGPIPE_API_TOKEN") {
            self.api.token = v;
        }
        if let Some(v) = lookup("USE_USA_CAMPAIGN_NUMBER") {
            self.sms.use_campaign_number = v.eq_ignore_ascii_case("true");
        }
    }

    /// Problems that would make the server useless at startup.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.store.backend == StoreBackend::Supabase {
            if self.store.url.is_empty() {
                problems.push("store.url (SUPABASE_URL) is not set".to_string());
            }
            if self.store.service_role_key.is_empty() {
                problems.push(
                    "store.service_role_key (SUPABASE_SERVICE_ROLE_KEY) is not set".to_string(),
                );
            }
        }
        if self.openai.api_key.is_empty() {
            problems.push("openai.api_key (OPENAI_API_KEY) is not set".to_string());
        }
        if self.signalwire.project_id.is_empty()
            || self.signalwire.api_token.is_empty()
            || self.signalwire.space_url.is_empty()
        {
            problems.push("signalwire credentials are incomplete".to_string());
        }
        problems
    }
}

pub fn config_dir() -> PathBuf {
    if let Ok(p) = std::env::var("MAGPIPE_CONFIG") {
        // If pointing to a file, use its parent directory
        let path = PathBuf::from(p);
        return path.parent().map(|p| p.to_path_buf()).unwrap_or(path);
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".magpipe")
}

pub fn config_path() -> PathBuf {
    if let Ok(p) = std::env::var("MAGPIPE_CONFIG") {
        return PathBuf::from(p);
    }

    config_dir().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.openai.model, "gpt-4o-mini");
        assert_eq!(config.store.backend, StoreBackend::Supabase);
        assert_eq!(config.sms.campaign_number, "+16503912711");
        assert!(!config.sms.use_campaign_number);
        assert!((config.pricing.sms_rate - 0.01).abs() < f64::EPSILON);
    }

    #[test]
    fn sections_parse() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 3000
            external_url = "https://magpipe.example"

            [store]
            backend = "memory"

            [signalwire]
            project_id = "proj"
            api_token = "tok"
            space_url = "demo.signalwire.com"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.signalwire.space_url, "demo.signalwire.com");
    }

    #[test]
    fn env_overrides_win() {
        let env: HashMap<&str, &str> = [
            ("OPENAI_API_KEY", "sk-env"),
            ("SUPABASE_URL", "https://db.example"),
            ("USE_USA_CAMPAIGN_NUMBER", "TRUE"),
        ]
        .into_iter()
        .collect();
        let mut config: Config = toml::from_str("[openai]\napi_key = \"sk-file\"").unwrap();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.openai.api_key, "sk-env");
        assert_eq!(config.store.url, "https://db.example");
        assert!(config.sms.use_campaign_number);
    }

    #[test]
    fn validate_reports_missing_secrets() {
        let config = Config::default();
        let problems = config.validate();
        assert!(problems.iter().any(|p| p.contains("SUPABASE_URL")));
        assert!(problems.iter().any(|p| p.contains("OPENAI_API_KEY")));

        let mut memory = Config::default();
        memory.store.backend = StoreBackend::Memory;
        assert!(!memory.validate().iter().any(|p| p.contains("SUPABASE")));
    }
}
