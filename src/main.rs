mod admin;
mod chat;
mod compliance;
mod config;
mod contacts;
mod context;
mod crawl;
mod credits;
mod gmail;
mod http;
mod integrations;
mod llm;
mod models;
mod pii;
mod prefs;
mod schedule;
mod sentiment;
mod signalwire;
mod sms;
mod store;
#[cfg(test)]
mod testing;
mod tools;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use compliance::AreaCodeCache;
use config::{Config, StoreBackend};
use crawl::Crawler;
use gmail::GmailClient;
use integrations::calcom::CalComClient;
use integrations::hubspot::HubSpotClient;
use integrations::mcp::McpClient;
use integrations::places::PlacesClient;
use integrations::relay::RelayClient;
use integrations::slack::SlackClient;
use llm::openai::OpenAiClient;
use llm::LanguageModel;
use signalwire::client::{SignalWireClient, SmsGateway};
use store::memory::MemoryStore;
use store::supabase::SupabaseStore;
use store::Store;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Pause between child sitemap fetches when planning a crawl.
const SITEMAP_PAUSE: Duration = Duration::from_millis(500);

/// Shared application state accessible from all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub llm: Arc<dyn LanguageModel>,
    pub sms: Arc<dyn SmsGateway>,
    pub slack: Arc<SlackClient>,
    pub hubspot: Arc<HubSpotClient>,
    pub places: Arc<PlacesClient>,
    pub calcom: Arc<CalComClient>,
    pub gmail: Arc<GmailClient>,
    pub mcp: Arc<McpClient>,
    /// New-message fan-out and phone/email profile lookups.
    pub relay: Arc<RelayClient>,
    pub crawler: Arc<Crawler>,
    pub area_codes: Arc<AreaCodeCache>,
}

impl AppState {
    /// Builds the vendor clients around the given core services.
    ///
    /// With `vendor_base` every vendor API is rooted under that URL
    /// (`{base}/slack`, `{base}/hubspot`, ...) instead of its public host.
    pub fn with_parts(
        config: Config,
        store: Arc<dyn Store>,
        llm: Arc<dyn LanguageModel>,
        sms: Arc<dyn SmsGateway>,
        vendor_base: Option<&str>,
    ) -> Self {
        let (slack, hubspot, places, calcom, gmail, sitemap_pause) = match vendor_base {
            Some(base) => (
                SlackClient::with_base_url(&config.slack, &format!("{base}/slack")),
                HubSpotClient::with_base_url(&config.hubspot, &format!("{base}/hubspot")),
                PlacesClient::with_base_url(&config.google.places_api_key, &format!("{base}/places")),
                CalComClient::new(&format!("{base}/calcom")),
                GmailClient::with_base_urls(
                    &config.google,
                    &format!("{base}/gmail/v1/users/me"),
                    &format!("{base}/token"),
                ),
                Duration::ZERO,
            ),
            None => (
                SlackClient::new(&config.slack),
                HubSpotClient::new(&config.hubspot),
                PlacesClient::new(&config.google.places_api_key),
                CalComClient::new(&config.calcom.base_url),
                GmailClient::new(&config.google),
                SITEMAP_PAUSE,
            ),
        };

        Self {
            slack: Arc::new(slack),
            hubspot: Arc::new(hubspot),
            places: Arc::new(places),
            calcom: Arc::new(calcom),
            gmail: Arc::new(gmail),
            mcp: Arc::new(McpClient::new()),
            relay: Arc::new(RelayClient::new(
                &config.notifications,
                &config.store.service_role_key,
            )),
            crawler: Arc::new(Crawler::new(reqwest::Client::new(), sitemap_pause)),
            area_codes: Arc::new(AreaCodeCache::default()),
            config,
            store,
            llm,
            sms,
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("--version") => println!("magpipe {VERSION}"),
        Some("--help") | Some("-h") => print_usage(),
        Some("--check-config") => check_config(),
        Some(other) => {
            eprintln!("Unknown option: {other}");
            print_usage();
            std::process::exit(1);
        }
        None => {
            let rt = tokio::runtime::Runtime::new().expect("Failed to create tokio runtime");
            rt.block_on(server());
        }
    }
}

fn print_usage() {
    println!("magpipe {VERSION}");
    println!("AI agent service for SMS, web chat and email");
    println!();
    println!("Usage: magpipe [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --check-config  Validate the configuration and exit");
    println!("  --version       Print version");
    println!("  --help, -h      Print this help message");
    println!();
    println!("Without options, starts the server.");
    println!("Config is read from $MAGPIPE_CONFIG or ~/.magpipe/config.toml");
}

fn load_config() -> Config {
    match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    }
}

fn check_config() {
    let config = load_config();
    let problems = config.validate();
    if problems.is_empty() {
        println!("Config OK ({})", config::config_path().display());
        return;
    }
    for problem in &problems {
        eprintln!("  - {problem}");
    }
    std::process::exit(1);
}

fn build_store(config: &Config) -> Arc<dyn Store> {
    match config.store.backend {
        StoreBackend::Supabase => Arc::new(SupabaseStore::new(
            &config.store.url,
            &config.store.service_role_key,
        )),
        StoreBackend::Memory => match &config.store.seed_file {
            Some(path) => match MemoryStore::from_seed_file(path) {
                Ok(store) => {
                    tracing::info!(path = %path.display(), "Loaded memory store seed");
                    Arc::new(store)
                }
                Err(e) => {
                    eprintln!("Failed to load seed file {}: {e}", path.display());
                    std::process::exit(1);
                }
            },
            None => {
                tracing::warn!("Using empty in-memory store; nothing survives a restart");
                Arc::new(MemoryStore::default())
            }
        },
    }
}

async fn server() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "magpipe=info,tower_http=info".into()),
        )
        .init();

    let config = load_config();
    for problem in config.validate() {
        tracing::warn!("Config: {problem}");
    }

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        backend = ?config.store.backend,
        "Starting magpipe"
    );

    let store = build_store(&config);
    let llm: Arc<dyn LanguageModel> = Arc::new(OpenAiClient::new(
        &config.openai.api_key,
        &config.openai.base_url,
        &config.openai.model,
        &config.openai.embedding_model,
    ));
    let sms: Arc<dyn SmsGateway> = Arc::new(SignalWireClient::new(&config.signalwire));
    let state = AppState::with_parts(config.clone(), store, llm, sms, None);

    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .expect("Invalid server address");

    tracing::info!(%addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind");

    axum::serve(listener, app).await.expect("Server error");
}

fn router(state: AppState) -> Router {
    Router::new()
        // Vendor webhooks
        .route("/webhooks/sms", post(signalwire::webhook::handle_sms))
        .route(
            "/webhooks/call-status",
            post(signalwire::webhook::handle_call_status),
        )
        .route("/webhooks/gmail", post(gmail::webhook::handle_push))
        // Website chat widget
        .route(
            "/webhooks/chat",
            post(chat::webhook::handle_chat).get(chat::webhook::handle_poll),
        )
        .route("/widget.js", get(chat::widget::handle_script))
        // Tool execution for agents and MCP callers
        .route("/mcp/execute", post(tools::handle_execute))
        .route(
            "/api/orgs/members/{id}/{action}",
            post(admin::handle_member_action),
        )
        .route("/health", get(health))
        .layer(http::cors())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
