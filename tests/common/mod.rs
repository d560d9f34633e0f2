//! Shared wiring for integration tests: the full engine stack pointed at a
//! wiremock provider.

#![allow(dead_code)]

use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use sync_worker::bus::Bus;
use sync_worker::config::{BodyStoreConfig, OAuthConfig, SyncConfig, WebhookConfig};
use sync_worker::modifier::ModifierEngine;
use sync_worker::oauth::OAuthService;
use sync_worker::provider::ProviderRegistry;
use sync_worker::realtime::Broadcaster;
use sync_worker::repo::{
    ConnectionRepository, EmailRepository, MailBodyRepository, ModifierRepository,
    SyncStateRepository, WebhookRepository,
};
use sync_worker::sync::SyncEngine;
use sync_worker::webhook::WebhookManager;

pub struct TestApp {
    pub engine: Arc<SyncEngine>,
    pub modifier_engine: Arc<ModifierEngine>,
    pub webhook_manager: Arc<WebhookManager>,
    pub bus: Bus,
    pub connections: ConnectionRepository,
    pub emails: EmailRepository,
    pub bodies: MailBodyRepository,
    pub states: SyncStateRepository,
    pub modifiers: ModifierRepository,
    pub webhooks: WebhookRepository,
}

pub fn sync_config() -> SyncConfig {
    SyncConfig {
        backfill_page_size: 2,
        max_retries: 5,
        backoff_base: Duration::from_secs(5),
        backoff_cap: Duration::from_secs(900),
        fallback_window_days: 30,
        fetch_parallelism: 3,
        stale_after: Duration::from_secs(3600),
    }
}

pub fn build_app(pool: PgPool, provider_base: &str) -> TestApp {
    let connections = ConnectionRepository::new(pool.clone());
    let emails = EmailRepository::new(pool.clone());
    let bodies = MailBodyRepository::new(
        pool.clone(),
        BodyStoreConfig {
            gzip_threshold: 1024,
            ttl_days: 30,
        },
    );
    let states = SyncStateRepository::new(pool.clone());
    let modifiers = ModifierRepository::new(pool.clone());
    let webhooks = WebhookRepository::new(pool.clone());
    let bus = Bus::new(pool.clone());
    let realtime = Arc::new(Broadcaster::new(16));

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("http client");
    let oauth = Arc::new(OAuthService::new(
        connections.clone(),
        http,
        OAuthConfig {
            gmail_client_id: "test-client".to_string(),
            gmail_client_secret: "test-secret".to_string(),
            gmail_token_url: format!("{provider_base}/token"),
            outlook_client_id: "test-client".to_string(),
            outlook_client_secret: "test-secret".to_string(),
            outlook_token_url: format!("{provider_base}/token"),
            refresh_margin: Duration::from_secs(300),
        },
    ));

    let providers = ProviderRegistry::new()
        .expect("provider registry")
        .with_gmail_base(provider_base)
        .with_outlook_base(provider_base);

    let webhook_manager = Arc::new(WebhookManager::new(
        webhooks.clone(),
        connections.clone(),
        states.clone(),
        oauth.clone(),
        providers.clone(),
        bus.clone(),
        realtime.clone(),
        WebhookConfig {
            callback_url: "https://example.com/hooks/mail".to_string(),
            gmail_pubsub_topic: "projects/test/topics/gmail-push".to_string(),
            verification_token: "test-verification".to_string(),
            lead_time: Duration::from_secs(3600),
            retry_delay: Duration::from_secs(30),
            max_failures: 3,
        },
    ));

    let engine = Arc::new(SyncEngine::new(
        pool.clone(),
        connections.clone(),
        emails.clone(),
        bodies.clone(),
        states.clone(),
        modifiers.clone(),
        oauth.clone(),
        providers.clone(),
        webhook_manager.clone(),
        bus.clone(),
        realtime.clone(),
        sync_config(),
    ));

    let modifier_engine = Arc::new(ModifierEngine::new(
        pool,
        modifiers.clone(),
        emails.clone(),
        connections.clone(),
        oauth,
        providers,
        bus.clone(),
        realtime,
        3,
    ));

    TestApp {
        engine,
        modifier_engine,
        webhook_manager,
        bus,
        connections,
        emails,
        bodies,
        states,
        modifiers,
        webhooks,
    }
}
