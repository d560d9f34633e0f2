use clap::{Parser, Subcommand};
use env_logger::Env;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use sync_worker::bus::Bus;
use sync_worker::bus::payload::{MailSyncJob, SyncReason};
use sync_worker::config::AppConfig;
use sync_worker::modifier::ModifierEngine;
use sync_worker::oauth::OAuthService;
use sync_worker::provider::ProviderRegistry;
use sync_worker::realtime::Broadcaster;
use sync_worker::repo::{
    ConnectionRepository, EmailRepository, MailBodyRepository, ModifierRepository,
    SyncStateRepository, WebhookRepository,
};
use sync_worker::scheduler::Schedulers;
use sync_worker::sync::SyncEngine;
use sync_worker::webhook::WebhookManager;
use sync_worker::worker::{BusConsumer, Dispatcher, JobTimeouts, WorkerPool};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "sync-worker", about = "Mail synchronization worker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker: consumer, pool and schedulers (default).
    Run,
    /// Apply database migrations and exit.
    Migrate,
    /// Trigger one incremental sync step for a connection and exit.
    Sync {
        #[arg(long)]
        connection_id: i64,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .idle_timeout(config.database.idle_timeout)
        .max_lifetime(config.database.max_lifetime)
        .connect(&config.database.url)
        .await
        .expect("failed to connect to database");

    sync_worker::run_migrations(&pool)
        .await
        .expect("database migrations failed");
    log::info!("database migrations successful");

    match cli.command.unwrap_or(Command::Run) {
        Command::Migrate => {}
        Command::Sync { connection_id } => {
            let app = App::build(pool, &config);
            let connection = app
                .connections
                .get(connection_id)
                .await
                .expect("database error")
                .expect("unknown connection");
            let job = MailSyncJob {
                user_id: connection.user_id,
                connection_id,
                reason: SyncReason::Manual,
                cursor_hint: None,
            };
            if let Err(err) = app.engine.run_sync(&job).await {
                log::error!("sync failed: {}", err);
                std::process::exit(1);
            }
        }
        Command::Run => run_worker(pool, config).await,
    }
}

/// Explicitly wired dependency graph; no globals beyond the process config.
struct App {
    connections: ConnectionRepository,
    engine: Arc<SyncEngine>,
    modifiers: Arc<ModifierEngine>,
    webhooks: Arc<WebhookManager>,
    bus: Bus,
    states: SyncStateRepository,
    bodies: MailBodyRepository,
    modifier_repo: ModifierRepository,
}

impl App {
    fn build(pool: sqlx::PgPool, config: &AppConfig) -> Self {
        let connections = ConnectionRepository::new(pool.clone());
        let emails = EmailRepository::new(pool.clone());
        let bodies = MailBodyRepository::new(pool.clone(), config.body_store.clone());
        let states = SyncStateRepository::new(pool.clone());
        let modifier_repo = ModifierRepository::new(pool.clone());
        let webhook_repo = WebhookRepository::new(pool.clone());
        let bus = Bus::new(pool.clone());
        let realtime = Arc::new(Broadcaster::new(config.realtime.subscriber_buffer));

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .user_agent("sync-worker/0.1")
            .build()
            .expect("failed to build HTTP client");
        let oauth = Arc::new(OAuthService::new(
            connections.clone(),
            http,
            config.oauth.clone(),
        ));
        let providers = ProviderRegistry::new().expect("failed to build provider registry");

        let webhooks = Arc::new(WebhookManager::new(
            webhook_repo,
            connections.clone(),
            states.clone(),
            oauth.clone(),
            providers.clone(),
            bus.clone(),
            realtime.clone(),
            config.webhook.clone(),
        ));

        let engine = Arc::new(SyncEngine::new(
            pool.clone(),
            connections.clone(),
            emails.clone(),
            bodies.clone(),
            states.clone(),
            modifier_repo.clone(),
            oauth.clone(),
            providers.clone(),
            webhooks.clone(),
            bus.clone(),
            realtime.clone(),
            config.sync.clone(),
        ));

        let modifiers = Arc::new(ModifierEngine::new(
            pool,
            modifier_repo.clone(),
            emails,
            connections.clone(),
            oauth,
            providers,
            bus.clone(),
            realtime.clone(),
            config.sync.max_retries,
        ));

        Self {
            connections,
            engine,
            modifiers,
            webhooks,
            bus,
            states,
            bodies,
            modifier_repo,
        }
    }
}

async fn run_worker(pool: sqlx::PgPool, config: AppConfig) {
    log::info!("starting sync worker");
    let shutdown = CancellationToken::new();
    let app = App::build(pool, &config);

    // Startup reconciliation: every connected account gets a live channel.
    if let Err(err) = app.webhooks.reconcile().await {
        log::warn!("webhook reconciliation failed: {}", err);
    }

    let worker_pool = WorkerPool::new(config.worker.clone(), shutdown.clone());
    let dispatcher = Arc::new(Dispatcher::new(
        app.engine.clone(),
        app.modifiers.clone(),
        app.bus.clone(),
        JobTimeouts::new(&config.worker),
    ));

    let consumer = BusConsumer::new(
        app.bus.clone(),
        worker_pool.clone(),
        dispatcher,
        config.consumer.clone(),
        shutdown.clone(),
    );
    let consumer_handle = tokio::spawn(consumer.run());

    if config.run_schedulers {
        Schedulers::new(
            app.states.clone(),
            app.bodies.clone(),
            app.modifier_repo.clone(),
            app.webhooks.clone(),
            app.bus.clone(),
            config.sync.clone(),
            shutdown.clone(),
        )
        .spawn_all();
    }

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for shutdown signal");
    log::info!("shutdown signal received, draining");

    // Stop schedulers and the consumer, then let in-flight jobs finish.
    // Un-acked bus records become pending and the next process claims them.
    shutdown.cancel();
    let _ = consumer_handle.await;
    worker_pool.drain(config.shutdown.grace_period).await;

    log::info!("sync worker stopped");
}
