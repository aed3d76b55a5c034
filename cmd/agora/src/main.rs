//! # Agora binary
//!
//! Assembles the application from the adapters compiled in and the settings found at start-up:
//! Postgres when a database url is configured, the in-memory store otherwise.

use std::sync::Arc;

use anyhow::Context;
use api_adapters::{router, ApiMetrics, AppState};
use configs::{DatabaseSettings, LogFormat, LogSettings, Settings};
use domains::{
    Clock, CommentRepo, ConversationId, ConversationRepo, IdentityRepo, MathRepo,
    NotificationRepo, ParticipantRepo, SystemClock, VoteRepo,
};
use services::worker::{self, Schedule, WorkerHandle};
use services::{
    BannedWords, CommentOptions, CommentService, ConversationService, MathCache,
    MathCacheOptions, MathPoller, NotificationOptions, NotificationScheduler, ParticipantOptions,
    ParticipantService, SelectionOptions, SelectionService, VoteService,
};
use storage_adapters::{
    LogMailer, MemoryStore, NoopGeoLocator, NoopLanguageDetector, NoopSpamChecker, NoopTranslator,
};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Every persistence port, served by one backing store.
struct Stores {
    conversations: Arc<dyn ConversationRepo>,
    identities: Arc<dyn IdentityRepo>,
    participants: Arc<dyn ParticipantRepo>,
    votes: Arc<dyn VoteRepo>,
    comments: Arc<dyn CommentRepo>,
    math: Arc<dyn MathRepo>,
    notifications: Arc<dyn NotificationRepo>,
}

impl Stores {
    fn backed_by<S>(store: Arc<S>) -> Self
    where
        S: ConversationRepo
            + IdentityRepo
            + ParticipantRepo
            + VoteRepo
            + CommentRepo
            + MathRepo
            + NotificationRepo
            + 'static,
    {
        Self {
            conversations: store.clone(),
            identities: store.clone(),
            participants: store.clone(),
            votes: store.clone(),
            comments: store.clone(),
            math: store.clone(),
            notifications: store,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("failed to load settings")?;
    init_tracing(&settings.log);

    // 1. Initialize storage
    let stores = open_stores(&settings.database).await?;

    // 2. Initialize services
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mailer = Arc::new(LogMailer);

    let participants = Arc::new(ParticipantService::new(
        stores.participants.clone(),
        Arc::new(NoopGeoLocator),
        clock.clone(),
        ParticipantOptions {
            cache_capacity: settings.participants.cache_capacity,
            join_retries: settings.participants.join_retries,
        },
    ));
    let votes = Arc::new(VoteService::new(
        stores.conversations.clone(),
        stores.identities.clone(),
        stores.participants.clone(),
        stores.votes.clone(),
        clock.clone(),
    ));
    let comments = Arc::new(CommentService::new(
        stores.conversations.clone(),
        stores.comments.clone(),
        stores.notifications.clone(),
        participants.clone(),
        votes.clone(),
        Arc::new(NoopSpamChecker),
        Arc::new(NoopLanguageDetector),
        mailer.clone(),
        clock.clone(),
        BannedWords::new(&settings.moderation.extra_banned_words),
        CommentOptions {
            moderator_notify_min_backlog: settings.moderation.moderator_notify_min_backlog,
            legacy_seed_vote_cutoff: ConversationId(settings.moderation.legacy_seed_vote_cutoff),
            mail_from: settings.server.mail_from.clone(),
            base_url: settings.server.base_url.clone(),
        },
    ));
    let math = Arc::new(MathCache::new(
        stores.math.clone(),
        MathCacheOptions {
            capacity: settings.math.cache_capacity,
            ttl: settings.math.ttl(),
        },
    ));
    let selection = Arc::new(SelectionService::new(
        stores.conversations.clone(),
        stores.comments.clone(),
        math.clone(),
        Arc::new(NoopTranslator),
        SelectionOptions {
            timeout: settings.selection.timeout(),
        },
    ));

    // 3. Start background workers
    let mut workers: Vec<WorkerHandle> = Vec::new();
    if settings.math.poller_enabled {
        let poller = MathPoller::new(math.clone(), stores.math.clone(), settings.math.batch_size);
        workers.push(worker::spawn(
            Arc::new(poller),
            Schedule {
                interval: settings.math.poll_interval(),
                error_backoff: settings.math.error_backoff(),
            },
        ));
    }
    if settings.notifications.enabled {
        let scheduler = NotificationScheduler::new(
            stores.conversations.clone(),
            stores.notifications.clone(),
            mailer,
            clock,
            NotificationOptions {
                backoff: settings.notifications.backoff(),
                mail_from: settings.server.mail_from.clone(),
                base_url: settings.server.base_url.clone(),
            },
        );
        workers.push(worker::spawn(
            Arc::new(scheduler),
            Schedule {
                interval: settings.notifications.poll_interval(),
                error_backoff: settings.notifications.error_backoff(),
            },
        ));
    }

    // 4. Wrap in AppState and serve
    let state = AppState {
        conversations: Arc::new(ConversationService::new(stores.conversations.clone())),
        participants,
        votes,
        comments,
        selection,
        math,
        metrics: Arc::new(ApiMetrics::new()),
    };

    let address = settings.bind_address();
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;
    info!(%address, "agora listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("draining background workers");
    for handle in workers {
        handle.stop().await;
    }
    Ok(())
}

fn init_tracing(settings: &LogSettings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));
    let registry = tracing_subscriber::registry().with(filter);
    match settings.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer().pretty()).init(),
    }
}

#[cfg(feature = "db-postgres")]
async fn open_stores(settings: &DatabaseSettings) -> anyhow::Result<Stores> {
    use secrecy::ExposeSecret;
    use storage_adapters::PgStore;

    let Some(url) = settings.url.as_ref() else {
        warn!("no database url configured; state lives in memory and is lost on exit");
        return Ok(Stores::backed_by(Arc::new(MemoryStore::new())));
    };
    let store = PgStore::connect(url.expose_secret(), settings.max_connections)
        .await
        .context("failed to connect to postgres")?;
    if settings.run_migrations {
        store.migrate().await.context("failed to run migrations")?;
    }
    info!(max_connections = settings.max_connections, "connected to postgres");
    Ok(Stores::backed_by(Arc::new(store)))
}

#[cfg(not(feature = "db-postgres"))]
async fn open_stores(settings: &DatabaseSettings) -> anyhow::Result<Stores> {
    if settings.url.is_some() {
        warn!("database url ignored: built without db-postgres");
    }
    Ok(Stores::backed_by(Arc::new(MemoryStore::new())))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
