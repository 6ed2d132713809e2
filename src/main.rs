use admission_gateway::completion::QueuedCompletion;
use admission_gateway::config::{AdmissionConfig, Args, BotConfig};
use admission_gateway::effects::AlgoliaSearch;
use admission_gateway::entitlement::{
    EntitlementResolver, EntitlementStore, InMemoryEntitlementStore, RestEntitlementStore,
};
use admission_gateway::load_balancer::{LoadBalancer, health_checker};
use admission_gateway::models::CompletionJob;
use admission_gateway::state::AppState;
use admission_gateway::transport::TelegramTransport;
use admission_gateway::worker::{UpstreamAuth, WorkerContext, completion_worker};
use admission_gateway::{AdmissionPipeline, Dispatcher, handlers};
use clap::Parser;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "admission_gateway=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let admission_config = Arc::new(AdmissionConfig::from_args(&args)?);
    let bot_config = Arc::new(BotConfig::from_args(&args));

    let client = reqwest::Client::new();

    // completion side: backends, health checks, queue worker
    let load_balancer = Arc::new(LoadBalancer::new(&args.backends)?);
    tokio::spawn(health_checker(
        Arc::clone(&load_balancer),
        client.clone(),
        Duration::from_secs(args.health_interval),
        args.health_path.clone(),
    ));

    let (job_tx, job_rx) = mpsc::channel::<CompletionJob>(100);
    let worker_ctx = WorkerContext {
        client: client.clone(),
        load_balancer,
        cache: Arc::new(DashMap::new()),
        ttl: Duration::from_secs(args.cache_ttl),
        auth: UpstreamAuth {
            bearer_token: args.bearer_token.clone(),
            api_key: args.llm_api_key.clone(),
        },
    };
    tokio::spawn(completion_worker(job_rx, worker_ctx, args.max_inflight));

    // entitlement store
    let store: Arc<dyn EntitlementStore> = match &args.store_url {
        Some(url) => {
            info!("Entitlements stored at {}", url);
            Arc::new(RestEntitlementStore::new(
                client.clone(),
                url,
                &args.store_table,
                args.store_key.clone(),
            ))
        }
        None => {
            warn!("No entitlement store configured, keeping entitlements in memory");
            Arc::new(InMemoryEntitlementStore::new())
        }
    };
    let resolver = EntitlementResolver::new(store, admission_config.store_timeout);
    let pipeline = AdmissionPipeline::new(Arc::clone(&admission_config), resolver);

    let transport = Arc::new(TelegramTransport::new(
        client.clone(),
        &args.telegram_api_url,
        &args.telegram_token,
    ));
    let mut dispatcher = Dispatcher::new(
        pipeline,
        bot_config,
        Arc::new(QueuedCompletion::new(job_tx)),
        transport,
    );
    match (&args.search_app_id, &args.search_index) {
        (Some(app_id), Some(index)) => {
            info!("Effect search on index {}", index);
            dispatcher = dispatcher.with_effects(Arc::new(AlgoliaSearch::new(
                client.clone(),
                app_id,
                args.search_api_key.clone(),
                index,
            )));
        }
        _ => warn!("No effect search configured, /fx will apologise"),
    }

    let state = Arc::new(AppState {
        dispatcher,
        webhook_secret: args.webhook_secret.clone(),
    });

    // drop rate limiter keys nobody has used for a while
    let sweep_state = Arc::clone(&state);
    let sweep_every = admission_config.ask_limit.window.max(admission_config.info_limit.window);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_every);
        loop {
            ticker.tick().await;
            let evicted = sweep_state.dispatcher.pipeline().sweep_idle(Instant::now());
            if evicted > 0 {
                info!("Evicted {} idle rate limit keys", evicted);
            }
        }
    });

    let app = handlers::router(state);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Gateway listening on http://{}", addr);
    info!("Bot username: @{}", args.bot_username.trim_start_matches('@'));
    info!("Completion cache TTL: {} seconds", args.cache_ttl);
    axum::serve(listener, app).await?;

    Ok(())
}
