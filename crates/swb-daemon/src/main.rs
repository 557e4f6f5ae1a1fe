//! swb-daemon entry point.
//!
//! This file is intentionally thin: it sets up tracing, loads config, wires
//! the pipeline, spawns workers + maintenance tasks, and starts the HTTP
//! server. Route handlers live in `routes.rs`; shared state in `state.rs`.

use std::{net::SocketAddr, path::Path, sync::Arc};

use anyhow::Context;
use axum::http::HeaderValue;
use swb_daemon::{routes, state};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

use swb_buffer::{BufferConfig, TieredBuffer};
use swb_classify::HttpClassifier;
use swb_config::SwitchboardConfig;
use swb_registry::RegistryCache;
use swb_reliability::{CircuitBreakerConfig, CircuitRegistry, RateLimiter, RetryPolicy};
use swb_router::{maintenance, HttpButlerSink, Pipeline, TargetDispatcher};
use swb_telemetry::SwitchboardMetrics;
use swb_triage::RuleCache;

const WORKER_COUNT: usize = 4;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file does
    // not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let (cfg, loaded) = load_config()?;
    info!(config_hash = %loaded.config_hash, "configuration loaded");

    let pool = swb_db::connect_from_env().await?;
    swb_db::migrate(&pool).await?;
    swb_db::ensure_partitions(&pool).await?;

    let metrics = Arc::new(SwitchboardMetrics::new(&cfg.telemetry.namespace));

    let rules = Arc::new(RuleCache::new());
    rules.refresh_if_changed(&pool).await?;

    let registry = Arc::new(RegistryCache::new());
    let discovered =
        swb_registry::discover_roster(&pool, Path::new(&cfg.registry.roster_dir)).await?;
    info!(count = discovered.len(), "roster discovery complete");
    registry.refresh(&pool).await?;

    let classifier = if cfg.classifier.endpoint_url.is_empty() {
        info!("no classifier endpoint configured; escalations use the fallback target");
        None
    } else {
        Some(Arc::new(HttpClassifier::new(
            cfg.classifier.endpoint_url.clone(),
            cfg.classifier.timeout_ms,
        )) as Arc<dyn swb_classify::Classifier>)
    };

    let dispatcher = Arc::new(build_dispatcher(&cfg).with_metrics(Arc::clone(&metrics)));

    let buffer = Arc::new(TieredBuffer::new(BufferConfig {
        max_depth: cfg.buffer.max_depth,
        hard_limit: cfg.buffer.hard_limit,
        starvation_guard: cfg.buffer.starvation_guard,
    }));

    let pipeline = Arc::new(Pipeline::new(
        pool.clone(),
        cfg.clone(),
        Arc::clone(&rules),
        Arc::clone(&registry),
        classifier,
        Arc::clone(&dispatcher),
        buffer,
        Arc::clone(&metrics),
    ));

    for _ in 0..WORKER_COUNT {
        tokio::spawn(Arc::clone(&pipeline).run_worker());
    }

    tokio::spawn(maintenance::run_partition_manager(
        pool.clone(),
        cfg.retention.months,
    ));
    tokio::spawn(maintenance::run_rule_refresher(
        pool.clone(),
        Arc::clone(&rules),
        cfg.triage.refresh_seconds,
    ));
    tokio::spawn(maintenance::run_registry_refresher(
        pool.clone(),
        Arc::clone(&registry),
        cfg.registry.refresh_seconds,
    ));

    let shared = Arc::new(state::AppState::new(pipeline, dispatcher));

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8820)));
    info!("swb-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// Layered config paths from SWB_CONFIG (comma-separated, merge order),
/// defaulting to `config/base.yaml`.
fn load_config() -> anyhow::Result<(SwitchboardConfig, swb_config::LoadedConfig)> {
    let paths_raw =
        std::env::var("SWB_CONFIG").unwrap_or_else(|_| "config/base.yaml".to_string());
    let paths: Vec<&str> = paths_raw.split(',').map(str::trim).collect();
    swb_config::load_switchboard_config(&paths)
}

fn build_dispatcher(cfg: &SwitchboardConfig) -> TargetDispatcher {
    let circuits = Arc::new(CircuitRegistry::new(CircuitBreakerConfig {
        failure_threshold: cfg.circuit.failure_threshold,
        window: std::time::Duration::from_secs(cfg.circuit.window_seconds),
        cooldown: std::time::Duration::from_secs(cfg.circuit.cooldown_seconds),
        half_open_probes: cfg.circuit.half_open_probes,
    }));

    // Tier rates are captured at boot; live rate changes need a restart.
    let rates = cfg.ratelimit.clone();
    let limiter = Arc::new(RateLimiter::new(move |tier| {
        let r = rates.for_tier(tier);
        (r.capacity, r.refill_per_sec)
    }));

    TargetDispatcher::new(
        Arc::new(HttpButlerSink::new()),
        circuits,
        limiter,
        RetryPolicy::new(
            cfg.dispatch.retry_max_attempts,
            cfg.dispatch.retry_base_ms,
            cfg.dispatch.retry_cap_ms,
        ),
        cfg.timeouts.clone(),
    )
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("SWB_DAEMON_ADDR").ok()?.parse().ok()
}

/// CORS: allow only localhost origins (operator tooling runs locally).
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new().allow_origin(origins)
}
