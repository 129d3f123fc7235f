//! Guardian-Log - DNS anomaly detection for AdGuard Home

mod classifier;
mod config;
mod control;
mod detector;
mod dispatcher;
mod enrichment;
mod error;
mod models;
mod routes;
mod state;
mod store;
mod tasks;
mod upstream;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::classifier::gemini::GeminiClassifier;
use crate::classifier::Classifier;
use crate::config::Config;
use crate::control::ControlSurface;
use crate::detector::Detector;
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::enrichment::WhoisService;
use crate::error::AppError;
use crate::routes::settings::SettingsSnapshot;
use crate::routes::{anomalies, health, settings, stats};
use crate::state::AppState;
use crate::store::Store;
use crate::tasks::{poller, retention};
use crate::upstream::{AdGuardClient, Upstream};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "guardian_log=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Configuration
    let cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    info!("Guardian-Log v{} starting", env!("CARGO_PKG_VERSION"));
    info!(url = %cfg.upstream_url, "Upstream AdGuard Home");
    info!(
        interval_secs = cfg.poll_interval.as_secs(),
        page_size = cfg.poll_page_size,
        "Poll settings"
    );
    info!(path = %cfg.db_path, "Database");

    // Open storage
    let store = match Store::open(&cfg.db_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "Failed to open storage");
            std::process::exit(1);
        }
    };

    // Upstream client
    let upstream: Arc<dyn Upstream> = match AdGuardClient::new(
        &cfg.upstream_url,
        &cfg.upstream_user,
        &cfg.upstream_password,
    ) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(error = %e, "Failed to build upstream client");
            std::process::exit(1);
        }
    };

    // Startup probe: bad credentials are fatal, an unreachable upstream is
    // retried by the polling loop
    match upstream.probe().await {
        Ok(()) => info!("Connected to AdGuard Home"),
        Err(AppError::Unauthorized(msg)) => {
            error!(error = %msg, "Upstream rejected credentials");
            std::process::exit(1);
        }
        Err(e) => warn!(error = %e, "Upstream not reachable yet, polling will retry"),
    }

    // Optional classification pipeline
    let (dispatcher, whois) = if cfg.llm_enabled {
        info!(provider = %cfg.llm_provider, "LLM analysis enabled");

        let provider: Arc<dyn Classifier> = match cfg.llm_provider.as_str() {
            "gemini" => {
                match GeminiClassifier::new(&cfg.gemini_api_key, &cfg.gemini_model, cfg.llm_timeout)
                {
                    Ok(classifier) => {
                        info!(model = %cfg.gemini_model, "Gemini provider initialized");
                        Arc::new(classifier)
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to initialize Gemini provider");
                        std::process::exit(1);
                    }
                }
            }
            other => {
                error!(provider = %other, "Unsupported LLM provider");
                std::process::exit(1);
            }
        };

        let whois = Arc::new(WhoisService::new(Arc::clone(&store)));
        let dispatcher = Arc::new(Dispatcher::new(
            provider,
            Arc::clone(&whois),
            Arc::clone(&store),
            DispatcherConfig {
                batch_size: cfg.llm_batch_size,
                flush_interval: cfg.llm_flush_interval,
                inter_batch_delay: cfg.llm_batch_delay,
                ..DispatcherConfig::default()
            },
        ));
        (Some(dispatcher), Some(whois))
    } else {
        info!("LLM analysis disabled");
        (None, None)
    };

    let detector = Arc::new(Detector::new(Arc::clone(&store), dispatcher.clone()));

    // Process-wide shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                let _ = shutdown_tx.send(true);
            }
        });
    }

    // Spawn background tasks; the handles are joined during shutdown so the
    // pipeline only drains after both have exited
    // 1. Poller - feeds query log records to the detector
    let poller_handle = {
        let upstream = Arc::clone(&upstream);
        let detector = Arc::clone(&detector);
        let shutdown_rx = shutdown_rx.clone();
        let interval = cfg.poll_interval;
        let page_size = cfg.poll_page_size;
        tokio::spawn(async move {
            poller::poller_task(upstream, detector, interval, page_size, shutdown_rx).await;
        })
    };

    // 2. Retention - prunes old processed-query marks
    let retention_handle = {
        let store = Arc::clone(&store);
        let shutdown_rx = shutdown_rx.clone();
        let retention = cfg.processed_retention;
        tokio::spawn(async move {
            retention::retention_task(store, retention, shutdown_rx).await;
        })
    };

    // Build router
    let control = Arc::new(ControlSurface::new(
        Arc::clone(&store),
        Arc::clone(&upstream),
        dispatcher.clone(),
        whois,
    ));
    let app_state = AppState::new(control, SettingsSnapshot::from_config(&cfg));

    let app = Router::new()
        .route("/api/anomalies", get(anomalies::list))
        .route("/api/anomalies/{id}/approve", post(anomalies::approve))
        .route("/api/anomalies/{id}/block", post(anomalies::block))
        .route("/api/stats", get(stats::stats))
        .route("/api/settings", get(settings::settings))
        .route("/api/health", get(health::health))
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    info!(addr = %cfg.listen_addr, "API server listening");

    let listener = match tokio::net::TcpListener::bind(cfg.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, addr = %cfg.listen_addr, "Failed to bind listener");
            std::process::exit(1);
        }
    };

    let shutdown_signal = {
        let mut shutdown_rx = shutdown_rx.clone();
        async move {
            let _ = shutdown_rx.wait_for(|stopped| *stopped).await;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
    {
        error!(error = %e, "API server error");
    }

    // Shutdown sequence: the poller finishes its in-flight page (so no
    // submission races the drain) and the retention task finishes any
    // in-flight sweep, then the dispatcher drains one final batch, then
    // the store closes. Each step is bounded by the grace period.
    for (name, handle) in [("poller", poller_handle), ("retention", retention_handle)] {
        match tokio::time::timeout(Duration::from_secs(5), handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(task = name, error = %e, "Background task panicked"),
            Err(_) => warn!(task = name, "Background task did not stop within grace period"),
        }
    }

    if let Some(dispatcher) = dispatcher {
        if tokio::time::timeout(Duration::from_secs(5), dispatcher.stop())
            .await
            .is_err()
        {
            warn!("Dispatcher drain exceeded grace period");
        }
    }
    if let Err(e) = store.flush() {
        error!(error = %e, "Failed to flush storage");
    }
    info!("Shutdown complete");
}
