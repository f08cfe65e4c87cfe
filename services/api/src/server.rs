use crate::cli::ServeArgs;
use crate::infra::{open_store, AppState, EventLog};
use crate::routes::with_review_routes;
use application_review::config::AppConfig;
use application_review::error::AppError;
use application_review::review::{DecisionEngine, JsonExportSource, Poller};
use application_review::telemetry;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let store = open_store(&config.storage)?;
    let events = Arc::new(EventLog::default());
    let engine = DecisionEngine::from_config(Arc::clone(&store), Arc::clone(&events), &config.review);

    engine.clear_pending_undos();
    let recovery = engine.recover().await?;
    info!(
        examined = recovery.examined,
        finalized = recovery.finalized,
        "startup recovery finished"
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let poller = match config.intake.form_export_path.clone() {
        Some(path) => {
            let source = Arc::new(JsonExportSource::new(path));
            let poller =
                Poller::from_config(Arc::clone(&store), Arc::clone(&events), source, &config);
            let mut stop_rx = stop_rx.clone();
            Some(tokio::spawn(poller.run(async move {
                let _ = stop_rx.changed().await;
            })))
        }
        None => {
            warn!("FORM_EXPORT_PATH not set, polling disabled");
            None
        }
    };

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
        events,
    };

    let app = with_review_routes(engine.clone())
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(?config.environment, %addr, "application review service ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    readiness_flag.store(false, Ordering::Release);
    let _ = stop_tx.send(true);
    if let Some(handle) = poller {
        if let Err(err) = handle.await {
            warn!(error = %err, "poller task ended abnormally");
        }
    }
    engine.clear_pending_undos();
    info!("application review service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
