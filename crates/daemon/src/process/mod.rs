pub mod utils;

use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{broadcast::error::RecvError, watch};
use tokio::time::timeout;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use common::events::RehostEvent;

const FINAL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

use crate::{ServiceConfig, ServiceState};

/// Handle for gracefully shutting down the daemon service.
pub struct ShutdownHandle {
    graceful_waiter: tokio::task::JoinHandle<()>,
    handles: Vec<tokio::task::JoinHandle<()>>,
    shutdown_tx: watch::Sender<()>,
}

impl ShutdownHandle {
    /// Block until the service shuts down (via signal or explicit shutdown).
    pub async fn wait(self) {
        shutdown_and_join(self.graceful_waiter, self.handles).await;
    }

    /// Trigger shutdown programmatically.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Initialize logging, panic handler, and build info reporting.
/// Returns guards that must be kept alive for the duration of the program.
fn init_logging(
    service_config: &ServiceConfig,
) -> Vec<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::fmt::format::FmtSpan;

    let mut guards = Vec::new();

    // Stdout layer
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    guards.push(stdout_guard);

    let stdout_env_filter = EnvFilter::builder()
        .with_default_directive(service_config.log_level.into())
        .from_env_lossy();

    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(stdout_writer)
        .with_filter(stdout_env_filter);

    // File layer (if log_dir is set)
    if let Some(log_dir) = &service_config.log_dir {
        if let Err(e) = std::fs::create_dir_all(log_dir) {
            eprintln!(
                "Warning: Failed to create log directory {:?}: {}",
                log_dir, e
            );
        }

        let file_appender = tracing_appender::rolling::daily(log_dir, "rehoster.log");
        let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        guards.push(file_guard);

        let file_env_filter = EnvFilter::builder()
            .with_default_directive(service_config.log_level.into())
            .from_env_lossy();

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(file_env_filter);

        tracing_subscriber::registry()
            .with(stdout_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry().with(stdout_layer).init();
    }

    utils::register_panic_logger();
    utils::report_build_info();

    guards
}

/// Create service state from config, exiting on error.
async fn create_state(service_config: &ServiceConfig) -> ServiceState {
    match ServiceState::from_config(service_config).await {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("error creating service state: {}", e);
            std::process::exit(3);
        }
    }
}

/// Wait for shutdown and join all handles with timeout.
async fn shutdown_and_join(
    graceful_waiter: tokio::task::JoinHandle<()>,
    handles: Vec<tokio::task::JoinHandle<()>>,
) {
    let _ = graceful_waiter.await;

    if timeout(FINAL_SHUTDOWN_TIMEOUT, join_all(handles))
        .await
        .is_err()
    {
        tracing::error!(
            "Failed to shut down within {} seconds",
            FINAL_SHUTDOWN_TIMEOUT.as_secs()
        );
        std::process::exit(4);
    }
}

fn report_event(event: &RehostEvent) {
    match event {
        RehostEvent::NewNode {
            public_key,
            description,
            refs,
        } => tracing::info!(key = %public_key, ?description, refs, "rehosting"),
        RehostEvent::DeletedNode {
            public_key, refs, ..
        } => tracing::info!(key = %public_key, refs, "stopped rehosting"),
        RehostEvent::NodeUpdate { public_key, length } => {
            tracing::debug!(key = %public_key.short(), length, "log grew")
        }
        RehostEvent::NodeFullyDownloaded { public_key, length } => {
            tracing::debug!(key = %public_key.short(), length, "log fully downloaded")
        }
        RehostEvent::InvalidKey {
            invalid_key,
            parent,
        } => tracing::warn!(parent = %parent.short(), len = invalid_key.len(), "ignoring invalid key"),
        RehostEvent::InvalidValue { parent, key, error } => {
            tracing::warn!(parent = %parent.short(), key = %key.short(), %error, "ignoring invalid entry")
        }
        RehostEvent::Synced { entries } => tracing::info!(entries, "rehost set synced"),
        RehostEvent::Error(err) => tracing::error!(%err, "rehoster error"),
    }
}

/// Report rehoster events until shutdown, then close the rehoster
async fn run_rehoster(state: ServiceState, mut shutdown_rx: watch::Receiver<()>) {
    let rehoster = state.rehoster().clone();
    let mut events = rehoster.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => report_event(&event),
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "missed rehoster events"),
                Err(RecvError::Closed) => break,
            },
            _ = shutdown_rx.changed() => break,
        }
    }

    tracing::info!("closing rehoster");
    if let Err(e) = rehoster.close().await {
        tracing::error!("error closing rehoster: {}", e);
    }
}

/// Create state and spawn background tasks, returning the state handle.
///
/// The returned `ShutdownHandle` must be kept alive; dropping it does not stop the service.
pub async fn start_service(service_config: &ServiceConfig) -> (ServiceState, ShutdownHandle) {
    let (graceful_waiter, shutdown_tx, shutdown_rx) = utils::graceful_shutdown_blocker();
    let state = create_state(service_config).await;

    let mut handles = Vec::new();

    let rehoster_state = state.clone();
    let rehoster_rx = shutdown_rx.clone();
    handles.push(tokio::spawn(run_rehoster(rehoster_state, rehoster_rx)));

    tracing::info!(
        key = %state.rehoster().own_key(),
        discovery_key = %state.rehoster().own_discovery_key(),
        "Running: rehoster"
    );

    let handle = ShutdownHandle {
        graceful_waiter,
        handles,
        shutdown_tx,
    };

    (state, handle)
}

/// Spawns the daemon service and blocks until a shutdown signal is received.
pub async fn spawn_service(service_config: &ServiceConfig) {
    let _guards = init_logging(service_config);
    let (_, handle) = start_service(service_config).await;
    handle.wait().await;
}
