use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use grntest_runner::{collect_tests, EventBus, Reporter, Scheduler, TesterConfig};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "grntest=info,grntest_runner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // --- Configuration ---
    let config = match TesterConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("grntest: {e}");
            return ExitCode::FAILURE;
        }
    };
    tracing::debug!(
        groonga = %config.groonga.display(),
        interface = ?config.interface,
        n_workers = config.n_workers,
        "Loaded tester configuration"
    );

    // --- Tests ---
    let mut paths: Vec<PathBuf> = std::env::args_os().skip(1).map(PathBuf::from).collect();
    if paths.is_empty() {
        paths.push(PathBuf::from("."));
    }
    let entries = match collect_tests(&config.base_directory, &paths) {
        Ok(entries) => entries,
        Err(e) => {
            eprintln!("grntest: {e}");
            return ExitCode::FAILURE;
        }
    };

    // --- Run ---
    let interrupt = CancellationToken::new();
    let watcher = tokio::spawn({
        let interrupt = interrupt.clone();
        async move {
            tokio::select! {
                () = shutdown_signal() => interrupt.cancel(),
                () = interrupt.cancelled() => {}
            }
        }
    });

    let bus = Arc::new(EventBus::for_config(&config));
    let reporter = tokio::spawn(Reporter::new(std::io::stdout()).run(bus.subscribe()));
    let scheduler = Scheduler::new(Arc::new(config), Arc::clone(&bus), interrupt.clone());
    let result = scheduler.run(entries).await;

    if let Err(e) = reporter.await {
        tracing::error!(error = %e, "reporter task failed");
    }
    // Unblock the watcher when the run ends without a signal.
    interrupt.cancel();
    let _ = watcher.await;

    if result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Wait for SIGINT or, on Unix, SIGTERM. Running tests finish; queued
/// tests are skipped.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT (Ctrl-C), stopping after running tests"),
        () = terminate => tracing::info!("Received SIGTERM, stopping after running tests"),
    }
}
