use std::sync::Arc;

use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use ozone_triage::config::{ClassifierConfig, OzoneConfig, TriageConfig};
use ozone_triage::moderation::OzoneClient;
use ozone_triage::pipeline::{
    Dispatcher, HttpPolicyClassifier, PolicyClassifier, RuleEngine, TriageProcessor,
    TriageScheduler, spawn_triage_scheduler,
};

/// Stderr logging, plus a daily rolling file when `TRIAGE_LOG_DIR` is set.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match std::env::var("TRIAGE_LOG_DIR")
        .ok()
        .filter(|d| !d.trim().is_empty())
    {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "ozone-triage.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(file_layer)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let log_guard = init_tracing();

    eprintln!("🛡️  Ozone Triage v{}", env!("CARGO_PKG_VERSION"));

    // ── Configuration ────────────────────────────────────────────────────
    let ozone_config = OzoneConfig::from_env()?;
    let triage_config = TriageConfig::from_env()?;
    let classifier_config = ClassifierConfig::from_env()?;

    eprintln!("   Service: {}", ozone_config.service_url);
    eprintln!("   Interval: {}s", triage_config.interval.as_secs());
    eprintln!(
        "   Max concurrent actions: {}",
        triage_config.max_concurrent_actions
    );

    let rules = match triage_config.rules_path {
        Some(ref path) => RuleEngine::load(path)?,
        None => RuleEngine::default_rules(),
    };
    info!(rules = rules.len(), "Rule table loaded");

    // ── Moderation session ───────────────────────────────────────────────
    let client = match OzoneClient::login(ozone_config).await {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "Failed to establish moderator session");
            drop(log_guard);
            std::process::exit(1);
        }
    };

    // ── Escalation ───────────────────────────────────────────────────────
    let classifier = match classifier_config {
        Some(config) => {
            let classifier: Arc<dyn PolicyClassifier> = Arc::new(HttpPolicyClassifier::new(config)?);
            Some(classifier)
        }
        None => {
            info!("No classifier endpoint configured, escalation disabled");
            None
        }
    };

    // ── Pipeline ─────────────────────────────────────────────────────────
    let dispatcher = Arc::new(Dispatcher::new(triage_config.max_concurrent_actions));
    let processor = Arc::new(TriageProcessor::new(
        triage_config,
        rules,
        Arc::new(client),
        dispatcher,
        classifier,
    ));
    let (handle, shutdown) = spawn_triage_scheduler(TriageScheduler::new(processor));

    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested, finishing current pass");
                shutdown.trigger();
            }
        });
    }

    match handle.await? {
        Ok(()) => {
            info!("Ozone Triage stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Ozone Triage stopped on fatal error");
            drop(log_guard);
            std::process::exit(1);
        }
    }
}
