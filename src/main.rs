use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use lead_pipeline::classifier::{LlmExtractor, LlmTriageClassifier, RulesEngine};
use lead_pipeline::config::PipelineConfig;
use lead_pipeline::llm::create_provider;
use lead_pipeline::logging::{init_tracing_subscriber, install_tracing_panic_hook};
use lead_pipeline::mail::ImapMailSource;
use lead_pipeline::pipeline::{Collaborators, Pipeline, PipelineSettings};
use lead_pipeline::store::JsonlRecordSink;

const APP_NAME: &str = "lead-pipeline";

/// How long each task gets to finish its current job on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine; the environment may already be populated.
    let _ = dotenvy::dotenv();

    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    init_tracing_subscriber(APP_NAME);
    install_tracing_panic_hook(APP_NAME);

    let config = PipelineConfig::from_env().context("Invalid configuration")?;

    eprintln!("📬 Lead Pipeline v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Mailbox: {}@{}:{}/{}",
        config.mail.username, config.mail.imap_host, config.mail.imap_port, config.mail.mailbox
    );
    eprintln!("   Triage model: {}", config.triage_llm.model);
    eprintln!("   Extractor model: {}", config.extractor_llm.model);
    eprintln!("   Output: {}", config.output_path.display());
    match config.poll_interval {
        Some(interval) => eprintln!("   Polling every {}s\n", interval.as_secs()),
        None => eprintln!("   Single ingestion run\n"),
    }

    // ── LLM ─────────────────────────────────────────────────────────────
    let triage_llm = create_provider(&config.triage_llm)?;
    let extractor_llm = create_provider(&config.extractor_llm)?;

    let mut rules = RulesEngine::default_rules();
    for pattern in &config.always_classify {
        rules.add_always_classify(pattern)?;
    }
    let triage = Arc::new(LlmTriageClassifier::new(
        triage_llm,
        rules,
        config.classifier_timeout,
    ));
    let extractor = Arc::new(LlmExtractor::new(extractor_llm, config.classifier_timeout));

    // ── Persistence ─────────────────────────────────────────────────────
    let sink = Arc::new(
        JsonlRecordSink::open(&config.output_path)
            .await
            .with_context(|| format!("Failed to open {}", config.output_path.display()))?,
    );

    // ── Pipeline ────────────────────────────────────────────────────────
    let pipeline = Pipeline::new(
        Collaborators {
            source: Arc::new(ImapMailSource::new(config.mail.clone())),
            triage,
            extractor,
            customers: sink.clone(),
            sink,
        },
        PipelineSettings::from(&config),
    );
    let running = pipeline.spawn();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!(
        incoming = pipeline.queues().incoming().len(),
        deep_extraction = pipeline.queues().deep_extraction().len(),
        "Shutdown requested; queued jobs are not persisted"
    );

    running.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}
