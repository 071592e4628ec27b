use std::sync::Arc;

use hub_processor::config::ProcessorConfig;
use hub_processor::llm::create_provider;
use hub_processor::pipeline::{ConsumptionLoop, Extractor};
use hub_processor::shutdown::{Shutdown, os_signal};
use hub_processor::store::{LibSqlStore, MessageStore};
use hub_processor::stream::{InboundStream, RedisStream};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ProcessorConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export GROQ_API_KEY=gsk_...");
        std::process::exit(1);
    });

    eprintln!("📬 Hub Processor v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Model: {} ({})",
        config.llm.model,
        config.llm.backend.name()
    );
    eprintln!("   Stream: redis://{} [{}]", config.stream_addr, config.inbound_topic);
    eprintln!(
        "   HITL threshold: {:.2}",
        config.extractor.hitl_threshold
    );
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Ctrl+C to stop.\n");

    let llm = create_provider(&config.llm)?;

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn MessageStore> = Arc::new(
        LibSqlStore::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {}",
                    config.db_path.display(),
                    e
                );
                std::process::exit(1);
            }),
    );

    // ── Pipeline ─────────────────────────────────────────────────────────
    let stream: Arc<dyn InboundStream> = Arc::new(RedisStream::new(config.stream_addr.clone()));
    let extractor = Arc::new(Extractor::new(llm, config.extractor.clone()));
    let consumer = Arc::new(ConsumptionLoop::new(
        stream,
        extractor,
        store,
        config.inbound_topic.clone(),
        config.shutdown_grace,
    ));

    let shutdown = Shutdown::new();
    let mut handle = {
        let consumer = Arc::clone(&consumer);
        let signal = shutdown.signal();
        tokio::spawn(async move { consumer.run(signal).await })
    };

    let outcome = tokio::select! {
        _ = os_signal() => {
            tracing::info!("Shutting down");
            shutdown.trigger();
            (&mut handle).await
        }
        result = &mut handle => result,
    };

    match outcome {
        Ok(Ok(stats)) => {
            eprintln!(
                "   Processed {} message(s), {} flagged for review.",
                stats.extracted, stats.flagged_for_review
            );
            Ok(())
        }
        Ok(Err(e)) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Error: consumption task failed: {e}");
            std::process::exit(1);
        }
    }
}
