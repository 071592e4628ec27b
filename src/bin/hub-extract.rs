//! One-shot extraction: run a single message through the configured backend
//! and print the decision as JSON.
//!
//! The body is read from stdin when piped; otherwise a built-in field-trip
//! notice is used.
//!
//! ```text
//! GROQ_API_KEY=gsk_... hub-extract
//! echo "Picture day is this Friday" | GROQ_API_KEY=gsk_... hub-extract
//! ```

use std::io::IsTerminal;

use chrono::Utc;
use tokio::io::AsyncReadExt;

use hub_processor::config::ProcessorConfig;
use hub_processor::llm::create_provider;
use hub_processor::pipeline::{Extractor, InboundMessage};

const FIXTURE_ID: &str = "test-usa-001";

const FIXTURE_BODY: &str = "Subject: 4th Grade Field Trip - Museum of Science
Dear Parents,
Our field trip is officially scheduled for next Wednesday.
Please ensure students arrive at 8:15 AM for boarding.
Lunch is provided, but students should bring a water bottle.";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = ProcessorConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    let body = read_body().await?;
    let now = Utc::now();
    let message = InboundMessage {
        id: if body.is_none() { FIXTURE_ID.into() } else { format!("stdin-{}", now.timestamp()) },
        body: body.unwrap_or_else(|| FIXTURE_BODY.to_string()),
        sender: String::new(),
        subject: String::new(),
        received_at: now,
    };

    let llm = create_provider(&config.llm)?;
    let extractor = Extractor::new(llm, config.extractor);

    eprintln!("--- Sending message {} to {} ---", message.id, config.llm.model);
    let decision = extractor.extract(&message, now).await.unwrap_or_else(|e| {
        eprintln!("Extraction failed: {e}");
        std::process::exit(1);
    });

    println!("{}", serde_json::to_string_pretty(&decision)?);
    Ok(())
}

/// Piped stdin, if any and non-blank.
async fn read_body() -> std::io::Result<Option<String>> {
    if std::io::stdin().is_terminal() {
        return Ok(None);
    }
    let mut body = String::new();
    tokio::io::stdin().read_to_string(&mut body).await?;
    let trimmed = body.trim();
    Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
}
