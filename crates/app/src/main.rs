mod cli;
mod render;

use anyhow::{Context, Result};
use chat_host::{ChatSession, TurnOutcome, TurnSettings};
use clap::Parser;
use cli::Args;
use providers::LlmClient;
use render::TerminalRenderer;
use shared::config::AppConfig;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so replies on stdout stay clean.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = AppConfig::load(args.config.as_deref());
    if let Some(endpoint) = &args.endpoint {
        config.api.endpoint = endpoint.clone();
    }

    let client = LlmClient::connect(&config)
        .await
        .context("failed to create LLM client")?;
    let session = ChatSession::new(Arc::new(client), &config);
    let settings = turn_settings(&args, &config).await?;

    tracing::info!(
        session = %session.id(),
        model = %session.client().validate_model(&settings.model),
        stream = settings.stream,
        "ready"
    );

    let mut renderer = TerminalRenderer::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let input = line.trim();
        match input {
            "" => continue,
            "/quit" | "/exit" => break,
            "/reset" => {
                session.reset();
                eprintln!("history cleared");
                continue;
            }
            "/models" => {
                let registry = session.client().registry();
                eprintln!("models ({:?}):", registry.source());
                for id in registry.models() {
                    eprintln!("  {}", id);
                }
                continue;
            }
            _ => {}
        }

        let wait = session.cooldown_remaining(Instant::now());
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        match session.handle_user_input(input, &settings, &mut renderer).await {
            TurnOutcome::Replied { model, source, .. } => {
                tracing::debug!(%model, ?source, "reply rendered");
            }
            TurnOutcome::Failed { error } => tracing::debug!(%error, "turn failed"),
            TurnOutcome::Busy | TurnOutcome::CoolingDown { .. } => {}
        }
    }

    Ok(())
}

async fn turn_settings(args: &Args, config: &AppConfig) -> Result<TurnSettings> {
    let mut settings = TurnSettings::from_config(config);
    if let Some(model) = &args.model {
        settings.model = model.clone();
    }
    if let Some(temperature) = args.temperature {
        settings.temperature = temperature;
    }
    if let Some(max_tokens) = args.max_tokens {
        settings.max_tokens = max_tokens;
    }
    settings.language = args.language;
    settings.stream = !args.no_stream;

    if let Some(path) = &args.document {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read document {}", path.display()))?;
        tracing::info!(path = %path.display(), chars = text.chars().count(), "answering from document");
        settings.document = Some(text);
    }
    Ok(settings)
}
