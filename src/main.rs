use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod app;
mod cli;
mod config;
mod detector;
mod eid;
mod items;
mod metadata;
mod normalize;
mod platforms;
mod queue;
mod scrape;
mod storage;
#[cfg(test)]
mod tests;

use app::{ingest::ChatMessage, task_runner::Worker, AppContext};
use config::Config;
use eid::Eid;
use items::ItemQuery;

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();
    let mut config = Config::load()?;

    match args.command {
        cli::Command::Worker {} => {
            let ctx = Arc::new(AppContext::build(config, args.memory)?);
            let worker = Worker::new(ctx);

            let shutdown = worker.shutdown_handle();
            ctrlc::set_handler(move || {
                log::info!("received shutdown signal, finishing in-flight jobs");
                shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
            })
            .context("failed to set Ctrl+C handler")?;

            worker.run();
        }

        cli::Command::Detect { text } => {
            let ctx = AppContext::build(config, true)?;
            print_json(&ctx.detector.detect_urls(&text))?;
        }

        cli::Command::Check { url } => {
            let ctx = AppContext::build(config, true)?;
            let url = normalize::normalize_url(&url)?;
            print_json(&serde_json::json!({
                "platform": ctx.detector.platform_for(&url),
                "supported": ctx.detector.is_supported(&url),
                "url": url,
            }))?;
        }

        cli::Command::Meta { url, no_headless } => {
            if no_headless {
                config.scrape.headless = false;
            }
            let ctx = AppContext::build(config, true)?;
            let url = normalize::normalize_url(&url)?;
            print_json(&ctx.pipeline.extract(&url))?;
        }

        cli::Command::Ingest {
            text,
            server,
            channel,
            message,
            bot,
        } => {
            let ctx = AppContext::build(config, args.memory)?;
            let report = ctx.ingest_message(&ChatMessage {
                server_id: server,
                channel_id: channel,
                message_id: message.unwrap_or_else(|| Eid::new().to_string()),
                author_is_bot: bot,
                content: text,
                posted_at: None,
            })?;
            print_json(&report)?;
        }

        cli::Command::Resubmit { item_id } => {
            let ctx = AppContext::build(config, args.memory)?;
            print_json(&ctx.resubmit(&Eid::from(item_id))?)?;
        }

        cli::Command::Items {
            status,
            server,
            limit,
        } => {
            let ctx = AppContext::build(config, args.memory)?;
            print_json(&ctx.items.list(ItemQuery {
                server_id: server,
                status,
                platform: None,
                limit,
            })?)?;
        }

        cli::Command::Stats { kind } => {
            let ctx = AppContext::build(config, args.memory)?;
            print_json(&ctx.queue.stats(kind)?)?;
        }

        cli::Command::DeadLetters { kind, limit } => {
            let ctx = AppContext::build(config, args.memory)?;
            print_json(&ctx.queue.dead_letters(kind, limit)?)?;
        }

        cli::Command::Platforms {} => {
            let ctx = AppContext::build(config, true)?;
            print_json(&serde_json::json!({
                "detection_order": ctx.detector.supported_platforms(),
                "platforms": ctx.registry.get_all_by_priority()?,
            }))?;
        }
    }

    Ok(())
}
