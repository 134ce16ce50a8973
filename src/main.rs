use clap::Parser;
use prensa_gateway::cli::{Args, Command, ConfigDiscovery};
use prensa_gateway::gateway::{AIGateway, GatewayError, GenerateOptions, HttpUpstream};
use prensa_gateway::storage::{GatewayStore, JsonFileStore, MemoryStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "prensa_gateway=info".into()),
        )
        .init();

    let args = Args::parse();

    let file_config = match &args.config {
        Some(path) => ConfigDiscovery::load(path)?,
        None => ConfigDiscovery::discover()?,
    };

    let store: Arc<dyn GatewayStore> = if args.ephemeral {
        Arc::new(MemoryStore::new())
    } else {
        let data_dir = args
            .data_dir
            .clone()
            .or(file_config.data_dir.clone())
            .unwrap_or_else(|| PathBuf::from("prensa-gateway-data"));
        Arc::new(JsonFileStore::new(data_dir).await?)
    };

    let gateway_config = file_config.gateway;
    let upstream = Arc::new(HttpUpstream::new(gateway_config.upstream.clone())?);
    let gateway = AIGateway::new(gateway_config, upstream, store);

    let user = args.user.as_deref();

    match args.command {
        Command::Categorize {
            title,
            content,
            url,
        } => {
            let result = gateway.categorize(&title, &content, &url, user).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Rewrite { title, content } => {
            let result = gateway.rewrite(&title, &content, user).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Search { query } => {
            let result = gateway.search(&query, user).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Generate {
            prompt,
            max_tokens,
            model,
        } => {
            let options = GenerateOptions {
                max_tokens,
                model,
                temperature: None,
            };
            let text = gateway.generate_text(&prompt, options, user).await?;
            println!("{text}");
        }
        Command::Title { content } => {
            let result = gateway.title_and_summary(&content, user).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Stats { days } => {
            let today = gateway.today_stats().await?;
            println!(
                "hoy ({}): {} operaciones, {} tokens, ${:.4}",
                today.date, today.operations, today.total_tokens, today.total_cost
            );
            for (operation, stats) in &today.by_operation {
                println!(
                    "  {operation}: {} operaciones, {} tokens, ${:.4}",
                    stats.operations, stats.total_tokens, stats.total_cost
                );
            }
            if days > 1 {
                let metrics = gateway.metrics(days).await?;
                println!(
                    "últimos {} días: {} operaciones, {} tokens, ${:.4}, cache {:.0}%",
                    metrics.period_days,
                    metrics.operations,
                    metrics.total_tokens,
                    metrics.total_cost,
                    metrics.cache_hit_rate * 100.0
                );
            }
            let cache = gateway.cache_stats();
            println!(
                "cache: {} hits, {} misses, {} entradas",
                cache.hits, cache.misses, cache.entries
            );
        }
        Command::Quota { user_id, set_limit } => {
            if let Some(limit) = set_limit {
                gateway.set_daily_limit(&user_id, limit).await?;
                info!(user = %user_id, limit, "daily limit updated");
            }
            match gateway.check_quota(&user_id).await {
                Ok(balance) => println!("{}", serde_json::to_string_pretty(&balance)?),
                Err(err @ GatewayError::QuotaExceeded { .. }) => {
                    let balance = gateway.quota_balance(&user_id).await?;
                    println!("{}", serde_json::to_string_pretty(&balance)?);
                    println!("aviso: {err}");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Command::CacheClear => {
            gateway.clear_cache();
            println!("cache vaciada");
        }
    }

    // Flush buffered usage entries before exiting.
    gateway.shutdown().await?;
    Ok(())
}
