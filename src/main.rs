use clap::{Parser, Subcommand};
use newswire::{
    db, CycleScope, EntityExtractor, ExtractionConfig, Feed, FeedFormat, FeedRegistry,
    HttpEntityExtractor, IngestConfig, Scheduler,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "newswire", about = "News feed ingestion and entity-tagging pipeline")]
struct Cli {
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite:newswire.db")]
    database_url: String,

    /// How many feed pipelines may run concurrently
    #[arg(long, env = "NEWSWIRE_CONCURRENCY", default_value_t = 8)]
    concurrency: usize,

    #[arg(long, env = "NEWSWIRE_FETCH_TIMEOUT_SECS", default_value_t = 30)]
    fetch_timeout_secs: u64,

    /// Entity extraction service endpoint; extraction is disabled without it
    #[arg(long, env = "NEWSWIRE_EXTRACTION_URL")]
    extraction_url: Option<String>,

    #[arg(long, env = "NEWSWIRE_EXTRACTION_KEY")]
    extraction_key: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one ingestion cycle and print its summary
    Run {
        /// Limit the cycle to one source's feeds, by source slug
        #[arg(long)]
        source: Option<String>,
        /// Limit the cycle to one feed, by id or URL
        #[arg(long)]
        feed: Option<String>,
    },
    /// Run full cycles on a fixed interval until interrupted
    Watch {
        #[arg(long, default_value_t = 900)]
        interval_secs: u64,
    },
    /// Register a source
    AddSource {
        #[arg(long)]
        name: String,
        #[arg(long)]
        url: String,
        #[arg(long)]
        slug: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Register a feed under an existing source
    AddFeed {
        /// Source slug the feed belongs to
        #[arg(long)]
        source: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        url: String,
        #[arg(long)]
        format: FeedFormat,
        #[arg(long)]
        slug: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Resume polling a feed, by id or URL
    Activate { feed: String },
    /// Pause polling a feed, by id or URL
    Deactivate { feed: String },
    /// Re-run entity extraction for items deferred by earlier cycles
    RetryExtractions,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let pool = db::connect(&cli.database_url).await?;

    let mut config = IngestConfig::default();
    config.concurrency = cli.concurrency;
    config.fetch.timeout = Duration::from_secs(cli.fetch_timeout_secs);

    let extraction = match (cli.extraction_url, cli.extraction_key) {
        (Some(endpoint), Some(api_key)) => Some(ExtractionConfig { endpoint, api_key }),
        (None, None) => None,
        _ => {
            warn!("extraction needs both endpoint and key; extraction disabled");
            None
        }
    };
    let extractor: Option<Arc<dyn EntityExtractor>> = match &extraction {
        Some(cfg) => Some(Arc::new(HttpEntityExtractor::new(cfg)?)),
        None => None,
    };

    let scheduler = Scheduler::new(pool, &config, extractor)?;

    match cli.command {
        Command::Run { source, feed } => {
            let scope = match (source, feed) {
                (Some(_), Some(_)) => anyhow::bail!("--source and --feed are mutually exclusive"),
                (Some(slug), None) => CycleScope::Source(slug),
                (None, Some(ident)) => CycleScope::Feed(ident),
                (None, None) => CycleScope::All,
            };
            let summary = scheduler.run_cycle(&scope).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Watch { interval_secs } => {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!("polling every {}s, ctrl-c to stop", interval_secs.max(1));

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let summary = scheduler.run_cycle(&CycleScope::All).await?;
                        info!("{}", serde_json::to_string(&summary)?);
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("shutting down");
                        break;
                    }
                }
            }
        }
        Command::AddSource {
            name,
            url,
            slug,
            description,
        } => {
            let source = scheduler
                .registry()
                .create_source(&name, &url, slug.as_deref(), description.as_deref())
                .await?;
            println!("{}", serde_json::to_string_pretty(&source)?);
        }
        Command::AddFeed {
            source,
            name,
            url,
            format,
            slug,
            description,
        } => {
            let registry = scheduler.registry();
            let source = registry.get_source_by_slug(&source).await?;
            let feed = registry
                .create_feed(&source, &name, &url, format, slug.as_deref(), description.as_deref())
                .await?;
            println!("{}", serde_json::to_string_pretty(&feed)?);
        }
        Command::Activate { feed } => {
            let feed = resolve_feed(scheduler.registry(), &feed).await?;
            scheduler.registry().set_active(feed.id, true).await?;
        }
        Command::Deactivate { feed } => {
            let feed = resolve_feed(scheduler.registry(), &feed).await?;
            scheduler.registry().set_active(feed.id, false).await?;
        }
        Command::RetryExtractions => {
            let summary = scheduler.retry_deferred().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}

async fn resolve_feed(registry: &FeedRegistry, ident: &str) -> newswire::Result<Feed> {
    match Uuid::parse_str(ident) {
        Ok(id) => registry.get_feed(id).await,
        Err(_) => registry.get_feed_by_url(ident).await,
    }
}
