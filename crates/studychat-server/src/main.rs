//! Studychat server binary.
//!
//! # Usage
//!
//! ```bash
//! # Durable log in ./studychat.redb, in-process recency cache
//! studychat-server --db studychat.redb
//!
//! # Redis-backed recency cache
//! studychat-server --redis-url redis://127.0.0.1:6379
//!
//! # Everything in memory (development)
//! studychat-server --memory
//! ```

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use studychat_server::{
    CacheConfig, ChatConfig, ChatService, ConversationHub, MemoryCache, MemoryStorage,
    RecencyCache, RedbStorage, RedisCache, ServerError, Storage, SystemEnv,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Studychat message pipeline server
#[derive(Parser, Debug)]
#[command(name = "studychat-server")]
#[command(about = "Chat message pipeline: durable log, recency cache, read state")]
#[command(version)]
struct Args {
    /// Path to the durable log database
    #[arg(long, default_value = "studychat.redb")]
    db: PathBuf,

    /// Keep the durable log in memory (nothing survives a restart)
    #[arg(long)]
    memory: bool,

    /// Redis URL for the recency cache (in-process cache if omitted)
    #[arg(long)]
    redis_url: Option<String>,

    /// Messages kept per conversation in the recency cache
    #[arg(long, default_value = "100")]
    cache_capacity: usize,

    /// Producer shard embedded in issued message ids (0-15)
    #[arg(long, default_value = "0")]
    shard_id: u8,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("Studychat server starting");

    let config = ChatConfig {
        cache: CacheConfig { capacity: args.cache_capacity, ..Default::default() },
        shard_id: args.shard_id,
        ..Default::default()
    };

    let cache: Arc<dyn RecencyCache> = match &args.redis_url {
        Some(url) => {
            tracing::info!("Recency cache: redis at {url}");
            Arc::new(RedisCache::connect(url, config.cache.capacity).await?)
        },
        None => {
            tracing::info!("Recency cache: in-process");
            Arc::new(MemoryCache::with_trim_slack(config.cache.capacity, config.cache.trim_slack))
        },
    };

    if args.memory {
        tracing::warn!("Durable log kept in memory - messages are lost on exit");
        serve(MemoryStorage::new(), cache, config).await?;
    } else {
        tracing::info!("Durable log: {}", args.db.display());
        serve(RedbStorage::open(&args.db)?, cache, config).await?;
    }

    Ok(())
}

async fn serve<S: Storage>(
    storage: S,
    cache: Arc<dyn RecencyCache>,
    config: ChatConfig,
) -> Result<(), ServerError> {
    let hub = Arc::new(ConversationHub::default());
    let service = ChatService::start(storage, cache, hub, config, SystemEnv::new()).await?;

    tracing::info!("Ready, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| ServerError::Internal(format!("signal handler failed: {e}")))?;

    service.shutdown().await
}
