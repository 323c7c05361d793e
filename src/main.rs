//! Regula server daemon
//!
//! Starts the kernel (bus, router, cache, optimizer, engine) and serves the
//! HTTP surface. Worker executors are registered by the embedding
//! deployment; the kernel runs and schedules regardless.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use regula::cache::CacheStore;
use regula::config::KernelConfig;
use regula::engine::WorkflowEngine;
use regula::messaging::{MessageBus, QueueRouter};
use regula::observability::init_tracing;
use regula::optimizer::RequestOptimizer;
use regula::server::{create_app, KernelHandles};

#[derive(Debug, Parser)]
#[command(name = "regula", about = "Regulatory document extraction kernel")]
struct Args {
    /// Socket address for the HTTP surface
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: String,

    /// Directory for the cache file layer
    #[arg(long, default_value = "cache")]
    cache_dir: PathBuf,

    /// Emit JSON logs
    #[arg(long)]
    log_json: bool,

    /// Use the development preset instead of production
    #[arg(long)]
    dev: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let base = if args.dev {
        KernelConfig::development()
    } else {
        KernelConfig::production()
    };
    let mut config = base;
    config.server.listen = args.listen;
    config.cache.file_dir = args.cache_dir;
    config.validate()?;

    info!(listen = %config.server.listen, "starting regula kernel");

    let bus = Arc::new(MessageBus::new());
    let router = Arc::new(QueueRouter::new(Arc::clone(&bus)));
    let cache = Arc::new(CacheStore::new(config.cache.clone()));
    cache.start().await;
    let optimizer = Arc::new(RequestOptimizer::new(
        config.optimizer.clone(),
        Arc::clone(&cache),
    ));
    let engine = Arc::new(WorkflowEngine::new(
        config.engine.clone(),
        Arc::clone(&bus),
        Arc::clone(&router),
    ));
    engine.start().await;

    let app = create_app(KernelHandles {
        engine: Arc::clone(&engine),
        bus: Arc::clone(&bus),
        router,
        cache: Arc::clone(&cache),
        optimizer,
    });
    let listener = TcpListener::bind(&config.server.listen).await?;
    info!(listen = %config.server.listen, "http surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("shutting down");
    engine.stop().await;
    cache.stop().await;
    bus.shutdown().await;
    Ok(())
}
