use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use owo_colors::OwoColorize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use drover_engine::args::EngineArgs;
use drover_engine::context::EngineContext;
use drover_engine::db;
use drover_engine::dispatcher;
use drover_engine::drivers::Drivers;
use drover_engine::registry::Environment;
use drover_engine::server;
use drover_engine::service::EngineService;

#[tokio::main]
async fn main() -> Result<()> {
    drover_common::init();

    tracing_subscriber::fmt::init();

    let args = EngineArgs::parse();
    drover_common::metrics::maybe_spawn_metrics_server();

    let pool = drover_common::postgres::create_pool(args.postgres.clone()).await?;
    db::schema::init_schema(&pool).await?;

    let env = Arc::new(Environment::with_builtins()?);
    let drivers = Drivers::in_memory();
    let ctx = EngineContext::new(pool, env, drivers, args.defaults());

    let cancel = CancellationToken::new();
    let handle = dispatcher::start(ctx.clone(), args.workers, cancel.clone()).await?;
    let engine_id = handle.engine_id;

    let service = Arc::new(EngineService::new(ctx));
    let app = server::router(service);
    let addr = format!("0.0.0.0:{}", args.api_port);
    let listener = TcpListener::bind(&addr).await?;
    println!(
        "{}{} {}{}",
        "engine listening • addr=".green(),
        addr.green().dimmed(),
        "engine_id=".green(),
        engine_id.to_string().green().dimmed(),
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            drover_common::shutdown::shutdown_signal().await;
            cancel.cancel();
        })
        .await?;

    handle.join().await;
    tracing::info!("engine stopped");
    Ok(())
}
