//! `wharfd` — boots the State Store, Source Fetcher, Container Driver,
//! Router Binding and Quota Gate, wires them into the Engine, and serves
//! the control-plane HTTP API alongside its control loop.
//!
//! Tracing setup (`EnvFilter` + `fmt` layer over a `tracing_subscriber`
//! registry) and graceful shutdown via `tokio::signal::ctrl_c`; config is
//! loaded through `clap::Parser`.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use wharf::api::{self, AppState};
use wharf::config::Config;
use wharf::driver::{BollardDriver, ContainerDriver};
use wharf::engine::Engine;
use wharf::quota::{QuotaGate, StoreBackedQuotaGate};
use wharf::router::{FileRouterBinding, RouterBinding};
use wharf::source::{GitSourceFetcher, SourceFetcher};
use wharf::store::{SqliteStore, StateStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let filter_layer = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer())
        .init();

    info!(version = %wharf::VERSION, "starting wharfd");

    tokio::fs::create_dir_all(&config.workroot).await?;

    let sqlite_store = Arc::new(SqliteStore::connect(&config.database_url).await?);
    let quota: Arc<dyn QuotaGate> = Arc::new(StoreBackedQuotaGate::new(
        Arc::clone(&sqlite_store),
        config.default_plan_limits(),
    ));
    let store: Arc<dyn StateStore> = sqlite_store;
    let fetcher: Arc<dyn SourceFetcher> = Arc::new(GitSourceFetcher::new());
    let driver: Arc<dyn ContainerDriver> = Arc::new(BollardDriver::connect(&config.container_host)?);
    let router: Arc<dyn RouterBinding> = Arc::new(FileRouterBinding::new(&config.workroot));

    let engine = Engine::new(
        Arc::clone(&store),
        Arc::clone(&fetcher),
        Arc::clone(&driver),
        Arc::clone(&router),
        Arc::clone(&quota),
        config.clone(),
    );

    let shutdown = CancellationToken::new();

    let engine_handle = {
        let engine = Arc::clone(&engine);
        let engine_shutdown = shutdown.clone();
        tokio::spawn(async move { engine.run(engine_shutdown).await })
    };

    let state = AppState {
        store,
        driver,
        quota,
        engine,
        base_domain: config.base_domain.clone(),
    };
    let app = api::build_router(state);

    let addr: SocketAddr = config.bind_address.parse()?;
    info!(%addr, "binding control-plane API");

    let server_shutdown = shutdown.clone();
    let server = axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("received ctrl-c, shutting down");
            server_shutdown.cancel();
        });

    if let Err(err) = server.await {
        error!(%err, "http server error");
    }

    shutdown.cancel();
    let _ = engine_handle.await;

    Ok(())
}
