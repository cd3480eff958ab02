/**
 * OPSDASH KERNEL - Service entry point
 *
 * ROLE : loads the config, builds the core on the shell executor, pre-warms
 * the slow caches and serves the JSON API.
 */

use anyhow::Context;
use opsdash_kernel::clock::system_clock;
use opsdash_kernel::config::load_config;
use opsdash_kernel::executor::ShellExecutor;
use opsdash_kernel::http::{build_router, AppState};
use opsdash_kernel::identity::RoleBook;
use opsdash_kernel::OpsCore;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("opsdash_kernel=info")))
        .init();

    let cfg = load_config().await;
    tokio::fs::create_dir_all(&cfg.data_dir)
        .await
        .with_context(|| format!("creating data dir {:?}", cfg.data_dir))?;

    let roles = Arc::new(RoleBook::load(&cfg.roles_file).await);
    let addr = format!("{}:{}", cfg.host, cfg.port);
    let core = Arc::new(OpsCore::open(cfg, Arc::new(ShellExecutor), system_clock()).await);
    core.prewarm();

    let app = build_router(AppState { core, roles });
    let listener = TcpListener::bind(&addr).await.with_context(|| format!("binding {addr}"))?;
    info!("[kernel] listening on http://{addr}");
    axum::serve(listener, app).await.context("http server")?;
    Ok(())
}
