use anyhow::{Context, Result};
use clap::Parser;
use myops_common::shutdown::shutdown_signal;

mod agent;
mod args;
mod backup;
mod bootstrap;
mod configure;
mod db;
mod initialize;
mod report;
mod role;
mod server;
mod start;
mod user_db;

use agent::{Mylet, data_dir};
use args::Args;

#[tokio::main]
async fn main() -> Result<()> {
    myops_common::init();
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let mylet = Mylet::fetch(&args).await.context("fetch")?;
    run(mylet, args).await
}

async fn run(mylet: Mylet, args: Args) -> Result<()> {
    mylet.configure().await.context("configure")?;

    // A fresh volume is either initialized from scratch (solo 0) or
    // bootstrapped from a peer's backup.
    let (_, solo) = mylet.view().await;
    if initialize::is_empty(&data_dir(&solo))
        .await
        .context("stat datadir")?
    {
        if solo.spec.id == 0 {
            mylet.initialize().await.context("initialize")?;
        } else {
            mylet.fetch_and_prepare().await.context("fetch and prepare")?;
        }
    }

    let supervisor = {
        let mylet = mylet.clone();
        tokio::spawn(async move {
            let exit = mylet.exit().clone();
            if let Err(e) = mylet.supervise().await {
                myops_common::print_error(e);
            }
            // Whether the restart cap tripped or we were asked to stop,
            // the whole agent winds down with the supervisor.
            exit.cancel();
        })
    };

    tokio::spawn(start::reap_zombies(mylet.exit().clone()));
    tokio::spawn(mylet.clone().probe_loop());
    tokio::spawn(mylet.clone().report_loop());

    let app = axum::Router::new().nest("/api/addons/mylet", server::router(mylet.clone()));
    let listener = tokio::net::TcpListener::bind(&args.http_addr).await?;
    tracing::info!(http_addr = %args.http_addr, solo = %solo.spec.name, "agent listening");

    let exit = mylet.exit().clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown_signal() => {},
                _ = exit.cancelled() => {},
            }
        })
        .await?;

    mylet.exit().cancel();
    let _ = supervisor.await;
    tracing::info!("agent stopped gracefully");
    Ok(())
}
