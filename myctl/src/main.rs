use anyhow::Result;
use clap::Parser;
use myops_common::shutdown::shutdown_signal;

mod args;
mod ctl;
mod group;
#[cfg(feature = "metrics")]
mod metrics;
mod mutate;
mod reconcile;
mod server;
mod switch;

use args::Args;
use ctl::Myctl;

#[tokio::main]
async fn main() -> Result<()> {
    myops_common::init();
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let ctl = Myctl::new();

    let app = axum::Router::new().nest("/api/addons/myctl", server::router(ctl.clone()));
    #[cfg(feature = "metrics")]
    let app = app.route(
        "/metrics",
        axum::routing::get(|| async { metrics::CtlMetrics::gather() }),
    );

    let listener = tokio::net::TcpListener::bind(&args.http_addr).await?;
    tracing::info!(http_addr = %args.http_addr, "coordinator listening");
    ctl.probes().set_startup(true);

    let controller = if args.no_controller {
        tracing::warn!("controller disabled; serving the HTTP surface only");
        None
    } else {
        let client = kube::Client::try_default().await?;
        let ctl = ctl.clone();
        let namespace = args.namespace.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = reconcile::run(client, ctl, namespace).await {
                tracing::error!(error = %e, "controller exited");
            }
        }))
    };

    ctl.probes().set_liveness(true);
    ctl.probes().set_readiness(true);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    ctl.stop_all().await;
    if let Some(task) = controller {
        task.abort();
    }
    tracing::info!("coordinator stopped gracefully");
    Ok(())
}
