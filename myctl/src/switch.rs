use std::time::Duration;

use anyhow::{Result, bail};
use futures::future::join_all;
use myops_types::Envelope;

/// Everything needed to drive the agents through a promotion, captured
/// under the group lock and executed after it is released.
#[derive(Debug, Clone)]
pub struct SwitchPlan {
    pub group: String,
    pub new_id: i32,
    pub size: i32,
    pub token: String,
    pub urls: Vec<String>,
}

const FANOUT_DEADLINE: Duration = Duration::from_secs(5);

/// Fan the switch command out to every agent in parallel. One full retry
/// when fewer than half acknowledged; a persistently poor round is logged
/// and intent stands regardless, so agents converge on their next reload.
pub async fn execute(client: &reqwest::Client, plan: SwitchPlan) {
    if !fan_out(client, &plan).await && !fan_out(client, &plan).await {
        tracing::error!(group = %plan.group, new_id = plan.new_id, "poor execution");
    }
}

async fn fan_out(client: &reqwest::Client, plan: &SwitchPlan) -> bool {
    let calls = plan.urls.iter().map(|url| {
        let client = client.clone();
        let token = plan.token.clone();
        async move { switch_one(&client, url, &token).await }
    });

    let mut acked = 0;
    for (id, result) in join_all(calls).await.into_iter().enumerate() {
        match result {
            Ok(()) => acked += 1,
            Err(e) => {
                tracing::error!(group = %plan.group, id, error = %e, "switch primary")
            }
        }
    }
    2 * acked >= plan.size
}

async fn switch_one(client: &reqwest::Client, url: &str, token: &str) -> Result<()> {
    let response = client
        .get(url)
        .header("Token", token)
        .timeout(FANOUT_DEADLINE)
        .send()
        .await?;

    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        bail!("status code {status}, body: {body}");
    }

    let envelope: Envelope<serde_json::Value> = serde_json::from_str(&body)?;
    if let Some(e) = envelope.error {
        bail!("return error: {e}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Router;
    use axum::routing::get;
    use myops_types::Envelope;
    use tokio::net::TcpListener;

    use super::*;

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        format!("http://{addr}")
    }

    fn plan(urls: Vec<String>, size: i32) -> SwitchPlan {
        SwitchPlan {
            group: "demo".into(),
            new_id: 1,
            size,
            token: "demo-myctl:1@tok".into(),
            urls,
        }
    }

    #[tokio::test]
    async fn acknowledged_fanout_counts_as_success() {
        let hits = Arc::new(AtomicUsize::new(0));
        let state = hits.clone();
        let app = Router::new().route(
            "/api/addons/mylet/switch/primary/{id}",
            get(move || {
                state.fetch_add(1, Ordering::SeqCst);
                async { axum::Json(Envelope::data(1)) }
            }),
        );
        let base = serve(app).await;

        let urls = vec![
            format!("{base}/api/addons/mylet/switch/primary/1"),
            format!("{base}/api/addons/mylet/switch/primary/1"),
        ];
        let client = reqwest::Client::new();
        assert!(fan_out(&client, &plan(urls, 2)).await);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn enveloped_error_is_not_an_ack() {
        let app = Router::new().route(
            "/api/addons/mylet/switch/primary/{id}",
            get(|| async { axum::Json(Envelope::<i32>::error("not ready")) }),
        );
        let base = serve(app).await;

        let urls = vec![format!("{base}/api/addons/mylet/switch/primary/1")];
        let client = reqwest::Client::new();
        assert!(!fan_out(&client, &plan(urls, 2)).await);
    }

    #[tokio::test]
    async fn execute_retries_once_and_gives_up() {
        let hits = Arc::new(AtomicUsize::new(0));
        let state = hits.clone();
        let app = Router::new().route(
            "/api/addons/mylet/switch/primary/{id}",
            get(move || {
                state.fetch_add(1, Ordering::SeqCst);
                async { axum::Json(Envelope::<i32>::error("still not ready")) }
            }),
        );
        let base = serve(app).await;

        let urls = vec![format!("{base}/api/addons/mylet/switch/primary/1")];
        let client = reqwest::Client::new();
        execute(&client, plan(urls, 2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
