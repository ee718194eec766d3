use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Router, middleware};
use chrono::Utc;
use myops_common::{access_log, response};
use myops_types::{MysqlReport, Token, group_token, parse_token};

use crate::ctl::Myctl;
use crate::group::MysqlGroup;

/// The agent-facing surface, nested under `/api/addons/myctl`.
pub fn router(ctl: Myctl) -> Router {
    Router::new()
        .route("/{ns}/mysql", get(get_mysql))
        .route("/{ns}/report", post(post_report))
        .layer(middleware::from_fn(access_log::errors_only))
        .with_state(ctl.clone())
        .merge(ctl.probes().router())
}

/// Resolve the caller's group from the `Token` header: the token must parse,
/// the group must exist in this namespace, the secret must match, and the
/// caller's id must be inside the cluster.
async fn authorize(
    ctl: &Myctl,
    ns: &str,
    headers: &HeaderMap,
) -> Result<(MysqlGroup, Token), Response> {
    let raw = headers
        .get("Token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let token = parse_token(raw).map_err(|e| response::error(e.to_string()))?;

    let key = (ns.to_string(), token.group_name.clone());
    let group = ctl
        .group(&key)
        .await
        .ok_or_else(|| response::error(format!("{}/{} not found", key.0, key.1)))?;

    {
        let state = group.state().lock().await;
        if group_token(&state.mysql) != token.group_token {
            return Err(response::error("token forbidden"));
        }
        if token.id < 0 || token.id >= state.mysql.spec.size() {
            return Err(response::error("token id out of range"));
        }
    }

    Ok((group, token))
}

/// The full cluster object, fetched once by each agent at startup.
async fn get_mysql(State(ctl): State<Myctl>, Path(ns): Path<String>, headers: HeaderMap) -> Response {
    let (group, _) = match authorize(&ctl, &ns, &headers).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let state = group.state().lock().await;
    response::data(&state.mysql)
}

async fn post_report(
    State(ctl): State<Myctl>,
    Path(ns): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let (group, token) = match authorize(&ctl, &ns, &headers).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let Ok(report) = serde_json::from_str::<MysqlReport>(&body) else {
        return response::error("illegal body");
    };

    #[cfg(feature = "metrics")]
    ctl.metrics().reports.with_label_values(&[&ns, &token.group_name]).inc();

    let mut state = group.state().lock().await;
    match state.ingest_report(&token, &report, Utc::now()) {
        Ok(result) => response::data(result),
        Err(e) => response::error(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use myops_types::{Envelope, Mysql, MysqlSpec, MysqlState, ReportResult, StateKey, solo_token};
    use tokio::net::TcpListener;

    use super::*;

    fn sample() -> Mysql {
        let mut mysql = Mysql::new(
            "demo",
            MysqlSpec {
                replicas: Some(2),
                local_password: "lp".into(),
                replica_password: "rp".into(),
                myctl_addr: "myctl:33081".into(),
                ..Default::default()
            },
        );
        mysql.metadata.namespace = Some("default".into());
        mysql
    }

    async fn serve(ctl: Myctl) -> String {
        let app = axum::Router::new().nest("/api/addons/myctl", router(ctl));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn report_round_trip_over_http() {
        let ctl = Myctl::new();
        let group = ctl.get_or_new_group(&sample()).await.expect("group");
        let (mysql, token) = {
            let state = group.state().lock().await;
            let name = state.mysql.solo_name(1);
            (state.mysql.clone(), solo_token(&state.mysql, &name, 99))
        };
        let base = serve(ctl).await;

        let mut entry = MysqlState::new(StateKey { from_id: 1, to_id: 0 });
        entry.merge_dial(chrono::Utc::now(), None);
        let report = myops_types::MysqlReport {
            name: mysql.solo_name(1),
            size_spec: mysql.size_spec(),
            states: vec![serde_json::to_value(&entry).expect("state")],
            hang: 0,
        };

        let response = reqwest::Client::new()
            .post(format!("{base}/api/addons/myctl/default/report"))
            .header("Token", token)
            .json(&report)
            .send()
            .await
            .expect("post");
        assert!(response.status().is_success());

        let envelope: Envelope<ReportResult> = response.json().await.expect("envelope");
        let result = envelope.into_result().expect("report accepted");
        assert_eq!(result.size_spec, mysql.size_spec());

        let state = group.state().lock().await;
        assert!(state.states.contains_key(&StateKey { from_id: 1, to_id: 0 }));
    }

    #[tokio::test]
    async fn unknown_group_and_bad_secret_are_enveloped_errors() {
        let ctl = Myctl::new();
        let base = serve(ctl.clone()).await;
        let client = reqwest::Client::new();

        // No group registered yet.
        let envelope: Envelope<serde_json::Value> = client
            .get(format!("{base}/api/addons/myctl/default/mysql"))
            .header("Token", "demo-0:1@deadbeef")
            .send()
            .await
            .expect("get")
            .json()
            .await
            .expect("json");
        assert!(envelope.error.expect("error").contains("not found"));

        // Group exists but the secret is wrong.
        ctl.get_or_new_group(&sample()).await.expect("group");
        let envelope: Envelope<serde_json::Value> = client
            .get(format!("{base}/api/addons/myctl/default/mysql"))
            .header("Token", "demo-0:1@deadbeef")
            .send()
            .await
            .expect("get")
            .json()
            .await
            .expect("json");
        assert_eq!(envelope.error.as_deref(), Some("token forbidden"));
    }

    #[tokio::test]
    async fn probes_answer_after_flags_flip() {
        let ctl = Myctl::new();
        let base = serve(ctl.clone()).await;
        let client = reqwest::Client::new();

        let url = format!("{base}/api/addons/myctl/probe/readiness");
        let resp = client.get(&url).send().await.expect("get");
        assert_eq!(resp.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);

        ctl.probes().set_readiness(true);
        let resp = client.get(&url).send().await.expect("get");
        assert!(resp.status().is_success());
        assert_eq!(resp.text().await.expect("body"), "readiness");
    }
}
