use std::path::PathBuf;

use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{HeaderMap, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Router, middleware};
use chrono::Local;
use myops_common::{access_log, response};
use myops_types::{Token, group_token, parse_token};
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use crate::agent::Mylet;
use crate::backup::{COMPRESS_EXT, parse_datetime, read_backup_info};
use crate::user_db;

/// The replica-facing surface, nested under `/api/addons/mylet`.
pub fn router(mylet: Mylet) -> Router {
    Router::new()
        .route("/post/start", get(post_start))
        .route("/pre/stop", get(pre_stop))
        .route("/switch/primary/{id}", get(switch_primary))
        .route("/download/backup", get(download_backup))
        .route("/backup", post(trigger_backup))
        .route("/user-db", post(user_db::user_db))
        .route("/run-sql", post(user_db::run_sql))
        .layer(DefaultBodyLimit::max(256 << 20))
        .layer(middleware::from_fn(access_log::errors_only))
        .with_state(mylet.clone())
        .merge(mylet.probes().router())
}

/// Validate the `Token` header against this cluster's secret.
pub(crate) async fn caller(mylet: &Mylet, headers: &HeaderMap) -> Result<Token, Response> {
    let raw = headers
        .get("Token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let Ok(token) = parse_token(raw) else {
        return Err(response::forbidden());
    };
    let state = mylet.shared.state.lock().await;
    if group_token(&state.mysql) != token.group_token {
        return Err(response::forbidden());
    }
    Ok(token)
}

async fn post_start() -> Response {
    response::data("ok")
}

/// Pod pre-stop hook: wind the supervisor down gracefully.
async fn pre_stop(State(mylet): State<Mylet>) -> Response {
    mylet.exit().cancel();
    response::data("bye")
}

/// Coordinator-pushed promotion; only enqueued, the supervisor applies it.
async fn switch_primary(
    State(mylet): State<Mylet>,
    Path(id): Path<i32>,
    headers: HeaderMap,
) -> Response {
    let token = match caller(&mylet, &headers).await {
        Ok(token) => token,
        Err(resp) => return resp,
    };
    if !token.myctl {
        return response::forbidden();
    }

    let current = {
        let state = mylet.shared.state.lock().await;
        if id < 0 || id >= state.mysql.spec.size() {
            return response::bad_request();
        }
        state.mysql.spec.primary_id()
    };

    if id != current {
        // A full slot means a switch is already pending; reload converges.
        let _ = mylet.shared.switch_tx.try_send(id);
    }
    response::data(id)
}

#[derive(Deserialize)]
struct DownloadQuery {
    datetime: Option<String>,
}

/// Serve a compressed backup. `datetime=replication` hands out the freshest
/// archive, taking and compressing a new full backup when everything on
/// disk is older than the freshness window.
async fn download_backup(
    State(mylet): State<Mylet>,
    Query(q): Query<DownloadQuery>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = caller(&mylet, &headers).await {
        return resp;
    }
    let Some(datetime) = q.datetime else {
        return response::bad_request();
    };

    let file = if datetime == "replication" {
        match replication_archive(&mylet).await {
            Ok(file) => file,
            Err(e) => {
                tracing::error!(error = %e, "replication archive");
                return response::internal_server_error();
            }
        }
    } else {
        let Some(t) = parse_datetime(&datetime) else {
            return response::bad_request();
        };
        let dir = mylet.backup_dir_at(t).await;
        let file = PathBuf::from(format!("{}{COMPRESS_EXT}", dir.display()));
        match tokio::fs::metadata(&file).await {
            Ok(m) if m.is_dir() => return response::not_found(),
            Ok(_) => file,
            Err(_) => {
                if !dir.is_dir() {
                    return response::not_found();
                }
                if read_backup_info(&dir.join("base")).await.is_err() {
                    return response::not_found();
                }
                match mylet.compress_backup(&dir).await {
                    Ok(file) => file,
                    Err(e) => {
                        tracing::error!(error = %e, "compress backup");
                        return response::internal_server_error();
                    }
                }
            }
        }
    };

    serve_file(file).await
}

/// Pick or produce the archive a bootstrapping replica should stream.
async fn replication_archive(mylet: &Mylet) -> anyhow::Result<PathBuf> {
    let freshness = {
        let state = mylet.shared.state.lock().await;
        state.mysql.spec.switch_policy.backup_freshness()
    };
    let now = Local::now();

    let compresses = mylet.get_compresses().await?;
    if let Some(last) = compresses.last()
        && now - *last <= freshness
    {
        let dir = mylet.backup_dir_at(*last).await;
        return Ok(PathBuf::from(format!("{}{COMPRESS_EXT}", dir.display())));
    }

    let backups = mylet.get_backups().await?;
    let stale = backups.last().map(|t| now - *t > freshness).unwrap_or(true);
    if stale {
        mylet.full_backup().await?;
    }
    mylet.compress_last_backup().await
}

async fn serve_file(path: PathBuf) -> Response {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            tracing::error!(error = %e, path = %path.display(), "open backup archive");
            return response::not_found();
        }
    };
    let body = axum::body::Body::from_stream(ReaderStream::new(file));
    (
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{name}\""),
            ),
        ],
        body,
    )
        .into_response()
}

#[derive(Deserialize)]
struct BackupQuery {
    #[serde(default)]
    incremental: bool,
    #[serde(default)]
    compress: bool,
}

/// Token-gated backup trigger; rejected while another operation holds the
/// backing lock.
async fn trigger_backup(
    State(mylet): State<Mylet>,
    Query(q): Query<BackupQuery>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = caller(&mylet, &headers).await {
        return resp;
    }

    match run_backup(&mylet, q.incremental, q.compress).await {
        Ok(v) => response::data(v),
        Err(e) => response::error(e.to_string()),
    }
}

async fn run_backup(
    mylet: &Mylet,
    incremental: bool,
    compress: bool,
) -> anyhow::Result<serde_json::Value> {
    let (taken, layer) = if incremental {
        let backups = mylet.get_backups().await?;
        let t = match backups.last() {
            Some(t) => *t,
            None => mylet.full_backup().await?,
        };
        let layer = mylet.incremental_backup(t).await?;
        (t, layer)
    } else {
        (mylet.full_backup().await?, 0)
    };

    if compress {
        let dir = mylet.backup_dir_at(taken).await;
        mylet.compress_backup(&dir).await?;
    }

    Ok(serde_json::json!({
        "BackupTime": taken.format(crate::backup::DATETIME_LAYOUT).to_string(),
        "Incremental": layer,
        "Compress": compress,
    }))
}
