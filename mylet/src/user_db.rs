use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use axum::extract::{Multipart, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use mysql_async::Conn;
use mysql_async::prelude::Queryable;
use myops_common::response;
use myops_types::has_quote;
use serde::Deserialize;

use crate::agent::Mylet;
use crate::db::{self, TIMEOUT_1H, TIMEOUT_5S};
use crate::server::caller;

/// Per-file cap on uploaded SQL scripts.
const MAX_SQL_SIZE: usize = 32 << 20;

const SQL_EXTENSIONS: [&str; 5] = [".sql", ".sql.gz", ".sql.bz2", ".sql.xz", ".sql.zst"];

#[derive(Deserialize)]
pub struct UserDbQuery {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    dbname: String,
    #[serde(default)]
    collation: String,
    #[serde(default)]
    charset: String,
}

/// Create or update a user and optionally a database, granting the user
/// full rights on it.
pub async fn user_db(
    State(mylet): State<Mylet>,
    Query(q): Query<UserDbQuery>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = caller(&mylet, &headers).await {
        return resp;
    }

    if q.username.is_empty() && !q.password.is_empty() {
        return response::error("username required");
    }
    if q.password.is_empty() && q.dbname.is_empty() {
        return response::error("password or/and dbname required");
    }
    if has_quote(&[&q.username, &q.password, &q.dbname, &q.collation, &q.charset]) {
        return response::error("username, password and dbname must not contain any quotation marks");
    }

    match apply_user_db(&mylet, &q).await {
        Ok(()) => response::data(serde_json::json!({
            "username": q.username,
            "password": q.password,
            "dbname": q.dbname,
            "collation": q.collation,
            "charset": q.charset,
        })),
        Err(e) => response::error(e.to_string()),
    }
}

async fn apply_user_db(mylet: &Mylet, q: &UserDbQuery) -> Result<()> {
    let (mysql, solo) = mylet.view().await;
    let mut conn = Conn::new(db::local_opts(&mysql, &solo.spec, solo.spec.id)).await?;

    let mut script = Vec::new();

    if !q.username.is_empty() && !q.password.is_empty() {
        let count: i64 = tokio::time::timeout(
            TIMEOUT_5S,
            conn.query_first(format!(
                "SELECT COUNT(*) FROM mysql.user WHERE user = '{}' AND host = '%';",
                q.username
            )),
        )
        .await??
        .unwrap_or(0);
        if count > 0 {
            script.push(format!(
                "ALTER USER '{}'@'%' IDENTIFIED BY '{}';",
                q.username, q.password
            ));
        } else {
            script.push(format!(
                "CREATE USER '{}'@'%' IDENTIFIED WITH mysql_native_password BY '{}';",
                q.username, q.password
            ));
        }
    }

    if !q.dbname.is_empty() {
        let collation = if q.collation.is_empty() {
            "utf8mb4_general_ci"
        } else {
            &q.collation
        };
        let charset = if q.charset.is_empty() {
            "utf8mb4"
        } else {
            &q.charset
        };
        script.push(format!(
            "CREATE DATABASE IF NOT EXISTS `{}` DEFAULT CHARACTER SET '{charset}' COLLATE '{collation}';",
            q.dbname
        ));
        if !q.username.is_empty() {
            script.push(format!(
                "GRANT ALL PRIVILEGES ON `{}`.* TO '{}'@'%' WITH GRANT OPTION;",
                q.dbname, q.username
            ));
        }
    }

    script.push("FLUSH PRIVILEGES;".to_string());
    db::exec_script(&mut conn, &script, TIMEOUT_5S).await
}

/// Execute inline `query` strings and uploaded SQL scripts (optionally
/// compressed) against the local database under the caller's own account.
pub async fn run_sql(
    State(mylet): State<Mylet>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    if let Err(resp) = caller(&mylet, &headers).await {
        return resp;
    }

    let staging = match tempfile::Builder::new().prefix("run-sql-").tempdir() {
        Ok(dir) => dir,
        Err(e) => return response::error(e.to_string()),
    };

    let mut username = String::new();
    let mut password = String::new();
    let mut dbname = String::new();
    let mut queries: Vec<String> = Vec::new();
    let mut files: Vec<PathBuf> = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return response::error(e.to_string()),
        };
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "username" => username = field.text().await.unwrap_or_default(),
            "password" => password = field.text().await.unwrap_or_default(),
            "dbname" => dbname = field.text().await.unwrap_or_default(),
            "query" => queries.push(field.text().await.unwrap_or_default()),
            "file" => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let Some(ext) = SQL_EXTENSIONS.iter().find(|e| filename.ends_with(**e)) else {
                    continue;
                };
                let bytes = match field.bytes().await {
                    Ok(bytes) => bytes,
                    Err(e) => return response::error(e.to_string()),
                };
                if bytes.len() > MAX_SQL_SIZE {
                    return response::error("file too large");
                }
                let path = staging
                    .path()
                    .join(format!("upload-{}{}", files.len(), ext));
                if let Err(e) = tokio::fs::write(&path, &bytes).await {
                    return response::error(e.to_string());
                }
                files.push(path);
            }
            _ => {}
        }
    }

    if username.is_empty() || password.is_empty() {
        return response::error("username and password required");
    }
    if has_quote(&[&username, &password, &dbname]) {
        return response::error("username, password and dbname must not contain any quotation marks");
    }

    if !queries.is_empty() {
        let (_, solo) = mylet.view().await;
        let run = async {
            let mut conn = Conn::new(db::user_opts(&solo.spec, &username, &password, &dbname)).await?;
            db::exec_script(&mut conn, &queries, TIMEOUT_1H).await
        }
        .await;
        if let Err(e) = run {
            return response::error(e.to_string());
        }
    }

    for file in &files {
        if let Err(e) = exec_file(&mylet, &username, &password, &dbname, file).await {
            return response::error(e.to_string());
        }
    }

    response::data(serde_json::json!({
        "query": queries.len(),
        "file": files.len(),
    }))
}

/// Shell pipeline that picks the right decompressor and feeds the engine's
/// own client; mirrors what an operator would run by hand.
const RUN_SQL: &str = r#"
run_sql() {
	if [[ -n "$MYSQL_DATABASE" ]]; then
		set -- --database="$MYSQL_DATABASE" "$@"
	fi

	mysql --defaults-file="$MY_CNF" -h"$MYSQL_HOST" -P"$MYSQL_PORT" -u"$MYSQL_USER" -p"$MYSQL_PASSWORD" "$@"
}

case "$MYSQL_FILE" in
	*.sql)     cat        "$MYSQL_FILE" | run_sql ;;
	*.sql.bz2) bunzip2 -c "$MYSQL_FILE" | run_sql ;;
	*.sql.gz)  gunzip -c  "$MYSQL_FILE" | run_sql ;;
	*.sql.xz)  xzcat      "$MYSQL_FILE" | run_sql ;;
	*.sql.zst) zstd -dc   "$MYSQL_FILE" | run_sql ;;
esac
"#;

async fn exec_file(
    mylet: &Mylet,
    username: &str,
    password: &str,
    dbname: &str,
    file: &Path,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let (_, solo) = mylet.view().await;
    tracing::info!(user = username, db = dbname, file = %file.display(), "run sql file");

    let mut cmd = tokio::process::Command::new("bash");
    cmd.stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::inherit())
        .stderr(std::process::Stdio::inherit())
        .env_clear()
        .env("PATH", std::env::var("PATH").unwrap_or_default())
        .env("MY_CNF", crate::agent::my_cnf(&solo))
        .env("MYSQL_HOST", "127.0.0.1")
        .env("MYSQL_PORT", solo.spec.port.to_string())
        .env("MYSQL_USER", username)
        .env("MYSQL_PASSWORD", password)
        .env("MYSQL_DATABASE", dbname)
        .env("MYSQL_FILE", file);

    let mut child = cmd.spawn().context("spawn bash")?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(RUN_SQL.as_bytes()).await?;
        drop(stdin);
    }

    let status = tokio::time::timeout(TIMEOUT_1H, child.wait())
        .await
        .context("run-sql deadline exceeded")??;
    if !status.success() {
        bail!("sql file exited with {status}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use myops_types::{Envelope, solo_token};
    use tokio::net::TcpListener;

    use super::*;
    use crate::agent::testing::sample_mylet;
    use crate::server::router;

    async fn serve(mylet: Mylet) -> (String, String) {
        let token = {
            let state = mylet.shared.state.lock().await;
            solo_token(&state.mysql, &state.mysql.solo_name(0), 1)
        };
        let app = axum::Router::new().nest("/api/addons/mylet", router(mylet));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        (format!("http://{addr}"), token)
    }

    #[tokio::test]
    async fn user_db_rejects_quoted_inputs_before_touching_the_engine() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (base, token) = serve(sample_mylet(2, 0, dir.path())).await;

        let resp = reqwest::Client::new()
            .post(format!(
                "{base}/api/addons/mylet/user-db?username=o'brien&password=x"
            ))
            .header("Token", &token)
            .send()
            .await
            .expect("post");
        let envelope: Envelope<serde_json::Value> = resp.json().await.expect("json");
        assert!(envelope.error.expect("error").contains("quotation"));
    }

    #[tokio::test]
    async fn user_db_requires_password_or_dbname() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (base, token) = serve(sample_mylet(2, 0, dir.path())).await;

        let resp = reqwest::Client::new()
            .post(format!("{base}/api/addons/mylet/user-db?username=app"))
            .header("Token", &token)
            .send()
            .await
            .expect("post");
        let envelope: Envelope<serde_json::Value> = resp.json().await.expect("json");
        assert_eq!(
            envelope.error.as_deref(),
            Some("password or/and dbname required")
        );
    }

    #[tokio::test]
    async fn run_sql_requires_credentials() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (base, token) = serve(sample_mylet(2, 0, dir.path())).await;

        let form = reqwest::multipart::Form::new().text("query", "SELECT 1;");
        let resp = reqwest::Client::new()
            .post(format!("{base}/api/addons/mylet/run-sql"))
            .header("Token", &token)
            .multipart(form)
            .send()
            .await
            .expect("post");
        let envelope: Envelope<serde_json::Value> = resp.json().await.expect("json");
        assert_eq!(
            envelope.error.as_deref(),
            Some("username and password required")
        );
    }

    #[tokio::test]
    async fn run_sql_caps_uploaded_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (base, token) = serve(sample_mylet(2, 0, dir.path())).await;

        let big = vec![b'-'; MAX_SQL_SIZE + 1];
        let form = reqwest::multipart::Form::new()
            .text("username", "app")
            .text("password", "pw")
            .part(
                "file",
                reqwest::multipart::Part::bytes(big).file_name("big.sql"),
            );
        let resp = reqwest::Client::new()
            .post(format!("{base}/api/addons/mylet/run-sql"))
            .header("Token", &token)
            .multipart(form)
            .send()
            .await
            .expect("post");
        let envelope: Envelope<serde_json::Value> = resp.json().await.expect("json");
        assert_eq!(envelope.error.as_deref(), Some("file too large"));
    }
}
