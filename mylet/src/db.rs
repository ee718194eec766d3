use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Opts, OptsBuilder};
use myops_types::{Mysql, MysqlSoloSpec};

pub const TIMEOUT_5S: Duration = Duration::from_secs(5);
pub const TIMEOUT_1M: Duration = Duration::from_secs(60);
pub const TIMEOUT_1H: Duration = Duration::from_secs(3600);

/// Control connection over TCP to the local engine. The local account's
/// password is suffixed with the given solo id.
pub fn local_opts(mysql: &Mysql, solo: &MysqlSoloSpec, password_id: i32) -> Opts {
    OptsBuilder::default()
        .ip_or_hostname("127.0.0.1")
        .tcp_port(solo.port)
        .user(Some(mysql.spec.local_username.clone()))
        .pass(Some(format!("{}{}", mysql.spec.local_password, password_id)))
        .db_name(Some("mysql"))
        .into()
}

/// Arbitrary-account connection for the user-facing SQL endpoints.
pub fn user_opts(solo: &MysqlSoloSpec, user: &str, pass: &str, db: &str) -> Opts {
    OptsBuilder::default()
        .ip_or_hostname("127.0.0.1")
        .tcp_port(solo.port)
        .user(Some(user.to_string()))
        .pass(Some(pass.to_string()))
        .db_name(if db.is_empty() { None } else { Some(db.to_string()) })
        .into()
}

/// Socket connection to a throwaway `--skip-networking` engine during
/// initialize/adjust passes.
pub fn socket_opts(socket: &Path, user: &str, pass: &str) -> Opts {
    OptsBuilder::default()
        .socket(Some(socket.display().to_string()))
        .user(Some(user.to_string()))
        .pass(Some(pass.to_string()))
        .db_name(Some("mysql".to_string()))
        .into()
}

/// Run an ordered statement script on one connection under a deadline. The
/// session-scoped `sql_log_bin` fence in a script therefore covers every
/// following statement.
pub async fn exec_script(conn: &mut Conn, script: &[String], deadline: Duration) -> Result<()> {
    tokio::time::timeout(deadline, async {
        for statement in script {
            conn.query_drop(statement.as_str())
                .await
                .with_context(|| short_statement(statement))?;
        }
        Ok::<_, anyhow::Error>(())
    })
    .await
    .context("script deadline exceeded")??;
    Ok(())
}

pub async fn query_string(conn: &mut Conn, query: &str, deadline: Duration) -> Result<String> {
    let value = tokio::time::timeout(deadline, conn.query_first::<String, _>(query))
        .await
        .context("query deadline exceeded")??;
    value.with_context(|| format!("empty result for {query}"))
}

fn short_statement(statement: &str) -> String {
    let line = statement.lines().next().unwrap_or_default();
    let mut s = line.chars().take(48).collect::<String>();
    if s.len() < line.len() {
        s.push('…');
    }
    s
}

/// The replication vocabulary fork: version 5 speaks `MASTER`/`SLAVE`,
/// everything later speaks `SOURCE`/`REPLICA`. Chosen once per agent after
/// version detection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicationVocab {
    Legacy,
    Modern,
}

impl ReplicationVocab {
    pub fn from_major(major: i32) -> Self {
        if major == 5 {
            ReplicationVocab::Legacy
        } else {
            ReplicationVocab::Modern
        }
    }

    pub fn stop_replica(self) -> &'static str {
        match self {
            ReplicationVocab::Legacy => "STOP SLAVE;",
            ReplicationVocab::Modern => "STOP REPLICA;",
        }
    }

    pub fn reset_replica(self) -> &'static str {
        match self {
            ReplicationVocab::Legacy => "RESET SLAVE;",
            ReplicationVocab::Modern => "RESET REPLICA;",
        }
    }

    pub fn start_replica(self) -> &'static str {
        match self {
            ReplicationVocab::Legacy => "START SLAVE;",
            ReplicationVocab::Modern => "START REPLICA;",
        }
    }

    pub fn change_source(self, host: &str, port: u16, user: &str, pass: &str) -> String {
        match self {
            ReplicationVocab::Legacy => format!(
                "CHANGE MASTER TO MASTER_HOST = '{host}', MASTER_PORT = {port}, \
                 MASTER_USER = '{user}', MASTER_PASSWORD = '{pass}', MASTER_AUTO_POSITION = 1;"
            ),
            ReplicationVocab::Modern => format!(
                "CHANGE REPLICATION SOURCE TO SOURCE_HOST = '{host}', SOURCE_PORT = {port}, \
                 SOURCE_USER = '{user}', SOURCE_PASSWORD = '{pass}', SOURCE_AUTO_POSITION = 1;"
            ),
        }
    }
}

/// Opening statements of a fenced script: keep the changes out of the
/// binlog and lift the read-only gates.
pub fn fence_open() -> Vec<String> {
    vec![
        "SET SESSION sql_log_bin = OFF;".to_string(),
        "SET GLOBAL read_only = OFF;".to_string(),
        "SET GLOBAL super_read_only = OFF;".to_string(),
    ]
}

/// Closing statements: restore the gates, re-enable binlogging.
pub fn fence_close() -> Vec<String> {
    vec![
        "SET GLOBAL super_read_only = ON;".to_string(),
        "SET GLOBAL read_only = ON;".to_string(),
        "SET SESSION sql_log_bin = ON;".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vocab_follows_major_version() {
        assert_eq!(ReplicationVocab::from_major(5), ReplicationVocab::Legacy);
        assert_eq!(ReplicationVocab::from_major(8), ReplicationVocab::Modern);
    }

    #[test]
    fn legacy_vocab_speaks_master_slave() {
        let v = ReplicationVocab::Legacy;
        assert_eq!(v.stop_replica(), "STOP SLAVE;");
        let change = v.change_source("demo-0.demo-x", 3306, "repl", "rp0");
        assert!(change.starts_with("CHANGE MASTER TO"));
        assert!(change.contains("MASTER_AUTO_POSITION = 1"));
    }

    #[test]
    fn modern_vocab_speaks_source_replica() {
        let v = ReplicationVocab::Modern;
        assert_eq!(v.start_replica(), "START REPLICA;");
        let change = v.change_source("demo-0.demo-x", 3306, "repl", "rp0");
        assert!(change.starts_with("CHANGE REPLICATION SOURCE TO"));
        assert!(change.contains("SOURCE_AUTO_POSITION = 1"));
    }

    #[test]
    fn fences_disable_binlog_first_and_restore_last() {
        let open = fence_open();
        assert_eq!(open[0], "SET SESSION sql_log_bin = OFF;");
        let close = fence_close();
        assert_eq!(close.last().map(String::as_str), Some("SET SESSION sql_log_bin = ON;"));
    }
}
