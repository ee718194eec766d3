use anyhow::{Result, bail};
use mysql_async::Conn;
use mysql_async::prelude::Queryable;
use myops_types::{PrimaryMode, chain_source_id, has_quote};

use crate::agent::Mylet;
use crate::db::{self, ReplicationVocab, TIMEOUT_5S};

impl Mylet {
    async fn local_conn(&self) -> Result<Conn> {
        let (mysql, solo) = self.view().await;
        Ok(Conn::new(db::local_opts(&mysql, &solo.spec, solo.spec.id)).await?)
    }

    async fn vocab(&self) -> ReplicationVocab {
        let state = self.shared.state.lock().await;
        let major = state
            .mysql
            .status
            .as_ref()
            .map(|s| s.version.major)
            .unwrap_or(8);
        ReplicationVocab::from_major(major)
    }

    /// Flip both read-only gates; the primary runs with them off, everybody
    /// else with them on.
    async fn set_read_only(&self, read_only: bool) -> Result<()> {
        let v = if read_only { "ON" } else { "OFF" };
        let script = vec![
            "SET SESSION sql_log_bin = OFF;".to_string(),
            format!("SET GLOBAL super_read_only = {v};"),
            format!("SET GLOBAL read_only = {v};"),
            "SET SESSION sql_log_bin = ON;".to_string(),
        ];
        let mut conn = self.local_conn().await?;
        db::exec_script(&mut conn, &script, TIMEOUT_5S).await
    }

    pub async fn setup_primary(&self) -> Result<()> {
        let (_, solo) = self.view().await;
        if !self.is_primary().await {
            bail!("{} is not a primary", solo.spec.name);
        }
        self.set_read_only(false).await
    }

    pub async fn stop_primary(&self) -> Result<()> {
        self.set_read_only(true).await
    }

    /// Wire this replica to its chain source and start replication.
    pub async fn setup_replica(&self) -> Result<()> {
        let (mysql, solo) = self.view().await;
        let source_id = solo.spec.source_id;
        if source_id == -1 {
            bail!("{} no source id", solo.spec.name);
        }

        let vocab = self.vocab().await;
        let mut script = db::fence_open();
        script.push(vocab.reset_replica().to_string());
        script.push(vocab.change_source(
            &mysql.solo_short_host(source_id),
            mysql.spec.port,
            &mysql.spec.replica_username,
            &format!("{}{}", mysql.spec.replica_password, source_id),
        ));
        script.push(vocab.start_replica().to_string());
        script.extend(db::fence_close());

        let mut conn = self.local_conn().await?;
        db::exec_script(&mut conn, &script, TIMEOUT_5S).await
    }

    pub async fn stop_replica(&self) -> Result<()> {
        let vocab = self.vocab().await;
        let mut script = db::fence_open();
        script.push(vocab.stop_replica().to_string());
        script.push(vocab.reset_replica().to_string());
        script.extend(db::fence_close());

        let mut conn = self.local_conn().await?;
        db::exec_script(&mut conn, &script, TIMEOUT_5S).await
    }

    /// Drive the local role-change sequence toward `new_id`. Promoting to
    /// the current primary is a no-op.
    pub async fn change_primary(&self, new_id: i32) -> Result<()> {
        let (mysql, solo) = self.view().await;
        let old_id = mysql.spec.primary_id();
        let size = mysql.spec.size();

        if mysql.spec.primary_mode != PrimaryMode::Classic
            || new_id < 0
            || new_id >= size
            || new_id == old_id
        {
            return Ok(());
        }

        tracing::info!(from = old_id, to = new_id, "change primary");

        if solo.spec.id == old_id {
            self.stop_primary().await?;
        }
        if solo.spec.source_id != -1 {
            self.stop_replica().await?;
        }

        {
            let mut state = self.shared.state.lock().await;
            state.mysql.spec.primary_id = Some(new_id);
            let source_id = chain_source_id(state.solo.spec.id, new_id);
            state.solo.spec.source_id = source_id;
            let own = state.solo.spec.id as usize;
            if let Some(status) = state.mysql.status.as_mut()
                && let Some(entry) = status.solos.get_mut(own)
            {
                entry.spec.source_id = source_id;
            }
        }

        if self.is_primary().await {
            self.setup_primary().await
        } else {
            self.setup_replica().await
        }
    }

    /// Create or refresh the metrics exporter account; called on the primary
    /// after post-start checks.
    pub async fn exporter_user(&self) -> Result<()> {
        let (mysql, solo) = self.view().await;
        let user = mysql.spec.exporter_username.clone();
        let pass = mysql.spec.exporter_password.clone();
        if user.is_empty() || pass.is_empty() {
            bail!("exporter username and password required");
        }
        if has_quote(&[&user, &pass]) {
            bail!("exporter username and password must not contain any quotation marks");
        }

        let mut conn = Conn::new(db::local_opts(&mysql, &solo.spec, solo.spec.id)).await?;
        let count: i64 = tokio::time::timeout(
            TIMEOUT_5S,
            conn.query_first(format!(
                "SELECT COUNT(*) FROM mysql.user WHERE user = '{user}' AND host = 'localhost';"
            )),
        )
        .await??
        .unwrap_or(0);

        let mut script = Vec::new();
        if count > 0 {
            script.push(format!(
                "ALTER USER '{user}'@'localhost' IDENTIFIED BY '{pass}';"
            ));
        } else {
            script.push(format!(
                "CREATE USER '{user}'@'localhost' IDENTIFIED WITH mysql_native_password \
                 BY '{pass}' WITH MAX_USER_CONNECTIONS 3;"
            ));
        }
        script.push(format!(
            "GRANT PROCESS, REPLICATION CLIENT, REPLICATION SLAVE, SELECT ON *.* \
             TO '{user}'@'localhost';"
        ));
        script.push("FLUSH PRIVILEGES;".to_string());

        db::exec_script(&mut conn, &script, TIMEOUT_5S).await
    }
}

#[cfg(test)]
mod tests {
    use crate::agent::testing::sample_mylet;

    #[tokio::test]
    async fn change_primary_to_current_primary_is_a_noop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mylet = sample_mylet(2, 1, dir.path());
        // No database is running; a real role change would fail loudly, so
        // returning Ok proves nothing was attempted.
        mylet.change_primary(0).await.expect("noop");
        let (mysql, solo) = mylet.view().await;
        assert_eq!(mysql.spec.primary_id(), 0);
        assert_eq!(solo.spec.source_id, 0);
    }

    #[tokio::test]
    async fn change_primary_rejects_nothing_out_of_range() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mylet = sample_mylet(2, 1, dir.path());
        mylet.change_primary(9).await.expect("ignored");
        let (mysql, _) = mylet.view().await;
        assert_eq!(mysql.spec.primary_id(), 0);
    }
}
