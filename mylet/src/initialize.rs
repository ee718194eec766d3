use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use mysql_async::Conn;

use crate::agent::{Mylet, data_dir, mysqld_command, socket_path};
use crate::db::{self, TIMEOUT_1M, TIMEOUT_5S};
use crate::start;

/// True when the path is missing or an empty directory.
pub async fn is_empty(path: &Path) -> Result<bool> {
    let mut entries = match tokio::fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    };
    Ok(entries.next_entry().await?.is_none())
}

impl Mylet {
    /// First boot of solo 0: create the system tables, take over the
    /// administrator account, and seed the replication user.
    pub async fn initialize(&self) -> Result<()> {
        let (_, solo) = self.view().await;
        let dir = data_dir(&solo);
        if !is_empty(&dir).await? {
            bail!("mysql datadir not empty: {}", dir.display());
        }
        tokio::fs::create_dir_all(&dir).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)).await?;
        }

        let mut cmd = mysqld_command(&solo, &["--initialize-insecure"]);
        let mut child = cmd.spawn().context("spawn mysqld --initialize-insecure")?;
        let status = tokio::time::timeout(TIMEOUT_1M, child.wait())
            .await
            .context("initialize deadline exceeded")??;
        if !status.success() {
            bail!("mysqld --initialize-insecure exited with {status}");
        }

        self.rename_root().await?;
        self.change_local_password().await?;
        self.init_db().await?;
        Ok(())
    }

    /// Rename the built-in administrator when the spec asks for a
    /// different local account name.
    async fn rename_root(&self) -> Result<()> {
        let (mysql, _) = self.view().await;
        if mysql.spec.local_username == "root" {
            return Ok(());
        }

        let mut script = db::fence_open();
        script.push(format!(
            "UPDATE mysql.user SET user = '{}' WHERE user = 'root' AND host = 'localhost';",
            mysql.spec.local_username
        ));
        script.push("FLUSH PRIVILEGES;".to_string());
        script.extend(db::fence_close());

        self.exec_on_local_mysqld("root", "", script).await
    }

    /// The insecure bootstrap account gets its real password, suffixed with
    /// our id.
    async fn change_local_password(&self) -> Result<()> {
        let (mysql, solo) = self.view().await;

        let mut script = db::fence_open();
        script.push(format!(
            "ALTER USER '{}'@'localhost' IDENTIFIED WITH mysql_native_password BY '{}{}';",
            mysql.spec.local_username, mysql.spec.local_password, solo.spec.id
        ));
        script.push("FLUSH PRIVILEGES;".to_string());
        script.extend(db::fence_close());

        self.exec_on_local_mysqld(&mysql.spec.local_username.clone(), "", script)
            .await
    }

    /// Drop the anonymous leftovers, create the replication account, and
    /// load the time-zone tables.
    async fn init_db(&self) -> Result<()> {
        let (mysql, solo) = self.view().await;
        let tz = load_time_zone().await?;

        let mut script = db::fence_open();
        script.push("DROP USER IF EXISTS 'root'@'%';".to_string());
        script.push("DROP DATABASE IF EXISTS test;".to_string());
        // The tool emits plain TRUNCATE/INSERT statements; run them one by
        // one like the rest of the script.
        for statement in tz.split(";\n") {
            let statement = statement.trim();
            if !statement.is_empty() {
                script.push(format!("{statement};"));
            }
        }
        script.push(format!(
            "CREATE USER '{}'@'%' IDENTIFIED WITH mysql_native_password BY '{}{}';",
            mysql.spec.replica_username, mysql.spec.replica_password, solo.spec.id
        ));
        script.push(format!(
            "GRANT REPLICATION CLIENT, REPLICATION SLAVE ON *.* TO '{}'@'%';",
            mysql.spec.replica_username
        ));
        script.push("FLUSH PRIVILEGES;".to_string());
        script.extend(db::fence_close());

        let pass = format!("{}{}", mysql.spec.local_password, solo.spec.id);
        self.exec_on_local_mysqld(&mysql.spec.local_username.clone(), &pass, script)
            .await
    }

    /// Run a script against a throwaway `--skip-networking` engine over the
    /// unix socket, polling until it answers. The engine is SIGTERMed and
    /// reaped regardless of the script's outcome.
    pub(crate) async fn exec_on_local_mysqld(
        &self,
        user: &str,
        pass: &str,
        script: Vec<String>,
    ) -> Result<()> {
        let (_, solo) = self.view().await;
        let socket = socket_path(&solo);

        let mut child = mysqld_command(&solo, &["--skip-networking"])
            .spawn()
            .context("spawn local mysqld")?;

        let result = async {
            let opts = db::socket_opts(&socket, user, pass);
            let mut last: Option<anyhow::Error> = None;
            for attempt in 1..=10 {
                tracing::info!(attempt, "waiting for local mysqld");
                tokio::time::sleep(TIMEOUT_5S).await;

                match Conn::new(opts.clone()).await {
                    Ok(mut conn) => {
                        db::exec_script(&mut conn, &script, TIMEOUT_1M).await?;
                        let _ = conn.disconnect().await;
                        return Ok(());
                    }
                    Err(e) => last = Some(e.into()),
                }
            }
            Err(last.unwrap_or_else(|| anyhow::anyhow!("local mysqld never answered")))
        }
        .await;

        start::terminate(&mut child).await;
        result
    }
}

/// The time-zone seed SQL produced by the engine's own conversion tool.
async fn load_time_zone() -> Result<String> {
    let output = tokio::time::timeout(
        Duration::from_secs(5),
        tokio::process::Command::new("mysql_tzinfo_to_sql")
            .arg("/usr/share/zoneinfo")
            .stderr(std::process::Stdio::inherit())
            .output(),
    )
    .await
    .context("mysql_tzinfo_to_sql deadline exceeded")??;

    if !output.status.success() {
        bail!("mysql_tzinfo_to_sql exited with {}", output.status);
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_and_empty_dirs_count_as_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(is_empty(&dir.path().join("nope")).await.expect("missing"));
        assert!(is_empty(dir.path()).await.expect("empty"));

        tokio::fs::write(dir.path().join("ibdata1"), b"x")
            .await
            .expect("write");
        assert!(!is_empty(dir.path()).await.expect("non-empty"));
    }
}
