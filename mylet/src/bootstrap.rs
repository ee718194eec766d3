use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use flate2::read::GzDecoder;
use futures::StreamExt;
use myops_types::solo_token;
use tokio::io::AsyncWriteExt;

use crate::agent::{Mylet, data_dir};
use crate::db;
use crate::initialize::is_empty;

const TIMEOUT_DOWNLOAD: Duration = Duration::from_secs(8 * 3600);

impl Mylet {
    /// Bootstrap an empty data directory from a peer: stream its freshest
    /// full backup, prepare and restore it, then adjust the GTID cursor and
    /// passwords to this replica's identity.
    pub async fn fetch_and_prepare(&self) -> Result<()> {
        let (mysql, solo) = self.view().await;
        let dir = data_dir(&solo);
        if !is_empty(&dir).await? {
            bail!("mysql datadir not empty: {}", dir.display());
        }

        let peer_id = match solo.spec.source_id {
            -1 => 0,
            id => id,
        };
        if solo.spec.id == peer_id {
            bail!("self fetch: {peer_id}");
        }
        let peer = mysql
            .status
            .as_ref()
            .and_then(|s| s.solos.get(peer_id as usize))
            .with_context(|| format!("peer {peer_id} missing from cluster object"))?;

        let staging = dir.with_extension("download");
        let _ = tokio::fs::remove_dir_all(&staging).await;
        tokio::fs::create_dir_all(&staging).await?;

        let url = format!(
            "http://{}:{}/api/addons/mylet/download/backup?datetime=replication",
            peer.spec.host, peer.spec.mylet_port
        );
        tracing::info!(%url, "downloading peer backup");

        let archive = staging.join("backup.tar.gz");
        self.download(&url, &solo.spec.name, &mysql, &archive)
            .await
            .context("download peer backup")?;

        let extract_src = archive.clone();
        let extract_dst = staging.clone();
        tokio::task::spawn_blocking(move || extract_tar_gz_strip1(&extract_src, &extract_dst))
            .await
            .context("extract worker panicked")??;
        tokio::fs::remove_file(&archive).await?;

        self.prepare_backup(peer_id, &staging).await?;
        self.restore_backup(peer_id, &staging.join("base"), true)
            .await?;
        self.adjust_backup(peer_id).await?;

        tokio::fs::remove_dir_all(&staging).await?;
        Ok(())
    }

    async fn download(
        &self,
        url: &str,
        name: &str,
        mysql: &myops_types::Mysql,
        dest: &Path,
    ) -> Result<()> {
        let response = self
            .shared
            .client
            .get(url)
            .header("Token", solo_token(mysql, name, self.shared.rand_id))
            .timeout(TIMEOUT_DOWNLOAD)
            .send()
            .await?;
        if !response.status().is_success() {
            bail!("status code {}", response.status());
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(())
    }

    /// Rewrite the GTID cursor to what the backup recorded and re-key the
    /// replication and local accounts with this replica's own id suffix.
    pub async fn adjust_backup(&self, fetched_id: i32) -> Result<()> {
        let _lock = self.lock_backup("adjust backup")?;
        let gtid = self.read_gtid().await?;

        let (mysql, solo) = self.view().await;
        let mut script = db::fence_open();
        script.push("RESET MASTER;".to_string());
        script.push(format!("SET GLOBAL gtid_purged = '{gtid}';"));
        script.push(format!(
            "ALTER USER '{}'@'%' IDENTIFIED BY '{}{}';",
            mysql.spec.replica_username, mysql.spec.replica_password, solo.spec.id
        ));
        script.push(format!(
            "ALTER USER '{}'@'localhost' IDENTIFIED BY '{}{}';",
            mysql.spec.local_username, mysql.spec.local_password, solo.spec.id
        ));
        script.push("FLUSH PRIVILEGES;".to_string());
        script.extend(db::fence_close());

        let pass = format!("{}{}", mysql.spec.local_password, fetched_id);
        self.exec_on_local_mysqld(&mysql.spec.local_username.clone(), &pass, script)
            .await
    }
}

/// Unpack `archive` into `dest`, dropping the top-level directory the
/// compressor added, so `base/` and `incN/` land directly in `dest`.
pub fn extract_tar_gz_strip1(archive: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(archive)?;
    let mut ar = tar::Archive::new(GzDecoder::new(file));
    for entry in ar.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let stripped: PathBuf = path.components().skip(1).collect();
        if stripped.as_os_str().is_empty() {
            continue;
        }
        entry.unpack(dest.join(stripped))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn archives_round_trip_with_stripped_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backup = dir.path().join("demo-0.20260801.090000");
        std::fs::create_dir_all(backup.join("base")).expect("mkdir");
        std::fs::create_dir_all(backup.join("inc1")).expect("mkdir");
        std::fs::write(backup.join("base/ibdata1"), b"base bytes").expect("write");
        std::fs::write(backup.join("inc1/delta"), b"inc bytes").expect("write");

        // Compress the way the download endpoint does.
        let archive = dir.path().join("demo-0.20260801.090000.tar.gz");
        {
            let file = std::fs::File::create(&archive).expect("create");
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            builder
                .append_dir_all("demo-0.20260801.090000", &backup)
                .expect("append");
            builder.into_inner().expect("tar").finish().expect("gz");
        }

        let out = dir.path().join("staging");
        std::fs::create_dir_all(&out).expect("mkdir");
        extract_tar_gz_strip1(&archive, &out).expect("extract");

        assert_eq!(
            std::fs::read(out.join("base/ibdata1")).expect("base"),
            b"base bytes"
        );
        assert_eq!(
            std::fs::read(out.join("inc1/delta")).expect("inc"),
            b"inc bytes"
        );
    }
}
