use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local, TimeZone};
use flate2::Compression;
use flate2::write::GzEncoder;

use crate::agent::{Mylet, MyletShared, backup_root, data_dir, my_cnf};

pub const BACKUP_FILENAME: &str = "mylet_backup";
pub const DATETIME_LAYOUT: &str = "%Y%m%d.%H%M%S";
pub const COMPRESS_EXT: &str = ".tar.gz";

/// Full and incremental backups may stream a lot of data.
const TIMEOUT_BACKUP: Duration = Duration::from_secs(8 * 3600);
const TIMEOUT_PREPARE: Duration = Duration::from_secs(3600);

/// Holds the agent's "backing" slot for one operation; dropping it releases
/// the backup directory.
#[derive(Debug)]
pub struct BackupLock {
    shared: Arc<MyletShared>,
}

impl Drop for BackupLock {
    fn drop(&mut self) {
        self.shared
            .backing
            .lock()
            .expect("backing lock poisoned")
            .clear();
    }
}

impl Mylet {
    /// Claim the backup directory for `operation`, failing with the name of
    /// whatever currently holds it.
    pub fn lock_backup(&self, operation: &str) -> Result<BackupLock> {
        let mut backing = self
            .shared
            .backing
            .lock()
            .expect("backing lock poisoned");
        if !backing.is_empty() {
            bail!("backing: {backing}");
        }
        *backing = operation.to_string();
        Ok(BackupLock {
            shared: self.shared.clone(),
        })
    }

    pub fn backing(&self) -> String {
        self.shared
            .backing
            .lock()
            .expect("backing lock poisoned")
            .clone()
    }

    /// `<mydir>/backup/<name>.<YYYYMMDD.HHMMSS>` for a given start time.
    pub async fn backup_dir_at(&self, t: DateTime<Local>) -> PathBuf {
        let (_, solo) = self.view().await;
        backup_root(&solo).join(format!(
            "{}.{}",
            solo.spec.name,
            t.format(DATETIME_LAYOUT)
        ))
    }

    /// Start times of every completed backup, oldest first. A backup counts
    /// only when its `base` marker exists and agrees with the directory
    /// name.
    pub async fn get_backups(&self) -> Result<Vec<DateTime<Local>>> {
        let (_, solo) = self.view().await;
        let prefix = format!("{}.", solo.spec.name);
        let root = backup_root(&solo);

        let mut found = Vec::new();
        let mut entries = match tokio::fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(ts) = name.strip_prefix(&prefix) else {
                continue;
            };
            let Some(t) = parse_datetime(ts) else {
                continue;
            };
            if let Ok((marked, _)) = read_backup_info(&entry.path().join("base")).await
                && marked == t
            {
                found.push(t);
            }
        }
        found.sort();
        Ok(found)
    }

    /// Indices of completed incremental layers inside one backup dir.
    pub async fn get_incrementals(dir: &Path) -> Result<Vec<i32>> {
        let mut found = Vec::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(n) = name.strip_prefix("inc") else {
                continue;
            };
            let Ok(i) = n.parse::<i32>() else {
                continue;
            };
            if read_backup_info(&entry.path()).await.is_ok() {
                found.push(i);
            }
        }
        found.sort();
        Ok(found)
    }

    /// Start times of every compressed archive, oldest first.
    pub async fn get_compresses(&self) -> Result<Vec<DateTime<Local>>> {
        let (_, solo) = self.view().await;
        let prefix = format!("{}.", solo.spec.name);
        let root = backup_root(&solo);

        let mut found = Vec::new();
        let mut entries = match tokio::fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            let Some(ts) = rest.strip_suffix(COMPRESS_EXT) else {
                continue;
            };
            if let Some(t) = parse_datetime(ts) {
                found.push(t);
            }
        }
        found.sort();
        Ok(found)
    }

    /// Take a full physical backup into a fresh dated directory.
    pub async fn full_backup(&self) -> Result<DateTime<Local>> {
        let _lock = self.lock_backup("full backup")?;

        let now = Local::now();
        let dir = self.backup_dir_at(now).await;
        tokio::fs::create_dir_all(&dir).await?;
        let target = dir.join("base");

        let (mysql, solo) = self.view().await;
        tracing::info!(name = %solo.spec.name, ts = %now.format(DATETIME_LAYOUT), "start full backup");

        let args = [
            "--backup".to_string(),
            format!("--target-dir={}", target.display()),
        ];
        run_xtrabackup(&mysql, &solo, &args, TIMEOUT_BACKUP).await?;
        write_backup_info(&target, now).await?;

        tracing::info!(name = %solo.spec.name, "end full backup");
        Ok(now)
    }

    /// Add one incremental layer on top of the backup taken at `t`.
    pub async fn incremental_backup(&self, t: DateTime<Local>) -> Result<i32> {
        let _lock = self.lock_backup("incremental backup")?;

        let dir = self.backup_dir_at(t).await;
        let layers = Self::get_incrementals(&dir).await?;
        let last = layers.last().copied().unwrap_or(0);
        let base = if last > 0 {
            dir.join(format!("inc{last}"))
        } else {
            dir.join("base")
        };
        let next = last + 1;
        let target = dir.join(format!("inc{next}"));

        let (mysql, solo) = self.view().await;
        tracing::info!(name = %solo.spec.name, layer = next, "start incremental backup");

        let now = Local::now();
        let args = [
            "--backup".to_string(),
            format!("--target-dir={}", target.display()),
            format!("--incremental-basedir={}", base.display()),
        ];
        run_xtrabackup(&mysql, &solo, &args, TIMEOUT_BACKUP).await?;
        write_backup_info(&target, now).await?;

        tracing::info!(name = %solo.spec.name, layer = next, "end incremental backup");
        Ok(next)
    }

    /// Compress the newest completed backup, returning the archive path.
    pub async fn compress_last_backup(&self) -> Result<PathBuf> {
        let backups = self.get_backups().await?;
        let Some(last) = backups.last() else {
            bail!("no backups");
        };
        let dir = self.backup_dir_at(*last).await;
        self.compress_backup(&dir).await
    }

    /// Tar+gzip one backup directory next to itself, atomically via a
    /// temporary name.
    pub async fn compress_backup(&self, dir: &Path) -> Result<PathBuf> {
        let _lock = self.lock_backup("compress backup")?;

        let parent = dir.parent().context("backup dir has no parent")?;
        let base = dir
            .file_name()
            .context("backup dir has no name")?
            .to_string_lossy()
            .to_string();
        let archive = parent.join(format!("{base}{COMPRESS_EXT}"));
        let staging = parent.join(format!("{base}{COMPRESS_EXT}.tmp"));

        let src = dir.to_path_buf();
        let tmp = staging.clone();
        tokio::task::spawn_blocking(move || tar_gz_dir(&src, &tmp))
            .await
            .context("compress worker panicked")??;

        tokio::fs::rename(&staging, &archive).await?;
        Ok(archive)
    }

    /// Replay the redo log of a fetched or local backup, folding in any
    /// incremental layers.
    pub async fn prepare_backup(&self, password_id: i32, dir: &Path) -> Result<()> {
        let _lock = self.lock_backup("prepare backup")?;

        let layers = Self::get_incrementals(dir).await?;
        let (mysql, solo) = self.view().await;

        let mut args = vec![
            "--prepare".to_string(),
            format!("--target-dir={}", dir.join("base").display()),
        ];
        if !layers.is_empty() {
            args.push("--apply-log-only".to_string());
        }
        run_xtrabackup_as(&mysql, &solo, password_id, &args, TIMEOUT_PREPARE).await?;

        for (i, layer) in layers.iter().enumerate() {
            let mut args = vec![
                "--prepare".to_string(),
                format!("--target-dir={}", dir.join("base").display()),
                format!("--incremental-dir={}", dir.join(format!("inc{layer}")).display()),
            ];
            if i + 1 < layers.len() {
                args.push("--apply-log-only".to_string());
            }
            run_xtrabackup_as(&mysql, &solo, password_id, &args, TIMEOUT_PREPARE).await?;
        }

        Ok(())
    }

    /// Move or copy a prepared `base` into the data directory.
    pub async fn restore_backup(&self, password_id: i32, dir: &Path, move_back: bool) -> Result<()> {
        let _lock = self.lock_backup("restore backup")?;

        let (mysql, solo) = self.view().await;
        let args = [
            if move_back {
                "--move-back".to_string()
            } else {
                "--copy-back".to_string()
            },
            format!("--target-dir={}", dir.display()),
        ];
        run_xtrabackup_as(&mysql, &solo, password_id, &args, TIMEOUT_PREPARE).await
    }

    /// The GTID cursor recorded by the backup tool; falls back to the
    /// `binlog_pos` line for servers that did not record the prefix form.
    pub async fn read_gtid(&self) -> Result<String> {
        let (_, solo) = self.view().await;
        let info = tokio::fs::read_to_string(data_dir(&solo).join("xtrabackup_info")).await?;
        parse_gtid(&info)
    }
}

pub async fn write_backup_info(dir: &Path, t: DateTime<Local>) -> Result<()> {
    let elapsed = (Local::now() - t).num_milliseconds().max(0) as f64 / 1000.0;
    let line = format!("{} {elapsed}s\n", t.format(DATETIME_LAYOUT));
    tokio::fs::write(dir.join(BACKUP_FILENAME), line).await?;
    Ok(())
}

pub async fn read_backup_info(dir: &Path) -> Result<(DateTime<Local>, Duration)> {
    let body = tokio::fs::read_to_string(dir.join(BACKUP_FILENAME)).await?;
    let line = body.trim();
    let (ts, elapsed) = line.split_once(' ').context("no space in backup marker")?;
    let t = parse_datetime(ts).context("bad timestamp in backup marker")?;
    let secs: f64 = elapsed
        .strip_suffix('s')
        .context("no seconds suffix")?
        .parse()
        .context("bad elapsed in backup marker")?;
    Ok((t, Duration::from_secs_f64(secs.max(0.0))))
}

pub fn parse_datetime(s: &str) -> Option<DateTime<Local>> {
    let naive = chrono::NaiveDateTime::parse_from_str(s, DATETIME_LAYOUT).ok()?;
    Local.from_local_datetime(&naive).single()
}

fn tar_gz_dir(dir: &Path, out: &Path) -> Result<()> {
    let name = dir.file_name().context("dir has no name")?;
    let file = std::fs::File::create(out)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(name, dir)?;
    builder.into_inner()?.finish()?;
    Ok(())
}

async fn run_xtrabackup(
    mysql: &myops_types::Mysql,
    solo: &myops_types::MysqlSolo,
    args: &[String],
    deadline: Duration,
) -> Result<()> {
    run_xtrabackup_as(mysql, solo, solo.spec.id, args, deadline).await
}

async fn run_xtrabackup_as(
    mysql: &myops_types::Mysql,
    solo: &myops_types::MysqlSolo,
    password_id: i32,
    args: &[String],
    deadline: Duration,
) -> Result<()> {
    let mut cmd = tokio::process::Command::new("xtrabackup");
    cmd.arg(format!("--defaults-file={}", my_cnf(solo).display()))
        .arg("--host=127.0.0.1")
        .arg(format!("--port={}", solo.spec.port))
        .arg(format!("--user={}", mysql.spec.local_username))
        .arg(format!(
            "--password={}{}",
            mysql.spec.local_password, password_id
        ));
    for a in args {
        cmd.arg(a);
    }
    cmd.stdout(std::process::Stdio::inherit());
    cmd.stderr(std::process::Stdio::inherit());

    let mut child = cmd.spawn().context("spawn xtrabackup")?;
    let status = tokio::time::timeout(deadline, child.wait())
        .await
        .context("xtrabackup deadline exceeded")??;
    if !status.success() {
        bail!("xtrabackup exited with {status}");
    }
    Ok(())
}

/// Extract the GTID set from `xtrabackup_info` content.
pub fn parse_gtid(info: &str) -> Result<String> {
    const PREFIX: &str = "GTID of the last change";

    if let Some(i) = info.find(PREFIX) {
        let rest = &info[i + PREFIX.len()..];
        let open = rest.find('\'').context("no gtid left single quote")?;
        if !rest[..open].trim().is_empty() {
            bail!("no gtid left single quote");
        }
        let rest = &rest[open + 1..];
        let close = rest.find('\'').context("no gtid right single quote")?;
        let parts: Vec<&str> = rest[..close]
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        return Ok(parts.join(","));
    }

    // binlog_pos = filename 'x', position 'y'[, GTID of the last change 'z']
    for line in info.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        if key.trim() != "binlog_pos" {
            continue;
        }
        let fields: Vec<&str> = value.split(',').collect();
        if fields.len() != 2 && fields.len() != 3 {
            bail!("binlog_pos length {}", fields.len());
        }
        if fields.len() == 2 {
            return Ok(String::new());
        }
        let last = fields[2].trim();
        let open = last.find('\'').context("binlog_pos single quote")?;
        let close = last.rfind('\'').context("binlog_pos single quote")?;
        if close <= open {
            bail!("binlog_pos single quote");
        }
        return Ok(last[open + 1..close].to_string());
    }

    bail!("no gtid in xtrabackup_info")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::sample_mylet;

    #[tokio::test]
    async fn backup_marker_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let t = parse_datetime("20260801.120000").expect("ts");
        write_backup_info(dir.path(), t).await.expect("write");

        let (read, elapsed) = read_backup_info(dir.path()).await.expect("read");
        assert_eq!(read, t);
        assert!(elapsed >= Duration::ZERO);
    }

    #[tokio::test]
    async fn only_marked_backups_are_listed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mylet = sample_mylet(2, 0, dir.path());
        let root = dir.path().join("backup");

        // Complete backup.
        let good = root.join("demo-0.20260801.090000/base");
        tokio::fs::create_dir_all(&good).await.expect("mkdir");
        write_backup_info(&good, parse_datetime("20260801.090000").expect("ts"))
            .await
            .expect("marker");

        // Marker disagrees with the directory name.
        let skewed = root.join("demo-0.20260801.100000/base");
        tokio::fs::create_dir_all(&skewed).await.expect("mkdir");
        write_backup_info(&skewed, parse_datetime("20260801.110000").expect("ts"))
            .await
            .expect("marker");

        // No marker at all.
        tokio::fs::create_dir_all(root.join("demo-0.20260801.120000/base"))
            .await
            .expect("mkdir");

        let backups = mylet.get_backups().await.expect("list");
        assert_eq!(backups, vec![parse_datetime("20260801.090000").expect("ts")]);
    }

    #[tokio::test]
    async fn incremental_layers_require_markers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let t = parse_datetime("20260801.090000").expect("ts");
        for layer in ["inc1", "inc2", "inc4"] {
            let p = dir.path().join(layer);
            tokio::fs::create_dir_all(&p).await.expect("mkdir");
            if layer != "inc2" {
                write_backup_info(&p, t).await.expect("marker");
            }
        }

        let layers = Mylet::get_incrementals(dir.path()).await.expect("list");
        assert_eq!(layers, vec![1, 4]);
    }

    #[tokio::test]
    async fn backing_lock_is_exclusive_and_descriptive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mylet = sample_mylet(2, 0, dir.path());

        let guard = mylet.lock_backup("full backup").expect("lock");
        assert_eq!(mylet.backing(), "full backup");
        let err = mylet.lock_backup("compress backup").expect_err("busy");
        assert!(err.to_string().contains("backing: full backup"));

        drop(guard);
        assert_eq!(mylet.backing(), "");
        mylet.lock_backup("compress backup").expect("free again");
    }

    #[test]
    fn gtid_parses_prefix_form() {
        let info = "tool_name = xtrabackup\nGTID of the last change '0ab-1:1-100,\n 0ab-2:4-7'\n";
        assert_eq!(parse_gtid(info).expect("gtid"), "0ab-1:1-100,0ab-2:4-7");
    }

    #[test]
    fn gtid_parses_binlog_pos_form() {
        let info =
            "binlog_pos = filename 'demo-0-bin.000003', position '157', GTID of the last change '0ab-1:1-5'\n";
        assert_eq!(parse_gtid(info).expect("gtid"), "0ab-1:1-5");
    }

    #[test]
    fn gtid_missing_is_an_error() {
        assert!(parse_gtid("tool_name = xtrabackup\n").is_err());
    }

    #[tokio::test]
    async fn compress_produces_a_dated_archive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mylet = sample_mylet(2, 0, dir.path());
        let backup = dir.path().join("backup/demo-0.20260801.090000");
        tokio::fs::create_dir_all(backup.join("base"))
            .await
            .expect("mkdir");
        tokio::fs::write(backup.join("base/ibdata1"), b"x")
            .await
            .expect("payload");

        let archive = mylet.compress_backup(&backup).await.expect("compress");
        assert_eq!(
            archive.file_name().and_then(|n| n.to_str()),
            Some("demo-0.20260801.090000.tar.gz")
        );
        assert!(archive.exists());
    }
}
