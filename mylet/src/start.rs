use std::time::Duration;

use anyhow::{Context, Result, bail};
use mysql_async::Conn;
use myops_types::MysqlVersion;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

use crate::agent::{Mylet, data_dir, mysqld_command};
use crate::db::{self, TIMEOUT_5S};

/// 720 polls of 5 s: a bootstrap restore gets a full hour to come up.
const MAX_STARTUP: i32 = 720;

impl Mylet {
    /// The supervisor: spawn mysqld, gate probes on the post-start checks,
    /// then monitor for exit, switch commands, and shutdown. Restart with a
    /// cap on failure; exceeding the cap is fatal for the whole agent.
    pub async fn supervise(self) -> Result<()> {
        let mut switch_rx = self
            .shared
            .switch_rx
            .lock()
            .await
            .take()
            .context("supervisor already running")?;

        loop {
            if self.shared.exit.is_cancelled() {
                tracing::info!("supervisor exits");
                return Ok(());
            }

            let restart_count = {
                let state = self.shared.state.lock().await;
                state.restart_count
            };
            if restart_count >= self.shared.restart_limit {
                bail!(
                    "mysqld restart count exceeds the limit: {}",
                    self.shared.restart_limit
                );
            }
            if restart_count > 0 {
                tracing::info!(attempt = restart_count, "mysqld restart");
                tokio::time::sleep(TIMEOUT_5S).await;
            }

            let (_, solo) = self.view().await;
            if let Err(e) = cleanup_stale_files(&data_dir(&solo)).await {
                tracing::error!(error = %e, "cleanup stale pid/socket files");
                return Err(e);
            }

            let mut child = match mysqld_command(&solo, &[]).spawn() {
                Ok(child) => child,
                Err(e) => {
                    tracing::error!(error = %e, "failed to start mysqld");
                    self.bump_restart().await;
                    continue;
                }
            };

            if let Err(e) = self.post_start_checks(&mut child).await {
                tracing::error!(error = %e, "post-start checks failed");
                terminate(&mut child).await;
                self.bump_restart().await;
                continue;
            }

            tracing::info!("mysqld is running and passed initial checks");
            {
                let mut state = self.shared.state.lock().await;
                state.restart_count = 0;
            }

            // Monitor until the child dies or we are told to stop; switch
            // commands are handled inline without disturbing the child.
            loop {
                tokio::select! {
                    _ = self.shared.exit.cancelled() => {
                        tracing::info!("stopping mysqld");
                        terminate(&mut child).await;
                        return Ok(());
                    }
                    status = child.wait() => {
                        tracing::error!(?status, "mysqld exited unexpectedly");
                        self.probes().clear();
                        self.bump_restart().await;
                        break;
                    }
                    Some(new_id) = switch_rx.recv() => {
                        if let Err(e) = self.change_primary(new_id).await {
                            tracing::error!(error = %e, new_id, "change primary");
                        }
                    }
                }
            }
        }
    }

    async fn bump_restart(&self) {
        let mut state = self.shared.state.lock().await;
        state.restart_count += 1;
    }

    /// Wait for the engine to answer, gate on the version, then install the
    /// role and open the probe gates.
    async fn post_start_checks(&self, child: &mut Child) -> Result<()> {
        let mut version = None;
        for attempt in 1..=MAX_STARTUP {
            if let Some(status) = child.try_wait()? {
                bail!("mysqld exited during startup with {status}");
            }

            tracing::info!(attempt, "waiting for mysqld version");
            tokio::time::sleep(TIMEOUT_5S).await;

            match self.query_version().await {
                Ok(v) => {
                    version = Some(v);
                    break;
                }
                Err(e) => tracing::error!(error = %e, "get mysqld version"),
            }
        }
        let version = version.context("failed to get mysqld version after max startups")?;

        self.probes().set_startup(true);

        let expected = {
            let state = self.shared.state.lock().await;
            state
                .mysql
                .status
                .as_ref()
                .map(|s| s.version.clone())
                .unwrap_or_default()
        };
        check_version(&version, &expected)?;

        if self.is_primary().await {
            self.setup_primary().await.context("setup primary")?;
            tracing::info!(%version, "started primary mysqld");

            let enable_exporter = {
                let state = self.shared.state.lock().await;
                state.mysql.spec.enable_exporter
            };
            if enable_exporter
                && let Err(e) = self.exporter_user().await
            {
                tracing::error!(error = %e, "exporter user");
            }
        } else {
            self.setup_replica().await.context("setup replica")?;
            tracing::info!(%version, "started replica mysqld");
        }

        self.probes().set_liveness(true);
        self.probes().set_readiness(true);
        Ok(())
    }

    async fn query_version(&self) -> Result<String> {
        let (mysql, solo) = self.view().await;
        let mut conn = Conn::new(db::local_opts(&mysql, &solo.spec, solo.spec.id)).await?;
        let version = db::query_string(&mut conn, "SELECT VERSION();", TIMEOUT_5S).await?;
        let _ = conn.disconnect().await;
        Ok(version)
    }
}

/// Major and minor must match the expected line exactly; patch only has a
/// floor, so in-place patch upgrades are tolerated.
pub fn check_version(version: &str, expected: &MysqlVersion) -> Result<()> {
    let (major, rest) = split_number(version)
        .with_context(|| format!("mysqld major version invalid: {version}"))?;
    let rest = rest
        .strip_prefix('.')
        .with_context(|| format!("mysqld major version invalid: {version}"))?;
    if major != expected.major {
        bail!("mysqld major version not equal {}: {version}", expected.major);
    }

    let (minor, rest) = split_number(rest)
        .with_context(|| format!("mysqld minor version invalid: {version}"))?;
    if minor != expected.minor {
        bail!("mysqld minor version not equal {}: {version}", expected.minor);
    }
    let rest = rest
        .strip_prefix('.')
        .with_context(|| format!("mysqld patch version invalid: {version}"))?;

    let (patch, _) = split_number(rest)
        .with_context(|| format!("mysqld patch version invalid: {version}"))?;
    if patch < expected.patch {
        bail!(
            "mysqld patch version must equal or greater than {}: {version}",
            expected.patch
        );
    }

    Ok(())
}

fn split_number(s: &str) -> Option<(i32, &str)> {
    let end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    Some((s[..end].parse().ok()?, &s[end..]))
}

/// Remove leftover pid/socket files so a restarted engine does not trip
/// over its previous life.
pub async fn cleanup_stale_files(datadir: &std::path::Path) -> Result<()> {
    let mut entries = match tokio::fs::read_dir(datadir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(".pid") || name.ends_with(".sock") || name.ends_with(".sock.lock") {
            if tokio::fs::remove_file(entry.path()).await.is_ok() {
                tracing::info!(file = %name, "removed stale file");
            }
        }
    }
    Ok(())
}

/// SIGTERM the child and wait for it; a child that already died is fine.
pub async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
    }
    let _ = child.wait().await;
}

/// Collect any orphaned descendants (backup tools double-fork) with a
/// non-blocking reap every 5 s.
pub async fn reap_zombies(exit: CancellationToken) {
    let mut tick = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = exit.cancelled() => return,
            _ = tick.tick() => {}
        }
        loop {
            use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
            match waitpid(
                nix::unistd::Pid::from_raw(-1),
                Some(WaitPidFlag::WNOHANG),
            ) {
                Ok(WaitStatus::StillAlive) | Err(_) => break,
                Ok(status) => tracing::debug!(?status, "reaped child"),
            }
        }
    }
}
