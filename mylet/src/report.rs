use anyhow::{Context, Result, bail};
use chrono::Utc;
use myops_common::dial;
use myops_types::{Envelope, MysqlReport, ReportResult, SizeSpec, StateKey, solo_token};

use crate::agent::Mylet;

impl Mylet {
    /// The agent observer plane: dial every solo's database port (our own
    /// included) every probe interval and fold the results into the local
    /// state table.
    pub async fn probe_loop(self) {
        let interval = {
            let state = self.shared.state.lock().await;
            state.mysql.spec.switch_policy.probe_interval()
        };
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.shared.exit.cancelled() => return,
                _ = tick.tick() => {}
            }
            self.probe_once().await;
        }
    }

    pub(crate) async fn probe_once(&self) {
        let (mysql, solo) = self.view().await;
        let deadline = mysql.spec.switch_policy.probe_interval();
        let results = dial::cross_check(&mysql, deadline).await;
        let now = Utc::now();

        let mut state = self.shared.state.lock().await;
        let own = solo.spec.id;
        for (to, error) in &results {
            let key = StateKey {
                from_id: own,
                to_id: *to,
            };
            let entry = state
                .states
                .entry(key)
                .or_insert_with(|| myops_types::MysqlState::new(key));
            entry.merge_dial(now, error.as_deref());

            if *to == own {
                if error.is_some() {
                    state.hang += 1;
                } else {
                    state.hang = 0;
                }
            }
        }
    }

    /// POST the aggregated report every report interval; a size-spec echo
    /// that disagrees with our view triggers a reload.
    pub async fn report_loop(self) {
        let interval = {
            let state = self.shared.state.lock().await;
            state.mysql.spec.switch_policy.report_interval()
        };
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.shared.exit.cancelled() => return,
                _ = tick.tick() => {}
            }
            if let Err(e) = self.send_report().await {
                tracing::error!(error = %e, "send report");
            }
        }
    }

    pub(crate) async fn send_report(&self) -> Result<()> {
        let (report, token, url, deadline) = {
            let state = self.shared.state.lock().await;
            let mysql = &state.mysql;
            let states = state
                .states
                .values()
                .map(serde_json::to_value)
                .collect::<Result<Vec<_>, _>>()?;
            let report = MysqlReport {
                name: state.solo.spec.name.clone(),
                size_spec: mysql.size_spec(),
                states,
                hang: state.hang,
            };
            let token = solo_token(mysql, &state.solo.spec.name, self.shared.rand_id);
            let url = format!(
                "http://{}/api/addons/myctl/{}/report",
                mysql.spec.myctl_addr, self.shared.namespace
            );
            let deadline = mysql.spec.switch_policy.report_deadline();
            (report, token, url, deadline)
        };

        let response = self
            .shared
            .client
            .post(&url)
            .header("Token", token)
            .timeout(deadline)
            .json(&report)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            bail!("status code {status}, body: {body}");
        }

        let envelope: Envelope<ReportResult> = serde_json::from_str(&body)?;
        let result = envelope
            .into_result()
            .map_err(|e| anyhow::anyhow!("return error: {e}"))?;

        let current = {
            let state = self.shared.state.lock().await;
            state.mysql.size_spec()
        };
        if result.size_spec != current {
            self.reload(result.size_spec).await?;
        }
        Ok(())
    }

    /// Converge on the coordinator's intent. Structural changes (mode,
    /// primaries, an index squeezed out of range) are restart-class: the
    /// exit signal fires and the orchestrator redeploys us.
    pub async fn reload(&self, ss: SizeSpec) -> Result<()> {
        {
            let mut state = self.shared.state.lock().await;
            state.mysql.spec.auto_switch = Some(ss.auto_switch);
        }

        let (mysql, _) = self.view().await;

        if mysql.spec.replicas() != ss.replicas {
            tracing::info!(from = mysql.spec.replicas(), to = ss.replicas, "change replicas");

            let (old_source, rewire) = {
                let mut state = self.shared.state.lock().await;
                state.mysql.spec.replicas = Some(ss.replicas);

                if let Err(e) = state
                    .mysql
                    .default_fill()
                    .and_then(|_| state.mysql.validate())
                {
                    tracing::info!("reload replicas failed, restart");
                    self.shared.exit.cancel();
                    return Err(e.into());
                }

                let own = state.solo.spec.id;
                if own >= state.mysql.spec.size() {
                    tracing::info!("reload leaves this solo out of range, restart");
                    self.shared.exit.cancel();
                    bail!("solo {own} out of range after reload");
                }

                let old_source = state.solo.spec.source_id;
                let refreshed = state
                    .mysql
                    .status
                    .as_ref()
                    .and_then(|s| s.solos.get(own as usize))
                    .cloned()
                    .context("own solo missing after reload")?;
                state.solo = refreshed.clone();
                (old_source, refreshed.spec.source_id)
            };

            if !self.is_primary().await && rewire != old_source {
                let rewired = async {
                    self.stop_replica().await?;
                    self.setup_replica().await
                }
                .await;
                if let Err(e) = rewired {
                    tracing::info!("reload replica failed, restart");
                    self.shared.exit.cancel();
                    return Err(e);
                }
            }
        }

        if mysql.spec.primary_mode != ss.primary_mode || mysql.spec.primaries != ss.primaries {
            tracing::info!("primary mode or/and primaries changed, restart");
            self.shared.exit.cancel();
            return Ok(());
        }

        if mysql.spec.primary_id() != ss.primary_id
            && let Err(e) = self.change_primary(ss.primary_id).await
        {
            tracing::info!("change primary failed, restart");
            self.shared.exit.cancel();
            return Err(e);
        }

        Ok(())
    }
}
