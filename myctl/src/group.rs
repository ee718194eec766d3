use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use myops_common::dial;
use myops_types::{
    Color, Mysql, MysqlReport, MysqlState, PrimaryMode, ReportResult, SpecError, StateKey, Token,
    between, solo_token,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::ctl::{EventQueue, GroupKey};
use crate::switch::{self, SwitchPlan};

/// One supervised cluster: authoritative intent/status, the observation
/// table, switch bookkeeping, and the background observer loop.
#[derive(Clone)]
pub struct MysqlGroup {
    shared: Arc<GroupShared>,
}

pub struct GroupShared {
    key: GroupKey,
    state: Mutex<GroupState>,
    events: EventQueue,
    client: reqwest::Client,
    cancel: CancellationToken,
    /// Outstanding tick workers; nonzero at tick time means we are behind.
    hang: AtomicI32,
}

/// Everything the per-cluster mutex guards. All intent/status/state-table
/// mutations go through this struct while the lock is held.
pub struct GroupState {
    pub mysql: Mysql,
    pub states: HashMap<StateKey, MysqlState>,
    pub switch_count: i32,
    pub switch_time: Option<Instant>,
    pub rand_id: i64,
}

/// What a check pass decided: whether any colour changed (worth an event)
/// and whether a promotion must be fanned out.
#[derive(Default)]
pub struct CheckOutcome {
    pub changed: bool,
    pub plan: Option<SwitchPlan>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SwitchError {
    #[error("primary id out of range")]
    OutOfRange,
    #[error("too frequently")]
    TooFrequently,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReportError {
    #[error("name inconsistent")]
    NameInconsistent,
    #[error("state[{0}] illegal")]
    IllegalState(usize),
    #[error("state[{0}] invalid")]
    InvalidState(usize),
}

fn verdict(red: i32, yellow: i32, green: i32) -> Color {
    if red + yellow > green {
        Color::Red
    } else if red + yellow > 0 {
        Color::Yellow
    } else {
        Color::Green
    }
}

impl MysqlGroup {
    pub fn create(
        mysql: Mysql,
        events: EventQueue,
        client: reqwest::Client,
        rand_id: i64,
    ) -> Result<Self, SpecError> {
        let state = GroupState::new(mysql, rand_id)?;
        let key = state.mysql.nn();
        Ok(Self {
            shared: Arc::new(GroupShared {
                key,
                state: Mutex::new(state),
                events,
                client,
                cancel: CancellationToken::new(),
                hang: AtomicI32::new(0),
            }),
        })
    }

    pub fn state(&self) -> &Mutex<GroupState> {
        &self.shared.state
    }

    pub fn stop(&self) {
        self.shared.cancel.cancel();
    }

    /// The coordinator observer plane: dial every replica each tick, merge
    /// under the group lock, then re-evaluate colours and the election.
    pub async fn run(self) {
        let interval = {
            let state = self.shared.state.lock().await;
            state.mysql.spec.switch_policy.probe_interval()
        };
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shared.cancel.cancelled() => {
                    tracing::info!(namespace = %self.shared.key.0, name = %self.shared.key.1, "group loop exit");
                    return;
                }
                _ = tick.tick() => {}
            }

            let behind = self.shared.hang.fetch_add(1, Ordering::SeqCst);
            if behind > 0 {
                tracing::error!(hang = behind, name = %self.shared.key.1, "observer ticks piling up");
            }

            let group = self.clone();
            tokio::spawn(async move {
                group.tick_once().await;
                group.shared.hang.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }

    async fn tick_once(&self) {
        // Snapshot addresses outside the lock; dialing must not serialize
        // against report ingest.
        let (mysql, deadline) = {
            let state = self.shared.state.lock().await;
            (
                state.mysql.clone(),
                state.mysql.spec.switch_policy.probe_interval(),
            )
        };

        let results = dial::cross_check(&mysql, deadline).await;
        let now = Utc::now();

        let outcome = {
            let mut state = self.shared.state.lock().await;
            state.merge_observer(&results, now);
            let hang = (self.shared.hang.load(Ordering::SeqCst) - 1).max(0);
            if let Some(status) = state.mysql.status.as_mut() {
                status.hang = hang;
            }
            state.check(now)
        };

        self.publish(outcome).await;
    }

    async fn publish(&self, outcome: CheckOutcome) {
        if outcome.changed || outcome.plan.is_some() {
            self.shared.events.push(self.shared.key.clone());
        }
        if let Some(plan) = outcome.plan {
            switch::execute(&self.shared.client, plan).await;
        }
    }
}

impl GroupState {
    pub fn new(mut mysql: Mysql, rand_id: i64) -> Result<Self, SpecError> {
        mysql.default_fill()?;
        mysql.validate()?;

        let write_id = match mysql.spec.primary_id() {
            -1 => 0,
            id => id,
        };
        let mut read_id = mysql.spec.primaries;
        if mysql.spec.replicas() == 0 {
            read_id -= 1;
        }

        let status = mysql.status.get_or_insert_with(Default::default);
        status.color = Color::Yellow;
        for solo in &mut status.solos {
            solo.status.color = Color::Yellow;
        }
        status.write_id = Some(write_id);
        status.read_id = Some(read_id);

        Ok(Self {
            mysql,
            states: HashMap::new(),
            switch_count: 0,
            switch_time: None,
            rand_id,
        })
    }

    fn write_id(&self) -> i32 {
        self.mysql
            .status
            .as_ref()
            .and_then(|s| s.write_id)
            .unwrap_or(0)
    }

    /// Witness counters for `id` over all fresh state entries. Observers
    /// that have not reported within the freshness window fall into the
    /// yellow remainder.
    pub fn color(&self, id: i32) -> (i32, i32, i32) {
        let window = self.mysql.spec.switch_policy.freshness_window();
        let mut red = 0;
        let mut green = 0;
        for s in self.states.values() {
            if s.key.to_id == id && s.yellow_duration < window {
                if s.error_count > 0 && s.red_duration < window {
                    red += 1;
                } else if s.error_count == 0 && s.green_duration < window {
                    green += 1;
                }
            }
        }
        let yellow = (self.mysql.spec.size() + 1) - green - red;
        (red, yellow, green)
    }

    /// Merge one coordinator-plane dial sweep (`fromId = -1`).
    pub fn merge_observer(&mut self, results: &[(i32, Option<String>)], now: DateTime<Utc>) {
        for (id, error) in results {
            let key = StateKey {
                from_id: -1,
                to_id: *id,
            };
            let entry = self
                .states
                .entry(key)
                .or_insert_with(|| MysqlState::new(key));
            if let Some(e) = error
                && entry.error_count % 10 == 0
            {
                tracing::error!(to = *id, error = %e, "dial from coordinator failed");
            }
            entry.merge_dial(now, error.as_deref());
        }
    }

    /// Colour aggregation plus the Classic-mode election. Callers hold the
    /// group lock; the returned plan is executed after it is released.
    pub fn check(&mut self, now: DateTime<Utc>) -> CheckOutcome {
        for s in self.states.values_mut() {
            s.refresh_yellow(now);
        }

        let n = self.mysql.spec.size();
        let per: Vec<Color> = (0..n)
            .map(|i| {
                let (red, yellow, green) = self.color(i);
                verdict(red, yellow, green)
            })
            .collect();

        let mut changed = 0;
        let mut n_red = 0;
        let mut n_yellow = 0;
        if let Some(status) = self.mysql.status.as_mut() {
            for (i, c) in per.iter().enumerate() {
                match c {
                    Color::Red => n_red += 1,
                    Color::Yellow => n_yellow += 1,
                    Color::Green => {}
                }
                if let Some(solo) = status.solos.get_mut(i)
                    && solo.status.color != *c
                {
                    tracing::info!(id = i, from = %solo.status.color, to = %c, "solo color change");
                    solo.status.color = *c;
                    changed += 1;
                }
            }
            let cluster = if n_red > 0 {
                Color::Red
            } else if n_yellow > 0 {
                Color::Yellow
            } else {
                Color::Green
            };
            if status.color != cluster {
                tracing::info!(from = %status.color, to = %cluster, "cluster color change");
                status.color = cluster;
                changed += 1;
            }
        }

        let mut outcome = CheckOutcome {
            changed: changed > 0,
            plan: None,
        };

        if self.mysql.spec.primary_mode != PrimaryMode::Classic {
            return outcome;
        }

        let primary_id = self.mysql.spec.primary_id();
        let (red, yellow, green) = self.color(primary_id);
        let write_id = self.write_id();

        if primary_id != write_id {
            if red + yellow > green {
                tracing::info!(
                    from = write_id,
                    to = primary_id,
                    "cannot change primary, reverting intent"
                );
                self.mysql.spec.primary_id = Some(write_id);
            } else {
                match self.switch_primary(primary_id) {
                    Ok(plan) => outcome.plan = Some(plan),
                    Err(e) => tracing::warn!(error = %e, "switch primary"),
                }
            }
            return outcome;
        }

        if red + yellow > green {
            self.switch_count += 1;
        } else {
            self.switch_count = 0;
        }

        if self.switch_count < self.mysql.spec.switch_policy.switch_trigger_ticks
            || !self.mysql.spec.auto_switch()
        {
            return outcome;
        }

        // Left sweep first: in a chain the left neighbour is most likely
        // caught up. No replication-lag check is made.
        let mut new_id = -1;
        let mut id = primary_id - 1;
        while id >= 0 {
            let (red, yellow, green) = self.color(id);
            if green > red + yellow {
                new_id = id;
                break;
            }
            id -= 1;
        }
        if new_id == -1 {
            for id in primary_id + 1..n {
                let (red, yellow, green) = self.color(id);
                if green > red + yellow {
                    new_id = id;
                    break;
                }
            }
        }
        if new_id != -1 {
            tracing::info!(from = primary_id, to = new_id, "primary lost quorum, electing");
            match self.switch_primary(new_id) {
                Ok(plan) => outcome.plan = Some(plan),
                Err(e) => tracing::warn!(error = %e, "switch primary"),
            }
        }

        outcome
    }

    /// Atomically redirect intent and routing to `new_id` and produce the
    /// agent fan-out plan. Refused inside the cool-down window.
    pub fn switch_primary(&mut self, new_id: i32) -> Result<SwitchPlan, SwitchError> {
        let n = self.mysql.spec.size();
        if new_id < 0 || new_id >= n {
            return Err(SwitchError::OutOfRange);
        }

        let cooldown = self.mysql.spec.switch_policy.switch_cooldown();
        if let Some(last) = self.switch_time
            && last.elapsed() < cooldown
        {
            return Err(SwitchError::TooFrequently);
        }

        tracing::info!(
            group = %self.mysql.group_name(),
            from = self.write_id(),
            to = new_id,
            "switch primary"
        );

        self.mysql.spec.primary_id = Some(new_id);
        if let Some(status) = self.mysql.status.as_mut() {
            status.write_id = Some(new_id);
        }
        self.switch_time = Some(Instant::now());
        self.switch_count = 0;

        Ok(self.switch_plan(new_id))
    }

    fn switch_plan(&self, new_id: i32) -> SwitchPlan {
        let token = solo_token(
            &self.mysql,
            &self.mysql.build_name("myctl"),
            self.rand_id,
        );
        let urls = self
            .mysql
            .status
            .as_ref()
            .map(|s| {
                s.solos
                    .iter()
                    .map(|solo| {
                        format!(
                            "http://{}:{}/api/addons/mylet/switch/primary/{}",
                            solo.spec.host, solo.spec.mylet_port, new_id
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        SwitchPlan {
            group: self.mysql.group_name().to_string(),
            new_id,
            size: self.mysql.spec.size(),
            token,
            urls,
        }
    }

    /// Validate and ingest one agent report. The reporter may only assert
    /// its own observations, one per destination; out-of-range destinations
    /// are dropped without rejecting the report.
    pub fn ingest_report(
        &mut self,
        token: &Token,
        report: &MysqlReport,
        now: DateTime<Utc>,
    ) -> Result<ReportResult, ReportError> {
        if token.name != report.name {
            return Err(ReportError::NameInconsistent);
        }

        let n = self.mysql.spec.size();
        let mut parsed: HashMap<i32, MysqlState> = HashMap::with_capacity(report.states.len());
        for (i, raw) in report.states.iter().enumerate() {
            let state: MysqlState =
                serde_json::from_value(raw.clone()).map_err(|_| ReportError::IllegalState(i))?;
            if state.key.from_id != token.id || parsed.contains_key(&state.key.to_id) {
                return Err(ReportError::InvalidState(i));
            }
            if state.key.to_id < 0 || state.key.to_id >= n {
                continue;
            }
            parsed.insert(state.key.to_id, state);
        }

        for (_, mut state) in parsed {
            state.yellow_time = now;
            self.states.insert(state.key, state);
        }

        let size_spec = self.mysql.size_spec();
        if size_spec != report.size_spec {
            tracing::info!(name = %report.name, "size spec out of sync");
        }

        Ok(ReportResult {
            receive_time: now,
            size_spec,
        })
    }

    /// Absorb a spec change from the reconciliation shell. Reload-class
    /// fields may flip the write target; restart-class fields are copied
    /// through. Nothing is advanced if the candidate fails validation.
    pub fn diff(&mut self, incoming: &Mysql) -> Result<(), SpecError> {
        let current = self.mysql.size_spec();
        let wanted = incoming.size_spec();
        let mut changed = 0;

        if current != wanted {
            let mut candidate = self.mysql.clone();
            candidate.spec.primary_mode = incoming.spec.primary_mode;
            candidate.spec.primaries = incoming.spec.primaries;
            candidate.spec.replicas = Some(wanted.replicas);
            candidate.spec.primary_id = Some(wanted.primary_id);
            candidate.spec.auto_switch = Some(wanted.auto_switch);
            candidate.validate()?;

            self.mysql.spec.primary_mode = incoming.spec.primary_mode;
            self.mysql.spec.primaries = incoming.spec.primaries;
            self.mysql.spec.replicas = Some(wanted.replicas);
            self.mysql.spec.primary_id = Some(wanted.primary_id);
            self.mysql.spec.auto_switch = Some(wanted.auto_switch);
            changed += 1;

            let primary_id = self.mysql.spec.primary_id();
            let write_id = self.write_id();
            if primary_id != write_id {
                let (red, yellow, green) = self.color(primary_id);
                if red + yellow > green {
                    tracing::info!(from = write_id, to = primary_id, "cannot change primary");
                    self.mysql.spec.primary_id = Some(write_id);
                } else {
                    tracing::info!(from = write_id, to = primary_id, "manual change primary");
                    if let Some(status) = self.mysql.status.as_mut() {
                        status.write_id = Some(primary_id);
                    }
                }
            }

            self.mysql.default_fill()?;

            let n = self.mysql.spec.size();
            self.states
                .retain(|k, _| between(k.from_id, -1, n - 1) && between(k.to_id, 0, n - 1));
        }

        let spec = &incoming.spec;
        if self.mysql.spec.enable_exporter != spec.enable_exporter
            || self.mysql.spec.exporter_port != spec.exporter_port
            || self.mysql.spec.exporter_flags != spec.exporter_flags
            || self.mysql.spec.exporter_image != spec.exporter_image
            || self.mysql.spec.exporter_username != spec.exporter_username
            || self.mysql.spec.exporter_password != spec.exporter_password
        {
            self.mysql.spec.enable_exporter = spec.enable_exporter;
            self.mysql.spec.exporter_port = spec.exporter_port;
            self.mysql.spec.exporter_flags = spec.exporter_flags.clone();
            self.mysql.spec.exporter_image = spec.exporter_image.clone();
            self.mysql.spec.exporter_username = spec.exporter_username.clone();
            self.mysql.spec.exporter_password = spec.exporter_password.clone();
            changed += 1;
        }

        if changed > 0 {
            self.mysql.validate()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use myops_types::MysqlSpec;

    use super::*;

    fn sample(replicas: i32) -> Mysql {
        let mut mysql = Mysql::new(
            "demo",
            MysqlSpec {
                replicas: Some(replicas),
                local_password: "lp".into(),
                replica_password: "rp".into(),
                myctl_addr: "myctl:33081".into(),
                ..Default::default()
            },
        );
        mysql.metadata.namespace = Some("default".into());
        mysql
    }

    fn state(replicas: i32) -> GroupState {
        GroupState::new(sample(replicas), 1).expect("group state")
    }

    fn witness(st: &mut GroupState, from: i32, to: i32, ok: bool, now: DateTime<Utc>) {
        let key = StateKey {
            from_id: from,
            to_id: to,
        };
        let entry = st.states.entry(key).or_insert_with(|| MysqlState::new(key));
        entry.merge_dial(now, if ok { None } else { Some("connection refused") });
    }

    /// All four observers vouch for every node.
    fn all_green(st: &mut GroupState, now: DateTime<Utc>) {
        for from in -1..3 {
            for to in 0..3 {
                witness(st, from, to, true, now);
            }
        }
    }

    #[test]
    fn green_baseline_stays_put() {
        let mut st = state(2);
        let now = Utc::now();
        all_green(&mut st, now);

        let outcome = st.check(now);
        assert!(outcome.plan.is_none());
        assert_eq!(st.switch_count, 0);

        let status = st.mysql.status.as_ref().expect("status");
        assert_eq!(status.color, Color::Green);
        for solo in &status.solos {
            assert_eq!(solo.status.color, Color::Green);
        }
        assert_eq!(status.write_id, Some(0));
        // An unset intent resolves to the write target on the first pass.
        assert_eq!(st.mysql.spec.primary_id(), 0);
    }

    #[test]
    fn dead_primary_is_replaced_after_trigger_ticks() {
        let mut st = state(2);
        // Resolve the unset intent to node 0 first.
        let now = Utc::now();
        all_green(&mut st, now);
        st.check(now);
        assert_eq!(st.mysql.spec.primary_id(), 0);

        // Node 0's database stops answering anyone.
        for tick in 0..2 {
            let now = Utc::now();
            for from in -1..3 {
                witness(&mut st, from, 0, false, now);
                witness(&mut st, from, 1, true, now);
                witness(&mut st, from, 2, true, now);
            }
            let outcome = st.check(now);
            if tick == 0 {
                assert!(outcome.plan.is_none());
                assert_eq!(st.switch_count, 1);
            } else {
                let plan = outcome.plan.expect("election fires on second red tick");
                assert_eq!(plan.new_id, 1);
                assert_eq!(plan.urls.len(), 3);
            }
        }

        assert_eq!(st.mysql.spec.primary_id(), 1);
        let status = st.mysql.status.as_ref().expect("status");
        assert_eq!(status.write_id, Some(1));
        assert_eq!(st.switch_count, 0);
        assert_eq!(status.solos[0].status.color, Color::Red);
    }

    #[test]
    fn election_scans_left_before_right() {
        let mut st = state(2);
        let now = Utc::now();
        all_green(&mut st, now);
        st.check(now);

        // Move the primary to 2, then kill 2 while 0 and 1 stay green.
        st.switch_time = None;
        st.switch_primary(2).expect("manual switch");

        for _ in 0..2 {
            let now = Utc::now();
            for from in -1..3 {
                witness(&mut st, from, 0, true, now);
                witness(&mut st, from, 1, true, now);
                witness(&mut st, from, 2, false, now);
            }
            st.switch_time = None; // cooldown is tested separately
            let outcome = st.check(now);
            if let Some(plan) = outcome.plan {
                // Left sweep: 1 is the first index below 2 with a green
                // majority, and it must satisfy the scan predicate.
                assert_eq!(plan.new_id, 1);
                let (red, yellow, green) = st.color(1);
                assert!(green > red + yellow);
                return;
            }
        }
        panic!("election did not fire");
    }

    #[test]
    fn flapping_primary_never_promotes() {
        let mut st = state(2);
        let now = Utc::now();
        all_green(&mut st, now);
        st.check(now);

        for round in 0..6 {
            let now = Utc::now();
            let ok = round % 2 == 1;
            for from in -1..3 {
                witness(&mut st, from, 0, ok, now);
                witness(&mut st, from, 1, true, now);
                witness(&mut st, from, 2, true, now);
            }
            let outcome = st.check(now);
            assert!(outcome.plan.is_none());
            assert!(st.switch_count <= 1);
        }
    }

    #[test]
    fn manual_promotion_to_red_replica_is_reverted() {
        let mut st = state(2);
        let now = Utc::now();
        for from in -1..3 {
            witness(&mut st, from, 0, true, now);
            witness(&mut st, from, 1, true, now);
            witness(&mut st, from, 2, false, now);
        }
        st.check(now);

        let mut incoming = st.mysql.clone();
        incoming.spec.primary_id = Some(2);
        st.diff(&incoming).expect("diff");

        assert_eq!(st.mysql.spec.primary_id(), st.write_id());
        assert_ne!(st.mysql.spec.primary_id(), 2);
    }

    #[test]
    fn manual_promotion_to_green_replica_moves_write_target() {
        let mut st = state(2);
        let now = Utc::now();
        all_green(&mut st, now);
        st.check(now);

        let mut incoming = st.mysql.clone();
        incoming.spec.primary_id = Some(2);
        st.diff(&incoming).expect("diff");

        assert_eq!(st.mysql.spec.primary_id(), 2);
        assert_eq!(st.write_id(), 2);
    }

    #[test]
    fn switch_is_rate_limited() {
        let mut st = state(2);
        st.switch_primary(1).expect("first switch");
        assert_eq!(
            st.switch_primary(2).expect_err("inside cooldown"),
            SwitchError::TooFrequently
        );

        // The sixteenth second is fine.
        st.switch_time = Some(Instant::now() - Duration::from_secs(16));
        st.switch_primary(2).expect("after cooldown");
        assert_eq!(st.write_id(), 2);
    }

    #[test]
    fn switch_rejects_out_of_range() {
        let mut st = state(2);
        assert_eq!(
            st.switch_primary(3).expect_err("out of range"),
            SwitchError::OutOfRange
        );
        assert_eq!(
            st.switch_primary(-1).expect_err("out of range"),
            SwitchError::OutOfRange
        );
    }

    #[test]
    fn shrinking_the_cluster_prunes_state_entries() {
        let mut st = state(2);
        let now = Utc::now();
        all_green(&mut st, now);

        let mut incoming = st.mysql.clone();
        incoming.spec.replicas = Some(1);
        st.diff(&incoming).expect("diff");

        assert!(st.states.keys().all(|k| k.to_id < 2 && k.from_id < 2));
    }

    fn reporter(st: &GroupState, id: i32) -> Token {
        let name = st.mysql.solo_name(id);
        myops_types::parse_token(&solo_token(&st.mysql, &name, 7)).expect("token")
    }

    fn raw_state(from: i32, to: i32) -> serde_json::Value {
        let mut s = MysqlState::new(StateKey {
            from_id: from,
            to_id: to,
        });
        s.merge_dial(Utc::now(), None);
        serde_json::to_value(&s).expect("state json")
    }

    fn report(st: &GroupState, id: i32, states: Vec<serde_json::Value>) -> MysqlReport {
        MysqlReport {
            name: st.mysql.solo_name(id),
            size_spec: st.mysql.size_spec(),
            states,
            hang: 0,
        }
    }

    #[test]
    fn report_from_matching_reporter_is_ingested() {
        let mut st = state(2);
        let token = reporter(&st, 1);
        let r = report(&st, 1, vec![raw_state(1, 0), raw_state(1, 2)]);

        let now = Utc::now();
        let result = st.ingest_report(&token, &r, now).expect("ingest");
        assert_eq!(result.size_spec, st.mysql.size_spec());
        assert!(st.states.contains_key(&StateKey { from_id: 1, to_id: 0 }));
        assert_eq!(st.states[&StateKey { from_id: 1, to_id: 2 }].yellow_time, now);
    }

    #[test]
    fn report_asserting_foreign_observations_is_rejected() {
        let mut st = state(2);
        let token = reporter(&st, 1);
        let r = report(&st, 1, vec![raw_state(2, 0)]);
        assert_eq!(
            st.ingest_report(&token, &r, Utc::now()),
            Err(ReportError::InvalidState(0))
        );
        assert!(st.states.is_empty());
    }

    #[test]
    fn report_with_duplicate_destination_is_rejected_whole() {
        let mut st = state(2);
        let token = reporter(&st, 1);
        let r = report(&st, 1, vec![raw_state(1, 0), raw_state(1, 0)]);
        assert_eq!(
            st.ingest_report(&token, &r, Utc::now()),
            Err(ReportError::InvalidState(1))
        );
        assert!(st.states.is_empty());
    }

    #[test]
    fn out_of_range_destinations_are_dropped_silently() {
        let mut st = state(2);
        let token = reporter(&st, 1);
        let r = report(&st, 1, vec![raw_state(1, 0), raw_state(1, 9)]);
        st.ingest_report(&token, &r, Utc::now()).expect("ingest");
        assert!(st.states.contains_key(&StateKey { from_id: 1, to_id: 0 }));
        assert!(!st.states.contains_key(&StateKey { from_id: 1, to_id: 9 }));
    }

    #[test]
    fn report_under_wrong_name_is_rejected() {
        let mut st = state(2);
        let token = reporter(&st, 1);
        let mut r = report(&st, 1, vec![]);
        r.name = st.mysql.solo_name(2);
        assert_eq!(
            st.ingest_report(&token, &r, Utc::now()),
            Err(ReportError::NameInconsistent)
        );
    }
}
