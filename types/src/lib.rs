use std::collections::BTreeMap;
use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

mod state;
mod token;

pub use state::*;
pub use token::*;

/// Aggregate health verdict. Ordering is by severity: `Green < Yellow < Red`,
/// so the cluster verdict is the `max` over all replicas.
#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, JsonSchema,
)]
pub enum Color {
    Green,
    #[default]
    Yellow,
    Red,
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Color::Green => write!(f, "Green"),
            Color::Yellow => write!(f, "Yellow"),
            Color::Red => write!(f, "Red"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum PrimaryMode {
    /// One primary plus N chained replicas; the only mode the fail-over
    /// state machine operates on.
    #[default]
    Classic,
    /// Native group replication, single-primary.
    Single,
    /// Native group replication, multi-primary.
    Multi,
}

/// Every timing knob of the health/fail-over machinery, exposed on the spec
/// rather than hard-coded.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SwitchPolicy {
    #[serde(default = "default_probe_interval_seconds")]
    pub probe_interval_seconds: u64,
    /// Observations older than this no longer count as witnesses.
    #[serde(default = "default_freshness_window_seconds")]
    pub freshness_window_seconds: u64,
    /// Minimum spacing between two promotions.
    #[serde(default = "default_switch_cooldown_seconds")]
    pub switch_cooldown_seconds: u64,
    /// Consecutive red ticks required before an automatic switch.
    #[serde(default = "default_switch_trigger_ticks")]
    pub switch_trigger_ticks: i32,
    #[serde(default = "default_restart_limit")]
    pub restart_limit: i32,
    /// A backup younger than this satisfies a `replication` download.
    #[serde(default = "default_backup_fresh_hours")]
    pub backup_fresh_hours: u64,
    #[serde(default = "default_report_interval_seconds")]
    pub report_interval_seconds: u64,
    #[serde(default = "default_report_deadline_seconds")]
    pub report_deadline_seconds: u64,
}

impl Default for SwitchPolicy {
    fn default() -> Self {
        Self {
            probe_interval_seconds: default_probe_interval_seconds(),
            freshness_window_seconds: default_freshness_window_seconds(),
            switch_cooldown_seconds: default_switch_cooldown_seconds(),
            switch_trigger_ticks: default_switch_trigger_ticks(),
            restart_limit: default_restart_limit(),
            backup_fresh_hours: default_backup_fresh_hours(),
            report_interval_seconds: default_report_interval_seconds(),
            report_deadline_seconds: default_report_deadline_seconds(),
        }
    }
}

impl SwitchPolicy {
    pub fn probe_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.probe_interval_seconds)
    }

    pub fn freshness_window(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.freshness_window_seconds)
    }

    pub fn switch_cooldown(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.switch_cooldown_seconds)
    }

    pub fn report_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.report_interval_seconds)
    }

    pub fn report_deadline(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.report_deadline_seconds)
    }

    pub fn backup_freshness(&self) -> chrono::Duration {
        chrono::Duration::hours(self.backup_fresh_hours as i64)
    }
}

fn default_probe_interval_seconds() -> u64 {
    5
}

fn default_freshness_window_seconds() -> u64 {
    15
}

fn default_switch_cooldown_seconds() -> u64 {
    15
}

fn default_switch_trigger_ticks() -> i32 {
    2
}

fn default_restart_limit() -> i32 {
    5
}

fn default_backup_fresh_hours() -> u64 {
    24
}

fn default_report_interval_seconds() -> u64 {
    10
}

fn default_report_deadline_seconds() -> u64 {
    3
}

fn default_version() -> String {
    "v5.7".to_string()
}

fn default_primaries() -> i32 {
    1
}

fn default_local_username() -> String {
    "root".to_string()
}

fn default_replica_username() -> String {
    "repl".to_string()
}

fn default_storage_class_name() -> String {
    "standard".to_string()
}

fn default_storage_size() -> String {
    "10Gi".to_string()
}

fn default_image_pull_policy() -> String {
    "IfNotPresent".to_string()
}

fn default_port() -> u16 {
    3306
}

fn default_mylet_port() -> u16 {
    33080
}

fn default_group_port() -> u16 {
    33061
}

fn default_exporter_port() -> u16 {
    9104
}

fn default_exporter_username() -> String {
    "exporter".to_string()
}

fn default_mydir() -> String {
    "/mydir".to_string()
}

#[derive(CustomResource, Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "database.myops.dev",
    version = "v1",
    kind = "Mysql",
    plural = "mysqls",
    derive = "PartialEq",
    status = "MysqlStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(printcolumn = "{\"jsonPath\": \".spec.version\", \"name\": \"Version\", \"type\": \"string\" }")]
#[kube(printcolumn = "{\"jsonPath\": \".spec.primaries\", \"name\": \"Primaries\", \"type\": \"integer\" }")]
#[kube(printcolumn = "{\"jsonPath\": \".spec.replicas\", \"name\": \"Replicas\", \"type\": \"integer\" }")]
#[kube(printcolumn = "{\"jsonPath\": \".status.color\", \"name\": \"Color\", \"type\": \"string\" }")]
#[kube(printcolumn = "{\"jsonPath\": \".status.writeId\", \"name\": \"WriteId\", \"type\": \"integer\" }")]
#[kube(printcolumn = "{\"jsonPath\": \".status.readId\", \"name\": \"ReadId\", \"type\": \"integer\" }")]
#[serde(rename_all = "camelCase")]
pub struct MysqlSpec {
    /// Database engine line, `v5.7` or `v8.0`.
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub primary_mode: PrimaryMode,

    #[serde(default = "default_primaries")]
    pub primaries: i32,

    #[serde(default)]
    pub replicas: Option<i32>,

    /// Intended primary index; `-1` lets the coordinator choose.
    #[serde(default)]
    pub primary_id: Option<i32>,

    /// Gates automatic fail-over.
    #[serde(default)]
    pub auto_switch: Option<bool>,

    #[serde(default = "default_local_username")]
    pub local_username: String,
    #[serde(default)]
    pub local_password: String,
    #[serde(default = "default_replica_username")]
    pub replica_username: String,
    #[serde(default)]
    pub replica_password: String,

    #[serde(default = "default_storage_class_name")]
    pub storage_class_name: String,
    #[serde(default = "default_storage_size")]
    pub storage_size: String,

    #[serde(default)]
    pub image: String,
    #[serde(default = "default_image_pull_policy")]
    pub image_pull_policy: String,

    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_mylet_port")]
    pub mylet_port: u16,

    #[serde(default = "default_mydir")]
    pub mydir: String,
    #[serde(default)]
    pub myctl_addr: String,
    #[serde(default)]
    pub headless_host: String,
    #[serde(default)]
    pub short_headless_host: String,

    #[serde(default)]
    pub enable_exporter: bool,
    #[serde(default = "default_exporter_port")]
    pub exporter_port: u16,
    #[serde(default)]
    pub exporter_flags: Vec<String>,
    #[serde(default)]
    pub exporter_image: String,
    #[serde(default = "default_exporter_username")]
    pub exporter_username: String,
    #[serde(default)]
    pub exporter_password: String,

    #[serde(default = "default_group_port")]
    pub group_port: u16,
    #[serde(default)]
    pub group_name: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    #[serde(default)]
    pub switch_policy: SwitchPolicy,
}

// Kept in line with the serde defaults above, so a spec built in code and a
// spec deserialized from an empty object agree.
impl Default for MysqlSpec {
    fn default() -> Self {
        Self {
            version: default_version(),
            primary_mode: PrimaryMode::default(),
            primaries: default_primaries(),
            replicas: None,
            primary_id: None,
            auto_switch: None,
            local_username: default_local_username(),
            local_password: String::new(),
            replica_username: default_replica_username(),
            replica_password: String::new(),
            storage_class_name: default_storage_class_name(),
            storage_size: default_storage_size(),
            image: String::new(),
            image_pull_policy: default_image_pull_policy(),
            port: default_port(),
            mylet_port: default_mylet_port(),
            mydir: default_mydir(),
            myctl_addr: String::new(),
            headless_host: String::new(),
            short_headless_host: String::new(),
            enable_exporter: false,
            exporter_port: default_exporter_port(),
            exporter_flags: Vec::new(),
            exporter_image: String::new(),
            exporter_username: default_exporter_username(),
            exporter_password: String::new(),
            group_port: default_group_port(),
            group_name: String::new(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            switch_policy: SwitchPolicy::default(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MysqlVersion {
    pub major: i32,
    pub minor: i32,
    pub patch: i32,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MysqlSoloSpec {
    pub name: String,
    pub id: i32,
    pub host: String,
    pub short_host: String,
    pub port: u16,
    pub mylet_port: u16,
    pub group_port: u16,
    pub server_id: i32,
    /// Upstream replica index in the chain; `-1` on the primary.
    pub source_id: i32,
    pub mydir: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MysqlSoloStatus {
    #[serde(default)]
    pub color: Color,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MysqlSolo {
    pub spec: MysqlSoloSpec,
    #[serde(default)]
    pub status: MysqlSoloStatus,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MysqlStatus {
    #[serde(default)]
    pub version: MysqlVersion,
    #[serde(default)]
    pub solos: Vec<MysqlSolo>,
    #[serde(default)]
    pub color: Color,
    /// Replica currently receiving writes.
    #[serde(default)]
    pub write_id: Option<i32>,
    /// Replica currently serving reads.
    #[serde(default)]
    pub read_id: Option<i32>,
    /// Outstanding probe workers, advisory.
    #[serde(default)]
    pub hang: i32,
}

#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("invalid version: {0}")]
    Version(String),
    #[error("primaries must be 1 in Classic mode, got {0}")]
    Primaries(i32),
    #[error("replicas must be >= 0, got {0}")]
    Replicas(i32),
    #[error("primary id {0} out of range [-1, {1})")]
    PrimaryId(i32, i32),
    #[error("{0} required")]
    Required(&'static str),
    #[error("{0} must not contain any quotation marks")]
    Quoted(&'static str),
    #[error("cluster name required")]
    Unnamed,
}

/// True when any input contains a quote character that would break an
/// interpolated SQL literal.
pub fn has_quote(parts: &[&str]) -> bool {
    parts
        .iter()
        .any(|s| s.contains('\'') || s.contains('"') || s.contains('`'))
}

/// Index of the upstream neighbour toward `primary_id` in a replication
/// chain; `-1` for the primary itself.
pub fn chain_source_id(id: i32, primary_id: i32) -> i32 {
    if id > primary_id {
        id - 1
    } else if id < primary_id {
        id + 1
    } else {
        -1
    }
}

pub fn between(v: i32, lo: i32, hi: i32) -> bool {
    v >= lo && v <= hi
}

impl MysqlSpec {
    pub fn size(&self) -> i32 {
        self.primaries + self.replicas.unwrap_or(0)
    }

    pub fn replicas(&self) -> i32 {
        self.replicas.unwrap_or(0)
    }

    pub fn primary_id(&self) -> i32 {
        self.primary_id.unwrap_or(-1)
    }

    pub fn auto_switch(&self) -> bool {
        self.auto_switch.unwrap_or(true)
    }

    /// Expected engine version for this spec line.
    pub fn expect_version(&self) -> Result<MysqlVersion, SpecError> {
        match self.version.as_str() {
            "v5.7" => Ok(MysqlVersion {
                major: 5,
                minor: 7,
                patch: 0,
            }),
            "v8.0" => Ok(MysqlVersion {
                major: 8,
                minor: 0,
                patch: 0,
            }),
            other => Err(SpecError::Version(other.to_string())),
        }
    }
}

impl Mysql {
    pub fn nn(&self) -> (String, String) {
        (
            self.metadata.namespace.clone().unwrap_or_default(),
            self.metadata.name.clone().unwrap_or_default(),
        )
    }

    pub fn group_name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn build_name(&self, suffix: &str) -> String {
        format!("{}-{}", self.group_name(), suffix)
    }

    pub fn solo_name(&self, id: i32) -> String {
        format!("{}-{}", self.group_name(), id)
    }

    pub fn solo_host(&self, id: i32) -> String {
        format!("{}.{}", self.solo_name(id), self.spec.headless_host)
    }

    pub fn solo_short_host(&self, id: i32) -> String {
        format!("{}.{}", self.solo_name(id), self.spec.short_headless_host)
    }

    pub fn new_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("addon".to_string(), "mysql".to_string()),
            ("group".to_string(), self.group_name().to_string()),
        ])
    }

    pub fn size_spec(&self) -> SizeSpec {
        SizeSpec {
            primary_mode: self.spec.primary_mode,
            primaries: self.spec.primaries,
            replicas: self.spec.replicas(),
            primary_id: self.spec.primary_id(),
            auto_switch: self.spec.auto_switch(),
        }
    }

    /// Comma-joined group replication seed list over the primary candidates.
    pub fn group_seeds(&self) -> String {
        (0..self.spec.primaries)
            .map(|id| format!("{}:{}", self.solo_short_host(id), self.spec.group_port))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Fill derived fields: hosts, the expected engine version, and one solo
    /// per index with its chain source. Idempotent.
    pub fn default_fill(&mut self) -> Result<(), SpecError> {
        let (ns, name) = self.nn();
        if name.is_empty() {
            return Err(SpecError::Unnamed);
        }

        if self.spec.replicas.is_none() {
            self.spec.replicas = Some(0);
        }
        if self.spec.primary_id.is_none() {
            self.spec.primary_id = Some(-1);
        }
        if self.spec.auto_switch.is_none() {
            self.spec.auto_switch = Some(true);
        }
        if self.spec.group_name.is_empty() {
            self.spec.group_name = name.clone();
        }
        if self.spec.short_headless_host.is_empty() {
            self.spec.short_headless_host = self.build_name(HEADLESS_SUFFIX);
        }
        if self.spec.headless_host.is_empty() {
            self.spec.headless_host =
                format!("{}.{}.svc.cluster.local", self.spec.short_headless_host, ns);
        }

        let version = self.spec.expect_version()?;
        self.status.get_or_insert_with(Default::default).version = version;

        // The chain is laid out toward the intended primary; an unset intent
        // anchors the chain at index 0 until the coordinator chooses.
        let anchor = match self.spec.primary_id() {
            -1 => 0,
            id => id,
        };
        let size = self.spec.size();
        let mut solos = Vec::with_capacity(size as usize);
        for id in 0..size {
            let color = self
                .status
                .as_ref()
                .and_then(|s| s.solos.get(id as usize))
                .map(|s| s.status.color)
                .unwrap_or_default();
            solos.push(MysqlSolo {
                spec: MysqlSoloSpec {
                    name: self.solo_name(id),
                    id,
                    host: self.solo_host(id),
                    short_host: self.solo_short_host(id),
                    port: self.spec.port,
                    mylet_port: self.spec.mylet_port,
                    group_port: self.spec.group_port,
                    server_id: id + 1,
                    source_id: chain_source_id(id, anchor),
                    mydir: self.spec.mydir.clone(),
                },
                status: MysqlSoloStatus { color },
            });
        }
        self.status.get_or_insert_with(Default::default).solos = solos;

        Ok(())
    }

    pub fn validate(&self) -> Result<(), SpecError> {
        let spec = &self.spec;
        spec.expect_version()?;

        if spec.primary_mode == PrimaryMode::Classic && spec.primaries != 1 {
            return Err(SpecError::Primaries(spec.primaries));
        }
        if spec.replicas() < 0 {
            return Err(SpecError::Replicas(spec.replicas()));
        }
        let size = spec.size();
        if !between(spec.primary_id(), -1, size - 1) {
            return Err(SpecError::PrimaryId(spec.primary_id(), size));
        }

        if spec.local_password.is_empty() {
            return Err(SpecError::Required("local password"));
        }
        if spec.replica_password.is_empty() {
            return Err(SpecError::Required("replica password"));
        }
        if has_quote(&[
            &spec.local_username,
            &spec.local_password,
            &spec.replica_username,
            &spec.replica_password,
        ]) {
            return Err(SpecError::Quoted("credentials"));
        }
        if spec.enable_exporter && has_quote(&[&spec.exporter_username, &spec.exporter_password]) {
            return Err(SpecError::Quoted("exporter credentials"));
        }

        Ok(())
    }
}

pub const HEADLESS_SUFFIX: &str = "x";

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample(replicas: i32) -> Mysql {
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
        mysql.default_fill().expect("default_fill");
        mysql
    }

    #[test]
    fn colors_order_by_severity() {
        assert!(Color::Green < Color::Yellow);
        assert!(Color::Yellow < Color::Red);
        assert_eq!(Color::Red.max(Color::Green), Color::Red);
    }

    #[test]
    fn chain_points_toward_primary() {
        assert_eq!(chain_source_id(0, 0), -1);
        assert_eq!(chain_source_id(1, 0), 0);
        assert_eq!(chain_source_id(2, 0), 1);
        assert_eq!(chain_source_id(0, 2), 1);
        assert_eq!(chain_source_id(1, 2), 2);
        assert_eq!(chain_source_id(2, 2), -1);
    }

    #[test]
    fn default_fill_builds_solos() {
        let mysql = sample(2);
        let status = mysql.status.as_ref().expect("status");
        assert_eq!(status.solos.len(), 3);
        assert_eq!(status.solos[0].spec.name, "demo-0");
        assert_eq!(status.solos[0].spec.source_id, -1);
        assert_eq!(status.solos[1].spec.source_id, 0);
        assert_eq!(status.solos[2].spec.source_id, 1);
        assert_eq!(status.solos[2].spec.server_id, 3);
        assert_eq!(
            status.solos[1].spec.host,
            "demo-1.demo-x.default.svc.cluster.local"
        );
        assert_eq!(status.version.major, 5);
        assert_eq!(status.version.minor, 7);
    }

    #[test]
    fn validate_rejects_quoted_credentials() {
        let mut mysql = sample(1);
        mysql.spec.local_password = "it's".into();
        assert!(matches!(mysql.validate(), Err(SpecError::Quoted(_))));
    }

    #[test]
    fn validate_rejects_out_of_range_primary() {
        let mut mysql = sample(1);
        mysql.spec.primary_id = Some(2);
        assert!(matches!(mysql.validate(), Err(SpecError::PrimaryId(2, 2))));
        mysql.spec.primary_id = Some(-1);
        mysql.validate().expect("coordinator-chooses is valid");
    }

    #[test]
    fn size_spec_tracks_intent() {
        let mut mysql = sample(2);
        let before = mysql.size_spec();
        assert_eq!(before.replicas, 2);
        assert_eq!(before.primary_id, -1);
        mysql.spec.primary_id = Some(1);
        assert_ne!(before, mysql.size_spec());
    }
}
