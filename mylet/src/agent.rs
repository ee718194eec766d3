use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use myops_types::{
    Envelope, Mysql, MysqlSolo, MysqlState, PrimaryMode, StateKey, process_rand_id, raw_token,
};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::args::Args;

/// The per-replica supervisor singleton: one per process, built once from a
/// one-shot fetch of the cluster object.
#[derive(Clone)]
pub struct Mylet {
    pub(crate) shared: Arc<MyletShared>,
}

#[derive(Debug)]
pub struct MyletShared {
    pub state: Mutex<AgentState>,
    pub probes: myops_common::probes::Probes,
    /// Single-shot exit signal; cancelling it winds the whole process down.
    pub exit: CancellationToken,
    pub switch_tx: mpsc::Sender<i32>,
    pub switch_rx: Mutex<Option<mpsc::Receiver<i32>>>,
    /// Human-readable name of the in-flight backup operation, empty when
    /// idle. Doubles as the mutual-exclusion lock for the backup directory.
    pub backing: std::sync::Mutex<String>,
    pub client: reqwest::Client,
    pub rand_id: i64,
    pub restart_limit: i32,
    pub namespace: String,
}

/// Everything the per-agent mutex guards.
#[derive(Debug)]
pub struct AgentState {
    pub mysql: Mysql,
    pub solo: MysqlSolo,
    /// Observations made by this agent (`fromId` = own id).
    pub states: HashMap<StateKey, MysqlState>,
    /// Consecutive failures of the self-probe, advisory.
    pub hang: i32,
    pub restart_count: i32,
}

impl Mylet {
    /// One-shot fetch of the full cluster object from the coordinator,
    /// deriving our own identity from the pod name. Any failure here is
    /// fatal; the orchestrator restarts the pod.
    pub async fn fetch(args: &Args) -> Result<Self> {
        if args.myctl_addr.is_empty() {
            bail!("myctl addr required");
        }
        if args.group_token.is_empty() {
            bail!("group token required");
        }

        let solo_name = if args.pod_name.is_empty() {
            std::env::var("HOSTNAME").unwrap_or_default()
        } else {
            args.pod_name.clone()
        };
        let id = parse_solo_id(&solo_name)
            .with_context(|| format!("invalid solo name: {solo_name}"))?;

        let client = reqwest::Client::new();
        let rand_id = process_rand_id();

        let url = format!(
            "http://{}/api/addons/myctl/{}/mysql",
            args.myctl_addr, args.namespace
        );
        let response = client
            .get(&url)
            .header("Token", raw_token(&solo_name, rand_id, &args.group_token))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .context("fetch cluster object")?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            bail!("status code {status}, body: {body}");
        }
        let envelope: Envelope<Mysql> = serde_json::from_str(&body)?;
        let mysql = envelope
            .into_result()
            .map_err(|e| anyhow::anyhow!("return error: {e}"))?;

        let solo = mysql
            .status
            .as_ref()
            .and_then(|s| s.solos.get(id as usize))
            .cloned()
            .with_context(|| format!("solo {id} missing from cluster object"))?;

        Ok(Self::assemble(mysql, solo, args, client, rand_id))
    }

    pub(crate) fn assemble(
        mysql: Mysql,
        solo: MysqlSolo,
        args: &Args,
        client: reqwest::Client,
        rand_id: i64,
    ) -> Self {
        let (switch_tx, switch_rx) = mpsc::channel(1);
        Self {
            shared: Arc::new(MyletShared {
                state: Mutex::new(AgentState {
                    mysql,
                    solo,
                    states: HashMap::new(),
                    hang: 0,
                    restart_count: 0,
                }),
                probes: myops_common::probes::Probes::new(),
                exit: CancellationToken::new(),
                switch_tx,
                switch_rx: Mutex::new(Some(switch_rx)),
                backing: std::sync::Mutex::new(String::new()),
                client,
                rand_id,
                restart_limit: args.restart_limit,
                namespace: args.namespace.clone(),
            }),
        }
    }

    /// Clone the cluster object and our solo; most operations work on this
    /// snapshot so SQL and subprocess work never holds the agent lock.
    pub async fn view(&self) -> (Mysql, MysqlSolo) {
        let state = self.shared.state.lock().await;
        (state.mysql.clone(), state.solo.clone())
    }

    pub fn probes(&self) -> &myops_common::probes::Probes {
        &self.shared.probes
    }

    pub fn exit(&self) -> &CancellationToken {
        &self.shared.exit
    }

    pub async fn is_primary(&self) -> bool {
        let state = self.shared.state.lock().await;
        solo_is_primary(&state.mysql, state.solo.spec.id)
    }
}

pub fn solo_is_primary(mysql: &Mysql, id: i32) -> bool {
    if mysql.spec.primary_mode == PrimaryMode::Classic {
        return id == mysql.spec.primary_id();
    }
    id < mysql.spec.primaries
}

/// `<group>-<id>` → `id`.
pub fn parse_solo_id(solo_name: &str) -> Result<i32> {
    let i = solo_name.rfind('-').context("no dash")?;
    if i < 1 {
        bail!("empty group name");
    }
    let id: i32 = solo_name[i + 1..].parse().context("trailing id")?;
    if id < 0 {
        bail!("negative id");
    }
    Ok(id)
}

pub fn my_cnf(solo: &MysqlSolo) -> PathBuf {
    Path::new(&solo.spec.mydir).join("my.cnf")
}

pub fn data_dir(solo: &MysqlSolo) -> PathBuf {
    Path::new(&solo.spec.mydir).join("mysql")
}

pub fn backup_root(solo: &MysqlSolo) -> PathBuf {
    Path::new(&solo.spec.mydir).join("backup")
}

pub fn socket_path(solo: &MysqlSolo) -> PathBuf {
    data_dir(solo).join(format!("{}.sock", solo.spec.name))
}

/// A `mysqld` invocation against this solo's config file, inheriting our
/// stdout/stderr so the engine log lands in the pod log.
pub fn mysqld_command(solo: &MysqlSolo, extra: &[&str]) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("mysqld");
    cmd.arg(format!("--defaults-file={}", my_cnf(solo).display()));
    for arg in extra {
        cmd.arg(arg);
    }
    cmd.stdout(std::process::Stdio::inherit());
    cmd.stderr(std::process::Stdio::inherit());
    cmd
}

#[cfg(test)]
pub(crate) mod testing {
    use myops_types::MysqlSpec;

    use super::*;

    pub fn sample_mysql(replicas: i32, version: &str) -> Mysql {
        let mut mysql = Mysql::new(
            "demo",
            MysqlSpec {
                version: version.into(),
                replicas: Some(replicas),
                local_password: "lp".into(),
                replica_password: "rp".into(),
                myctl_addr: "myctl:33081".into(),
                primary_id: Some(0),
                ..Default::default()
            },
        );
        mysql.metadata.namespace = Some("default".into());
        mysql.default_fill().expect("default_fill");
        mysql
    }

    pub fn sample_mylet(replicas: i32, id: i32, mydir: &Path) -> Mylet {
        let mut mysql = sample_mysql(replicas, "v8.0");
        mysql.spec.mydir = mydir.display().to_string();
        mysql.default_fill().expect("default_fill");
        let solo = mysql.status.as_ref().expect("status").solos[id as usize].clone();
        let args = Args {
            myctl_addr: "myctl:33081".into(),
            group_token: "tok".into(),
            pod_name: solo.spec.name.clone(),
            http_addr: "127.0.0.1:0".into(),
            restart_limit: 5,
            namespace: "default".into(),
        };
        Mylet::assemble(mysql, solo, &args, reqwest::Client::new(), 7)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solo_names_parse_to_ids() {
        assert_eq!(parse_solo_id("demo-0").expect("id"), 0);
        assert_eq!(parse_solo_id("a-b-12").expect("id"), 12);
        assert!(parse_solo_id("nodash").is_err());
        assert!(parse_solo_id("-1").is_err());
        assert!(parse_solo_id("demo-x").is_err());
    }

    #[test]
    fn classic_primary_follows_intent() {
        let mut mysql = testing::sample_mysql(2, "v5.7");
        assert!(solo_is_primary(&mysql, 0));
        assert!(!solo_is_primary(&mysql, 1));
        mysql.spec.primary_id = Some(2);
        assert!(solo_is_primary(&mysql, 2));
        assert!(!solo_is_primary(&mysql, 0));
    }

    #[test]
    fn group_modes_take_leading_indices() {
        let mut mysql = testing::sample_mysql(2, "v8.0");
        mysql.spec.primary_mode = PrimaryMode::Multi;
        mysql.spec.primaries = 2;
        assert!(solo_is_primary(&mysql, 0));
        assert!(solo_is_primary(&mysql, 1));
        assert!(!solo_is_primary(&mysql, 2));
    }

    #[test]
    fn paths_hang_off_mydir() {
        let mysql = testing::sample_mysql(1, "v8.0");
        let solo = &mysql.status.as_ref().expect("status").solos[1];
        assert_eq!(my_cnf(solo), Path::new("/mydir/my.cnf"));
        assert_eq!(data_dir(solo), Path::new("/mydir/mysql"));
        assert_eq!(socket_path(solo), Path::new("/mydir/mysql/demo-1.sock"));
    }
}
