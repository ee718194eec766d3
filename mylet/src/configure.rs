use anyhow::{Context, Result};
use chrono::Local;
use myops_types::{Mysql, MysqlSolo, PrimaryMode};

use crate::agent::{Mylet, backup_root, data_dir, my_cnf, solo_is_primary};
use crate::backup::DATETIME_LAYOUT;

/// The engine configuration, rendered per solo. Read-only defaults are on;
/// the role-change sequences flip them at runtime.
const MY_CNF_TEMPLATE: &str = r#"[mysqld]
ssl = OFF
local_infile = OFF
secure_file_priv = NULL
{%- if major != 5 %}
mysqlx = OFF
{%- endif %}
max_connections = 2048
max_allowed_packet = 256M
explicit_defaults_for_timestamp = ON

super_read_only = ON
{%- if major == 5 %}
skip_slave_start = ON
{%- else %}
skip_replica_start = ON
{%- endif %}

pid_file = {{ name }}.pid
socket = {{ name }}.sock
port = {{ port }}

datadir = {{ datadir }}

server_id = {{ server_id }}
report_host = {{ report_host }}
gtid_mode = ON
enforce_gtid_consistency = ON

binlog_format = ROW
log_bin = {{ name }}-bin
log_error = {{ name }}.err
expire_logs_days = 7
max_binlog_size = 1G
max_binlog_cache_size = 512M
{%- if major == 5 %}
log_slave_updates = ON
{%- else %}
log_replica_updates = ON
{%- endif %}
{%- if replica %}
sync_binlog = 0
{%- else %}
sync_binlog = 1
{%- endif %}
relay_log = {{ name }}-relay-bin
relay_log_info_repository = TABLE
relay_log_recovery = ON
{%- if not classic %}
{%- if major == 5 %}
binlog_checksum = NONE
transaction_write_set_extraction = XXHASH64
master_info_repository = TABLE
{%- endif %}

disabled_storage_engines = MyISAM,BLACKHOLE,FEDERATED,ARCHIVE,MEMORY
plugin_load_add = group_replication.so
group_replication_group_name = {{ group_name }}
group_replication_start_on_boot = OFF
group_replication_local_address = {{ group_local_address }}
group_replication_group_seeds = {{ group_seeds }}
group_replication_bootstrap_group = OFF
{%- endif %}

!includedir {{ mydir }}/my.cnf.d/
"#;

pub fn render_my_cnf(mysql: &Mysql, solo: &MysqlSolo) -> Result<String> {
    let major = mysql
        .status
        .as_ref()
        .map(|s| s.version.major)
        .unwrap_or_default();

    let mut ctx = tera::Context::new();
    ctx.insert("name", &solo.spec.name);
    ctx.insert("port", &solo.spec.port);
    ctx.insert("server_id", &solo.spec.server_id);
    ctx.insert("datadir", &data_dir(solo).display().to_string());
    ctx.insert("mydir", &solo.spec.mydir);
    ctx.insert("report_host", &solo.spec.short_host);
    ctx.insert("major", &major);
    ctx.insert("replica", &!solo_is_primary(mysql, solo.spec.id));
    ctx.insert(
        "classic",
        &(mysql.spec.primary_mode == PrimaryMode::Classic),
    );
    ctx.insert("group_name", &mysql.spec.group_name);
    ctx.insert(
        "group_local_address",
        &format!("{}:{}", solo.spec.short_host, solo.spec.group_port),
    );
    ctx.insert("group_seeds", &mysql.group_seeds());

    tera::Tera::one_off(MY_CNF_TEMPLATE, &ctx, false).context("render my.cnf")
}

impl Mylet {
    /// Render and install the configuration file; an existing one is moved
    /// aside into the backup directory first.
    pub async fn configure(&self) -> Result<()> {
        let (mysql, solo) = self.view().await;
        let content = render_my_cnf(&mysql, &solo)?;

        let path = my_cnf(&solo);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let dir = backup_root(&solo);
            tokio::fs::create_dir_all(&dir).await?;
            let aside = dir.join(format!(
                "my.cnf.{}",
                Local::now().format(DATETIME_LAYOUT)
            ));
            tokio::fs::rename(&path, &aside).await?;
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::{sample_mylet, sample_mysql};

    #[test]
    fn modern_replica_config_uses_replica_vocabulary() {
        let mysql = sample_mysql(2, "v8.0");
        let solo = &mysql.status.as_ref().expect("status").solos[1];
        let cnf = render_my_cnf(&mysql, solo).expect("render");

        assert!(cnf.contains("skip_replica_start = ON"));
        assert!(cnf.contains("log_replica_updates = ON"));
        assert!(cnf.contains("mysqlx = OFF"));
        assert!(cnf.contains("sync_binlog = 0"));
        assert!(cnf.contains("server_id = 2"));
        assert!(cnf.contains("report_host = demo-1.demo-x"));
        assert!(!cnf.contains("group_replication_group_seeds"));
    }

    #[test]
    fn legacy_primary_config_uses_slave_vocabulary() {
        let mysql = sample_mysql(2, "v5.7");
        let solo = &mysql.status.as_ref().expect("status").solos[0];
        let cnf = render_my_cnf(&mysql, solo).expect("render");

        assert!(cnf.contains("skip_slave_start = ON"));
        assert!(cnf.contains("log_slave_updates = ON"));
        assert!(!cnf.contains("mysqlx"));
        assert!(cnf.contains("sync_binlog = 1"));
    }

    #[test]
    fn group_modes_render_the_group_replication_block() {
        let mut mysql = sample_mysql(2, "v8.0");
        mysql.spec.primary_mode = PrimaryMode::Single;
        mysql.spec.primaries = 3;
        mysql.spec.replicas = Some(0);
        mysql.spec.group_name = "11111111-2222-3333-4444-555555555555".into();
        mysql.default_fill().expect("default_fill");
        let solo = &mysql.status.as_ref().expect("status").solos[0];

        let cnf = render_my_cnf(&mysql, solo).expect("render");
        assert!(cnf.contains("plugin_load_add = group_replication.so"));
        assert!(cnf.contains("group_replication_group_seeds = demo-0.demo-x:33061,demo-1.demo-x:33061,demo-2.demo-x:33061"));
    }

    #[tokio::test]
    async fn configure_moves_the_old_file_aside() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mylet = sample_mylet(2, 0, dir.path());

        mylet.configure().await.expect("first configure");
        mylet.configure().await.expect("second configure");

        let backups: Vec<_> = std::fs::read_dir(dir.path().join("backup"))
            .expect("backup dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("my.cnf."))
            .collect();
        assert_eq!(backups.len(), 1);
        assert!(dir.path().join("my.cnf").exists());
    }
}
