use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Coordinator address, `host:port`
    #[arg(long, env = "MYCTL_ADDR")]
    pub myctl_addr: String,

    /// The cluster's shared secret, injected by the operator
    #[arg(long, env = "GROUP_TOKEN")]
    pub group_token: String,

    /// This pod's name, `<group>-<id>`; falls back to the hostname
    #[arg(long, env = "POD_NAME", default_value = "")]
    pub pod_name: String,

    /// Listen address of the agent HTTP surface
    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:33080")]
    pub http_addr: String,

    /// Give up after this many mysqld restarts
    #[arg(long, env = "MYSQL_RESTART_LIMIT", default_value_t = 5)]
    pub restart_limit: i32,

    #[arg(long, env = "NAMESPACE", default_value = "default")]
    pub namespace: String,
}
