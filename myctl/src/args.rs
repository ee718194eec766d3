use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Listen address of the agent-facing HTTP surface
    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:33081")]
    pub http_addr: String,

    /// Namespace this coordinator supervises; also hosts the leader lease
    #[arg(long, env = "NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Skip the Kubernetes controller; serve the HTTP surface only
    #[arg(long, env = "NO_CONTROLLER", default_value_t = false)]
    pub no_controller: bool,
}
