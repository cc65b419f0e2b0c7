use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "crosstalk",
    author,
    version,
    about = "Multi-tenant chat fan-out relay"
)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "CROSSTALK_LISTEN_ADDR", default_value = "127.0.0.1:8090")]
    pub listen_addr: String,

    /// Redis connection URI used for the broadcast bus and presence hints.
    #[arg(
        long,
        env = "CROSSTALK_REDIS_URL",
        default_value = "redis://127.0.0.1:6379"
    )]
    pub redis_url: String,

    /// Run without redis: in-process bus and hints. Cross-process fan-out
    /// is disabled; local delivery behaves identically.
    #[arg(long, env = "CROSSTALK_STANDALONE", default_value_t = false)]
    pub standalone: bool,

    /// TTL applied to presence hint keys.
    #[arg(long, env = "CROSSTALK_HINT_TTL_SECS", default_value_t = 86_400)]
    pub hint_ttl_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "CROSSTALK_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}
