use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

fn default_listen() -> SocketAddr {
    "127.0.0.1:8145".parse().expect("default listen address must be valid")
}

#[derive(Debug, Clone, Parser)]
#[command(name = "cadgate", version, about = "SSE gateway for long-running CAD model builds")]
pub struct Cli {
    /// Address to listen on.
    #[arg(long, env = "CADGATE_LISTEN", default_value_t = default_listen())]
    pub listen: SocketAddr,

    /// Build driver command, invoked as
    /// `<cmd> [build-args…] <operation> [assembly] <params-json>`.
    #[arg(long, env = "CADGATE_BUILD_CMD", required_unless_present = "demo")]
    pub build_cmd: Option<PathBuf>,

    /// Extra argument passed to the build driver before the operation name.
    /// May be repeated.
    #[arg(long = "build-arg", value_name = "ARG")]
    pub build_args: Vec<String>,

    /// Serve deterministic built-in builds instead of spawning a driver.
    #[arg(long, default_value_t = false)]
    pub demo: bool,

    /// Progress events buffered per observer. When a slow client falls
    /// behind, the oldest buffered progress event is dropped first.
    #[arg(
        long,
        env = "CADGATE_PROGRESS_QUEUE",
        default_value_t = 64,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub progress_queue_capacity: u16,

    /// Client disconnect detection cadence in milliseconds (SSE keep-alive
    /// interval).
    #[arg(
        long = "disconnect-poll-ms",
        env = "CADGATE_DISCONNECT_POLL_MS",
        default_value_t = 200,
        value_parser = clap::value_parser!(u64).range(10..=250)
    )]
    pub disconnect_poll_ms: u64,

    /// Parameter group prefixes accepted in query strings.
    #[arg(
        long,
        env = "CADGATE_ALLOWED_GROUPS",
        value_delimiter = ',',
        default_value = "magnafpm,furling,user"
    )]
    pub allowed_groups: Vec<String>,
}
