//! Agent binary: runs one scriptvisor agent until a termination signal.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use scriptvisor::{Agent, AgentConfig, ProcessPolicy};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Remotely updatable Lua automation agent.
#[derive(Parser, Debug)]
#[command(name = "scriptvisor-agent", version, about)]
struct Cli {
    /// Directory holding the cached script.
    #[arg(short = 'w', long, env = "SCRIPTVISOR_WORKING_DIR", default_value = ".")]
    working_dir: PathBuf,

    /// File name of the cached script inside the working directory.
    #[arg(short = 'f', long, env = "SCRIPTVISOR_SCRIPT_FILE", default_value = "script.lua")]
    script_file: String,

    /// Update endpoint of the control server.
    #[arg(short = 's', long, env = "SCRIPTVISOR_SERVER_URL")]
    server_url: String,

    /// Project id to select from a multi-project update response.
    #[arg(short = 'p', long, env = "SCRIPTVISOR_PROJECT")]
    project: Option<String>,

    /// Seconds between update checks.
    #[arg(short = 'i', long, env = "SCRIPTVISOR_INTERVAL", default_value_t = 60)]
    interval: u64,

    /// Capacity of each generation's event queue.
    #[arg(long, env = "SCRIPTVISOR_QUEUE_CAPACITY", default_value_t = 64)]
    queue_capacity: usize,

    /// What happens to child processes when their script is replaced.
    #[arg(long, env = "SCRIPTVISOR_PROCESS_POLICY", value_enum, default_value_t = PolicyArg::Kill)]
    process_policy: PolicyArg,

    /// Emit logs as JSON lines.
    #[arg(long, env = "SCRIPTVISOR_LOG_JSON")]
    log_json: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PolicyArg {
    /// Kill children of the stopped script.
    Kill,
    /// Leave children running.
    Detach,
}

impl From<PolicyArg> for ProcessPolicy {
    fn from(p: PolicyArg) -> Self {
        match p {
            PolicyArg::Kill => ProcessPolicy::KillOnStop,
            PolicyArg::Detach => ProcessPolicy::Detach,
        }
    }
}

impl Cli {
    fn into_config(self) -> AgentConfig {
        AgentConfig {
            working_dir: self.working_dir,
            script_file: self.script_file,
            server_url: self.server_url,
            project: self.project,
            check_interval: Duration::from_secs(self.interval),
            queue_capacity: self.queue_capacity,
            process_policy: self.process_policy.into(),
            ..AgentConfig::default()
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    info!(version = scriptvisor::VERSION, server = %cli.server_url, "starting agent");

    let mut agent = Agent::from_config(cli.into_config());
    agent.boot().await;

    let shutdown = CancellationToken::new();
    let _signals = scriptvisor::cancel_on_signal(shutdown.clone());
    agent.run(shutdown).await;
}
