use anyhow::Context;
use clap::{Parser, Subcommand};
use core_engine::connection::ConnectParams;
use core_engine::location::{IpResolver, LocalIpResolver};
use core_engine::Node;
use shared_utils::config::Config;
use shared_utils::identity::{Identity, IdentityChoice, Signer};
use shared_utils::logging;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Command-line arguments for the node
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to the configuration file
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Log level, overrides the configuration
    #[clap(short, long)]
    log_level: Option<String>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the configured services until interrupted
    Provide,

    /// Provide a service and connect to it from the same process
    Demo {
        /// Service type to connect to
        #[clap(long, default_value = "noop")]
        service: String,

        /// How long to stay connected
        #[clap(long, default_value_t = 3)]
        seconds: u64,
    },
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load(&path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => {
            let path = Config::default_path();
            if path.exists() {
                Config::load(&path)
                    .with_context(|| format!("Failed to load configuration from {}", path.display()))
            } else {
                Ok(Config::default())
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(args.config)?;
    let _guard = logging::init_logging_from_config(&config, args.log_level.as_deref());

    info!("MeshTunnel node starting");
    let node = Node::new(config);

    match args.command {
        Command::Provide => provide(&node).await,
        Command::Demo { service, seconds } => demo(&node, &service, Duration::from_secs(seconds)).await,
    }
}

/// Resolve the provider identity. Keys live in memory, so a configured or
/// remembered identity is only usable within the process that created it.
async fn provider_identity(node: &Node) -> anyhow::Result<(Identity, Arc<dyn Signer>)> {
    let choice = IdentityChoice::from_address(node.config().identity.address.as_deref());
    match node.select_identity(&choice).await {
        Ok(selected) => Ok(selected),
        Err(e) => {
            warn!("Identity {:?} unusable ({}), creating a new one", choice, e);
            Ok(node.select_identity(&IdentityChoice::New).await?)
        }
    }
}

async fn provide(node: &Node) -> anyhow::Result<()> {
    let (identity, signer) = provider_identity(node).await?;
    let runner = node.service_runner(signer);

    if node.start_configured(&runner, &identity).await == 0 {
        anyhow::bail!("No service could be started");
    }

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");
    runner.kill_all().await?;
    Ok(())
}

async fn demo(node: &Node, service_type: &str, hold: Duration) -> anyhow::Result<()> {
    let (provider, provider_signer) = provider_identity(node).await?;
    let runner = node.service_runner(provider_signer);
    let manager = runner
        .start(service_type, node.service_options(provider))
        .await
        .with_context(|| format!("Failed to start {} service", service_type))?;
    let proposal = manager
        .proposal()
        .context("Service is running without a proposal")?;
    info!(proposal_id = proposal.id, service_type = %proposal.service_type, "Proposal published");

    let (_consumer, consumer_signer) = node.select_identity(&IdentityChoice::New).await?;
    let connections = node.connection_manager().await?;
    let ips: Arc<dyn IpResolver> = Arc::new(LocalIpResolver::default());

    let outcome = match connections
        .connect(consumer_signer, &proposal, ConnectParams::default(), ips)
        .await
    {
        Ok(session_id) => {
            info!(session_id = %session_id, status = ?connections.status(), "Connected");
            tokio::time::sleep(hold).await;
            info!(statistics = ?connections.statistics(), "Disconnecting");
            connections.disconnect().await.map_err(anyhow::Error::from)
        }
        Err(e) => {
            error!("Connect failed: {}", e);
            Err(e.into())
        }
    };

    runner.kill_all().await?;
    info!(status = ?connections.status(), "Demo finished");
    outcome
}
