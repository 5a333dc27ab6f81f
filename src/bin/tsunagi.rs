use async_trait::async_trait;
use clap::{command, Parser};
use futures::FutureExt;
use serde_json::Value;
use std::{collections::HashMap, path::PathBuf, sync::Arc};
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use tsunagi::{
    agent_registry::AgentRegistry,
    config::RegistryConfig,
    container::{BroadcastFn, Container, ContainerFactory, StartedContainer},
    network::NetworkRegistry,
    ticker::TickScheduler,
    ClientId, ContainerEndpoint, ContainerId, ContainerKind, PeerId, RegistryError, RegistryResult,
    StartRequest,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "tsunagi.json")]
    config: PathBuf,

    /// Id of the in-process demo agent
    #[arg(long, default_value = "local")]
    agent: String,

    /// Enable debug mode
    #[arg(short, long)]
    verbose: bool,
}

/// Answers every request with its own payload.
struct EchoContainer;

#[async_trait]
impl Container for EchoContainer {
    async fn request(
        &self,
        _operation: &str,
        data: Value,
        _client_id: Option<&ClientId>,
    ) -> RegistryResult<Value> {
        Ok(data)
    }

    async fn terminate(&self) -> RegistryResult<()> {
        Ok(())
    }

    async fn ping(&self) -> RegistryResult<()> {
        Ok(())
    }

    fn connect(&self, _client_id: &ClientId, _broadcast: BroadcastFn) {}

    fn disconnect(&self, _client_id: &ClientId) {}
}

fn echo_factory(agent: String) -> ContainerFactory {
    Arc::new(move |container_id: ContainerId, _request: StartRequest| {
        let endpoint = ContainerEndpoint::new(format!("{}/{}", agent, container_id));
        async move {
            Ok(StartedContainer {
                container_id,
                container: Arc::new(EchoContainer) as Arc<dyn Container>,
                endpoint,
            })
        }
        .boxed()
    })
}

async fn run(cli: &Cli) -> Result<(), RegistryError> {
    let config = if cli.config.exists() {
        RegistryConfig::from_file(&cli.config)?
    } else {
        RegistryConfig::default()
    };
    info!("config loaded.");
    debug!("config: {:?}", config);

    let scheduler = Arc::new(TickScheduler::from_config(&config.ticker));
    let network = NetworkRegistry::new(scheduler.clone(), config.timeouts.clone());

    let mut factories: HashMap<ContainerKind, ContainerFactory> = HashMap::new();
    factories.insert("echo".into(), echo_factory(cli.agent.clone()));
    let agent = AgentRegistry::new(cli.agent.as_str().into(), factories)
        .with_scheduler(scheduler.clone());
    agent.register(&network).await?;

    let client = ClientId::from("console");
    let mut events = network.subscribe(&client).await;
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            info!(
                "agents: {}, added: {}, updated: {}, deleted: {}",
                event.agents.len(),
                event.added.len(),
                event.updated.len(),
                event.deleted.len()
            );
        }
    });

    let heartbeat = {
        let network = network.clone();
        let agent = agent.clone();
        let client = client.clone();
        let period = config.timeouts.ping_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                agent.heartbeat(&network).await;
                network.ping(&PeerId::from(&client)).await;
            }
        })
    };

    if config.ticker.enabled {
        scheduler.start().await?;
    } else {
        warn!("Ticker disabled: no liveness checks or broadcasts will run");
    }

    let endpoint = network
        .get(&client, &"demo".into(), &StartRequest::new("echo"))
        .await?;
    let reply = network
        .request(&"demo".into(), "echo", serde_json::json!({"hello": "tsunagi"}))
        .await?;
    info!("demo container at {} replied {}", endpoint, reply);

    println!("Tsunagi registry started. Press Ctrl+C to shutdown.");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| RegistryError::Internal(format!("Failed to wait for Ctrl+C: {}", e)))?;

    println!("Shutdown signal received, performing clean shutdown...");

    heartbeat.abort();
    network.release(&client, &"demo".into()).await?;
    network.unregister(agent.agent_id()).await?;
    network.send_events().await?;
    network.close().await;
    scheduler.stop().await?;

    println!("Registry shutdown completed.");

    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(&cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
