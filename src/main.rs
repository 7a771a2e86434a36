//! MagicBox edge node CLI application

use anyhow::{Context, Result};
use clap::Parser;
use magicbox::broker::{Broker, BrokerServer, DEFAULT_MAX_PAYLOAD};
use magicbox::config::ConfigStore;
use magicbox::forwarder::{CentralForwarder, DEFAULT_CENTRAL_PORT};
use magicbox::pipeline::StreamPipeline;
use magicbox::platform::PlatformAgent;
use magicbox::queue::EventQueue;
use magicbox::{hardware, service};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "magicbox")]
#[command(about = "Edge worker node for the Iris video analytics platform")]
#[command(version)]
struct Cli {
    /// Path to the node configuration JSON
    #[arg(long, default_value = "/var/lib/magicbox/node.json")]
    config: String,

    /// Data directory (event queue, logs, images)
    #[arg(long, default_value = "/var/lib/magicbox/data")]
    data: String,

    /// Management port (reserved; the embedded UI ships separately)
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Local broker port on the loopback interface
    #[arg(long = "nats-port", default_value_t = 4222)]
    nats_port: u16,

    /// Run the RTSP decode pipeline
    #[arg(long = "enable-streamer", default_value_t = true, action = clap::ArgAction::Set)]
    enable_streamer: bool,

    /// Install the systemd service unit and exit
    #[arg(long)]
    install: bool,

    /// Remove the systemd service unit and exit
    #[arg(long)]
    uninstall: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt().with_env_filter(filter).with_target(false).init();

    if let Err(e) = run(cli).await {
        error!(error = %format!("{:#}", e), "Fatal error");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    if cli.install {
        service::install(&cli.config, &cli.data).context("service install failed")?;
        return Ok(());
    }
    if cli.uninstall {
        service::uninstall().context("service uninstall failed")?;
        return Ok(());
    }

    info!(version = env!("CARGO_PKG_VERSION"), "MagicBox node starting");

    // One-shot backend probe feeds every decoder.
    let caps = Arc::new(hardware::probe().await);

    let store = Arc::new(
        ConfigStore::load_or_create(&cli.config)
            .with_context(|| format!("loading node config at {}", cli.config))?,
    );
    let config = store.get();
    info!(
        node = %config.node_name,
        model = %config.node_model,
        state = ?config.state,
        cameras = config.cameras.len(),
        "Node configuration loaded"
    );

    // Each component gets its own shutdown signal so teardown can run in
    // reverse startup order, waiting for each stage before the next.
    let (broker_shutdown_tx, broker_shutdown_rx) = watch::channel(false);
    let (queue_shutdown_tx, queue_shutdown_rx) = watch::channel(false);
    let (agent_shutdown_tx, agent_shutdown_rx) = watch::channel(false);
    let (forwarder_shutdown_tx, forwarder_shutdown_rx) = watch::channel(false);

    // Local broker plus its loopback TCP listener.
    let broker = Broker::new(DEFAULT_MAX_PAYLOAD);
    let server = BrokerServer::bind(broker.clone(), &format!("127.0.0.1:{}", cli.nats_port))
        .await
        .with_context(|| format!("binding local broker on port {}", cli.nats_port))?;
    let broker_task = tokio::spawn(server.run(broker_shutdown_rx));

    // Data directory: event queue plus ancillary log/image storage used
    // by analytics workers.
    for sub in ["logs", "images"] {
        std::fs::create_dir_all(std::path::Path::new(&cli.data).join(sub))
            .with_context(|| format!("creating data directory {}", cli.data))?;
    }
    let queue = Arc::new(
        EventQueue::open(&cli.data).with_context(|| format!("opening event queue in {}", cli.data))?,
    );

    // Decode pipeline (constructed regardless so stats surfaces exist;
    // only started when the streamer is enabled).
    let pipeline = StreamPipeline::new(broker.clone(), Arc::clone(&store), Arc::clone(&caps));

    // Platform agent drives registration, heartbeats, config sync, and
    // drains the event queue.
    let agent = PlatformAgent::new(
        Arc::clone(&store),
        broker.clone(),
        Arc::clone(&queue),
        Arc::clone(&pipeline),
    );
    let agent_tasks = agent.run(agent_shutdown_rx);
    let queue_task = tokio::spawn(
        Arc::clone(&queue).run(agent.clone() as Arc<dyn magicbox::queue::EventSender>, queue_shutdown_rx),
    );

    // Central forwarder bridges the local broker upstream.
    let forwarder = CentralForwarder::new(broker.clone(), Arc::clone(&store), DEFAULT_CENTRAL_PORT);
    let forwarder_task = tokio::spawn(Arc::clone(&forwarder).run(forwarder_shutdown_rx));

    if cli.enable_streamer {
        pipeline.start().await.context("starting stream pipeline")?;
    } else {
        info!("Decode pipeline disabled by flag");
    }

    info!(
        broker_port = cli.nats_port,
        management_port = cli.port,
        "Node is running, press Ctrl+C to stop"
    );
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    // Reverse of startup: pipeline, forwarder, agent, queue, broker.
    // Each stage is signalled and joined before the next goes down.
    pipeline.stop().await;

    let _ = forwarder_shutdown_tx.send(true);
    let _ = forwarder_task.await;

    let _ = agent_shutdown_tx.send(true);
    for task in agent_tasks {
        let _ = task.await;
    }

    let _ = queue_shutdown_tx.send(true);
    let _ = queue_task.await;

    let _ = broker_shutdown_tx.send(true);
    let _ = broker_task.await;

    Ok(())
}
