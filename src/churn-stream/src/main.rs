//! churn-stream: streaming churn scoring engine.
//!
//! `run` starts one partition worker per assigned partition plus the ops API.
//! `publish` replays a newline-delimited JSON event file into the transport.

use churn_agents::source::{connect, ensure_streams};
use churn_agents::{
    EventPublisher, NatsEventSource, PartitionManager, PipelineDeps, StatusRegistry,
    WindowProcessor,
};
use churn_analytics::{ClickHouseFeatureStore, ClickHousePredictionSink, PredictionWriter};
use churn_api::ApiServer;
use churn_cache::{CachedFeatureStore, RedisCheckpointStore};
use churn_core::config::AppConfig;
use churn_core::dead_letter::DeadLetterQueue;
use churn_core::sink::FeatureStore;
use churn_model::{ExplainabilityEngine, ModelScorer};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tracing::{error, info, warn};

const DEAD_LETTER_CAPACITY: usize = 10_000;

#[derive(Parser, Debug)]
#[command(name = "churn-stream")]
#[command(about = "Streaming churn feature aggregation and scoring engine")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, env = "CHURN_STREAM_CONFIG")]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "CHURN_STREAM__NODE_ID")]
    node_id: Option<String>,

    /// Comma-separated partitions to run (overrides config)
    #[arg(long, value_delimiter = ',')]
    partitions: Option<Vec<u32>>,

    /// HTTP port (overrides config)
    #[arg(long, env = "CHURN_STREAM__API__HTTP_PORT")]
    http_port: Option<u16>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Consume, score and write predictions (default)
    Run,
    /// Publish events from a JSON-lines file to their partitions
    Publish {
        #[arg(long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "churn_stream=info,churn_agents=info,churn_analytics=info,tower_http=info".into()
            }),
        )
        .json()
        .init();

    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(partitions) = cli.partitions {
        config.partitions = partitions;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    config.validate()?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Publish { file } => publish(config, file).await,
    }
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    info!(
        node_id = %config.node_id,
        partitions = ?config.assigned_partitions(),
        http_port = config.api.http_port,
        window_secs = config.aggregator.window_secs,
        lateness_secs = config.aggregator.lateness_secs,
        "Churn stream starting up"
    );

    let jetstream = connect(&config.nats).await?;
    ensure_streams(&jetstream, &config.nats, config.partition_count).await?;
    let source = Arc::new(NatsEventSource::new(jetstream, &config.nats));

    let checkpoints = Arc::new(RedisCheckpointStore::new(&config.redis).await?);
    let sink = Arc::new(ClickHousePredictionSink::new(&config.clickhouse).await?);

    let features: Option<Arc<dyn FeatureStore>> = if config.clickhouse.cold_start {
        let warehouse = Arc::new(ClickHouseFeatureStore::new(&config.clickhouse));
        let cached = Arc::new(CachedFeatureStore::connect(warehouse, &config.redis).await?);
        let maintenance = cached.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                maintenance.maintenance();
            }
        });
        let cached: Arc<dyn FeatureStore> = cached;
        Some(cached)
    } else {
        None
    };

    let scorer = Arc::new(ModelScorer::from_config(&config.model)?);
    let explainer = Arc::new(ExplainabilityEngine::new(scorer.clone(), config.explain.clone()));
    let processor = Arc::new(WindowProcessor::new(
        scorer,
        explainer,
        Duration::from_millis(config.orchestrator.scoring_timeout_ms),
    ));

    let dead_letters = Arc::new(DeadLetterQueue::new(DEAD_LETTER_CAPACITY));
    let status = Arc::new(StatusRegistry::new());
    let deps = PipelineDeps {
        source,
        checkpoints,
        writer: Arc::new(PredictionWriter::new(sink, &config.writer)),
        processor,
        features,
        dead_letters: dead_letters.clone(),
        status: status.clone(),
    };

    let mut manager = PartitionManager::new(config.clone(), deps);
    manager.start();

    let api_server = ApiServer::new(config.clone(), status, dead_letters);
    if let Err(e) = api_server.start_metrics() {
        error!(error = %e, "Failed to start metrics exporter");
    }

    let shutdown = manager.shutdown_token();
    let http = tokio::spawn(async move { api_server.start_http(shutdown).await });

    info!("Churn stream is running");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, finishing in-flight cycles");

    manager.shutdown().await;
    match http.await {
        Ok(Err(e)) => error!(error = %e, "HTTP server failed"),
        Err(e) => error!(error = %e, "HTTP server task panicked"),
        Ok(Ok(())) => {}
    }
    info!("Churn stream stopped");
    Ok(())
}

async fn publish(config: AppConfig, file: PathBuf) -> anyhow::Result<()> {
    let jetstream = connect(&config.nats).await?;
    ensure_streams(&jetstream, &config.nats, config.partition_count).await?;
    let publisher = EventPublisher::new(jetstream, &config.nats, config.partition_count);

    let reader = BufReader::new(tokio::fs::File::open(&file).await?);
    let summary = publisher.publish_lines(reader).await?;
    info!(
        file = %file.display(),
        published = summary.published,
        skipped = summary.skipped,
        "Publish complete"
    );
    Ok(())
}
