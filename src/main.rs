use std::process::ExitCode;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

use quadscan::certificate::TlsCertificateProbe;
use quadscan::cli::{Cli, Commands};
use quadscan::config::Config;
use quadscan::coordinator::{Coordinator, CoordinatorConfig, CoordinatorError};
use quadscan::elaborator::FeatureElaborator;
use quadscan::logging::{LoggingError, init_logging_in_data_dir};
use quadscan::network::{FetchError, HttpClient};
use quadscan::prober::HostProber;
use quadscan::server::{CoordinatorServer, ServerError};
use quadscan::store::{MemoryStore, RedbStore, Store, StoreError};
use quadscan::worker::{CrawlWorker, HttpLink, LinkError, WorkerConfig, WorkerError};

#[derive(Error, Debug)]
pub enum MainError {
    #[error("Logging error: {0}")]
    Logging(#[from] LoggingError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    #[error("HTTP client error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
}

impl MainError {
    fn exit_code(&self) -> u8 {
        match self {
            MainError::Worker(_) => 4,
            _ => 3,
        }
    }
}

async fn run_serve(bind: String, data_dir: String, in_memory: bool) -> Result<(), MainError> {
    let store: Arc<dyn Store> = if in_memory {
        info!("using in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        info!(dir = %data_dir, "opening store");
        Arc::new(RedbStore::open(&data_dir)?)
    };

    let coordinator = Coordinator::start(CoordinatorConfig::default(), store).await?;
    let server = CoordinatorServer::bind(&bind, Arc::clone(&coordinator)).await?;

    server
        .run_until(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received Ctrl+C, shutting down");
            }
        })
        .await?;

    // Let queued submissions reach the store before exiting.
    coordinator.shutdown().await;
    coordinator.metrics().log_summary();
    Ok(())
}

async fn run_work(
    coordinator: String,
    nickname: Option<String>,
    task_slot: Option<String>,
    max_concurrent: usize,
    probe_http: bool,
    user_agent: String,
) -> Result<(), MainError> {
    let http = Arc::new(HttpClient::new(user_agent, Config::PROBE_TIMEOUT_SECS)?);
    let prober = Arc::new(HostProber::new(Arc::clone(&http), Arc::new(TlsCertificateProbe::new())));
    let elaborator = Arc::new(FeatureElaborator::new(Arc::clone(&http)));
    let link = Arc::new(HttpLink::new(&coordinator)?);

    let config = WorkerConfig {
        nickname,
        task_slot,
        max_concurrent,
        probe_http,
        ..WorkerConfig::default()
    };
    info!(coordinator = %coordinator, max_concurrent, probe_http, "starting worker");

    let worker = CrawlWorker::new(config, link, prober, elaborator);
    tokio::select! {
        result = worker.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl+C, stopping worker");
            worker.metrics().log_summary();
        }
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<(), MainError> {
    match cli.command {
        Commands::Serve {
            bind,
            data_dir,
            in_memory,
        } => {
            let _guards = init_logging_in_data_dir(&data_dir)?;
            run_serve(bind, data_dir, in_memory).await
        }
        Commands::Work {
            coordinator,
            nickname,
            task_slot,
            max_concurrent,
            probe_http,
            user_agent,
            data_dir,
        } => {
            let _guards = init_logging_in_data_dir(&data_dir)?;
            run_work(coordinator, nickname, task_slot, max_concurrent, probe_http, user_agent).await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_args();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal");
            eprintln!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}
