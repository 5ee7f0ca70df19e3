use std::{process::ExitCode, sync::Arc};

use clap::Parser;
use futures::StreamExt;
use log::{error, info};
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;

use tierflow::{
    config::Config,
    core::{DataMap, ErrorContext, PipelineResult, ProviderRegistry},
    logging::Logger,
    orchestration::{metrics, Orchestrator, StreamEvent},
    pipeline::build_orchestrator,
};

#[derive(Parser, Debug)]
#[command(name = "tierflow")]
#[command(about = "Run queries through a layered LLM pipeline")]
struct Args {
    /// Pipeline config file (YAML)
    #[arg(short, long, default_value = "conf/tierflow.yaml")]
    conf: String,

    /// User the request is made for
    #[arg(long, default_value = "cli")]
    user: String,

    /// Session id passed in the session context
    #[arg(long)]
    session: Option<String>,

    /// Print chunks as they are produced instead of one response
    #[arg(long)]
    stream: bool,

    /// Print the system status after the request
    #[arg(long)]
    status: bool,

    /// Print metrics in the Prometheus text format before exiting
    #[arg(long)]
    metrics: bool,

    /// Query to process; without it only status and metrics are printed
    query: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load_from_yaml(&args.conf) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let log_task = if let Some(log_cfg) = &config.log {
        let logger = Logger::new(log_cfg.clone());
        logger.init_env_logger();
        Some(logger.spawn(shutdown_rx))
    } else {
        env_logger::init();
        None
    };

    let code = match run(&args, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    };

    let _ = shutdown_tx.send(true);
    if let Some(task) = log_task {
        let _ = task.await;
    }
    code
}

async fn run(args: &Args, config: &Config) -> PipelineResult<()> {
    let registry = ProviderRegistry::with_builtins();
    let orchestrator = Arc::new(build_orchestrator(config, &registry)?);
    orchestrator.initialize().await?;

    if let Some(query) = &args.query {
        let mut session = DataMap::new();
        if let Some(id) = &args.session {
            session.insert("session_id".to_string(), json!(id));
        }

        if args.stream {
            let mut events = orchestrator.process_stream(&args.user, query, session);
            while let Some(event) = events.next().await {
                print_json(&event)?;
                if let StreamEvent::End { success: false, .. } = event {
                    info!("Streamed request ended without success");
                }
            }
        } else {
            let response = orchestrator.process(&args.user, query, session).await;
            print_json(&response)?;
        }
    }

    if args.status {
        print_json(&orchestrator.get_system_status())?;
    }

    shutdown(&orchestrator).await;

    if args.metrics {
        print!("{}", metrics::render()?);
    }
    Ok(())
}

async fn shutdown(orchestrator: &Orchestrator) {
    info!("Shutting down pipeline...");
    orchestrator.shutdown().await;
}

fn print_json<T: Serialize>(value: &T) -> PipelineResult<()> {
    let line = serde_json::to_string(value).with_context("Failed to serialize output")?;
    println!("{line}");
    Ok(())
}
