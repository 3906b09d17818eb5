//! Standalone metrics demultiplexer.
//!
//! Listens for DogStatsD over UDP, aggregates metrics over fixed-width windows, and logs every flush.

#![deny(warnings)]
#![deny(missing_docs)]
use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use demux_core::{
    config::{ConfigurationLoader, GenericConfiguration},
    error::{ErrorContext as _, GenericError},
    AgentDemultiplexer, DemultiplexerConfiguration,
};
use tracing::{error, info};

mod logging;
use self::logging::{initialize_logging, LoggingConfiguration};

mod serializer;
use self::serializer::LoggingSerializer;

mod telemetry;
use self::telemetry::{initialize_metrics, report_metrics};

const METRICS_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Standalone metrics demultiplexer.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", default_value = "/etc/datadog-agent/datadog.yaml")]
    config: PathBuf,
}

fn load_configuration(path: PathBuf) -> Result<GenericConfiguration, GenericError> {
    let configuration = ConfigurationLoader::default()
        .try_from_yaml(&path)
        .from_environment("DD")
        .error_context("Environment variable prefix should not be empty.")?
        .into_generic();

    Ok(configuration)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let configuration = match load_configuration(cli.config) {
        Ok(configuration) => configuration,
        Err(e) => {
            eprintln!("FATAL: failed to load configuration: {:?}", e);
            std::process::exit(1);
        }
    };

    let _guard = match LoggingConfiguration::from_configuration(&configuration)
        .and_then(|config| initialize_logging(&config))
    {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("FATAL: failed to initialize logging: {:?}", e);
            std::process::exit(1);
        }
    };

    match initialize_metrics() {
        Ok(snapshotter) => {
            tokio::spawn(report_metrics(snapshotter, METRICS_REPORT_INTERVAL));
        }
        Err(e) => {
            error!("Failed to initialize metrics: {:?}", e);
            std::process::exit(1);
        }
    }

    match run(&configuration).await {
        Ok(()) => info!("Demultiplexer agent stopped."),
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }
}

async fn run(configuration: &GenericConfiguration) -> Result<(), GenericError> {
    let config = DemultiplexerConfiguration::from_configuration(configuration)?;
    let demux = AgentDemultiplexer::new(config, Arc::new(LoggingSerializer));

    demux.run().await?;
    info!(topology = %demux.topology(), "Demultiplexer agent started.");

    tokio::signal::ctrl_c()
        .await
        .error_context("Failed to wait for the shutdown signal.")?;

    info!("Received shutdown signal. Stopping.");
    demux.stop(true).await;

    Ok(())
}
