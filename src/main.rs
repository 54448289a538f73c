use crate::cli::Cli;
use crate::deploy::{DeployStrategy, KubeDeployments};
use crate::docker::DockerEngine;
use crate::pipeline::PipelineOutcome;
use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod cli;
mod cluster;
mod config;
mod deploy;
mod docker;
mod eks;
mod engine;
mod image_reference;
mod oci_registry;
mod pipeline;
mod retry;
mod secret_string;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    info!("Starting kube-shipper {}", env!("CARGO_PKG_VERSION"));

    match run(cli).await {
        Ok(outcome) => {
            let name = outcome
                .deployment
                .metadata
                .name
                .as_deref()
                .unwrap_or_default();
            info!(
                "Deployment {} now runs {}",
                name, outcome.image
            );
            match outcome.strategy {
                DeployStrategy::Rolling => println!("Updated {} deployment", name),
                DeployStrategy::Create => println!("Created {} deployment", name),
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Pipeline failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<PipelineOutcome> {
    let config = config::load_config(&cli.config)?;
    let strategy = cli.strategy.unwrap_or(config.strategy);

    let image = match cli.image.as_deref() {
        Some(image) => {
            info!("Skipping build, deploying published image {}", image);
            pipeline::parse_image(image)?
        }
        None => {
            let engine = DockerEngine::connect().await?;
            let workdir = cli.workdir.as_ref().unwrap_or(&config.build.workdir);
            pipeline::publish_image(&engine, &config, workdir).await?
        }
    };
    println!("{}", image);

    info!("Authenticating against the cluster");
    let client = cluster::create_client(&config.cluster).await?;
    let deployments = KubeDeployments::new(client, &config.deployment.namespace);

    Ok(pipeline::deploy(&deployments, &config, strategy, image).await?)
}
