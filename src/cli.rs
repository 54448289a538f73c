use crate::deploy::DeployStrategy;
use clap::Parser;
use std::path::PathBuf;

/// Build a binary in a container, publish the image and roll it out to a
/// Kubernetes cluster.
#[derive(Debug, Parser)]
#[command(name = "kube-shipper", version, about)]
pub struct Cli {
    /// Pipeline configuration file
    #[arg(short, long, default_value = "pipeline.yaml")]
    pub config: PathBuf,

    /// Override the deployment strategy from the configuration
    #[arg(short, long, value_enum)]
    pub strategy: Option<DeployStrategy>,

    /// Deploy an already published image and skip build, package and publish
    #[arg(short, long)]
    pub image: Option<String>,

    /// Directory mounted into the build container, overrides `build.workdir`
    #[arg(short, long)]
    pub workdir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["kube-shipper"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("pipeline.yaml"));
        assert!(cli.strategy.is_none());
        assert!(cli.image.is_none());
    }

    #[test]
    fn test_strategy_and_image_flags() {
        let cli = Cli::try_parse_from([
            "kube-shipper",
            "--config",
            "ci/doks.yaml",
            "--strategy",
            "create",
            "--image",
            "registry.example.com/hello:latest@sha256:abc",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("ci/doks.yaml"));
        assert_eq!(cli.strategy, Some(DeployStrategy::Create));
        assert_eq!(
            cli.image.as_deref(),
            Some("registry.example.com/hello:latest@sha256:abc")
        );
    }

    #[test]
    fn test_unknown_strategy_is_rejected() {
        assert!(Cli::try_parse_from(["kube-shipper", "--strategy", "recreate"]).is_err());
    }
}
