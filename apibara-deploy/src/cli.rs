mod common;
mod index;
mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::{engine, version, Result};

#[derive(Debug, Parser)]
#[command(version = version::VERSION, about)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build the project, send its project info, build its image and publish it
    #[command(arg_required_else_help = true)]
    Run(run::RunArgs),

    /// Fetch and build the project
    #[command(arg_required_else_help = true)]
    Build(run::BuildArgs),

    /// Build the project and send its project info, printing the project info
    #[command(arg_required_else_help = true)]
    ProjectInfo(run::ProjectInfoArgs),

    /// Build the image of the project, printing the image id
    #[command(arg_required_else_help = true)]
    Image(run::ImageArgs),

    /// Echo text from inside a container to check that the container engine works
    Echo { text: String },

    /// Print lines matching a pattern in the files of a directory, searched inside a container
    #[command(arg_required_else_help = true)]
    Grep { dir: PathBuf, pattern: String },

    /// Log the events of a StarkNet contract from a stream of blocks
    Index(index::IndexArgs),
}

impl Cli {
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Run(args) => run::run(args)?,
            Commands::Build(args) => run::build(args)?,
            Commands::ProjectInfo(args) => run::project_info(args)?,
            Commands::Image(args) => run::image(args)?,
            Commands::Echo { text } => {
                print!("{}", engine::echo(&engine::DockerEngine, &text)?);
            }
            Commands::Grep { dir, pattern } => {
                let dir = dir.canonicalize()?;
                print!("{}", engine::grep_dir(&engine::DockerEngine, &dir, &pattern)?);
            }
            Commands::Index(args) => index::index(args)?,
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;
    use crate::pipeline::PackageManager;

    #[test]
    fn cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_defaults() {
        let cli = Cli::try_parse_from(["apibara-deploy", "run", "--repo", "github.com/org/repo"])
            .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected the run command");
        };
        let config = args.into_config().unwrap();
        assert_eq!(config.repo_url, "github.com/org/repo");
        assert_eq!(config.branch, "main");
        assert_eq!(config.package_manager, PackageManager::new("pnpm"));
        assert!(config.publish.is_none());
    }

    #[test]
    fn run_rejects_partial_publish_arguments() {
        let cli = Cli::try_parse_from([
            "apibara-deploy",
            "run",
            "--repo",
            "github.com/org/repo",
            "--registry",
            "docker.io/org",
            "--image-name",
            "indexer",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected the run command");
        };
        assert!(args.into_config().is_err());
    }
}
