use clap::Args;
use constcat::concat;
use serde::Serialize;

use crate::{
    engine::DockerEngine,
    git::{self, GitFetcher},
    image::ImageDescription,
    pipeline::{self, PackageManager, Pipeline, PublishTarget},
    report::HttpReporter,
    secret::Secret,
    Result,
};

#[derive(Debug, Args)]
pub struct SourceArgs {
    /// URL of the Git repository, e.g. `github.com/org/repo`.
    #[arg(long = "repo")]
    pub repo_url: String,

    #[arg(long = "branch", default_value = git::DEFAULT_BRANCH)]
    pub branch: String,

    #[arg(long = "target-dir", help = concat!("Subdirectory of the repository that holds the project. It is used as working directory below \"", pipeline::SOURCE_MOUNT, "\" and as image build context."))]
    pub target_dir: Option<String>,
}

#[derive(Debug, Args)]
pub struct PackageManagerArgs {
    /// Package manager that installs the dependencies and runs the apibara CLI, usually "pnpm" or
    /// "npm".
    #[arg(long = "package-manager", default_value = "pnpm")]
    pub package_manager: PackageManager,
}

#[derive(Debug, Args)]
pub struct ApiArgs {
    #[arg(long = "api-endpoint", env = "APIBARA_API_ENDPOINT", help = concat!("URL to POST the contents of \"", pipeline::PROJECT_INFO_FILE_PATH, "\" to. Nothing is sent when omitted."))]
    pub api_endpoint: Option<String>,

    /// Bearer token sent along with the project info.
    #[arg(long = "api-bearer-token", env = "APIBARA_API_BEARER_TOKEN", hide_env_values = true)]
    pub api_bearer_token: Option<Secret>,
}

#[derive(Debug, Args)]
pub struct PublishArgs {
    /// Registry to publish the image to, e.g. "docker.io/username". The image is only published
    /// when the registry, image name, username and password are all given.
    #[arg(long = "registry", env = "APIBARA_REGISTRY")]
    pub registry: Option<String>,

    #[arg(long = "image-name", env = "APIBARA_IMAGE_NAME", help = concat!("Name of the image, published with the \"", pipeline::PUBLISH_TAG, "\" tag."))]
    pub image_name: Option<String>,

    #[arg(long = "registry-username", env = "APIBARA_REGISTRY_USERNAME")]
    pub username: Option<String>,

    #[arg(long = "registry-password", env = "APIBARA_REGISTRY_PASSWORD", hide_env_values = true)]
    pub password: Option<Secret>,
}

impl PublishArgs {
    pub fn into_target(self) -> pipeline::Result<Option<PublishTarget>> {
        let Self {
            registry,
            image_name,
            username,
            password,
        } = self;
        PublishTarget::from_parts(registry, image_name, username, password)
    }
}

/// Runs `f` with a pipeline that fetches with git, builds with docker and reports over HTTP.
pub fn with_pipeline<T>(f: impl FnOnce(&Pipeline) -> pipeline::Result<T>) -> Result<T> {
    let description = ImageDescription::apibara();
    let reporter = HttpReporter::default();
    let pipeline = Pipeline {
        fetcher: &GitFetcher,
        engine: &DockerEngine,
        reporter: &reporter,
        description: &description,
    };
    Ok(f(&pipeline)?)
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
