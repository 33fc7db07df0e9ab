use clap::Args;
use log::info;

use super::common::{self, ApiArgs, PackageManagerArgs, PublishArgs, SourceArgs};
use crate::{pipeline::PipelineConfig, Result};

#[derive(Debug, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    #[command(flatten)]
    pub package_manager: PackageManagerArgs,

    #[command(flatten)]
    pub api: ApiArgs,

    #[command(flatten)]
    pub publish: PublishArgs,
}

impl RunArgs {
    pub fn into_config(self) -> Result<PipelineConfig> {
        let RunArgs {
            source,
            package_manager,
            api,
            publish,
        } = self;

        Ok(PipelineConfig {
            repo_url: source.repo_url,
            branch: source.branch,
            package_manager: package_manager.package_manager,
            target_dir: source.target_dir,
            api_endpoint: api.api_endpoint,
            api_bearer_token: api.api_bearer_token,
            publish: publish.into_target()?,
        })
    }
}

pub fn run(args: RunArgs) -> Result<()> {
    let config = args.into_config()?;
    let output = common::with_pipeline(|pipeline| pipeline.run(&config))?;
    common::print_json(&output)
}

#[derive(Debug, Args)]
pub struct BuildArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    #[command(flatten)]
    pub package_manager: PackageManagerArgs,
}

pub fn build(args: BuildArgs) -> Result<()> {
    let BuildArgs {
        source,
        package_manager,
    } = args;

    let workdir = common::with_pipeline(|pipeline| {
        let (_, built) = pipeline.build_project(
            &source.repo_url,
            &source.branch,
            &package_manager.package_manager,
            source.target_dir.as_deref(),
        )?;
        built.env.release(pipeline.engine);
        Ok(built.env.workdir)
    })?;
    info!(
        "built {repo} at branch {branch} in {workdir}",
        repo = source.repo_url,
        branch = source.branch,
    );
    Ok(())
}

#[derive(Debug, Args)]
pub struct ProjectInfoArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    #[command(flatten)]
    pub package_manager: PackageManagerArgs,

    #[command(flatten)]
    pub api: ApiArgs,
}

pub fn project_info(args: ProjectInfoArgs) -> Result<()> {
    let ProjectInfoArgs {
        source,
        package_manager,
        api,
    } = args;

    let project_info = common::with_pipeline(|pipeline| {
        let (_, built) = pipeline.build_project(
            &source.repo_url,
            &source.branch,
            &package_manager.package_manager,
            source.target_dir.as_deref(),
        )?;
        let project_info = pipeline.generate_and_send(
            &built,
            api.api_endpoint.as_deref(),
            api.api_bearer_token.as_ref(),
        );
        built.env.release(pipeline.engine);
        project_info
    })?;
    println!("{project_info}");
    Ok(())
}

#[derive(Debug, Args)]
pub struct ImageArgs {
    #[command(flatten)]
    pub source: SourceArgs,
}

pub fn image(args: ImageArgs) -> Result<()> {
    let ImageArgs { source } = args;

    let image = common::with_pipeline(|pipeline| {
        let tree = pipeline.fetch_source(&source.repo_url, &source.branch)?;
        pipeline.build_image(&tree, source.target_dir.as_deref())
    })?;
    println!("{}", image.id());
    Ok(())
}
