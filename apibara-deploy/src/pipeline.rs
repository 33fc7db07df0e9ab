//! Fetches an Apibara indexer project, builds it, reports its project info, builds its image and
//! publishes the image. Each step fails the whole run; nothing is retried.

use std::{fmt, str::FromStr, thread};

use log::{error, info, warn};

use crate::{
    engine::{self, BuildContext, BuildEnvironment, Engine, Image},
    git::{SourceFetcher, SourceTree, DEFAULT_BRANCH},
    image::ImageDescription,
    report::Reporter,
    secret::Secret,
    BoxError,
};

pub const BASE_IMAGE: &str = "node:22-alpine";
pub const SOURCE_MOUNT: &str = "/src";
pub const PROJECT_INFO_FILE_PATH: &str = ".apibara/project-info.json";
pub const PUBLISH_TAG: &str = "latest";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to fetch {repo_url} at branch {branch}")]
    Fetch {
        repo_url: String,
        branch: String,
        source: BoxError,
    },
    #[error("failed to build the project")]
    Build(#[source] engine::Error),
    #[error("failed to read {path}, the build did not produce it")]
    Read {
        path: String,
        source: engine::Error,
    },
    #[error("failed to send project info to {endpoint}")]
    Report { endpoint: String, source: BoxError },
    #[error("failed to build the image")]
    ImageBuild(#[source] engine::Error),
    #[error("registry credentials or image details missing: {missing}")]
    MissingCredentials { missing: String },
    #[error("failed to publish the image to {address}")]
    Publish {
        address: String,
        source: engine::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The package manager that installs dependencies and runs the `apibara` CLI. The name is passed
/// to the build environment as is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageManager(String);

impl PackageManager {
    pub const KNOWN: [&'static str; 2] = ["pnpm", "npm"];

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_known(&self) -> bool {
        Self::KNOWN.contains(&self.as_str())
    }
}

impl Default for PackageManager {
    fn default() -> Self {
        Self::new("pnpm")
    }
}

impl FromStr for PackageManager {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where and as whom to publish the image.
#[derive(Debug, Clone)]
pub struct PublishTarget {
    /// Registry host, possibly followed by a namespace, e.g. `docker.io/username`.
    pub registry: String,
    pub image_name: String,
    pub username: String,
    pub password: Secret,
}

impl PublishTarget {
    /// Returns `None` when no part is given and an error when only some parts are given.
    pub fn from_parts(
        registry: Option<String>,
        image_name: Option<String>,
        username: Option<String>,
        password: Option<Secret>,
    ) -> Result<Option<Self>> {
        let given = |value: Option<&str>| value.is_some_and(|value| !value.is_empty());
        if !given(registry.as_deref())
            && !given(image_name.as_deref())
            && !given(username.as_deref())
            && !given(password.as_ref().map(Secret::expose))
        {
            return Ok(None);
        }

        let target = Self {
            registry: registry.unwrap_or_default(),
            image_name: image_name.unwrap_or_default(),
            username: username.unwrap_or_default(),
            password: password.unwrap_or_else(|| Secret::new("")),
        };
        target.check()?;
        Ok(Some(target))
    }

    fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.registry.is_empty() {
            missing.push("registry");
        }
        if self.image_name.is_empty() {
            missing.push("image name");
        }
        if self.username.is_empty() {
            missing.push("username");
        }
        if self.password.is_empty() {
            missing.push("password");
        }
        missing
    }

    pub fn check(&self) -> Result<()> {
        let missing = self.missing();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::MissingCredentials {
                missing: missing.join(", "),
            })
        }
    }

    pub fn address(&self) -> String {
        format!(
            "{registry}/{name}:{PUBLISH_TAG}",
            registry = self.registry,
            name = self.image_name
        )
    }
}

/// Inputs of a full pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub repo_url: String,
    /// Defaults to [`DEFAULT_BRANCH`].
    pub branch: String,
    /// Defaults to pnpm.
    pub package_manager: PackageManager,
    /// Subdirectory of the repository holding the project. Also used as image build context.
    pub target_dir: Option<String>,
    /// Project info is only sent when this is a non-empty URL.
    pub api_endpoint: Option<String>,
    pub api_bearer_token: Option<Secret>,
    /// Publishing is skipped when this is `None`.
    pub publish: Option<PublishTarget>,
}

impl PipelineConfig {
    pub fn new(repo_url: impl Into<String>) -> Self {
        Self {
            repo_url: repo_url.into(),
            branch: DEFAULT_BRANCH.to_owned(),
            package_manager: PackageManager::default(),
            target_dir: None,
            api_endpoint: None,
            api_bearer_token: None,
            publish: None,
        }
    }

    pub fn target_dir(&self) -> Option<&str> {
        normalize_target_dir(self.target_dir.as_deref())
    }
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineOutput {
    pub image: Image,
    pub project_info: String,
    pub published_address: Option<String>,
}

/// An environment in which dependencies have been installed and the project has been built.
#[derive(Debug, Clone)]
pub struct BuiltProject {
    pub env: BuildEnvironment,
    pub package_manager: PackageManager,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.is_empty())
}

/// Target directories are relative to the repository root, so surrounding slashes are dropped. A
/// directory that is empty afterwards means the root.
pub fn normalize_target_dir(target_dir: Option<&str>) -> Option<&str> {
    non_empty(target_dir.map(|target_dir| target_dir.trim_matches('/')))
}

/// Returns `/src/<target_dir>`, or `/src` when there is no target directory.
pub fn working_directory(target_dir: Option<&str>) -> String {
    match normalize_target_dir(target_dir) {
        Some(target_dir) => format!("{SOURCE_MOUNT}/{target_dir}"),
        None => SOURCE_MOUNT.to_owned(),
    }
}

pub struct Pipeline<'a> {
    pub fetcher: &'a dyn SourceFetcher,
    pub engine: &'a dyn Engine,
    pub reporter: &'a dyn Reporter,
    pub description: &'a ImageDescription,
}

impl Pipeline<'_> {
    pub fn fetch_source(&self, repo_url: &str, branch: &str) -> Result<SourceTree> {
        self.fetcher
            .fetch(repo_url, branch)
            .map_err(|source| Error::Fetch {
                repo_url: repo_url.to_owned(),
                branch: branch.to_owned(),
                source,
            })
    }

    /// Places the sources at [`SOURCE_MOUNT`] and enables corepack so pnpm is available.
    pub fn prepare_environment(
        &self,
        source: &SourceTree,
        target_dir: Option<&str>,
    ) -> Result<BuildEnvironment> {
        let snapshot = self
            .engine
            .snapshot(BASE_IMAGE, source, SOURCE_MOUNT)
            .map_err(Error::Build)?;

        let base = BuildEnvironment::new(BASE_IMAGE, snapshot, working_directory(target_dir));
        base.with_exec(self.engine, ["corepack", "enable"])
            .map_err(|source| {
                base.release(self.engine);
                Error::Build(source)
            })
    }

    /// Installs dependencies from the frozen lockfile, then builds. The build is not attempted when
    /// the install fails.
    pub fn build(
        &self,
        env: &BuildEnvironment,
        package_manager: &PackageManager,
    ) -> Result<BuiltProject> {
        if !package_manager.is_known() {
            warn!(
                "package manager \"{package_manager}\" is not one of {known:?}, using it anyway",
                known = PackageManager::KNOWN
            );
        }
        info!("building with {package_manager} in {workdir}", workdir = env.workdir);
        let pm = package_manager.as_str();

        let installed = env
            .with_exec(self.engine, [pm, "install", "--frozen-lockfile"])
            .map_err(Error::Build)?;
        let env = installed
            .with_exec(self.engine, [pm, "apibara", "build"])
            .map_err(|source| {
                engine::remove_snapshot(self.engine, &installed.snapshot);
                Error::Build(source)
            })?;

        Ok(BuiltProject {
            env,
            package_manager: package_manager.clone(),
        })
    }

    pub fn build_project(
        &self,
        repo_url: &str,
        branch: &str,
        package_manager: &PackageManager,
        target_dir: Option<&str>,
    ) -> Result<(SourceTree, BuiltProject)> {
        let source = self.fetch_source(repo_url, branch)?;
        let env = self.prepare_environment(&source, target_dir)?;
        match self.build(&env, package_manager) {
            Ok(built) => Ok((source, built)),
            Err(error) => {
                env.release(self.engine);
                Err(error)
            }
        }
    }

    /// Writes the project info, reads it and sends it to `api_endpoint` when one is given. Returns
    /// the project info as produced by the build. `built` is left as it was.
    pub fn generate_and_send(
        &self,
        built: &BuiltProject,
        api_endpoint: Option<&str>,
        api_bearer_token: Option<&Secret>,
    ) -> Result<String> {
        let pm = built.package_manager.as_str();
        let written = built
            .env
            .with_exec(self.engine, [pm, "apibara", "write-project-info"])
            .map_err(Error::Build)?;
        let project_info = written.read_file(self.engine, PROJECT_INFO_FILE_PATH);
        engine::remove_snapshot(self.engine, &written.snapshot);
        let project_info = project_info.map_err(|source| Error::Read {
            path: PROJECT_INFO_FILE_PATH.to_owned(),
            source,
        })?;

        if let Some(endpoint) = non_empty(api_endpoint) {
            self.reporter
                .report(endpoint, api_bearer_token, &project_info)
                .map_err(|source| {
                    error!("failed to send project info to {endpoint}: {source}");
                    Error::Report {
                        endpoint: endpoint.to_owned(),
                        source,
                    }
                })?;
            info!("sent project info to {endpoint}");
        } else {
            warn!("no API endpoint configured, skipping sending the project info");
        }

        Ok(project_info)
    }

    /// Builds the image with `target_dir`, or the whole tree, as context.
    pub fn build_image(&self, source: &SourceTree, target_dir: Option<&str>) -> Result<Image> {
        let tree = match normalize_target_dir(target_dir) {
            Some(target_dir) => source.directory(target_dir),
            None => source.clone(),
        };
        info!(
            "building image of {repo} at branch {branch}",
            repo = tree.repo_url(),
            branch = tree.branch()
        );
        self.engine
            .build(&BuildContext {
                tree,
                description: self.description,
            })
            .map_err(Error::ImageBuild)
    }

    /// Pushes the image as `<registry>/<image_name>:latest` and returns the published reference.
    /// The registry credentials are only stored for the duration of the push.
    pub fn publish(&self, image: &Image, target: &PublishTarget) -> Result<String> {
        target.check()?;
        let address = target.address();

        let push = || -> engine::Result<String> {
            self.engine.sync(image)?;
            self.engine
                .login(&target.registry, &target.username, &target.password)?;
            let pushed = self.engine.push(image, &address);
            if let Err(error) = self.engine.logout(&target.registry) {
                warn!(
                    "failed to log out of {registry}: {error}",
                    registry = target.registry
                );
            }
            pushed
        };

        let published = push().map_err(|source| {
            error!("failed to publish image: {source}");
            Error::Publish {
                address: address.clone(),
                source,
            }
        })?;
        info!("image published successfully to: {published}");
        Ok(published)
    }

    /// Runs every step. The project info and the image are produced concurrently; the image is
    /// only published when both succeed.
    pub fn run(&self, config: &PipelineConfig) -> Result<PipelineOutput> {
        if let Some(target) = &config.publish {
            target.check()?;
        }
        let target_dir = config.target_dir();

        let (source, built) = self.build_project(
            &config.repo_url,
            &config.branch,
            &config.package_manager,
            target_dir,
        )?;

        let (project_info, image) = thread::scope(|scope| {
            let project_info = scope.spawn(|| {
                self.generate_and_send(
                    &built,
                    config.api_endpoint.as_deref(),
                    config.api_bearer_token.as_ref(),
                )
            });
            let image = self.build_image(&source, target_dir);
            let project_info = project_info
                .join()
                .unwrap_or_else(|payload| std::panic::resume_unwind(payload));
            (project_info, image)
        });
        built.env.release(self.engine);
        let project_info = project_info?;
        let image = image?;

        let published_address = match &config.publish {
            Some(target) => Some(self.publish(&image, target)?),
            None => {
                info!("no registry configured, skipping publishing");
                None
            }
        };

        Ok(PipelineOutput {
            image,
            project_info,
            published_address,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, path::PathBuf, sync::Mutex};

    use super::*;
    use crate::{
        engine::{
            fake::{Call, FakeEngine},
            Snapshot,
        },
        report::fake::FakeReporter,
    };

    const REPO_URL: &str = "github.com/org/repo";
    const PROJECT_INFO: &str = r#"{"indexers":{"starknet":{"path":"indexers/starknet.indexer.ts"}}}"#;
    const PASSWORD: &str = "hunter2";

    #[derive(Default)]
    struct FakeFetcher {
        calls: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    impl SourceFetcher for FakeFetcher {
        fn fetch(&self, repo_url: &str, branch: &str) -> crate::Result<SourceTree> {
            self.calls
                .lock()
                .unwrap()
                .push((repo_url.to_owned(), branch.to_owned()));
            if self.fail {
                return Err("repository not found".into());
            }
            Ok(SourceTree::new(repo_url, branch, PathBuf::from("/checkout")))
        }
    }

    /// An engine on which `write-project-info` produces the project info file.
    fn engine() -> FakeEngine {
        FakeEngine {
            writes: HashMap::from([(
                "write-project-info".to_owned(),
                (PROJECT_INFO_FILE_PATH.to_owned(), PROJECT_INFO.to_owned()),
            )]),
            ..Default::default()
        }
    }

    const DESCRIPTION: ImageDescription = ImageDescription::apibara();

    fn pipeline<'a>(
        fetcher: &'a FakeFetcher,
        engine: &'a FakeEngine,
        reporter: &'a FakeReporter,
    ) -> Pipeline<'a> {
        Pipeline {
            fetcher,
            engine,
            reporter,
            description: &DESCRIPTION,
        }
    }

    fn publish_target() -> PublishTarget {
        PublishTarget {
            registry: "registry.example.com".to_owned(),
            image_name: "indexer".to_owned(),
            username: "deployer".to_owned(),
            password: Secret::new(PASSWORD),
        }
    }

    fn execs(engine: &FakeEngine) -> Vec<String> {
        engine
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Exec { args, .. } => Some(args.join(" ")),
                _ => None,
            })
            .collect()
    }

    fn has_publish_calls(engine: &FakeEngine) -> bool {
        engine
            .calls()
            .iter()
            .any(|call| {
                matches!(
                    call,
                    Call::Sync(_) | Call::Login { .. } | Call::Push { .. } | Call::Logout { .. }
                )
            })
    }

    fn removed(engine: &FakeEngine) -> Vec<String> {
        engine
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Remove(Snapshot(id)) => Some(id),
                _ => None,
            })
            .collect()
    }

    fn source() -> SourceTree {
        SourceTree::new(REPO_URL, DEFAULT_BRANCH, PathBuf::from("/checkout"))
    }

    fn built(engine: &FakeEngine) -> BuiltProject {
        let fetcher = FakeFetcher::default();
        let reporter = FakeReporter::default();
        let pipeline = pipeline(&fetcher, engine, &reporter);
        let env = pipeline.prepare_environment(&source(), None).unwrap();
        pipeline.build(&env, &PackageManager::default()).unwrap()
    }

    #[test]
    fn working_directory_is_below_source_mount() {
        assert_eq!(working_directory(None), "/src");
        assert_eq!(working_directory(Some("")), "/src");
        assert_eq!(working_directory(Some("indexer")), "/src/indexer");
        assert_eq!(
            working_directory(Some("packages/indexers/starknet")),
            "/src/packages/indexers/starknet"
        );
    }

    #[test]
    fn target_dir_ignores_surrounding_slashes() {
        assert_eq!(working_directory(Some("/indexer")), "/src/indexer");
        assert_eq!(working_directory(Some("indexer/")), "/src/indexer");
        assert_eq!(working_directory(Some("/")), "/src");

        let mut config = PipelineConfig::new(REPO_URL);
        config.target_dir = Some("/indexer/".to_owned());
        assert_eq!(config.target_dir(), Some("indexer"));
        config.target_dir = Some("/".to_owned());
        assert_eq!(config.target_dir(), None);

        let fetcher = FakeFetcher::default();
        let engine = engine();
        let reporter = FakeReporter::default();
        pipeline(&fetcher, &engine, &reporter)
            .build_image(&source(), Some("/indexer/"))
            .unwrap();
        assert_eq!(
            engine.calls(),
            [Call::Build {
                root: PathBuf::from("/checkout/indexer"),
                filename: "Dockerfile.gen".to_owned(),
            }]
        );
    }

    #[test]
    fn fetch_failure_stops_the_pipeline() {
        let fetcher = FakeFetcher {
            fail: true,
            ..Default::default()
        };
        let engine = engine();
        let reporter = FakeReporter::default();
        let mut config = PipelineConfig::new(REPO_URL);
        config.branch = "feature".to_owned();

        let error = pipeline(&fetcher, &engine, &reporter)
            .run(&config)
            .unwrap_err();

        assert!(matches!(error, Error::Fetch { .. }), "{error:?}");
        assert_eq!(
            *fetcher.calls.lock().unwrap(),
            [(REPO_URL.to_owned(), "feature".to_owned())]
        );
        assert!(engine.calls().is_empty());
        assert!(reporter.reports().is_empty());
    }

    #[test]
    fn prepare_environment_enables_corepack_in_working_directory() {
        let fetcher = FakeFetcher::default();
        let engine = engine();
        let reporter = FakeReporter::default();

        let env = pipeline(&fetcher, &engine, &reporter)
            .prepare_environment(&source(), Some("indexer"))
            .unwrap();

        assert_eq!(env.workdir, "/src/indexer");
        assert_eq!(env.history, [["corepack", "enable"]]);
        assert_eq!(
            engine.calls(),
            [
                Call::Snapshot {
                    base_image: BASE_IMAGE.to_owned(),
                    target: SOURCE_MOUNT.to_owned(),
                },
                Call::Exec {
                    workdir: "/src/indexer".to_owned(),
                    args: vec!["corepack".to_owned(), "enable".to_owned()],
                },
            ]
        );
    }

    #[test]
    fn build_installs_before_building() {
        let engine = engine();
        let built = built(&engine);

        assert_eq!(
            execs(&engine),
            [
                "corepack enable",
                "pnpm install --frozen-lockfile",
                "pnpm apibara build",
            ]
        );
        assert_eq!(built.env.history.len(), 3);
    }

    #[test]
    fn failed_install_never_builds() {
        let fetcher = FakeFetcher::default();
        let engine = FakeEngine {
            failing: vec!["install".to_owned()],
            ..engine()
        };
        let reporter = FakeReporter::default();
        let pipeline = pipeline(&fetcher, &engine, &reporter);

        let env = pipeline.prepare_environment(&source(), None).unwrap();
        let error = pipeline
            .build(&env, &PackageManager::default())
            .unwrap_err();

        assert!(matches!(error, Error::Build(_)), "{error:?}");
        assert_eq!(
            execs(&engine),
            ["corepack enable", "pnpm install --frozen-lockfile"]
        );
    }

    #[test]
    fn unknown_package_manager_is_used_verbatim() {
        let fetcher = FakeFetcher::default();
        let engine = engine();
        let reporter = FakeReporter::default();
        let pipeline = pipeline(&fetcher, &engine, &reporter);

        let env = pipeline.prepare_environment(&source(), None).unwrap();
        pipeline.build(&env, &PackageManager::new("yarn")).unwrap();

        assert_eq!(
            execs(&engine)[1..],
            ["yarn install --frozen-lockfile", "yarn apibara build"]
        );
    }

    #[test]
    fn generate_without_endpoint_skips_report() {
        let fetcher = FakeFetcher::default();
        let engine = engine();
        let reporter = FakeReporter::default();
        let built = built(&engine);
        let pipeline = pipeline(&fetcher, &engine, &reporter);

        for endpoint in [None, Some("")] {
            let project_info = pipeline.generate_and_send(&built, endpoint, None).unwrap();
            assert_eq!(project_info, PROJECT_INFO);
        }
        assert!(reporter.reports().is_empty());
        assert!(execs(&engine).contains(&"pnpm apibara write-project-info".to_owned()));
    }

    #[test]
    fn missing_project_info_is_a_read_error() {
        let fetcher = FakeFetcher::default();
        let engine = FakeEngine::default();
        let reporter = FakeReporter::default();
        let built = built(&engine);

        let error = pipeline(&fetcher, &engine, &reporter)
            .generate_and_send(&built, Some("https://api.example.com/ingest"), None)
            .unwrap_err();

        assert!(matches!(error, Error::Read { .. }), "{error:?}");
        assert!(reporter.reports().is_empty());
        assert_eq!(removed(&engine), ["snapshot-5"]);
        assert_eq!(built.env.snapshot, Snapshot("snapshot-4".to_owned()));
    }

    #[test]
    fn report_failure_is_a_report_error() {
        let fetcher = FakeFetcher::default();
        let engine = engine();
        let reporter = FakeReporter {
            fail: true,
            ..Default::default()
        };
        let built = built(&engine);

        let error = pipeline(&fetcher, &engine, &reporter)
            .generate_and_send(&built, Some("https://api.example.com/ingest"), None)
            .unwrap_err();

        assert!(matches!(error, Error::Report { .. }), "{error:?}");
        assert_eq!(reporter.reports().len(), 1);
    }

    #[test]
    fn build_image_uses_target_dir_as_context() {
        let fetcher = FakeFetcher::default();
        let engine = engine();
        let reporter = FakeReporter::default();
        let pipeline = pipeline(&fetcher, &engine, &reporter);

        pipeline.build_image(&source(), Some("indexer")).unwrap();
        pipeline.build_image(&source(), None).unwrap();

        assert_eq!(
            engine.calls(),
            [
                Call::Build {
                    root: PathBuf::from("/checkout/indexer"),
                    filename: "Dockerfile.gen".to_owned(),
                },
                Call::Build {
                    root: PathBuf::from("/checkout"),
                    filename: "Dockerfile.gen".to_owned(),
                },
            ]
        );
    }

    #[test]
    fn publish_with_missing_credentials_makes_no_engine_calls() {
        let fetcher = FakeFetcher::default();
        let engine = engine();
        let reporter = FakeReporter::default();
        let pipeline = pipeline(&fetcher, &engine, &reporter);
        let image = Image("sha256:built".to_owned());

        let without: [fn(&mut PublishTarget); 4] = [
            |target| target.registry.clear(),
            |target| target.image_name.clear(),
            |target| target.username.clear(),
            |target| target.password = Secret::new(""),
        ];
        for clear in without {
            let mut target = publish_target();
            clear(&mut target);
            let error = pipeline.publish(&image, &target).unwrap_err();
            assert!(matches!(error, Error::MissingCredentials { .. }), "{error:?}");
        }
        assert!(engine.calls().is_empty());
    }

    #[test]
    fn publish_target_from_parts() {
        assert!(PublishTarget::from_parts(None, None, None, None)
            .unwrap()
            .is_none());
        assert!(
            PublishTarget::from_parts(Some(String::new()), None, Some(String::new()), None)
                .unwrap()
                .is_none()
        );

        let error = PublishTarget::from_parts(
            Some("registry.example.com".to_owned()),
            Some("indexer".to_owned()),
            None,
            None,
        )
        .unwrap_err();
        assert_eq!(
            error.to_string(),
            "registry credentials or image details missing: username, password"
        );

        let target = PublishTarget::from_parts(
            Some("docker.io/org".to_owned()),
            Some("indexer".to_owned()),
            Some("deployer".to_owned()),
            Some(Secret::new(PASSWORD)),
        )
        .unwrap()
        .unwrap();
        assert_eq!(target.address(), "docker.io/org/indexer:latest");
    }

    #[test]
    fn run_without_endpoint_or_publish_target() {
        let fetcher = FakeFetcher::default();
        let engine = engine();
        let reporter = FakeReporter::default();
        let mut config = PipelineConfig::new(REPO_URL);
        config.api_endpoint = Some(String::new());

        let output = pipeline(&fetcher, &engine, &reporter)
            .run(&config)
            .unwrap();

        assert_eq!(output.image, Image("sha256:built".to_owned()));
        assert_eq!(output.project_info, PROJECT_INFO);
        assert_eq!(output.published_address, None);
        assert!(reporter.reports().is_empty());
        assert!(!has_publish_calls(&engine));
        assert_eq!(
            *fetcher.calls.lock().unwrap(),
            [(REPO_URL.to_owned(), "main".to_owned())]
        );
    }

    #[test]
    fn run_with_endpoint_reports_once() {
        let fetcher = FakeFetcher::default();
        let engine = engine();
        let reporter = FakeReporter::default();
        let mut config = PipelineConfig::new(REPO_URL);
        config.api_endpoint = Some("https://api.example.com/ingest".to_owned());
        config.api_bearer_token = Some(Secret::new("abc123"));

        pipeline(&fetcher, &engine, &reporter).run(&config).unwrap();

        assert_eq!(
            reporter.reports(),
            [crate::report::fake::Report {
                endpoint: "https://api.example.com/ingest".to_owned(),
                bearer_token: Some(Secret::new("abc123")),
                project_info: PROJECT_INFO.to_owned(),
            }]
        );
    }

    #[test]
    fn run_publishes_with_credentials() {
        let fetcher = FakeFetcher::default();
        let engine = engine();
        let reporter = FakeReporter::default();
        let mut config = PipelineConfig::new(REPO_URL);
        config.publish = Some(publish_target());

        let output = pipeline(&fetcher, &engine, &reporter)
            .run(&config)
            .unwrap();

        assert_eq!(
            output.published_address.as_deref(),
            Some("registry.example.com/indexer:latest@sha256:pushed")
        );
        let calls = engine.calls();
        let publish_calls: Vec<_> = calls
            .iter()
            .skip_while(|call| !matches!(call, Call::Sync(_)))
            .collect();
        assert_eq!(
            publish_calls,
            [
                &Call::Sync(Image("sha256:built".to_owned())),
                &Call::Login {
                    registry: "registry.example.com".to_owned(),
                    username: "deployer".to_owned(),
                },
                &Call::Push {
                    image: Image("sha256:built".to_owned()),
                    address: "registry.example.com/indexer:latest".to_owned(),
                },
                &Call::Logout {
                    registry: "registry.example.com".to_owned(),
                },
            ]
        );
    }

    #[test]
    fn run_fails_when_push_fails() {
        let fetcher = FakeFetcher::default();
        let engine = FakeEngine {
            fail_push: true,
            ..engine()
        };
        let reporter = FakeReporter::default();
        let mut config = PipelineConfig::new(REPO_URL);
        config.publish = Some(publish_target());

        let error = pipeline(&fetcher, &engine, &reporter)
            .run(&config)
            .unwrap_err();

        assert!(matches!(error, Error::Publish { .. }), "{error:?}");
        assert_eq!(
            engine.calls().last(),
            Some(&Call::Logout {
                registry: "registry.example.com".to_owned(),
            })
        );
        assert!(!error.to_string().contains(PASSWORD));
        assert!(!format!("{error:?}").contains(PASSWORD));
        assert!(!format!("{config:?}").contains(PASSWORD));
    }

    #[test]
    fn run_removes_every_snapshot_it_created() {
        let fetcher = FakeFetcher::default();
        let engine = engine();
        let reporter = FakeReporter::default();

        pipeline(&fetcher, &engine, &reporter)
            .run(&PipelineConfig::new(REPO_URL))
            .unwrap();

        let created = engine
            .calls()
            .iter()
            .filter(|call| matches!(call, Call::Snapshot { .. } | Call::Exec { .. }))
            .count();
        assert_eq!(created, 5);
        assert_eq!(
            removed(&engine),
            [
                "snapshot-5",
                "snapshot-4",
                "snapshot-3",
                "snapshot-2",
                "snapshot-1"
            ]
        );
    }

    #[test]
    fn failed_build_steps_remove_their_snapshots() {
        for (failing, expected) in [
            ("corepack", vec!["snapshot-1"]),
            ("install", vec!["snapshot-2", "snapshot-1"]),
            (
                "apibara build",
                vec!["snapshot-3", "snapshot-2", "snapshot-1"],
            ),
        ] {
            let fetcher = FakeFetcher::default();
            let engine = FakeEngine {
                failing: vec![failing.to_owned()],
                ..engine()
            };
            let reporter = FakeReporter::default();

            let error = pipeline(&fetcher, &engine, &reporter)
                .run(&PipelineConfig::new(REPO_URL))
                .unwrap_err();

            assert!(matches!(error, Error::Build(_)), "{error:?}");
            assert_eq!(removed(&engine), expected, "{failing} failed");
        }
    }

    #[test]
    fn run_fails_when_image_build_fails() {
        let fetcher = FakeFetcher::default();
        let engine = FakeEngine {
            fail_build: true,
            ..engine()
        };
        let reporter = FakeReporter::default();
        let mut config = PipelineConfig::new(REPO_URL);
        config.publish = Some(publish_target());

        let error = pipeline(&fetcher, &engine, &reporter)
            .run(&config)
            .unwrap_err();

        assert!(matches!(error, Error::ImageBuild(_)), "{error:?}");
        assert!(!has_publish_calls(&engine));
    }

    #[test]
    fn run_rejects_partial_publish_target_before_fetching() {
        let fetcher = FakeFetcher::default();
        let engine = engine();
        let reporter = FakeReporter::default();
        let mut config = PipelineConfig::new(REPO_URL);
        config.publish = Some(PublishTarget {
            username: String::new(),
            ..publish_target()
        });

        let error = pipeline(&fetcher, &engine, &reporter)
            .run(&config)
            .unwrap_err();

        assert!(matches!(error, Error::MissingCredentials { .. }), "{error:?}");
        assert!(fetcher.calls.lock().unwrap().is_empty());
        assert!(engine.calls().is_empty());
    }
}
