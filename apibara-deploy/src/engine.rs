//! Abstraction over the container engine that runs build commands and builds, syncs and pushes
//! images. Every operation produces a new value; nothing the engine hands out is mutated later.

mod docker;

use std::path::Path;

use log::{debug, warn};

pub use docker::*;

use crate::{git::SourceTree, image::ImageDescription, process, secret::Secret};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Command(#[from] process::Error),
    #[error("output of the container engine is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("output of the container engine is not valid JSON")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Engine side reference to a filesystem snapshot that commands can be executed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot(pub String);

/// A built container image.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(transparent)]
pub struct Image(pub String);

impl Image {
    pub fn id(&self) -> &str {
        &self.0
    }
}

/// The input of an image build: a source tree and the description to build it with.
#[derive(Debug, Clone)]
pub struct BuildContext<'a> {
    pub tree: SourceTree,
    pub description: &'a ImageDescription,
}

/// A bind mount of a local directory for [`Engine::run`].
#[derive(Debug, Clone, Copy)]
pub struct Mount<'a> {
    pub host: &'a Path,
    pub target: &'a str,
}

pub trait Engine: Sync {
    /// Creates a snapshot of `base_image` with `source` copied to `target`.
    fn snapshot(&self, base_image: &str, source: &SourceTree, target: &str) -> Result<Snapshot>;

    /// Runs `args` with `workdir` as working directory and snapshots the result.
    fn exec(&self, snapshot: &Snapshot, workdir: &str, args: &[String]) -> Result<Snapshot>;

    /// Reads a text file from the snapshot. Relative paths are resolved against `workdir`.
    fn read_file(&self, snapshot: &Snapshot, workdir: &str, path: &str) -> Result<String>;

    /// Deletes a snapshot. Snapshots layered on top of it must be removed first.
    fn remove(&self, snapshot: &Snapshot) -> Result<()>;

    fn build(&self, context: &BuildContext) -> Result<Image>;

    /// Makes sure the image is fully materialized.
    fn sync(&self, image: &Image) -> Result<()>;

    fn login(&self, registry: &str, username: &str, password: &Secret) -> Result<()>;

    /// Forgets the credentials stored by [`Engine::login`].
    fn logout(&self, registry: &str) -> Result<()>;

    /// Pushes the image under `address` and returns the published reference.
    fn push(&self, image: &Image, address: &str) -> Result<String>;

    /// Runs `args` in a throwaway container of `image` and returns its standard output.
    fn run(
        &self,
        image: &str,
        mount: Option<Mount>,
        workdir: Option<&str>,
        args: &[String],
    ) -> Result<String>;
}

/// A container with tooling and sources in place, plus the commands that produced it. Each
/// command yields a new environment layered on the previous one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildEnvironment {
    pub base_image: String,
    pub snapshot: Snapshot,
    /// Snapshots `snapshot` is layered on, oldest first.
    pub layers: Vec<Snapshot>,
    pub workdir: String,
    pub history: Vec<Vec<String>>,
}

impl BuildEnvironment {
    pub fn new(
        base_image: impl Into<String>,
        snapshot: Snapshot,
        workdir: impl Into<String>,
    ) -> Self {
        Self {
            base_image: base_image.into(),
            snapshot,
            layers: Vec::new(),
            workdir: workdir.into(),
            history: Vec::new(),
        }
    }

    pub fn with_exec<I, S>(&self, engine: &dyn Engine, args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let snapshot = engine.exec(&self.snapshot, &self.workdir, &args)?;

        let mut layers = self.layers.clone();
        layers.push(self.snapshot.clone());
        let mut history = self.history.clone();
        history.push(args);

        Ok(Self {
            base_image: self.base_image.clone(),
            snapshot,
            layers,
            workdir: self.workdir.clone(),
            history,
        })
    }

    pub fn read_file(&self, engine: &dyn Engine, path: &str) -> Result<String> {
        engine.read_file(&self.snapshot, &self.workdir, path)
    }

    /// Removes the snapshot of this environment and every layer below it, newest first. The
    /// environment and anything derived from it can not be used afterwards. Failures are logged
    /// and do not stop the removal of the remaining layers.
    pub fn release(&self, engine: &dyn Engine) {
        debug!(
            "removing {count} snapshots of the {base_image} environment",
            count = self.layers.len() + 1,
            base_image = self.base_image
        );
        for snapshot in std::iter::once(&self.snapshot).chain(self.layers.iter().rev()) {
            remove_snapshot(engine, snapshot);
        }
    }
}

/// Removes `snapshot`, logging instead of returning a failure.
pub fn remove_snapshot(engine: &dyn Engine, snapshot: &Snapshot) {
    if let Err(error) = engine.remove(snapshot) {
        warn!("failed to remove snapshot {id}: {error}", id = snapshot.0);
    }
}

/// Runs `echo` in an alpine container. Mostly useful to check that the engine works.
pub fn echo(engine: &dyn Engine, text: &str) -> Result<String> {
    engine.run(
        "alpine:latest",
        None,
        None,
        &["echo".to_owned(), text.to_owned()],
    )
}

/// Returns the lines of files below `dir` matching `pattern`, as printed by `grep -R`.
pub fn grep_dir(engine: &dyn Engine, dir: &Path, pattern: &str) -> Result<String> {
    const MOUNT: &str = "/mnt";
    engine.run(
        "alpine:latest",
        Some(Mount {
            host: dir,
            target: MOUNT,
        }),
        Some(MOUNT),
        &[
            "grep".to_owned(),
            "-R".to_owned(),
            pattern.to_owned(),
            ".".to_owned(),
        ],
    )
}
