use std::{ffi::OsStr, io::Write};

use log::{debug, info};

use super::{BuildContext, Engine, Error, Image, Mount, Result, Snapshot};
use crate::{git::SourceTree, process, secret::Secret};

/// Drives the `docker` command line. Snapshots are untagged images created with `docker commit`,
/// so every executed command leaves the previous snapshot intact until it is removed.
#[derive(Debug, Default)]
pub struct DockerEngine;

/// Partial implementation of the JSON emitted by `docker image inspect --format '{{json .RepoDigests}}'`.
type RepoDigests = Vec<String>;

/// Strips the tag from an image reference, leaving the repository. Colons that belong to a
/// registry port are kept.
fn repository(address: &str) -> &str {
    match address.rsplit_once(':') {
        Some((repository, tag)) if !tag.contains('/') => repository,
        _ => address,
    }
}

impl DockerEngine {
    /// Runs a `docker create` command and returns the id of the created container.
    fn create(&self, command: process::Command) -> Result<String> {
        Ok(command.output()?.stdout_trimmed()?)
    }

    /// Commits and then removes the container. The container is removed even if `f` fails.
    fn commit_and_remove<F>(&self, container: &str, f: F) -> Result<Snapshot>
    where
        F: FnOnce() -> Result<()>,
    {
        let result = f().and_then(|()| {
            let output = process::command!("docker", "commit", container).output()?;
            Ok(Snapshot(output.stdout_trimmed()?))
        });
        if let Err(error) = process::command!("docker", "rm", "--force", container).output() {
            debug!("failed to remove container {container}: {error}");
        }
        result
    }
}

impl Engine for DockerEngine {
    fn snapshot(&self, base_image: &str, source: &SourceTree, target: &str) -> Result<Snapshot> {
        let container = self.create(process::command!("docker", "create", base_image))?;
        self.commit_and_remove(&container, || {
            process::command!(
                "docker",
                "cp",
                // The trailing `/.` copies the contents rather than the directory itself.
                source.root().join("."),
                format!("{container}:{target}"),
            )
            .output()?;
            Ok(())
        })
    }

    fn exec(&self, snapshot: &Snapshot, workdir: &str, args: &[String]) -> Result<Snapshot> {
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| Error::Other("can not execute an empty command".to_owned()))?;

        info!("running `{command}` in {workdir}", command = args.join(" "));
        let container = self.create(
            process::command!(
                "docker",
                "create",
                "--workdir",
                workdir,
                "--env",
                "COREPACK_ENABLE_DOWNLOAD_PROMPT=0",
                "--entrypoint",
                program,
                &snapshot.0,
            )
            .args(rest.iter().map(OsStr::new)),
        )?;

        self.commit_and_remove(&container, || {
            process::command!("docker", "start", "--attach", &container)
                .stdout_to_stderr()
                .status()?;
            Ok(())
        })
    }

    fn read_file(&self, snapshot: &Snapshot, workdir: &str, path: &str) -> Result<String> {
        let output = process::command!(
            "docker",
            "run",
            "--rm",
            "--workdir",
            workdir,
            "--entrypoint",
            "cat",
            &snapshot.0,
            path,
        )
        .output()?;
        Ok(std::str::from_utf8(&output.stdout)?.to_owned())
    }

    fn remove(&self, snapshot: &Snapshot) -> Result<()> {
        process::command!("docker", "image", "rm", &snapshot.0).output()?;
        Ok(())
    }

    fn build(&self, context: &BuildContext) -> Result<Image> {
        let description = context.description;

        // The description is written next to, not into, the context so the source tree stays
        // untouched.
        let dir = tempfile::Builder::new()
            .prefix("apibara-deploy-build-")
            .tempdir()?;
        let dockerfile_path = dir.path().join(description.filename());
        std::fs::File::create(&dockerfile_path)?.write_all(description.contents().as_bytes())?;
        let iidfile_path = dir.path().join("image-id");

        info!("building image from {}", context.tree.root().display());
        process::command!(
            "docker",
            "build",
            "--file",
            &dockerfile_path,
            "--iidfile",
            &iidfile_path,
            context.tree.root(),
        )
        .stdout_to_stderr()
        .status()?;

        let image_id = std::fs::read_to_string(&iidfile_path)?;
        let image = Image(image_id.trim().to_owned());
        debug!("image id: {}", image.id());
        Ok(image)
    }

    fn sync(&self, image: &Image) -> Result<()> {
        process::command!("docker", "image", "inspect", "--format", "{{.Id}}", image.id())
            .output()?;
        Ok(())
    }

    fn login(&self, registry: &str, username: &str, password: &Secret) -> Result<()> {
        process::command!(
            "docker",
            "login",
            "--username",
            username,
            "--password-stdin",
            registry,
        )
        .output_with_input(password.expose().as_bytes())?;
        Ok(())
    }

    fn logout(&self, registry: &str) -> Result<()> {
        process::command!("docker", "logout", registry).output()?;
        Ok(())
    }

    fn push(&self, image: &Image, address: &str) -> Result<String> {
        process::command!("docker", "tag", image.id(), address).output()?;
        process::command!("docker", "push", address)
            .stdout_to_stderr()
            .status()?;

        let output = process::command!(
            "docker",
            "image",
            "inspect",
            "--format",
            "{{json .RepoDigests}}",
            address,
        )
        .output()?;
        let digests: RepoDigests = serde_json::from_slice(&output.stdout)?;

        let prefix = format!("{}@", repository(address));
        Ok(digests
            .into_iter()
            .find(|digest| digest.starts_with(&prefix))
            .unwrap_or_else(|| address.to_owned()))
    }

    fn run(
        &self,
        image: &str,
        mount: Option<Mount>,
        workdir: Option<&str>,
        args: &[String],
    ) -> Result<String> {
        let mut command = process::command!("docker", "run", "--rm");
        if let Some(Mount { host, target }) = mount {
            let volume = format!("{host}:{target}:ro", host = host.display());
            command = process::args!(command, "--volume", volume);
        }
        if let Some(workdir) = workdir {
            command = process::args!(command, "--workdir", workdir);
        }
        let output = process::args!(command, image)
            .args(args.iter().map(OsStr::new))
            .output()?;
        Ok(std::str::from_utf8(&output.stdout)?.to_owned())
    }
}
