//! Guarding against stale containers when the dev node runs under docker.

use async_trait::async_trait;
use moonwall_foundation_core::{DynError, StartupReason, UserAbortError};
use tokio::{
    io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader},
    process::Command,
};
use tracing::{info, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub image: String,
    pub name: String,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn list_containers(&self, image: &str) -> Result<Vec<ContainerSummary>, DynError>;

    async fn stop_container(&self, id: &str) -> Result<(), DynError>;

    async fn remove_container(&self, id: &str) -> Result<(), DynError>;
}

/// Decides whether conflicting containers may be removed.
#[async_trait]
pub trait ConflictPrompt: Send + Sync {
    async fn confirm_removal(&self, image: &str, containers: &[ContainerSummary]) -> bool;
}

/// Talks to the local `docker` CLI.
#[derive(Clone, Copy, Debug, Default)]
pub struct DockerCli;

impl DockerCli {
    async fn docker(args: &[&str]) -> Result<String, DynError> {
        let output = Command::new("docker").args(args).output().await?;
        if !output.status.success() {
            return Err(format!(
                "docker {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn list_containers(&self, image: &str) -> Result<Vec<ContainerSummary>, DynError> {
        let filter = format!("ancestor={image}");
        let listing = Self::docker(&[
            "ps",
            "--filter",
            &filter,
            "--format",
            "{{.ID}}\t{{.Image}}\t{{.Names}}",
        ])
        .await?;
        Ok(listing
            .lines()
            .filter_map(|line| {
                let mut fields = line.split('\t');
                Some(ContainerSummary {
                    id: fields.next()?.to_owned(),
                    image: fields.next()?.to_owned(),
                    name: fields.next().unwrap_or_default().to_owned(),
                })
            })
            .collect())
    }

    async fn stop_container(&self, id: &str) -> Result<(), DynError> {
        Self::docker(&["stop", id]).await.map(drop)
    }

    async fn remove_container(&self, id: &str) -> Result<(), DynError> {
        Self::docker(&["rm", id]).await.map(drop)
    }
}

/// Asks on the terminal, defaulting to "no".
#[derive(Clone, Copy, Debug, Default)]
pub struct TerminalPrompt;

#[async_trait]
impl ConflictPrompt for TerminalPrompt {
    async fn confirm_removal(&self, image: &str, containers: &[ContainerSummary]) -> bool {
        let question = format!(
            "{} container(s) of {image} are already running. Remove them? [y/N] ",
            containers.len()
        );
        let mut stdout = tokio::io::stdout();
        if stdout.write_all(question.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
            return false;
        }
        let mut answer = String::new();
        if BufReader::new(tokio::io::stdin())
            .read_line(&mut answer)
            .await
            .is_err()
        {
            return false;
        }
        matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    }
}

/// Answers every prompt the same way.
#[derive(Clone, Copy, Debug)]
pub struct FixedAnswer(pub bool);

#[async_trait]
impl ConflictPrompt for FixedAnswer {
    async fn confirm_removal(&self, _: &str, _: &[ContainerSummary]) -> bool {
        self.0
    }
}

#[must_use]
pub fn is_docker_command(command: &str) -> bool {
    std::path::Path::new(command)
        .file_name()
        .is_some_and(|name| name == "docker")
}

const VALUE_FLAGS: [&str; 13] = [
    "-e", "--env", "-p", "--publish", "-v", "--volume", "--name", "--network", "--entrypoint",
    "-w", "--workdir", "-u", "--user",
];

/// The image argument of a `docker run ...` invocation.
#[must_use]
pub fn image_from_args(args: &[String]) -> Option<&str> {
    let mut rest = args.iter().skip_while(|arg| arg.as_str() != "run").skip(1);
    while let Some(arg) = rest.next() {
        if VALUE_FLAGS.contains(&arg.as_str()) {
            rest.next();
        } else if !arg.starts_with('-') {
            return Some(arg);
        }
    }
    None
}

/// Removes running containers of `image` if the prompt allows it.
pub async fn resolve_conflicts(
    runtime: &dyn ContainerRuntime,
    prompt: &dyn ConflictPrompt,
    image: &str,
) -> Result<(), StartupReason> {
    let containers = runtime
        .list_containers(image)
        .await
        .map_err(StartupReason::Container)?;
    if containers.is_empty() {
        return Ok(());
    }

    warn!(%image, count = containers.len(), "found running containers of the same image");
    if !prompt.confirm_removal(image, &containers).await {
        return Err(UserAbortError::new(format!(
            "refused to remove {} running container(s) of {image}",
            containers.len()
        ))
        .into());
    }

    for container in &containers {
        runtime
            .stop_container(&container.id)
            .await
            .map_err(StartupReason::Container)?;
        runtime
            .remove_container(&container.id)
            .await
            .map_err(StartupReason::Container)?;
        info!(id = %container.id, name = %container.name, "removed conflicting container");
    }
    Ok(())
}
