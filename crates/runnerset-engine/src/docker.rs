//! Docker backend.
//!
//! Runs ephemeral runners as containers against the local Docker daemon.
//! The runner image is pulled to completion at construction time so
//! container creation never races an incomplete pull.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};
use crate::{cancellable, Engine};

/// Default runner image.
pub const DEFAULT_RUNNER_IMAGE: &str = "ghcr.io/actions/actions-runner:latest";

/// Path of the runner entrypoint inside the image.
const RUNNER_COMMAND: &str = "/home/runner/run.sh";

/// Host daemon socket, bind-mounted into runners when DinD is enabled.
const DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Docker-specific engine settings.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Container image for runners. Use ":latest" for the newest release or
    /// pin a specific version.
    pub image: String,

    /// Enables Docker-in-Docker by bind-mounting the host daemon socket
    /// into each runner container, so workflows can run `docker build`,
    /// compose, container actions, and so on.
    ///
    /// The socket gives the runner full access to the host daemon. Only
    /// enable this for trusted workflows.
    pub dind: bool,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_RUNNER_IMAGE.to_string(),
            dind: false,
        }
    }
}

/// Manages runners as Docker containers.
pub struct DockerEngine {
    client: Docker,
    image: String,
    dind: bool,

    /// Tracked containers, runner name -> container id.
    containers: Mutex<HashMap<String, String>>,
}

impl DockerEngine {
    /// Connects to the daemon and pulls the runner image so it is available
    /// for container creation.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon is unreachable or the pull does not
    /// complete.
    pub async fn new(cancel: &CancellationToken, cfg: DockerConfig) -> Result<Self> {
        let image = if cfg.image.is_empty() {
            DEFAULT_RUNNER_IMAGE.to_string()
        } else {
            cfg.image
        };

        let client = Docker::connect_with_local_defaults()
            .map_err(|e| EngineError::Construction(format!("docker client: {e}")))?;

        tracing::info!(image = %image, "pulling runner image");

        // Drain the pull stream to completion; an interrupted pull leaves a
        // partial image and is a constructor failure.
        let mut pull = client.create_image(
            Some(CreateImageOptions {
                from_image: image.clone(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = cancellable(cancel, pull.next()).await? {
            progress.map_err(|e| EngineError::Construction(format!("image pull {image}: {e}")))?;
        }

        tracing::info!(image = %image, "runner image ready");

        Ok(Self {
            client,
            image,
            dind: cfg.dind,
            containers: Mutex::new(HashMap::new()),
        })
    }

    fn track(&self, name: &str, id: &str) {
        self.lock().insert(name.to_string(), id.to_string());
    }

    fn untrack_by_id(&self, id: &str) {
        let mut containers = self.lock();
        if let Some(name) = containers
            .iter()
            .find(|(_, cid)| cid.as_str() == id)
            .map(|(name, _)| name.clone())
        {
            containers.remove(&name);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.containers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl Engine for DockerEngine {
    async fn start_runner(
        &self,
        cancel: &CancellationToken,
        name: &str,
        jit_config: &str,
    ) -> Result<String> {
        let mut env = vec![format!("ACTIONS_RUNNER_INPUT_JITCONFIG={jit_config}")];

        // With DinD the container runs as root for cross-platform socket
        // access: on Linux the docker group has write permission, on Docker
        // Desktop only the owner does.
        let user = if self.dind { "root" } else { "runner" };

        let host_config = if self.dind {
            env.push(format!("DOCKER_HOST=unix://{DOCKER_SOCKET}"));
            env.push("RUNNER_ALLOW_RUNASROOT=1".to_string());
            tracing::info!(name, "dind enabled: mounting docker socket, running as root");
            Some(HostConfig {
                binds: Some(vec![format!("{DOCKER_SOCKET}:{DOCKER_SOCKET}")]),
                ..Default::default()
            })
        } else {
            None
        };

        let config = Config {
            image: Some(self.image.clone()),
            user: Some(user.to_string()),
            cmd: Some(vec![RUNNER_COMMAND.to_string()]),
            env: Some(env),
            host_config,
            ..Default::default()
        };

        let created = cancellable(
            cancel,
            self.client.create_container(
                Some(CreateContainerOptions {
                    name: name.to_string(),
                    ..Default::default()
                }),
                config,
            ),
        )
        .await?
        .map_err(|e| EngineError::StartFailed {
            name: name.to_string(),
            reason: format!("container create: {e}"),
        })?;

        if let Err(e) = cancellable(
            cancel,
            self.client
                .start_container(&created.id, None::<StartContainerOptions<String>>),
        )
        .await?
        {
            // Best-effort cleanup of the created-but-not-started container.
            let _ = self
                .client
                .remove_container(
                    &created.id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(EngineError::StartFailed {
                name: name.to_string(),
                reason: format!("container start: {e}"),
            });
        }

        self.track(name, &created.id);

        tracing::info!(name, container_id = %created.id, "runner started");

        Ok(created.id)
    }

    /// Force-removes the container. Daemon errors propagate, including
    /// "No such container" when the resource is already gone.
    async fn destroy_runner(&self, cancel: &CancellationToken, id: &str) -> Result<()> {
        tracing::info!(container_id = %id, "destroying runner");

        cancellable(
            cancel,
            self.client.remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            ),
        )
        .await??;

        self.untrack_by_id(id);
        Ok(())
    }

    async fn shutdown(&self, cancel: &CancellationToken) -> Result<()> {
        let snapshot: Vec<(String, String)> = self
            .lock()
            .iter()
            .map(|(name, id)| (name.clone(), id.clone()))
            .collect();

        let mut first_err = None;
        for (name, id) in snapshot {
            tracing::info!(name = %name, container_id = %id, "shutdown: removing runner");
            let removed = cancellable(
                cancel,
                self.client.remove_container(
                    &id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                ),
            )
            .await
            .and_then(|res| res.map_err(EngineError::from));
            if let Err(e) = removed {
                tracing::error!(name = %name, container_id = %id, error = %e, "shutdown: failed to remove runner");
                first_err.get_or_insert(e);
            }
        }

        self.lock().clear();

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Daemon-backed tests live here so they can seed the private tracking
    // map; gated like the `tests/docker_integration.rs` suite.
    fn enabled() -> bool {
        std::env::var("RUNNERSET_DOCKER_TESTS").as_deref() == Ok("1")
    }

    #[tokio::test]
    async fn shutdown_surfaces_error_for_externally_removed_container() {
        if !enabled() {
            return;
        }
        let cancel = CancellationToken::new();
        let engine = DockerEngine::new(
            &cancel,
            DockerConfig {
                image: "alpine:latest".to_string(),
                dind: false,
            },
        )
        .await
        .expect("docker daemon must be reachable");

        // Track a container id that no longer exists in the daemon, as if
        // it had been removed behind the engine's back.
        engine.track("r1", "runnerset-test-gone-0000");

        let err = engine.shutdown(&cancel).await.unwrap_err();
        assert!(matches!(err, EngineError::Docker(_)));
        // The inventory is cleared even though the daemon errored.
        assert!(engine.lock().is_empty());
    }
}
