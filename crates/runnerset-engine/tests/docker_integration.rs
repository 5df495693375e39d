//! Integration tests against a real Docker daemon.
//!
//! Gated behind `RUNNERSET_DOCKER_TESTS=1` so `cargo test` stays hermetic:
//!
//! ```sh
//! RUNNERSET_DOCKER_TESTS=1 cargo test -p runnerset-engine --test docker_integration
//! ```
//!
//! The suite uses `alpine:latest` with `sleep` instead of the real runner
//! image so containers start instantly and exit cleanly; what is under
//! test is tracking, destruction, and shutdown semantics, not the runner
//! command path.

use bollard::container::{Config, CreateContainerOptions, RemoveContainerOptions};
use bollard::Docker;
use tokio_util::sync::CancellationToken;

use runnerset_engine::{DockerConfig, DockerEngine, Engine};

const TEST_IMAGE: &str = "alpine:latest";

fn enabled() -> bool {
    std::env::var("RUNNERSET_DOCKER_TESTS").as_deref() == Ok("1")
}

async fn new_engine() -> DockerEngine {
    let cancel = CancellationToken::new();
    DockerEngine::new(
        &cancel,
        DockerConfig {
            image: TEST_IMAGE.to_string(),
            dind: false,
        },
    )
    .await
    .expect("docker daemon must be reachable for integration tests")
}

/// Creates and starts a long-sleeping container through the raw client,
/// registering it with nothing; used to exercise destroy on arbitrary ids.
async fn raw_sleeper(docker: &Docker, name: &str) -> String {
    let created = docker
        .create_container(
            Some(CreateContainerOptions {
                name: name.to_string(),
                ..Default::default()
            }),
            Config {
                image: Some(TEST_IMAGE.to_string()),
                cmd: Some(vec!["sleep".to_string(), "300".to_string()]),
                ..Default::default()
            },
        )
        .await
        .expect("create");
    docker
        .start_container::<String>(&created.id, None)
        .await
        .expect("start");
    created.id
}

#[tokio::test]
async fn destroy_removes_container() {
    if !enabled() {
        return;
    }
    let engine = new_engine().await;
    let docker = Docker::connect_with_local_defaults().unwrap();
    let cancel = CancellationToken::new();

    let name = format!("runnerset-it-{}", uuid::Uuid::new_v4().simple());
    let id = raw_sleeper(&docker, &name).await;

    engine.destroy_runner(&cancel, &id).await.unwrap();

    // A second destroy hits a missing container and must surface the
    // daemon's error: the Docker backend is deliberately not idempotent.
    let err = engine.destroy_runner(&cancel, &id).await.unwrap_err();
    assert!(err.to_string().to_lowercase().contains("no such container"));
}

#[tokio::test]
async fn untracked_shutdown_is_clean() {
    if !enabled() {
        return;
    }
    let engine = new_engine().await;
    let cancel = CancellationToken::new();

    engine.shutdown(&cancel).await.unwrap();
}

#[tokio::test]
async fn cancel_aborts_destroy() {
    if !enabled() {
        return;
    }
    let engine = new_engine().await;
    let docker = Docker::connect_with_local_defaults().unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let name = format!("runnerset-it-{}", uuid::Uuid::new_v4().simple());
    let id = raw_sleeper(&docker, &name).await;

    let err = engine.destroy_runner(&cancel, &id).await.unwrap_err();
    assert!(matches!(err, runnerset_engine::EngineError::Cancelled));

    docker
        .remove_container(
            &id,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        )
        .await
        .unwrap();
}
