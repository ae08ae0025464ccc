//! Tests against a real Docker daemon.
//!
//! Ignored by default. Run with `cargo test --test docker -- --ignored`
//! on a machine where `alpine:3.20` has already been pulled.

use std::sync::Arc;
use std::time::Duration;

use agentbox::{
    DockerRuntime, PoolConfig, RuntimeAdapter, SandboxClient, SandboxConfig, SandboxError,
    SandboxManager,
};

fn sandbox_config() -> SandboxConfig {
    SandboxConfig {
        image: "alpine:3.20".to_string(),
        command_timeout_secs: 30,
        ..SandboxConfig::default()
    }
}

fn client() -> (Arc<DockerRuntime>, SandboxClient) {
    let runtime = Arc::new(DockerRuntime::connect().expect("docker is not available"));
    let manager = SandboxManager::new(runtime.clone(), PoolConfig::default()).unwrap();
    (runtime, SandboxClient::new(manager, sandbox_config()).unwrap())
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn test_docker_session_lifecycle() {
    let (runtime, client) = client();
    let session = format!("docker-test-{}", uuid::Uuid::new_v4().simple());

    let result = client.run(&session, "echo hello", None).await.unwrap();
    assert_eq!(result.stdout, "hello\n");
    assert_eq!(result.exit_code, Some(0));

    client.run(&session, "cd /tmp && export X=1", None).await.unwrap();
    let result = client.run(&session, "echo $PWD $X", None).await.unwrap();
    assert_eq!(result.stdout, "/tmp 1\n");

    let result = client.run(&session, "ls /nope", None).await.unwrap();
    assert_ne!(result.exit_code, Some(0));

    let result = client
        .run(&session, "sleep 30", Some(Duration::from_secs(1)))
        .await
        .unwrap();
    assert!(result.timed_out);
    let result = client.run(&session, "echo alive", None).await.unwrap();
    assert_eq!(result.stdout, "alive\n");

    client
        .write_file(&session, "sub/dir/file.txt", b"content".to_vec())
        .await
        .unwrap();
    let data = client.read_file(&session, "sub/dir/file.txt").await.unwrap();
    assert_eq!(&data[..], b"content");
    assert!(matches!(
        client.read_file(&session, "missing.txt").await.unwrap_err(),
        SandboxError::PathNotFound { .. }
    ));

    client.end_session(&session).await.unwrap();
    let left = runtime.list_containers().await.unwrap();
    assert!(left.iter().all(|c| c.session.as_deref() != Some(session.as_str())));
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn test_docker_network_disabled_by_default() {
    let (_runtime, client) = client();
    let session = format!("docker-net-{}", uuid::Uuid::new_v4().simple());

    let result = client
        .run(&session, "wget -q -T 3 -O /dev/null http://example.com", None)
        .await
        .unwrap();
    assert_ne!(result.exit_code, Some(0));

    client.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn test_docker_unknown_image_fails_to_provision() {
    let runtime = Arc::new(DockerRuntime::connect().expect("docker is not available"));
    let manager = SandboxManager::new(runtime, PoolConfig::default()).unwrap();
    let config = SandboxConfig {
        image: "agentbox.invalid/does-not-exist:latest".to_string(),
        ..sandbox_config()
    };
    let client = SandboxClient::new(manager, config).unwrap();
    let err = client.run("s", "true", None).await.unwrap_err();
    assert!(matches!(
        err,
        SandboxError::ProvisioningFailed { .. } | SandboxError::RuntimeRejected { .. }
    ));
    client.shutdown().await;
}
