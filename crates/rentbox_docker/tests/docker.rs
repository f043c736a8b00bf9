//! Needs a running Docker daemon and network access for the runtime images.
//! Run with `cargo test -p rentbox_docker -- --ignored`.

use rentbox_core::prelude::*;
use rentbox_docker::DockerEngine;
use rentbox_sandbox::prelude::*;

fn coordinator(dir: &tempfile::TempDir) -> Coordinator<DockerEngine> {
    let engine = DockerEngine::connect_local().unwrap();
    let config = SandboxConfig {
        work_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    Coordinator::new(engine, config).unwrap()
}

fn python(source: &str) -> JobRequest {
    JobRequest {
        language: "python".into(),
        source_code: source.into(),
        ..Default::default()
    }
}

#[tokio::test]
#[ignore]
async fn hello_world() {
    let dir = tempfile::tempdir().unwrap();
    let result = coordinator(&dir).execute(python("print('hello')")).await;

    assert_eq!(result.status, JobStatus::Completed, "{}", result.error);
    assert_eq!(result.output, "hello\n");
}

#[tokio::test]
#[ignore]
async fn network_is_unreachable() {
    let dir = tempfile::tempdir().unwrap();
    let source = r#"
import socket
try:
    socket.create_connection(("1.1.1.1", 53), timeout=2)
    print("connected")
except OSError:
    print("blocked")
"#;
    let result = coordinator(&dir).execute(python(source)).await;

    assert_eq!(result.output.trim(), "blocked");
}

#[tokio::test]
#[ignore]
async fn infinite_loop_times_out_with_partial_output() {
    let dir = tempfile::tempdir().unwrap();
    let result = coordinator(&dir)
        .execute(JobRequest {
            timeout_ms: Some(2_000),
            ..python("print('started', flush=True)\nwhile True: pass")
        })
        .await;

    assert_eq!(result.status, JobStatus::TimedOut);
    assert!(result.output.contains("started"));
    assert!(result.execution_time_ms < 10_000);
}

#[tokio::test]
#[ignore]
async fn memory_bomb_is_contained() {
    let dir = tempfile::tempdir().unwrap();
    let result = coordinator(&dir)
        .execute(python("chunks = []\nwhile True: chunks.append(' ' * 10**7)"))
        .await;

    assert_eq!(result.status, JobStatus::Failed);
}

#[tokio::test]
#[ignore]
async fn no_containers_survive_a_job() {
    let dir = tempfile::tempdir().unwrap();
    let engine = DockerEngine::connect_local().unwrap();
    let coordinator = coordinator(&dir);

    let result = coordinator
        .execute(JobRequest {
            job_id: Some("docker-cleanup-check".into()),
            ..python("import sys; sys.exit(3)")
        })
        .await;
    assert_eq!(result.exit_code, Some(3));

    let label = format!("{}=docker-cleanup-check", labels::JOB);
    assert!(engine.list_containers(&label).await.unwrap().is_empty());
    assert!(engine.list_images(&label).await.unwrap().is_empty());
}
