//! End-to-end scenarios driving the orchestrator through its public API:
//! the `Service` facade plus the bare component wiring it sits on top of.

use std::sync::Arc;
use std::time::Duration;

use transcribe_orchestrator::batch::BatchCoordinator;
use transcribe_orchestrator::broker::ProgressBroker;
use transcribe_orchestrator::cancel::{CancelOutcome, CancellationRegistry};
use transcribe_orchestrator::config::Config;
use transcribe_orchestrator::engine::{
    DiarizationEngine, LocalDiarizationEngine, MockEngines, SubprocessEngineConfig,
    SubprocessTranscriptionEngine, TranscriptionEngine,
};
use transcribe_orchestrator::job::{AudioSource, JobId, JobParameters, JobStatus};
use transcribe_orchestrator::jobstore::JobStore;
use transcribe_orchestrator::service::{EngineBackend, Service};
use transcribe_orchestrator::worker::WorkerPool;

async fn fresh_service(dir: &std::path::Path) -> Service {
    let mut config = Config::default();
    config.work_dir = dir.to_path_buf();
    Service::start(config, EngineBackend::Mock).await.unwrap()
}

async fn wait_for_terminal(service: &Service, job_id: &JobId) -> transcribe_orchestrator::job::Job {
    for _ in 0..500 {
        if let Some(job) = service.get_job(job_id).await {
            if job.status.is_terminal() {
                return job;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never reached a terminal state");
}

/// Scenario 1: happy path, single file.
#[tokio::test]
async fn happy_path_single_file_completes_with_speaker() {
    let dir = tempfile::tempdir().unwrap();
    let service = fresh_service(dir.path()).await;
    let clip = dir.path().join("clip.wav");
    tokio::fs::write(&clip, b"fake audio").await.unwrap();

    let job_id = service
        .submit_single(clip.to_str().unwrap(), JobParameters::default())
        .await
        .unwrap();

    let mut stream = service.subscribe_progress(&job_id);
    let job = wait_for_terminal(&service, &job_id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    let result_ref = job.result_ref.expect("completed job must carry a result_ref");

    let artifact = service.load_artifact(&job_id).await.unwrap();
    assert!(!artifact.text.is_empty());
    assert!(!artifact.segments.is_empty());
    assert!(artifact.speakers.iter().any(|s| s == "SPEAKER_00"));
    assert!(result_ref.ends_with("result.json"));

    // The stream must eventually observe a terminal event even though we
    // subscribed mid-flight.
    use futures_util::StreamExt;
    let mut saw_terminal = false;
    while let Some(event) = stream.next().await {
        if event.is_terminal() {
            saw_terminal = true;
        }
    }
    assert!(saw_terminal);
}

/// Scenario 2: cancellation mid-run. Driven against the bare worker pool
/// (rather than `Service`) so the mock engine's artificial step delay can be
/// configured, giving the cancel call a window to land before completion.
#[tokio::test]
async fn cancellation_mid_run_reaches_cancelled_state() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(ProgressBroker::new());
    let store = Arc::new(JobStore::open(dir.path().join("jobs"), broker.clone()).await.unwrap());
    let cancellation = Arc::new(CancellationRegistry::new());
    let engines = Arc::new(MockEngines::default());
    engines.step_delay_ms.store(500, std::sync::atomic::Ordering::SeqCst);
    let pool = Arc::new(WorkerPool::new(
        store.clone(),
        broker,
        cancellation,
        engines.clone() as Arc<dyn TranscriptionEngine>,
        engines as Arc<dyn DiarizationEngine>,
        2,
        dir.path().join("artifacts"),
    ));

    let job = transcribe_orchestrator::job::Job::new_single(
        JobId::new(),
        AudioSource {
            path: "clip.wav".to_string(),
            original_filename: "clip.wav".to_string(),
        },
        JobParameters::default(),
    );
    let job_id = job.job_id.clone();
    store.create(job).await.unwrap();

    pool.submit(job_id.clone()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let outcome = pool.cancel_job(&job_id).await;
    assert_eq!(outcome, CancelOutcome::Cancelled);

    let job = store.get(&job_id).await.unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    let mut job = job;
    while !job.status.is_terminal() && std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
        job = store.get(&job_id).await.unwrap();
    }
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.result_ref.is_none());
    assert!(job.error.is_none());
}

/// Scenario 3: engine timeout. Uses a real subprocess (a shell script that
/// sleeps) so the timeout watcher actually races a live child process.
#[tokio::test]
async fn engine_timeout_marks_job_failed_and_leaves_no_orphan() {
    let dir = tempfile::tempdir().unwrap();
    let script_path = dir.path().join("slow-engine.sh");
    tokio::fs::write(&script_path, "#!/bin/sh\nsleep 30\n").await.unwrap();
    let mut perms = tokio::fs::metadata(&script_path).await.unwrap().permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(0o755);
    }
    tokio::fs::set_permissions(&script_path, perms).await.unwrap();

    let engine = SubprocessTranscriptionEngine::new(SubprocessEngineConfig {
        binary_path: script_path,
        work_dir: dir.path().to_path_buf(),
        timeout: Duration::from_millis(300),
        kill_grace: Duration::from_secs(2),
        gpu_batch_size: 1,
        gpu_available: false,
    });

    let registry = CancellationRegistry::new();
    let cancel = registry.register(JobId::new()).await;
    let sink = transcribe_orchestrator::engine::NullProgressSink;
    let result = engine
        .transcribe(
            &AudioSource {
                path: "clip.wav".to_string(),
                original_filename: "clip.wav".to_string(),
            },
            &JobParameters::default(),
            &cancel,
            &sink,
        )
        .await;

    let err = result.unwrap_err();
    assert_eq!(err.kind, transcribe_orchestrator::error::ErrorKind::Processing);
    assert!(err.message.contains("timed out"));
}

/// Scenario 4: diarization unavailable is a soft failure, not a hard one.
#[tokio::test]
async fn diarization_unavailable_completes_without_speakers() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(ProgressBroker::new());
    let store = Arc::new(JobStore::open(dir.path().join("jobs"), broker.clone()).await.unwrap());
    let cancellation = Arc::new(CancellationRegistry::new());
    let transcription = Arc::new(MockEngines::default());
    let diarization = Arc::new(LocalDiarizationEngine::new(None, false));
    let pool = Arc::new(WorkerPool::new(
        store.clone(),
        broker,
        cancellation,
        transcription as Arc<dyn TranscriptionEngine>,
        diarization as Arc<dyn DiarizationEngine>,
        2,
        dir.path().join("artifacts"),
    ));

    let job = transcribe_orchestrator::job::Job::new_single(
        JobId::new(),
        AudioSource {
            path: "clip.wav".to_string(),
            original_filename: "clip.wav".to_string(),
        },
        JobParameters::default(),
    );
    let job_id = job.job_id.clone();
    store.create(job).await.unwrap();
    pool.submit(job_id.clone()).await;

    let mut job = store.get(&job_id).await.unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while !job.status.is_terminal() && std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
        job = store.get(&job_id).await.unwrap();
    }
    assert_eq!(job.status, JobStatus::Completed);
}

/// Scenario 5: batch with mixed validity.
#[tokio::test]
async fn batch_with_mixed_validity_creates_jobs_only_for_valid_members() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(ProgressBroker::new());
    let store = Arc::new(JobStore::open(dir.path().join("jobs"), broker.clone()).await.unwrap());
    let cancellation = Arc::new(CancellationRegistry::new());
    let engines = Arc::new(MockEngines::default());
    let pool = Arc::new(WorkerPool::new(
        store.clone(),
        broker,
        cancellation,
        engines.clone() as Arc<dyn TranscriptionEngine>,
        engines as Arc<dyn DiarizationEngine>,
        2,
        dir.path().join("artifacts"),
    ));
    let coordinator = BatchCoordinator::new(store.clone(), pool);

    let clip_a = dir.path().join("a.wav");
    let clip_c = dir.path().join("c.wav");
    tokio::fs::write(&clip_a, b"fake audio").await.unwrap();
    tokio::fs::write(&clip_c, b"fake audio").await.unwrap();

    let files = vec![
        clip_a.to_string_lossy().to_string(),
        "missing-b.wav".to_string(),
        clip_c.to_string_lossy().to_string(),
    ];
    let submission = coordinator
        .submit(files, JobParameters::default(), 3)
        .await
        .unwrap();

    assert_eq!(submission.valid_files, 2);
    assert_eq!(submission.invalid_files.len(), 1);
    assert_eq!(submission.job_ids.len(), 2);

    for job_id in &submission.job_ids {
        let mut job = store.get(job_id).await.unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !job.status.is_terminal() && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
            job = store.get(job_id).await.unwrap();
        }
        assert_eq!(job.status, JobStatus::Completed);
    }
}

/// Scenario 6: crash recovery. A job left `processing` when the store is
/// reopened is recovered as `failed` with `error.kind = server`; a
/// completed job is untouched.
#[tokio::test]
async fn crash_recovery_fails_in_flight_job_and_spares_completed_one() {
    let dir = tempfile::tempdir().unwrap();
    let jobs_dir = dir.path().join("jobs");
    let broker = Arc::new(ProgressBroker::new());
    let store = JobStore::open(&jobs_dir, broker.clone()).await.unwrap();

    let mut in_flight = transcribe_orchestrator::job::Job::new_single(
        JobId::new(),
        AudioSource {
            path: "a.wav".to_string(),
            original_filename: "a.wav".to_string(),
        },
        JobParameters::default(),
    );
    in_flight.status = JobStatus::Processing;
    in_flight.progress = 45;
    let in_flight_id = in_flight.job_id.clone();
    store.create(in_flight).await.unwrap();

    let mut done = transcribe_orchestrator::job::Job::new_single(
        JobId::new(),
        AudioSource {
            path: "b.wav".to_string(),
            original_filename: "b.wav".to_string(),
        },
        JobParameters::default(),
    );
    done.status = JobStatus::Completed;
    done.progress = 100;
    done.result_ref = Some(format!("{}/result.json", done.job_id));
    let done_id = done.job_id.clone();
    store.create(done).await.unwrap();

    drop(store);

    // Simulate the process restarting: reopen the store from the same root.
    let broker = Arc::new(ProgressBroker::new());
    let recovered = JobStore::open(&jobs_dir, broker).await.unwrap();

    let in_flight = recovered.get(&in_flight_id).await.unwrap();
    assert_eq!(in_flight.status, JobStatus::Failed);
    assert_eq!(
        in_flight.error.unwrap().kind,
        transcribe_orchestrator::error::ErrorKind::Server
    );

    let done = recovered.get(&done_id).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress, 100);
}
