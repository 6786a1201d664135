//! Engine adapter: transcription subprocess supervision and in-process
//! diarization.
//!
//! Subprocess supervision races the child's exit against a timeout and a
//! cancellation token with `tokio::select!`, escalating from SIGTERM to a
//! forceful kill if the child doesn't exit within a grace period. Diarization
//! treats a missing credential as a recoverable error rather than a hard
//! failure, so a job can still complete in transcription-only mode.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::cancel::CancellationToken;
use crate::error::{OrchestratorError, Result};
use crate::job::{AudioSource, ComputePrecision, DeviceHint, JobParameters, TranscriptSegment};

/// Progress checkpoints are reported through this sink rather than returned,
/// so the engine adapter never needs to know about the job store or broker.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, progress: u8, message: &str);
}

/// A no-op sink for call sites (tests, dry runs) that don't care about
/// intermediate progress.
pub struct NullProgressSink;

#[async_trait]
impl ProgressSink for NullProgressSink {
    async fn report(&self, _progress: u8, _message: &str) {}
}

/// Output of a successful transcription, before diarization merge.
#[derive(Debug, Clone)]
pub struct RawTranscription {
    pub text: String,
    pub language: String,
    pub segments: Vec<TranscriptSegment>,
    pub processing_seconds: f64,
    pub audio_seconds: f64,
    pub device: String,
    pub model: String,
}

#[async_trait]
pub trait TranscriptionEngine: Send + Sync {
    async fn transcribe(
        &self,
        source: &AudioSource,
        params: &JobParameters,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> Result<RawTranscription>;
}

#[async_trait]
pub trait DiarizationEngine: Send + Sync {
    async fn diarize(
        &self,
        source: &AudioSource,
        cancel: &CancellationToken,
    ) -> Result<Vec<crate::job::DiarizationTurn>>;
}

/// Resolved device/precision/batch choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProfile {
    pub device: DeviceHint,
    pub precision: ComputePrecision,
    pub batch_size: u32,
}

/// Pure policy function: GPU wins unless unavailable or explicitly overridden
/// to CPU; GPU gets fp16 at a configurable batch size, CPU gets a small batch
/// of 1 with the caller's requested precision (default int8).
pub fn select_device_profile(
    gpu_available: bool,
    override_device: DeviceHint,
    gpu_batch_size: u32,
) -> DeviceProfile {
    let use_gpu = gpu_available && override_device != DeviceHint::Cpu;
    if use_gpu {
        DeviceProfile {
            device: DeviceHint::Gpu,
            precision: ComputePrecision::Float16,
            batch_size: gpu_batch_size.max(1),
        }
    } else {
        DeviceProfile {
            device: DeviceHint::Cpu,
            precision: ComputePrecision::Int8,
            batch_size: 1,
        }
    }
}

fn thread_pool_cap() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(8)
}

/// Canonical JSON shape the subprocess writes to `<scratch>/result.json`.
#[derive(Debug, serde::Deserialize)]
struct EngineOutputJson {
    text: String,
    language: String,
    segments: Vec<EngineSegmentJson>,
    audio_seconds: f64,
}

#[derive(Debug, serde::Deserialize)]
struct EngineSegmentJson {
    start_sec: f64,
    end_sec: f64,
    text: String,
    #[serde(default)]
    confidence: Option<f64>,
}

/// Configuration for [`SubprocessTranscriptionEngine`].
#[derive(Debug, Clone)]
pub struct SubprocessEngineConfig {
    pub binary_path: PathBuf,
    pub work_dir: PathBuf,
    pub timeout: Duration,
    pub kill_grace: Duration,
    pub gpu_batch_size: u32,
    pub gpu_available: bool,
}

/// Subprocess-backed transcription engine.
pub struct SubprocessTranscriptionEngine {
    config: SubprocessEngineConfig,
}

enum SupervisionOutcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

impl SubprocessTranscriptionEngine {
    pub fn new(config: SubprocessEngineConfig) -> Self {
        SubprocessTranscriptionEngine { config }
    }

    fn pid_dir(&self) -> PathBuf {
        self.config.work_dir.join(".pids")
    }

    /// Scan for pid markers left by a previous run of this process. Logs
    /// each one found; never signals a process it did not spawn itself.
    async fn scan_orphans(&self) {
        let dir = self.pid_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => return,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(name) = entry.file_name().to_str() {
                warn!(pid = name, "orphaned engine process marker from a previous run");
            }
        }
    }

    async fn record_pid(&self, pid: u32) {
        let dir = self.pid_dir();
        if tokio::fs::create_dir_all(&dir).await.is_ok() {
            let _ = tokio::fs::write(dir.join(pid.to_string()), b"").await;
        }
    }

    async fn forget_pid(&self, pid: u32) {
        let _ = tokio::fs::remove_file(self.pid_dir().join(pid.to_string())).await;
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) {
    // SAFETY: kill(2) is safe to call with any pid and a valid signal number.
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: i32) {}

#[async_trait]
impl TranscriptionEngine for SubprocessTranscriptionEngine {
    async fn transcribe(
        &self,
        source: &AudioSource,
        params: &JobParameters,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> Result<RawTranscription> {
        progress.report(10, "loading").await;
        self.scan_orphans().await;

        let profile = select_device_profile(
            self.config.gpu_available,
            params.device,
            self.config.gpu_batch_size,
        );
        let precision = params.compute_type.unwrap_or(profile.precision);

        let scratch = tempfile::Builder::new()
            .prefix("transcribe-")
            .tempdir_in(&self.config.work_dir)
            .map_err(|e| OrchestratorError::server(format!("create scratch dir: {e}")))?;

        let device_arg = match profile.device {
            DeviceHint::Gpu => "cuda",
            _ => "cpu",
        };
        let thread_cap = thread_pool_cap().to_string();

        let mut cmd = Command::new(&self.config.binary_path);
        cmd.arg("--input")
            .arg(&source.path)
            .arg("--model")
            .arg(params.model_size.to_string())
            .arg("--device")
            .arg(device_arg)
            .arg("--compute-type")
            .arg(precision.to_string())
            .arg("--batch-size")
            .arg(profile.batch_size.to_string())
            .arg("--output-dir")
            .arg(scratch.path());
        if let Some(language) = &params.language {
            cmd.arg("--language").arg(language);
        }
        cmd.env("OMP_NUM_THREADS", &thread_cap)
            .env("MKL_NUM_THREADS", &thread_cap)
            .kill_on_drop(true)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        progress.report(20, "model ready").await;

        let start = std::time::Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| OrchestratorError::processing(format!("spawn engine: {e}")))?;
        let pid = child.id().unwrap_or(0);
        self.record_pid(pid).await;
        info!(pid, "engine subprocess started");

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr.take() {
                let _ = stderr.read_to_string(&mut buf).await;
            }
            buf
        });
        let stdout_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut stdout) = stdout.take() {
                let _ = stdout.read_to_string(&mut buf).await;
            }
            buf
        });

        let outcome = tokio::select! {
            res = child.wait() => SupervisionOutcome::Exited(res),
            _ = tokio::time::sleep(self.config.timeout) => SupervisionOutcome::TimedOut,
            _ = cancel.cancelled() => SupervisionOutcome::Cancelled,
        };

        let result = match outcome {
            SupervisionOutcome::TimedOut => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(OrchestratorError::processing(format!(
                    "engine timed out after {:?}",
                    self.config.timeout
                )))
            }
            SupervisionOutcome::Cancelled => {
                send_signal(pid, libc::SIGTERM);
                match tokio::time::timeout(self.config.kill_grace, child.wait()).await {
                    Ok(_) => {}
                    Err(_) => {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                    }
                }
                Err(OrchestratorError::cancelled("engine cancelled"))
            }
            SupervisionOutcome::Exited(Ok(status)) => {
                if status.success() {
                    Ok(())
                } else {
                    let captured = stderr_task.await.unwrap_or_default();
                    Err(OrchestratorError::processing(format!(
                        "engine exited with {status}: {captured}"
                    )))
                }
            }
            SupervisionOutcome::Exited(Err(e)) => {
                Err(OrchestratorError::server(format!("wait on engine: {e}")))
            }
        };
        self.forget_pid(pid).await;
        let _ = stdout_task.await;
        result?;

        progress.report(60, "transcription complete").await;

        let output_path = scratch.path().join("result.json");
        let raw = tokio::fs::read(&output_path)
            .await
            .map_err(|e| OrchestratorError::processing(format!("read engine output: {e}")))?;
        let parsed: EngineOutputJson = serde_json::from_slice(&raw)
            .map_err(|e| OrchestratorError::processing(format!("parse engine output: {e}")))?;

        progress.report(70, "alignment complete").await;

        let segments = parsed
            .segments
            .into_iter()
            .map(|s| TranscriptSegment {
                start_sec: s.start_sec,
                end_sec: s.end_sec,
                text: s.text,
                speaker_label: None,
                confidence: s.confidence,
            })
            .collect();

        Ok(RawTranscription {
            text: parsed.text,
            language: parsed.language,
            segments,
            processing_seconds: start.elapsed().as_secs_f64(),
            audio_seconds: parsed.audio_seconds,
            device: device_arg.to_string(),
            model: params.model_size.to_string(),
        })
    }
}

/// In-process diarization pipeline handle, loaded lazily and cached for the
/// lifetime of the process.
struct DiarizationHandle {
    device: &'static str,
}

/// In-process diarization engine requiring a credential to load its pipeline,
/// grounded on `speaker_service.py`'s lazy pipeline cache and its
/// "missing credential/model is a recoverable condition" behavior.
pub struct LocalDiarizationEngine {
    hf_token: Option<String>,
    gpu_available: bool,
    pipeline: OnceCell<DiarizationHandle>,
}

impl LocalDiarizationEngine {
    pub fn new(hf_token: Option<String>, gpu_available: bool) -> Self {
        LocalDiarizationEngine {
            hf_token,
            gpu_available,
            pipeline: OnceCell::new(),
        }
    }

    async fn pipeline(&self) -> Result<&DiarizationHandle> {
        self.pipeline
            .get_or_try_init(|| async {
                if self.hf_token.is_none() {
                    return Err(OrchestratorError::processing(
                        "diarization pipeline unavailable: missing credential",
                    ));
                }
                Ok(DiarizationHandle {
                    device: if self.gpu_available { "cuda" } else { "cpu" },
                })
            })
            .await
    }
}

#[async_trait]
impl DiarizationEngine for LocalDiarizationEngine {
    async fn diarize(
        &self,
        _source: &AudioSource,
        cancel: &CancellationToken,
    ) -> Result<Vec<crate::job::DiarizationTurn>> {
        if cancel.is_cancelled() {
            return Err(OrchestratorError::cancelled("diarization cancelled"));
        }
        let handle = self
            .pipeline()
            .await
            .map_err(|e| OrchestratorError::new(crate::error::ErrorKind::Processing, e.message))?;
        info!(device = handle.device, "diarization pipeline ready");
        // A real pipeline invocation happens here; this bundled engine is a
        // stand-in that the production collaborator replaces.
        Ok(Vec::new())
    }
}

/// Deterministic in-process engine pair used by tests and small deployments
/// that don't have the real subprocess binary available.
pub struct MockEngines {
    pub fail_transcription: AtomicBool,
    pub diarization_available: AtomicBool,
    /// When non-zero, `transcribe` checks the cancel token in small
    /// increments for this long before completing, so tests can exercise
    /// mid-flight cancellation deterministically.
    pub step_delay_ms: std::sync::atomic::AtomicU64,
}

impl Default for MockEngines {
    fn default() -> Self {
        MockEngines {
            fail_transcription: AtomicBool::new(false),
            diarization_available: AtomicBool::new(true),
            step_delay_ms: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl TranscriptionEngine for MockEngines {
    async fn transcribe(
        &self,
        _source: &AudioSource,
        params: &JobParameters,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> Result<RawTranscription> {
        progress.report(10, "loading").await;
        if cancel.is_cancelled() {
            return Err(OrchestratorError::cancelled("transcription cancelled"));
        }
        progress.report(20, "model ready").await;

        let total_delay = self.step_delay_ms.load(Ordering::SeqCst);
        let mut waited = 0u64;
        const STEP_MS: u64 = 10;
        while waited < total_delay {
            if cancel.is_cancelled() {
                return Err(OrchestratorError::cancelled("transcription cancelled"));
            }
            tokio::time::sleep(Duration::from_millis(STEP_MS)).await;
            waited += STEP_MS;
        }
        if cancel.is_cancelled() {
            return Err(OrchestratorError::cancelled("transcription cancelled"));
        }

        if self.fail_transcription.load(Ordering::SeqCst) {
            return Err(OrchestratorError::processing("mock engine configured to fail"));
        }
        progress.report(60, "transcription complete").await;
        Ok(RawTranscription {
            text: "hello world".to_string(),
            language: params.language.clone().unwrap_or_else(|| "en".to_string()),
            segments: vec![TranscriptSegment {
                start_sec: 0.0,
                end_sec: 2.0,
                text: "hello world".to_string(),
                speaker_label: None,
                confidence: Some(0.95),
            }],
            processing_seconds: 0.1,
            audio_seconds: 2.0,
            device: "cpu".to_string(),
            model: params.model_size.to_string(),
        })
    }
}

#[async_trait]
impl DiarizationEngine for MockEngines {
    async fn diarize(
        &self,
        _source: &AudioSource,
        _cancel: &CancellationToken,
    ) -> Result<Vec<crate::job::DiarizationTurn>> {
        if !self.diarization_available.load(Ordering::SeqCst) {
            return Err(OrchestratorError::processing("diarization pipeline unavailable"));
        }
        Ok(vec![crate::job::DiarizationTurn {
            start_sec: 0.0,
            end_sec: 2.0,
            speaker_label: "SPEAKER_00".to_string(),
        }])
    }
}

pub fn is_diarization_unavailable(err: &OrchestratorError) -> bool {
    err.kind == crate::error::ErrorKind::Processing && err.message.contains("unavailable")
}

pub fn audio_extension_supported(path: &Path) -> bool {
    const SUPPORTED: &[&str] = &["mp3", "wav", "m4a", "ogg", "flac", "aac", "wma"];
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SUPPORTED.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_present_selects_fp16_configured_batch() {
        let profile = select_device_profile(true, DeviceHint::Auto, 16);
        assert_eq!(profile.device, DeviceHint::Gpu);
        assert_eq!(profile.precision, ComputePrecision::Float16);
        assert_eq!(profile.batch_size, 16);
    }

    #[test]
    fn gpu_absent_selects_cpu_int8_batch_one() {
        let profile = select_device_profile(false, DeviceHint::Auto, 16);
        assert_eq!(profile.device, DeviceHint::Cpu);
        assert_eq!(profile.precision, ComputePrecision::Int8);
        assert_eq!(profile.batch_size, 1);
    }

    #[test]
    fn cpu_override_wins_even_with_gpu_present() {
        let profile = select_device_profile(true, DeviceHint::Cpu, 16);
        assert_eq!(profile.device, DeviceHint::Cpu);
    }

    #[tokio::test]
    async fn local_diarization_engine_recoverable_without_token() {
        let engine = LocalDiarizationEngine::new(None, false);
        let source = AudioSource {
            path: "a.wav".into(),
            original_filename: "a.wav".into(),
        };
        let cancel = CancellationToken::new_for_test();
        let err = engine.diarize(&source, &cancel).await.unwrap_err();
        assert!(is_diarization_unavailable(&err));
    }

    #[test]
    fn supported_audio_extensions_match_config_surface() {
        assert!(audio_extension_supported(Path::new("clip.wav")));
        assert!(audio_extension_supported(Path::new("clip.MP3")));
        assert!(!audio_extension_supported(Path::new("clip.mov")));
    }

    #[tokio::test]
    async fn mock_transcription_respects_pre_cancelled_token() {
        let engine = MockEngines::default();
        let source = AudioSource {
            path: "a.wav".into(),
            original_filename: "a.wav".into(),
        };
        let cancel = CancellationToken::new_for_test();
        cancel.fire_for_test();
        let err = engine
            .transcribe(&source, &JobParameters::default(), &cancel, &NullProgressSink)
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Cancelled);
    }
}
