//! Core data model: jobs, artifacts, batches, progress events.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::OrchestratorError;

/// Opaque, stable job identifier. Assigned at creation, immutable.
///
/// Backed by a ULID: lexically sortable by creation time, which keeps
/// `JobStore::list` ordering cheap without a separate index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        JobId(Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(JobId(s.to_string()))
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        JobId(s)
    }
}

/// `kind` discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Single,
    BatchMember,
}

/// Job lifecycle status. Transition legality is centralized in
/// [`JobStatus::can_transition_to`] so every mutator (store, worker,
/// cancellation registry) enforces the same state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether `self -> next` is a legal edge of the state machine.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Processing) | (Queued, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Model size hint, matching the `whisper_model` config surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl Default for ModelSize {
    fn default() -> Self {
        ModelSize::Base
    }
}

impl fmt::Display for ModelSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::Large => "large",
        };
        f.write_str(s)
    }
}

/// Device hint consumed by the device/precision policy table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceHint {
    Auto,
    Cpu,
    Gpu,
}

impl Default for DeviceHint {
    fn default() -> Self {
        DeviceHint::Auto
    }
}

/// Compute precision as resolved by the device/precision policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputePrecision {
    Float16,
    Int8,
    Float32,
}

impl fmt::Display for ComputePrecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ComputePrecision::Float16 => "float16",
            ComputePrecision::Int8 => "int8",
            ComputePrecision::Float32 => "float32",
        };
        f.write_str(s)
    }
}

/// Source audio reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSource {
    pub path: String,
    pub original_filename: String,
}

/// Per-job parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobParameters {
    pub model_size: ModelSize,
    /// `None` means "auto-detect".
    pub language: Option<String>,
    pub enable_diarization: bool,
    pub device: DeviceHint,
    pub compute_type: Option<ComputePrecision>,
    /// Requested artifact shape (`text`/`srt`/`vtt`/`json`); `None` means the
    /// surface adapter picks its own default when rendering the result.
    pub output_format: Option<String>,
    /// Only meaningful for batch members; `None` for single jobs.
    pub max_concurrent: Option<u32>,
}

impl Default for JobParameters {
    fn default() -> Self {
        JobParameters {
            model_size: ModelSize::default(),
            language: None,
            enable_diarization: true,
            device: DeviceHint::default(),
            compute_type: None,
            output_format: None,
            max_concurrent: None,
        }
    }
}

/// A single transcription segment, before or after diarization merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start_sec: f64,
    pub end_sec: f64,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// A diarization turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiarizationTurn {
    pub start_sec: f64,
    pub end_sec: f64,
    pub speaker_label: String,
}

/// Metadata attached to a completed artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub model: String,
    pub device: String,
    pub processing_seconds: f64,
    pub audio_seconds: f64,
    pub realtime_factor: f64,
    /// Set when diarization was requested but unavailable and the job
    /// completed in transcription-only mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diarization_note: Option<String>,
}

/// The artifact produced by a completed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionArtifact {
    pub text: String,
    pub language: String,
    pub segments: Vec<TranscriptSegment>,
    pub speakers: Vec<String>,
    pub metadata: ArtifactMetadata,
}

/// The durable job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub kind: JobKind,
    pub source: AudioSource,
    pub parameters: JobParameters,
    pub status: JobStatus,
    pub progress: u8,
    pub progress_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OrchestratorError>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
}

impl Job {
    pub fn new_single(job_id: JobId, source: AudioSource, parameters: JobParameters) -> Self {
        let now = chrono::Utc::now();
        Job {
            job_id,
            kind: JobKind::Single,
            source,
            parameters,
            status: JobStatus::Queued,
            progress: 0,
            progress_message: "queued".to_string(),
            result_ref: None,
            error: None,
            created_at: now,
            updated_at: now,
            batch_id: None,
        }
    }

    pub fn new_batch_member(
        job_id: JobId,
        source: AudioSource,
        parameters: JobParameters,
        batch_id: String,
    ) -> Self {
        let mut job = Job::new_single(job_id, source, parameters);
        job.kind = JobKind::BatchMember;
        job.batch_id = Some(batch_id);
        job
    }

    /// Apply a validated transition, enforcing the progress invariants
    /// (`progress == 100 iff completed`, `result_ref` xor `error`).
    pub fn transition(&mut self, next: JobStatus) -> crate::error::Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(OrchestratorError::server(format!(
                "illegal transition {} -> {} for job {}",
                self.status, next, self.job_id
            )));
        }
        self.status = next;
        self.updated_at = chrono::Utc::now();
        match next {
            JobStatus::Completed => self.progress = 100,
            JobStatus::Processing if self.progress == 0 => self.progress = 1,
            _ => {}
        }
        Ok(())
    }

    pub fn set_progress(&mut self, progress: u8, message: impl Into<String>) {
        // Progress is monotonically non-decreasing within a run.
        self.progress = self.progress.max(progress.min(99));
        self.progress_message = message.into();
        self.updated_at = chrono::Utc::now();
    }
}

/// A grouping entity. `member_job_ids` is ordered by submission; aggregate
/// status is always derived, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: String,
    pub member_job_ids: Vec<JobId>,
    pub max_concurrent: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Aggregate view over a batch's member jobs, computed on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchAggregate {
    pub batch_id: String,
    pub total: usize,
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl BatchAggregate {
    pub fn is_terminal(&self) -> bool {
        self.queued == 0 && self.processing == 0
    }
}

/// Progress broker payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Intermediate tick.
    Tick {
        job_id: JobId,
        status: JobStatus,
        progress: u8,
        message: String,
    },
    /// Terminal notification; never coalesced away by the broker.
    Terminal {
        job_id: JobId,
        status: JobStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        result_ref: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<OrchestratorError>,
    },
}

impl ProgressEvent {
    pub fn job_id(&self) -> &JobId {
        match self {
            ProgressEvent::Tick { job_id, .. } => job_id,
            ProgressEvent::Terminal { job_id, .. } => job_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Terminal { .. })
    }

    pub fn from_job(job: &Job) -> Self {
        if job.status.is_terminal() {
            ProgressEvent::Terminal {
                job_id: job.job_id.clone(),
                status: job.status,
                result_ref: job.result_ref.clone(),
                error: job.error.clone(),
            }
        } else {
            ProgressEvent::Tick {
                job_id: job.job_id.clone(),
                status: job.status,
                progress: job.progress,
                message: job.progress_message.clone(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_allows_only_defined_edges() {
        use JobStatus::*;
        let all = [Queued, Processing, Completed, Failed, Cancelled];
        for &from in &all {
            for &to in &all {
                let allowed = from.can_transition_to(to);
                let expected = matches!(
                    (from, to),
                    (Queued, Processing)
                        | (Queued, Cancelled)
                        | (Processing, Completed)
                        | (Processing, Failed)
                        | (Processing, Cancelled)
                );
                assert_eq!(allowed, expected, "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn terminal_states_have_no_outbound_edges() {
        use JobStatus::*;
        for &terminal in &[Completed, Failed, Cancelled] {
            for &to in &[Queued, Processing, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(to));
            }
        }
    }

    #[test]
    fn completing_sets_progress_to_100() {
        let mut job = Job::new_single(
            JobId::new(),
            AudioSource {
                path: "a.wav".into(),
                original_filename: "a.wav".into(),
            },
            JobParameters::default(),
        );
        job.transition(JobStatus::Processing).unwrap();
        job.transition(JobStatus::Completed).unwrap();
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn progress_is_clamped_and_monotonic() {
        let mut job = Job::new_single(
            JobId::new(),
            AudioSource {
                path: "a.wav".into(),
                original_filename: "a.wav".into(),
            },
            JobParameters::default(),
        );
        job.transition(JobStatus::Processing).unwrap();
        job.set_progress(50, "halfway");
        job.set_progress(10, "regressed"); // should not move progress backward
        assert_eq!(job.progress, 50);
        job.set_progress(120, "overshoot"); // clamped below 100 while processing
        assert_eq!(job.progress, 99);
    }
}
