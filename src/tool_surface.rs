//! Agent-tool contract: the six request/response shapes a tool-calling host
//! invokes against a [`Service`]. Every call returns a tagged envelope —
//! `{success: true, ...}` or `{success: false, error: {code, message,
//! details}}` — so a tool-calling host can branch on `success` alone.

use serde::{Deserialize, Serialize};

use crate::batch::BatchSubmission;
use crate::cancel::CancelOutcome;
use crate::error::OrchestratorError;
use crate::job::{Job, JobId, JobParameters, JobStatus, ModelSize};
use crate::jobstore::JobFilter;
use crate::service::Service;

/// Error detail attached to every failed tool call. `code` is the stable,
/// uppercase identifier a tool-calling host branches on; `user_action` and
/// `http_equivalent` are advisory, mirroring [`crate::error::ErrorKind`]'s
/// own advisory fields — this surface never runs an HTTP server itself.
#[derive(Debug, Serialize, Deserialize)]
pub struct ToolErrorDetail {
    pub code: String,
    pub error_type: String,
    pub message: String,
    pub user_action: String,
    pub http_equivalent: u16,
}

impl From<&OrchestratorError> for ToolErrorDetail {
    fn from(err: &OrchestratorError) -> Self {
        ToolErrorDetail {
            code: err.code.to_string(),
            error_type: err.kind.to_string(),
            message: err.message.clone(),
            user_action: err.user_action().to_string(),
            http_equivalent: err.kind.http_equivalent(),
        }
    }
}

/// Every tool call returns either `{success: true, ...}` with the call's own
/// payload flattened in, or `{success: false, error: {...}}`. serde has no
/// internally-tagged representation for a literal bool discriminant, so the
/// envelope is built by hand with `serde_json::json!` rather than derived.
fn ok_envelope(data: serde_json::Value) -> serde_json::Value {
    let mut map = match data {
        serde_json::Value::Object(map) => map,
        other => {
            let mut map = serde_json::Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    map.insert("success".to_string(), serde_json::Value::Bool(true));
    serde_json::Value::Object(map)
}

fn err_envelope(err: &OrchestratorError) -> serde_json::Value {
    serde_json::json!({
        "success": false,
        "error": ToolErrorDetail::from(err),
    })
}

/// Memory footprint and load-time estimates per model size, used to fill out
/// `model_info` in a `transcribe_audio` response. Mirrors the lookup table
/// consulted before a model is loaded; this crate never loads a model
/// directly (that lives behind [`crate::engine::TranscriptionEngine`]), so
/// the table is reproduced here purely for advisory reporting.
fn memory_requirement_mb(model_size: ModelSize) -> u32 {
    match model_size {
        ModelSize::Tiny => 512,
        ModelSize::Base => 1024,
        ModelSize::Small => 2048,
        ModelSize::Medium => 4096,
        ModelSize::Large => 8192,
    }
}

const ESTIMATED_LOAD_TIME_SECS: f64 = 30.0;

/// Processing-time estimate. Speed factors are relative to realtime on GPU;
/// CPU and diarization each carry a multiplier. Without audio-duration
/// probing at submission time this always falls back to the flat estimate
/// used when duration is unknown.
fn estimate_processing_time(model_size: ModelSize, device: crate::job::DeviceHint, diarize: bool) -> f64 {
    let speed_factor = match model_size {
        ModelSize::Tiny => 0.1,
        ModelSize::Base => 0.15,
        ModelSize::Small => 0.2,
        ModelSize::Medium => 0.3,
        ModelSize::Large => 0.5,
    };
    let mut estimate = 60.0 * speed_factor;
    if matches!(device, crate::job::DeviceHint::Cpu) {
        estimate *= 3.0;
    }
    if diarize {
        estimate *= 1.4;
    }
    estimate
}

#[derive(Debug, Deserialize)]
pub struct TranscribeAudioRequest {
    pub file_path: String,
    #[serde(default)]
    pub model_size: Option<ModelSize>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default = "default_true")]
    pub enable_diarization: bool,
    #[serde(default)]
    pub device: Option<crate::job::DeviceHint>,
    #[serde(default)]
    pub compute_type: Option<crate::job::ComputePrecision>,
    #[serde(default)]
    pub output_format: Option<String>,
}

fn default_true() -> bool {
    true
}

impl TranscribeAudioRequest {
    fn into_parameters(self) -> JobParameters {
        let mut parameters = JobParameters {
            enable_diarization: self.enable_diarization,
            language: self.language,
            output_format: self.output_format,
            ..JobParameters::default()
        };
        if let Some(model_size) = self.model_size {
            parameters.model_size = model_size;
        }
        if let Some(device) = self.device {
            parameters.device = device;
        }
        if let Some(compute_type) = self.compute_type {
            parameters.compute_type = Some(compute_type);
        }
        parameters
    }
}

fn model_info_json(parameters: &JobParameters) -> serde_json::Value {
    serde_json::json!({
        "model_size": parameters.model_size.to_string(),
        "device": parameters.device,
        "compute_type": parameters.compute_type.map(|c| c.to_string()),
        "supports_diarization": true,
        "estimated_load_time": ESTIMATED_LOAD_TIME_SECS,
        "memory_requirement_mb": memory_requirement_mb(parameters.model_size),
    })
}

/// `transcribe_audio`: submit a single file with its model size, language,
/// diarization, device, compute type, and output format parameters.
pub async fn transcribe_audio(service: &Service, request: TranscribeAudioRequest) -> serde_json::Value {
    let file_path = request.file_path.clone();
    let parameters = request.into_parameters();
    match service.submit_single(&file_path, parameters.clone()).await {
        Ok(job_id) => ok_envelope(serde_json::json!({
            "job": {
                "job_id": job_id.as_str(),
                "status": JobStatus::Queued.as_str(),
                "progress": 0,
                "estimated_duration": estimate_processing_time(
                    parameters.model_size,
                    parameters.device,
                    parameters.enable_diarization,
                ),
                "model_info": model_info_json(&parameters),
            },
        })),
        Err(e) => err_envelope(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct GetProgressRequest {
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub all_jobs: bool,
}

/// `get_transcription_progress`: reports one job by `job_id`, or every job
/// when `all_jobs` is set. Exactly one of the two must be provided.
pub async fn get_transcription_progress(
    service: &Service,
    request: GetProgressRequest,
) -> serde_json::Value {
    if request.all_jobs {
        let active: Vec<_> = service
            .list_jobs(JobFilter::default())
            .await
            .into_iter()
            .filter(|j| !j.status.is_terminal())
            .map(job_progress_json)
            .collect();
        return ok_envelope(serde_json::json!({ "active_jobs": active }));
    }

    let Some(job_id) = request.job_id else {
        return err_envelope(&OrchestratorError::invalid_parameters(
            "either job_id or all_jobs=true must be specified",
        ));
    };
    let job_id: JobId = job_id.into();
    match service.get_job(&job_id).await {
        Some(job) => ok_envelope(job_progress_json(job)),
        None => err_envelope(&OrchestratorError::job_not_found(format!(
            "job {job_id} not found"
        ))),
    }
}

fn job_progress_json(job: Job) -> serde_json::Value {
    serde_json::json!({
        "job_id": job.job_id.as_str(),
        "status": job.status.as_str(),
        "progress": job.progress,
        "message": job.progress_message,
    })
}

#[derive(Debug, Deserialize)]
pub struct GetResultRequest {
    pub job_id: String,
    #[serde(default = "default_result_format")]
    pub format: String,
    #[serde(default = "default_true")]
    pub include_metadata: bool,
    #[serde(default = "default_true")]
    pub include_timestamps: bool,
    #[serde(default = "default_true")]
    pub include_confidence: bool,
    #[serde(default = "default_true")]
    pub include_speakers: bool,
}

fn default_result_format() -> String {
    "full".to_string()
}

/// `get_transcription_result`: a job found but not yet `completed` reports
/// `JOB_NOT_COMPLETED` instead of a not-found error, since the job id itself
/// is valid. `format` shapes the returned artifact: `text` returns only the
/// transcript, `summary` adds duration/speaker/word counts without segments,
/// `segments` returns the segment list alone, and `full` (the default)
/// returns everything, each gated by the `include_*` flags.
pub async fn get_transcription_result(service: &Service, request: GetResultRequest) -> serde_json::Value {
    let job_id: JobId = request.job_id.into();
    let Some(job) = service.get_job(&job_id).await else {
        return err_envelope(&OrchestratorError::job_not_found(format!(
            "job {job_id} not found"
        )));
    };

    if job.status != JobStatus::Completed {
        return serde_json::json!({
            "success": false,
            "error": {
                "code": "JOB_NOT_COMPLETED",
                "error_type": "validation",
                "message": format!("job {job_id} is not completed (status: {})", job.status),
                "user_action": "wait for completion, or check get_transcription_progress",
                "http_equivalent": 409,
            },
            "current_status": job.status.as_str(),
            "progress": job.progress,
        });
    }

    let artifact = match service.load_artifact(&job_id).await {
        Ok(artifact) => artifact,
        Err(e) => return err_envelope(&e),
    };

    let mut payload = serde_json::Map::new();
    payload.insert("job_id".to_string(), serde_json::json!(job_id.as_str()));
    payload.insert("text".to_string(), serde_json::json!(artifact.text));

    match request.format.as_str() {
        "text" => {}
        "summary" => {
            payload.insert(
                "word_count".to_string(),
                serde_json::json!(artifact.text.split_whitespace().count()),
            );
            if request.include_speakers {
                payload.insert("speaker_count".to_string(), serde_json::json!(artifact.speakers.len()));
            }
            if request.include_metadata {
                payload.insert("metadata".to_string(), serde_json::json!(artifact.metadata));
            }
        }
        "segments" => {
            payload.remove("text");
            payload.insert(
                "segments".to_string(),
                serde_json::json!(segment_list_json(
                    &artifact,
                    request.include_timestamps,
                    request.include_confidence,
                    request.include_speakers,
                )),
            );
        }
        _ => {
            payload.insert(
                "segments".to_string(),
                serde_json::json!(segment_list_json(
                    &artifact,
                    request.include_timestamps,
                    request.include_confidence,
                    request.include_speakers,
                )),
            );
            if request.include_speakers {
                payload.insert("speakers".to_string(), serde_json::json!(artifact.speakers));
            }
            if request.include_metadata {
                payload.insert("metadata".to_string(), serde_json::json!(artifact.metadata));
            }
            payload.insert("language".to_string(), serde_json::json!(artifact.language));
        }
    }

    ok_envelope(serde_json::Value::Object(payload))
}

fn segment_list_json(
    artifact: &crate::job::TranscriptionArtifact,
    include_timestamps: bool,
    include_confidence: bool,
    include_speakers: bool,
) -> Vec<serde_json::Value> {
    artifact
        .segments
        .iter()
        .map(|segment| {
            let mut map = serde_json::Map::new();
            map.insert("text".to_string(), serde_json::json!(segment.text));
            if include_timestamps {
                map.insert("start_sec".to_string(), serde_json::json!(segment.start_sec));
                map.insert("end_sec".to_string(), serde_json::json!(segment.end_sec));
            }
            if include_confidence {
                if let Some(confidence) = segment.confidence {
                    map.insert("confidence".to_string(), serde_json::json!(confidence));
                }
            }
            if include_speakers {
                if let Some(label) = &segment.speaker_label {
                    map.insert("speaker_label".to_string(), serde_json::json!(label));
                }
            }
            serde_json::Value::Object(map)
        })
        .collect()
}

#[derive(Debug, Deserialize)]
pub struct ListHistoryRequest {
    #[serde(default = "default_history_limit")]
    pub limit: usize,
    #[serde(default)]
    pub status_filter: Option<JobStatus>,
    #[serde(default)]
    pub search_query: Option<String>,
    #[serde(default)]
    pub date_from: Option<String>,
    #[serde(default)]
    pub date_to: Option<String>,
    #[serde(default)]
    pub get_statistics: bool,
}

fn default_history_limit() -> usize {
    10
}

/// `list_transcription_history`: lists jobs newest first, optionally capped
/// by `limit`, filtered by status and `created_at` range, and searched
/// against `source.original_filename`. `get_statistics` additionally
/// attaches a status/model breakdown over the filtered set.
pub async fn list_transcription_history(
    service: &Service,
    request: ListHistoryRequest,
) -> serde_json::Value {
    let date_from = match parse_history_bound(&request.date_from, "date_from") {
        Ok(bound) => bound,
        Err(e) => return err_envelope(&e),
    };
    let date_to = match parse_history_bound(&request.date_to, "date_to") {
        Ok(bound) => bound,
        Err(e) => return err_envelope(&e),
    };

    let filter = JobFilter {
        status: request.status_filter,
        limit: None,
    };
    let mut jobs = service.list_jobs(filter).await;
    let total_count = jobs.len();

    if let Some(query) = &request.search_query {
        let query = query.to_lowercase();
        jobs.retain(|j| j.source.original_filename.to_lowercase().contains(&query));
    }
    if let Some(from) = date_from {
        jobs.retain(|j| j.created_at >= from);
    }
    if let Some(to) = date_to {
        jobs.retain(|j| j.created_at <= to);
    }
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let filtered_count = jobs.len();
    jobs.truncate(request.limit);

    let statistics = request.get_statistics.then(|| history_statistics_json(&jobs));

    let history: Vec<_> = jobs
        .iter()
        .map(|job| {
            serde_json::json!({
                "job_id": job.job_id.as_str(),
                "status": job.status.as_str(),
                "file_name": job.source.original_filename,
                "created_at": job.created_at.to_rfc3339(),
                "updated_at": job.updated_at.to_rfc3339(),
            })
        })
        .collect();

    let mut payload = serde_json::json!({
        "jobs": history,
        "total_count": total_count,
        "filtered_count": filtered_count,
    });
    if let Some(statistics) = statistics {
        payload["statistics"] = statistics;
    }
    ok_envelope(payload)
}

fn parse_history_bound(
    raw: &Option<String>,
    field: &str,
) -> crate::error::Result<Option<chrono::DateTime<chrono::Utc>>> {
    match raw {
        None => Ok(None),
        Some(s) => chrono::DateTime::parse_from_rfc3339(s)
            .map(|dt| Some(dt.with_timezone(&chrono::Utc)))
            .map_err(|e| OrchestratorError::invalid_parameters(format!("invalid {field}: {e}"))),
    }
}

fn history_statistics_json(jobs: &[Job]) -> serde_json::Value {
    let mut model_usage = std::collections::HashMap::new();
    let mut completed = 0;
    let mut failed = 0;
    let mut processing = 0;
    for job in jobs {
        match job.status {
            JobStatus::Completed => completed += 1,
            JobStatus::Failed => failed += 1,
            JobStatus::Processing => processing += 1,
            _ => {}
        }
        *model_usage.entry(job.parameters.model_size.to_string()).or_insert(0) += 1;
    }
    serde_json::json!({
        "total_jobs": jobs.len(),
        "completed_jobs": completed,
        "failed_jobs": failed,
        "processing_jobs": processing,
        "model_usage": model_usage,
    })
}

#[derive(Debug, Deserialize)]
pub struct BatchTranscribeRequest {
    pub file_paths: Vec<String>,
    #[serde(default)]
    pub model_size: Option<ModelSize>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default = "default_true")]
    pub enable_diarization: bool,
    #[serde(default = "default_batch_concurrency")]
    pub max_concurrent: u32,
    #[serde(default)]
    pub compute_type: Option<crate::job::ComputePrecision>,
    #[serde(default)]
    pub output_format: Option<String>,
    #[serde(default)]
    pub device: Option<crate::job::DeviceHint>,
}

fn default_batch_concurrency() -> u32 {
    3
}

/// `batch_transcribe`: empty `file_paths` and all-invalid batches are
/// rejected outright; a partially-valid batch still succeeds, reporting
/// `invalid_files` alongside the created jobs.
pub async fn batch_transcribe(service: &Service, request: BatchTranscribeRequest) -> serde_json::Value {
    let mut parameters = JobParameters {
        enable_diarization: request.enable_diarization,
        language: request.language,
        model_size: request.model_size.unwrap_or_default(),
        output_format: request.output_format,
        ..JobParameters::default()
    };
    if let Some(device) = request.device {
        parameters.device = device;
    }
    if let Some(compute_type) = request.compute_type {
        parameters.compute_type = Some(compute_type);
    }
    let max_concurrent = request.max_concurrent;
    match service
        .submit_batch(request.file_paths, parameters.clone(), max_concurrent)
        .await
    {
        Ok(submission) => batch_submission_json(submission, &parameters),
        Err(e) => err_envelope(&e),
    }
}

fn batch_submission_json(submission: BatchSubmission, parameters: &JobParameters) -> serde_json::Value {
    let estimated_duration = estimate_processing_time(
        parameters.model_size,
        parameters.device,
        parameters.enable_diarization,
    );
    let jobs: Vec<_> = submission
        .job_ids
        .iter()
        .map(|job_id| {
            serde_json::json!({
                "job_id": job_id.as_str(),
                "status": JobStatus::Queued.as_str(),
                "estimated_duration": estimated_duration,
            })
        })
        .collect();
    ok_envelope(serde_json::json!({
        "batch_id": submission.batch_id,
        "total_jobs": submission.job_ids.len(),
        "valid_files": submission.valid_files,
        "invalid_files": submission.invalid_files.into_iter().map(|(file_path, reason)| {
            serde_json::json!({ "file_path": file_path, "reason": reason })
        }).collect::<Vec<_>>(),
        "jobs": jobs,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CancelTranscriptionRequest {
    pub job_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// `cancel_transcription`: a job that exists but is already terminal reports
/// `CANNOT_CANCEL` with its current status rather than a generic failure.
pub async fn cancel_transcription(service: &Service, request: CancelTranscriptionRequest) -> serde_json::Value {
    let job_id: JobId = request.job_id.into();
    let Some(job) = service.get_job(&job_id).await else {
        return err_envelope(&OrchestratorError::job_not_found(format!(
            "job {job_id} not found"
        )));
    };
    let reason = request.reason.unwrap_or_else(|| "Cancelled by user".to_string());

    match service.cancel_job(&job_id).await {
        CancelOutcome::Cancelled => ok_envelope(serde_json::json!({
            "success": true,
            "job_id": job_id.as_str(),
            "reason": reason,
        })),
        CancelOutcome::NotCancellable => serde_json::json!({
            "success": false,
            "error": {
                "code": "CANNOT_CANCEL",
                "error_type": "validation",
                "message": format!("job {job_id} cannot be cancelled (status: {})", job.status),
                "user_action": "only queued or processing jobs can be cancelled",
                "http_equivalent": 409,
            },
            "current_status": job.status.as_str(),
        }),
    }
}
