//! The service boundary: everything an HTTP layer (or embedding host) needs,
//! with validation done here so transport code stays thin.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use crate::config::Settings;
use crate::error::AppError;
use crate::pipeline::scheduler::JobScheduler;
use crate::pipeline::Orchestrator;
use crate::stages::{
    analyze::LlmAnalyzer, diarize::PyannoteDiarizer, extract::ClipExtractor,
    matching::EmbeddingMatcher, report::ReportWriter, whisper::WhisperTranscriber,
};
use crate::store::{Job, JobFilter, JobStatusView, JobStore, NewJob, RecordingType};

/// An uploaded recording, validated before any job record exists.
pub struct UploadRequest {
    pub file_name: String,
    pub title: Option<String>,
    pub language: Option<String>,
    pub recording_type: RecordingType,
    pub data: Vec<u8>,
}

/// One human-supplied speaker name.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SpeakerLabel {
    pub speaker_id: String,
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Json,
    Markdown,
    Pdf,
}

impl FromStr for ReportFormat {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "markdown" | "md" => Ok(Self::Markdown),
            "pdf" => Ok(Self::Pdf),
            other => Err(AppError::Validation(format!(
                "unknown report format '{}'",
                other
            ))),
        }
    }
}

pub struct TranscriptService {
    settings: Settings,
    store: Arc<JobStore>,
    scheduler: Arc<JobScheduler>,
}

impl TranscriptService {
    /// Wire up the store, the concrete stage adapters and the scheduler.
    /// Also sweeps jobs a previous process left mid-pipeline.
    pub fn new(settings: Settings) -> Result<Self, AppError> {
        settings.ensure_dirs()?;

        let store = Arc::new(JobStore::new(&settings.db_path())?);
        let swept = store.reset_stuck_jobs()?;
        if swept > 0 {
            log::warn!("Failed {} job(s) stranded by a previous process", swept);
        }

        let analyzer = LlmAnalyzer::from_settings(&settings.llm)?;
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            Arc::new(WhisperTranscriber::new(&settings)),
            Arc::new(PyannoteDiarizer::new(&settings)),
            Arc::new(EmbeddingMatcher::new(&settings)),
            Arc::new(ClipExtractor::new(&settings)),
            Arc::new(analyzer),
            Arc::new(ReportWriter::new(&settings)),
        ));
        let scheduler = Arc::new(JobScheduler::new(
            orchestrator,
            settings.max_concurrent_jobs,
        ));

        Ok(Self {
            settings,
            store,
            scheduler,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_parts(
        settings: Settings,
        store: Arc<JobStore>,
        scheduler: Arc<JobScheduler>,
    ) -> Self {
        Self {
            settings,
            store,
            scheduler,
        }
    }

    /// Accept an upload, persist the audio and queue the pipeline. All
    /// validation happens before a job record is created, so a rejected
    /// upload leaves no trace.
    pub async fn upload(&self, req: UploadRequest) -> Result<Job, AppError> {
        let extension = Path::new(&req.file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .ok_or_else(|| {
                AppError::Validation(format!("'{}' has no file extension", req.file_name))
            })?;
        if !self.settings.allowed_extensions.contains(&extension) {
            return Err(AppError::Validation(format!(
                "unsupported file type '{}' (allowed: {})",
                extension,
                self.settings.allowed_extensions.join(", ")
            )));
        }
        if req.data.is_empty() {
            return Err(AppError::Validation("uploaded file is empty".to_string()));
        }
        if req.data.len() as i64 > self.settings.max_upload_bytes {
            return Err(AppError::Validation(format!(
                "file exceeds the {} byte upload limit",
                self.settings.max_upload_bytes
            )));
        }

        let audio_path = self
            .settings
            .uploads_dir()
            .join(format!("{}.{}", uuid::Uuid::new_v4(), extension));
        tokio::fs::write(&audio_path, &req.data).await?;

        let title = req.title.filter(|t| !t.trim().is_empty()).unwrap_or_else(|| {
            Path::new(&req.file_name)
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| req.file_name.clone())
        });

        let job = self.store.create(NewJob {
            title,
            file_name: req.file_name,
            file_size: req.data.len() as i64,
            language: req.language.unwrap_or_else(|| "en".to_string()),
            recording_type: req.recording_type,
            audio_path: audio_path.to_string_lossy().to_string(),
        })?;

        log::info!("Job {} created for '{}', queueing pipeline", job.id, job.file_name);
        self.scheduler.schedule(&job.id)?;
        Ok(job)
    }

    pub fn status(&self, job_id: &str) -> Result<JobStatusView, AppError> {
        Ok(self.get_job(job_id)?.status_view())
    }

    pub fn get_job(&self, job_id: &str) -> Result<Job, AppError> {
        self.store
            .get(job_id)?
            .ok_or_else(|| AppError::NotFound(format!("job {}", job_id)))
    }

    pub fn list(&self, filter: &JobFilter) -> Result<(Vec<Job>, i64), AppError> {
        Ok(self.store.list(filter)?)
    }

    /// Apply human speaker labels and optionally resume the suspended
    /// pipeline into analysis.
    pub fn update_speakers(
        &self,
        job_id: &str,
        labels: &[SpeakerLabel],
        proceed_to_analysis: bool,
    ) -> Result<Job, AppError> {
        let job = self.get_job(job_id)?;

        // Terminal jobs are immutable, labels included.
        if job.status.is_terminal() {
            return Err(AppError::Validation(format!(
                "job {} is already {}",
                job_id, job.status
            )));
        }
        for label in labels {
            let speaker = job
                .speakers
                .iter()
                .find(|s| s.id == label.speaker_id)
                .ok_or_else(|| {
                    AppError::NotFound(format!(
                        "speaker {} on job {}",
                        label.speaker_id, job_id
                    ))
                })?;
            // A label is set exactly once.
            if speaker.label.is_some() {
                return Err(AppError::Validation(format!(
                    "speaker {} on job {} is already labeled",
                    label.speaker_id, job_id
                )));
            }
        }

        let pairs: Vec<(String, String)> = labels
            .iter()
            .map(|l| (l.speaker_id.clone(), l.label.clone()))
            .collect();
        let updated = self
            .store
            .apply_speaker_labels(job_id, &pairs)?
            .ok_or_else(|| AppError::NotFound(format!("job {}", job_id)))?;

        if proceed_to_analysis {
            self.scheduler.schedule_resume(job_id)?;
        }
        Ok(updated)
    }

    /// Path of the extracted per-speaker clip, for streaming to a labeler.
    pub fn speaker_audio(&self, job_id: &str, speaker_id: &str) -> Result<PathBuf, AppError> {
        let job = self.get_job(job_id)?;
        let speaker = job
            .speakers
            .iter()
            .find(|s| s.id == speaker_id)
            .ok_or_else(|| {
                AppError::NotFound(format!("speaker {} on job {}", speaker_id, job_id))
            })?;
        let clip = speaker.clip_path.as_deref().ok_or_else(|| {
            AppError::NotFound(format!("no audio clip for speaker {}", speaker_id))
        })?;
        Ok(PathBuf::from(clip))
    }

    pub fn report_path(&self, job_id: &str, format: ReportFormat) -> Result<PathBuf, AppError> {
        let job = self.get_job(job_id)?;
        let path = match format {
            ReportFormat::Json => job.reports.json,
            ReportFormat::Markdown => job.reports.markdown,
            ReportFormat::Pdf => job.reports.pdf,
        };
        path.map(PathBuf::from).ok_or_else(|| {
            AppError::NotFound(format!("no {:?} report for job {}", format, job_id))
        })
    }

    /// Delete a job. The store row is authoritative; file cleanup afterwards
    /// is best-effort and never fails the call.
    pub async fn delete(&self, job_id: &str) -> Result<bool, AppError> {
        let Some(job) = self.store.get(job_id)? else {
            return Ok(false);
        };
        if !self.store.delete(job_id)? {
            return Ok(false);
        }

        if let Some(audio) = &job.audio_path {
            if let Err(e) = tokio::fs::remove_file(audio).await {
                log::warn!("Could not remove audio for job {}: {}", job_id, e);
            }
        }
        let clips = self.settings.clips_dir().join(job_id);
        if clips.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&clips).await {
                log::warn!("Could not remove clips for job {}: {}", job_id, e);
            }
        }
        for report in [&job.reports.json, &job.reports.markdown, &job.reports.pdf] {
            if let Some(path) = report {
                if let Err(e) = tokio::fs::remove_file(path).await {
                    log::warn!("Could not remove report {} for job {}: {}", path, job_id, e);
                }
            }
        }

        log::info!("Job {} deleted", job_id);
        Ok(true)
    }

    /// Stop admitting queued jobs; running stages finish first.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    /// Wait for all in-flight pipeline tasks to settle.
    pub async fn drain(&self) {
        self.scheduler.join_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::*;
    use crate::store::JobStatus;

    fn test_settings(dir: &Path) -> Settings {
        Settings {
            data_dir: dir.to_path_buf(),
            max_upload_bytes: 1024,
            ..Default::default()
        }
    }

    fn service_with(dir: &Path, stages: ServiceStages) -> TranscriptService {
        let settings = test_settings(dir);
        settings.ensure_dirs().unwrap();
        let store = Arc::new(JobStore::new(&settings.db_path()).unwrap());
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            Arc::new(stages.transcriber),
            Arc::new(stages.diarizer),
            Arc::new(stages.matcher),
            Arc::new(MockExtractor),
            Arc::new(MockAnalyzer),
            Arc::new(MockReporter::default()),
        ));
        let scheduler = Arc::new(JobScheduler::new(orchestrator, 2));
        TranscriptService::with_parts(settings, store, scheduler)
    }

    #[derive(Default)]
    struct ServiceStages {
        transcriber: MockTranscriber,
        diarizer: MockDiarizer,
        matcher: MockMatcher,
    }

    fn wav_upload(data: Vec<u8>) -> UploadRequest {
        UploadRequest {
            file_name: "standup.wav".to_string(),
            title: None,
            language: None,
            recording_type: RecordingType::Meeting,
            data,
        }
    }

    #[tokio::test]
    async fn test_upload_rejects_bad_extension() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_with(dir.path(), ServiceStages::default());

        let err = service
            .upload(UploadRequest {
                file_name: "notes.txt".to_string(),
                ..wav_upload(vec![1, 2, 3])
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        // Rejected uploads leave no job behind.
        let (jobs, total) = service.list(&JobFilter::default()).unwrap();
        assert!(jobs.is_empty());
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn test_upload_rejects_empty_and_oversized_files() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_with(dir.path(), ServiceStages::default());

        let err = service.upload(wav_upload(vec![])).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let err = service.upload(wav_upload(vec![0u8; 2048])).await.unwrap_err();
        assert!(err.to_string().contains("upload limit"));
    }

    #[tokio::test]
    async fn test_upload_runs_pipeline_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_with(
            dir.path(),
            ServiceStages {
                diarizer: MockDiarizer::unavailable(),
                ..Default::default()
            },
        );

        let job = service.upload(wav_upload(vec![0u8; 64])).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.title, "standup");
        assert!(Path::new(job.audio_path.as_deref().unwrap()).exists());

        service.drain().await;

        let view = service.status(&job.id).unwrap();
        assert_eq!(view.status, JobStatus::Complete);
        assert_eq!(view.progress, 100);
    }

    #[tokio::test]
    async fn test_label_and_resume_flow() {
        let dir = tempfile::tempdir().unwrap();
        // Two diarized speakers, nobody in the voice library: the job
        // suspends for labels.
        let service = service_with(dir.path(), ServiceStages::default());

        let job = service.upload(wav_upload(vec![0u8; 64])).await.unwrap();
        service.drain().await;
        assert_eq!(
            service.status(&job.id).unwrap().status,
            JobStatus::AwaitingLabels
        );

        let err = service
            .update_speakers(
                &job.id,
                &[SpeakerLabel {
                    speaker_id: "SPEAKER_99".to_string(),
                    label: "Ghost".to_string(),
                }],
                false,
            )
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let updated = service
            .update_speakers(
                &job.id,
                &[
                    SpeakerLabel {
                        speaker_id: "SPEAKER_00".to_string(),
                        label: "Dana".to_string(),
                    },
                    SpeakerLabel {
                        speaker_id: "SPEAKER_01".to_string(),
                        label: "Lee".to_string(),
                    },
                ],
                true,
            )
            .unwrap();
        assert_eq!(updated.speakers[0].label.as_deref(), Some("Dana"));

        service.drain().await;
        let finished = service.get_job(&job.id).unwrap();
        assert_eq!(finished.status, JobStatus::Complete);
        assert!(finished.analysis.is_some());
    }

    #[tokio::test]
    async fn test_update_speakers_rejects_terminal_job() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_with(
            dir.path(),
            ServiceStages {
                diarizer: MockDiarizer::unavailable(),
                ..Default::default()
            },
        );

        let job = service.upload(wav_upload(vec![0u8; 64])).await.unwrap();
        service.drain().await;
        assert_eq!(service.status(&job.id).unwrap().status, JobStatus::Complete);

        let err = service
            .update_speakers(
                &job.id,
                &[SpeakerLabel {
                    speaker_id: "SPEAKER_00".to_string(),
                    label: "Dana".to_string(),
                }],
                false,
            )
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(service.get_job(&job.id).unwrap().speakers[0].label.is_none());
    }

    #[tokio::test]
    async fn test_update_speakers_rejects_relabeling() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_with(dir.path(), ServiceStages::default());

        let job = service.upload(wav_upload(vec![0u8; 64])).await.unwrap();
        service.drain().await;
        assert_eq!(
            service.status(&job.id).unwrap().status,
            JobStatus::AwaitingLabels
        );

        service
            .update_speakers(
                &job.id,
                &[SpeakerLabel {
                    speaker_id: "SPEAKER_00".to_string(),
                    label: "Dana".to_string(),
                }],
                false,
            )
            .unwrap();

        let err = service
            .update_speakers(
                &job.id,
                &[SpeakerLabel {
                    speaker_id: "SPEAKER_00".to_string(),
                    label: "Someone else".to_string(),
                }],
                false,
            )
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        // The other speaker can still be labeled afterwards.
        let updated = service
            .update_speakers(
                &job.id,
                &[SpeakerLabel {
                    speaker_id: "SPEAKER_01".to_string(),
                    label: "Lee".to_string(),
                }],
                false,
            )
            .unwrap();
        assert_eq!(updated.speakers[0].label.as_deref(), Some("Dana"));
        assert_eq!(updated.speakers[1].label.as_deref(), Some("Lee"));
    }

    #[tokio::test]
    async fn test_speaker_audio_and_report_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_with(dir.path(), ServiceStages::default());

        let job = service.upload(wav_upload(vec![0u8; 64])).await.unwrap();
        service.drain().await;

        // Suspended job: clips exist, reports do not.
        let clip = service.speaker_audio(&job.id, "SPEAKER_00").unwrap();
        assert!(clip.to_string_lossy().ends_with("SPEAKER_00.wav"));
        let err = service.speaker_audio(&job.id, "SPEAKER_99").unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let err = service
            .report_path(&job.id, ReportFormat::Markdown)
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_removes_job_and_audio() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_with(
            dir.path(),
            ServiceStages {
                diarizer: MockDiarizer::unavailable(),
                ..Default::default()
            },
        );

        let job = service.upload(wav_upload(vec![0u8; 64])).await.unwrap();
        service.drain().await;
        let audio = job.audio_path.clone().unwrap();
        assert!(Path::new(&audio).exists());

        assert!(service.delete(&job.id).await.unwrap());
        assert!(!Path::new(&audio).exists());
        assert!(matches!(
            service.get_job(&job.id).unwrap_err(),
            AppError::NotFound(_)
        ));
        assert!(!service.delete(&job.id).await.unwrap());
    }

    #[test]
    fn test_report_format_parsing() {
        assert_eq!("pdf".parse::<ReportFormat>().unwrap(), ReportFormat::Pdf);
        assert_eq!("MD".parse::<ReportFormat>().unwrap(), ReportFormat::Markdown);
        assert!("docx".parse::<ReportFormat>().is_err());
    }
}
