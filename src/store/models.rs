use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Speaker identifier used when diarization is unavailable and every segment
/// is attributed to a single synthetic speaker.
pub const DEFAULT_SPEAKER_ID: &str = "SPEAKER_00";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Transcribing,
    Diarizing,
    Matching,
    AwaitingLabels,
    Analyzing,
    Complete,
    Failed,
}

impl JobStatus {
    /// Terminal jobs are never re-entered by the orchestrator.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// States that mean a pipeline task is (or should be) actively driving
    /// the job. Used to detect jobs stranded by a crashed process.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            Self::Transcribing | Self::Diarizing | Self::Matching | Self::Analyzing
        )
    }
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Queued
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Transcribing => write!(f, "transcribing"),
            Self::Diarizing => write!(f, "diarizing"),
            Self::Matching => write!(f, "matching"),
            Self::AwaitingLabels => write!(f, "awaiting_labels"),
            Self::Analyzing => write!(f, "analyzing"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl From<String> for JobStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "queued" => Self::Queued,
            "transcribing" => Self::Transcribing,
            "diarizing" => Self::Diarizing,
            "matching" => Self::Matching,
            "awaiting_labels" => Self::AwaitingLabels,
            "analyzing" => Self::Analyzing,
            "complete" => Self::Complete,
            "failed" => Self::Failed,
            _ => Self::Queued,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingType {
    Meeting,
    Call,
    Memo,
    Interview,
    Other,
}

impl Default for RecordingType {
    fn default() -> Self {
        Self::Other
    }
}

impl std::fmt::Display for RecordingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Meeting => write!(f, "meeting"),
            Self::Call => write!(f, "call"),
            Self::Memo => write!(f, "memo"),
            Self::Interview => write!(f, "interview"),
            Self::Other => write!(f, "other"),
        }
    }
}

impl From<String> for RecordingType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "meeting" => Self::Meeting,
            "call" => Self::Call,
            "memo" => Self::Memo,
            "interview" => Self::Interview,
            _ => Self::Other,
        }
    }
}

/// One attributed utterance. Immutable once written; owned by its job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerSegment {
    pub speaker: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub text: String,
    /// Best-effort, not guaranteed calibrated.
    pub confidence: f64,
}

impl SpeakerSegment {
    pub fn duration_ms(&self) -> i64 {
        self.end_ms - self.start_ms
    }
}

/// Aggregated view over a job's segments for one speaker identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Speaker {
    pub id: String,
    /// Human-supplied name; the only field a human can mutate, via the
    /// label-resume entry point.
    pub label: Option<String>,
    pub matched_voice_id: Option<String>,
    pub match_confidence: Option<f64>,
    pub talk_time_ms: i64,
    pub segment_count: i64,
    pub clip_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionItem {
    pub text: String,
    pub owner: Option<String>,
    pub due_hint: Option<String>,
    pub priority: Priority,
}

/// LLM-derived summary of a completed transcript. Regenerating analysis
/// overwrites the prior value; it is not versioned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub summary: String,
    pub action_items: Vec<ActionItem>,
    pub key_decisions: Vec<String>,
    pub open_questions: Vec<String>,
    pub topics: Vec<String>,
    pub sentiment: String,
    pub duration_formatted: String,
}

/// Paths of generated reports. JSON and Markdown are always present on a
/// completed job; PDF only when the optional renderer succeeded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportPaths {
    pub json: Option<String>,
    pub markdown: Option<String>,
    pub pdf: Option<String>,
}

/// The central entity: one uploaded audio file and its end-to-end
/// processing record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub title: String,
    pub file_name: String,
    pub file_size: i64,
    pub language: String,
    pub recording_type: RecordingType,
    pub status: JobStatus,
    /// 0-100, monotonic non-decreasing except forced to 100 on failure.
    pub progress: i64,
    /// Human-readable stage label for progress narration.
    pub current_stage: Option<String>,
    /// Durable note about a degraded (but non-fatal) processing mode, e.g.
    /// the single-speaker fallback.
    pub status_note: Option<String>,
    pub error: Option<String>,
    pub audio_path: Option<String>,
    pub duration_seconds: Option<f64>,
    pub segments: Vec<SpeakerSegment>,
    pub speakers: Vec<Speaker>,
    pub analysis: Option<Analysis>,
    pub reports: ReportPaths,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update merged into an existing job record.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub title: Option<String>,
    pub status_note: Option<String>,
    pub audio_path: Option<String>,
    pub duration_seconds: Option<f64>,
    pub segments: Option<Vec<SpeakerSegment>>,
    pub speakers: Option<Vec<Speaker>>,
    pub analysis: Option<Analysis>,
    pub reports: Option<ReportPaths>,
}

/// What a new job needs at upload time; everything else starts empty.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub title: String,
    pub file_name: String,
    pub file_size: i64,
    pub language: String,
    pub recording_type: RecordingType,
    pub audio_path: String,
}

/// Status-endpoint projection of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: i64,
    pub current_stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_note: Option<String>,
    pub duration_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speakers_detected: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            job_id: self.id.clone(),
            status: self.status,
            progress: self.progress,
            current_stage: self.current_stage.clone(),
            status_note: self.status_note.clone(),
            duration_seconds: self.duration_seconds,
            speakers_detected: if self.speakers.is_empty() {
                None
            } else {
                Some(self.speakers.len() as i64)
            },
            error: self.error.clone(),
        }
    }
}

/// Filters for the job listing endpoint.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub recording_type: Option<RecordingType>,
    pub limit: i64,
    pub offset: i64,
}
