pub mod analyze;
pub mod diarize;
pub mod extract;
pub mod matching;
pub mod report;
pub mod whisper;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::AppError;
use crate::store::{Analysis, Job, RecordingType, Speaker, SpeakerSegment};

/// One transcript segment before speaker attribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start_ms: i64,
    pub end_ms: i64,
    pub text: String,
    pub confidence: f64,
}

/// Transcriber output: timed segments plus the detected/declared language.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTranscript {
    pub segments: Vec<TranscriptSegment>,
    pub language: String,
}

/// One diarized time span attributed to an anonymous speaker identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiarizedTurn {
    pub speaker: String,
    pub start_ms: i64,
    pub end_ms: i64,
}

/// Diarizer output handle, consumed by speaker assignment, matching and
/// clip extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diarization {
    pub turns: Vec<DiarizedTurn>,
    pub num_speakers: usize,
}

/// Voice-library match result for one diarized speaker. Both fields are
/// `None` when the speaker is unmatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerMatch {
    pub speaker_id: String,
    pub matched_voice_id: Option<String>,
    pub confidence: Option<f64>,
}

impl SpeakerMatch {
    pub fn unmatched(speaker_id: &str) -> Self {
        Self {
            speaker_id: speaker_id.to_string(),
            matched_voice_id: None,
            confidence: None,
        }
    }
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe the source audio in the declared language. Failure here is
    /// fatal to the job.
    async fn transcribe(&self, audio: &Path, language: &str) -> Result<RawTranscript, AppError>;

    /// Refine segment timings against the audio. Callers tolerate failure
    /// and fall back to the unaligned transcript.
    async fn align(&self, transcript: &RawTranscript, audio: &Path)
        -> Result<RawTranscript, AppError>;
}

#[async_trait]
pub trait Diarizer: Send + Sync {
    /// Partition the audio into speaker turns. Raises `Configuration` when a
    /// required credential is absent, `Backend` when the model is
    /// unavailable; the caller degrades either to single-speaker mode.
    async fn run(&self, audio: &Path) -> Result<Diarization, AppError>;

    /// Attribute transcript segments to diarized speakers.
    async fn assign_speakers(
        &self,
        transcript: &RawTranscript,
        diarization: &Diarization,
    ) -> Result<Vec<SpeakerSegment>, AppError>;
}

#[async_trait]
pub trait SpeakerMatcher: Send + Sync {
    /// Compare each speaker's voice against the library. A failure for one
    /// speaker degrades that speaker to unmatched; it never aborts the rest.
    async fn match_all(
        &self,
        speaker_ids: &[String],
        audio: &Path,
        diarization: &Diarization,
    ) -> Result<Vec<SpeakerMatch>, AppError>;
}

#[async_trait]
pub trait AudioExtractor: Send + Sync {
    /// Extract one representative clip per speaker. Speakers with no turn of
    /// qualifying length are omitted from the map, not an error.
    async fn extract_all(
        &self,
        audio: &Path,
        speaker_ids: &[String],
        diarization: &Diarization,
        job_id: &str,
    ) -> Result<HashMap<String, PathBuf>, AppError>;
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Produce an analysis. Never fails: the implementation substitutes a
    /// heuristic result when the LLM is unreachable.
    async fn analyze(
        &self,
        segments: &[SpeakerSegment],
        speakers: &[Speaker],
        recording_type: RecordingType,
        duration_seconds: f64,
    ) -> Analysis;
}

#[async_trait]
pub trait Reporter: Send + Sync {
    /// Mandatory: failure fails the job.
    async fn generate_json(&self, job: &Job, analysis: &Analysis) -> Result<PathBuf, AppError>;

    /// Mandatory: failure fails the job.
    async fn generate_markdown(&self, job: &Job, analysis: &Analysis) -> Result<PathBuf, AppError>;

    /// Best-effort: failure is only logged.
    async fn generate_pdf(&self, job: &Job, analysis: &Analysis) -> Result<PathBuf, AppError>;
}
