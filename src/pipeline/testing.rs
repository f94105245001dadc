//! Mock stage adapters for pipeline and service tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::AppError;
use crate::stages::{
    Analyzer, AudioExtractor, Diarization, DiarizedTurn, Diarizer, RawTranscript, Reporter,
    SpeakerMatch, SpeakerMatcher, Transcriber, TranscriptSegment,
};
use crate::store::{Analysis, Job, RecordingType, Speaker, SpeakerSegment};

pub(crate) fn two_segment_transcript() -> Vec<TranscriptSegment> {
    vec![
        TranscriptSegment {
            start_ms: 0,
            end_ms: 5000,
            text: "Hello, thanks for joining.".to_string(),
            confidence: 0.95,
        },
        TranscriptSegment {
            start_ms: 5000,
            end_ms: 10_000,
            text: "Happy to be here.".to_string(),
            confidence: 0.92,
        },
    ]
}

pub(crate) struct MockTranscriber {
    pub segments: Vec<TranscriptSegment>,
    pub fail: bool,
    pub align_fails: bool,
    /// Artificial stage latency, for scheduler/gate tests.
    pub delay: Option<Duration>,
}

impl Default for MockTranscriber {
    fn default() -> Self {
        Self {
            segments: two_segment_transcript(),
            fail: false,
            align_fails: false,
            delay: None,
        }
    }
}

#[async_trait]
impl Transcriber for MockTranscriber {
    async fn transcribe(&self, _audio: &Path, language: &str) -> Result<RawTranscript, AppError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(AppError::Transcription("unreadable audio".to_string()));
        }
        Ok(RawTranscript {
            segments: self.segments.clone(),
            language: language.to_string(),
        })
    }

    async fn align(
        &self,
        transcript: &RawTranscript,
        _audio: &Path,
    ) -> Result<RawTranscript, AppError> {
        if self.align_fails {
            return Err(AppError::Backend("aligner crashed".to_string()));
        }
        Ok(transcript.clone())
    }
}

/// Two-speaker diarization splitting the transcript at 5s, or a configured
/// failure mode.
pub(crate) struct MockDiarizer {
    pub run_fails: Option<AppError>,
    pub assign_fails: bool,
}

impl Default for MockDiarizer {
    fn default() -> Self {
        Self {
            run_fails: None,
            assign_fails: false,
        }
    }
}

impl MockDiarizer {
    pub fn unavailable() -> Self {
        Self {
            run_fails: Some(AppError::Configuration("no HuggingFace token".to_string())),
            assign_fails: false,
        }
    }
}

#[async_trait]
impl Diarizer for MockDiarizer {
    async fn run(&self, _audio: &Path) -> Result<Diarization, AppError> {
        if let Some(e) = &self.run_fails {
            return Err(AppError::Configuration(e.to_string()));
        }
        Ok(Diarization {
            turns: vec![
                DiarizedTurn {
                    speaker: "SPEAKER_00".to_string(),
                    start_ms: 0,
                    end_ms: 5000,
                },
                DiarizedTurn {
                    speaker: "SPEAKER_01".to_string(),
                    start_ms: 5000,
                    end_ms: 10_000,
                },
            ],
            num_speakers: 2,
        })
    }

    async fn assign_speakers(
        &self,
        transcript: &RawTranscript,
        diarization: &Diarization,
    ) -> Result<Vec<SpeakerSegment>, AppError> {
        if self.assign_fails {
            return Err(AppError::Backend("assignment crashed".to_string()));
        }
        Ok(transcript
            .segments
            .iter()
            .map(|seg| {
                let turn = diarization
                    .turns
                    .iter()
                    .find(|t| seg.start_ms >= t.start_ms && seg.start_ms < t.end_ms)
                    .unwrap_or(&diarization.turns[0]);
                SpeakerSegment {
                    speaker: turn.speaker.clone(),
                    start_ms: seg.start_ms,
                    end_ms: seg.end_ms,
                    text: seg.text.clone(),
                    confidence: seg.confidence,
                }
            })
            .collect())
    }
}

/// Matches the speaker ids present in the map, leaves the rest unmatched.
#[derive(Default)]
pub(crate) struct MockMatcher {
    pub matches: HashMap<String, (String, f64)>,
    pub fail: bool,
}

#[async_trait]
impl SpeakerMatcher for MockMatcher {
    async fn match_all(
        &self,
        speaker_ids: &[String],
        _audio: &Path,
        _diarization: &Diarization,
    ) -> Result<Vec<SpeakerMatch>, AppError> {
        if self.fail {
            return Err(AppError::Backend("embedding backend down".to_string()));
        }
        Ok(speaker_ids
            .iter()
            .map(|id| match self.matches.get(id) {
                Some((voice_id, confidence)) => SpeakerMatch {
                    speaker_id: id.clone(),
                    matched_voice_id: Some(voice_id.clone()),
                    confidence: Some(*confidence),
                },
                None => SpeakerMatch::unmatched(id),
            })
            .collect())
    }
}

#[derive(Default)]
pub(crate) struct MockExtractor;

#[async_trait]
impl AudioExtractor for MockExtractor {
    async fn extract_all(
        &self,
        _audio: &Path,
        speaker_ids: &[String],
        _diarization: &Diarization,
        job_id: &str,
    ) -> Result<HashMap<String, PathBuf>, AppError> {
        Ok(speaker_ids
            .iter()
            .map(|id| {
                (
                    id.clone(),
                    PathBuf::from(format!("/tmp/clips/{}/{}.wav", job_id, id)),
                )
            })
            .collect())
    }
}

#[derive(Default)]
pub(crate) struct MockAnalyzer;

#[async_trait]
impl Analyzer for MockAnalyzer {
    async fn analyze(
        &self,
        _segments: &[SpeakerSegment],
        _speakers: &[Speaker],
        _recording_type: RecordingType,
        duration_seconds: f64,
    ) -> Analysis {
        Analysis {
            summary: "Mock summary.".to_string(),
            action_items: Vec::new(),
            key_decisions: Vec::new(),
            open_questions: Vec::new(),
            topics: vec!["mock".to_string()],
            sentiment: "neutral".to_string(),
            duration_formatted: format!("{}s", duration_seconds as i64),
        }
    }
}

#[derive(Default)]
pub(crate) struct MockReporter {
    pub json_fails: bool,
    pub pdf_fails: bool,
}

#[async_trait]
impl Reporter for MockReporter {
    async fn generate_json(&self, job: &Job, _analysis: &Analysis) -> Result<PathBuf, AppError> {
        if self.json_fails {
            return Err(AppError::Report("disk full".to_string()));
        }
        Ok(PathBuf::from(format!("/tmp/reports/{}.json", job.id)))
    }

    async fn generate_markdown(&self, job: &Job, _analysis: &Analysis) -> Result<PathBuf, AppError> {
        Ok(PathBuf::from(format!("/tmp/reports/{}.md", job.id)))
    }

    async fn generate_pdf(&self, job: &Job, _analysis: &Analysis) -> Result<PathBuf, AppError> {
        if self.pdf_fails {
            return Err(AppError::Backend("pandoc not installed".to_string()));
        }
        Ok(PathBuf::from(format!("/tmp/reports/{}.pdf", job.id)))
    }
}
