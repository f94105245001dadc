//! The pipeline orchestrator: drives a job from `queued` to a terminal
//! state, persisting every transition so a status poll (or another process)
//! always sees the latest truth.
//!
//! Fallback policy lives here and only here. Stage adapters raise errors;
//! this module decides per stage whether to degrade and continue or to fail
//! the job.

pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;


use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::AppError;
use crate::stages::{
    Analyzer, AudioExtractor, Diarization, Diarizer, RawTranscript, Reporter, SpeakerMatch,
    SpeakerMatcher, Transcriber,
};
use crate::store::{
    Job, JobStatus, JobStore, ReportPaths, Speaker, SpeakerSegment, DEFAULT_SPEAKER_ID,
};

/// User-facing progress milestones. Narration only, never used for control
/// decisions.
mod progress {
    pub const TRANSCRIBING: i64 = 10;
    pub const DIARIZING: i64 = 40;
    pub const MATCHING: i64 = 60;
    pub const EXTRACTING: i64 = 70;
    pub const AWAITING_LABELS: i64 = 75;
    pub const ANALYZING: i64 = 80;
    pub const REPORTING: i64 = 95;
    pub const COMPLETE: i64 = 100;
}

pub struct Orchestrator {
    store: Arc<JobStore>,
    transcriber: Arc<dyn Transcriber>,
    diarizer: Arc<dyn Diarizer>,
    matcher: Arc<dyn SpeakerMatcher>,
    extractor: Arc<dyn AudioExtractor>,
    analyzer: Arc<dyn Analyzer>,
    reporter: Arc<dyn Reporter>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<JobStore>,
        transcriber: Arc<dyn Transcriber>,
        diarizer: Arc<dyn Diarizer>,
        matcher: Arc<dyn SpeakerMatcher>,
        extractor: Arc<dyn AudioExtractor>,
        analyzer: Arc<dyn Analyzer>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            store,
            transcriber,
            diarizer,
            matcher,
            extractor,
            analyzer,
            reporter,
        }
    }

    /// Drive a queued job through the full pipeline. Returns after the job
    /// reaches `complete`, `failed`, or suspends in `awaiting_labels`.
    ///
    /// Any error propagating out of here has already been recorded on the
    /// job; the caller (the scheduler task) must log it, never panic.
    pub async fn run(&self, job_id: &str) -> Result<(), AppError> {
        let job = self
            .store
            .get(job_id)?
            .ok_or_else(|| AppError::NotFound(format!("job {}", job_id)))?;

        if job.status.is_terminal() {
            log::warn!("Refusing to run job {} already in state {}", job_id, job.status);
            return Err(AppError::Validation(format!(
                "job {} is already {}",
                job_id, job.status
            )));
        }

        match self.run_stages(&job).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail_job(job_id, &e);
                Err(e)
            }
        }
    }

    /// Analysis re-entry used after a human supplies speaker labels. Skips
    /// transcription/diarization/matching entirely and operates on whatever
    /// segments and speakers are already persisted.
    pub async fn resume_analysis(&self, job_id: &str) -> Result<(), AppError> {
        let job = self
            .store
            .get(job_id)?
            .ok_or_else(|| AppError::NotFound(format!("job {}", job_id)))?;

        if job.status.is_terminal() {
            log::warn!(
                "Refusing to resume job {} already in state {}",
                job_id,
                job.status
            );
            return Err(AppError::Validation(format!(
                "job {} is already {}",
                job_id, job.status
            )));
        }

        match self.run_analysis_phase(job_id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail_job(job_id, &e);
                Err(e)
            }
        }
    }

    async fn run_stages(&self, job: &Job) -> Result<(), AppError> {
        let job_id = job.id.as_str();
        let audio = PathBuf::from(job.audio_path.clone().ok_or_else(|| {
            AppError::Validation(format!("job {} has no audio path", job_id))
        })?);

        // ── transcribing ──────────────────────────────────────────────────
        self.store.set_status(
            job_id,
            JobStatus::Transcribing,
            Some(progress::TRANSCRIBING),
            Some("Transcribing audio"),
            None,
        )?;

        let raw = self.transcriber.transcribe(&audio, &job.language).await?;

        if let Some(last) = raw.segments.last() {
            self.store
                .set_duration(job_id, last.end_ms as f64 / 1000.0)?;
        }

        // Alignment failure is non-fatal: keep the unaligned transcript.
        let aligned = match self.transcriber.align(&raw, &audio).await {
            Ok(aligned) => aligned,
            Err(e) => {
                log::warn!("Alignment failed for job {}, using raw transcript: {}", job_id, e);
                raw
            }
        };

        // ── diarizing ─────────────────────────────────────────────────────
        self.store.set_status(
            job_id,
            JobStatus::Diarizing,
            Some(progress::DIARIZING),
            Some("Identifying speakers"),
            None,
        )?;

        let diarized = self.try_diarize(job_id, &audio, &aligned).await;

        let (segments, diarization) = match diarized {
            Some((diarization, segments)) => (segments, Some(diarization)),
            None => {
                // Degraded mode must be visible to status polls, not just logs.
                self.store.set_status_note(
                    job_id,
                    "Diarization unavailable; transcript attributed to a single speaker",
                )?;
                (single_speaker_segments(&aligned), None)
            }
        };
        self.store.set_segments(job_id, segments.clone())?;

        // ── matching ──────────────────────────────────────────────────────
        self.store.set_status(
            job_id,
            JobStatus::Matching,
            Some(progress::MATCHING),
            Some("Matching known voices"),
            None,
        )?;

        let speaker_ids = unique_speaker_ids(&segments);
        let (matches, clips) = match &diarization {
            Some(diarization) => {
                let matches = match self
                    .matcher
                    .match_all(&speaker_ids, &audio, diarization)
                    .await
                {
                    Ok(matches) => matches,
                    Err(e) => {
                        log::warn!("Speaker matching failed for job {}: {}", job_id, e);
                        speaker_ids
                            .iter()
                            .map(|id| SpeakerMatch::unmatched(id))
                            .collect()
                    }
                };

                self.store.set_status(
                    job_id,
                    JobStatus::Matching,
                    Some(progress::EXTRACTING),
                    Some("Extracting speaker audio"),
                    None,
                )?;

                let clips = match self
                    .extractor
                    .extract_all(&audio, &speaker_ids, diarization, job_id)
                    .await
                {
                    Ok(clips) => clips,
                    Err(e) => {
                        log::warn!("Clip extraction failed for job {}: {}", job_id, e);
                        HashMap::new()
                    }
                };
                (matches, clips)
            }
            // Diarization fell back: no voices to match, nothing to extract.
            None => (
                speaker_ids
                    .iter()
                    .map(|id| SpeakerMatch::unmatched(id))
                    .collect(),
                HashMap::new(),
            ),
        };

        let speakers = build_speakers(&segments, &speaker_ids, &matches, &clips);
        self.store.set_speakers(job_id, speakers.clone())?;

        // ── decision point ────────────────────────────────────────────────
        let all_matched = speakers.iter().all(|s| s.matched_voice_id.is_some());
        if speakers.len() >= 2 && !all_matched {
            self.store.set_status(
                job_id,
                JobStatus::AwaitingLabels,
                Some(progress::AWAITING_LABELS),
                Some("Waiting for speaker labels"),
                None,
            )?;
            log::info!(
                "Job {} suspended awaiting labels ({} speakers, not all matched)",
                job_id,
                speakers.len()
            );
            return Ok(());
        }

        self.run_analysis_phase(job_id).await
    }

    /// Diarize and attribute segments, or `None` when either step fails.
    /// Diarization being unavailable is a degraded mode, not a job failure.
    async fn try_diarize(
        &self,
        job_id: &str,
        audio: &Path,
        aligned: &RawTranscript,
    ) -> Option<(Diarization, Vec<SpeakerSegment>)> {
        let diarization = match self.diarizer.run(audio).await {
            Ok(d) => d,
            Err(e) => {
                log::warn!(
                    "Diarization unavailable for job {}, falling back to single speaker: {}",
                    job_id,
                    e
                );
                return None;
            }
        };

        match self.diarizer.assign_speakers(aligned, &diarization).await {
            Ok(segments) => Some((diarization, segments)),
            Err(e) => {
                log::warn!(
                    "Speaker assignment failed for job {}, falling back to single speaker: {}",
                    job_id,
                    e
                );
                None
            }
        }
    }

    /// Final stages: analyze, persist, report, complete.
    async fn run_analysis_phase(&self, job_id: &str) -> Result<(), AppError> {
        self.store.set_status(
            job_id,
            JobStatus::Analyzing,
            Some(progress::ANALYZING),
            Some("Analyzing transcript"),
            None,
        )?;

        let job = self
            .store
            .get(job_id)?
            .ok_or_else(|| AppError::NotFound(format!("job {}", job_id)))?;

        let duration = job.duration_seconds.unwrap_or(0.0);
        let analysis = self
            .analyzer
            .analyze(&job.segments, &job.speakers, job.recording_type, duration)
            .await;

        self.store.set_analysis(job_id, analysis.clone())?;

        self.store.set_status(
            job_id,
            JobStatus::Analyzing,
            Some(progress::REPORTING),
            Some("Generating reports"),
            None,
        )?;

        // Re-fetch so reports carry the persisted analysis.
        let job = self
            .store
            .get(job_id)?
            .ok_or_else(|| AppError::NotFound(format!("job {}", job_id)))?;

        // JSON and Markdown are mandatory; PDF is best-effort.
        let json_path = self.reporter.generate_json(&job, &analysis).await?;
        let md_path = self.reporter.generate_markdown(&job, &analysis).await?;
        let pdf_path = match self.reporter.generate_pdf(&job, &analysis).await {
            Ok(path) => Some(path),
            Err(e) => {
                log::warn!("PDF report failed for job {} (continuing): {}", job_id, e);
                None
            }
        };

        self.store.set_reports(
            job_id,
            ReportPaths {
                json: Some(json_path.to_string_lossy().to_string()),
                markdown: Some(md_path.to_string_lossy().to_string()),
                pdf: pdf_path.map(|p| p.to_string_lossy().to_string()),
            },
        )?;

        self.store.set_status(
            job_id,
            JobStatus::Complete,
            Some(progress::COMPLETE),
            Some("Complete"),
            None,
        )?;

        log::info!("Job {} complete", job_id);
        Ok(())
    }

    /// Fatal path: persist the error verbatim with progress forced to 100.
    /// Store failures here are logged, not propagated; the original error
    /// matters more.
    fn fail_job(&self, job_id: &str, error: &AppError) {
        log::error!("Job {} failed: {}", job_id, error);
        if let Err(store_err) = self.store.set_status(
            job_id,
            JobStatus::Failed,
            Some(100),
            Some("Failed"),
            Some(&error.to_string()),
        ) {
            log::error!("Failed to record failure for job {}: {}", job_id, store_err);
        }
    }
}

/// Unique speaker identifiers in first-seen order.
pub fn unique_speaker_ids(segments: &[SpeakerSegment]) -> Vec<String> {
    let mut ids = Vec::new();
    for seg in segments {
        if !ids.contains(&seg.speaker) {
            ids.push(seg.speaker.clone());
        }
    }
    ids
}

/// Single-speaker fallback: every transcript segment attributed to the
/// default speaker identifier.
fn single_speaker_segments(transcript: &RawTranscript) -> Vec<SpeakerSegment> {
    transcript
        .segments
        .iter()
        .map(|seg| SpeakerSegment {
            speaker: DEFAULT_SPEAKER_ID.to_string(),
            start_ms: seg.start_ms,
            end_ms: seg.end_ms,
            text: seg.text.clone(),
            confidence: seg.confidence,
        })
        .collect()
}

/// Aggregate per-speaker talk time and counts, then attach match results and
/// clip paths.
fn build_speakers(
    segments: &[SpeakerSegment],
    speaker_ids: &[String],
    matches: &[SpeakerMatch],
    clips: &HashMap<String, PathBuf>,
) -> Vec<Speaker> {
    speaker_ids
        .iter()
        .map(|id| {
            let (talk_time_ms, segment_count) = segments
                .iter()
                .filter(|s| &s.speaker == id)
                .fold((0i64, 0i64), |(time, count), s| {
                    (time + s.duration_ms(), count + 1)
                });
            let matched = matches.iter().find(|m| &m.speaker_id == id);

            Speaker {
                id: id.clone(),
                label: None,
                matched_voice_id: matched.and_then(|m| m.matched_voice_id.clone()),
                match_confidence: matched.and_then(|m| m.confidence),
                talk_time_ms,
                segment_count,
                clip_path: clips.get(id).map(|p| p.to_string_lossy().to_string()),
            }
        })
        .collect()
}
