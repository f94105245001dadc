use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use super::{AudioExtractor, Diarization, DiarizedTurn};
use crate::config::Settings;
use crate::error::AppError;

/// Per-speaker representative clips cut with ffmpeg. Each speaker gets one
/// clip from their longest diarized turn; speakers whose longest turn is
/// shorter than the configured minimum are omitted from the result.
pub struct ClipExtractor {
    clips_dir: PathBuf,
    min_clip_seconds: f64,
}

impl ClipExtractor {
    pub fn new(settings: &Settings) -> Self {
        Self {
            clips_dir: settings.clips_dir(),
            min_clip_seconds: settings.min_clip_seconds,
        }
    }

    async fn extract_one(
        &self,
        audio: &Path,
        turn: &DiarizedTurn,
        clip_path: &Path,
    ) -> Result<(), AppError> {
        let start = turn.start_ms as f64 / 1000.0;
        let duration = (turn.end_ms - turn.start_ms) as f64 / 1000.0;

        let output = Command::new("ffmpeg")
            .args([
                "-y",
                "-ss",
                &format!("{:.3}", start),
                "-t",
                &format!("{:.3}", duration),
                "-i",
                &audio.to_string_lossy(),
                "-ac",
                "1",
                "-ar",
                "16000",
                &clip_path.to_string_lossy(),
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| AppError::Backend(format!("failed to spawn ffmpeg: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::Backend(format!(
                "ffmpeg exited with {}: {}",
                output.status, stderr
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl AudioExtractor for ClipExtractor {
    async fn extract_all(
        &self,
        audio: &Path,
        speaker_ids: &[String],
        diarization: &Diarization,
        job_id: &str,
    ) -> Result<HashMap<String, PathBuf>, AppError> {
        let job_dir = self.clips_dir.join(job_id);
        tokio::fs::create_dir_all(&job_dir).await?;

        let min_ms = (self.min_clip_seconds * 1000.0) as i64;
        let mut clips = HashMap::new();

        for speaker_id in speaker_ids {
            let longest = diarization
                .turns
                .iter()
                .filter(|t| &t.speaker == speaker_id)
                .max_by_key(|t| t.end_ms - t.start_ms);

            let Some(turn) = longest else {
                log::warn!("No diarized turns for speaker {}, skipping clip", speaker_id);
                continue;
            };
            if turn.end_ms - turn.start_ms < min_ms {
                log::info!(
                    "Speaker {} longest turn is {}ms, below clip minimum - skipping",
                    speaker_id,
                    turn.end_ms - turn.start_ms
                );
                continue;
            }

            let clip_path = job_dir.join(format!("{}.wav", speaker_id));
            match self.extract_one(audio, turn, &clip_path).await {
                Ok(()) => {
                    clips.insert(speaker_id.clone(), clip_path);
                }
                Err(e) => {
                    // One speaker's clip failing is not worth failing the rest.
                    log::warn!("Clip extraction failed for speaker {}: {}", speaker_id, e);
                }
            }
        }

        log::info!(
            "Extracted {} clips for job {} ({} speakers)",
            clips.len(),
            job_id,
            speaker_ids.len()
        );
        Ok(clips)
    }
}
