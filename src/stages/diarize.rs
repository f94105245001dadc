use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use super::{Diarization, DiarizedTurn, Diarizer, RawTranscript};
use crate::config::Settings;
use crate::error::AppError;
use crate::store::SpeakerSegment;

/// Diarization via a pyannote venv script. The script needs a HuggingFace
/// token; without one the `run` call raises a configuration error and the
/// orchestrator degrades the job to single-speaker mode.
pub struct PyannoteDiarizer {
    venv_python_path: PathBuf,
    diarization_script_path: PathBuf,
    huggingface_token: Option<String>,
    transcripts_dir: PathBuf,
}

impl PyannoteDiarizer {
    pub fn new(settings: &Settings) -> Self {
        Self {
            venv_python_path: settings.venv_python_path.clone(),
            diarization_script_path: settings.diarization_script_path.clone(),
            huggingface_token: settings.huggingface_token.clone(),
            transcripts_dir: settings.transcripts_dir(),
        }
    }
}

#[async_trait]
impl Diarizer for PyannoteDiarizer {
    async fn run(&self, audio: &Path) -> Result<Diarization, AppError> {
        let Some(token) = &self.huggingface_token else {
            return Err(AppError::Configuration(
                "no HuggingFace token configured - diarization unavailable".to_string(),
            ));
        };

        let output_path = self.transcripts_dir.join(format!(
            "{}_diarization.json",
            audio.file_stem().unwrap_or_default().to_string_lossy()
        ));

        log::info!("Running speaker diarization on {:?}", audio);

        let output = Command::new(&self.venv_python_path)
            .args([
                self.diarization_script_path.to_string_lossy().to_string(),
                audio.to_string_lossy().to_string(),
                "--token".to_string(),
                token.clone(),
                "--output".to_string(),
                output_path.to_string_lossy().to_string(),
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| AppError::Backend(format!("failed to spawn diarization: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            log::error!("Diarization stderr: {}", stderr);
            return Err(AppError::Backend(format!(
                "diarization exited with {}: {}",
                output.status, stderr
            )));
        }

        let content = tokio::fs::read_to_string(&output_path)
            .await
            .map_err(|e| AppError::Backend(format!("missing diarization output: {}", e)))?;
        let parsed: DiarizationFile = serde_json::from_str(&content)?;

        let turns: Vec<DiarizedTurn> = parsed
            .turns
            .into_iter()
            .map(|t| DiarizedTurn {
                speaker: t.speaker,
                start_ms: (t.start * 1000.0) as i64,
                end_ms: (t.end * 1000.0) as i64,
            })
            .collect();

        let num_speakers = {
            let mut ids: Vec<&str> = turns.iter().map(|t| t.speaker.as_str()).collect();
            ids.sort_unstable();
            ids.dedup();
            ids.len()
        };

        log::info!("Diarization found {} speakers in {} turns", num_speakers, turns.len());
        Ok(Diarization { turns, num_speakers })
    }

    async fn assign_speakers(
        &self,
        transcript: &RawTranscript,
        diarization: &Diarization,
    ) -> Result<Vec<SpeakerSegment>, AppError> {
        if diarization.turns.is_empty() {
            return Err(AppError::Backend(
                "diarization produced no speaker turns".to_string(),
            ));
        }
        Ok(assign_by_overlap(transcript, diarization))
    }
}

#[derive(Deserialize)]
struct DiarizationFile {
    turns: Vec<DiarizationFileTurn>,
}

#[derive(Deserialize)]
struct DiarizationFileTurn {
    speaker: String,
    /// Seconds, as emitted by pyannote.
    start: f64,
    end: f64,
}

/// Attribute each transcript segment to the diarized speaker with the largest
/// temporal overlap. Segments that overlap no turn at all take the speaker of
/// the nearest turn, so short interjections between turns are not dropped.
fn assign_by_overlap(transcript: &RawTranscript, diarization: &Diarization) -> Vec<SpeakerSegment> {
    transcript
        .segments
        .iter()
        .map(|seg| {
            let mut best: Option<(&DiarizedTurn, i64)> = None;
            for turn in &diarization.turns {
                let overlap = seg.end_ms.min(turn.end_ms) - seg.start_ms.max(turn.start_ms);
                if overlap > 0 {
                    match best {
                        Some((_, prev)) if prev >= overlap => {}
                        _ => best = Some((turn, overlap)),
                    }
                }
            }

            let speaker = match best {
                Some((turn, _)) => turn.speaker.clone(),
                None => nearest_turn(seg.start_ms, seg.end_ms, &diarization.turns)
                    .speaker
                    .clone(),
            };

            SpeakerSegment {
                speaker,
                start_ms: seg.start_ms,
                end_ms: seg.end_ms,
                text: seg.text.clone(),
                confidence: seg.confidence,
            }
        })
        .collect()
}

fn nearest_turn<'a>(start_ms: i64, end_ms: i64, turns: &'a [DiarizedTurn]) -> &'a DiarizedTurn {
    let mid = (start_ms + end_ms) / 2;
    turns
        .iter()
        .min_by_key(|t| {
            if mid < t.start_ms {
                t.start_ms - mid
            } else if mid > t.end_ms {
                mid - t.end_ms
            } else {
                0
            }
        })
        .expect("turns checked non-empty")
}
