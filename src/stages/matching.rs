use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use super::{Diarization, SpeakerMatch, SpeakerMatcher};
use crate::config::Settings;
use crate::error::AppError;

/// Voice-library matching: embed each diarized speaker's longest turn via a
/// venv script and compare against known voice prints by cosine similarity.
/// The library is read-only from the pipeline's perspective.
pub struct EmbeddingMatcher {
    venv_python_path: PathBuf,
    embedding_script_path: PathBuf,
    voice_library_path: PathBuf,
    /// Global similarity cutoff; a best match below this is no match.
    match_threshold: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoiceEntry {
    pub voice_id: String,
    #[allow(dead_code)]
    pub name: String,
    pub embedding: Vec<f32>,
}

impl EmbeddingMatcher {
    pub fn new(settings: &Settings) -> Self {
        Self {
            venv_python_path: settings.venv_python_path.clone(),
            embedding_script_path: settings.embedding_script_path.clone(),
            voice_library_path: settings.voice_library_path.clone(),
            match_threshold: settings.match_threshold,
        }
    }

    fn load_library(&self) -> Vec<VoiceEntry> {
        match std::fs::read_to_string(&self.voice_library_path) {
            Ok(content) => match serde_json::from_str::<Vec<VoiceEntry>>(&content) {
                Ok(entries) => entries,
                Err(e) => {
                    log::warn!("Voice library unparseable, matching disabled: {}", e);
                    Vec::new()
                }
            },
            Err(e) => {
                log::warn!(
                    "Voice library not readable at {:?}, matching disabled: {}",
                    self.voice_library_path,
                    e
                );
                Vec::new()
            }
        }
    }

    async fn embed_speaker(
        &self,
        audio: &Path,
        speaker_id: &str,
        diarization: &Diarization,
    ) -> Result<Vec<f32>, AppError> {
        // Embed the speaker's longest turn; short turns give poor prints.
        let turn = diarization
            .turns
            .iter()
            .filter(|t| t.speaker == speaker_id)
            .max_by_key(|t| t.end_ms - t.start_ms)
            .ok_or_else(|| {
                AppError::Backend(format!("no diarized turns for speaker {}", speaker_id))
            })?;

        let output = Command::new(&self.venv_python_path)
            .args([
                self.embedding_script_path.to_string_lossy().to_string(),
                audio.to_string_lossy().to_string(),
                "--start".to_string(),
                format!("{:.3}", turn.start_ms as f64 / 1000.0),
                "--end".to_string(),
                format!("{:.3}", turn.end_ms as f64 / 1000.0),
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| AppError::Backend(format!("failed to spawn embedding: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::Backend(format!(
                "embedding exited with {}: {}",
                output.status, stderr
            )));
        }

        let embedding: Vec<f32> = serde_json::from_slice(&output.stdout)
            .map_err(|e| AppError::Backend(format!("unparseable embedding output: {}", e)))?;
        if embedding.is_empty() {
            return Err(AppError::Backend("empty embedding".to_string()));
        }
        Ok(embedding)
    }
}

#[async_trait]
impl SpeakerMatcher for EmbeddingMatcher {
    async fn match_all(
        &self,
        speaker_ids: &[String],
        audio: &Path,
        diarization: &Diarization,
    ) -> Result<Vec<SpeakerMatch>, AppError> {
        let library = self.load_library();
        if library.is_empty() {
            return Ok(speaker_ids
                .iter()
                .map(|id| SpeakerMatch::unmatched(id))
                .collect());
        }

        let mut matches = Vec::with_capacity(speaker_ids.len());
        for speaker_id in speaker_ids {
            // One speaker failing must not abort the others.
            match self.embed_speaker(audio, speaker_id, diarization).await {
                Ok(embedding) => {
                    let best = best_library_match(&embedding, &library, self.match_threshold);
                    match &best {
                        Some((voice_id, similarity)) => log::info!(
                            "Speaker {} matched voice {} (similarity {:.2})",
                            speaker_id,
                            voice_id,
                            similarity
                        ),
                        None => log::info!("Speaker {} has no library match", speaker_id),
                    }
                    matches.push(SpeakerMatch {
                        speaker_id: speaker_id.clone(),
                        matched_voice_id: best.as_ref().map(|(id, _)| id.clone()),
                        confidence: best.map(|(_, sim)| sim),
                    });
                }
                Err(e) => {
                    log::warn!("Embedding failed for speaker {}: {}", speaker_id, e);
                    matches.push(SpeakerMatch::unmatched(speaker_id));
                }
            }
        }

        Ok(matches)
    }
}

/// Best library entry above the threshold, or `None`.
fn best_library_match(
    embedding: &[f32],
    library: &[VoiceEntry],
    threshold: f64,
) -> Option<(String, f64)> {
    library
        .iter()
        .filter_map(|entry| {
            cosine_similarity(embedding, &entry.embedding)
                .map(|sim| (entry.voice_id.clone(), sim))
        })
        .filter(|(_, sim)| *sim >= threshold)
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a.sqrt() * norm_b.sqrt()))
}
