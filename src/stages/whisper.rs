use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use super::{RawTranscript, Transcriber, TranscriptSegment};
use crate::config::Settings;
use crate::error::AppError;

/// Transcription via a local whisper-cli binary, with timestamp alignment
/// delegated to a venv python script. Both run as supervised subprocesses so
/// the orchestrator's event loop never blocks on model inference.
pub struct WhisperTranscriber {
    whisper_cli_path: PathBuf,
    model_path: PathBuf,
    venv_python_path: PathBuf,
    align_script_path: PathBuf,
    transcripts_dir: PathBuf,
}

impl WhisperTranscriber {
    pub fn new(settings: &Settings) -> Self {
        Self {
            whisper_cli_path: settings.whisper_cli_path.clone(),
            model_path: settings.model_path(),
            venv_python_path: settings.venv_python_path.clone(),
            align_script_path: settings.align_script_path.clone(),
            transcripts_dir: settings.transcripts_dir(),
        }
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, audio: &Path, language: &str) -> Result<RawTranscript, AppError> {
        if !audio.exists() {
            return Err(AppError::Transcription(format!(
                "audio file not found: {:?}",
                audio
            )));
        }
        if !self.model_path.exists() {
            return Err(AppError::Transcription(format!(
                "model not found: {:?}",
                self.model_path
            )));
        }

        let output_base = self.transcripts_dir.join(
            audio
                .file_stem()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string(),
        );

        log::info!("Running whisper-cli on {:?} (language: {})", audio, language);

        let output = Command::new(&self.whisper_cli_path)
            .args([
                "-m",
                &self.model_path.to_string_lossy(),
                "-f",
                &audio.to_string_lossy(),
                "-l",
                language,
                "-oj",
                "-of",
                &output_base.to_string_lossy(),
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| AppError::Transcription(format!("failed to spawn whisper-cli: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::Transcription(format!(
                "whisper-cli exited with {}: {}",
                output.status, stderr
            )));
        }

        let transcript_path = output_base.with_extension("json");
        let content = tokio::fs::read_to_string(&transcript_path)
            .await
            .map_err(|e| {
                AppError::Transcription(format!(
                    "missing transcript output {:?}: {}",
                    transcript_path, e
                ))
            })?;

        let parsed = parse_whisper_json(&content, language)?;
        log::info!(
            "Transcription produced {} segments ({})",
            parsed.segments.len(),
            parsed.language
        );
        Ok(parsed)
    }

    async fn align(
        &self,
        transcript: &RawTranscript,
        audio: &Path,
    ) -> Result<RawTranscript, AppError> {
        let input_path = self.transcripts_dir.join(format!(
            "{}_align_input.json",
            audio.file_stem().unwrap_or_default().to_string_lossy()
        ));
        let output_path = input_path.with_file_name(format!(
            "{}_aligned.json",
            audio.file_stem().unwrap_or_default().to_string_lossy()
        ));

        tokio::fs::write(&input_path, serde_json::to_vec(transcript)?).await?;

        log::info!("Aligning transcript against {:?}", audio);

        let output = Command::new(&self.venv_python_path)
            .args([
                self.align_script_path.to_string_lossy().to_string(),
                audio.to_string_lossy().to_string(),
                input_path.to_string_lossy().to_string(),
                "--output".to_string(),
                output_path.to_string_lossy().to_string(),
                "--language".to_string(),
                transcript.language.clone(),
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| AppError::Backend(format!("failed to spawn aligner: {}", e)))?;

        // Scratch input is only needed by the subprocess.
        let _ = tokio::fs::remove_file(&input_path).await;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::Backend(format!(
                "alignment exited with {}: {}",
                output.status, stderr
            )));
        }

        let content = tokio::fs::read_to_string(&output_path)
            .await
            .map_err(|e| AppError::Backend(format!("missing aligned output: {}", e)))?;
        let aligned: RawTranscript = serde_json::from_str(&content)?;

        if aligned.segments.is_empty() {
            return Err(AppError::Backend(
                "aligner returned an empty transcript".to_string(),
            ));
        }
        Ok(aligned)
    }
}

// ── whisper-cli JSON output ────────────────────────────────────────────────

#[derive(Deserialize)]
struct WhisperOutput {
    #[serde(default)]
    transcription: Vec<WhisperSegment>,
    #[serde(default)]
    result: Option<WhisperResult>,
}

#[derive(Deserialize)]
struct WhisperResult {
    language: Option<String>,
}

#[derive(Deserialize)]
struct WhisperSegment {
    offsets: WhisperOffsets,
    text: String,
}

#[derive(Deserialize)]
struct WhisperOffsets {
    from: i64,
    to: i64,
}

fn parse_whisper_json(content: &str, declared_language: &str) -> Result<RawTranscript, AppError> {
    let output: WhisperOutput = serde_json::from_str(content)
        .map_err(|e| AppError::Transcription(format!("unparseable whisper output: {}", e)))?;

    let segments: Vec<TranscriptSegment> = output
        .transcription
        .into_iter()
        .filter(|s| !s.text.trim().is_empty())
        .map(|s| TranscriptSegment {
            start_ms: s.offsets.from,
            end_ms: s.offsets.to,
            text: s.text.trim().to_string(),
            confidence: 1.0,
        })
        .collect();

    if segments.is_empty() {
        return Err(AppError::Transcription(
            "no decodable speech in audio".to_string(),
        ));
    }

    let language = output
        .result
        .and_then(|r| r.language)
        .unwrap_or_else(|| declared_language.to_string());

    Ok(RawTranscript { segments, language })
}
