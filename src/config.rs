use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::AppError;

/// Which LLM backend the analyzer talks to. Selected once at construction;
/// the heuristic fallback is always available regardless of backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProviderKind {
    Ollama,
    OpenAi,
}

impl Default for LlmProviderKind {
    fn default() -> Self {
        Self::Ollama
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub provider: LlmProviderKind,
    pub base_url: String,
    pub model: String,
    /// API key for hosted providers. Overridable via MEETSCRIBE_LLM_API_KEY.
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: LlmProviderKind::Ollama,
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.2:3b".to_string(),
            api_key: None,
            request_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root for uploads, clips, reports and the job database.
    pub data_dir: PathBuf,
    pub whisper_cli_path: PathBuf,
    pub models_path: PathBuf,
    pub transcription_model: String,
    pub venv_python_path: PathBuf,
    pub align_script_path: PathBuf,
    pub diarization_script_path: PathBuf,
    pub embedding_script_path: PathBuf,
    pub voice_library_path: PathBuf,
    /// Overridable via HF_TOKEN. Diarization degrades to single-speaker
    /// mode when absent.
    pub huggingface_token: Option<String>,
    /// Global similarity cutoff for voice-library matching.
    pub match_threshold: f64,
    /// Shortest speaker turn worth extracting a clip from.
    pub min_clip_seconds: f64,
    pub max_upload_bytes: i64,
    pub allowed_extensions: Vec<String>,
    /// Pipeline instances allowed to run stages concurrently, process-wide.
    pub max_concurrent_jobs: usize,
    pub llm: LlmSettings,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("meetscribe");
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            data_dir: data_dir.clone(),
            whisper_cli_path: home.join("bin/whisper-cpp/whisper.cpp/build/bin/whisper-cli"),
            models_path: home.join("bin/whisper-cpp/whisper.cpp/models"),
            transcription_model: "large-v3".to_string(),
            venv_python_path: data_dir.join("venv/bin/python"),
            align_script_path: data_dir.join("scripts/align_transcript.py"),
            diarization_script_path: data_dir.join("scripts/speaker_diarization.py"),
            embedding_script_path: data_dir.join("scripts/speaker_embedding.py"),
            voice_library_path: data_dir.join("voice_library.json"),
            huggingface_token: None,
            match_threshold: 0.8,
            min_clip_seconds: 3.0,
            max_upload_bytes: 500 * 1024 * 1024,
            allowed_extensions: vec![
                "wav".to_string(),
                "mp3".to_string(),
                "m4a".to_string(),
                "flac".to_string(),
                "ogg".to_string(),
            ],
            max_concurrent_jobs: 2,
            llm: LlmSettings::default(),
        }
    }
}

impl Settings {
    /// Load from a YAML file, then apply environment overrides for secrets.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Configuration(format!("cannot read {:?}: {}", path, e)))?;
        let mut settings: Settings = serde_yaml::from_str(&content)
            .map_err(|e| AppError::Configuration(format!("invalid config {:?}: {}", path, e)))?;
        settings.apply_env_overrides();
        Ok(settings)
    }

    /// Defaults plus environment overrides, for hosts without a config file.
    pub fn from_env() -> Self {
        let mut settings = Settings::default();
        settings.apply_env_overrides();
        settings
    }

    fn apply_env_overrides(&mut self) {
        if let Some(token) = read_env("HF_TOKEN").or_else(|| read_env("HUGGINGFACE_TOKEN")) {
            if token.starts_with("hf_") {
                log::info!("HuggingFace token loaded from environment");
                self.huggingface_token = Some(token);
            }
        }
        if let Some(key) = read_env("MEETSCRIBE_LLM_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Some(dir) = read_env("MEETSCRIBE_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    pub fn clips_dir(&self) -> PathBuf {
        self.data_dir.join("clips")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.data_dir.join("reports")
    }

    pub fn transcripts_dir(&self) -> PathBuf {
        self.data_dir.join("transcripts")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("meetscribe.db")
    }

    pub fn model_path(&self) -> PathBuf {
        self.models_path
            .join(format!("ggml-{}.bin", self.transcription_model))
    }

    /// Create the working directories this service writes to.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.uploads_dir())?;
        std::fs::create_dir_all(self.clips_dir())?;
        std::fs::create_dir_all(self.reports_dir())?;
        std::fs::create_dir_all(self.transcripts_dir())?;
        Ok(())
    }
}

fn read_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
