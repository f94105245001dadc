use thiserror::Error;

/// Typed error hierarchy for the transcript pipeline and its service boundary.
///
/// Stage adapters raise the variant that describes what went wrong; the
/// orchestrator decides per stage whether a failure degrades the result or
/// fails the job. Serializes as a plain string so an HTTP layer can forward
/// `error.message` unchanged.
#[derive(Debug, Error)]
pub enum AppError {
    /// Transcription backend failed or the audio was unreadable. Fatal.
    #[error("transcription failed: {0}")]
    Transcription(String),

    /// A required credential or setting is absent (e.g. no HF token).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An external backend (model server, subprocess) was unavailable or
    /// returned a runtime failure.
    #[error("backend error: {0}")]
    Backend(String),

    /// Mandatory report generation failed. Fatal.
    #[error("report generation failed: {0}")]
    Report(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("{0}")]
    Database(String),

    #[error("{0}")]
    Io(String),

    #[error("{0}")]
    Json(String),

    #[error("{0}")]
    Other(String),
}

impl AppError {
    /// True for errors an HTTP layer should map to a 4xx client error.
    pub fn is_client_error(&self) -> bool {
        matches!(self, AppError::NotFound(_) | AppError::Validation(_))
    }
}

/// Serialize as a plain string so callers receive the same `"error message"`
/// string convention the status endpoint exposes.
impl serde::Serialize for AppError {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

// ── From impls ─────────────────────────────────────────────────────────────

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Json(e.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        AppError::Backend(e.to_string())
    }
}

/// Allows `.map_err(|e| format!("…", e))?` and `ok_or_else(|| format!(…))?`
/// to coerce into AppError without changing the call sites.
impl From<String> for AppError {
    fn from(s: String) -> Self {
        AppError::Other(s)
    }
}

/// Allows `.ok_or("literal string")?` to coerce into AppError.
impl From<&str> for AppError {
    fn from(s: &str) -> Self {
        AppError::Other(s.to_string())
    }
}
