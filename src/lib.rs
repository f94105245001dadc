//! meetscribe: a transcript-processing pipeline for uploaded recordings.
//!
//! An upload is transcribed (whisper-cli), diarized (pyannote), matched
//! against a voice library, and analyzed by an LLM into a structured
//! summary with reports. When speakers cannot all be identified
//! automatically, the job suspends so a human can label them before the
//! analysis runs.
//!
//! [`service::TranscriptService`] is the entry point; everything else is
//! plumbing behind it.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod service;
pub mod stages;
pub mod store;

/// Install a console subscriber honoring `RUST_LOG` (defaults to `info`).
/// Hosts embedding the service call this once at startup; calling it twice
/// is a no-op.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

pub use config::Settings;
pub use error::AppError;
pub use service::{ReportFormat, SpeakerLabel, TranscriptService, UploadRequest};
pub use store::{Job, JobFilter, JobStatus, JobStatusView, RecordingType};
