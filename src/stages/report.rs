use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

use super::Reporter;
use crate::config::Settings;
use crate::error::AppError;
use crate::store::{Analysis, Job, Speaker, SpeakerSegment};

/// Report generation. JSON and Markdown are written directly; PDF is
/// rendered from the Markdown via pandoc and treated as best-effort by the
/// orchestrator.
pub struct ReportWriter {
    reports_dir: PathBuf,
}

impl ReportWriter {
    pub fn new(settings: &Settings) -> Self {
        Self {
            reports_dir: settings.reports_dir(),
        }
    }

    pub fn with_dir(reports_dir: PathBuf) -> Self {
        Self { reports_dir }
    }

    fn markdown_path(&self, job_id: &str) -> PathBuf {
        self.reports_dir.join(format!("{}.md", job_id))
    }
}

/// Structured report payload. Mirrors the job record but frozen at report
/// time so the file stands alone.
#[derive(Serialize)]
struct JsonReport<'a> {
    job_id: &'a str,
    title: &'a str,
    recording_type: String,
    generated_at: String,
    duration_seconds: Option<f64>,
    analysis: &'a Analysis,
    speakers: &'a [Speaker],
    segments: &'a [SpeakerSegment],
}

#[async_trait]
impl Reporter for ReportWriter {
    async fn generate_json(&self, job: &Job, analysis: &Analysis) -> Result<PathBuf, AppError> {
        tokio::fs::create_dir_all(&self.reports_dir).await?;
        let path = self.reports_dir.join(format!("{}.json", job.id));

        let report = JsonReport {
            job_id: &job.id,
            title: &job.title,
            recording_type: job.recording_type.to_string(),
            generated_at: chrono::Utc::now().to_rfc3339(),
            duration_seconds: job.duration_seconds,
            analysis,
            speakers: &job.speakers,
            segments: &job.segments,
        };

        let payload = serde_json::to_vec_pretty(&report)
            .map_err(|e| AppError::Report(format!("serializing JSON report: {}", e)))?;
        tokio::fs::write(&path, payload)
            .await
            .map_err(|e| AppError::Report(format!("writing JSON report: {}", e)))?;

        log::info!("JSON report written to {:?}", path);
        Ok(path)
    }

    async fn generate_markdown(&self, job: &Job, analysis: &Analysis) -> Result<PathBuf, AppError> {
        tokio::fs::create_dir_all(&self.reports_dir).await?;
        let path = self.markdown_path(&job.id);

        let content = render_markdown(job, analysis);
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| AppError::Report(format!("writing Markdown report: {}", e)))?;

        log::info!("Markdown report written to {:?}", path);
        Ok(path)
    }

    async fn generate_pdf(&self, job: &Job, _analysis: &Analysis) -> Result<PathBuf, AppError> {
        let md_path = self.markdown_path(&job.id);
        if !md_path.exists() {
            return Err(AppError::Backend(
                "markdown report must be generated before pdf".to_string(),
            ));
        }
        let pdf_path = self.reports_dir.join(format!("{}.pdf", job.id));

        let output = Command::new("pandoc")
            .args([
                md_path.to_string_lossy().to_string(),
                "-o".to_string(),
                pdf_path.to_string_lossy().to_string(),
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| AppError::Backend(format!("failed to spawn pandoc: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::Backend(format!(
                "pandoc exited with {}: {}",
                output.status, stderr
            )));
        }

        log::info!("PDF report written to {:?}", pdf_path);
        Ok(pdf_path)
    }
}

fn render_markdown(job: &Job, analysis: &Analysis) -> String {
    let mut md = String::new();

    md.push_str(&format!("# {}\n\n", job.title));
    md.push_str(&format!(
        "- **Type:** {}\n- **Duration:** {}\n- **Language:** {}\n\n",
        job.recording_type, analysis.duration_formatted, job.language
    ));

    md.push_str("## Summary\n\n");
    md.push_str(&analysis.summary);
    md.push_str("\n\n");

    if !analysis.action_items.is_empty() {
        md.push_str("## Action Items\n\n");
        for item in &analysis.action_items {
            let mut line = format!("- [ ] {}", item.text);
            if let Some(owner) = &item.owner {
                line.push_str(&format!(" (owner: {})", owner));
            }
            if let Some(due) = &item.due_hint {
                line.push_str(&format!(" (due: {})", due));
            }
            md.push_str(&line);
            md.push('\n');
        }
        md.push('\n');
    }

    if !analysis.key_decisions.is_empty() {
        md.push_str("## Key Decisions\n\n");
        for decision in &analysis.key_decisions {
            md.push_str(&format!("- {}\n", decision));
        }
        md.push('\n');
    }

    if !analysis.open_questions.is_empty() {
        md.push_str("## Open Questions\n\n");
        for question in &analysis.open_questions {
            md.push_str(&format!("- {}\n", question));
        }
        md.push('\n');
    }

    if !analysis.topics.is_empty() {
        md.push_str(&format!("**Topics:** {}\n\n", analysis.topics.join(", ")));
    }
    md.push_str(&format!("**Sentiment:** {}\n\n", analysis.sentiment));

    if !job.speakers.is_empty() {
        md.push_str("## Speakers\n\n");
        for speaker in &job.speakers {
            let name = speaker.label.as_deref().unwrap_or(&speaker.id);
            md.push_str(&format!(
                "- **{}**: {} segments, {} of talk time\n",
                name,
                speaker.segment_count,
                super::analyze::format_duration(speaker.talk_time_ms as f64 / 1000.0)
            ));
        }
        md.push('\n');
    }

    if !job.segments.is_empty() {
        md.push_str("## Transcript\n\n");
        for seg in &job.segments {
            let name = job
                .speakers
                .iter()
                .find(|s| s.id == seg.speaker)
                .and_then(|s| s.label.as_deref())
                .unwrap_or(&seg.speaker);
            md.push_str(&format!(
                "**[{}] {}:** {}\n\n",
                format_timestamp(seg.start_ms),
                name,
                seg.text
            ));
        }
    }

    md
}

fn format_timestamp(ms: i64) -> String {
    let total = ms / 1000;
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}
