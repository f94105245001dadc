pub mod models;


use anyhow::{bail, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub use models::*;

/// Durable job store. Single `jobs` table with the nested segment/speaker/
/// analysis structures embedded as JSON columns (denormalized, one row per
/// job). Every mutation commits before the call returns so a status poll
/// always sees the latest transition.
pub struct JobStore {
    conn: Arc<Mutex<Connection>>,
}

impl JobStore {
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        // WAL for concurrent readers; FULL sync because the orchestrator
        // relies on every transition being externally visible immediately.
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=FULL;
            PRAGMA cache_size=10000;
            PRAGMA temp_store=MEMORY;
        ",
        )?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        store.init_schema()?;

        Ok(store)
    }

    /// In-memory store for tests and embedding.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                file_name TEXT NOT NULL,
                file_size INTEGER NOT NULL,
                language TEXT NOT NULL DEFAULT 'en',
                recording_type TEXT NOT NULL DEFAULT 'other',
                status TEXT NOT NULL DEFAULT 'queued',
                progress INTEGER NOT NULL DEFAULT 0,
                current_stage TEXT,
                status_note TEXT,
                error TEXT,
                audio_path TEXT,
                duration_seconds REAL,
                segments_json TEXT,
                speakers_json TEXT,
                analysis_json TEXT,
                reports_json TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_type ON jobs(recording_type);
            CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs(created_at DESC);
            "#,
        )?;
        Ok(())
    }

    // ========================================================================
    // CRUD
    // ========================================================================

    pub fn create(&self, new: NewJob) -> Result<Job> {
        let now = Utc::now();
        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            title: new.title,
            file_name: new.file_name,
            file_size: new.file_size,
            language: new.language,
            recording_type: new.recording_type,
            status: JobStatus::Queued,
            progress: 0,
            current_stage: Some("Queued for processing".to_string()),
            status_note: None,
            error: None,
            audio_path: Some(new.audio_path),
            duration_seconds: None,
            segments: Vec::new(),
            speakers: Vec::new(),
            analysis: None,
            reports: ReportPaths::default(),
            created_at: now,
            updated_at: now,
        };

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO jobs (
                id, title, file_name, file_size, language, recording_type,
                status, progress, current_stage, audio_path,
                created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                job.id,
                job.title,
                job.file_name,
                job.file_size,
                job.language,
                job.recording_type.to_string(),
                job.status.to_string(),
                job.progress,
                job.current_stage,
                job.audio_path,
                job.created_at.to_rfc3339(),
                job.updated_at.to_rfc3339(),
            ],
        )?;

        Ok(job)
    }

    pub fn get(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.conn.lock().unwrap();
        let job = conn
            .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], row_to_job)
            .optional()?;
        Ok(job)
    }

    /// Merge partial fields into an existing record and refresh `updated_at`.
    /// Returns `None` (not an error) if the job vanished concurrently.
    pub fn update(&self, id: &str, update: JobUpdate) -> Result<Option<Job>> {
        let conn = self.conn.lock().unwrap();

        let existing = conn
            .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], row_to_job)
            .optional()?;
        let Some(mut job) = existing else {
            return Ok(None);
        };

        if let Some(title) = update.title {
            job.title = title;
        }
        if let Some(note) = update.status_note {
            job.status_note = Some(note);
        }
        if let Some(path) = update.audio_path {
            job.audio_path = Some(path);
        }
        if let Some(dur) = update.duration_seconds {
            job.duration_seconds = Some(dur);
        }
        if let Some(segments) = update.segments {
            job.segments = segments;
        }
        if let Some(speakers) = update.speakers {
            job.speakers = speakers;
        }
        if let Some(analysis) = update.analysis {
            job.analysis = Some(analysis);
        }
        if let Some(reports) = update.reports {
            job.reports = reports;
        }
        job.updated_at = Utc::now();

        let changed = conn.execute(
            "UPDATE jobs SET
                title = ?2, status_note = ?3, audio_path = ?4,
                duration_seconds = ?5, segments_json = ?6, speakers_json = ?7,
                analysis_json = ?8, reports_json = ?9, updated_at = ?10
             WHERE id = ?1",
            params![
                job.id,
                job.title,
                job.status_note,
                job.audio_path,
                job.duration_seconds,
                serde_json::to_string(&job.segments)?,
                serde_json::to_string(&job.speakers)?,
                job.analysis
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                serde_json::to_string(&job.reports)?,
                job.updated_at.to_rfc3339(),
            ],
        )?;

        if changed == 0 {
            return Ok(None);
        }
        Ok(Some(job))
    }

    /// Atomic status transition. Clamps progress monotonic non-decreasing,
    /// except the failure path which forces 100 to signal no pending work.
    /// Refuses to move a job out of a terminal state.
    pub fn set_status(
        &self,
        id: &str,
        status: JobStatus,
        progress: Option<i64>,
        stage: Option<&str>,
        error: Option<&str>,
    ) -> Result<Option<Job>> {
        let conn = self.conn.lock().unwrap();

        let existing = conn
            .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], row_to_job)
            .optional()?;
        let Some(mut job) = existing else {
            return Ok(None);
        };

        if job.status.is_terminal() && status != job.status {
            bail!(
                "job {} is already {} and cannot transition to {}",
                id,
                job.status,
                status
            );
        }

        job.progress = if status == JobStatus::Failed {
            100
        } else {
            progress.unwrap_or(job.progress).clamp(0, 100).max(job.progress)
        };
        job.status = status;
        if let Some(stage) = stage {
            job.current_stage = Some(stage.to_string());
        }
        if let Some(error) = error {
            job.error = Some(error.to_string());
        }
        job.updated_at = Utc::now();

        conn.execute(
            "UPDATE jobs SET
                status = ?2, progress = ?3, current_stage = ?4,
                error = ?5, updated_at = ?6
             WHERE id = ?1",
            params![
                job.id,
                job.status.to_string(),
                job.progress,
                job.current_stage,
                job.error,
                job.updated_at.to_rfc3339(),
            ],
        )?;

        Ok(Some(job))
    }

    pub fn list(&self, filter: &JobFilter) -> Result<(Vec<Job>, i64)> {
        let conn = self.conn.lock().unwrap();

        let mut where_clauses: Vec<String> = Vec::new();
        let mut args: Vec<String> = Vec::new();
        if let Some(status) = filter.status {
            where_clauses.push(format!("status = ?{}", args.len() + 1));
            args.push(status.to_string());
        }
        if let Some(rt) = filter.recording_type {
            where_clauses.push(format!("recording_type = ?{}", args.len() + 1));
            args.push(rt.to_string());
        }
        let where_sql = if where_clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", where_clauses.join(" AND "))
        };

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM jobs {}", where_sql),
            rusqlite::params_from_iter(args.iter()),
            |row| row.get(0),
        )?;

        let limit = if filter.limit > 0 { filter.limit } else { 50 };
        let sql = format!(
            "SELECT * FROM jobs {} ORDER BY created_at DESC LIMIT {} OFFSET {}",
            where_sql,
            limit,
            filter.offset.max(0)
        );
        let mut stmt = conn.prepare(&sql)?;
        let jobs = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), row_to_job)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok((jobs, total))
    }

    /// Returns false if there was nothing to delete.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    // ========================================================================
    // Pipeline result setters
    // ========================================================================

    /// Record a degraded-mode note without touching status or progress, so a
    /// status poll can see that processing continued in a fallback mode.
    pub fn set_status_note(&self, id: &str, note: &str) -> Result<Option<Job>> {
        self.update(
            id,
            JobUpdate {
                status_note: Some(note.to_string()),
                ..Default::default()
            },
        )
    }

    pub fn set_duration(&self, id: &str, duration_seconds: f64) -> Result<Option<Job>> {
        self.update(
            id,
            JobUpdate {
                duration_seconds: Some(duration_seconds),
                ..Default::default()
            },
        )
    }

    pub fn set_segments(&self, id: &str, segments: Vec<SpeakerSegment>) -> Result<Option<Job>> {
        self.update(
            id,
            JobUpdate {
                segments: Some(segments),
                ..Default::default()
            },
        )
    }

    pub fn set_speakers(&self, id: &str, speakers: Vec<Speaker>) -> Result<Option<Job>> {
        self.update(
            id,
            JobUpdate {
                speakers: Some(speakers),
                ..Default::default()
            },
        )
    }

    pub fn set_analysis(&self, id: &str, analysis: Analysis) -> Result<Option<Job>> {
        self.update(
            id,
            JobUpdate {
                analysis: Some(analysis),
                ..Default::default()
            },
        )
    }

    pub fn set_reports(&self, id: &str, reports: ReportPaths) -> Result<Option<Job>> {
        self.update(
            id,
            JobUpdate {
                reports: Some(reports),
                ..Default::default()
            },
        )
    }

    /// Apply human-supplied labels to the job's speakers. A label is written
    /// exactly once; unknown speaker ids and relabeling attempts error
    /// without mutating the record. Read-check-write happens under one lock.
    pub fn apply_speaker_labels(&self, id: &str, labels: &[(String, String)]) -> Result<Option<Job>> {
        let conn = self.conn.lock().unwrap();

        let existing = conn
            .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], row_to_job)
            .optional()?;
        let Some(mut job) = existing else {
            return Ok(None);
        };

        for (speaker_id, label) in labels {
            let Some(speaker) = job.speakers.iter_mut().find(|s| &s.id == speaker_id) else {
                bail!("unknown speaker id '{}' for job {}", speaker_id, id);
            };
            if speaker.label.is_some() {
                bail!("speaker {} on job {} is already labeled", speaker_id, id);
            }
            speaker.label = Some(label.clone());
        }
        job.updated_at = Utc::now();

        conn.execute(
            "UPDATE jobs SET speakers_json = ?2, updated_at = ?3 WHERE id = ?1",
            params![
                job.id,
                serde_json::to_string(&job.speakers)?,
                job.updated_at.to_rfc3339(),
            ],
        )?;

        Ok(Some(job))
    }

    /// Fail any job a previous process left in a running state. Called once
    /// at service startup so a restarted host never shows a phantom
    /// in-flight job.
    pub fn reset_stuck_jobs(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let changed = conn.execute(
            "UPDATE jobs SET
                status = 'failed', progress = 100,
                error = 'Interrupted by process restart',
                current_stage = 'Failed', updated_at = ?1
             WHERE status IN ('transcribing', 'diarizing', 'matching', 'analyzing')",
            params![now],
        )?;
        Ok(changed)
    }
}

fn row_to_job(row: &Row) -> rusqlite::Result<Job> {
    let parse_err = |e: serde_json::Error| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    };
    let time_err = |e: chrono::ParseError| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    };

    let status: String = row.get("status")?;
    let recording_type: String = row.get("recording_type")?;
    let segments_json: Option<String> = row.get("segments_json")?;
    let speakers_json: Option<String> = row.get("speakers_json")?;
    let analysis_json: Option<String> = row.get("analysis_json")?;
    let reports_json: Option<String> = row.get("reports_json")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Job {
        id: row.get("id")?,
        title: row.get("title")?,
        file_name: row.get("file_name")?,
        file_size: row.get("file_size")?,
        language: row.get("language")?,
        recording_type: RecordingType::from(recording_type),
        status: JobStatus::from(status),
        progress: row.get("progress")?,
        current_stage: row.get("current_stage")?,
        status_note: row.get("status_note")?,
        error: row.get("error")?,
        audio_path: row.get("audio_path")?,
        duration_seconds: row.get("duration_seconds")?,
        segments: match segments_json {
            Some(json) => serde_json::from_str(&json).map_err(parse_err)?,
            None => Vec::new(),
        },
        speakers: match speakers_json {
            Some(json) => serde_json::from_str(&json).map_err(parse_err)?,
            None => Vec::new(),
        },
        analysis: match analysis_json {
            Some(json) => Some(serde_json::from_str(&json).map_err(parse_err)?),
            None => None,
        },
        reports: match reports_json {
            Some(json) => serde_json::from_str(&json).map_err(parse_err)?,
            None => ReportPaths::default(),
        },
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map_err(time_err)?
            .with_timezone(&Utc),
        updated_at: chrono::DateTime::parse_from_rfc3339(&updated_at)
            .map_err(time_err)?
            .with_timezone(&Utc),
    })
}
