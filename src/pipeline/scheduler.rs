use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::Orchestrator;
use crate::error::AppError;

/// Owns the background pipeline tasks: one task per job, a counting gate
/// bounding how many run stages concurrently, and a registry preventing the
/// same job from being scheduled twice.
///
/// The gate covers the full pipeline only. The analysis re-entry path is a
/// lighter LLM-bound operation and is deliberately not gated, though it is
/// still registered so duplicate resumes are rejected.
pub struct JobScheduler {
    orchestrator: Arc<Orchestrator>,
    gate: Arc<Semaphore>,
    tasks: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    shutdown: CancellationToken,
}

impl JobScheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, max_concurrent_jobs: usize) -> Self {
        Self {
            orchestrator,
            gate: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Schedule a queued job for full pipeline processing. Rejects a job
    /// that already has a live task.
    pub fn schedule(&self, job_id: &str) -> Result<(), AppError> {
        self.register(job_id, true)
    }

    /// Schedule the analysis-only resume after human labeling.
    pub fn schedule_resume(&self, job_id: &str) -> Result<(), AppError> {
        self.register(job_id, false)
    }

    fn register(&self, job_id: &str, gated: bool) -> Result<(), AppError> {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|_, handle| !handle.is_finished());
        if tasks.contains_key(job_id) {
            return Err(AppError::Validation(format!(
                "job {} is already being processed",
                job_id
            )));
        }

        let orchestrator = self.orchestrator.clone();
        let gate = self.gate.clone();
        let registry = self.tasks.clone();
        let shutdown = self.shutdown.clone();
        let id = job_id.to_string();

        let handle = tokio::spawn(async move {
            // Admission: wait for a pipeline slot unless this is the light
            // resume path. A shutdown while queued abandons the job in its
            // persisted state; reset_stuck_jobs covers the restart.
            let _permit = if gated {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        log::info!("Shutdown before job {} started, leaving it queued", id);
                        registry.lock().unwrap().remove(&id);
                        return;
                    }
                    permit = gate.acquire_owned() => permit.ok(),
                }
            } else {
                None
            };

            // This is the background-task boundary: errors are already
            // recorded on the job, so they end here as a log line.
            let result = if gated {
                orchestrator.run(&id).await
            } else {
                orchestrator.resume_analysis(&id).await
            };
            if let Err(e) = result {
                log::error!("Pipeline task for job {} ended with error: {}", id, e);
            }

            registry.lock().unwrap().remove(&id);
        });

        tasks.insert(job_id.to_string(), handle);
        Ok(())
    }

    /// Job ids with a live pipeline task (running or waiting for a slot).
    pub fn active_jobs(&self) -> Vec<String> {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|_, handle| !handle.is_finished());
        tasks.keys().cloned().collect()
    }

    pub fn is_active(&self, job_id: &str) -> bool {
        let tasks = self.tasks.lock().unwrap();
        tasks
            .get(job_id)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Stop admitting queued jobs. Running stages are never interrupted
    /// mid-flight; they finish their current job.
    pub fn shutdown(&self) {
        log::info!("Job scheduler shutting down");
        self.shutdown.cancel();
    }

    /// Wait for every registered task to finish. Used by tests and by hosts
    /// that want a clean drain before exit.
    pub async fn join_all(&self) {
        loop {
            let handle = {
                let mut tasks = self.tasks.lock().unwrap();
                let key = tasks.keys().next().cloned();
                key.and_then(|k| tasks.remove(&k))
            };
            match handle {
                Some(handle) => {
                    let _ = handle.await;
                }
                None => break,
            }
        }
    }
}
