//! Registros de progreso de los trabajos de playlist, consultados por los
//! clientes.
//!
//! Los trabajos solo viven en memoria. Los terminados se conservan durante una
//! ventana de retención para que el cliente vea el estado final; después
//! [`ProgressTracker::prune`] los descarta y sus ids pasan a reportar
//! [`JobState::Unknown`].

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::{to_chrono, Clock};
use crate::types::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    Completed,
    FailedPartial,
    Failed,
    /// Nunca existió, o ya fue descartado
    Unknown,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::FailedPartial | JobState::Failed)
    }

    /// Estado final para `succeeded` de `total` items procesados.
    pub fn from_counts(succeeded: usize, total: usize) -> Self {
        if succeeded == 0 {
            JobState::Failed
        } else if succeeded >= total {
            JobState::Completed
        } else {
            JobState::FailedPartial
        }
    }
}

#[derive(Debug, Clone)]
struct DownloadJob {
    total_items: usize,
    completed_items: usize,
    failed_items: usize,
    current_item_label: Option<String>,
    started_at: DateTime<Utc>,
    last_updated_at: DateTime<Utc>,
    estimated_completion_at: Option<DateTime<Utc>>,
    state: JobState,
    errors: Vec<String>,
}

/// Lo que ve un cliente al consultar.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub job_id: JobId,
    pub state: JobState,
    pub progress_percent: f64,
    pub current_label: Option<String>,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
    pub estimated_completion_at: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
}

impl ProgressSnapshot {
    fn unknown(job_id: &JobId) -> Self {
        Self {
            job_id: job_id.clone(),
            state: JobState::Unknown,
            progress_percent: 0.0,
            current_label: None,
            completed: 0,
            failed: 0,
            total: 0,
            estimated_completion_at: None,
            errors: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct ProgressTracker {
    jobs: DashMap<JobId, DownloadJob>,
    clock: Arc<dyn Clock>,
}

impl ProgressTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: DashMap::new(),
            clock,
        }
    }

    pub fn create_job(&self, total_items: usize) -> JobId {
        let now = self.clock.now();
        let id = JobId::generate();
        self.jobs.insert(
            id.clone(),
            DownloadJob {
                total_items,
                completed_items: 0,
                failed_items: 0,
                current_item_label: None,
                started_at: now,
                last_updated_at: now,
                estimated_completion_at: None,
                state: JobState::Running,
                errors: Vec::new(),
            },
        );
        info!("📋 Trabajo {} creado con {} items", id, total_items);
        id
    }

    /// Registra un item exitoso. Devuelve false para trabajos desconocidos o terminados.
    pub fn advance(&self, job_id: &JobId, item_label: &str) -> bool {
        let now = self.clock.now();
        let Some(mut job) = self.jobs.get_mut(job_id) else {
            return false;
        };
        if job.state.is_terminal() {
            return false;
        }

        job.completed_items = (job.completed_items + 1).min(job.total_items);
        job.current_item_label = Some(item_label.to_string());
        job.last_updated_at = now;
        job.estimated_completion_at = estimate(&job, now);
        debug!(
            "📈 Trabajo {}: {}/{} ({})",
            job_id, job.completed_items, job.total_items, item_label
        );
        true
    }

    /// Registra un item fallido. El trabajo sigue corriendo.
    pub fn fail_item(&self, job_id: &JobId, item_label: &str, error: &str) {
        let now = self.clock.now();
        let Some(mut job) = self.jobs.get_mut(job_id) else {
            return;
        };
        if job.state.is_terminal() {
            return;
        }

        warn!("⚠️ Trabajo {}: el item '{}' falló: {}", job_id, item_label, error);
        job.failed_items += 1;
        job.current_item_label = Some(item_label.to_string());
        job.errors.push(format!("{item_label}: {error}"));
        job.last_updated_at = now;
        job.estimated_completion_at = estimate(&job, now);
    }

    /// Lleva el trabajo a su estado final. Un trabajo ya terminado conserva su
    /// primer estado final.
    pub fn finalize(&self, job_id: &JobId, succeeded: usize, total: usize) -> JobState {
        let now = self.clock.now();
        let Some(mut job) = self.jobs.get_mut(job_id) else {
            return JobState::Unknown;
        };
        if job.state.is_terminal() {
            return job.state;
        }

        job.state = JobState::from_counts(succeeded.min(total), total);
        job.last_updated_at = now;
        job.estimated_completion_at = Some(now);
        info!(
            "🏁 Trabajo {} terminado como {:?} ({}/{} exitosos)",
            job_id, job.state, succeeded, total
        );
        job.state
    }

    pub fn get_status(&self, job_id: &JobId) -> ProgressSnapshot {
        let Some(job) = self.jobs.get(job_id) else {
            return ProgressSnapshot::unknown(job_id);
        };

        let processed = job.completed_items + job.failed_items;
        let progress_percent = if job.state.is_terminal() || job.total_items == 0 {
            100.0
        } else {
            (processed.min(job.total_items) as f64 / job.total_items as f64) * 100.0
        };

        ProgressSnapshot {
            job_id: job_id.clone(),
            state: job.state,
            progress_percent,
            current_label: job.current_item_label.clone(),
            completed: job.completed_items,
            failed: job.failed_items,
            total: job.total_items,
            estimated_completion_at: job.estimated_completion_at,
            errors: job.errors.clone(),
        }
    }

    /// Descarta los trabajos terminados sin cambios desde hace más de `retention`.
    pub fn prune(&self, retention: Duration) -> usize {
        let cutoff = self.clock.now() - to_chrono(retention);
        let before = self.jobs.len();
        self.jobs
            .retain(|_, job| !(job.state.is_terminal() && job.last_updated_at <= cutoff));
        let pruned = before.saturating_sub(self.jobs.len());
        if pruned > 0 {
            debug!("🧹 {} trabajos terminados descartados", pruned);
        }
        pruned
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Extrapolación lineal: si `processed` items tardaron `elapsed`, todos
/// tardan `elapsed * total / processed`.
fn estimate(job: &DownloadJob, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let processed = (job.completed_items + job.failed_items) as i64;
    if processed == 0 {
        return None;
    }
    let elapsed_ms = (now - job.started_at).num_milliseconds().max(0);
    let total_ms = elapsed_ms.saturating_mul(job.total_items as i64) / processed;
    Some(job.started_at + chrono::Duration::milliseconds(total_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use pretty_assertions::assert_eq;

    fn tracker() -> (Arc<ManualClock>, ProgressTracker) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (clock.clone(), ProgressTracker::new(clock))
    }

    #[test]
    fn terminal_state_follows_success_counts() {
        assert_eq!(JobState::from_counts(7, 10), JobState::FailedPartial);
        assert_eq!(JobState::from_counts(0, 5), JobState::Failed);
        assert_eq!(JobState::from_counts(4, 4), JobState::Completed);
    }

    #[test]
    fn advance_updates_label_and_eta() {
        let (clock, tracker) = tracker();
        let job = tracker.create_job(4);
        let started = clock.now();

        clock.advance(Duration::from_secs(10));
        assert!(tracker.advance(&job, "first"));

        let status = tracker.get_status(&job);
        assert_eq!(status.state, JobState::Running);
        assert_eq!(status.completed, 1);
        assert_eq!(status.progress_percent, 25.0);
        assert_eq!(status.current_label.as_deref(), Some("first"));
        assert_eq!(
            status.estimated_completion_at,
            Some(started + chrono::Duration::seconds(40))
        );
    }

    #[test]
    fn completed_never_exceeds_total() {
        let (_, tracker) = tracker();
        let job = tracker.create_job(1);
        tracker.advance(&job, "a");
        tracker.advance(&job, "b");
        assert_eq!(tracker.get_status(&job).completed, 1);
    }

    #[test]
    fn terminal_states_are_monotonic() {
        let (_, tracker) = tracker();
        let job = tracker.create_job(3);
        tracker.advance(&job, "a");
        tracker.fail_item(&job, "b", "video unavailable");
        assert_eq!(tracker.finalize(&job, 1, 3), JobState::FailedPartial);

        assert!(!tracker.advance(&job, "c"));
        assert_eq!(tracker.finalize(&job, 3, 3), JobState::FailedPartial);

        let status = tracker.get_status(&job);
        assert_eq!(status.completed, 1);
        assert_eq!(status.failed, 1);
        assert_eq!(status.errors, vec!["b: video unavailable".to_string()]);
    }

    #[test]
    fn unknown_and_pruned_jobs_report_unknown() {
        let (clock, tracker) = tracker();
        let missing = JobId("job-missing".into());
        assert_eq!(tracker.get_status(&missing).state, JobState::Unknown);
        assert_eq!(tracker.finalize(&missing, 1, 1), JobState::Unknown);

        let running = tracker.create_job(2);
        let done = tracker.create_job(1);
        tracker.advance(&done, "only");
        tracker.finalize(&done, 1, 1);

        clock.advance(Duration::from_secs(3600));
        assert_eq!(tracker.prune(Duration::from_secs(1800)), 1);
        assert_eq!(tracker.get_status(&done).state, JobState::Unknown);
        assert_eq!(tracker.get_status(&running).state, JobState::Running);
    }
}
