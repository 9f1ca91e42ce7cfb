//! The current print job descriptor.
//!
//! A thin record consulted by the command engine: which job is running,
//! which file it prints, and whether there is a job at all. External
//! orchestration owns job identity; the adapter only mirrors it.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Idle,
    InProgress,
}

#[derive(Debug, Clone)]
struct JobData {
    job_id: Option<u32>,
    job_state: JobState,
    selected_file_path: Option<String>,
}

/// Shared job record.
pub struct Job {
    inner: Mutex<JobData>,
}

impl Job {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(JobData {
                job_id: None,
                job_state: JobState::Idle,
                selected_file_path: None,
            }),
        })
    }

    pub fn job_state(&self) -> JobState {
        self.lock().job_state
    }

    pub fn job_id(&self) -> Option<u32> {
        self.lock().job_id
    }

    pub fn selected_file_path(&self) -> Option<String> {
        self.lock().selected_file_path.clone()
    }

    /// A new job started printing the given file.
    pub fn job_started(&self, job_id: u32) {
        let mut data = self.lock();
        data.job_id = Some(job_id);
        data.job_state = JobState::InProgress;
    }

    pub fn set_file_path(&self, path: impl Into<String>) {
        self.lock().selected_file_path = Some(path.into());
    }

    /// The job ended one way or another; the descriptor empties.
    pub fn job_ended(&self) {
        let mut data = self.lock();
        data.job_id = None;
        data.job_state = JobState::Idle;
        data.selected_file_path = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JobData> {
        self.inner.lock().expect("job record poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_lifecycle() {
        let job = Job::new();
        assert_eq!(job.job_state(), JobState::Idle);
        assert_eq!(job.job_id(), None);

        job.job_started(7);
        job.set_file_path("/SD Card/benchy boat.gcode");
        assert_eq!(job.job_state(), JobState::InProgress);
        assert_eq!(job.job_id(), Some(7));
        assert_eq!(
            job.selected_file_path().as_deref(),
            Some("/SD Card/benchy boat.gcode")
        );

        job.job_ended();
        assert_eq!(job.job_state(), JobState::Idle);
        assert_eq!(job.selected_file_path(), None);
    }
}
