//! Callbacks around job execution transitions.

use tracing::{error, info, warn};

use super::{BatchStatus, JobExecution};

/// Observer of job transitions.
///
/// `before_job` runs once the record is STARTED; `after_job` runs once it is
/// terminal. Both receive a snapshot of the record.
pub trait JobListener: Send + Sync {
    fn before_job(&self, _execution: &JobExecution) {}

    fn after_job(&self, _execution: &JobExecution) {}
}

/// Logs job start with its parameters and the outcome of each job.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl JobListener for LoggingListener {
    fn before_job(&self, execution: &JobExecution) {
        let params = &execution.parameters;
        info!(
            "Job {} started (run.id={}, whereClause='{}', output={})",
            execution.job_id, params.run_id, params.resolved_where_clause, params.output_path
        );
    }

    fn after_job(&self, execution: &JobExecution) {
        match execution.status {
            BatchStatus::Completed => info!(
                "Job {} completed: {} rows written",
                execution.job_id, execution.rows_written
            ),
            BatchStatus::Stopped => warn!(
                "Job {} stopped after {} rows",
                execution.job_id, execution.rows_written
            ),
            status => {
                error!("Job {} finished with status {}", execution.job_id, status);
                for cause in &execution.failure_causes {
                    error!("Job {} failure cause: {}", execution.job_id, cause);
                }
            }
        }
    }
}
