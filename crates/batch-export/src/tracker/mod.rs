//! Launching export jobs and tracking their executions.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Local, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{BatchConfig, OutputConfig};
use crate::error::Result;
use crate::pipeline::{run_export, JobResult, PipelineConfig};
use crate::query::{QueryBuilder, QuerySpec};
use crate::source::PageSource;
use crate::state::{BatchStatus, ExecutionStore, ExitStatus, JobExecution, JobListener, JobParameters};
use crate::writer::{prepare_target, FieldExtractor, OutputTarget};

/// Owns every job execution record and the runs behind them.
///
/// `launch` validates the request, records the execution, moves it to
/// STARTED and hands the run to a background task. Callers observe the
/// outcome through `status`.
pub struct JobTracker {
    source: Arc<dyn PageSource>,
    queries: QueryBuilder,
    output: OutputConfig,
    extractor: FieldExtractor,
    page_size: usize,
    pipeline: PipelineConfig,
    store: Arc<ExecutionStore>,
    listeners: Vec<Arc<dyn JobListener>>,
    running: Mutex<HashMap<u64, CancellationToken>>,
}

impl JobTracker {
    /// Build a tracker. Fails if the base query cannot be split.
    pub fn new(
        config: &BatchConfig,
        source: Arc<dyn PageSource>,
        store: Arc<ExecutionStore>,
    ) -> Result<Self> {
        let queries = QueryBuilder::new(
            &config.base_query,
            config.default_where_clause.clone(),
            config.sort_key.clone(),
        )?;

        Ok(Self {
            source,
            queries,
            output: config.output.clone(),
            extractor: FieldExtractor::new(config.fields.clone()),
            page_size: config.page_size,
            pipeline: PipelineConfig::new(config.chunk_size),
            store,
            listeners: Vec::new(),
            running: Mutex::new(HashMap::new()),
        })
    }

    /// Subscribe a listener to job transitions.
    pub fn with_listener(mut self, listener: Arc<dyn JobListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Launch a job and return its record once it is STARTED.
    ///
    /// Configuration failures (bad filename, uncreatable directory,
    /// unwritable file) are returned here and no record is created.
    pub async fn launch(
        self: &Arc<Self>,
        where_clause: Option<&str>,
        filename: Option<&str>,
    ) -> Result<JobExecution> {
        let (started, _handle) = self.start(where_clause, filename).await?;
        Ok(started)
    }

    /// Launch a job and wait for it to reach a terminal status.
    pub async fn launch_and_wait(
        self: &Arc<Self>,
        where_clause: Option<&str>,
        filename: Option<&str>,
    ) -> Result<JobExecution> {
        let (started, handle) = self.start(where_clause, filename).await?;
        if let Err(e) = handle.await {
            error!("Job {} task ended abnormally: {}", started.job_id, e);
        }
        Ok(self.status(started.job_id).await.unwrap_or(started))
    }

    /// Current record for `job_id`, or `None` if no such job exists.
    pub async fn status(&self, job_id: u64) -> Option<JobExecution> {
        self.store.get(job_id).await
    }

    /// Request a running job to stop at its next chunk boundary.
    ///
    /// Returns `false` for unknown or already finished jobs.
    pub async fn stop(&self, job_id: u64) -> bool {
        let token = self.running.lock().await.get(&job_id).cloned();
        match token {
            Some(token) => {
                info!("Stop requested for job {}", job_id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Every execution record, oldest first.
    pub async fn executions(&self) -> Vec<JobExecution> {
        self.store.list().await
    }

    async fn start(
        self: &Arc<Self>,
        where_clause: Option<&str>,
        filename: Option<&str>,
    ) -> Result<(JobExecution, JoinHandle<()>)> {
        let query = self.queries.resolve(where_clause);
        let target = OutputTarget::resolve(&self.output, filename, Local::now())?;
        let path = prepare_target(&target).await?;

        let parameters = JobParameters {
            run_id: format!("{}-{}", Utc::now().to_rfc3339(), Uuid::new_v4()),
            where_clause: where_clause.unwrap_or_default().to_string(),
            filename: filename.unwrap_or_default().to_string(),
            resolved_where_clause: query.where_clause.clone(),
            output_path: path.display().to_string(),
        };

        let created = self.store.create(parameters).await;
        let job_id = created.job_id;
        info!("Job {} query: {}", job_id, query.full_sql());

        let started = self
            .store
            .transition(job_id, BatchStatus::Started, |_| {})
            .await?
            .unwrap_or(created);

        let cancel = CancellationToken::new();
        self.running.lock().await.insert(job_id, cancel.clone());

        for listener in &self.listeners {
            listener.before_job(&started);
        }

        let tracker = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tracker.execute(job_id, query, target, cancel).await;
        });

        Ok((started, handle))
    }

    async fn execute(
        &self,
        job_id: u64,
        query: QuerySpec,
        target: OutputTarget,
        cancel: CancellationToken,
    ) {
        let outcome = run_export(
            Arc::clone(&self.source),
            query,
            &target,
            self.extractor.clone(),
            self.page_size,
            self.pipeline.clone(),
            &cancel,
        )
        .await;

        self.finish(job_id, outcome).await;
    }

    async fn finish(&self, job_id: u64, outcome: Result<JobResult>) {
        self.running.lock().await.remove(&job_id);

        let (status, exit_status, rows_written, causes) = match outcome {
            Ok(result) if result.is_success() => (
                BatchStatus::Completed,
                ExitStatus::completed(),
                result.rows_written,
                Vec::new(),
            ),
            Ok(result) if result.failures.is_empty() => (
                BatchStatus::Stopped,
                ExitStatus::stopped(),
                result.rows_written,
                Vec::new(),
            ),
            Ok(result) => (
                BatchStatus::Failed,
                ExitStatus::failed(result.failure_description()),
                result.rows_written,
                result.failures,
            ),
            Err(e) => (
                BatchStatus::Failed,
                ExitStatus::failed(e.to_string()),
                0,
                vec![e.to_string()],
            ),
        };

        let finished = self
            .store
            .transition(job_id, status, move |record| {
                record.exit_status = exit_status;
                record.rows_written = rows_written;
                record.failure_causes = causes;
            })
            .await;

        match finished {
            Ok(Some(record)) => {
                for listener in &self.listeners {
                    listener.after_job(&record);
                }
            }
            Ok(None) => warn!("Job {} disappeared before it finished", job_id),
            Err(e) => error!("Job {} could not be finalized: {}", job_id, e),
        }
    }
}
