//! Bounded refresh worker pool.
//!
//! All jobs are queued up front and the queue is closed; `workers` tasks
//! drain it and the caller waits for every task to finish.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use cms_core::{Batch, Database, QualifiedName, Statement};

/// Refresh of one (content type, locale) view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshJob {
    pub content_type: String,
    pub locale: String,
    pub view: QualifiedName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshFailure {
    pub job: RefreshJob,
    pub error: String,
}

/// Outcome of a refresh run; every submitted job lands in exactly one list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub refreshed: Vec<RefreshJob>,
    pub failed: Vec<RefreshFailure>,
    pub elapsed_ms: u64,
}

impl RefreshReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.refreshed.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of the refreshed views.
    pub fn refreshed_views(&self) -> Vec<&str> {
        self.refreshed.iter().map(|j| j.view.name.as_str()).collect()
    }
}

enum Outcome {
    Refreshed(RefreshJob),
    Failed(RefreshFailure),
}

/// Runs refresh jobs on at most `workers` concurrent tasks.
pub struct RefreshPool<D: ?Sized> {
    db: Arc<D>,
    workers: usize,
    concurrently: bool,
}

impl<D> RefreshPool<D>
where
    D: Database + ?Sized + 'static,
{
    pub fn new(db: Arc<D>, workers: usize, concurrently: bool) -> Self {
        Self {
            db,
            workers: workers.max(1),
            concurrently,
        }
    }

    pub async fn run(&self, jobs: Vec<RefreshJob>) -> RefreshReport {
        let start = Instant::now();
        let mut report = RefreshReport::default();
        if jobs.is_empty() {
            return report;
        }

        let (tx, rx) = mpsc::channel(jobs.len());
        for job in &jobs {
            // Capacity equals the job count, so this never waits.
            if tx.send(job.clone()).await.is_err() {
                break;
            }
        }
        drop(tx);

        let rx = Arc::new(Mutex::new(rx));
        let worker_count = self.workers.min(jobs.len());
        let mut set = JoinSet::new();
        for worker in 0..worker_count {
            let rx = Arc::clone(&rx);
            let db = Arc::clone(&self.db);
            let concurrently = self.concurrently;
            set.spawn(async move {
                let mut outcomes = Vec::new();
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(job) = next else { break };
                    outcomes.push(refresh_one(db.as_ref(), job, concurrently, worker).await);
                }
                outcomes
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcomes) => {
                    for outcome in outcomes {
                        match outcome {
                            Outcome::Refreshed(job) => report.refreshed.push(job),
                            Outcome::Failed(failure) => report.failed.push(failure),
                        }
                    }
                }
                Err(e) => error!(error = %e, "Refresh worker aborted"),
            }
        }

        // Jobs held by an aborted worker are reported as failed.
        for job in jobs {
            let reported = report.refreshed.contains(&job)
                || report.failed.iter().any(|f| f.job == job);
            if !reported {
                report.failed.push(RefreshFailure {
                    job,
                    error: "refresh worker aborted".to_string(),
                });
            }
        }

        report.elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            workers = worker_count,
            refreshed = report.refreshed.len(),
            failed = report.failed.len(),
            elapsed_ms = report.elapsed_ms,
            "View refresh finished"
        );
        report
    }
}

async fn refresh_one<D>(db: &D, job: RefreshJob, concurrently: bool, worker: usize) -> Outcome
where
    D: Database + ?Sized,
{
    let statement = Statement::RefreshMaterializedView {
        name: job.view.clone(),
        concurrently,
    };
    match db.execute(Batch::from(statement)).await {
        Ok(()) => {
            debug!(worker, view = %job.view, "Refreshed view");
            Outcome::Refreshed(job)
        }
        Err(e) => {
            warn!(worker, view = %job.view, error = %e, "View refresh failed");
            Outcome::Failed(RefreshFailure {
                job,
                error: e.to_string(),
            })
        }
    }
}
