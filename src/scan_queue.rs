//! Background queue for user context scans.
//!
//! HTTP handlers submit a job and return immediately; a single worker runs
//! jobs in submission order. Every job gets an id whose status can be polled,
//! and a oneshot completion for callers that want to wait.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{extraction::ContextScanner, types::ScanSummary};

const FINISHED_HISTORY_LIMIT: usize = 100;

pub type ScanOutcome = Result<ScanSummary, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanJobState {
    Queued,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanJobStatus {
    pub job_id: String,
    pub user_id: String,
    pub force_scan: bool,
    pub state: ScanJobState,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<ScanSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct ScanTicket {
    pub job_id: String,
    pub completion: oneshot::Receiver<ScanOutcome>,
}

struct ScanJob {
    job_id: String,
    user_id: String,
    force_scan: bool,
    done: oneshot::Sender<ScanOutcome>,
}

#[derive(Default)]
struct JobTable {
    statuses: HashMap<String, ScanJobStatus>,
    finished: VecDeque<String>,
}

impl JobTable {
    fn mark_running(&mut self, job_id: &str) {
        if let Some(status) = self.statuses.get_mut(job_id) {
            status.state = ScanJobState::Running;
            status.started_at = Some(Utc::now());
        }
    }

    fn mark_finished(&mut self, job_id: &str, outcome: &ScanOutcome) {
        if let Some(status) = self.statuses.get_mut(job_id) {
            status.finished_at = Some(Utc::now());
            match outcome {
                Ok(summary) => {
                    status.state = ScanJobState::Completed;
                    status.summary = Some(*summary);
                }
                Err(err) => {
                    status.state = ScanJobState::Failed;
                    status.error = Some(err.clone());
                }
            }
        }
        self.finished.push_back(job_id.to_string());
        while self.finished.len() > FINISHED_HISTORY_LIMIT {
            if let Some(evicted) = self.finished.pop_front() {
                self.statuses.remove(&evicted);
            }
        }
    }
}

#[derive(Clone)]
pub struct ScanQueue {
    sender: Arc<Mutex<Option<mpsc::UnboundedSender<ScanJob>>>>,
    jobs: Arc<Mutex<JobTable>>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ScanQueue {
    /// Spawns the worker on the current tokio runtime.
    pub fn start(scanner: ContextScanner) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<ScanJob>();
        let jobs = Arc::new(Mutex::new(JobTable::default()));
        let worker = tokio::spawn(run_worker(scanner, rx, jobs.clone()));
        Self {
            sender: Arc::new(Mutex::new(Some(tx))),
            jobs,
            worker: Arc::new(Mutex::new(Some(worker))),
        }
    }

    /// Queues a scan. Returns `None` once the queue has been shut down.
    pub async fn submit(&self, user_id: &str, force_scan: bool) -> Option<ScanTicket> {
        let job_id = Uuid::new_v4().to_string();
        let (done, completion) = oneshot::channel();
        let guard = self.sender.lock().await;
        let sender = guard.as_ref()?;

        self.jobs.lock().await.statuses.insert(
            job_id.clone(),
            ScanJobStatus {
                job_id: job_id.clone(),
                user_id: user_id.to_string(),
                force_scan,
                state: ScanJobState::Queued,
                queued_at: Utc::now(),
                started_at: None,
                finished_at: None,
                summary: None,
                error: None,
            },
        );

        let job = ScanJob {
            job_id: job_id.clone(),
            user_id: user_id.to_string(),
            force_scan,
            done,
        };
        if sender.send(job).is_err() {
            self.jobs.lock().await.statuses.remove(&job_id);
            return None;
        }
        Some(ScanTicket { job_id, completion })
    }

    pub async fn status(&self, job_id: &str) -> Option<ScanJobStatus> {
        self.jobs.lock().await.statuses.get(job_id).cloned()
    }

    /// Stops accepting jobs, lets the worker drain what is queued and waits
    /// for it to exit.
    pub async fn shutdown(&self) {
        self.sender.lock().await.take();
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                warn!(error = %err, "scan worker ended abnormally");
            }
        }
    }
}

async fn run_worker(
    scanner: ContextScanner,
    mut rx: mpsc::UnboundedReceiver<ScanJob>,
    jobs: Arc<Mutex<JobTable>>,
) {
    while let Some(job) = rx.recv().await {
        jobs.lock().await.mark_running(&job.job_id);
        info!(
            job_id = %job.job_id,
            user_id = %job.user_id,
            force_scan = job.force_scan,
            "scan job started"
        );

        let outcome = scanner
            .scan_user_chats(&job.user_id, job.force_scan)
            .await
            .map_err(|err| err.to_string());
        match &outcome {
            Ok(summary) => info!(
                job_id = %job.job_id,
                scanned_chats = summary.scanned_chats,
                new_preferences = summary.new_preferences,
                new_facts = summary.new_facts,
                "scan job completed"
            ),
            Err(err) => warn!(job_id = %job.job_id, error = %err, "scan job failed"),
        }

        jobs.lock().await.mark_finished(&job.job_id, &outcome);
        // The submitter may have stopped listening; status stays pollable.
        let _ = job.done.send(outcome);
    }
    info!("scan worker stopped");
}
