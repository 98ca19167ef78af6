//! Generation job scheduling
//!
//! Each request runs as its own tokio task; a semaphore bounds how many
//! talk to the generation service at once. A job's status lives in a
//! `watch` channel: cancelling a job flips it to `Cancelled`, the task
//! notices at its next suspension point, and any late result is dropped.

use super::client::TextGenerator;
use super::prompt::{build_prompt, parse_story_response, Prompt};
use super::{Draft, GenerationError, GenerationJob, GenerationResult, JobId, JobStatus};
use crate::config::GenerationConfig;
use crate::graph::{ChangeEvent, GraphStore, MutationObserver, NodeId, Snapshot};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

struct JobHandle {
    node: NodeId,
    instruction: String,
    prompt: Prompt,
    created_at: DateTime<Utc>,
    status: watch::Sender<JobStatus>,
    attempts: Arc<AtomicU32>,
}

impl JobHandle {
    fn record(&self, id: JobId) -> GenerationJob {
        GenerationJob {
            id,
            node: self.node,
            instruction: self.instruction.clone(),
            prompt: self.prompt.clone(),
            status: self.status.borrow().clone(),
            attempts: self.attempts.load(Ordering::SeqCst),
            created_at: self.created_at,
        }
    }
}

/// Move a job to `next` unless it already reached a terminal state
fn transition(status: &watch::Sender<JobStatus>, next: JobStatus) -> bool {
    status.send_if_modified(|current| {
        if current.is_terminal() {
            false
        } else {
            *current = next;
            true
        }
    })
}

struct Inner {
    store: Arc<GraphStore>,
    generator: Arc<dyn TextGenerator>,
    config: GenerationConfig,
    permits: Arc<Semaphore>,
    jobs: Mutex<HashMap<JobId, JobHandle>>,
    active: Mutex<HashMap<NodeId, JobId>>,
}

impl Inner {
    fn cancel_job(&self, id: JobId, reason: &str) -> bool {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let Some(handle) = jobs.get(&id) else {
            return false;
        };
        let cancelled = transition(&handle.status, JobStatus::Cancelled);
        if cancelled {
            info!("Cancelled generation job {} for {} ({})", id, handle.node, reason);
        }
        let node = handle.node;
        drop(jobs);

        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.get(&node) == Some(&id) {
            active.remove(&node);
        }
        cancelled
    }

    fn finish(&self, id: JobId, node: NodeId) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.get(&node) == Some(&id) {
            active.remove(&node);
        }
    }
}

impl MutationObserver for Inner {
    fn on_commit(&self, _snapshot: &Snapshot, events: &[ChangeEvent]) {
        for event in events {
            if let ChangeEvent::NodeDeleted { id, .. } = event {
                let job = self
                    .active
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(id)
                    .copied();
                if let Some(job) = job {
                    self.cancel_job(job, "target node deleted");
                }
            }
        }
    }
}

/// Runs generation requests against a graph store
#[derive(Clone)]
pub struct GenerationOrchestrator {
    inner: Arc<Inner>,
}

impl GenerationOrchestrator {
    pub fn new(
        store: Arc<GraphStore>,
        generator: Arc<dyn TextGenerator>,
        config: GenerationConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.worker_pool_size.max(1)));
        let inner = Arc::new(Inner {
            store,
            generator,
            config,
            permits,
            jobs: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
        });
        inner.store.observe(&inner);
        Self { inner }
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.inner.config
    }

    /// Queue a generation job for `node`.
    ///
    /// Any unfinished job for the same node is cancelled and replaced.
    pub fn request(&self, node: NodeId, instruction: impl Into<String>) -> GenerationResult<JobId> {
        let instruction = instruction.into();
        let snapshot = self.inner.store.snapshot();
        if !snapshot.has_node(node) {
            return Err(GenerationError::UnknownNode(node));
        }

        let prompt = build_prompt(
            &snapshot,
            node,
            &instruction,
            self.inner.config.context_window_size,
        );
        let id = JobId::new();
        let (status, status_rx) = watch::channel(JobStatus::Pending);
        let attempts = Arc::new(AtomicU32::new(0));

        self.inner.jobs.lock().unwrap_or_else(|e| e.into_inner()).insert(
            id,
            JobHandle {
                node,
                instruction,
                prompt: prompt.clone(),
                created_at: Utc::now(),
                status,
                attempts: attempts.clone(),
            },
        );

        // Claim the node in one step so concurrent requests always see each other
        let previous = self
            .inner
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(node, id);
        if let Some(previous) = previous {
            self.inner.cancel_job(previous, "superseded");
        }

        // A deletion committed before the claim was not seen by the observer
        if !self.inner.store.snapshot().has_node(node) {
            self.inner.cancel_job(id, "target node deleted");
            self.inner
                .jobs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
            return Err(GenerationError::UnknownNode(node));
        }
        info!("Queued generation job {} for {}", id, node);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            run_job(inner, id, node, prompt, status_rx, attempts).await;
        });
        Ok(id)
    }

    /// Current record of a job
    pub fn poll(&self, id: JobId) -> GenerationResult<GenerationJob> {
        self.inner
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .map(|h| h.record(id))
            .ok_or(GenerationError::JobNotFound(id))
    }

    /// Cancel a job; returns false if it had already finished
    pub fn cancel(&self, id: JobId) -> GenerationResult<bool> {
        if !self
            .inner
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&id)
        {
            return Err(GenerationError::JobNotFound(id));
        }
        Ok(self.inner.cancel_job(id, "cancelled by caller"))
    }

    /// Resolve once the job reaches a terminal state
    pub async fn wait(&self, id: JobId) -> GenerationResult<GenerationJob> {
        let mut rx = self
            .inner
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .map(|h| h.status.subscribe())
            .ok_or(GenerationError::JobNotFound(id))?;

        // The sender lives in the job table, so the channel cannot close
        let _ = rx.wait_for(JobStatus::is_terminal).await;
        self.poll(id)
    }

    /// All jobs, oldest first
    pub fn jobs(&self) -> Vec<GenerationJob> {
        let jobs = self.inner.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let mut records: Vec<GenerationJob> = jobs.iter().map(|(id, h)| h.record(*id)).collect();
        records.sort_by_key(|j| j.created_at);
        records
    }

    /// Forget finished jobs; returns how many were dropped
    pub fn prune_finished(&self) -> usize {
        let mut jobs = self.inner.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let before = jobs.len();
        jobs.retain(|_, h| !h.status.borrow().is_terminal());
        before - jobs.len()
    }
}

async fn run_job(
    inner: Arc<Inner>,
    id: JobId,
    node: NodeId,
    prompt: Prompt,
    status_rx: watch::Receiver<JobStatus>,
    attempts: Arc<AtomicU32>,
) {
    let mut cancel_rx = status_rx.clone();
    let cancelled = async move {
        let _ = cancel_rx.wait_for(|s| matches!(s, JobStatus::Cancelled)).await;
    };

    let work = async {
        let _permit = inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| GenerationError::Transient(e.to_string()))?;

        let sender = {
            let jobs = inner.jobs.lock().unwrap_or_else(|e| e.into_inner());
            jobs.get(&id).map(|h| h.status.clone())
        };
        if let Some(sender) = sender {
            if !transition(&sender, JobStatus::Running) {
                return Err(GenerationError::Cancelled);
            }
        }
        debug!("Generation job {} running", id);
        generate_with_retry(&inner, id, &prompt, &attempts).await
    };

    let outcome = tokio::select! {
        _ = cancelled => Err(GenerationError::Cancelled),
        result = work => result,
    };

    let sender = {
        let jobs = inner.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.get(&id).map(|h| h.status.clone())
    };
    if let Some(sender) = sender {
        match outcome {
            Ok(draft) => {
                if transition(&sender, JobStatus::Succeeded { draft }) {
                    info!("Generation job {} succeeded", id);
                } else {
                    debug!("Discarding result of cancelled job {}", id);
                }
            }
            Err(GenerationError::Cancelled) => {}
            Err(e) => {
                warn!("Generation job {} failed: {}", id, e);
                transition(&sender, JobStatus::Failed { error: e.to_string() });
            }
        }
    }
    inner.finish(id, node);
}

async fn generate_with_retry(
    inner: &Inner,
    id: JobId,
    prompt: &Prompt,
    attempts: &AtomicU32,
) -> GenerationResult<Draft> {
    let ceiling = inner.config.retry_ceiling.max(1);
    let timeout = inner.config.request_timeout();
    let mut last_error = None;

    for attempt in 1..=ceiling {
        attempts.store(attempt, Ordering::SeqCst);
        if attempt > 1 {
            let delay = inner.config.backoff_for(attempt - 1);
            debug!("Retrying job {} in {:?} (attempt {})", id, delay, attempt);
            tokio::time::sleep(delay).await;
        }

        let result = match tokio::time::timeout(timeout, inner.generator.generate(prompt)).await {
            Ok(result) => result,
            Err(_) => Err(GenerationError::Transient(format!("timed out after {:?}", timeout))),
        };

        match result.and_then(|raw| parse_story_response(&raw)) {
            Ok(draft) => return Ok(draft),
            Err(e) if e.is_transient() => {
                warn!("Job {} attempt {} failed: {}", id, attempt, e);
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    let cause = last_error.map(|e| e.to_string()).unwrap_or_default();
    Err(GenerationError::Permanent(format!(
        "gave up after {} attempts: {}",
        ceiling, cause
    )))
}
