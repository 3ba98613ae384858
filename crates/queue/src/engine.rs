use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use api::{JobApi, LoraPairInput, StatusResponse, SubmitInput, SubmitRequest};
use crossbeam_channel::{unbounded, Receiver, Sender};
use delivery::ArtifactSink;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use store::{Job, JobState, Store, Submission};
use uuid::Uuid;

use crate::state::{transition, StateEvent};
use crate::EngineError;

const POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Hard cap on poll ticks per loop (~20 minutes at the 5s interval).
const MAX_POLL_ATTEMPTS: u32 = 240;
/// Finished jobs older than this are evicted on resume.
const MAX_JOB_AGE_MS: i64 = 24 * 60 * 60 * 1000;

/// Emitted once per queue mutation; the presentation layer re-renders
/// from these.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    JobUpdated(Job),
    QueueCleared { removed: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

struct QueueState {
    jobs: Vec<Job>,
    /// Job ids whose artifact has already been delivered. Process
    /// lifetime only: within a session delivery is exactly-once, across
    /// restarts at-least-once.
    delivered: HashSet<String>,
    /// Job ids with a live poll loop; at most one per job.
    polling: HashSet<String>,
}

struct Inner {
    api: Arc<dyn JobApi>,
    sink: Arc<dyn ArtifactSink>,
    store: Store,
    state: Mutex<QueueState>,
    events_tx: Sender<QueueEvent>,
    // Held so event sends outlive consumers coming and going.
    _events_rx: Receiver<QueueEvent>,
}

/// The job queue engine. Owns the queue aggregate; every mutation runs
/// through it, persists the snapshot, and notifies subscribers.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Loads the persisted queue. Call [`Engine::resume`] afterwards
    /// (from within a runtime) to restart polling of interrupted jobs.
    pub fn new(api: Arc<dyn JobApi>, sink: Arc<dyn ArtifactSink>, store: Store) -> Self {
        let jobs = store.load_queue();
        let (events_tx, events_rx) = unbounded();
        Self {
            inner: Arc::new(Inner {
                api,
                sink,
                store,
                state: Mutex::new(QueueState {
                    jobs,
                    delivered: HashSet::new(),
                    polling: HashSet::new(),
                }),
                events_tx,
                _events_rx: events_rx,
            }),
        }
    }

    /// Event stream for a single consumer.
    pub fn events(&self) -> Receiver<QueueEvent> {
        self.inner._events_rx.clone()
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.inner.state.lock().jobs.clone()
    }

    pub fn job(&self, job_id: &str) -> Option<Job> {
        self.inner
            .state
            .lock()
            .jobs
            .iter()
            .find(|j| j.id == job_id)
            .cloned()
    }

    pub fn stats(&self) -> QueueStats {
        let q = self.inner.state.lock();
        let mut stats = QueueStats::default();
        for job in &q.jobs {
            match job.state {
                JobState::Processing { .. } => stats.processing += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed { .. } => stats.failed += 1,
            }
        }
        stats
    }

    /// Validate and submit a generation request. On success the job is
    /// appended as `processing`, persisted, and polled; on any failure
    /// no job record is created.
    pub async fn submit(&self, submission: Submission) -> Result<Job, EngineError> {
        validate(&submission)?;

        let request = build_request(&submission);
        let response = self.inner.api.submit(&request).await?;
        let id = response
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("gen_{}", Uuid::new_v4()));
        info!("generation started, job id {id}");

        let now = now_ms();
        let job = Job {
            id: id.clone(),
            state: JobState::Processing { progress: 0.0 },
            submission: Some(submission),
            created_at: now,
            started_at: now,
            ended_at: None,
            video_data: None,
        };

        {
            let mut q = self.inner.state.lock();
            q.jobs.push(job.clone());
            self.inner.commit(&q, QueueEvent::JobUpdated(job.clone()));
        }
        spawn_poll(&self.inner, id);
        Ok(job)
    }

    /// Cancel a job on the server, then mark the local record failed if
    /// it is still processing. The poll loop exits on its next tick. On
    /// transport failure the record is untouched and the error surfaces
    /// unless `silent`.
    pub async fn cancel(&self, job_id: &str, silent: bool) -> Result<(), EngineError> {
        match self.inner.api.cancel(job_id).await {
            Ok(()) => {
                let mut q = self.inner.state.lock();
                if let Some(i) = q.jobs.iter().position(|j| j.id == job_id) {
                    if q.jobs[i].state.is_processing() {
                        q.jobs[i].state = transition(&q.jobs[i].state, StateEvent::Cancelled);
                        q.jobs[i].ended_at = Some(now_ms());
                        let job = q.jobs[i].clone();
                        self.inner.commit(&q, QueueEvent::JobUpdated(job));
                    }
                }
                Ok(())
            }
            Err(e) => {
                if silent {
                    warn!("cancel of job {job_id} failed: {e}");
                    Ok(())
                } else {
                    Err(e.into())
                }
            }
        }
    }

    /// Cancel every processing job, silently. Returns how many were
    /// attempted.
    pub async fn cancel_all(&self) -> usize {
        let ids: Vec<String> = {
            let q = self.inner.state.lock();
            q.jobs
                .iter()
                .filter(|j| j.state.is_processing())
                .map(|j| j.id.clone())
                .collect()
        };
        for id in &ids {
            let _ = self.cancel(id, true).await;
        }
        ids.len()
    }

    /// Re-submit a job with its stored parameters. The original record
    /// is untouched; its delivered-marker is cleared first.
    pub async fn retry(&self, job_id: &str) -> Result<Job, EngineError> {
        let submission = {
            let mut q = self.inner.state.lock();
            let job = q
                .jobs
                .iter()
                .find(|j| j.id == job_id)
                .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))?;
            let submission = job
                .submission
                .clone()
                .ok_or_else(|| EngineError::NoRetryData(job_id.to_string()))?;
            q.delivered.remove(job_id);
            submission
        };
        self.submit(submission).await
    }

    /// Remove every job matching the predicate in one step. Poll loops
    /// of removed jobs exit on their next tick.
    pub fn clear_where<F: Fn(&Job) -> bool>(&self, predicate: F) -> usize {
        let mut q = self.inner.state.lock();
        let before = q.jobs.len();
        q.jobs.retain(|j| !predicate(j));
        let removed = before - q.jobs.len();
        if removed > 0 {
            self.inner.commit(&q, QueueEvent::QueueCleared { removed });
        }
        removed
    }

    pub fn clear_finished(&self) -> usize {
        self.clear_where(|j| j.state.is_terminal())
    }

    /// Invoked once at process start: evict stale finished jobs, restart
    /// polling for interrupted ones (with a fresh attempt window), and
    /// mark restored completed jobs as already delivered.
    pub fn resume(&self) {
        let to_poll: Vec<String> = {
            let mut q = self.inner.state.lock();
            let now = now_ms();
            let before = q.jobs.len();
            q.jobs
                .retain(|j| j.state.is_processing() || now - j.created_at < MAX_JOB_AGE_MS);
            let evicted = before - q.jobs.len();
            if evicted > 0 {
                info!("evicted {evicted} finished jobs older than 24h");
            }

            let mut to_poll = Vec::new();
            {
                let QueueState {
                    jobs, delivered, ..
                } = &mut *q;
                for job in jobs.iter() {
                    match job.state {
                        JobState::Processing { .. } => {
                            info!("resuming polling for job {}", job.id);
                            to_poll.push(job.id.clone());
                        }
                        JobState::Completed => {
                            delivered.insert(job.id.clone());
                        }
                        JobState::Failed { .. } => {}
                    }
                }
            }

            if evicted > 0 {
                self.inner
                    .commit(&q, QueueEvent::QueueCleared { removed: evicted });
            }
            to_poll
        };

        for id in to_poll {
            spawn_poll(&self.inner, id);
        }
    }

    #[cfg(test)]
    fn is_delivered(&self, job_id: &str) -> bool {
        self.inner.state.lock().delivered.contains(job_id)
    }
}

impl Inner {
    /// One persist-and-notify cycle; called exactly once per mutation,
    /// with the queue lock held.
    fn commit(&self, q: &QueueState, event: QueueEvent) {
        if let Err(e) = self.store.save_queue(&q.jobs) {
            error!("failed to persist queue: {e}");
        }
        let _ = self.events_tx.send(event);
    }

    fn resolve_completed(&self, job_id: &str, response: &StatusResponse) {
        let mut q = self.state.lock();
        let Some(i) = q.jobs.iter().position(|j| j.id == job_id) else {
            return;
        };
        if !q.jobs[i].state.is_processing() {
            return;
        }

        q.jobs[i].state = transition(&q.jobs[i].state, StateEvent::Completed);
        q.jobs[i].ended_at = Some(now_ms());

        match response.video_payload() {
            Some(payload) => {
                q.jobs[i].video_data = Some(payload.to_string());
                if q.delivered.insert(job_id.to_string()) {
                    match self.sink.deliver(job_id, payload) {
                        Ok(path) => info!("job {job_id}: video saved to {}", path.display()),
                        Err(e) => error!("job {job_id}: artifact delivery failed: {e}"),
                    }
                } else {
                    debug!("job {job_id}: artifact already delivered, skipping");
                }
            }
            None => {
                error!("job {job_id}: completed without video data");
                q.jobs[i].state = transition(&q.jobs[i].state, StateEvent::ArtifactMissing);
            }
        }

        let job = q.jobs[i].clone();
        self.commit(&q, QueueEvent::JobUpdated(job));
    }

    fn resolve_failed(&self, job_id: &str, reason: Option<String>) {
        let mut q = self.state.lock();
        let Some(i) = q.jobs.iter().position(|j| j.id == job_id) else {
            return;
        };
        if !q.jobs[i].state.is_processing() {
            return;
        }

        q.jobs[i].state = transition(&q.jobs[i].state, StateEvent::Failed { error: reason });
        q.jobs[i].ended_at = Some(now_ms());
        let job = q.jobs[i].clone();
        self.commit(&q, QueueEvent::JobUpdated(job));
    }

    fn update_progress(&self, job_id: &str) {
        let mut q = self.state.lock();
        let Some(i) = q.jobs.iter().position(|j| j.id == job_id) else {
            return;
        };
        if !q.jobs[i].state.is_processing() {
            return;
        }

        let elapsed_ms = now_ms() - q.jobs[i].started_at;
        q.jobs[i].state = transition(&q.jobs[i].state, StateEvent::Progress { elapsed_ms });
        let job = q.jobs[i].clone();
        self.commit(&q, QueueEvent::JobUpdated(job));
    }

    fn resolve_timeout(&self, job_id: &str) {
        let mut q = self.state.lock();
        let Some(i) = q.jobs.iter().position(|j| j.id == job_id) else {
            return;
        };
        if !q.jobs[i].state.is_processing() {
            return;
        }

        warn!("job {job_id}: timed out after {MAX_POLL_ATTEMPTS} poll attempts");
        q.jobs[i].state = transition(&q.jobs[i].state, StateEvent::TimedOut);
        q.jobs[i].ended_at = Some(now_ms());
        let job = q.jobs[i].clone();
        self.commit(&q, QueueEvent::JobUpdated(job));
    }
}

fn spawn_poll(inner: &Arc<Inner>, job_id: String) {
    {
        let mut q = inner.state.lock();
        if !q.polling.insert(job_id.clone()) {
            // One live loop per job.
            return;
        }
    }
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        poll_job(&inner, &job_id).await;
        inner.state.lock().polling.remove(&job_id);
    });
}

/// One conceptual long-lived task per active job. Bad ticks (transport
/// errors, malformed bodies) are skipped but still count toward the
/// attempt cap, so a flaky network cannot keep a job alive forever.
async fn poll_job(inner: &Arc<Inner>, job_id: &str) {
    for attempt in 1..=MAX_POLL_ATTEMPTS {
        tokio::time::sleep(POLL_INTERVAL).await;

        {
            let q = inner.state.lock();
            match q.jobs.iter().find(|j| j.id == job_id) {
                Some(job) if job.state.is_processing() => {}
                Some(_) => return,
                None => {
                    debug!("job {job_id}: removed from queue, stopping poll");
                    return;
                }
            }
        }

        let response = match inner.api.status(job_id).await {
            Ok(response) => response,
            Err(e) => {
                warn!("job {job_id}: status poll failed (attempt {attempt}): {e}");
                continue;
            }
        };
        let Some(raw_status) = response.status.as_deref() else {
            warn!("job {job_id}: status response missing status field");
            continue;
        };

        match raw_status.to_ascii_uppercase().as_str() {
            "COMPLETED" => {
                inner.resolve_completed(job_id, &response);
                return;
            }
            "FAILED" => {
                inner.resolve_failed(job_id, response.error.clone());
                return;
            }
            "IN_PROGRESS" | "IN_QUEUE" => inner.update_progress(job_id),
            other => debug!("job {job_id}: unrecognized status {other:?}"),
        }
    }

    inner.resolve_timeout(job_id);
}

fn validate(submission: &Submission) -> Result<(), EngineError> {
    if !submission.image.starts_with("data:image/") {
        return Err(EngineError::InvalidImage);
    }
    if submission.lora_pairs.len() > 4 {
        return Err(EngineError::InvalidLora(format!(
            "at most 4 pairs allowed, got {}",
            submission.lora_pairs.len()
        )));
    }
    for pair in &submission.lora_pairs {
        if pair.high.is_empty() || pair.low.is_empty() {
            return Err(EngineError::InvalidLora(
                "both high and low models are required".into(),
            ));
        }
        for weight in [pair.high_weight, pair.low_weight] {
            if !(0.0..=2.0).contains(&weight) {
                return Err(EngineError::InvalidLora(format!(
                    "weight {weight} outside [0, 2]"
                )));
            }
        }
    }
    Ok(())
}

fn build_request(submission: &Submission) -> SubmitRequest {
    SubmitRequest {
        input: SubmitInput {
            prompt: submission.prompt.clone(),
            image_base64: submission.image_base64().to_string(),
            seed: submission.seed,
            cfg: submission.cfg,
            width: submission.width,
            height: submission.height,
            length: submission.length,
            steps: submission.steps,
            negative_prompt: submission
                .negative_prompt
                .as_ref()
                .filter(|p| !p.trim().is_empty())
                .cloned(),
            lora_pairs: submission
                .lora_pairs
                .iter()
                .map(|pair| LoraPairInput {
                    high: pair.high.clone(),
                    low: pair.low.clone(),
                    high_weight: pair.high_weight,
                    low_weight: pair.low_weight,
                })
                .collect(),
        },
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
