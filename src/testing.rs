//! In-memory fakes for the external collaborators used in unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::heartbeat::HeartbeatStore;
use crate::notifications::{EventPublisher, NotificationEvent};
use crate::queue::{JobQueue, QueueJob, QueueName};
use crate::rate_limit::{CounterStore, WindowCount};
use crate::sandbox::{ExecuteRequest, ExecutionResult, SandboxClient, SandboxError};

#[derive(Default)]
pub struct MemoryQueue {
    jobs: Mutex<HashMap<QueueName, VecDeque<QueueJob>>>,
    submission_ready: Notify,
    achievement_ready: Notify,
    fail_enqueue: Mutex<bool>,
}

impl MemoryQueue {
    fn ready(&self, queue: QueueName) -> &Notify {
        match queue {
            QueueName::Submission => &self.submission_ready,
            QueueName::Achievement => &self.achievement_ready,
        }
    }

    /// Make every subsequent enqueue fail.
    pub fn fail_enqueue(&self) {
        *self.fail_enqueue.lock().unwrap() = true;
    }

    pub fn pending(&self, queue: QueueName) -> Vec<i64> {
        self.jobs
            .lock()
            .unwrap()
            .get(&queue)
            .map(|jobs| jobs.iter().map(|j| j.submission_id).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, queue: QueueName, submission_id: i64) -> Result<()> {
        if *self.fail_enqueue.lock().unwrap() {
            anyhow::bail!("connection refused");
        }
        self.jobs
            .lock()
            .unwrap()
            .entry(queue)
            .or_default()
            .push_back(QueueJob::new(submission_id));
        self.ready(queue).notify_one();
        Ok(())
    }

    async fn dequeue(
        &self,
        queue: QueueName,
        cancel: &CancellationToken,
    ) -> Result<Option<QueueJob>> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let job = self
                .jobs
                .lock()
                .unwrap()
                .get_mut(&queue)
                .and_then(|jobs| jobs.pop_front());
            if let Some(job) = job {
                return Ok(Some(job));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = self.ready(queue).notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
    }

    async fn length(&self, queue: QueueName) -> Result<u64> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .get(&queue)
            .map(|jobs| jobs.len() as u64)
            .unwrap_or(0))
    }

    async fn queued_ids(&self, queue: QueueName) -> Result<HashSet<i64>> {
        Ok(self.pending(queue).into_iter().collect())
    }
}

#[derive(Default)]
pub struct MemoryHeartbeats {
    beats: Mutex<HashMap<String, (Instant, Duration)>>,
}

impl MemoryHeartbeats {
    pub fn ttl_of(&self, worker_id: &str) -> Option<Duration> {
        self.beats
            .lock()
            .unwrap()
            .get(worker_id)
            .filter(|(expires, _)| *expires > Instant::now())
            .map(|(_, ttl)| *ttl)
    }
}

#[async_trait]
impl HeartbeatStore for MemoryHeartbeats {
    async fn beat(&self, worker_id: &str, ttl: Duration) -> Result<()> {
        self.beats
            .lock()
            .unwrap()
            .insert(worker_id.to_string(), (Instant::now() + ttl, ttl));
        Ok(())
    }

    async fn clear(&self, worker_id: &str) -> Result<()> {
        self.beats.lock().unwrap().remove(worker_id);
        Ok(())
    }

    async fn live_workers(&self) -> Result<usize> {
        let now = Instant::now();
        Ok(self
            .beats
            .lock()
            .unwrap()
            .values()
            .filter(|(expires, _)| *expires > now)
            .count())
    }
}

#[derive(Default)]
pub struct MemoryCounters {
    counters: Mutex<HashMap<String, (i64, Instant)>>,
}

impl MemoryCounters {
    pub fn count(&self, key: &str) -> i64 {
        self.counters
            .lock()
            .unwrap()
            .get(key)
            .map(|(count, _)| *count)
            .unwrap_or(0)
    }
}

#[async_trait]
impl CounterStore for MemoryCounters {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount> {
        let now = Instant::now();
        let mut counters = self.counters.lock().unwrap();
        let entry = counters.entry(key.to_string()).or_insert((0, now + window));
        if entry.1 <= now {
            *entry = (0, now + window);
        }
        entry.0 += 1;
        Ok(WindowCount {
            count: entry.0,
            ttl: Some(entry.1.saturating_duration_since(now)),
        })
    }
}

pub struct FailingCounters;

#[async_trait]
impl CounterStore for FailingCounters {
    async fn increment(&self, _key: &str, _window: Duration) -> Result<WindowCount> {
        anyhow::bail!("connection refused")
    }
}

type Responder = Box<dyn Fn(&ExecuteRequest) -> Result<ExecutionResult, SandboxError> + Send + Sync>;

/// Sandbox answering from a closure, with optional latency and call accounting.
pub struct ScriptedSandbox {
    responder: Responder,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    requests: Mutex<Vec<ExecuteRequest>>,
}

impl ScriptedSandbox {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&ExecuteRequest) -> Result<ExecutionResult, SandboxError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Program that prints its stdin.
    pub fn echo() -> Self {
        Self::new(|req| {
            Ok(ExecutionResult {
                stdout: req.stdin.clone(),
                cpu_ms: 5,
                memory_kb: 1024,
                ..Default::default()
            })
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ExecuteRequest> {
        self.requests.lock().unwrap().clone()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SandboxClient for ScriptedSandbox {
    async fn execute(&self, request: &ExecuteRequest) -> Result<ExecutionResult, SandboxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.responder)(request)
    }
}

/// Records published events.
#[derive(Default)]
pub struct MemoryPublisher {
    events: Mutex<Vec<NotificationEvent>>,
}

impl MemoryPublisher {
    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventPublisher for MemoryPublisher {
    async fn publish(&self, event: &NotificationEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}
