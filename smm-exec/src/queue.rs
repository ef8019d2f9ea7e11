//! In-memory dispatch queue.
//!
//! Single-process, non-durable implementation of [`DispatchQueue`] used by
//! tests and the stub daemon. Visibility delays use `tokio::time`, so tests
//! running with a paused clock can advance past backoffs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use smm_domain::DispatchJob;

use crate::error::{ExecError, ExecResult};
use crate::ports::{Delivery, DispatchQueue};

struct Entry {
    id: Uuid,
    job: DispatchJob,
    attempt: u32,
    visible_at: Instant,
}

#[derive(Default)]
struct Lanes {
    ready: Vec<Entry>,
    in_flight: HashMap<Uuid, Entry>,
    dead: Vec<(DispatchJob, String)>,
}

/// In-memory queue for testing.
#[derive(Default)]
pub struct MemoryQueue {
    lanes: Mutex<Lanes>,
    fail_enqueue: AtomicBool,
}

impl MemoryQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn lanes(&self) -> MutexGuard<'_, Lanes> {
        self.lanes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every `enqueue` fail (simulates a broker outage).
    pub fn set_fail_enqueue(&self, fail: bool) {
        self.fail_enqueue.store(fail, Ordering::SeqCst);
    }

    /// Jobs waiting or reserved.
    pub fn len(&self) -> usize {
        let lanes = self.lanes();
        lanes.ready.len() + lanes.in_flight.len()
    }

    /// True when no job is waiting or reserved.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Jobs waiting (visible or delayed).
    pub fn pending_jobs(&self) -> Vec<DispatchJob> {
        self.lanes().ready.iter().map(|e| e.job.clone()).collect()
    }

    /// Buried jobs with their reasons.
    pub fn dead_letters(&self) -> Vec<(DispatchJob, String)> {
        self.lanes().dead.clone()
    }
}

#[async_trait]
impl DispatchQueue for MemoryQueue {
    async fn enqueue(&self, job: DispatchJob) -> ExecResult<()> {
        if self.fail_enqueue.load(Ordering::SeqCst) {
            return Err(ExecError::Queue("Simulated enqueue failure".to_string()));
        }
        self.lanes().ready.push(Entry {
            id: Uuid::now_v7(),
            job,
            attempt: 0,
            visible_at: Instant::now(),
        });
        Ok(())
    }

    async fn reserve(&self) -> ExecResult<Option<Delivery>> {
        let now = Instant::now();
        let mut lanes = self.lanes();

        let Some(index) = lanes.ready.iter().position(|e| e.visible_at <= now) else {
            return Ok(None);
        };
        let mut entry = lanes.ready.remove(index);
        entry.attempt += 1;

        let delivery = Delivery {
            id: entry.id,
            job: entry.job.clone(),
            attempt: entry.attempt,
        };
        lanes.in_flight.insert(entry.id, entry);
        Ok(Some(delivery))
    }

    async fn ack(&self, delivery: &Delivery) -> ExecResult<()> {
        self.lanes().in_flight.remove(&delivery.id);
        Ok(())
    }

    async fn release(&self, delivery: &Delivery, delay: Duration) -> ExecResult<()> {
        let mut lanes = self.lanes();
        let mut entry = lanes.in_flight.remove(&delivery.id).ok_or_else(|| {
            ExecError::Queue(format!("delivery {} is not reserved", delivery.id))
        })?;
        entry.visible_at = Instant::now() + delay;
        lanes.ready.push(entry);
        Ok(())
    }

    async fn bury(&self, delivery: &Delivery, reason: &str) -> ExecResult<()> {
        let mut lanes = self.lanes();
        lanes.in_flight.remove(&delivery.id);
        lanes.dead.push((delivery.job.clone(), reason.to_string()));
        Ok(())
    }
}
