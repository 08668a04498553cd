//! In-process serialization of exclusive jobs per process instance.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use procflow_core::{ExecutionId, JobEntity};

/// Exclusive jobs waiting behind a running one of the same process instance.
///
/// An entry exists for exactly as long as some worker is running a chain
/// for that instance; the chain drains the queue with [`next`] and the
/// entry disappears when [`next`] finds it empty.
///
/// [`next`]: ExclusiveJobQueue::next
#[derive(Debug, Default)]
pub struct ExclusiveJobQueue {
    queues: Mutex<HashMap<ExecutionId, VecDeque<JobEntity>>>,
}

impl ExclusiveJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `job`; `true` when no chain is running for its instance and the
    /// caller must start one.
    pub fn offer(&self, process_instance_id: ExecutionId, job: JobEntity) -> bool {
        let mut queues = self.lock();
        match queues.get_mut(&process_instance_id) {
            Some(queue) => {
                queue.push_back(job);
                false
            }
            None => {
                queues.insert(process_instance_id, VecDeque::from([job]));
                true
            }
        }
    }

    /// Next job of the chain, or `None` (ending the chain).
    pub fn next(&self, process_instance_id: ExecutionId) -> Option<JobEntity> {
        let mut queues = self.lock();
        let queue = queues.get_mut(&process_instance_id)?;
        match queue.pop_front() {
            Some(job) => Some(job),
            None => {
                queues.remove(&process_instance_id);
                None
            }
        }
    }

    /// End a chain early, returning the jobs it never ran.
    pub fn abandon(&self, process_instance_id: ExecutionId) -> Vec<JobEntity> {
        self.lock()
            .remove(&process_instance_id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Remove every queued job (shutdown).
    pub fn drain(&self) -> Vec<JobEntity> {
        let mut queues = self.lock();
        queues.values_mut().flat_map(|queue| queue.drain(..)).collect()
    }

    pub fn is_running(&self, process_instance_id: ExecutionId) -> bool {
        self.lock().contains_key(&process_instance_id)
    }

    pub fn queued(&self) -> usize {
        self.lock().values().map(VecDeque::len).sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ExecutionId, VecDeque<JobEntity>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
