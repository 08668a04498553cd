//! Bounded worker pool for job execution.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error};

use procflow_core::{EngineError, EngineResult};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Signals the pool when its worker thread exits, panicking or not.
struct ExitSignal(mpsc::Sender<()>);

impl Drop for ExitSignal {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

/// Fixed set of threads fed by a bounded queue.
pub struct WorkerPool {
    sender: Mutex<Option<SyncSender<Task>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    exits: Mutex<Receiver<()>>,
    size: usize,
}

impl WorkerPool {
    pub fn new(name: &str, size: usize, capacity: usize) -> EngineResult<Self> {
        let size = size.max(1);
        let (sender, receiver) = mpsc::sync_channel::<Task>(capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let (exit_tx, exit_rx) = mpsc::channel();

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = receiver.clone();
            let exit = ExitSignal(exit_tx.clone());
            let worker = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || worker_loop(receiver, exit))
                .map_err(|e| EngineError::configuration(format!("failed to spawn job worker: {e}")))?;
            workers.push(worker);
        }

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            exits: Mutex::new(exit_rx),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue `task`, handing it back if the queue is full or closed.
    pub fn try_submit(&self, task: Task) -> Result<(), Task> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = sender.as_ref() else {
            return Err(task);
        };
        sender.try_send(task).map_err(|e| match e {
            TrySendError::Full(task) | TrySendError::Disconnected(task) => task,
        })
    }

    /// Close the queue and wait up to `timeout` for the workers to finish
    /// what is already queued or running. `true` when all of them exited.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner).take();

        let deadline = Instant::now() + timeout;
        let exits = self.exits.lock().unwrap_or_else(PoisonError::into_inner);
        let mut exited = 0;
        while exited < self.size {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match exits.recv_timeout(remaining) {
                Ok(()) => exited += 1,
                Err(_) => break,
            }
        }

        let finished = exited == self.size;
        if finished {
            let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
            for worker in workers {
                let _ = worker.join();
            }
        }
        finished
    }
}

fn worker_loop(receiver: Arc<Mutex<Receiver<Task>>>, _exit: ExitSignal) {
    loop {
        let task = {
            let receiver = receiver.lock().unwrap_or_else(PoisonError::into_inner);
            match receiver.recv() {
                Ok(task) => task,
                Err(_) => break,
            }
        };
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!("job task panicked");
        }
    }
    debug!("job worker stopped");
}
