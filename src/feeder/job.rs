use async_channel::{Receiver, Sender};
use bevy::{
    log::error,
    tasks::{AsyncComputeTaskPool, TaskPool},
};
use std::{
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, PoisonError},
};

type Work<T> = Box<dyn FnOnce() -> T + Send>;

/// A unit of background work that runs exactly once.
///
/// Whoever calls [`Job::run_if_not_started`] first runs the work, a worker
/// of the [`JobQueue`] or the thread waiting for the result. This keeps
/// [`Job::wait`] from stalling behind a backlog of unrelated jobs.
pub struct Job<T> {
    work: Mutex<Option<Work<T>>>,
    sender: Sender<T>,
    receiver: Receiver<T>,
}

impl<T: Send + 'static> Job<T> {
    pub fn new(work: impl FnOnce() -> T + Send + 'static) -> Arc<Self> {
        let (sender, receiver) = async_channel::bounded(1);

        Arc::new(Self {
            work: Mutex::new(Some(Box::new(work))),
            sender,
            receiver,
        })
    }

    fn take_work(&self) -> Option<Work<T>> {
        self.work
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn is_started(&self) -> bool {
        self.work
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Runs the work unless someone already took it, returns whether it ran here.
    pub fn run_if_not_started(&self) -> bool {
        match self.take_work() {
            Some(work) => {
                match panic::catch_unwind(AssertUnwindSafe(work)) {
                    Ok(result) => {
                        let _ = self.sender.try_send(result);
                    }
                    Err(_) => {
                        error!("A background job panicked.");
                        self.sender.close();
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Blocks until the result is available, running the work inline if it has not started.
    ///
    /// Returns `None` if the result was already taken or the work panicked.
    pub fn wait(&self) -> Option<T> {
        self.run_if_not_started();

        let result = self.receiver.recv_blocking().ok();
        self.receiver.close();
        result
    }
}

/// Hands jobs to the [`AsyncComputeTaskPool`], a fixed set of worker threads.
#[derive(Clone, Copy)]
pub struct JobQueue {
    pool: &'static AsyncComputeTaskPool,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self {
            pool: AsyncComputeTaskPool::get_or_init(TaskPool::default),
        }
    }
}

impl JobQueue {
    pub fn enqueue<T: Send + 'static>(&self, job: Arc<Job<T>>) {
        self.pool
            .spawn(async move {
                job.run_if_not_started();
            })
            .detach();
    }
}
