use std::{
    collections::VecDeque,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};
use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{Notify, watch};
use tracing::{debug, error};

/// What the drain loop does after a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    Continue,
    /// Stop draining and hand whatever is still queued to [`TaskHandler::finished`].
    Close,
}

/// The single consumer of an [`ExecutionQueue`].
#[async_trait]
pub trait TaskHandler<T: Send + 'static>: Send + 'static {
    async fn handle(&mut self, task: T, queue: &ExecutionQueue<T>) -> anyhow::Result<Drain>;

    /// Runs once after the queue closed. `leftovers` are the tasks that were
    /// accepted but never ran because the handler returned [`Drain::Close`].
    async fn finished(&mut self, _leftovers: Vec<T>) {}
}

struct Shared<T> {
    tasks: Mutex<VecDeque<T>>,
    closed: AtomicBool,
    notify: Notify,
    busy: watch::Sender<bool>,
}

impl<T> Shared<T> {
    fn tasks(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Ordered task queue drained by one long-lived task.
///
/// Tasks run strictly one at a time. `push_front` lets a running task schedule
/// its own follow-up ahead of anything that arrived meanwhile.
pub struct ExecutionQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ExecutionQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> std::fmt::Debug for ExecutionQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionQueue")
            .field("len", &self.len())
            .field("running", &self.is_running())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T: Send + 'static> ExecutionQueue<T> {
    /// Creates the queue and spawns its drain loop on the current runtime.
    pub fn spawn<H>(handler: H) -> Self
    where
        H: TaskHandler<T>,
    {
        let (busy, _) = watch::channel(false);
        let queue = Self {
            shared: Arc::new(Shared {
                tasks: Mutex::new(VecDeque::new()),
                closed: AtomicBool::new(false),
                notify: Notify::new(),
                busy,
            }),
        };
        tokio::spawn(drain(queue.clone(), handler));
        queue
    }

    /// Appends to the tail. Returns `false` if the queue is closed.
    pub fn push(&self, task: T) -> bool {
        self.enqueue(task, false)
    }

    /// Prepends to the head. Returns `false` if the queue is closed.
    pub fn push_front(&self, task: T) -> bool {
        self.enqueue(task, true)
    }

    fn enqueue(&self, task: T, front: bool) -> bool {
        {
            let mut tasks = self.shared.tasks();
            if self.is_closed() {
                return false;
            }
            if front {
                tasks.push_front(task);
            } else {
                tasks.push_back(task);
            }
            self.shared.busy.send_replace(true);
        }
        self.shared.notify.notify_one();
        true
    }
}

impl<T> ExecutionQueue<T> {
    pub fn len(&self) -> usize {
        self.shared.tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True while a task is executing or waiting to execute.
    pub fn is_running(&self) -> bool {
        *self.shared.busy.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Stops the drain loop after the task in flight. Pending tasks are dropped.
    pub fn close(&self) {
        drop(self.seal());
    }

    /// Marks the queue closed and takes what is still pending. Holding the
    /// lock keeps a concurrent `push` from landing after the take.
    fn seal(&self) -> Vec<T> {
        let pending = {
            let mut tasks = self.shared.tasks();
            self.shared.closed.store(true, Ordering::Release);
            tasks.drain(..).collect()
        };
        self.shared.notify.notify_one();
        pending
    }

    /// Resolves once the queue is empty and idle, or closed and finished.
    pub async fn settled(&self) {
        let mut busy = self.shared.busy.subscribe();
        let _ = busy.wait_for(|b| !*b).await;
    }
}

async fn drain<T, H>(queue: ExecutionQueue<T>, mut handler: H)
where
    T: Send + 'static,
    H: TaskHandler<T>,
{
    let mut leftovers = Vec::new();
    loop {
        let next = {
            let mut tasks = queue.shared.tasks();
            if queue.is_closed() {
                tasks.clear();
                break;
            }
            let next = tasks.pop_front();
            if next.is_none() {
                queue.shared.busy.send_replace(false);
            }
            next
        };

        let Some(task) = next else {
            queue.shared.notify.notified().await;
            continue;
        };

        match AssertUnwindSafe(handler.handle(task, &queue))
            .catch_unwind()
            .await
        {
            Ok(Ok(Drain::Continue)) => {}
            Ok(Ok(Drain::Close)) => {
                leftovers = queue.seal();
            }
            Ok(Err(err)) => {
                error!(error = %err, "task failed");
            }
            Err(_) => {
                error!("task panicked");
            }
        }
    }

    debug!(leftovers = leftovers.len(), "queue closed, draining stopped");
    handler.finished(leftovers).await;
    queue.shared.busy.send_replace(false);
}
