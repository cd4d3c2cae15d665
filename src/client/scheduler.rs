//! Bounded, pausable task queue for chunk uploads.
//!
//! The pool is an actor: one loop owns the `pending`/`inflight` counters and
//! everything else talks to it through a cloneable [`TaskPool`] handle, so no
//! counter is ever mutated off the orchestration task. Tasks are opaque
//! futures; completion (success or failure alike) frees a slot. Retry is the
//! caller's policy, not the pool's.

use std::collections::VecDeque;
use std::future::Future;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

pub type Task = BoxFuture<'static, ()>;

/// Lifecycle notifications for whoever owns the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    /// Paused → running.
    Started,
    /// Running → paused by request; in-flight tasks keep going.
    Paused,
    /// No pending and no in-flight work left; the pool paused itself.
    Drained,
}

enum PoolCommand {
    Add(Task),
    AddAndStart(Task),
    Start,
    Pause,
    Clear,
    SetConcurrency(usize),
}

/// Handle to a running pool. Cheap to clone; dropping every handle shuts the
/// pool down once in-flight work finishes.
#[derive(Clone)]
pub struct TaskPool {
    tx: mpsc::UnboundedSender<PoolCommand>,
}

impl TaskPool {
    /// Spawn a pool with concurrency cap `concurrency` (clamped to ≥ 1),
    /// reporting lifecycle events on `events`. The pool starts paused.
    pub fn spawn(concurrency: usize, events: mpsc::UnboundedSender<PoolEvent>) -> Self {
        let (tx, cmd_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let worker = PoolWorker {
            pending: VecDeque::new(),
            inflight: 0,
            concurrency: concurrency.max(1),
            running: false,
            closed: false,
            events,
            done_tx,
        };
        tokio::spawn(worker.run(cmd_rx, done_rx));
        Self { tx }
    }

    /// Queue a task without changing the run state.
    pub fn add<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let _ = self.tx.send(PoolCommand::Add(Box::pin(task)));
    }

    /// Queue a task and ensure the pool is running.
    pub fn add_and_start<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let _ = self.tx.send(PoolCommand::AddAndStart(Box::pin(task)));
    }

    pub fn start(&self) {
        let _ = self.tx.send(PoolCommand::Start);
    }

    /// Stop dispatching; in-flight tasks run to completion.
    pub fn pause(&self) {
        let _ = self.tx.send(PoolCommand::Pause);
    }

    /// Drop all pending tasks and pause.
    pub fn clear(&self) {
        let _ = self.tx.send(PoolCommand::Clear);
    }

    /// Takes effect immediately; widening may dispatch at once, narrowing
    /// never cancels in-flight work.
    pub fn set_concurrency(&self, concurrency: usize) {
        let _ = self.tx.send(PoolCommand::SetConcurrency(concurrency));
    }
}

struct PoolWorker {
    pending: VecDeque<Task>,
    inflight: usize,
    concurrency: usize,
    running: bool,
    closed: bool,
    events: mpsc::UnboundedSender<PoolEvent>,
    done_tx: mpsc::UnboundedSender<()>,
}

impl PoolWorker {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<PoolCommand>,
        mut done_rx: mpsc::UnboundedReceiver<()>,
    ) {
        loop {
            if self.closed && self.inflight == 0 {
                break;
            }
            tokio::select! {
                cmd = cmd_rx.recv(), if !self.closed => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => self.closed = true,
                },
                Some(()) = done_rx.recv() => {
                    self.inflight -= 1;
                    self.dispatch();
                    self.maybe_drain();
                }
            }
        }
    }

    fn handle(&mut self, cmd: PoolCommand) {
        match cmd {
            PoolCommand::Add(task) => self.pending.push_back(task),
            PoolCommand::AddAndStart(task) => {
                self.pending.push_back(task);
                self.set_running();
                self.dispatch();
            }
            PoolCommand::Start => {
                self.set_running();
                self.dispatch();
                self.maybe_drain();
            }
            PoolCommand::Pause => {
                if self.running {
                    self.running = false;
                    let _ = self.events.send(PoolEvent::Paused);
                }
            }
            PoolCommand::Clear => {
                self.pending.clear();
                if self.running {
                    self.running = false;
                    let _ = self.events.send(PoolEvent::Paused);
                }
            }
            PoolCommand::SetConcurrency(concurrency) => {
                self.concurrency = concurrency.max(1);
                if self.running {
                    self.dispatch();
                }
            }
        }
    }

    fn set_running(&mut self) {
        if !self.running {
            self.running = true;
            let _ = self.events.send(PoolEvent::Started);
        }
    }

    /// FIFO over pending tasks while slots are free.
    fn dispatch(&mut self) {
        while self.running && self.inflight < self.concurrency {
            let Some(task) = self.pending.pop_front() else {
                break;
            };
            self.inflight += 1;
            let done = DoneGuard(self.done_tx.clone());
            tokio::spawn(async move {
                let _done = done;
                task.await;
            });
        }
    }

    fn maybe_drain(&mut self) {
        if self.running && self.inflight == 0 && self.pending.is_empty() {
            self.running = false;
            let _ = self.events.send(PoolEvent::Drained);
        }
    }
}

/// Signals completion when the task finishes or unwinds. A slot must come
/// back even if the task panics.
struct DoneGuard(mpsc::UnboundedSender<()>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn wait_for(events: &mut mpsc::UnboundedReceiver<PoolEvent>, wanted: PoolEvent) {
        while let Some(event) = events.recv().await {
            if event == wanted {
                return;
            }
        }
        panic!("event channel closed before {:?}", wanted);
    }

    #[tokio::test]
    async fn runs_tasks_and_drains() {
        let (tx, mut events) = mpsc::unbounded_channel();
        let pool = TaskPool::spawn(2, tx);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let counter = Arc::clone(&counter);
            pool.add(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.start();

        wait_for(&mut events, PoolEvent::Drained).await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn respects_the_concurrency_cap() {
        let (tx, mut events) = mpsc::unbounded_channel();
        let pool = TaskPool::spawn(2, tx);

        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            pool.add_and_start(async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            });
        }

        wait_for(&mut events, PoolEvent::Drained).await;
        assert!(peak.load(Ordering::SeqCst) <= 2, "cap exceeded");
    }

    #[tokio::test]
    async fn paused_pool_holds_tasks() {
        let (tx, mut events) = mpsc::unbounded_channel();
        let pool = TaskPool::spawn(1, tx);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            pool.add(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        // Never started: nothing may run.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        pool.start();
        wait_for(&mut events, PoolEvent::Drained).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn clear_drops_pending_work() {
        let (tx, mut events) = mpsc::unbounded_channel();
        let pool = TaskPool::spawn(1, tx);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            pool.add(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.clear();
        pool.start();

        wait_for(&mut events, PoolEvent::Drained).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn tasks_run_in_fifo_order_when_serial() {
        let (tx, mut events) = mpsc::unbounded_channel();
        let pool = TaskPool::spawn(1, tx);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        for i in 0..4 {
            let order = Arc::clone(&order);
            pool.add(async move {
                order.lock().unwrap().push(i);
            });
        }
        pool.start();

        wait_for(&mut events, PoolEvent::Drained).await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn widening_concurrency_takes_effect_immediately() {
        let (tx, mut events) = mpsc::unbounded_channel();
        let pool = TaskPool::spawn(1, tx);

        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..6 {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            pool.add(async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            });
        }
        pool.start();
        pool.set_concurrency(3);

        wait_for(&mut events, PoolEvent::Drained).await;
        // The widened cap let more tasks overlap, but never beyond it.
        let peak = peak.load(Ordering::SeqCst);
        assert!(peak >= 2, "widening never dispatched extra tasks");
        assert!(peak <= 3, "cap exceeded");
    }

    #[tokio::test]
    async fn failure_of_one_task_frees_its_slot() {
        let (tx, mut events) = mpsc::unbounded_channel();
        let pool = TaskPool::spawn(1, tx);
        let counter = Arc::new(AtomicUsize::new(0));

        // A task that panics still releases its slot because the wrapper
        // holds the completion sender.
        pool.add(async {
            panic!("task blew up");
        });
        let c = Arc::clone(&counter);
        pool.add(async move {
            c.fetch_add(1, Ordering::SeqCst);
        });
        pool.start();

        wait_for(&mut events, PoolEvent::Drained).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
