//! Batched execution of write requests.
//!
//! Callers on any thread submit a unit of work; a single worker thread drains the queue into a
//! batch and runs the whole batch inside one write transaction. When a task fails the attempt is
//! aborted, the failing task is completed with its error and the remaining tasks are retried.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use oxigraph::model::{NamedNode, Term};

use crate::core::{CallerContext, Statement};
use crate::error::{Error, Result};
use crate::store::{GraphStore, Pattern, TxnMode};
use crate::transactions::fatal::Terminator;
use crate::transactions::pipeline::CommitPipeline;

/// What a unit of work sees of the write transaction it runs in
pub struct WriteContext<'a> {
    store: &'a dyn GraphStore,
    caller: &'a CallerContext,
}

impl<'a> WriteContext<'a> {
    pub fn new(store: &'a dyn GraphStore, caller: &'a CallerContext) -> Self {
        Self { store, caller }
    }

    pub fn add(&self, statement: &Statement) -> Result<bool> {
        self.store.add(statement)
    }

    pub fn remove(&self, statement: &Statement) -> Result<bool> {
        self.store.remove(statement)
    }

    /// Remove every statement matching `pattern`; returns how many were removed
    pub fn remove_matching(&self, pattern: &Pattern) -> Result<usize> {
        let mut removed = 0;
        for statement in self.store.find(pattern)? {
            if self.store.remove(&statement)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn find(&self, pattern: &Pattern) -> Result<Vec<Statement>> {
        self.store.find(pattern)
    }

    pub fn contains(&self, statement: &Statement) -> Result<bool> {
        self.store.contains(statement)
    }

    /// First object of `subject` `predicate`, if any
    pub fn value(&self, subject: &NamedNode, predicate: &NamedNode) -> Result<Option<Term>> {
        let found = self.store.find(&Pattern::any().subject(subject).predicate(predicate))?;
        Ok(found.into_iter().next().map(|s| s.object))
    }

    pub fn caller(&self) -> &CallerContext {
        self.caller
    }
}

/// A queued write with its result channel, type-erased so a batch can hold mixed result types
trait BatchTask: Send {
    fn context(&self) -> &CallerContext;

    /// Run the work against `store`; `false` when it failed
    fn perform(&mut self, store: &dyn GraphStore) -> bool;

    /// Record a failure that happened outside the work itself
    fn fail(&mut self, err: Error);

    /// Hand the outcome to the waiting caller
    fn complete(self: Box<Self>);
}

struct Task<T, F> {
    context: CallerContext,
    work: F,
    outcome: Option<Result<T>>,
    reply: Sender<Result<T>>,
}

impl<T, F> BatchTask for Task<T, F>
where
    T: Send + 'static,
    F: FnMut(&WriteContext<'_>) -> Result<T> + Send + 'static,
{
    fn context(&self) -> &CallerContext {
        &self.context
    }

    fn perform(&mut self, store: &dyn GraphStore) -> bool {
        let ctx = WriteContext::new(store, &self.context);
        let work = &mut self.work;
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| work(&ctx))) {
            Ok(result) => result,
            Err(payload) => Err(Error::TaskPanicked(panic_message(payload.as_ref()))),
        };
        let succeeded = outcome.is_ok();
        self.outcome = Some(outcome);
        succeeded
    }

    fn fail(&mut self, err: Error) {
        self.outcome = Some(Err(err));
    }

    fn complete(self: Box<Self>) {
        let outcome = self.outcome.unwrap_or(Err(Error::SchedulerClosed));
        // the caller may have stopped waiting
        let _ = self.reply.send(outcome);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

type Queue = Sender<Box<dyn BatchTask>>;

/// Serializes concurrent write requests into batched write transactions on one worker thread.
pub struct BatchCommitScheduler {
    store: Arc<dyn GraphStore>,
    queue: Mutex<Option<Queue>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
    terminator: Arc<dyn Terminator>,
}

impl BatchCommitScheduler {
    /// Register `pipeline` on `store` and start the worker thread
    pub fn new(store: Arc<dyn GraphStore>, pipeline: Arc<CommitPipeline>) -> Result<Self> {
        store.register_listener(pipeline.clone());
        let terminator = pipeline.terminator();
        let (sender, receiver) = mpsc::channel::<Box<dyn BatchTask>>();
        let worker_store = Arc::clone(&store);
        let handle = thread::Builder::new()
            .name("batch-commit".to_string())
            .spawn(move || Self::run(receiver, worker_store, pipeline))?;
        let worker_id = handle.thread().id();
        Ok(Self {
            store,
            queue: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(handle)),
            worker_id,
            terminator,
        })
    }

    /// Scheduler without a log or projection
    pub fn unlogged(store: Arc<dyn GraphStore>) -> Result<Self> {
        Self::new(store, Arc::new(CommitPipeline::new()))
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    /// Run `work` in a write transaction and wait for it to commit.
    ///
    /// Called from inside a running write (same thread), `work` runs directly in the current
    /// transaction. Called while the thread holds a read transaction, the process is terminated
    /// with [`Error::TransactionPromotion`].
    pub fn submit_write<T, F>(&self, context: CallerContext, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnMut(&WriteContext<'_>) -> Result<T> + Send + 'static,
    {
        self.submit(context, None, work)
    }

    /// Like [`submit_write`](Self::submit_write) but gives up waiting after `timeout` with
    /// [`Error::Interrupted`]. The work itself is not cancelled.
    pub fn submit_write_timeout<T, F>(
        &self,
        context: CallerContext,
        timeout: Duration,
        work: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: FnMut(&WriteContext<'_>) -> Result<T> + Send + 'static,
    {
        self.submit(context, Some(timeout), work)
    }

    fn submit<T, F>(&self, context: CallerContext, timeout: Option<Duration>, mut work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnMut(&WriteContext<'_>) -> Result<T> + Send + 'static,
    {
        match self.store.transaction_mode() {
            Some(TxnMode::Write) => {
                let ctx = WriteContext::new(self.store.as_ref(), &context);
                return work(&ctx);
            }
            Some(TxnMode::Read) => {
                error!("Can't promote a read transaction to a write transaction");
                self.terminator.terminate(&Error::TransactionPromotion);
            }
            None if thread::current().id() == self.worker_id => {
                return Err(Error::Store("Write submitted from the worker outside a transaction".into()));
            }
            None => {}
        }

        let (reply, outcome) = mpsc::channel();
        let task = Box::new(Task { context, work, outcome: None, reply });
        {
            let queue = self.queue.lock().map_err(|_| Error::SchedulerClosed)?;
            let sender = queue.as_ref().ok_or(Error::SchedulerClosed)?;
            sender.send(task).map_err(|_| Error::SchedulerClosed)?;
        }

        match timeout {
            None => outcome.recv().map_err(|_| Error::SchedulerClosed)?,
            Some(timeout) => match outcome.recv_timeout(timeout) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => Err(Error::Interrupted),
                Err(RecvTimeoutError::Disconnected) => Err(Error::SchedulerClosed),
            },
        }
    }

    /// Stop accepting writes, finish the queued ones and join the worker
    pub fn shutdown(&self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.take();
        }
        if thread::current().id() == self.worker_id {
            return;
        }
        let handle = self.worker.lock().ok().and_then(|mut worker| worker.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Batch commit worker terminated abnormally");
            }
        }
    }

    fn run(receiver: Receiver<Box<dyn BatchTask>>, store: Arc<dyn GraphStore>, pipeline: Arc<CommitPipeline>) {
        while let Ok(first) = receiver.recv() {
            let mut batch = vec![first];
            batch.extend(receiver.try_iter());
            Self::execute(store.as_ref(), &pipeline, batch);
        }
        debug!("Batch commit worker stopped");
    }

    fn execute(store: &dyn GraphStore, pipeline: &CommitPipeline, mut batch: Vec<Box<dyn BatchTask>>) {
        let start = Instant::now();
        let size = batch.len();
        let mut attempts = 0;

        while !batch.is_empty() {
            attempts += 1;
            if let Err(err) = store.begin(TxnMode::Write) {
                error!("Could not start a write transaction: {}", err);
                let message = err.to_string();
                for mut task in batch.drain(..) {
                    task.fail(Error::Store(message.clone()));
                    task.complete();
                }
                break;
            }

            let mut failed = None;
            for (position, task) in batch.iter_mut().enumerate() {
                pipeline.on_metadata(task.context());
                if !task.perform(store) {
                    failed = Some(position);
                    break;
                }
            }

            match failed {
                Some(position) => {
                    if let Err(err) = store.abort() {
                        warn!("Failed to abort the write transaction: {}", err);
                    }
                    let task = batch.remove(position);
                    debug!("Task {} of batch failed, retrying {} tasks", position, batch.len());
                    task.complete();
                }
                None => {
                    if let Err(err) = store.commit() {
                        error!("Commit of {} tasks failed: {}", batch.len(), err);
                        let message = err.to_string();
                        for task in batch.iter_mut() {
                            task.fail(Error::Store(message.clone()));
                        }
                    }
                    for task in batch.drain(..) {
                        task.complete();
                    }
                }
            }
        }

        debug!(
            "Batch of {} tasks done in {} attempts, {}ms",
            size,
            attempts,
            start.elapsed().as_millis()
        );
    }
}

impl Drop for BatchCommitScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryGraphStore;
    use oxigraph::model::Literal;

    fn statement(subject: &str) -> Statement {
        Statement::in_default_graph(
            NamedNode::new(format!("http://example.org/{}", subject)).unwrap(),
            NamedNode::new("http://example.org/p").unwrap(),
            Literal::new_simple_literal("v"),
        )
    }

    #[test]
    fn test_submit_returns_work_result() {
        let store = Arc::new(MemoryGraphStore::new());
        let scheduler = BatchCommitScheduler::unlogged(store.clone()).unwrap();
        let added = scheduler
            .submit_write(CallerContext::system(), |ctx| ctx.add(&statement("a")))
            .unwrap();
        assert!(added);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_nested_write_runs_in_current_transaction() {
        let store = Arc::new(MemoryGraphStore::new());
        let scheduler = Arc::new(BatchCommitScheduler::unlogged(store.clone()).unwrap());
        let inner = Arc::clone(&scheduler);
        let count = scheduler
            .submit_write(CallerContext::system(), move |ctx| {
                ctx.add(&statement("outer"))?;
                inner.submit_write(CallerContext::system(), |nested| nested.add(&statement("inner")))?;
                Ok(ctx.find(&Pattern::any())?.len())
            })
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_replace_value_inside_one_write() {
        let store = Arc::new(MemoryGraphStore::new());
        let scheduler = BatchCommitScheduler::unlogged(store.clone()).unwrap();
        scheduler.submit_write(CallerContext::system(), |ctx| ctx.add(&statement("a"))).unwrap();

        let subject = NamedNode::new("http://example.org/a").unwrap();
        let predicate = NamedNode::new("http://example.org/p").unwrap();
        let (previous, removed, user) = scheduler
            .submit_write(CallerContext::new("u1", "Jane"), {
                let (subject, predicate) = (subject.clone(), predicate.clone());
                move |ctx| {
                    let previous = ctx.value(&subject, &predicate)?;
                    let removed =
                        ctx.remove_matching(&Pattern::any().subject(&subject).predicate(&predicate))?;
                    ctx.add(&Statement::in_default_graph(
                        subject.clone(),
                        predicate.clone(),
                        Literal::new_simple_literal("w"),
                    ))?;
                    Ok((previous, removed, ctx.caller().user_id.clone()))
                }
            })
            .unwrap();

        assert_eq!(previous, Some(Term::from(Literal::new_simple_literal("v"))));
        assert_eq!(removed, 1);
        assert_eq!(user.as_deref(), Some("u1"));
        assert!(!store.contains(&statement("a")).unwrap());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_panicking_task_is_reported() {
        let store = Arc::new(MemoryGraphStore::new());
        let scheduler = BatchCommitScheduler::unlogged(store).unwrap();
        let result: Result<()> =
            scheduler.submit_write(CallerContext::system(), |_| panic!("boom"));
        match result {
            Err(Error::TaskPanicked(message)) => assert_eq!(message, "boom"),
            other => panic!("unexpected outcome {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let store = Arc::new(MemoryGraphStore::new());
        let scheduler = BatchCommitScheduler::unlogged(store).unwrap();
        scheduler.shutdown();
        let result = scheduler.submit_write(CallerContext::system(), |_| Ok(()));
        assert!(matches!(result, Err(Error::SchedulerClosed)));
    }
}
