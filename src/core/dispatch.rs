//! Dual-context dispatcher.
//!
//! The pipeline runs on exactly two logical workers:
//!
//! * **pipeline** owns every piece of mutable pipeline state. Operations,
//!   session callbacks and acknowledgements are all marshalled here.
//! * **callback** runs user supplied code (completion callbacks, event
//!   handlers) so that slow or misbehaving user code never stalls the
//!   pipeline worker.
//!
//! Each worker is a named OS thread draining a FIFO queue, so at most one
//! submitted closure per context executes at any instant.
//!
//! Instead of a thread-local "am I on the pipeline thread" flag, every
//! dispatched closure receives a [`Cx`] describing the context it runs on.
//! Code that needs a context passes its `Cx` along; a dispatch made with a
//! `Cx` that is already on the target context runs inline, which is what keeps
//! a worker from waiting on itself.
//!
//! # Usage
//!
//! ```ignore
//! let dispatcher = Dispatcher::new(&PipelineConfig::default())?;
//! let value = dispatcher.run_blocking(&Cx::external(), ContextId::Pipeline, |cx| {
//!     cx.assert_on(ContextId::Pipeline);
//!     41 + 1
//! })?;
//! assert_eq!(value, 42);
//! dispatcher.shutdown();
//! ```

use std::{
    any::Any,
    fmt, io,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, TryLockError},
    thread::{self, JoinHandle},
};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};

use crate::config::pipeline::PipelineConfig;

/// Identifies one of the two execution contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextId {
    Pipeline,
    Callback,
}

impl ContextId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextId::Pipeline => "pipeline",
            ContextId::Callback => "callback",
        }
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The execution context a piece of code is running on.
///
/// Workers hand a `Cx` flagged for their context to every closure they run.
/// Code outside both workers uses [`Cx::external`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cx {
    on: Option<ContextId>,
}

impl Cx {
    /// Context value for code not running on either worker.
    pub const fn external() -> Self {
        Self { on: None }
    }

    /// Context value claiming to run on `id`.
    ///
    /// Workers build this for their own closures. Tests use it to exercise
    /// the "already on the context" paths without a worker.
    pub const fn on(id: ContextId) -> Self {
        Self { on: Some(id) }
    }

    pub fn current(&self) -> Option<ContextId> {
        self.on
    }

    pub fn is_on(&self, id: ContextId) -> bool {
        self.on == Some(id)
    }

    /// Panics unless running on `id`.
    ///
    /// A violation is a programming error and is never reported as a
    /// recoverable failure.
    #[track_caller]
    pub fn assert_on(&self, id: ContextId) {
        if !self.is_on(id) {
            panic!(
                "must be called on the {} context, but was called on {}",
                id,
                self.on.map_or("an external thread", |c| c.as_str())
            );
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("the {0} context has shut down")]
    Closed(ContextId),

    #[error("the {0} context dropped the call before running it")]
    Dropped(ContextId),

    #[error("failed to start the {context} worker thread")]
    Spawn {
        context: ContextId,
        #[source]
        source: io::Error,
    },
}

type Job = Box<dyn FnOnce(&Cx) + Send + 'static>;

enum Command {
    Run(Job),
    Shutdown,
}

/// One named worker thread and its FIFO queue.
struct ExecutionContext {
    id: ContextId,
    tx: mpsc::UnboundedSender<Command>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutionContext {
    fn start(id: ContextId, prefix: &str) -> Result<Self, DispatchError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let name = format!("{prefix}-{id}");
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(id, rx))
            .map_err(|source| DispatchError::Spawn {
                context: id,
                source,
            })?;
        debug!("Started {} context on thread {}", id, name);
        Ok(Self {
            id,
            tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    fn submit(&self, job: Job) -> Result<(), DispatchError> {
        self.tx
            .send(Command::Run(job))
            .map_err(|_| DispatchError::Closed(self.id))
    }

    fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);

        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(handle) = handle else {
            return;
        };

        if handle.thread().id() == thread::current().id() {
            // Shutting down from our own worker: the loop exits after the
            // current job returns, joining here would wait forever.
            debug!("{} context shut down from its own worker", self.id);
            return;
        }
        if handle.join().is_err() {
            warn!("{} worker thread terminated abnormally", self.id);
        }
        debug!("{} context stopped", self.id);
    }
}

fn worker_loop(id: ContextId, mut rx: mpsc::UnboundedReceiver<Command>) {
    let cx = Cx::on(id);
    while let Some(command) = rx.blocking_recv() {
        match command {
            Command::Run(job) => job(&cx),
            Command::Shutdown => {
                trace!("{} worker received shutdown", id);
                break;
            }
        }
    }
}

struct Inner {
    pipeline: ExecutionContext,
    callback: ExecutionContext,
}

/// Owner of the pipeline and callback execution contexts.
///
/// Cheap to clone; all clones share the same two workers. The contexts live
/// until [`Dispatcher::shutdown`] is called.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Starts both worker threads, named `{prefix}-pipeline` and
    /// `{prefix}-callback`.
    pub fn new(config: &PipelineConfig) -> Result<Self, DispatchError> {
        let prefix = config.thread_name_prefix.as_str();
        let pipeline = ExecutionContext::start(ContextId::Pipeline, prefix)?;
        let callback = match ExecutionContext::start(ContextId::Callback, prefix) {
            Ok(callback) => callback,
            Err(e) => {
                pipeline.shutdown();
                return Err(e);
            }
        };
        Ok(Self {
            inner: Arc::new(Inner { pipeline, callback }),
        })
    }

    fn context(&self, id: ContextId) -> &ExecutionContext {
        match id {
            ContextId::Pipeline => &self.inner.pipeline,
            ContextId::Callback => &self.inner.callback,
        }
    }

    /// Runs `f` on `target` without waiting for it.
    ///
    /// When `cx` is already on `target`, `f` runs inline before this returns
    /// and the completion is already resolved. Otherwise `f` is queued behind
    /// everything previously submitted to `target`.
    ///
    /// The returned [`Completion`] may be dropped. A panic inside `f` with
    /// nobody waiting is logged at error level.
    pub fn run_async<F, R>(&self, cx: &Cx, target: ContextId, f: F) -> Completion<R>
    where
        F: FnOnce(&Cx) -> R + Send + 'static,
        R: Send + 'static,
    {
        if cx.is_on(target) {
            return Completion::ready(target, f(cx));
        }

        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |cx: &Cx| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(cx)));
            if let Err(Err(payload)) = tx.send(outcome) {
                error!(
                    context = %target,
                    "Exception caught in background thread. Unable to handle: {}",
                    panic_message(&*payload)
                );
            }
        });

        match self.context(target).submit(job) {
            Ok(()) => Completion::pending(target, rx),
            Err(e) => Completion::failed(target, e),
        }
    }

    /// Runs `f` on `target` and blocks the calling thread until it returns.
    ///
    /// A panic inside `f` is re-raised here. Must not be called from inside an
    /// async runtime unless `cx` is already on `target`; use [`Dispatcher::run`]
    /// there instead.
    pub fn run_blocking<F, R>(&self, cx: &Cx, target: ContextId, f: F) -> Result<R, DispatchError>
    where
        F: FnOnce(&Cx) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.run_async(cx, target, f).wait_blocking()
    }

    /// Runs `f` on `target` and suspends the calling task until it returns.
    pub async fn run<F, R>(&self, cx: &Cx, target: ContextId, f: F) -> Result<R, DispatchError>
    where
        F: FnOnce(&Cx) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.run_async(cx, target, f).wait().await
    }

    #[track_caller]
    pub fn assert_context(&self, cx: &Cx, expected: ContextId) {
        cx.assert_on(expected);
    }

    /// Stops both workers, pipeline first.
    ///
    /// Work already queued ahead of the stop request still runs; anything
    /// queued after it is dropped and its waiters receive
    /// [`DispatchError::Dropped`]. Calling this more than once is harmless.
    pub fn shutdown(&self) {
        self.inner.pipeline.shutdown();
        self.inner.callback.shutdown();
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

enum CompletionState<R> {
    Ready(R),
    Pending(oneshot::Receiver<thread::Result<R>>),
    Failed(DispatchError),
}

/// Handle to the result of a dispatched closure.
#[must_use = "dropping a completion discards the result; this is only fine for fire-and-forget calls"]
pub struct Completion<R> {
    context: ContextId,
    state: CompletionState<R>,
}

impl<R> Completion<R> {
    fn ready(context: ContextId, value: R) -> Self {
        Self {
            context,
            state: CompletionState::Ready(value),
        }
    }

    fn pending(context: ContextId, rx: oneshot::Receiver<thread::Result<R>>) -> Self {
        Self {
            context,
            state: CompletionState::Pending(rx),
        }
    }

    fn failed(context: ContextId, error: DispatchError) -> Self {
        Self {
            context,
            state: CompletionState::Failed(error),
        }
    }

    /// Returns true when the value is available without waiting.
    pub fn is_ready(&self) -> bool {
        matches!(self.state, CompletionState::Ready(_))
    }

    pub async fn wait(self) -> Result<R, DispatchError> {
        match self.state {
            CompletionState::Ready(value) => Ok(value),
            CompletionState::Failed(e) => Err(e),
            CompletionState::Pending(rx) => unwrap_outcome(self.context, rx.await),
        }
    }

    /// Blocks the calling thread until the closure finishes.
    ///
    /// # Panics
    ///
    /// Panics when called from within an async runtime while the result is
    /// still pending, and re-raises a panic from the closure.
    pub fn wait_blocking(self) -> Result<R, DispatchError> {
        match self.state {
            CompletionState::Ready(value) => Ok(value),
            CompletionState::Failed(e) => Err(e),
            CompletionState::Pending(rx) => unwrap_outcome(self.context, rx.blocking_recv()),
        }
    }
}

fn unwrap_outcome<R>(
    context: ContextId,
    received: Result<thread::Result<R>, oneshot::error::RecvError>,
) -> Result<R, DispatchError> {
    match received {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(payload)) => panic::resume_unwind(payload),
        Err(_) => Err(DispatchError::Dropped(context)),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Value that may only be touched from one execution context.
///
/// Access goes through [`Affine::with`], which checks the caller's [`Cx`]
/// and then takes the inner lock without blocking. Because the owning
/// context is single-threaded the lock is never contended in correct code;
/// finding it held means a re-entrant access from inside `with`, which is
/// treated as the same programming error as a wrong-context access.
pub struct Affine<T> {
    owner: ContextId,
    value: Mutex<T>,
}

impl<T> Affine<T> {
    pub fn new(owner: ContextId, value: T) -> Self {
        Self {
            owner,
            value: Mutex::new(value),
        }
    }

    pub fn owner(&self) -> ContextId {
        self.owner
    }

    #[track_caller]
    pub fn with<R>(&self, cx: &Cx, f: impl FnOnce(&mut T) -> R) -> R {
        cx.assert_on(self.owner);
        let mut guard = match self.value.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => panic!(
                "{} state accessed re-entrantly or from two threads at once",
                self.owner
            ),
        };
        f(&mut guard)
    }
}

impl<T> fmt::Debug for Affine<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Affine")
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}
