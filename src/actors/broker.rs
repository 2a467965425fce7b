//! Session broker - the actor primitive every hub actor is built on
//!
//! An [`Actor`] is a handle to one worker task that owns a piece of state and
//! drains a private queue. Jobs on the queue run one at a time to completion,
//! so a job never observes another job's half-applied mutation and no lock
//! guards the state.
//!
//! ## Message Flow
//!
//! ```text
//! run_async(job) ──┐
//! run_sync(job) ───┼──► queue ──► worker ──► job(&mut state) ──► on_complete(result)
//! wait / wakeup ───┘                 │
//!                                    └──► sessions: pending waits + parked wakeups
//! ```
//!
//! Sessions let one actor launch work on another and suspend until it
//! finishes: [`Actor::prepare_wait`] reserves an id, the remote job's
//! completion calls [`Actor::wakeup`], and [`Actor::wait`] resolves once both
//! sides have arrived, in either order. Waiting only parks a oneshot in the
//! worker, so the waiting actor keeps running unrelated jobs.

use std::any::Any;
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, trace};

use crate::error::{Error, Result};

pub type SessionId = u64;

/// Type-erased job result carried by a session
pub type Reply = Box<dyn Any + Send>;

/// Completion callback of [`Actor::run_async`]
pub type Callback<R> = Box<dyn FnOnce(Result<R>) + Send>;

trait Job<S>: Send {
    fn run(self: Box<Self>, state: &mut S, actor: &Actor<S>);
    fn reject(self: Box<Self>, error: Error);
}

struct Task<F, R> {
    job: F,
    on_complete: Option<Callback<R>>,
}

impl<S, F, R> Job<S> for Task<F, R>
where
    S: Send + 'static,
    F: FnOnce(&mut S, &Actor<S>) -> Result<R> + Send,
    R: Send + 'static,
{
    fn run(self: Box<Self>, state: &mut S, actor: &Actor<S>) {
        let Task { job, on_complete } = *self;
        let result = catch_unwind(AssertUnwindSafe(|| job(state, actor)))
            .unwrap_or_else(|payload| Err(actor.panicked(payload)));
        if let Some(on_complete) = on_complete {
            on_complete(result);
        }
    }

    fn reject(self: Box<Self>, error: Error) {
        if let Some(on_complete) = self.on_complete {
            on_complete(Err(error));
        }
    }
}

enum Message<S> {
    Job(Box<dyn Job<S>>),
    Wait {
        session: SessionId,
        respond_to: oneshot::Sender<Result<Reply>>,
    },
    Wakeup {
        session: SessionId,
        result: Result<Reply>,
    },
    #[cfg(test)]
    Sessions {
        respond_to: oneshot::Sender<(usize, usize)>,
    },
}

/// Handle to an actor owning state `S`
pub struct Actor<S> {
    name: Arc<str>,
    sender: mpsc::UnboundedSender<Message<S>>,
    token: CancellationToken,
    sessions: Arc<AtomicU64>,
}

impl<S> Clone for Actor<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            sender: self.sender.clone(),
            token: self.token.clone(),
            sessions: self.sessions.clone(),
        }
    }
}

impl<S> std::fmt::Debug for Actor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Actor")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<S> Actor<S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop the worker and signal every flow spawned on this actor
    pub fn close(&self) {
        if !self.token.is_cancelled() {
            debug!(actor = %self.name, "closing actor");
        }
        self.token.cancel();
    }

    fn closed(&self) -> Error {
        Error::ActorClosed(self.name.to_string())
    }
}

impl<S: Send + 'static> Actor<S> {
    /// Spawn the worker for `state` and return its handle
    pub fn spawn(name: impl Into<String>, state: S) -> Self {
        Self::spawn_with_token(name, state, CancellationToken::new())
    }

    /// Like [`spawn`](Self::spawn), closing the actor once `token` is
    /// cancelled. Pass a child token to tie the actor to a parent.
    pub fn spawn_with_token(name: impl Into<String>, state: S, token: CancellationToken) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let actor = Self {
            name: Arc::from(name.into()),
            sender,
            token,
            sessions: Arc::new(AtomicU64::new(0)),
        };

        let worker = Worker {
            actor: actor.clone(),
            state,
            receiver,
            pending: HashMap::new(),
            early: HashMap::new(),
        };
        tokio::spawn(worker.run());

        actor
    }

    /// Queue `job` without waiting for it. `on_complete` receives the result
    /// once the job ran, or [`Error::ActorClosed`] if it never will.
    pub fn run_async<R, F>(&self, job: F, on_complete: Option<Callback<R>>)
    where
        F: FnOnce(&mut S, &Actor<S>) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let task: Box<dyn Job<S>> = Box::new(Task { job, on_complete });
        if self.is_closed() {
            task.reject(self.closed());
            return;
        }
        if let Err(mpsc::error::SendError(Message::Job(task))) =
            self.sender.send(Message::Job(task))
        {
            task.reject(self.closed());
        }
    }

    /// Queue `job` and suspend until it ran
    pub async fn run_sync<R, F>(&self, job: F) -> Result<R>
    where
        F: FnOnce(&mut S, &Actor<S>) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let (respond_to, response) = oneshot::channel();
        self.run_async(
            job,
            Some(Box::new(move |result| {
                let _ = respond_to.send(result);
            })),
        );
        response.await.unwrap_or_else(|_| Err(self.closed()))
    }

    /// Run an async flow in this actor's context. The flow is dropped when the
    /// actor closes; a panic inside it is logged and does not reach the worker.
    pub fn spawn_flow<F>(&self, flow: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let actor = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = actor.token.cancelled() => {
                    trace!(actor = %actor.name, "flow cancelled");
                }
                outcome = AssertUnwindSafe(flow).catch_unwind() => {
                    if let Err(payload) = outcome {
                        actor.panicked(payload);
                    }
                }
            }
        })
    }

    /// Reserve a session id for a later [`wait`](Self::wait)
    pub fn prepare_wait(&self) -> SessionId {
        self.sessions.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Suspend until `session` is woken, returning the reply as `R`
    pub async fn wait<R: Send + 'static>(&self, session: SessionId) -> Result<R> {
        let response = self.register_wait(session)?;
        self.receive(session, response).await
    }

    fn register_wait(&self, session: SessionId) -> Result<oneshot::Receiver<Result<Reply>>> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(Message::Wait {
                session,
                respond_to,
            })
            .map_err(|_| self.closed())?;
        Ok(response)
    }

    async fn receive<R: Send + 'static>(
        &self,
        session: SessionId,
        response: oneshot::Receiver<Result<Reply>>,
    ) -> Result<R> {
        let reply = response.await.map_err(|_| self.closed())??;
        reply
            .downcast::<R>()
            .map(|reply| *reply)
            .map_err(|_| Error::ReplyType(session))
    }

    /// Complete `session`; parked until the matching wait registers
    pub fn wakeup<R: Send + 'static>(&self, session: SessionId, result: Result<R>) {
        let result = result.map(|reply| Box::new(reply) as Reply);
        if self.sender.send(Message::Wakeup { session, result }).is_err() {
            trace!(actor = %self.name, session, "wakeup after close dropped");
        }
    }

    /// Run `job` on `target` and suspend this actor's flow until it finished
    pub async fn call<T, R, F>(&self, target: &Actor<T>, job: F) -> Result<R>
    where
        T: Send + 'static,
        F: FnOnce(&mut T, &Actor<T>) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        // the wait is queued ahead of any wakeup, so a dropped call never
        // leaves a parked reply behind
        let session = self.prepare_wait();
        let response = self.register_wait(session)?;
        let waiter = self.clone();
        target.run_async(
            job,
            Some(Box::new(move |result| waiter.wakeup(session, result))),
        );
        self.receive(session, response).await
    }

    /// Number of pending waits and parked wakeups held by the worker
    #[cfg(test)]
    async fn sessions_in_flight(&self) -> (usize, usize) {
        let (respond_to, response) = oneshot::channel();
        let _ = self.sender.send(Message::Sessions { respond_to });
        response.await.unwrap_or_default()
    }

    fn panicked(&self, payload: Box<dyn Any + Send>) -> Error {
        let message = panic_message(payload.as_ref());
        error!(
            actor = %self.name,
            "recovered from panic: {message}\n{}",
            Backtrace::force_capture()
        );
        Error::Panicked {
            actor: self.name.to_string(),
            message,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

struct Worker<S> {
    actor: Actor<S>,
    state: S,
    receiver: mpsc::UnboundedReceiver<Message<S>>,
    pending: HashMap<SessionId, oneshot::Sender<Result<Reply>>>,
    early: HashMap<SessionId, Result<Reply>>,
}

impl<S: Send + 'static> Worker<S> {
    #[instrument(skip(self), fields(actor = %self.actor.name))]
    async fn run(mut self) {
        debug!("starting actor");

        loop {
            tokio::select! {
                biased;

                _ = self.actor.token.cancelled() => break,

                message = self.receiver.recv() => match message {
                    Some(message) => self.handle(message),
                    None => break,
                },
            }
        }

        self.receiver.close();
        while let Ok(message) = self.receiver.try_recv() {
            if let Message::Job(job) = message {
                job.reject(self.actor.closed());
            }
        }
        // dropping the pending senders fails their waits with ActorClosed
        self.pending.clear();

        debug!("actor stopped");
    }

    fn handle(&mut self, message: Message<S>) {
        match message {
            Message::Job(job) => job.run(&mut self.state, &self.actor),

            Message::Wait {
                session,
                respond_to,
            } => match self.early.remove(&session) {
                Some(result) => {
                    let _ = respond_to.send(result);
                }
                None => {
                    self.pending.insert(session, respond_to);
                }
            },

            Message::Wakeup { session, result } => match self.pending.remove(&session) {
                Some(respond_to) => {
                    if respond_to.send(result).is_err() {
                        trace!(session, "waiter gone, dropping wakeup");
                    }
                }
                None => {
                    trace!(session, "parking early wakeup");
                    self.early.insert(session, result);
                }
            },

            #[cfg(test)]
            Message::Sessions { respond_to } => {
                let _ = respond_to.send((self.pending.len(), self.early.len()));
            }
        }
    }
}
