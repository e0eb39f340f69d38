//! The control loop tying the front end to the workers.
//!
//! The orchestrator hands out correlation ids, sends requests to the
//! workers and calls the callback registered for each id once the answer
//! arrives. Nothing here blocks: a request that cannot be queued is
//! answered right away with [`Response::Error`] through a local queue.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::Error;
use crate::message::{CorrelationId, Envelope, Request, Response, Target};
use crate::status::StatusLog;

/// Completion callback of a request.
pub type Callback<C> = Box<dyn FnOnce(&mut Orchestrator<C>, &mut C, Response) + Send>;

/// Whether the control loop keeps running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep going.
    Continue,
    /// Leave the loop.
    Quit,
}

/// The user-facing side driven by [`Orchestrator::run`].
pub trait Frontend: Sized {
    /// Input event type, e.g. a key press or a command line.
    type Event: Send + 'static;

    /// Called once before the loop starts.
    fn start(&mut self, _orchestrator: &mut Orchestrator<Self>) {}

    /// Handles one input event.
    fn handle_event(&mut self, orchestrator: &mut Orchestrator<Self>, event: Self::Event) -> Flow;

    /// Called on every tick.
    fn render(&mut self) {}

    /// Returns true once the front end wants to stop.
    fn is_done(&self) -> bool {
        false
    }
}

struct Pending<C> {
    kind: &'static str,
    issued_at: Instant,
    callback: Option<Callback<C>>,
}

/// Routes requests to workers and responses to callbacks.
///
/// `C` is the context handed to every callback, normally the front end.
pub struct Orchestrator<C> {
    next_id: u64,
    pending: HashMap<CorrelationId, Pending<C>>,
    accounts: HashMap<String, mpsc::Sender<Envelope<Request>>>,
    store: mpsc::Sender<Envelope<Request>>,
    responses: mpsc::Receiver<Envelope<Response>>,
    local: VecDeque<Envelope<Response>>,
    request_timeout: Option<Duration>,
    tick_interval: Duration,
    status: StatusLog,
    tasks: Vec<JoinHandle<()>>,
}

impl<C> std::fmt::Debug for Orchestrator<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("next_id", &self.next_id)
            .field("pending", &self.pending.len())
            .field("accounts", &self.accounts.keys().collect::<Vec<_>>())
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl<C> Orchestrator<C> {
    /// Creates an orchestrator talking to the persistence worker through
    /// `store` and reading every worker's answers from `responses`.
    #[must_use]
    pub fn new(
        store: mpsc::Sender<Envelope<Request>>,
        responses: mpsc::Receiver<Envelope<Response>>,
        status: StatusLog,
    ) -> Self {
        Self {
            next_id: 0,
            pending: HashMap::new(),
            accounts: HashMap::new(),
            store,
            responses,
            local: VecDeque::new(),
            request_timeout: None,
            tick_interval: Duration::from_millis(16),
            status,
            tasks: Vec::new(),
        }
    }

    /// Registers the inbox of an account worker.
    pub fn add_account(&mut self, name: impl Into<String>, inbox: mpsc::Sender<Envelope<Request>>) {
        self.accounts.insert(name.into(), inbox);
    }

    /// Keeps a worker task so [`Orchestrator::shutdown`] can wait for it.
    pub fn add_task(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    /// Expires requests that stay unanswered longer than `timeout`.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the render tick period.
    #[must_use]
    pub const fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Shared status log.
    #[must_use]
    pub const fn status(&self) -> &StatusLog {
        &self.status
    }

    /// Names of the configured accounts, sorted.
    #[must_use]
    pub fn accounts(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.accounts.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of requests still waiting for an answer.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn allocate_id(&mut self) -> CorrelationId {
        self.next_id += 1;
        CorrelationId(self.next_id)
    }

    fn send(
        &mut self,
        target: Target,
        account: &str,
        request: Request,
        callback: Option<Callback<C>>,
    ) -> CorrelationId {
        let id = self.allocate_id();
        let kind = request.kind();
        self.pending.insert(
            id,
            Pending {
                kind,
                issued_at: Instant::now(),
                callback,
            },
        );

        let inbox = match target {
            Target::Account => self.accounts.get(account),
            Target::Store => Some(&self.store),
        };
        let failure = match inbox {
            None => Some(Error::UnknownAccount(account.to_string()).to_string()),
            Some(inbox) => match inbox.try_send(Envelope::new(id, account, request)) {
                Ok(()) => None,
                Err(TrySendError::Full(_)) => Some(format!("inbox full ({target:?} {account})")),
                Err(TrySendError::Closed(_)) => {
                    Some(format!("worker stopped ({target:?} {account})"))
                }
            },
        };

        match failure {
            Some(reason) => {
                warn!("{kind} {id} not dispatched: {reason}");
                self.local
                    .push_back(Envelope::new(id, account, Response::Error(reason)));
            }
            None => debug!("Dispatched {kind} {id} to {target:?} {account}"),
        }
        id
    }

    /// Sends `request` to a worker and registers `on_result` for its
    /// answer.
    pub fn dispatch<F>(
        &mut self,
        target: Target,
        account: &str,
        request: Request,
        on_result: F,
    ) -> CorrelationId
    where
        F: FnOnce(&mut Self, &mut C, Response) + Send + 'static,
    {
        self.send(target, account, request, Some(Box::new(on_result)))
    }

    /// Sends `request` without a callback. Failures end up in the status
    /// log.
    pub fn post(&mut self, target: Target, account: &str, request: Request) -> CorrelationId {
        self.send(target, account, request, None)
    }

    /// Asks the store and the server at once.
    ///
    /// The store's answer goes to `on_cache`. The server's answer is
    /// written back to the store when it has a stored form, and the result
    /// of that write goes to `on_done`; otherwise `on_done` receives the
    /// server's answer directly. The two callbacks may fire in either
    /// order.
    pub fn read_through<F, G>(&mut self, account: &str, request: Request, on_cache: F, on_done: G)
    where
        F: FnOnce(&mut Self, &mut C, Response) + Send + 'static,
        G: FnOnce(&mut Self, &mut C, Response) + Send + 'static,
    {
        self.dispatch(Target::Store, account, request.clone(), on_cache);

        let owner = account.to_string();
        self.dispatch(
            Target::Account,
            account,
            request,
            move |orchestrator, ctx, response| match response.write_back() {
                Ok(write) => {
                    orchestrator.dispatch(Target::Store, &owner, write, on_done);
                }
                Err(response) => on_done(orchestrator, ctx, response),
            },
        );
    }

    /// Invokes the callback registered for `envelope`, at most once.
    pub fn route_response(&mut self, ctx: &mut C, envelope: Envelope<Response>) {
        let Envelope { id, account, body } = envelope;
        match self.pending.remove(&id) {
            Some(Pending {
                callback: Some(callback),
                ..
            }) => callback(self, ctx, body),
            Some(Pending {
                callback: None,
                kind,
                ..
            }) => {
                if let Response::Error(e) = body {
                    warn!("{kind} {id} for {account} failed: {e}");
                    self.status.error(format!("{account}: {e}"));
                }
            }
            None => debug!("Dropping response {id} for {account}: no callback registered"),
        }
    }

    /// Routes every locally generated response. Returns how many there were.
    pub fn drain_local(&mut self, ctx: &mut C) -> usize {
        let mut routed = 0;
        while let Some(envelope) = self.local.pop_front() {
            self.route_response(ctx, envelope);
            routed += 1;
        }
        routed
    }

    /// Routes local responses, or else waits for one worker response.
    ///
    /// Returns false once every worker has stopped.
    pub async fn next_response(&mut self, ctx: &mut C) -> bool {
        if self.drain_local(ctx) > 0 {
            return true;
        }
        match self.responses.recv().await {
            Some(envelope) => {
                self.route_response(ctx, envelope);
                true
            }
            None => false,
        }
    }

    /// Fails every request older than the configured timeout as of `now`.
    ///
    /// A response arriving later is dropped.
    pub fn expire_overdue(&mut self, ctx: &mut C, now: Instant) -> usize {
        let Some(timeout) = self.request_timeout else {
            return 0;
        };

        let mut overdue: Vec<CorrelationId> = self
            .pending
            .iter()
            .filter(|(_, pending)| now.saturating_duration_since(pending.issued_at) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        overdue.sort_unstable();

        for id in &overdue {
            if let Some(pending) = self.pending.remove(id) {
                warn!("{} {id} timed out", pending.kind);
                match pending.callback {
                    Some(callback) => callback(self, ctx, Response::error("request timed out")),
                    None => self.status.error(format!("{} timed out", pending.kind)),
                }
            }
        }
        overdue.len()
    }

    /// Closes every inbox and waits for the workers to finish.
    pub async fn shutdown(self) {
        let Self {
            accounts,
            store,
            responses,
            tasks,
            ..
        } = self;
        drop(accounts);
        drop(store);
        drop(responses);

        for task in tasks {
            if let Err(e) = task.await {
                warn!("Worker ended abnormally: {e}");
            }
        }
        info!("All workers stopped");
    }
}

impl<C: Frontend> Orchestrator<C> {
    /// Runs the control loop until the front end quits or every worker
    /// stops.
    ///
    /// Each turn routes local responses first, then waits for a worker
    /// response, an input event or the render tick.
    pub async fn run(&mut self, frontend: &mut C, mut input: mpsc::Receiver<C::Event>) {
        frontend.start(self);

        let mut tick = tokio::time::interval(self.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut input_open = true;

        loop {
            self.drain_local(frontend);
            if frontend.is_done() {
                break;
            }

            tokio::select! {
                response = self.responses.recv() => match response {
                    Some(envelope) => self.route_response(frontend, envelope),
                    None => {
                        warn!("Every worker stopped");
                        break;
                    }
                },
                event = input.recv(), if input_open => match event {
                    Some(event) => {
                        if frontend.handle_event(self, event) == Flow::Quit {
                            break;
                        }
                    }
                    None => input_open = false,
                },
                _ = tick.tick() => {
                    self.expire_overdue(frontend, Instant::now());
                    frontend.render();
                }
            }
        }

        frontend.render();
    }
}
