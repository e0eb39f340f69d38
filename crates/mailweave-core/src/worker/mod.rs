//! Worker tasks.
//!
//! Each worker runs on its own tokio task, reads requests from a bounded
//! inbox and answers on the response channel shared by all workers.

pub mod account;
pub mod persistence;

pub use account::AccountWorker;
pub use persistence::PersistenceWorker;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::message::{Envelope, Request, Response};
use crate::service::{MailSubmitter, MailTransport};

/// Inbox and task of a spawned worker.
#[derive(Debug)]
pub struct WorkerHandle {
    /// Sending half of the worker's inbox.
    pub inbox: mpsc::Sender<Envelope<Request>>,
    /// The worker task.
    pub task: JoinHandle<()>,
}

/// Spawns an account worker with an inbox of `capacity` requests.
pub fn spawn_account<T, S>(
    worker: AccountWorker<T, S>,
    capacity: usize,
    responses: mpsc::Sender<Envelope<Response>>,
) -> WorkerHandle
where
    T: MailTransport + 'static,
    S: MailSubmitter + 'static,
{
    let (inbox, requests) = mpsc::channel(capacity.max(1));
    let task = tokio::spawn(worker.run(requests, responses));
    WorkerHandle { inbox, task }
}

/// Spawns the persistence worker with an inbox of `capacity` requests.
pub fn spawn_persistence(
    worker: PersistenceWorker,
    capacity: usize,
    responses: mpsc::Sender<Envelope<Response>>,
) -> WorkerHandle {
    let (inbox, requests) = mpsc::channel(capacity.max(1));
    let task = tokio::spawn(worker.run(requests, responses));
    WorkerHandle { inbox, task }
}
