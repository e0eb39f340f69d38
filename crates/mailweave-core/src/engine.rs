//! Engine startup: spawns the workers and wires them to an orchestrator.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;

use crate::account::Account;
use crate::orchestrator::Orchestrator;
use crate::service::{ImapTransport, MailSubmitter, MailTransport, SmtpSubmitter};
use crate::status::StatusLog;
use crate::store::MailStore;
use crate::worker::{AccountWorker, PersistenceWorker, spawn_account, spawn_persistence};

const fn default_inbox_capacity() -> usize {
    32
}

const fn default_response_capacity() -> usize {
    64
}

const fn default_tick_interval_ms() -> u64 {
    16
}

/// Tuning knobs of the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity of each worker inbox.
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
    /// Capacity of the shared response channel.
    #[serde(default = "default_response_capacity")]
    pub response_capacity: usize,
    /// Render tick period in milliseconds.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Fail requests unanswered after this many seconds. Off by default.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    /// Directory of cached full messages.
    #[serde(default)]
    pub cache_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: default_inbox_capacity(),
            response_capacity: default_response_capacity(),
            tick_interval_ms: default_tick_interval_ms(),
            request_timeout_secs: None,
            cache_dir: PathBuf::new(),
        }
    }
}

impl EngineConfig {
    /// Render tick period.
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Request timeout, if enabled.
    #[must_use]
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

/// Starts one IMAP/SMTP worker per account plus the persistence worker.
///
/// Must be called from within a tokio runtime.
pub fn start<C>(
    accounts: &[Account],
    store: MailStore,
    config: &EngineConfig,
    status: StatusLog,
) -> Orchestrator<C> {
    start_with(accounts, store, config, status, |account| {
        (
            ImapTransport::new(&account.name, account.imap.clone()),
            SmtpSubmitter::new(&account.name, account.smtp.clone()),
        )
    })
}

/// Like [`start`], with the transports built by `connect`.
pub fn start_with<C, T, S, F>(
    accounts: &[Account],
    store: MailStore,
    config: &EngineConfig,
    status: StatusLog,
    mut connect: F,
) -> Orchestrator<C>
where
    T: MailTransport + 'static,
    S: MailSubmitter + 'static,
    F: FnMut(&Account) -> (T, S),
{
    let (response_tx, response_rx) = mpsc::channel(config.response_capacity.max(1));

    let persistence = spawn_persistence(
        PersistenceWorker::new(store),
        config.inbox_capacity,
        response_tx.clone(),
    );
    let mut orchestrator = Orchestrator::new(persistence.inbox, response_rx, status.clone())
        .with_request_timeout(config.request_timeout())
        .with_tick_interval(config.tick_interval());
    orchestrator.add_task(persistence.task);

    for account in accounts {
        let (transport, submitter) = connect(account);
        let worker = AccountWorker::new(
            account,
            transport,
            submitter,
            config.cache_dir.clone(),
            status.clone(),
        );
        let handle = spawn_account(worker, config.inbox_capacity, response_tx.clone());
        orchestrator.add_account(account.name.clone(), handle.inbox);
        orchestrator.add_task(handle.task);
    }

    info!("Engine started with {} account(s)", accounts.len());
    orchestrator
}
