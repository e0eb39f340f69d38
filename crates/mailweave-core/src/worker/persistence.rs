//! The single writer of the mail store.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::message::{Envelope, Request, Response};
use crate::store::MailStore;
use crate::{Error, Result};

/// Serves store requests for every account, one transaction at a time.
#[derive(Debug)]
pub struct PersistenceWorker {
    store: MailStore,
}

impl PersistenceWorker {
    /// Creates a worker owning `store`.
    #[must_use]
    pub const fn new(store: MailStore) -> Self {
        Self { store }
    }

    /// Processes requests until `inbox` closes.
    pub async fn run(
        self,
        mut inbox: mpsc::Receiver<Envelope<Request>>,
        responses: mpsc::Sender<Envelope<Response>>,
    ) {
        debug!("Persistence worker started");

        while let Some(envelope) = inbox.recv().await {
            let Envelope { id, account, body } = envelope;
            let kind = body.kind();

            let response = match self.handle(&account, body).await {
                Ok(response) => response,
                Err(e) => {
                    warn!("{kind} {id} failed for {account}: {e}");
                    Response::error(e)
                }
            };

            if responses.send(Envelope::new(id, account, response)).await.is_err() {
                break;
            }
        }

        debug!("Persistence worker stopped");
    }

    async fn threads(
        &self,
        account: &str,
        mailbox: String,
        last_seen_uid: Option<u32>,
    ) -> Result<Response> {
        let threads = self.store.list_threads(account, &mailbox).await?;
        let last_seen_uid = match last_seen_uid {
            Some(uid) => uid,
            None => self.store.last_seen_uid(account, &mailbox).await?,
        };
        Ok(Response::Threads {
            mailbox,
            threads,
            last_seen_uid,
        })
    }

    async fn handle(&self, account: &str, request: Request) -> Result<Response> {
        match request {
            Request::ListMailboxes => self
                .store
                .list_mailboxes(account)
                .await
                .map(Response::Mailboxes),
            Request::UpsertMailboxes { mailboxes } => {
                self.store.upsert_mailboxes(account, &mailboxes).await?;
                self.store.list_mailboxes(account).await.map(Response::Mailboxes)
            }
            Request::FetchMailbox { mailbox }
            | Request::FetchNewMessages { mailbox, .. }
            | Request::FetchMessageUpdates { mailbox, .. } => {
                self.threads(account, mailbox, None).await
            }
            Request::InsertNewMessages {
                mailbox,
                mails,
                snapshot,
            } => {
                if let Some(snapshot) = &snapshot {
                    self.store.record_snapshot(account, &mailbox, snapshot).await?;
                }
                let last_seen_uid = self
                    .store
                    .insert_new_messages(account, &mailbox, &mails)
                    .await?;
                debug!("{account}: stored {} mail(s) in {mailbox}", mails.len());
                self.threads(account, mailbox, Some(last_seen_uid)).await
            }
            Request::UpdateMessages {
                mailbox,
                updates,
                last_seen_uid,
            } => {
                let summary = self
                    .store
                    .reconcile_messages(account, &mailbox, &updates, last_seen_uid)
                    .await?;
                info!(
                    "{account}/{mailbox}: {} unchanged, {} updated, {} deleted",
                    summary.unchanged, summary.updated, summary.deleted
                );
                self.threads(account, mailbox, None).await
            }
            Request::FetchThread { root_id } => self
                .store
                .fetch_thread_mails(root_id)
                .await
                .map(Response::ThreadMails),
            Request::FetchStoredMail { mailbox, uid } => self
                .store
                .find_mail(account, &mailbox, uid)
                .await
                .map(|mail| Response::StoredMail(mail.map(Box::new))),
            request @ (Request::ConnectAccount
            | Request::FetchFullMail { .. }
            | Request::SendMail { .. }) => Err(Error::Unsupported(request.kind())),
        }
    }
}
