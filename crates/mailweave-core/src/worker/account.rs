//! Per-account network worker.
//!
//! Owns one mail server session and handles requests strictly one after
//! another. A failed request turns into [`Response::Error`]; the worker
//! keeps running until its inbox closes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::account::Account;
use crate::message::{Envelope, Request, Response};
use crate::model::{FlagUpdate, Mail, Mailbox};
use crate::service::headers::build_mail;
use crate::service::{
    MailSubmitter, MailTransport, MailboxSnapshot, UidRange, normalize_outgoing,
};
use crate::status::StatusLog;
use crate::{Error, Result};

/// Synchronizes one account with its mail server.
#[derive(Debug)]
pub struct AccountWorker<T, S> {
    name: String,
    email: String,
    transport: T,
    submitter: S,
    cache_dir: PathBuf,
    selected: Option<String>,
    snapshots: HashMap<String, MailboxSnapshot>,
    status: StatusLog,
}

/// Encodes a name as a single path component.
///
/// Percent-encoding keeps distinct names distinct (`Lists/rust` and
/// `Lists_rust` stay apart). Names made only of dots have their dots
/// escaped too, and the empty name becomes `%`.
fn sanitize_component(component: &str) -> String {
    if component.chars().all(|c| c == '.') {
        return if component.is_empty() {
            "%".to_string()
        } else {
            "%2E".repeat(component.len())
        };
    }
    urlencoding::encode(component).into_owned()
}

impl<T: MailTransport, S: MailSubmitter> AccountWorker<T, S> {
    /// Creates a worker for `account`. Full messages are cached below
    /// `cache_dir`.
    pub fn new(
        account: &Account,
        transport: T,
        submitter: S,
        cache_dir: impl Into<PathBuf>,
        status: StatusLog,
    ) -> Self {
        Self {
            name: account.name.clone(),
            email: account.email.clone(),
            transport,
            submitter,
            cache_dir: cache_dir.into(),
            selected: None,
            snapshots: HashMap::new(),
            status,
        }
    }

    /// Processes requests until `inbox` closes, then logs out.
    pub async fn run(
        mut self,
        mut inbox: mpsc::Receiver<Envelope<Request>>,
        responses: mpsc::Sender<Envelope<Response>>,
    ) {
        debug!("Account worker {} started", self.name);

        while let Some(envelope) = inbox.recv().await {
            let Envelope { id, account, body } = envelope;
            let kind = body.kind();

            let response = match self.handle(body).await {
                Ok(response) => response,
                Err(e) => {
                    warn!("{kind} {id} failed for {}: {e}", self.name);
                    self.selected = None;
                    Response::error(e)
                }
            };

            if responses.send(Envelope::new(id, account, response)).await.is_err() {
                debug!("Response channel closed, stopping worker {}", self.name);
                break;
            }
        }

        if let Err(e) = self.transport.logout().await {
            warn!("Logout of {} failed: {e}", self.name);
        }
        debug!("Account worker {} stopped", self.name);
    }

    async fn handle(&mut self, request: Request) -> Result<Response> {
        match request {
            Request::ConnectAccount => {
                self.connect().await?;
                Ok(Response::Done)
            }
            Request::ListMailboxes => self.list_mailboxes().await.map(Response::Mailboxes),
            Request::FetchNewMessages {
                mailbox,
                last_seen_uid,
            } => {
                let mails = self.fetch_new_messages(&mailbox, last_seen_uid).await?;
                let snapshot = self.snapshots.get(&mailbox).copied().unwrap_or_default();
                Ok(Response::NewMessages {
                    mailbox,
                    mails,
                    snapshot,
                })
            }
            Request::FetchMessageUpdates {
                mailbox,
                last_seen_uid,
            } => {
                let updates = self.fetch_message_updates(&mailbox, last_seen_uid).await?;
                Ok(Response::MessageUpdates {
                    mailbox,
                    updates,
                    last_seen_uid,
                })
            }
            Request::FetchFullMail { mailbox, uid } => {
                let path = self.fetch_full_mail(&mailbox, uid).await?;
                Ok(Response::FullMail { path })
            }
            Request::SendMail { body } => {
                self.send_mail(&body).await?;
                Ok(Response::Done)
            }
            request @ (Request::UpsertMailboxes { .. }
            | Request::FetchMailbox { .. }
            | Request::InsertNewMessages { .. }
            | Request::UpdateMessages { .. }
            | Request::FetchThread { .. }
            | Request::FetchStoredMail { .. }) => Err(Error::Unsupported(request.kind())),
        }
    }

    /// Authenticates, replacing any existing session.
    async fn connect(&mut self) -> Result<()> {
        self.selected = None;
        self.transport.connect().await?;
        self.status.info(format!("Connected {}", self.name));
        Ok(())
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if !self.transport.is_connected() {
            self.connect().await?;
        }
        Ok(())
    }

    async fn select_mailbox(&mut self, mailbox: &str) -> Result<()> {
        self.ensure_connected().await?;
        if self.selected.as_deref() == Some(mailbox) {
            return Ok(());
        }

        self.selected = None;
        let snapshot = self.transport.select(mailbox).await?;
        debug!(
            "{}: selected {mailbox} ({} message(s){})",
            self.name,
            snapshot.exists,
            if snapshot.read_only { ", read-only" } else { "" }
        );
        self.snapshots.insert(mailbox.to_string(), snapshot);
        self.selected = Some(mailbox.to_string());
        Ok(())
    }

    async fn list_mailboxes(&mut self) -> Result<Vec<Mailbox>> {
        self.ensure_connected().await?;
        self.selected = None;
        let remote = self.transport.list().await?;

        let mailboxes: Vec<Mailbox> = remote
            .into_iter()
            .filter(|mailbox| mailbox.selectable)
            .map(|mailbox| Mailbox::from_path(&mailbox.name, mailbox.delimiter))
            .collect();

        debug!("{}: {} mailbox(es)", self.name, mailboxes.len());
        Ok(mailboxes)
    }

    async fn fetch_new_messages(&mut self, mailbox: &str, last_seen_uid: u32) -> Result<Vec<Mail>> {
        self.select_mailbox(mailbox).await?;
        let fetched = self
            .transport
            .fetch_headers(UidRange::above(last_seen_uid))
            .await?;

        let mut mails = fetched
            .into_iter()
            .filter(|header| header.uid > last_seen_uid)
            .map(|header| build_mail(header, mailbox))
            .collect::<Result<Vec<_>>>()?;
        mails.sort_by_key(|mail| mail.uid);

        if !mails.is_empty() {
            info!("{}: {} new message(s) in {mailbox}", self.name, mails.len());
        }
        Ok(mails)
    }

    async fn fetch_message_updates(
        &mut self,
        mailbox: &str,
        last_seen_uid: u32,
    ) -> Result<Vec<FlagUpdate>> {
        if last_seen_uid == 0 {
            return Ok(Vec::new());
        }

        self.select_mailbox(mailbox).await?;
        let mut updates = self
            .transport
            .fetch_flags(UidRange::up_to(last_seen_uid))
            .await?;
        updates.retain(|update| update.uid <= last_seen_uid);
        Ok(updates)
    }

    fn cache_path(&self, mailbox: &str, uid: u32) -> PathBuf {
        self.cache_dir
            .join(sanitize_component(&self.name))
            .join(sanitize_component(mailbox))
            .join(format!("{uid}.eml"))
    }

    async fn fetch_full_mail(&mut self, mailbox: &str, uid: u32) -> Result<PathBuf> {
        let path = self.cache_path(mailbox, uid);
        if tokio::fs::try_exists(&path).await? {
            debug!("{}: {mailbox}/{uid} already cached", self.name);
            return Ok(path);
        }

        self.select_mailbox(mailbox).await?;
        let body = self.transport.fetch_body(uid).await?;
        write_atomically(&path, &body).await?;

        debug!("{}: cached {mailbox}/{uid} at {}", self.name, path.display());
        Ok(path)
    }

    async fn send_mail(&mut self, body: &[u8]) -> Result<()> {
        let submission = normalize_outgoing(body, &self.email, Utc::now())?;
        self.submitter.submit(&submission).await?;
        self.status.info(format!(
            "Sent message to {} recipient(s)",
            submission.recipients.len()
        ));
        Ok(())
    }
}

async fn write_atomically(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("eml.tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::message::CorrelationId;
    use crate::model::FlagSet;
    use crate::service::{FetchedHeader, MailboxSnapshot, RemoteMailbox, Submission};

    #[derive(Debug, Default)]
    struct Calls {
        connects: AtomicUsize,
        selects: AtomicUsize,
        bodies: AtomicUsize,
        logouts: AtomicUsize,
    }

    #[derive(Debug, Default)]
    struct MockTransport {
        connected: bool,
        calls: Arc<Calls>,
        messages: BTreeMap<u32, FetchedHeader>,
        read_only: bool,
    }

    impl MockTransport {
        fn with_messages(uids: &[u32]) -> Self {
            let messages = uids
                .iter()
                .map(|&uid| {
                    let header = FetchedHeader {
                        uid,
                        flags: FlagSet::new(),
                        header: format!(
                            "Message-ID: <m{uid}@example.com>\r\nSubject: mail {uid}\r\n\r\n"
                        )
                        .into_bytes(),
                        ..FetchedHeader::default()
                    };
                    (uid, header)
                })
                .collect();
            Self {
                messages,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl MailTransport for MockTransport {
        async fn connect(&mut self) -> Result<()> {
            self.calls.connects.fetch_add(1, Ordering::SeqCst);
            self.connected = true;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        async fn select(&mut self, _mailbox: &str) -> Result<MailboxSnapshot> {
            self.calls.selects.fetch_add(1, Ordering::SeqCst);
            Ok(MailboxSnapshot {
                exists: u32::try_from(self.messages.len()).unwrap(),
                uid_next: self.messages.last_key_value().map(|(uid, _)| uid + 1),
                read_only: self.read_only,
                ..MailboxSnapshot::default()
            })
        }

        async fn list(&mut self) -> Result<Vec<RemoteMailbox>> {
            Ok(vec![
                RemoteMailbox {
                    name: "INBOX".into(),
                    delimiter: Some('/'),
                    selectable: true,
                },
                RemoteMailbox {
                    name: "Lists".into(),
                    delimiter: Some('/'),
                    selectable: false,
                },
                RemoteMailbox {
                    name: "Lists/rust".into(),
                    delimiter: Some('/'),
                    selectable: true,
                },
            ])
        }

        async fn fetch_headers(&mut self, range: UidRange) -> Result<Vec<FetchedHeader>> {
            let mut found: Vec<FetchedHeader> = self
                .messages
                .range(range.start..)
                .map(|(_, header)| header.clone())
                .collect();
            // `n:*` always matches the highest message.
            if found.is_empty()
                && let Some((_, last)) = self.messages.last_key_value()
            {
                found.push(last.clone());
            }
            Ok(found)
        }

        async fn fetch_flags(&mut self, range: UidRange) -> Result<Vec<FlagUpdate>> {
            let end = range.end.unwrap_or(u32::MAX);
            Ok(self
                .messages
                .range(range.start..=end)
                .map(|(&uid, header)| FlagUpdate {
                    uid,
                    flags: header.flags.clone(),
                })
                .collect())
        }

        async fn fetch_body(&mut self, uid: u32) -> Result<Vec<u8>> {
            self.calls.bodies.fetch_add(1, Ordering::SeqCst);
            Ok(format!("Message-ID: <m{uid}@example.com>\r\n\r\nbody {uid}").into_bytes())
        }

        async fn logout(&mut self) -> Result<()> {
            self.calls.logouts.fetch_add(1, Ordering::SeqCst);
            self.connected = false;
            Ok(())
        }
    }

    #[derive(Debug, Default, Clone)]
    struct MockSubmitter {
        sent: Arc<Mutex<Vec<Submission>>>,
    }

    #[async_trait]
    impl MailSubmitter for MockSubmitter {
        async fn submit(&self, submission: &Submission) -> Result<()> {
            self.sent.lock().unwrap().push(submission.clone());
            Ok(())
        }
    }

    fn account() -> Account {
        Account {
            name: "work".into(),
            email: "me@example.com".into(),
            ..Account::default()
        }
    }

    fn worker(
        transport: MockTransport,
        cache: &Path,
    ) -> AccountWorker<MockTransport, MockSubmitter> {
        AccountWorker::new(
            &account(),
            transport,
            MockSubmitter::default(),
            cache,
            StatusLog::new(),
        )
    }

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("INBOX"), "INBOX");
        assert_eq!(sanitize_component("Lists/rust"), "Lists%2Frust");
        assert_eq!(sanitize_component("Lists_rust"), "Lists_rust");
        assert_eq!(sanitize_component("a\\b:c"), "a%5Cb%3Ac");
        assert_eq!(sanitize_component(".."), "%2E%2E");
        assert_eq!(sanitize_component(""), "%");
    }

    #[test]
    fn test_cache_paths_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let worker = worker(MockTransport::default(), dir.path());

        let names = [
            "Lists/rust",
            "Lists_rust",
            "Lists%2Frust",
            "Lists:rust",
            ".",
            "%2E",
            "",
        ];
        let paths: std::collections::HashSet<PathBuf> =
            names.iter().map(|name| worker.cache_path(name, 7)).collect();
        assert_eq!(paths.len(), names.len());
        for path in &paths {
            let account_dir = path.parent().unwrap().parent().unwrap();
            assert_eq!(account_dir, dir.path().join("work"));
        }
    }

    #[tokio::test]
    async fn test_connects_lazily_once() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::with_messages(&[1, 2]);
        let calls = Arc::clone(&transport.calls);
        let mut worker = worker(transport, dir.path());

        worker.fetch_new_messages("INBOX", 0).await.unwrap();
        worker.fetch_message_updates("INBOX", 2).await.unwrap();

        assert_eq!(calls.connects.load(Ordering::SeqCst), 1);
        assert_eq!(calls.selects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_list_skips_noselect() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = worker(MockTransport::default(), dir.path());

        let mailboxes = worker.list_mailboxes().await.unwrap();
        let names: Vec<&str> = mailboxes.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["INBOX", "Lists/rust"]);
        assert_eq!(mailboxes[1].parent.as_deref(), Some("Lists"));
        assert_eq!(mailboxes[1].short_name, "rust");
        assert!(worker.selected.is_none());
    }

    #[tokio::test]
    async fn test_new_messages_above_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = worker(MockTransport::with_messages(&[3, 5, 9]), dir.path());

        let mails = worker.fetch_new_messages("INBOX", 4).await.unwrap();
        let uids: Vec<u32> = mails.iter().map(|m| m.uid).collect();
        assert_eq!(uids, vec![5, 9]);
        assert_eq!(mails[0].message_id, "m5@example.com");
        assert_eq!(mails[0].mailbox, "INBOX");

        // The server answers `10:*` with message 9, which is already known.
        assert!(worker.fetch_new_messages("INBOX", 9).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_new_messages_carry_select_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut transport = MockTransport::with_messages(&[3, 5]);
        transport.read_only = true;
        let mut worker = worker(transport, dir.path());

        let response = worker
            .handle(Request::FetchNewMessages {
                mailbox: "INBOX".into(),
                last_seen_uid: 0,
            })
            .await
            .unwrap();
        let Response::NewMessages { mails, snapshot, .. } = response else {
            panic!("expected new messages");
        };
        assert_eq!(mails.len(), 2);
        assert!(snapshot.read_only);
        assert_eq!(snapshot.exists, 2);
        assert_eq!(snapshot.uid_next, Some(6));
    }

    #[tokio::test]
    async fn test_missing_message_id_fails_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut transport = MockTransport::with_messages(&[1, 2]);
        transport.messages.get_mut(&2).unwrap().header = b"Subject: broken\r\n\r\n".to_vec();
        let mut worker = worker(transport, dir.path());

        let err = worker.fetch_new_messages("INBOX", 0).await.unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[tokio::test]
    async fn test_updates_without_watermark_skip_network() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::with_messages(&[1]);
        let calls = Arc::clone(&transport.calls);
        let mut worker = worker(transport, dir.path());

        assert!(worker.fetch_message_updates("INBOX", 0).await.unwrap().is_empty());
        assert_eq!(calls.connects.load(Ordering::SeqCst), 0);
        assert_eq!(calls.selects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_full_mail_is_cached_once() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::with_messages(&[7]);
        let calls = Arc::clone(&transport.calls);
        let mut worker = worker(transport, dir.path());

        let first = worker.fetch_full_mail("Lists/rust", 7).await.unwrap();
        let second = worker.fetch_full_mail("Lists/rust", 7).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(
            first,
            dir.path().join("work").join("Lists%2Frust").join("7.eml")
        );
        assert_eq!(calls.bodies.load(Ordering::SeqCst), 1);
        let cached = tokio::fs::read_to_string(&first).await.unwrap();
        assert!(cached.ends_with("body 7"));
        assert!(!first.with_extension("eml.tmp").exists());
    }

    #[tokio::test]
    async fn test_send_fills_sender() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = worker(MockTransport::default(), dir.path());
        let sent = Arc::clone(&worker.submitter.sent);

        worker
            .send_mail(b"To: bob@example.com\r\nSubject: hi\r\n\r\nhello")
            .await
            .unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].from, "me@example.com");
        assert_eq!(sent[0].recipients, vec!["bob@example.com"]);
    }

    #[tokio::test]
    async fn test_run_answers_and_logs_out() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::with_messages(&[1]);
        let calls = Arc::clone(&transport.calls);
        let worker = worker(transport, dir.path());

        let (inbox_tx, inbox_rx) = mpsc::channel(4);
        let (response_tx, mut response_rx) = mpsc::channel(4);
        let handle = tokio::spawn(worker.run(inbox_rx, response_tx));

        inbox_tx
            .send(Envelope::new(CorrelationId(1), "work", Request::FetchThread { root_id: 1 }))
            .await
            .unwrap();
        inbox_tx
            .send(Envelope::new(CorrelationId(2), "work", Request::ConnectAccount))
            .await
            .unwrap();
        drop(inbox_tx);

        let first = response_rx.recv().await.unwrap();
        assert_eq!(first.id, CorrelationId(1));
        assert!(first.body.is_error());

        let second = response_rx.recv().await.unwrap();
        assert_eq!(second.id, CorrelationId(2));
        assert!(matches!(second.body, Response::Done));

        handle.await.unwrap();
        assert_eq!(calls.logouts.load(Ordering::SeqCst), 1);
    }
}
