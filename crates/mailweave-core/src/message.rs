//! Request and response payloads exchanged between the orchestrator and
//! the workers.
//!
//! Every message travels inside an [`Envelope`] that carries the
//! correlation id and the account it concerns. Workers echo the id back so
//! the orchestrator can route the response to the callback registered for
//! it.

use std::fmt;
use std::path::PathBuf;

use crate::model::{FlagUpdate, Mail, Mailbox, Thread, ThreadNode};
use crate::service::MailboxSnapshot;

/// Identifier pairing a response with the request that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CorrelationId(pub u64);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A payload tagged with its correlation id and account.
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    /// Correlation id.
    pub id: CorrelationId,
    /// Name of the account the payload concerns.
    pub account: String,
    /// The payload itself.
    pub body: T,
}

impl<T> Envelope<T> {
    /// Wraps a payload.
    pub fn new(id: CorrelationId, account: impl Into<String>, body: T) -> Self {
        Self {
            id,
            account: account.into(),
            body,
        }
    }

    /// Replaces the payload, keeping the id and account.
    pub fn reply<U>(&self, body: U) -> Envelope<U> {
        Envelope {
            id: self.id,
            account: self.account.clone(),
            body,
        }
    }
}

/// Which worker a request is sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// The account worker for the envelope's account.
    Account,
    /// The shared persistence worker.
    Store,
}

/// Work requested from a worker.
#[derive(Debug, Clone)]
pub enum Request {
    /// Authenticate, replacing any existing session.
    ConnectAccount,
    /// List the mailbox hierarchy.
    ListMailboxes,
    /// Store newly discovered mailboxes.
    UpsertMailboxes {
        /// Mailboxes reported by the server.
        mailboxes: Vec<Mailbox>,
    },
    /// Load the cached thread list and watermark of a mailbox.
    FetchMailbox {
        /// Mailbox name.
        mailbox: String,
    },
    /// Fetch messages above the watermark.
    FetchNewMessages {
        /// Mailbox name.
        mailbox: String,
        /// Highest UID already stored.
        last_seen_uid: u32,
    },
    /// Fetch flags of the messages at or below the watermark.
    FetchMessageUpdates {
        /// Mailbox name.
        mailbox: String,
        /// Highest UID already stored.
        last_seen_uid: u32,
    },
    /// Download a full message into the local cache.
    FetchFullMail {
        /// Mailbox name.
        mailbox: String,
        /// Message UID.
        uid: u32,
    },
    /// Submit a raw RFC 5322 message.
    SendMail {
        /// Message bytes.
        body: Vec<u8>,
    },
    /// Store fetched messages and assign thread ids.
    InsertNewMessages {
        /// Mailbox name.
        mailbox: String,
        /// Fetched messages.
        mails: Vec<Mail>,
        /// Mailbox state from the SELECT the mails were fetched under.
        snapshot: Option<MailboxSnapshot>,
    },
    /// Reconcile stored flags with the server's.
    UpdateMessages {
        /// Mailbox name.
        mailbox: String,
        /// Server-side flags.
        updates: Vec<FlagUpdate>,
        /// Watermark the updates were fetched against.
        last_seen_uid: u32,
    },
    /// Load a conversation subtree.
    FetchThread {
        /// Row id of the subtree root.
        root_id: i64,
    },
    /// Load one stored message with its MIME structure.
    FetchStoredMail {
        /// Mailbox name.
        mailbox: String,
        /// Message UID.
        uid: u32,
    },
}

impl Request {
    /// Short name of the request kind, for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ConnectAccount => "ConnectAccount",
            Self::ListMailboxes => "ListMailboxes",
            Self::UpsertMailboxes { .. } => "UpsertMailboxes",
            Self::FetchMailbox { .. } => "FetchMailbox",
            Self::FetchNewMessages { .. } => "FetchNewMessages",
            Self::FetchMessageUpdates { .. } => "FetchMessageUpdates",
            Self::FetchFullMail { .. } => "FetchFullMail",
            Self::SendMail { .. } => "SendMail",
            Self::InsertNewMessages { .. } => "InsertNewMessages",
            Self::UpdateMessages { .. } => "UpdateMessages",
            Self::FetchThread { .. } => "FetchThread",
            Self::FetchStoredMail { .. } => "FetchStoredMail",
        }
    }
}

/// Result of a request.
#[derive(Debug, Clone)]
pub enum Response {
    /// The request succeeded without a payload.
    Done,
    /// Mailbox hierarchy.
    Mailboxes(Vec<Mailbox>),
    /// Thread list of a mailbox.
    Threads {
        /// Mailbox name.
        mailbox: String,
        /// Threads, most recent first.
        threads: Vec<Thread>,
        /// Current watermark of the mailbox.
        last_seen_uid: u32,
    },
    /// Messages fetched from the server.
    NewMessages {
        /// Mailbox name.
        mailbox: String,
        /// Fetched messages.
        mails: Vec<Mail>,
        /// Mailbox state reported on SELECT.
        snapshot: MailboxSnapshot,
    },
    /// Server-side flags.
    MessageUpdates {
        /// Mailbox name.
        mailbox: String,
        /// Flags by UID.
        updates: Vec<FlagUpdate>,
        /// Watermark the updates were fetched against.
        last_seen_uid: u32,
    },
    /// Location of a cached message.
    FullMail {
        /// Path of the `.eml` file.
        path: PathBuf,
    },
    /// Conversation subtree in depth-first order.
    ThreadMails(Vec<ThreadNode>),
    /// A stored message, if the store has it.
    StoredMail(Option<Box<Mail>>),
    /// The request failed.
    Error(String),
}

impl Response {
    /// Builds an error response from anything printable.
    pub fn error(err: impl fmt::Display) -> Self {
        Self::Error(err.to_string())
    }

    /// Returns true for [`Response::Error`].
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Converts a network result into the request that stores it.
    ///
    /// Returns the response unchanged when it has nothing to persist.
    ///
    /// # Errors
    ///
    /// Gives back `self` for every response without a write-back form.
    pub fn write_back(self) -> Result<Request, Self> {
        match self {
            Self::Mailboxes(mailboxes) => Ok(Request::UpsertMailboxes { mailboxes }),
            Self::NewMessages {
                mailbox,
                mails,
                snapshot,
            } => Ok(Request::InsertNewMessages {
                mailbox,
                mails,
                snapshot: Some(snapshot),
            }),
            Self::MessageUpdates {
                mailbox,
                updates,
                last_seen_uid,
            } => Ok(Request::UpdateMessages {
                mailbox,
                updates,
                last_seen_uid,
            }),
            other => Err(other),
        }
    }
}
