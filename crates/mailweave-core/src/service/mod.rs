//! Network services used by the account workers.
//!
//! The workers talk to the mail servers through the [`MailTransport`] and
//! [`MailSubmitter`] traits. The production implementations wrap the IMAP
//! and SMTP clients; tests substitute in-memory fakes.

pub mod headers;
pub mod mail;
pub mod smtp;

use async_trait::async_trait;

use crate::Result;
use crate::model::{BodyPart, FlagSet, FlagUpdate};

pub use headers::{Submission, normalize_outgoing, parse_in_reply_to, parse_message_id};
pub use mail::{AuthClient, ImapTransport, SelectedClient};
pub use smtp::SmtpSubmitter;

/// Errors that can occur during mail server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Connection failed.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Authentication failed.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Operation failed.
    #[error("Operation failed: {0}")]
    Operation(String),

    /// Security mode not supported.
    #[error("Security mode not supported: {0}")]
    UnsupportedSecurity(&'static str),
}

/// An inclusive UID range; an open end stands for `*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UidRange {
    /// First UID.
    pub start: u32,
    /// Last UID, or `None` for the highest one on the server.
    pub end: Option<u32>,
}

impl UidRange {
    /// Every UID strictly above `last_seen_uid`.
    #[must_use]
    pub const fn above(last_seen_uid: u32) -> Self {
        Self {
            start: last_seen_uid.saturating_add(1),
            end: None,
        }
    }

    /// UIDs 1 through `last_seen_uid`.
    #[must_use]
    pub const fn up_to(last_seen_uid: u32) -> Self {
        Self {
            start: 1,
            end: Some(last_seen_uid),
        }
    }

    /// Returns true if the range cannot match any UID.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        match self.end {
            Some(end) => end < self.start || end == 0,
            None => self.start == 0,
        }
    }
}

/// State of a mailbox reported on SELECT.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxSnapshot {
    /// Number of messages.
    pub exists: u32,
    /// Sequence number of the first unseen message.
    pub first_unseen: Option<u32>,
    /// Next UID the server will assign.
    pub uid_next: Option<u32>,
    /// Whether the mailbox was opened read-only.
    pub read_only: bool,
}

/// One entry of the server's mailbox list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMailbox {
    /// Full hierarchical name.
    pub name: String,
    /// Hierarchy delimiter, if the server has one.
    pub delimiter: Option<char>,
    /// False for `\Noselect` nodes.
    pub selectable: bool,
}

/// Header data of one message as fetched from the server.
#[derive(Debug, Clone, Default)]
pub struct FetchedHeader {
    /// Message UID.
    pub uid: u32,
    /// Current flags.
    pub flags: FlagSet,
    /// INTERNALDATE as sent by the server.
    pub internal_date: Option<String>,
    /// Date from the envelope.
    pub envelope_date: Option<String>,
    /// Subject from the envelope.
    pub envelope_subject: Option<String>,
    /// Raw header section.
    pub header: Vec<u8>,
    /// Flattened BODYSTRUCTURE.
    pub parts: Vec<BodyPart>,
}

/// A session with an incoming mail server.
///
/// Methods other than [`MailTransport::connect`] expect a live session;
/// the account worker connects lazily before using them.
#[async_trait]
pub trait MailTransport: Send {
    /// Authenticates, replacing any existing session.
    async fn connect(&mut self) -> Result<()>;

    /// Returns true if a session is established.
    fn is_connected(&self) -> bool;

    /// Opens a mailbox.
    async fn select(&mut self, mailbox: &str) -> Result<MailboxSnapshot>;

    /// Lists every mailbox. Leaves no mailbox selected.
    async fn list(&mut self) -> Result<Vec<RemoteMailbox>>;

    /// Fetches header data for the selected mailbox.
    async fn fetch_headers(&mut self, range: UidRange) -> Result<Vec<FetchedHeader>>;

    /// Fetches the flags of the selected mailbox.
    async fn fetch_flags(&mut self, range: UidRange) -> Result<Vec<FlagUpdate>>;

    /// Fetches a complete message without marking it read.
    async fn fetch_body(&mut self, uid: u32) -> Result<Vec<u8>>;

    /// Ends the session.
    async fn logout(&mut self) -> Result<()>;
}

/// Outgoing mail submission.
#[async_trait]
pub trait MailSubmitter: Send + Sync {
    /// Delivers one message to its recipients.
    async fn submit(&self, submission: &Submission) -> Result<()>;
}
