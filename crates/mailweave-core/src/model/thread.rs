//! Derived conversation views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Mail;

/// Summary of one conversation inside a mailbox.
///
/// Computed from the mail rows sharing a thread id; never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    /// Thread id shared by all members.
    pub thread_id: i64,
    /// Row id of the representative (root) mail.
    pub root_id: i64,
    /// Subject of the root mail.
    pub subject: String,
    /// Number of mails in the thread within the mailbox.
    pub count: u32,
    /// Date of the most recent mail.
    pub last_date: DateTime<Utc>,
    /// True if any member lacks `\Seen`.
    pub unread: bool,
}

/// A mail inside a conversation subtree together with its nesting depth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadNode {
    /// The mail.
    pub mail: Mail,
    /// Distance from the subtree root, 0 for the root itself.
    pub depth: u32,
}
